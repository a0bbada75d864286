//! Shared-memory IPC primitives for the worker runtime.
//!
//! Three layers, each usable on its own:
//!
//! - [`ring`]: a fixed-capacity MPSC ring buffer of length-prefixed records,
//!   safe to place in memory shared between worker threads. Producers reserve
//!   space with a CAS loop and commit in strict FIFO order; the (single)
//!   consumer only ever observes fully committed records.
//! - [`layout`] / [`ipc`]: the in-segment layout of a control IPC area: a
//!   validated header plus a table of queue descriptors, each pointing at a
//!   ring.
//! - [`protocol`]: the typed command/event records carried in ring payloads
//!   between the supervisor and a worker.
//!
//! Everything here is `std`-only so it can be unit-tested on the host.

pub mod ipc;
pub mod layout;
pub mod protocol;
pub mod ring;
