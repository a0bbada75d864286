//! Shared-memory substrates owned by the VM for its whole lifetime.
//!
//! The segments allocated here are handed to workers at spawn time and are
//! deliberately *not* torn down when a single worker restarts; a replacement
//! worker re-attaches to the same memory and the guest never notices. Only a
//! full VM teardown releases them.

pub mod scanout;
pub mod segments;
pub mod shared_framebuffer;
