//! The worker supervisor.
//!
//! One [`Coordinator`](coordinator::Coordinator) owns the four long-lived
//! worker roles (CPU, IO, GPU, Net), the shared-memory segments they attach
//! to, and every piece of cross-worker bookkeeping whose loss could wedge
//! the guest: in-flight GPU fences, pending RPCs, and the single-consumer
//! ownership of the audio rings.
//!
//! The supervisor is single-threaded and never blocks: all waiting happens
//! in workers, all supervisor work is message-driven. Correctness rests on a
//! handful of rules enforced here and tested in `tests/`:
//!
//! - every guest GPU submission produces exactly one fence completion, no
//!   matter what happens to the GPU worker;
//! - a shared ring buffer is consumed by at most one worker at a time, and
//!   ownership moves detach-first;
//! - messages from a restarted worker's previous incarnation are ignored;
//! - config changes take the cheapest sufficient action, and never change
//!   PCI identity without a full VM restart.

pub mod config;
pub mod coordinator;
pub mod gpu;
pub mod messages;
pub mod rpc;
pub mod worker;

pub use config::{
    plan_config_update, ConfigAction, LogLevel, RestartReason, TransportMode, VmConfig, VmMode,
    VmRuntime,
};
pub use coordinator::{
    Coordinator, CoordinatorError, FatalEvent, PlatformFeatures, VmState, RESTART_DEBOUNCE,
};
pub use gpu::{GpuSubmissionTracker, SubmitAction, PENDING_SUBMISSION_CAP};
pub use messages::{
    DiskKind, DiskMount, IncomingMessage, InitMessage, NetTraceCommand, NetTraceResponse,
    RingOwner, WorkerEventPayload, WorkerMessage,
};
pub use rpc::{NetTraceHandle, RpcError, RpcResponse};
pub use worker::{
    PostError, SpawnError, WorkerEntrypoint, WorkerHandle, WorkerRole, WorkerSpawner, WorkerState,
    WorkerStatus,
};
