//! Worker roles, instances and the spawn/post seam.
//!
//! The supervisor never talks to a thread or process directly; it goes
//! through [`WorkerSpawner`] and [`WorkerHandle`]. Production wires these to
//! real worker event loops, tests wire them to recorders. The seam is also
//! where the two platform quirks surface that the GPU path must compensate
//! for: a post can reject its transfer list, and a post can throw outright
//! when the receiving worker has already died.

use std::time::Instant;

use aero_protocol::aerogpu::BufferHandle;

use crate::messages::WorkerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerRole {
    Cpu,
    Io,
    Gpu,
    Net,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 4] = [Self::Cpu, Self::Io, Self::Gpu, Self::Net];

    /// Whether losing this worker can be repaired without tearing down the
    /// VM. Only the Net worker keeps no guest-visible state outside shared
    /// memory.
    pub fn restartable_in_place(self) -> bool {
        matches!(self, Self::Net)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Io => "io",
            Self::Gpu => "gpu",
            Self::Net => "net",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker entrypoints. The CPU role has two, selected by `vm_runtime`; the
/// selection must survive restarts, resets and config updates that leave
/// the selector untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEntrypoint {
    CpuLegacy,
    CpuMachine,
    Io,
    Gpu,
    Net,
}

impl WorkerEntrypoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CpuLegacy => "cpu-legacy",
            Self::CpuMachine => "cpu-machine",
            Self::Io => "io",
            Self::Gpu => "gpu",
            Self::Net => "net",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Terminated,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Monotonic per role for the life of the supervisor. Messages tagged
    /// with any older value are stale and must be ignored.
    pub instance_id: u64,
    pub last_ready_at: Option<Instant>,
}

#[derive(Debug, thiserror::Error)]
pub enum PostError {
    /// The runtime rejected the message's transfer list; the same message
    /// may still be accepted by copy.
    #[error("transfer list rejected")]
    TransferRejected,
    /// The post itself threw (dead worker, hostile proxy).
    #[error("post failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to spawn {role} worker: {message}")]
pub struct SpawnError {
    pub role: WorkerRole,
    pub message: String,
}

/// A live worker instance. Posting is synchronous and ordered: messages
/// posted to one handle arrive in posted order.
pub trait WorkerHandle {
    fn post(&self, msg: WorkerMessage, transfer: &[BufferHandle]) -> Result<(), PostError>;

    /// Hard-stops the worker. Idempotent.
    fn terminate(&self);
}

pub trait WorkerSpawner {
    fn spawn(
        &self,
        role: WorkerRole,
        entrypoint: WorkerEntrypoint,
        instance_id: u64,
    ) -> Result<Box<dyn WorkerHandle>, SpawnError>;
}
