//! Message channel contract between the supervisor and workers.
//!
//! Outbound ([`WorkerMessage`]) and inbound ([`IncomingMessage`]) messages
//! are explicit tagged variants; there is no stringly-typed dispatch.
//! Inbound messages carry the sender's role and instance id so the
//! supervisor can drop stale traffic from a replaced worker without
//! inspecting the payload.

use std::sync::Arc;

use aero_ipc::ring::RingBuffer;
use aero_pcapng::TraceStats;
use aero_protocol::aerogpu::{CompleteFence, GuestSubmit, SubmitAerogpu, SubmitComplete};
use aero_shared::scanout::ScanoutState;
use aero_shared::segments::SharedSegment;

use crate::worker::WorkerRole;

/// The audio-out and microphone-in rings are each consumed by exactly one of
/// these two workers at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOwner {
    Cpu,
    Io,
}

impl RingOwner {
    pub fn role(self) -> WorkerRole {
        match self {
            Self::Cpu => WorkerRole::Cpu,
            Self::Io => WorkerRole::Io,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    Hdd,
    Cd,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct DiskMount {
    pub name: String,
    pub kind: DiskKind,
}

/// First message every worker receives: its role plus every shared-memory
/// handle it may attach to. Command/event rings are per worker; the rest of
/// the segments are shared across roles.
#[derive(Clone)]
pub struct InitMessage {
    pub role: WorkerRole,
    pub instance_id: u64,
    pub command_ring: Arc<RingBuffer>,
    pub event_ring: Arc<RingBuffer>,
    pub guest_memory: Arc<SharedSegment>,
    pub vram: Arc<SharedSegment>,
    pub vga_framebuffer: Arc<SharedSegment>,
    pub io_ipc_sab: Arc<SharedSegment>,
    pub shared_framebuffer: Arc<SharedSegment>,
    pub shared_framebuffer_offset_bytes: usize,
    pub frame_state: Arc<ScanoutState>,
    pub perf_channel: Option<Arc<SharedSegment>>,
}

impl std::fmt::Debug for InitMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitMessage")
            .field("role", &self.role)
            .field("instance_id", &self.instance_id)
            .field("guest_memory_bytes", &self.guest_memory.len())
            .field("vram_bytes", &self.vram.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetTraceCommand {
    Enable,
    Disable,
    Clear,
    TakePcapng { request_id: u64 },
    ExportPcapng { request_id: u64 },
    Status { request_id: u64 },
}

/// supervisor -> worker.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Init(InitMessage),
    Shutdown,
    /// `None` detaches. A detach for the old owner is always posted before
    /// the attach for the new one.
    SetAudioRingBuffer { ring: Option<Arc<RingBuffer>> },
    SetMicrophoneRingBuffer { ring: Option<Arc<RingBuffer>> },
    SetBootDisks { mounts: Vec<DiskMount>, hdd: Option<usize>, cd: Option<usize> },
    NetTrace(NetTraceCommand),
    GpuSubmit(SubmitAerogpu),
    CompleteFence(CompleteFence),
}

impl WorkerMessage {
    /// Stable name used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Shutdown => "shutdown",
            Self::SetAudioRingBuffer { .. } => "setAudioRingBuffer",
            Self::SetMicrophoneRingBuffer { .. } => "setMicrophoneRingBuffer",
            Self::SetBootDisks { .. } => "setBootDisks",
            Self::NetTrace(cmd) => match cmd {
                NetTraceCommand::Enable => "net.trace.enable",
                NetTraceCommand::Disable => "net.trace.disable",
                NetTraceCommand::Clear => "net.trace.clear",
                NetTraceCommand::TakePcapng { .. } => "net.trace.take_pcapng",
                NetTraceCommand::ExportPcapng { .. } => "net.trace.export_pcapng",
                NetTraceCommand::Status { .. } => "net.trace.status",
            },
            Self::GpuSubmit(_) => "submit_aerogpu",
            Self::CompleteFence(_) => "aerogpu.complete_fence",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetTraceResponse {
    Pcapng { request_id: u64, bytes: Vec<u8> },
    Status { request_id: u64, stats: TraceStats },
}

/// Payload of a worker -> supervisor message.
#[derive(Debug, Clone)]
pub enum WorkerEventPayload {
    Ready,
    /// Fatal worker error; the worker is gone after sending this.
    Fatal { message: String },
    /// CPU worker forwarding one guest GPU submission.
    GuestSubmit(GuestSubmit),
    /// GPU worker confirming execution of a forwarded submission.
    SubmitComplete(SubmitComplete),
    NetTraceResponse(NetTraceResponse),
    /// Guest-initiated reset (e.g. triple fault handling policy).
    ResetRequest,
}

/// worker -> supervisor envelope.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub role: WorkerRole,
    pub instance_id: u64,
    pub payload: WorkerEventPayload,
}
