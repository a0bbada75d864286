#![allow(dead_code)] // not every test binary uses every helper

//! Recording spawner: every spawn, post and terminate is appended to a log
//! the tests assert on. The digests keep just enough structure to check
//! ordering and payload identity without dragging shared-memory handles
//! into equality comparisons.

use std::sync::{Arc, Mutex};

use aero_coordinator::{
    Coordinator, IncomingMessage, NetTraceCommand, PlatformFeatures, PostError, SpawnError,
    VmConfig, WorkerEntrypoint, WorkerEventPayload, WorkerHandle, WorkerMessage, WorkerRole,
    WorkerSpawner,
};
use aero_protocol::aerogpu::{buffer_from_vec, BufferHandle, GuestSubmit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentKind {
    /// Records the guest-RAM base address so tests can tell whether shared
    /// memory survived a teardown.
    Init { guest_ram: usize },
    Shutdown,
    /// Ring identity is the allocation address, so "the same buffer B"
    /// is checkable across posts.
    SetAudioRingBuffer { ring: Option<usize> },
    SetMicrophoneRingBuffer { ring: Option<usize> },
    SetBootDisks,
    NetTrace(NetTraceCommand),
    GpuSubmit { request_id: u64, signal_fence: u64, with_transfer: bool },
    CompleteFence { fence: u64 },
}

#[derive(Debug, Clone)]
pub struct PostRecord {
    pub role: WorkerRole,
    pub instance_id: u64,
    pub kind: SentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRecord {
    pub role: WorkerRole,
    pub entrypoint: WorkerEntrypoint,
    pub instance_id: u64,
}

#[derive(Default)]
pub struct MockState {
    pub posts: Vec<PostRecord>,
    pub spawns: Vec<SpawnRecord>,
    pub terminated: Vec<(WorkerRole, u64)>,
    /// Segments seen in init messages are kept alive so address comparisons
    /// between VM generations stay meaningful.
    pub init_segments: Vec<Arc<aero_shared::segments::SharedSegment>>,
    /// Reject any post that carries a transfer list (platform quirk).
    pub fail_transfer_posts: bool,
    /// Every post to this role throws (dead worker / hostile proxy).
    pub fail_all_posts_to: Option<WorkerRole>,
}

pub type SharedMockState = Arc<Mutex<MockState>>;

pub struct RecordingSpawner {
    pub state: SharedMockState,
}

impl RecordingSpawner {
    pub fn new() -> (Self, SharedMockState) {
        let state: SharedMockState = Arc::default();
        (Self { state: state.clone() }, state)
    }
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(
        &self,
        role: WorkerRole,
        entrypoint: WorkerEntrypoint,
        instance_id: u64,
    ) -> Result<Box<dyn WorkerHandle>, SpawnError> {
        self.state.lock().unwrap().spawns.push(SpawnRecord { role, entrypoint, instance_id });
        Ok(Box::new(RecordingHandle { role, instance_id, state: self.state.clone() }))
    }
}

struct RecordingHandle {
    role: WorkerRole,
    instance_id: u64,
    state: SharedMockState,
}

fn ring_id(ring: &Option<std::sync::Arc<aero_ipc::ring::RingBuffer>>) -> Option<usize> {
    ring.as_ref().map(|r| std::sync::Arc::as_ptr(r) as usize)
}

fn digest(msg: &WorkerMessage, transfer: &[BufferHandle]) -> SentKind {
    match msg {
        WorkerMessage::Init(init) => SentKind::Init { guest_ram: init.guest_memory.as_ptr() as usize },
        WorkerMessage::Shutdown => SentKind::Shutdown,
        WorkerMessage::SetAudioRingBuffer { ring } => {
            SentKind::SetAudioRingBuffer { ring: ring_id(ring) }
        }
        WorkerMessage::SetMicrophoneRingBuffer { ring } => {
            SentKind::SetMicrophoneRingBuffer { ring: ring_id(ring) }
        }
        WorkerMessage::SetBootDisks { .. } => SentKind::SetBootDisks,
        WorkerMessage::NetTrace(cmd) => SentKind::NetTrace(*cmd),
        WorkerMessage::GpuSubmit(submit) => SentKind::GpuSubmit {
            request_id: submit.request_id,
            signal_fence: submit.signal_fence,
            with_transfer: !transfer.is_empty(),
        },
        WorkerMessage::CompleteFence(complete) => SentKind::CompleteFence { fence: complete.fence },
    }
}

impl WorkerHandle for RecordingHandle {
    fn post(&self, msg: WorkerMessage, transfer: &[BufferHandle]) -> Result<(), PostError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_all_posts_to == Some(self.role) {
            return Err(PostError::Failed("simulated dead worker".into()));
        }
        if state.fail_transfer_posts && !transfer.is_empty() {
            return Err(PostError::TransferRejected);
        }
        if let WorkerMessage::Init(init) = &msg {
            state.init_segments.push(init.guest_memory.clone());
        }
        state.posts.push(PostRecord {
            role: self.role,
            instance_id: self.instance_id,
            kind: digest(&msg, transfer),
        });
        Ok(())
    }

    fn terminate(&self) {
        self.state.lock().unwrap().terminated.push((self.role, self.instance_id));
    }
}

// ---- driver helpers ----------------------------------------------------

/// Keeps shared-memory allocations tiny so tests stay fast.
pub fn small_config() -> VmConfig {
    VmConfig {
        guest_ram_bytes: 1024 * 1024,
        vram_bytes: 256 * 1024,
        framebuffer_width: 64,
        framebuffer_height: 48,
        framebuffer_tile_size: 16,
        ..VmConfig::default()
    }
}

pub fn started_coordinator(config: VmConfig) -> (Coordinator<RecordingSpawner>, SharedMockState) {
    let (spawner, state) = RecordingSpawner::new();
    let mut coordinator = Coordinator::new(spawner);
    coordinator.start(config, PlatformFeatures::default()).expect("start");
    (coordinator, state)
}

pub fn current_instance(coordinator: &Coordinator<RecordingSpawner>, role: WorkerRole) -> u64 {
    coordinator.worker_status(role).expect("worker exists").instance_id
}

pub fn deliver(
    coordinator: &mut Coordinator<RecordingSpawner>,
    role: WorkerRole,
    payload: WorkerEventPayload,
) {
    let instance_id = current_instance(coordinator, role);
    coordinator.handle_worker_message(IncomingMessage { role, instance_id, payload });
}

pub fn make_ready(coordinator: &mut Coordinator<RecordingSpawner>, role: WorkerRole) {
    deliver(coordinator, role, WorkerEventPayload::Ready);
}

pub fn make_all_ready(coordinator: &mut Coordinator<RecordingSpawner>) {
    for role in WorkerRole::ALL {
        make_ready(coordinator, role);
    }
}

pub fn guest_submit(fence: u64) -> WorkerEventPayload {
    WorkerEventPayload::GuestSubmit(GuestSubmit {
        context_id: 1,
        signal_fence: fence,
        cmd_stream: buffer_from_vec(vec![0xD0, 0x0D]),
        alloc_table: None,
    })
}

/// Post digests sent to one role, in order.
pub fn posts_to(state: &SharedMockState, role: WorkerRole) -> Vec<SentKind> {
    state
        .lock()
        .unwrap()
        .posts
        .iter()
        .filter(|p| p.role == role)
        .map(|p| p.kind.clone())
        .collect()
}

/// Fences completed to the CPU worker, in posted order.
pub fn completed_fences(state: &SharedMockState) -> Vec<u64> {
    state
        .lock()
        .unwrap()
        .posts
        .iter()
        .filter_map(|p| match p.kind {
            SentKind::CompleteFence { fence } if p.role == WorkerRole::Cpu => Some(fence),
            _ => None,
        })
        .collect()
}

pub fn spawn_count(state: &SharedMockState, role: WorkerRole) -> usize {
    state.lock().unwrap().spawns.iter().filter(|s| s.role == role).count()
}

pub fn post_count(state: &SharedMockState) -> usize {
    state.lock().unwrap().posts.len()
}
