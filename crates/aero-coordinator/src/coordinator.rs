//! The supervisor proper.
//!
//! Single-threaded and message-driven: every method runs to completion
//! without blocking, and all waiting (ring waits, guest execution, network
//! I/O) happens inside workers. The only timer the supervisor owns is the
//! full-restart debounce.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use aero_devices::pci::contract::DeviceContract;
use aero_ipc::ipc::{create_ipc_buffer, IpcQueueSpec};
use aero_ipc::layout::queue_kind;
use aero_ipc::protocol::{encode_command, Command};
use aero_ipc::ring::RingBuffer;
use aero_protocol::aerogpu::{CompleteFence, GuestSubmit, SubmitAerogpu};
use aero_shared::segments::{SegmentError, SegmentSizes, SharedMemorySegments};

use crate::config::{plan_config_update, ConfigAction, VmConfig, VmMode};
use crate::gpu::{GpuSubmissionTracker, SubmitAction};
use crate::messages::{
    DiskMount, IncomingMessage, InitMessage, NetTraceCommand, NetTraceResponse, RingOwner,
    WorkerEventPayload, WorkerMessage,
};
use crate::rpc::{NetTraceHandle, PendingRpcs, RpcError, RpcKind, RpcResponse};
use crate::worker::{
    PostError, SpawnError, WorkerEntrypoint, WorkerHandle, WorkerRole, WorkerSpawner, WorkerState,
    WorkerStatus,
};

/// Restart requests landing inside this window coalesce into one cycle.
pub const RESTART_DEBOUNCE: Duration = Duration::from_millis(50);

const CONTROL_RING_BYTES: usize = 32 * 1024;
const IO_IPC_QUEUE_BYTES: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformFeatures {
    /// Allocate the shared performance-counter channel.
    pub perf_channel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalEvent {
    pub role: WorkerRole,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("vm is already running")]
    AlreadyRunning,

    #[error("vm is not running")]
    NotRunning,

    #[error("shared memory allocation failed: {0}")]
    Segments(#[from] SegmentError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("init message to {role} worker failed: {source}")]
    InitPost { role: WorkerRole, source: PostError },
}

/// Per-role control rings; allocated once per VM and re-handed to
/// replacement workers so queued traffic survives a soft restart.
struct ControlRings {
    command: Arc<RingBuffer>,
    event: Arc<RingBuffer>,
}

struct VmResources {
    segments: SharedMemorySegments,
    control_rings: HashMap<WorkerRole, ControlRings>,
}

struct WorkerSlot {
    status: WorkerStatus,
    entrypoint: WorkerEntrypoint,
    handle: Option<Box<dyn WorkerHandle>>,
}

/// Which of the two SPSC audio paths an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingKind {
    Audio,
    Microphone,
}

#[derive(Default)]
struct RingAttachment {
    ring: Option<Arc<RingBuffer>>,
    owner_override: Option<RingOwner>,
}

pub struct Coordinator<S: WorkerSpawner> {
    spawner: S,
    platform: PlatformFeatures,
    state: VmState,
    config: Option<VmConfig>,
    resources: Option<VmResources>,
    workers: HashMap<WorkerRole, WorkerSlot>,
    /// Monotonic per role for the whole supervisor lifetime, so an id can
    /// never be reused by a later incarnation.
    next_instance_id: HashMap<WorkerRole, u64>,
    gpu: GpuSubmissionTracker,
    rpcs: PendingRpcs,
    net_trace_enabled: bool,
    audio: RingAttachment,
    microphone: RingAttachment,
    vm_mode: VmMode,
    pending_restart_reasons: Vec<String>,
    last_fatal_event: Option<FatalEvent>,
}

impl<S: WorkerSpawner> Coordinator<S> {
    pub fn new(spawner: S) -> Self {
        Self {
            spawner,
            platform: PlatformFeatures::default(),
            state: VmState::Stopped,
            config: None,
            resources: None,
            workers: HashMap::new(),
            next_instance_id: HashMap::new(),
            gpu: GpuSubmissionTracker::default(),
            rpcs: PendingRpcs::default(),
            net_trace_enabled: false,
            audio: RingAttachment::default(),
            microphone: RingAttachment::default(),
            vm_mode: VmMode::Legacy,
            pending_restart_reasons: Vec::new(),
            last_fatal_event: None,
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn start(
        &mut self,
        config: VmConfig,
        platform: PlatformFeatures,
    ) -> Result<(), CoordinatorError> {
        if self.state == VmState::Running {
            return Err(CoordinatorError::AlreadyRunning);
        }
        info!(runtime = ?config.effective_runtime(), "starting vm");

        let io_ipc_layout = create_ipc_buffer(&[
            IpcQueueSpec { kind: queue_kind::CMD, capacity_bytes: IO_IPC_QUEUE_BYTES },
            IpcQueueSpec { kind: queue_kind::EVT, capacity_bytes: IO_IPC_QUEUE_BYTES },
        ]);
        let segments = SharedMemorySegments::allocate(&SegmentSizes {
            guest_ram_bytes: config.guest_ram_bytes as usize,
            vram_bytes: config.vram_bytes as usize,
            io_ipc_bytes: io_ipc_layout.len(),
            framebuffer_width: config.framebuffer_width,
            framebuffer_height: config.framebuffer_height,
            framebuffer_tile_size: config.framebuffer_tile_size,
            perf_channel_bytes: platform.perf_channel.then_some(64 * 1024),
        })?;
        segments.io_ipc.write_at(0, &io_ipc_layout);

        let control_rings = WorkerRole::ALL
            .iter()
            .map(|&role| {
                (
                    role,
                    ControlRings {
                        command: Arc::new(RingBuffer::new(CONTROL_RING_BYTES)),
                        event: Arc::new(RingBuffer::new(CONTROL_RING_BYTES)),
                    },
                )
            })
            .collect();

        self.resources = Some(VmResources { segments, control_rings });
        self.vm_mode = config.vm_mode();
        self.platform = platform;
        self.state = VmState::Running;

        let cpu_entrypoint = config.cpu_entrypoint();
        self.config = Some(config);

        for (role, entrypoint) in [
            (WorkerRole::Cpu, cpu_entrypoint),
            (WorkerRole::Io, WorkerEntrypoint::Io),
            (WorkerRole::Gpu, WorkerEntrypoint::Gpu),
            (WorkerRole::Net, WorkerEntrypoint::Net),
        ] {
            if let Err(err) = self.spawn_worker(role, entrypoint) {
                warn!(%role, error = %err, "spawn failed during start; tearing down");
                self.stop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Idempotent. Completes outstanding fences and RPC rejections before
    /// releasing anything, so no guest waiter survives into the stopped
    /// state.
    pub fn stop(&mut self) {
        if self.state == VmState::Stopped && self.workers.is_empty() {
            return;
        }
        info!("stopping vm");
        self.teardown_workers();
        self.resources = None;
        self.state = VmState::Stopped;
    }

    /// stop() + start() with the last applied config.
    pub fn restart(&mut self) -> Result<(), CoordinatorError> {
        let config = self.config.clone().ok_or(CoordinatorError::NotRunning)?;
        let platform = self.platform;
        self.pending_restart_reasons.clear();
        self.stop();
        self.start(config, platform)
    }

    /// Tears workers down while *preserving* shared memory, then respawns
    /// them with their previous entrypoints. Scanout falls back to the
    /// legacy source.
    pub fn reset(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        if self.state != VmState::Running {
            return Err(CoordinatorError::NotRunning);
        }
        info!(reason, "resetting vm");

        let mut entrypoints: Vec<(WorkerRole, WorkerEntrypoint)> =
            self.workers.iter().map(|(&role, slot)| (role, slot.entrypoint)).collect();
        // Deterministic respawn order.
        entrypoints.sort_by_key(|&(role, _)| role);

        self.teardown_workers();
        if let Some(resources) = &self.resources {
            resources.segments.scanout.reset();
        }
        for (role, entrypoint) in entrypoints {
            self.spawn_worker(role, entrypoint)?;
        }
        Ok(())
    }

    /// In-place restart for roles that support it; everything else degrades
    /// to a full restart.
    pub fn restart_worker(&mut self, role: WorkerRole) -> Result<(), CoordinatorError> {
        if self.state != VmState::Running {
            return Err(CoordinatorError::NotRunning);
        }
        if !role.restartable_in_place() {
            info!(%role, "role is not restartable in place; performing full restart");
            return self.restart();
        }
        info!(%role, "restarting worker in place");
        self.rpcs.reject_all(role);
        let entrypoint = match self.workers.get_mut(&role) {
            Some(slot) => {
                if let Some(handle) = slot.handle.take() {
                    let _ = handle.post(WorkerMessage::Shutdown, &[]);
                    handle.terminate();
                }
                slot.status.state = WorkerState::Terminated;
                slot.entrypoint
            }
            None => return Err(CoordinatorError::NotRunning),
        };
        self.spawn_worker(role, entrypoint)
    }

    /// Applies a config transition with the minimum-impact action decided by
    /// [`plan_config_update`]. Returns the action taken.
    pub fn update_config(&mut self, next: VmConfig) -> Result<ConfigAction, CoordinatorError> {
        let Some(active) = &self.config else {
            return Err(CoordinatorError::NotRunning);
        };
        let action = plan_config_update(active, &next);
        match action {
            ConfigAction::FullRestart(reason) => {
                info!(%reason, "config change requires full restart");
                self.config = Some(next);
                self.restart()?;
            }
            ConfigAction::ReevaluateRingRouting => {
                debug!("config change re-routes ring ownership");
                let vm_mode = next.vm_mode();
                self.config = Some(next);
                self.apply_vm_mode(vm_mode);
            }
            ConfigAction::MutateInPlace => {
                debug!("config change applied in place");
                self.config = Some(next);
            }
        }
        Ok(action)
    }

    /// Conveys disk metadata to the CPU and IO workers and re-derives the
    /// VM-mode ring routing.
    pub fn set_boot_disks(
        &mut self,
        mounts: Vec<DiskMount>,
        hdd: Option<usize>,
        cd: Option<usize>,
    ) -> Result<(), CoordinatorError> {
        let Some(config) = &mut self.config else {
            return Err(CoordinatorError::NotRunning);
        };
        config.disk_mounts = mounts.clone();
        config.boot_hdd = hdd;
        config.boot_cd = cd;
        let vm_mode = config.vm_mode();

        for role in [WorkerRole::Cpu, WorkerRole::Io] {
            let msg = WorkerMessage::SetBootDisks { mounts: mounts.clone(), hdd, cd };
            if let Err(err) = self.post_to(role, msg) {
                warn!(%role, error = %err, "setBootDisks post failed");
            }
        }
        self.apply_vm_mode(vm_mode);
        Ok(())
    }

    // ---- full-restart debounce ----------------------------------------

    /// Queues a full restart. Requests arriving while one is queued coalesce
    /// into the same cycle.
    pub fn schedule_full_restart(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.pending_restart_reasons.is_empty() {
            info!(reason, "full restart scheduled");
        } else {
            debug!(reason, "full restart request coalesced");
        }
        self.pending_restart_reasons.push(reason);
    }

    pub fn restart_scheduled(&self) -> bool {
        !self.pending_restart_reasons.is_empty()
    }

    /// Waits out the debounce window, then performs one restart cycle for
    /// every request scheduled so far. Returns whether a restart ran.
    pub async fn complete_scheduled_restart(&mut self) -> Result<bool, CoordinatorError> {
        if self.pending_restart_reasons.is_empty() {
            return Ok(false);
        }
        tokio::time::sleep(RESTART_DEBOUNCE).await;
        let reasons = std::mem::take(&mut self.pending_restart_reasons);
        info!(count = reasons.len(), "performing debounced full restart");
        self.restart()?;
        Ok(true)
    }

    // ---- worker message intake ----------------------------------------

    /// Dispatches one worker message. Messages from stale instances produce
    /// no side effect at all.
    pub fn handle_worker_message(&mut self, msg: IncomingMessage) {
        let IncomingMessage { role, instance_id, payload } = msg;
        let Some(slot) = self.workers.get(&role) else {
            debug!(%role, "message from unknown worker dropped");
            return;
        };
        if slot.status.instance_id != instance_id {
            debug!(
                %role,
                instance_id,
                current = slot.status.instance_id,
                "stale worker message dropped"
            );
            return;
        }

        match payload {
            WorkerEventPayload::Ready => {
                info!(%role, instance_id, "worker ready");
                if let Some(slot) = self.workers.get_mut(&role) {
                    slot.status.state = WorkerState::Ready;
                    slot.status.last_ready_at = Some(Instant::now());
                }
                self.resync_role(role);
            }
            WorkerEventPayload::Fatal { message } => {
                self.on_worker_fatal(role, message);
            }
            WorkerEventPayload::GuestSubmit(submit) => {
                // Only the CPU worker may submit; anything else is dropped
                // without complaint, matching long-standing behavior.
                if role != WorkerRole::Cpu {
                    return;
                }
                self.on_guest_submit(submit);
            }
            WorkerEventPayload::SubmitComplete(complete) => {
                if role != WorkerRole::Gpu || !complete.matches_protocol() {
                    return;
                }
                if let Some(fence) = self.gpu.on_submit_complete(complete.request_id) {
                    self.complete_fence_to_cpu(fence);
                }
            }
            WorkerEventPayload::NetTraceResponse(response) => {
                if role != WorkerRole::Net {
                    return;
                }
                let (request_id, rpc_response) = match response {
                    NetTraceResponse::Pcapng { request_id, bytes } => {
                        (request_id, RpcResponse::Pcapng(bytes))
                    }
                    NetTraceResponse::Status { request_id, stats } => {
                        (request_id, RpcResponse::TraceStats(stats))
                    }
                };
                if !self.rpcs.resolve(WorkerRole::Net, request_id, rpc_response) {
                    debug!(request_id, "stale net-trace response dropped");
                }
            }
            WorkerEventPayload::ResetRequest => {
                if role != WorkerRole::Cpu {
                    return;
                }
                if let Err(err) = self.reset("guest requested reset") {
                    warn!(error = %err, "guest-requested reset failed");
                }
            }
        }
    }

    // ---- GPU submission path ------------------------------------------

    fn on_guest_submit(&mut self, submit: GuestSubmit) {
        let gpu_ready = self.worker_ready(WorkerRole::Gpu);
        match self.gpu.on_guest_submit(submit, gpu_ready) {
            SubmitAction::Queued { completed } => {
                for fence in completed {
                    self.complete_fence_to_cpu(fence);
                }
            }
            SubmitAction::Forward(msg) => self.forward_submission(msg),
        }
    }

    /// Posting to the GPU worker has two compensations, both load-bearing
    /// for guest liveness: a runtime that rejects the transfer list gets a
    /// by-copy retry, and a post that still fails force-completes the fence
    /// so the guest never waits on a message that never arrived.
    fn forward_submission(&mut self, msg: SubmitAerogpu) {
        let transfer = msg.transfer_list();
        let request_id = msg.request_id;

        let delivered = match self.post_to_with_transfer(
            WorkerRole::Gpu,
            WorkerMessage::GpuSubmit(msg.clone()),
            &transfer,
        ) {
            Ok(()) => true,
            Err(first_err) => {
                debug!(error = %first_err, request_id, "submit post failed; retrying by copy");
                self.post_to(WorkerRole::Gpu, WorkerMessage::GpuSubmit(msg)).is_ok()
            }
        };

        if !delivered {
            warn!(request_id, "submit could not reach gpu worker; force-completing fence");
            if let Some(fence) = self.gpu.on_forward_failed(request_id) {
                self.complete_fence_to_cpu(fence);
            }
        }
    }

    fn complete_fence_to_cpu(&self, fence: u64) {
        if let Err(err) =
            self.post_to(WorkerRole::Cpu, WorkerMessage::CompleteFence(CompleteFence { fence }))
        {
            warn!(fence, error = %err, "fence completion post failed");
        }
    }

    // ---- net trace ----------------------------------------------------

    /// Fire-and-forget toggle. The flag is retained so a restarted Net
    /// worker is re-armed on READY.
    pub fn set_net_trace_enabled(&mut self, enabled: bool) {
        self.net_trace_enabled = enabled;
        let cmd = if enabled { NetTraceCommand::Enable } else { NetTraceCommand::Disable };
        if let Err(err) = self.post_to(WorkerRole::Net, WorkerMessage::NetTrace(cmd)) {
            warn!(enabled, error = %err, "net trace toggle post failed");
        }
    }

    pub fn net_trace_enabled(&self) -> bool {
        self.net_trace_enabled
    }

    pub fn clear_net_trace(&mut self) {
        if let Err(err) =
            self.post_to(WorkerRole::Net, WorkerMessage::NetTrace(NetTraceCommand::Clear))
        {
            warn!(error = %err, "net trace clear post failed");
        }
    }

    pub fn take_net_trace_pcapng(&mut self) -> NetTraceHandle {
        self.net_trace_rpc(RpcKind::NetTraceTake)
    }

    pub fn export_net_trace_pcapng(&mut self) -> NetTraceHandle {
        self.net_trace_rpc(RpcKind::NetTraceExport)
    }

    pub fn get_net_trace_stats(&mut self) -> NetTraceHandle {
        self.net_trace_rpc(RpcKind::NetTraceStatus)
    }

    fn net_trace_rpc(&mut self, kind: RpcKind) -> NetTraceHandle {
        let (request_id, handle) = self.rpcs.allocate(WorkerRole::Net, kind);
        let cmd = match kind {
            RpcKind::NetTraceTake => NetTraceCommand::TakePcapng { request_id },
            RpcKind::NetTraceExport => NetTraceCommand::ExportPcapng { request_id },
            RpcKind::NetTraceStatus => NetTraceCommand::Status { request_id },
        };
        if let Err(err) = self.post_to(WorkerRole::Net, WorkerMessage::NetTrace(cmd)) {
            // The handle must reject with a typed error even when the post
            // itself blew up.
            self.rpcs.reject(
                WorkerRole::Net,
                request_id,
                RpcError::Unreachable { role: WorkerRole::Net, message: err.to_string() },
            );
        }
        handle
    }

    // ---- SPSC ring ownership ------------------------------------------

    pub fn set_audio_ring_buffer(&mut self, ring: Option<Arc<RingBuffer>>) {
        self.set_ring_buffer(RingKind::Audio, ring);
    }

    pub fn set_microphone_ring_buffer(&mut self, ring: Option<Arc<RingBuffer>>) {
        self.set_ring_buffer(RingKind::Microphone, ring);
    }

    pub fn set_audio_ring_buffer_owner(&mut self, owner: RingOwner) {
        self.set_ring_owner(RingKind::Audio, owner);
    }

    pub fn set_microphone_ring_buffer_owner(&mut self, owner: RingOwner) {
        self.set_ring_owner(RingKind::Microphone, owner);
    }

    fn attachment(&self, kind: RingKind) -> &RingAttachment {
        match kind {
            RingKind::Audio => &self.audio,
            RingKind::Microphone => &self.microphone,
        }
    }

    fn attachment_mut(&mut self, kind: RingKind) -> &mut RingAttachment {
        match kind {
            RingKind::Audio => &mut self.audio,
            RingKind::Microphone => &mut self.microphone,
        }
    }

    fn ring_message(kind: RingKind, ring: Option<Arc<RingBuffer>>) -> WorkerMessage {
        match kind {
            RingKind::Audio => WorkerMessage::SetAudioRingBuffer { ring },
            RingKind::Microphone => WorkerMessage::SetMicrophoneRingBuffer { ring },
        }
    }

    /// The single consumer this ring belongs to right now: the explicit
    /// override when set, the VM-mode policy otherwise. "Both" is
    /// unrepresentable by construction.
    fn current_owner(&self, kind: RingKind) -> RingOwner {
        self.attachment(kind)
            .owner_override
            .unwrap_or_else(|| self.vm_mode.default_ring_owner())
    }

    fn set_ring_buffer(&mut self, kind: RingKind, ring: Option<Arc<RingBuffer>>) {
        let owner = self.current_owner(kind);
        let had_ring = self.attachment(kind).ring.is_some();
        match &ring {
            Some(r) => {
                // Delivery to a worker that is still starting happens on its
                // READY re-sync instead.
                if self.worker_ready(owner.role()) {
                    let _ = self.post_to(owner.role(), Self::ring_message(kind, Some(r.clone())));
                }
            }
            None => {
                if had_ring {
                    let _ = self.post_to(owner.role(), Self::ring_message(kind, None));
                }
            }
        }
        self.attachment_mut(kind).ring = ring;
    }

    fn set_ring_owner(&mut self, kind: RingKind, owner: RingOwner) {
        let previous = self.current_owner(kind);
        self.attachment_mut(kind).owner_override = Some(owner);
        self.transfer_ring(kind, previous, owner);
    }

    /// Re-derives ring owners from a new VM mode.
    fn apply_vm_mode(&mut self, vm_mode: VmMode) {
        let previous = [
            self.current_owner(RingKind::Audio),
            self.current_owner(RingKind::Microphone),
        ];
        self.vm_mode = vm_mode;
        self.transfer_ring(RingKind::Audio, previous[0], self.current_owner(RingKind::Audio));
        self.transfer_ring(
            RingKind::Microphone,
            previous[1],
            self.current_owner(RingKind::Microphone),
        );
    }

    /// Moves a ring between consumers. The detach to the previous owner is
    /// always posted before the attach to the new one, even if the previous
    /// owner never saw the buffer, so a racing attach can never leave two
    /// consumers alive.
    fn transfer_ring(&mut self, kind: RingKind, from: RingOwner, to: RingOwner) {
        if from == to {
            return;
        }
        let Some(ring) = self.attachment(kind).ring.clone() else {
            return;
        };
        let _ = self.post_to(from.role(), Self::ring_message(kind, None));
        let _ = self.post_to(to.role(), Self::ring_message(kind, Some(ring)));
    }

    // ---- worker plumbing ----------------------------------------------

    fn spawn_worker(
        &mut self,
        role: WorkerRole,
        entrypoint: WorkerEntrypoint,
    ) -> Result<(), CoordinatorError> {
        let instance_id = {
            let next = self.next_instance_id.entry(role).or_insert(0);
            *next += 1;
            *next
        };
        debug!(%role, entrypoint = entrypoint.as_str(), instance_id, "spawning worker");

        let handle = self.spawner.spawn(role, entrypoint, instance_id)?;
        let init = self.init_message(role, instance_id).ok_or(CoordinatorError::NotRunning)?;
        handle
            .post(WorkerMessage::Init(init), &[])
            .map_err(|source| CoordinatorError::InitPost { role, source })?;

        self.workers.insert(
            role,
            WorkerSlot {
                status: WorkerStatus {
                    state: WorkerState::Starting,
                    instance_id,
                    last_ready_at: None,
                },
                entrypoint,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    fn init_message(&self, role: WorkerRole, instance_id: u64) -> Option<InitMessage> {
        let resources = self.resources.as_ref()?;
        let rings = resources.control_rings.get(&role)?;
        let segments = &resources.segments;
        Some(InitMessage {
            role,
            instance_id,
            command_ring: rings.command.clone(),
            event_ring: rings.event.clone(),
            guest_memory: segments.guest_ram.clone(),
            vram: segments.vram.clone(),
            vga_framebuffer: segments.vga_framebuffer.clone(),
            io_ipc_sab: segments.io_ipc.clone(),
            shared_framebuffer: segments.framebuffer.clone(),
            shared_framebuffer_offset_bytes: 0,
            frame_state: segments.scanout.clone(),
            perf_channel: segments.perf_channel.clone(),
        })
    }

    /// Re-sends exactly the state owned by this role. READY from one role
    /// must never trigger traffic to another.
    fn resync_role(&mut self, role: WorkerRole) {
        match role {
            WorkerRole::Cpu | WorkerRole::Io => {
                let owner =
                    if role == WorkerRole::Cpu { RingOwner::Cpu } else { RingOwner::Io };
                for kind in [RingKind::Audio, RingKind::Microphone] {
                    if self.current_owner(kind) != owner {
                        continue;
                    }
                    if let Some(ring) = self.attachment(kind).ring.clone() {
                        let _ = self.post_to(role, Self::ring_message(kind, Some(ring)));
                    }
                }
                if let Some(config) = &self.config {
                    if !config.disk_mounts.is_empty() {
                        let msg = WorkerMessage::SetBootDisks {
                            mounts: config.disk_mounts.clone(),
                            hdd: config.boot_hdd,
                            cd: config.boot_cd,
                        };
                        let _ = self.post_to(role, msg);
                    }
                }
            }
            WorkerRole::Gpu => {
                for msg in self.gpu.drain_pending() {
                    self.forward_submission(msg);
                }
            }
            WorkerRole::Net => {
                if self.net_trace_enabled {
                    let _ = self
                        .post_to(WorkerRole::Net, WorkerMessage::NetTrace(NetTraceCommand::Enable));
                }
            }
        }
    }

    fn on_worker_fatal(&mut self, role: WorkerRole, message: String) {
        warn!(%role, message, "worker fatal");
        self.last_fatal_event = Some(FatalEvent { role, message });

        if let Some(slot) = self.workers.get_mut(&role) {
            slot.status.state = WorkerState::Failed;
            if let Some(handle) = slot.handle.take() {
                handle.terminate();
            }
        }
        self.rpcs.reject_all(role);
        if role == WorkerRole::Gpu {
            for fence in self.gpu.on_gpu_terminated() {
                self.complete_fence_to_cpu(fence);
            }
        }

        if role.restartable_in_place() {
            if let Err(err) = self.restart_worker(role) {
                warn!(%role, error = %err, "in-place restart failed; scheduling full restart");
                self.schedule_full_restart(format!("{role} worker restart failed"));
            }
        } else {
            self.schedule_full_restart(format!("{role} worker failed"));
        }
    }

    /// Shuts every worker down: fences first, then RPC rejections, then the
    /// shutdown command on the control ring, the shutdown message, and the
    /// hard terminate.
    fn teardown_workers(&mut self) {
        for fence in self.gpu.on_gpu_terminated() {
            self.complete_fence_to_cpu(fence);
        }
        for role in WorkerRole::ALL {
            self.rpcs.reject_all(role);
        }

        let shutdown = encode_command(&Command::Shutdown);
        for (role, slot) in &mut self.workers {
            if let Some(rings) =
                self.resources.as_ref().and_then(|r| r.control_rings.get(role))
            {
                // Best effort: a wedged worker may have a full ring.
                let _ = rings.command.try_push(&shutdown);
            }
            if let Some(handle) = slot.handle.take() {
                let _ = handle.post(WorkerMessage::Shutdown, &[]);
                handle.terminate();
            }
            slot.status.state = WorkerState::Terminated;
        }
        self.workers.clear();
    }

    fn post_to(&self, role: WorkerRole, msg: WorkerMessage) -> Result<(), PostError> {
        self.post_to_with_transfer(role, msg, &[])
    }

    fn post_to_with_transfer(
        &self,
        role: WorkerRole,
        msg: WorkerMessage,
        transfer: &[aero_protocol::aerogpu::BufferHandle],
    ) -> Result<(), PostError> {
        let handle = self
            .workers
            .get(&role)
            .and_then(|slot| slot.handle.as_ref())
            .ok_or_else(|| PostError::Failed(format!("{role} worker is not running")))?;
        handle.post(msg, transfer)
    }

    fn worker_ready(&self, role: WorkerRole) -> bool {
        self.workers
            .get(&role)
            .map(|slot| slot.status.state == WorkerState::Ready)
            .unwrap_or(false)
    }

    // ---- observability -------------------------------------------------

    pub fn vm_state(&self) -> VmState {
        self.state
    }

    pub fn worker_status(&self, role: WorkerRole) -> Option<WorkerStatus> {
        self.workers.get(&role).map(|slot| slot.status.clone())
    }

    pub fn worker_entrypoint(&self, role: WorkerRole) -> Option<WorkerEntrypoint> {
        self.workers.get(&role).map(|slot| slot.entrypoint)
    }

    pub fn last_fatal_event(&self) -> Option<&FatalEvent> {
        self.last_fatal_event.as_ref()
    }

    pub fn active_config(&self) -> Option<&VmConfig> {
        self.config.as_ref()
    }

    pub fn current_vm_mode(&self) -> VmMode {
        self.vm_mode
    }

    /// The immutable PCI surface for the active config.
    pub fn device_contract(&self) -> Option<DeviceContract> {
        self.config.as_ref().map(|c| DeviceContract::build(&c.contract_config()))
    }

    pub fn pending_gpu_submissions(&self) -> usize {
        self.gpu.pending_len()
    }

    pub fn in_flight_gpu_fences(&self) -> usize {
        self.gpu.in_flight_len()
    }
}
