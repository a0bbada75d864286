//! AeroGPU submission protocol.
//!
//! Flow: the CPU worker emits a [`GuestSubmit`] per guest submission; the
//! supervisor assigns a request id and forwards it to the GPU worker as a
//! [`SubmitAerogpu`]; the GPU worker answers with [`SubmitComplete`]; the
//! supervisor then posts [`CompleteFence`] back to the CPU worker. Fences are
//! 64-bit and monotonically increasing per context; the guest driver blocks
//! on them, which is why the supervisor must synthesize completions when the
//! GPU worker cannot.

use std::sync::Arc;

pub const AEROGPU_PROTOCOL: &str = "aerogpu";
pub const AEROGPU_PROTOCOL_VERSION: u32 = 1;

pub const AEROGPU_ENGINE_0: u32 = 0;

/// Binary buffer attached to a message. Cheaply cloneable; whether it is
/// *transferred* or *copied* to the receiving worker is a property of the
/// post, not of the buffer.
pub type BufferHandle = Arc<[u8]>;

pub fn buffer_from_vec(bytes: Vec<u8>) -> BufferHandle {
    Arc::from(bytes.into_boxed_slice())
}

/// CPU worker -> supervisor: one guest submission.
#[derive(Debug, Clone)]
pub struct GuestSubmit {
    pub context_id: u32,
    pub signal_fence: u64,
    pub cmd_stream: BufferHandle,
    pub alloc_table: Option<BufferHandle>,
}

/// supervisor -> GPU worker.
#[derive(Debug, Clone)]
pub struct SubmitAerogpu {
    pub protocol: &'static str,
    pub protocol_version: u32,
    pub request_id: u64,
    pub context_id: u32,
    pub engine_id: u32,
    pub flags: u32,
    pub signal_fence: u64,
    pub cmd_stream: BufferHandle,
    pub alloc_table: Option<BufferHandle>,
}

impl SubmitAerogpu {
    pub const TYPE: &'static str = "submit_aerogpu";

    pub fn new(request_id: u64, submit: &GuestSubmit) -> Self {
        Self {
            protocol: AEROGPU_PROTOCOL,
            protocol_version: AEROGPU_PROTOCOL_VERSION,
            request_id,
            context_id: submit.context_id,
            engine_id: AEROGPU_ENGINE_0,
            flags: 0,
            signal_fence: submit.signal_fence,
            cmd_stream: submit.cmd_stream.clone(),
            alloc_table: submit.alloc_table.clone(),
        }
    }

    /// Buffers to place on the post's transfer list, in insertion order.
    pub fn transfer_list(&self) -> Vec<BufferHandle> {
        let mut list = vec![self.cmd_stream.clone()];
        if let Some(table) = &self.alloc_table {
            list.push(table.clone());
        }
        list
    }
}

/// GPU worker -> supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitComplete {
    pub protocol: &'static str,
    pub protocol_version: u32,
    pub request_id: u64,
    pub completed_fence: u64,
}

impl SubmitComplete {
    pub const TYPE: &'static str = "submit_complete";

    pub fn new(request_id: u64, completed_fence: u64) -> Self {
        Self {
            protocol: AEROGPU_PROTOCOL,
            protocol_version: AEROGPU_PROTOCOL_VERSION,
            request_id,
            completed_fence,
        }
    }

    /// A completion from a worker speaking a different protocol revision is
    /// dropped rather than interpreted.
    pub fn matches_protocol(&self) -> bool {
        self.protocol == AEROGPU_PROTOCOL && self.protocol_version == AEROGPU_PROTOCOL_VERSION
    }
}

/// supervisor -> CPU worker: unblock the guest waiter for `fence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteFence {
    pub fence: u64,
}

impl CompleteFence {
    pub const KIND: &'static str = "aerogpu.complete_fence";
}
