//! Word-level layout of the control IPC segment.
//!
//! The segment is a sequence of little-endian `u32` words: a fixed header,
//! then one descriptor per queue, then the ring areas themselves (each a
//! control block followed by its data area). All constants here are **word
//! indices** relative to the start of their block; `BYTES` is the byte size
//! of the block.

/// Segment header.
pub mod ipc_header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    pub const QUEUE_COUNT: usize = 2;
    pub const TOTAL_BYTES: usize = 3;
    pub const BYTES: usize = 16;

    /// `b"AIPC"` read as a little-endian word.
    pub const MAGIC_VALUE: u32 = u32::from_le_bytes(*b"AIPC");
    pub const VERSION_VALUE: u32 = 1;
}

/// Per-queue descriptor, one after another right behind the header.
pub mod queue_desc {
    pub const KIND: usize = 0;
    pub const OFFSET_BYTES: usize = 1;
    pub const CAPACITY_BYTES: usize = 2;
    pub const RESERVED: usize = 3;
    pub const BYTES: usize = 16;
}

/// Stable queue kind values. Workers look queues up by kind, never by index.
pub mod queue_kind {
    pub const CMD: u32 = 0;
    pub const EVT: u32 = 1;
    pub const NET_TX: u32 = 2;
    pub const NET_RX: u32 = 3;
}

/// Ring control block, at the start of each ring area.
pub mod ring_ctrl {
    pub const HEAD: usize = 0;
    pub const TAIL_RESERVE: usize = 1;
    pub const TAIL_COMMIT: usize = 2;
    pub const CAPACITY: usize = 3;
    pub const BYTES: usize = 16;
}

/// Ring areas are aligned to this many bytes within the segment.
pub const RING_AREA_ALIGN: usize = 16;
