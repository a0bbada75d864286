//! Creation and validation of the control IPC segment.
//!
//! The supervisor allocates one segment per worker with
//! [`create_ipc_buffer`]; workers re-validate the untrusted bytes with
//! [`parse_ipc_buffer`] before touching any ring. Validation is strict: a
//! segment that fails any check is rejected as a whole.

use crate::layout::{ipc_header, queue_desc, ring_ctrl, RING_AREA_ALIGN};
use crate::ring::RECORD_ALIGN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcQueueSpec {
    pub kind: u32,
    pub capacity_bytes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcQueueInfo {
    pub kind: u32,
    pub offset_bytes: usize,
    pub capacity_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcLayout {
    pub total_bytes: usize,
    pub queues: Vec<IpcQueueInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcLayoutError {
    TooSmall { len: usize },
    BadMagic { found: u32 },
    UnsupportedVersion { found: u32 },
    TotalBytesMismatch { declared: u32, actual: usize },
    QueueReservedNotZero { index: usize, found: u32 },
    QueueBadCapacity { index: usize, capacity_bytes: u32 },
    QueueOutOfBounds { index: usize },
    RingHeaderCapacityMismatch { index: usize, declared: u32, found: u32 },
}

impl std::fmt::Display for IpcLayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::TooSmall { len } => write!(f, "segment too small ({len} bytes)"),
            Self::BadMagic { found } => write!(f, "bad magic 0x{found:08x}"),
            Self::UnsupportedVersion { found } => write!(f, "unsupported version {found}"),
            Self::TotalBytesMismatch { declared, actual } => {
                write!(f, "declared size {declared} does not match segment size {actual}")
            }
            Self::QueueReservedNotZero { index, found } => {
                write!(f, "queue {index}: reserved word is 0x{found:08x}, expected 0")
            }
            Self::QueueBadCapacity { index, capacity_bytes } => {
                write!(f, "queue {index}: invalid capacity {capacity_bytes}")
            }
            Self::QueueOutOfBounds { index } => {
                write!(f, "queue {index}: ring area exceeds the segment")
            }
            Self::RingHeaderCapacityMismatch { index, declared, found } => write!(
                f,
                "queue {index}: descriptor capacity {declared} does not match ring header {found}"
            ),
        }
    }
}

impl std::error::Error for IpcLayoutError {}

fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

fn read_word(bytes: &[u8], word: usize) -> u32 {
    let off = word * 4;
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn write_word(bytes: &mut [u8], word: usize, v: u32) {
    let off = word * 4;
    bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn ring_area_bytes(capacity_bytes: u32) -> usize {
    align_up(ring_ctrl::BYTES + capacity_bytes as usize, RING_AREA_ALIGN)
}

/// Builds a zeroed segment with the header, descriptor table and ring control
/// blocks initialised. Panics on invalid specs; the supervisor controls them.
pub fn create_ipc_buffer(specs: &[IpcQueueSpec]) -> Vec<u8> {
    for spec in specs {
        assert!(
            spec.capacity_bytes > 0 && spec.capacity_bytes as usize % RECORD_ALIGN == 0,
            "queue capacity must be a non-zero multiple of {RECORD_ALIGN}"
        );
    }

    let desc_table_end = ipc_header::BYTES + specs.len() * queue_desc::BYTES;
    let mut cursor = align_up(desc_table_end, RING_AREA_ALIGN);
    let offsets: Vec<usize> = specs
        .iter()
        .map(|spec| {
            let off = cursor;
            cursor += ring_area_bytes(spec.capacity_bytes);
            off
        })
        .collect();
    let total = cursor;

    let mut bytes = vec![0u8; total];
    write_word(&mut bytes, ipc_header::MAGIC, ipc_header::MAGIC_VALUE);
    write_word(&mut bytes, ipc_header::VERSION, ipc_header::VERSION_VALUE);
    write_word(&mut bytes, ipc_header::QUEUE_COUNT, specs.len() as u32);
    write_word(&mut bytes, ipc_header::TOTAL_BYTES, total as u32);

    for (i, (spec, &off)) in specs.iter().zip(&offsets).enumerate() {
        let desc_word = (ipc_header::BYTES + i * queue_desc::BYTES) / 4;
        write_word(&mut bytes, desc_word + queue_desc::KIND, spec.kind);
        write_word(&mut bytes, desc_word + queue_desc::OFFSET_BYTES, off as u32);
        write_word(
            &mut bytes,
            desc_word + queue_desc::CAPACITY_BYTES,
            spec.capacity_bytes,
        );
        write_word(&mut bytes, desc_word + queue_desc::RESERVED, 0);

        let ring_word = off / 4;
        write_word(&mut bytes, ring_word + ring_ctrl::HEAD, 0);
        write_word(&mut bytes, ring_word + ring_ctrl::TAIL_RESERVE, 0);
        write_word(&mut bytes, ring_word + ring_ctrl::TAIL_COMMIT, 0);
        write_word(&mut bytes, ring_word + ring_ctrl::CAPACITY, spec.capacity_bytes);
    }

    bytes
}

/// Validates an untrusted segment and returns its queue table.
pub fn parse_ipc_buffer(bytes: &[u8]) -> Result<IpcLayout, IpcLayoutError> {
    if bytes.len() < ipc_header::BYTES {
        return Err(IpcLayoutError::TooSmall { len: bytes.len() });
    }

    let magic = read_word(bytes, ipc_header::MAGIC);
    if magic != ipc_header::MAGIC_VALUE {
        return Err(IpcLayoutError::BadMagic { found: magic });
    }
    let version = read_word(bytes, ipc_header::VERSION);
    if version != ipc_header::VERSION_VALUE {
        return Err(IpcLayoutError::UnsupportedVersion { found: version });
    }
    let declared_total = read_word(bytes, ipc_header::TOTAL_BYTES);
    if declared_total as usize != bytes.len() {
        return Err(IpcLayoutError::TotalBytesMismatch {
            declared: declared_total,
            actual: bytes.len(),
        });
    }

    let queue_count = read_word(bytes, ipc_header::QUEUE_COUNT) as usize;
    let desc_table_end = ipc_header::BYTES + queue_count * queue_desc::BYTES;
    if bytes.len() < desc_table_end {
        return Err(IpcLayoutError::TooSmall { len: bytes.len() });
    }

    let mut queues = Vec::with_capacity(queue_count);
    for i in 0..queue_count {
        let desc_word = (ipc_header::BYTES + i * queue_desc::BYTES) / 4;
        let kind = read_word(bytes, desc_word + queue_desc::KIND);
        let offset = read_word(bytes, desc_word + queue_desc::OFFSET_BYTES) as usize;
        let capacity = read_word(bytes, desc_word + queue_desc::CAPACITY_BYTES);
        let reserved = read_word(bytes, desc_word + queue_desc::RESERVED);

        if reserved != 0 {
            return Err(IpcLayoutError::QueueReservedNotZero { index: i, found: reserved });
        }
        if capacity == 0 || capacity as usize % RECORD_ALIGN != 0 {
            return Err(IpcLayoutError::QueueBadCapacity { index: i, capacity_bytes: capacity });
        }
        if offset % RING_AREA_ALIGN != 0
            || offset
                .checked_add(ring_area_bytes(capacity))
                .map_or(true, |end| end > bytes.len())
        {
            return Err(IpcLayoutError::QueueOutOfBounds { index: i });
        }

        let ring_word = offset / 4;
        let header_capacity = read_word(bytes, ring_word + ring_ctrl::CAPACITY);
        if header_capacity != capacity {
            return Err(IpcLayoutError::RingHeaderCapacityMismatch {
                index: i,
                declared: capacity,
                found: header_capacity,
            });
        }

        queues.push(IpcQueueInfo {
            kind,
            offset_bytes: offset,
            capacity_bytes: capacity as usize,
        });
    }

    Ok(IpcLayout { total_bytes: bytes.len(), queues })
}

/// Returns the `nth` queue with the given kind, in descriptor order.
pub fn find_queue_by_kind(layout: &IpcLayout, kind: u32, nth: usize) -> Option<&IpcQueueInfo> {
    layout.queues.iter().filter(|q| q.kind == kind).nth(nth)
}
