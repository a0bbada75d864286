//! The shared-memory segment bundle allocated at VM start.
//!
//! Sizes are fixed for the VM's lifetime. The bundle is cloneable (all
//! segments are reference-counted) so the supervisor can hand the same
//! memory to a replacement worker after a soft restart.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::scanout::ScanoutState;
use crate::shared_framebuffer::{SharedFramebuffer, SharedFramebufferLayout};

/// A reference-counted byte region shared between workers. The in-browser
/// equivalent is a `SharedArrayBuffer`; here it is plain process memory with
/// interior mutability, raced only through the protocols built on top of it
/// (rings, framebuffer publishes).
pub struct SharedSegment {
    bytes: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self { bytes: UnsafeCell::new(vec![0u8; len].into_boxed_slice()) })
    }

    pub fn len(&self) -> usize {
        unsafe { (&*self.bytes.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Copies `bytes` into the segment. Intended for one-time initialisation
    /// (e.g. writing an IPC layout) before any worker attaches.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(offset.checked_add(bytes.len()).is_some_and(|end| end <= self.len()));
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSizes {
    pub guest_ram_bytes: usize,
    pub vram_bytes: usize,
    pub io_ipc_bytes: usize,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_tile_size: u32,
    pub perf_channel_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    ZeroGuestRam,
    BadFramebuffer { width: u32, height: u32 },
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::ZeroGuestRam => f.write_str("guest RAM size must be non-zero"),
            Self::BadFramebuffer { width, height } => {
                write!(f, "invalid framebuffer dimensions {width}x{height}")
            }
        }
    }
}

impl std::error::Error for SegmentError {}

/// Legacy VGA scanout window (128KiB planes x2).
pub const VGA_FRAMEBUFFER_BYTES: usize = 256 * 1024;

/// Everything the workers share. Created once per VM; survives soft worker
/// restarts; dropped only on full teardown.
#[derive(Clone)]
pub struct SharedMemorySegments {
    pub guest_ram: Arc<SharedSegment>,
    pub vram: Arc<SharedSegment>,
    /// Legacy VGA scanout buffer, distinct from the double-buffered
    /// presenter framebuffer.
    pub vga_framebuffer: Arc<SharedSegment>,
    /// CPU<->IO request/response rings (an IPC layout is written here at VM
    /// start).
    pub io_ipc: Arc<SharedSegment>,
    pub framebuffer: Arc<SharedSegment>,
    pub framebuffer_layout: SharedFramebufferLayout,
    pub scanout: Arc<ScanoutState>,
    pub perf_channel: Option<Arc<SharedSegment>>,
}

impl SharedMemorySegments {
    pub fn allocate(sizes: &SegmentSizes) -> Result<Self, SegmentError> {
        if sizes.guest_ram_bytes == 0 {
            return Err(SegmentError::ZeroGuestRam);
        }
        let framebuffer_layout = SharedFramebufferLayout::new_rgba8(
            sizes.framebuffer_width,
            sizes.framebuffer_height,
            sizes.framebuffer_tile_size,
        )
        .map_err(|_| SegmentError::BadFramebuffer {
            width: sizes.framebuffer_width,
            height: sizes.framebuffer_height,
        })?;

        Ok(Self {
            guest_ram: SharedSegment::zeroed(sizes.guest_ram_bytes),
            vram: SharedSegment::zeroed(sizes.vram_bytes),
            vga_framebuffer: SharedSegment::zeroed(VGA_FRAMEBUFFER_BYTES),
            io_ipc: SharedSegment::zeroed(sizes.io_ipc_bytes),
            framebuffer: SharedSegment::zeroed(framebuffer_layout.total_byte_len()),
            framebuffer_layout,
            scanout: Arc::new(ScanoutState::new()),
            perf_channel: sizes.perf_channel_bytes.map(SharedSegment::zeroed),
        })
    }

    /// A validated framebuffer view over the shared allocation.
    pub fn framebuffer_view(&self) -> SharedFramebuffer {
        // The segment was sized from this exact layout in `allocate`.
        unsafe { SharedFramebuffer::from_raw_parts(self.framebuffer.as_ptr(), self.framebuffer_layout) }
            .unwrap_or_else(|err| unreachable!("framebuffer segment invalid: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> SegmentSizes {
        SegmentSizes {
            guest_ram_bytes: 1024 * 1024,
            vram_bytes: 256 * 1024,
            io_ipc_bytes: 4096,
            framebuffer_width: 64,
            framebuffer_height: 48,
            framebuffer_tile_size: 16,
            perf_channel_bytes: None,
        }
    }

    #[test]
    fn allocate_rejects_zero_guest_ram() {
        let mut s = sizes();
        s.guest_ram_bytes = 0;
        let err = SharedMemorySegments::allocate(&s).err().expect("zero RAM must be rejected");
        assert_eq!(err, SegmentError::ZeroGuestRam);
    }

    #[test]
    fn segments_survive_cloning() {
        let segs = SharedMemorySegments::allocate(&sizes()).unwrap();
        let clone = segs.clone();
        assert_eq!(segs.guest_ram.as_ptr(), clone.guest_ram.as_ptr());
        assert_eq!(segs.framebuffer.len(), segs.framebuffer_layout.total_byte_len());
    }

    #[test]
    fn framebuffer_view_is_usable_end_to_end() {
        use crate::shared_framebuffer::{FrameSource, SharedFramebufferWriter};

        let segs = SharedMemorySegments::allocate(&sizes()).unwrap();
        let view = segs.framebuffer_view();
        view.header().init(segs.framebuffer_layout);

        let mut source =
            unsafe { FrameSource::from_shared_memory(segs.framebuffer.as_ptr(), 0) }.unwrap();
        assert!(source.poll_frame().is_none());

        let writer = SharedFramebufferWriter::new(view);
        writer.write_frame(|pixels, _dirty, _layout| pixels.fill(0x42));

        let frame = source.poll_frame().expect("published frame is visible");
        assert_eq!(frame.pixels[0], 0x42);
    }
}
