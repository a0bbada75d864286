//! Double-buffered shared framebuffer.
//!
//! Layout: a 64-byte-aligned header of `u32` atomics, two fixed-size pixel
//! slots, and (when tile tracking is enabled) one dirty-bitmap word array per
//! slot. The producer writes the inactive slot, then publishes by storing the
//! slot's sequence number, flipping `active_index` and bumping `seq`, in
//! that order, with release semantics, so a consumer that observes the new
//! `seq` also observes the fully written slot.
//!
//! Dirty-tile semantics: a published frame whose bitmap has *no* bits set is
//! a full-frame update. An empty dirty set is not "nothing changed"; only an
//! unchanged `seq` means that.

use std::sync::atomic::{AtomicU32, Ordering};

pub const SHARED_FRAMEBUFFER_MAGIC: u32 = u32::from_le_bytes(*b"ASFB");
pub const SHARED_FRAMEBUFFER_VERSION: u32 = 1;

const HEADER_BYTES: usize = 64;
const ALIGN: usize = 64;
const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferFormat {
    Rgba8,
}

impl FramebufferFormat {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Rgba8 => 1,
        }
    }

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Rgba8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedFramebufferError {
    NullBasePtr,
    UnalignedBasePtr { addr: usize },
    ZeroDimension { width: u32, height: u32 },
}

impl std::fmt::Display for SharedFramebufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NullBasePtr => f.write_str("null base pointer"),
            Self::UnalignedBasePtr { addr } => {
                write!(f, "base pointer 0x{addr:x} is not 4-byte aligned")
            }
            Self::ZeroDimension { width, height } => {
                write!(f, "framebuffer dimensions {width}x{height} are invalid")
            }
        }
    }
}

impl std::error::Error for SharedFramebufferError {}

/// Geometry of a shared framebuffer allocation. Everything downstream
/// (offsets, bitmap sizes) is a pure function of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFramebufferLayout {
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    /// Tile edge in pixels; 0 disables dirty-tile tracking.
    pub tile_size_px: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub dirty_words_per_buffer: u32,
}

impl SharedFramebufferLayout {
    pub fn new_rgba8(
        width: u32,
        height: u32,
        tile_size: u32,
    ) -> Result<Self, SharedFramebufferError> {
        if width == 0 || height == 0 {
            return Err(SharedFramebufferError::ZeroDimension { width, height });
        }
        let stride_bytes = width * BYTES_PER_PIXEL as u32;
        let (tiles_x, tiles_y) = if tile_size == 0 {
            (0, 0)
        } else {
            (width.div_ceil(tile_size), height.div_ceil(tile_size))
        };
        let tile_count = tiles_x * tiles_y;
        let dirty_words_per_buffer = tile_count.div_ceil(32);
        Ok(Self {
            width,
            height,
            stride_bytes,
            tile_size_px: tile_size,
            tiles_x,
            tiles_y,
            dirty_words_per_buffer,
        })
    }

    pub fn tile_count(&self) -> usize {
        (self.tiles_x * self.tiles_y) as usize
    }

    pub fn buffer_bytes(&self) -> usize {
        self.stride_bytes as usize * self.height as usize
    }

    fn align_up(v: usize) -> usize {
        (v + ALIGN - 1) & !(ALIGN - 1)
    }

    pub fn buffer_offset(&self, index: usize) -> usize {
        debug_assert!(index < 2);
        HEADER_BYTES + index * Self::align_up(self.buffer_bytes())
    }

    pub fn dirty_words_offset(&self, index: usize) -> usize {
        debug_assert!(index < 2);
        HEADER_BYTES
            + 2 * Self::align_up(self.buffer_bytes())
            + index * Self::align_up(self.dirty_words_per_buffer as usize * 4)
    }

    /// Total allocation size; always a multiple of 64 bytes.
    pub fn total_byte_len(&self) -> usize {
        HEADER_BYTES
            + 2 * Self::align_up(self.buffer_bytes())
            + 2 * Self::align_up(self.dirty_words_per_buffer as usize * 4)
    }
}

/// Header words, all plain `u32` atomics so both sides of the shared mapping
/// agree on representation.
#[repr(C)]
pub struct SharedFramebufferHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub format: AtomicU32,
    pub width: AtomicU32,
    pub height: AtomicU32,
    pub stride_bytes: AtomicU32,
    pub tile_size_px: AtomicU32,
    pub tiles_x: AtomicU32,
    pub tiles_y: AtomicU32,
    pub dirty_words_per_buffer: AtomicU32,
    /// Which slot a consumer should read; 0 or 1.
    pub active_index: AtomicU32,
    /// Monotonic publish counter.
    pub seq: AtomicU32,
    pub buf_seq: [AtomicU32; 2],
    /// Set on publish, cleared by the consumer's ack.
    pub frame_dirty: AtomicU32,
}

impl SharedFramebufferHeader {
    pub fn init(&self, layout: SharedFramebufferLayout) {
        self.version
            .store(SHARED_FRAMEBUFFER_VERSION, Ordering::SeqCst);
        self.format
            .store(FramebufferFormat::Rgba8.to_u32(), Ordering::SeqCst);
        self.width.store(layout.width, Ordering::SeqCst);
        self.height.store(layout.height, Ordering::SeqCst);
        self.stride_bytes.store(layout.stride_bytes, Ordering::SeqCst);
        self.tile_size_px.store(layout.tile_size_px, Ordering::SeqCst);
        self.tiles_x.store(layout.tiles_x, Ordering::SeqCst);
        self.tiles_y.store(layout.tiles_y, Ordering::SeqCst);
        self.dirty_words_per_buffer
            .store(layout.dirty_words_per_buffer, Ordering::SeqCst);
        self.active_index.store(0, Ordering::SeqCst);
        self.seq.store(0, Ordering::SeqCst);
        self.buf_seq[0].store(0, Ordering::SeqCst);
        self.buf_seq[1].store(0, Ordering::SeqCst);
        self.frame_dirty.store(0, Ordering::SeqCst);
        // Magic last: a consumer that sees it may trust the rest.
        self.magic.store(SHARED_FRAMEBUFFER_MAGIC, Ordering::SeqCst);
    }
}

/// A validated view over a shared framebuffer allocation. Copyable; the
/// underlying storage is owned elsewhere (a shared segment).
#[derive(Debug, Clone, Copy)]
pub struct SharedFramebuffer {
    base: *mut u8,
    layout: SharedFramebufferLayout,
}

impl SharedFramebuffer {
    /// # Safety
    ///
    /// `base` must point at `layout.total_byte_len()` bytes that stay valid
    /// for as long as any view or writer derived from this value is used.
    pub unsafe fn from_raw_parts(
        base: *mut u8,
        layout: SharedFramebufferLayout,
    ) -> Result<Self, SharedFramebufferError> {
        if base.is_null() {
            return Err(SharedFramebufferError::NullBasePtr);
        }
        if base as usize % 4 != 0 {
            return Err(SharedFramebufferError::UnalignedBasePtr { addr: base as usize });
        }
        Ok(Self { base, layout })
    }

    pub fn layout(&self) -> SharedFramebufferLayout {
        self.layout
    }

    pub fn header(&self) -> &SharedFramebufferHeader {
        unsafe { &*(self.base as *const SharedFramebufferHeader) }
    }

    fn buffer_slice_mut(&self, index: usize) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.layout.buffer_offset(index)),
                self.layout.buffer_bytes(),
            )
        }
    }

    fn buffer_slice(&self, index: usize) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.layout.buffer_offset(index)),
                self.layout.buffer_bytes(),
            )
        }
    }

    fn dirty_words_mut(&self, index: usize) -> &mut [u32] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.layout.dirty_words_offset(index)) as *mut u32,
                self.layout.dirty_words_per_buffer as usize,
            )
        }
    }

    fn dirty_words(&self, index: usize) -> &[u32] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.layout.dirty_words_offset(index)) as *const u32,
                self.layout.dirty_words_per_buffer as usize,
            )
        }
    }
}

// Producer and consumer live on different threads of the same VM.
unsafe impl Send for SharedFramebuffer {}
unsafe impl Sync for SharedFramebuffer {}

/// Producer side. Exactly one writer may exist per framebuffer.
pub struct SharedFramebufferWriter {
    shared: SharedFramebuffer,
}

impl SharedFramebufferWriter {
    pub fn new(shared: SharedFramebuffer) -> Self {
        Self { shared }
    }

    /// Writes one frame into the inactive slot and publishes it. The closure
    /// receives the slot pixels, the slot's dirty-word array when tile
    /// tracking is enabled (pre-cleared; leaving it all-zero publishes a
    /// full-frame update), and the layout.
    pub fn write_frame<F>(&self, fill: F)
    where
        F: FnOnce(&mut [u8], Option<&mut [u32]>, &SharedFramebufferLayout),
    {
        let header = self.shared.header();
        let layout = self.shared.layout;
        let active = header.active_index.load(Ordering::Acquire);
        let target = if active == 0 { 1 } else { 0 };

        let pixels = self.shared.buffer_slice_mut(target as usize);
        let dirty = if layout.tile_size_px != 0 {
            let words = self.shared.dirty_words_mut(target as usize);
            words.fill(0);
            Some(words)
        } else {
            None
        };
        fill(pixels, dirty, &layout);

        let seq = header.seq.load(Ordering::Relaxed).wrapping_add(1);
        header.buf_seq[target as usize].store(seq, Ordering::Release);
        header.active_index.store(target, Ordering::Release);
        header.seq.store(seq, Ordering::Release);
        header.frame_dirty.store(1, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSourceError {
    SharedFramebuffer(SharedFramebufferError),
    BadMagic { found: u32 },
    BadVersion { found: u32 },
    UnsupportedFormat { found: u32 },
    DirtyWordsMismatch { expected: u32, found: u32 },
    TilesMismatch { expected_x: u32, expected_y: u32, found_x: u32, found_y: u32 },
}

impl From<SharedFramebufferError> for FrameSourceError {
    fn from(err: SharedFramebufferError) -> Self {
        Self::SharedFramebuffer(err)
    }
}

impl std::fmt::Display for FrameSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::SharedFramebuffer(err) => write!(f, "shared framebuffer: {err}"),
            Self::BadMagic { found } => write!(f, "bad magic 0x{found:08x}"),
            Self::BadVersion { found } => write!(f, "unsupported version {found}"),
            Self::UnsupportedFormat { found } => write!(f, "unsupported pixel format {found}"),
            Self::DirtyWordsMismatch { expected, found } => {
                write!(f, "dirty_words_per_buffer {found}, expected {expected}")
            }
            Self::TilesMismatch { expected_x, expected_y, found_x, found_y } => write!(
                f,
                "tile grid {found_x}x{found_y}, expected {expected_x}x{expected_y}"
            ),
        }
    }
}

impl std::error::Error for FrameSourceError {}

/// One published frame, borrowed from the shared mapping.
pub struct Frame<'a> {
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub format: FramebufferFormat,
    pub seq: u32,
    pub active_index: u32,
    /// The slot's own sequence number; equals `seq` for a clean read.
    pub active_buf_seq: u32,
    pub pixels: &'a [u8],
    dirty_words: Option<&'a [u32]>,
    layout: SharedFramebufferLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Frame<'_> {
    /// Per-tile damage for the presenter, or `None` when the whole frame
    /// should be presented: tracking disabled, every tile dirty, or a
    /// published bitmap with no bits set (which means full-frame, not
    /// empty).
    pub fn dirty_rects_for_presenter(&self) -> Option<Vec<DirtyRect>> {
        let words = self.dirty_words?;
        let tile = self.layout.tile_size_px;
        let total = self.layout.tile_count();
        let set: usize = words.iter().map(|w| w.count_ones() as usize).sum();
        if set == 0 || set == total {
            return None;
        }
        let mut rects = Vec::with_capacity(set);
        for idx in 0..total {
            if words[idx / 32] & (1u32 << (idx % 32)) == 0 {
                continue;
            }
            let tx = idx as u32 % self.layout.tiles_x;
            let ty = idx as u32 / self.layout.tiles_x;
            let x = tx * tile;
            let y = ty * tile;
            rects.push(DirtyRect {
                x,
                y,
                w: tile.min(self.width - x),
                h: tile.min(self.height - y),
            });
        }
        Some(rects)
    }
}

/// Consumer side: validates the header once, then polls for new frames.
#[derive(Debug)]
pub struct FrameSource {
    shared: SharedFramebuffer,
    last_seq: u32,
}

impl FrameSource {
    /// # Safety
    ///
    /// `base_ptr + offset_bytes` must point at a shared framebuffer
    /// allocation that outlives the source.
    pub unsafe fn from_shared_memory(
        base_ptr: *mut u8,
        offset_bytes: usize,
    ) -> Result<Self, FrameSourceError> {
        if base_ptr.is_null() {
            return Err(SharedFramebufferError::NullBasePtr.into());
        }
        let base = base_ptr.add(offset_bytes);
        if base as usize % 4 != 0 {
            return Err(SharedFramebufferError::UnalignedBasePtr { addr: base as usize }.into());
        }

        let header = &*(base as *const SharedFramebufferHeader);
        let magic = header.magic.load(Ordering::SeqCst);
        if magic != SHARED_FRAMEBUFFER_MAGIC {
            return Err(FrameSourceError::BadMagic { found: magic });
        }
        let version = header.version.load(Ordering::SeqCst);
        if version != SHARED_FRAMEBUFFER_VERSION {
            return Err(FrameSourceError::BadVersion { found: version });
        }
        let format = header.format.load(Ordering::SeqCst);
        if FramebufferFormat::from_u32(format).is_none() {
            return Err(FrameSourceError::UnsupportedFormat { found: format });
        }

        let layout = SharedFramebufferLayout::new_rgba8(
            header.width.load(Ordering::SeqCst),
            header.height.load(Ordering::SeqCst),
            header.tile_size_px.load(Ordering::SeqCst),
        )?;
        let dirty_words = header.dirty_words_per_buffer.load(Ordering::SeqCst);
        if dirty_words != layout.dirty_words_per_buffer {
            return Err(FrameSourceError::DirtyWordsMismatch {
                expected: layout.dirty_words_per_buffer,
                found: dirty_words,
            });
        }
        let tiles_x = header.tiles_x.load(Ordering::SeqCst);
        let tiles_y = header.tiles_y.load(Ordering::SeqCst);
        if tiles_x != layout.tiles_x || tiles_y != layout.tiles_y {
            return Err(FrameSourceError::TilesMismatch {
                expected_x: layout.tiles_x,
                expected_y: layout.tiles_y,
                found_x: tiles_x,
                found_y: tiles_y,
            });
        }

        let shared = SharedFramebuffer::from_raw_parts(base, layout)?;
        Ok(Self { shared, last_seq: shared.header().seq.load(Ordering::SeqCst) })
    }

    /// Returns the newly published frame, if any. Does not clear
    /// `frame_dirty`; call [`FrameSource::ack_frame`] once the pixels have
    /// been consumed.
    pub fn poll_frame(&mut self) -> Option<Frame<'_>> {
        let header = self.shared.header();
        let seq = header.seq.load(Ordering::Acquire);
        if seq == self.last_seq {
            return None;
        }
        self.last_seq = seq;

        // A corrupt header may hold anything; out-of-range values clamp to
        // slot 0 so the read stays in bounds and deterministic.
        let raw_index = header.active_index.load(Ordering::Acquire);
        let active_index = if raw_index > 1 { 0 } else { raw_index };
        let layout = self.shared.layout;
        let pixels = self.shared.buffer_slice(active_index as usize);
        let dirty_words = if layout.tile_size_px != 0 {
            Some(self.shared.dirty_words(active_index as usize))
        } else {
            None
        };

        Some(Frame {
            width: layout.width,
            height: layout.height,
            stride_bytes: layout.stride_bytes,
            format: FramebufferFormat::Rgba8,
            seq,
            active_index,
            active_buf_seq: header.buf_seq[active_index as usize].load(Ordering::Acquire),
            pixels,
            dirty_words,
            layout,
        })
    }

    /// Clears `frame_dirty` iff `seq` is still the latest published frame.
    pub fn ack_frame(&self, seq: u32) {
        let header = self.shared.header();
        if header.seq.load(Ordering::Acquire) == seq {
            header.frame_dirty.store(0, Ordering::Release);
        }
    }
}
