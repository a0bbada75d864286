//! Producer/consumer protocol over one shared framebuffer allocation:
//! header validation on attach, publish visibility, dirty-rect reporting
//! and the ack handshake.

use std::sync::atomic::Ordering;

use aero_shared::shared_framebuffer::{
    FrameSource, FrameSourceError, FramebufferFormat, SharedFramebuffer, SharedFramebufferError,
    SharedFramebufferLayout, SharedFramebufferWriter, SHARED_FRAMEBUFFER_MAGIC,
    SHARED_FRAMEBUFFER_VERSION,
};

/// Owns the backing store for one framebuffer allocation and hands out
/// views over it. Word storage keeps the base pointer 4-byte aligned.
struct TestAllocation {
    words: Vec<u32>,
    layout: SharedFramebufferLayout,
}

impl TestAllocation {
    fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let layout = SharedFramebufferLayout::new_rgba8(width, height, tile_size).unwrap();
        let mut alloc = Self { words: vec![0u32; layout.total_byte_len() / 4], layout };
        alloc.view().header().init(layout);
        alloc
    }

    fn base(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }

    fn view(&mut self) -> SharedFramebuffer {
        let layout = self.layout;
        unsafe { SharedFramebuffer::from_raw_parts(self.base(), layout) }.unwrap()
    }

    fn writer(&mut self) -> SharedFramebufferWriter {
        SharedFramebufferWriter::new(self.view())
    }

    fn source(&mut self) -> FrameSource {
        self.attach().unwrap()
    }

    fn attach(&mut self) -> Result<FrameSource, FrameSourceError> {
        unsafe { FrameSource::from_shared_memory(self.base(), 0) }
    }
}

fn set_all_dirty_bits(words: &mut [u32], tile_count: usize) {
    for idx in 0..tile_count {
        words[idx / 32] |= 1 << (idx % 32);
    }
}

#[test]
fn attach_rejects_null_and_misaligned_pointers() {
    let err = unsafe { FrameSource::from_shared_memory(std::ptr::null_mut(), 0) }.unwrap_err();
    assert_eq!(err, FrameSourceError::SharedFramebuffer(SharedFramebufferError::NullBasePtr));

    let mut alloc = TestAllocation::new(16, 16, 0);
    // Offsetting by one byte breaks the word alignment of the header.
    let base = alloc.base();
    let err = unsafe { FrameSource::from_shared_memory(base, 1) }.unwrap_err();
    assert!(matches!(
        err,
        FrameSourceError::SharedFramebuffer(SharedFramebufferError::UnalignedBasePtr { .. })
    ));
}

#[test]
fn attach_validates_every_header_field() {
    let mut alloc = TestAllocation::new(64, 32, 32);
    let layout = alloc.layout;
    let view = alloc.view();
    let header = view.header();

    header.magic.store(!SHARED_FRAMEBUFFER_MAGIC, Ordering::SeqCst);
    assert!(matches!(
        alloc.attach(),
        Err(FrameSourceError::BadMagic { found }) if found == !SHARED_FRAMEBUFFER_MAGIC
    ));
    header.magic.store(SHARED_FRAMEBUFFER_MAGIC, Ordering::SeqCst);

    header.version.store(SHARED_FRAMEBUFFER_VERSION + 1, Ordering::SeqCst);
    assert!(matches!(
        alloc.attach(),
        Err(FrameSourceError::BadVersion { found }) if found == SHARED_FRAMEBUFFER_VERSION + 1
    ));
    header.version.store(SHARED_FRAMEBUFFER_VERSION, Ordering::SeqCst);

    header.format.store(0xAB, Ordering::SeqCst);
    assert!(matches!(alloc.attach(), Err(FrameSourceError::UnsupportedFormat { found: 0xAB })));
    header.format.store(FramebufferFormat::Rgba8.to_u32(), Ordering::SeqCst);

    let expected_words = layout.dirty_words_per_buffer;
    header.dirty_words_per_buffer.store(expected_words + 3, Ordering::SeqCst);
    assert!(matches!(
        alloc.attach(),
        Err(FrameSourceError::DirtyWordsMismatch { expected, found })
            if expected == expected_words && found == expected_words + 3
    ));
    header.dirty_words_per_buffer.store(expected_words, Ordering::SeqCst);

    header.tiles_y.store(layout.tiles_y + 1, Ordering::SeqCst);
    assert!(matches!(
        alloc.attach(),
        Err(FrameSourceError::TilesMismatch { expected_y, found_y, .. })
            if expected_y == layout.tiles_y && found_y == layout.tiles_y + 1
    ));
    header.tiles_y.store(layout.tiles_y, Ordering::SeqCst);

    // With everything restored the attach succeeds again.
    assert!(alloc.attach().is_ok());
}

#[test]
fn publishes_become_visible_with_matching_sequence_numbers() {
    let mut alloc = TestAllocation::new(64, 32, 32);
    let stride = alloc.layout.stride_bytes;
    let mut source = alloc.source();
    assert!(source.poll_frame().is_none(), "no publish yet");

    alloc.writer().write_frame(|pixels, dirty, layout| {
        pixels.fill(0x11);
        set_all_dirty_bits(dirty.unwrap(), layout.tile_count());
    });

    let frame = source.poll_frame().expect("first publish visible");
    assert_eq!((frame.width, frame.height), (64, 32));
    assert_eq!(frame.stride_bytes, stride);
    assert_eq!(frame.format, FramebufferFormat::Rgba8);
    assert_eq!(frame.seq, 1);
    assert_eq!(frame.active_buf_seq, frame.seq, "slot seq must match the publish");
    assert!(frame.pixels.iter().all(|&b| b == 0x11));

    // Same frame polled again: nothing new.
    assert!(source.poll_frame().is_none());
}

#[test]
fn dirty_rects_distinguish_partial_from_full_updates() {
    let mut alloc = TestAllocation::new(64, 32, 32); // 2x1 tile grid
    let mut source = alloc.source();
    let writer = alloc.writer();

    // Every tile marked: the presenter takes the full-frame path.
    writer.write_frame(|pixels, dirty, layout| {
        pixels.fill(0x20);
        set_all_dirty_bits(dirty.unwrap(), layout.tile_count());
    });
    assert_eq!(source.poll_frame().unwrap().dirty_rects_for_presenter(), None);

    // Only the second tile marked: one 32x32 rect at x=32.
    writer.write_frame(|pixels, dirty, _layout| {
        pixels.fill(0x21);
        dirty.unwrap()[0] = 0b10;
    });
    let frame = source.poll_frame().unwrap();
    let rects = frame.dirty_rects_for_presenter().expect("partial update");
    assert_eq!(rects.len(), 1);
    assert_eq!((rects[0].x, rects[0].y, rects[0].w, rects[0].h), (32, 0, 32, 32));

    // A published bitmap with no bits set means full-frame, not "skip".
    writer.write_frame(|pixels, _dirty, _layout| pixels.fill(0x22));
    let frame = source.poll_frame().expect("empty dirty set is still a new frame");
    assert_eq!(frame.dirty_rects_for_presenter(), None);
}

#[test]
fn untracked_framebuffers_always_present_full_frames() {
    let mut alloc = TestAllocation::new(16, 16, 0);
    let mut source = alloc.source();
    alloc.writer().write_frame(|pixels, dirty, _layout| {
        assert!(dirty.is_none(), "tile_size 0 disables the bitmap");
        pixels.fill(0x30);
    });
    assert_eq!(source.poll_frame().unwrap().dirty_rects_for_presenter(), None);
}

#[test]
fn frame_dirty_clears_only_on_a_current_ack() {
    let mut alloc = TestAllocation::new(16, 16, 0);
    let mut source = alloc.source();
    let writer = alloc.writer();
    let view = alloc.view();
    let header = view.header();

    writer.write_frame(|pixels, _dirty, _layout| pixels.fill(1));
    assert_eq!(header.frame_dirty.load(Ordering::SeqCst), 1);

    let first_seq = source.poll_frame().unwrap().seq;
    // Polling alone must not ack: the pixels are still borrowed from the
    // shared slot at this point in the consumer's life.
    assert_eq!(header.frame_dirty.load(Ordering::SeqCst), 1);

    source.ack_frame(first_seq);
    assert_eq!(header.frame_dirty.load(Ordering::SeqCst), 0);

    // A second publish re-arms the flag; an ack for the *old* sequence must
    // not clear it.
    writer.write_frame(|pixels, _dirty, _layout| pixels.fill(2));
    source.ack_frame(first_seq);
    assert_eq!(header.frame_dirty.load(Ordering::SeqCst), 1);

    let second_seq = source.poll_frame().unwrap().seq;
    source.ack_frame(second_seq);
    assert_eq!(header.frame_dirty.load(Ordering::SeqCst), 0);
}

#[test]
fn corrupt_active_index_clamps_to_slot_zero() {
    let mut alloc = TestAllocation::new(32, 32, 32);
    let view = alloc.view();
    let header = view.header();

    // Point the writer at slot 0 for its first publish, then attach.
    header.active_index.store(1, Ordering::SeqCst);
    let mut source = alloc.source();
    assert!(source.poll_frame().is_none());

    alloc.writer().write_frame(|pixels, _dirty, _layout| pixels.fill(0x44));

    // Scribble an impossible slot index; the consumer must fall back to
    // slot 0 and still see the published pixels.
    header.active_index.store(9, Ordering::SeqCst);
    let frame = source.poll_frame().expect("publish visible despite corruption");
    assert_eq!(frame.active_index, 0);
    assert_eq!(frame.active_buf_seq, frame.seq);
    assert_eq!(frame.pixels[0], 0x44);
}
