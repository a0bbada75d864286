//! pcapng serialization plus the bounded in-memory capture the Net worker
//! keeps while tracing is enabled.
//!
//! Writer output is a single little-endian section: SHB, one Ethernet IDB,
//! then one EPB per captured frame with microsecond timestamps (the pcapng
//! default resolution). The capture buffer is bounded by record count and
//! byte total; when full it sheds the *oldest* frames and accounts for them,
//! so a long trace degrades to "recent history" instead of failing.

use std::collections::VecDeque;

const BLOCK_TYPE_SHB: u32 = 0x0A0D_0D0A;
const BLOCK_TYPE_IDB: u32 = 0x0000_0001;
const BLOCK_TYPE_EPB: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;
const LINKTYPE_ETHERNET: u16 = 1;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

fn push_block(out: &mut Vec<u8>, block_type: u32, body: &[u8]) {
    let total = 12 + pad4(body.len());
    out.extend_from_slice(&block_type.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(body);
    out.resize(out.len() + pad4(body.len()) - body.len(), 0);
    out.extend_from_slice(&(total as u32).to_le_bytes());
}

/// Serializes one pcapng section.
#[derive(Debug, Default)]
pub struct PcapngWriter {
    out: Vec<u8>,
}

impl PcapngWriter {
    /// Starts a section with an SHB and one Ethernet interface.
    pub fn new(snap_len: u32) -> Self {
        let mut w = Self { out: Vec::new() };

        let mut shb = Vec::with_capacity(16);
        shb.extend_from_slice(&BYTE_ORDER_MAGIC.to_le_bytes());
        shb.extend_from_slice(&1u16.to_le_bytes()); // major
        shb.extend_from_slice(&0u16.to_le_bytes()); // minor
        shb.extend_from_slice(&u64::MAX.to_le_bytes()); // section length: unknown
        push_block(&mut w.out, BLOCK_TYPE_SHB, &shb);

        let mut idb = Vec::with_capacity(8);
        idb.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        idb.extend_from_slice(&0u16.to_le_bytes()); // reserved
        idb.extend_from_slice(&snap_len.to_le_bytes());
        push_block(&mut w.out, BLOCK_TYPE_IDB, &idb);

        w
    }

    pub fn push_packet(&mut self, timestamp_micros: u64, frame: &[u8], original_len: u32) {
        let mut epb = Vec::with_capacity(20 + frame.len());
        epb.extend_from_slice(&0u32.to_le_bytes()); // interface id
        epb.extend_from_slice(&((timestamp_micros >> 32) as u32).to_le_bytes());
        epb.extend_from_slice(&(timestamp_micros as u32).to_le_bytes());
        epb.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        epb.extend_from_slice(&original_len.to_le_bytes());
        epb.extend_from_slice(frame);
        push_block(&mut self.out, BLOCK_TYPE_EPB, &epb);
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceStats {
    pub enabled: bool,
    pub records: u64,
    pub bytes: u64,
    pub dropped_records: u64,
    pub dropped_bytes: u64,
}

#[derive(Debug, Clone)]
struct TraceRecord {
    timestamp_micros: u64,
    bytes: Vec<u8>,
    original_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub snap_len: u32,
}

impl Default for TraceLimits {
    fn default() -> Self {
        Self { max_records: 4096, max_bytes: 4 * 1024 * 1024, snap_len: 65535 }
    }
}

/// Bounded frame capture with shed-oldest accounting.
#[derive(Debug)]
pub struct TraceBuffer {
    limits: TraceLimits,
    enabled: bool,
    records: VecDeque<TraceRecord>,
    buffered_bytes: usize,
    dropped_records: u64,
    dropped_bytes: u64,
}

impl TraceBuffer {
    pub fn new(limits: TraceLimits) -> Self {
        Self {
            limits,
            enabled: false,
            records: VecDeque::new(),
            buffered_bytes: 0,
            dropped_records: 0,
            dropped_bytes: 0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records one frame. Disabled buffers ignore frames entirely; they are
    /// neither stored nor counted as dropped.
    pub fn push_frame(&mut self, timestamp_micros: u64, frame: &[u8]) {
        if !self.enabled {
            return;
        }
        let captured = &frame[..frame.len().min(self.limits.snap_len as usize)];
        self.records.push_back(TraceRecord {
            timestamp_micros,
            bytes: captured.to_vec(),
            original_len: frame.len() as u32,
        });
        self.buffered_bytes += captured.len();
        self.shed();
    }

    fn shed(&mut self) {
        while self.records.len() > self.limits.max_records
            || self.buffered_bytes > self.limits.max_bytes
        {
            let Some(oldest) = self.records.pop_front() else {
                break;
            };
            self.buffered_bytes -= oldest.bytes.len();
            self.dropped_records += 1;
            self.dropped_bytes += oldest.bytes.len() as u64;
        }
    }

    pub fn stats(&self) -> TraceStats {
        TraceStats {
            enabled: self.enabled,
            records: self.records.len() as u64,
            bytes: self.buffered_bytes as u64,
            dropped_records: self.dropped_records,
            dropped_bytes: self.dropped_bytes,
        }
    }

    /// Serializes the capture without consuming it.
    pub fn export_pcapng(&self) -> Vec<u8> {
        let mut writer = PcapngWriter::new(self.limits.snap_len);
        for record in &self.records {
            writer.push_packet(record.timestamp_micros, &record.bytes, record.original_len);
        }
        writer.finish()
    }

    /// Serializes the capture, then clears buffered frames. Drop counters
    /// survive so the caller can still see how lossy the trace was.
    pub fn take_pcapng(&mut self) -> Vec<u8> {
        let out = self.export_pcapng();
        self.records.clear();
        self.buffered_bytes = 0;
        out
    }

    /// Full reset, drop counters included.
    pub fn clear(&mut self) {
        self.records.clear();
        self.buffered_bytes = 0;
        self.dropped_records = 0;
        self.dropped_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(bytes: &[u8], off: usize) -> u32 {
        u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
    }

    #[test]
    fn empty_section_has_shb_and_idb() {
        let bytes = PcapngWriter::new(65535).finish();
        assert_eq!(read_u32(&bytes, 0), BLOCK_TYPE_SHB);
        let shb_len = read_u32(&bytes, 4) as usize;
        // Trailing length mirrors the leading one.
        assert_eq!(read_u32(&bytes, shb_len - 4), shb_len as u32);
        assert_eq!(read_u32(&bytes, 8), BYTE_ORDER_MAGIC);
        assert_eq!(read_u32(&bytes, shb_len), BLOCK_TYPE_IDB);
        assert_eq!(bytes.len(), shb_len + read_u32(&bytes, shb_len + 4) as usize);
    }

    #[test]
    fn packets_are_padded_and_framed() {
        let mut w = PcapngWriter::new(65535);
        w.push_packet(0x0001_0002_0003_0004, &[0xAA; 5], 5);
        let bytes = w.finish();
        let shb_len = read_u32(&bytes, 4) as usize;
        let idb_len = read_u32(&bytes, shb_len + 4) as usize;
        let epb_off = shb_len + idb_len;
        assert_eq!(read_u32(&bytes, epb_off), BLOCK_TYPE_EPB);
        let epb_len = read_u32(&bytes, epb_off + 4) as usize;
        // 12 framing + 20 fixed fields + 5 data padded to 8.
        assert_eq!(epb_len, 12 + 20 + 8);
        assert_eq!(read_u32(&bytes, epb_off + 12), 0); // interface id
        assert_eq!(read_u32(&bytes, epb_off + 16), 0x0001_0002); // ts high
        assert_eq!(read_u32(&bytes, epb_off + 20), 0x0003_0004); // ts low
        assert_eq!(read_u32(&bytes, epb_off + 24), 5); // captured len
        assert_eq!(bytes.len(), epb_off + epb_len);
    }

    #[test]
    fn disabled_buffer_ignores_frames() {
        let mut buf = TraceBuffer::new(TraceLimits::default());
        buf.push_frame(0, &[1, 2, 3]);
        assert_eq!(buf.stats(), TraceStats::default());
    }

    #[test]
    fn sheds_oldest_and_accounts_for_drops() {
        let mut buf = TraceBuffer::new(TraceLimits { max_records: 2, max_bytes: 1024, snap_len: 64 });
        buf.set_enabled(true);
        buf.push_frame(1, &[0x11; 10]);
        buf.push_frame(2, &[0x22; 10]);
        buf.push_frame(3, &[0x33; 10]);

        let stats = buf.stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.bytes, 20);
        assert_eq!(stats.dropped_records, 1);
        assert_eq!(stats.dropped_bytes, 10);

        // The survivor set is the newest two frames.
        let pcap = buf.export_pcapng();
        assert!(!pcap.windows(10).any(|w| w == [0x11; 10]));
        assert!(pcap.windows(10).any(|w| w == [0x22; 10]));
        assert!(pcap.windows(10).any(|w| w == [0x33; 10]));
    }

    #[test]
    fn take_clears_frames_but_keeps_drop_counters() {
        let mut buf = TraceBuffer::new(TraceLimits { max_records: 1, max_bytes: 1024, snap_len: 64 });
        buf.set_enabled(true);
        buf.push_frame(1, &[1]);
        buf.push_frame(2, &[2]);
        let first = buf.take_pcapng();
        assert!(!first.is_empty());

        let stats = buf.stats();
        assert_eq!(stats.records, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.dropped_records, 1);

        buf.clear();
        assert_eq!(buf.stats().dropped_records, 0);
    }

    #[test]
    fn snap_len_truncates_but_keeps_original_len() {
        let mut buf = TraceBuffer::new(TraceLimits { max_records: 8, max_bytes: 1024, snap_len: 4 });
        buf.set_enabled(true);
        buf.push_frame(0, &[0xEE; 9]);
        assert_eq!(buf.stats().bytes, 4);
        let pcap = buf.export_pcapng();
        // captured len 4, original len 9 in the EPB fixed fields.
        let shb_len = read_u32(&pcap, 4) as usize;
        let idb_len = read_u32(&pcap, shb_len + 4) as usize;
        let epb_off = shb_len + idb_len;
        assert_eq!(read_u32(&pcap, epb_off + 24), 4);
        assert_eq!(read_u32(&pcap, epb_off + 28), 9);
    }
}
