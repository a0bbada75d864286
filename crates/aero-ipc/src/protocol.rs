//! Typed records carried in ring payloads between the supervisor and a
//! worker.
//!
//! Commands flow supervisor -> worker over the CMD queue; events flow back
//! over the EVT queue. The encoding is a tag byte followed by fixed-width
//! little-endian fields; variable-length data is a `u32` length prefix plus
//! bytes. Unknown tags decode to an error, never a panic, so a stale worker
//! build can be shut down safely.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nop { seq: u32 },
    Shutdown,
    MmioRead { id: u32, addr: u64, size: u32 },
    MmioWrite { id: u32, addr: u64, data: Vec<u8> },
    PortRead { id: u32, port: u16, size: u8 },
    PortWrite { id: u32, port: u16, size: u8, value: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Ack { seq: u32 },
    MmioReadResp { id: u32, data: Vec<u8> },
    MmioWriteResp { id: u32 },
    PortReadResp { id: u32, value: u32 },
    PortWriteResp { id: u32 },
    FrameReady { frame_id: u64 },
    IrqRaise { irq: u8 },
    IrqLower { irq: u8 },
    A20Set { enabled: bool },
    ResetRequest,
    Log { level: LogLevel, message: String },
    SerialOutput { port: u16, data: Vec<u8> },
    Panic { message: String },
    TripleFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownTag,
    Truncated,
    BadPayload,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTag => f.write_str("unknown record tag"),
            Self::Truncated => f.write_str("truncated record"),
            Self::BadPayload => f.write_str("malformed record payload"),
        }
    }
}

impl std::error::Error for DecodeError {}

mod tag {
    pub const CMD_NOP: u8 = 0x01;
    pub const CMD_SHUTDOWN: u8 = 0x02;
    pub const CMD_MMIO_READ: u8 = 0x03;
    pub const CMD_MMIO_WRITE: u8 = 0x04;
    pub const CMD_PORT_READ: u8 = 0x05;
    pub const CMD_PORT_WRITE: u8 = 0x06;

    pub const EVT_ACK: u8 = 0x41;
    pub const EVT_MMIO_READ_RESP: u8 = 0x42;
    pub const EVT_MMIO_WRITE_RESP: u8 = 0x43;
    pub const EVT_PORT_READ_RESP: u8 = 0x44;
    pub const EVT_PORT_WRITE_RESP: u8 = 0x45;
    pub const EVT_FRAME_READY: u8 = 0x46;
    pub const EVT_IRQ_RAISE: u8 = 0x47;
    pub const EVT_IRQ_LOWER: u8 = 0x48;
    pub const EVT_A20_SET: u8 = 0x49;
    pub const EVT_RESET_REQUEST: u8 = 0x4A;
    pub const EVT_LOG: u8 = 0x4B;
    pub const EVT_SERIAL_OUTPUT: u8 = 0x4C;
    pub const EVT_PANIC: u8 = 0x4D;
    pub const EVT_TRIPLE_FAULT: u8 = 0x4E;
}

struct Writer(Vec<u8>);

impl Writer {
    fn new(tag: u8) -> Self {
        Self(vec![tag])
    }
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.bytes()?).map_err(|_| DecodeError::BadPayload)
    }
    fn finish(self) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DecodeError::BadPayload)
        }
    }
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    match cmd {
        Command::Nop { seq } => {
            let mut w = Writer::new(tag::CMD_NOP);
            w.u32(*seq);
            w.0
        }
        Command::Shutdown => Writer::new(tag::CMD_SHUTDOWN).0,
        Command::MmioRead { id, addr, size } => {
            let mut w = Writer::new(tag::CMD_MMIO_READ);
            w.u32(*id);
            w.u64(*addr);
            w.u32(*size);
            w.0
        }
        Command::MmioWrite { id, addr, data } => {
            let mut w = Writer::new(tag::CMD_MMIO_WRITE);
            w.u32(*id);
            w.u64(*addr);
            w.bytes(data);
            w.0
        }
        Command::PortRead { id, port, size } => {
            let mut w = Writer::new(tag::CMD_PORT_READ);
            w.u32(*id);
            w.u16(*port);
            w.u8(*size);
            w.0
        }
        Command::PortWrite { id, port, size, value } => {
            let mut w = Writer::new(tag::CMD_PORT_WRITE);
            w.u32(*id);
            w.u16(*port);
            w.u8(*size);
            w.u32(*value);
            w.0
        }
    }
}

pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    let cmd = match tag {
        tag::CMD_NOP => Command::Nop { seq: r.u32()? },
        tag::CMD_SHUTDOWN => Command::Shutdown,
        tag::CMD_MMIO_READ => Command::MmioRead { id: r.u32()?, addr: r.u64()?, size: r.u32()? },
        tag::CMD_MMIO_WRITE => Command::MmioWrite { id: r.u32()?, addr: r.u64()?, data: r.bytes()? },
        tag::CMD_PORT_READ => Command::PortRead { id: r.u32()?, port: r.u16()?, size: r.u8()? },
        tag::CMD_PORT_WRITE => Command::PortWrite {
            id: r.u32()?,
            port: r.u16()?,
            size: r.u8()?,
            value: r.u32()?,
        },
        _ => return Err(DecodeError::UnknownTag),
    };
    r.finish()?;
    Ok(cmd)
}

fn log_level_to_u8(level: LogLevel) -> u8 {
    match level {
        LogLevel::Error => 0,
        LogLevel::Warn => 1,
        LogLevel::Info => 2,
        LogLevel::Debug => 3,
    }
}

fn log_level_from_u8(v: u8) -> Result<LogLevel, DecodeError> {
    Ok(match v {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        _ => return Err(DecodeError::BadPayload),
    })
}

pub fn encode_event(evt: &Event) -> Vec<u8> {
    match evt {
        Event::Ack { seq } => {
            let mut w = Writer::new(tag::EVT_ACK);
            w.u32(*seq);
            w.0
        }
        Event::MmioReadResp { id, data } => {
            let mut w = Writer::new(tag::EVT_MMIO_READ_RESP);
            w.u32(*id);
            w.bytes(data);
            w.0
        }
        Event::MmioWriteResp { id } => {
            let mut w = Writer::new(tag::EVT_MMIO_WRITE_RESP);
            w.u32(*id);
            w.0
        }
        Event::PortReadResp { id, value } => {
            let mut w = Writer::new(tag::EVT_PORT_READ_RESP);
            w.u32(*id);
            w.u32(*value);
            w.0
        }
        Event::PortWriteResp { id } => {
            let mut w = Writer::new(tag::EVT_PORT_WRITE_RESP);
            w.u32(*id);
            w.0
        }
        Event::FrameReady { frame_id } => {
            let mut w = Writer::new(tag::EVT_FRAME_READY);
            w.u64(*frame_id);
            w.0
        }
        Event::IrqRaise { irq } => {
            let mut w = Writer::new(tag::EVT_IRQ_RAISE);
            w.u8(*irq);
            w.0
        }
        Event::IrqLower { irq } => {
            let mut w = Writer::new(tag::EVT_IRQ_LOWER);
            w.u8(*irq);
            w.0
        }
        Event::A20Set { enabled } => {
            let mut w = Writer::new(tag::EVT_A20_SET);
            w.u8(u8::from(*enabled));
            w.0
        }
        Event::ResetRequest => Writer::new(tag::EVT_RESET_REQUEST).0,
        Event::Log { level, message } => {
            let mut w = Writer::new(tag::EVT_LOG);
            w.u8(log_level_to_u8(*level));
            w.bytes(message.as_bytes());
            w.0
        }
        Event::SerialOutput { port, data } => {
            let mut w = Writer::new(tag::EVT_SERIAL_OUTPUT);
            w.u16(*port);
            w.bytes(data);
            w.0
        }
        Event::Panic { message } => {
            let mut w = Writer::new(tag::EVT_PANIC);
            w.bytes(message.as_bytes());
            w.0
        }
        Event::TripleFault => Writer::new(tag::EVT_TRIPLE_FAULT).0,
    }
}

pub fn decode_event(bytes: &[u8]) -> Result<Event, DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.u8()?;
    let evt = match tag {
        tag::EVT_ACK => Event::Ack { seq: r.u32()? },
        tag::EVT_MMIO_READ_RESP => Event::MmioReadResp { id: r.u32()?, data: r.bytes()? },
        tag::EVT_MMIO_WRITE_RESP => Event::MmioWriteResp { id: r.u32()? },
        tag::EVT_PORT_READ_RESP => Event::PortReadResp { id: r.u32()?, value: r.u32()? },
        tag::EVT_PORT_WRITE_RESP => Event::PortWriteResp { id: r.u32()? },
        tag::EVT_FRAME_READY => Event::FrameReady { frame_id: r.u64()? },
        tag::EVT_IRQ_RAISE => Event::IrqRaise { irq: r.u8()? },
        tag::EVT_IRQ_LOWER => Event::IrqLower { irq: r.u8()? },
        tag::EVT_A20_SET => Event::A20Set {
            enabled: match r.u8()? {
                0 => false,
                1 => true,
                _ => return Err(DecodeError::BadPayload),
            },
        },
        tag::EVT_RESET_REQUEST => Event::ResetRequest,
        tag::EVT_LOG => Event::Log { level: log_level_from_u8(r.u8()?)?, message: r.string()? },
        tag::EVT_SERIAL_OUTPUT => Event::SerialOutput { port: r.u16()?, data: r.bytes()? },
        tag::EVT_PANIC => Event::Panic { message: r.string()? },
        tag::EVT_TRIPLE_FAULT => Event::TripleFault,
        _ => return Err(DecodeError::UnknownTag),
    };
    r.finish()?;
    Ok(evt)
}
