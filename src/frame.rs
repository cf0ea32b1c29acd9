use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

/// Size of every frame on the wire. The link exchanges exactly one frame of this
///  size per tick, in both directions.
pub const FRAME_LEN: usize = 32;

/// Header bytes before the payload: magic, checksum, opcode, bits.
pub const HEADER_LEN: usize = 4;

/// Maximum payload per frame; longer messages are split across frames.
pub const MAX_PAYLOAD_LEN: usize = FRAME_LEN - HEADER_LEN;

/// First byte of every frame. A mismatch is treated like any other corruption.
pub const MAGIC: u8 = 0x7E;

/// Opcode 0 is reserved for flow control / keepalive frames and cannot be
///  registered as a command.
pub const FLOW_CONTROL_OPCODE: u8 = 0;

const OFFSET_MAGIC: usize = 0;
const OFFSET_CHECKSUM: usize = 1;
const OFFSET_OPCODE: usize = 2;
const OFFSET_BITS: usize = 3;

const BIT_MORE: u8 = 0x80;
const BIT_PHASE: u8 = 0x40;
const BIT_DIR: u8 = 0x20;
const MASK_LENGTH: u8 = 0x1F;

/// The two halves of one command exchange. Stored in the `dir` bit of the frame
///  header.
#[derive(TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Response = 1,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Request => Direction::Response,
            Direction::Response => Direction::Request,
        }
    }
}

/// One fixed 32-byte transport unit:
///
/// ```ascii
/// 0:     magic    (1 byte, 0x7E)
/// 1:     checksum (1 byte)
/// 2:     opcode   (1 byte; 0 reserved for flow control)
/// 3:     bits     (more: bit 7, phase: bit 6, dir: bit 5, length: bits 0-4)
/// 4..31: payload  (28 bytes, meaningful only in [0, length))
/// ```
///
/// The checksum covers bytes 2..32, interpreted as 15 little-endian 16-bit words.
///  The byte order is fixed here rather than inherited from the host - the two
///  processors sharing the link are different architectures.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; FRAME_LEN],
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("opcode", &self.opcode())
            .field("more", &self.more())
            .field("phase", &self.phase())
            .field("dir", &self.dir())
            .field("length", &self.length())
            .finish()
    }
}

impl Frame {
    /// Create a sealed frame for the given payload. Fails if the payload does not
    ///  fit into a single frame - splitting across frames is the caller's job.
    pub fn new(opcode: u8, dir: Direction, payload: &[u8]) -> anyhow::Result<Frame> {
        if payload.len() > MAX_PAYLOAD_LEN {
            bail!("payload of {} bytes exceeds the frame payload limit of {}", payload.len(), MAX_PAYLOAD_LEN);
        }

        let mut bytes = [0u8; FRAME_LEN];
        bytes[OFFSET_MAGIC] = MAGIC;
        bytes[OFFSET_OPCODE] = opcode;
        bytes[OFFSET_BITS] = ((dir as u8) << 5) | (payload.len() as u8 & MASK_LENGTH);
        bytes[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);

        let mut frame = Frame { bytes };
        frame.seal();
        Ok(frame)
    }

    /// Reinterpret raw bytes from the driver as a frame, without validating them -
    ///  validation is a separate, explicit step on the receive path.
    pub fn from_wire(bytes: [u8; FRAME_LEN]) -> Frame {
        Frame { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.bytes
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[OFFSET_OPCODE]
    }

    pub fn more(&self) -> bool {
        self.bytes[OFFSET_BITS] & BIT_MORE != 0
    }

    pub fn set_more(&mut self, more: bool) {
        if more {
            self.bytes[OFFSET_BITS] |= BIT_MORE;
        }
        else {
            self.bytes[OFFSET_BITS] &= !BIT_MORE;
        }
        self.seal();
    }

    pub fn phase(&self) -> bool {
        self.bytes[OFFSET_BITS] & BIT_PHASE != 0
    }

    /// Stamp the phase bit and reseal. This is the last mutation before a frame
    ///  goes on the wire.
    pub fn set_phase(&mut self, phase: bool) {
        if phase {
            self.bytes[OFFSET_BITS] |= BIT_PHASE;
        }
        else {
            self.bytes[OFFSET_BITS] &= !BIT_PHASE;
        }
        self.seal();
    }

    pub fn dir(&self) -> Direction {
        if self.bytes[OFFSET_BITS] & BIT_DIR != 0 {
            Direction::Response
        }
        else {
            Direction::Request
        }
    }

    pub fn length(&self) -> usize {
        (self.bytes[OFFSET_BITS] & MASK_LENGTH) as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..HEADER_LEN + self.length()]
    }

    fn seal(&mut self) {
        self.bytes[OFFSET_CHECKSUM] = checksum(&self.bytes[OFFSET_OPCODE..]);
    }

    /// Validate magic, length and checksum. Any failure is corruption and must
    ///  reset the link - a frame is never partially accepted.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bytes[OFFSET_MAGIC] != MAGIC {
            bail!("bad magic byte {:#04x}", self.bytes[OFFSET_MAGIC]);
        }
        if self.length() > MAX_PAYLOAD_LEN {
            bail!("declared payload length {} exceeds the limit of {}", self.length(), MAX_PAYLOAD_LEN);
        }
        let expected = checksum(&self.bytes[OFFSET_OPCODE..]);
        if self.bytes[OFFSET_CHECKSUM] != expected {
            bail!("checksum mismatch: stored {:#04x}, computed {:#04x}", self.bytes[OFFSET_CHECKSUM], expected);
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.bytes);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        if buf.remaining() < FRAME_LEN {
            bail!("truncated frame: {} of {} bytes", buf.remaining(), FRAME_LEN);
        }
        let mut bytes = [0u8; FRAME_LEN];
        buf.copy_to_slice(&mut bytes);
        Ok(Frame { bytes })
    }
}

/// Checksum over the 30 covered bytes (everything except magic and the checksum
///  itself): per little-endian word, accumulate `word * 0xAC4F` and fold the high
///  byte into the low byte. The stored checksum is the low byte of the folded
///  accumulator.
pub fn checksum(covered: &[u8]) -> u8 {
    debug_assert_eq!(covered.len(), FRAME_LEN - OFFSET_OPCODE);

    let mut acc: u16 = 0;
    for chunk in covered.chunks_exact(2) {
        let word = u16::from_le_bytes([chunk[0], chunk[1]]);
        acc = acc.wrapping_add(word.wrapping_mul(0xAC4F));
        acc ^= acc >> 8;
    }
    acc as u8
}
