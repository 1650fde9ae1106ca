//! Upgrade bootloader frame codec.
//!
//! The bootloader speaks on three standard identifiers. Commands and
//! responses are two little-endian `u32` words; firmware bytes travel raw.
//!
//! ```text
//! ID 0x101 (host -> board)     ID 0x102 (board -> host)    ID 0x103 (host -> board)
//! +----------+-----------+     +----------+-----------+    +------------------+
//! |  opcode  | parameter |     |   code   |   value   |    | 1..=8 image bytes|
//! +----------+-----------+     +----------+-----------+    +------------------+
//! |  u32 LE  |  u32 LE   |     |  u32 LE  |  u32 LE   |
//! +----------+-----------+     +----------+-----------+
//! ```
//!
//! Data frames carry no offset: the board counts bytes itself and, every
//! time its 64-byte write window is programmed, answers with the number of
//! bytes written so far. A chunk request therefore remembers the offset it
//! starts at, and the engine matches the board's answer against
//! [`DataChunk::end_offset`].
//!
//! Everything here is stateless.

use {
    crate::{
        error::{Error, Result},
        protocol::frame::{CAN_MAX_DLEN, CanFrame},
    },
    byteorder::{ByteOrder, LittleEndian},
    std::fmt,
};

/// Host-to-board command identifier.
pub const COMMAND_ID: u16 = 0x101;

/// Board-to-host response identifier.
pub const RESPONSE_ID: u16 = 0x102;

/// Host-to-board firmware data identifier.
pub const DATA_ID: u16 = 0x103;

/// Size of the board's flash write buffer; one offset ack per window.
pub const BOARD_WRITE_WINDOW: usize = 64;

/// Value returned with a successful confirm.
pub const CONFIRM_MAGIC: u32 = 0x55AA_55AA;

/// Board response codes.
///
/// Codes are opaque on the wire; these are the ones the bootloader is
/// known to send.
pub mod code {
    /// Bytes written so far.
    pub const OFFSET: u32 = 0;
    /// Last window written, value is the total.
    pub const UPDATE_SUCCESS: u32 = 1;
    /// Bootloader version in the value.
    pub const VERSION: u32 = 2;
    /// Confirm accepted, value is [`super::CONFIRM_MAGIC`].
    pub const CONFIRM: u32 = 3;
    /// Erase, program or verify failed.
    pub const FLASH_ERROR: u32 = 4;
    /// Transfer failed.
    pub const TRANSFER_ERROR: u32 = 5;
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// Erase application flash and start receiving an image.
    StartUpdate = 0,
    /// Validate the written image.
    Confirm = 1,
    /// Query bootloader version.
    Version = 2,
    /// Reset the board.
    Reboot = 3,
}

impl Opcode {
    /// Parse a raw opcode.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::StartUpdate),
            1 => Some(Self::Confirm),
            2 => Some(Self::Version),
            3 => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// A decoded host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Erase enough flash for `size` bytes.
    StartUpdate {
        /// Image size in bytes.
        size: u32,
    },
    /// Confirm the upload.
    Confirm {
        /// Keep the image only until the next reboot.
        test_mode: bool,
    },
    /// Version query.
    Version,
    /// Reboot.
    Reboot,
}

/// A decoded board response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Response code (see [`code`]).
    pub code: u32,
    /// Code-dependent value: offset, version or magic.
    pub value: u32,
}

impl Response {
    /// Whether this is an upload acknowledgement (offset or final success).
    pub fn is_upload_ack(&self) -> bool {
        self.code == code::OFFSET || self.code == code::UPDATE_SUCCESS
    }
}

/// Bootloader version as packed by the board: `0xMMmmpp00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BoardVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl From<u32> for BoardVersion {
    fn from(raw: u32) -> Self {
        let [major, minor, patch, _] = raw.to_be_bytes();
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl From<BoardVersion> for u32 {
    fn from(v: BoardVersion) -> Self {
        u32::from_be_bytes([v.major, v.minor, v.patch, 0])
    }
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One acknowledged unit of the upload: a slice of the image split into
/// data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    offset: u32,
    len: u32,
    frames: Vec<CanFrame>,
}

impl DataChunk {
    /// Offset of the first byte.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Number of image bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the chunk is empty (never true for encoded chunks).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset the board reports once the chunk is written.
    pub fn end_offset(&self) -> u32 {
        self.offset + self.len
    }

    /// Data frames, in transmit order.
    pub fn frames(&self) -> &[CanFrame] {
        &self.frames
    }
}

fn command_frame(opcode: Opcode, param: u32) -> CanFrame {
    let mut buf = [0u8; 8];
    LittleEndian::write_u32(&mut buf[0..4], opcode as u32);
    LittleEndian::write_u32(&mut buf[4..8], param);
    CanFrame::full(COMMAND_ID, buf)
}

/// Build the erase (start update) request.
pub fn encode_erase_request(total_size: u32) -> CanFrame {
    command_frame(Opcode::StartUpdate, total_size)
}

/// Build the confirm request. Test mode is parameter 0, normal is 1.
pub fn encode_confirm_request(test_mode: bool) -> CanFrame {
    command_frame(Opcode::Confirm, u32::from(!test_mode))
}

/// Build the version request.
pub fn encode_version_request() -> CanFrame {
    command_frame(Opcode::Version, 0)
}

/// Build the reboot request.
pub fn encode_reboot_request() -> CanFrame {
    command_frame(Opcode::Reboot, 0)
}

/// Build a single raw data frame.
pub fn encode_data_frame(bytes: &[u8]) -> Result<CanFrame> {
    if bytes.is_empty() {
        return Err(Error::InvalidChunk("empty data frame".into()));
    }
    CanFrame::new(DATA_ID, bytes)
}

/// Split an image slice starting at `offset` into data frames.
pub fn encode_data_chunk(offset: u32, bytes: &[u8]) -> Result<DataChunk> {
    if bytes.is_empty() {
        return Err(Error::InvalidChunk(format!("empty chunk at offset {offset}")));
    }
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| offset.checked_add(*len).is_some())
        .ok_or_else(|| {
            Error::InvalidChunk(format!(
                "{} bytes at offset {offset} overflow the 32-bit offset",
                bytes.len()
            ))
        })?;

    let frames = bytes
        .chunks(CAN_MAX_DLEN)
        .map(encode_data_frame)
        .collect::<Result<Vec<_>>>()?;

    Ok(DataChunk {
        offset,
        len,
        frames,
    })
}

/// Encode a board response (used by the virtual board).
pub fn encode_response(code: u32, value: u32) -> CanFrame {
    let mut buf = [0u8; 8];
    LittleEndian::write_u32(&mut buf[0..4], code);
    LittleEndian::write_u32(&mut buf[4..8], value);
    CanFrame::full(RESPONSE_ID, buf)
}

fn split_words(frame: &CanFrame, expected_id: u16) -> Result<(u32, u32)> {
    if frame.id() != expected_id {
        return Err(Error::MalformedFrame(format!(
            "unexpected identifier 0x{:03X}, expected 0x{expected_id:03X}",
            frame.id()
        )));
    }
    let payload = frame.payload();
    if payload.len() != 8 {
        return Err(Error::MalformedFrame(format!(
            "expected 8 bytes, got {}",
            payload.len()
        )));
    }
    Ok((
        LittleEndian::read_u32(&payload[0..4]),
        LittleEndian::read_u32(&payload[4..8]),
    ))
}

/// Parse a board response.
pub fn decode_response(frame: &CanFrame) -> Result<Response> {
    let (code, value) = split_words(frame, RESPONSE_ID)?;
    Ok(Response { code, value })
}

/// Parse a host command.
pub fn decode_command(frame: &CanFrame) -> Result<Command> {
    let (raw, param) = split_words(frame, COMMAND_ID)?;
    let opcode = Opcode::from_raw(raw)
        .ok_or_else(|| Error::MalformedFrame(format!("unknown opcode {raw}")))?;
    Ok(match opcode {
        Opcode::StartUpdate => Command::StartUpdate { size: param },
        Opcode::Confirm => Command::Confirm {
            test_mode: param == 0,
        },
        Opcode::Version => Command::Version,
        Opcode::Reboot => Command::Reboot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erase_request_layout() {
        let frame = encode_erase_request(4096);
        assert_eq!(frame.id(), COMMAND_ID);
        assert_eq!(frame.payload(), &[0, 0, 0, 0, 0x00, 0x10, 0, 0]);
    }

    #[test]
    fn test_confirm_request_test_mode_parameter() {
        assert_eq!(
            encode_confirm_request(false).payload(),
            &[1, 0, 0, 0, 1, 0, 0, 0]
        );
        assert_eq!(
            encode_confirm_request(true).payload(),
            &[1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_fixed_requests() {
        assert_eq!(
            encode_version_request().payload(),
            &[2, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            encode_reboot_request().payload(),
            &[3, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_data_chunk_splits_into_can_frames() {
        let bytes: Vec<u8> = (0..20).collect();
        let chunk = encode_data_chunk(64, &bytes).unwrap();
        assert_eq!(chunk.offset(), 64);
        assert_eq!(chunk.len(), 20);
        assert_eq!(chunk.end_offset(), 84);
        let lens: Vec<usize> = chunk.frames().iter().map(CanFrame::len).collect();
        assert_eq!(lens, vec![8, 8, 4]);
        assert!(chunk.frames().iter().all(|f| f.id() == DATA_ID));
        assert_eq!(chunk.frames()[2].payload(), &[16, 17, 18, 19]);
    }

    #[test]
    fn test_empty_chunk_rejected() {
        assert!(matches!(
            encode_data_chunk(0, &[]),
            Err(Error::InvalidChunk(_))
        ));
        assert!(encode_data_frame(&[]).is_err());
    }

    #[test]
    fn test_chunk_offset_overflow_rejected() {
        assert!(encode_data_chunk(u32::MAX, &[1]).is_err());
    }

    #[test]
    fn test_data_frame_limited_to_can_payload() {
        assert!(encode_data_frame(&[0; 8]).is_ok());
        assert!(encode_data_frame(&[0; 9]).is_err());
    }

    #[test]
    fn test_decode_response() {
        let frame = CanFrame::new(RESPONSE_ID, &[0, 0, 0, 0, 0x40, 0, 0, 0]).unwrap();
        let resp = decode_response(&frame).unwrap();
        assert_eq!(
            resp,
            Response {
                code: code::OFFSET,
                value: 64
            }
        );
        assert!(resp.is_upload_ack());
    }

    #[test]
    fn test_decode_response_keeps_unknown_code() {
        let frame = encode_response(0xDEAD, 7);
        let resp = decode_response(&frame).unwrap();
        assert_eq!(resp.code, 0xDEAD);
        assert_eq!(resp.value, 7);
        assert!(!resp.is_upload_ack());
    }

    #[test]
    fn test_decode_response_short_payload() {
        let frame = CanFrame::new(RESPONSE_ID, &[0, 0, 0]).unwrap();
        assert!(matches!(
            decode_response(&frame),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_response_wrong_id() {
        let frame = encode_version_request();
        assert!(decode_response(&frame).is_err());
    }

    #[test]
    fn test_decode_command() {
        assert_eq!(
            decode_command(&encode_erase_request(1000)).unwrap(),
            Command::StartUpdate { size: 1000 }
        );
        assert_eq!(
            decode_command(&encode_confirm_request(true)).unwrap(),
            Command::Confirm { test_mode: true }
        );
        assert_eq!(
            decode_command(&encode_reboot_request()).unwrap(),
            Command::Reboot
        );
    }

    #[test]
    fn test_decode_command_unknown_opcode() {
        let frame = CanFrame::new(COMMAND_ID, &[9, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(decode_command(&frame).is_err());
    }

    #[test]
    fn test_board_version_unpacking() {
        let version = BoardVersion::from(0x0102_0300);
        assert_eq!(
            version,
            BoardVersion {
                major: 1,
                minor: 2,
                patch: 3
            }
        );
        assert_eq!(version.to_string(), "v1.2.3");
        assert_eq!(u32::from(version), 0x0102_0300);
    }

    #[test]
    fn test_opcode_from_raw() {
        assert_eq!(Opcode::from_raw(0), Some(Opcode::StartUpdate));
        assert_eq!(Opcode::from_raw(3), Some(Opcode::Reboot));
        assert_eq!(Opcode::from_raw(4), None);
    }
}
