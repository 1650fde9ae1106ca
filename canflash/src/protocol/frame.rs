//! Classic CAN frame as seen by the upgrade protocol.

use crate::error::{Error, Result};
use std::fmt;

/// Maximum payload of a classic CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Largest 11-bit (standard) identifier.
pub const CAN_SFF_MASK: u16 = 0x7FF;

/// A classic CAN data frame with a standard identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanFrame {
    id: u16,
    len: u8,
    data: [u8; CAN_MAX_DLEN],
}

impl CanFrame {
    /// Create a frame, rejecting extended identifiers and oversized payloads.
    #[allow(clippy::cast_possible_truncation)] // len <= 8 checked above
    pub fn new(id: u16, payload: &[u8]) -> Result<Self> {
        if id > CAN_SFF_MASK {
            return Err(Error::MalformedFrame(format!(
                "identifier 0x{id:X} is not a standard CAN id"
            )));
        }
        if payload.len() > CAN_MAX_DLEN {
            return Err(Error::MalformedFrame(format!(
                "payload of {} bytes exceeds {CAN_MAX_DLEN}",
                payload.len()
            )));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    /// Frame with a full 8-byte payload on one of the protocol's fixed ids.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn full(id: u16, data: [u8; CAN_MAX_DLEN]) -> Self {
        Self {
            id: id & CAN_SFF_MASK,
            len: CAN_MAX_DLEN as u8,
            data,
        }
    }

    /// Frame identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Payload bytes (length = DLC).
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// Data length code.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether the frame carries no data.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame({self})")
    }
}

/// candump-style rendering: `101#0000000000100000`.
impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#", self.id)?;
        for b in self.payload() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_frame_keeps_payload() {
        let frame = CanFrame::new(0x103, &[1, 2, 3]).unwrap();
        assert_eq!(frame.id(), 0x103);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        assert!(CanFrame::new(0x103, &[0; 9]).is_err());
    }

    #[test]
    fn test_rejects_extended_id() {
        assert!(CanFrame::new(0x800, &[]).is_err());
        assert!(CanFrame::new(0x7FF, &[]).is_ok());
    }

    #[test]
    fn test_display_candump_style() {
        let frame = CanFrame::new(0x102, &[0x00, 0x10, 0xAB]).unwrap();
        assert_eq!(frame.to_string(), "102#0010AB");
        let empty = CanFrame::new(0x7, &[]).unwrap();
        assert_eq!(empty.to_string(), "007#");
    }
}
