//! Wire format constants and the binary frame header.
//!
//! Binary framing (protocol V3 and later):
//! ```text
//! ┌───────┬──────────┬───────────┬──────────────────┐
//! │ Start │ Length   │ Type byte │ Body             │
//! │ 0x02  │ uint32 BE│ 1 byte    │ Length - 1 bytes │
//! └───────┴──────────┴───────────┴──────────────────┘
//! ```
//!
//! `Length` counts the type byte plus the body. Legacy V2 framing wraps the
//! command content between [`START_BYTE`] and [`END_BYTE`] instead.

use crate::error::{AggError, Result};

/// First byte of every frame.
pub const START_BYTE: u8 = 0x02;

/// Terminates a legacy delimited frame.
pub const END_BYTE: u8 = 0x0D;

/// Size of the big-endian length field.
pub const LENGTH_SIZE: usize = 4;

/// Start byte plus length field.
pub const HEADER_SIZE: usize = 1 + LENGTH_SIZE;

/// Type byte flag constants.
pub mod type_flags {
    /// Body is a zlib stream.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Plain body.
    pub const PLAIN: u8 = 0;

    #[inline]
    pub fn has_flag(type_byte: u8, flag: u8) -> bool {
        type_byte & flag != 0
    }
}

/// Decoded binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Byte count of type byte plus body.
    pub length: u32,
}

impl FrameHeader {
    pub fn new(length: u32) -> Self {
        Self { length }
    }

    /// Header for a frame carrying `body_len` body bytes.
    pub fn for_body(body_len: usize) -> Result<Self> {
        let length = u32::try_from(body_len + 1).map_err(|_| AggError::CommandTooLarge {
            size: body_len,
            max: u32::MAX as usize - 1,
        })?;
        Ok(Self { length })
    }

    /// Number of body bytes after the type byte.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }

    /// # Example
    ///
    /// ```
    /// use aggwire_client::protocol::{FrameHeader, START_BYTE};
    ///
    /// let bytes = FrameHeader::new(6).encode();
    /// assert_eq!(bytes, [START_BYTE, 0, 0, 0, 6]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = START_BYTE;
        buf[1..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes.
    ///
    /// Returns `Ok(None)` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        if buf[0] != START_BYTE {
            return Err(AggError::Protocol(format!(
                "Invalid frame start byte 0x{:02X}",
                buf[0]
            )));
        }
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Some(Self { length }))
    }

    /// Checks the declared length against `max_command_size`.
    ///
    /// A length of zero cannot even hold the type byte.
    pub fn validate(&self, max_command_size: usize) -> Result<()> {
        if self.length == 0 {
            return Err(AggError::Protocol(
                "Frame length must include the type byte".to_string(),
            ));
        }
        if self.body_len() > max_command_size {
            return Err(AggError::CommandTooLarge {
                size: self.body_len(),
                max: max_command_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let header = FrameHeader::new(0x0102_0304);
        let bytes = header.encode();
        assert_eq!(bytes, [START_BYTE, 1, 2, 3, 4]);
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), Some(header));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert_eq!(FrameHeader::decode(&[START_BYTE, 0, 0]).unwrap(), None);
    }

    #[test]
    fn test_decode_bad_start_byte() {
        let err = FrameHeader::decode(&[0x7F, 0, 0, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("start byte"));
    }

    #[test]
    fn test_validate_limits() {
        assert!(FrameHeader::new(0).validate(100).is_err());
        assert!(FrameHeader::new(1).validate(100).is_ok());
        assert!(FrameHeader::new(101).validate(100).is_ok());
        let err = FrameHeader::new(102).validate(100).unwrap_err();
        assert!(matches!(err, AggError::CommandTooLarge { size: 101, max: 100 }));
    }

    #[test]
    fn test_for_body() {
        let header = FrameHeader::for_body(10).unwrap();
        assert_eq!(header.length, 11);
        assert_eq!(header.body_len(), 10);
    }

    #[test]
    fn test_type_flags() {
        assert!(type_flags::has_flag(0x01, type_flags::COMPRESSED));
        assert!(type_flags::has_flag(0x03, type_flags::COMPRESSED));
        assert!(!type_flags::has_flag(type_flags::PLAIN, type_flags::COMPRESSED));
    }
}
