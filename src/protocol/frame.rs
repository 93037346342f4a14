//! Frame struct and frame encoding.
//!
//! A [`Frame`] is one extracted binary envelope: the type byte plus the
//! (possibly compressed) body. [`FrameEncoder`] goes the other way, turning
//! command content into wire bytes for the negotiated protocol version.
//!
//! # Example
//!
//! ```
//! use aggwire_client::protocol::{build_frame, type_flags, START_BYTE};
//!
//! let bytes = build_frame(type_flags::PLAIN, b"R\x171\x17A");
//! assert_eq!(bytes[0], START_BYTE);
//! assert_eq!(&bytes[1..5], &7u32.to_be_bytes());
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::compression::deflate;
use super::wire_format::{type_flags, FrameHeader, END_BYTE, HEADER_SIZE, START_BYTE};
use crate::config::{ProtocolConfig, ProtocolVersion};
use crate::error::Result;

/// A complete binary frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub type_byte: u8,
    /// Body bytes after the type byte (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    pub fn new(type_byte: u8, body: Bytes) -> Self {
        Self { type_byte, body }
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        type_flags::has_flag(self.type_byte, type_flags::COMPRESSED)
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Wire size including start byte, length and type byte.
    #[inline]
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + 1 + self.body.len()
    }
}

/// Build a binary frame from a type byte and body.
pub fn build_frame(type_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 1 + body.len());
    buf.push(START_BYTE);
    buf.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
    buf.push(type_byte);
    buf.extend_from_slice(body);
    buf
}

/// Build a legacy delimited frame.
pub fn build_delimited_frame(content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(content.len() + 2);
    buf.push(START_BYTE);
    buf.extend_from_slice(content);
    buf.push(END_BYTE);
    buf
}

/// Encodes command content into frames for one connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    version: ProtocolVersion,
    compression: bool,
    compression_threshold: usize,
}

impl FrameEncoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            compression: false,
            compression_threshold: usize::MAX,
        }
    }

    pub fn from_config(version: ProtocolVersion, config: &ProtocolConfig) -> Self {
        Self {
            version,
            compression: config.compression,
            compression_threshold: config.compression_threshold,
        }
    }

    pub fn with_compression(mut self, threshold: usize) -> Self {
        self.compression = true;
        self.compression_threshold = threshold;
        self
    }

    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Frame `content`. Binary frames are compressed when enabled, large
    /// enough, and the zlib stream actually comes out smaller.
    pub fn encode(&self, content: &[u8]) -> Result<Bytes> {
        if !self.version.is_binary() {
            return Ok(Bytes::from(build_delimited_frame(content)));
        }

        if self.compression && content.len() >= self.compression_threshold {
            let compressed = deflate(content)?;
            if compressed.len() < content.len() {
                return encode_binary(type_flags::COMPRESSED, &compressed);
            }
        }
        encode_binary(type_flags::PLAIN, content)
    }
}

fn encode_binary(type_byte: u8, body: &[u8]) -> Result<Bytes> {
    let header = FrameHeader::for_body(body.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 1 + body.len());
    buf.put_slice(&header.encode());
    buf.put_u8(type_byte);
    buf.put_slice(body);
    Ok(buf.freeze())
}
