//! Frame decoder for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management and a state machine for
//! fragmented frames:
//! - `WaitingForStart`: need the start byte
//! - `ReadingLength`: start consumed, need the 4-byte length
//! - `ReadingBody`: length validated, need type byte plus body
//! - `ReadingDelimited`: legacy framing, need the end byte
//!
//! The declared length is checked against the maximum command size as soon
//! as it is read, so an oversized claim never causes an allocation.
//!
//! # Example
//!
//! ```ignore
//! use aggwire_client::protocol::FrameDecoder;
//!
//! let mut decoder = FrameDecoder::new(ProtocolVersion::V3, &config, metrics);
//!
//! // Data arrives in chunks from the socket
//! for command in decoder.push(&chunk)? {
//!     println!("Got command {:?}", command.params());
//! }
//! ```

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use super::frame::Frame;
use super::scratch_pool::ScratchPool;
use super::wire_format::{FrameHeader, END_BYTE, LENGTH_SIZE, START_BYTE};
use crate::command::Command;
use crate::config::{ProtocolConfig, ProtocolVersion};
use crate::error::{AggError, Result};
use crate::metrics::ProtocolMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForStart,
    ReadingLength,
    ReadingBody { header: FrameHeader },
    ReadingDelimited,
}

/// Turns a byte stream into decoded commands.
///
/// One decoder per connection read task. After an error the decoder is
/// cleared; the connection decides whether to keep reading.
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    version: ProtocolVersion,
    max_command_size: usize,
    large_data_size: usize,
    pool: ScratchPool,
    metrics: Arc<ProtocolMetrics>,
}

impl FrameDecoder {
    pub fn new(
        version: ProtocolVersion,
        config: &ProtocolConfig,
        metrics: Arc<ProtocolMetrics>,
    ) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForStart,
            version,
            max_command_size: config.max_command_size,
            large_data_size: config.large_data_size,
            pool: ScratchPool::new(metrics.clone()),
            metrics,
        }
    }

    /// Decoder with default limits and private metrics.
    pub fn with_defaults(version: ProtocolVersion) -> Self {
        Self::new(
            version,
            &ProtocolConfig::default(),
            Arc::new(ProtocolMetrics::new()),
        )
    }

    /// Push data into the buffer and decode all complete commands.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Protocol errors (bad start byte, oversize length, zero-length command,
    /// decompression failure). Commands decoded before the error in the same
    /// push are discarded together with the buffer.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Command>> {
        self.buffer.extend_from_slice(data);

        let mut commands = Vec::new();
        while let Some(command) = self.decode_one()? {
            commands.push(command);
        }
        Ok(commands)
    }

    /// Decode one command from buffered data.
    ///
    /// Returns:
    /// - `Ok(Some(command))` if a complete command was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn decode_one(&mut self) -> Result<Option<Command>> {
        let result = self.try_decode_one();
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn try_decode_one(&mut self) -> Result<Option<Command>> {
        loop {
            match self.state {
                State::WaitingForStart => {
                    let Some(&first) = self.buffer.first() else {
                        return Ok(None);
                    };
                    if first != START_BYTE {
                        return Err(AggError::Protocol(format!(
                            "Expected start byte, got 0x{:02X}",
                            first
                        )));
                    }
                    self.buffer.advance(1);
                    self.state = if self.version.is_binary() {
                        State::ReadingLength
                    } else {
                        State::ReadingDelimited
                    };
                }

                State::ReadingLength => {
                    if self.buffer.len() < LENGTH_SIZE {
                        return Ok(None);
                    }
                    let length = self.buffer.get_u32();
                    let header = FrameHeader::new(length);
                    if let Err(e) = header.validate(self.max_command_size) {
                        if matches!(e, AggError::CommandTooLarge { .. }) {
                            self.metrics.record_oversized();
                        }
                        return Err(e);
                    }
                    self.state = State::ReadingBody { header };
                }

                State::ReadingBody { header } => {
                    let length = header.length as usize;
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let mut raw = self.buffer.split_to(length).freeze();
                    let type_byte = raw.get_u8();
                    self.state = State::WaitingForStart;

                    let frame = Frame::new(type_byte, raw);
                    return self.decode_frame(frame).map(Some);
                }

                State::ReadingDelimited => {
                    let Some(end) = self.buffer.iter().position(|&b| b == END_BYTE) else {
                        if self.buffer.len() > self.max_command_size {
                            self.metrics.record_oversized();
                            return Err(AggError::CommandTooLarge {
                                size: self.buffer.len(),
                                max: self.max_command_size,
                            });
                        }
                        return Ok(None);
                    };
                    let content = self.buffer.split_to(end).freeze();
                    self.buffer.advance(1);
                    self.state = State::WaitingForStart;
                    return self.decode_content(content).map(Some);
                }
            }
        }
    }

    fn decode_frame(&mut self, frame: Frame) -> Result<Command> {
        let content = if frame.is_compressed() {
            self.pool.inflate(frame.body(), self.max_command_size)?
        } else {
            frame.body
        };
        self.decode_content(content)
    }

    fn decode_content(&mut self, content: Bytes) -> Result<Command> {
        if content.is_empty() {
            return Err(AggError::ZeroLengthCommand);
        }
        self.metrics.record_command(content.len());
        let command = Command::decode_with(&content, self.large_data_size)?;
        if command.is_json() {
            self.metrics.record_json_command();
        }
        Ok(command)
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered data and reset to waiting for a start byte.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForStart;
    }

    pub fn metrics(&self) -> &Arc<ProtocolMetrics> {
        &self.metrics
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForStart => "WaitingForStart",
            State::ReadingLength => "ReadingLength",
            State::ReadingBody { .. } => "ReadingBody",
            State::ReadingDelimited => "ReadingDelimited",
        }
    }

    #[cfg(test)]
    fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("version", &self.version)
            .finish()
    }
}
