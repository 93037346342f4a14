//! Protocol module - wire format, framing and compression.
//!
//! This module implements the frame codec:
//! - binary length-prefixed frames with a compression type byte
//! - legacy delimited frames
//! - a decoder state machine for partial reads
//! - zlib inflate/deflate with a reusable scratch pool

pub mod compression;
mod frame;
mod frame_buffer;
mod scratch_pool;
mod wire_format;

pub use frame::{build_delimited_frame, build_frame, Frame, FrameEncoder};
pub use frame_buffer::FrameDecoder;
pub use scratch_pool::{ScratchPool, INFLATE_SCRATCH_SIZE};
pub use wire_format::{type_flags, FrameHeader, END_BYTE, HEADER_SIZE, LENGTH_SIZE, START_BYTE};
