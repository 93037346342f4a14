//! Reusable scratch resources for the decode hot path.
//!
//! A [`ScratchPool`] is owned by exactly one decoder (one connection read
//! task), so nothing in it is shared or locked:
//! - a fixed 1 KB window the inflater writes into
//! - a reusable zlib inflater
//! - a growable output stream that keeps its capacity between commands
//!
//! # Usage
//!
//! ```ignore
//! use aggwire_client::protocol::ScratchPool;
//!
//! let mut pool = ScratchPool::new(metrics);
//! let content = pool.inflate(&compressed_body, max_command_size)?;
//! ```

use std::sync::Arc;

use bytes::Bytes;
use flate2::Decompress;

use super::compression::inflate_into;
use crate::error::Result;
use crate::metrics::ProtocolMetrics;

/// Size of the inflate window.
pub const INFLATE_SCRATCH_SIZE: usize = 1024;

/// Smallest capacity a freshly created output stream gets.
pub const MIN_STREAM_CAPACITY: usize = 4096;

/// Streams larger than this are dropped after use instead of kept.
pub const MAX_RETAINED_STREAM: usize = 16 * 1024 * 1024;

pub struct ScratchPool {
    scratch: Box<[u8; INFLATE_SCRATCH_SIZE]>,
    inflater: Decompress,
    stream: Vec<u8>,
    metrics: Arc<ProtocolMetrics>,
}

impl ScratchPool {
    pub fn new(metrics: Arc<ProtocolMetrics>) -> Self {
        Self {
            scratch: Box::new([0u8; INFLATE_SCRATCH_SIZE]),
            inflater: Decompress::new(true),
            stream: Vec::new(),
            metrics,
        }
    }

    /// Hand out the output stream, emptied, with at least `min_capacity`.
    ///
    /// The existing stream is reused when it is large enough; otherwise it is
    /// replaced by one of `max(2 * min_capacity, MIN_STREAM_CAPACITY)`.
    pub fn acquire_stream(&mut self, min_capacity: usize) -> &mut Vec<u8> {
        self.stream.clear();
        let created = self.stream.capacity() < min_capacity;
        if created {
            self.stream = Vec::with_capacity((min_capacity * 2).max(MIN_STREAM_CAPACITY));
        }
        self.metrics.record_stream_acquired(created);
        &mut self.stream
    }

    /// Inflate a zlib body into a fresh `Bytes`, reusing the pooled stream.
    pub fn inflate(&mut self, body: &[u8], max_output: usize) -> Result<Bytes> {
        self.acquire_stream(body.len().saturating_mul(2));

        let result = inflate_into(
            &mut self.inflater,
            &mut self.scratch[..],
            body,
            &mut self.stream,
            max_output,
        );
        let content = result.map(|()| Bytes::copy_from_slice(&self.stream));
        self.release_stream();
        content
    }

    fn release_stream(&mut self) {
        if self.stream.capacity() > MAX_RETAINED_STREAM {
            self.stream = Vec::new();
        } else {
            self.stream.clear();
        }
    }

    /// Current retained capacity of the output stream.
    #[inline]
    pub fn stream_capacity(&self) -> usize {
        self.stream.capacity()
    }
}

impl std::fmt::Debug for ScratchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchPool")
            .field("stream_capacity", &self.stream.capacity())
            .finish()
    }
}
