//! zlib body compression.
//!
//! Inflation is driven by the number of compressed bytes still unread. The
//! inflater's "stream end" status is only consulted after the input has been
//! consumed and the pending output drained, to reject truncated bodies.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::error::{AggError, Result};

/// Consecutive calls without progress before inflation gives up.
pub const MAX_INFLATE_STALLS: u32 = 16;

/// Compress `data` into a zlib stream.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate a complete zlib stream, appending the output to `out`.
///
/// `scratch` is the fixed-size window each inflater call writes into.
/// Output beyond `max_output` bytes is rejected.
pub fn inflate_into(
    inflater: &mut Decompress,
    scratch: &mut [u8],
    input: &[u8],
    out: &mut Vec<u8>,
    max_output: usize,
) -> Result<()> {
    inflater.reset(true);

    let mut consumed = 0usize;
    let mut stalls = 0u32;
    let mut ended = false;

    loop {
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();

        let status = inflater
            .decompress(&input[consumed..], scratch, FlushDecompress::None)
            .map_err(|e| AggError::Decompression(e.to_string()))?;
        ended |= status == Status::StreamEnd;

        let read = (inflater.total_in() - before_in) as usize;
        let written = (inflater.total_out() - before_out) as usize;
        consumed += read;

        if written > 0 {
            if out.len() + written > max_output {
                return Err(AggError::CommandTooLarge {
                    size: out.len() + written,
                    max: max_output,
                });
            }
            out.extend_from_slice(&scratch[..written]);
        }

        let remaining = input.len() - consumed;
        if remaining == 0 && written < scratch.len() {
            break;
        }

        if read == 0 && written == 0 {
            stalls += 1;
            if stalls > MAX_INFLATE_STALLS {
                return Err(AggError::Decompression(format!(
                    "Inflater stalled with {} compressed bytes remaining",
                    remaining
                )));
            }
        } else {
            stalls = 0;
        }
    }

    if !ended {
        return Err(AggError::Decompression(
            "Compressed body ended before the zlib stream did".to_string(),
        ));
    }

    Ok(())
}
