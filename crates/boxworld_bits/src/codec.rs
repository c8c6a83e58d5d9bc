//! Run-length / literal compression for boolean arrays.
//!
//! Layout: a 4-byte little-endian logical length, then one-byte blocks.
//!
//! - `1vLLLLLL` is an RLE block: `v` repeated `LLLLLL` (1..=63) times.
//! - `0bbbbbbb` is a literal block: seven values packed MSB-first.
//!
//! Runs are only encoded as RLE once they are longer than seven values.
//! Existing payloads depend on that threshold, so it must not be tuned.

use derive_more::{Display, Error};
use tracing::{debug, instrument};

const HEADER_LEN: usize = 4;
const RLE_FLAG: u8 = 0b1000_0000;
const RLE_VALUE: u8 = 0b0100_0000;
const RLE_LEN_MASK: u8 = 0b0011_1111;
const RLE_MAX_RUN: usize = 63;
const LITERAL_WIDTH: usize = 7;

/// Compresses `bits` into the page wire format.
#[instrument(skip(bits), fields(len = bits.len()))]
pub fn compress(bits: &[bool]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + bits.len() / LITERAL_WIDTH + 1);
    out.extend_from_slice(&(bits.len() as u32).to_le_bytes());

    let mut pos = 0;
    while pos < bits.len() {
        let value = bits[pos];
        let run = bits[pos..]
            .iter()
            .take(RLE_MAX_RUN)
            .take_while(|&&b| b == value)
            .count();

        if run > LITERAL_WIDTH {
            let mut block = RLE_FLAG | run as u8;
            if value {
                block |= RLE_VALUE;
            }
            out.push(block);
            pos += run;
        } else {
            let chunk = &bits[pos..bits.len().min(pos + LITERAL_WIDTH)];
            let mut block = 0u8;
            for (offset, &bit) in chunk.iter().enumerate() {
                if bit {
                    block |= 1 << (LITERAL_WIDTH - 1 - offset);
                }
            }
            out.push(block);
            pos += chunk.len();
        }
    }

    debug!(compressed = out.len(), "Compressed bit array");
    out
}

/// Decompresses a page payload.
///
/// Returns `Ok(None)` for an empty payload so callers can tell "nothing
/// stored" from "stored empty array". Bytes left over after the declared
/// length has been produced are ignored.
///
/// # Errors
///
/// Returns [`CodecError`] when the header is cut short, the blocks end
/// before the declared length, or an RLE block has a zero length.
#[instrument(skip(bytes), fields(bytes = bytes.len()))]
pub fn decompress(bytes: &[u8]) -> Result<Option<Vec<bool>>, CodecError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::new(format!(
            "header needs {} bytes, got {}",
            HEADER_LEN,
            bytes.len()
        )));
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let len = u32::from_le_bytes(header) as usize;
    let blocks = &bytes[HEADER_LEN..];

    // A hostile header must not reserve more than the blocks could describe.
    let mut bits = Vec::with_capacity(len.min(blocks.len() * RLE_MAX_RUN));

    for &block in blocks {
        if bits.len() >= len {
            break;
        }
        if block & RLE_FLAG != 0 {
            let run = (block & RLE_LEN_MASK) as usize;
            if run == 0 {
                return Err(CodecError::new(format!(
                    "zero-length run at output position {}",
                    bits.len()
                )));
            }
            let value = block & RLE_VALUE != 0;
            let take = run.min(len - bits.len());
            bits.extend(std::iter::repeat_n(value, take));
        } else {
            for offset in 0..LITERAL_WIDTH {
                if bits.len() >= len {
                    break;
                }
                bits.push(block & (1 << (LITERAL_WIDTH - 1 - offset)) != 0);
            }
        }
    }

    if bits.len() < len {
        return Err(CodecError::new(format!(
            "payload declares {} bits but only encodes {}",
            len,
            bits.len()
        )));
    }

    debug!(len, "Decompressed bit array");
    Ok(Some(bits))
}

/// Malformed compressed payload.
#[derive(Debug, Clone, Display, Error)]
#[display("Codec error: {} at {}:{}", message, file, line)]
pub struct CodecError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl CodecError {
    /// Creates a new codec error with caller location tracking.
    #[track_caller]
    pub fn new(message: String) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
