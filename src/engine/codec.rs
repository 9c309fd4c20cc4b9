//! NDJSON codec for engine output streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum line length
//! so an unterminated or oversized line from a misbehaving engine cannot
//! exhaust memory.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use session_relay::engine::codec::EventLineCodec;
//!
//! let lines = FramedRead::new(child_stdout, EventLineCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted from an engine: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line decoder for engine stdout.
///
/// Lines longer than [`MAX_LINE_BYTES`] and I/O failures both surface as
/// [`AppError::Engine`]; the stream cannot be trusted past either.
#[derive(Debug)]
pub struct EventLineCodec(LinesCodec);

impl EventLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for EventLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Engine(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Engine(io_err.to_string()),
    }
}
