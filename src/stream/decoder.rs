//! Incremental decoder for `data:` frames in a chunked HTTP body.
//!
//! Frames are separated by a blank line. Chunk boundaries may fall anywhere,
//! including inside a multi-byte UTF-8 sequence; the decoder retains the
//! unterminated tail between pushes and emits every complete frame exactly
//! once.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;

use futures_util::stream::unfold;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

/// Prefix identifying the payload line of a frame.
pub const DATA_PREFIX: &str = "data:";
/// Payload that ends the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

const FRAME_DELIMITER: &str = "\n\n";

/// Errors raised while buffering frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The unterminated tail grew past the configured limit.
    #[error("frame buffer exceeded {limit} bytes without a frame boundary")]
    BufferOverflow { limit: usize },
}

/// Why a decode loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The `[DONE]` sentinel frame was seen.
    Sentinel,
    /// The chunk source ran out.
    EndOfBody,
    /// The chunk source failed.
    ReadError(String),
    /// The buffer limit was hit.
    BufferLimit,
}

/// Splits accumulated text into raw frames on blank-line boundaries.
///
/// `\r\n` line endings are normalized to `\n` before splitting.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buffer: String,
    partial_utf8: Vec<u8>,
    max_buffer: Option<usize>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the unterminated tail at `limit` bytes.
    pub fn with_max_buffer(limit: usize) -> Self {
        Self {
            max_buffer: Some(limit),
            ..Self::default()
        }
    }

    /// Appends `chunk` and moves every complete frame into `out`.
    ///
    /// Complete frames are always written to `out`, even when the remaining
    /// tail then trips the buffer limit and an error is returned.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<String>) -> Result<(), DecodeError> {
        self.append_utf8(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        while let Some(position) = self.buffer.find(FRAME_DELIMITER) {
            let rest = self.buffer.split_off(position + FRAME_DELIMITER.len());
            let mut frame = std::mem::replace(&mut self.buffer, rest);
            frame.truncate(position);
            out.push(frame);
        }

        match self.max_buffer {
            Some(limit) if self.buffered_len() > limit => {
                self.clear();
                Err(DecodeError::BufferOverflow { limit })
            }
            _ => Ok(()),
        }
    }

    /// Bytes currently held for the next push.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.partial_utf8.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial_utf8.clear();
    }

    fn append_utf8(&mut self, chunk: &[u8]) {
        let bytes: Cow<'_, [u8]> = if self.partial_utf8.is_empty() {
            Cow::Borrowed(chunk)
        } else {
            let mut joined = std::mem::take(&mut self.partial_utf8);
            joined.extend_from_slice(chunk);
            Cow::Owned(joined)
        };

        let mut input: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    self.buffer
                        .push_str(std::str::from_utf8(&input[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            input = &input[valid + invalid..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for the next chunk.
                            self.partial_utf8.extend_from_slice(&input[valid..]);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Returns the trimmed content of a frame's `data:` line(s).
///
/// Multiple `data:` lines are joined with `\n`. Frames without one (comments,
/// `event:`-only frames) yield `None`.
pub fn extract_data(frame: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in frame.lines() {
        let Some(content) = line.trim_start().strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let content = content.trim();
        match data.as_mut() {
            Some(joined) => {
                joined.push('\n');
                joined.push_str(content);
            }
            None => data = Some(content.to_string()),
        }
    }
    data
}

/// Parses frame content as JSON, falling back to single-quote normalization.
pub fn decode_payload(content: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(content) {
        return Some(value);
    }
    if !content.contains('\'') {
        return None;
    }
    serde_json::from_str(&content.replace('\'', "\"")).ok()
}

/// Turns pushed chunks into decoded JSON frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    splitter: FrameSplitter,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffer(limit: usize) -> Self {
        Self {
            splitter: FrameSplitter::with_max_buffer(limit),
            finished: false,
        }
    }

    /// Decodes every complete frame in the buffer into `out`.
    ///
    /// Undecodable frames are skipped. After the sentinel frame the decoder
    /// is finished and ignores further input.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<Value>) -> Result<(), DecodeError> {
        if self.finished {
            return Ok(());
        }

        let mut raw_frames = Vec::new();
        let result = self.splitter.push(chunk, &mut raw_frames);

        for frame in raw_frames {
            let Some(content) = extract_data(&frame) else {
                trace!(event = "frame_without_data", frame_len = frame.len());
                continue;
            };
            if content == DONE_SENTINEL {
                self.finished = true;
                self.splitter.clear();
                return Ok(());
            }
            match decode_payload(&content) {
                Some(value) => out.push(value),
                None => trace!(event = "frame_skipped", content_len = content.len()),
            }
        }

        result
    }

    /// Returns `true` once the sentinel frame has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn buffered_len(&self) -> usize {
        self.splitter.buffered_len()
    }
}

/// Drives `decoder` over `chunks`, invoking `on_frame` per decoded frame.
///
/// Returns the number of frames delivered and the reason decoding stopped.
/// Any unterminated tail left when the source ends is discarded.
pub async fn decode_with<S, B, E, F>(
    chunks: S,
    mut decoder: FrameDecoder,
    mut on_frame: F,
) -> (usize, Termination)
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
    F: FnMut(Value),
{
    let mut chunks = std::pin::pin!(chunks);
    let mut frames = Vec::new();
    let mut delivered = 0;

    let termination = loop {
        match chunks.next().await {
            Some(Ok(chunk)) => {
                let result = decoder.push(chunk.as_ref(), &mut frames);
                for frame in frames.drain(..) {
                    delivered += 1;
                    on_frame(frame);
                }
                if let Err(err) = result {
                    warn!(event = "frame_buffer_overflow", error = %err);
                    break Termination::BufferLimit;
                }
                if decoder.is_finished() {
                    break Termination::Sentinel;
                }
            }
            Some(Err(err)) => {
                warn!(event = "frame_stream_read_failed", error = %err);
                break Termination::ReadError(err.to_string());
            }
            None => {
                if decoder.buffered_len() > 0 {
                    trace!(
                        event = "frame_tail_discarded",
                        buffered = decoder.buffered_len()
                    );
                }
                break Termination::EndOfBody;
            }
        }
    };

    (delivered, termination)
}

/// Lazily decodes `chunks` into a stream of JSON frames.
///
/// The stream ends at the sentinel frame, at the end of the source, or on the
/// first read error.
pub fn decode_stream<S, B, E>(chunks: S) -> impl Stream<Item = Value>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    unfold(
        (
            Box::pin(chunks),
            FrameDecoder::new(),
            VecDeque::new(),
            false,
        ),
        |(mut chunks, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((frame, (chunks, decoder, pending, done)));
                }
                if done {
                    return None;
                }

                match chunks.next().await {
                    Some(Ok(chunk)) => {
                        let mut frames = Vec::new();
                        let result = decoder.push(chunk.as_ref(), &mut frames);
                        pending.extend(frames);
                        if let Err(err) = result {
                            warn!(event = "frame_buffer_overflow", error = %err);
                            done = true;
                        }
                        done |= decoder.is_finished();
                    }
                    Some(Err(err)) => {
                        warn!(event = "frame_stream_read_failed", error = %err);
                        done = true;
                    }
                    None => done = true,
                }
            }
        },
    )
}
