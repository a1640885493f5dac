//! Streaming response modules.
//!
//! - `decoder`: chunk-boundary-safe `data:` frame decoding.
//! - `client`: POST client that feeds response bodies through the decoder.

/// Streaming POST client.
pub mod client;
/// Incremental frame decoder.
pub mod decoder;

pub use client::{StreamOutcome, StreamRequestError, StreamingClient, StreamingClientOptions};
pub use decoder::{decode_stream, decode_with, DecodeError, FrameDecoder, Termination};
