//! reel library
//!
//! Framed one-shot upload protocol: a client sends a media file plus a small
//! JSON command, the daemon runs ffmpeg on it and streams the result back.

pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logger;
pub mod net_async;
pub mod prompt;
pub mod protocol;
pub mod protocol_core;
pub mod transform;
pub mod transport;

pub use error::{ReelError, Result};
