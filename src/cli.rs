//! Shared CLI helpers and small reusable Clap fragments

use crate::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_DOWNLOAD_DIR, DEFAULT_SERVER_ADDR};
use clap::Parser;
use std::path::PathBuf;

/// Daemon options used by reeld. Unset flags fall back to the config file,
/// then to built-in defaults.
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "reeld", version, about = "Receive uploads, run ffmpeg, stream results back")]
pub struct DaemonOpts {
    /// Bind address (host:port) [default: 0.0.0.0:9000]
    #[arg(long)]
    pub bind: Option<String>,

    /// Directory for staged uploads and transform outputs [default: uploads]
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Streaming copy chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Largest accepted payload in bytes
    #[arg(long)]
    pub max_payload: Option<u64>,

    /// Connections served at once; further clients wait in the accept backlog
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,

    /// Kill a transform that runs longer than this
    #[arg(long)]
    pub transform_timeout_secs: Option<u64>,

    /// Abort a session whose network I/O stalls longer than this
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Append per-session audit lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Upload client options. Anything missing is asked for interactively.
#[derive(Clone, Debug, Parser)]
#[command(name = "reel", version, about = "Send a video to reeld for processing")]
pub struct ClientOpts {
    /// Server address (host:port)
    #[arg(long, default_value = DEFAULT_SERVER_ADDR)]
    pub server: String,

    /// Where processed files are written
    #[arg(long, default_value = DEFAULT_DOWNLOAD_DIR)]
    pub out_dir: PathBuf,

    /// Video file to upload
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Operation number (1-6)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=6))]
    pub op: Option<u8>,

    /// Target resolution for operation 2 (e.g. 1280x720)
    #[arg(long)]
    pub resolution: Option<String>,

    /// Target aspect ratio for operation 3 (e.g. 16:9)
    #[arg(long)]
    pub aspect_ratio: Option<String>,

    /// Start time for operations 5 and 6 (e.g. 00:00:00)
    #[arg(long)]
    pub start_time: Option<String>,

    /// Duration in seconds for operations 5 and 6
    #[arg(long)]
    pub duration: Option<String>,

    /// Streaming copy chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Hide progress bars
    #[arg(short, long)]
    pub quiet: bool,
}
