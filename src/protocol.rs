//! Shared protocol constants for the reel framed transport

// Header layout (8 bytes, big-endian):
//   0..2  metadata size (u16)
//   2..6  payload size (u32)
//   6..8  reserved, always written as zero
pub const HEADER_LEN: usize = 8;
pub const METADATA_SIZE_RANGE: std::ops::Range<usize> = 0..2;
pub const PAYLOAD_SIZE_RANGE: std::ops::Range<usize> = 2..6;

// Largest metadata block the u16 field can describe
pub const MAX_METADATA_SIZE: usize = u16::MAX as usize;

// Largest payload the u32 field can describe (4 GiB - 1)
pub const MAX_PAYLOAD_SIZE: u64 = u32::MAX as u64;

// Longest single path component on common filesystems
pub const MAX_FILENAME_LEN: usize = 255;

// Extensions longer than this are not carried onto on-disk names
pub const MAX_EXTENSION_LEN: usize = 16;

// Chunk size for streaming copies; independent of payload size
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub const DEFAULT_SERVER_BIND: &str = "0.0.0.0:9000";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:9000";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

// Option keys understood by the transform executor
pub mod option_keys {
    pub const RESOLUTION: &str = "resolution";
    pub const ASPECT_RATIO: &str = "aspect_ratio";
    pub const START_TIME: &str = "start_time";
    pub const DURATION: &str = "duration";
}
