//! Shared protocol logic for the daemon and the upload client
//!
//! Header codec and the filename rules both ends apply to names that arrive
//! off the wire.

use crate::error::{ReelError, Result};
use crate::protocol::{
    HEADER_LEN, MAX_EXTENSION_LEN, MAX_FILENAME_LEN, MAX_METADATA_SIZE, MAX_PAYLOAD_SIZE,
    METADATA_SIZE_RANGE, PAYLOAD_SIZE_RANGE,
};
use std::path::{Component, Path};

/// Sizes of the two variable-length sections that follow a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub metadata_size: u16,
    pub payload_size: u32,
}

impl FrameHeader {
    /// Checked constructor from in-memory lengths.
    pub fn new(metadata_len: usize, payload_len: u64) -> Result<Self> {
        let metadata_size = u16::try_from(metadata_len).map_err(|_| ReelError::MetadataTooLarge {
            size: metadata_len,
            max: MAX_METADATA_SIZE,
        })?;
        let payload_size = u32::try_from(payload_len).map_err(|_| ReelError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        })?;
        Ok(Self {
            metadata_size,
            payload_size,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        build_frame_header(self.metadata_size, self.payload_size)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (metadata_size, payload_size) = parse_frame_header(bytes)?;
        Ok(Self {
            metadata_size,
            payload_size,
        })
    }
}

/// Build frame header (8 bytes)
/// Format: METADATA_SIZE (2) | PAYLOAD_SIZE (4) | RESERVED (2), big-endian
pub fn build_frame_header(metadata_size: u16, payload_size: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[METADATA_SIZE_RANGE].copy_from_slice(&metadata_size.to_be_bytes());
    header[PAYLOAD_SIZE_RANGE].copy_from_slice(&payload_size.to_be_bytes());
    header
}

/// Parse frame header
/// Returns: (metadata_size, payload_size). Reserved bytes are ignored.
pub fn parse_frame_header(header: &[u8]) -> Result<(u16, u32)> {
    if header.len() < HEADER_LEN {
        return Err(ReelError::MalformedHeader {
            got: header.len(),
            need: HEADER_LEN,
        });
    }
    let metadata_size = u16::from_be_bytes([header[0], header[1]]);
    let payload_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    Ok((metadata_size, payload_size))
}

/// Accept a client- or server-supplied name only if it is a single plain
/// path component. Rejects separators, traversal, NUL and (on Windows) ADS.
pub fn sanitize_filename(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(ReelError::MissingFilename);
    }
    let unsafe_name = || ReelError::UnsafeFilename(name.to_string());

    if name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(unsafe_name());
    }
    #[cfg(windows)]
    if name.contains(':') {
        return Err(unsafe_name());
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(unsafe_name());
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(unsafe_name()),
    }
}

/// `clip.final.mp4` -> `clip.final`
pub fn remove_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// Extension after the last dot, or `None` when there is none or it is too
/// long to carry onto a generated name.
pub fn short_extension(name: &str) -> Option<&str> {
    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let ext = &name[pos + 1..];
            (!ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN).then_some(ext)
        }
        _ => None,
    }
}

/// Shorten `name` to at most `max` bytes. A short extension survives; the
/// stem is cut on a char boundary.
pub fn fit_filename(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let (stem, ext) = match short_extension(name) {
        Some(ext) => (&name[..name.len() - ext.len() - 1], Some(ext)),
        None => (name, None),
    };
    let mut cut = max
        .saturating_sub(ext.map_or(0, |e| e.len() + 1))
        .min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    match ext {
        Some(ext) => format!("{}.{}", &stem[..cut], ext),
        None => stem[..cut].to_string(),
    }
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
