//! Daemon configuration: TOML file, then CLI overrides, then defaults.

use crate::cli::DaemonOpts;
use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FFMPEG, DEFAULT_MAX_CONNECTIONS, DEFAULT_SERVER_BIND,
    DEFAULT_UPLOAD_DIR, MAX_PAYLOAD_SIZE,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub upload_dir: PathBuf,
    pub chunk_size: usize,
    pub max_payload_size: u64,
    pub max_connections: usize,
    pub ffmpeg: PathBuf,
    pub transform_timeout_secs: Option<u64>,
    pub io_timeout_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_SERVER_BIND.to_string(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG),
            transform_timeout_secs: None,
            io_timeout_secs: None,
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let cfg: ServerConfig = toml::from_str(data).context("parse server config")?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve the effective config for a daemon invocation.
    pub fn from_opts(opts: &DaemonOpts) -> Result<Self> {
        let mut cfg = match &opts.config {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        cfg.apply_overrides(opts);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_overrides(&mut self, opts: &DaemonOpts) {
        if let Some(v) = &opts.bind {
            self.bind = v.clone();
        }
        if let Some(v) = &opts.upload_dir {
            self.upload_dir = v.clone();
        }
        if let Some(v) = opts.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = opts.max_payload {
            self.max_payload_size = v;
        }
        if let Some(v) = opts.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = &opts.ffmpeg {
            self.ffmpeg = v.clone();
        }
        if opts.transform_timeout_secs.is_some() {
            self.transform_timeout_secs = opts.transform_timeout_secs;
        }
        if opts.io_timeout_secs.is_some() {
            self.io_timeout_secs = opts.io_timeout_secs;
        }
        if opts.log_file.is_some() {
            self.log_file = opts.log_file.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be greater than zero");
        }
        if self.max_payload_size > MAX_PAYLOAD_SIZE {
            bail!(
                "max_payload_size {} exceeds the protocol limit {}",
                self.max_payload_size,
                MAX_PAYLOAD_SIZE
            );
        }
        Ok(())
    }

    pub fn transform_timeout(&self) -> Option<Duration> {
        self.transform_timeout_secs.map(Duration::from_secs)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }
}
