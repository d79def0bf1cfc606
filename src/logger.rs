use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Install the process-wide diagnostics subscriber. `RUST_LOG` wins over
/// `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Per-session audit trail, separate from process diagnostics.
pub trait SessionLogger: Send + Sync {
    fn start(&self, _session: &str, _peer: SocketAddr) {}
    fn staged(&self, _session: &str, _path: &Path, _bytes: u64) {}
    fn responded(&self, _session: &str, _status: &str, _bytes: u64) {}
    fn cleanup_failed(&self, _session: &str, _path: &Path, _msg: &str) {}
    fn error(&self, _session: &str, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl SessionLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl SessionLogger for TextLogger {
    fn start(&self, session: &str, peer: SocketAddr) {
        self.line(&format!("START session={session} peer={peer}"));
    }
    fn staged(&self, session: &str, path: &Path, bytes: u64) {
        self.line(&format!(
            "STAGED session={} path={} bytes={}",
            session,
            path.display(),
            bytes
        ));
    }
    fn responded(&self, session: &str, status: &str, bytes: u64) {
        self.line(&format!(
            "RESPOND session={session} status={status} bytes={bytes}"
        ));
    }
    fn cleanup_failed(&self, session: &str, path: &Path, msg: &str) {
        self.line(&format!(
            "CLEANUP_FAILED session={} path={} msg={}",
            session,
            path.display(),
            msg
        ));
    }
    fn error(&self, session: &str, context: &str, msg: &str) {
        self.line(&format!("ERROR session={session} ctx={context} msg={msg}"));
    }
}
