use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use reel::cli::DaemonOpts;
use reel::config::ServerConfig;
use reel::logger::{init_tracing, NoopLogger, SessionLogger, TextLogger};
use reel::net_async::server::{self, ServerContext};
use reel::transform::FfmpegExecutor;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing("info");

    let config = ServerConfig::from_opts(&opts)?;

    println!("Starting reel daemon:");
    println!("  Bind: {}", config.bind);
    println!("  Upload dir: {}", config.upload_dir.display());
    println!("  Max connections: {}", config.max_connections);
    println!("  ffmpeg: {}", config.ffmpeg.display());

    // Security warning for 0.0.0.0 binding
    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; use on trusted networks only");
    }

    let logger: Arc<dyn SessionLogger> = match &config.log_file {
        Some(path) => Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("open log file {}", path.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };
    let executor = FfmpegExecutor::new(config.ffmpeg.clone(), config.transform_timeout());
    let ctx = Arc::new(ServerContext::new(config, executor).with_logger(logger));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(server::serve(ctx))
}
