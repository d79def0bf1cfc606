//! reel - upload a video to reeld, pick a transform, download the result.

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::path::PathBuf;

use reel::cli::ClientOpts;
use reel::envelope::{Operation, Options};
use reel::logger::init_tracing;
use reel::net_async::client::{self, UploadOptions};
use reel::prompt::Prompter;
use reel::protocol::option_keys::{ASPECT_RATIO, DURATION, RESOLUTION, START_TIME};

fn preset_options(opts: &ClientOpts) -> Options {
    let mut options = Options::new();
    let pairs = [
        (RESOLUTION, &opts.resolution),
        (ASPECT_RATIO, &opts.aspect_ratio),
        (START_TIME, &opts.start_time),
        (DURATION, &opts.duration),
    ];
    for (key, value) in pairs {
        if let Some(v) = value {
            options.insert(key.to_string(), v.clone());
        }
    }
    options
}

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(if opts.quiet { "warn" } else { "info" });

    let stdin = io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), io::stdout());

    let source = match &opts.file {
        Some(p) => p.clone(),
        None => PathBuf::from(prompter.ask("Enter the path of the video file to upload: ")?),
    };
    let operation = match opts.op {
        Some(code) => Operation::from_code(i64::from(code))?,
        None => prompter.select_operation()?,
    };
    let mut options = prompter.collect_options(operation, preset_options(&opts))?;
    // Only keep what the chosen operation understands
    options.retain(|k, _| operation.required_options().contains(&k.as_str()));

    let upload_opts = UploadOptions {
        download_dir: opts.out_dir.clone(),
        chunk_size: opts.chunk_size.max(1),
        io_timeout: None,
        show_progress: !opts.quiet,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = rt
        .block_on(client::upload(
            &opts.server,
            &source,
            operation,
            options,
            &upload_opts,
        ))
        .with_context(|| format!("{} on {}", operation, source.display()))?;

    match result.saved {
        Some(path) => println!(
            "Processed file saved as '{}' ({} bytes)",
            path.display(),
            result.bytes
        ),
        None => println!("Server reported success with no file attached"),
    }
    Ok(())
}
