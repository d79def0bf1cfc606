//! Transform dispatch.
//!
//! Each [`Operation`] maps to one fixed ffmpeg argument template and one
//! output naming rule. The daemon only talks to [`TransformExecutor`], so tests
//! can swap ffmpeg for something deterministic.

use crate::envelope::{Operation, Options};
use crate::error::{ReelError, Result};
use crate::protocol::option_keys::{ASPECT_RATIO, DURATION, RESOLUTION, START_TIME};
use crate::protocol::MAX_FILENAME_LEN;
use crate::protocol_core::{fit_filename, remove_extension};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Everything an executor needs for one request.
#[derive(Debug, Clone)]
pub struct TransformJob {
    pub operation: Operation,
    pub options: Options,
    /// Client-supplied bare name, used for output naming.
    pub filename: String,
    /// Staged upload.
    pub input: PathBuf,
    /// Where the output file is to be written.
    pub output: PathBuf,
}

pub trait TransformExecutor: Send + Sync + 'static {
    /// Produce `job.output`. Errors become a `status = error` response.
    fn transform(&self, job: &TransformJob) -> impl Future<Output = Result<()>> + Send;
}

/// Name the client will see for the result of `operation` on `filename`,
/// shortened if the prefix pushes it past one path component.
pub fn output_name(operation: Operation, filename: &str) -> String {
    let name = match operation {
        Operation::Compress => format!("compressed_{}", filename),
        Operation::Resolution => format!("resolution_{}", filename),
        Operation::AspectRatio => format!("aspect_ratio_{}", filename),
        Operation::ExtractAudio => format!("audio_{}.mp3", remove_extension(filename)),
        Operation::MakeGif => format!("gif_{}.gif", remove_extension(filename)),
        Operation::MakeWebm => format!("webm_{}.webm", remove_extension(filename)),
    };
    fit_filename(&name, MAX_FILENAME_LEN)
}

/// Every required option must be present and non-blank.
pub fn validate_options(operation: Operation, options: &Options) -> Result<()> {
    for key in operation.required_options() {
        match options.get(*key) {
            Some(v) if !v.trim().is_empty() => {}
            _ => {
                return Err(ReelError::TransformFailed(format!(
                    "missing option {} for {}",
                    key, operation
                )))
            }
        }
    }
    Ok(())
}

fn opt<'a>(options: &'a Options, key: &str) -> Result<&'a str> {
    options
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ReelError::TransformFailed(format!("missing option {}", key)))
}

/// ffmpeg arguments for the transform itself (program name excluded).
pub fn command_args(
    operation: Operation,
    input: &Path,
    output: &Path,
    options: &Options,
) -> Result<Vec<OsString>> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];
    let tail: Vec<OsString> = match operation {
        Operation::Compress => vec!["-vcodec".into(), "libx264".into(), "-crf".into(), "28".into()],
        Operation::Resolution => {
            let res = opt(options, RESOLUTION)?;
            vec!["-vf".into(), format!("scale={}", res).into()]
        }
        Operation::AspectRatio => {
            let ratio = opt(options, ASPECT_RATIO)?;
            vec!["-vf".into(), format!("setdar={}", ratio).into()]
        }
        Operation::ExtractAudio => vec!["-q:a".into(), "0".into(), "-map".into(), "a".into()],
        Operation::MakeGif => vec![
            "-ss".into(),
            opt(options, START_TIME)?.into(),
            "-t".into(),
            opt(options, DURATION)?.into(),
            "-vf".into(),
            "fps=10,scale=320:-1".into(),
        ],
        Operation::MakeWebm => vec![
            "-ss".into(),
            opt(options, START_TIME)?.into(),
            "-t".into(),
            opt(options, DURATION)?.into(),
            "-c:v".into(),
            "libvpx-vp9".into(),
            "-b:v".into(),
            "1M".into(),
            "-c:a".into(),
            "libopus".into(),
        ],
    };
    args.extend(tail);
    args.push(output.into());
    Ok(args)
}

/// Precondition probe: succeeds only if `input` has an audio stream.
pub fn audio_probe_args(input: &Path) -> Vec<OsString> {
    vec![
        "-i".into(),
        input.into(),
        "-map".into(),
        "a".into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

/// Runs the real `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegExecutor {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl FfmpegExecutor {
    pub fn new(program: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Run to completion; non-zero exit carries the last stderr line.
    async fn run(&self, args: Vec<OsString>) -> Result<std::result::Result<(), String>> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ReelError::TransformFailed(format!(
                    "cannot start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let mut stderr = child.stderr.take();
        let fut = async move {
            let mut err_text = String::new();
            if let Some(s) = stderr.as_mut() {
                s.read_to_string(&mut err_text).await?;
            }
            let status = child.wait().await?;
            Ok::<_, ReelError>((status, err_text))
        };
        let (status, err_text) = crate::transport::with_timeout(self.timeout, "transform", fut).await?;
        if status.success() {
            return Ok(Ok(()));
        }
        let last = err_text
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(Err(format!("{} ({})", status, last)))
    }
}

impl TransformExecutor for FfmpegExecutor {
    async fn transform(&self, job: &TransformJob) -> Result<()> {
        validate_options(job.operation, &job.options)?;

        if job.operation == Operation::ExtractAudio {
            tracing::debug!(input = %job.input.display(), "probing for audio stream");
            if self.run(audio_probe_args(&job.input)).await?.is_err() {
                return Err(ReelError::TransformFailed(
                    "no audio stream found in the file".to_string(),
                ));
            }
        }

        let args = command_args(job.operation, &job.input, &job.output, &job.options)?;
        tracing::debug!(operation = %job.operation, ?args, "running ffmpeg");
        match self.run(args).await? {
            Ok(()) => {
                tracing::info!(output = %job.output.display(), "transform finished");
                Ok(())
            }
            Err(detail) => Err(ReelError::TransformFailed(format!(
                "{} failed: {}",
                job.operation, detail
            ))),
        }
    }
}
