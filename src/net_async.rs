//! Async (Tokio) transport for the reel daemon and upload client.
//!
//! One connection carries exactly one request frame and one response frame:
//!
//! ```text
//! client -> server   HEADER(8) | request JSON | source file bytes
//! server -> client   HEADER(8) | response JSON | result file bytes (success only)
//! ```
//!
//! Every section is moved with the exact-length primitives in
//! [`crate::transport`], never with a single raw read or write.

use crate::envelope::{RequestEnvelope, ResponseEnvelope, Status};
use crate::error::{ReelError, Result};
use crate::protocol::HEADER_LEN;
use crate::protocol_core::FrameHeader;
use crate::transport::{read_exactly, with_timeout, write_all};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Deadline for a section of `len` bytes: the base plus one second per MiB
/// (ceil). `None` disables the deadline.
pub fn section_deadline(base: Option<Duration>, len: u64) -> Option<Duration> {
    base.map(|b| {
        let mb = len.div_ceil(1_048_576);
        b + Duration::from_secs(mb)
    })
}

/// Write header + metadata as one buffer.
async fn write_head<S>(stream: &mut S, metadata: &[u8], payload_len: u64) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let header = FrameHeader::new(metadata.len(), payload_len)?;
    let mut frame = Vec::with_capacity(HEADER_LEN + metadata.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(metadata);
    write_all(stream, &frame).await
}

async fn read_header<S>(stream: &mut S, limit: Option<Duration>) -> Result<FrameHeader>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let bytes = with_timeout(limit, "header read", read_exactly(stream, HEADER_LEN)).await?;
    FrameHeader::decode(&bytes)
}

pub mod server {
    use super::*;
    use crate::config::ServerConfig;
    use crate::logger::{NoopLogger, SessionLogger};
    use crate::protocol::MAX_PAYLOAD_SIZE;
    use crate::protocol_core::{ensure_dir_exists, short_extension};
    use crate::transform::{output_name, TransformExecutor, TransformJob};
    use crate::transport::{copy_exactly, copy_exactly_tracked, drain};
    use anyhow::Context;
    use std::net::SocketAddr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;
    use tracing::{debug, info, info_span, warn, Instrument};
    use uuid::Uuid;

    /// Read-only state shared by every session.
    pub struct ServerContext<E> {
        pub config: ServerConfig,
        pub executor: E,
        pub logger: Arc<dyn SessionLogger>,
    }

    impl<E: TransformExecutor> ServerContext<E> {
        pub fn new(config: ServerConfig, executor: E) -> Self {
            Self {
                config,
                executor,
                logger: Arc::new(NoopLogger),
            }
        }

        pub fn with_logger(mut self, logger: Arc<dyn SessionLogger>) -> Self {
            self.logger = logger;
            self
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SessionState {
        AwaitHeader,
        AwaitMetadata,
        AwaitPayload,
        Dispatch,
        Respond,
        Cleanup,
        Closed,
    }

    /// What happened on one connection.
    #[derive(Debug)]
    pub struct SessionReport {
        pub id: String,
        /// States in the order they were entered.
        pub states: Vec<SessionState>,
        /// Status of the response that reached the wire, if any.
        pub status: Option<Status>,
        pub error: Option<ReelError>,
    }

    pub async fn serve<E: TransformExecutor>(ctx: Arc<ServerContext<E>>) -> anyhow::Result<()> {
        let bind = ctx.config.bind.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_on(listener, ctx).await
    }

    /// Accept loop. At most `max_connections` sessions run at once; the
    /// next `accept` waits for a free slot, so excess clients queue in the
    /// listen backlog.
    pub async fn serve_on<E: TransformExecutor>(
        listener: TcpListener,
        ctx: Arc<ServerContext<E>>,
    ) -> anyhow::Result<()> {
        ensure_dir_exists(&ctx.config.upload_dir).with_context(|| {
            format!("create upload dir {}", ctx.config.upload_dir.display())
        })?;
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            upload_dir = %ctx.config.upload_dir.display(),
            max_connections = ctx.config.max_connections,
            "reeld listening"
        );
        let slots = Arc::new(Semaphore::new(ctx.config.max_connections));
        loop {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .context("connection limiter closed")?;
            let (stream, peer) = accept_with_backoff(|| listener.accept()).await;
            let _ = stream.set_nodelay(true);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let report = handle_session(stream, peer, &ctx).await;
                debug!(id = %report.id, states = ?report.states, "session finished");
            });
        }
    }

    /// Pause after a failed `accept` so a persistent error (EMFILE) does not spin.
    pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

    /// Retry `accept` until it yields a connection.
    pub async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::io::Result<T>>,
    {
        loop {
            match accept().await {
                Ok(conn) => return conn,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// On-disk name for a session file: `<session>_<tag>[.ext]`. Only the
    /// extension of the client's name is kept, so the path always fits.
    fn disk_path(dir: &Path, session: &str, tag: &str, name: &str) -> PathBuf {
        match short_extension(name) {
            Some(ext) => dir.join(format!("{}_{}.{}", session, tag, ext)),
            None => dir.join(format!("{}_{}", session, tag)),
        }
    }

    /// Run one connection through the session state machine.
    pub async fn handle_session<S, E>(
        stream: S,
        peer: SocketAddr,
        ctx: &ServerContext<E>,
    ) -> SessionReport
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        E: TransformExecutor,
    {
        let id = Uuid::new_v4().simple().to_string();
        let span = info_span!("session", id = %id, %peer);
        let mut session = Session {
            id,
            peer,
            stream,
            ctx,
            states: Vec::new(),
            pending_payload: 0,
            staging: None,
            output: None,
        };
        session.run().instrument(span).await
    }

    /// A finished transform ready to stream back.
    struct Delivery {
        file: File,
        size: u64,
        filename: String,
    }

    struct Session<'a, S, E> {
        id: String,
        peer: SocketAddr,
        stream: S,
        ctx: &'a ServerContext<E>,
        states: Vec<SessionState>,
        /// Declared payload bytes not yet consumed from the socket.
        pending_payload: u64,
        staging: Option<PathBuf>,
        output: Option<PathBuf>,
    }

    impl<'a, S, E> Session<'a, S, E>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        E: TransformExecutor,
    {
        fn enter(&mut self, state: SessionState) {
            debug!(?state, "session state");
            self.states.push(state);
        }

        fn report(&mut self, status: Option<Status>, error: Option<ReelError>) -> SessionReport {
            SessionReport {
                id: self.id.clone(),
                states: std::mem::take(&mut self.states),
                status,
                error,
            }
        }

        async fn run(&mut self) -> SessionReport {
            self.ctx.logger.start(&self.id, self.peer);
            self.enter(SessionState::AwaitHeader);
            let header = match read_header(&mut self.stream, self.ctx.config.io_timeout()).await {
                Ok(h) => h,
                Err(e) => {
                    // Nothing trustworthy to answer; just close.
                    warn!(error = %e, "dropping connection without response");
                    self.ctx.logger.error(&self.id, "header", &e.to_string());
                    self.enter(SessionState::Closed);
                    return self.report(None, Some(e));
                }
            };
            debug!(
                metadata_size = header.metadata_size,
                payload_size = header.payload_size,
                "header received"
            );
            self.pending_payload = u64::from(header.payload_size);

            let result = self.process(header).await;

            self.enter(SessionState::Respond);
            let (status, error) = match result {
                Ok(delivery) => {
                    let size = delivery.size;
                    match self.send_success(delivery).await {
                        Ok(()) => {
                            info!(bytes = size, "result sent");
                            self.ctx.logger.responded(&self.id, "success", size);
                            (Some(Status::Success), None)
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to send result");
                            self.ctx.logger.error(&self.id, "respond", &e.to_string());
                            (None, Some(e))
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "request failed");
                    self.ctx.logger.error(&self.id, "request", &e.to_string());
                    match self.send_error(&e).await {
                        Ok(()) => {
                            self.ctx.logger.responded(&self.id, "error", 0);
                            (Some(Status::Error), Some(e))
                        }
                        Err(send_err) => {
                            warn!(error = %send_err, "failed to send error response");
                            (None, Some(e))
                        }
                    }
                }
            };

            self.enter(SessionState::Cleanup);
            self.cleanup().await;
            let _ = self.stream.shutdown().await;
            self.enter(SessionState::Closed);
            self.report(status, error)
        }

        async fn process(&mut self, header: FrameHeader) -> Result<Delivery> {
            let io_limit = self.ctx.config.io_timeout();
            let chunk = self.ctx.config.chunk_size;

            self.enter(SessionState::AwaitMetadata);
            let metadata_len = usize::from(header.metadata_size);
            let metadata = with_timeout(
                io_limit,
                "metadata read",
                read_exactly(&mut self.stream, metadata_len),
            )
            .await?;
            let request = RequestEnvelope::decode(&metadata)?;
            info!(
                operation = %request.operation,
                filename = %request.filename,
                payload_size = header.payload_size,
                "request received"
            );

            let payload_len = u64::from(header.payload_size);
            if payload_len > self.ctx.config.max_payload_size {
                return Err(ReelError::PayloadTooLarge {
                    size: payload_len,
                    max: self.ctx.config.max_payload_size,
                });
            }

            self.enter(SessionState::AwaitPayload);
            let upload_dir = self.ctx.config.upload_dir.clone();
            let staging = disk_path(&upload_dir, &self.id, "in", &request.filename);
            let mut file = File::create(&staging)
                .await
                .map_err(|e| ReelError::Staging(e.to_string()))?;
            self.staging = Some(staging.clone());

            let copied = with_timeout(
                section_deadline(io_limit, payload_len),
                "payload read",
                copy_exactly_tracked(&mut self.stream, &mut file, payload_len, chunk, None),
            )
            .await;
            drop(file);
            match copied {
                Ok(_) => self.pending_payload = 0,
                // Local write failed; the rest of the payload is still drainable.
                Err(f) if f.at_sink => {
                    self.pending_payload = payload_len - f.consumed;
                    return Err(ReelError::Staging(f.error.to_string()));
                }
                Err(f) => {
                    self.pending_payload = 0;
                    return Err(f.error);
                }
            }
            debug!(path = %staging.display(), bytes = payload_len, "payload staged");
            self.ctx.logger.staged(&self.id, &staging, payload_len);

            self.enter(SessionState::Dispatch);
            let filename = output_name(request.operation, &request.filename);
            let output = disk_path(&upload_dir, &self.id, "out", &filename);
            self.output = Some(output.clone());
            let job = TransformJob {
                operation: request.operation,
                options: request.options,
                filename: request.filename,
                input: staging,
                output: output.clone(),
            };
            self.ctx.executor.transform(&job).await?;

            let file = File::open(&output)
                .await
                .map_err(|_| ReelError::TransformFailed("transform produced no output".into()))?;
            let size = file.metadata().await?.len();
            if size == 0 {
                return Err(ReelError::TransformFailed(
                    "transform produced an empty file".into(),
                ));
            }
            if size > MAX_PAYLOAD_SIZE {
                return Err(ReelError::PayloadTooLarge {
                    size,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            Ok(Delivery {
                file,
                size,
                filename,
            })
        }

        async fn send_success(&mut self, mut delivery: Delivery) -> Result<()> {
            let io_limit = self.ctx.config.io_timeout();
            let metadata = ResponseEnvelope::success(&delivery.filename).encode()?;
            with_timeout(
                io_limit,
                "response write",
                write_head(&mut self.stream, &metadata, delivery.size),
            )
            .await?;
            with_timeout(
                section_deadline(io_limit, delivery.size),
                "result write",
                copy_exactly(
                    &mut delivery.file,
                    &mut self.stream,
                    delivery.size,
                    self.ctx.config.chunk_size,
                    None,
                ),
            )
            .await?;
            Ok(())
        }

        /// Drain whatever payload the client is still sending, then answer
        /// with `status = error`.
        async fn send_error(&mut self, err: &ReelError) -> Result<()> {
            let io_limit = self.ctx.config.io_timeout();
            if self.pending_payload > 0 && !err.is_fatal_to_connection() {
                let n = self.pending_payload;
                debug!(bytes = n, "draining unread payload");
                with_timeout(
                    section_deadline(io_limit, n),
                    "payload drain",
                    drain(&mut self.stream, n, self.ctx.config.chunk_size),
                )
                .await?;
                self.pending_payload = 0;
            }
            let metadata = ResponseEnvelope::error(client_message(err)).encode()?;
            with_timeout(
                io_limit,
                "response write",
                write_head(&mut self.stream, &metadata, 0),
            )
            .await
        }

        /// Best-effort removal of the staging and output files.
        async fn cleanup(&mut self) {
            for path in [self.staging.take(), self.output.take()].into_iter().flatten() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cleanup failed");
                        self.ctx.logger.cleanup_failed(&self.id, &path, &e.to_string());
                    }
                }
            }
        }
    }

    /// Message for the remote side. Local I/O details stay in the server log.
    fn client_message(err: &ReelError) -> String {
        match err {
            ReelError::Io(_) => "internal server error".to_string(),
            ReelError::Staging(_) => "Failed to create file".to_string(),
            other => other.to_string(),
        }
    }
}

pub mod client {
    use super::*;
    use crate::envelope::{Operation, Options};
    use crate::protocol::MAX_PAYLOAD_SIZE;
    use crate::protocol_core::{ensure_dir_exists, sanitize_filename};
    use crate::transport::copy_exactly;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::path::{Path, PathBuf};
    use tokio::fs::File;
    use tokio::net::TcpStream;
    use tracing::{debug, info};

    #[derive(Debug, Clone)]
    pub struct UploadOptions {
        pub download_dir: PathBuf,
        pub chunk_size: usize,
        pub io_timeout: Option<Duration>,
        pub show_progress: bool,
    }

    impl Default for UploadOptions {
        fn default() -> Self {
            Self {
                download_dir: PathBuf::from(crate::protocol::DEFAULT_DOWNLOAD_DIR),
                chunk_size: crate::protocol::DEFAULT_CHUNK_SIZE,
                io_timeout: None,
                show_progress: false,
            }
        }
    }

    /// A validated request plus the file it describes.
    #[derive(Debug, Clone)]
    pub struct PreparedUpload {
        pub envelope: RequestEnvelope,
        pub source: PathBuf,
        pub size: u64,
    }

    #[derive(Debug)]
    pub struct UploadResult {
        pub response: ResponseEnvelope,
        /// Where the returned file was written, if one came back.
        pub saved: Option<PathBuf>,
        pub bytes: u64,
    }

    /// Build the request locally. Runs before any connection is opened, so
    /// oversized files never reach the network.
    pub fn prepare(source: &Path, operation: Operation, options: Options) -> Result<PreparedUpload> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ReelError::UnsafeFilename(source.display().to_string()))?;
        let filename = sanitize_filename(name)?.to_string();
        let meta = std::fs::metadata(source)?;
        if !meta.is_file() {
            return Err(ReelError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", source.display()),
            )));
        }
        let size = meta.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(ReelError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let envelope = RequestEnvelope::new(operation, options, filename);
        // Fail on oversized metadata here too, not halfway through a send.
        envelope.encode()?;
        Ok(PreparedUpload {
            envelope,
            source: source.to_path_buf(),
            size,
        })
    }

    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Prepare, connect, and run one upload session.
    pub async fn upload(
        addr: &str,
        source: &Path,
        operation: Operation,
        options: Options,
        opts: &UploadOptions,
    ) -> Result<UploadResult> {
        let prepared = prepare(source, operation, options)?;
        let mut stream = with_timeout(opts.io_timeout, "connect", connect(addr)).await?;
        info!(server = addr, file = %prepared.source.display(), bytes = prepared.size, "uploading");
        run_upload(&mut stream, &prepared, opts).await
    }

    fn progress_bar(len: u64, msg: &'static str, visible: bool) -> ProgressBar {
        if !visible {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg:>10} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_message(msg);
        pb
    }

    /// Client half of the protocol over an already-open stream.
    pub async fn run_upload<S>(
        stream: &mut S,
        prepared: &PreparedUpload,
        opts: &UploadOptions,
    ) -> Result<UploadResult>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let metadata = prepared.envelope.encode()?;
        with_timeout(
            opts.io_timeout,
            "request write",
            write_head(stream, &metadata, prepared.size),
        )
        .await?;

        let mut source = File::open(&prepared.source).await?;
        let pb = progress_bar(prepared.size, "upload", opts.show_progress);
        with_timeout(
            section_deadline(opts.io_timeout, prepared.size),
            "payload write",
            copy_exactly(&mut source, stream, prepared.size, opts.chunk_size, Some(&pb)),
        )
        .await?;
        pb.finish_and_clear();
        debug!(bytes = prepared.size, "payload sent");

        // Transform time is unbounded, so the response header has no deadline.
        let header = read_header(stream, None).await?;
        let metadata = with_timeout(
            opts.io_timeout,
            "response read",
            read_exactly(stream, usize::from(header.metadata_size)),
        )
        .await?;
        let response = ResponseEnvelope::decode(&metadata)?;
        debug!(?response, payload_size = header.payload_size, "response received");

        if response.status == Status::Error {
            let msg = response
                .message
                .clone()
                .unwrap_or_else(|| "unspecified error".to_string());
            return Err(ReelError::Remote(msg));
        }

        let payload_len = u64::from(header.payload_size);
        if payload_len == 0 {
            return Ok(UploadResult {
                response,
                saved: None,
                bytes: 0,
            });
        }

        let name = response.filename.as_deref().ok_or_else(|| {
            ReelError::InvalidEnvelope("success response with payload but no filename".into())
        })?;
        let name = sanitize_filename(name)?;
        ensure_dir_exists(&opts.download_dir)?;
        let dest = opts.download_dir.join(name);
        let mut file = File::create(&dest).await?;
        let pb = progress_bar(payload_len, "download", opts.show_progress);
        let copied = with_timeout(
            section_deadline(opts.io_timeout, payload_len),
            "result read",
            copy_exactly(stream, &mut file, payload_len, opts.chunk_size, Some(&pb)),
        )
        .await;
        pb.finish_and_clear();
        drop(file);
        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e);
        }
        info!(path = %dest.display(), bytes = payload_len, "result saved");
        Ok(UploadResult {
            response,
            saved: Some(dest),
            bytes: payload_len,
        })
    }
}
