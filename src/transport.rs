//! Exact-length stream primitives.
//!
//! A single read or write on a stream socket may move fewer bytes than asked
//! for. Every protocol section (header, metadata, payload) goes through one of
//! these loops instead of a raw call.

use crate::error::{ReelError, Result};
use indicatif::ProgressBar;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read exactly `n` bytes or fail with `ShortRead`.
pub async fn read_exactly<R>(reader: &mut R, n: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; n];
    read_exactly_into(reader, &mut buf).await?;
    Ok(buf)
}

/// Fill `buf` completely or fail with `ShortRead`.
pub async fn read_exactly_into<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(ReelError::ShortRead {
                    expected: buf.len() as u64,
                    received: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(ReelError::ShortRead {
                    expected: buf.len() as u64,
                    received: filled as u64,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Write the whole buffer or fail with `ShortWrite`.
pub async fn write_all<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_counted(writer, bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_counted<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0usize;
    while written < bytes.len() {
        match writer.write(&bytes[written..]).await {
            Ok(0) => {
                return Err(ReelError::ShortWrite {
                    expected: bytes.len() as u64,
                    written: written as u64,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WriteZero => {
                return Err(ReelError::ShortWrite {
                    expected: bytes.len() as u64,
                    written: written as u64,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A copy that stopped early. `consumed` counts bytes taken from the source,
/// including any chunk the sink then failed to accept.
#[derive(Debug)]
pub struct CopyFailure {
    pub error: ReelError,
    pub consumed: u64,
    /// The destination failed, not the source.
    pub at_sink: bool,
}

impl From<ReelError> for CopyFailure {
    fn from(error: ReelError) -> Self {
        Self {
            error,
            consumed: 0,
            at_sink: false,
        }
    }
}

/// Stream exactly `n` bytes from `src` to `dst` through a buffer of at most
/// `chunk_size` bytes. Returns the number of bytes copied (always `n`).
pub async fn copy_exactly<R, W>(
    src: &mut R,
    dst: &mut W,
    n: u64,
    chunk_size: usize,
    progress: Option<&ProgressBar>,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    copy_exactly_tracked(src, dst, n, chunk_size, progress)
        .await
        .map_err(|f| f.error)
}

/// [`copy_exactly`], but a failure says which side broke and how far the
/// source was read.
pub async fn copy_exactly_tracked<R, W>(
    src: &mut R,
    dst: &mut W,
    n: u64,
    chunk_size: usize,
    progress: Option<&ProgressBar>,
) -> std::result::Result<u64, CopyFailure>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let cap = usize::try_from(n).unwrap_or(usize::MAX).min(chunk_size.max(1));
    let mut buf = vec![0u8; cap.max(1)];
    let mut remaining = n;
    let sink_failed = |error: ReelError, remaining: u64| CopyFailure {
        error,
        consumed: n - remaining,
        at_sink: true,
    };
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        let got = match src.read(&mut buf[..to_read]).await {
            Ok(0) => {
                return Err(CopyFailure {
                    error: ReelError::ShortRead {
                        expected: n,
                        received: n - remaining,
                    },
                    consumed: n - remaining,
                    at_sink: false,
                })
            }
            Ok(k) => k,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(CopyFailure {
                    error: e.into(),
                    consumed: n - remaining,
                    at_sink: false,
                })
            }
        };
        remaining -= got as u64;
        write_counted(dst, &buf[..got])
            .await
            .map_err(|e| sink_failed(e, remaining))?;
        if let Some(pb) = progress {
            pb.inc(got as u64);
        }
    }
    dst.flush().await.map_err(|e| sink_failed(e.into(), 0))?;
    Ok(n)
}

/// Consume and discard exactly `n` bytes so the peer's write side completes.
pub async fn drain<R>(src: &mut R, n: u64, chunk_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    copy_exactly(src, &mut tokio::io::sink(), n, chunk_size, None).await
}

/// Bound `fut` by `limit` when one is configured.
pub async fn with_timeout<T, E, F>(
    limit: Option<Duration>,
    what: &'static str,
    fut: F,
) -> std::result::Result<T, E>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: From<ReelError>,
{
    match limit {
        None => fut.await,
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res,
            Err(_) => Err(ReelError::Timeout(what, d.as_secs()).into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Yields at most `step` bytes per read, like a congested socket.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Trickle {
        fn new(data: Vec<u8>, step: usize) -> Self {
            Self { data, pos: 0, step }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let end = (this.pos + this.step).min(this.data.len());
            let take = (end - this.pos).min(buf.remaining());
            buf.put_slice(&this.data[this.pos..this.pos + take]);
            this.pos += take;
            Poll::Ready(Ok(()))
        }
    }

    /// Accepts at most `step` bytes per write and `cap` bytes overall.
    struct Stingy {
        out: Vec<u8>,
        step: usize,
        cap: usize,
    }

    impl AsyncWrite for Stingy {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let room = this.cap - this.out.len();
            let n = buf.len().min(this.step).min(room);
            this.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_exactly_absorbs_short_reads() {
        for step in [1, 3, 7, 1000] {
            let mut src = Trickle::new(pattern(500), step);
            let got = read_exactly(&mut src, 500).await.unwrap();
            assert_eq!(got, pattern(500));
        }
    }

    #[tokio::test]
    async fn test_read_exactly_leaves_trailing_bytes() {
        let mut src = Trickle::new(pattern(20), 3);
        let head = read_exactly(&mut src, 8).await.unwrap();
        let rest = read_exactly(&mut src, 12).await.unwrap();
        assert_eq!(head, pattern(20)[..8]);
        assert_eq!(rest, pattern(20)[8..]);
    }

    #[tokio::test]
    async fn test_read_exactly_short_read() {
        let mut src = Trickle::new(pattern(10), 2);
        match read_exactly(&mut src, 11).await {
            Err(ReelError::ShortRead { expected, received }) => {
                assert_eq!(expected, 11);
                assert_eq!(received, 10);
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_exactly_zero_bytes() {
        let mut src = Trickle::new(Vec::new(), 1);
        assert!(read_exactly(&mut src, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_all_absorbs_short_writes() {
        let mut dst = Stingy {
            out: Vec::new(),
            step: 3,
            cap: usize::MAX,
        };
        write_all(&mut dst, &pattern(100)).await.unwrap();
        assert_eq!(dst.out, pattern(100));
    }

    #[tokio::test]
    async fn test_write_all_short_write() {
        let mut dst = Stingy {
            out: Vec::new(),
            step: 4,
            cap: 10,
        };
        match write_all(&mut dst, &pattern(16)).await {
            Err(ReelError::ShortWrite { expected, written }) => {
                assert_eq!(expected, 16);
                assert_eq!(written, 10);
            }
            other => panic!("expected ShortWrite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_exactly_small_chunks() {
        let data = pattern(10_000);
        let mut src = Trickle::new(data.clone(), 13);
        let mut dst = Stingy {
            out: Vec::new(),
            step: 5,
            cap: usize::MAX,
        };
        let n = copy_exactly(&mut src, &mut dst, 10_000, 64, None).await.unwrap();
        assert_eq!(n, 10_000);
        assert_eq!(dst.out, data);
    }

    #[tokio::test]
    async fn test_copy_exactly_stops_at_n() {
        let mut src = Trickle::new(pattern(100), 50);
        let mut dst = Vec::new();
        copy_exactly(&mut src, &mut dst, 60, 1024, None).await.unwrap();
        assert_eq!(dst, pattern(100)[..60]);
        // The rest is still readable by the next section
        let rest = read_exactly(&mut src, 40).await.unwrap();
        assert_eq!(rest, pattern(100)[60..]);
    }

    #[tokio::test]
    async fn test_copy_exactly_short_read() {
        let mut src = Trickle::new(pattern(30), 7);
        let mut dst = Vec::new();
        match copy_exactly(&mut src, &mut dst, 31, 8, None).await {
            Err(ReelError::ShortRead { expected, received }) => {
                assert_eq!(expected, 31);
                assert_eq!(received, 30);
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_copy_exactly_reports_progress() {
        let mut src = Trickle::new(pattern(4096), 100);
        let mut dst = Vec::new();
        let pb = ProgressBar::hidden();
        copy_exactly(&mut src, &mut dst, 4096, 512, Some(&pb)).await.unwrap();
        assert_eq!(pb.position(), 4096);
    }

    /// Fails every write after `ok_bytes`, like a full disk.
    struct Full {
        written: usize,
        ok_bytes: usize,
    }

    impl AsyncWrite for Full {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let room = this.ok_bytes - this.written;
            if room == 0 {
                return Poll::Ready(Err(io::Error::other("no space left on device")));
            }
            let n = buf.len().min(room);
            this.written += n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_tracked_sink_failure_reports_consumed() {
        let mut src = Trickle::new(pattern(1000), 100);
        let mut dst = Full {
            written: 0,
            ok_bytes: 250,
        };
        let failure = copy_exactly_tracked(&mut src, &mut dst, 1000, 64, None)
            .await
            .unwrap_err();
        assert!(failure.at_sink);
        assert!(matches!(failure.error, ReelError::Io(_)));
        // The chunk that hit the full sink was already taken from the source
        assert_eq!(failure.consumed, 256);
        // Whatever was not consumed is still there to drain
        let rest = 1000 - failure.consumed;
        assert_eq!(drain(&mut src, rest, 64).await.unwrap(), rest);
    }

    #[tokio::test]
    async fn test_copy_tracked_source_failure() {
        let mut src = Trickle::new(pattern(30), 7);
        let mut dst = Vec::new();
        let failure = copy_exactly_tracked(&mut src, &mut dst, 40, 8, None)
            .await
            .unwrap_err();
        assert!(!failure.at_sink);
        assert_eq!(failure.consumed, 30);
        assert!(matches!(failure.error, ReelError::ShortRead { .. }));
    }

    #[tokio::test]
    async fn test_drain_consumes_declared_length() {
        let mut src = Trickle::new(pattern(64), 9);
        assert_eq!(drain(&mut src, 50, 16).await.unwrap(), 50);
        assert_eq!(read_exactly(&mut src, 14).await.unwrap(), pattern(64)[50..]);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let res: Result<()> = with_timeout(Some(Duration::from_millis(10)), "read", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(ReelError::Timeout("read", _))));
    }
}
