//! Framed Unix-socket transport
//!
//! The agent is the listening side: it binds a stream socket at a known
//! filesystem path, the helper binary connects to it, and exactly one
//! connection is served. Records are `[48-byte header][body]`; the reader
//! runs on its own task and hands each record to the `on_frame` callback.
//! Only the speech adapter writes back; writes serialize behind a lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::header::{FrameHeader, FRAME_HEADER_LEN, MAX_FRAME_BODY};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

/// Callback invoked for every record read from the socket. Records with
/// `size == 0` deliver `None` as the body.
pub type OnFrame = Arc<dyn Fn(FrameHeader, Option<Bytes>) + Send + Sync>;

/// One listening Unix socket serving a single helper-binary connection.
pub struct FramedSocket {
    path: PathBuf,
    message_id: AtomicU32,
    cancel: Mutex<Option<CancellationToken>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    oversize_log: Arc<LogThrottler>,
}

impl FramedSocket {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            message_id: AtomicU32::new(0),
            cancel: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
            oversize_log: Arc::new(LogThrottler::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the listener and start the accept/read task.
    ///
    /// The listener must exist before the helper binary is started, so the
    /// bind happens here rather than on the reader task. A stale socket
    /// inode from a previous run is unlinked first.
    pub async fn open(&self, on_frame: OnFrame) -> Result<()> {
        let mut cancel = self.cancel.lock().await;
        if cancel.is_some() {
            return Err(AppError::AlreadyOpen("socket listener"));
        }

        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;

        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        drop(cancel);

        let path = self.path.clone();
        let writer = self.writer.clone();
        let oversize_log = self.oversize_log.clone();
        let handle = tokio::spawn(async move {
            serve_connection(listener, path, writer, token, on_frame, oversize_log).await;
        });
        *self.reader.lock().await = Some(handle);

        Ok(())
    }

    /// Signal cancellation and wait for the reader task. Idempotent.
    pub async fn close(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Send one record to the connected helper.
    ///
    /// The header gets an auto-incrementing id and a microsecond send
    /// timestamp; `reserved` passes through untouched.
    pub async fn send(&self, reserved: [u32; 8], body: Option<&[u8]>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(AppError::NotOpen("socket connection"))?;

        let size = body.map(|b| b.len() as u32).unwrap_or(0);
        let header = FrameHeader {
            id: self.message_id.fetch_add(1, Ordering::Relaxed),
            size,
            timestamp: unix_micros(),
            reserved,
        };

        writer.write_all(&header.encode()).await?;
        if let Some(body) = body {
            writer.write_all(body).await?;
        }

        Ok(())
    }

    /// Send a header-only record.
    pub async fn send_header(&self, reserved: [u32; 8]) -> Result<()> {
        self.send(reserved, None).await
    }

    /// Send a record with a body and zeroed reserved words.
    pub async fn send_body(&self, body: &[u8]) -> Result<()> {
        self.send([0u32; 8], Some(body)).await
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Accept one client, read records until EOF/error/cancellation, then tear
/// down the connection, the listener, and the socket inode.
async fn serve_connection(
    listener: UnixListener,
    path: PathBuf,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    cancel: CancellationToken,
    on_frame: OnFrame,
    oversize_log: Arc<LogThrottler>,
) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => None,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => Some(stream),
            Err(e) => {
                warn!("socket accept error on {}: {}", path.display(), e);
                None
            }
        },
    };

    if let Some(stream) = stream {
        let (mut read_half, write_half) = stream.into_split();
        *writer.lock().await = Some(write_half);

        match read_records(&mut read_half, &cancel, &on_frame, &oversize_log, &path).await {
            Ok(()) => debug!("socket reader on {} finished", path.display()),
            Err(e) => warn!("socket reader on {} failed: {}", path.display(), e),
        }

        *writer.lock().await = None;
    }

    drop(listener);
    let _ = std::fs::remove_file(&path);
}

async fn read_records(
    read: &mut OwnedReadHalf,
    cancel: &CancellationToken,
    on_frame: &OnFrame,
    oversize_log: &LogThrottler,
    path: &Path,
) -> Result<()> {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];

    loop {
        // Cancellation between records is a clean end, like EOF.
        let got = match read_full(read, &mut header_buf, cancel).await {
            Ok(got) => got,
            Err(AppError::ClosedConnection) => return Ok(()),
            Err(e) => return Err(e),
        };
        match got {
            0 => return Ok(()),
            n if n < FRAME_HEADER_LEN => {
                return Err(AppError::IncompleteRead {
                    expected: FRAME_HEADER_LEN,
                    got: n,
                })
            }
            _ => {}
        }

        let header = FrameHeader::parse(&header_buf);

        if header.size == 0 {
            on_frame(header, None);
            continue;
        }

        if header.size > MAX_FRAME_BODY {
            if oversize_log.should_log("oversize") {
                warn!(
                    "socket {} record {} body of {} bytes exceeds {} byte limit, skipping",
                    path.display(),
                    header.id,
                    header.size,
                    MAX_FRAME_BODY
                );
            }
            discard(read, header.size as usize, cancel).await?;
            continue;
        }

        let mut body = vec![0u8; header.size as usize];
        let got = read_full(read, &mut body, cancel).await?;
        if got < body.len() {
            return Err(AppError::IncompleteRead {
                expected: body.len(),
                got,
            });
        }

        on_frame(header, Some(Bytes::from(body)));
    }
}

/// Read until `buf` is full, EOF, or cancellation. Returns the byte count
/// actually read; a short count means the peer closed mid-buffer.
async fn read_full(
    read: &mut OwnedReadHalf,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::ClosedConnection),
            read_result = read.read(&mut buf[total..]) => {
                match read_result? {
                    0 => break,
                    n => total += n,
                }
            }
        }
    }

    Ok(total)
}

/// Consume and drop `remaining` body bytes of an oversize record.
async fn discard(
    read: &mut OwnedReadHalf,
    mut remaining: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut scratch = [0u8; 16 * 1024];

    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let got = read_full(read, &mut scratch[..want], cancel).await?;
        if got < want {
            return Err(AppError::IncompleteRead {
                expected: want,
                got,
            });
        }
        remaining -= want;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kvm-agent-test-{}-{}.sock", name, std::process::id()))
    }

    fn collecting_callback() -> (OnFrame, mpsc::UnboundedReceiver<(FrameHeader, Option<Bytes>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_frame: OnFrame = Arc::new(move |header, body| {
            let _ = tx.send((header, body));
        });
        (on_frame, rx)
    }

    async fn recv_frame(
        rx: &mut mpsc::UnboundedReceiver<(FrameHeader, Option<Bytes>)>,
    ) -> (FrameHeader, Option<Bytes>) {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("frame channel closed")
    }

    #[tokio::test]
    async fn test_reads_header_and_body() {
        let path = socket_path("read");
        let socket = FramedSocket::new(&path);
        let (on_frame, mut rx) = collecting_callback();
        socket.open(on_frame).await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let header = FrameHeader {
            id: 1,
            size: 3,
            timestamp: 42,
            reserved: [0; 8],
        };
        client.write_all(&header.encode()).await.unwrap();
        client.write_all(b"abc").await.unwrap();

        let (got_header, got_body) = recv_frame(&mut rx).await;
        assert_eq!(got_header, header);
        assert_eq!(got_body.as_deref(), Some(&b"abc"[..]));

        socket.close().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_zero_size_record_has_no_body() {
        let path = socket_path("empty");
        let socket = FramedSocket::new(&path);
        let (on_frame, mut rx) = collecting_callback();
        socket.open(on_frame).await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let header = FrameHeader {
            reserved: [2, 1920, 1080, 0, 0, 0, 0, 0],
            ..Default::default()
        };
        client.write_all(&header.encode()).await.unwrap();

        let (got_header, got_body) = recv_frame(&mut rx).await;
        assert_eq!(got_header.reserved[0], 2);
        assert!(got_body.is_none());

        socket.close().await;
    }

    #[tokio::test]
    async fn test_oversize_body_is_skipped_without_disconnect() {
        let path = socket_path("oversize");
        let socket = FramedSocket::new(&path);
        let (on_frame, mut rx) = collecting_callback();
        socket.open(on_frame).await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();

        let oversize = 2 * 1024 * 1024u32;
        let header = FrameHeader {
            id: 1,
            size: oversize,
            ..Default::default()
        };
        client.write_all(&header.encode()).await.unwrap();
        client.write_all(&vec![0u8; oversize as usize]).await.unwrap();

        let valid = FrameHeader {
            id: 2,
            size: 4,
            ..Default::default()
        };
        client.write_all(&valid.encode()).await.unwrap();
        client.write_all(b"good").await.unwrap();

        let (got_header, got_body) = recv_frame(&mut rx).await;
        assert_eq!(got_header.id, 2);
        assert_eq!(got_body.as_deref(), Some(&b"good"[..]));

        socket.close().await;
    }

    #[tokio::test]
    async fn test_send_writes_header_then_body() {
        let path = socket_path("send");
        let socket = FramedSocket::new(&path);
        let (on_frame, _rx) = collecting_callback();
        socket.open(on_frame).await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        // Give the accept task a beat to stash the write half.
        tokio::time::sleep(Duration::from_millis(50)).await;

        socket.send_body(b"pcm").await.unwrap();
        socket.send_header([9, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let mut buf = [0u8; FRAME_HEADER_LEN];
        client.read_exact(&mut buf).await.unwrap();
        let first = FrameHeader::parse(&buf);
        assert_eq!(first.id, 0);
        assert_eq!(first.size, 3);
        assert!(first.timestamp > 0);

        let mut body = [0u8; 3];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"pcm");

        client.read_exact(&mut buf).await.unwrap();
        let second = FrameHeader::parse(&buf);
        assert_eq!(second.id, 1);
        assert_eq!(second.size, 0);
        assert_eq!(second.reserved[0], 9);

        socket.close().await;
    }

    #[tokio::test]
    async fn test_double_open_rejected_and_close_idempotent() {
        let path = socket_path("lifecycle");
        let socket = FramedSocket::new(&path);
        let (on_frame, _rx) = collecting_callback();

        socket.open(on_frame.clone()).await.unwrap();
        assert!(matches!(
            socket.open(on_frame).await,
            Err(AppError::AlreadyOpen(_))
        ));

        socket.close().await;
        socket.close().await;
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let path = socket_path("noconn");
        let socket = FramedSocket::new(&path);
        let (on_frame, _rx) = collecting_callback();
        socket.open(on_frame).await.unwrap();

        assert!(matches!(
            socket.send_body(b"x").await,
            Err(AppError::NotOpen(_))
        ));

        socket.close().await;
    }
}
