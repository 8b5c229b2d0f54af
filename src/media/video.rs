//! H.264 encoder adapter
//!
//! Pairs the encoder binary with its framed socket. The listener must exist
//! before the child starts (the encoder connects to it immediately), and a
//! failed child start unwinds the socket again. Each record body is one
//! complete H.264 access unit; the header timestamp is the capture wall
//! clock in microseconds.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::process::Supervisor;
use crate::transport::{FramedSocket, OnFrame};

/// Callback receiving `(id, capture_timestamp_us, access_unit)`.
pub type OnVideoFrame = Arc<dyn Fn(u32, u64, Bytes) + Send + Sync>;

/// Encoder launch parameters.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// Capture device, e.g. `/dev/video0`
    pub device_path: String,
    /// Encoder binary
    pub bin_path: String,
    /// Framed socket the encoder writes to
    pub socket_path: String,
    pub width: u32,
    pub height: u32,
    /// kbit/s
    pub bit_rate: u32,
    pub gop: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            bin_path: "/root/video".to_string(),
            socket_path: "/var/run/capture.sock".to_string(),
            width: 1920,
            height: 1080,
            bit_rate: 10 * 1024,
            gop: 60,
        }
    }
}

/// Supervised encoder plus its socket.
pub struct VideoAdapter {
    socket: FramedSocket,
    supervisor: Arc<Supervisor>,
}

impl VideoAdapter {
    pub fn new(settings: &VideoSettings) -> Self {
        let args = vec![
            "-w".to_string(),
            settings.width.to_string(),
            "-h".to_string(),
            settings.height.to_string(),
            "-i".to_string(),
            settings.device_path.clone(),
            "-o".to_string(),
            settings.socket_path.clone(),
            "-b".to_string(),
            settings.bit_rate.to_string(),
            "-g".to_string(),
            settings.gop.to_string(),
        ];

        Self {
            socket: FramedSocket::new(&settings.socket_path),
            supervisor: Arc::new(Supervisor::new(&settings.bin_path, args)),
        }
    }

    /// Open the socket, then start the encoder.
    pub async fn open(&self, on_frame: OnVideoFrame) -> Result<()> {
        let callback: OnFrame = Arc::new(move |header, body| {
            if let Some(body) = body {
                on_frame(header.id, header.timestamp, body);
            }
        });

        self.socket.open(callback).await?;

        if let Err(e) = self.supervisor.start().await {
            self.socket.close().await;
            return Err(e);
        }

        Ok(())
    }

    /// Stop the encoder, then tear the socket down.
    pub async fn close(&self) {
        let _ = self.supervisor.stop().await;
        self.socket.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FrameHeader;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn test_settings(name: &str) -> VideoSettings {
        VideoSettings {
            // `sleep` stands in for the encoder binary; the test connects
            // to the socket itself and plays the encoder side.
            bin_path: "sleep".to_string(),
            device_path: "30".to_string(),
            socket_path: std::env::temp_dir()
                .join(format!("kvm-agent-video-{}-{}.sock", name, std::process::id()))
                .to_string_lossy()
                .to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_frames_reach_callback() {
        let settings = test_settings("frames");
        let adapter = VideoAdapter::new(&settings);

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter
            .open(Arc::new(move |id, timestamp, frame| {
                let _ = tx.send((id, timestamp, frame));
            }))
            .await
            .unwrap();

        let mut encoder = UnixStream::connect(&settings.socket_path).await.unwrap();
        let header = FrameHeader {
            id: 3,
            size: 5,
            timestamp: 1_000_000,
            reserved: [0; 8],
        };
        encoder.write_all(&header.encode()).await.unwrap();
        encoder.write_all(b"h264!").await.unwrap();

        let (id, timestamp, frame) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(id, 3);
        assert_eq!(timestamp, 1_000_000);
        assert_eq!(&frame[..], b"h264!");

        adapter.close().await;
    }

    #[tokio::test]
    async fn test_failed_child_start_unwinds_socket() {
        let mut settings = test_settings("unwind");
        settings.bin_path = "/nonexistent/encoder".to_string();
        let adapter = VideoAdapter::new(&settings);

        assert!(adapter.open(Arc::new(|_, _, _| {})).await.is_err());
        // The socket was closed again, so a second open succeeds.
        adapter.close().await;
        let settings_retry = test_settings("unwind");
        let adapter = VideoAdapter::new(&settings_retry);
        adapter.open(Arc::new(|_, _, _| {})).await.unwrap();
        adapter.close().await;
    }
}
