//! Loopback UDP ingest for the gstreamer video source
//!
//! The gst-launch pipeline emits RTP/H264 to a local UDP port; this reader
//! forwards each datagram verbatim. Datagrams are bounded by a 1600-byte
//! MTU buffer.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

const UDP_FRAME_BUFFER_SIZE: usize = 1600;

/// Callback invoked for every received datagram.
pub type OnDatagram = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Bound UDP socket reading datagrams on a dedicated task.
pub struct UdpIngest {
    host: String,
    port: u16,
    cancel: Mutex<Option<CancellationToken>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpIngest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            cancel: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub async fn open(&self, on_data: OnDatagram) -> Result<()> {
        let mut cancel = self.cancel.lock().await;
        if cancel.is_some() {
            return Err(AppError::AlreadyOpen("udp socket"));
        }

        let socket = UdpSocket::bind((self.host.as_str(), self.port)).await?;

        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        drop(cancel);

        let handle = tokio::spawn(async move {
            let mut buffer = [0u8; UDP_FRAME_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("udp reader cancelled");
                        return;
                    }
                    received = socket.recv_from(&mut buffer) => {
                        match received {
                            Ok((n, _)) => on_data(Bytes::copy_from_slice(&buffer[..n])),
                            Err(e) => {
                                warn!("udp read error: {}", e);
                                return;
                            }
                        }
                    }
                }
            }
        });
        *self.reader.lock().await = Some(handle);

        Ok(())
    }

    /// Cancel the reader and wait for it. Idempotent.
    pub async fn close(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
    }
}
