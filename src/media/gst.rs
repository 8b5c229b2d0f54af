//! gst-launch RTP adapter
//!
//! Alternate video source for boards whose encoder lives behind a gstreamer
//! element. The pipeline payloads H.264 into RTP and pushes it to a
//! loopback UDP port; packets forward unchanged to the peer's raw-RTP
//! track.

use std::sync::Arc;

use crate::error::Result;
use crate::process::Supervisor;
use crate::transport::{OnDatagram, UdpIngest};

/// Pipeline launch parameters.
#[derive(Debug, Clone)]
pub struct GstSettings {
    pub device_path: String,
    pub host: String,
    pub port: u16,
    pub width: u32,
    pub height: u32,
    /// kbit/s
    pub bit_rate: u32,
    pub gop: u32,
}

impl Default for GstSettings {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 10000,
            width: 1920,
            height: 1080,
            bit_rate: 10 * 1024,
            gop: 60,
        }
    }
}

impl GstSettings {
    /// The gst-launch argv. The capture element runs in mmap io-mode; drm
    /// buffers crash the rockchip encoder element.
    fn pipeline_args(&self) -> Vec<String> {
        vec![
            "-q".to_string(),
            "v4l2src".to_string(),
            format!("device={}", self.device_path),
            "io-mode=mmap".to_string(),
            "!".to_string(),
            format!(
                "video/x-raw,format=NV12,width={},height={}",
                self.width, self.height
            ),
            "!".to_string(),
            "mpph264enc".to_string(),
            format!("gop={}", self.gop),
            format!("bps={}", self.bit_rate * 1024),
            "!".to_string(),
            "rtph264pay".to_string(),
            "config-interval=-1".to_string(),
            "aggregate-mode=zero-latency".to_string(),
            "!".to_string(),
            "udpsink".to_string(),
            format!("host={}", self.host),
            format!("port={}", self.port),
        ]
    }
}

/// Supervised gst-launch pipeline plus its UDP reader.
pub struct GstAdapter {
    udp: UdpIngest,
    supervisor: Arc<Supervisor>,
}

impl GstAdapter {
    pub fn new(settings: &GstSettings) -> Self {
        Self {
            udp: UdpIngest::new(settings.host.clone(), settings.port),
            supervisor: Arc::new(Supervisor::new(
                "gst-launch-1.0",
                settings.pipeline_args(),
            )),
        }
    }

    /// Bind the UDP reader, then start the pipeline.
    pub async fn open(&self, on_data: OnDatagram) -> Result<()> {
        self.udp.open(on_data).await?;

        if let Err(e) = self.supervisor.start().await {
            self.udp.close().await;
            return Err(e);
        }

        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.supervisor.stop().await;
        self.udp.close().await;
    }
}
