//! Video source adapters
//!
//! Two interchangeable sources feed the peer's video track:
//!
//! - [`VideoAdapter`] runs the H.264 encoder binary and reads complete
//!   access units from a framed socket (sample-flavored track).
//! - [`GstAdapter`] runs a gst-launch pipeline that emits RTP/H264 over
//!   loopback UDP (raw-RTP-flavored track).
//!
//! [`MonitorAdapter`] watches HDMI presence and input resolution through
//! the same framed-socket protocol, body-less.

pub mod gst;
pub mod monitor;
pub mod video;

pub use gst::{GstAdapter, GstSettings};
pub use monitor::{HdmiState, MonitorAdapter, MonitorSettings, MonitorStatus};
pub use video::{VideoAdapter, VideoSettings};

/// Which video source a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    /// Framed-socket encoder binary
    Video,
    /// gst-launch RTP pipeline
    Gstreamer,
}

impl MediaSource {
    /// Map the CLI integer (1 = encoder, 2 = gstreamer).
    pub fn from_flag(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Video),
            2 => Some(Self::Gstreamer),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_source_flag() {
        assert_eq!(MediaSource::from_flag(1), Some(MediaSource::Video));
        assert_eq!(MediaSource::from_flag(2), Some(MediaSource::Gstreamer));
        assert_eq!(MediaSource::from_flag(0), None);
        assert_eq!(MediaSource::from_flag(3), None);
    }
}
