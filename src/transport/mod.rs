//! Local transports for helper-binary pipelines
//!
//! Every helper process (encoder, HDMI monitor, speech capture) talks to the
//! agent over a framed Unix stream socket; the gstreamer video source pushes
//! RTP over loopback UDP instead. Both transports deliver payloads through a
//! caller-supplied callback and are torn down with cooperative cancellation.

pub mod framed;
pub mod header;
pub mod udp;

pub use framed::{FramedSocket, OnFrame};
pub use header::{FrameHeader, FRAME_HEADER_LEN, MAX_FRAME_BODY};
pub use udp::{OnDatagram, UdpIngest};
