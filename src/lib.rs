//! kvm-agent - KVM-over-IP endpoint for headless capture appliances
//!
//! Turns a device with HDMI capture and a USB gadget port into a
//! browser-reachable KVM: encoded H.264 streams out over a WebRTC peer
//! connection, the operator's keyboard and mouse come back over a data
//! channel and are injected into the attached host as USB HID reports.
//! MQTT and an authenticated WebSocket broker the signaling.

pub mod api;
pub mod config;
pub mod error;
pub mod hid;
pub mod media;
pub mod process;
pub mod session;
pub mod signaling;
pub mod speech;
pub mod transport;
pub mod utils;
pub mod webrtc;
pub mod wol;

pub use error::{AppError, Result};
