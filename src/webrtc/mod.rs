//! WebRTC peer connection management

pub mod peer;

pub use peer::{PeerHooks, PeerSession};
