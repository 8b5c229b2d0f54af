//! Application-wide error type

use thiserror::Error;

/// Errors surfaced by the agent's components.
///
/// Components never panic on external input; they return one of these
/// variants up to the session orchestrator, which either maps it to an
/// `error` reply on the originating signaling channel or starts teardown
/// when the failure is on the peer lifecycle path.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not authenticated")]
    NoAuth,

    #[error("socket listener closed")]
    ClosedListener,

    #[error("socket connection closed")]
    ClosedConnection,

    #[error("incomplete read: expected {expected}, got {got}")]
    IncompleteRead { expected: usize, got: usize },

    #[error("hid {axis} must be in [0, 32768), got {value}")]
    BadCoordinate { axis: &'static str, value: i64 },

    #[error("bad hid record: {0}")]
    BadHidRecord(String),

    #[error("{0} already open")]
    AlreadyOpen(&'static str),

    #[error("{0} not open")]
    NotOpen(&'static str),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("webrtc error: {0}")]
    WebRtc(String),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
