//! Signaling channels
//!
//! Two transports carry the same JSON message set: a broker-mediated MQTT
//! client and a direct, token-bearing WebSocket. The session orchestrator
//! answers every request on the channel that delivered it.

pub mod message;
pub mod mqtt;
pub mod websocket;

pub use message::{DeviceMessage, HeartbeatMessage, IceServer, MessageBody, StatusMessage};
pub use mqtt::{MqttClient, MqttSettings};
pub use websocket::WsClient;
