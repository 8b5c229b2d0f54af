//! Signaling wire envelope
//!
//! Both channels carry the same JSON envelope: `{time, type, ...}` with
//! type-specific fields. The empty-string type is the heartbeat reply.
//! Absent and null fields are equivalent on the wire.

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{AppError, Result};

/// One signaling message in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// Unix seconds at creation
    #[serde(default)]
    pub time: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl DeviceMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            time: chrono::Utc::now().timestamp(),
            body,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageBody::Heartbeat)
    }

    pub fn error() -> Self {
        Self::new(MessageBody::Error)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(AppError::from)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(AppError::from)
    }
}

/// The recognized message types. Anything else decodes to `Unknown` and is
/// answered with `error` without touching session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageBody {
    #[serde(rename = "")]
    Heartbeat,

    #[serde(rename = "websocket-start")]
    WebSocketStart,

    #[serde(rename = "websocket-stop")]
    WebSocketStop,

    #[serde(rename = "webrtc-start")]
    WebRtcStart {
        #[serde(rename = "iceServers", default, skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
    },

    #[serde(rename = "webrtc-stop")]
    WebRtcStop,

    #[serde(rename = "webrtc-offer")]
    WebRtcOffer { offer: RTCSessionDescription },

    #[serde(rename = "webrtc-answer")]
    WebRtcAnswer { answer: RTCSessionDescription },

    #[serde(rename = "webrtc-ice-candidate")]
    WebRtcIceCandidate {
        #[serde(
            rename = "iceCandidate",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        ice_candidate: Option<RTCIceCandidateInit>,
    },

    #[serde(rename = "wake-on-lan")]
    WakeOnLan {
        #[serde(
            rename = "wakeOnLanMacAddress",
            default,
            skip_serializing_if = "String::is_empty"
        )]
        mac: String,
    },

    #[serde(rename = "error")]
    Error,

    #[serde(other)]
    Unknown,
}

/// ICE server entry supplied by the control plane on `webrtc-start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServer {
    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone(),
            credential: self.credential.clone(),
            ..Default::default()
        }
    }
}

/// Heartbeat payload published to the MQTT heartbeat topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub time: i64,
}

impl HeartbeatMessage {
    pub fn now() -> Self {
        Self {
            time: chrono::Utc::now().timestamp(),
        }
    }
}

/// Presence payload published to the MQTT status topic on graceful close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub time: i64,
    pub status: bool,
}

impl StatusMessage {
    pub fn offline() -> Self {
        Self {
            time: chrono::Utc::now().timestamp(),
            status: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webrtc_start() {
        let msg = DeviceMessage::parse(
            br#"{"time":1700000000,"type":"webrtc-start","iceServers":[{"urls":["stun:stun.example:3478"],"username":"u","credential":"c"}]}"#,
        )
        .unwrap();

        match msg.body {
            MessageBody::WebRtcStart { ice_servers } => {
                assert_eq!(ice_servers.len(), 1);
                assert_eq!(ice_servers[0].urls, vec!["stun:stun.example:3478"]);
                assert_eq!(ice_servers[0].username, "u");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_parse_heartbeat_and_bare_types() {
        let msg = DeviceMessage::parse(br#"{"time":1,"type":""}"#).unwrap();
        assert!(matches!(msg.body, MessageBody::Heartbeat));

        let msg = DeviceMessage::parse(br#"{"time":1,"type":"websocket-start"}"#).unwrap();
        assert!(matches!(msg.body, MessageBody::WebSocketStart));

        let msg = DeviceMessage::parse(br#"{"time":1,"type":"webrtc-stop"}"#).unwrap();
        assert!(matches!(msg.body, MessageBody::WebRtcStop));
    }

    #[test]
    fn test_unknown_type() {
        let msg = DeviceMessage::parse(br#"{"time":1,"type":"reboot"}"#).unwrap();
        assert!(matches!(msg.body, MessageBody::Unknown));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(DeviceMessage::parse(b"{").is_err());
        assert!(DeviceMessage::parse(b"").is_err());
    }

    #[test]
    fn test_ice_candidate_round_trip() {
        let msg = DeviceMessage::parse(
            br#"{"time":1,"type":"webrtc-ice-candidate","iceCandidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();

        let MessageBody::WebRtcIceCandidate { ice_candidate } = &msg.body else {
            panic!("unexpected body");
        };
        let candidate = ice_candidate.as_ref().unwrap();
        assert!(candidate.candidate.starts_with("candidate:1"));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));

        // The ACK omits the candidate entirely.
        let ack = DeviceMessage::new(MessageBody::WebRtcIceCandidate { ice_candidate: None });
        let json = String::from_utf8(ack.to_json().unwrap()).unwrap();
        assert!(json.contains(r#""type":"webrtc-ice-candidate""#));
        assert!(!json.contains("iceCandidate"));
    }

    #[test]
    fn test_wake_on_lan_mac_field() {
        let msg = DeviceMessage::parse(
            br#"{"time":1,"type":"wake-on-lan","wakeOnLanMacAddress":"C4:75:AB:1A:07:1B"}"#,
        )
        .unwrap();
        match msg.body {
            MessageBody::WakeOnLan { mac } => assert_eq!(mac, "C4:75:AB:1A:07:1B"),
            other => panic!("unexpected body {other:?}"),
        }

        // Field may be absent; the session then falls back to the persisted MAC.
        let msg = DeviceMessage::parse(br#"{"time":1,"type":"wake-on-lan"}"#).unwrap();
        match msg.body {
            MessageBody::WakeOnLan { mac } => assert!(mac.is_empty()),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_serializes_with_empty_type() {
        let json = String::from_utf8(DeviceMessage::heartbeat().to_json().unwrap()).unwrap();
        assert!(json.contains(r#""type":"""#));
        assert!(json.contains(r#""time":"#));
    }

    #[test]
    fn test_offer_answer_payloads() {
        let msg = DeviceMessage::parse(
            br#"{"time":1,"type":"webrtc-offer","offer":{"type":"offer","sdp":"v=0\r\n"}}"#,
        )
        .unwrap();
        let MessageBody::WebRtcOffer { offer } = msg.body else {
            panic!("unexpected body");
        };
        assert_eq!(offer.sdp, "v=0\r\n");
    }
}
