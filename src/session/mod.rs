//! Session orchestrator
//!
//! The root component. Owns the signaling channels, the peer connection,
//! the media adapters and the HID writer, and sequences every transition of
//! the five-state session machine:
//!
//! ```text
//! Idle -> Control -> Peered -> Streaming -> Teardown
//! ```
//!
//! Requests from either signaling channel funnel through per-channel queues
//! so replies leave in request order, on the channel that delivered the
//! request. At most one peer connection and one response WebSocket exist at
//! any instant; the video adapter runs exactly while a peer exists.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::api::{ServeApi, TokenSet};
use crate::config::{ConfigFile, DeviceConfig};
use crate::error::{AppError, Result};
use crate::hid::HidWriter;
use crate::media::{
    GstAdapter, GstSettings, MediaSource, MonitorAdapter, MonitorSettings, VideoAdapter,
    VideoSettings,
};
use crate::signaling::websocket::OnWsMessage;
use crate::signaling::{DeviceMessage, IceServer, MessageBody, MqttClient, WsClient};
use crate::speech::{SpeechAdapter, SpeechSettings};
use crate::webrtc::{PeerHooks, PeerSession};
use crate::wol;

const REQUEST_QUEUE_CAPACITY: usize = 32;
const FRAME_QUEUE_CAPACITY: usize = 64;
const ICE_QUEUE_CAPACITY: usize = 32;

/// The session machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configuration and tokens loaded, no outbound connections
    Idle,
    /// At least one signaling channel is up
    Control,
    /// A peer connection exists, ICE exchange in progress
    Peered,
    /// The first video sample went out on a connected peer
    Streaming,
    /// Shutting down
    Teardown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Control => "control",
            SessionState::Peered => "peered",
            SessionState::Streaming => "streaming",
            SessionState::Teardown => "teardown",
        };
        write!(f, "{name}")
    }
}

/// Which signaling channel delivered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Mqtt,
    ResponseWs,
}

/// Resolved configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Device serial
    pub id: String,
    pub mqtt_url: Option<String>,
    /// Backend base URL, also the WebSocket origin
    pub api_url: Option<String>,
    /// OAuth client id
    pub client_id: String,
    pub config_path: PathBuf,
    pub media_source: MediaSource,
    pub video: VideoSettings,
    pub gst: GstSettings,
    pub monitor: MonitorSettings,
    pub hid_path: String,
    pub hid_udc_path: String,
    /// Speech capture runs only when configured
    pub speech: Option<SpeechSettings>,
}

/// The singleton session.
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    settings: SessionSettings,
    state: parking_lot::RwLock<SessionState>,
    config_file: ConfigFile,
    persisted: std::sync::Mutex<DeviceConfig>,
    api: Option<Arc<ServeApi>>,

    mqtt: RwLock<Option<Arc<MqttClient>>>,
    response_ws: RwLock<Option<Arc<WsClient>>>,
    peer: RwLock<Option<Arc<PeerSession>>>,
    video: RwLock<Option<Arc<VideoAdapter>>>,
    gst: RwLock<Option<Arc<GstAdapter>>>,
    monitor: Arc<MonitorAdapter>,
    speech: Option<Arc<SpeechAdapter>>,
    hid: Arc<HidWriter>,

    /// Local candidates queue so emission order survives the async hop to
    /// the signaling channel.
    ice_tx: std::sync::Mutex<Option<mpsc::Sender<RTCIceCandidateInit>>>,
    peer_connected: AtomicBool,
    first_frame_sent: AtomicBool,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let api = match settings.api_url.as_deref() {
            Some(url) => Some(Arc::new(ServeApi::new(url, settings.client_id.clone())?)),
            None => None,
        };

        let shared = Arc::new(Shared {
            config_file: ConfigFile::new(&settings.config_path),
            persisted: std::sync::Mutex::new(DeviceConfig::default()),
            state: parking_lot::RwLock::new(SessionState::Idle),
            api,
            mqtt: RwLock::new(None),
            response_ws: RwLock::new(None),
            peer: RwLock::new(None),
            video: RwLock::new(None),
            gst: RwLock::new(None),
            monitor: Arc::new(MonitorAdapter::new(&settings.monitor)),
            speech: settings
                .speech
                .clone()
                .map(|speech| Arc::new(SpeechAdapter::new(speech))),
            hid: Arc::new(HidWriter::new(&settings.hid_path, &settings.hid_udc_path)),
            ice_tx: std::sync::Mutex::new(None),
            peer_connected: AtomicBool::new(false),
            first_frame_sent: AtomicBool::new(false),
            settings,
        });

        Ok(Self { shared })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Bring the session up: config, tokens, MQTT, monitor, speech.
    ///
    /// Individual subsystem failures are logged, not fatal; the control
    /// plane can still reach the device over whichever channel came up.
    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;

        let mut persisted = match shared.config_file.load() {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("config load failed: {}", e);
                DeviceConfig::default()
            }
        };
        if persisted.id != shared.settings.id {
            persisted.id = shared.settings.id.clone();
            if let Err(e) = shared.config_file.save(&persisted) {
                warn!("config save failed: {}", e);
            }
        }
        *shared.persisted.lock().unwrap() = persisted.clone();

        if let Some(api) = &shared.api {
            api.set_tokens(TokenSet {
                access_token: persisted.access_token.clone(),
                access_token_expires_at: persisted.access_token_expires_at,
                refresh_token: persisted.refresh_token.clone(),
                refresh_token_expires_at: persisted.refresh_token_expires_at,
            })
            .await;

            // Persist every token mutation before the new tokens are
            // surfaced; the hook runs inside the store's write lock.
            let weak = Arc::downgrade(shared);
            api.set_on_update(Arc::new(move |tokens| {
                let Some(shared) = weak.upgrade() else { return };
                let mut persisted = shared.persisted.lock().unwrap();
                persisted.access_token = tokens.access_token.clone();
                persisted.access_token_expires_at = tokens.access_token_expires_at;
                persisted.refresh_token = tokens.refresh_token.clone();
                persisted.refresh_token_expires_at = tokens.refresh_token_expires_at;
                if let Err(e) = shared.config_file.save(&persisted) {
                    warn!("config save failed: {}", e);
                }
            }));
        }

        // Local ICE candidates drain through one queue so they reach the
        // signaling channel in emission order.
        let (ice_tx, mut ice_rx) = mpsc::channel(ICE_QUEUE_CAPACITY);
        *shared.ice_tx.lock().unwrap() = Some(ice_tx);
        let ice_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(candidate) = ice_rx.recv().await {
                ice_shared.send_ice_candidate(candidate).await;
            }
        });

        if let Some(mqtt_url) = shared.settings.mqtt_url.clone() {
            let (request_tx, request_rx) = mpsc::channel::<Bytes>(REQUEST_QUEUE_CAPACITY);
            let on_request = Arc::new(move |payload: Bytes| {
                if request_tx.try_send(payload).is_err() {
                    warn!("mqtt request queue full, dropping request");
                }
            });

            match MqttClient::open(&mqtt_url, &shared.settings.id, on_request).await {
                Ok(mqtt) => {
                    *shared.mqtt.write().await = Some(mqtt);
                    shared.spawn_dispatcher(Channel::Mqtt, request_rx);
                    shared.set_state(SessionState::Control);
                }
                Err(e) => warn!("mqtt open failed: {}", e),
            }
        }

        if let Err(e) = self.shared.monitor.open().await {
            warn!("video monitor open failed: {}", e);
        }

        if let (Some(speech), Some(api)) = (&shared.speech, &shared.api) {
            let result = speech
                .open(
                    api,
                    &shared.settings.id,
                    Arc::new(|text: String| info!("transcript: {}", text)),
                )
                .await;
            if let Err(e) = result {
                warn!("speech open failed: {}", e);
            }
        }

        info!("session open, state {}", shared.state());
        Ok(())
    }

    /// Orderly teardown in reverse dependency order: the peer stack first,
    /// then the channels, then the standalone adapters.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.set_state(SessionState::Teardown);

        let peer = shared.peer.write().await.take();
        if let Some(peer) = peer {
            let _ = peer.close().await;
        }
        shared.release_peer_resources().await;

        if let Some(speech) = &shared.speech {
            speech.close().await;
        }

        if let Some(ws) = shared.response_ws.write().await.take() {
            ws.close().await;
        }

        if let Some(mqtt) = shared.mqtt.write().await.take() {
            mqtt.close().await;
        }

        shared.monitor.close().await;
        shared.hid.close();
        shared.ice_tx.lock().unwrap().take();

        info!("session closed");
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current != state {
            info!("session state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn api(&self) -> Result<&Arc<ServeApi>> {
        self.api
            .as_ref()
            .ok_or_else(|| AppError::Config("no backend url configured".to_string()))
    }

    /// Process queued requests for one channel sequentially so replies keep
    /// request order.
    fn spawn_dispatcher(self: &Arc<Self>, channel: Channel, mut rx: mpsc::Receiver<Bytes>) {
        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let reply = shared.handle_message(channel, &payload).await;
                shared.send_on(channel, &reply).await;
            }
            debug!("{:?} dispatcher finished", channel);
        });
    }

    /// The transition function: one inbound message to one reply.
    async fn handle_message(self: &Arc<Self>, origin: Channel, payload: &[u8]) -> DeviceMessage {
        let message = match DeviceMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{:?} request parse failed: {}", origin, e);
                return DeviceMessage::error();
            }
        };

        match message.body {
            MessageBody::Heartbeat | MessageBody::Error => DeviceMessage::heartbeat(),

            MessageBody::WebSocketStart => {
                self.reply(origin, "websocket start", self.ws_start().await, || {
                    MessageBody::WebSocketStart
                })
            }

            MessageBody::WebSocketStop => {
                self.reply(origin, "websocket stop", self.ws_stop().await, || {
                    MessageBody::WebSocketStop
                })
            }

            MessageBody::WebRtcStart { ice_servers } => self.reply(
                origin,
                "webrtc start",
                self.wrtc_start(ice_servers).await,
                || MessageBody::WebRtcStart {
                    ice_servers: Vec::new(),
                },
            ),

            MessageBody::WebRtcStop => {
                self.reply(origin, "webrtc stop", self.wrtc_stop().await, || {
                    MessageBody::WebRtcStop
                })
            }

            MessageBody::WebRtcOffer { offer } => match self.use_offer(offer).await {
                Ok(answer) => DeviceMessage::new(MessageBody::WebRtcAnswer { answer }),
                Err(e) => {
                    warn!("webrtc offer failed: {}", e);
                    DeviceMessage::error()
                }
            },

            MessageBody::WebRtcIceCandidate { ice_candidate } => self.reply(
                origin,
                "webrtc ice candidate",
                self.use_ice_candidate(ice_candidate).await,
                || MessageBody::WebRtcIceCandidate {
                    ice_candidate: None,
                },
            ),

            MessageBody::WakeOnLan { mac } => {
                self.reply(origin, "wake on lan", self.send_wol(&mac), || {
                    MessageBody::WakeOnLan { mac: String::new() }
                })
            }

            MessageBody::WebRtcAnswer { .. } | MessageBody::Unknown => {
                warn!("{:?} request with unexpected type", origin);
                DeviceMessage::error()
            }
        }
    }

    fn reply(
        &self,
        origin: Channel,
        action: &str,
        result: Result<()>,
        body: impl FnOnce() -> MessageBody,
    ) -> DeviceMessage {
        match result {
            Ok(()) => DeviceMessage::new(body()),
            Err(e) => {
                warn!("{:?} {} failed: {}", origin, action, e);
                DeviceMessage::error()
            }
        }
    }

    async fn send_on(&self, channel: Channel, message: &DeviceMessage) {
        let result = match channel {
            Channel::Mqtt => match self.mqtt.read().await.clone() {
                Some(mqtt) => mqtt.send(message).await,
                None => return,
            },
            Channel::ResponseWs => match self.response_ws.read().await.clone() {
                Some(ws) => ws.send(message).await,
                None => return,
            },
        };

        if let Err(e) = result {
            warn!("{:?} reply send failed: {}", channel, e);
        }
    }

    /// Dial the response WebSocket with a fresh access token.
    async fn ws_start(self: &Arc<Self>) -> Result<()> {
        let api = self.api()?;

        let mut slot = self.response_ws.write().await;
        if slot.is_some() {
            return Err(AppError::AlreadyOpen("response websocket"));
        }

        let url = api.device_response_url(&self.settings.id)?;
        let access_token = api.get_access_token().await?;

        let (request_tx, request_rx) = mpsc::channel::<Bytes>(REQUEST_QUEUE_CAPACITY);
        let on_message: OnWsMessage = Arc::new(move |payload| {
            if request_tx.try_send(payload).is_err() {
                warn!("response ws queue full, dropping request");
            }
        });

        let ws = WsClient::connect(url, &access_token, on_message).await?;
        *slot = Some(ws.clone());
        drop(slot);

        self.spawn_dispatcher(Channel::ResponseWs, request_rx);

        // Announce presence on the new channel.
        if let Err(e) = ws.send(&DeviceMessage::heartbeat()).await {
            warn!("response ws heartbeat failed: {}", e);
        }

        if self.state() == SessionState::Idle {
            self.set_state(SessionState::Control);
        }

        Ok(())
    }

    async fn ws_stop(&self) -> Result<()> {
        let ws = self
            .response_ws
            .write()
            .await
            .take()
            .ok_or(AppError::NotOpen("response websocket"))?;

        ws.close().await;
        Ok(())
    }

    /// Create the peer and start the configured video source. A failure in
    /// the media path unwinds the peer again; the state machine stays in
    /// Control.
    async fn wrtc_start(self: &Arc<Self>, ice_servers: Vec<IceServer>) -> Result<()> {
        let peer = {
            let mut slot = self.peer.write().await;
            if slot.is_some() {
                return Err(AppError::AlreadyOpen("peer connection"));
            }

            let hooks: Arc<dyn PeerHooks> = Arc::new(SessionPeerHooks {
                shared: Arc::downgrade(self),
            });
            let servers = ice_servers.iter().map(IceServer::to_rtc).collect();
            let peer = PeerSession::open(servers, hooks).await?;

            self.peer_connected.store(false, Ordering::SeqCst);
            self.first_frame_sent.store(false, Ordering::SeqCst);
            *slot = Some(peer.clone());
            peer
        };

        if let Err(e) = self.media_start(&peer).await {
            warn!("media start failed, rolling back peer: {}", e);
            let _ = peer.close().await;
            self.release_peer_resources().await;
            return Err(e);
        }

        self.set_state(SessionState::Peered);
        Ok(())
    }

    async fn wrtc_stop(self: &Arc<Self>) -> Result<()> {
        let peer = self
            .peer
            .write()
            .await
            .take()
            .ok_or(AppError::NotOpen("peer connection"))?;

        let _ = peer.close().await;
        self.release_peer_resources().await;
        Ok(())
    }

    /// Attach the configured video source to the peer.
    async fn media_start(self: &Arc<Self>, peer: &Arc<PeerSession>) -> Result<()> {
        match self.settings.media_source {
            MediaSource::Video => {
                let mut slot = self.video.write().await;
                if slot.is_some() {
                    return Err(AppError::AlreadyOpen("video adapter"));
                }

                peer.add_video_track_sample().await?;

                // Frames hop from the socket reader onto this queue; the
                // pump writes them to the track in receipt order and drops
                // frames rather than stalling the reader when the peer is
                // congested.
                let (frame_tx, mut frame_rx) =
                    mpsc::channel::<(u64, Bytes)>(FRAME_QUEUE_CAPACITY);
                let pump_shared = self.clone();
                tokio::spawn(async move {
                    while let Some((timestamp, frame)) = frame_rx.recv().await {
                        let peer = pump_shared.peer.read().await.clone();
                        let Some(peer) = peer else { continue };
                        match peer.write_video_sample(frame, timestamp).await {
                            Ok(()) => pump_shared.note_first_frame(),
                            Err(e) => debug!("video sample write failed: {}", e),
                        }
                    }
                });

                let adapter = Arc::new(VideoAdapter::new(&self.settings.video));
                adapter
                    .open(Arc::new(move |_id, timestamp, frame| {
                        let _ = frame_tx.try_send((timestamp, frame));
                    }))
                    .await?;

                *slot = Some(adapter);
            }

            MediaSource::Gstreamer => {
                let mut slot = self.gst.write().await;
                if slot.is_some() {
                    return Err(AppError::AlreadyOpen("gstreamer adapter"));
                }

                peer.add_video_track_rtp().await?;

                let (packet_tx, mut packet_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE_CAPACITY);
                let pump_shared = self.clone();
                tokio::spawn(async move {
                    while let Some(packet) = packet_rx.recv().await {
                        let peer = pump_shared.peer.read().await.clone();
                        let Some(peer) = peer else { continue };
                        match peer.write_video_rtp(&packet).await {
                            Ok(()) => pump_shared.note_first_frame(),
                            Err(e) => debug!("rtp write failed: {}", e),
                        }
                    }
                });

                let adapter = Arc::new(GstAdapter::new(&self.settings.gst));
                adapter
                    .open(Arc::new(move |packet| {
                        let _ = packet_tx.try_send(packet);
                    }))
                    .await?;

                *slot = Some(adapter);
            }
        }

        Ok(())
    }

    async fn media_stop(&self) {
        if let Some(video) = self.video.write().await.take() {
            video.close().await;
        }
        if let Some(gst) = self.gst.write().await.take() {
            gst.close().await;
        }
    }

    /// Tear down everything the peer owned. Safe to call repeatedly and
    /// from the peer's own close notification. The response WebSocket stays
    /// open; it closes only on `websocket-stop` or shutdown.
    async fn release_peer_resources(self: &Arc<Self>) {
        self.hid.close();
        self.media_stop().await;

        if let Some(peer) = self.peer.write().await.take() {
            let _ = peer.close().await;
        }

        self.peer_connected.store(false, Ordering::SeqCst);
        self.first_frame_sent.store(false, Ordering::SeqCst);

        if !matches!(self.state(), SessionState::Teardown | SessionState::Idle) {
            self.set_state(SessionState::Control);
        }
    }

    async fn use_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or(AppError::NotOpen("peer connection"))?;

        peer.use_offer(offer).await
    }

    async fn use_ice_candidate(&self, candidate: Option<RTCIceCandidateInit>) -> Result<()> {
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or(AppError::NotOpen("peer connection"))?;

        // A null candidate is legal end-of-gathering chatter.
        let Some(candidate) = candidate else {
            return Ok(());
        };

        peer.add_ice_candidate(candidate).await
    }

    /// Forward a local candidate, preferring the response WebSocket, then
    /// MQTT. With neither open the candidate is dropped with a warning.
    async fn send_ice_candidate(&self, candidate: RTCIceCandidateInit) {
        let message = DeviceMessage::new(MessageBody::WebRtcIceCandidate {
            ice_candidate: Some(candidate),
        });

        if let Some(ws) = self.response_ws.read().await.clone() {
            if let Err(e) = ws.send(&message).await {
                warn!("ice candidate send over websocket failed: {}", e);
            }
            return;
        }

        if let Some(mqtt) = self.mqtt.read().await.clone() {
            if let Err(e) = mqtt.send(&message).await {
                warn!("ice candidate send over mqtt failed: {}", e);
            }
            return;
        }

        warn!("no signaling channel open, dropping ice candidate");
    }

    /// Adopt an inbound data channel. Only the `hid` label is recognized;
    /// anything else is refused and closed by the peer controller.
    fn use_data_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) -> bool {
        if channel.label() != "hid" {
            info!("rejecting data channel {:?}", channel.label());
            return false;
        }

        if let Err(e) = self.hid.open() {
            warn!("hid open failed: {}", e);
        }

        let hid = self.hid.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let hid = hid.clone();
            Box::pin(async move {
                if let Err(e) = hid.send(&message.data) {
                    warn!("hid send failed: {}", e);
                }
            })
        }));

        info!("hid data channel adopted");
        true
    }

    fn note_first_frame(&self) {
        if !self.first_frame_sent.swap(true, Ordering::SeqCst) {
            debug!("first video frame sent");
        }
        self.maybe_enter_streaming();
    }

    fn maybe_enter_streaming(&self) {
        if self.peer_connected.load(Ordering::SeqCst)
            && self.first_frame_sent.load(Ordering::SeqCst)
            && self.state() == SessionState::Peered
        {
            self.set_state(SessionState::Streaming);
        }
    }

    /// Emit the magic packet. The message MAC wins; an empty field falls
    /// back to the persisted `wakeOnLanMac`.
    fn send_wol(&self, mac: &str) -> Result<()> {
        let mac = if mac.is_empty() {
            self.persisted.lock().unwrap().wake_on_lan_mac.clone()
        } else {
            mac.to_string()
        };

        if mac.is_empty() {
            return Err(AppError::Config("wake on lan mac is empty".to_string()));
        }

        wol::send_wol(&mac)
    }
}

/// The peer's view of the session. Holds only a weak back-reference so a
/// closing session is never kept alive by its own peer callbacks.
struct SessionPeerHooks {
    shared: Weak<Shared>,
}

impl PeerHooks for SessionPeerHooks {
    fn emit_ice(&self, candidate: RTCIceCandidateInit) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let tx = shared.ice_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            if tx.try_send(candidate).is_err() {
                warn!("ice queue full, dropping candidate");
            }
        }
    }

    fn adopt_channel(&self, channel: Arc<RTCDataChannel>) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.use_data_channel(channel),
            None => false,
        }
    }

    fn on_connected(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.peer_connected.store(true, Ordering::SeqCst);
        shared.maybe_enter_streaming();
    }

    fn on_close(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            shared.release_peer_resources().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(name: &str) -> SessionSettings {
        let tmp = std::env::temp_dir();
        SessionSettings {
            id: "dev-test".to_string(),
            mqtt_url: None,
            api_url: Some("https://backend.example".to_string()),
            client_id: "device".to_string(),
            config_path: tmp.join(format!("kvm-agent-session-{}-{}.json", name, std::process::id())),
            media_source: MediaSource::Video,
            video: VideoSettings {
                bin_path: "sleep".to_string(),
                device_path: "30".to_string(),
                socket_path: tmp
                    .join(format!("kvm-agent-sess-video-{}-{}.sock", name, std::process::id()))
                    .to_string_lossy()
                    .to_string(),
                ..Default::default()
            },
            gst: GstSettings::default(),
            monitor: MonitorSettings {
                bin_path: "sleep".to_string(),
                device_path: "30".to_string(),
                socket_path: tmp
                    .join(format!("kvm-agent-sess-mon-{}-{}.sock", name, std::process::id()))
                    .to_string_lossy()
                    .to_string(),
            },
            hid_path: "/nonexistent/hidg0".to_string(),
            hid_udc_path: String::new(),
            speech: None,
        }
    }

    fn body_type(message: &DeviceMessage) -> &'static str {
        match message.body {
            MessageBody::Heartbeat => "",
            MessageBody::Error => "error",
            MessageBody::WebSocketStart => "websocket-start",
            MessageBody::WebSocketStop => "websocket-stop",
            MessageBody::WebRtcStart { .. } => "webrtc-start",
            MessageBody::WebRtcStop => "webrtc-stop",
            MessageBody::WebRtcAnswer { .. } => "webrtc-answer",
            _ => "other",
        }
    }

    #[tokio::test]
    async fn test_unknown_type_yields_error_and_no_state_change() {
        let session = Session::new(test_settings("unknown")).unwrap();
        let state = session.state();

        let reply = session
            .shared
            .handle_message(Channel::Mqtt, br#"{"time":1,"type":"reboot"}"#)
            .await;

        assert_eq!(body_type(&reply), "error");
        assert_eq!(session.state(), state);
    }

    #[tokio::test]
    async fn test_heartbeat_and_error_get_heartbeat_reply() {
        let session = Session::new(test_settings("heartbeat")).unwrap();

        let reply = session
            .shared
            .handle_message(Channel::Mqtt, br#"{"time":1,"type":""}"#)
            .await;
        assert_eq!(body_type(&reply), "");

        let reply = session
            .shared
            .handle_message(Channel::Mqtt, br#"{"time":1,"type":"error"}"#)
            .await;
        assert_eq!(body_type(&reply), "");
    }

    #[tokio::test]
    async fn test_malformed_payload_yields_error() {
        let session = Session::new(test_settings("malformed")).unwrap();

        let reply = session.shared.handle_message(Channel::Mqtt, b"{oops").await;
        assert_eq!(body_type(&reply), "error");
    }

    #[tokio::test]
    async fn test_offer_and_candidate_without_peer_fail() {
        let session = Session::new(test_settings("nopeer")).unwrap();

        let reply = session
            .shared
            .handle_message(
                Channel::ResponseWs,
                br#"{"time":1,"type":"webrtc-offer","offer":{"type":"offer","sdp":"v=0\r\n"}}"#,
            )
            .await;
        assert_eq!(body_type(&reply), "error");

        let reply = session
            .shared
            .handle_message(
                Channel::ResponseWs,
                br#"{"time":1,"type":"webrtc-ice-candidate","iceCandidate":{"candidate":"candidate:0"}}"#,
            )
            .await;
        assert_eq!(body_type(&reply), "error");
    }

    #[tokio::test]
    async fn test_wake_on_lan_without_any_mac_fails() {
        let session = Session::new(test_settings("wolmac")).unwrap();

        let reply = session
            .shared
            .handle_message(Channel::Mqtt, br#"{"time":1,"type":"wake-on-lan"}"#)
            .await;
        assert_eq!(body_type(&reply), "error");
    }

    #[tokio::test]
    async fn test_websocket_stop_without_start_fails() {
        let session = Session::new(test_settings("wsstop")).unwrap();

        let reply = session
            .shared
            .handle_message(Channel::Mqtt, br#"{"time":1,"type":"websocket-stop"}"#)
            .await;
        assert_eq!(body_type(&reply), "error");
    }

    #[tokio::test]
    async fn test_webrtc_start_stop_cycle() {
        let settings = test_settings("cycle");
        let session = Session::new(settings).unwrap();
        session.shared.set_state(SessionState::Control);

        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-start"}"#)
            .await;
        assert_eq!(body_type(&reply), "webrtc-start");
        assert_eq!(session.state(), SessionState::Peered);
        assert!(session.shared.peer.read().await.is_some());
        assert!(session.shared.video.read().await.is_some());

        // A second start must be refused while the peer lives.
        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-start"}"#)
            .await;
        assert_eq!(body_type(&reply), "error");

        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-stop"}"#)
            .await;
        assert_eq!(body_type(&reply), "webrtc-stop");
        assert_eq!(session.state(), SessionState::Control);
        assert!(session.shared.peer.read().await.is_none());
        assert!(session.shared.video.read().await.is_none());

        let _ = std::fs::remove_file(&session.shared.settings.config_path);
    }

    #[tokio::test]
    async fn test_webrtc_start_rolls_back_on_media_failure() {
        let mut settings = test_settings("rollback");
        settings.video.bin_path = "/nonexistent/encoder".to_string();
        let session = Session::new(settings).unwrap();
        session.shared.set_state(SessionState::Control);

        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-start"}"#)
            .await;

        assert_eq!(body_type(&reply), "error");
        assert_eq!(session.state(), SessionState::Control);
        assert!(session.shared.peer.read().await.is_none());
        assert!(session.shared.video.read().await.is_none());
    }

    #[tokio::test]
    async fn test_offer_answered_while_peered() {
        let session = Session::new(test_settings("offer")).unwrap();
        session.shared.set_state(SessionState::Control);

        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-start"}"#)
            .await;
        assert_eq!(body_type(&reply), "webrtc-start");

        // A remote peer connection plays the browser side.
        let api = webrtc::api::APIBuilder::new().build();
        let remote = api
            .new_peer_connection(Default::default())
            .await
            .unwrap();
        remote.create_data_channel("hid", None).await.unwrap();
        let offer = remote.create_offer(None).await.unwrap();
        remote.set_local_description(offer.clone()).await.unwrap();

        let payload = DeviceMessage::new(MessageBody::WebRtcOffer { offer })
            .to_json()
            .unwrap();
        let reply = session
            .shared
            .handle_message(Channel::ResponseWs, &payload)
            .await;
        assert_eq!(body_type(&reply), "webrtc-answer");

        let _ = remote.close().await;
        session
            .shared
            .handle_message(Channel::ResponseWs, br#"{"time":1,"type":"webrtc-stop"}"#)
            .await;
    }
}
