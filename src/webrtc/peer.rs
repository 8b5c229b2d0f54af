//! Peer-connection controller
//!
//! Wraps one `RTCPeerConnection` with exactly one outbound video track and
//! the inbound `hid` data channel. The controller reaches back into its
//! owner only through the [`PeerHooks`] trait; the hook slot is cleared at
//! the start of close so no library callback can fire into torn-down state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocalWriter;

use crate::error::{AppError, Result};

/// The owner-facing side of a peer connection.
///
/// Implementations hold only a weak back-reference to the session so a live
/// peer never extends its owner's lifetime.
pub trait PeerHooks: Send + Sync {
    /// A local ICE candidate is ready for the signaling channel.
    fn emit_ice(&self, candidate: RTCIceCandidateInit);

    /// An inbound data channel opened. Return `true` to adopt it; a
    /// rejected channel is closed by the controller.
    fn adopt_channel(&self, channel: Arc<RTCDataChannel>) -> bool;

    /// The peer transport reached Connected.
    fn on_connected(&self);

    /// The controller finished closing; shared resources can be released.
    fn on_close(&self);
}

/// Duration of a media sample: the capture-clock delta to the previous
/// sample, so playback speed follows the capture clock rather than packet
/// arrival. The first sample has no predecessor and gets zero.
fn sample_duration(previous_us: Option<u64>, timestamp_us: u64) -> Duration {
    match previous_us {
        Some(previous) => Duration::from_micros(timestamp_us.saturating_sub(previous)),
        None => Duration::ZERO,
    }
}

/// One WebRTC peer connection and its media plumbing.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    hooks: Arc<std::sync::RwLock<Option<Arc<dyn PeerHooks>>>>,
    sample_track: RwLock<Option<Arc<TrackLocalStaticSample>>>,
    rtp_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    last_sample_us: Mutex<Option<u64>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create the peer connection and wire its event handlers.
    pub async fn open(
        ice_servers: Vec<RTCIceServer>,
        hooks: Arc<dyn PeerHooks>,
    ) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| AppError::WebRtc(format!("create peer connection: {e}")))?;

        let session = Arc::new(Self {
            pc: Arc::new(pc),
            hooks: Arc::new(std::sync::RwLock::new(Some(hooks))),
            sample_track: RwLock::new(None),
            rtp_track: RwLock::new(None),
            last_sample_us: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        session.setup_handlers();

        Ok(session)
    }

    fn setup_handlers(self: &Arc<Self>) {
        // Handlers hold a weak reference; the peer connection must not keep
        // its own session alive through the callback chain.
        let weak: Weak<Self> = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(session) = weak.upgrade() else { return };
                    info!("peer connection state: {}", state);

                    match state {
                        RTCPeerConnectionState::Connected => {
                            if let Some(hooks) = session.hooks() {
                                hooks.on_connected();
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            // Close on a separate task; tearing the peer
                            // down from inside its own event callback would
                            // stall the library's ops loop.
                            tokio::spawn(async move {
                                if let Err(e) = session.close().await {
                                    warn!("peer close after {} failed: {}", state, e);
                                }
                            });
                        }
                        _ => {}
                    }
                })
            }));

        let hooks = self.hooks.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let hooks = hooks.clone();
                Box::pin(async move {
                    // A null candidate marks the end of gathering; legal,
                    // silently dropped.
                    let Some(candidate) = candidate else { return };

                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!("ice candidate serialization failed: {}", e);
                            return;
                        }
                    };

                    let hooks = hooks.read().unwrap().clone();
                    if let Some(hooks) = hooks {
                        hooks.emit_ice(init);
                    }
                })
            }));

        let hooks = self.hooks.clone();
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let hooks = hooks.clone();
                Box::pin(async move {
                    let adopted = hooks
                        .read()
                        .unwrap()
                        .clone()
                        .map(|hooks| hooks.adopt_channel(channel.clone()))
                        .unwrap_or(false);

                    if !adopted {
                        debug!("closing unadopted data channel {:?}", channel.label());
                        if let Err(e) = channel.close().await {
                            warn!("data channel close failed: {}", e);
                        }
                    }
                })
            }));
    }

    fn hooks(&self) -> Option<Arc<dyn PeerHooks>> {
        self.hooks.read().unwrap().clone()
    }

    /// Add the sample-flavored H.264 track fed by the encoder adapter.
    pub async fn add_video_track_sample(&self) -> Result<()> {
        let mut slot = self.sample_track.write().await;
        if slot.is_some() || self.rtp_track.read().await.is_some() {
            return Err(AppError::AlreadyOpen("video track"));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            "video".to_string(),
            "kvm-agent".to_string(),
        ));
        self.pc
            .add_track(track.clone())
            .await
            .map_err(|e| AppError::WebRtc(format!("add video track: {e}")))?;

        *slot = Some(track);
        Ok(())
    }

    /// Add the raw-RTP track fed by the gstreamer adapter.
    pub async fn add_video_track_rtp(&self) -> Result<()> {
        // Lock order matches add_video_track_sample: sample before rtp.
        let sample = self.sample_track.read().await;
        let mut slot = self.rtp_track.write().await;
        if slot.is_some() || sample.is_some() {
            return Err(AppError::AlreadyOpen("video track"));
        }
        drop(sample);

        let track = Arc::new(TrackLocalStaticRTP::new(
            h264_capability(),
            "video".to_string(),
            "kvm-agent".to_string(),
        ));
        self.pc
            .add_track(track.clone())
            .await
            .map_err(|e| AppError::WebRtc(format!("add rtp track: {e}")))?;

        *slot = Some(track);
        Ok(())
    }

    /// Write one access unit with its capture timestamp in microseconds.
    /// Writes on a closed or trackless session are dropped silently.
    pub async fn write_video_sample(&self, frame: Bytes, timestamp_us: u64) -> Result<()> {
        let track = self.sample_track.read().await;
        let Some(track) = track.as_ref() else {
            return Ok(());
        };

        let duration = {
            let mut last = self.last_sample_us.lock().unwrap();
            let duration = sample_duration(*last, timestamp_us);
            *last = Some(timestamp_us);
            duration
        };

        track
            .write_sample(&Sample {
                data: frame,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::WebRtc(format!("write sample: {e}")))
    }

    /// Forward an opaque RTP packet unchanged.
    pub async fn write_video_rtp(&self, packet: &[u8]) -> Result<()> {
        let track = self.rtp_track.read().await;
        let Some(track) = track.as_ref() else {
            return Ok(());
        };

        track
            .write(packet)
            .await
            .map_err(|e| AppError::WebRtc(format!("write rtp: {e}")))?;
        Ok(())
    }

    /// Apply the remote offer and return the local answer.
    pub async fn use_offer(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| AppError::WebRtc(format!("set remote description: {e}")))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("create answer: {e}")))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtc(format!("set local description: {e}")))?;

        Ok(answer)
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| AppError::WebRtc(format!("add ice candidate: {e}")))
    }

    /// Drop the tracks, close the peer connection, then notify the owner.
    /// Idempotent; the hook slot is emptied first so no further callback
    /// reaches the owner.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let hooks = self.hooks.write().unwrap().take();

        *self.sample_track.write().await = None;
        *self.rtp_track.write().await = None;

        let close_result = self
            .pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("close peer connection: {e}")));

        if let Some(hooks) = hooks {
            hooks.on_close();
        }

        close_result
    }
}

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingHooks {
        ice: AtomicUsize,
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    impl RecordingHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ice: AtomicUsize::new(0),
                connected: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    impl PeerHooks for RecordingHooks {
        fn emit_ice(&self, _candidate: RTCIceCandidateInit) {
            self.ice.fetch_add(1, Ordering::SeqCst);
        }

        fn adopt_channel(&self, channel: Arc<RTCDataChannel>) -> bool {
            channel.label() == "hid"
        }

        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_sample_duration_rebases_on_capture_clock() {
        assert_eq!(sample_duration(None, 1_000_000), Duration::ZERO);
        assert_eq!(
            sample_duration(Some(1_000_000), 1_033_333),
            Duration::from_micros(33_333)
        );
        // A clock step backwards must not panic or produce a huge duration.
        assert_eq!(sample_duration(Some(2_000_000), 1_000_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let hooks = RecordingHooks::new();
        let session = PeerSession::open(vec![], hooks.clone()).await.unwrap();
        session.add_video_track_sample().await.unwrap();

        // A second, plain peer connection plays the browser.
        let api = APIBuilder::new().build();
        let remote = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        remote.create_data_channel("hid", None).await.unwrap();
        let offer = remote.create_offer(None).await.unwrap();
        remote.set_local_description(offer.clone()).await.unwrap();

        let answer = session.use_offer(offer).await.unwrap();
        assert!(!answer.sdp.is_empty());

        session.close().await.unwrap();
        let _ = remote.close().await;
        assert_eq!(hooks.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_one_video_track_flavor() {
        let session = PeerSession::open(vec![], RecordingHooks::new())
            .await
            .unwrap();

        session.add_video_track_sample().await.unwrap();
        assert!(matches!(
            session.add_video_track_rtp().await,
            Err(AppError::AlreadyOpen(_))
        ));
        assert!(matches!(
            session.add_video_track_sample().await,
            Err(AppError::AlreadyOpen(_))
        ));

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let hooks = RecordingHooks::new();
        let session = PeerSession::open(vec![], hooks.clone()).await.unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(hooks.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_writes_without_track_are_dropped() {
        let session = PeerSession::open(vec![], RecordingHooks::new())
            .await
            .unwrap();

        session
            .write_video_sample(Bytes::from_static(b"frame"), 1)
            .await
            .unwrap();
        session.write_video_rtp(b"rtp").await.unwrap();

        session.close().await.unwrap();
    }
}
