//! Speech capture adapter
//!
//! Runs the audio capture binary, reads S16LE PCM records from its framed
//! socket and forwards each body verbatim as a binary frame to the
//! backend's speech WebSocket. Result JSON arriving on that socket is
//! accumulated and surfaced as a single transcript, joined in timestamp
//! order.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::ServeApi;
use crate::error::Result;
use crate::process::Supervisor;
use crate::signaling::websocket::{OnWsMessage, WsClient};
use crate::transport::{FramedSocket, OnFrame};

const PCM_QUEUE_CAPACITY: usize = 64;

/// Callback receiving the joined transcript after every new result.
pub type OnTranscript = Arc<dyn Fn(String) + Send + Sync>;

/// One transcription result from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechResult {
    pub time: i64,
    pub text: String,
}

/// Join results in timestamp order, skipping blank fragments.
fn joined_text(results: &[SpeechResult]) -> String {
    let mut ordered: Vec<&SpeechResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.time);

    ordered
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Capture binary launch parameters.
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    /// ALSA hardware name, e.g. `hw:1,0`
    pub hardware: String,
    pub bin_path: String,
    pub socket_path: String,
    pub sample_rate: u32,
    pub channels: u32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            hardware: "default".to_string(),
            bin_path: "/root/speech".to_string(),
            socket_path: "/var/run/speech.sock".to_string(),
            sample_rate: 16000,
            channels: 1,
        }
    }
}

/// Supervised capture binary, its socket, and the backend WebSocket.
pub struct SpeechAdapter {
    settings: SpeechSettings,
    socket: FramedSocket,
    supervisor: Arc<Supervisor>,
    ws: tokio::sync::Mutex<Option<Arc<WsClient>>>,
    pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    results: Arc<Mutex<Vec<SpeechResult>>>,
}

impl SpeechAdapter {
    pub fn new(settings: SpeechSettings) -> Self {
        let args = vec![
            "-d".to_string(),
            settings.hardware.clone(),
            "-s".to_string(),
            settings.socket_path.clone(),
            // 2 selects S16_LE
            "-f".to_string(),
            "2".to_string(),
            "-r".to_string(),
            settings.sample_rate.to_string(),
            "-c".to_string(),
            settings.channels.to_string(),
        ];

        Self {
            socket: FramedSocket::new(&settings.socket_path),
            supervisor: Arc::new(Supervisor::new(&settings.bin_path, args)),
            settings,
            ws: tokio::sync::Mutex::new(None),
            pump: tokio::sync::Mutex::new(None),
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Dial the speech WebSocket, open the socket, start the capture child.
    pub async fn open(&self, api: &ServeApi, id: &str, on_text: OnTranscript) -> Result<()> {
        let url = api.device_stt_url(id)?;
        let access_token = api.get_access_token().await?;

        let results = self.results.clone();
        let on_message: OnWsMessage = Arc::new(move |data| {
            let result: SpeechResult = match serde_json::from_slice(&data) {
                Ok(result) => result,
                Err(e) => {
                    warn!("speech result parse error: {}", e);
                    return;
                }
            };

            let text = {
                let mut results = results.lock().unwrap();
                results.push(result);
                joined_text(&results)
            };
            on_text(text);
        });

        let ws = WsClient::connect(url, &access_token, on_message).await?;
        *self.ws.lock().await = Some(ws.clone());

        // PCM records arrive on a sync callback; a bounded queue decouples
        // it from the async WebSocket writes and preserves frame order.
        let (pcm_tx, mut pcm_rx) = mpsc::channel::<Bytes>(PCM_QUEUE_CAPACITY);
        let ws_for_pump = ws.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = pcm_rx.recv().await {
                if let Err(e) = ws_for_pump.send_binary(frame).await {
                    debug!("speech frame send failed: {}", e);
                    return;
                }
            }
        });
        *self.pump.lock().await = Some(pump);

        let on_frame: OnFrame = Arc::new(move |_header, body| {
            let Some(body) = body else { return };
            if pcm_tx.try_send(body).is_err() {
                debug!("speech pcm queue full, dropping frame");
            }
        });

        if let Err(e) = self.socket.open(on_frame).await {
            self.close().await;
            return Err(e);
        }
        if let Err(e) = self.supervisor.start().await {
            self.close().await;
            return Err(e);
        }

        self.results.lock().unwrap().clear();
        debug!("speech adapter open on {}", self.settings.socket_path);

        Ok(())
    }

    /// Stop the capture child, socket, pump, and WebSocket. Idempotent.
    pub async fn close(&self) {
        let _ = self.supervisor.stop().await;
        self.socket.close().await;

        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
            let _ = pump.await;
        }

        if let Some(ws) = self.ws.lock().await.take() {
            ws.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_speech_result() {
        let result: SpeechResult =
            serde_json::from_slice(br#"{"time":1700000001,"text":"hello"}"#).unwrap();
        assert_eq!(result.time, 1700000001);
        assert_eq!(result.text, "hello");
    }

    #[test]
    fn test_joined_text_sorts_by_time() {
        let results = vec![
            SpeechResult {
                time: 3,
                text: "world".to_string(),
            },
            SpeechResult {
                time: 1,
                text: " hello ".to_string(),
            },
            SpeechResult {
                time: 2,
                text: "   ".to_string(),
            },
        ];

        assert_eq!(joined_text(&results), "hello world");
    }

    #[test]
    fn test_joined_text_empty() {
        assert_eq!(joined_text(&[]), "");
    }
}
