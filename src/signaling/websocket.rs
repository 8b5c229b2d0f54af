//! Authenticated WebSocket client
//!
//! Direct device-to-backend channel. The dial carries a bearer token; the
//! read loop is the only reader and refreshes a 10-second deadline per
//! message (the backend pings well inside that horizon). All sends
//! serialize behind the sink lock. Close is idempotent and cancellation
//! safe: it signals the reader and waits for it to drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AppError, Result};

const READ_DEADLINE: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Callback invoked with the payload of every text or binary message.
pub type OnWsMessage = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Callback invoked once when the connection ends for any reason other than
/// a local `close` call.
pub type OnWsClose = Arc<dyn Fn() + Send + Sync>;

/// One authenticated WebSocket connection.
pub struct WsClient {
    url: Url,
    sink: Arc<Mutex<Option<WsSink>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_close: std::sync::RwLock<Option<OnWsClose>>,
}

impl WsClient {
    /// Dial `url` with `Authorization: Bearer <access_token>` and start the
    /// read loop.
    pub async fn connect(
        url: Url,
        access_token: &str,
        on_message: OnWsMessage,
    ) -> Result<Arc<Self>> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::WebSocket(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .map_err(|e| AppError::WebSocket(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| AppError::WebSocket(e.to_string()))?;
        info!("websocket open: {}", url);

        let (sink, read) = stream.split();

        let client = Arc::new(Self {
            url,
            sink: Arc::new(Mutex::new(Some(sink))),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            on_close: std::sync::RwLock::new(None),
        });

        let this = client.clone();
        let handle = tokio::spawn(async move {
            this.read_loop(read, on_message).await;
        });
        *client.reader.lock().await = Some(handle);

        Ok(client)
    }

    /// Register the close notification hook.
    pub fn set_on_close(&self, hook: OnWsClose) {
        *self.on_close.write().unwrap() = Some(hook);
    }

    async fn read_loop(&self, mut read: WsStream, on_message: OnWsMessage) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(READ_DEADLINE, read.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    warn!("websocket {} read deadline exceeded", self.url);
                    break;
                }
                Ok(None) => {
                    debug!("websocket {} stream ended", self.url);
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!("websocket {} read error: {}", self.url, e);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => on_message(Bytes::copy_from_slice(text.as_bytes())),
                Message::Binary(data) => on_message(data),
                Message::Ping(payload) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            warn!("websocket {} pong failed: {}", self.url, e);
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("websocket {} closed by peer", self.url);
                    break;
                }
                _ => {}
            }
        }

        *self.sink.lock().await = None;

        if !self.cancel.is_cancelled() {
            let hook = self.on_close.read().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Serialize a message as JSON text and send it.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.send_message(Message::Text(json.into())).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.send_message(Message::Binary(data)).await
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or(AppError::NotOpen("websocket connection"))?;

        sink.send(message)
            .await
            .map_err(|e| AppError::WebSocket(e.to_string()))
    }

    /// Close the connection and wait for the reader. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut sink = self.sink.lock().await;
            if let Some(sink) = sink.as_mut() {
                let _ = sink.send(Message::Close(None)).await;
            }
        }

        self.cancel.cancel();
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
        debug!("websocket {} closed", self.url);
    }
}
