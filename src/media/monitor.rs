//! HDMI monitor adapter
//!
//! The monitor binary reports input presence and resolution as header-only
//! records: `reserved[0]` is the connection state, `reserved[1]`/`[2]` the
//! active width and height.

use std::sync::{Arc, Mutex};

use tracing::info;

use crate::error::Result;
use crate::process::Supervisor;
use crate::transport::{FramedSocket, OnFrame};

/// Callback invoked whenever the reported status changes.
pub type OnMonitorChange = Arc<dyn Fn(MonitorStatus) + Send + Sync>;

/// HDMI connection state as reported in `reserved[0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HdmiState {
    #[default]
    Unknown,
    Disconnected,
    Connected,
}

impl HdmiState {
    fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Disconnected,
            2 => Self::Connected,
            _ => Self::Unknown,
        }
    }
}

/// Last reported monitor state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: HdmiState,
    pub width: u32,
    pub height: u32,
}

impl MonitorStatus {
    pub fn is_connected(&self) -> bool {
        self.state == HdmiState::Connected
    }
}

/// Monitor launch parameters.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub device_path: String,
    pub bin_path: String,
    pub socket_path: String,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            bin_path: "/root/monitor".to_string(),
            socket_path: "/var/run/monitor.sock".to_string(),
        }
    }
}

/// Supervised monitor binary plus its socket.
pub struct MonitorAdapter {
    socket: FramedSocket,
    supervisor: Arc<Supervisor>,
    status: Arc<Mutex<MonitorStatus>>,
    on_change: std::sync::RwLock<Option<OnMonitorChange>>,
}

impl MonitorAdapter {
    pub fn new(settings: &MonitorSettings) -> Self {
        let args = vec![
            "-d".to_string(),
            settings.device_path.clone(),
            "-s".to_string(),
            settings.socket_path.clone(),
        ];

        Self {
            socket: FramedSocket::new(&settings.socket_path),
            supervisor: Arc::new(Supervisor::new(&settings.bin_path, args)),
            status: Arc::new(Mutex::new(MonitorStatus::default())),
            on_change: std::sync::RwLock::new(None),
        }
    }

    pub fn set_on_change(&self, on_change: OnMonitorChange) {
        *self.on_change.write().unwrap() = Some(on_change);
    }

    /// Snapshot of the last reported state.
    pub fn status(&self) -> MonitorStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        let callback: OnFrame = Arc::new(move |header, _body| {
            let status = MonitorStatus {
                state: HdmiState::from_wire(header.reserved[0]),
                width: header.reserved[1],
                height: header.reserved[2],
            };

            let changed = {
                let mut current = this.status.lock().unwrap();
                let changed = *current != status;
                *current = status;
                changed
            };

            if changed {
                info!(
                    "hdmi {:?} {}x{}",
                    status.state, status.width, status.height
                );
                let hook = this.on_change.read().unwrap().clone();
                if let Some(hook) = hook {
                    hook(status);
                }
            }
        });

        self.socket.open(callback).await?;

        if let Err(e) = self.supervisor.start().await {
            self.socket.close().await;
            return Err(e);
        }

        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.supervisor.stop().await;
        self.socket.close().await;
    }
}
