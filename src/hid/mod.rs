//! HID gadget writer
//!
//! Input events arrive as JSON records on the WebRTC data channel and leave
//! as USB HID reports written to the gadget character device (`/dev/hidgN`).
//! Report ids: 0x01 keyboard, 0x02 mouse. The file descriptor is guarded by
//! a readers-writer lock so close races safely with in-flight sends.

pub mod keymap;
pub mod types;

pub use types::{HidRecord, KeyboardRecord, MouseRecord, MOUSE_POSITION_MAX};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use keymap::find_key_code;

pub const KEYBOARD_REPORT_ID: u8 = 0x01;
pub const MOUSE_REPORT_ID: u8 = 0x02;

/// Neutral mouse position written on close: the middle of the 15-bit axis.
const NEUTRAL_POSITION: u16 = (MOUSE_POSITION_MAX / 2) as u16;

/// Writes HID reports to the USB gadget device.
pub struct HidWriter {
    path: PathBuf,
    udc_path: PathBuf,
    fd: RwLock<Option<File>>,
    unknown_keys: LogThrottler,
}

impl HidWriter {
    pub fn new(path: impl Into<PathBuf>, udc_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            udc_path: udc_path.into(),
            fd: RwLock::new(None),
            unknown_keys: LogThrottler::once(),
        }
    }

    /// Open the gadget device write-only.
    pub fn open(&self) -> Result<()> {
        let mut fd = self.fd.write();
        if fd.is_some() {
            return Err(AppError::AlreadyOpen("hid device"));
        }

        let file = OpenOptions::new().write(true).open(&self.path)?;
        *fd = Some(file);
        debug!("hid device {} open", self.path.display());

        Ok(())
    }

    /// Release keys and buttons, then close the device. Idempotent.
    ///
    /// The neutral reports go out first so the emulated keyboard and mouse
    /// never stay stuck in their last state after the operator disconnects.
    pub fn close(&self) {
        let mut guard = self.fd.write();
        let Some(file) = guard.take() else {
            return;
        };

        let mut neutral_mouse = [0u8; 5];
        neutral_mouse[1..3].copy_from_slice(&NEUTRAL_POSITION.to_le_bytes());
        neutral_mouse[3..5].copy_from_slice(&NEUTRAL_POSITION.to_le_bytes());
        if let Err(e) = write_report(&file, MOUSE_REPORT_ID, &neutral_mouse) {
            warn!("hid neutral mouse report failed: {}", e);
        }
        if let Err(e) = write_report(&file, KEYBOARD_REPORT_ID, &[0u8; 7]) {
            warn!("hid neutral keyboard report failed: {}", e);
        }

        debug!("hid device {} closed", self.path.display());
    }

    pub fn is_open(&self) -> bool {
        self.fd.read().is_some()
    }

    /// Parse one data-channel record and write the matching report.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match HidRecord::parse(data)? {
            HidRecord::Mouse(mouse) => self.write_mouse(&mouse),
            HidRecord::Keyboard(keyboard) => self.write_keyboard(&keyboard),
        }
    }

    fn write_mouse(&self, mouse: &MouseRecord) -> Result<()> {
        let mut data = [0u8; 5];

        let mut buttons = 0u8;
        if mouse.button1 {
            buttons |= 1 << 0;
        }
        if mouse.button2 {
            buttons |= 1 << 1;
        }
        if mouse.button3 {
            buttons |= 1 << 2;
        }
        data[0] = buttons;
        data[1..3].copy_from_slice(&(mouse.x as u16).to_le_bytes());
        data[3..5].copy_from_slice(&(mouse.y as u16).to_le_bytes());

        self.write(MOUSE_REPORT_ID, &data)
    }

    fn write_keyboard(&self, keyboard: &KeyboardRecord) -> Result<()> {
        let mut data = [0u8; 7];

        let mut modifiers = 0u8;
        if keyboard.ctrl {
            modifiers |= 1 << 0;
        }
        if keyboard.shift {
            modifiers |= 1 << 1;
        }
        if keyboard.alt {
            modifiers |= 1 << 2;
        }
        data[0] = modifiers;

        for (slot, key) in data[1..7].iter_mut().zip(keyboard.keys()) {
            let Some(key) = key else { continue };
            let code = find_key_code(key);
            if code == 0 && !key.is_empty() && self.unknown_keys.should_log(key) {
                warn!("unknown hid key name {:?}", key);
            }
            *slot = code;
        }

        self.write(KEYBOARD_REPORT_ID, &data)
    }

    fn write(&self, report_id: u8, data: &[u8]) -> Result<()> {
        let guard = self.fd.read();
        let file = guard.as_ref().ok_or(AppError::NotOpen("hid device"))?;
        write_report(file, report_id, data)
    }

    /// True while the writer is open, or when the gadget node exists and
    /// the USB device controller reports any state except "not attached".
    pub fn read_status(&self) -> bool {
        if self.fd.read().is_some() {
            return true;
        }

        if !self.path.exists() {
            return false;
        }

        if self.udc_path.as_os_str().is_empty() {
            return false;
        }

        let udc = match std::fs::read_to_string(&self.udc_path) {
            Ok(udc) => udc,
            Err(e) => {
                debug!("hid status: udc read failed: {}", e);
                return false;
            }
        };

        let state_path = Path::new("/sys/class/udc")
            .join(udc.trim())
            .join("state");
        match std::fs::read_to_string(&state_path) {
            Ok(state) => state.trim() != "not attached",
            Err(e) => {
                debug!("hid status: controller state read failed: {}", e);
                false
            }
        }
    }
}

fn write_report(mut file: &File, report_id: u8, data: &[u8]) -> Result<()> {
    let mut report = Vec::with_capacity(1 + data.len());
    report.push(report_id);
    report.extend_from_slice(data);

    file.write_all(&report)?;
    Ok(())
}
