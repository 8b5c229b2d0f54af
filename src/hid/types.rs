//! HID record vocabulary
//!
//! The browser sends one JSON object per input event over the `hid` data
//! channel, discriminated by `category`:
//!
//! ```json
//! {"category":"mouse","data":{"x":16384,"y":16384,"button1":true}}
//! {"category":"keyboard","data":{"ctrl":true,"key1":"c"}}
//! ```
//!
//! Mouse coordinates are absolute on a 15-bit axis. A keyboard record holds
//! up to six simultaneous non-modifier keys by name.

use serde::Deserialize;

use crate::error::{AppError, Result};

/// Exclusive upper bound of the absolute mouse axis.
pub const MOUSE_POSITION_MAX: i64 = 32768;

/// One input event received from the data channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "lowercase")]
pub enum HidRecord {
    Mouse(MouseRecord),
    Keyboard(KeyboardRecord),
}

impl HidRecord {
    /// Parse and validate a record from raw channel bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let record: HidRecord =
            serde_json::from_slice(data).map_err(|e| AppError::BadHidRecord(e.to_string()))?;

        if let HidRecord::Mouse(ref mouse) = record {
            mouse.validate()?;
        }

        Ok(record)
    }
}

/// Absolute mouse position and button state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MouseRecord {
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub button1: bool,
    #[serde(default)]
    pub button2: bool,
    #[serde(default)]
    pub button3: bool,
}

impl MouseRecord {
    fn validate(&self) -> Result<()> {
        if !(0..MOUSE_POSITION_MAX).contains(&self.x) {
            return Err(AppError::BadCoordinate {
                axis: "x",
                value: self.x,
            });
        }
        if !(0..MOUSE_POSITION_MAX).contains(&self.y) {
            return Err(AppError::BadCoordinate {
                axis: "y",
                value: self.y,
            });
        }
        Ok(())
    }
}

/// Modifier state plus up to six named keys held at once.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyboardRecord {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub key1: Option<String>,
    #[serde(default)]
    pub key2: Option<String>,
    #[serde(default)]
    pub key3: Option<String>,
    #[serde(default)]
    pub key4: Option<String>,
    #[serde(default)]
    pub key5: Option<String>,
    #[serde(default)]
    pub key6: Option<String>,
}

impl KeyboardRecord {
    /// The six key slots in report order.
    pub fn keys(&self) -> [Option<&str>; 6] {
        [
            self.key1.as_deref(),
            self.key2.as_deref(),
            self.key3.as_deref(),
            self.key4.as_deref(),
            self.key5.as_deref(),
            self.key6.as_deref(),
        ]
    }
}
