//! Tracking session settings, read from a RON file. Every field has a
//! default, so a file only needs the fields it changes:
//!
//! ```ron
//! (
//!     port: Some("/dev/ttyUSB0"),
//!     device: Polaris,
//!     baud_rate: B115200,
//!     reply_options: "TRANSFORMATION_DATA | PAS_STRAY_MARKERS_POS",
//!     tool_files: ["tools/8700339.rom"],
//! )
//! ```

use crate::command::{BaudRate, PortEnableMode};
use crate::driver::{DeviceKind, BAUD_SETTLE_DELAY};
use crate::error::{NdiError, Result};
use crate::reply_options::ReplyOptions;

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Everything `ndi-track` needs to run a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Serial device path.
    pub port: Option<String>,
    /// Which System Control Unit is attached.
    pub device: DeviceKind,
    /// Working baud rate, switched to after `INIT`.
    pub baud_rate: BaudRate,
    /// Blocks requested from every `BX` poll.
    pub reply_options: ReplyOptions,
    /// How handles are enabled.
    pub enable_mode: PortEnableMode,
    /// Wireless tool definitions to register.
    pub tool_files: Vec<PathBuf>,
    /// Number of frames to poll before stopping.
    pub frames: u32,
    /// Polls per second.
    pub poll_rate_hz: f64,
    /// Wait after `COMM`, in milliseconds.
    pub settle_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            port: None,
            device: DeviceKind::default(),
            baud_rate: BaudRate::B115200,
            reply_options: ReplyOptions::default(),
            enable_mode: PortEnableMode::default(),
            tool_files: Vec::new(),
            frames: 100,
            poll_rate_hz: 20.0,
            settle_ms: BAUD_SETTLE_DELAY.as_millis() as u64,
        }
    }
}

impl TrackerConfig {
    /// Load and validate a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(NdiError::Io)?;
        Self::from_ron(&text)
    }

    /// Parse and validate RON text.
    pub fn from_ron(text: &str) -> Result<Self> {
        let config: TrackerConfig = ron::from_str(text)?;
        config.validated()
    }

    /// Reject settings that cannot drive a session.
    pub fn validated(self) -> Result<Self> {
        self.reply_options.validated()?;
        self.poll_interval()?;
        Ok(self)
    }

    /// [TrackerConfig::settle_ms] as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Time between polls. Fails unless the rate is positive and its
    /// interval fits in a [Duration].
    pub fn poll_interval(&self) -> Result<Duration> {
        let rate = self.poll_rate_hz;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(NdiError::InvalidArgument(format!("poll rate {} Hz", rate)));
        }
        Duration::try_from_secs_f64(1.0 / rate)
            .map_err(|_| NdiError::InvalidArgument(format!("poll rate {} Hz is too slow", rate)))
    }
}
