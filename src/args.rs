// Commandline argument parser using clap for ndi-track

use crate::command::BaudRate;
use crate::config::TrackerConfig;
use crate::driver::DeviceKind;
use crate::error::Result;

use clap::Parser;
use std::path::PathBuf;

/// Track tools with an NDI Polaris or Aurora and print their poses.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct TrackArgs {
    /// RON config file. Flags given here override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial device the System Control Unit is attached to
    #[arg(short, long)]
    pub port: Option<String>,

    /// Which kind of device is attached
    #[arg(short, long, value_enum)]
    pub device: Option<DeviceKind>,

    /// Working baud rate, one of the rates COMM supports
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Wireless tool definition (.rom) to register, may be repeated
    #[arg(short, long = "tool")]
    pub tools: Vec<PathBuf>,

    /// Number of frames to poll
    #[arg(short = 'n', long)]
    pub frames: Option<u32>,

    /// Polls per second
    #[arg(short, long)]
    pub rate: Option<f64>,

    /// Print the available serial ports and exit
    #[arg(long)]
    pub list_ports: bool,
}

impl TrackArgs {
    /// The config file (or the defaults) with these flags applied on top.
    pub fn into_config(self) -> Result<TrackerConfig> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::from_path(path)?,
            None => TrackerConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(device) = self.device {
            config.device = device;
        }
        if let Some(baud) = self.baud {
            config.baud_rate = BaudRate::from_bps(baud)?;
        }
        config.tool_files.extend(self.tools);
        if let Some(frames) = self.frames {
            config.frames = frames;
        }
        if let Some(rate) = self.rate {
            config.poll_rate_hz = rate;
        }
        config.validated()
    }
}
