//! Host-side driver for NDI Polaris and Aurora position trackers.
//!
//! A System Control Unit is driven over a serial line with short ASCII
//! commands, each answered by one line of text. Tracking data comes back
//! through `BX`, a binary reply whose layout depends on the options in the
//! request and on the status of every port handle in it.
//!
//! The layers, bottom up:
//!
//! - [transport] moves bytes. [transport::SerialTransport] talks to real
//!   hardware; [dummy_transport::DummyTransport] scripts a device for tests.
//! - [command] frames commands and parses the few replies the driver has to
//!   understand itself.
//! - [port_handle] holds the per-tool state and the status bitfields.
//! - [bx] decodes a whole `BX` frame before anything is committed.
//! - [driver] owns all of the above and enforces the device lifecycle.
//!
//! ```no_run
//! use nditrack::driver::{DeviceKind, Driver};
//! use nditrack::reply_options::ReplyOptions;
//! use nditrack::transport::{SerialTransport, DEFAULT_BAUD_RATE};
//!
//! # fn main() -> nditrack::error::Result<()> {
//! let port = SerialTransport::new("/dev/ttyUSB0", DEFAULT_BAUD_RATE);
//! let mut driver = Driver::new(port, DeviceKind::Polaris);
//! driver.open()?;
//! driver.init()?;
//! driver.detect_and_assign_port_handles()?;
//! driver.init_all_port_handles()?;
//! driver.enable_all_port_handles(Default::default())?;
//! driver.start_tracking()?;
//! driver.bx(ReplyOptions::TRANSFORMATION_DATA)?;
//! for handle in driver.port_handles() {
//!     println!("{}", handle);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
pub mod args;
pub mod bx;
pub mod command;
pub mod config;
pub mod driver;
pub mod dummy_transport;
pub mod error;
pub mod port_handle;
pub mod reply_options;
pub mod tool_definition;
pub mod transport;
