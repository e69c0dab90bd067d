//! The [Driver] owns the transport and the port handle table and walks the
//! device through its lifecycle:
//!
//! ```text
//! Disconnected --open--> PortOpen --INIT--> Setup <--TSTART/TSTOP--> Tracking
//!       ^                                                               |
//!       +-------------------------- close (RESET, then close) ---------+
//! ```
//!
//! Setup and Tracking are both "initialized". Port handle configuration and
//! baud rate changes are only accepted in Setup; polling with `BX` is
//! accepted in either once `INIT` has succeeded.
//!
//! Every command is strictly request/reply: a command's reply is fully read
//! before the next command is written.

use crate::bx::{BinaryReplyDecoder, BxFrame};
use crate::command::{
    check_reply, hex_encode, parse_error_reply, parse_phrq_reply, parse_phsr_reply, BaudRate,
    CommandCodec, CommandFormat, LedState, PhsrEntry, PhsrOption, PortEnableMode, ResetOption,
};
use crate::error::{NdiError, Result};
use crate::port_handle::{normalize_id, PortHandle, PortHandleTable};
use crate::reply_options::ReplyOptions;
use crate::tool_definition::{ToolDefinition, CHUNK_SIZE};
use crate::transport::{Transport, DEFAULT_BAUD_RATE};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// How long the device needs after `COMM` before it listens at the new speed.
pub const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// `PHRQ` argument asking for a handle for a wireless (passive) tool: any
/// hardware device, any system type, wireless tool type, any port.
pub const WIRELESS_TOOL_REQUEST: &str = "*********1****";

/// Which System Control Unit is on the other end.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum DeviceKind {
    /// Optical tracker, active and passive markers.
    #[default]
    Polaris,
    /// Electromagnetic tracker. Has no markers, so the marker blocks of `BX`
    /// and wireless tools do not apply.
    Aurora,
}

impl DeviceKind {
    /// Reply options this kind of device cannot produce.
    fn unsupported_options(self) -> ReplyOptions {
        match self {
            DeviceKind::Polaris => ReplyOptions::empty(),
            DeviceKind::Aurora => {
                ReplyOptions::SINGLE_ACT_STRAY_MARKER_POS
                    | ReplyOptions::TOOL_MARKERS_POS
                    | ReplyOptions::PAS_STRAY_MARKERS_POS
            }
        }
    }
}

/// Where the driver is in the device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No port.
    Disconnected,
    /// Port open, `INIT` not yet sent.
    PortOpen,
    /// Initialized, not tracking. Configuration happens here.
    Setup,
    /// Initialized and tracking.
    Tracking,
}

impl DeviceState {
    fn name(self) -> &'static str {
        match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::PortOpen => "port open",
            DeviceState::Setup => "setup",
            DeviceState::Tracking => "tracking",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A Polaris or Aurora System Control Unit behind a [Transport].
pub struct Driver<T: Transport> {
    transport: T,
    kind: DeviceKind,
    state: DeviceState,
    codec: CommandCodec,
    handles: PortHandleTable,
    device_init: bool,
    settle_delay: Duration,
    stray_markers: Vec<[f32; 3]>,
}

impl<T: Transport> Driver<T> {
    /// A disconnected driver. Nothing is sent until [Driver::open].
    pub fn new(transport: T, kind: DeviceKind) -> Self {
        Driver {
            transport,
            kind,
            state: DeviceState::Disconnected,
            codec: CommandCodec::default(),
            handles: PortHandleTable::new(),
            device_init: false,
            settle_delay: BAUD_SETTLE_DELAY,
            stray_markers: Vec::new(),
        }
    }

    /// Use a different wait between `COMM` and the local baud change.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Which device this driver talks to.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Whether `INIT` has succeeded since the port was opened or reset.
    pub fn is_initialized(&self) -> bool {
        self.device_init
    }

    /// The framing used for commands.
    pub fn command_format(&self) -> CommandFormat {
        self.codec.format()
    }

    /// The transport, for inspection.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The handle with this ID, if the table knows it.
    pub fn get_port_handle(&self, id: &str) -> Option<&PortHandle> {
        self.handles.get(id)
    }

    /// All known handles in discovery order.
    pub fn port_handles(&self) -> impl Iterator<Item = &PortHandle> {
        self.handles.iter()
    }

    /// Number of known handles.
    pub fn n_port_handles(&self) -> usize {
        self.handles.len()
    }

    /// Passive stray markers from the most recent `BX` poll.
    pub fn stray_markers(&self) -> &[[f32; 3]] {
        &self.stray_markers
    }

    /// Switch command framing. Only [CommandFormat::Plain] is implemented.
    pub fn set_command_format(&mut self, format: CommandFormat) -> Result<()> {
        self.codec = CommandCodec::new(format)?;
        Ok(())
    }

    // ---- lifecycle ------------------------------------------------------

    /// Open the port.
    pub fn open(&mut self) -> Result<()> {
        if self.state != DeviceState::Disconnected {
            return Err(self.wrong_state("disconnected"));
        }
        self.transport.open()?;
        self.state = DeviceState::PortOpen;
        info!("{:?} port open", self.kind);
        Ok(())
    }

    /// `INIT`. Required before any polling.
    pub fn init(&mut self) -> Result<String> {
        match self.state {
            DeviceState::PortOpen | DeviceState::Setup => {}
            DeviceState::Disconnected => return Err(NdiError::PortNotOpen),
            DeviceState::Tracking => return Err(self.wrong_state("setup")),
        }
        let reply = check_reply(self.command("INIT", "")?)?;
        self.device_init = true;
        self.state = DeviceState::Setup;
        info!("{:?} initialized", self.kind);
        Ok(reply)
    }

    /// `TSTART`, moving from Setup to Tracking.
    pub fn start_tracking(&mut self) -> Result<String> {
        self.require_setup()?;
        let reply = check_reply(self.command("TSTART", "")?)?;
        self.state = DeviceState::Tracking;
        info!("Tracking started");
        Ok(reply)
    }

    /// `TSTOP`, moving from Tracking back to Setup.
    pub fn stop_tracking(&mut self) -> Result<String> {
        if self.state != DeviceState::Tracking {
            return Err(self.wrong_state("tracking"));
        }
        let reply = check_reply(self.command("TSTOP", "")?)?;
        self.state = DeviceState::Setup;
        info!("Tracking stopped");
        Ok(reply)
    }

    /// `RESET`. The device forgets `INIT` and drops back to 9600 baud, so the
    /// local side follows it there.
    pub fn reset(&mut self, option: ResetOption) -> Result<String> {
        let reply = self.command("RESET", option.arg())?;
        self.device_init = false;
        self.state = DeviceState::PortOpen;
        self.handles = PortHandleTable::new();
        self.transport.set_baud_rate(DEFAULT_BAUD_RATE)?;
        info!("Device reset");
        Ok(reply)
    }

    /// Change the serial speed on both ends: send `COMM`, wait for the device
    /// to settle, then switch the local port.
    pub fn set_baud_rate(&mut self, baud: BaudRate) -> Result<String> {
        self.require_setup()?;
        let reply = check_reply(self.comm(baud)?)?;
        spin_sleep::sleep(self.settle_delay);
        self.transport.set_baud_rate(baud.bps())?;
        info!("Baud rate is now {}", baud);
        Ok(reply)
    }

    /// Soft reset the device, then release the port. A failed reset is
    /// logged and does not stop the port from being closed.
    pub fn close(&mut self) -> Result<()> {
        if self.state == DeviceState::Disconnected {
            return Ok(());
        }
        if self.transport.is_open() {
            if let Err(e) = self.reset(ResetOption::Soft) {
                warn!("Reset before close failed: {}", e);
            }
        }
        self.state = DeviceState::Disconnected;
        self.device_init = false;
        self.handles = PortHandleTable::new();
        self.stray_markers.clear();
        self.transport.close()
    }

    // ---- port handles ---------------------------------------------------

    /// Ask the device for every allocated handle and make that the table.
    /// Handles missing from the reply are dropped.
    pub fn detect_and_assign_port_handles(&mut self) -> Result<usize> {
        self.require_setup()?;
        let entries = self.query_port_handles(PhsrOption::All)?;
        self.handles.replace_all(entries.iter().map(handle_from_entry));
        info!("Found {} port handles", self.handles.len());
        Ok(self.handles.len())
    }

    /// Free every handle the device reports as needing it. Run discovery
    /// afterwards to bring the table up to date.
    pub fn free_port_handles(&mut self) -> Result<usize> {
        self.require_setup()?;
        let entries = self.query_port_handles(PhsrOption::ToBeFreed)?;
        for entry in &entries {
            let reply = self.phf(&entry.id)?;
            log_failure("PHF", &entry.id, &reply);
        }
        Ok(entries.len())
    }

    /// `PINIT` every handle in the table that is not yet initialized, then
    /// rediscover.
    pub fn init_all_port_handles(&mut self) -> Result<usize> {
        self.require_setup()?;
        let pending: Vec<String> = self
            .handles
            .iter()
            .filter(|h| !h.initialized)
            .map(|h| h.id.clone())
            .collect();
        for id in &pending {
            let reply = self.pinit(id)?;
            log_failure("PINIT", id, &reply);
        }
        self.detect_and_assign_port_handles()?;
        Ok(pending.len())
    }

    /// `PENA` every initialized handle in the table that is not yet enabled,
    /// then rediscover.
    pub fn enable_all_port_handles(&mut self, mode: PortEnableMode) -> Result<usize> {
        self.require_setup()?;
        let pending: Vec<String> = self
            .handles
            .iter()
            .filter(|h| h.initialized && !h.enabled)
            .map(|h| h.id.clone())
            .collect();
        for id in &pending {
            let reply = self.pena(id, mode)?;
            log_failure("PENA", id, &reply);
        }
        self.detect_and_assign_port_handles()?;
        Ok(pending.len())
    }

    /// Register a wireless tool: request a handle, upload the definition in
    /// zero padded 64 byte chunks, then add the handle the device granted.
    /// The new handle is found by the ID `PHRQ` returned.
    pub fn add_wireless_tool(&mut self, tool: &ToolDefinition) -> Result<String> {
        if self.kind == DeviceKind::Aurora {
            return Err(NdiError::InvalidArgument(
                "Aurora has no wireless tools".to_owned(),
            ));
        }
        if tool.is_empty() {
            return Err(NdiError::InvalidArgument(
                "empty tool definition".to_owned(),
            ));
        }
        self.require_setup()?;

        let id = parse_phrq_reply(&check_reply(self.phrq(WIRELESS_TOOL_REQUEST)?)?)?;
        debug!("Granted port handle {} for wireless tool", id);

        for (i, chunk) in tool.chunks().enumerate() {
            let address = u16::try_from(i * CHUNK_SIZE).map_err(|_| {
                NdiError::InvalidArgument("tool definition larger than 64 KiB".to_owned())
            })?;
            check_reply(self.pvwr(&id, address, &chunk)?)?;
        }

        let entries = self.query_port_handles(PhsrOption::All)?;
        let entry = entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| NdiError::UnknownPortHandle(id.clone()))?;
        self.handles.insert(handle_from_entry(entry));
        info!("Wireless tool registered on port handle {}", id);
        Ok(id)
    }

    fn query_port_handles(&mut self, option: PhsrOption) -> Result<Vec<PhsrEntry>> {
        let reply = check_reply(self.phsr(option)?)?;
        parse_phsr_reply(&reply)
    }

    // ---- polling --------------------------------------------------------

    /// Poll with `BX`, decode the whole reply, then update the handle table.
    /// Nothing is written to the table if the reply cannot be read in full.
    pub fn bx(&mut self, options: ReplyOptions) -> Result<BxFrame> {
        self.require_open()?;
        if !self.device_init {
            return Err(NdiError::NotInitialized);
        }
        let unsupported = options & self.kind.unsupported_options();
        if !unsupported.is_empty() {
            return Err(NdiError::InvalidArgument(format!(
                "{:?} cannot report {:?}",
                self.kind, unsupported
            )));
        }
        let decoder = BinaryReplyDecoder::new(options)?;

        let command = self.codec.encode("BX", &options.to_arg())?;
        trace!(">> {}", String::from_utf8_lossy(&command));
        self.transport.write_line(&command)?;
        let frame = decoder.decode(&mut self.transport)?;

        frame.apply_to(&mut self.handles);
        self.stray_markers = frame.stray_markers.clone();
        Ok(frame)
    }

    /// `TX`, the text form of the pose poll. The reply is returned raw.
    pub fn tx(&mut self, options: &str) -> Result<String> {
        self.require_open()?;
        if !self.device_init {
            return Err(NdiError::NotInitialized);
        }
        self.command("TX", options)
    }

    // ---- single commands ------------------------------------------------

    /// Send any command and return its one line reply.
    pub fn command(&mut self, verb: &str, args: &str) -> Result<String> {
        self.require_open()?;
        let command = self.codec.encode(verb, args)?;
        trace!(">> {}", String::from_utf8_lossy(&command));
        self.transport.write_line(&command)?;
        let line = self.transport.read_line()?;
        let reply = self.codec.decode_line(&line)?;
        trace!("<< {}", reply);
        Ok(reply)
    }

    /// `APIREV`
    pub fn apirev(&mut self) -> Result<String> {
        self.command("APIREV", "")
    }

    /// `BEEP`, one to nine beeps.
    pub fn beep(&mut self, count: u8) -> Result<String> {
        if !(1..=9).contains(&count) {
            return Err(NdiError::InvalidArgument(format!("{} beeps", count)));
        }
        self.command("BEEP", &count.to_string())
    }

    /// `COMM` on its own. Prefer [Driver::set_baud_rate], which also moves
    /// the local port.
    pub fn comm(&mut self, baud: BaudRate) -> Result<String> {
        self.command("COMM", &baud.comm_args())
    }

    /// `ECHO`
    pub fn echo(&mut self, text: &str) -> Result<String> {
        self.command("ECHO", text)
    }

    /// `GET` a user parameter.
    pub fn get(&mut self, attribute: &str) -> Result<String> {
        self.command("GET", attribute)
    }

    /// `LED`
    pub fn led(&mut self, handle: &str, led: u8, state: LedState) -> Result<String> {
        let args = format!("{}{}{}", handle_arg(handle)?, led, state.code());
        self.command("LED", &args)
    }

    /// `PDIS`
    pub fn pdis(&mut self, handle: &str) -> Result<String> {
        self.require_setup()?;
        self.command("PDIS", &handle_arg(handle)?)
    }

    /// `PENA`
    pub fn pena(&mut self, handle: &str, mode: PortEnableMode) -> Result<String> {
        self.require_setup()?;
        let args = format!("{}{}", handle_arg(handle)?, mode.code());
        self.command("PENA", &args)
    }

    /// `PHF`
    pub fn phf(&mut self, handle: &str) -> Result<String> {
        self.require_setup()?;
        self.command("PHF", &handle_arg(handle)?)
    }

    /// `PHINF` with a four hex digit reply option.
    pub fn phinf(&mut self, handle: &str, option: u16) -> Result<String> {
        let args = format!("{}{:04X}", handle_arg(handle)?, option);
        self.command("PHINF", &args)
    }

    /// `PHRQ` with its raw fourteen character argument.
    pub fn phrq(&mut self, request: &str) -> Result<String> {
        self.require_setup()?;
        self.command("PHRQ", request)
    }

    /// `PHSR`
    pub fn phsr(&mut self, option: PhsrOption) -> Result<String> {
        self.command("PHSR", option.arg())
    }

    /// `PINIT`
    pub fn pinit(&mut self, handle: &str) -> Result<String> {
        self.require_setup()?;
        self.command("PINIT", &handle_arg(handle)?)
    }

    /// `PPRD`, read 64 bytes of tool SROM at `address`.
    pub fn pprd(&mut self, handle: &str, address: u16) -> Result<String> {
        let args = format!("{}{:04X}", handle_arg(handle)?, address);
        self.command("PPRD", &args)
    }

    /// `PPWR`, write 64 bytes of tool SROM at `address`.
    pub fn ppwr(&mut self, handle: &str, address: u16, data: &[u8; CHUNK_SIZE]) -> Result<String> {
        let args = format!("{}{:04X}{}", handle_arg(handle)?, address, hex_encode(data));
        self.command("PPWR", &args)
    }

    /// `PSEL`, select a tool SROM device by its ID.
    pub fn psel(&mut self, handle: &str, device_id: &str) -> Result<String> {
        let args = format!("{}{}", handle_arg(handle)?, device_id);
        self.command("PSEL", &args)
    }

    /// `PSOUT`, GPIO line states as one character each (`N`, `O`, `P`, `S`).
    pub fn psout(&mut self, handle: &str, lines: &str) -> Result<String> {
        let args = format!("{}{}", handle_arg(handle)?, lines);
        self.command("PSOUT", &args)
    }

    /// `PSRCH`, list the SROM devices on a tool.
    pub fn psrch(&mut self, handle: &str) -> Result<String> {
        self.command("PSRCH", &handle_arg(handle)?)
    }

    /// `PURD`, read the user part of tool SROM.
    pub fn purd(&mut self, handle: &str, address: u16) -> Result<String> {
        let args = format!("{}{:04X}", handle_arg(handle)?, address);
        self.command("PURD", &args)
    }

    /// `PUWR`, write the user part of tool SROM.
    pub fn puwr(&mut self, handle: &str, address: u16, data: &[u8]) -> Result<String> {
        let args = format!("{}{:04X}{}", handle_arg(handle)?, address, hex_encode(data));
        self.command("PUWR", &args)
    }

    /// `PVWR`, write 64 bytes of a virtual (wireless) tool definition.
    pub fn pvwr(&mut self, handle: &str, address: u16, data: &[u8; CHUNK_SIZE]) -> Result<String> {
        self.require_setup()?;
        let args = format!("{}{:04X}{}", handle_arg(handle)?, address, hex_encode(data));
        self.command("PVWR", &args)
    }

    /// `SFLIST`
    pub fn sflist(&mut self, option: u8) -> Result<String> {
        self.command("SFLIST", &format!("{:02X}", option))
    }

    /// `TTCFG`, configure a test tool on the handle.
    pub fn ttcfg(&mut self, handle: &str) -> Result<String> {
        self.require_setup()?;
        self.command("TTCFG", &handle_arg(handle)?)
    }

    /// `VER`
    pub fn ver(&mut self, option: u8) -> Result<String> {
        self.command("VER", &option.to_string())
    }

    /// `VSEL`, choose a characterized measurement volume.
    pub fn vsel(&mut self, volume: u8) -> Result<String> {
        self.require_setup()?;
        self.command("VSEL", &volume.to_string())
    }

    // ---- guards ---------------------------------------------------------

    fn require_open(&self) -> Result<()> {
        if self.state == DeviceState::Disconnected || !self.transport.is_open() {
            return Err(NdiError::PortNotOpen);
        }
        Ok(())
    }

    fn require_setup(&self) -> Result<()> {
        match self.state {
            DeviceState::Setup => Ok(()),
            DeviceState::Tracking => Err(self.wrong_state("setup")),
            DeviceState::PortOpen => Err(NdiError::NotInitialized),
            DeviceState::Disconnected => Err(NdiError::PortNotOpen),
        }
    }

    fn wrong_state(&self, expected: &'static str) -> NdiError {
        NdiError::InvalidState {
            expected,
            actual: self.state.name(),
        }
    }
}

impl<T: Transport> Drop for Driver<T> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing port on drop failed: {}", e);
        }
    }
}

fn handle_from_entry(entry: &PhsrEntry) -> PortHandle {
    let mut handle = PortHandle::new(&entry.id);
    handle.apply_short_status(&entry.status);
    handle
}

fn handle_arg(handle: &str) -> Result<String> {
    normalize_id(handle).map_err(|_| NdiError::InvalidArgument(format!("port handle {:?}", handle)))
}

fn log_failure(verb: &str, id: &str, reply: &str) {
    if let Some(code) = parse_error_reply(reply) {
        warn!("{} {} failed: {}", verb, id, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bx::frame_builder::FrameBuilder;
    use crate::dummy_transport::DummyTransport;
    use crate::port_handle::SensorStatus;
    use std::sync::{Arc, Mutex};

    /// Shared knobs for the fake System Control Unit.
    #[derive(Clone, Default)]
    struct Scu {
        phsr: Arc<Mutex<String>>,
        bx: Arc<Mutex<Vec<u8>>>,
        reset_answers: Arc<Mutex<bool>>,
    }

    impl Scu {
        fn new(phsr: &str) -> Self {
            let scu = Scu::default();
            scu.set_phsr(phsr);
            *scu.reset_answers.lock().unwrap() = true;
            scu
        }

        fn set_phsr(&self, phsr: &str) {
            *self.phsr.lock().unwrap() = phsr.to_owned();
        }

        fn set_bx(&self, bytes: Vec<u8>) {
            *self.bx.lock().unwrap() = bytes;
        }

        fn transport(&self) -> DummyTransport {
            let scu = self.clone();
            DummyTransport::new().with_responder(move |cmd| {
                let line = |s: &str| format!("{}\r", s).into_bytes();
                let verb = cmd.split(' ').next().unwrap_or_default();
                match verb {
                    "PHSR" => line(&scu.phsr.lock().unwrap()),
                    "PHRQ" => line("0C"),
                    "BX" => scu.bx.lock().unwrap().clone(),
                    "RESET" if *scu.reset_answers.lock().unwrap() => line("RESETBE6F"),
                    "RESET" => Vec::new(),
                    "APIREV" => line("G.001.004A0C0"),
                    _ => line("OKAY"),
                }
            })
        }
    }

    fn driver(scu: &Scu) -> Driver<DummyTransport> {
        let mut driver =
            Driver::new(scu.transport(), DeviceKind::Polaris).with_settle_delay(Duration::ZERO);
        driver.open().unwrap();
        driver
    }

    fn initialized(scu: &Scu) -> Driver<DummyTransport> {
        let mut driver = driver(scu);
        driver.init().unwrap();
        driver
    }

    fn valid_frame(id: u8, frame_number: u32) -> Vec<u8> {
        FrameBuilder::new()
            .record(id, 0x01)
            .floats(&[1.0, 0.0, 0.0, 0.0])
            .floats(&[1.0, 2.0, 3.0])
            .floats(&[0.1])
            .u32(0x31)
            .u32(frame_number)
            .build()
    }

    #[test]
    fn polling_requires_init() {
        let scu = Scu::new("00");
        scu.set_bx(valid_frame(0x0A, 1));
        let mut driver = driver(&scu);

        assert!(matches!(
            driver.bx(ReplyOptions::TRANSFORMATION_DATA),
            Err(NdiError::NotInitialized)
        ));
        assert!(!driver.transport().commands().iter().any(|c| c.starts_with("BX")));

        driver.init().unwrap();
        assert!(driver.bx(ReplyOptions::TRANSFORMATION_DATA).is_ok());
    }

    #[test]
    fn lifecycle_transitions() {
        let scu = Scu::new("00");
        let mut driver = Driver::new(scu.transport(), DeviceKind::Polaris);
        assert_eq!(driver.state(), DeviceState::Disconnected);
        assert!(matches!(driver.init(), Err(NdiError::PortNotOpen)));
        assert!(matches!(driver.tx("0001"), Err(NdiError::PortNotOpen)));
        assert!(matches!(
            driver.bx(ReplyOptions::TRANSFORMATION_DATA),
            Err(NdiError::PortNotOpen)
        ));

        driver.open().unwrap();
        assert_eq!(driver.state(), DeviceState::PortOpen);
        assert!(matches!(driver.tx("0001"), Err(NdiError::NotInitialized)));
        assert!(matches!(driver.start_tracking(), Err(NdiError::NotInitialized)));

        driver.init().unwrap();
        assert_eq!(driver.state(), DeviceState::Setup);
        assert!(driver.is_initialized());

        driver.start_tracking().unwrap();
        assert_eq!(driver.state(), DeviceState::Tracking);
        assert!(matches!(
            driver.detect_and_assign_port_handles(),
            Err(NdiError::InvalidState { .. })
        ));
        assert!(matches!(
            driver.set_baud_rate(BaudRate::B115200),
            Err(NdiError::InvalidState { .. })
        ));

        driver.stop_tracking().unwrap();
        assert_eq!(driver.state(), DeviceState::Setup);
        assert!(matches!(driver.stop_tracking(), Err(NdiError::InvalidState { .. })));

        driver.close().unwrap();
        assert_eq!(driver.state(), DeviceState::Disconnected);
        assert!(!driver.transport().is_open());
    }

    #[test]
    fn discovery_replaces_table() {
        let scu = Scu::new("020A0310B031");
        let mut driver = initialized(&scu);
        assert_eq!(driver.detect_and_assign_port_handles().unwrap(), 2);
        assert!(driver.get_port_handle("0A").is_some());

        scu.set_phsr("020B0310C031");
        driver.detect_and_assign_port_handles().unwrap();
        let ids: Vec<_> = driver.port_handles().map(|h| h.id.clone()).collect();
        assert_eq!(ids, vec!["0B".to_string(), "0C".to_string()]);
        assert!(driver.get_port_handle("0A").is_none());
        assert_eq!(driver.n_port_handles(), 2);
    }

    #[test]
    fn wireless_tool_uploads_padded_chunks() {
        let scu = Scu::new("010C001");
        let mut driver = initialized(&scu);
        let tool = ToolDefinition::from_bytes(vec![0xAB; 100]);

        assert_eq!(driver.add_wireless_tool(&tool).unwrap(), "0C");

        let commands = driver.transport().commands();
        let uploads: Vec<_> = commands.iter().filter(|c| c.starts_with("PVWR")).collect();
        assert_eq!(uploads.len(), 2);
        assert_eq!(*uploads[0], format!("PVWR 0C0000{}", "AB".repeat(64)));
        assert_eq!(
            *uploads[1],
            format!("PVWR 0C0040{}{}", "AB".repeat(36), "00".repeat(28))
        );
        assert!(driver.get_port_handle("0C").unwrap().occupied);
    }

    #[test]
    fn wireless_tool_is_matched_by_id_not_position() {
        let scu = Scu::new("030C0010A0310B031");
        let mut driver = initialized(&scu);
        driver
            .add_wireless_tool(&ToolDefinition::from_bytes(vec![1; 10]))
            .unwrap();
        assert_eq!(driver.n_port_handles(), 1);
        assert!(driver.get_port_handle("0C").is_some());
    }

    #[test]
    fn wireless_tool_missing_from_phsr() {
        let scu = Scu::new("010A031");
        let mut driver = initialized(&scu);
        assert!(matches!(
            driver.add_wireless_tool(&ToolDefinition::from_bytes(vec![1; 10])),
            Err(NdiError::UnknownPortHandle(id)) if id == "0C"
        ));
    }

    #[test]
    fn aurora_refuses_marker_features() {
        let scu = Scu::new("00");
        let mut driver = Driver::new(scu.transport(), DeviceKind::Aurora);
        driver.open().unwrap();
        driver.init().unwrap();
        assert!(matches!(
            driver.bx(ReplyOptions::PAS_STRAY_MARKERS_POS),
            Err(NdiError::InvalidArgument(_))
        ));
        assert!(matches!(
            driver.add_wireless_tool(&ToolDefinition::from_bytes(vec![1; 10])),
            Err(NdiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn init_and_enable_walk_the_snapshot() {
        // 0A occupied only, 0B initialized only, 0C already enabled
        let scu = Scu::new("030A0010B0110C031");
        let mut driver = initialized(&scu);
        driver.detect_and_assign_port_handles().unwrap();

        assert_eq!(driver.init_all_port_handles().unwrap(), 1);
        assert_eq!(driver.enable_all_port_handles(PortEnableMode::Dynamic).unwrap(), 1);

        let commands = driver.transport().commands();
        assert!(commands.contains(&"PINIT 0A".to_string()));
        assert!(!commands.contains(&"PINIT 0B".to_string()));
        assert!(commands.contains(&"PENA 0BD".to_string()));
        assert!(!commands.contains(&"PENA 0CD".to_string()));
    }

    #[test]
    fn free_handles_from_phsr_01() {
        let scu = Scu::new("020A0010B001");
        let mut driver = initialized(&scu);
        assert_eq!(driver.free_port_handles().unwrap(), 2);
        let commands = driver.transport().commands();
        assert!(commands.contains(&"PHSR 01".to_string()));
        assert!(commands.contains(&"PHF 0A".to_string()));
        assert!(commands.contains(&"PHF 0B".to_string()));
    }

    #[test]
    fn baud_change_sends_comm_before_switching() {
        let scu = Scu::new("00");
        let mut driver = initialized(&scu);
        driver.set_baud_rate(BaudRate::B115200).unwrap();
        assert_eq!(driver.transport().commands().last().unwrap(), "COMM 50000");
        assert_eq!(driver.transport().baud_history(), &[115200]);
    }

    #[test]
    fn bx_updates_table() {
        let scu = Scu::new("010A031");
        let mut driver = initialized(&scu);
        driver.detect_and_assign_port_handles().unwrap();
        driver.start_tracking().unwrap();

        scu.set_bx(valid_frame(0x0A, 1234));
        let frame = driver.bx(ReplyOptions::TRANSFORMATION_DATA).unwrap();
        assert_eq!(frame.records.len(), 1);
        assert_eq!(driver.transport().commands().last().unwrap(), "BX 0001");
        assert_eq!(driver.transport().remaining(), 0);

        let handle = driver.get_port_handle("0A").unwrap();
        assert_eq!(handle.sensor_status, SensorStatus::Valid);
        assert_eq!(handle.trans, [1.0, 2.0, 3.0]);
        assert_eq!(handle.frame_number, 1234);
    }

    #[test]
    fn failed_poll_leaves_table_untouched() {
        let scu = Scu::new("010A031");
        let mut driver = initialized(&scu);
        driver.detect_and_assign_port_handles().unwrap();
        let before = driver.get_port_handle("0A").unwrap().clone();

        let mut bytes = valid_frame(0x0A, 99);
        bytes.truncate(bytes.len() - 1);
        scu.set_bx(bytes);
        assert!(matches!(
            driver.bx(ReplyOptions::TRANSFORMATION_DATA),
            Err(NdiError::Transport(_))
        ));
        assert_eq!(driver.get_port_handle("0A").unwrap(), &before);
    }

    #[test]
    fn close_resets_first() {
        let scu = Scu::new("00");
        let mut driver = initialized(&scu);
        driver.close().unwrap();
        assert_eq!(driver.transport().commands().last().unwrap(), "RESET 0");
        assert!(!driver.transport().is_open());
        assert!(!driver.is_initialized());
    }

    #[test]
    fn close_survives_silent_reset() {
        let scu = Scu::new("00");
        *scu.reset_answers.lock().unwrap() = false;
        let mut driver = initialized(&scu);
        driver.close().unwrap();
        assert_eq!(driver.state(), DeviceState::Disconnected);
        assert!(!driver.transport().is_open());
    }

    #[test]
    fn crc_format_is_not_implemented() {
        let scu = Scu::new("00");
        let mut driver = driver(&scu);
        assert!(matches!(
            driver.set_command_format(CommandFormat::Crc),
            Err(NdiError::NotImplemented(_))
        ));
        assert_eq!(driver.command_format(), CommandFormat::Plain);
    }

    #[test]
    fn single_commands_are_framed() {
        let scu = Scu::new("00");
        let mut driver = initialized(&scu);
        assert_eq!(driver.apirev().unwrap(), "G.001.004A0C0");
        driver.pena("0a", PortEnableMode::Static).unwrap();
        driver.led("0A", 1, LedState::Flash).unwrap();
        driver.phinf("0A", 0x0025).unwrap();
        driver.beep(2).unwrap();
        assert!(matches!(driver.beep(0), Err(NdiError::InvalidArgument(_))));
        assert!(matches!(driver.pinit("XYZ"), Err(NdiError::InvalidArgument(_))));

        let commands = driver.transport().commands();
        assert!(commands.contains(&"PENA 0AS".to_string()));
        assert!(commands.contains(&"LED 0A1F".to_string()));
        assert!(commands.contains(&"PHINF 0A0025".to_string()));
        assert!(commands.contains(&"BEEP 2".to_string()));
    }
}
