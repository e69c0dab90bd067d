//! Port handles are the device's slots for tracked tools. Each one carries
//! the last status and pose the device reported for it; nothing here talks
//! to the device, the [Driver](crate::driver::Driver) and the
//! [BX decoder](crate::bx) do the updating.

use crate::error::{NdiError, Result};

use nom::{bytes::complete::take_while_m_n, combinator::map_res, Finish, IResult};
use std::fmt;

/// Fit error the device reports when no error estimate is available.
pub const ERROR_UNAVAILABLE: f32 = 99.0;

/// Per-handle status byte in a BX reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorStatus {
    /// `01`, a pose was computed this frame.
    Valid,
    /// `02`, the tool was not seen this frame.
    Missing,
    /// `04`, the handle is not enabled; nothing else follows in the record.
    Disabled,
    /// Any other code, carried through untouched.
    Other(u8),
}

impl SensorStatus {
    /// Status for a raw status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => SensorStatus::Valid,
            0x02 => SensorStatus::Missing,
            0x04 => SensorStatus::Disabled,
            other => SensorStatus::Other(other),
        }
    }

    /// The raw status byte.
    pub fn code(self) -> u8 {
        match self {
            SensorStatus::Valid => 0x01,
            SensorStatus::Missing => 0x02,
            SensorStatus::Disabled => 0x04,
            SensorStatus::Other(code) => code,
        }
    }

    /// Parse the two hex digit rendering, e.g. `"01"`.
    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Self::from_code(parse_hex_exact(s, 2)? as u8))
    }
}

impl fmt::Display for SensorStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}", self.code())
    }
}

/// The six flags carried in the low bits of a port status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShortStatus {
    /// A tool is plugged into (or registered on) the port.
    pub occupied: bool,
    /// General purpose IO line 1 is closed.
    pub gpio_line1_closed: bool,
    /// General purpose IO line 2 is closed.
    pub gpio_line2_closed: bool,
    /// General purpose IO line 3 is closed.
    pub gpio_line3_closed: bool,
    /// `PINIT` succeeded on the handle.
    pub initialized: bool,
    /// `PENA` succeeded on the handle.
    pub enabled: bool,
}

impl ShortStatus {
    /// Decode bits 0 to 5; higher bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        ShortStatus {
            occupied: bits & (1 << 0) != 0,
            gpio_line1_closed: bits & (1 << 1) != 0,
            gpio_line2_closed: bits & (1 << 2) != 0,
            gpio_line3_closed: bits & (1 << 3) != 0,
            initialized: bits & (1 << 4) != 0,
            enabled: bits & (1 << 5) != 0,
        }
    }

    /// Encode back to bits 0 to 5.
    pub fn bits(&self) -> u8 {
        (self.occupied as u8)
            | (self.gpio_line1_closed as u8) << 1
            | (self.gpio_line2_closed as u8) << 2
            | (self.gpio_line3_closed as u8) << 3
            | (self.initialized as u8) << 4
            | (self.enabled as u8) << 5
    }

    /// Two hex digit rendering, the inverse of [parse_short_status].
    pub fn to_hex(&self) -> String {
        format!("{:02X}", self.bits())
    }
}

/// The short status plus the three flags only the BX stream reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedStatus {
    /// Bits 0 to 5.
    pub short: ShortStatus,
    /// Bit 6.
    pub out_of_volume: bool,
    /// Bit 7.
    pub partial_out_of_volume: bool,
    /// Bit 8.
    pub sensor_broken: bool,
}

impl ExtendedStatus {
    /// Decode bits 0 to 8; higher bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        ExtendedStatus {
            short: ShortStatus::from_bits(bits),
            out_of_volume: bits & (1 << 6) != 0,
            partial_out_of_volume: bits & (1 << 7) != 0,
            sensor_broken: bits & (1 << 8) != 0,
        }
    }

    /// Encode back to bits 0 to 8.
    pub fn bits(&self) -> u32 {
        self.short.bits() as u32
            | (self.out_of_volume as u32) << 6
            | (self.partial_out_of_volume as u32) << 7
            | (self.sensor_broken as u32) << 8
    }

    /// Eight hex digit rendering, the inverse of [parse_extended_status].
    pub fn to_hex(&self) -> String {
        format!("{:08X}", self.bits())
    }
}

fn hex_digits(s: &str, width: usize) -> IResult<&str, u32> {
    map_res(
        take_while_m_n(width, width, |c: char| c.is_ascii_hexdigit()),
        |digits: &str| u32::from_str_radix(digits, 16),
    )(s)
}

/// Parse exactly `width` hex digits, nothing more and nothing less.
pub(crate) fn parse_hex_exact(s: &str, width: usize) -> Result<u32> {
    match hex_digits(s, width).finish() {
        Ok(("", value)) => Ok(value),
        _ => Err(NdiError::MalformedStatus(s.to_owned())),
    }
}

/// Decode a two hex digit port status into its six flags.
///
/// ```
/// use nditrack::port_handle::parse_short_status;
///
/// let status = parse_short_status("31").unwrap();
/// assert!(status.occupied && status.initialized && status.enabled);
/// assert!(!status.gpio_line1_closed);
/// ```
pub fn parse_short_status(s: &str) -> Result<ShortStatus> {
    parse_hex_exact(s, 2).map(ShortStatus::from_bits)
}

/// Decode an eight hex digit port status into its nine flags.
pub fn parse_extended_status(s: &str) -> Result<ExtendedStatus> {
    parse_hex_exact(s, 8).map(ExtendedStatus::from_bits)
}

/// Normalize a port handle ID to two upper case hex digits.
pub fn normalize_id(id: &str) -> Result<String> {
    let value = parse_hex_exact(id, 2).map_err(|_| NdiError::MalformedReply(id.to_owned()))?;
    Ok(format!("{:02X}", value))
}

/// One tracked tool slot and its last known state.
#[derive(Debug, Clone, PartialEq)]
pub struct PortHandle {
    /// Two hex digit ID assigned by the device.
    pub id: String,
    /// Status bit 0.
    pub occupied: bool,
    /// Status bit 4.
    pub initialized: bool,
    /// Status bit 5.
    pub enabled: bool,
    /// Status bit 1.
    pub gpio_line1_closed: bool,
    /// Status bit 2.
    pub gpio_line2_closed: bool,
    /// Status bit 3.
    pub gpio_line3_closed: bool,
    /// Extended status bit 6, from BX only.
    pub out_of_volume: bool,
    /// Extended status bit 7, from BX only.
    pub partial_out_of_volume: bool,
    /// Extended status bit 8, from BX only.
    pub sensor_broken: bool,
    /// Status byte from the last BX record for this handle.
    pub sensor_status: SensorStatus,
    /// Translation x, y, z in millimetres.
    pub trans: [f32; 3],
    /// Rotation quaternion w, x, y, z.
    pub rot: [f32; 4],
    /// RMS fit error, or [ERROR_UNAVAILABLE].
    pub error: f32,
    /// Device frame the pose belongs to. Only meaningful when
    /// `sensor_status` is [SensorStatus::Valid].
    pub frame_number: u32,
}

impl PortHandle {
    /// A handle the device just told us about. Nothing is known about its
    /// pose yet.
    pub fn new(id: &str) -> Self {
        PortHandle {
            id: id.to_ascii_uppercase(),
            occupied: false,
            initialized: false,
            enabled: false,
            gpio_line1_closed: false,
            gpio_line2_closed: false,
            gpio_line3_closed: false,
            out_of_volume: false,
            partial_out_of_volume: false,
            sensor_broken: false,
            sensor_status: SensorStatus::Missing,
            trans: [0.0; 3],
            rot: [1.0, 0.0, 0.0, 0.0],
            error: ERROR_UNAVAILABLE,
            frame_number: 0,
        }
    }

    /// Overwrite the six short status flags.
    pub fn apply_short_status(&mut self, status: &ShortStatus) {
        self.occupied = status.occupied;
        self.gpio_line1_closed = status.gpio_line1_closed;
        self.gpio_line2_closed = status.gpio_line2_closed;
        self.gpio_line3_closed = status.gpio_line3_closed;
        self.initialized = status.initialized;
        self.enabled = status.enabled;
    }

    /// Overwrite all nine status flags.
    pub fn apply_extended_status(&mut self, status: &ExtendedStatus) {
        self.apply_short_status(&status.short);
        self.out_of_volume = status.out_of_volume;
        self.partial_out_of_volume = status.partial_out_of_volume;
        self.sensor_broken = status.sensor_broken;
    }

    /// The six short status flags as currently stored.
    pub fn short_status(&self) -> ShortStatus {
        ShortStatus {
            occupied: self.occupied,
            gpio_line1_closed: self.gpio_line1_closed,
            gpio_line2_closed: self.gpio_line2_closed,
            gpio_line3_closed: self.gpio_line3_closed,
            initialized: self.initialized,
            enabled: self.enabled,
        }
    }
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {} frame {} trans ({:.2}, {:.2}, {:.2}) rot ({:.4}, {:.4}, {:.4}, {:.4}) err {:.4}",
            self.id,
            self.sensor_status,
            self.frame_number,
            self.trans[0],
            self.trans[1],
            self.trans[2],
            self.rot[0],
            self.rot[1],
            self.rot[2],
            self.rot[3],
            self.error,
        )
    }
}

/// The port handles a driver knows about, in the order they were
/// discovered. Lookup is by ID only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortHandleTable {
    handles: Vec<PortHandle>,
}

impl PortHandleTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle with this ID, if known.
    pub fn get(&self, id: &str) -> Option<&PortHandle> {
        self.handles.iter().find(|h| h.id.eq_ignore_ascii_case(id))
    }

    /// Mutable access to the handle with this ID, if known.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut PortHandle> {
        self.handles.iter_mut().find(|h| h.id.eq_ignore_ascii_case(id))
    }

    /// Add a handle at the end, or replace the one with the same ID in place.
    pub fn insert(&mut self, handle: PortHandle) {
        match self.get_mut(&handle.id) {
            Some(existing) => *existing = handle,
            None => self.handles.push(handle),
        }
    }

    /// Throw the whole table away and take `handles` as the new snapshot.
    pub fn replace_all(&mut self, handles: impl IntoIterator<Item = PortHandle>) {
        self.handles.clear();
        for handle in handles {
            self.insert(handle);
        }
    }

    /// A snapshot of the IDs, safe to iterate while mutating the table.
    pub fn ids(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.id.clone()).collect()
    }

    /// Handles in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &PortHandle> {
        self.handles.iter()
    }

    /// Number of known handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are known.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
