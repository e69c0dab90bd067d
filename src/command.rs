//! Building ASCII commands and picking apart the single line replies the
//! driver has to understand itself. Every other reply is handed back to the
//! caller as text.
//!
//! A command is the verb, a space, then its fixed width fields run together:
//!
//! ```text
//! PENA 0AD
//! BX 0801
//! PVWR 0A0040<128 hex digits>
//! ```
//!
//! The transport appends the carriage return.

use crate::error::{NdiError, Result};
use crate::port_handle::{parse_short_status, ShortStatus};

use nom::{
    bytes::complete::{tag, take_while_m_n},
    character::complete::hex_digit1,
    combinator::{all_consuming, map, map_res},
    multi::length_count,
    sequence::{pair, preceded},
    Finish, IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How commands are framed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandFormat {
    /// Verb, space, arguments. No checksum.
    #[default]
    Plain,
    /// Verb, colon, arguments, CRC16. Not implemented.
    Crc,
}

/// Encodes commands and decodes reply lines for one [CommandFormat].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCodec {
    format: CommandFormat,
}

impl CommandCodec {
    /// A codec for `format`. Asking for [CommandFormat::Crc] fails with
    /// [NdiError::NotImplemented] rather than quietly sending plain text.
    pub fn new(format: CommandFormat) -> Result<Self> {
        match format {
            CommandFormat::Plain => Ok(CommandCodec { format }),
            CommandFormat::Crc => Err(NdiError::NotImplemented("CRC command format")),
        }
    }

    /// The framing this codec produces.
    pub fn format(&self) -> CommandFormat {
        self.format
    }

    /// `"<VERB> <args>"`. A command without arguments still gets the space,
    /// e.g. `"INIT "`.
    pub fn encode(&self, verb: &str, args: &str) -> Result<Vec<u8>> {
        match self.format {
            CommandFormat::Plain => Ok(format!("{} {}", verb, args).into_bytes()),
            CommandFormat::Crc => Err(NdiError::NotImplemented("CRC command format")),
        }
    }

    /// One reply line as text, cut at the first line terminator if there is
    /// one.
    pub fn decode_line(&self, bytes: &[u8]) -> Result<String> {
        let end = bytes
            .iter()
            .position(|b| *b == crate::transport::LINE_TERMINATOR)
            .unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map(|s| s.trim_end_matches('\n').to_owned())
            .map_err(|_| NdiError::MalformedReply(String::from_utf8_lossy(bytes).into_owned()))
    }
}

/// Serial speeds the `COMM` command can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    /// Code `0`.
    B9600,
    /// Code `1`.
    B14400,
    /// Code `2`.
    B19200,
    /// Code `3`.
    B38400,
    /// Code `4`.
    B57600,
    /// Code `5`.
    B115200,
    /// Code `6`.
    B921600,
    /// Code `7`.
    B1228739,
}

impl BaudRate {
    const ALL: [BaudRate; 8] = [
        BaudRate::B9600,
        BaudRate::B14400,
        BaudRate::B19200,
        BaudRate::B38400,
        BaudRate::B57600,
        BaudRate::B115200,
        BaudRate::B921600,
        BaudRate::B1228739,
    ];

    /// Bits per second.
    pub fn bps(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B14400 => 14400,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
            BaudRate::B921600 => 921600,
            BaudRate::B1228739 => 1228739,
        }
    }

    /// The single digit `COMM` uses for this speed.
    pub fn code(self) -> char {
        match self {
            BaudRate::B9600 => '0',
            BaudRate::B14400 => '1',
            BaudRate::B19200 => '2',
            BaudRate::B38400 => '3',
            BaudRate::B57600 => '4',
            BaudRate::B115200 => '5',
            BaudRate::B921600 => '6',
            BaudRate::B1228739 => '7',
        }
    }

    /// Look up a speed in bits per second.
    pub fn from_bps(bps: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.bps() == bps)
            .ok_or_else(|| NdiError::InvalidArgument(format!("unsupported baud rate {}", bps)))
    }

    /// `COMM` argument: speed code, then 8 data bits, no parity, one stop
    /// bit and no handshake, which are the only line settings supported.
    pub fn comm_args(self) -> String {
        format!("{}0000", self.code())
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.bps())
    }
}

/// `RESET` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOption {
    /// `0`
    Soft,
    /// `1`
    Hard,
}

impl ResetOption {
    /// Argument text.
    pub fn arg(self) -> &'static str {
        match self {
            ResetOption::Soft => "0",
            ResetOption::Hard => "1",
        }
    }
}

/// Which handles a `PHSR` query lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhsrOption {
    /// `00`, every allocated handle.
    All,
    /// `01`, handles that need to be freed.
    ToBeFreed,
    /// `02`, occupied handles that are not initialized.
    NotInitialized,
    /// `03`, initialized handles that are not enabled.
    NotEnabled,
    /// `04`, enabled handles.
    Enabled,
}

impl PhsrOption {
    /// Argument text.
    pub fn arg(self) -> &'static str {
        match self {
            PhsrOption::All => "00",
            PhsrOption::ToBeFreed => "01",
            PhsrOption::NotInitialized => "02",
            PhsrOption::NotEnabled => "03",
            PhsrOption::Enabled => "04",
        }
    }
}

/// Tracking priority given to a handle by `PENA`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortEnableMode {
    /// `S`, a reference that is not expected to move.
    Static,
    /// `D`, a tool in motion.
    #[default]
    Dynamic,
    /// `B`, a button box with no tracked markers.
    ButtonBox,
}

impl PortEnableMode {
    /// Argument character.
    pub fn code(self) -> char {
        match self {
            PortEnableMode::Static => 'S',
            PortEnableMode::Dynamic => 'D',
            PortEnableMode::ButtonBox => 'B',
        }
    }
}

/// State of a tool LED set by `LED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    /// `B`, off.
    Blank,
    /// `F`, flashing.
    Flash,
    /// `S`, on.
    Solid,
}

impl LedState {
    /// Argument character.
    pub fn code(self) -> char {
        match self {
            LedState::Blank => 'B',
            LedState::Flash => 'F',
            LedState::Solid => 'S',
        }
    }
}

/// One entry of a `PHSR` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhsrEntry {
    /// Two hex digit handle ID.
    pub id: String,
    /// Flags from the low byte of the three digit status.
    pub status: ShortStatus,
}

fn parse_hex_u8(s: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |d: &str| {
        u8::from_str_radix(d, 16)
    })(s)
}

fn parse_handle_id(s: &str) -> IResult<&str, String> {
    map(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |d: &str| {
        d.to_ascii_uppercase()
    })(s)
}

fn low_two_digits(status: &str) -> &str {
    &status[1..]
}

fn parse_phsr_entry(s: &str) -> IResult<&str, (String, &str)> {
    pair(
        parse_handle_id,
        map(take_while_m_n(3, 3, |c: char| c.is_ascii_hexdigit()), low_two_digits),
    )(s)
}

/// `PHSR` replies may carry a trailing four hex digit CRC. The body is two
/// digits of count plus five per handle, so a length of 2 + 5n + 4 marks one.
/// The value itself is not checked.
fn strip_phsr_crc(reply: &str) -> &str {
    let reply = reply.trim_end();
    if reply.is_ascii() && reply.len() >= 6 && (reply.len() - 6) % 5 == 0 {
        &reply[..reply.len() - 4]
    } else {
        reply
    }
}

/// Parse a `PHSR` reply: two hex digits of count, then per handle two hex
/// digits of ID and three hex digits of status.
pub fn parse_phsr_reply(reply: &str) -> Result<Vec<PhsrEntry>> {
    let body = strip_phsr_crc(reply);
    let (_, raw) = all_consuming(length_count(parse_hex_u8, parse_phsr_entry))(body)
        .finish()
        .map_err(|_| NdiError::MalformedReply(reply.to_owned()))?;
    raw.into_iter()
        .map(|(id, status)| {
            Ok(PhsrEntry {
                id,
                status: parse_short_status(status)?,
            })
        })
        .collect()
}

/// Parse a `PHRQ` reply: the first two characters are the new handle ID.
pub fn parse_phrq_reply(reply: &str) -> Result<String> {
    parse_handle_id(reply.trim())
        .finish()
        .map(|(_, id)| id)
        .map_err(|_| NdiError::MalformedReply(reply.to_owned()))
}

/// The `ERRORxx` code in a reply, if the reply is an error.
pub fn parse_error_reply(reply: &str) -> Option<String> {
    preceded(tag::<_, _, nom::error::Error<&str>>("ERROR"), hex_digit1)(reply.trim())
        .ok()
        .map(|(_, code)| format!("ERROR{}", &code[..code.len().min(2)]))
}

/// Fail with [NdiError::DeviceError] when the device answered `ERRORxx`.
pub fn check_reply(reply: String) -> Result<String> {
    match parse_error_reply(&reply) {
        Some(code) => Err(NdiError::DeviceError(code)),
        None => Ok(reply),
    }
}

/// Upper case hex, two digits per byte.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}
