//! The error type shared by every layer of the driver, from the transport up
//! to the [Driver](crate::driver::Driver).

use std::{borrow::Cow, fmt, io};

/// Everything that can go wrong while talking to a System Control Unit.
#[derive(Debug)]
pub enum NdiError {
    /// The byte stream failed: short read, short write, timeout, or the port
    /// went away. Fatal for the current command; the caller may reopen.
    Transport(io::Error),

    /// A command was issued while the transport was closed.
    PortNotOpen,

    /// The device answered with text we could not make sense of.
    MalformedReply(String),

    /// A status field was not valid hex of the expected width.
    MalformedStatus(String),

    /// Polling or port handle work was attempted before `INIT`.
    NotInitialized,

    /// The command is not legal in the driver's current lifecycle state.
    InvalidState {
        /// What the command needs.
        expected: &'static str,
        /// Where the driver actually is.
        actual: &'static str,
    },

    /// A caller supplied a value the protocol does not support.
    InvalidArgument(String),

    /// A protocol feature that this driver deliberately does not implement.
    NotImplemented(&'static str),

    /// A port handle ID that is not in the handle table.
    UnknownPortHandle(String),

    /// The device replied `ERRORxx` to a command whose reply the driver
    /// itself has to interpret.
    DeviceError(String),

    /// Reading a configuration or tool definition file failed.
    Io(io::Error),

    /// The RON configuration file could not be parsed.
    Config(ron::de::SpannedError),
}

impl fmt::Display for NdiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use NdiError as E;
        let msg = match self {
            E::Transport(error) => Cow::from(format!("transport error: {}", error)),
            E::PortNotOpen => Cow::from("serial port is not open"),
            E::MalformedReply(reply) => Cow::from(format!("malformed reply: {:?}", reply)),
            E::MalformedStatus(status) => Cow::from(format!("malformed status: {:?}", status)),
            E::NotInitialized => Cow::from("device has not been initialized with INIT"),
            E::InvalidState { expected, actual } => Cow::from(format!(
                "command requires the {} state, but the device is in the {} state",
                expected, actual
            )),
            E::InvalidArgument(what) => Cow::from(format!("invalid argument: {}", what)),
            E::NotImplemented(what) => Cow::from(format!("not implemented: {}", what)),
            E::UnknownPortHandle(id) => Cow::from(format!("unknown port handle {}", id)),
            E::DeviceError(code) => Cow::from(format!("device replied {}", code)),
            E::Io(error) => Cow::from(format!("io error: {}", error)),
            E::Config(error) => Cow::from(format!("config error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for NdiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NdiError::Transport(error) | NdiError::Io(error) => Some(error),
            NdiError::Config(error) => Some(error),
            _ => None,
        }
    }
}

/// Failures on the byte stream are transport failures; file system failures
/// are mapped explicitly with [NdiError::Io] at the call site.
impl From<io::Error> for NdiError {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

impl From<ron::de::SpannedError> for NdiError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Config(value)
    }
}

/// Shorthand used throughout the crate.
pub type Result<T> = std::result::Result<T, NdiError>;
