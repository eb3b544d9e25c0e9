//! Error types for the actuator link.
//!
//! `ActError` is the single error type shared by every layer of the workspace. Using
//! `thiserror`, it keeps protocol faults (bad checksums, short frames), transport
//! faults (the serial port itself failing) and usage faults (calling a motion command
//! while disconnected) distinguishable, so callers can decide which ones to degrade,
//! which to retry and which end the session.
//!
//! ## Error Categories
//!
//! - **Discovery**: `NoResponsiveDevice`. Every candidate endpoint was probed and none
//!   answered with a CRC-valid frame.
//! - **Protocol**: `ChecksumMismatch`, `ShortRead`, `MalformedResponse`. The device
//!   answered, but not with usable data. These never invalidate the link.
//! - **Transport**: `Io`, `Serial`. The underlying port failed. These are link-fatal:
//!   see [`ActError::is_link_fatal`].
//! - **Motion**: `SettleTimeout`. A blocking move did not reach tolerance in time.
//! - **Usage**: `NotConnected`, `InvalidParameter`. Rejected before any I/O.
//! - **Configuration**: `Config`, `Configuration`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using [`ActError`].
pub type ActResult<T> = std::result::Result<T, ActError>;

/// Coarse classification of an [`ActError`], used for structured log fields and
/// stress-run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No endpoint answered the probe
    Discovery,
    /// CRC trailer did not verify
    Checksum,
    /// Frame truncated or missing fields
    Malformed,
    /// Port-level failure
    Transport,
    /// Motion did not settle
    Timeout,
    /// Rejected argument or missing link
    Usage,
    /// Bad or unreadable configuration
    Configuration,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::Discovery => "discovery",
            FaultKind::Checksum => "checksum",
            FaultKind::Malformed => "malformed",
            FaultKind::Transport => "transport",
            FaultKind::Timeout => "timeout",
            FaultKind::Usage => "usage",
            FaultKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the actuator link.
#[derive(Error, Debug)]
pub enum ActError {
    /// Configuration sources could not be read or deserialized.
    ///
    /// **Source**: wraps `figment::Error` (boxed, it is large).
    #[error("Configuration error: {0}")]
    Config(#[source] Box<figment::Error>),

    /// Configuration parsed but failed semantic validation (zero baud rate, a command
    /// literal with a bad checksum, ...).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The serial stream failed while reading or writing.
    ///
    /// **Error Type**: link-fatal. The controller drops the link when one of these
    /// escapes a motion command.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// A frame's trailing two bytes do not match the CRC16 computed over the rest.
    #[error("Checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch {
        /// CRC computed over the frame body
        computed: u16,
        /// CRC carried in the frame trailer (low byte first on the wire)
        received: u16,
    },

    /// The stream ended or the deadline passed before a fixed-size read completed.
    ///
    /// A short read is a protocol error, never retried in place.
    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead {
        /// Bytes the read required
        expected: usize,
        /// Bytes that actually arrived
        received: usize,
    },

    /// A CRC-valid frame is too short or otherwise lacks the expected fields.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Discovery probed every candidate endpoint and none answered validly.
    #[error("No responsive device found after probing {tried} endpoint(s)")]
    NoResponsiveDevice {
        /// Number of endpoints probed (preferred endpoint included)
        tried: usize,
    },

    /// A command was issued without an open link.
    #[error("Actuator is not connected")]
    NotConnected,

    /// A caller-supplied argument was rejected before any I/O.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A blocking move did not reach tolerance before its deadline.
    #[error(
        "Motion did not settle within {timeout:?}: expected position {expected}, last observed {actual}"
    )]
    SettleTimeout {
        /// Position the move was expected to reach (external units)
        expected: i32,
        /// Last position read before the deadline (external units)
        actual: i32,
        /// The deadline that elapsed
        timeout: Duration,
    },
}

impl From<figment::Error> for ActError {
    fn from(err: figment::Error) -> Self {
        ActError::Config(Box::new(err))
    }
}

impl ActError {
    /// Whether this error means the underlying port can no longer be trusted.
    ///
    /// Protocol faults (bad CRC, short or malformed frames) leave the link usable.
    pub fn is_link_fatal(&self) -> bool {
        match self {
            ActError::Io(_) => true,
            #[cfg(feature = "serial")]
            ActError::Serial(_) => true,
            _ => false,
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> FaultKind {
        match self {
            ActError::Config(_) | ActError::Configuration(_) => FaultKind::Configuration,
            ActError::Io(_) => FaultKind::Transport,
            #[cfg(feature = "serial")]
            ActError::Serial(_) => FaultKind::Transport,
            ActError::ChecksumMismatch { .. } => FaultKind::Checksum,
            ActError::ShortRead { .. } | ActError::MalformedResponse(_) => FaultKind::Malformed,
            ActError::NoResponsiveDevice { .. } => FaultKind::Discovery,
            ActError::NotConnected | ActError::InvalidParameter(_) => FaultKind::Usage,
            ActError::SettleTimeout { .. } => FaultKind::Timeout,
        }
    }

    /// Process exit code for command-line front ends.
    ///
    /// Discovery failures and settle timeouts get distinct codes so scripts can tell
    /// "nothing on the bus" from "the axis stalled".
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            FaultKind::Discovery => 2,
            FaultKind::Timeout => 3,
            _ => 1,
        }
    }
}
