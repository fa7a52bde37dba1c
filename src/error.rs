//! Unified error type for bleadv.
//!
//! We avoid `alloc` - all error variants are plain codes so they can be
//! stored in the error attribute and sent to the peer as-is.
//!
//! Code convention, shared with the BLE client:
//!
//! - `0` is a successful completion,
//! - `1` is a deferred completion (asynchronous continuation, not an error),
//! - `2..` are errors; the error attribute stores them negated.

/// Successful, synchronous completion code.
pub const CODE_SUCCESS: i8 = 0;

/// Deferred completion code.
pub const CODE_DEFERRED: i8 = 1;

/// Top-level error type used across the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(i8)]
pub enum Error {
    /// Early abort on a policy decision (sleep entry, peer mismatch).
    /// Never recorded as a client-visible error.
    Abort = 2,
    /// Internal inconsistency (a bug, not a field condition).
    Internal = 3,
    /// I/O or communication error.
    Io = 4,
    /// Device not ready or not configured.
    NotReady = 5,
    /// Device is not powered.
    NotPowered = 6,
    /// Feature is not supported.
    NotSupported = 7,
    /// Value cannot fit in.
    Overflow = 8,
    /// Request is invalid or badly formatted.
    InvalidRequest = 9,
    /// Attribute identifier is not known.
    InvalidUuid = 10,
    /// Attribute cannot be modified.
    ReadOnly = 11,
    /// Value is not in valid range.
    OutOfRange = 12,
    /// Invalid radio channel.
    InvalidChannel = 13,
    /// Invalid duration or delay.
    InvalidDuration = 14,
    /// Invalid antenna.
    InvalidAntenna = 15,
    /// Invalid RF power.
    InvalidPower = 16,
    /// Invalid command or argument.
    InvalidCommand = 17,
    /// Invalid size.
    InvalidSize = 18,
    /// Another request is already in flight.
    Busy = 19,
    /// Device is not known.
    NoDevice = 20,
    /// Slave device is not known.
    NoSlaveDevice = 21,
    /// Safety/energy condition not met.
    Protected = 22,
    /// Unknown error.
    Unknown = 23,
}

impl Error {
    /// Negative code as stored in the error record.
    pub const fn code(self) -> i8 {
        -(self as i8)
    }

    /// Map a code (either sign) back to an error.
    ///
    /// Success and deferred codes are not errors; anything outside of the
    /// table collapses to [`Error::Unknown`].
    pub fn from_code(code: i8) -> Option<Self> {
        let error = match code.unsigned_abs() {
            0 | 1 => return None,
            2 => Error::Abort,
            3 => Error::Internal,
            4 => Error::Io,
            5 => Error::NotReady,
            6 => Error::NotPowered,
            7 => Error::NotSupported,
            8 => Error::Overflow,
            9 => Error::InvalidRequest,
            10 => Error::InvalidUuid,
            11 => Error::ReadOnly,
            12 => Error::OutOfRange,
            13 => Error::InvalidChannel,
            14 => Error::InvalidDuration,
            15 => Error::InvalidAntenna,
            16 => Error::InvalidPower,
            17 => Error::InvalidCommand,
            18 => Error::InvalidSize,
            19 => Error::Busy,
            20 => Error::NoDevice,
            21 => Error::NoSlaveDevice,
            22 => Error::Protected,
            _ => Error::Unknown,
        };
        Some(error)
    }

    /// Whether the failure is stored into the error attribute.
    pub const fn is_recorded(self) -> bool {
        !matches!(self, Error::Abort)
    }
}

/// Successful result of a reader, writer or worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// Completed within the call.
    Done,
    /// Completion continues asynchronously; the handler resumes it later.
    Deferred,
}

impl Outcome {
    /// Wire code of the outcome.
    pub const fn code(self) -> i8 {
        match self {
            Outcome::Done => CODE_SUCCESS,
            Outcome::Deferred => CODE_DEFERRED,
        }
    }
}

/// Result type returned by attribute handlers and workers.
pub type HandlerResult = Result<Outcome, Error>;
