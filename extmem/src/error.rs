//! Driver error type.

use core::fmt;

/// Error returned by every fallible memory operation.
///
/// `E` is the error type of the underlying [`Transport`](crate::Transport).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// A bus transaction failed. Never retried by the driver.
    Bus(E),
    /// No device acknowledged the configured bus address.
    NotConnected,
    /// The device stayed busy for the whole ready-poll budget.
    Timeout,
    /// The span does not fit the device and the range policy rejects it.
    OutOfBounds,
    /// The profile or configuration cannot drive a transaction.
    InvalidConfiguration,
    /// The write-protect pin could not be driven.
    WriteProtect,
    /// No terminator was found before the caller's buffer filled up.
    StringTooLong,
    /// The stored string is not valid UTF-8.
    InvalidUtf8,
}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Bus(err)
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus(e) => write!(f, "bus transaction failed: {:?}", e),
            Error::NotConnected => f.write_str("device not present at bus address"),
            Error::Timeout => f.write_str("device did not become ready"),
            Error::OutOfBounds => f.write_str("span exceeds device capacity"),
            Error::InvalidConfiguration => f.write_str("invalid device configuration"),
            Error::WriteProtect => f.write_str("write-protect pin error"),
            Error::StringTooLong => f.write_str("string does not fit the buffer"),
            Error::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
        }
    }
}
