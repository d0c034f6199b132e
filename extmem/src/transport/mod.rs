//! Bus transports.
//!
//! The engine only ever sees [`Transport`]: one call is one atomic bus
//! transaction (start, device address, address bytes, data, stop).

mod i2c;
mod spi;

pub use i2c::I2cTransport;
pub use spi::{JedecId, SpiTransport};

/// Default cap on one transaction's payload, address bytes included.
///
/// Large enough for a 256-byte page plus a two-byte address.
pub const DEFAULT_MAX_TRANSACTION_BYTES: usize = 258;

/// One addressed bus transaction at a time.
pub trait Transport {
    type Error;

    /// Upper bound on the payload of one transaction.
    ///
    /// For writes the address bytes count against it; for reads only the
    /// returned data does.
    fn max_transaction_bytes(&self) -> usize;

    /// `Ok(false)` when the device refuses the transaction, which is how
    /// a part that is still committing a write (or is absent) answers.
    fn is_ready(&mut self, bus_address: u8) -> Result<bool, Self::Error>;

    /// Sends `address` followed by `data` in a single frame.
    fn write(&mut self, bus_address: u8, address: &[u8], data: &[u8]) -> Result<(), Self::Error>;

    /// Sets the device's address pointer to `address` and reads `out.len()` bytes.
    fn read(&mut self, bus_address: u8, address: &[u8], out: &mut [u8]) -> Result<(), Self::Error>;

    /// Starts a whole-device erase to 0xFF.
    ///
    /// `Ok(false)` when the part has no such command, which is the case for
    /// every I2C EEPROM.
    fn erase_chip(&mut self, _bus_address: u8) -> Result<bool, Self::Error> {
        Ok(false)
    }
}
