#![cfg_attr(not(test), no_std)]
#![doc = "Paged access layer for external I2C/SPI EEPROM and flash."]
#![doc = ""]
#![doc = "Splits arbitrary spans into page- and bus-legal transactions and can"]
#![doc = "characterize an unknown part (address width, page size, capacity and"]
#![doc = "write time) with restoring probe writes."]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod detect;
mod device;
mod engine;
mod error;
mod monitor;
pub mod profile;
pub mod time;
pub mod transport;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use device::{ExternalMemory, NoWriteProtect};
pub use error::Error;
pub use profile::{
    AddressWidth, DeviceProfile, MemoryConfig, MemoryGeometry, MemoryType, RangePolicy,
    Segmentation, DEFAULT_BUS_ADDRESS, ERASED_BYTE, MAX_PAGE_SIZE_BYTES,
};
#[cfg(feature = "embassy-time")]
pub use time::EmbassyTimer;
pub use time::Monotonic;
pub use transport::{
    I2cTransport, JedecId, SpiTransport, Transport, DEFAULT_MAX_TRANSACTION_BYTES,
};
