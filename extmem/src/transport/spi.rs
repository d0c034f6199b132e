//! SPI transport for 25xx-series EEPROM and serial NOR flash.

use embedded_hal_1::spi::{Operation, SpiDevice};

use super::{Transport, DEFAULT_MAX_TRANSACTION_BYTES};

const CMD_WRITE: u8 = 0x02;
const CMD_READ: u8 = 0x03;
const CMD_READ_STATUS: u8 = 0x05;
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_SECTOR_ERASE: u8 = 0x20;
const CMD_BLOCK_ERASE: u8 = 0x52;
const CMD_READ_JEDEC_ID: u8 = 0x9F;
const CMD_CHIP_ERASE: u8 = 0xC7;

const STATUS_WIP: u8 = 0x01;
/// 25xx040 carries A8 in bit 3 of the instruction.
const INSTRUCTION_A8_SHIFT: u8 = 3;

/// JEDEC manufacturer and device identification (`0x9F`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JedecId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

/// [`Transport`] over an `embedded-hal` 1.0 SPI device.
///
/// Chip select framing belongs to the `SpiDevice`. There is no bus address
/// on SPI, so the low bit of `bus_address` is only used as A8 on 4 Kbit
/// parts (pair with [`Segmentation::DeviceAddressBits`](crate::Segmentation)
/// and a bus address of 0).
///
/// Serial flash is addressed with [`AddressWidth::Three`](crate::AddressWidth)
/// and needs its sectors erased before programming; see
/// [`with_chip_erase`](Self::with_chip_erase).
pub struct SpiTransport<SPI> {
    spi: SPI,
    max_transaction_bytes: usize,
    chip_erase: bool,
}

impl<SPI: SpiDevice> SpiTransport<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self {
            spi,
            max_transaction_bytes: DEFAULT_MAX_TRANSACTION_BYTES,
            chip_erase: false,
        }
    }

    /// Declares that the part understands the chip-erase command (`0xC7`).
    ///
    /// Most 25xx EEPROMs do not; leave it off for them.
    pub fn with_chip_erase(mut self, supported: bool) -> Self {
        self.chip_erase = supported;
        self
    }

    pub fn with_max_transaction_bytes(mut self, max: usize) -> Self {
        self.max_transaction_bytes = max;
        self
    }

    pub fn free(self) -> SPI {
        self.spi
    }

    #[inline(always)]
    fn instruction(cmd: u8, bus_address: u8) -> u8 {
        cmd | ((bus_address & 0x01) << INSTRUCTION_A8_SHIFT)
    }

    pub fn read_status(&mut self) -> Result<u8, SPI::Error> {
        let mut status = [0u8; 1];
        self.spi.transaction(&mut [
            Operation::Write(&[CMD_READ_STATUS]),
            Operation::Read(&mut status),
        ])?;
        Ok(status[0])
    }

    pub fn read_jedec_id(&mut self) -> Result<JedecId, SPI::Error> {
        let mut id = [0u8; 3];
        self.spi.transaction(&mut [
            Operation::Write(&[CMD_READ_JEDEC_ID]),
            Operation::Read(&mut id),
        ])?;
        Ok(JedecId {
            manufacturer: id[0],
            memory_type: id[1],
            capacity: id[2],
        })
    }

    /// Erases the 4 KiB sector holding `address`.
    pub fn erase_sector(&mut self, address: u32) -> Result<(), SPI::Error> {
        self.addressed_command(CMD_SECTOR_ERASE, address)
    }

    /// Erases the 32 KiB block holding `address`.
    pub fn erase_block(&mut self, address: u32) -> Result<(), SPI::Error> {
        self.addressed_command(CMD_BLOCK_ERASE, address)
    }

    fn addressed_command(&mut self, cmd: u8, address: u32) -> Result<(), SPI::Error> {
        let [_, a2, a1, a0] = address.to_be_bytes();
        self.spi.write(&[CMD_WRITE_ENABLE])?;
        self.spi.write(&[cmd, a2, a1, a0])
    }
}

impl<SPI: SpiDevice> Transport for SpiTransport<SPI> {
    type Error = SPI::Error;

    fn max_transaction_bytes(&self) -> usize {
        self.max_transaction_bytes
    }

    fn is_ready(&mut self, _bus_address: u8) -> Result<bool, Self::Error> {
        Ok(self.read_status()? & STATUS_WIP == 0)
    }

    fn write(&mut self, bus_address: u8, address: &[u8], data: &[u8]) -> Result<(), Self::Error> {
        // The write-enable latch resets after every completed write.
        self.spi.write(&[CMD_WRITE_ENABLE])?;
        self.spi.transaction(&mut [
            Operation::Write(&[Self::instruction(CMD_WRITE, bus_address)]),
            Operation::Write(address),
            Operation::Write(data),
        ])
    }

    fn read(&mut self, bus_address: u8, address: &[u8], out: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.transaction(&mut [
            Operation::Write(&[Self::instruction(CMD_READ, bus_address)]),
            Operation::Write(address),
            Operation::Read(out),
        ])
    }

    fn erase_chip(&mut self, _bus_address: u8) -> Result<bool, Self::Error> {
        if !self.chip_erase {
            return Ok(false);
        }
        self.spi.write(&[CMD_WRITE_ENABLE])?;
        self.spi.write(&[CMD_CHIP_ERASE])?;
        Ok(true)
    }
}
