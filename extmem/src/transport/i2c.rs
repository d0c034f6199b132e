//! I2C transport for 24xx-series parts.

use embedded_hal_1::i2c::{Error as _, ErrorKind, I2c, Operation};

use super::{Transport, DEFAULT_MAX_TRANSACTION_BYTES};

/// [`Transport`] over any `embedded-hal` 1.0 I2C bus.
///
/// Several memories on one bus each need their own `I2cTransport`; share
/// the bus with a bus-sharing wrapper from `embedded-hal-bus`.
pub struct I2cTransport<I2C> {
    i2c: I2C,
    max_transaction_bytes: usize,
}

impl<I2C: I2c> I2cTransport<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self {
            i2c,
            max_transaction_bytes: DEFAULT_MAX_TRANSACTION_BYTES,
        }
    }

    /// Caps transactions for controllers with a small hardware buffer.
    ///
    /// Values below 3 leave no room for data after a two-byte address
    /// and make every write fail with `InvalidConfiguration`.
    pub fn with_max_transaction_bytes(mut self, max: usize) -> Self {
        self.max_transaction_bytes = max;
        self
    }

    pub fn free(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c> Transport for I2cTransport<I2C> {
    type Error = I2C::Error;

    fn max_transaction_bytes(&self) -> usize {
        self.max_transaction_bytes
    }

    fn is_ready(&mut self, bus_address: u8) -> Result<bool, Self::Error> {
        // Probe only: address ACKed, no data.
        match self.i2c.write(bus_address, &[]) {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::NoAcknowledge(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, bus_address: u8, address: &[u8], data: &[u8]) -> Result<(), Self::Error> {
        // Adjacent write operations share one frame, no repeated START.
        self.i2c.transaction(
            bus_address,
            &mut [Operation::Write(address), Operation::Write(data)],
        )
    }

    fn read(&mut self, bus_address: u8, address: &[u8], out: &mut [u8]) -> Result<(), Self::Error> {
        self.i2c.write_read(bus_address, address, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, SimSpec, SimulatedEeprom, TransactionKind};
    use crate::AddressWidth;

    fn transport() -> (SimulatedEeprom, I2cTransport<crate::sim::SimBus>) {
        let sim = SimulatedEeprom::new(SimSpec::m24xx(4096, 32, AddressWidth::Two), SimClock::new());
        let transport = I2cTransport::new(sim.bus());
        (sim, transport)
    }

    #[test]
    fn write_sends_address_and_data_in_one_frame() {
        let (sim, mut transport) = transport();
        transport.write(0x50, &[0x01, 0x00], &[1, 2, 3]).unwrap();

        let log = sim.transactions();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, TransactionKind::Write);
        assert_eq!(log[0].address, Some(0x100));
        assert_eq!(log[0].data_len, 3);
        assert_eq!(&sim.memory()[0x100..0x103], &[1, 2, 3]);
    }

    #[test]
    fn nack_while_busy_reads_as_not_ready() {
        let (sim, mut transport) = transport();
        assert!(transport.is_ready(0x50).unwrap());
        transport.write(0x50, &[0x00, 0x00], &[7]).unwrap();
        assert!(!transport.is_ready(0x50).unwrap());

        sim.clock().advance_us(sim.spec().write_time_us);
        assert!(transport.is_ready(0x50).unwrap());
    }

    #[test]
    fn absent_device_is_not_ready() {
        let (_sim, mut transport) = transport();
        assert!(!transport.is_ready(0x51).unwrap());
    }

    #[test]
    fn read_uses_address_pointer() {
        let (sim, mut transport) = transport();
        sim.load(0x20, &[9, 8, 7]);
        let mut out = [0u8; 3];
        transport.read(0x50, &[0x00, 0x20], &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
    }
}
