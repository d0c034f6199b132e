//! Simulated 24xx-series I2C EEPROM.
//!
//! Models what the probes rely on: page-wrapping writes, address decoders
//! that drop high bits, block bits in the device address, and NACKing
//! every transaction while a write is being committed. Time only moves
//! through [`SimClock`], so a poll loop advances it deterministically.
//!
//! [`RecordingSpi`] is the SPI counterpart: it only records command frames.

extern crate alloc;

use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use embedded_hal_1::delay::DelayNs;
use embedded_hal_1::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use embedded_hal_1::spi::{self, SpiDevice};

use crate::profile::{
    AddressWidth, MemoryType, DEFAULT_BLOCK_SELECT_SHIFT, DEFAULT_BUS_ADDRESS, TWO_BYTE_DIRECT_SPAN,
    TWO_SEGMENT_SPAN, WIDE_BLOCK_SELECT_SHIFT,
};
use crate::time::Monotonic;
use crate::transport::DEFAULT_MAX_TRANSACTION_BYTES;

/// Shared simulated time. Clones observe the same clock.
#[derive(Clone, Debug, Default)]
pub struct SimClock {
    now_ns: Rc<Cell<u64>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns.get()
    }

    pub fn now_us(&self) -> u64 {
        self.now_ns.get() / 1_000
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.set(self.now_ns.get() + ns);
    }

    pub fn advance_us(&self, us: u64) {
        self.advance_ns(us * 1_000);
    }
}

impl DelayNs for SimClock {
    fn delay_ns(&mut self, ns: u32) {
        self.advance_ns(ns as u64);
    }
}

impl Monotonic for SimClock {
    fn now_micros(&mut self) -> u64 {
        self.now_us()
    }
}

/// Physical characteristics of a simulated part.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SimSpec {
    pub bus_address: u8,
    pub capacity_bytes: u32,
    pub page_size_bytes: u16,
    pub address_width: AddressWidth,
    /// Bus-address bit receiving the segment index, `None` for single-address parts.
    pub segment_shift: Option<u8>,
    pub write_time_us: u64,
    /// Payloads above this NACK with an overrun.
    pub max_transaction_bytes: usize,
}

impl SimSpec {
    /// A 24xx part wired the way the real family is.
    pub fn m24xx(capacity_bytes: u32, page_size_bytes: u16, address_width: AddressWidth) -> Self {
        let segment_shift = match address_width {
            AddressWidth::One if capacity_bytes > 256 => Some(0),
            AddressWidth::Two if capacity_bytes > TWO_SEGMENT_SPAN => Some(WIDE_BLOCK_SELECT_SHIFT),
            AddressWidth::Two if capacity_bytes > TWO_BYTE_DIRECT_SPAN => Some(DEFAULT_BLOCK_SELECT_SHIFT),
            _ => None,
        };
        Self {
            bus_address: DEFAULT_BUS_ADDRESS,
            capacity_bytes,
            page_size_bytes,
            address_width,
            segment_shift,
            write_time_us: 3_000,
            max_transaction_bytes: DEFAULT_MAX_TRANSACTION_BYTES,
        }
    }

    pub fn from_memory_type(memory_type: MemoryType) -> Self {
        let geometry = memory_type.geometry();
        let mut spec = Self::m24xx(
            geometry.capacity_bytes,
            geometry.page_size_bytes,
            geometry.address_width,
        );
        if let crate::Segmentation::BlockSelect { shift } = geometry.segmentation {
            spec.segment_shift = Some(shift);
        }
        spec
    }

    fn segments(&self) -> u32 {
        let span = self.address_width.span();
        if self.segment_shift.is_none() {
            return 1;
        }
        self.capacity_bytes.div_ceil(span).max(1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransactionKind {
    /// Empty write, answered with an ACK.
    Probe,
    Write,
    Read,
}

/// One acknowledged transaction as seen by the part.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub bus_address: u8,
    pub kind: TransactionKind,
    /// Decoded memory address, `None` when fewer address bytes than the part expects arrived.
    pub address: Option<u32>,
    pub data_len: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimError {
    Nack,
    Overrun,
}

impl embedded_hal_1::i2c::Error for SimError {
    fn kind(&self) -> ErrorKind {
        match self {
            SimError::Nack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            SimError::Overrun => ErrorKind::Overrun,
        }
    }
}

struct SimState {
    spec: SimSpec,
    clock: SimClock,
    memory: Vec<u8>,
    pointer: u32,
    busy_until_ns: u64,
    log: Vec<Transaction>,
}

impl SimState {
    fn is_busy(&self) -> bool {
        self.clock.now_ns() < self.busy_until_ns
    }

    fn segment_for(&self, bus_address: u8) -> Option<u32> {
        let Some(shift) = self.spec.segment_shift else {
            return (bus_address == self.spec.bus_address).then_some(0);
        };
        let segments = self.spec.segments();
        let mask = ((segments.next_power_of_two() - 1) as u8) << shift;
        if bus_address & !mask != self.spec.bus_address & !mask {
            return None;
        }
        let segment = ((bus_address & mask) >> shift) as u32;
        (segment < segments).then_some(segment)
    }

    fn transaction(&mut self, bus_address: u8, operations: &mut [Operation<'_>]) -> Result<(), SimError> {
        let segment = self.segment_for(bus_address).ok_or(SimError::Nack)?;
        if self.is_busy() {
            return Err(SimError::Nack);
        }

        let mut pending: Option<Vec<u8>> = None;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(bytes) => pending.get_or_insert_with(Vec::new).extend_from_slice(bytes),
                Operation::Read(buf) => {
                    // Repeated START aborts the write phase: only the pointer moves.
                    if let Some(payload) = pending.take() {
                        self.write_phase(bus_address, segment, &payload, false)?;
                    }
                    if buf.len() > self.spec.max_transaction_bytes {
                        return Err(SimError::Overrun);
                    }
                    self.read_phase(bus_address, buf);
                }
            }
        }
        if let Some(payload) = pending {
            self.write_phase(bus_address, segment, &payload, true)?;
        }
        Ok(())
    }

    fn write_phase(&mut self, bus_address: u8, segment: u32, payload: &[u8], commit: bool) -> Result<(), SimError> {
        if payload.len() > self.spec.max_transaction_bytes {
            return Err(SimError::Overrun);
        }
        if payload.is_empty() {
            self.log.push(Transaction {
                bus_address,
                kind: TransactionKind::Probe,
                address: None,
                data_len: 0,
            });
            return Ok(());
        }

        let width = self.spec.address_width.bytes();
        if payload.len() < width {
            self.log.push(Transaction {
                bus_address,
                kind: TransactionKind::Write,
                address: None,
                data_len: 0,
            });
            return Ok(());
        }

        let word = payload[..width]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let capacity = self.spec.capacity_bytes;
        let address = (segment * self.spec.address_width.span() + word) % capacity;
        self.pointer = address;

        let data = &payload[width..];
        let committed = if commit { data.len() } else { 0 };
        if committed > 0 {
            let page = self.spec.page_size_bytes as u32;
            let page_base = address - address % page;
            let in_page = address % page;
            for (i, byte) in data.iter().enumerate() {
                let target = page_base + (in_page + i as u32) % page;
                self.memory[(target % capacity) as usize] = *byte;
            }
            self.busy_until_ns = self.clock.now_ns() + self.spec.write_time_us * 1_000;
        }
        self.log.push(Transaction {
            bus_address,
            kind: TransactionKind::Write,
            address: Some(address),
            data_len: committed,
        });
        Ok(())
    }

    fn read_phase(&mut self, bus_address: u8, buf: &mut [u8]) {
        let start = self.pointer;
        for byte in buf.iter_mut() {
            *byte = self.memory[self.pointer as usize];
            self.pointer = (self.pointer + 1) % self.spec.capacity_bytes;
        }
        self.log.push(Transaction {
            bus_address,
            kind: TransactionKind::Read,
            address: Some(start),
            data_len: buf.len(),
        });
    }
}

/// Handle to a simulated part; clones share the same memory.
#[derive(Clone)]
pub struct SimulatedEeprom {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedEeprom {
    /// Creates a blank (all `0xFF`) part.
    pub fn new(spec: SimSpec, clock: SimClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                spec,
                clock,
                memory: vec![0xFF; spec.capacity_bytes as usize],
                pointer: 0,
                busy_until_ns: 0,
                log: Vec::new(),
            })),
        }
    }

    /// The I2C bus this part sits on.
    pub fn bus(&self) -> SimBus {
        SimBus {
            state: self.state.clone(),
        }
    }

    pub fn clock(&self) -> SimClock {
        self.state.borrow().clock.clone()
    }

    pub fn spec(&self) -> SimSpec {
        self.state.borrow().spec
    }

    pub fn memory(&self) -> Vec<u8> {
        self.state.borrow().memory.clone()
    }

    /// Preloads content without bus traffic.
    pub fn load(&self, offset: usize, bytes: &[u8]) {
        self.state.borrow_mut().memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.borrow().log.clone()
    }

    pub fn clear_transactions(&self) {
        self.state.borrow_mut().log.clear();
    }

    /// Writes that actually committed data.
    pub fn committed_writes(&self) -> Vec<Transaction> {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|t| t.kind == TransactionKind::Write && t.data_len > 0)
            .copied()
            .collect()
    }
}

/// `embedded-hal` I2C bus with one [`SimulatedEeprom`] attached.
pub struct SimBus {
    state: Rc<RefCell<SimState>>,
}

impl ErrorType for SimBus {
    type Error = SimError;
}

impl I2c for SimBus {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.state.borrow_mut().transaction(address, operations)
    }
}

/// SPI device that records the bytes written by each transaction.
///
/// Every read is answered with `status`, so `status = 0` reads as an idle
/// status register.
#[derive(Debug, Default)]
pub struct RecordingSpi {
    pub frames: Vec<Vec<u8>>,
    pub status: u8,
}

impl RecordingSpi {
    /// Frames starting with `command`.
    pub fn frames_with(&self, command: u8) -> usize {
        self.frames.iter().filter(|f| f.first() == Some(&command)).count()
    }
}

impl spi::ErrorType for RecordingSpi {
    type Error = Infallible;
}

impl SpiDevice for RecordingSpi {
    fn transaction(&mut self, operations: &mut [spi::Operation<'_, u8>]) -> Result<(), Infallible> {
        let mut frame = Vec::new();
        for op in operations.iter_mut() {
            match op {
                spi::Operation::Write(bytes) => frame.extend_from_slice(bytes),
                spi::Operation::Read(buf) => buf.fill(self.status),
                spi::Operation::Transfer(read, write) => {
                    frame.extend_from_slice(write);
                    read.fill(self.status);
                }
                spi::Operation::TransferInPlace(buf) => {
                    frame.extend_from_slice(buf);
                    buf.fill(self.status);
                }
                spi::Operation::DelayNs(_) => {}
            }
        }
        self.frames.push(frame);
        Ok(())
    }
}
