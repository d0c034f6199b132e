//! Public driver handle.

use core::cmp::min;
use core::convert::Infallible;

use embedded_hal_1::delay::DelayNs;
use embedded_hal_1::digital::{self, OutputPin};
use embedded_hal_1::spi::SpiDevice;
use embedded_storage::{ReadStorage, Storage};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::detect::DEFAULT_LATENCY_TESTS;
use crate::engine::MemoryCore;
use crate::error::Error;
use crate::profile::{
    AddressWidth, DeviceProfile, MemoryConfig, MemoryType, RangePolicy, Segmentation, ERASED_BYTE,
    MAX_PAGE_SIZE_BYTES,
};
use crate::time::Monotonic;
use crate::transport::{JedecId, SpiTransport, Transport};

const STRING_TERMINATOR: u8 = 0x00;
const STRING_READ_BLOCK: usize = 32;

/// Stand-in for boards without a write-protect line.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoWriteProtect;

impl digital::ErrorType for NoWriteProtect {
    type Error = Infallible;
}

impl OutputPin for NoWriteProtect {
    #[inline(always)]
    fn set_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    #[inline(always)]
    fn set_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// A paged I2C/SPI memory presented as one flat byte array.
///
/// ```ignore
/// let mut eeprom = ExternalMemory::new(I2cTransport::new(i2c), delay, MemoryConfig::default())?;
/// eeprom.connect()?;
/// eeprom.write_span(0x100, b"hello")?;
/// ```
pub struct ExternalMemory<T, D, W = NoWriteProtect> {
    core: MemoryCore<T, D, W>,
    rng: SmallRng,
}

impl<T, D> ExternalMemory<T, D, NoWriteProtect>
where
    T: Transport,
    D: DelayNs,
{
    pub fn new(transport: T, delay: D, config: MemoryConfig) -> Result<Self, Error<T::Error>> {
        Self::with_write_protect(transport, delay, NoWriteProtect, config)
    }
}

impl<T, D, W> ExternalMemory<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    /// Like [`new`](ExternalMemory::new), driving `write_protect` low only while writing.
    pub fn with_write_protect(
        transport: T,
        delay: D,
        write_protect: W,
        config: MemoryConfig,
    ) -> Result<Self, Error<T::Error>> {
        let rng = SmallRng::seed_from_u64(config.probe_seed);
        let core = MemoryCore::new(transport, delay, write_protect, config)?;
        Ok(Self { core, rng })
    }

    /// Checks the device answers, then probes every undiscovered profile field.
    pub fn connect(&mut self) -> Result<(), Error<T::Error>> {
        if !self.core.is_connected()? {
            warn!("no device at 0x{:x}", self.core.config.profile.bus_address);
            return Err(Error::NotConnected);
        }

        let profile = self.core.config.profile;
        if profile.address_width.is_none() {
            self.core.detect_address_width(&mut self.rng)?;
        }
        if profile.capacity_bytes == 0 {
            self.core.detect_capacity(&mut self.rng)?;
        }
        if profile.page_size_bytes == 0 {
            self.core.detect_page_size(&mut self.rng)?;
        }

        let profile = &self.core.config.profile;
        info!(
            "memory at 0x{:x}: {} bytes, {} byte pages",
            profile.bus_address,
            profile.capacity_bytes,
            profile.page_size_bytes
        );
        Ok(())
    }

    pub fn is_connected(&mut self) -> Result<bool, Error<T::Error>> {
        self.core.is_connected()
    }

    /// `true` while the device is still committing a write.
    pub fn is_busy(&mut self) -> Result<bool, Error<T::Error>> {
        self.core.is_busy()
    }

    pub fn read_byte(&mut self, offset: u32) -> Result<u8, Error<T::Error>> {
        self.core.read_byte(offset)
    }

    /// Fills `out` from `offset` and returns how many bytes were read.
    ///
    /// Less than `out.len()` only when the span runs past the end of the
    /// device under [`RangePolicy::Truncate`].
    pub fn read_span(&mut self, offset: u32, out: &mut [u8]) -> Result<usize, Error<T::Error>> {
        self.core.read_span(offset, out)
    }

    /// Writes `value` unless the cell already holds it.
    pub fn write_byte(&mut self, offset: u32, value: u8) -> Result<(), Error<T::Error>> {
        self.core.write_byte(offset, value)
    }

    /// Writes `data` at `offset` and returns how many bytes were written.
    ///
    /// A failure part way leaves the chunks before it committed.
    pub fn write_span(&mut self, offset: u32, data: &[u8]) -> Result<usize, Error<T::Error>> {
        self.core.write_span(offset, data)
    }

    /// Writes `fill` to every cell.
    ///
    /// Filling with [`ERASED_BYTE`] uses the part's chip-erase command when
    /// the transport has one.
    pub fn erase(&mut self, fill: u8) -> Result<(), Error<T::Error>> {
        let bus_address = self.core.config.profile.bus_address;
        if fill == ERASED_BYTE && self.core.erase_with(|t| t.erase_chip(bus_address))? {
            debug!("chip erased");
            return Ok(());
        }

        let block = [fill; MAX_PAGE_SIZE_BYTES];
        let capacity = self.core.config.profile.capacity_bytes;
        let mut offset = 0u32;
        while offset < capacity {
            let len = min(block.len() as u32, capacity - offset);
            self.core.write_span(offset, &block[..len as usize])?;
            offset += len;
        }
        Ok(())
    }

    /// Writes `s` followed by a NUL terminator and returns the offset after it.
    ///
    /// An embedded NUL ends the string early for [`read_str`](Self::read_str).
    pub fn write_str(&mut self, offset: u32, s: &str) -> Result<u32, Error<T::Error>> {
        let len = s.len() as u32;
        let end = offset as u64 + len as u64 + 1;
        if end > self.core.config.profile.capacity_bytes as u64 {
            return Err(Error::OutOfBounds);
        }
        self.core.write_span(offset, s.as_bytes())?;
        self.core.write_span(offset + len, &[STRING_TERMINATOR])?;
        Ok(offset + len + 1)
    }

    /// Reads a NUL-terminated string at `offset` into `buf`.
    pub fn read_str<'b>(&mut self, offset: u32, buf: &'b mut [u8]) -> Result<&'b str, Error<T::Error>> {
        let capacity = self.core.config.profile.capacity_bytes;
        let mut len = 0usize;
        loop {
            if len == buf.len() {
                return Err(Error::StringTooLong);
            }
            let at = offset.saturating_add(len as u32);
            if at >= capacity {
                return Err(Error::OutOfBounds);
            }
            let block = min(
                min(buf.len() - len, STRING_READ_BLOCK),
                (capacity - at) as usize,
            );
            let read = self.core.read_span(at, &mut buf[len..len + block])?;
            if let Some(end) = buf[len..len + read].iter().position(|b| *b == STRING_TERMINATOR) {
                len += end;
                break;
            }
            len += read;
        }
        core::str::from_utf8(&buf[..len]).map_err(|_| Error::InvalidUtf8)
    }

    pub fn detect_address_width(&mut self) -> Result<AddressWidth, Error<T::Error>> {
        self.core.detect_address_width(&mut self.rng)
    }

    pub fn detect_capacity(&mut self) -> Result<u32, Error<T::Error>> {
        self.core.detect_capacity(&mut self.rng)
    }

    pub fn detect_page_size(&mut self) -> Result<u16, Error<T::Error>> {
        self.core.detect_page_size(&mut self.rng)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.core.config.profile
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.core.config
    }

    pub fn bus_address(&self) -> u8 {
        self.core.config.profile.bus_address
    }

    pub fn set_bus_address(&mut self, bus_address: u8) -> Result<(), Error<T::Error>> {
        if bus_address > 0x7F {
            return Err(Error::InvalidConfiguration);
        }
        self.core.config.profile.bus_address = bus_address;
        Ok(())
    }

    pub fn capacity_bytes(&self) -> u32 {
        self.core.config.profile.capacity_bytes
    }

    pub fn set_capacity_bytes(&mut self, capacity_bytes: u32) {
        self.core.config.profile.capacity_bytes = capacity_bytes;
    }

    pub fn page_size_bytes(&self) -> u16 {
        self.core.config.profile.page_size_bytes
    }

    pub fn set_page_size_bytes(&mut self, page_size_bytes: u16) {
        self.core.config.profile.page_size_bytes = page_size_bytes;
    }

    pub fn address_width(&self) -> Option<AddressWidth> {
        self.core.config.profile.address_width
    }

    pub fn set_address_width(&mut self, address_width: Option<AddressWidth>) {
        self.core.config.profile.address_width = address_width;
    }

    pub fn write_time_ms(&self) -> u8 {
        self.core.config.profile.write_time_ms
    }

    pub fn set_write_time_ms(&mut self, write_time_ms: u8) {
        self.core.config.profile.write_time_ms = write_time_ms;
    }

    pub fn is_polling_enabled(&self) -> bool {
        self.core.config.profile.poll_for_write_complete
    }

    pub fn enable_polling(&mut self) {
        self.core.config.profile.poll_for_write_complete = true;
    }

    pub fn disable_polling(&mut self) {
        self.core.config.profile.poll_for_write_complete = false;
    }

    pub fn segmentation(&self) -> Segmentation {
        self.core.config.profile.segmentation
    }

    pub fn set_segmentation(&mut self, segmentation: Segmentation) -> Result<(), Error<T::Error>> {
        if let Segmentation::BlockSelect { shift } = segmentation {
            if shift > 6 {
                return Err(Error::InvalidConfiguration);
            }
        }
        self.core.config.profile.segmentation = segmentation;
        Ok(())
    }

    pub fn range_policy(&self) -> RangePolicy {
        self.core.config.range_policy
    }

    pub fn set_range_policy(&mut self, range_policy: RangePolicy) {
        self.core.config.range_policy = range_policy;
    }

    /// Sets capacity, page size, address width and segmentation of a known part.
    pub fn set_memory_type(&mut self, memory_type: MemoryType) {
        self.core.config.profile.apply_memory_type(memory_type);
    }

    pub fn free(self) -> (T, D, W) {
        (self.core.transport, self.core.delay, self.core.write_protect)
    }

    fn ensure_bounds(&self, offset: u32, len: usize) -> Result<(), Error<T::Error>> {
        let end = (offset as u64).checked_add(len as u64).ok_or(Error::OutOfBounds)?;
        if end > self.core.config.profile.capacity_bytes as u64 {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }
}

impl<T, D, W> ExternalMemory<T, D, W>
where
    T: Transport,
    D: DelayNs + Monotonic,
    W: OutputPin,
{
    /// Times 8 writes and stores the rounded-up average plus 10 % as write time.
    pub fn detect_write_latency(&mut self) -> Result<u8, Error<T::Error>> {
        self.detect_write_latency_with(DEFAULT_LATENCY_TESTS)
    }

    pub fn detect_write_latency_with(&mut self, tests: u8) -> Result<u8, Error<T::Error>> {
        self.core.detect_write_latency(&mut self.rng, tests)
    }
}

/// Serial flash commands.
impl<SPI, D, W> ExternalMemory<SpiTransport<SPI>, D, W>
where
    SPI: SpiDevice,
    D: DelayNs,
    W: OutputPin,
{
    /// Erases the 4 KiB sector holding `offset` and waits for it.
    pub fn erase_sector(&mut self, offset: u32) -> Result<(), Error<SPI::Error>> {
        self.check_offset(offset)?;
        self.core
            .erase_with(|spi| spi.erase_sector(offset).map(|()| true))?;
        Ok(())
    }

    /// Erases the 32 KiB block holding `offset` and waits for it.
    pub fn erase_block(&mut self, offset: u32) -> Result<(), Error<SPI::Error>> {
        self.check_offset(offset)?;
        self.core
            .erase_with(|spi| spi.erase_block(offset).map(|()| true))?;
        Ok(())
    }

    pub fn jedec_id(&mut self) -> Result<JedecId, Error<SPI::Error>> {
        self.core.settle()?;
        let id = self.core.transport.read_jedec_id()?;
        debug!("jedec id: {:x} {:x} {:x}", id.manufacturer, id.memory_type, id.capacity);
        Ok(id)
    }

    /// First byte of the JEDEC ID.
    pub fn manufacturer_id(&mut self) -> Result<u8, Error<SPI::Error>> {
        Ok(self.jedec_id()?.manufacturer)
    }

    fn check_offset(&self, offset: u32) -> Result<(), Error<SPI::Error>> {
        if offset >= self.core.config.profile.capacity_bytes {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }
}

impl<T, D, W> ReadStorage for ExternalMemory<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    type Error = Error<T::Error>;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.ensure_bounds(offset, bytes.len())?;
        self.core.read_span(offset, bytes)?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.core.config.profile.capacity_bytes as usize
    }
}

impl<T, D, W> Storage for ExternalMemory<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.ensure_bounds(offset, bytes.len())?;
        self.core.write_span(offset, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::sim::{RecordingSpi, SimBus, SimClock, SimSpec, SimulatedEeprom};
    use crate::transport::I2cTransport;

    type SimMemory = ExternalMemory<I2cTransport<SimBus>, SimClock>;

    fn attach(spec: SimSpec, config: MemoryConfig) -> (SimulatedEeprom, SimMemory) {
        let sim = SimulatedEeprom::new(spec, SimClock::new());
        let memory = ExternalMemory::new(I2cTransport::new(sim.bus()), sim.clock(), config).unwrap();
        (sim, memory)
    }

    fn default_part() -> (SimulatedEeprom, SimMemory) {
        attach(
            SimSpec::m24xx(4096, 32, AddressWidth::Two),
            MemoryConfig::default(),
        )
    }

    #[test]
    fn connect_discovers_undiscovered_geometry() {
        let (sim, mut memory) = attach(
            SimSpec::m24xx(2048, 16, AddressWidth::One),
            MemoryConfig::with_profile(DeviceProfile::undiscovered(0x50)),
        );
        memory.connect().unwrap();

        assert_eq!(memory.address_width(), Some(AddressWidth::One));
        assert_eq!(memory.capacity_bytes(), 2048);
        assert_eq!(memory.page_size_bytes(), 16);
        assert!(sim.memory().iter().all(|b| *b == 0xFF));

        memory.write_span(0x2F8, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]).unwrap();
        let mut out = [0u8; 12];
        memory.read_span(0x2F8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn connect_with_known_profile_does_not_write() {
        let (sim, mut memory) = default_part();
        memory.connect().unwrap();
        assert!(sim.committed_writes().is_empty());
    }

    #[test]
    fn connect_fails_without_device() {
        let mut config = MemoryConfig::default();
        config.profile.bus_address = 0x52;
        let (_sim, mut memory) = attach(SimSpec::m24xx(4096, 32, AddressWidth::Two), config);
        assert_eq!(memory.connect(), Err(Error::NotConnected));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let sim = SimulatedEeprom::new(SimSpec::m24xx(4096, 32, AddressWidth::Two), SimClock::new());
        let mut config = MemoryConfig::default();
        config.poll_interval_us = 0;
        assert!(matches!(
            ExternalMemory::new(I2cTransport::new(sim.bus()), sim.clock(), config),
            Err(Error::InvalidConfiguration)
        ));
    }

    #[test]
    fn erase_fills_every_cell() {
        let (sim, mut memory) = attach(
            SimSpec::m24xx(256, 8, AddressWidth::One),
            MemoryConfig::with_profile(DeviceProfile::from_memory_type(0x50, MemoryType::M24xx02)),
        );
        memory.erase(0x00).unwrap();
        assert!(sim.memory().iter().all(|b| *b == 0x00));
        assert_eq!(sim.committed_writes().len(), 256 / 8);
    }

    fn flash(chip_erase: bool, capacity_bytes: u32) -> ExternalMemory<SpiTransport<RecordingSpi>, SimClock> {
        let mut profile = DeviceProfile::undiscovered(0);
        profile.address_width = Some(AddressWidth::Three);
        profile.capacity_bytes = capacity_bytes;
        profile.page_size_bytes = 256;
        let transport = SpiTransport::new(RecordingSpi::default())
            .with_max_transaction_bytes(256 + 3)
            .with_chip_erase(chip_erase);
        ExternalMemory::new(transport, SimClock::new(), MemoryConfig::with_profile(profile)).unwrap()
    }

    fn frames(memory: ExternalMemory<SpiTransport<RecordingSpi>, SimClock>) -> RecordingSpi {
        memory.free().0.free()
    }

    #[test]
    fn erase_uses_chip_erase_when_available() {
        let mut memory = flash(true, 1 << 20);
        memory.erase(ERASED_BYTE).unwrap();

        let spi = frames(memory);
        assert_eq!(spi.frames_with(0xC7), 1);
        assert_eq!(spi.frames_with(0x02), 0);
        // Waited on the status register.
        assert_eq!(spi.frames.last().map(|f| f[0]), Some(0x05));
    }

    #[test]
    fn erase_falls_back_to_page_writes() {
        let mut memory = flash(false, 4096);
        memory.erase(ERASED_BYTE).unwrap();
        let spi = frames(memory);
        assert_eq!(spi.frames_with(0xC7), 0);
        assert_eq!(spi.frames_with(0x02), 4096 / 256);

        // Any other fill never takes the fast path.
        let mut memory = flash(true, 4096);
        memory.erase(0x00).unwrap();
        let spi = frames(memory);
        assert_eq!(spi.frames_with(0xC7), 0);
        assert_eq!(spi.frames_with(0x02), 4096 / 256);
    }

    #[test]
    fn sector_erase_is_bounds_checked() {
        let mut memory = flash(false, 1 << 20);
        assert_eq!(memory.erase_sector(1 << 20), Err(Error::OutOfBounds));
        assert_eq!(memory.erase_block(1 << 20), Err(Error::OutOfBounds));

        memory.erase_sector(0x1000).unwrap();
        memory.erase_block(0x8000).unwrap();
        let spi = frames(memory);
        assert!(spi.frames.contains(&alloc::vec![0x20, 0x00, 0x10, 0x00]));
        assert!(spi.frames.contains(&alloc::vec![0x52, 0x00, 0x80, 0x00]));
    }

    #[test]
    fn flash_reads_use_three_address_bytes() {
        let mut memory = flash(false, 1 << 20);
        let mut out = [0u8; 4];
        assert_eq!(memory.read_span(0x01_0203, &mut out).unwrap(), 4);
        assert_eq!(memory.manufacturer_id().unwrap(), 0x00);

        let spi = frames(memory);
        assert_eq!(spi.frames[0], [0x03, 0x01, 0x02, 0x03]);
        assert_eq!(spi.frames[1], [0x9F]);
    }

    #[test]
    fn strings_round_trip() {
        let (_sim, mut memory) = default_part();
        let next = memory.write_str(100, "extmem").unwrap();
        assert_eq!(next, 107);

        let mut buf = [0u8; 64];
        assert_eq!(memory.read_str(100, &mut buf).unwrap(), "extmem");
        assert_eq!(memory.read_byte(106).unwrap(), 0);
    }

    #[test]
    fn long_string_crosses_read_blocks() {
        let (_sim, mut memory) = default_part();
        let text = "the quick brown fox jumps over the lazy dog, twice over";
        memory.write_str(4000, text).unwrap();

        let mut buf = [0u8; 80];
        assert_eq!(memory.read_str(4000, &mut buf).unwrap(), text);
    }

    #[test]
    fn string_errors() {
        let (sim, mut memory) = default_part();
        assert_eq!(memory.write_str(4090, "too long"), Err(Error::OutOfBounds));

        memory.write_str(0, "abcdef").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(memory.read_str(0, &mut small), Err(Error::StringTooLong));

        sim.load(200, &[0xC3, 0x28, 0x00]);
        let mut buf = [0u8; 8];
        assert_eq!(memory.read_str(200, &mut buf), Err(Error::InvalidUtf8));

        // Blank memory has no terminator before the end.
        let mut buf = [0u8; 64];
        assert_eq!(memory.read_str(4090, &mut buf), Err(Error::OutOfBounds));
    }

    #[test]
    fn storage_traits_reject_out_of_range_access() {
        let (_sim, mut memory) = default_part();
        assert_eq!(ReadStorage::capacity(&memory), 4096);

        Storage::write(&mut memory, 10, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        ReadStorage::read(&mut memory, 10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);

        assert_eq!(
            Storage::write(&mut memory, 4095, &[1, 2]),
            Err(Error::OutOfBounds)
        );
        assert_eq!(
            ReadStorage::read(&mut memory, 4095, &mut out),
            Err(Error::OutOfBounds)
        );
    }

    #[test]
    fn truncation_is_reported_and_reject_policy_errors() {
        let (sim, mut memory) = default_part();
        assert_eq!(memory.write_span(4094, &[7, 8, 9]).unwrap(), 2);
        assert_eq!(&sim.memory()[4094..], &[7, 8]);

        memory.set_range_policy(RangePolicy::Reject);
        assert_eq!(memory.write_span(4094, &[7, 8, 9]), Err(Error::OutOfBounds));
        let mut out = [0u8; 3];
        assert_eq!(memory.read_span(4094, &mut out), Err(Error::OutOfBounds));
    }

    #[test]
    fn setters_update_profile() {
        let (_sim, mut memory) = default_part();
        memory.set_memory_type(MemoryType::M24xx1025);
        assert_eq!(memory.capacity_bytes(), 131072);
        assert_eq!(memory.page_size_bytes(), 128);
        assert_eq!(memory.segmentation(), Segmentation::BlockSelect { shift: 2 });

        memory.disable_polling();
        assert!(!memory.is_polling_enabled());
        memory.enable_polling();
        assert!(memory.is_polling_enabled());

        memory.set_write_time_ms(10);
        assert_eq!(memory.write_time_ms(), 10);
        assert_eq!(memory.set_bus_address(0x80), Err(Error::InvalidConfiguration));
        assert_eq!(memory.bus_address(), 0x50);
        assert_eq!(
            memory.set_segmentation(Segmentation::BlockSelect { shift: 7 }),
            Err(Error::InvalidConfiguration)
        );
    }

    #[test]
    fn write_latency_is_stored_in_profile() {
        let mut spec = SimSpec::m24xx(4096, 32, AddressWidth::Two);
        spec.write_time_us = 1_800;
        let (_sim, mut memory) = attach(spec, MemoryConfig::default());
        assert_eq!(memory.detect_write_latency().unwrap(), 2);
        assert_eq!(memory.write_time_ms(), 2);
    }

    #[test]
    fn busy_after_write_until_committed() {
        let (sim, mut memory) = default_part();
        memory.write_byte(0, 0x10).unwrap();
        assert!(memory.is_busy().unwrap());
        sim.clock().advance_us(sim.spec().write_time_us);
        assert!(!memory.is_busy().unwrap());
    }
}
