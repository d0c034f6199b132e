//! Device characterization probes.
//!
//! Each probe writes random magic values at low offsets and puts the
//! original bytes back. While a probe runs it overrides the geometry it
//! needs; afterwards the caller's profile is restored with only the probed
//! field changed.

use embedded_hal_1::delay::DelayNs;
use embedded_hal_1::digital::OutputPin;
use rand::Rng;

use crate::engine::MemoryCore;
use crate::error::Error;
use crate::profile::{AddressWidth, Segmentation, MAX_PAGE_SIZE_BYTES};
use crate::time::Monotonic;
use crate::transport::Transport;

const WIDTH_TEST_OFFSET: u32 = 1;
const LATENCY_TEST_OFFSET: u32 = 5;
/// Small enough for every part, large enough for both test offsets.
const SCRATCH_CAPACITY_BYTES: u32 = 128;
/// Largest capacity the doubling search will confirm.
pub(crate) const CAPACITY_PROBE_CEILING: u32 = 128 * 1024;
/// One address byte plus three device-address bits (24xx16).
const ONE_BYTE_CAPACITY_CEILING: u32 = 2048;
/// 64-byte pages are rare in the 24xx family, so the search skips them.
const PAGE_CANDIDATES: [u16; 5] = [8, 16, 32, 128, 256];
pub(crate) const DEFAULT_LATENCY_TESTS: u8 = 8;

/// Random byte in `1..=254` not contained in `avoid`.
fn magic_value<R: Rng>(rng: &mut R, avoid: &[u8]) -> u8 {
    loop {
        let value = rng.gen_range(1..=254u8);
        if !avoid.contains(&value) {
            return value;
        }
    }
}

/// Offset following `test` in the capacity search (16 -> 128, then doubling).
const fn next_capacity_offset(test: u32) -> u32 {
    if test == 15 {
        127
    } else {
        (test + 1) * 2 - 1
    }
}

impl<T, D, W> MemoryCore<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    pub(crate) fn detect_address_width<R: Rng>(
        &mut self,
        rng: &mut R,
    ) -> Result<AddressWidth, Error<T::Error>> {
        let saved = self.config.profile;
        let profile = &mut self.config.profile;
        profile.capacity_bytes = SCRATCH_CAPACITY_BYTES;
        profile.page_size_bytes = 1;
        profile.segmentation = Segmentation::None;

        let result = self.probe_address_width(rng);
        self.config.profile = saved;
        let width = result?;
        self.config.profile.address_width = Some(width);
        Ok(width)
    }

    fn probe_address_width<R: Rng>(&mut self, rng: &mut R) -> Result<AddressWidth, Error<T::Error>> {
        // One byte first: a two-byte write would land its low address byte
        // as data on a one-byte part.
        for width in [AddressWidth::One, AddressWidth::Two] {
            self.config.profile.address_width = Some(width);
            if self.width_round_trips(rng)? {
                debug!("address width: {} byte(s)", width.bytes());
                return Ok(width);
            }
            trace!("address width {} did not round-trip", width.bytes());
        }
        debug!("address width inconclusive, assuming 1 byte");
        Ok(AddressWidth::One)
    }

    /// Bus failures count as "did not round-trip". The original byte is
    /// written back whenever the magic write went out.
    fn width_round_trips<R: Rng>(&mut self, rng: &mut R) -> Result<bool, Error<T::Error>> {
        let Some(original) = bus_fallible(self.read_byte(WIDTH_TEST_OFFSET))? else {
            return Ok(false);
        };
        let magic = magic_value(rng, &[original]);
        if bus_fallible(self.write_byte(WIDTH_TEST_OFFSET, magic))?.is_none() {
            return Ok(false);
        }
        let readback = bus_fallible(self.read_byte(WIDTH_TEST_OFFSET))?;
        bus_fallible(self.write_byte(WIDTH_TEST_OFFSET, original))?;
        Ok(readback == Some(magic))
    }

    pub(crate) fn detect_capacity<R: Rng>(&mut self, rng: &mut R) -> Result<u32, Error<T::Error>> {
        let width = match self.config.profile.address_width {
            Some(width) => width,
            None => self.detect_address_width(rng)?,
        };

        let saved = self.config.profile;
        let profile = &mut self.config.profile;
        if profile.page_size_bytes == 0 {
            profile.page_size_bytes = 1;
        }
        // Block bits must follow each candidate size, whatever the caller set.
        profile.segmentation = Segmentation::Auto;

        let result = self.probe_capacity(rng, width);
        self.config.profile = saved;
        let capacity = result?;
        let profile = &mut self.config.profile;
        profile.capacity_bytes = capacity;
        if profile.segmentation == Segmentation::None && capacity > width.span() {
            debug!("unsegmented profile cannot reach {} bytes, using auto", capacity);
            profile.segmentation = Segmentation::Auto;
        }
        Ok(capacity)
    }

    fn probe_capacity<R: Rng>(&mut self, rng: &mut R, width: AddressWidth) -> Result<u32, Error<T::Error>> {
        let (mut test, ceiling) = match width {
            AddressWidth::One => (15, ONE_BYTE_CAPACITY_CEILING),
            AddressWidth::Two | AddressWidth::Three => (4095, CAPACITY_PROBE_CEILING),
        };

        while test < ceiling - 1 {
            let next = next_capacity_offset(test);
            self.config.profile.capacity_bytes = next + 1;
            if !self.capacity_step(rng, test, next)? {
                break;
            }
            trace!("capacity is at least {}", next + 1);
            test = next;
        }

        let capacity = test + 1;
        debug!("capacity: {} bytes", capacity);
        Ok(capacity)
    }

    /// `Ok(true)` when `next` is a distinct, reachable cell.
    fn capacity_step<R: Rng>(&mut self, rng: &mut R, test: u32, next: u32) -> Result<bool, Error<T::Error>> {
        let Some(original) = bus_fallible(self.read_byte(test))? else {
            return Ok(false);
        };
        let Some(original_next) = bus_fallible(self.read_byte(next))? else {
            return Ok(false);
        };

        let magic = magic_value(rng, &[original, original_next]);
        if bus_fallible(self.write_byte(test, magic))?.is_none() {
            return Ok(false);
        }
        let readback = bus_fallible(self.read_byte(test))?;
        let at_next = bus_fallible(self.read_byte(next))?;
        self.write_byte(test, original)?;

        match (readback, at_next) {
            (Some(readback), Some(at_next)) if readback == magic => {
                if at_next == magic {
                    trace!("offset {} aliases offset {}", next, test);
                    return Ok(false);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn detect_page_size<R: Rng>(&mut self, rng: &mut R) -> Result<u16, Error<T::Error>> {
        if self.config.profile.address_width.is_none() {
            self.detect_address_width(rng)?;
        }
        if self.config.profile.capacity_bytes == 0 {
            self.detect_capacity(rng)?;
        }

        let saved = self.config.profile;
        let mut original = [0u8; MAX_PAGE_SIZE_BYTES];
        let span = MAX_PAGE_SIZE_BYTES.min(saved.capacity_bytes as usize);
        let mut touched = 0usize;
        // Any legal page size will do for the initial read.
        self.config.profile.page_size_bytes = 1;

        let result = self.probe_page_size(&mut original[..span], &mut touched);

        // Put back whatever the candidates overwrote, in pages known to work.
        self.config.profile = saved;
        let page = *result.as_ref().unwrap_or(&1);
        self.config.profile.page_size_bytes = page;
        let restored = self.write_span(0, &original[..touched]);
        let page = result?;
        restored?;
        debug!("page size: {} bytes", page);
        Ok(page)
    }

    fn probe_page_size(&mut self, original: &mut [u8], touched: &mut usize) -> Result<u16, Error<T::Error>> {
        self.read_span(0, original)?;
        let width = self.config.profile.address_width.unwrap_or(AddressWidth::Two);
        let limit = self.transport.max_transaction_bytes().saturating_sub(width.bytes());

        let mut scratch = [0u8; MAX_PAGE_SIZE_BYTES];
        let mut readback = [0u8; MAX_PAGE_SIZE_BYTES];
        let mut page = 1u16;

        for candidate in PAGE_CANDIDATES {
            let len = candidate as usize;
            if len > limit || len > original.len() {
                break;
            }
            for (i, byte) in scratch[..len].iter_mut().enumerate() {
                *byte = original[i].wrapping_add(i as u8);
            }

            self.config.profile.page_size_bytes = candidate;
            *touched = (*touched).max(len);
            self.write_span(0, &scratch[..len])?;
            self.read_span(0, &mut readback[..len])?;
            if readback[..len] != scratch[..len] {
                trace!("page candidate {} wrapped", candidate);
                break;
            }
            page = candidate;
        }
        Ok(page)
    }
}

impl<T, D, W> MemoryCore<T, D, W>
where
    T: Transport,
    D: DelayNs + Monotonic,
    W: OutputPin,
{
    /// Average of `tests` timed single-byte writes plus 10 %, rounded up to ms.
    pub(crate) fn detect_write_latency<R: Rng>(
        &mut self,
        rng: &mut R,
        tests: u8,
    ) -> Result<u8, Error<T::Error>> {
        if tests == 0 {
            return Err(Error::InvalidConfiguration);
        }
        if self.config.profile.address_width.is_none() {
            self.detect_address_width(rng)?;
        }

        let saved = self.config.profile;
        let profile = &mut self.config.profile;
        profile.capacity_bytes = SCRATCH_CAPACITY_BYTES;
        profile.segmentation = Segmentation::None;
        profile.poll_for_write_complete = true;
        if profile.page_size_bytes == 0 {
            profile.page_size_bytes = 1;
        }

        let result = self.probe_write_latency(rng, tests);
        self.config.profile = saved;
        let write_time_ms = result?;
        self.config.profile.write_time_ms = write_time_ms;
        debug!("write time: {} ms", write_time_ms);
        Ok(write_time_ms)
    }

    fn probe_write_latency<R: Rng>(&mut self, rng: &mut R, tests: u8) -> Result<u8, Error<T::Error>> {
        self.settle()?;
        let original = self.read_byte(LATENCY_TEST_OFFSET)?;
        let mut current = original;
        let mut total_us = 0u64;

        for _ in 0..tests {
            let magic = magic_value(rng, &[original, current]);
            let start = self.delay.now_micros();
            self.write_byte(LATENCY_TEST_OFFSET, magic)?;
            self.wait_ready()?;
            let elapsed = self.delay.now_micros().saturating_sub(start);
            trace!("write committed in {} us", elapsed);
            total_us += elapsed;
            current = magic;
        }

        self.write_byte(LATENCY_TEST_OFFSET, original)?;
        self.wait_ready()?;

        let average_us = total_us / tests as u64;
        let write_time_ms = (average_us * 110).div_ceil(100_000);
        Ok(write_time_ms.min(u8::MAX as u64) as u8)
    }
}

/// Bus failures become `None`; everything else still propagates.
fn bus_fallible<V, E>(result: Result<V, Error<E>>) -> Result<Option<V>, Error<E>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Error::Bus(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;
    use crate::profile::{DeviceProfile, MemoryConfig, MemoryType};
    use crate::sim::{SimBus, SimClock, SimError, SimSpec, SimulatedEeprom};
    use crate::transport::I2cTransport;
    use crate::NoWriteProtect;

    type SimCore = MemoryCore<I2cTransport<SimBus>, SimClock, NoWriteProtect>;

    /// Simulated bus with injected faults.
    struct Faulty {
        inner: I2cTransport<SimBus>,
        nack_one_byte_reads: bool,
        drop_writes: bool,
    }

    impl Transport for Faulty {
        type Error = SimError;

        fn max_transaction_bytes(&self) -> usize {
            self.inner.max_transaction_bytes()
        }

        fn is_ready(&mut self, bus_address: u8) -> Result<bool, SimError> {
            self.inner.is_ready(bus_address)
        }

        fn write(&mut self, bus_address: u8, address: &[u8], data: &[u8]) -> Result<(), SimError> {
            if self.drop_writes {
                return Ok(());
            }
            self.inner.write(bus_address, address, data)
        }

        fn read(&mut self, bus_address: u8, address: &[u8], out: &mut [u8]) -> Result<(), SimError> {
            if self.nack_one_byte_reads && address.len() == 1 {
                return Err(SimError::Nack);
            }
            self.inner.read(bus_address, address, out)
        }
    }

    fn faulty_setup(
        spec: SimSpec,
        nack_one_byte_reads: bool,
        drop_writes: bool,
    ) -> (SimulatedEeprom, MemoryCore<Faulty, SimClock, NoWriteProtect>, SmallRng) {
        let sim = SimulatedEeprom::new(spec, SimClock::new());
        let transport = Faulty {
            inner: I2cTransport::new(sim.bus()),
            nack_one_byte_reads,
            drop_writes,
        };
        let core = MemoryCore::new(
            transport,
            sim.clock(),
            NoWriteProtect,
            MemoryConfig::with_profile(DeviceProfile::undiscovered(0x50)),
        )
        .unwrap();
        (sim, core, SmallRng::seed_from_u64(7))
    }

    fn setup(spec: SimSpec, profile: DeviceProfile) -> (SimulatedEeprom, SimCore, SmallRng) {
        let sim = SimulatedEeprom::new(spec, SimClock::new());
        let core = MemoryCore::new(
            I2cTransport::new(sim.bus()).with_max_transaction_bytes(spec.max_transaction_bytes),
            sim.clock(),
            NoWriteProtect,
            MemoryConfig::with_profile(profile),
        )
        .unwrap();
        (sim, core, SmallRng::seed_from_u64(7))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8).collect()
    }

    #[test]
    fn next_capacity_skips_from_16_to_128() {
        assert_eq!(next_capacity_offset(15), 127);
        assert_eq!(next_capacity_offset(127), 255);
        assert_eq!(next_capacity_offset(4095), 8191);
    }

    #[test]
    fn address_width_detects_one_byte_part() {
        let (sim, mut core, mut rng) = setup(
            SimSpec::m24xx(256, 8, AddressWidth::One),
            DeviceProfile::undiscovered(0x50),
        );
        assert_eq!(core.detect_address_width(&mut rng).unwrap(), AddressWidth::One);
        assert_eq!(core.config.profile.address_width, Some(AddressWidth::One));
        assert_eq!(core.config.profile.capacity_bytes, 0);
        assert!(sim.memory().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn address_width_detects_two_byte_part() {
        let (sim, mut core, mut rng) = setup(
            SimSpec::m24xx(4096, 32, AddressWidth::Two),
            DeviceProfile::undiscovered(0x50),
        );
        assert_eq!(core.detect_address_width(&mut rng).unwrap(), AddressWidth::Two);
        assert_eq!(core.config.profile.page_size_bytes, 0);
        assert!(sim.memory().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn address_width_moves_on_after_bus_error() {
        let (sim, mut core, mut rng) =
            faulty_setup(SimSpec::m24xx(4096, 32, AddressWidth::Two), true, false);
        assert_eq!(core.detect_address_width(&mut rng), Ok(AddressWidth::Two));
        assert_eq!(core.config.profile.address_width, Some(AddressWidth::Two));
        assert!(sim.memory().iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn address_width_defaults_to_one_byte_when_nothing_round_trips() {
        let (sim, mut core, mut rng) =
            faulty_setup(SimSpec::m24xx(4096, 32, AddressWidth::Two), false, true);
        assert_eq!(core.detect_address_width(&mut rng), Ok(AddressWidth::One));
        assert_eq!(core.config.profile.address_width, Some(AddressWidth::One));
        assert!(sim.committed_writes().is_empty());
    }

    #[test]
    fn address_width_detection_leaves_content_intact() {
        let (sim, mut core, mut rng) = setup(
            SimSpec::m24xx(256, 8, AddressWidth::One),
            DeviceProfile::undiscovered(0x50),
        );
        let content = pattern(256);
        sim.load(0, &content);
        assert_eq!(core.detect_address_width(&mut rng).unwrap(), AddressWidth::One);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn capacity_search_ignores_unsegmented_preset() {
        // A 24xx16 configured as a 24xx02.
        let (sim, mut core, mut rng) = setup(
            SimSpec::from_memory_type(MemoryType::M24xx16),
            DeviceProfile::from_memory_type(0x50, MemoryType::M24xx02),
        );
        let content = pattern(2048);
        sim.load(0, &content);

        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 2048);
        assert_eq!(sim.memory(), content);
        // None cannot reach 2 KiB with one address byte.
        assert_eq!(core.config.profile.segmentation, Segmentation::Auto);
        core.write_span(0x7F0, &[0xA5]).unwrap();
        assert_eq!(sim.memory()[0x7F0], 0xA5);
    }

    #[test]
    fn capacity_search_ignores_64k_preset() {
        // A 24xx1025 configured as a 24xx512.
        let (_sim, mut core, mut rng) = setup(
            SimSpec::from_memory_type(MemoryType::M24xx1025),
            DeviceProfile::from_memory_type(0x50, MemoryType::M24xx512),
        );
        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 131072);
        assert_eq!(core.config.profile.segmentation, Segmentation::Auto);
    }

    #[test]
    fn capacity_search_keeps_explicit_block_select() {
        let (_sim, mut core, mut rng) = setup(
            SimSpec::from_memory_type(MemoryType::M24xx1025),
            DeviceProfile::from_memory_type(0x50, MemoryType::M24xx1025),
        );
        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 131072);
        assert_eq!(
            core.config.profile.segmentation,
            Segmentation::BlockSelect { shift: 2 }
        );
    }

    #[test]
    fn capacity_of_one_byte_part_tops_out_at_2048() {
        let (sim, mut core, mut rng) = setup(
            SimSpec::m24xx(2048, 16, AddressWidth::One),
            DeviceProfile::undiscovered(0x50),
        );
        let content = pattern(2048);
        sim.load(0, &content);

        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 2048);
        assert_eq!(core.config.profile.capacity_bytes, 2048);
        assert_eq!(core.config.profile.address_width, Some(AddressWidth::One));
        assert_eq!(core.config.profile.page_size_bytes, 0);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn capacity_of_two_byte_part() {
        let mut profile = DeviceProfile::undiscovered(0x50);
        profile.address_width = Some(AddressWidth::Two);
        let (sim, mut core, mut rng) = setup(SimSpec::m24xx(32768, 64, AddressWidth::Two), profile);
        let content = pattern(32768);
        sim.load(0, &content);

        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 32768);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn capacity_of_unsegmented_64k_part() {
        let mut profile = DeviceProfile::undiscovered(0x50);
        profile.address_width = Some(AddressWidth::Two);
        let (_sim, mut core, mut rng) = setup(SimSpec::m24xx(65536, 128, AddressWidth::Two), profile);
        assert_eq!(core.detect_capacity(&mut rng).unwrap(), 65536);
    }

    #[test]
    fn capacity_search_stops_at_ceiling() {
        let mut profile = DeviceProfile::undiscovered(0x50);
        profile.address_width = Some(AddressWidth::Two);
        let (_sim, mut core, mut rng) = setup(SimSpec::m24xx(131072, 128, AddressWidth::Two), profile);
        assert_eq!(core.detect_capacity(&mut rng).unwrap(), CAPACITY_PROBE_CEILING);
    }

    #[test]
    fn page_size_is_detected_and_memory_restored() {
        let (sim, mut core, mut rng) = setup(
            SimSpec::m24xx(4096, 32, AddressWidth::Two),
            DeviceProfile::default(),
        );
        let content = pattern(4096);
        sim.load(0, &content);

        assert_eq!(core.detect_page_size(&mut rng).unwrap(), 32);
        assert_eq!(core.config.profile.page_size_bytes, 32);
        assert_eq!(core.config.profile.capacity_bytes, 4096);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn page_size_of_128_byte_part() {
        let mut profile = DeviceProfile::default();
        profile.capacity_bytes = 65536;
        let (sim, mut core, mut rng) = setup(SimSpec::m24xx(65536, 128, AddressWidth::Two), profile);
        let content = pattern(65536);
        sim.load(0, &content);

        assert_eq!(core.detect_page_size(&mut rng).unwrap(), 128);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn page_size_falls_back_to_single_byte() {
        let mut profile = DeviceProfile::undiscovered(0x50);
        profile.address_width = Some(AddressWidth::One);
        profile.capacity_bytes = 16;
        let (sim, mut core, mut rng) = setup(SimSpec::from_memory_type(MemoryType::M24xx00), profile);
        let content = pattern(16);
        sim.load(0, &content);

        assert_eq!(core.detect_page_size(&mut rng).unwrap(), 1);
        assert_eq!(core.config.profile.page_size_bytes, 1);
        assert_eq!(sim.memory(), content);
    }

    #[test]
    fn page_size_starts_from_undiscovered_page() {
        let mut profile = DeviceProfile::undiscovered(0x50);
        profile.address_width = Some(AddressWidth::Two);
        profile.capacity_bytes = 8192;
        let (_sim, mut core, mut rng) = setup(SimSpec::m24xx(8192, 32, AddressWidth::Two), profile);
        assert_eq!(core.detect_page_size(&mut rng).unwrap(), 32);
    }

    #[test]
    fn page_candidates_are_capped_by_bus_limit() {
        let mut spec = SimSpec::m24xx(16384, 64, AddressWidth::Two);
        spec.max_transaction_bytes = 34;
        let mut profile = DeviceProfile::default();
        profile.capacity_bytes = 16384;
        let (sim, mut core, mut rng) = setup(spec, profile);

        assert_eq!(core.detect_page_size(&mut rng).unwrap(), 32);
        assert!(sim.committed_writes().iter().all(|t| t.data_len <= 32));
    }

    #[test]
    fn write_latency_adds_margin_and_rounds_up() {
        let mut spec = SimSpec::m24xx(4096, 32, AddressWidth::Two);
        spec.write_time_us = 4_500;
        let (sim, mut core, mut rng) = setup(spec, DeviceProfile::default());
        sim.load(LATENCY_TEST_OFFSET as usize, &[0x3C]);

        assert_eq!(core.detect_write_latency(&mut rng, DEFAULT_LATENCY_TESTS).unwrap(), 5);
        assert_eq!(core.config.profile.write_time_ms, 5);
        assert_eq!(core.config.profile.capacity_bytes, 4096);
        assert_eq!(sim.memory()[LATENCY_TEST_OFFSET as usize], 0x3C);
        assert_eq!(sim.committed_writes().len(), DEFAULT_LATENCY_TESTS as usize + 1);
    }

    #[test]
    fn write_latency_restores_fixed_delay_mode() {
        let mut profile = DeviceProfile::default();
        profile.poll_for_write_complete = false;
        let (_sim, mut core, mut rng) = setup(SimSpec::m24xx(4096, 32, AddressWidth::Two), profile);

        assert_eq!(core.detect_write_latency(&mut rng, 2).unwrap(), 4);
        assert!(!core.config.profile.poll_for_write_complete);
    }

    #[test]
    fn write_latency_needs_at_least_one_test() {
        let (_sim, mut core, mut rng) = setup(
            SimSpec::m24xx(4096, 32, AddressWidth::Two),
            DeviceProfile::default(),
        );
        assert_eq!(
            core.detect_write_latency(&mut rng, 0),
            Err(Error::InvalidConfiguration)
        );
    }
}
