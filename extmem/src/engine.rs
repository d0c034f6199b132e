//! Chunked I/O over a [`Transport`].
//!
//! [`plan_chunk`] is pure arithmetic: it picks the largest transaction that
//! respects the bus limit, the page boundary (writes only) and the segment
//! boundary. [`MemoryCore`] drives those chunks through the transport and
//! the write-completion monitor.

use core::cmp::min;

use embedded_hal_1::delay::DelayNs;
use embedded_hal_1::digital::OutputPin;

use crate::error::Error;
use crate::profile::{AddressWidth, InvalidConfiguration, MemoryConfig, RangePolicy, Segmentation};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Everything the planner needs, resolved from the live profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Layout {
    pub bus_address: u8,
    pub page_size_bytes: u32,
    pub address_width: AddressWidth,
    pub segmentation: Segmentation,
    pub max_transaction_bytes: usize,
}

impl Layout {
    pub(crate) fn resolve(
        config: &MemoryConfig,
        max_transaction_bytes: usize,
    ) -> Result<Self, InvalidConfiguration> {
        let profile = &config.profile;
        let address_width = profile.address_width.ok_or(InvalidConfiguration)?;
        if profile.capacity_bytes == 0 || profile.page_size_bytes == 0 {
            return Err(InvalidConfiguration);
        }
        let segmentation = profile.segmentation(address_width);
        // Without segment bits the address field must reach every cell.
        if segmentation == Segmentation::None && profile.capacity_bytes > address_width.span() {
            return Err(InvalidConfiguration);
        }
        Ok(Self {
            bus_address: profile.bus_address,
            page_size_bytes: profile.page_size_bytes as u32,
            address_width,
            segmentation,
            max_transaction_bytes,
        })
    }

    /// Data bytes one transaction may carry in `direction`.
    fn data_limit(&self, direction: Direction) -> usize {
        match direction {
            Direction::Read => self.max_transaction_bytes,
            Direction::Write => self
                .max_transaction_bytes
                .saturating_sub(self.address_width.bytes()),
        }
    }
}

/// One physical transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Chunk {
    pub len: usize,
    pub bus_address: u8,
    /// Address sent after the bus address, already reduced to the segment.
    pub word_address: u32,
}

/// Plans the next transaction starting at `offset` with `remaining` bytes left.
///
/// The caller has already clamped the span to the capacity. An offset the
/// address field and bus-address bits cannot express is refused rather
/// than truncated onto a lower cell.
pub(crate) fn plan_chunk(
    layout: &Layout,
    direction: Direction,
    offset: u32,
    remaining: usize,
) -> Result<Chunk, InvalidConfiguration> {
    let limit = layout.data_limit(direction);
    if limit == 0 {
        return Err(InvalidConfiguration);
    }
    let mut len = min(remaining, limit);

    if direction == Direction::Write {
        let page = layout.page_size_bytes;
        len = min(len, (page - offset % page) as usize);
    }

    let shift = match layout.segmentation {
        Segmentation::DeviceAddressBits => Some(0),
        Segmentation::BlockSelect { shift } => Some(shift),
        Segmentation::None | Segmentation::Auto => None,
    };

    let span = layout.address_width.span();
    let (bus_address, word_address) = match shift {
        Some(shift) => {
            let segment = offset / span;
            let word_address = offset % span;
            len = min(len, (span - word_address) as usize);
            let bits = segment.checked_shl(shift as u32).ok_or(InvalidConfiguration)?;
            if bits > 0x7F {
                return Err(InvalidConfiguration);
            }
            (layout.bus_address | bits as u8, word_address)
        }
        None => {
            if offset >= span {
                return Err(InvalidConfiguration);
            }
            len = min(len, (span - offset) as usize);
            (layout.bus_address, offset)
        }
    };

    Ok(Chunk {
        len,
        bus_address,
        word_address,
    })
}

/// Transport, timing and profile of one memory device.
///
/// Probes and the public wrapper both go through these primitives, so they
/// always act on the current profile.
pub(crate) struct MemoryCore<T, D, W> {
    pub(crate) transport: T,
    pub(crate) delay: D,
    pub(crate) write_protect: W,
    pub(crate) config: MemoryConfig,
    /// A write was issued in polling mode and completion was not observed yet.
    pub(crate) write_pending: bool,
}

impl<T, D, W> MemoryCore<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    pub(crate) fn new(
        transport: T,
        delay: D,
        write_protect: W,
        config: MemoryConfig,
    ) -> Result<Self, Error<T::Error>> {
        config.validate().map_err(|_| Error::InvalidConfiguration)?;
        let mut core = Self {
            transport,
            delay,
            write_protect,
            config,
            write_pending: false,
        };
        core.set_write_protect(true)?;
        Ok(core)
    }

    fn layout(&self) -> Result<Layout, Error<T::Error>> {
        Layout::resolve(&self.config, self.transport.max_transaction_bytes())
            .map_err(|_| Error::InvalidConfiguration)
    }

    pub(crate) fn set_write_protect(&mut self, protected: bool) -> Result<(), Error<T::Error>> {
        let result = if protected {
            self.write_protect.set_high()
        } else {
            self.write_protect.set_low()
        };
        result.map_err(|_| Error::WriteProtect)
    }

    /// Number of bytes of `len` at `offset` that lie inside the device.
    fn clamp(&self, offset: u32, len: usize) -> Result<usize, Error<T::Error>> {
        let capacity = self.config.profile.capacity_bytes as u64;
        let end = offset as u64 + len as u64;
        if end <= capacity {
            return Ok(len);
        }
        match self.config.range_policy {
            RangePolicy::Reject => Err(Error::OutOfBounds),
            RangePolicy::Truncate => {
                let kept = capacity.saturating_sub(offset as u64) as usize;
                debug!("span at {} truncated from {} to {} bytes", offset, len, kept);
                Ok(kept)
            }
        }
    }

    pub(crate) fn read_span(&mut self, offset: u32, out: &mut [u8]) -> Result<usize, Error<T::Error>> {
        if out.is_empty() {
            return Ok(0);
        }
        let layout = self.layout()?;
        let len = self.clamp(offset, out.len())?;

        let mut done = 0usize;
        while done < len {
            let chunk = plan_chunk(&layout, Direction::Read, offset + done as u32, len - done)
                .map_err(|_| Error::InvalidConfiguration)?;
            self.settle()?;

            let mut buf = [0u8; 3];
            let address = layout.address_width.encode(chunk.word_address, &mut buf);
            self.transport
                .read(chunk.bus_address, address, &mut out[done..done + chunk.len])?;
            done += chunk.len;
        }
        Ok(len)
    }

    pub(crate) fn write_span(&mut self, offset: u32, data: &[u8]) -> Result<usize, Error<T::Error>> {
        if data.is_empty() {
            return Ok(0);
        }
        let layout = self.layout()?;
        let len = self.clamp(offset, data.len())?;
        if len == 0 {
            return Ok(0);
        }

        self.set_write_protect(false)?;
        let written = self.write_chunks(&layout, offset, &data[..len]);
        let relocked = self.set_write_protect(true);
        written?;
        relocked?;
        Ok(len)
    }

    fn write_chunks(&mut self, layout: &Layout, offset: u32, data: &[u8]) -> Result<(), Error<T::Error>> {
        let mut done = 0usize;
        while done < data.len() {
            let chunk = plan_chunk(layout, Direction::Write, offset + done as u32, data.len() - done)
                .map_err(|_| Error::InvalidConfiguration)?;
            self.settle()?;

            let mut buf = [0u8; 3];
            let address = layout.address_width.encode(chunk.word_address, &mut buf);
            self.transport
                .write(chunk.bus_address, address, &data[done..done + chunk.len])?;
            self.after_write();
            done += chunk.len;
        }
        Ok(())
    }

    pub(crate) fn read_byte(&mut self, offset: u32) -> Result<u8, Error<T::Error>> {
        if offset >= self.config.profile.capacity_bytes {
            return Err(Error::OutOfBounds);
        }
        let mut out = [0u8; 1];
        self.read_span(offset, &mut out)?;
        Ok(out[0])
    }

    /// Skips the physical write when the cell already holds `value`.
    pub(crate) fn write_byte(&mut self, offset: u32, value: u8) -> Result<(), Error<T::Error>> {
        if self.read_byte(offset)? == value {
            trace!("byte at {} unchanged, write skipped", offset);
            return Ok(());
        }
        self.write_span(offset, &[value])?;
        Ok(())
    }

    /// Runs a device-side erase with write protect released and waits for it.
    ///
    /// `command` returns `Ok(false)` when the transport has no such command;
    /// nothing is waited for then.
    pub(crate) fn erase_with<F>(&mut self, command: F) -> Result<bool, Error<T::Error>>
    where
        F: FnOnce(&mut T) -> Result<bool, T::Error>,
    {
        self.settle()?;
        self.set_write_protect(false)?;
        let issued = command(&mut self.transport);
        let relocked = self.set_write_protect(true);
        let issued = issued?;
        relocked?;
        if issued {
            self.wait_erased()?;
        }
        Ok(issued)
    }

    /// Presence check at the base bus address.
    pub(crate) fn is_connected(&mut self) -> Result<bool, Error<T::Error>> {
        self.settle()?;
        Ok(self.transport.is_ready(self.config.profile.bus_address)?)
    }

    pub(crate) fn is_busy(&mut self) -> Result<bool, Error<T::Error>> {
        let ready = self.transport.is_ready(self.config.profile.bus_address)?;
        if ready {
            self.write_pending = false;
        }
        Ok(!ready)
    }
}
