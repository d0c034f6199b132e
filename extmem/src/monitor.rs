//! Write-completion monitor.
//!
//! In polling mode a write only marks the device as pending; the next
//! transaction first polls until the device answers again. In fixed-delay
//! mode every write chunk sleeps for the profile's write time.

use embedded_hal_1::delay::DelayNs;
use embedded_hal_1::digital::OutputPin;

use crate::engine::MemoryCore;
use crate::error::Error;
use crate::transport::Transport;

/// Erase commands take tens of ms per sector and seconds per chip.
const ERASE_POLL_INTERVAL_US: u32 = 50_000;
/// Two minutes, enough for a chip erase of the largest serial flash.
const ERASE_MAX_POLLS: u32 = 2_400;

impl<T, D, W> MemoryCore<T, D, W>
where
    T: Transport,
    D: DelayNs,
    W: OutputPin,
{
    /// Polls the base bus address until the device acknowledges.
    pub(crate) fn wait_ready(&mut self) -> Result<(), Error<T::Error>> {
        self.poll_ready(self.config.poll_interval_us, self.config.max_ready_polls)
    }

    /// Like [`wait_ready`](Self::wait_ready) on the slower erase cadence.
    pub(crate) fn wait_erased(&mut self) -> Result<(), Error<T::Error>> {
        self.poll_ready(ERASE_POLL_INTERVAL_US, Some(ERASE_MAX_POLLS))
    }

    fn poll_ready(&mut self, interval_us: u32, max_polls: Option<u32>) -> Result<(), Error<T::Error>> {
        let bus_address = self.config.profile.bus_address;
        let mut polls = 0u32;
        loop {
            if self.transport.is_ready(bus_address)? {
                self.write_pending = false;
                return Ok(());
            }
            polls = polls.saturating_add(1);
            if let Some(max) = max_polls {
                if polls >= max {
                    warn!("device 0x{:x} still busy after {} polls", bus_address, polls);
                    return Err(Error::Timeout);
                }
            }
            self.delay.delay_us(interval_us);
        }
    }

    /// Pre-wait before a new transaction.
    #[inline(always)]
    pub(crate) fn settle(&mut self) -> Result<(), Error<T::Error>> {
        if self.write_pending {
            self.wait_ready()?;
        }
        Ok(())
    }

    pub(crate) fn after_write(&mut self) {
        if self.config.profile.poll_for_write_complete {
            self.write_pending = true;
        } else {
            self.delay.delay_ms(self.config.profile.write_time_ms as u32);
        }
    }
}
