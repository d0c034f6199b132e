//! Timing capabilities beyond `DelayNs`.

/// Free-running microsecond clock, only needed by
/// [`detect_write_latency`](crate::ExternalMemory::detect_write_latency).
pub trait Monotonic {
    fn now_micros(&mut self) -> u64;
}

#[cfg(feature = "embassy-time")]
pub use embassy::EmbassyTimer;

#[cfg(feature = "embassy-time")]
mod embassy {
    use embassy_time::{Delay, Instant};
    use embedded_hal_1::delay::DelayNs;

    use super::Monotonic;

    /// [`embassy_time::Delay`] plus a clock read from the same time driver.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct EmbassyTimer;

    impl DelayNs for EmbassyTimer {
        fn delay_ns(&mut self, ns: u32) {
            Delay.delay_ns(ns)
        }

        fn delay_us(&mut self, us: u32) {
            Delay.delay_us(us)
        }

        fn delay_ms(&mut self, ms: u32) {
            Delay.delay_ms(ms)
        }
    }

    impl Monotonic for EmbassyTimer {
        fn now_micros(&mut self) -> u64 {
            Instant::now().as_micros()
        }
    }
}
