//! Device geometry, memory-type presets and driver configuration.

/// Default 7-bit bus address of a 24xx-series part (`0b1010_A2A1A0`).
pub const DEFAULT_BUS_ADDRESS: u8 = 0b101_0000;
/// Largest page any known part commits in one write.
pub const MAX_PAGE_SIZE_BYTES: usize = 256;
/// Conventional fill byte for [`erase`](crate::ExternalMemory::erase).
pub const ERASED_BYTE: u8 = 0xFF;

pub(crate) const DEFAULT_POLL_INTERVAL_US: u32 = 100;
pub(crate) const DEFAULT_MAX_READY_POLLS: u32 = 10_000;
pub(crate) const DEFAULT_PROBE_SEED: u64 = 0x2A5A_C0DE_EE9A_0001;

/// Parts above this size encode the high address bit(s) in the bus address.
pub(crate) const TWO_BYTE_DIRECT_SPAN: u32 = 1 << 16;
/// Bus-address bit of the block select on 128 KiB parts (24xx1025).
pub(crate) const DEFAULT_BLOCK_SELECT_SHIFT: u8 = 2;
/// 256 KiB parts (24xxM02) take two block bits starting at bit 1.
pub(crate) const WIDE_BLOCK_SELECT_SHIFT: u8 = 1;
pub(crate) const TWO_SEGMENT_SPAN: u32 = 2 * TWO_BYTE_DIRECT_SPAN;

/// Number of address bytes sent after the bus address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressWidth {
    One,
    Two,
    /// Serial flash (25xx/W25Q-class) with 24-bit addresses.
    Three,
}

impl AddressWidth {
    pub const fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Bytes reachable through the address field alone.
    pub const fn span(self) -> u32 {
        match self {
            Self::One => 1 << 8,
            Self::Two => 1 << 16,
            Self::Three => 1 << 24,
        }
    }

    /// Encodes the in-segment address big-endian into `buf`.
    pub(crate) fn encode(self, address: u32, buf: &mut [u8; 3]) -> &[u8] {
        let len = self.bytes();
        let be = address.to_be_bytes();
        buf[..len].copy_from_slice(&be[4 - len..]);
        &buf[..len]
    }
}

/// How offsets beyond the address field map onto the bus address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Segmentation {
    /// Derived from capacity and address width, see [`DeviceProfile::segmentation`].
    Auto,
    /// The address field covers the whole device.
    None,
    /// 24xx04/08/16: A8..A10 live in the low bits of the bus address.
    DeviceAddressBits,
    /// >64 KiB parts: the segment index is OR-ed in at `shift`.
    BlockSelect { shift: u8 },
}

/// Whether out-of-range spans are clipped or refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RangePolicy {
    /// Drop the bytes past the end of the device.
    Truncate,
    /// Fail with [`Error::OutOfBounds`](crate::Error::OutOfBounds) without touching the bus.
    Reject,
}

/// Geometry and timing of one physical device.
///
/// A zero `capacity_bytes`/`page_size_bytes` or a `None` address width
/// marks the field as undiscovered; [`connect`](crate::ExternalMemory::connect)
/// probes those.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceProfile {
    pub bus_address: u8,
    pub capacity_bytes: u32,
    pub page_size_bytes: u16,
    pub address_width: Option<AddressWidth>,
    pub write_time_ms: u8,
    pub poll_for_write_complete: bool,
    pub segmentation: Segmentation,
}

impl Default for DeviceProfile {
    /// A 24xx32-class part: the smallest two-byte-address geometry, which
    /// is safe to use on everything from 4 KiB upward.
    fn default() -> Self {
        Self {
            bus_address: DEFAULT_BUS_ADDRESS,
            capacity_bytes: 4096,
            page_size_bytes: 32,
            address_width: Some(AddressWidth::Two),
            write_time_ms: 5,
            poll_for_write_complete: true,
            segmentation: Segmentation::Auto,
        }
    }
}

impl DeviceProfile {
    /// Profile with every geometry field undiscovered.
    pub const fn undiscovered(bus_address: u8) -> Self {
        Self {
            bus_address,
            capacity_bytes: 0,
            page_size_bytes: 0,
            address_width: None,
            write_time_ms: 5,
            poll_for_write_complete: true,
            segmentation: Segmentation::Auto,
        }
    }

    pub fn from_memory_type(bus_address: u8, memory_type: MemoryType) -> Self {
        let mut profile = Self {
            bus_address,
            ..Self::default()
        };
        profile.apply_memory_type(memory_type);
        profile
    }

    pub fn apply_memory_type(&mut self, memory_type: MemoryType) {
        let geometry = memory_type.geometry();
        self.capacity_bytes = geometry.capacity_bytes;
        self.page_size_bytes = geometry.page_size_bytes;
        self.address_width = Some(geometry.address_width);
        self.segmentation = geometry.segmentation;
    }

    /// The concrete scheme in effect for `width`, resolving [`Segmentation::Auto`].
    pub fn segmentation(&self, width: AddressWidth) -> Segmentation {
        match self.segmentation {
            Segmentation::Auto => match width {
                AddressWidth::One if (512..=2048).contains(&self.capacity_bytes) => {
                    Segmentation::DeviceAddressBits
                }
                AddressWidth::Two if self.capacity_bytes > TWO_SEGMENT_SPAN => {
                    Segmentation::BlockSelect {
                        shift: WIDE_BLOCK_SELECT_SHIFT,
                    }
                }
                AddressWidth::Two if self.capacity_bytes > TWO_BYTE_DIRECT_SPAN => {
                    Segmentation::BlockSelect {
                        shift: DEFAULT_BLOCK_SELECT_SHIFT,
                    }
                }
                _ => Segmentation::None,
            },
            other => other,
        }
    }
}

/// Known 24xx-series parts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryType {
    M24xx00,
    M24xx01,
    M24xx02,
    M24xx04,
    M24xx08,
    M24xx16,
    M24xx32,
    M24xx64,
    M24xx128,
    M24xx256,
    M24xx512,
    M24xx1025,
    M24xxM02,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryGeometry {
    pub capacity_bytes: u32,
    pub page_size_bytes: u16,
    pub address_width: AddressWidth,
    pub segmentation: Segmentation,
}

impl MemoryType {
    pub const ALL: [MemoryType; 13] = [
        Self::M24xx00,
        Self::M24xx01,
        Self::M24xx02,
        Self::M24xx04,
        Self::M24xx08,
        Self::M24xx16,
        Self::M24xx32,
        Self::M24xx64,
        Self::M24xx128,
        Self::M24xx256,
        Self::M24xx512,
        Self::M24xx1025,
        Self::M24xxM02,
    ];

    /// Part number suffix as printed on the package (`24LC256` -> 256).
    pub const fn from_type_number(number: u16) -> Option<Self> {
        Some(match number {
            0 => Self::M24xx00,
            1 => Self::M24xx01,
            2 => Self::M24xx02,
            4 => Self::M24xx04,
            8 => Self::M24xx08,
            16 => Self::M24xx16,
            32 => Self::M24xx32,
            64 => Self::M24xx64,
            128 => Self::M24xx128,
            256 => Self::M24xx256,
            512 => Self::M24xx512,
            1025 => Self::M24xx1025,
            2048 => Self::M24xxM02,
            _ => return None,
        })
    }

    pub const fn type_number(self) -> u16 {
        match self {
            Self::M24xx00 => 0,
            Self::M24xx01 => 1,
            Self::M24xx02 => 2,
            Self::M24xx04 => 4,
            Self::M24xx08 => 8,
            Self::M24xx16 => 16,
            Self::M24xx32 => 32,
            Self::M24xx64 => 64,
            Self::M24xx128 => 128,
            Self::M24xx256 => 256,
            Self::M24xx512 => 512,
            Self::M24xx1025 => 1025,
            Self::M24xxM02 => 2048,
        }
    }

    pub const fn geometry(self) -> MemoryGeometry {
        let (capacity_bytes, page_size_bytes, address_width, segmentation) = match self {
            Self::M24xx00 => (16, 1, AddressWidth::One, Segmentation::None),
            Self::M24xx01 => (128, 8, AddressWidth::One, Segmentation::None),
            Self::M24xx02 => (256, 8, AddressWidth::One, Segmentation::None),
            Self::M24xx04 => (512, 16, AddressWidth::One, Segmentation::DeviceAddressBits),
            Self::M24xx08 => (1024, 16, AddressWidth::One, Segmentation::DeviceAddressBits),
            Self::M24xx16 => (2048, 16, AddressWidth::One, Segmentation::DeviceAddressBits),
            Self::M24xx32 => (4096, 32, AddressWidth::Two, Segmentation::None),
            Self::M24xx64 => (8192, 32, AddressWidth::Two, Segmentation::None),
            Self::M24xx128 => (16384, 64, AddressWidth::Two, Segmentation::None),
            Self::M24xx256 => (32768, 64, AddressWidth::Two, Segmentation::None),
            Self::M24xx512 => (65536, 128, AddressWidth::Two, Segmentation::None),
            Self::M24xx1025 => (
                131072,
                128,
                AddressWidth::Two,
                Segmentation::BlockSelect { shift: 2 },
            ),
            // A17:A16 sit at bus-address bits 2:1.
            Self::M24xxM02 => (
                262144,
                256,
                AddressWidth::Two,
                Segmentation::BlockSelect { shift: 1 },
            ),
        };
        MemoryGeometry {
            capacity_bytes,
            page_size_bytes,
            address_width,
            segmentation,
        }
    }
}

/// Driver configuration: the initial profile plus engine knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryConfig {
    pub profile: DeviceProfile,
    /// Sleep between two ready polls.
    pub poll_interval_us: u32,
    /// Give up with [`Error::Timeout`](crate::Error::Timeout) after this many
    /// polls; `None` waits forever.
    pub max_ready_polls: Option<u32>,
    pub range_policy: RangePolicy,
    /// Seed for the probes' magic-value generator.
    pub probe_seed: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            profile: DeviceProfile::default(),
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            max_ready_polls: Some(DEFAULT_MAX_READY_POLLS),
            range_policy: RangePolicy::Truncate,
            probe_seed: DEFAULT_PROBE_SEED,
        }
    }
}

impl MemoryConfig {
    pub fn with_profile(profile: DeviceProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), InvalidConfiguration> {
        if self.profile.bus_address > 0x7F || self.poll_interval_us == 0 {
            return Err(InvalidConfiguration);
        }
        if self.max_ready_polls == Some(0) {
            return Err(InvalidConfiguration);
        }
        if let Segmentation::BlockSelect { shift } = self.profile.segmentation {
            if shift > 6 {
                return Err(InvalidConfiguration);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct InvalidConfiguration;
