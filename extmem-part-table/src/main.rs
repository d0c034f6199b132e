use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use extmem::sim::{SimBus, SimClock, SimSpec, SimulatedEeprom};
use extmem::{
    AddressWidth, DeviceProfile, ExternalMemory, I2cTransport, MemoryConfig, MemoryType,
    Segmentation, DEFAULT_BUS_ADDRESS,
};

#[derive(Parser, Debug)]
#[command(about = "Characterize EEPROM part descriptions with the extmem probes.")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate every part in a Hjson table, run the probes and compare with the table.
    Check {
        /// Path to the part table.
        table: PathBuf,
    },
    /// List the built-in memory-type presets.
    Presets,
}

#[derive(Debug, Deserialize)]
struct PartTable {
    parts: Vec<PartEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PartEntry {
    name: String,
    capacity: u32,
    page_size: u16,
    address_bytes: u8,
    #[serde(default = "default_write_time_us")]
    write_time_us: u64,
    #[serde(default = "default_bus_address")]
    bus_address: u8,
    /// Controller buffer limit, address bytes included.
    #[serde(default)]
    max_transaction: Option<usize>,
}

fn default_write_time_us() -> u64 {
    3_000
}

fn default_bus_address() -> u8 {
    DEFAULT_BUS_ADDRESS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Characterization {
    capacity: u32,
    page_size: u16,
    address_bytes: u8,
    write_time_ms: u8,
}

impl PartEntry {
    fn address_width(&self) -> Result<AddressWidth> {
        match self.address_bytes {
            1 => Ok(AddressWidth::One),
            2 => Ok(AddressWidth::Two),
            n => bail!("{}: address_bytes must be 1 or 2, got {}", self.name, n),
        }
    }

    fn sim_spec(&self) -> Result<SimSpec> {
        if self.capacity == 0 || self.page_size == 0 || self.capacity % self.page_size as u32 != 0 {
            bail!("{}: capacity must be a non-zero multiple of page_size", self.name);
        }
        let mut spec = SimSpec::m24xx(self.capacity, self.page_size, self.address_width()?);
        spec.bus_address = self.bus_address;
        spec.write_time_us = self.write_time_us;
        if let Some(max) = self.max_transaction {
            spec.max_transaction_bytes = max;
        }
        Ok(spec)
    }

    /// What the probes should report for this part.
    fn expected(&self) -> Characterization {
        Characterization {
            capacity: self.capacity,
            page_size: self.page_size,
            address_bytes: self.address_bytes,
            write_time_ms: ((self.write_time_us * 110).div_ceil(100_000)).min(u8::MAX as u64) as u8,
        }
    }
}

fn load_table(path: &Path) -> Result<PartTable> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_table(&text).with_context(|| format!("parse {}", path.display()))
}

fn parse_table(text: &str) -> Result<PartTable> {
    let table: PartTable = serde_hjson::from_str(text)?;
    if table.parts.is_empty() {
        bail!("part table is empty");
    }
    Ok(table)
}

/// Attaches a blank simulated part and lets `connect` discover it.
fn characterize(part: &PartEntry) -> Result<Characterization> {
    let spec = part.sim_spec()?;
    let clock = SimClock::new();
    let sim = SimulatedEeprom::new(spec, clock.clone());
    let transport: I2cTransport<SimBus> =
        I2cTransport::new(sim.bus()).with_max_transaction_bytes(spec.max_transaction_bytes);

    let config = MemoryConfig::with_profile(DeviceProfile::undiscovered(part.bus_address));
    let mut memory = ExternalMemory::new(transport, clock, config)
        .map_err(|e| anyhow!("{}: {}", part.name, e))?;
    memory
        .connect()
        .map_err(|e| anyhow!("{}: connect: {}", part.name, e))?;
    let write_time_ms = memory
        .detect_write_latency()
        .map_err(|e| anyhow!("{}: write latency: {}", part.name, e))?;

    let profile = memory.profile();
    Ok(Characterization {
        capacity: profile.capacity_bytes,
        page_size: profile.page_size_bytes,
        address_bytes: profile.address_width.map_or(0, |w| w.bytes() as u8),
        write_time_ms,
    })
}

fn check(path: &Path) -> Result<()> {
    let table = load_table(path)?;
    println!(
        "{:<12} {:>18} {:>12} {:>8} {:>10}",
        "part", "capacity", "page", "addr", "write ms"
    );

    let mut mismatches = 0usize;
    for part in &table.parts {
        let expected = part.expected();
        let detected = characterize(part)?;
        let verdict = if detected == expected {
            "ok"
        } else {
            mismatches += 1;
            "MISMATCH"
        };
        println!(
            "{:<12} {:>8}/{:<9} {:>5}/{:<6} {:>3}/{:<4} {:>4}/{:<5} {}",
            part.name,
            expected.capacity,
            detected.capacity,
            expected.page_size,
            detected.page_size,
            expected.address_bytes,
            detected.address_bytes,
            expected.write_time_ms,
            detected.write_time_ms,
            verdict
        );
    }

    if mismatches > 0 {
        bail!("{} part(s) did not characterize as declared", mismatches);
    }
    Ok(())
}

fn describe_segmentation(segmentation: Segmentation) -> String {
    match segmentation {
        Segmentation::Auto => "auto".to_string(),
        Segmentation::None => "-".to_string(),
        Segmentation::DeviceAddressBits => "device address bits".to_string(),
        Segmentation::BlockSelect { shift } => format!("block select, bit {}", shift),
    }
}

fn presets() {
    println!(
        "{:<10} {:>9} {:>6} {:>6}  segmentation",
        "type", "capacity", "page", "addr"
    );
    for memory_type in MemoryType::ALL {
        let geometry = memory_type.geometry();
        println!(
            "24xx{:<6} {:>9} {:>6} {:>6}  {}",
            memory_type.type_number(),
            geometry.capacity_bytes,
            geometry.page_size_bytes,
            geometry.address_width.bytes(),
            describe_segmentation(geometry.segmentation)
        );
    }
}

fn main() {
    let args = Args::parse();
    let result = match &args.command {
        Command::Check { table } => check(table),
        Command::Presets => {
            presets();
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
