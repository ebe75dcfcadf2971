//! Board-level helpers: consoles, program upload, clocks, identification.

use std::{io::Read, thread, time::Duration};

use cartprobe_fpga::userbus::{OUTPUTS_RESET, OUTPUTS_RUN, regs};
use cartprobe_io::{Fault, ShortHex};
use eyre::{Result, WrapErr, bail};
use facet::Facet;
use tracing::{debug, info, instrument, warn};

use crate::{
    RegisterBus,
    flash::SpiFlash,
    regmap::{BOOT_MAGIC, BOOT_MAILBOX, CLOCK_OSC, CLOCK_REF, REVISION},
};

/// Most console bytes pulled per call.
pub const CONSOLE_MAX: usize = 1000;
pub const UPLOAD_CHUNK: usize = 16 * 1024;
/// Trails every upload chunk so the last word is flushed to memory.
const UPLOAD_PAD: [u8; 8] = [0; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Console {
    Primary,
    Secondary,
}

impl Console {
    pub const fn channel(self) -> u8 {
        match self {
            Console::Primary => regs::CONSOLE,
            Console::Secondary => regs::CONSOLE_ALT,
        }
    }
}

/// Whatever is waiting on `console`, as 7 bit ASCII.
pub fn read_console<R: RegisterBus + ?Sized>(bus: &mut R, console: Console) -> Result<String> {
    let raw = bus.read_fifo(CONSOLE_MAX, console.channel(), true)?;
    Ok(raw.into_iter().map(|b| char::from(b & 0x7F)).collect())
}

/// Copy `image` into memory at `address`. `on_progress` gets the running
/// byte count.
#[instrument(skip(bus, image, on_progress))]
pub fn upload<R: RegisterBus + ?Sized>(
    bus: &mut R,
    image: &mut dyn Read,
    address: u32,
    on_progress: &mut dyn FnMut(usize),
) -> Result<usize> {
    let mut chunk = Vec::with_capacity(UPLOAD_CHUNK + UPLOAD_PAD.len());
    let mut sent = 0;
    loop {
        chunk.clear();
        Read::take(&mut *image, UPLOAD_CHUNK as u64)
            .read_to_end(&mut chunk)
            .wrap_err("reading image")?;
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        chunk.extend_from_slice(&UPLOAD_PAD);
        let at = u64::from(address) + sent as u64;
        if at + chunk.len() as u64 > 1 << 32 {
            return Err(Fault::critical(format!(
                "{len} bytes at {at:#X} run past the end of memory"
            ))
            .into());
        }
        bus.write_memory(at as u32, &chunk)?;
        sent += len;
        on_progress(sent);
    }
    if sent == 0 {
        bail!("image is empty, nothing to upload");
    }
    info!(bytes = sent, address = format_args!("{address:#X}"), "uploaded");
    Ok(sent)
}

/// Hand `address` to the boot loader through the mailbox, holding the CPU in
/// reset meanwhile if `reset`.
pub fn run_app<R: RegisterBus + ?Sized>(bus: &mut R, address: u32, reset: bool) -> Result<()> {
    if reset {
        bus.set_outputs(OUTPUTS_RESET)?;
    }
    let mut mailbox = address.to_le_bytes().to_vec();
    mailbox.extend(BOOT_MAGIC.to_le_bytes());
    bus.write_memory(BOOT_MAILBOX, &mailbox)?;
    let entry = bus.read_u32(BOOT_MAILBOX)?;
    let magic = bus.read_u32(BOOT_MAILBOX + 4)?;
    debug!(
        entry = format_args!("{entry:08X}"),
        magic = format_args!("{magic:08X}"),
        "boot mailbox"
    );
    if reset {
        bus.set_outputs(OUTPUTS_RUN)?;
    }
    Ok(())
}

/// Without a boot loader: load at address zero under reset, then release.
pub fn run_bare<R: RegisterBus + ?Sized>(bus: &mut R, image: &mut dyn Read) -> Result<usize> {
    bus.set_outputs(OUTPUTS_RESET)?;
    let size = upload(bus, image, 0, &mut |_| {})?;
    bus.set_outputs(OUTPUTS_RUN)?;
    Ok(size)
}

/// One address line per block.
const MEMORY_TEST_LINES: std::ops::Range<u32> = 6..26;
const MEMORY_TEST_BLOCK: usize = 64;

fn test_block(seed: u64, line: u32) -> Vec<u8> {
    let mut state = seed ^ u64::from(line).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..MEMORY_TEST_BLOCK)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Write a distinct block at every power-of-two address, then read them all
/// back. Catches stuck and shorted address lines.
#[instrument(skip(bus))]
pub fn memory_test<R: RegisterBus + ?Sized>(bus: &mut R, seed: u64) -> Result<()> {
    for line in MEMORY_TEST_LINES {
        bus.write_memory(1 << line, &test_block(seed, line))?;
    }
    for line in MEMORY_TEST_LINES {
        let expected = test_block(seed, line);
        let read = bus.read_memory(1 << line, MEMORY_TEST_BLOCK)?;
        if read != expected {
            debug!(wrote = %ShortHex(&expected), read = %ShortHex(&read));
            return Err(Fault::critical(format!(
                "DDR2 verify error at {:#X}",
                1u32 << line
            ))
            .into());
        }
    }
    info!("memory ok");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Clock {
    Reference,
    Oscillator,
}

impl Clock {
    const fn address(self) -> u32 {
        match self {
            Clock::Reference => CLOCK_REF,
            Clock::Oscillator => CLOCK_OSC,
        }
    }
}

pub const REFERENCE_MHZ: f64 = 50.0;
pub const MAX_PPM: f64 = 120.0;
const COUNT_VALID: u32 = 1 << 24;
const COUNT_MASK: u32 = 0x00FF_FFFF;
const CLOCK_POLLS: usize = 10;
const CLOCK_RETRY: Duration = Duration::from_millis(200);

/// Counts are MHz in 8.16 fixed point.
fn counter_mhz(words: &[u8]) -> Option<f64> {
    words
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .find(|w| w & COUNT_VALID != 0)
        .map(|w| f64::from(w & COUNT_MASK) / 65536.0)
}

pub fn measure_clock<R: RegisterBus + ?Sized>(bus: &mut R, clock: Clock) -> Result<f64> {
    for poll in 0..CLOCK_POLLS {
        if poll > 0 {
            thread::sleep(CLOCK_RETRY);
        }
        if let Some(mhz) = counter_mhz(&bus.read_io(clock.address(), 16)?) {
            debug!(%clock, mhz, "clock");
            return Ok(mhz);
        }
    }
    Err(Fault::recoverable(format!("no valid {clock} clock count")).into())
}

pub fn ppm(mhz: f64) -> f64 {
    1e6 * (mhz / REFERENCE_MHZ - 1.0)
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Clocks {
    pub reference_mhz: f64,
    pub ppm: f64,
    pub oscillator_mhz: f64,
}

impl Clocks {
    pub fn into_result(self) -> Result<Self> {
        if self.ppm.abs() > MAX_PPM {
            return Err(Fault::recoverable(format!(
                "reference clock {:.6} MHz is {:.1} ppm off",
                self.reference_mhz, self.ppm
            ))
            .into());
        }
        Ok(self)
    }
}

pub fn measure_clocks<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<Clocks> {
    let reference_mhz = measure_clock(bus, Clock::Reference)?;
    let clocks = Clocks {
        reference_mhz,
        ppm: ppm(reference_mhz),
        oscillator_mhz: measure_clock(bus, Clock::Oscillator)?,
    };
    info!(
        reference = format_args!("{:.6} MHz", clocks.reference_mhz),
        ppm = format_args!("{:.1}", clocks.ppm),
        oscillator = format_args!("{:.6} MHz", clocks.oscillator_mhz),
        "clocks"
    );
    Ok(clocks)
}

pub fn board_revision<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<u8> {
    match bus.read_io(REVISION, 1)?.first() {
        Some(b) => Ok(b >> 3),
        None => Err(Fault::communication("no revision byte").into()),
    }
}

/// Factory-programmed ID of the board's SPI flash.
pub fn flash_unique_id<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<u64> {
    SpiFlash::new(bus).unique_id()
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct BoardInfo {
    pub revision: u8,
    pub flash_id: u64,
}

pub fn board_info<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<BoardInfo> {
    let info = BoardInfo {
        revision: board_revision(bus)?,
        flash_id: flash_unique_id(bus)?,
    };
    if info.flash_id == 0 || info.flash_id == u64::MAX {
        warn!(flash_id = format_args!("{:016X}", info.flash_id), "implausible flash ID");
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use cartprobe_io::{FaultExt, FaultKind};

    use super::*;
    use crate::testbus::{Device, FakeBus, IoMap};

    fn counts(words: [u32; 4]) -> Vec<(u32, u8)> {
        words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .enumerate()
            .map(|(i, b)| (i as u32, b))
            .collect()
    }

    #[test]
    fn console_is_seven_bit() {
        let mut bus = FakeBus::new(IoMap::default());
        bus.fifos
            .insert(regs::CONSOLE, VecDeque::from(b"RAM OK!!\xA0\n".to_vec()));
        assert_eq!(read_console(&mut bus, Console::Primary).unwrap(), "RAM OK!! \n");
        assert_eq!(read_console(&mut bus, Console::Primary).unwrap(), "");
        assert_eq!(read_console(&mut bus, Console::Secondary).unwrap(), "");
    }

    #[test]
    fn upload_pads_chunks() {
        let mut bus = FakeBus::new(IoMap::default());
        let image: Vec<u8> = (0..UPLOAD_CHUNK + 10).map(|i| (i % 251) as u8 + 1).collect();
        let mut progress = Vec::new();
        let sent = upload(&mut bus, &mut image.as_slice(), 0x100, &mut |n| progress.push(n)).unwrap();
        assert_eq!(sent, image.len());
        assert_eq!(progress, [UPLOAD_CHUNK, image.len()]);
        assert_eq!(bus.memory_bytes(0x100, image.len()), image);
        let end = 0x100 + image.len() as u32;
        assert_eq!(bus.memory_bytes(end, 8), [0; 8]);
        assert!(bus.memory.contains_key(&(end + 7)));
        assert!(upload(&mut bus, &mut [0u8; 0].as_slice(), 0, &mut |_| {}).is_err());
    }

    #[test]
    fn upload_stops_at_end_of_memory() {
        let mut bus = FakeBus::new(IoMap::default());
        let err = upload(&mut bus, &mut [7u8; 16].as_slice(), 0xFFFF_FFF0, &mut |_| {}).unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Critical));
        assert!(bus.memory.is_empty());
    }

    #[test]
    fn run_app_fills_mailbox() {
        let mut bus = FakeBus::new(IoMap::default());
        run_app(&mut bus, 0x100, true).unwrap();
        assert_eq!(bus.outputs, [OUTPUTS_RESET, OUTPUTS_RUN]);
        assert_eq!(bus.memory_bytes(BOOT_MAILBOX, 8), [0x00, 0x01, 0, 0, 0xBE, 0xBA, 0x71, 0x15]);

        let mut bus = FakeBus::new(IoMap::default());
        run_app(&mut bus, 0x2000, false).unwrap();
        assert!(bus.outputs.is_empty());
        assert_eq!(bus.read_u32(BOOT_MAILBOX).unwrap(), 0x2000);
    }

    #[test]
    fn bare_run_loads_at_zero() {
        let mut bus = FakeBus::new(IoMap::default());
        run_bare(&mut bus, &mut [1u8, 2, 3].as_slice()).unwrap();
        assert_eq!(bus.memory_bytes(0, 3), [1, 2, 3]);
        assert_eq!(bus.outputs, [OUTPUTS_RESET, OUTPUTS_RUN]);
    }

    /// Loses every write to one block.
    struct ShortedLines;

    impl Device for ShortedLines {
        fn write_io(&mut self, _: u32, _: u8) {}

        fn read_io(&mut self, _: u32) -> u8 {
            0
        }

        fn memory_write(&mut self, address: u32, data: &mut [u8]) {
            if address == 1 << 12 {
                data.fill(0);
            }
        }
    }

    #[test]
    fn memory_test_catches_bad_line() {
        let mut bus = FakeBus::new(IoMap::default());
        memory_test(&mut bus, 7).unwrap();
        assert_ne!(test_block(7, 6), test_block(7, 7));

        let mut bus = FakeBus::new(ShortedLines);
        let err = memory_test(&mut bus, 7).unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Critical));
        assert!(format!("{err}").contains("0x1000"));
    }

    #[test]
    fn clock_counts() {
        let mut bus = FakeBus::new(IoMap::default());
        let exact = 50 << 16;
        bus.device.0.extend(counts([exact, 0, 0, 0]).into_iter().map(|(a, b)| (CLOCK_REF + a, b)));
        bus.device.0.extend(
            counts([0, 12 << 16, COUNT_VALID | 25 << 16 | 0x8000, 0])
                .into_iter()
                .map(|(a, b)| (CLOCK_OSC + a, b)),
        );
        // reference count not latched yet
        assert_eq!(counter_mhz(&bus.read_io(CLOCK_REF, 16).unwrap()), None);
        assert_eq!(measure_clock(&mut bus, Clock::Oscillator).unwrap(), 25.5);

        bus.device.0.insert(CLOCK_REF + 3, 0x01);
        let clocks = measure_clocks(&mut bus).unwrap();
        assert_eq!(clocks.reference_mhz, 50.0);
        assert_eq!(clocks.ppm, 0.0);
        clocks.into_result().unwrap();
    }

    #[test]
    fn ppm_limit() {
        assert!((ppm(50.005) - 100.0).abs() < 1e-6);
        let off = Clocks {
            reference_mhz: 50.01,
            ppm: ppm(50.01),
            oscillator_mhz: 25.0,
        };
        let err = off.into_result().unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Recoverable));
    }

    #[test]
    fn revision() {
        let mut bus = FakeBus::new(IoMap::default());
        bus.device.0.insert(REVISION, 0x1F);
        assert_eq!(board_revision(&mut bus).unwrap(), 3);
    }
}
