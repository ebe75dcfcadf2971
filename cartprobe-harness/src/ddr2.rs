//! DDR2 controller bring-up and DQS read calibration.
//!
//! The controller samples the DQS training pattern on four lanes at once, one
//! lane per read-delay setting. Calibration sweeps the 32 tap IDELAY line,
//! looks for a window of [`TRAINING_BYTE`] on any lane and parks the data
//! delays inside it, bit-slipping when nothing usable shows up.

use bitflags::bitflags;
use cartprobe_io::{Fault, SpaceHex};
use eyre::Result;
use facet::Facet;
use tracing::{debug, info, instrument, warn};

use crate::{RegisterBus, regmap::ddr};

pub const TRAINING_BYTE: u8 = 0x55;
pub const DELAY_TAPS: usize = 32;
pub const LANES: usize = 4;
pub const BITSLIP_ATTEMPTS: u8 = 4;

// Golden constants, pinned to the tap width and unit interval of the board
// at 533 MT/s. Do not derive them.
const EDGE_MARGIN: usize = 9;
const MIN_SPAN: usize = 10;
const WINDOW_EDGE: usize = 23;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u8 {
        const CLOCK   = 1 << 0;
        const ODT     = 1 << 1;
        const REFRESH = 1 << 2;
        const CKE     = 1 << 3;
    }
}

#[rustfmt::skip]
mod command {
    pub const LOAD_MODE    : u8 = 0x00;
    pub const REFRESH      : u8 = 0x01;
    pub const PRECHARGE    : u8 = 0x02;

    /// A10 set: all banks.
    pub const PRECHARGE_ALL: u16 = 0x0400;
    pub const EMR3         : u16 = 0xC000;
    pub const EMR2         : u16 = 0x8000;
    /// EMR: DQS# enabled, 150R ODT, additive latency 3, half drive.
    pub const EMR_AL3      : u16 = 0x405A;
    /// MR: write recovery 4, DLL reset, CAS 4, sequential burst of 4.
    pub const MR           : u16 = 0x0742;
}

const REFRESHES: usize = 4;
/// Written to a delay select register to step both edges of its line.
const STEP: u8 = 0x03;
const STEP_ALL_BITS: u8 = 0xFF;

/// Written and read back once the delays are set.
const VERIFY_WORDS: [(u32, u32); 2] = [(0x104, 0xABCD_EF55), (0x100, 0x8765_4321)];

fn mode_command<R: RegisterBus + ?Sized>(bus: &mut R, address: u16, cmd: u8) -> Result<()> {
    let [lo, hi] = address.to_le_bytes();
    bus.write_io(ddr::ADDR_LOW, &[lo, hi, cmd])
}

/// Bring the memory out of reset into a state ready for calibration.
/// Returns the controller ID word.
#[instrument(skip(bus))]
pub fn initialize<R: RegisterBus + ?Sized>(bus: &mut R, invert_dqs: bool) -> Result<u32> {
    let rid = bus.read_io(ddr::RID, 4)?;
    debug!(rid = %SpaceHex(&rid), "controller");
    let rid = rid
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Fault::communication(format!("short controller ID read: {} bytes", rid.len())))?;

    bus.write_io(ddr::CONTROL, &[(Control::CLOCK | Control::CKE).bits()])?;

    mode_command(bus, command::PRECHARGE_ALL, command::PRECHARGE)?;
    mode_command(bus, command::EMR3, command::LOAD_MODE)?;
    mode_command(bus, command::EMR2, command::LOAD_MODE)?;
    mode_command(bus, command::EMR_AL3, command::LOAD_MODE)?;
    mode_command(bus, command::MR, command::LOAD_MODE)?;
    mode_command(bus, command::PRECHARGE_ALL, command::PRECHARGE)?;
    for _ in 0..REFRESHES {
        bus.write_io(ddr::CMD, &[command::REFRESH])?;
    }

    bus.write_io(ddr::DQS_INVERT, &[invert_dqs.into()])?;
    // sweep the delay lines upward
    bus.write_io(ddr::DELAY_UPDOWN, &[0x01])?;
    info!(rid = format_args!("{rid:08X}"), "DDR2 initialised");
    Ok(rid)
}

/// Longest run of [`TRAINING_BYTE`] in one lane's sweep, as inclusive tap
/// indices. Single-sample runs never qualify.
pub fn training_window(samples: &[u8]) -> Option<(usize, usize)> {
    let mut best = None;
    let mut longest = 0;
    let mut from = 0;
    while let Some(first) = samples[from..]
        .iter()
        .position(|&b| b == TRAINING_BYTE)
        .map(|p| p + from)
    {
        let last = samples[first..]
            .iter()
            .position(|&b| b != TRAINING_BYTE)
            .map_or(samples.len() - 1, |p| first + p - 1);
        if last - first > longest {
            longest = last - first;
            best = Some((first, last));
        }
        from = last + 1;
    }
    best
}

/// Tap to park at for a window, keeping clear of whichever edge was seen.
pub fn select_tap((first, last): (usize, usize)) -> Option<usize> {
    if first == 0 && last > EDGE_MARGIN {
        Some(last - EDGE_MARGIN)
    } else if last == DELAY_TAPS - 1 && first < WINDOW_EDGE {
        Some(first + EDGE_MARGIN)
    } else if last - first > MIN_SPAN {
        Some((first + last) / 2)
    } else {
        None
    }
}

/// Usable tap for one lane's sweep, if any.
pub fn find_dqs_delay(samples: &[u8]) -> Option<usize> {
    training_window(samples).and_then(select_tap)
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct LaneScan {
    pub lane: u8,
    pub first: Option<u8>,
    pub last: Option<u8>,
    pub tap: Option<u8>,
}

impl LaneScan {
    fn new(lane: usize, samples: &[u8]) -> Self {
        let window = training_window(samples);
        Self {
            lane: lane as u8,
            first: window.map(|(first, _)| first as u8),
            last: window.map(|(_, last)| last as u8),
            tap: window.and_then(select_tap).map(|tap| tap as u8),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct BitslipAttempt {
    pub bitslip: u8,
    pub lanes: Vec<LaneScan>,
}

/// Everything calibration saw, whether or not it succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct Calibration {
    pub attempts: Vec<BitslipAttempt>,
    pub bitslip: Option<u8>,
    pub read_delay: Option<u8>,
    pub tap: Option<u8>,
    pub verified: bool,
}

impl Calibration {
    pub fn is_ok(&self) -> bool {
        self.tap.is_some() && self.verified
    }

    pub fn into_result(self) -> Result<Self> {
        match (self.tap, self.verified) {
            (None, _) => Err(Fault::recoverable(format!(
                "no stable DQS window after {} bitslips",
                self.attempts.len()
            ))
            .into()),
            (Some(tap), false) => Err(Fault::recoverable(format!(
                "memory pattern mismatch with read delay {:?}, tap {tap}",
                self.read_delay
            ))
            .into()),
            (Some(_), true) => Ok(self),
        }
    }
}

fn sweep<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<Vec<Vec<u8>>> {
    let mut lanes = vec![Vec::with_capacity(DELAY_TAPS); LANES];
    for _ in 0..DELAY_TAPS {
        // any memory read makes the controller capture DQS
        bus.read_u32(0)?;
        let sample = bus.read_io(ddr::RDQS, LANES)?;
        if sample.len() != LANES {
            return Err(Fault::communication(format!(
                "DQS readback returned {} of {LANES} bytes",
                sample.len()
            ))
            .into());
        }
        for (lane, byte) in lanes.iter_mut().zip(sample) {
            lane.push(byte);
        }
        bus.write_io(ddr::DELAY_SEL_DQS, &[STEP])?;
    }
    Ok(lanes)
}

fn verify<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<bool> {
    for (address, word) in VERIFY_WORDS {
        bus.write_u32(address, word)?;
    }
    let mut ok = true;
    for (address, word) in VERIFY_WORDS {
        let read = bus.read_u32(address)?;
        if read != word {
            warn!(
                address = format_args!("{address:#X}"),
                "wrote {word:08X}, read {read:08X}"
            );
            ok = false;
        }
    }
    Ok(ok)
}

/// Find a read delay, tap and bitslip that sample inside the DQS window. A
/// calibration that finds nothing is returned as such; only bus errors fail.
#[instrument(skip_all)]
pub fn calibrate<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<Calibration> {
    let mut cal = Calibration::default();
    for bitslip in 0..BITSLIP_ATTEMPTS {
        let lanes = sweep(bus)?;
        let scans: Vec<_> = lanes
            .iter()
            .enumerate()
            .map(|(lane, samples)| {
                debug!(bitslip, lane, samples = %SpaceHex(samples), "DQS sweep");
                LaneScan::new(lane, samples)
            })
            .collect();
        let chosen = scans.iter().find_map(|s| s.tap.map(|tap| (s.lane, tap)));
        cal.attempts.push(BitslipAttempt {
            bitslip,
            lanes: scans,
        });

        if let Some((lane, tap)) = chosen {
            bus.write_io(ddr::READ_DELAY, &[lane])?;
            for _ in 0..tap {
                bus.write_io(ddr::DELAY_SEL_DQS, &[STEP])?;
                bus.write_io(ddr::DELAY_SEL_DATA_0, &[STEP_ALL_BITS])?;
                bus.write_io(ddr::DELAY_SEL_DATA_1, &[STEP_ALL_BITS])?;
            }
            cal.bitslip = Some(bitslip);
            cal.read_delay = Some(lane);
            cal.tap = Some(tap);
            cal.verified = verify(bus)?;
            info!(tap, read_delay = lane, bitslip, verified = cal.verified, "DQS calibrated");
            return Ok(cal);
        }
        bus.write_io(ddr::BITSLIP, &[1])?;
    }
    warn!("no DQS window found");
    Ok(cal)
}
