//! Walking-bit continuity test of the cartridge and cassette ports.
//!
//! The tester board and the DUT face each other through the port. One side
//! drives a walking one, then a walking zero, over a subset of the pin bus
//! while both sides read back. The driver's own readback exposes stuck pins
//! and local shorts; the receiver's readback exposes open or crossed wiring.

use std::collections::BTreeSet;

use cartprobe_io::{Fault, to_lsb_bytes};
use eyre::Result;
use facet::Facet;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    RegisterBus,
    board::{self, Console},
    pins::{self, BUFFER_ENABLE, BUS_BITS, BUS_BYTES},
    regmap::{PIN_DATA, PIN_DIR},
};

const ALL: u64 = (1 << BUS_BITS) - 1;
/// The direction register is wider than the data register.
const DIR_BYTES: usize = 8;
const DIR_INPUT: [u8; DIR_BYTES] = [0x00; DIR_BYTES];
const DIR_OUTPUT: [u8; DIR_BYTES] = [0xFF; DIR_BYTES];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
    #[strum(serialize = "tester to DUT")]
    TesterToDut,
    #[strum(serialize = "DUT to tester")]
    DutToTester,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Walk {
    One,
    Zero,
}

impl Walk {
    fn pattern(self, pin: u8) -> u64 {
        match self {
            Walk::One => pins::bit(pin),
            Walk::Zero => ALL & !pins::bit(pin),
        }
    }

    /// `value` with every bit outside `keep` forced to the background level.
    fn within(self, value: u64, keep: u64) -> u64 {
        match self {
            Walk::One => value & keep,
            Walk::Zero => (value | !keep) & ALL,
        }
    }
}

/// Outcome of one direction. Only [`Continuity::errors`] decides pass or
/// fail; the rest is there to point at the broken pins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Facet)]
pub struct Continuity {
    pub direction: String,
    pub errors: u32,
    pub stuck: Vec<String>,
    pub shorted: Vec<String>,
    /// Bits that differed at the receiving end, as pin bus indices.
    pub faults: Vec<u8>,
    pub fault_names: Vec<String>,
}

impl Continuity {
    fn new(direction: Direction) -> Self {
        Self {
            direction: direction.to_string(),
            ..Default::default()
        }
    }

    fn finish(&mut self, faults: BTreeSet<u8>) {
        self.faults = faults.into_iter().collect();
        self.fault_names = self.faults.iter().copied().map(pins::name).collect();
        info!(direction = %self.direction, errors = self.errors, "continuity");
        if !self.fault_names.is_empty() {
            warn!(direction = %self.direction, "faulty pins: {}", self.fault_names.join(", "));
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors == 0
    }

    pub fn into_result(self) -> Result<Self> {
        if self.errors > 0 {
            return Err(Fault::recoverable(format!(
                "{} continuity errors {}: {}",
                self.errors,
                self.direction,
                self.fault_names.join(", ")
            ))
            .into());
        }
        Ok(self)
    }
}

/// Writes the [`BUS_BYTES`] wide data register only. The two addresses above
/// it in the pin window hold no lines, so the buffer enable needs no wider
/// write than the patterns do.
fn write_pins<R: RegisterBus + ?Sized>(bus: &mut R, value: u64) -> Result<()> {
    bus.write_io(PIN_DATA, &to_lsb_bytes(value, BUS_BITS))
}

fn read_pins<R: RegisterBus + ?Sized>(bus: &mut R) -> Result<u64> {
    let data = bus.read_io(PIN_DATA, BUS_BYTES)?;
    if data.len() != BUS_BYTES {
        return Err(Fault::communication(format!(
            "pin bus read returned {} of {BUS_BYTES} bytes",
            data.len()
        ))
        .into());
    }
    Ok(cartprobe_io::from_lsb_bytes(&data))
}

/// Walk `pins` from `driver`, which must already drive the port. `enable` is
/// OR-ed into every written pattern but never expected back.
#[allow(clippy::too_many_arguments)]
fn walk<D, R>(
    phase: Walk,
    driver: &mut D,
    receiver: &mut R,
    pins: &[u8],
    check_continuity: bool,
    enable: u64,
    result: &mut Continuity,
    faults: &mut BTreeSet<u8>,
) -> Result<()>
where
    D: RegisterBus + ?Sized,
    R: RegisterBus + ?Sized,
{
    let mask = pins::mask(pins);
    for &pin in pins {
        let pattern = phase.pattern(pin);
        let name = pins::name(pin);
        write_pins(driver, pattern | enable)?;

        let local = read_pins(driver)?;
        if phase.within(local, pins::bit(pin)) != pattern {
            error!(pin = %name, %phase, "stuck");
            result.stuck.push(name.clone());
            result.errors += 1;
        } else if phase.within(local, mask) != pattern {
            error!(
                pin = %name,
                %phase,
                "local short: wrote {pattern:012X} read {local:012X}"
            );
            result.shorted.push(name.clone());
            result.errors += 1;
        }

        if !check_continuity {
            continue;
        }
        let remote = phase.within(read_pins(receiver)?, mask);
        let diff = pattern ^ remote;
        debug!(pin = %name, %phase, remote = format_args!("{remote:012X}"), diff = format_args!("{diff:012X}"));
        faults.extend(pins::ones(diff));
        if diff != 0 {
            result.errors += 1;
        }
    }
    Ok(())
}

fn restore(outcome: Result<Continuity>, cleanup: Result<()>) -> Result<Continuity> {
    let result = outcome?;
    cleanup?;
    Ok(result)
}

/// Tester drives, DUT listens. The DUT keeps its buffers enabled but its pins
/// as inputs.
pub fn tester_to_dut<T, D>(
    tester: &mut T,
    dut: &mut D,
    pins: &[u8],
    check_continuity: bool,
) -> Result<Continuity>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    let _span = info_span!("tester_to_dut").entered();
    let outcome = (|| -> Result<Continuity> {
        dut.write_io(PIN_DIR, &DIR_INPUT)?;
        write_pins(dut, BUFFER_ENABLE)?;
        tester.write_io(PIN_DIR, &DIR_OUTPUT)?;

        let mut result = Continuity::new(Direction::TesterToDut);
        let mut faults = BTreeSet::new();
        for phase in [Walk::One, Walk::Zero] {
            walk(phase, tester, dut, pins, check_continuity, 0, &mut result, &mut faults)?;
        }
        result.finish(faults);
        Ok(result)
    })();

    let cleanup = (|| -> Result<()> {
        tester.write_io(PIN_DIR, &DIR_INPUT)?;
        let console = board::read_console(tester, Console::Primary)?;
        if !console.is_empty() {
            debug!(%console, "tester console");
        }
        Ok(())
    })();
    restore(outcome, cleanup)
}

/// DUT drives through its buffers, tester listens.
pub fn dut_to_tester<T, D>(
    tester: &mut T,
    dut: &mut D,
    pins: &[u8],
    check_continuity: bool,
) -> Result<Continuity>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    let _span = info_span!("dut_to_tester").entered();
    let outcome = (|| -> Result<Continuity> {
        tester.write_io(PIN_DIR, &DIR_INPUT)?;
        write_pins(dut, BUFFER_ENABLE)?;
        dut.write_io(PIN_DIR, &DIR_OUTPUT)?;

        let mut result = Continuity::new(Direction::DutToTester);
        let mut faults = BTreeSet::new();
        for phase in [Walk::One, Walk::Zero] {
            walk(phase, dut, tester, pins, check_continuity, BUFFER_ENABLE, &mut result, &mut faults)?;
        }
        result.finish(faults);
        Ok(result)
    })();

    let cleanup = dut.write_io(PIN_DIR, &DIR_INPUT);
    restore(outcome, cleanup)
}

/// Both directions over one port.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct PortCheck {
    pub port: String,
    pub directions: Vec<Continuity>,
}

impl PortCheck {
    pub fn errors(&self) -> u32 {
        self.directions.iter().map(|d| d.errors).sum()
    }

    pub fn into_result(self) -> Result<Self> {
        let errors = self.errors();
        if errors > 0 {
            let names: BTreeSet<_> = self
                .directions
                .iter()
                .flat_map(|d| d.fault_names.iter().chain(&d.stuck).chain(&d.shorted))
                .cloned()
                .collect();
            return Err(Fault::recoverable(format!(
                "{} failure, {errors} errors ({})",
                self.port,
                names.into_iter().collect::<Vec<_>>().join(", ")
            ))
            .into());
        }
        Ok(self)
    }
}

fn check_port<T, D>(
    port: &str,
    tester: &mut T,
    dut: &mut D,
    to_dut: &[u8],
    from_dut: &[u8],
    check_continuity: bool,
) -> Result<PortCheck>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    let directions = vec![
        tester_to_dut(tester, dut, to_dut, check_continuity)?,
        dut_to_tester(tester, dut, from_dut, check_continuity)?,
    ];
    Ok(PortCheck {
        port: port.to_owned(),
        directions,
    })
}

/// Cartridge bottom row. PHI2 is only ever driven by the tester.
pub fn check_bottom_row<T, D>(tester: &mut T, dut: &mut D) -> Result<PortCheck>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    check_port("cartridge bottom row", tester, dut, pins::BOTTOM_ROW, pins::BOTTOM_ROW_OUT, true)
}

pub fn check_top_row<T, D>(tester: &mut T, dut: &mut D) -> Result<PortCheck>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    check_port("cartridge top row", tester, dut, pins::TOP_ROW, pins::TOP_ROW, false)
}

pub fn check_cassette<T, D>(tester: &mut T, dut: &mut D) -> Result<PortCheck>
where
    T: RegisterBus + ?Sized,
    D: RegisterBus + ?Sized,
{
    check_port("cassette port", tester, dut, pins::CASSETTE, pins::CASSETTE, false)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use cartprobe_fpga::userbus::regs;
    use cartprobe_io::{FaultExt, FaultKind};

    use super::*;
    use crate::testbus::{Device, FakeBus};

    /// Both boards' pin registers and the cable between them.
    #[derive(Default)]
    struct Wiring {
        tester_data: u64,
        tester_dir: u64,
        dut_data: u64,
        dut_dir: u64,
        /// Reads wrong at whichever end is not driving it.
        inverted: Option<u8>,
        stuck: Option<(u8, bool)>,
    }

    impl Wiring {
        fn dut_connected(&self) -> bool {
            self.dut_data & BUFFER_ENABLE != 0
        }

        fn dut_drives(&self) -> u64 {
            match self.dut_connected() {
                true => self.dut_dir,
                false => 0,
            }
        }

        fn lines(&self) -> u64 {
            let mut lines = (self.tester_data & self.tester_dir)
                | (self.dut_data & self.dut_drives() & !self.tester_dir);
            if let Some((pin, level)) = self.stuck {
                lines = match level {
                    true => lines | pins::bit(pin),
                    false => lines & !pins::bit(pin),
                };
            }
            lines & ALL
        }

        fn read(&self, dut: bool) -> u64 {
            if dut && !self.dut_connected() {
                return 0;
            }
            let mut value = self.lines();
            if let Some(pin) = self.inverted {
                let bit = pins::bit(pin);
                let drives = match dut {
                    true => self.dut_drives(),
                    false => self.tester_dir,
                };
                if drives & bit == 0 {
                    value ^= bit;
                }
            }
            value
        }
    }

    fn set_byte(word: &mut u64, index: u32, byte: u8) {
        let shift = index * 8;
        *word = *word & !(0xFF << shift) | u64::from(byte) << shift;
    }

    struct Side {
        wiring: Rc<RefCell<Wiring>>,
        dut: bool,
    }

    impl Device for Side {
        fn write_io(&mut self, address: u32, byte: u8) {
            let mut guard = self.wiring.borrow_mut();
            let w = &mut *guard;
            let (data, dir) = match self.dut {
                true => (&mut w.dut_data, &mut w.dut_dir),
                false => (&mut w.tester_data, &mut w.tester_dir),
            };
            match address {
                a if (PIN_DATA..PIN_DATA + BUS_BYTES as u32).contains(&a) => {
                    set_byte(data, a - PIN_DATA, byte)
                }
                a if (PIN_DIR..PIN_DIR + DIR_BYTES as u32).contains(&a) => {
                    set_byte(dir, a - PIN_DIR, byte)
                }
                _ => {}
            }
        }

        fn read_io(&mut self, address: u32) -> u8 {
            match address.checked_sub(PIN_DATA) {
                Some(i) if (i as usize) < BUS_BYTES => {
                    (self.wiring.borrow().read(self.dut) >> (i * 8)) as u8
                }
                _ => 0,
            }
        }
    }

    struct Fixture {
        wiring: Rc<RefCell<Wiring>>,
        tester: FakeBus<Side>,
        dut: FakeBus<Side>,
    }

    fn fixture(wiring: Wiring) -> Fixture {
        let wiring = Rc::new(RefCell::new(wiring));
        let side = |dut| Side {
            wiring: wiring.clone(),
            dut,
        };
        Fixture {
            tester: FakeBus::new(side(false)),
            dut: FakeBus::new(side(true)),
            wiring,
        }
    }

    #[test]
    fn walk_patterns() {
        assert_eq!(Walk::One.pattern(3), 0x8);
        assert_eq!(Walk::Zero.pattern(0), 0xFFFF_FFFF_FFFE);
        assert_eq!(Walk::Zero.within(0x0000_0000_00F0, 0x0F), 0xFFFF_FFFF_FFF0);
        assert_eq!(Walk::One.within(0xFF, 0x0F), 0x0F);
    }

    #[test]
    fn clean_fixture_passes() {
        let mut f = fixture(Wiring::default());
        for pins in [pins::BOTTOM_ROW, pins::TOP_ROW, pins::CASSETTE] {
            let forward = tester_to_dut(&mut f.tester, &mut f.dut, pins, true).unwrap();
            assert_eq!(forward.errors, 0, "{:?}", forward);
            assert!(forward.faults.is_empty());
            let back = dut_to_tester(&mut f.tester, &mut f.dut, pins, true).unwrap();
            assert_eq!(back.errors, 0, "{:?}", back);
            assert!(back.stuck.is_empty() && back.shorted.is_empty());
        }
        check_bottom_row(&mut f.tester, &mut f.dut)
            .unwrap()
            .into_result()
            .unwrap();
    }

    #[test]
    fn inverted_pin_is_reported() {
        let mut f = fixture(Wiring {
            inverted: Some(5),
            ..Default::default()
        });
        let forward = tester_to_dut(&mut f.tester, &mut f.dut, pins::BOTTOM_ROW, true).unwrap();
        assert!(forward.errors > 0);
        assert_eq!(forward.faults, [5]);
        assert_eq!(forward.fault_names, ["SLOT_ADDR5"]);
        assert!(forward.stuck.is_empty());

        let back = dut_to_tester(&mut f.tester, &mut f.dut, pins::BOTTOM_ROW_OUT, true).unwrap();
        assert_eq!(back.faults, [5]);

        let err = check_bottom_row(&mut f.tester, &mut f.dut)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Recoverable));
        assert!(format!("{err}").contains("SLOT_ADDR5"));
    }

    #[test]
    fn remote_faults_ignored_without_continuity() {
        let mut f = fixture(Wiring {
            inverted: Some(17),
            ..Default::default()
        });
        let top = check_top_row(&mut f.tester, &mut f.dut).unwrap();
        assert_eq!(top.errors(), 0);
        assert!(top.directions.iter().all(|d| d.faults.is_empty()));
    }

    #[test]
    fn stuck_pin_is_local() {
        let mut f = fixture(Wiring {
            stuck: Some((41, false)),
            ..Default::default()
        });
        let cassette = check_cassette(&mut f.tester, &mut f.dut).unwrap();
        assert!(cassette.errors() > 0);
        for direction in &cassette.directions {
            assert!(direction.stuck.contains(&"CAS_SENSE".to_owned()), "{direction:?}");
        }
        assert!(cassette.into_result().is_err());
    }

    #[test]
    fn leaves_port_as_inputs() {
        let mut f = fixture(Wiring::default());
        f.tester
            .fifos
            .insert(regs::CONSOLE, VecDeque::from(b"pio ok\n".to_vec()));
        tester_to_dut(&mut f.tester, &mut f.dut, pins::CASSETTE, true).unwrap();
        assert_eq!(f.wiring.borrow().tester_dir, 0);
        assert!(f.tester.fifos[&regs::CONSOLE].is_empty());

        dut_to_tester(&mut f.tester, &mut f.dut, pins::CASSETTE, true).unwrap();
        assert_eq!(f.wiring.borrow().dut_dir, 0);
        assert_eq!(f.dut.writes_to(PIN_DIR).last(), Some(&DIR_INPUT.as_slice()));
    }

    #[test]
    fn buffer_enable_fits_data_register() {
        let mut f = fixture(Wiring::default());
        tester_to_dut(&mut f.tester, &mut f.dut, pins::CASSETTE, false).unwrap();
        assert_eq!(f.dut.writes_to(PIN_DATA), [[0, 0, 0, 0, 0, 0x80]]);
        assert!(f.wiring.borrow().dut_connected());
    }
}
