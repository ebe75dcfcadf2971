//! Xilinx 7-series configuration port.
//!
//! Discrete JPROGRAM / CFG_IN / JSTART instructions with a 6 bit IR. Unlike
//! the ECP5 burst, configuration data goes out MSB first without reversal.

use std::io::Read;

use bitflags::bitflags;
use cartprobe_io::{Backend, BitOrder, Fault, Session, jtag::State, units::Bits};
use eyre::Result;
use tracing::{debug, info, instrument, warn};

use crate::profile::fill_chunk;

pub mod bitfile;
pub mod registers;

use self::registers::{Addr, Type1, packet_bytes};

pub const IR_LEN: Bits<u8> = Bits(6);

/// XC7A35T
pub const DEFAULT_IDCODE: u32 = 0x0362_D093;

/// Clocks after JPROGRAM while the device clears its configuration memory.
const PROGRAM_CLOCKS: usize = 10_000;
const STARTUP_CLOCKS: usize = 32;

#[rustfmt::skip]
pub mod opcodes {
    pub const CFG_OUT  : u8 = 0x04;
    pub const CFG_IN   : u8 = 0x05;
    pub const IDCODE   : u8 = 0x09;
    pub const JPROGRAM : u8 = 0x0B;
    pub const JSTART   : u8 = 0x0C;
    pub const USER4    : u8 = 0x23;
}

bitflags! {
    /// Configuration STAT register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stat: u32 {
        const CRC_ERROR    = 1 << 0;
        const PART_SECURED = 1 << 1;
        const MMCM_LOCK    = 1 << 2;
        const DCI_MATCH    = 1 << 3;
        const EOS          = 1 << 4;
        const GTS_CFG_B    = 1 << 5;
        const GWE          = 1 << 6;
        const GHIGH_B      = 1 << 7;
        const INIT_COMPLETE = 1 << 11;
        const INIT_B       = 1 << 12;
        const RELEASE_DONE = 1 << 13;
        const DONE         = 1 << 14;
        const ID_ERROR     = 1 << 15;
        const DEC_ERROR    = 1 << 16;

        const _ = !0;
    }
}

impl Stat {
    pub fn check_loaded(self) -> Result<()> {
        if !self.contains(Stat::DONE) || self.intersects(Stat::CRC_ERROR | Stat::ID_ERROR) {
            return Err(Fault::critical(format!(
                "7-series configuration failed, STAT {:08X}",
                self.bits()
            ))
            .into());
        }
        Ok(())
    }
}

/// Read one configuration register through a type 1 read packet.
pub fn read_register<B: Backend>(session: &mut Session<B>, addr: Addr) -> Result<u32> {
    let packet = packet_bytes([
        Type1::SYNC,
        Type1::NOOP,
        Type1::read(addr).to_raw(),
        Type1::NOOP,
        Type1::NOOP,
    ]);
    session.write_instruction(opcodes::CFG_IN.into(), IR_LEN)?;
    session.change_state(State::ShiftDR)?;
    session.stream(&packet, BitOrder::MsbFirst)?;
    session.go_idle()?;

    session.write_instruction(opcodes::CFG_OUT.into(), IR_LEN)?;
    // CFG_OUT shifts the word MSB first
    let value = (session.read_data(Bits(32))? as u32).reverse_bits();
    debug!(%addr, value = format_args!("{value:08X}"), "config register");
    Ok(value)
}

pub fn read_status<B: Backend>(session: &mut Session<B>) -> Result<Stat> {
    read_register(session, Addr::Stat).map(Stat::from_bits_retain)
}

#[instrument(skip_all)]
pub fn load<B: Backend>(
    session: &mut Session<B>,
    image: &mut dyn Read,
    progress: &mut dyn FnMut(usize),
) -> Result<Stat> {
    session.write_instruction(opcodes::JPROGRAM.into(), IR_LEN)?;
    session.reset()?;
    session.clock_only(PROGRAM_CLOCKS)?;

    info!("streaming bitstream");
    session.write_instruction(opcodes::CFG_IN.into(), IR_LEN)?;
    session.change_state(State::ShiftDR)?;
    let mut chunk = vec![0; cartprobe_io::BURST_LEN.0];
    let mut sent = 0;
    loop {
        let len = fill_chunk(image, &mut chunk)?;
        if len == 0 {
            break;
        }
        session.stream(&chunk[..len], BitOrder::MsbFirst)?;
        sent += len;
        progress(sent);
    }
    if sent == 0 {
        warn!("empty bitstream");
    }
    session.change_state(State::UpdateDR)?;
    session.go_idle()?;

    session.write_instruction(opcodes::JSTART.into(), IR_LEN)?;
    session.clock_only(STARTUP_CLOCKS)?;

    let stat = read_status(session)?;
    stat.check_loaded()?;
    info!(bytes = sent, "7-series configured");
    Ok(stat)
}

/// USER4 scans start with a flag bit: 1 selects a register from the next four
/// bits, 0 routes the rest of the scan to the selected register. Leaves the
/// TAP in Shift-DR past the flag bit.
pub fn select_user_register<B: Backend>(session: &mut Session<B>, code: u8) -> Result<()> {
    let code = code & 0x0F;
    session.write_instruction(opcodes::USER4.into(), IR_LEN)?;
    session.write_data(u64::from(code) << 1 | 1, Bits(5))?;
    session.write_instruction(opcodes::USER4.into(), IR_LEN)?;
    session.change_state(State::ShiftDR)?;
    session.shift_register(&[0], Bits(1))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cartprobe_io::{FaultExt, FaultKind, jtag::State};

    use super::*;
    use crate::{Family, testbench};

    #[test]
    fn stat_checks() {
        assert!((Stat::DONE | Stat::EOS).check_loaded().is_ok());
        assert!((Stat::DONE | Stat::CRC_ERROR).check_loaded().is_err());
        assert!((Stat::DONE | Stat::ID_ERROR).check_loaded().is_err());
        assert!(Stat::EOS.check_loaded().is_err());
    }

    #[test]
    fn load_configures() {
        let (mut session, _) = testbench::session(Family::Xilinx);
        assert_eq!(read_status(&mut session).unwrap(), Stat::empty());
        let image = testbench::image(Family::Xilinx);
        let mut last = 0;
        let stat = load(&mut session, &mut image.as_slice(), &mut |n| last = n).unwrap();
        assert!(stat.contains(Stat::DONE));
        assert_eq!(last, image.len());
        assert_eq!(session.state(), State::RunTestIdle);
    }

    #[test]
    fn load_from_bitfile() {
        let (mut session, _) = testbench::session(Family::Xilinx);
        let file = bitfile::tests::bitfile(&testbench::image(Family::Xilinx));
        let mut data = bitfile::payload(&file).unwrap();
        load(&mut session, &mut data, &mut |_| {}).unwrap();
    }

    #[test]
    fn image_without_sync_is_critical() {
        let (mut session, _) = testbench::session(Family::Xilinx);
        let err = load(&mut session, &mut [0xFFu8; 64].as_slice(), &mut |_| {}).unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Critical));
        assert!(!read_status(&mut session).unwrap().contains(Stat::DONE));
    }
}
