//! Memory bus tunnelled through the design's user data register.
//!
//! The design multiplexes several registers behind one boundary-scan DR. A
//! transfer latches an address into the capture registers through a frame of
//! `(byte, strobe)` pairs, then moves data through the burst-write register
//! or the read FIFO. Every public operation returns with the TAP in
//! Run-Test/Idle.

use cartprobe_io::{
    Backend, BitOrder, Fault, Session, ShortHex, from_lsb_bytes, to_lsb_bytes,
    units::{Bits, Bytes, Words32},
};
use eyre::Result;
use tracing::{debug, trace};

use crate::Profile;

#[rustfmt::skip]
pub mod regs {
    pub const ID         : u8 = 0;
    pub const INPUTS     : u8 = 1;
    pub const OUTPUTS    : u8 = 2;
    pub const DEBUG      : u8 = 3;
    pub const READ_FIFO  : u8 = 4;
    pub const FRAME      : u8 = 5;
    pub const WRITE_DATA : u8 = 6;
    pub const CONSOLE    : u8 = 10;
    pub const CONSOLE_ALT: u8 = 11;
}

/// Strobe codes of the frame register.
#[rustfmt::skip]
pub mod strobe {
    /// Address byte lanes 0..=3.
    pub const ADDR       : [u8; 4] = [4, 5, 6, 7];
    pub const MEMORY     : u8 = 0x01;
    pub const BURST_READ : u8 = 0x03;
    pub const IO_READ    : u8 = 0x0D;
    pub const IO_WRITE   : u8 = 0x0F;

    /// Value sent with [`MEMORY`] to arm a burst write.
    pub const BURST_WRITE: u8 = 0x80;
}

/// Contents of [`regs::ID`] on a healthy design.
pub const USER_ID: u32 = 0xDEAD_1541;

/// Largest burst read, in 32 bit words.
pub const MAX_READ_WORDS: usize = 256;

/// Marks the final byte of a FIFO read.
const LAST_BYTE: u8 = 0xF0;

/// IO space is 24 bits wide.
const IO_LANES: usize = 3;

pub const OUTPUTS_RESET: u8 = 0x00;
pub const OUTPUTS_RUN: u8 = 0x80;

/// Address-space access on the board, whatever carries it.
pub trait RegisterBus {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Read `len` bytes; whole words are transferred and the tail dropped.
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;

    /// Drain up to `max` bytes from a FIFO channel. When the FIFO runs dry
    /// this returns early if `stop_on_empty`, and fails otherwise.
    fn read_fifo(&mut self, max: usize, channel: u8, stop_on_empty: bool) -> Result<Vec<u8>>;

    fn write_io(&mut self, address: u32, data: &[u8]) -> Result<()>;

    fn read_io(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;

    /// Drive the design's output register (CPU reset and friends).
    fn set_outputs(&mut self, value: u8) -> Result<()>;

    fn read_u32(&mut self, address: u32) -> Result<u32> {
        let data = self.read_memory(address, 4)?;
        Ok(from_lsb_bytes(&data) as u32)
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        self.write_memory(address, &value.to_le_bytes())
    }
}

fn address_frame(address: u32, lanes: usize) -> Vec<u8> {
    address
        .to_le_bytes()
        .into_iter()
        .zip(strobe::ADDR)
        .take(lanes)
        .flat_map(|(byte, code)| [byte, code])
        .collect()
}

/// [`RegisterBus`] over a configured FPGA's user register.
pub struct UserBus<'s, B> {
    session: &'s mut Session<B>,
    profile: Profile,
}

impl<'s, B: Backend> UserBus<'s, B> {
    pub fn new(session: &'s mut Session<B>, profile: Profile) -> Self {
        Self { session, profile }
    }

    pub fn session(&mut self) -> &mut Session<B> {
        self.session
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    fn select(&mut self, reg: u8) -> Result<()> {
        trace!(reg, "select user register");
        self.profile.select_user_register(self.session, reg)
    }

    fn read_register(&mut self, reg: u8, len: Bits<u8>) -> Result<u64> {
        self.select(reg)?;
        let zeros = vec![0; len.widen().byte_len()];
        let data = self.session.shift_register(&zeros, len.widen())?;
        self.session.go_idle()?;
        Ok(from_lsb_bytes(&data))
    }

    fn write_register(&mut self, reg: u8, value: u64, len: Bits<u8>) -> Result<()> {
        self.select(reg)?;
        self.session
            .shift_and_update(&to_lsb_bytes(value, len.0.into()), len.widen())?;
        self.session.go_idle()
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        trace!(frame = %ShortHex(frame), "frame");
        self.select(regs::FRAME)?;
        self.session
            .shift_and_update(frame, Bits(frame.len() * 8))
    }

    pub fn read_user_id(&mut self) -> Result<u32> {
        Ok(self.read_register(regs::ID, Bits(32))? as u32)
    }

    /// Fails critically unless the design answers with [`USER_ID`].
    pub fn check_user_id(&mut self) -> Result<()> {
        let id = self.read_user_id()?;
        if id != USER_ID {
            return Err(Fault::critical(format!(
                "user register ID {id:08X}, expected {USER_ID:08X}"
            ))
            .into());
        }
        Ok(())
    }

    pub fn read_inputs(&mut self) -> Result<u16> {
        Ok(self.read_register(regs::INPUTS, Bits(16))? as u16)
    }

    pub fn read_debug(&mut self) -> Result<u32> {
        Ok(self.read_register(regs::DEBUG, Bits(32))? as u32)
    }

    fn fifo(
        &mut self,
        max: usize,
        channel: u8,
        stop_on_empty: bool,
        read_all: bool,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            self.select(channel)?;
            let available = usize::from(self.session.shift_register(&[0], Bits(8))?[0]);
            let remaining = max - out.len();
            let now = match read_all {
                true => remaining,
                false => available.min(remaining),
            };
            if now == 0 {
                if stop_on_empty {
                    break;
                }
                self.session.go_idle()?;
                return Err(Fault::communication(format!(
                    "no read data on channel {channel} after {} of {max} bytes",
                    out.len()
                ))
                .into());
            }
            let mut tdi = vec![0; now];
            tdi[now - 1] = LAST_BYTE;
            let data = self.session.shift_register(&tdi, Bits(now * 8))?;
            out.extend_from_slice(&data);
        }
        self.session.go_idle()?;
        Ok(out)
    }
}

impl<B: Backend> RegisterBus for UserBus<'_, B> {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug!(address = format_args!("{address:#X}"), len = data.len(), "write memory");
        let mut frame = address_frame(address, 4);
        frame.extend([strobe::BURST_WRITE, strobe::MEMORY]);
        self.send_frame(&frame)?;
        self.select(regs::WRITE_DATA)?;
        self.session.stream(data, BitOrder::LsbFirst)?;
        self.session.go_idle()
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        debug!(address = format_args!("{address:#X}"), len, "read memory");
        let Words32(mut words) = Bytes(len).words_ceil();
        let mut out = Vec::with_capacity(Bytes::from(Words32(words)).0);
        let mut address = address;
        while words > 0 {
            let now = words.min(MAX_READ_WORDS);
            let mut frame = address_frame(address, 4);
            frame.extend([(now - 1) as u8, strobe::BURST_READ]);
            self.send_frame(&frame)?;
            let Bytes(burst) = Bytes::from(Words32(now));
            let data = self.fifo(burst, regs::READ_FIFO, false, true)?;
            out.extend_from_slice(&data);
            words -= now;
            address = address.wrapping_add(burst as u32);
        }
        out.truncate(len);
        Ok(out)
    }

    fn read_fifo(&mut self, max: usize, channel: u8, stop_on_empty: bool) -> Result<Vec<u8>> {
        self.fifo(max, channel, stop_on_empty, false)
    }

    fn write_io(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug!(address = format_args!("{address:#X}"), data = %ShortHex(data), "write io");
        let mut frame = address_frame(address, IO_LANES);
        frame.extend(data.iter().flat_map(|b| [*b, strobe::IO_WRITE]));
        self.send_frame(&frame)?;
        self.session.go_idle()
    }

    fn read_io(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut frame = address_frame(address, IO_LANES);
        frame.extend(std::iter::repeat_n([0, strobe::IO_READ], len).flatten());
        self.send_frame(&frame)?;
        let data = self.fifo(len, regs::READ_FIFO, false, false)?;
        debug!(address = format_args!("{address:#X}"), data = %ShortHex(&data), "read io");
        Ok(data)
    }

    fn set_outputs(&mut self, value: u8) -> Result<()> {
        debug!(value = format_args!("{value:#04X}"), "outputs");
        self.write_register(regs::OUTPUTS, value.into(), Bits(8))
    }
}

#[cfg(test)]
mod tests {
    use cartprobe_io::{FaultExt, FaultKind, jtag::State};

    use super::*;
    use crate::{
        Family,
        testbench::{self, SimSession},
    };

    fn block(seed: u8, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed) ^ 0x5A)
            .collect()
    }

    fn for_both(mut f: impl FnMut(&mut SimSession, Profile)) {
        for family in [Family::Lattice, Family::Xilinx] {
            let (mut session, profile) = testbench::session(family);
            f(&mut session, profile);
        }
    }

    #[test]
    fn frame_layout() {
        assert_eq!(
            address_frame(0x1234_5678, 4),
            [0x78, 4, 0x56, 5, 0x34, 6, 0x12, 7]
        );
        assert_eq!(address_frame(0x10_0100, 3), [0x00, 4, 0x01, 5, 0x10, 6]);
    }

    #[test]
    fn memory_round_trip() {
        for_both(|session, profile| {
            let data = block(3, 64);
            let mut bus = UserBus::new(session, profile);
            bus.write_memory(0x4000, &data).unwrap();
            assert_eq!(bus.read_memory(0x4000, 64).unwrap(), data);
            assert_eq!(bus.read_memory(0x4004, 6).unwrap(), data[4..10]);
            assert_eq!(session.state(), State::RunTestIdle);
            assert_eq!(testbench::design(session).memory_byte(0x403F), data[63]);
        });
    }

    #[test]
    fn long_reads_are_chunked() {
        for_both(|session, profile| {
            let data = block(11, 1100);
            testbench::design(session).fill_memory(0x8000, &data);
            let mut bus = UserBus::new(session, profile);
            assert_eq!(bus.read_memory(0x8000, 1100).unwrap(), data);
        });
    }

    #[test]
    fn words() {
        for_both(|session, profile| {
            let mut bus = UserBus::new(session, profile);
            bus.write_u32(0x100, 0x8765_4321).unwrap();
            assert_eq!(bus.read_u32(0x100).unwrap(), 0x8765_4321);
            assert_eq!(bus.read_memory(0x100, 4).unwrap(), [0x21, 0x43, 0x65, 0x87]);
            bus.write_memory(0x200, &[]).unwrap();
            assert!(bus.read_memory(0x200, 0).unwrap().is_empty());
        });
    }

    #[test]
    fn empty_fifo() {
        for_both(|session, profile| {
            let mut bus = UserBus::new(session, profile);
            assert!(bus.read_fifo(10, regs::CONSOLE, true).unwrap().is_empty());
            let err = bus.read_fifo(10, regs::CONSOLE, false).unwrap_err();
            assert_eq!(err.fault_kind(), Some(FaultKind::Communication));
            assert_eq!(session.state(), State::RunTestIdle);
        });
    }

    #[test]
    fn console_drains() {
        for_both(|session, profile| {
            testbench::design(session).push_fifo(regs::CONSOLE, b"boot ok\n");
            let mut bus = UserBus::new(session, profile);
            assert_eq!(bus.read_fifo(1000, regs::CONSOLE, true).unwrap(), b"boot ok\n");
            assert!(bus.read_fifo(1000, regs::CONSOLE, true).unwrap().is_empty());
        });
    }

    #[test]
    fn fifo_respects_max() {
        for_both(|session, profile| {
            testbench::design(session).push_fifo(regs::CONSOLE_ALT, b"0123456789");
            let mut bus = UserBus::new(session, profile);
            assert_eq!(bus.read_fifo(4, regs::CONSOLE_ALT, true).unwrap(), b"0123");
            assert_eq!(
                bus.read_fifo(100, regs::CONSOLE_ALT, true).unwrap(),
                b"456789"
            );
        });
    }

    #[test]
    fn io_space() {
        for_both(|session, profile| {
            let mut bus = UserBus::new(session, profile);
            bus.write_io(0x10_0100, &[0x11, 0x22, 0x33]).unwrap();
            assert_eq!(bus.read_io(0x10_0101, 2).unwrap(), [0x22, 0x33]);
            assert!(bus.read_io(0x10_0100, 0).unwrap().is_empty());
            assert_eq!(testbench::design(session).io_byte(0x10_0102), 0x33);
        });
    }

    #[test]
    fn small_registers() {
        for_both(|session, profile| {
            let design = testbench::design(session);
            design.inputs = 0xBEEF;
            design.debug = 0x0102_0304;
            let mut bus = UserBus::new(session, profile);
            bus.set_outputs(OUTPUTS_RUN).unwrap();
            bus.check_user_id().unwrap();
            assert_eq!(bus.read_inputs().unwrap(), 0xBEEF);
            assert_eq!(bus.read_debug().unwrap(), 0x0102_0304);
            assert_eq!(testbench::design(session).outputs, OUTPUTS_RUN);
        });
    }

    #[test]
    fn wrong_user_id_is_critical() {
        let (mut session, profile) = testbench::session(Family::Lattice);
        testbench::design(&mut session).id = 0xFFFF_FFFF;
        let err = UserBus::new(&mut session, profile)
            .check_user_id()
            .unwrap_err();
        assert_eq!(err.fault_kind(), Some(FaultKind::Critical));
    }
}
