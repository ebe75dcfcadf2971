//! Lattice ECP5 configuration port.
//!
//! Loading is one continuous `LSC_BITSTREAM_BURST` shift. The configuration
//! engine expects every byte MSB first while the adapter's bulk shift is LSB
//! first, so the image is bit-reversed on the way out.

use std::io::Read;

use bitflags::bitflags;
use cartprobe_io::{Backend, BitOrder, Fault, Session, jtag::State, units::Bits};
use eyre::Result;
use facet::Facet;
use tracing::{debug, info, instrument, warn};

use crate::profile::fill_chunk;

pub const IR_LEN: Bits<u8> = Bits(8);

/// LFE5U-25F
pub const DEFAULT_IDCODE: u32 = 0x4111_1043;

/// Dummy clocks after each command so the engine can finish.
const SETTLE_CLOCKS: usize = 32;

#[rustfmt::skip]
pub mod opcodes {
    pub const READ_ID             : u8 = 0xE0;
    pub const LSC_TRACEID         : u8 = 0x19;
    pub const LSC_READ_STATUS     : u8 = 0x3C;
    pub const ISC_ENABLE          : u8 = 0xC6;
    pub const ISC_DISABLE         : u8 = 0x26;
    pub const ISC_ERASE           : u8 = 0x0E;
    pub const LSC_RESET_CRC       : u8 = 0x3B;
    pub const LSC_BITSTREAM_BURST : u8 = 0x7A;
    pub const LSC_USER1           : u8 = 0x32;
    pub const LSC_USER2           : u8 = 0x38;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const TRANSPARENT     = 1 << 0;
        const JTAG_ACTIVE     = 1 << 4;
        const DONE            = 1 << 8;
        const ISC_ENABLE      = 1 << 9;
        const WRITE_ENABLE    = 1 << 10;
        const READ_ENABLE     = 1 << 11;
        const BUSY            = 1 << 12;
        const FAIL            = 1 << 13;
        const EXECUTION_ERROR = 1 << 26;
        const ID_ERROR        = 1 << 27;
        const INVALID_COMMAND = 1 << 28;
        const SED_ERROR       = 1 << 29;

        const _ = !0;
    }
}

/// Bitstream engine error code, status bits 23..=25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum BseError {
    None = 0,
    Id = 1,
    Command = 2,
    Crc = 3,
    Preamble = 4,
    Abort = 5,
    Overflow = 6,
    Sdm = 7,
}

impl Status {
    pub fn bse_error(self) -> BseError {
        BseError::from_repr((self.bits() >> 23 & 0b111) as u8).unwrap_or(BseError::None)
    }

    /// Before a load only hard failures matter. A stale preamble error from
    /// an empty boot flash is normal.
    pub fn check_ready(self) -> Result<()> {
        if self.intersects(Status::FAIL | Status::EXECUTION_ERROR) {
            return Err(Fault::critical(format!(
                "ECP5 not ready for configuration, status {:08X}",
                self.bits()
            ))
            .into());
        }
        if self.bse_error() != BseError::None {
            info!(bse = %self.bse_error(), "stale bitstream engine error before load");
        }
        Ok(())
    }

    pub fn check_loaded(self) -> Result<()> {
        let ok = self.contains(Status::DONE)
            && !self.intersects(Status::FAIL | Status::EXECUTION_ERROR)
            && self.bse_error() == BseError::None;
        if !ok {
            return Err(Fault::critical(format!(
                "ECP5 configuration failed, status {:08X} (bse error {})",
                self.bits(),
                self.bse_error()
            ))
            .into());
        }
        Ok(())
    }
}

/// Factory trace ID, unique per die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
pub struct TraceId {
    pub raw: u64,
    pub user: u8,
    pub wafer_lot: u32,
    pub wafer: u8,
    pub x: u8,
    pub y: u8,
}

impl From<u64> for TraceId {
    fn from(raw: u64) -> Self {
        Self {
            raw,
            user: (raw >> 56) as u8,
            wafer_lot: (raw >> 24) as u32,
            wafer: (raw >> 19 & 0x1F) as u8,
            x: (raw >> 12 & 0x7F) as u8,
            y: (raw >> 5 & 0x7F) as u8,
        }
    }
}

/// Opcode, one parameter byte, then settle clocks in Run-Test/Idle.
fn command<B: Backend>(session: &mut Session<B>, opcode: u8, param: u8) -> Result<()> {
    session.write_instruction(opcode.into(), IR_LEN)?;
    session.write_data(param.into(), Bits(8))?;
    session.clock_only(SETTLE_CLOCKS)
}

pub fn read_status<B: Backend>(session: &mut Session<B>) -> Result<Status> {
    session.write_instruction(opcodes::LSC_READ_STATUS.into(), IR_LEN)?;
    let status = Status::from_bits_retain(session.read_data(Bits(32))? as u32);
    debug!(status = format_args!("{:08X}", status.bits()), "ecp5 status");
    Ok(status)
}

pub fn read_trace_id<B: Backend>(session: &mut Session<B>) -> Result<TraceId> {
    session.reset()?;
    session.write_instruction(opcodes::LSC_TRACEID.into(), IR_LEN)?;
    let id = TraceId::from(session.read_data(Bits(64))?);
    info!(raw = format_args!("{:016X}", id.raw), "trace id");
    Ok(id)
}

/// Enter configuration mode and wipe the SRAM.
#[instrument(skip_all)]
pub fn clear_configuration<B: Backend>(session: &mut Session<B>) -> Result<Status> {
    session.reset()?;
    command(session, opcodes::ISC_ENABLE, 0)?;
    command(session, opcodes::ISC_ERASE, 0)?;
    command(session, opcodes::LSC_RESET_CRC, 0)?;
    read_status(session)
}

#[instrument(skip_all)]
pub fn load<B: Backend>(
    session: &mut Session<B>,
    image: &mut dyn Read,
    progress: &mut dyn FnMut(usize),
) -> Result<Status> {
    clear_configuration(session)?.check_ready()?;

    info!("streaming bitstream");
    session.write_instruction(opcodes::LSC_BITSTREAM_BURST.into(), IR_LEN)?;
    session.change_state(State::ShiftDR)?;
    let mut chunk = vec![0; cartprobe_io::BURST_LEN.0];
    let mut sent = 0;
    loop {
        let len = fill_chunk(image, &mut chunk)?;
        if len == 0 {
            break;
        }
        let wire = session.reverse_bits(&chunk[..len]);
        session.stream(&wire, BitOrder::LsbFirst)?;
        sent += len;
        progress(sent);
    }
    if sent == 0 {
        warn!("empty bitstream");
    }
    session.change_state(State::UpdateDR)?;

    session.write_instruction(opcodes::ISC_DISABLE.into(), IR_LEN)?;
    session.clock_only(SETTLE_CLOCKS)?;

    let status = read_status(session)?;
    status.check_loaded()?;
    info!(bytes = sent, "ECP5 configured");
    Ok(status)
}

/// USER1 carries the register index in both nibbles, USER2 then exposes it.
/// Leaves the TAP in Shift-DR.
pub fn select_user_register<B: Backend>(session: &mut Session<B>, code: u8) -> Result<()> {
    let code = code & 0x0F;
    session.write_instruction(opcodes::LSC_USER1.into(), IR_LEN)?;
    session.write_data((code | code << 4).into(), Bits(8))?;
    session.write_instruction(opcodes::LSC_USER2.into(), IR_LEN)?;
    session.change_state(State::ShiftDR)
}
