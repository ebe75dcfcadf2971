use std::io::{ErrorKind, Read};

use cartprobe_io::{Backend, BitOrder, Fault, Session, units::Bits};
use eyre::{Result, WrapErr};
use tracing::info;

use crate::{lattice, xilinx};

/// FPGA vendor family, as chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Family {
    /// Lattice ECP5, 8 bit IR
    Lattice,
    /// Xilinx 7-series, 6 bit IR
    Xilinx,
}

/// Everything that differs between the two supported FPGA families. Immutable
/// once a session is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Ecp5 { expected_id: u32 },
    Series7 { expected_id: u32 },
}

/// The version nibble changes between silicon revisions.
const ID_MASK: u32 = 0x0FFF_FFFF;

impl Profile {
    pub const fn new(family: Family) -> Self {
        match family {
            Family::Lattice => Profile::Ecp5 {
                expected_id: lattice::DEFAULT_IDCODE,
            },
            Family::Xilinx => Profile::Series7 {
                expected_id: xilinx::DEFAULT_IDCODE,
            },
        }
    }

    pub const fn with_expected_id(self, id: u32) -> Self {
        match self {
            Profile::Ecp5 { .. } => Profile::Ecp5 { expected_id: id },
            Profile::Series7 { .. } => Profile::Series7 { expected_id: id },
        }
    }

    pub const fn family(self) -> Family {
        match self {
            Profile::Ecp5 { .. } => Family::Lattice,
            Profile::Series7 { .. } => Family::Xilinx,
        }
    }

    pub const fn ir_len(self) -> Bits<u8> {
        match self {
            Profile::Ecp5 { .. } => lattice::IR_LEN,
            Profile::Series7 { .. } => xilinx::IR_LEN,
        }
    }

    /// Bit order of configuration bytes on the wire.
    pub const fn bit_order(self) -> BitOrder {
        match self {
            Profile::Ecp5 { .. } => BitOrder::LsbFirst,
            Profile::Series7 { .. } => BitOrder::MsbFirst,
        }
    }

    pub const fn expected_id(self) -> u32 {
        match self {
            Profile::Ecp5 { expected_id } | Profile::Series7 { expected_id } => expected_id,
        }
    }

    /// ID code of a freshly reset TAP.
    pub fn read_id<B: Backend>(self, session: &mut Session<B>) -> Result<u32> {
        session.reset()?;
        Ok(session.read_data(Bits(32))? as u32)
    }

    /// [`Profile::read_id`], failing critically unless it is the expected part.
    pub fn identify<B: Backend>(self, session: &mut Session<B>) -> Result<u32> {
        let id = self.read_id(session)?;
        if id & ID_MASK != self.expected_id() & ID_MASK {
            return Err(Fault::critical(format!(
                "found ID code {id:08X}, expected {:08X} ({})",
                self.expected_id(),
                self.family()
            ))
            .into());
        }
        info!(id = format_args!("{id:08X}"), family = %self.family(), "device identified");
        Ok(id)
    }

    /// Raw status word: ECP5 status register or 7-series STAT.
    pub fn read_status<B: Backend>(self, session: &mut Session<B>) -> Result<u32> {
        Ok(match self {
            Profile::Ecp5 { .. } => lattice::read_status(session)?.bits(),
            Profile::Series7 { .. } => xilinx::read_status(session)?.bits(),
        })
    }

    /// Configure the FPGA from `image`. `progress` receives the running byte
    /// count after every chunk. Returns the final status word.
    pub fn load_configuration<B: Backend>(
        self,
        session: &mut Session<B>,
        image: &mut dyn Read,
        progress: &mut dyn FnMut(usize),
    ) -> Result<u32> {
        Ok(match self {
            Profile::Ecp5 { .. } => lattice::load(session, image, progress)?.bits(),
            Profile::Series7 { .. } => xilinx::load(session, image, progress)?.bits(),
        })
    }

    /// Point the design's user data register at `code`. Leaves the TAP in
    /// Shift-DR with the register's first bit next on TDO.
    pub fn select_user_register<B: Backend>(
        self,
        session: &mut Session<B>,
        code: u8,
    ) -> Result<()> {
        match self {
            Profile::Ecp5 { .. } => lattice::select_user_register(session, code),
            Profile::Series7 { .. } => xilinx::select_user_register(session, code),
        }
    }
}

/// Fill `buf` from `reader` as far as possible; short only at end of input.
pub(crate) fn fill_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e).wrap_err("reading image"),
        }
    }
    Ok(filled)
}
