//! Factory test routines for the cartridge board, written against
//! [`RegisterBus`] so they run over any configured FPGA.

pub mod board;
pub mod continuity;
pub mod ddr2;
pub mod flash;
pub mod pins;
pub mod regmap;
#[cfg(test)]
mod testbus;

pub use cartprobe_fpga::RegisterBus;
