//! IO space of the board design. These addresses are fixed by the FPGA
//! image and the application firmware.

#[rustfmt::skip]
pub mod ddr {
    pub const BASE            : u32 = 0x10_0100;
    pub const ADDR_LOW        : u32 = BASE;
    pub const ADDR_HIGH       : u32 = BASE + 1;
    pub const CMD             : u32 = BASE + 2;
    pub const DELAY_UPDOWN    : u32 = BASE + 3;
    pub const DELAY_SEL_DATA_0: u32 = BASE + 4;
    pub const DELAY_SEL_DATA_1: u32 = BASE + 5;
    pub const DELAY_SEL_DQS   : u32 = BASE + 6;
    pub const BITSLIP         : u32 = BASE + 7;
    pub const READ_DELAY      : u32 = BASE + 8;
    pub const DQS_INVERT      : u32 = BASE + 9;
    pub const CONTROL         : u32 = BASE + 12;

    /// Read side of [`ADDR_LOW`].
    pub const RID             : u32 = BASE;
    /// Read side of [`DELAY_SEL_DATA_0`]: one training sample per lane.
    pub const RDQS            : u32 = BASE + 4;
}

/// Cartridge port lines, one bit per pin.
pub const PIN_DATA: u32 = 0x10_0300;
/// Direction of each [`PIN_DATA`] bit, set = output.
pub const PIN_DIR: u32 = 0x10_0308;

/// SPI flash bridge: shifted byte.
pub const FLASH_DATA: u32 = 0x6_0200;
/// SPI flash bridge: chip select control.
pub const FLASH_CTRL: u32 = 0x6_0208;

/// Four counter words for the 50 MHz reference.
pub const CLOCK_REF: u32 = 0x10_0400;
/// Four counter words for the board oscillator.
pub const CLOCK_OSC: u32 = 0x10_0500;

pub const REVISION: u32 = 0x10_000C;

/// Memory mailbox polled by the boot loader: entry point, then [`BOOT_MAGIC`].
pub const BOOT_MAILBOX: u32 = 0xFFF8;
pub const BOOT_MAGIC: u32 = 0x1571_BABE;
