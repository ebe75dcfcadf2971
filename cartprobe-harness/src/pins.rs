//! Cartridge and cassette port lines as seen in the pin bus register.

/// Width of the pin bus register.
pub const BUS_BYTES: usize = 6;
pub const BUS_BITS: usize = BUS_BYTES * 8;

/// Bit 47 gates the DUT's level shifters onto the port.
pub const BUFFER_ENABLE: u64 = 1 << 47;

#[rustfmt::skip]
const NAMES: [&str; 44] = [
    "SLOT_ADDR0",  "SLOT_ADDR1",  "SLOT_ADDR2",  "SLOT_ADDR3",
    "SLOT_ADDR4",  "SLOT_ADDR5",  "SLOT_ADDR6",  "SLOT_ADDR7",
    "SLOT_ADDR8",  "SLOT_ADDR9",  "SLOT_ADDR10", "SLOT_ADDR11",
    "SLOT_ADDR12", "SLOT_ADDR13", "SLOT_ADDR14", "SLOT_ADDR15",
    "SLOT_DATA0",  "SLOT_DATA1",  "SLOT_DATA2",  "SLOT_DATA3",
    "SLOT_DATA4",  "SLOT_DATA5",  "SLOT_DATA6",  "SLOT_DATA7",
    "SLOT_PHI2",   "SLOT_DOTCLK", "SLOT_RSTn",   "SLOT_RWn",
    "SLOT_BA",     "SLOT_DMAn",   "SLOT_EXROMn", "SLOT_GAMEn",
    "SLOT_ROMHn",  "SLOT_ROMLn",  "SLOT_IO1n",   "SLOT_IO2n",
    "SLOT_IRQn",   "SLOT_NMIn",   "SLOT_VCC",    "",
    "CAS_MOTOR",   "CAS_SENSE",   "CAS_READ",    "CAS_WRITE",
];

/// Name of a pin bus bit; unwired bits get a numeric name.
pub fn name(bit: u8) -> String {
    match NAMES.get(usize::from(bit)) {
        Some(name) if !name.is_empty() => (*name).to_owned(),
        _ => format!("BIT{bit}"),
    }
}

#[rustfmt::skip]
pub const TOP_ROW: &[u8] = &[
    16, 17, 18, 19, 20, 21, 22, 23, 29, 28, 33, 35, 30, 31, 34, 25, 27, 36,
];

#[rustfmt::skip]
pub const BOTTOM_ROW: &[u8] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 24, 37, 26, 32,
];

/// [`BOTTOM_ROW`] minus PHI2, which the DUT cannot drive.
#[rustfmt::skip]
pub const BOTTOM_ROW_OUT: &[u8] = &[
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 37, 26, 32,
];

pub const CASSETTE: &[u8] = &[40, 41, 42, 43];

pub const fn bit(pin: u8) -> u64 {
    1 << pin
}

pub fn mask(pins: &[u8]) -> u64 {
    pins.iter().fold(0, |m, &pin| m | bit(pin))
}

/// Set bit positions of `value`, lowest first.
pub fn ones(value: u64) -> impl Iterator<Item = u8> {
    (0..BUS_BITS as u8).filter(move |&b| value & bit(b) != 0)
}
