use eyre::{Result, bail};

pub const FTDI_VID: u16 = 0x0403;

/// MPSSE-capable FTDI bridges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(ascii_case_insensitive)]
pub enum Chip {
    #[strum(serialize = "232h")]
    Ft232h,
    #[strum(serialize = "2232h")]
    Ft2232h,
    #[strum(serialize = "4232h")]
    Ft4232h,
}

impl Chip {
    pub const fn pid(self) -> u16 {
        match self {
            Chip::Ft232h => 0x6014,
            Chip::Ft2232h => 0x6010,
            Chip::Ft4232h => 0x6011,
        }
    }

    pub const fn interfaces(self) -> u8 {
        match self {
            Chip::Ft232h => 1,
            Chip::Ft2232h => 2,
            Chip::Ft4232h => 4,
        }
    }

    pub fn from_pid(pid: u16) -> Option<Self> {
        [Chip::Ft232h, Chip::Ft2232h, Chip::Ft4232h]
            .into_iter()
            .find(|c| c.pid() == pid)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(ascii_case_insensitive)]
pub enum Interface {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
}

impl Interface {
    /// Interface from a 1-based channel number; 0 means the first channel.
    pub fn from_index(index: u8) -> Result<Self> {
        Ok(match index {
            0 | 1 => Interface::A,
            2 => Interface::B,
            3 => Interface::C,
            4 => Interface::D,
            _ => bail!("no FTDI channel {index}"),
        })
    }
}

/// Pin setup of one MPSSE channel. The JTAG pins (TCK, TDI, TMS as outputs,
/// TMS idling high) are always added on top of `dbus_*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Info {
    pub interface: Interface,
    pub(super) dbus_data: u8,
    pub(super) dbus_en: u8,
    pub(super) cbus_data: u8,
    pub(super) cbus_en: u8,
}

impl Info {
    pub const fn new(
        interface: Interface,
        dbus_data: u8,
        dbus_en: u8,
        cbus_data: u8,
        cbus_en: u8,
    ) -> Self {
        Self {
            interface,
            dbus_data,
            dbus_en,
            cbus_data,
            cbus_en,
        }
    }

    /// Bare JTAG on the given channel, every other pin an input.
    pub const fn plain(interface: Interface) -> Self {
        Self::new(interface, 0x00, 0x00, 0x00, 0x00)
    }
}
