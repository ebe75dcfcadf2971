//! Adapter connection strings and opening the matching USB device.
//!
//! Accepted forms:
//! - `ftdi://ftdi:<chip>/<channel>`, chip one of `232h`, `2232h`, `4232h`,
//!   channel 1-based (0 is accepted as the first channel)
//! - `ftdi://<vid>:<pid>/<channel>` with hexadecimal ids
//! - `<vid>:<pid>` or `<vid>:<pid>/<letter>` with hexadecimal ids

use std::{fmt::Display, str::FromStr};

use eyre::{OptionExt, Result, WrapErr, bail};
use tracing::info;

use crate::{
    Fault,
    ftdi::{
        self,
        devices::{Chip, FTDI_VID, Info, Interface},
    },
};

/// Default TCK frequency.
pub const DEFAULT_FREQUENCY: u32 = 3_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    pub vid: u16,
    pub pid: u16,
    pub interface: Interface,
}

fn hex_id(s: &str) -> Result<u16> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("bad USB id {s:?}"))
}

impl FromStr for Connection {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("ftdi://") {
            let (device, channel) = rest.split_once('/').ok_or_eyre("missing '/<channel>'")?;
            let (vendor, product) = device.split_once(':').ok_or_eyre("missing ':'")?;
            let index: u8 = channel
                .parse()
                .wrap_err_with(|| format!("bad channel {channel:?}"))?;
            let interface = Interface::from_index(index)?;
            let (vid, pid) = match vendor {
                "ftdi" => {
                    let chip = Chip::from_str(product)
                        .wrap_err_with(|| format!("unknown FTDI chip {product:?}"))?;
                    if interface as u8 >= chip.interfaces() {
                        bail!("{chip} has no channel {index}");
                    }
                    (FTDI_VID, chip.pid())
                }
                _ => (hex_id(vendor)?, hex_id(product)?),
            };
            return Ok(Self {
                vid,
                pid,
                interface,
            });
        }

        let (ids, letter) = match s.split_once('/') {
            Some((ids, letter)) => (ids, Some(letter)),
            None => (s, None),
        };
        let (vid, pid) = ids.split_once(':').ok_or_eyre("no ':'")?;
        let interface = match letter {
            Some(letter) => Interface::from_str(letter)
                .wrap_err_with(|| format!("bad interface {letter:?}"))?,
            None => Interface::A,
        };
        Ok(Self {
            vid: hex_id(vid)?,
            pid: hex_id(pid)?,
            interface,
        })
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}:{:04X}/{}", self.vid, self.pid, self.interface)
    }
}

impl Connection {
    /// Open the first matching adapter and configure its MPSSE engine.
    pub fn open(&self, frequency: u32) -> Result<ftdi::Device> {
        self.open_inner(frequency)
            .wrap_err(Fault::communication(format!("cannot open adapter {self}")))
    }

    fn open_inner(&self, frequency: u32) -> Result<ftdi::Device> {
        let handle = smol::block_on(async {
            let device = nusb::list_devices()
                .await?
                .find(|d| d.vendor_id() == self.vid && d.product_id() == self.pid)
                .ok_or_eyre("no such USB device")?;
            Ok::<_, eyre::Report>(device.open().await?)
        })?;
        if self.vid == FTDI_VID && Chip::from_pid(self.pid).is_none() {
            tracing::warn!(pid = self.pid, "unknown FTDI product id, assuming H-series");
        }
        let device = ftdi::Device::new(handle, &Info::plain(self.interface), frequency)?;
        info!(adapter = %self, frequency = device.frequency(), "adapter open");
        Ok(device)
    }
}
