use std::time::Duration;

use eyre::{Result, bail};
use nusb::transfer::{self, ControlOut, ControlType, Recipient};
use tracing::{instrument, trace};

use crate::{SpaceHex, ftdi::devices::Interface};

pub struct Device {
    iface: nusb::Interface,
    endpoints: Endpoints,
    packet_size: usize,
}

const CHUNK_SIZE: usize = 1024;

/// Status-only packets tolerated in a row before a read is declared starved.
const MAX_EMPTY_READS: usize = 64;

struct Endpoints {
    write: u8,
    read: u8,
}

mod requests {
    pub const RESET: u8 = 0;
    pub const SET_FLOW_CTRL: u8 = 2;
    pub const SET_EVENT_CHAR: u8 = 0x06;
    pub const SET_ERROR_CHAR: u8 = 0x07;
    pub const SET_LATENCY_TIMER: u8 = 0x09;
    pub const SET_BITMODE: u8 = 0x0B;
}

const TIMEOUT: Duration = Duration::from_millis(5000);

/// `bcdDevice` values of the MPSSE-capable high-speed bridges.
const SUPPORTED: &[(u16, &str)] = &[(0x0700, "FT2232H"), (0x0800, "FT4232H"), (0x0900, "FT232H")];

fn determine_max_packet_size(iface: &nusb::Interface) -> usize {
    if let Some(desc) = iface.descriptor()
        && let Some(ep) = desc.endpoints().next()
    {
        ep.max_packet_size()
    } else {
        // high-speed bulk packet size
        512
    }
}

impl Device {
    #[instrument(skip_all)]
    pub async fn new(handle: nusb::Device, interface: Interface) -> Result<Self> {
        let version = handle.device_descriptor().device_version();
        let Some((_, chip)) = SUPPORTED.iter().find(|(v, _)| *v == version) else {
            bail!("unsupported FTDI bridge (bcdDevice {version:#06x}), need an H-series chip");
        };
        tracing::debug!(chip, ?interface, "claiming");

        let _ = handle.detach_kernel_driver(interface.interface());
        let iface = handle.claim_interface(interface.interface()).await?;
        let packet_size = determine_max_packet_size(&iface);

        let slf = Self {
            iface,
            packet_size,
            endpoints: interface.endpoints(),
        };
        slf.init().await?;

        Ok(slf)
    }

    async fn init(&self) -> Result<()> {
        const RESET_SIO: u16 = 0x00;
        self.write_control(requests::RESET, RESET_SIO).await?;
        self.flush_rx().await?;
        self.flush_tx().await?;
        self.write_control(requests::SET_LATENCY_TIMER, 16).await?;

        // high byte is enable, low byte is char (if enabled)
        self.write_control(requests::SET_EVENT_CHAR, 0x00_00).await?;
        self.write_control(requests::SET_ERROR_CHAR, 0x00_00).await?;

        const RTS_CTS: u16 = 0x100;
        let flow_index = RTS_CTS | (u16::from(self.iface.interface_number()) + 1);
        let data = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: requests::SET_FLOW_CTRL,
            value: 0,
            index: flow_index,
            data: &[],
        };
        self.iface.control_out(data, TIMEOUT).await?;

        // reset the MPSSE engine, then enter MPSSE mode; high byte is mode,
        // low byte is pin mask
        self.write_control(requests::SET_BITMODE, 0x00_00).await?;
        self.write_control(requests::SET_BITMODE, 0x02_00).await?;

        Ok(())
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        use futures_lite::AsyncWriteExt;
        let mut writer = self
            .iface
            .endpoint::<transfer::Bulk, transfer::Out>(self.endpoints.write)?
            .writer(CHUNK_SIZE)
            .with_write_timeout(TIMEOUT);
        trace!(len = data.len(), buf = %SpaceHex(data), "writing");
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Fill `buf` completely. Every USB packet from the chip starts with two
    /// modem status bytes which are dropped.
    pub async fn recv(&mut self, mut buf: &mut [u8]) -> Result<()> {
        use futures_lite::AsyncReadExt;

        let original_len = buf.len();
        if original_len == 0 {
            return Ok(());
        }

        let mut reader = self
            .iface
            .endpoint::<transfer::Bulk, transfer::In>(self.endpoints.read)?
            .reader(CHUNK_SIZE)
            .with_read_timeout(TIMEOUT);

        let mut read_buffer = [0; CHUNK_SIZE];
        let num_packets = buf.len().div_ceil(self.packet_size - 2);
        let max_read_len = read_buffer.len().min(buf.len() + num_packets * 2);
        let read_buffer = &mut read_buffer[..max_read_len];

        let mut filled = 0;
        let mut empty_reads = 0;
        while !buf.is_empty() {
            let bytes_read = reader.read(read_buffer).await?;
            trace!(bytes_read, read = %SpaceHex(&read_buffer[..bytes_read]));
            if bytes_read <= 2 {
                empty_reads += 1;
                if empty_reads > MAX_EMPTY_READS {
                    break;
                }
                continue;
            }
            empty_reads = 0;
            for packet in read_buffer[..bytes_read].chunks(self.packet_size) {
                let data = packet.get(2..).unwrap_or_default();
                if data.len() > buf.len() {
                    bail!(
                        "adapter sent {} unexpected bytes",
                        data.len() - buf.len()
                    );
                }
                let (first, rest) = buf.split_at_mut(data.len());
                first.copy_from_slice(data);
                filled += data.len();
                buf = rest;
            }
        }

        if filled != original_len {
            bail!("failed to fill buffer: read {filled} bytes, expected {original_len}");
        }
        Ok(())
    }

    /// Flush the read buffer on the chip
    pub async fn flush_rx(&self) -> Result<()> {
        const TCI_FLUSH: u16 = 2;
        self.write_control(requests::RESET, TCI_FLUSH).await
    }

    /// Flush the write buffer on the chip
    pub async fn flush_tx(&self) -> Result<()> {
        const TCO_FLUSH: u16 = 1;
        self.write_control(requests::RESET, TCO_FLUSH).await
    }

    async fn write_control(&self, request: u8, value: u16) -> Result<()> {
        let data = ControlOut {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index: u16::from(self.iface.interface_number()) + 1,
            data: &[],
        };
        self.iface.control_out(data, TIMEOUT).await?;
        Ok(())
    }
}

impl Interface {
    const fn interface(self) -> u8 {
        self as u8
    }

    const fn endpoints(self) -> Endpoints {
        match self {
            Interface::A => Endpoints {
                write: 0x02,
                read: 0x81,
            },
            Interface::B => Endpoints {
                write: 0x04,
                read: 0x83,
            },
            Interface::C => Endpoints {
                write: 0x06,
                read: 0x85,
            },
            Interface::D => Endpoints {
                write: 0x08,
                read: 0x87,
            },
        }
    }
}
