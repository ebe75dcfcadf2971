//! MPSSE JTAG backend for FTDI H-series bridges.

use eyre::{Result, bail};
use tracing::{debug, instrument};

use crate::{
    Backend, BitOrder, Buffer, Hex, SpaceHex, jtag,
    units::{Bits, Bytes},
};

pub mod devices;
mod io;

/// Base clock of the H-series MPSSE engine with the divide-by-5 disabled.
const BASE_CLOCK: u32 = 60_000_000;

pub struct Device {
    io: io::Device,
    last: Option<bool>,
    cmd_buf: Vec<u8>,
    reads: Vec<Read>,
    frequency: u32,
}

/// Shape of one queued read, used to unpack the raw reply.
#[derive(Clone, Copy, Debug)]
enum Read {
    Bytes(usize),
    /// MPSSE shifts partial reads in from the top of the byte.
    Bits(usize),
}

impl Read {
    fn raw_len(self) -> usize {
        match self {
            Read::Bytes(n) => n,
            Read::Bits(_) => 1,
        }
    }
}

#[rustfmt::skip]
mod flags {
    pub const WRITE_NEG : u8 = 0x01;   // Write TDI/DO on negative TCK/SK edge
    pub const BITMODE   : u8 = 0x02;   // Write bits, not bytes
    pub const READ_NEG  : u8 = 0x04;   // Sample TDO/DI on negative TCK/SK edge
    pub const LSB       : u8 = 0x08;   // LSB first
    pub const DO_WRITE  : u8 = 0x10;   // Write TDI/DO
    pub const DO_READ   : u8 = 0x20;   // Read TDO/DI
    pub const WRITE_TMS : u8 = 0x40;   // Write TMS/CS
}
use flags::*;

#[repr(u8)]
#[non_exhaustive]
#[allow(dead_code)]
enum MpsseCommand {
    SetDataBitsLowbyte = 0x80,
    SetDataBitsHighbyte = 0x82,
    DisableLoopback = 0x85,
    SetClockFrequency = 0x86,
    SendImmediate = 0x87,
    DisableClockDivide = 0x8A,
    Disable3PhaseClocking = 0x8D,
    ClockBits = 0x8E,
    ClockBytes = 0x8F,
    DisableAdaptiveClocking = 0x97,
}

// TCK, TDI and TMS driven; TMS idles high.
const JTAG_DBUS_EN: u8 = 0x0B;
const JTAG_DBUS_DATA: u8 = 0x08;

const MAX_READ_WRITE_LEN: usize = u16::MAX as usize + 1;

/// Divisor for the requested TCK, rounded so the real clock never exceeds it.
fn clock_divisor(frequency: u32) -> Result<u16> {
    if frequency == 0 || frequency > BASE_CLOCK / 2 {
        bail!("TCK of {frequency} Hz is out of range");
    }
    let div = (BASE_CLOCK / 2).div_ceil(frequency) - 1;
    u16::try_from(div).map_err(|_| eyre::eyre!("TCK of {frequency} Hz is too slow"))
}

impl Device {
    pub fn new(handle: nusb::Device, info: &devices::Info, frequency: u32) -> Result<Self> {
        let divisor = clock_divisor(frequency)?;
        let io = smol::block_on(io::Device::new(handle, info.interface))?;
        let mut slf = Self {
            io,
            last: None,
            cmd_buf: Vec::new(),
            reads: Vec::new(),
            frequency: BASE_CLOCK / 2 / (u32::from(divisor) + 1),
        };

        let [div_lo, div_hi] = divisor.to_le_bytes();
        slf.cmd_buf.extend_from_slice(&[
            MpsseCommand::DisableClockDivide as u8,
            MpsseCommand::DisableAdaptiveClocking as u8,
            MpsseCommand::Disable3PhaseClocking as u8,
            MpsseCommand::DisableLoopback as u8,
            MpsseCommand::SetDataBitsLowbyte as u8,
            info.dbus_data | JTAG_DBUS_DATA,
            info.dbus_en | JTAG_DBUS_EN,
            MpsseCommand::SetClockFrequency as u8,
            div_lo,
            div_hi,
            MpsseCommand::SetDataBitsHighbyte as u8,
            info.cbus_data,
            info.cbus_en,
        ]);
        let mut sink = Vec::new();
        slf.flush(&mut sink)?;
        debug!(frequency = slf.frequency, "mpsse ready");

        Ok(slf)
    }

    /// Actual TCK frequency after divisor rounding.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    fn maybe_flush(&mut self, buf: &mut dyn Buffer) -> Result<()> {
        let read_len: usize = self.reads.iter().map(|r| r.raw_len()).sum();
        if self.cmd_buf.len() >= MAX_READ_WRITE_LEN || read_len >= MAX_READ_WRITE_LEN {
            self.flush(buf)?;
        }
        Ok(())
    }

    fn check_last(&self) -> Result<()> {
        if self.last.is_some() {
            bail!("held TDI bit must be followed by a TMS path");
        }
        Ok(())
    }

    fn push_len(&mut self, cmd: u8, len: usize) {
        let len = (len - 1) as u16;
        self.cmd_buf.push(cmd);
        self.cmd_buf.extend_from_slice(&len.to_le_bytes());
    }
}

/// WRITE_TMS commands clocking out `path`, at most 7 TMS clocks each.
fn tms_commands(path: jtag::Path, tdi: bool, out: &mut Vec<u8>) {
    let tdi = if tdi { 0x80 } else { 0x00 };
    let mut clocked = path.as_clocked();
    let mut left = path.len;
    while left > 0 {
        let now = left.min(7);
        let mask = (1u8 << now) - 1;
        Extend::extend(out, [WRITE_TMS | LSB | BITMODE | WRITE_NEG, now - 1, tdi | (clocked & mask)]);
        clocked >>= now;
        left -= now;
    }
}

// The last bit of data on TDI goes out together with the first TMS edge. A
// WRITE_TMS command holds TDI at bit 7 of its data byte for all its clocks.
impl Backend for Device {
    #[instrument(skip_all)]
    fn tms(&mut self, buf: &mut dyn Buffer, path: jtag::Path) -> Result<()> {
        let tdi = self.last.take().unwrap_or(false);
        debug!(%path, tdi);
        if path.is_empty() {
            return Ok(());
        }

        tms_commands(path, tdi, &mut self.cmd_buf);
        self.maybe_flush(buf)
    }

    #[instrument(skip_all)]
    fn tdi_bytes(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: &[u8],
        order: BitOrder,
        last: bool,
    ) -> Result<()> {
        self.check_last()?;
        debug!(len = ?Bytes(tdi.len()), ?order, last, data = %SpaceHex(tdi));

        let order = match order {
            BitOrder::LsbFirst => LSB,
            BitOrder::MsbFirst => 0,
        };
        let bytes = DO_WRITE | order | WRITE_NEG;

        let (tdi, last) = match (last, tdi.split_last()) {
            (true, Some((l, data))) => (data, Some(*l)),
            _ => (tdi, None),
        };

        for chunk in tdi.chunks(MAX_READ_WRITE_LEN) {
            self.push_len(bytes, chunk.len());
            self.cmd_buf.extend_from_slice(chunk);
            self.maybe_flush(buf)?;
        }

        if let Some(last) = last {
            // 7 bits now, the 8th with the TMS path
            self.cmd_buf.push(bytes | BITMODE);
            self.cmd_buf.push(6);
            self.cmd_buf.push(last);
            self.last = Some(match order {
                LSB => last & 0x80 != 0,
                _ => last & 0x01 != 0,
            });
        }

        Ok(())
    }

    #[instrument(skip_all)]
    fn tdi_bits(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: u8,
        len: Bits<usize>,
        last: bool,
    ) -> Result<()> {
        self.check_last()?;
        debug!(?len, last, data = %Hex(tdi));
        let Bits(len) = len;
        if !(1..=8).contains(&len) {
            bail!("bit shift of {len} does not fit a byte");
        }

        let now = if last { len - 1 } else { len };
        if now > 0 {
            self.cmd_buf.push(DO_WRITE | LSB | BITMODE | WRITE_NEG);
            self.cmd_buf.push(now as u8 - 1);
            self.cmd_buf.push(tdi);
        }
        if last {
            self.last = Some(tdi >> (len - 1) & 1 != 0);
        }

        self.maybe_flush(buf)
    }

    #[instrument(skip_all)]
    fn tdo_bytes(&mut self, buf: &mut dyn Buffer, len: Bytes<usize>) -> Result<()> {
        self.check_last()?;
        debug!(?len);
        let Bytes(mut len) = len;

        while len != 0 {
            let now = len.min(MAX_READ_WRITE_LEN);
            self.push_len(DO_READ | LSB | READ_NEG | WRITE_NEG, now);
            self.reads.push(Read::Bytes(now));
            len -= now;
            self.maybe_flush(buf)?;
        }

        Ok(())
    }

    #[instrument(skip_all)]
    fn tdi_tdo_bytes(&mut self, buf: &mut dyn Buffer, tdi: &[u8]) -> Result<()> {
        self.check_last()?;
        debug!(len = ?Bytes(tdi.len()), data = %SpaceHex(tdi));

        for chunk in tdi.chunks(MAX_READ_WRITE_LEN) {
            self.push_len(DO_READ | DO_WRITE | LSB | READ_NEG | WRITE_NEG, chunk.len());
            self.cmd_buf.extend_from_slice(chunk);
            self.reads.push(Read::Bytes(chunk.len()));
            self.maybe_flush(buf)?;
        }

        Ok(())
    }

    #[instrument(skip_all)]
    fn tdi_tdo_bits(&mut self, buf: &mut dyn Buffer, tdi: u8, len: Bits<usize>) -> Result<()> {
        self.check_last()?;
        debug!(?len, data = %Hex(tdi));
        let Bits(len) = len;
        if !(1..=8).contains(&len) {
            bail!("bit shift of {len} does not fit a byte");
        }

        self.cmd_buf
            .push(DO_READ | DO_WRITE | LSB | BITMODE | READ_NEG | WRITE_NEG);
        self.cmd_buf.push(len as u8 - 1);
        self.cmd_buf.push(tdi);
        self.reads.push(Read::Bits(len));

        self.maybe_flush(buf)
    }

    #[instrument(skip_all)]
    fn clocks(&mut self, buf: &mut dyn Buffer, count: usize) -> Result<()> {
        self.check_last()?;
        debug!(count);

        let mut bytes = count / 8;
        while bytes != 0 {
            let now = bytes.min(MAX_READ_WRITE_LEN);
            self.push_len(MpsseCommand::ClockBytes as u8, now);
            bytes -= now;
        }
        let rest = count % 8;
        if rest != 0 {
            self.cmd_buf.push(MpsseCommand::ClockBits as u8);
            self.cmd_buf.push(rest as u8 - 1);
        }

        self.maybe_flush(buf)
    }

    #[instrument(skip_all)]
    fn flush(&mut self, buf: &mut dyn Buffer) -> Result<()> {
        if self.cmd_buf.is_empty() {
            return Ok(());
        }
        self.cmd_buf.push(MpsseCommand::SendImmediate as u8);
        let reads = std::mem::take(&mut self.reads);
        let read_len: usize = reads.iter().map(|r| r.raw_len()).sum();
        debug!(
            write_len = self.cmd_buf.len(),
            read_len,
            data = %SpaceHex(&self.cmd_buf),
        );

        let cmd = std::mem::take(&mut self.cmd_buf);
        let mut raw = vec![0; read_len];
        smol::block_on(async {
            self.io.send(&cmd).await?;
            self.io.recv(&mut raw).await
        })?;

        let out = buf.extend(read_len);
        let mut at = 0;
        for read in reads {
            match read {
                Read::Bytes(n) => out[at..at + n].copy_from_slice(&raw[at..at + n]),
                Read::Bits(n) => out[at] = raw[at] >> (8 - n),
            }
            at += read.raw_len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_never_overclocks() {
        assert_eq!(clock_divisor(30_000_000).unwrap(), 0);
        assert_eq!(clock_divisor(3_000_000).unwrap(), 9);
        // 7 MHz is not reachable exactly, 6 MHz is the next step down
        assert_eq!(clock_divisor(7_000_000).unwrap(), 4);
        assert!(clock_divisor(0).is_err());
        assert!(clock_divisor(100).is_err());
    }

    #[test]
    fn tms_commands_clock_first_bit_first() {
        let mut out = Vec::new();
        let path = jtag::Path::between(jtag::State::RunTestIdle, jtag::State::ShiftIR);
        tms_commands(path, true, &mut out);
        assert_eq!(out, [0x4B, 3, 0x80 | 0b0011]);

        let mut out = Vec::new();
        tms_commands(jtag::Path::IDLE, false, &mut out);
        assert_eq!(out, [0x4B, 5, 0b01_1111]);

        let mut out = Vec::new();
        tms_commands(jtag::Path::EMPTY, true, &mut out);
        assert!(out.is_empty());
    }
}
