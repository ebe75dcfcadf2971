use eyre::Result;

use crate::{
    jtag,
    units::{Bits, Bytes},
};

/// Order in which the bits of each byte leave the adapter on a bulk shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

/// A USB-JTAG adapter able to clock the TAP.
///
/// Implementations may queue commands and are only required to execute them on
/// [`Backend::flush`]. Captured TDO data is appended to the buffer handed to
/// `flush`, in the order the reads were queued: whole bytes as shifted
/// (LSB-first), partial reads as one byte with the captured bits right aligned.
///
/// `last` on a TDI shift holds back the final bit so that it is clocked out
/// together with the first TMS edge of the following [`Backend::tms`] call.
pub trait Backend {
    fn tms(&mut self, buf: &mut dyn Buffer, path: jtag::Path) -> Result<()>;

    fn tdi_bytes(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: &[u8],
        order: BitOrder,
        last: bool,
    ) -> Result<()>;

    fn tdi_bits(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: u8,
        len: Bits<usize>,
        last: bool,
    ) -> Result<()>;

    fn tdo_bytes(&mut self, buf: &mut dyn Buffer, len: Bytes<usize>) -> Result<()>;

    fn tdi_tdo_bytes(&mut self, buf: &mut dyn Buffer, tdi: &[u8]) -> Result<()>;

    fn tdi_tdo_bits(&mut self, buf: &mut dyn Buffer, tdi: u8, len: Bits<usize>) -> Result<()>;

    /// Pulse TCK `count` times with TMS held low and no data captured.
    fn clocks(&mut self, buf: &mut dyn Buffer, count: usize) -> Result<()>;

    /// Run any queued IO commands
    fn flush(&mut self, buf: &mut dyn Buffer) -> Result<()>;
}

pub trait Buffer {
    /// Extend the buffer, returning a mutable slice to the newly-allocated
    /// memory
    fn extend(&mut self, size: usize) -> &mut [u8];
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn tms(&mut self, buf: &mut dyn Buffer, path: jtag::Path) -> Result<()> {
        B::tms(&mut *self, buf, path)
    }

    fn tdi_bytes(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: &[u8],
        order: BitOrder,
        last: bool,
    ) -> Result<()> {
        B::tdi_bytes(&mut *self, buf, tdi, order, last)
    }

    fn tdi_bits(
        &mut self,
        buf: &mut dyn Buffer,
        tdi: u8,
        len: Bits<usize>,
        last: bool,
    ) -> Result<()> {
        B::tdi_bits(&mut *self, buf, tdi, len, last)
    }

    fn tdo_bytes(&mut self, buf: &mut dyn Buffer, len: Bytes<usize>) -> Result<()> {
        B::tdo_bytes(&mut *self, buf, len)
    }

    fn tdi_tdo_bytes(&mut self, buf: &mut dyn Buffer, tdi: &[u8]) -> Result<()> {
        B::tdi_tdo_bytes(&mut *self, buf, tdi)
    }

    fn tdi_tdo_bits(&mut self, buf: &mut dyn Buffer, tdi: u8, len: Bits<usize>) -> Result<()> {
        B::tdi_tdo_bits(&mut *self, buf, tdi, len)
    }

    fn clocks(&mut self, buf: &mut dyn Buffer, count: usize) -> Result<()> {
        B::clocks(&mut *self, buf, count)
    }

    fn flush(&mut self, buf: &mut dyn Buffer) -> Result<()> {
        B::flush(&mut *self, buf)
    }
}

impl Buffer for Vec<u8> {
    fn extend(&mut self, size: usize) -> &mut [u8] {
        let len = self.len();
        self.resize(len + size, 0);
        &mut self[len..]
    }
}
