use eyre::{Result, WrapErr};
use tracing::{debug, instrument, trace};

use crate::{
    Backend, BitOrder, Fault, ShortHex,
    jtag::{Path, State},
    units::{Bits, Bytes},
    utils::{from_lsb_bytes, to_lsb_bytes},
};

/// Misuse of the driver leaves the TAP out of step with the caller, which is
/// reported like any other desync.
fn desync(msg: impl Into<String>) -> eyre::Report {
    Fault::communication(msg).into()
}

/// Largest burst handed to the adapter in a single shift command.
pub const BURST_LEN: Bytes<usize> = Bytes(16 * 1024);

/// One exclusively-owned adapter session with explicit TAP state tracking.
///
/// Every method blocks until the USB transfer completes. Nothing resets the TAP
/// implicitly: the state on return of each method is documented and kept in
/// [`Session::state`].
pub struct Session<B> {
    backend: B,
    state: State,
    buf: Vec<u8>,
    reverse: Option<Box<[u8; 256]>>,
}

fn reverse_table() -> Box<[u8; 256]> {
    let mut table = Box::new([0; 256]);
    for (idx, entry) in table.iter_mut().enumerate() {
        let mut byte = idx as u8;
        let mut reversed = 0u8;
        for _ in 0..8 {
            reversed = (reversed << 1) | (byte & 1);
            byte >>= 1;
        }
        *entry = reversed;
    }
    table
}

impl<B: Backend> Session<B> {
    /// Wrap an adapter, forcing the TAP through Test-Logic-Reset into
    /// Run-Test/Idle.
    pub fn new(backend: B) -> Result<Self> {
        let mut slf = Self {
            backend,
            state: State::TestLogicReset,
            buf: Vec::new(),
            reverse: None,
        };
        slf.reset()?;
        Ok(slf)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn io<T>(&self, r: Result<T>) -> Result<T> {
        r.wrap_err(Fault::communication(format!(
            "adapter transfer failed in {}",
            self.state
        )))
    }

    fn flush(&mut self) -> Result<Vec<u8>> {
        let r = self.backend.flush(&mut self.buf);
        let data = std::mem::take(&mut self.buf);
        self.io(r)?;
        Ok(data)
    }

    fn queue_tms(&mut self, path: Path, end: State) -> Result<()> {
        if !path.is_empty() {
            let r = self.backend.tms(&mut self.buf, path);
            self.io(r)?;
        }
        self.state = end;
        Ok(())
    }

    fn queue_goto(&mut self, target: State) -> Result<()> {
        if self.state == target {
            return Ok(());
        }
        self.queue_tms(Path::between(self.state, target), target)
    }

    /// Test-Logic-Reset, then Run-Test/Idle.
    #[instrument(skip_all)]
    pub fn reset(&mut self) -> Result<()> {
        debug!("tap reset");
        self.queue_tms(Path::RESET, State::TestLogicReset)?;
        self.queue_tms(
            Path::between(State::TestLogicReset, State::RunTestIdle),
            State::RunTestIdle,
        )?;
        self.flush()?;
        Ok(())
    }

    /// Explicit transition, without shifting data. Staying in a shift state is
    /// how a burst spans several calls.
    pub fn change_state(&mut self, target: State) -> Result<()> {
        trace!(from = %self.state, to = %target, "change state");
        self.queue_goto(target)?;
        self.flush()?;
        Ok(())
    }

    pub fn go_idle(&mut self) -> Result<()> {
        self.change_state(State::RunTestIdle)
    }

    /// Shift an opcode into IR, LSB first. Ends in Run-Test/Idle.
    pub fn write_instruction(&mut self, opcode: u32, len: Bits<u8>) -> Result<()> {
        debug!(opcode = format_args!("{opcode:#X}"), len = len.0, "write ir");
        self.queue_goto(State::ShiftIR)?;
        self.queue_bits_last(&to_lsb_bytes(u64::from(opcode), len.0.into()), len.widen())?;
        self.queue_goto(State::RunTestIdle)?;
        self.flush()?;
        Ok(())
    }

    /// Shift `len` bits of `value` into the selected DR and update it. Ends in
    /// Run-Test/Idle.
    pub fn write_data(&mut self, value: u64, len: Bits<u8>) -> Result<()> {
        if len.0 > 64 {
            return Err(desync(format!("cannot shift {} bits from a u64", len.0)));
        }
        self.queue_goto(State::ShiftDR)?;
        self.queue_bits_last(&to_lsb_bytes(value, len.0.into()), len.widen())?;
        self.queue_goto(State::RunTestIdle)?;
        self.flush()?;
        Ok(())
    }

    /// Capture the selected DR and shift `len` bits out, TDI low. Ends in
    /// Run-Test/Idle.
    pub fn read_data(&mut self, len: Bits<u8>) -> Result<u64> {
        if len.0 > 64 {
            return Err(desync(format!("cannot read {} bits into a u64", len.0)));
        }
        self.queue_goto(State::ShiftDR)?;
        let zeros = vec![0; len.widen().byte_len()];
        self.queue_exchange(&zeros, len.widen())?;
        self.queue_goto(State::UpdateDR)?;
        self.queue_goto(State::RunTestIdle)?;
        let data = self.flush()?;
        self.check_len(&data, len.widen().byte_len())?;
        Ok(from_lsb_bytes(&data))
    }

    /// Full-duplex shift of `len` bits packed LSB-first in `tdi`, returning the
    /// captured bits in the same packing. Enters Shift-DR if needed and stays
    /// there.
    pub fn shift_register(&mut self, tdi: &[u8], len: Bits<usize>) -> Result<Vec<u8>> {
        if tdi.len() < len.byte_len() {
            return Err(desync(format!("{} bytes cannot hold {} bits", tdi.len(), len.0)));
        }
        self.queue_goto(State::ShiftDR)?;
        self.queue_exchange(tdi, len)?;
        let data = self.flush()?;
        self.check_len(&data, len.byte_len())?;
        trace!(tdi = %ShortHex(tdi), tdo = %ShortHex(&data), "shift");
        Ok(data)
    }

    /// Shift `len` bits with the last one on the exit edge, then Update-DR.
    /// Ends in Update-DR.
    pub fn shift_and_update(&mut self, tdi: &[u8], len: Bits<usize>) -> Result<()> {
        if tdi.len() < len.byte_len() {
            return Err(desync(format!("{} bytes cannot hold {} bits", tdi.len(), len.0)));
        }
        self.queue_goto(State::ShiftDR)?;
        self.queue_bits_last(tdi, len)?;
        self.queue_goto(State::UpdateDR)?;
        self.flush()?;
        Ok(())
    }

    /// Transmit-only bulk shift in [`BURST_LEN`] pieces. The TAP must already
    /// be in Shift-DR and stays there, so one logical burst can span calls.
    pub fn stream(&mut self, data: &[u8], order: BitOrder) -> Result<()> {
        if self.state != State::ShiftDR {
            return Err(desync(format!("stream requires ShiftDR, TAP is in {}", self.state)));
        }
        for chunk in data.chunks(BURST_LEN.0) {
            let r = self.backend.tdi_bytes(&mut self.buf, chunk, order, false);
            self.io(r)?;
            self.flush()?;
        }
        Ok(())
    }

    /// `count` TCK pulses with TMS held, no data captured. Only valid in a
    /// stable state.
    pub fn clock_only(&mut self, count: usize) -> Result<()> {
        if !self.state.is_stable() {
            return Err(desync(format!("cannot pump clocks in transient state {}", self.state)));
        }
        trace!(count, "clocks");
        let r = self.backend.clocks(&mut self.buf, count);
        self.io(r)?;
        self.flush()?;
        Ok(())
    }

    /// Reverse the bit order of every byte through the session's cached table.
    pub fn reverse_bits(&mut self, data: &[u8]) -> Vec<u8> {
        let table = self.reverse.get_or_insert_with(reverse_table);
        data.iter().map(|b| table[usize::from(*b)]).collect()
    }

    fn check_len(&self, data: &[u8], expected: usize) -> Result<()> {
        if data.len() != expected {
            return Err(Fault::communication(format!(
                "adapter returned {} bytes, expected {expected}",
                data.len()
            ))
            .into());
        }
        Ok(())
    }

    fn queue_exchange(&mut self, tdi: &[u8], len: Bits<usize>) -> Result<()> {
        let (Bytes(whole), Bits(rest)) = len.as_pair();
        if whole > 0 {
            let r = self.backend.tdi_tdo_bytes(&mut self.buf, &tdi[..whole]);
            self.io(r)?;
        }
        if rest > 0 {
            let r = self
                .backend
                .tdi_tdo_bits(&mut self.buf, tdi[whole], Bits(rest));
            self.io(r)?;
        }
        Ok(())
    }

    /// Queue `len` bits with the final one held for the first edge of the next
    /// TMS path, which must leave the shift state.
    fn queue_bits_last(&mut self, tdi: &[u8], len: Bits<usize>) -> Result<()> {
        if !matches!(self.state, State::ShiftDR | State::ShiftIR) {
            return Err(desync(format!("cannot shift data in {}", self.state)));
        }
        if len.0 == 0 {
            return Err(desync("zero-length shift"));
        }
        let (Bytes(whole), Bits(rest)) = len.as_pair();
        let r = match rest {
            0 => self
                .backend
                .tdi_bytes(&mut self.buf, &tdi[..whole], BitOrder::LsbFirst, true),
            _ => {
                if whole > 0 {
                    let r = self.backend.tdi_bytes(
                        &mut self.buf,
                        &tdi[..whole],
                        BitOrder::LsbFirst,
                        false,
                    );
                    self.io(r)?;
                }
                self.backend
                    .tdi_bits(&mut self.buf, tdi[whole], Bits(rest), true)
            }
        };
        self.io(r)
    }
}
