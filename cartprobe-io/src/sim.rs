//! Bit-level software TAP for tests.
//!
//! [`SimBackend`] clocks every queued command one TCK at a time through the
//! [`State`] graph and hands capture/shift/update events to a [`Target`]
//! describing the device on the other end of the cable.

use eyre::{Result, bail};

use crate::{
    Backend, BitOrder, Buffer,
    jtag::{self, State},
    units::{Bits, Bytes},
};

/// Device model behind a [`SimBackend`].
pub trait Target {
    fn ir_len(&self) -> Bits<u8>;

    /// Value loaded into the IR shift register on Capture-IR.
    fn capture_ir(&self) -> u32 {
        0b01
    }

    fn update_ir(&mut self, ir: u32);

    fn capture_dr(&mut self);

    /// One Shift-DR clock; returns the bit presented on TDO.
    fn shift_dr(&mut self, tdi: bool) -> bool;

    fn update_dr(&mut self);

    /// Test-Logic-Reset entered.
    fn reset(&mut self) {}

    /// One clock spent in Run-Test/Idle.
    fn idle_clock(&mut self) {}
}

/// Plain shift/update register of up to 64 bits.
#[derive(Clone, Debug)]
pub struct Register {
    width: u8,
    stored: u64,
    shift: u64,
}

impl Register {
    pub fn new(width: u8) -> Self {
        assert!((1..=64).contains(&width));
        Self {
            width,
            stored: 0,
            shift: 0,
        }
    }

    pub fn value(&self) -> u64 {
        self.stored
    }

    pub fn set(&mut self, value: u64) {
        self.stored = value & self.mask();
    }

    fn mask(&self) -> u64 {
        u64::MAX >> (64 - self.width)
    }

    pub fn capture(&mut self) {
        self.shift = self.stored;
    }

    pub fn shift(&mut self, tdi: bool) -> bool {
        let out = self.shift & 1 == 1;
        self.shift = (self.shift >> 1) | (u64::from(tdi) << (self.width - 1));
        out
    }

    pub fn update(&mut self) {
        self.stored = self.shift & self.mask();
    }
}

pub struct Cycle {
    pub tms: bool,
    pub tdi: bool,
    pub tdo: bool,
}

pub struct SimBackend<T> {
    target: T,
    state: State,
    ir_shift: u32,
    held: Option<bool>,
    reads: Vec<u8>,
    fail_flush: bool,
    cycles: Option<Vec<Cycle>>,
}

impl<T: Target> SimBackend<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            state: State::TestLogicReset,
            ir_shift: 0,
            held: None,
            reads: Vec::new(),
            fail_flush: false,
            cycles: None,
        }
    }

    /// Record every clock for [`SimBackend::consume_waveform`].
    pub fn with_waveform(mut self) -> Self {
        self.cycles = Some(Vec::new());
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Make the next [`Backend::flush`] fail as if the USB transfer stalled.
    pub fn fail_next_flush(&mut self) {
        self.fail_flush = true;
    }

    pub fn consume_waveform(&mut self) -> String {
        match &mut self.cycles {
            Some(cycles) => {
                let ret = write_cycles(cycles);
                cycles.clear();
                ret
            }
            None => String::new(),
        }
    }

    fn step(&mut self, tms: bool, tdi: bool) -> bool {
        let tdo = match self.state {
            State::ShiftDR => self.target.shift_dr(tdi),
            State::ShiftIR => {
                let len = self.target.ir_len().0;
                let out = self.ir_shift & 1 == 1;
                self.ir_shift = (self.ir_shift >> 1) | (u32::from(tdi) << (len - 1));
                out
            }
            _ => false,
        };

        let next = self.state.next(tms);
        match next {
            State::TestLogicReset if self.state != State::TestLogicReset => self.target.reset(),
            State::RunTestIdle if self.state == State::RunTestIdle => self.target.idle_clock(),
            State::CaptureDR => self.target.capture_dr(),
            State::CaptureIR => self.ir_shift = self.target.capture_ir(),
            State::UpdateDR => self.target.update_dr(),
            State::UpdateIR => {
                let mask = u32::MAX >> (32 - self.target.ir_len().0);
                self.target.update_ir(self.ir_shift & mask);
            }
            _ => {}
        }
        self.state = next;

        if let Some(cycles) = &mut self.cycles {
            cycles.push(Cycle { tms, tdi, tdo });
        }
        tdo
    }

    fn check_held(&self) -> Result<()> {
        if self.held.is_some() {
            bail!("held TDI bit was never clocked out");
        }
        Ok(())
    }

    /// Shift `bits` in order, keeping the final one back when `last` is set.
    fn shift_out(&mut self, bits: impl ExactSizeIterator<Item = bool>, last: bool) -> Result<()> {
        self.check_held()?;
        let len = bits.len();
        for (idx, tdi) in bits.enumerate() {
            if last && idx + 1 == len {
                self.held = Some(tdi);
            } else {
                self.step(false, tdi);
            }
        }
        Ok(())
    }

    fn shift_in(&mut self, bits: impl Iterator<Item = bool>) -> u8 {
        bits.enumerate()
            .fold(0, |acc, (idx, tdi)| acc | u8::from(self.step(false, tdi)) << idx)
    }
}

fn lsb_bits(byte: u8, len: usize) -> impl ExactSizeIterator<Item = bool> {
    (0..len).map(move |idx| byte >> idx & 1 == 1)
}

fn msb_bits(byte: u8) -> impl ExactSizeIterator<Item = bool> {
    (0..8).rev().map(move |idx| byte >> idx & 1 == 1)
}

impl<T: Target> Backend for SimBackend<T> {
    fn tms(&mut self, _buf: &mut dyn Buffer, path: jtag::Path) -> Result<()> {
        for tms in path {
            let tdi = self.held.take().unwrap_or(true);
            self.step(tms, tdi);
        }
        Ok(())
    }

    fn tdi_bytes(
        &mut self,
        _buf: &mut dyn Buffer,
        tdi: &[u8],
        order: BitOrder,
        last: bool,
    ) -> Result<()> {
        let bits: Vec<bool> = match order {
            BitOrder::LsbFirst => tdi.iter().flat_map(|b| lsb_bits(*b, 8)).collect(),
            BitOrder::MsbFirst => tdi.iter().flat_map(|b| msb_bits(*b)).collect(),
        };
        self.shift_out(bits.into_iter(), last)
    }

    fn tdi_bits(
        &mut self,
        _buf: &mut dyn Buffer,
        tdi: u8,
        len: Bits<usize>,
        last: bool,
    ) -> Result<()> {
        if len.0 > 8 {
            bail!("bit shift of {} does not fit a byte", len.0);
        }
        self.shift_out(lsb_bits(tdi, len.0), last)
    }

    fn tdo_bytes(&mut self, _buf: &mut dyn Buffer, len: Bytes<usize>) -> Result<()> {
        self.check_held()?;
        for _ in 0..len.0 {
            let byte = self.shift_in(lsb_bits(0, 8));
            self.reads.push(byte);
        }
        Ok(())
    }

    fn tdi_tdo_bytes(&mut self, _buf: &mut dyn Buffer, tdi: &[u8]) -> Result<()> {
        self.check_held()?;
        for b in tdi {
            let byte = self.shift_in(lsb_bits(*b, 8));
            self.reads.push(byte);
        }
        Ok(())
    }

    fn tdi_tdo_bits(&mut self, _buf: &mut dyn Buffer, tdi: u8, len: Bits<usize>) -> Result<()> {
        self.check_held()?;
        if len.0 > 8 {
            bail!("bit shift of {} does not fit a byte", len.0);
        }
        let byte = self.shift_in(lsb_bits(tdi, len.0));
        self.reads.push(byte);
        Ok(())
    }

    fn clocks(&mut self, _buf: &mut dyn Buffer, count: usize) -> Result<()> {
        self.check_held()?;
        for _ in 0..count {
            self.step(false, false);
        }
        Ok(())
    }

    fn flush(&mut self, buf: &mut dyn Buffer) -> Result<()> {
        if std::mem::take(&mut self.fail_flush) {
            self.reads.clear();
            bail!("simulated USB stall");
        }
        buf.extend(self.reads.len()).copy_from_slice(&self.reads);
        self.reads.clear();
        Ok(())
    }
}

fn write_waveform(
    bits: impl Iterator<Item = bool>,
    start: bool,
    top: &mut String,
    bot: &mut String,
) {
    let mut prev = start;
    for b in bits {
        let (t, u) = match (prev, b) {
            (true, true) => ("──", "  "),
            (true, false) => ("─┐", " └"),
            (false, true) => (" ┌", "─┘"),
            (false, false) => ("  ", "──"),
        };
        top.push_str(t);
        bot.push_str(u);
        prev = b;
    }
}

fn write_cycles(cycles: &[Cycle]) -> String {
    let wave_width = cycles.len() * 2;
    let mut ret = String::from("┌Signals┐┌Waves");
    ret.extend(std::iter::repeat_n('─', wave_width.saturating_sub(5)));
    ret.push_str("┐\n");

    let mut tck_top = String::from("│tck    ││");
    let mut tck_bot = String::from("│       ││");
    tck_top.extend(std::iter::repeat_n("┌┐", cycles.len()));
    tck_bot.extend(std::iter::repeat_n("┘└", cycles.len()));
    ret.push_str(&tck_top);
    ret.push_str("│\n");
    ret.push_str(&tck_bot);
    ret.push_str("│\n");

    let signals: [(&str, fn(&Cycle) -> bool); 3] =
        [("tms", |c| c.tms), ("tdi", |c| c.tdi), ("tdo", |c| c.tdo)];
    for (name, get) in signals {
        let mut top = format!("│{name:<7}││");
        let mut bot = String::from("│       ││");
        write_waveform(cycles.iter().map(get), false, &mut top, &mut bot);
        for line in [top, bot] {
            ret.push_str(&line);
            ret.push_str("│\n");
        }
    }

    ret.push_str("└───────┘└─────");
    ret.extend(std::iter::repeat_n('─', wave_width.saturating_sub(5)));
    ret.push_str("┘\n");
    ret
}
