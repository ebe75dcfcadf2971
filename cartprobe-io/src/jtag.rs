//! IEEE 1149.1 TAP controller state graph and the TMS sequences between states.

use std::{collections::VecDeque, fmt::Display, sync::LazyLock};

use strum::VariantArray;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::VariantArray, strum::Display)]
#[repr(u8)]
pub enum State {
    TestLogicReset,
    RunTestIdle,
    SelectDR,
    CaptureDR,
    ShiftDR,
    Exit1DR,
    PauseDR,
    Exit2DR,
    UpdateDR,
    SelectIR,
    CaptureIR,
    ShiftIR,
    Exit1IR,
    PauseIR,
    Exit2IR,
    UpdateIR,
}

const STATES: usize = State::VARIANTS.len();

impl State {
    /// State reached after one TCK edge with the given TMS level.
    pub const fn next(self, tms: bool) -> State {
        use State::*;
        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true) => TestLogicReset,
            (RunTestIdle, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDR,
            (SelectDR, false) => CaptureDR,
            (SelectDR, true) => SelectIR,
            (CaptureDR, false) | (ShiftDR, false) | (Exit2DR, false) => ShiftDR,
            (CaptureDR, true) | (ShiftDR, true) => Exit1DR,
            (Exit1DR, false) | (PauseDR, false) => PauseDR,
            (Exit1DR, true) | (Exit2DR, true) => UpdateDR,
            (PauseDR, true) => Exit2DR,
            (UpdateDR, false) | (UpdateIR, false) => RunTestIdle,
            (UpdateDR, true) | (UpdateIR, true) => SelectDR,
            (SelectIR, false) => CaptureIR,
            (SelectIR, true) => TestLogicReset,
            (CaptureIR, false) | (ShiftIR, false) | (Exit2IR, false) => ShiftIR,
            (CaptureIR, true) | (ShiftIR, true) => Exit1IR,
            (Exit1IR, false) | (PauseIR, false) => PauseIR,
            (Exit1IR, true) | (Exit2IR, true) => UpdateIR,
            (PauseIR, true) => Exit2IR,
        }
    }

    /// States in which the TAP may be parked while clocking with TMS held.
    pub const fn is_stable(self) -> bool {
        matches!(
            self,
            State::TestLogicReset
                | State::RunTestIdle
                | State::ShiftDR
                | State::PauseDR
                | State::ShiftIR
                | State::PauseIR
        )
    }
}

/// A TMS sequence of up to 8 clocks, first clock in the most significant used
/// bit of `path`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Path {
    path: u8,
    pub len: u8,
}

impl Path {
    /// Transition to TLR, from any state
    pub const RESET: Self = Self { path: 0x1f, len: 5 };
    /// Transition to RTI, from any state
    pub const IDLE: Self = Self { path: 0x3e, len: 6 };
    pub const EMPTY: Self = Self { path: 0, len: 0 };

    /// TMS bits in clocking order, LSB first, as MPSSE TMS commands expect.
    pub const fn as_clocked(self) -> u8 {
        if self.len == 0 {
            return 0;
        }
        self.path.reverse_bits() >> (8 - self.len)
    }

    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Shortest TMS sequence from `start` to `end`.
    pub fn between(start: State, end: State) -> Self {
        PATHS[start as usize][end as usize]
    }

    fn push(self, tms: bool) -> Self {
        Self {
            path: (self.path << 1) | tms as u8,
            len: self.len + 1,
        }
    }
}

static PATHS: LazyLock<[[Path; STATES]; STATES]> = LazyLock::new(|| {
    let mut ret = [[Path::EMPTY; STATES]; STATES];
    for start in State::VARIANTS {
        for end in State::VARIANTS {
            ret[*start as usize][*end as usize] = search(*start, *end);
        }
    }
    ret
});

/// Breadth-first search. A state never maps to itself with an empty path:
/// `RunTestIdle -> RunTestIdle` is one clock with TMS low, which callers rely
/// on when they explicitly ask to re-enter a state.
fn search(start: State, end: State) -> Path {
    let mut queue = VecDeque::from([
        (Path::EMPTY.push(false), start.next(false)),
        (Path::EMPTY.push(true), start.next(true)),
    ]);
    while let Some((path, at)) = queue.pop_front() {
        if at == end {
            return path;
        }
        queue.push_back((path.push(false), at.next(false)));
        queue.push_back((path.push(true), at.next(true)));
    }
    unreachable!("TAP state graph is strongly connected")
}

impl Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write as _;
        for bit in *self {
            f.write_char(if bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

impl IntoIterator for Path {
    type Item = bool;
    type IntoIter = PathIter;
    fn into_iter(self) -> Self::IntoIter {
        PathIter(self, 0)
    }
}

pub struct PathIter(Path, u8);
impl Iterator for PathIter {
    type Item = bool;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.1;
        self.1 = self.1.saturating_add(1);
        if idx < self.0.len {
            Some(self.0.path >> (self.0.len - idx - 1) & 1 == 1)
        } else {
            None
        }
    }
}
