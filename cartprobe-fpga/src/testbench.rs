//! Simulated ECP5 and 7-series TAPs hosting a model of the board design.

use std::collections::{HashMap, VecDeque};

use cartprobe_io::{
    Session,
    sim::{Register, SimBackend, Target},
    units::Bits,
};

use crate::{
    Family, Profile, lattice,
    userbus::{USER_ID, regs, strobe},
    xilinx::{
        self,
        registers::{Addr, Type1},
    },
};

pub type SimSession = Session<SimBackend<SimFpga>>;

/// The FPGA design behind the user data register.
pub struct Design {
    selected: u8,
    pub id: u32,
    pub inputs: u16,
    pub outputs: u8,
    pub debug: u32,
    memory: HashMap<u32, u8>,
    io: HashMap<u32, u8>,
    fifos: HashMap<u8, VecDeque<u8>>,
    address: u32,
    write_ptr: u32,
    tdo: VecDeque<bool>,
    tdi: Vec<bool>,
}

fn pack(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|c| c.iter().enumerate().fold(0, |acc, (i, b)| acc | u8::from(*b) << i))
        .collect()
}

impl Design {
    fn new() -> Self {
        Self {
            selected: 0,
            id: USER_ID,
            inputs: 0,
            outputs: 0,
            debug: 0,
            memory: HashMap::new(),
            io: HashMap::new(),
            fifos: HashMap::new(),
            address: 0,
            write_ptr: 0,
            tdo: VecDeque::new(),
            tdi: Vec::new(),
        }
    }

    pub fn fill_memory(&mut self, address: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address + offset as u32, *byte);
        }
    }

    pub fn memory_byte(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    pub fn io_byte(&self, address: u32) -> u8 {
        self.io.get(&address).copied().unwrap_or(0)
    }

    pub fn push_fifo(&mut self, channel: u8, data: &[u8]) {
        self.fifos.entry(channel).or_default().extend(data);
    }

    fn select(&mut self, reg: u8) {
        self.selected = reg;
    }

    fn capture(&mut self) {
        self.tdi.clear();
        let bytes = match self.selected {
            regs::ID => self.id.to_le_bytes().to_vec(),
            regs::INPUTS => self.inputs.to_le_bytes().to_vec(),
            regs::OUTPUTS => vec![self.outputs],
            regs::DEBUG => self.debug.to_le_bytes().to_vec(),
            ch @ (regs::READ_FIFO | regs::CONSOLE | regs::CONSOLE_ALT) => {
                let fifo = self.fifos.entry(ch).or_default();
                let mut out = vec![fifo.len().min(255) as u8];
                out.extend(fifo.iter());
                out
            }
            _ => Vec::new(),
        };
        self.tdo = bytes
            .iter()
            .flat_map(|b| (0..8).map(move |i| b >> i & 1 == 1))
            .collect();
    }

    fn shift(&mut self, tdi: bool) -> bool {
        self.tdi.push(tdi);
        let out = self.tdo.pop_front().unwrap_or(false);
        let n = self.tdi.len();
        if n % 8 == 0 {
            match self.selected {
                // the count byte goes first, every later byte leaves the FIFO
                ch @ (regs::READ_FIFO | regs::CONSOLE | regs::CONSOLE_ALT) if n > 8 => {
                    self.fifos.entry(ch).or_default().pop_front();
                }
                regs::WRITE_DATA => {
                    let byte = pack(&self.tdi[n - 8..])[0];
                    self.memory.insert(self.write_ptr, byte);
                    self.write_ptr += 1;
                }
                _ => {}
            }
        }
        out
    }

    fn update(&mut self) {
        let bytes = pack(&self.tdi);
        match self.selected {
            regs::OUTPUTS => {
                if let Some(b) = bytes.first() {
                    self.outputs = *b;
                }
            }
            regs::FRAME => {
                for pair in bytes.chunks_exact(2) {
                    self.strobe(pair[0], pair[1]);
                }
            }
            _ => {}
        }
    }

    fn strobe(&mut self, value: u8, code: u8) {
        match code {
            4..=7 => {
                let shift = u32::from(code - 4) * 8;
                self.address = self.address & !(0xFF << shift) | u32::from(value) << shift;
            }
            strobe::MEMORY if value == strobe::BURST_WRITE => self.write_ptr = self.address,
            strobe::BURST_READ => {
                let len = (u32::from(value) + 1) * 4;
                let data: Vec<u8> = (0..len)
                    .map(|i| self.memory_byte(self.address + i))
                    .collect();
                self.push_fifo(regs::READ_FIFO, &data);
            }
            strobe::IO_WRITE => {
                self.io.insert(self.address & 0xFF_FFFF, value);
                self.address += 1;
            }
            strobe::IO_READ => {
                let byte = self.io_byte(self.address & 0xFF_FFFF);
                self.push_fifo(regs::READ_FIFO, &[byte]);
                self.address += 1;
            }
            _ => {}
        }
    }
}

const ECP5_PREAMBLE: [u8; 4] = [0xFF, 0xFF, 0xBD, 0xB3];

/// Status bits, see [`lattice::Status`].
const ECP5_DONE: u32 = 1 << 8 | 1 << 4;
const ECP5_ISC_ENABLE: u32 = 1 << 9;
const ECP5_FAIL_CRC: u32 = 1 << 13 | 3 << 23;
const ECP5_BSE_PREAMBLE: u32 = 4 << 23;

struct Ecp5 {
    ir: u8,
    idcode: Register,
    status: Register,
    trace: Register,
    param: Register,
    user1: Register,
    bypass: Register,
    burst: Vec<u8>,
    burst_bits: usize,
}

impl Ecp5 {
    fn new() -> Self {
        let mut idcode = Register::new(32);
        idcode.set(lattice::DEFAULT_IDCODE.into());
        let mut status = Register::new(32);
        status.set(ECP5_BSE_PREAMBLE.into());
        let mut trace = Register::new(64);
        trace.set(TRACE_ID);
        Self {
            ir: lattice::opcodes::READ_ID,
            idcode,
            status,
            trace,
            param: Register::new(8),
            user1: Register::new(8),
            bypass: Register::new(1),
            burst: Vec::new(),
            burst_bits: 0,
        }
    }

    fn dr(&mut self) -> Option<&mut Register> {
        use lattice::opcodes::*;
        Some(match self.ir {
            READ_ID => &mut self.idcode,
            LSC_READ_STATUS => &mut self.status,
            LSC_TRACEID => &mut self.trace,
            ISC_ENABLE | ISC_ERASE | LSC_RESET_CRC => &mut self.param,
            LSC_USER1 => &mut self.user1,
            LSC_BITSTREAM_BURST | LSC_USER2 => return None,
            _ => &mut self.bypass,
        })
    }

    fn set_status(&mut self, f: impl FnOnce(u32) -> u32) {
        let status = f(self.status.value() as u32);
        self.status.set(status.into());
    }
}

pub const TRACE_ID: u64 = 0x5A12_3456_7811_6428;

struct Series7 {
    ir: u8,
    idcode: Register,
    cfg_out: Register,
    bypass: Register,
    cfg_in: Vec<bool>,
    stat: u32,
    configured: bool,
    user4: User4,
}

/// Phase of a USER4 scan.
enum User4 {
    Flag,
    Select { bits: u8, code: u8 },
    Data,
}

impl Series7 {
    fn new() -> Self {
        let mut idcode = Register::new(32);
        // silicon revision 1
        idcode.set((xilinx::DEFAULT_IDCODE | 0x1000_0000).into());
        Self {
            ir: xilinx::opcodes::IDCODE,
            idcode,
            cfg_out: Register::new(32),
            bypass: Register::new(1),
            cfg_in: Vec::new(),
            stat: 0,
            configured: false,
            user4: User4::Flag,
        }
    }

    fn cfg_in_bytes(&self) -> Vec<u8> {
        self.cfg_in
            .chunks(8)
            .map(|c| c.iter().fold(0, |acc, b| acc << 1 | u8::from(*b)))
            .collect()
    }
}

enum Tap {
    Ecp5(Ecp5),
    Series7(Series7),
}

pub struct SimFpga {
    tap: Tap,
    pub design: Design,
}

impl Target for SimFpga {
    fn ir_len(&self) -> Bits<u8> {
        match self.tap {
            Tap::Ecp5(_) => lattice::IR_LEN,
            Tap::Series7(_) => xilinx::IR_LEN,
        }
    }

    fn update_ir(&mut self, ir: u32) {
        match &mut self.tap {
            Tap::Ecp5(t) => {
                t.ir = ir as u8;
                if t.ir == lattice::opcodes::ISC_DISABLE {
                    let ok = t.burst.windows(4).any(|w| w == ECP5_PREAMBLE);
                    t.set_status(|s| match ok {
                        true => s & !(ECP5_ISC_ENABLE | 0b111 << 23) | ECP5_DONE,
                        false => s & !ECP5_ISC_ENABLE | ECP5_FAIL_CRC,
                    });
                }
            }
            Tap::Series7(t) => {
                t.ir = ir as u8;
                match t.ir {
                    xilinx::opcodes::JPROGRAM => {
                        t.stat = 0;
                        t.configured = false;
                    }
                    xilinx::opcodes::JSTART => {
                        // INIT_B, then DONE and EOS once started
                        t.stat = match t.configured {
                            true => 1 << 12 | 1 << 14 | 1 << 4,
                            false => 1 << 12,
                        };
                    }
                    _ => {}
                }
            }
        }
    }

    fn capture_dr(&mut self) {
        match &mut self.tap {
            Tap::Ecp5(t) => match t.ir {
                lattice::opcodes::LSC_BITSTREAM_BURST => {
                    t.burst.clear();
                    t.burst_bits = 0;
                }
                lattice::opcodes::LSC_USER2 => self.design.capture(),
                _ => {
                    if let Some(dr) = t.dr() {
                        dr.capture();
                    }
                }
            },
            Tap::Series7(t) => match t.ir {
                xilinx::opcodes::CFG_IN => t.cfg_in.clear(),
                xilinx::opcodes::CFG_OUT => t.cfg_out.capture(),
                xilinx::opcodes::IDCODE => t.idcode.capture(),
                xilinx::opcodes::USER4 => {
                    t.user4 = User4::Flag;
                    self.design.capture();
                }
                _ => t.bypass.capture(),
            },
        }
    }

    fn shift_dr(&mut self, tdi: bool) -> bool {
        match &mut self.tap {
            Tap::Ecp5(t) => match t.ir {
                lattice::opcodes::LSC_BITSTREAM_BURST => {
                    if t.burst_bits % 8 == 0 {
                        t.burst.push(0);
                    }
                    if let Some(last) = t.burst.last_mut() {
                        *last = *last << 1 | u8::from(tdi);
                    }
                    t.burst_bits += 1;
                    false
                }
                lattice::opcodes::LSC_USER2 => self.design.shift(tdi),
                _ => t.dr().is_some_and(|dr| dr.shift(tdi)),
            },
            Tap::Series7(t) => match t.ir {
                xilinx::opcodes::CFG_IN => {
                    t.cfg_in.push(tdi);
                    false
                }
                xilinx::opcodes::CFG_OUT => t.cfg_out.shift(tdi),
                xilinx::opcodes::IDCODE => t.idcode.shift(tdi),
                xilinx::opcodes::USER4 => match &mut t.user4 {
                    User4::Flag => {
                        t.user4 = match tdi {
                            true => User4::Select { bits: 0, code: 0 },
                            false => User4::Data,
                        };
                        false
                    }
                    User4::Select { bits, code } => {
                        if *bits < 4 {
                            *code |= u8::from(tdi) << *bits;
                            *bits += 1;
                        }
                        false
                    }
                    User4::Data => self.design.shift(tdi),
                },
                _ => t.bypass.shift(tdi),
            },
        }
    }

    fn update_dr(&mut self) {
        match &mut self.tap {
            Tap::Ecp5(t) => match t.ir {
                lattice::opcodes::LSC_USER2 => self.design.update(),
                lattice::opcodes::LSC_USER1 => {
                    t.user1.update();
                    self.design.select(t.user1.value() as u8 & 0x0F);
                }
                lattice::opcodes::ISC_ENABLE => {
                    t.param.update();
                    t.set_status(|s| s | ECP5_ISC_ENABLE);
                }
                lattice::opcodes::ISC_ERASE => {
                    t.param.update();
                    t.set_status(|s| s & !ECP5_DONE);
                }
                _ => {
                    if let Some(dr) = t.dr() {
                        dr.update();
                    }
                }
            },
            Tap::Series7(t) => match t.ir {
                xilinx::opcodes::CFG_IN => {
                    let bytes = t.cfg_in_bytes();
                    let read_stat = Type1::read(Addr::Stat).to_raw().to_be_bytes();
                    if bytes.windows(4).any(|w| w == read_stat) {
                        t.cfg_out.set(t.stat.reverse_bits().into());
                    } else {
                        t.configured = xilinx::bitfile::sync_offset(&bytes).is_some();
                    }
                }
                xilinx::opcodes::USER4 => match t.user4 {
                    User4::Select { code, .. } => self.design.select(code),
                    User4::Data => self.design.update(),
                    User4::Flag => {}
                },
                _ => {}
            },
        }
    }

    fn reset(&mut self) {
        match &mut self.tap {
            Tap::Ecp5(t) => t.ir = lattice::opcodes::READ_ID,
            Tap::Series7(t) => t.ir = xilinx::opcodes::IDCODE,
        }
    }
}

/// Fresh session on a simulated FPGA whose design already answers on the user
/// register.
pub fn session(family: Family) -> (SimSession, Profile) {
    let tap = match family {
        Family::Lattice => Tap::Ecp5(Ecp5::new()),
        Family::Xilinx => Tap::Series7(Series7::new()),
    };
    let fpga = SimFpga {
        tap,
        design: Design::new(),
    };
    let session = Session::new(SimBackend::new(fpga)).expect("sim session");
    (session, Profile::new(family))
}

pub fn design(session: &mut SimSession) -> &mut Design {
    &mut session.backend_mut().target_mut().design
}

/// Minimal image accepted by the simulated configuration engines.
pub fn image(family: Family) -> Vec<u8> {
    let mut image = vec![0xFF; 16];
    match family {
        Family::Lattice => image.extend(ECP5_PREAMBLE),
        Family::Xilinx => image.extend(Type1::SYNC.to_be_bytes()),
    }
    image.extend((0..40_000u32).map(|i| (i * 7) as u8));
    image
}
