//! Configuration packet headers.

#[derive(Debug, Clone, Copy)]
pub struct Type1 {
    pub op: OpCode,
    pub addr: Addr,
    pub word_count: u16,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Noop = 0,
    Read = 1,
    Write = 2,
}

#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum Addr {
    Crc = 0,
    Far = 1,
    Fdri = 2,
    Fdro = 3,
    Cmd = 4,
    Ctl0 = 5,
    Mask = 6,
    Stat = 7,
    Lout = 8,
    Cor0 = 9,
    Mfwr = 10,
    Cbc = 11,
    Idcode = 12,
    Axss = 13,
    Cor1 = 14,
    Wbstar = 16,
    Timer = 17,
    Bootsts = 22,
    Ctl1 = 24,
}

impl Type1 {
    pub const SYNC: u32 = 0xaa995566;
    pub const NOOP: u32 = 0x20000000;

    pub const fn new(op: OpCode, addr: Addr, word_count: u16) -> Self {
        Self {
            op,
            addr,
            word_count,
        }
    }

    pub const fn read(addr: Addr) -> Self {
        Self::new(OpCode::Read, addr, 1)
    }

    /// ```text
    /// [31:29] header type
    /// [28:27] opcode
    /// [26:13] address
    /// [12:11] reserved
    /// [10: 0] word count
    /// ```
    pub const fn to_raw(self) -> u32 {
        let header = 1 << 29;
        let opcode = (((self.op as u8) & 0x3) as u32) << 27;
        let address = (((self.addr as u16) & 0x3fff) as u32) << 13;
        let word_count = (self.word_count & 0x3ff) as u32;
        header | opcode | address | word_count
    }
}

/// Configuration words as the port consumes them: big-endian bytes, each
/// shifted MSB first.
pub fn packet_bytes<const N: usize>(words: [u32; N]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}
