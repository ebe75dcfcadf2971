use std::fmt::Display;

/// Fixed-width upper-case hex for register values in log lines.
pub struct Hex<T>(pub T);
impl Display for Hex<u8> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}
impl Display for Hex<u16> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}
impl Display for Hex<u32> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}
impl Display for Hex<u64> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

const MAX_DISPLAY: usize = 16;

pub struct ShortHex<'a>(pub &'a [u8]);
impl Display for ShortHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(MAX_DISPLAY)];
        f.write_str(&hex::encode_upper(shown))?;
        if self.0.len() > MAX_DISPLAY {
            write!(f, "...({} bytes)", self.0.len())?;
        }
        Ok(())
    }
}

pub struct SpaceHex<'a>(pub &'a [u8]);
impl Display for SpaceHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for e in self.0.iter().take(MAX_DISPLAY) {
            write!(f, "{:02X} ", e)?;
        }
        if self.0.len() > MAX_DISPLAY {
            write!(f, "...")?;
        }
        Ok(())
    }
}

/// Pack the low `len` bits of `value` LSB-first.
pub fn to_lsb_bytes(value: u64, len: usize) -> Vec<u8> {
    let mut out = value.to_le_bytes()[..len.div_ceil(8)].to_vec();
    if len % 8 != 0
        && let Some(last) = out.last_mut()
    {
        *last &= (1 << (len % 8)) - 1;
    }
    out
}

pub fn from_lsb_bytes(data: &[u8]) -> u64 {
    let mut word = [0; 8];
    let len = data.len().min(8);
    word[..len].copy_from_slice(&data[..len]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        assert_eq!(to_lsb_bytes(0x1F, 5), [0x1F]);
        assert_eq!(to_lsb_bytes(0xFFFF, 12), [0xFF, 0x0F]);
        assert_eq!(from_lsb_bytes(&[0x41, 0x15, 0xAD, 0xDE]), 0xDEAD_1541);
    }

    #[test]
    fn short_hex_truncates() {
        let data = [0xAB; 20];
        let s = ShortHex(&data).to_string();
        assert!(s.starts_with("ABABAB"));
        assert!(s.ends_with("...(20 bytes)"));
    }
}
