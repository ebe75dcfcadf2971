#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bits<T>(pub T);

#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes<T>(pub T);

/// 32-bit words, as moved by the user register bus burst commands.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Words32<T>(pub T);

impl<T> From<Bytes<T>> for Bits<T>
where
    T: std::ops::Mul<usize, Output = T>,
{
    fn from(value: Bytes<T>) -> Self {
        Self(value.0 * 8)
    }
}

impl<T> From<Words32<T>> for Bytes<T>
where
    T: std::ops::Mul<usize, Output = T>,
{
    fn from(value: Words32<T>) -> Self {
        Self(value.0 * 4)
    }
}

impl<T> Bits<T>
where
    T: Copy,
    T: std::ops::Div<usize, Output = T>,
    T: std::ops::Rem<usize, Output = T>,
{
    pub fn as_pair(self) -> (Bytes<T>, Bits<T>) {
        (Bytes(self.0 / 8), Bits(self.0 % 8))
    }
}

impl Bits<u8> {
    pub const fn widen(self) -> Bits<usize> {
        Bits(self.0 as usize)
    }
}

impl Bits<usize> {
    /// Number of bytes needed to hold this many bits, packed LSB-first.
    pub const fn byte_len(self) -> usize {
        self.0.div_ceil(8)
    }
}

impl Bytes<usize> {
    /// Whole words covering this many bytes.
    pub const fn words_ceil(self) -> Words32<usize> {
        Words32(self.0.div_ceil(4))
    }
}
