//! `.bit` container as written by the vendor tools.
//!
//! ```text
//! u16 len, magic (9 bytes), u16 0x0001
//! 'a' u16 len, design name
//! 'b' u16 len, part
//! 'c' u16 len, date
//! 'd' u16 len, time
//! 'e' u32 len, configuration data
//! ```
//! String fields are NUL terminated. A plain `.bin` has no header and starts
//! with padding followed by the sync word.

use nom::{
    IResult, Parser,
    bytes::complete::tag,
    multi::length_data,
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;

use super::registers::Type1;

const MAGIC: [u8; 9] = [0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x0f, 0xf0, 0x00];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfileError {
    #[error("malformed .bit header")]
    Header,
    #[error("field {0:?} is not text")]
    Text(char),
    #[error("payload length {declared} exceeds the {available} bytes present")]
    Truncated { declared: usize, available: usize },
    #[error("no sync word in configuration data")]
    NoSync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitfile<'a> {
    pub design: &'a str,
    pub part: &'a str,
    pub date: &'a str,
    pub time: &'a str,
    pub data: &'a [u8],
}

fn field(key: u8, input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag(&[key][..]).parse(input)?;
    length_data(be_u16).parse(input)
}

fn text(key: u8, raw: &[u8]) -> Result<&str, BitfileError> {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    std::str::from_utf8(raw).map_err(|_| BitfileError::Text(key.into()))
}

struct Header<'a> {
    design: &'a [u8],
    part: &'a [u8],
    date: &'a [u8],
    time: &'a [u8],
    len: u32,
}

fn header(input: &[u8]) -> IResult<&[u8], Header<'_>> {
    let (input, _) = (length_data(be_u16), tag(&[0x00, 0x01][..]))
        .parse(input)
        .and_then(|(rest, (magic, _))| match magic == MAGIC {
            true => Ok((rest, ())),
            false => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            ))),
        })?;
    let (input, design) = field(b'a', input)?;
    let (input, part) = field(b'b', input)?;
    let (input, date) = field(b'c', input)?;
    let (input, time) = field(b'd', input)?;
    let (input, (_, len)) = (tag(&b"e"[..]), be_u32).parse(input)?;
    Ok((
        input,
        Header {
            design,
            part,
            date,
            time,
            len,
        },
    ))
}

impl<'a> Bitfile<'a> {
    pub fn parse(input: &'a [u8]) -> Result<Self, BitfileError> {
        let (rest, header) = header(input).map_err(|_| BitfileError::Header)?;
        let declared = header.len as usize;
        let data = rest.get(..declared).ok_or(BitfileError::Truncated {
            declared,
            available: rest.len(),
        })?;
        Ok(Self {
            design: text(b'a', header.design)?,
            part: text(b'b', header.part)?,
            date: text(b'c', header.date)?,
            time: text(b'd', header.time)?,
            data,
        })
    }
}

/// Offset of the first sync word.
pub fn sync_offset(data: &[u8]) -> Option<usize> {
    memchr::memmem::find(data, &Type1::SYNC.to_be_bytes())
}

/// Configuration data of either a `.bit` container or a raw `.bin` image.
pub fn payload(input: &[u8]) -> Result<&[u8], BitfileError> {
    let data = match Bitfile::parse(input) {
        Ok(bit) => {
            tracing::info!(
                design = bit.design,
                part = bit.part,
                built = format_args!("{} {}", bit.date, bit.time),
                "bitfile"
            );
            bit.data
        }
        Err(BitfileError::Header) => input,
        Err(e) => return Err(e),
    };
    sync_offset(data).ok_or(BitfileError::NoSync)?;
    Ok(data)
}
