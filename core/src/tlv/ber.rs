//! BER-TLV datums used by the applet command envelopes
//!
//! Tags are one to three bytes (ISO/IEC 7816-4 multi-byte tag rule),
//! lengths use the definite BER forms `0x00..0x7F` and `0x81`..`0x84` followed
//! by that many length bytes.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BerError {
    #[error("Unexpected end of data at offset {0}")]
    UnexpectedEnd(usize),

    #[error("Tag longer than {max} bytes at offset {offset}", max = Tag::MAX_LEN)]
    TagTooLong { offset: usize },

    #[error("Unsupported length form 0x{0:02X}")]
    UnsupportedLength(u8),
}

/// BER tag, stored inline
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    bytes: [u8; 3],
    len: u8,
}

impl Tag {
    pub const MAX_LEN: usize = 3;

    pub const fn one(b0: u8) -> Self {
        Self {
            bytes: [b0, 0, 0],
            len: 1,
        }
    }

    pub const fn two(b0: u8, b1: u8) -> Self {
        Self {
            bytes: [b0, b1, 0],
            len: 2,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    fn parse(data: &[u8], offset: usize) -> Result<(Self, usize), BerError> {
        let first = *data.get(offset).ok_or(BerError::UnexpectedEnd(offset))?;
        let mut tag = Self::one(first);
        let mut cursor = offset + 1;
        if first & 0x1F == 0x1F {
            loop {
                let next = *data.get(cursor).ok_or(BerError::UnexpectedEnd(cursor))?;
                if tag.len as usize == Self::MAX_LEN {
                    return Err(BerError::TagTooLong { offset });
                }
                tag.bytes[tag.len as usize] = next;
                tag.len += 1;
                cursor += 1;
                if next & 0x80 == 0 {
                    break;
                }
            }
        }
        Ok((tag, cursor))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", hex::encode_upper(self.as_bytes()))
    }
}

/// One tag-length-value element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvDatum {
    pub tag: Tag,
    pub value: Vec<u8>,
}

impl TlvDatum {
    pub fn new(tag: Tag, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    /// Constructed datum whose value is the concatenated encoding of `children`
    pub fn nested(tag: Tag, children: &[TlvDatum]) -> Self {
        let value = children.iter().flat_map(TlvDatum::encode).collect::<Vec<u8>>();
        Self { tag, value }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tag.len as usize + 3 + self.value.len());
        out.extend_from_slice(self.tag.as_bytes());
        encode_length(self.value.len(), &mut out);
        out.extend_from_slice(&self.value);
        out
    }
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    // definite long form: 0x80 | n, then n big-endian length bytes
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn parse_length(data: &[u8], offset: usize) -> Result<(usize, usize), BerError> {
    let first = *data.get(offset).ok_or(BerError::UnexpectedEnd(offset))?;
    match first {
        0x00..=0x7F => Ok((first as usize, offset + 1)),
        0x81..=0x84 => {
            let count = (first & 0x7F) as usize;
            let start = offset + 1;
            let bytes = data
                .get(start..start + count)
                .ok_or(BerError::UnexpectedEnd(data.len()))?;
            let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            Ok((len, start + count))
        }
        other => Err(BerError::UnsupportedLength(other)),
    }
}

fn parse_at(data: &[u8], offset: usize) -> Result<(TlvDatum, usize), BerError> {
    let (tag, cursor) = Tag::parse(data, offset)?;
    let (len, start) = parse_length(data, cursor)?;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or(BerError::UnexpectedEnd(data.len()))?;
    Ok((TlvDatum::new(tag, &data[start..end]), end))
}

/// First datum in `data`, if it is well formed
pub fn parse_one(data: &[u8]) -> Option<TlvDatum> {
    parse_at(data, 0).ok().map(|(datum, _)| datum)
}

/// All sibling datums in `data`
pub fn parse_all(data: &[u8]) -> Result<Vec<TlvDatum>, BerError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (datum, next) = parse_at(data, offset)?;
        out.push(datum);
        offset = next;
    }
    Ok(out)
}

/// Sibling datums grouped by tag, in order of appearance
pub fn parse_map(data: &[u8]) -> Result<HashMap<Tag, Vec<TlvDatum>>, BerError> {
    let mut map: HashMap<Tag, Vec<TlvDatum>> = HashMap::new();
    for datum in parse_all(data)? {
        map.entry(datum.tag).or_default().push(datum);
    }
    Ok(map)
}
