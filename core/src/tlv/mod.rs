//! TLV codec for pairing records
//!
//! Records are sequences of `{tag: 1 byte, length: 1 byte, value}`. The
//! decoder is bounded by a maximum record count and fails closed: a record
//! that runs past the buffer end is dropped, and a buffer with too many
//! records yields no map at all.
//!
//! Tag `0x80` is reserved for the `{major, minor}` version header on the
//! versioned records (`PeerInfo`, `SessionConfiguration`).

pub mod ber;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Reserved tag carrying the two-byte version header
pub const VERSION_TAG: u8 = 0x80;

/// Longest value a single record can carry (one length byte)
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlvError {
    #[error("Tag 0x{0:02X} not found")]
    TagNotFound(u8),

    #[error("Tag 0x{tag:02X} has invalid length {len}")]
    InvalidLength { tag: u8, len: usize },

    #[error("Value for tag 0x{tag:02X} too long: {len} bytes")]
    ValueTooLong { tag: u8, len: usize },

    #[error("Too many records: more than {max}")]
    TooManyRecords { max: usize },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        expected: ProtocolVersion,
        actual: ProtocolVersion,
    },
}

/// `{major, minor}` protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.major, self.minor]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [major, minor] => Some(Self::new(*major, *minor)),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Accumulating encoder for one record
#[derive(Debug, Default, Clone)]
pub struct TlvBuffer {
    bytes: Vec<u8>,
}

impl TlvBuffer {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn put_byte(self, tag: u8, value: u8) -> Self {
        self.put_raw(tag, &[value])
    }

    pub fn put_bool(self, tag: u8, value: bool) -> Self {
        self.put_byte(tag, u8::from(value))
    }

    /// Big-endian, four bytes
    pub fn put_i32(self, tag: u8, value: i32) -> Self {
        self.put_raw(tag, &value.to_be_bytes())
    }

    pub fn put_version(self, version: ProtocolVersion) -> Self {
        self.put_raw(VERSION_TAG, &version.to_bytes())
    }

    pub fn put_byte_array(self, tag: u8, value: &[u8]) -> Result<Self, TlvError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(TlvError::ValueTooLong {
                tag,
                len: value.len(),
            });
        }
        Ok(self.put_raw(tag, value))
    }

    /// Fixed-width value known to fit in one length byte
    pub(crate) fn put_raw(mut self, tag: u8, value: &[u8]) -> Self {
        debug_assert!(value.len() <= MAX_VALUE_LEN);
        self.bytes.push(tag);
        self.bytes.push(value.len() as u8);
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Encode a single record
pub fn encode(tag: u8, value: &[u8]) -> Result<Vec<u8>, TlvError> {
    Ok(TlvBuffer::builder().put_byte_array(tag, value)?.build())
}

/// Parsed record, tag to value
#[derive(Debug, Clone)]
pub struct TlvDecoder {
    records: HashMap<u8, Vec<u8>>,
    truncated: bool,
}

impl TlvDecoder {
    /// Parse `buffer` holding at most `max_records` records.
    ///
    /// A trailing record whose length runs past the end of the buffer is
    /// dropped and reported through [`TlvDecoder::truncated`]; the records
    /// before it stay available.
    pub fn parse(buffer: &[u8], max_records: usize) -> Result<Self, TlvError> {
        let mut records = HashMap::new();
        let mut truncated = false;
        let mut count = 0usize;
        let mut offset = 0usize;

        while offset < buffer.len() {
            if count == max_records {
                return Err(TlvError::TooManyRecords { max: max_records });
            }
            if offset + 2 > buffer.len() {
                truncated = true;
                break;
            }
            let tag = buffer[offset];
            let len = buffer[offset + 1] as usize;
            let start = offset + 2;
            let end = start + len;
            if end > buffer.len() {
                truncated = true;
                break;
            }
            // last write wins for duplicate tags
            records.insert(tag, buffer[start..end].to_vec());
            count += 1;
            offset = end;
        }

        if truncated {
            tracing::debug!(offset, len = buffer.len(), "TLV buffer truncated");
        }

        Ok(Self { records, truncated })
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_present(&self, tag: u8) -> bool {
        self.records.contains_key(&tag)
    }

    pub fn get_byte(&self, tag: u8) -> Result<u8, TlvError> {
        match self.get_byte_array(tag)? {
            [value] => Ok(*value),
            other => Err(TlvError::InvalidLength {
                tag,
                len: other.len(),
            }),
        }
    }

    pub fn get_bool(&self, tag: u8) -> Result<bool, TlvError> {
        Ok(self.get_byte(tag)? == 1)
    }

    pub fn get_i32(&self, tag: u8) -> Result<i32, TlvError> {
        let value = self.get_byte_array(tag)?;
        let bytes: [u8; 4] = value.try_into().map_err(|_| TlvError::InvalidLength {
            tag,
            len: value.len(),
        })?;
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn get_byte_array(&self, tag: u8) -> Result<&[u8], TlvError> {
        self.records
            .get(&tag)
            .map(Vec::as_slice)
            .ok_or(TlvError::TagNotFound(tag))
    }

    /// Optional-field access after a presence probe
    pub fn optional_byte(&self, tag: u8) -> Result<Option<u8>, TlvError> {
        if self.is_present(tag) {
            self.get_byte(tag).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn version(&self) -> Result<ProtocolVersion, TlvError> {
        let raw = self.get_byte_array(VERSION_TAG)?;
        ProtocolVersion::from_bytes(raw).ok_or(TlvError::InvalidLength {
            tag: VERSION_TAG,
            len: raw.len(),
        })
    }
}

/// Strict equality check on the version header
pub fn check_version(decoder: &TlvDecoder, expected: ProtocolVersion) -> Result<(), TlvError> {
    let actual = decoder.version()?;
    if actual != expected {
        return Err(TlvError::VersionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_and_lookup() {
        let bytes = TlvBuffer::builder()
            .put_version(ProtocolVersion::new(1, 1))
            .put_byte(0x82, 0x03)
            .put_i32(0x81, 0x0102_0304)
            .build();
        assert_eq!(
            bytes,
            vec![0x80, 2, 1, 1, 0x82, 1, 3, 0x81, 4, 1, 2, 3, 4]
        );

        let decoder = TlvDecoder::parse(&bytes, 8).expect("parse");
        assert_eq!(decoder.version().unwrap(), ProtocolVersion::new(1, 1));
        assert_eq!(decoder.get_byte(0x82).unwrap(), 0x03);
        assert_eq!(decoder.get_i32(0x81).unwrap(), 0x0102_0304);
        assert!(!decoder.truncated());
    }

    #[test]
    fn test_missing_tag() {
        let decoder = TlvDecoder::parse(&[0x81, 1, 7], 4).unwrap();
        assert_eq!(decoder.get_byte(0x82), Err(TlvError::TagNotFound(0x82)));
        assert!(!decoder.is_present(0x82));
        assert_eq!(decoder.optional_byte(0x82).unwrap(), None);
        assert_eq!(decoder.optional_byte(0x81).unwrap(), Some(7));
    }

    #[test]
    fn test_duplicate_tag_last_write_wins() {
        let decoder = TlvDecoder::parse(&[0x81, 1, 1, 0x81, 1, 2], 4).unwrap();
        assert_eq!(decoder.get_byte(0x81).unwrap(), 2);
        assert_eq!(decoder.len(), 1);
    }

    #[test]
    fn test_truncated_final_record() {
        // second record claims 4 bytes, only 2 follow
        let decoder = TlvDecoder::parse(&[0x81, 1, 9, 0x82, 4, 1, 2], 4).unwrap();
        assert!(decoder.truncated());
        assert_eq!(decoder.get_byte(0x81).unwrap(), 9);
        assert!(!decoder.is_present(0x82));
    }

    #[test]
    fn test_dangling_tag_byte() {
        let decoder = TlvDecoder::parse(&[0x81, 1, 9, 0x82], 4).unwrap();
        assert!(decoder.truncated());
        assert_eq!(decoder.len(), 1);
    }

    #[test]
    fn test_too_many_records() {
        let bytes = [0x81, 0, 0x82, 0, 0x83, 0];
        assert_eq!(
            TlvDecoder::parse(&bytes, 2).unwrap_err(),
            TlvError::TooManyRecords { max: 2 }
        );
        assert!(TlvDecoder::parse(&bytes, 3).is_ok());
    }

    #[test]
    fn test_value_too_long() {
        let long = vec![0u8; 256];
        assert!(matches!(
            TlvBuffer::builder().put_byte_array(0x81, &long),
            Err(TlvError::ValueTooLong { tag: 0x81, len: 256 })
        ));
    }

    #[test]
    fn test_version_gate() {
        let bytes = TlvBuffer::builder()
            .put_version(ProtocolVersion::new(1, 0))
            .build();
        let decoder = TlvDecoder::parse(&bytes, 2).unwrap();
        assert!(check_version(&decoder, ProtocolVersion::new(1, 0)).is_ok());
        assert!(matches!(
            check_version(&decoder, ProtocolVersion::new(1, 1)),
            Err(TlvError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_get_byte_rejects_wide_value() {
        let decoder = TlvDecoder::parse(&[0x81, 2, 1, 2], 2).unwrap();
        assert_eq!(
            decoder.get_byte(0x81),
            Err(TlvError::InvalidLength { tag: 0x81, len: 2 })
        );
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128), max in 0usize..16) {
            let _ = TlvDecoder::parse(&bytes, max);
        }

        #[test]
        fn prop_bounded_record_count(bytes in proptest::collection::vec(any::<u8>(), 0..128), max in 0usize..8) {
            if let Ok(decoder) = TlvDecoder::parse(&bytes, max) {
                prop_assert!(decoder.len() <= max);
            }
        }
    }
}
