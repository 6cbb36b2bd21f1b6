//! Controlee identity record
//!
//! `0x80` version header, `0xA3` nested capability record.

use super::{DeviceCapability, RecordError};
use crate::tlv::{check_version, ProtocolVersion, TlvBuffer, TlvDecoder, TlvError};
use serde::{Deserialize, Serialize};

pub const CAPABILITY_TAG: u8 = 0xA3;
pub const PEER_INFO_MAX_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub version: ProtocolVersion,
    pub capability: Option<DeviceCapability>,
}

impl PeerInfo {
    pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 1);

    pub fn new(capability: Option<DeviceCapability>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            capability,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut buf = TlvBuffer::builder().put_version(self.version);
        if let Some(cap) = &self.capability {
            buf = buf.put_byte_array(CAPABILITY_TAG, &cap.to_bytes())?;
        }
        Ok(buf.build())
    }

    /// Strict: a version other than [`PeerInfo::CURRENT_VERSION`] is an error
    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        let decoder = TlvDecoder::parse(data, PEER_INFO_MAX_COUNT)?;
        check_version(&decoder, Self::CURRENT_VERSION)?;

        let capability = match decoder.get_byte_array(CAPABILITY_TAG) {
            Ok(raw) => Some(DeviceCapability::from_bytes(raw)?),
            Err(TlvError::TagNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            version: Self::CURRENT_VERSION,
            capability,
        })
    }

    /// Malformed or wrong-version input decodes to `None`
    pub fn decode(data: &[u8]) -> Option<Self> {
        match Self::from_bytes(data) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting PeerInfo record");
                None
            }
        }
    }
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self::new(None)
    }
}
