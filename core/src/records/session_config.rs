//! Session configuration record
//!
//! `0x80` version, `0x81` session id (i32 BE), `0x82` sub-session id,
//! `0xA3` opaque radio configuration blob.

use super::RecordError;
use crate::tlv::{check_version, ProtocolVersion, TlvBuffer, TlvDecoder, TlvError};
use serde::{Deserialize, Serialize};

pub const SESSION_ID_TAG: u8 = 0x81;
pub const SUB_SESSION_ID_TAG: u8 = 0x82;
pub const CONFIG_PARAMS_TAG: u8 = 0xA3;
pub const SESSION_CONFIG_MAX_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    pub version: ProtocolVersion,
    pub session_id: i32,
    pub sub_session_id: Option<i32>,
    #[serde(with = "hex_opt", default)]
    pub config_params: Option<Vec<u8>>,
}

impl SessionConfiguration {
    pub const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 1);

    pub fn new(session_id: i32) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            session_id,
            sub_session_id: None,
            config_params: None,
        }
    }

    pub fn with_sub_session_id(mut self, id: i32) -> Self {
        self.sub_session_id = Some(id);
        self
    }

    pub fn with_config_params(mut self, params: Vec<u8>) -> Self {
        self.config_params = Some(params);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let mut buf = TlvBuffer::builder()
            .put_version(self.version)
            .put_i32(SESSION_ID_TAG, self.session_id);
        if let Some(sub) = self.sub_session_id {
            buf = buf.put_i32(SUB_SESSION_ID_TAG, sub);
        }
        if let Some(params) = &self.config_params {
            buf = buf.put_byte_array(CONFIG_PARAMS_TAG, params)?;
        }
        Ok(buf.build())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RecordError> {
        let decoder = TlvDecoder::parse(data, SESSION_CONFIG_MAX_COUNT)?;
        check_version(&decoder, Self::CURRENT_VERSION)?;

        let session_id = match decoder.get_i32(SESSION_ID_TAG) {
            Ok(id) => id,
            Err(TlvError::TagNotFound(_)) => return Err(RecordError::MissingField("session_id")),
            Err(e) => return Err(e.into()),
        };
        let sub_session_id = if decoder.is_present(SUB_SESSION_ID_TAG) {
            Some(decoder.get_i32(SUB_SESSION_ID_TAG)?)
        } else {
            None
        };
        let config_params = decoder
            .get_byte_array(CONFIG_PARAMS_TAG)
            .ok()
            .map(<[u8]>::to_vec);

        Ok(Self {
            version: Self::CURRENT_VERSION,
            session_id,
            sub_session_id,
            config_params,
        })
    }

    /// Malformed or wrong-version input decodes to `None`
    pub fn decode(data: &[u8]) -> Option<Self> {
        match Self::from_bytes(data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting SessionConfiguration record");
                None
            }
        }
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
