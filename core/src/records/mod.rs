//! Pairing records exchanged over the secure tunnel
//!
//! - [`DeviceCapability`]: version ranges plus optional capability categories
//! - [`PeerInfo`]: versioned identity a controlee presents to its peer
//! - [`SessionConfiguration`]: session id, sub-session id and radio config blob
//!
//! Every record is a plain product type. An absent optional field means
//! "unspecified" and survives an encode/decode round trip as absent.

pub mod capability;
pub mod peer_info;
pub mod session_config;

pub use capability::{
    AoaSupport, CapabilityFlag, CcConstraintLength, Channel, DeviceCapability,
    DeviceCapabilityBuilder, DeviceRole, FlagSet, MultiNodeMode, RangingMethod, RframeConfig,
    StsConfig,
};
pub use peer_info::PeerInfo;
pub use session_config::SessionConfiguration;

use crate::tlv::TlvError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Malformed field: {0}")]
    MalformedField(&'static str),
}
