//! FiRa CSML: APDUs, applet commands and data-object helpers
//!
//! Every record crossing the secure tunnel is wrapped in a GET/PUT data
//! object under the extended head list tag (`0x4D`).

pub mod apdu;
pub mod command;
pub mod dispatch;

pub use apdu::{ApduError, CommandApdu, ResponseApdu, StatusWord};
pub use dispatch::{DispatchKind, DispatchResponse, Notification, OutboundData, OutboundTarget};

use crate::records::{PeerInfo, RecordError, SessionConfiguration};
use crate::tlv::ber::{self, Tag, TlvDatum};
use rand::Rng;

/// Class byte of FiRa proprietary commands
pub const FIRA_CLA: u8 = 0x80;

pub const OID_TAG: Tag = Tag::one(0x06);
pub const EXTENDED_HEAD_LIST_TAG: Tag = Tag::one(0x4D);
pub const TERMINATE_SESSION_DO_TAG: Tag = Tag::one(0x80);
pub const TERMINATE_SESSION_TOP_DO_TAG: Tag = Tag::two(0xBF, 0x79);
pub const UWB_CONFIG_AVAILABLE_TAG: Tag = Tag::one(0x87);
pub const SESSION_DATA_DO_TAG: Tag = Tag::two(0xBF, 0x78);
pub const SESSION_ID_TAG: Tag = Tag::one(0x81);
pub const CONTROLEE_INFO_DO_TAG: Tag = Tag::two(0xBF, 0x70);
pub const SECURE_BLOB_TAG: Tag = Tag::two(0xDF, 0x51);
/// FiRa proprietary response/command template
pub const PROPRIETARY_TAG: Tag = Tag::one(0x71);
pub const PROPRIETARY_DATA_TAG: Tag = Tag::one(0x81);

/// `87 01 00`: the peer has no session data yet, ask again
pub fn is_session_data_not_available(data: &[u8]) -> bool {
    matches!(
        ber::parse_one(data),
        Some(datum) if datum.tag == UWB_CONFIG_AVAILABLE_TAG && datum.value == [0x00]
    )
}

pub fn is_session_data_do(data: &[u8]) -> bool {
    is_do(SESSION_DATA_DO_TAG, data)
}

pub fn is_controlee_info_do(data: &[u8]) -> bool {
    is_do(CONTROLEE_INFO_DO_TAG, data)
}

fn is_do(tag: Tag, data: &[u8]) -> bool {
    matches!(ber::parse_one(data), Some(datum) if datum.tag == tag)
}

/// Deepest tag of a GET DO asking for the whole content: `tag ++ [00]`
pub fn deepest_tag_all_content(tag: Tag) -> Vec<u8> {
    let mut out = tag.as_bytes().to_vec();
    out.push(0x00);
    out
}

/// `4D{tag 00}`
pub fn get_do(tag: Tag) -> TlvDatum {
    TlvDatum::new(EXTENDED_HEAD_LIST_TAG, deepest_tag_all_content(tag))
}

/// `4D{datum}`
pub fn wrap_do(datum: &TlvDatum) -> TlvDatum {
    TlvDatum::nested(EXTENDED_HEAD_LIST_TAG, std::slice::from_ref(datum))
}

/// `4D{BF79{80 00}}`
pub fn terminate_session_get_do() -> TlvDatum {
    wrap_do(&TlvDatum::new(
        TERMINATE_SESSION_TOP_DO_TAG,
        deepest_tag_all_content(TERMINATE_SESSION_DO_TAG),
    ))
}

/// `4D{BF78{81 00}}`
pub fn session_id_get_do() -> TlvDatum {
    wrap_do(&TlvDatum::new(
        SESSION_DATA_DO_TAG,
        deepest_tag_all_content(SESSION_ID_TAG),
    ))
}

/// `BF70{peer info}`
pub fn controlee_info_do(info: &PeerInfo) -> Result<TlvDatum, RecordError> {
    Ok(TlvDatum::new(CONTROLEE_INFO_DO_TAG, info.to_bytes()?))
}

/// `BF78{session configuration}`
pub fn session_data_do(config: &SessionConfiguration) -> Result<TlvDatum, RecordError> {
    Ok(TlvDatum::new(SESSION_DATA_DO_TAG, config.to_bytes()?))
}

/// Session configuration carried in a `BF78` data object
pub fn session_config_from_do(data: &[u8]) -> Option<SessionConfiguration> {
    let datum = ber::parse_one(data)?;
    if datum.tag != SESSION_DATA_DO_TAG {
        return None;
    }
    SessionConfiguration::decode(&datum.value)
}

/// Peer info carried in a `BF70` data object
pub fn peer_info_from_do(data: &[u8]) -> Option<PeerInfo> {
    let datum = ber::parse_one(data)?;
    if datum.tag != CONTROLEE_INFO_DO_TAG {
        return None;
    }
    PeerInfo::decode(&datum.value)
}

/// Uniformly random session id, always strictly positive
pub fn generate_random_session_id() -> i32 {
    rand::thread_rng().gen_range(1..=i32::MAX)
}

/// Big-endian integer from up to four bytes
pub fn be_bytes_to_i32(bytes: &[u8]) -> i32 {
    bytes.iter().fold(0i32, |acc, b| (acc << 8) | i32::from(*b))
}
