// FiRa applet command builders and response helpers

use super::apdu::{CommandApdu, ResponseApdu};
use super::{
    CONTROLEE_INFO_DO_TAG, FIRA_CLA, OID_TAG, PROPRIETARY_DATA_TAG, PROPRIETARY_TAG,
    SECURE_BLOB_TAG,
};
use crate::tlv::ber::{self, TlvDatum};

pub const INS_SELECT_ADF: u8 = 0xA5;
pub const INS_INITIATE_TRANSACTION: u8 = 0x12;
pub const INS_TUNNEL: u8 = 0x14;
pub const INS_DISPATCH: u8 = 0xC2;
pub const INS_SWAP_ADF: u8 = 0x40;
pub const INS_GET_DATA: u8 = 0xCB;
pub const INS_PUT_DATA: u8 = 0xDB;

const P1_SWAP_IN: u8 = 0x00;
const P1_SWAP_OUT: u8 = 0x01;
const P1_UNICAST: u8 = 0x00;
const P1_MULTICAST: u8 = 0x01;
const P1P2_DATA_OBJECT: (u8, u8) = (0x3F, 0xFF);

const SESSION_ID_IN_TRANSACTION_TAG: u8 = 0x80;

/// ISO SELECT as sent by the remote initiator
pub fn is_select_command(bytes: &[u8]) -> bool {
    matches!(bytes, [0x00, 0xA4, 0x04, ..])
}

pub fn select_adf(oid: &[u8]) -> CommandApdu {
    CommandApdu::new(FIRA_CLA, INS_SELECT_ADF, 0x04, 0x00)
        .with_data(TlvDatum::new(OID_TAG, oid).encode())
}

/// `71{06 oid..., [80 session id]}`, multicast when a shared session id is given
pub fn initiate_transaction(peer_oids: &[Vec<u8>], shared_session_id: Option<i32>) -> CommandApdu {
    let mut children: Vec<TlvDatum> = peer_oids
        .iter()
        .map(|oid| TlvDatum::new(OID_TAG, oid.clone()))
        .collect();
    let p1 = match shared_session_id {
        Some(id) => {
            children.push(TlvDatum::new(
                ber::Tag::one(SESSION_ID_IN_TRANSACTION_TAG),
                id.to_be_bytes().to_vec(),
            ));
            P1_MULTICAST
        }
        None => P1_UNICAST,
    };
    CommandApdu::new(FIRA_CLA, INS_INITIATE_TRANSACTION, p1, 0x00)
        .with_data(TlvDatum::nested(PROPRIETARY_TAG, &children).encode())
}

fn proprietary(payload: &[u8]) -> Vec<u8> {
    TlvDatum::nested(
        PROPRIETARY_TAG,
        &[TlvDatum::new(PROPRIETARY_DATA_TAG, payload)],
    )
    .encode()
}

pub fn tunnel(payload: &[u8]) -> CommandApdu {
    CommandApdu::new(FIRA_CLA, INS_TUNNEL, 0x00, 0x00).with_data(proprietary(payload))
}

pub fn dispatch(payload: &[u8]) -> CommandApdu {
    CommandApdu::new(FIRA_CLA, INS_DISPATCH, 0x00, 0x00).with_data(proprietary(payload))
}

pub fn swap_in_adf(secure_blob: &[u8], oid: &[u8], peer_info: &[u8]) -> CommandApdu {
    let data = [
        TlvDatum::new(SECURE_BLOB_TAG, secure_blob),
        TlvDatum::new(OID_TAG, oid),
        TlvDatum::new(CONTROLEE_INFO_DO_TAG, peer_info),
    ]
    .iter()
    .flat_map(TlvDatum::encode)
    .collect::<Vec<u8>>();
    CommandApdu::new(FIRA_CLA, INS_SWAP_ADF, P1_SWAP_IN, 0x00).with_data(data)
}

pub fn swap_out_adf(slot: &[u8]) -> CommandApdu {
    CommandApdu::new(FIRA_CLA, INS_SWAP_ADF, P1_SWAP_OUT, 0x00)
        .with_data(TlvDatum::new(OID_TAG, slot).encode())
}

pub fn get_data(data_object: &TlvDatum) -> CommandApdu {
    let (p1, p2) = P1P2_DATA_OBJECT;
    CommandApdu::new(FIRA_CLA, INS_GET_DATA, p1, p2).with_data(data_object.encode())
}

pub fn put_data(data_object: &TlvDatum) -> CommandApdu {
    let (p1, p2) = P1P2_DATA_OBJECT;
    CommandApdu::new(FIRA_CLA, INS_PUT_DATA, p1, p2).with_data(data_object.encode())
}

/// Slot identifier returned by SWAP IN ADF
pub fn swap_in_slot(response: &ResponseApdu) -> Option<Vec<u8>> {
    if !response.is_success() {
        return None;
    }
    ber::parse_all(&response.data)
        .ok()?
        .into_iter()
        .find(|d| d.tag == OID_TAG)
        .map(|d| d.value)
}

/// Data to forward to the peer, from an INITIATE TRANSACTION or TUNNEL reply
pub fn outbound_data(response: &ResponseApdu) -> Option<Vec<u8>> {
    if !response.is_success() {
        return None;
    }
    let template = ber::parse_one(&response.data).filter(|d| d.tag == PROPRIETARY_TAG)?;
    ber::parse_all(&template.value)
        .ok()?
        .into_iter()
        .find(|d| d.tag == PROPRIETARY_DATA_TAG)
        .map(|d| d.value)
}
