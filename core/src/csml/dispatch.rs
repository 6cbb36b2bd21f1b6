//! Decoded FiRa applet reply to a DISPATCH or TUNNEL command
//!
//! ```text
//! 71 {
//!   80 status             00 complete | 80 to remote | 81 to host | FF error
//!   81 outbound data
//!   E1 { 80 format, 81 event id, 82 event data }   (zero or more)
//! }
//! ```

use super::apdu::{ResponseApdu, StatusWord};
use super::{be_bytes_to_i32, is_session_data_do, is_session_data_not_available, PROPRIETARY_TAG};
use crate::tlv::ber::{self, BerError, Tag};
use thiserror::Error;

const STATUS_TAG: Tag = Tag::one(0x80);
const DATA_TAG: Tag = Tag::one(0x81);
const NOTIFICATION_TAG: Tag = Tag::one(0xE1);
const NOTIFICATION_EVENT_ID_TAG: Tag = Tag::one(0x81);
const NOTIFICATION_DATA_TAG: Tag = Tag::one(0x82);

pub const EVENT_ADF_SELECTED: u8 = 0;
pub const EVENT_SECURE_CHANNEL_ESTABLISHED: u8 = 1;
pub const EVENT_RDS_AVAILABLE: u8 = 2;
pub const EVENT_SECURE_SESSION_ABORTED: u8 = 3;
pub const EVENT_CONTROLEE_INFO_AVAILABLE: u8 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Malformed dispatch response: {0}")]
    Ber(#[from] BerError),

    #[error("Notification missing event id")]
    MissingEventId,

    #[error("Notification {event} missing data")]
    MissingEventData { event: u8 },

    #[error("Notification {event} has a bad payload")]
    BadPayload { event: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Undefined,
    Complete,
    ForwardToRemote,
    ForwardToHost,
    WithError,
}

impl TransactionStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => TransactionStatus::Complete,
            0x80 => TransactionStatus::ForwardToRemote,
            0x81 => TransactionStatus::ForwardToHost,
            0xFF => TransactionStatus::WithError,
            _ => TransactionStatus::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundTarget {
    Host,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundData {
    pub target: OutboundTarget,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AdfSelected { oid: Vec<u8> },
    SecureChannelEstablished { default_session_id: Option<i32> },
    RdsAvailable {
        session_id: i32,
        arbitrary_data: Option<Vec<u8>>,
    },
    SecureSessionAborted,
    ControleeInfoAvailable { data: Vec<u8> },
}

/// What the protocol driver should do with a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    DataAvailable,
    OutboundRelay,
    RetryNeeded,
    TransactionCompleteWithError,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status_word: StatusWord,
    pub transaction_status: TransactionStatus,
    pub outbound: Option<OutboundData>,
    pub notifications: Vec<Notification>,
}

impl DispatchResponse {
    pub fn from_response(response: &ResponseApdu) -> Result<Self, DispatchError> {
        let mut parsed = Self {
            status_word: response.sw,
            transaction_status: TransactionStatus::Undefined,
            outbound: None,
            notifications: Vec::new(),
        };
        if !response.is_success() {
            return Ok(parsed);
        }

        let top = ber::parse_map(&response.data)?;
        let Some(template) = top.get(&PROPRIETARY_TAG).and_then(|v| v.first()) else {
            tracing::warn!("Dispatch response has no proprietary template");
            return Ok(parsed);
        };
        let fields = ber::parse_map(&template.value)?;

        if let Some(list) = fields.get(&NOTIFICATION_TAG) {
            for datum in list {
                if let Some(n) = parse_notification(&datum.value)? {
                    parsed.notifications.push(n);
                }
            }
        }

        let Some(status) = fields.get(&STATUS_TAG).and_then(|v| v.first()) else {
            tracing::warn!("Dispatch response has no transaction status");
            return Ok(parsed);
        };
        parsed.transaction_status = status
            .value
            .first()
            .map_or(TransactionStatus::Undefined, |b| TransactionStatus::from_u8(*b));

        match parsed.transaction_status {
            TransactionStatus::WithError => {
                parsed.notifications.push(Notification::SecureSessionAborted);
            }
            TransactionStatus::ForwardToHost | TransactionStatus::ForwardToRemote => {
                if let Some(data) = fields.get(&DATA_TAG).and_then(|v| v.first()) {
                    let target = if parsed.transaction_status == TransactionStatus::ForwardToHost {
                        OutboundTarget::Host
                    } else {
                        OutboundTarget::Remote
                    };
                    parsed.outbound = Some(OutboundData {
                        target,
                        data: data.value.clone(),
                    });
                }
            }
            status => tracing::debug!(?status, "Dispatch transaction status"),
        }

        Ok(parsed)
    }

    pub fn is_success(&self) -> bool {
        self.status_word.is_success()
    }

    pub fn kind(&self) -> DispatchKind {
        if self.transaction_status == TransactionStatus::WithError {
            return DispatchKind::TransactionCompleteWithError;
        }
        match &self.outbound {
            Some(OutboundData {
                target: OutboundTarget::Remote,
                ..
            }) => return DispatchKind::OutboundRelay,
            Some(OutboundData {
                target: OutboundTarget::Host,
                data,
            }) => {
                if is_session_data_not_available(data) {
                    return DispatchKind::RetryNeeded;
                }
                if is_session_data_do(data) {
                    return DispatchKind::DataAvailable;
                }
            }
            None => {}
        }
        if self.rds_available().is_some() {
            return DispatchKind::DataAvailable;
        }
        DispatchKind::Generic
    }

    pub fn host_data(&self) -> Option<&[u8]> {
        match &self.outbound {
            Some(OutboundData {
                target: OutboundTarget::Host,
                data,
            }) => Some(data),
            _ => None,
        }
    }

    pub fn remote_data(&self) -> Option<&[u8]> {
        match &self.outbound {
            Some(OutboundData {
                target: OutboundTarget::Remote,
                data,
            }) => Some(data),
            _ => None,
        }
    }

    /// `(session_id, arbitrary_data)` of the first RDS notification
    pub fn rds_available(&self) -> Option<(i32, Option<&[u8]>)> {
        self.notifications.iter().find_map(|n| match n {
            Notification::RdsAvailable {
                session_id,
                arbitrary_data,
            } => Some((*session_id, arbitrary_data.as_deref())),
            _ => None,
        })
    }

    /// Outer `None`: no established notification
    pub fn established(&self) -> Option<Option<i32>> {
        self.notifications.iter().find_map(|n| match n {
            Notification::SecureChannelEstablished { default_session_id } => {
                Some(*default_session_id)
            }
            _ => None,
        })
    }

    pub fn controlee_info(&self) -> Option<&[u8]> {
        self.notifications.iter().find_map(|n| match n {
            Notification::ControleeInfoAvailable { data } => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.notifications
            .iter()
            .any(|n| matches!(n, Notification::SecureSessionAborted))
    }
}

/// Length-prefixed session id: `[len, id bytes...]`, then the rest
fn split_session_id(payload: &[u8]) -> Option<(i32, &[u8])> {
    let (&len, rest) = payload.split_first()?;
    let len = len as usize;
    if len == 0 || len > 4 || rest.len() < len {
        return None;
    }
    Some((be_bytes_to_i32(&rest[..len]), &rest[len..]))
}

fn parse_notification(value: &[u8]) -> Result<Option<Notification>, DispatchError> {
    let fields = ber::parse_map(value)?;
    let event = fields
        .get(&NOTIFICATION_EVENT_ID_TAG)
        .and_then(|v| v.first())
        .and_then(|d| d.value.first().copied())
        .ok_or(DispatchError::MissingEventId)?;
    let data = fields
        .get(&NOTIFICATION_DATA_TAG)
        .and_then(|v| v.first())
        .map(|d| d.value.as_slice());

    let notification = match event {
        EVENT_ADF_SELECTED => {
            let oid = data.ok_or(DispatchError::MissingEventData { event })?;
            Notification::AdfSelected { oid: oid.to_vec() }
        }
        EVENT_SECURE_CHANNEL_ESTABLISHED => {
            let default_session_id = data.and_then(split_session_id).map(|(id, _)| id);
            Notification::SecureChannelEstablished { default_session_id }
        }
        EVENT_RDS_AVAILABLE => {
            let payload = data.ok_or(DispatchError::MissingEventData { event })?;
            let (session_id, rest) =
                split_session_id(payload).ok_or(DispatchError::BadPayload { event })?;
            // [len, data...]; a length that disagrees with the payload drops the data
            let arbitrary_data = match rest.split_first() {
                Some((&len, body)) if body.len() == len as usize => Some(body.to_vec()),
                _ => None,
            };
            Notification::RdsAvailable {
                session_id,
                arbitrary_data,
            }
        }
        EVENT_SECURE_SESSION_ABORTED => Notification::SecureSessionAborted,
        EVENT_CONTROLEE_INFO_AVAILABLE => {
            let payload = data
                .filter(|d| !d.is_empty())
                .ok_or(DispatchError::MissingEventData { event })?;
            Notification::ControleeInfoAvailable {
                data: payload.to_vec(),
            }
        }
        other => {
            tracing::debug!(event = other, "Ignoring unknown notification");
            return Ok(None);
        }
    };
    Ok(Some(notification))
}

/// Encoders for building applet replies, used by in-memory secure elements
pub mod build {
    use super::*;
    use crate::tlv::ber::TlvDatum;

    pub fn notification(event: u8, data: Option<&[u8]>) -> TlvDatum {
        let mut children = vec![
            TlvDatum::new(Tag::one(0x80), vec![0x00]),
            TlvDatum::new(NOTIFICATION_EVENT_ID_TAG, vec![event]),
        ];
        if let Some(data) = data {
            children.push(TlvDatum::new(NOTIFICATION_DATA_TAG, data));
        }
        TlvDatum::nested(NOTIFICATION_TAG, &children)
    }

    pub fn established(default_session_id: Option<i32>) -> TlvDatum {
        let data = default_session_id.map(|id| {
            let mut payload = vec![4];
            payload.extend_from_slice(&id.to_be_bytes());
            payload
        });
        notification(EVENT_SECURE_CHANNEL_ESTABLISHED, data.as_deref())
    }

    pub fn rds_available(session_id: i32, arbitrary: Option<&[u8]>) -> TlvDatum {
        let mut payload = vec![4];
        payload.extend_from_slice(&session_id.to_be_bytes());
        if let Some(extra) = arbitrary {
            payload.push(extra.len() as u8);
            payload.extend_from_slice(extra);
        }
        notification(EVENT_RDS_AVAILABLE, Some(&payload))
    }

    pub fn controlee_info(data: &[u8]) -> TlvDatum {
        notification(EVENT_CONTROLEE_INFO_AVAILABLE, Some(data))
    }

    pub fn aborted() -> TlvDatum {
        notification(EVENT_SECURE_SESSION_ABORTED, None)
    }

    /// `71{80 status, [81 data], notifications...}`
    pub fn response(status: u8, data: Option<&[u8]>, notifications: &[TlvDatum]) -> Vec<u8> {
        let mut children = vec![TlvDatum::new(STATUS_TAG, vec![status])];
        if let Some(data) = data {
            children.push(TlvDatum::new(DATA_TAG, data));
        }
        children.extend_from_slice(notifications);
        TlvDatum::nested(PROPRIETARY_TAG, &children).encode()
    }
}
