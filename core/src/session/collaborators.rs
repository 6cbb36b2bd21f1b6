// Collaborator interfaces and session identity values

use crate::records::SessionConfiguration;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Radio-assigned handle of one ranging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Short (2-byte) UWB MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UwbAddress(pub [u8; 2]);

impl UwbAddress {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for UwbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{:02X}", self.0[0], self.0[1])
    }
}

/// Reason attached to every upward callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    Unknown,
    LocalApi,
    RemoteRequest,
    DiscoveryFailed,
    TransportFailed,
    SecureSessionAborted,
    RangingOpenFailed,
    RangingStartFailed,
    SystemPolicy,
}

/// Peer found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub id: String,
    pub address: Option<String>,
    #[serde(default)]
    pub service_data: Vec<u8>,
}

impl PeerDevice {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: None,
            service_data: Vec::new(),
        }
    }
}

/// Identity of a ranging session, owned by its state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub attribution_handle: u32,
    pub session_handle: SessionHandle,
    pub service_instance_id: Uuid,
    pub session_id: i32,
    pub sub_session_id: Option<i32>,
    pub device_address: UwbAddress,
    pub dest_addresses: Vec<UwbAddress>,
}

impl SessionInfo {
    pub fn new(session_handle: SessionHandle, attribution_handle: u32) -> Self {
        Self {
            attribution_handle,
            session_handle,
            service_instance_id: Uuid::new_v4(),
            session_id: 0,
            sub_session_id: None,
            device_address: UwbAddress::random(),
            dest_addresses: Vec::new(),
        }
    }

    /// Adopts the ids agreed over the secure channel
    pub fn apply_configuration(&mut self, config: &SessionConfiguration) {
        self.session_id = config.session_id;
        self.sub_session_id = config.sub_session_id;
    }
}

/// Results reported back by collaborators
///
/// Transport setup completes with the `init`/`start` calls themselves, so
/// only a later link loss is reported here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorEvent {
    Discovered(PeerDevice),
    DiscoveryFailed,
    TransportFailed,
    TransportData(Vec<u8>),
    RangingOpened,
    RangingOpenFailed(ReasonCode),
    RangingStarted,
    RangingStartFailed(ReasonCode),
    RangingStopped(ReasonCode),
    RangingEnded,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator request failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMode {
    Scan,
    Advertise,
}

/// Out-of-band discovery (BLE scan or advertise)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn start_discovery(&self, mode: DiscoveryMode) -> Result<(), CollaboratorError>;

    async fn stop_discovery(&self) -> Result<(), CollaboratorError>;
}

/// Vendor radio link; completion arrives as [`CollaboratorEvent`]s
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioControl: Send + Sync {
    async fn open_ranging(
        &self,
        info: &SessionInfo,
        config: &SessionConfiguration,
    ) -> Result<(), CollaboratorError>;

    async fn start_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError>;

    async fn stop_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError>;

    async fn close_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError>;
}

/// Upward notifications to the session owner
#[cfg_attr(test, mockall::automock)]
pub trait RangingCallbacks: Send + Sync {
    fn on_opened(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);

    fn on_open_failed(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);

    fn on_started(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);

    fn on_start_failed(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);

    fn on_stopped(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);

    fn on_closed(&self, handle: SessionHandle, reason: ReasonCode, params: &[u8]);
}
