// Role profiles: what differs between a controller and a controlee session

use super::collaborators::DiscoveryMode;
use crate::records::capability::{
    Channel, DeviceRole, MultiNodeMode, RangingMethod, RframeConfig, StsConfig,
};
use crate::records::{DeviceCapability, PeerInfo, RecordError, SessionConfiguration};
use crate::secure::{AdfParams, ChannelRole, DriverRole};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UwbRole {
    Controller,
    Controlee,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupplyError {
    #[error("Peer capability is not compatible with ours")]
    Incompatible,

    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Builds the session configuration a controller hands to its controlee
pub trait SessionConfigurationSupplier: Send + Sync + fmt::Debug {
    fn session_configuration(
        &self,
        local: &DeviceCapability,
        peer: &PeerInfo,
        unique_session_id: i32,
    ) -> Result<SessionConfiguration, SupplyError>;
}

/// With a shared session id the unique id becomes the sub-session id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultConfigurationSupplier {
    pub shared_session_id: Option<i32>,
    pub config_params: Option<Vec<u8>>,
}

impl SessionConfigurationSupplier for DefaultConfigurationSupplier {
    fn session_configuration(
        &self,
        local: &DeviceCapability,
        peer: &PeerInfo,
        unique_session_id: i32,
    ) -> Result<SessionConfiguration, SupplyError> {
        if let Some(theirs) = &peer.capability {
            if !local.is_compatible_with(theirs) {
                return Err(SupplyError::Incompatible);
            }
        }

        let mut config = match self.shared_session_id {
            Some(shared) => SessionConfiguration::new(shared).with_sub_session_id(unique_session_id),
            None => SessionConfiguration::new(unique_session_id),
        };
        if let Some(params) = &self.config_params {
            config = config.with_config_params(params.clone());
        }
        Ok(config)
    }
}

/// Everything a session needs to know about its local role
#[derive(Debug, Clone)]
pub struct RoleProfile {
    pub name: String,
    pub uwb_role: UwbRole,
    pub secure_role: ChannelRole,
    pub discovery: DiscoveryMode,
    pub capability: DeviceCapability,
    pub peer_info: PeerInfo,
    pub adf: AdfParams,
    /// `None` for unicast sessions
    pub shared_session_id: Option<i32>,
    pub supplier: Arc<dyn SessionConfigurationSupplier>,
}

/// OID of the PACS ADF
pub const PACS_ADF_OID: [u8; 9] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x0A, 0x01];

fn pacs_capability(role: DeviceRole) -> DeviceCapability {
    DeviceCapability::builder()
        .device_role(role)
        .ranging_method(RangingMethod::DsTwrDeferred)
        .sts_config(StsConfig::Dynamic)
        .multi_node_mode(MultiNodeMode::OneToMany)
        .channel(Channel::Ch9)
        .rframe_config(RframeConfig::Sp3)
        .build()
}

impl RoleProfile {
    /// PACS reader: scans, controls ranging and initiates the secure channel
    pub fn pacs_controller() -> Self {
        let capability = pacs_capability(DeviceRole::Initiator);
        Self {
            name: "pacs-controller".to_string(),
            uwb_role: UwbRole::Controller,
            secure_role: ChannelRole::Initiator,
            discovery: DiscoveryMode::Scan,
            peer_info: PeerInfo::new(Some(capability.clone())),
            capability,
            adf: AdfParams {
                oid: PACS_ADF_OID.to_vec(),
                secure_blob: None,
                peer_oids: vec![PACS_ADF_OID.to_vec()],
            },
            shared_session_id: None,
            supplier: Arc::new(DefaultConfigurationSupplier::default()),
        }
    }

    /// PACS credential: advertises, is controlled and responds
    pub fn pacs_controlee() -> Self {
        let capability = pacs_capability(DeviceRole::Responder);
        Self {
            name: "pacs-controlee".to_string(),
            uwb_role: UwbRole::Controlee,
            secure_role: ChannelRole::Responder,
            discovery: DiscoveryMode::Advertise,
            peer_info: PeerInfo::new(Some(capability.clone())),
            capability,
            adf: AdfParams {
                oid: PACS_ADF_OID.to_vec(),
                secure_blob: None,
                peer_oids: vec![PACS_ADF_OID.to_vec()],
            },
            shared_session_id: None,
            supplier: Arc::new(DefaultConfigurationSupplier::default()),
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "pacs-controller" => Some(Self::pacs_controller()),
            "pacs-controlee" => Some(Self::pacs_controlee()),
            _ => None,
        }
    }

    pub fn driver_role(&self) -> DriverRole {
        DriverRole::new(self.uwb_role, self.secure_role)
    }

    pub fn is_unicast(&self) -> bool {
        self.shared_session_id.is_none()
    }

    /// Multicast variant sharing one session id across controlees
    pub fn with_shared_session_id(mut self, shared_session_id: i32) -> Self {
        self.shared_session_id = Some(shared_session_id);
        self.supplier = Arc::new(DefaultConfigurationSupplier {
            shared_session_id: Some(shared_session_id),
            config_params: None,
        });
        self
    }

    pub fn with_adf(mut self, adf: AdfParams) -> Self {
        self.adf = adf;
        self
    }

    pub fn with_supplier(mut self, supplier: Arc<dyn SessionConfigurationSupplier>) -> Self {
        self.supplier = supplier;
        self
    }
}
