//! Secure element access, the FiRa secure channel and the session protocol driver
//!
//! Layering:
//! - [`SecureElement`]: APDU pipe to the local applet
//! - [`TransportProvider`]: out-of-band byte pipe to the peer
//! - [`SecureChannel`]: opens the SE channel, selects the ADF, relays the
//!   peer's payloads through DISPATCH and tunnels ours through TUNNEL
//! - [`SessionDriver`]: role strategy on top of the channel that exchanges
//!   `PeerInfo` and `SessionConfiguration` and reports the outcome

pub mod channel;
pub mod driver;

pub use channel::{AdfParams, ChannelEvent, ChannelRole, ChannelStatus, SecureChannel, SetupError};
pub use driver::{
    DriverAction, DriverParams, DriverRole, SecureSessionEvent, SessionDriver, TimerId, TimerKind,
};

use crate::csml::{CommandApdu, ResponseApdu, StatusWord};
use crate::session::PeerDevice;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SeError {
    #[error("Secure element unavailable: {0}")]
    Unavailable(String),

    #[error("Secure element channel is not open")]
    ChannelClosed,

    #[error("Secure element I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not started")]
    NotStarted,

    #[error("Transport send failed: {0}")]
    SendFailed(String),

    #[error("Transport setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is abnormal and must be discarded")]
    Abnormal,

    #[error("Illegal channel state: {0:?}")]
    IllegalState(ChannelStatus),

    #[error("Operation not supported for the responder")]
    Unsupported,

    #[error("Applet returned {0}")]
    Status(StatusWord),

    #[error("Applet reply carried no outbound data")]
    NoOutboundData,

    #[error(transparent)]
    SecureElement(#[from] SeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// APDU access to the local secure element
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecureElement: Send + Sync {
    /// Bind to the secure element service
    async fn connect(&self) -> Result<(), SeError>;

    /// Open a logical channel to the FiRa applet, returning the SELECT reply
    async fn open_channel(&self) -> Result<ResponseApdu, SeError>;

    async fn transmit(&self, apdu: &CommandApdu) -> Result<ResponseApdu, SeError>;

    async fn close_channel(&self) -> Result<(), SeError>;

    fn is_open(&self) -> bool;
}

/// Out-of-band data pipe to the peer device
///
/// Received bytes come back to the session as
/// [`crate::session::CollaboratorEvent::TransportData`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn init(&self, peer: &PeerDevice) -> Result<(), TransportError>;

    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;
}
