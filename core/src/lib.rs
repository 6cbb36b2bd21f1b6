// UWB Pairing Core
//
// Negotiates a secure ranging session between two UWB devices: the FiRa
// secure channel through the local secure element, the controller and
// controlee protocol on top of it, and the ranging session lifecycle.

pub mod config;
pub mod csml;
pub mod provisioning;
pub mod records;
pub mod secure;
pub mod session;
pub mod tlv;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use thiserror::Error;

pub use config::{ConfigError, LoggingConfig, PairingConfig};
pub use csml::{ApduError, CommandApdu, ResponseApdu, StatusWord};
pub use provisioning::{
    parse_signed_script, ProvisioningCallback, ProvisioningError, ProvisioningOutcome,
    ProvisioningScript, ScriptRunner, ScriptSigner, SignedScript,
};
pub use records::{DeviceCapability, PeerInfo, RecordError, SessionConfiguration};
pub use secure::{
    ChannelError, SeError, SecureChannel, SecureElement, SessionDriver, TransportError,
    TransportProvider,
};
pub use session::{
    spawn_session, Collaborators, RangingSessionHandle, RangingState, RoleProfile, SessionError,
    SessionHandle, SessionRegistry, SupplyError,
};
pub use tlv::TlvError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum PairingError {
    #[error(transparent)]
    Tlv(#[from] TlvError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Apdu(#[from] ApduError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Supply(#[from] SupplyError),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Installs the global subscriber (idempotent). `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let _ = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert() {
        let err: PairingError = TlvError::TagNotFound(0x81).into();
        assert!(err.to_string().contains("0x81"));

        let err: PairingError = SessionError::NotRunning.into();
        assert!(matches!(err, PairingError::Session(_)));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(&LoggingConfig::default());
        init_logging(&LoggingConfig::default());
    }
}
