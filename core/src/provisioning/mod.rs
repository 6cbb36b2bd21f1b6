//! ADF provisioning from signed scripts

pub mod runner;
pub mod script;

pub use runner::{categorize, ApduCategory, ProvisioningCallback, ProvisioningOutcome, ScriptRunner};
pub use script::{parse_signed_script, ProvisioningScript, ScriptSigner, SignedScript};

use crate::csml::{ApduError, StatusWord};
use crate::secure::SeError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Malformed script: {0}")]
    Malformed(String),

    #[error("Script version {major}.{minor} is not supported")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("Script signature is invalid")]
    InvalidSignature,

    #[error("Script signed by untrusted key {0}")]
    UntrustedKey(String),

    #[error("Cannot open the secure element channel: {0}")]
    OpenChannel(String),

    #[error("APDU {index} is not allowed (INS {ins:02X})")]
    NotAllowed { index: usize, ins: u8 },

    #[error("APDU {index} is malformed: {source}")]
    Apdu { index: usize, source: ApduError },

    #[error("APDU {index} rejected with {sw}")]
    Status { index: usize, sw: StatusWord },

    #[error("ADF OID missing from script and response of APDU {index}")]
    MissingOid { index: usize },

    #[error("Response to APDU {index} carries no secure blob")]
    MissingSecureBlob { index: usize },

    #[error(transparent)]
    SecureElement(#[from] SeError),
}
