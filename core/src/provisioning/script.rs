// Signed provisioning scripts
//
// A script is JSON: `{"version": u16, "apdus": ["hex", ...], "adf_oid": "hex"}`.
// The major version is the high byte of `version`. Scripts travel wrapped in a
// `SignedScript` carrying an ed25519 signature over the canonical script bytes.

use super::ProvisioningError;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

pub const SUPPORTED_MAJOR_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningScript {
    pub version: u16,
    #[serde(with = "hex_list")]
    pub apdus: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_opt")]
    pub adf_oid: Option<Vec<u8>>,
}

impl ProvisioningScript {
    pub fn new(apdus: Vec<Vec<u8>>) -> Self {
        Self {
            version: u16::from(SUPPORTED_MAJOR_VERSION) << 8,
            apdus,
            adf_oid: None,
        }
    }

    pub fn with_adf_oid(mut self, oid: Vec<u8>) -> Self {
        self.adf_oid = Some(oid);
        self
    }

    pub fn major_version(&self) -> u8 {
        (self.version >> 8) as u8
    }

    pub fn minor_version(&self) -> u8 {
        (self.version & 0xFF) as u8
    }

    /// Bytes covered by the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ProvisioningError> {
        serde_json::to_vec(self).map_err(|e| ProvisioningError::Malformed(e.to_string()))
    }

    /// SHA-256 of the canonical bytes, hex encoded
    pub fn digest_hex(&self) -> Result<String, ProvisioningError> {
        Ok(hex::encode(Sha256::digest(self.canonical_bytes()?)))
    }

    fn check(&self) -> Result<(), ProvisioningError> {
        if self.major_version() != SUPPORTED_MAJOR_VERSION {
            return Err(ProvisioningError::UnsupportedVersion {
                major: self.major_version(),
                minor: self.minor_version(),
            });
        }
        if self.apdus.is_empty() {
            return Err(ProvisioningError::Malformed("script has no APDUs".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedScript {
    pub script: ProvisioningScript,
    /// 64-byte ed25519 signature, hex
    pub signature: String,
    /// 32-byte ed25519 public key, hex
    pub public_key: String,
}

impl SignedScript {
    pub fn to_json(&self) -> Result<String, ProvisioningError> {
        serde_json::to_string_pretty(self).map_err(|e| ProvisioningError::Malformed(e.to_string()))
    }

    /// Checks the signature only; trust is decided by [`parse_signed_script`]
    pub fn verify(&self) -> Result<(), ProvisioningError> {
        let key_bytes: [u8; 32] = hex::decode(&self.public_key)
            .map_err(|_| ProvisioningError::InvalidSignature)?
            .try_into()
            .map_err(|_| ProvisioningError::InvalidSignature)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| ProvisioningError::InvalidSignature)?;

        let sig_bytes: [u8; 64] = hex::decode(&self.signature)
            .map_err(|_| ProvisioningError::InvalidSignature)?
            .try_into()
            .map_err(|_| ProvisioningError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify_strict(&self.script.canonical_bytes()?, &signature)
            .map_err(|_| ProvisioningError::InvalidSignature)
    }
}

/// Holder of a script signing key
#[derive(Clone)]
pub struct ScriptSigner {
    signing_key: SigningKey,
}

impl ScriptSigner {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProvisioningError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProvisioningError::Malformed("signing key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Secret key bytes, wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, script: ProvisioningScript) -> Result<SignedScript, ProvisioningError> {
        let signature = self.signing_key.sign(&script.canonical_bytes()?);
        Ok(SignedScript {
            script,
            signature: hex::encode(signature.to_bytes()),
            public_key: self.public_key_hex(),
        })
    }
}

/// Parses a signed script, verifying its signature against the trusted keys
pub fn parse_signed_script(
    bytes: &[u8],
    trusted_keys: &[String],
) -> Result<ProvisioningScript, ProvisioningError> {
    if bytes.is_empty() {
        return Err(ProvisioningError::Malformed("no script content".to_string()));
    }
    let signed: SignedScript =
        serde_json::from_slice(bytes).map_err(|e| ProvisioningError::Malformed(e.to_string()))?;

    if !trusted_keys
        .iter()
        .any(|key| key.eq_ignore_ascii_case(&signed.public_key))
    {
        warn!(key = %signed.public_key, "Script signed by an untrusted key");
        return Err(ProvisioningError::UntrustedKey(signed.public_key));
    }
    signed.verify()?;
    signed.script.check()?;

    debug!(
        version = signed.script.version,
        apdus = signed.script.apdus.len(),
        "Provisioning script accepted"
    );
    Ok(signed.script)
}

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(value.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
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
