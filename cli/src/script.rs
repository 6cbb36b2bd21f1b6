// Provisioning script tooling: keys, signing, verification and dry runs

use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use uwb_pairing_core::csml::{CommandApdu, ResponseApdu, StatusWord, OID_TAG, SECURE_BLOB_TAG};
use uwb_pairing_core::provisioning::{
    categorize, parse_signed_script, ApduCategory, ProvisioningCallback, ProvisioningOutcome,
    ProvisioningScript, ScriptRunner, ScriptSigner,
};
use uwb_pairing_core::secure::{SeError, SecureElement};
use uwb_pairing_core::tlv::ber::TlvDatum;

/// OID reported by the dry-run applet when the script names none
const DRY_RUN_OID: [u8; 3] = [0x2A, 0x00, 0x01];

/// Writes a fresh signing key (hex) and returns its public key
pub fn keygen(out: &Path) -> Result<String> {
    let signer = ScriptSigner::generate();
    let secret = signer.to_bytes();
    std::fs::write(out, hex::encode(secret.as_slice()))
        .with_context(|| format!("Failed to write key to {}", out.display()))?;
    Ok(signer.public_key_hex())
}

fn load_signer(key: &Path) -> Result<ScriptSigner> {
    let raw = std::fs::read_to_string(key)
        .with_context(|| format!("Failed to read key from {}", key.display()))?;
    let bytes = hex::decode(raw.trim()).context("Key file is not valid hex")?;
    Ok(ScriptSigner::from_bytes(&bytes)?)
}

/// Signs an unsigned script file and returns the signed JSON
pub fn sign(key: &Path, script: &Path) -> Result<String> {
    let signer = load_signer(key)?;
    let contents = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read script {}", script.display()))?;
    let script: ProvisioningScript =
        serde_json::from_str(&contents).context("Failed to parse script JSON")?;
    Ok(signer.sign(script)?.to_json()?)
}

/// Parses and verifies a signed script against the trusted keys
pub fn verify(signed: &Path, trusted: &[String]) -> Result<ProvisioningScript> {
    let bytes = std::fs::read(signed)
        .with_context(|| format!("Failed to read signed script {}", signed.display()))?;
    Ok(parse_signed_script(&bytes, trusted)?)
}

pub fn print_summary(script: &ProvisioningScript) -> Result<()> {
    println!("{}", "Provisioning Script".bold());
    println!(
        "  Version: {}.{}",
        script.major_version(),
        script.minor_version()
    );
    println!("  Digest:  {}", script.digest_hex()?.bright_yellow());
    if let Some(oid) = &script.adf_oid {
        println!("  ADF OID: {}", hex::encode(oid).bright_cyan());
    }
    println!("  APDUs:   {}", script.apdus.len());
    for (index, raw) in script.apdus.iter().enumerate() {
        let category = match CommandApdu::parse(raw) {
            Ok(apdu) => format!("{:?}", categorize(&apdu)),
            Err(e) => format!("malformed ({e})"),
        };
        println!("    {:>3} {} {}", index, hex::encode(raw).dimmed(), category);
    }
    Ok(())
}

/// Prints ADF events as the runner reports them
struct PrintingCallback;

impl ProvisioningCallback for PrintingCallback {
    fn on_adf_created(&self, _id: Uuid, oid: &[u8]) {
        println!("  {} ADF created      {}", "✓".green(), hex::encode(oid));
    }

    fn on_adf_provisioned(&self, _id: Uuid, oid: &[u8]) {
        println!("  {} ADF provisioned  {}", "✓".green(), hex::encode(oid));
    }

    fn on_adf_imported(&self, _id: Uuid, oid: &[u8], secure_blob: &[u8]) {
        println!(
            "  {} ADF imported     {} ({} byte blob)",
            "✓".green(),
            hex::encode(oid),
            secure_blob.len()
        );
    }

    fn on_adf_deleted(&self, _id: Uuid, oid: &[u8]) {
        println!("  {} ADF deleted      {}", "✓".green(), hex::encode(oid));
    }
}

/// In-memory applet answering like a provisioning-capable SE
struct DryRunApplet {
    oid: Vec<u8>,
    open: AtomicBool,
}

impl DryRunApplet {
    fn new(oid: Vec<u8>) -> Self {
        Self {
            oid,
            open: AtomicBool::new(false),
        }
    }

    fn reply(&self, apdu: &CommandApdu) -> ResponseApdu {
        match categorize(apdu) {
            ApduCategory::CreateAdf => ResponseApdu::new(
                TlvDatum::new(OID_TAG, self.oid.clone()).encode(),
                StatusWord::SUCCESS,
            ),
            ApduCategory::ImportAdf => {
                let mut data = TlvDatum::new(OID_TAG, self.oid.clone()).encode();
                data.extend(TlvDatum::new(SECURE_BLOB_TAG, vec![0u8; 16]).encode());
                ResponseApdu::new(data, StatusWord::SUCCESS)
            }
            _ => ResponseApdu::status_only(StatusWord::SUCCESS),
        }
    }
}

#[async_trait]
impl SecureElement for DryRunApplet {
    async fn connect(&self) -> Result<(), SeError> {
        Ok(())
    }

    async fn open_channel(&self) -> Result<ResponseApdu, SeError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(ResponseApdu::status_only(StatusWord::SUCCESS))
    }

    async fn transmit(&self, apdu: &CommandApdu) -> Result<ResponseApdu, SeError> {
        if !self.is_open() {
            return Err(SeError::ChannelClosed);
        }
        Ok(self.reply(apdu))
    }

    async fn close_channel(&self) -> Result<(), SeError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Runs a verified script against the in-memory applet
pub async fn dry_run(script: &ProvisioningScript) -> Result<Vec<ProvisioningOutcome>> {
    let oid = script
        .adf_oid
        .clone()
        .unwrap_or_else(|| DRY_RUN_OID.to_vec());
    let runner = ScriptRunner::new(Arc::new(DryRunApplet::new(oid)));
    let outcomes = runner
        .run(script, Uuid::new_v4(), &PrintingCallback)
        .await
        .context("Dry run failed")?;
    Ok(outcomes)
}
