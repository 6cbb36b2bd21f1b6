// Record inspection: TLV hex <-> JSON

use anyhow::{Context, Result};
use clap::ValueEnum;
use uwb_pairing_core::records::{DeviceCapability, PeerInfo, SessionConfiguration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecordKind {
    Capability,
    PeerInfo,
    SessionConfig,
}

/// Decodes TLV bytes into pretty JSON
pub fn inspect(kind: RecordKind, hex_input: &str) -> Result<String> {
    let bytes = hex::decode(hex_input.trim()).context("Record is not valid hex")?;
    let json = match kind {
        RecordKind::Capability => {
            let record = DeviceCapability::from_bytes(&bytes).context("Invalid capability")?;
            serde_json::to_string_pretty(&record)?
        }
        RecordKind::PeerInfo => {
            let record = PeerInfo::from_bytes(&bytes).context("Invalid PeerInfo")?;
            serde_json::to_string_pretty(&record)?
        }
        RecordKind::SessionConfig => {
            let record =
                SessionConfiguration::from_bytes(&bytes).context("Invalid session configuration")?;
            serde_json::to_string_pretty(&record)?
        }
    };
    Ok(json)
}

/// Encodes a JSON record into TLV hex
pub fn encode(kind: RecordKind, json: &str) -> Result<String> {
    let bytes = match kind {
        RecordKind::Capability => {
            let record: DeviceCapability =
                serde_json::from_str(json).context("Failed to parse capability JSON")?;
            record.to_bytes()
        }
        RecordKind::PeerInfo => {
            let record: PeerInfo =
                serde_json::from_str(json).context("Failed to parse PeerInfo JSON")?;
            record.to_bytes()?
        }
        RecordKind::SessionConfig => {
            let record: SessionConfiguration = serde_json::from_str(json)
                .context("Failed to parse session configuration JSON")?;
            record.to_bytes()?
        }
    };
    Ok(hex::encode(bytes))
}
