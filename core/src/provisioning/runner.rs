// Provisioning script runner
//
// Executes a verified script against the secure element. Callbacks are
// delivered only once every APDU has succeeded; a failing script changes
// nothing visible to the caller beyond the error.

use super::script::ProvisioningScript;
use super::ProvisioningError;
use crate::csml::{CommandApdu, OID_TAG, SECURE_BLOB_TAG};
use crate::secure::SecureElement;
use crate::tlv::ber;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INS_CREATE_ADF: u8 = 0xE0;
const INS_MANAGE_ADF: u8 = 0xEA;
const INS_IMPORT_ADF: u8 = 0xEB;
const INS_DELETE_ADF: u8 = 0xE4;

/// P1 of the last MANAGE ADF of a sequence
const FINAL_COMMAND_P1: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduCategory {
    CreateAdf,
    ManageAdf,
    ImportAdf,
    DeleteAdf,
    General,
    NotAllowed,
}

fn is_secure_messaging(cla: u8) -> bool {
    cla & 0x84 == 0x84 || cla & 0xE0 == 0xE0
}

pub fn categorize(apdu: &CommandApdu) -> ApduCategory {
    if is_secure_messaging(apdu.cla) {
        return match apdu.ins {
            INS_CREATE_ADF => ApduCategory::CreateAdf,
            INS_MANAGE_ADF => ApduCategory::ManageAdf,
            INS_IMPORT_ADF => ApduCategory::ImportAdf,
            INS_DELETE_ADF => ApduCategory::DeleteAdf,
            _ => ApduCategory::General,
        };
    }
    // DELETE ADF outside secure messaging
    if apdu.ins == INS_DELETE_ADF {
        return ApduCategory::NotAllowed;
    }
    ApduCategory::General
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    Created { oid: Vec<u8> },
    Provisioned { oid: Vec<u8> },
    Imported { oid: Vec<u8>, secure_blob: Vec<u8> },
    Deleted { oid: Vec<u8> },
}

#[cfg_attr(test, mockall::automock)]
pub trait ProvisioningCallback: Send + Sync {
    fn on_adf_created(&self, service_instance_id: Uuid, oid: &[u8]);

    fn on_adf_provisioned(&self, service_instance_id: Uuid, oid: &[u8]);

    fn on_adf_imported(&self, service_instance_id: Uuid, oid: &[u8], secure_blob: &[u8]);

    fn on_adf_deleted(&self, service_instance_id: Uuid, oid: &[u8]);
}

pub struct ScriptRunner {
    se: Arc<dyn SecureElement>,
}

impl ScriptRunner {
    pub fn new(se: Arc<dyn SecureElement>) -> Self {
        Self { se }
    }

    pub async fn run(
        &self,
        script: &ProvisioningScript,
        service_instance_id: Uuid,
        callback: &dyn ProvisioningCallback,
    ) -> Result<Vec<ProvisioningOutcome>, ProvisioningError> {
        let opened = self
            .se
            .open_channel()
            .await
            .map_err(|e| ProvisioningError::OpenChannel(e.to_string()))?;
        if !opened.is_success() {
            self.close().await;
            return Err(ProvisioningError::OpenChannel(opened.sw.to_string()));
        }

        let result = self.execute(script).await;
        self.close().await;
        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(%service_instance_id, error = %e, "Provisioning script failed");
                return Err(e);
            }
        };

        for outcome in &outcomes {
            match outcome {
                ProvisioningOutcome::Created { oid } => {
                    callback.on_adf_created(service_instance_id, oid)
                }
                ProvisioningOutcome::Provisioned { oid } => {
                    callback.on_adf_provisioned(service_instance_id, oid)
                }
                ProvisioningOutcome::Imported { oid, secure_blob } => {
                    callback.on_adf_imported(service_instance_id, oid, secure_blob)
                }
                ProvisioningOutcome::Deleted { oid } => {
                    callback.on_adf_deleted(service_instance_id, oid)
                }
            }
        }
        info!(
            %service_instance_id,
            apdus = script.apdus.len(),
            outcomes = outcomes.len(),
            "Provisioning script completed"
        );
        Ok(outcomes)
    }

    async fn close(&self) {
        if let Err(e) = self.se.close_channel().await {
            warn!(error = %e, "Failed to close SE channel after provisioning");
        }
    }

    async fn execute(
        &self,
        script: &ProvisioningScript,
    ) -> Result<Vec<ProvisioningOutcome>, ProvisioningError> {
        let mut outcomes = Vec::new();
        let mut adf_oid = script.adf_oid.clone();

        for (index, raw) in script.apdus.iter().enumerate() {
            let apdu = CommandApdu::parse(raw)
                .map_err(|source| ProvisioningError::Apdu { index, source })?;
            let category = categorize(&apdu);
            if category == ApduCategory::NotAllowed {
                return Err(ProvisioningError::NotAllowed {
                    index,
                    ins: apdu.ins,
                });
            }

            let response = self.se.transmit(&apdu).await?;
            if !response.is_success() {
                return Err(ProvisioningError::Status {
                    index,
                    sw: response.sw,
                });
            }
            debug!(index, ?category, "Provisioning APDU accepted");
            if category == ApduCategory::General {
                continue;
            }

            let tlvs = ber::parse_all(&response.data)
                .map_err(|e| ProvisioningError::Malformed(format!("response {index}: {e}")))?;
            if adf_oid.is_none() {
                adf_oid = tlvs
                    .iter()
                    .find(|d| d.tag == OID_TAG)
                    .map(|d| d.value.clone());
            }

            let final_command = apdu.p1 == FINAL_COMMAND_P1;
            let oid = match &adf_oid {
                Some(oid) => oid.clone(),
                // intermediate MANAGE commands need no OID yet
                None if category == ApduCategory::ManageAdf && !final_command => continue,
                None => return Err(ProvisioningError::MissingOid { index }),
            };

            match category {
                ApduCategory::CreateAdf => outcomes.push(ProvisioningOutcome::Created { oid }),
                ApduCategory::ManageAdf if final_command => {
                    outcomes.push(ProvisioningOutcome::Provisioned { oid })
                }
                ApduCategory::ImportAdf => {
                    let secure_blob = tlvs
                        .iter()
                        .find(|d| d.tag == SECURE_BLOB_TAG)
                        .map(|d| d.value.clone())
                        .ok_or(ProvisioningError::MissingSecureBlob { index })?;
                    outcomes.push(ProvisioningOutcome::Imported { oid, secure_blob });
                }
                ApduCategory::DeleteAdf => outcomes.push(ProvisioningOutcome::Deleted { oid }),
                _ => {}
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csml::{ResponseApdu, StatusWord};
    use crate::testing::FakeSecureElement;
    use crate::tlv::ber::TlvDatum;

    fn apdu(cla: u8, ins: u8, p1: u8) -> Vec<u8> {
        vec![cla, ins, p1, 0x00]
    }

    fn oid_reply() -> ResponseApdu {
        ResponseApdu::new(TlvDatum::new(OID_TAG, vec![0x2A, 0x01]).encode(), StatusWord::SUCCESS)
    }

    #[test]
    fn test_categories() {
        let parse = |bytes: Vec<u8>| categorize(&CommandApdu::parse(&bytes).unwrap());
        assert_eq!(parse(apdu(0x84, 0xE0, 0)), ApduCategory::CreateAdf);
        assert_eq!(parse(apdu(0xE4, 0xEA, 0)), ApduCategory::ManageAdf);
        assert_eq!(parse(apdu(0x84, 0xEB, 0)), ApduCategory::ImportAdf);
        assert_eq!(parse(apdu(0x84, 0xE4, 0)), ApduCategory::DeleteAdf);
        assert_eq!(parse(apdu(0x80, 0xE4, 0)), ApduCategory::NotAllowed);
        assert_eq!(parse(apdu(0x00, 0xA4, 4)), ApduCategory::General);
        assert_eq!(parse(apdu(0x84, 0x20, 0)), ApduCategory::General);
    }

    #[tokio::test]
    async fn test_create_and_provision() {
        let se = Arc::new(FakeSecureElement::new(|_apdu: &CommandApdu| oid_reply()));
        let runner = ScriptRunner::new(se.clone());
        let script = ProvisioningScript::new(vec![
            apdu(0x00, 0xA4, 0x04),
            apdu(0x84, 0xE0, 0x00),
            apdu(0x84, 0xEA, 0x01),
            apdu(0x84, 0xEA, 0x00),
        ]);
        let id = Uuid::new_v4();

        let mut callback = MockProvisioningCallback::new();
        callback
            .expect_on_adf_created()
            .withf(move |sid, oid| *sid == id && oid == [0x2A, 0x01])
            .times(1)
            .return_const(());
        callback
            .expect_on_adf_provisioned()
            .times(1)
            .return_const(());

        let outcomes = runner.run(&script, id, &callback).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(se.close_count(), 1);
    }

    #[tokio::test]
    async fn test_import_requires_blob() {
        let se = Arc::new(FakeSecureElement::accepting());
        let runner = ScriptRunner::new(se.clone());
        let script = ProvisioningScript::new(vec![apdu(0x84, 0xEB, 0x00)]).with_adf_oid(vec![0x2A]);
        let callback = MockProvisioningCallback::new();

        let err = runner.run(&script, Uuid::new_v4(), &callback).await.unwrap_err();
        assert_eq!(err, ProvisioningError::MissingSecureBlob { index: 0 });
        assert_eq!(se.close_count(), 1);
    }

    #[tokio::test]
    async fn test_import_delivers_blob() {
        let se = Arc::new(FakeSecureElement::new(|_apdu: &CommandApdu| {
            ResponseApdu::new(
                TlvDatum::new(SECURE_BLOB_TAG, vec![0xB1, 0xB2]).encode(),
                StatusWord::SUCCESS,
            )
        }));
        let runner = ScriptRunner::new(se);
        let script = ProvisioningScript::new(vec![apdu(0x84, 0xEB, 0x00)]).with_adf_oid(vec![0x2A]);
        let mut callback = MockProvisioningCallback::new();
        callback
            .expect_on_adf_imported()
            .withf(|_, oid, blob| oid == [0x2A] && blob == [0xB1, 0xB2])
            .times(1)
            .return_const(());

        runner.run(&script, Uuid::new_v4(), &callback).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_delivers_no_callbacks() {
        let mut calls = 0;
        let se = Arc::new(FakeSecureElement::new(move |_apdu: &CommandApdu| {
            calls += 1;
            if calls == 1 {
                oid_reply()
            } else {
                ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED)
            }
        }));
        let runner = ScriptRunner::new(se.clone());
        let script =
            ProvisioningScript::new(vec![apdu(0x84, 0xE0, 0x00), apdu(0x84, 0xEA, 0x00)]);
        // no expectations: any callback panics
        let callback = MockProvisioningCallback::new();

        let err = runner.run(&script, Uuid::new_v4(), &callback).await.unwrap_err();
        assert_eq!(
            err,
            ProvisioningError::Status {
                index: 1,
                sw: StatusWord::CONDITIONS_NOT_SATISFIED
            }
        );
        assert_eq!(se.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unsecured_delete_aborts() {
        let se = Arc::new(FakeSecureElement::accepting());
        let runner = ScriptRunner::new(se.clone());
        let script = ProvisioningScript::new(vec![apdu(0x80, 0xE4, 0x00)]);
        let err = runner
            .run(&script, Uuid::new_v4(), &MockProvisioningCallback::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::NotAllowed { index: 0, ins: 0xE4 });
        assert!(se.transmitted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_oid_on_final_command() {
        let se = Arc::new(FakeSecureElement::accepting());
        let runner = ScriptRunner::new(se);
        let script =
            ProvisioningScript::new(vec![apdu(0x84, 0xEA, 0x01), apdu(0x84, 0xE0, 0x00)]);
        let err = runner
            .run(&script, Uuid::new_v4(), &MockProvisioningCallback::new())
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::MissingOid { index: 1 });
    }

    #[tokio::test]
    async fn test_open_failure() {
        let se = Arc::new(FakeSecureElement::accepting());
        se.fail_open();
        let runner = ScriptRunner::new(se);
        let script = ProvisioningScript::new(vec![apdu(0x84, 0xE0, 0x00)]);
        let err = runner
            .run(&script, Uuid::new_v4(), &MockProvisioningCallback::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::OpenChannel(_)));
    }

    #[test]
    fn test_general_only_script_reports_nothing() {
        let se = Arc::new(FakeSecureElement::accepting());
        let runner = ScriptRunner::new(se.clone());
        let script = ProvisioningScript::new(vec![apdu(0x00, 0xA4, 0x04), apdu(0x80, 0xCA, 0x00)]);
        let outcomes = tokio_test::block_on(runner.run(
            &script,
            Uuid::new_v4(),
            &MockProvisioningCallback::new(),
        ))
        .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(se.transmitted().len(), 2);
        assert!(!se.is_open());
    }
}
