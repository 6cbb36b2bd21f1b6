// FiRa secure channel, initiator and responder roles

use super::{ChannelError, SecureElement, TransportProvider};
use crate::csml::{
    command, terminate_session_get_do, CommandApdu, DispatchResponse, Notification, ResponseApdu,
    StatusWord,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Uninitialized,
    Initialized,
    ChannelOpened,
    AdfSelected,
    Established,
    Terminated,
    /// Termination or cleanup failed; the channel must be discarded
    Abnormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    SelectAdf,
    InitiateTransaction,
    OpenSecureElement,
    Dispatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Established { default_session_id: Option<i32> },
    SetupError(SetupError),
    DispatchResponseAvailable(DispatchResponse),
    DispatchCommandFailure,
    Terminated { with_error: bool },
    SeChannelClosed { with_error: bool },
}

/// Applet selection parameters of the running profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdfParams {
    #[serde(with = "hex_bytes")]
    pub oid: Vec<u8>,
    #[serde(default, with = "hex_opt")]
    pub secure_blob: Option<Vec<u8>>,
    #[serde(default, with = "hex_list")]
    pub peer_oids: Vec<Vec<u8>>,
}

pub struct SecureChannel {
    role: ChannelRole,
    se: Arc<dyn SecureElement>,
    transport: Arc<dyn TransportProvider>,
    adf: AdfParams,
    local_info: Vec<u8>,
    shared_session_id: Option<i32>,
    status: ChannelStatus,
    slot: Option<Vec<u8>>,
}

impl SecureChannel {
    /// `local_info` is the encoded local `PeerInfo`, handed to SWAP IN ADF.
    /// `shared_session_id` is set for non-unicast profiles.
    pub fn new(
        role: ChannelRole,
        se: Arc<dyn SecureElement>,
        transport: Arc<dyn TransportProvider>,
        adf: AdfParams,
        local_info: Vec<u8>,
        shared_session_id: Option<i32>,
    ) -> Self {
        Self {
            role,
            se,
            transport,
            adf,
            local_info,
            shared_session_id,
            status: ChannelStatus::Uninitialized,
            slot: None,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn is_established(&self) -> bool {
        self.status == ChannelStatus::Established
    }

    pub async fn init(&mut self) -> Result<Vec<ChannelEvent>, ChannelError> {
        if self.status == ChannelStatus::Abnormal {
            return Err(ChannelError::Abnormal);
        }
        if let Err(e) = self.se.connect().await {
            warn!(error = %e, "Secure element connect failed");
            return Ok(vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)]);
        }
        self.status = ChannelStatus::Initialized;
        debug!(role = ?self.role, "Secure channel initialized");

        match self.role {
            ChannelRole::Initiator => Ok(self.open_as_initiator().await),
            // waits for the remote SELECT
            ChannelRole::Responder => Ok(Vec::new()),
        }
    }

    async fn open_as_initiator(&mut self) -> Vec<ChannelEvent> {
        if let Err(e) = self.se.open_channel().await {
            warn!(error = %e, "Failed to open SE channel");
            return vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)];
        }
        if !self.swap_in_if_provisioned().await {
            return vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)];
        }
        self.status = ChannelStatus::ChannelOpened;

        match self.se.transmit(&command::select_adf(&self.adf.oid)).await {
            Ok(resp) if resp.is_success() => {}
            Ok(resp) => {
                warn!(sw = %resp.sw, "SELECT ADF rejected");
                return vec![ChannelEvent::SetupError(SetupError::SelectAdf)];
            }
            Err(e) => {
                warn!(error = %e, "SELECT ADF failed");
                return vec![ChannelEvent::SetupError(SetupError::SelectAdf)];
            }
        }
        self.status = ChannelStatus::AdfSelected;

        let apdu = command::initiate_transaction(&self.adf.peer_oids, self.shared_session_id);
        let outbound = match self.se.transmit(&apdu).await {
            Ok(resp) => command::outbound_data(&resp).filter(|d| !d.is_empty()),
            Err(e) => {
                warn!(error = %e, "INITIATE TRANSACTION failed");
                None
            }
        };
        match outbound {
            Some(data) => {
                self.send_raw(&data).await;
                Vec::new()
            }
            None => {
                warn!("INITIATE TRANSACTION produced no outbound data");
                vec![ChannelEvent::SetupError(SetupError::InitiateTransaction)]
            }
        }
    }

    async fn swap_in_if_provisioned(&mut self) -> bool {
        let Some(blob) = self.adf.secure_blob.clone() else {
            return true;
        };
        let apdu = command::swap_in_adf(&blob, &self.adf.oid, &self.local_info);
        match self.se.transmit(&apdu).await {
            Ok(resp) => match command::swap_in_slot(&resp) {
                Some(slot) => {
                    debug!(slot = %hex::encode(&slot), "ADF swapped in");
                    self.slot = Some(slot);
                    true
                }
                None => {
                    warn!(sw = %resp.sw, "SWAP IN ADF rejected");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "SWAP IN ADF failed");
                false
            }
        }
    }

    async fn swap_out_adf(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        match self.se.transmit(&command::swap_out_adf(&slot)).await {
            Ok(resp) if resp.is_success() => debug!("ADF swapped out"),
            Ok(resp) => {
                warn!(sw = %resp.sw, "SWAP OUT ADF rejected");
                self.slot = Some(slot);
            }
            Err(e) => {
                warn!(error = %e, "SWAP OUT ADF failed");
                self.slot = Some(slot);
            }
        }
    }

    async fn open_as_responder(&mut self) -> Vec<ChannelEvent> {
        let opened = match self.se.open_channel().await {
            Ok(resp) if resp.is_success() => {
                if self.swap_in_if_provisioned().await {
                    Some(resp)
                } else {
                    if let Err(e) = self.se.close_channel().await {
                        warn!(error = %e, "Closing SE channel after failed swap");
                    }
                    None
                }
            }
            Ok(resp) => {
                warn!(sw = %resp.sw, "Applet select rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to open SE channel");
                None
            }
        };

        match opened {
            Some(resp) => {
                self.status = ChannelStatus::ChannelOpened;
                self.send_raw(&resp.to_bytes()).await;
                Vec::new()
            }
            None => {
                self.status = ChannelStatus::Initialized;
                self.send_raw(&ResponseApdu::status_only(StatusWord::APPLET_SELECT_FAILED).to_bytes())
                    .await;
                vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)]
            }
        }
    }

    /// Bytes received from the peer
    pub async fn handle_remote_data(&mut self, data: &[u8]) -> Vec<ChannelEvent> {
        if self.role == ChannelRole::Responder
            && self.status == ChannelStatus::Initialized
            && command::is_select_command(data)
        {
            return self.open_as_responder().await;
        }

        let response = self.dispatch(data).await;
        if self.status == ChannelStatus::Established {
            return match response {
                Ok(resp) => vec![ChannelEvent::DispatchResponseAvailable(resp)],
                Err(e) => {
                    warn!(error = %e, "DISPATCH failed");
                    vec![ChannelEvent::DispatchCommandFailure]
                }
            };
        }

        match response {
            Ok(resp) if resp.is_success() => self.handle_setup_response(resp).await,
            Ok(resp) => {
                warn!(sw = %resp.status_word, "DISPATCH rejected during setup");
                self.reject_setup().await
            }
            Err(e) => {
                warn!(error = %e, "DISPATCH failed during setup");
                self.reject_setup().await
            }
        }
    }

    async fn dispatch(&self, data: &[u8]) -> Result<DispatchResponse, ChannelError> {
        if !self.se.is_open() {
            return Err(ChannelError::IllegalState(self.status));
        }
        let resp = self.se.transmit(&command::dispatch(data)).await?;
        DispatchResponse::from_response(&resp).map_err(|e| {
            warn!(error = %e, "Malformed DISPATCH reply");
            ChannelError::Status(resp.sw)
        })
    }

    async fn reject_setup(&mut self) -> Vec<ChannelEvent> {
        self.send_raw(&ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED).to_bytes())
            .await;
        vec![ChannelEvent::SetupError(SetupError::Dispatch)]
    }

    async fn handle_setup_response(&mut self, resp: DispatchResponse) -> Vec<ChannelEvent> {
        if let Some(data) = resp.remote_data() {
            self.send_raw(data).await;
        } else if let Some(data) = resp.host_data() {
            debug!(data = %hex::encode(data), "Ignoring data to host during setup");
        }

        let mut events = Vec::new();
        for notification in &resp.notifications {
            match notification {
                Notification::SecureChannelEstablished { default_session_id } => {
                    self.status = ChannelStatus::Established;
                    info!(default_session_id = ?default_session_id, "Secure channel established");
                    events.push(ChannelEvent::Established {
                        default_session_id: *default_session_id,
                    });
                }
                Notification::SecureSessionAborted => {
                    events.extend(self.cleanup().await);
                }
                Notification::AdfSelected { oid } => {
                    debug!(oid = %hex::encode(oid), "ADF selected");
                }
                other => warn!(notification = ?other, "Unexpected notification during setup"),
            }
        }
        events
    }

    /// Wraps `payload` in TUNNEL and forwards the applet's output to the peer
    pub async fn tunnel(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.role == ChannelRole::Responder {
            return Err(ChannelError::Unsupported);
        }
        if self.status != ChannelStatus::Established {
            return Err(ChannelError::IllegalState(self.status));
        }
        let resp = self.se.transmit(&command::tunnel(payload)).await?;
        if !resp.is_success() {
            return Err(ChannelError::Status(resp.sw));
        }
        let outbound = command::outbound_data(&resp).ok_or(ChannelError::NoOutboundData)?;
        self.transport.send(&outbound).await?;
        Ok(())
    }

    /// Unmodified bytes to the peer; failures are logged
    pub async fn send_raw(&self, data: &[u8]) {
        if let Err(e) = self.transport.send(data).await {
            warn!(error = %e, len = data.len(), "Failed to send data to peer");
        }
    }

    /// Command to the local applet, returning the reply data on 9000
    pub async fn send_local_command(&self, apdu: &CommandApdu) -> Result<Vec<u8>, ChannelError> {
        if !self.se.is_open() {
            return Err(ChannelError::IllegalState(self.status));
        }
        let resp = self.se.transmit(apdu).await?;
        if !resp.is_success() {
            warn!(ins = apdu.ins, sw = %resp.sw, "Applet rejected local command");
            return Err(ChannelError::Status(resp.sw));
        }
        Ok(resp.data)
    }

    pub async fn terminate_locally(&mut self) -> Vec<ChannelEvent> {
        if self.status != ChannelStatus::Established {
            return vec![ChannelEvent::Terminated { with_error: false }];
        }
        let apdu = command::get_data(&terminate_session_get_do());
        match self.se.transmit(&apdu).await {
            Ok(resp) if resp.is_success() => {
                self.status = ChannelStatus::Terminated;
                info!("Secure session terminated");
                vec![ChannelEvent::Terminated { with_error: false }]
            }
            Ok(resp) => {
                warn!(sw = %resp.sw, "Terminate session rejected");
                self.status = ChannelStatus::Abnormal;
                vec![ChannelEvent::Terminated { with_error: true }]
            }
            Err(e) => {
                warn!(error = %e, "Terminate session failed");
                self.status = ChannelStatus::Abnormal;
                vec![ChannelEvent::Terminated { with_error: true }]
            }
        }
    }

    /// Swap out and close; safe from any state
    pub async fn cleanup(&mut self) -> Vec<ChannelEvent> {
        self.swap_out_adf().await;
        match self.se.close_channel().await {
            Ok(()) => {
                self.status = ChannelStatus::Initialized;
                vec![ChannelEvent::SeChannelClosed { with_error: false }]
            }
            Err(e) => {
                warn!(error = %e, "Error closing SE channel");
                self.status = ChannelStatus::Abnormal;
                vec![ChannelEvent::SeChannelClosed { with_error: true }]
            }
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        hex::decode(String::deserialize(d)?).map_err(serde::de::Error::custom)
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

mod hex_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(value.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csml::dispatch::build;
    use crate::secure::{MockSecureElement, MockTransportProvider, SeError};
    use parking_lot::Mutex;

    fn ok(data: Vec<u8>) -> ResponseApdu {
        ResponseApdu::new(data, StatusWord::SUCCESS)
    }

    fn recording_transport() -> (MockTransportProvider, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let mut transport = MockTransportProvider::new();
        transport.expect_send().returning(move |data| {
            sink.lock().push(data.to_vec());
            Ok(())
        });
        (transport, sent)
    }

    fn adf() -> AdfParams {
        AdfParams {
            oid: vec![0x2A, 0x01],
            secure_blob: None,
            peer_oids: vec![vec![0x2A, 0x02]],
        }
    }

    fn channel(role: ChannelRole, se: MockSecureElement, transport: MockTransportProvider) -> SecureChannel {
        SecureChannel::new(role, Arc::new(se), Arc::new(transport), adf(), vec![0x80, 2, 1, 1], None)
    }

    #[tokio::test]
    async fn test_initiator_init_sends_initiate_transaction_output() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel().returning(|| Ok(ok(vec![])));
        se.expect_transmit().returning(|apdu| match apdu.ins {
            command::INS_SELECT_ADF => Ok(ok(vec![])),
            command::INS_INITIATE_TRANSACTION => Ok(ok(vec![0x71, 4, 0x81, 2, 0xCA, 0xFE])),
            _ => Ok(ResponseApdu::status_only(StatusWord::UNKNOWN_ERROR)),
        });
        let (transport, sent) = recording_transport();

        let mut ch = channel(ChannelRole::Initiator, se, transport);
        let events = ch.init().await.unwrap();
        assert!(events.is_empty());
        assert_eq!(ch.status(), ChannelStatus::AdfSelected);
        assert_eq!(sent.lock().as_slice(), &[vec![0xCA, 0xFE]]);
    }

    #[tokio::test]
    async fn test_initiator_select_failure() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel().returning(|| Ok(ok(vec![])));
        se.expect_transmit()
            .returning(|_| Ok(ResponseApdu::status_only(StatusWord::FILE_NOT_FOUND)));
        let (transport, _) = recording_transport();

        let mut ch = channel(ChannelRole::Initiator, se, transport);
        let events = ch.init().await.unwrap();
        assert_eq!(events, vec![ChannelEvent::SetupError(SetupError::SelectAdf)]);
        assert_eq!(ch.status(), ChannelStatus::ChannelOpened);
    }

    #[tokio::test]
    async fn test_swap_in_rejection_reported_as_open_failure() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel().returning(|| Ok(ok(vec![])));
        se.expect_transmit()
            .withf(|apdu| apdu.ins == command::INS_SWAP_ADF)
            .times(1)
            .returning(|_| Ok(ResponseApdu::status_only(StatusWord::CONDITIONS_NOT_SATISFIED)));
        let (transport, _) = recording_transport();

        let mut params = adf();
        params.secure_blob = Some(vec![0xB1, 0xB2]);
        let mut ch = SecureChannel::new(
            ChannelRole::Initiator,
            Arc::new(se),
            Arc::new(transport),
            params,
            vec![0x80, 2, 1, 1],
            None,
        );
        let events = ch.init().await.unwrap();
        assert_eq!(events, vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)]);
        assert_eq!(ch.status(), ChannelStatus::Initialized);
    }

    #[tokio::test]
    async fn test_connect_failure_stays_uninitialized() {
        let mut se = MockSecureElement::new();
        se.expect_connect()
            .returning(|| Err(SeError::Unavailable("no service".into())));
        let (transport, _) = recording_transport();

        let mut ch = channel(ChannelRole::Responder, se, transport);
        let events = ch.init().await.unwrap();
        assert_eq!(events, vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)]);
        assert_eq!(ch.status(), ChannelStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_responder_select_success_acknowledges() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel()
            .returning(|| Ok(ok(vec![0x6F, 0x00])));
        let (transport, sent) = recording_transport();

        let mut ch = channel(ChannelRole::Responder, se, transport);
        ch.init().await.unwrap();
        let events = ch.handle_remote_data(&[0x00, 0xA4, 0x04, 0x00, 0x01, 0xA0]).await;
        assert!(events.is_empty());
        assert_eq!(ch.status(), ChannelStatus::ChannelOpened);
        assert_eq!(sent.lock().as_slice(), &[vec![0x6F, 0x00, 0x90, 0x00]]);
    }

    #[tokio::test]
    async fn test_responder_select_failure_reverts() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel()
            .returning(|| Err(SeError::Io("busy".into())));
        let (transport, sent) = recording_transport();

        let mut ch = channel(ChannelRole::Responder, se, transport);
        ch.init().await.unwrap();
        let events = ch.handle_remote_data(&[0x00, 0xA4, 0x04, 0x00]).await;
        assert_eq!(events, vec![ChannelEvent::SetupError(SetupError::OpenSecureElement)]);
        assert_eq!(ch.status(), ChannelStatus::Initialized);
        assert_eq!(sent.lock().as_slice(), &[vec![0x69, 0x99]]);
    }

    #[tokio::test]
    async fn test_established_notification() {
        let mut se = MockSecureElement::new();
        se.expect_connect().returning(|| Ok(()));
        se.expect_open_channel().returning(|| Ok(ok(vec![])));
        se.expect_is_open().return_const(true);
        se.expect_transmit().returning(|_| {
            Ok(ok(build::response(0x80, Some(&[0x01]), &[build::established(Some(5))])))
        });
        let (transport, sent) = recording_transport();

        let mut ch = channel(ChannelRole::Responder, se, transport);
        ch.init().await.unwrap();
        ch.handle_remote_data(&[0x00, 0xA4, 0x04, 0x00]).await;
        let events = ch.handle_remote_data(&[0x11, 0x22]).await;
        assert_eq!(events, vec![ChannelEvent::Established { default_session_id: Some(5) }]);
        assert!(ch.is_established());
        assert_eq!(sent.lock().last().cloned(), Some(vec![0x01]));
    }

    #[tokio::test]
    async fn test_dispatch_error_before_established() {
        let mut se = MockSecureElement::new();
        se.expect_is_open().return_const(true);
        se.expect_transmit()
            .returning(|_| Ok(ResponseApdu::status_only(StatusWord::UNKNOWN_ERROR)));
        let (transport, sent) = recording_transport();

        let mut ch = channel(ChannelRole::Initiator, se, transport);
        let events = ch.handle_remote_data(&[0x01]).await;
        assert_eq!(events, vec![ChannelEvent::SetupError(SetupError::Dispatch)]);
        assert_eq!(sent.lock().as_slice(), &[vec![0x69, 0x85]]);
    }

    #[tokio::test]
    async fn test_tunnel_requires_established() {
        let se = MockSecureElement::new();
        let (transport, _) = recording_transport();
        let mut ch = channel(ChannelRole::Initiator, se, transport);
        assert_eq!(
            ch.tunnel(&[1]).await,
            Err(ChannelError::IllegalState(ChannelStatus::Uninitialized))
        );

        let se = MockSecureElement::new();
        let (transport, _) = recording_transport();
        let mut ch = channel(ChannelRole::Responder, se, transport);
        assert_eq!(ch.tunnel(&[1]).await, Err(ChannelError::Unsupported));
    }

    #[tokio::test]
    async fn test_terminate_locally_not_established() {
        let se = MockSecureElement::new();
        let (transport, _) = recording_transport();
        let mut ch = channel(ChannelRole::Initiator, se, transport);
        assert_eq!(
            ch.terminate_locally().await,
            vec![ChannelEvent::Terminated { with_error: false }]
        );
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_abnormal() {
        let mut se = MockSecureElement::new();
        se.expect_close_channel()
            .returning(|| Err(SeError::Io("stuck".into())));
        let (transport, _) = recording_transport();
        let mut ch = channel(ChannelRole::Initiator, se, transport);
        assert_eq!(
            ch.cleanup().await,
            vec![ChannelEvent::SeChannelClosed { with_error: true }]
        );
        assert_eq!(ch.status(), ChannelStatus::Abnormal);
        assert_eq!(ch.init().await, Err(ChannelError::Abnormal));
    }

    #[test]
    fn test_adf_params_json() {
        let params = adf();
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"2a01\""));
        let back: AdfParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
