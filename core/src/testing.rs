//! In-memory collaborators for tests and dry runs
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! integration tests.

use crate::csml::{CommandApdu, ResponseApdu, StatusWord};
use crate::records::SessionConfiguration;
use crate::secure::{SeError, SecureElement, TransportError, TransportProvider};
use crate::session::state::CallbackKind;
use crate::session::{
    CollaboratorError, Collaborators, DiscoveryMode, DiscoveryProvider, PeerDevice, RadioControl,
    RangingCallbacks, ReasonCode, SessionHandle, SessionInfo,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

type ApduHandler = Box<dyn FnMut(&CommandApdu) -> ResponseApdu + Send>;

/// Secure element whose applet is a closure
pub struct FakeSecureElement {
    handler: Mutex<ApduHandler>,
    open: Mutex<bool>,
    fail_connect: Mutex<bool>,
    fail_open: Mutex<bool>,
    failing_ins: Mutex<HashSet<u8>>,
    transmitted: Mutex<Vec<CommandApdu>>,
    closes: Mutex<usize>,
}

impl FakeSecureElement {
    pub fn new(handler: impl FnMut(&CommandApdu) -> ResponseApdu + Send + 'static) -> Self {
        Self {
            handler: Mutex::new(Box::new(handler)),
            open: Mutex::new(false),
            fail_connect: Mutex::new(false),
            fail_open: Mutex::new(false),
            failing_ins: Mutex::new(HashSet::new()),
            transmitted: Mutex::new(Vec::new()),
            closes: Mutex::new(0),
        }
    }

    /// Applet answering 9000 to everything
    pub fn accepting() -> Self {
        Self::new(|_apdu: &CommandApdu| ResponseApdu::status_only(StatusWord::SUCCESS))
    }

    pub fn fail_connect(&self) {
        *self.fail_connect.lock() = true;
    }

    pub fn fail_open(&self) {
        *self.fail_open.lock() = true;
    }

    /// Transmits of this instruction fail with an I/O error from now on
    pub fn fail_transmit_ins(&self, ins: u8) {
        self.failing_ins.lock().insert(ins);
    }

    pub fn transmitted(&self) -> Vec<CommandApdu> {
        self.transmitted.lock().clone()
    }

    pub fn transmitted_ins(&self) -> Vec<u8> {
        self.transmitted.lock().iter().map(|apdu| apdu.ins).collect()
    }

    pub fn count_ins(&self, ins: u8) -> usize {
        self.transmitted.lock().iter().filter(|apdu| apdu.ins == ins).count()
    }

    pub fn close_count(&self) -> usize {
        *self.closes.lock()
    }
}

#[async_trait]
impl SecureElement for FakeSecureElement {
    async fn connect(&self) -> Result<(), SeError> {
        if *self.fail_connect.lock() {
            return Err(SeError::Unavailable("fake".to_string()));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<ResponseApdu, SeError> {
        if *self.fail_open.lock() {
            return Err(SeError::Io("open refused".to_string()));
        }
        *self.open.lock() = true;
        Ok(ResponseApdu::status_only(StatusWord::SUCCESS))
    }

    async fn transmit(&self, apdu: &CommandApdu) -> Result<ResponseApdu, SeError> {
        if !*self.open.lock() {
            return Err(SeError::ChannelClosed);
        }
        self.transmitted.lock().push(apdu.clone());
        if self.failing_ins.lock().contains(&apdu.ins) {
            return Err(SeError::Io(format!("INS {:02X} failed", apdu.ins)));
        }
        let mut guard = self.handler.lock();
        let handler: &mut ApduHandler = &mut guard;
        Ok(handler(apdu))
    }

    async fn close_channel(&self) -> Result<(), SeError> {
        *self.open.lock() = false;
        *self.closes.lock() += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }
}

/// Transport that records what is sent to the peer
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    peers: Mutex<Vec<PeerDevice>>,
    fail_init: Mutex<bool>,
    fail_send: Mutex<bool>,
    started: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_init(&self) {
        *self.fail_init.lock() = true;
    }

    pub fn fail_send(&self) {
        *self.fail_send.lock() = true;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Drains what was sent so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn peers(&self) -> Vec<PeerDevice> {
        self.peers.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }
}

#[async_trait]
impl TransportProvider for RecordingTransport {
    async fn init(&self, peer: &PeerDevice) -> Result<(), TransportError> {
        if *self.fail_init.lock() {
            return Err(TransportError::Setup(format!("cannot reach {}", peer.id)));
        }
        self.peers.lock().push(peer.clone());
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        *self.started.lock() = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        *self.started.lock() = false;
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if *self.fail_send.lock() {
            return Err(TransportError::SendFailed("fake".to_string()));
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDiscovery {
    started: Mutex<Vec<DiscoveryMode>>,
    stops: Mutex<usize>,
}

impl FakeDiscovery {
    pub fn started(&self) -> Vec<DiscoveryMode> {
        self.started.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        *self.stops.lock()
    }
}

#[async_trait]
impl DiscoveryProvider for FakeDiscovery {
    async fn start_discovery(&self, mode: DiscoveryMode) -> Result<(), CollaboratorError> {
        self.started.lock().push(mode);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), CollaboratorError> {
        *self.stops.lock() += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Open {
        session_id: i32,
        config: SessionConfiguration,
    },
    Start(SessionHandle),
    Stop(SessionHandle),
    Close(SessionHandle),
}

/// Radio that accepts every request and records it
#[derive(Default)]
pub struct FakeRadio {
    calls: Mutex<Vec<RadioCall>>,
}

impl FakeRadio {
    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RadioControl for FakeRadio {
    async fn open_ranging(
        &self,
        info: &SessionInfo,
        config: &SessionConfiguration,
    ) -> Result<(), CollaboratorError> {
        self.calls.lock().push(RadioCall::Open {
            session_id: info.session_id,
            config: config.clone(),
        });
        Ok(())
    }

    async fn start_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError> {
        self.calls.lock().push(RadioCall::Start(handle));
        Ok(())
    }

    async fn stop_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError> {
        self.calls.lock().push(RadioCall::Stop(handle));
        Ok(())
    }

    async fn close_ranging(&self, handle: SessionHandle) -> Result<(), CollaboratorError> {
        self.calls.lock().push(RadioCall::Close(handle));
        Ok(())
    }
}

/// Upward callbacks collected in order
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<(CallbackKind, ReasonCode)>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<(CallbackKind, ReasonCode)> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: CallbackKind) -> usize {
        self.events.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    fn record(&self, kind: CallbackKind, reason: ReasonCode) {
        self.events.lock().push((kind, reason));
    }
}

impl RangingCallbacks for RecordingCallbacks {
    fn on_opened(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::Opened, reason);
    }

    fn on_open_failed(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::OpenFailed, reason);
    }

    fn on_started(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::Started, reason);
    }

    fn on_start_failed(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::StartFailed, reason);
    }

    fn on_stopped(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::Stopped, reason);
    }

    fn on_closed(&self, _handle: SessionHandle, reason: ReasonCode, _params: &[u8]) {
        self.record(CallbackKind::Closed, reason);
    }
}

/// Concrete fakes behind a [`Collaborators`] bundle
pub struct FakeCollaborators {
    pub discovery: Arc<FakeDiscovery>,
    pub transport: Arc<RecordingTransport>,
    pub secure_element: Arc<FakeSecureElement>,
    pub radio: Arc<FakeRadio>,
    pub callbacks: Arc<RecordingCallbacks>,
}

impl FakeCollaborators {
    pub fn with_secure_element(secure_element: Arc<FakeSecureElement>) -> Self {
        Self {
            discovery: Arc::new(FakeDiscovery::default()),
            transport: Arc::new(RecordingTransport::new()),
            secure_element,
            radio: Arc::new(FakeRadio::default()),
            callbacks: Arc::new(RecordingCallbacks::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            discovery: self.discovery.clone(),
            transport: self.transport.clone(),
            secure_element: self.secure_element.clone(),
            radio: self.radio.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

/// Fresh fakes with an always-accepting applet
pub fn fake_collaborators() -> (Collaborators, FakeCollaborators) {
    let fakes = FakeCollaborators::with_secure_element(Arc::new(FakeSecureElement::accepting()));
    (fakes.collaborators(), fakes)
}
