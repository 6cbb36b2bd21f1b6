//! Session protocol driver
//!
//! Runs one of four role strategies on top of a [`SecureChannel`]:
//!
//! | strategy              | channel   | exchange                                  |
//! |-----------------------|-----------|-------------------------------------------|
//! | `ControleeInitiator`  | initiator | PUT PeerInfo, then GET session data       |
//! | `ControllerInitiator` | initiator | GET PeerInfo, then PUT session data       |
//! | `ControllerResponder` | responder | build session data when PeerInfo arrives  |
//! | `ControleeResponder`  | responder | read session data when RDS is available   |
//!
//! The driver never sleeps or spawns. Timers and notifications are returned
//! as [`DriverAction`]s for the owning session task to execute, and expired
//! timers come back through [`SessionDriver::on_timer`].
//!
//! Exactly one of [`SecureSessionEvent::Aborted`] or
//! [`SecureSessionEvent::Terminated`] is reported per run. Once either has
//! been reported no further tunnel commands are issued.

use super::channel::{ChannelEvent, ChannelRole, ChannelStatus, SecureChannel};
use crate::csml::{
    be_bytes_to_i32, command, controlee_info_do, generate_random_session_id, get_do,
    is_controlee_info_do, is_session_data_do, peer_info_from_do, session_config_from_do,
    session_data_do, terminate_session_get_do, wrap_do, CommandApdu, DispatchKind,
    DispatchResponse, StatusWord, CONTROLEE_INFO_DO_TAG, EXTENDED_HEAD_LIST_TAG,
    SESSION_DATA_DO_TAG,
};
use crate::records::{DeviceCapability, PeerInfo, SessionConfiguration};
use crate::session::profile::{SessionConfigurationSupplier, UwbRole};
use crate::tlv::ber::TlvDatum;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default wait for a tunnelled request's reply
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Delay before asking again for session data the peer does not have yet
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRole {
    ControleeInitiator,
    ControllerInitiator,
    ControllerResponder,
    ControleeResponder,
}

impl DriverRole {
    pub fn new(uwb_role: UwbRole, channel_role: ChannelRole) -> Self {
        match (uwb_role, channel_role) {
            (UwbRole::Controlee, ChannelRole::Initiator) => DriverRole::ControleeInitiator,
            (UwbRole::Controller, ChannelRole::Initiator) => DriverRole::ControllerInitiator,
            (UwbRole::Controller, ChannelRole::Responder) => DriverRole::ControllerResponder,
            (UwbRole::Controlee, ChannelRole::Responder) => DriverRole::ControleeResponder,
        }
    }

    pub fn channel_role(self) -> ChannelRole {
        match self {
            DriverRole::ControleeInitiator | DriverRole::ControllerInitiator => ChannelRole::Initiator,
            DriverRole::ControllerResponder | DriverRole::ControleeResponder => ChannelRole::Responder,
        }
    }

    pub fn is_controller(self) -> bool {
        matches!(self, DriverRole::ControllerInitiator | DriverRole::ControllerResponder)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    TunnelTimeout,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureSessionEvent {
    SessionDataReady {
        session_id: i32,
        data: Option<SessionConfiguration>,
        terminated: bool,
    },
    Aborted,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    Notify(SecureSessionEvent),
    StartTimer {
        id: TimerId,
        kind: TimerKind,
        after: Duration,
    },
    CancelTimer {
        id: TimerId,
    },
}

pub struct DriverParams {
    pub local_peer_info: PeerInfo,
    pub local_capability: DeviceCapability,
    pub supplier: Arc<dyn SessionConfigurationSupplier>,
    pub tunnel_timeout: Duration,
    pub retry_delay: Duration,
    /// Treat a reply timeout as a tunnel failure instead of waiting on
    pub escalate_tunnel_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelMessage {
    GetControleeInfo,
    PutControleeInfo,
    GetSessionData,
    PutSessionData,
}

#[derive(Debug)]
struct PendingRequest {
    message: TunnelMessage,
    timer: TimerId,
}

#[derive(Debug, Clone, Copy)]
enum TunnelFailure {
    Local,
    Remote,
    Timeout,
}

/// Actions produced so far plus channel events still to be handled
#[derive(Default)]
struct Step {
    actions: Vec<DriverAction>,
    events: VecDeque<ChannelEvent>,
}

impl Step {
    fn with_events(events: Vec<ChannelEvent>) -> Self {
        Self {
            actions: Vec::new(),
            events: events.into(),
        }
    }
}

pub struct SessionDriver {
    role: DriverRole,
    channel: SecureChannel,
    params: DriverParams,
    pending: VecDeque<PendingRequest>,
    retry: Option<TimerId>,
    unique_session_id: Option<i32>,
    default_session_id: bool,
    session_config: Option<SessionConfiguration>,
    next_timer: u64,
    terminal: bool,
}

impl SessionDriver {
    pub fn new(role: DriverRole, channel: SecureChannel, params: DriverParams) -> Self {
        debug_assert_eq!(role.channel_role(), channel.role());
        Self {
            role,
            channel,
            params,
            pending: VecDeque::new(),
            retry: None,
            unique_session_id: None,
            default_session_id: false,
            session_config: None,
            next_timer: 0,
            terminal: false,
        }
    }

    pub fn role(&self) -> DriverRole {
        self.role
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn unique_session_id(&self) -> Option<i32> {
        self.unique_session_id
    }

    pub async fn start(&mut self) -> Vec<DriverAction> {
        let mut step = Step::default();
        match self.channel.init().await {
            Ok(events) => step.events.extend(events),
            Err(e) => {
                warn!(error = %e, "Secure channel cannot be initialized");
                self.finish(SecureSessionEvent::Aborted, &mut step);
            }
        }
        self.drain(step).await
    }

    /// Bytes received from the peer over the transport
    pub async fn on_transport_data(&mut self, data: &[u8]) -> Vec<DriverAction> {
        let events = self.channel.handle_remote_data(data).await;
        self.drain(Step::with_events(events)).await
    }

    pub async fn on_timer(&mut self, id: TimerId) -> Vec<DriverAction> {
        let mut step = Step::default();
        if self.terminal {
            debug!(?id, "Ignoring timer after termination");
            return step.actions;
        }

        if self.retry == Some(id) {
            self.retry = None;
            debug!("Retrying GET session data");
            self.tunnel_data(TunnelMessage::GetSessionData, get_session_data_apdu(), &mut step)
                .await;
        } else if let Some(pos) = self.pending.iter().position(|r| r.timer == id) {
            if self.params.escalate_tunnel_timeout {
                if let Some(request) = self.pending.remove(pos) {
                    self.on_tunnel_failure(request.message, TunnelFailure::Timeout, &mut step)
                        .await;
                }
            } else {
                let message = self.pending[pos].message;
                warn!(?message, "No reply within tunnel timeout, still waiting");
            }
        } else {
            debug!(?id, "Ignoring stale timer");
        }

        self.drain(step).await
    }

    /// Ends the secure session; reports `Terminated` unless already finished
    pub async fn terminate(&mut self) -> Vec<DriverAction> {
        let mut step = Step::default();
        self.terminate_session(&mut step).await;
        self.drain(step).await
    }

    /// Releases the SE channel; used on session teardown
    pub async fn cleanup(&mut self) -> Vec<DriverAction> {
        let events = self.channel.cleanup().await;
        self.drain(Step::with_events(events)).await
    }

    async fn drain(&mut self, mut step: Step) -> Vec<DriverAction> {
        while let Some(event) = step.events.pop_front() {
            self.handle_channel_event(event, &mut step).await;
        }
        step.actions
    }

    fn next_timer_id(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId(self.next_timer)
    }

    /// Terminal latch
    fn finish(&mut self, event: SecureSessionEvent, step: &mut Step) {
        if self.terminal {
            debug!(?event, "Suppressing second terminal event");
            return;
        }
        self.terminal = true;
        for request in self.pending.drain(..) {
            step.actions.push(DriverAction::CancelTimer { id: request.timer });
        }
        if let Some(id) = self.retry.take() {
            step.actions.push(DriverAction::CancelTimer { id });
        }
        info!(?event, role = ?self.role, "Secure session finished");
        step.actions.push(DriverAction::Notify(event));
    }

    fn ready(&mut self, session_id: i32, data: Option<SessionConfiguration>, step: &mut Step) {
        if self.terminal {
            return;
        }
        info!(session_id, "Session data ready");
        step.actions.push(DriverAction::Notify(SecureSessionEvent::SessionDataReady {
            session_id,
            data,
            terminated: false,
        }));
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent, step: &mut Step) {
        if self.terminal
            && !matches!(
                event,
                ChannelEvent::Terminated { .. } | ChannelEvent::SeChannelClosed { .. }
            )
        {
            debug!(?event, "Ignoring channel event after termination");
            return;
        }

        match event {
            ChannelEvent::Established { default_session_id } => {
                self.on_established(default_session_id, step).await;
            }
            ChannelEvent::SetupError(error) => {
                warn!(?error, "Secure channel setup failed");
                let events = self.channel.cleanup().await;
                step.events.extend(events);
                self.finish(SecureSessionEvent::Aborted, step);
            }
            ChannelEvent::DispatchResponseAvailable(resp) => match self.role.channel_role() {
                ChannelRole::Initiator => self.on_initiator_response(&resp, step).await,
                ChannelRole::Responder => self.on_responder_response(&resp, step).await,
            },
            ChannelEvent::DispatchCommandFailure => match self.role.channel_role() {
                ChannelRole::Initiator => {
                    if let Some(request) = self.pending.pop_front() {
                        step.actions.push(DriverAction::CancelTimer { id: request.timer });
                        self.on_tunnel_failure(request.message, TunnelFailure::Remote, step)
                            .await;
                    }
                }
                ChannelRole::Responder => warn!("A dispatch command was not handled"),
            },
            ChannelEvent::Terminated { with_error } => {
                debug!(with_error, "Secure channel terminated");
                self.finish(SecureSessionEvent::Terminated, step);
            }
            ChannelEvent::SeChannelClosed { with_error } => {
                if !self.terminal {
                    warn!(with_error, "SE channel closed before the session finished");
                    self.finish(SecureSessionEvent::Aborted, step);
                }
            }
        }
    }

    async fn on_established(&mut self, default_session_id: Option<i32>, step: &mut Step) {
        if let Some(id) = default_session_id {
            self.unique_session_id = Some(id);
            self.default_session_id = true;
        } else if self.role.is_controller() {
            self.unique_session_id = Some(generate_random_session_id());
        }

        match self.role {
            DriverRole::ControleeInitiator => {
                match controlee_info_do(&self.params.local_peer_info) {
                    Ok(datum) => {
                        let apdu = command::put_data(&wrap_do(&datum));
                        self.tunnel_data(TunnelMessage::PutControleeInfo, apdu, step).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Local PeerInfo cannot be encoded");
                        self.abort_session(step).await;
                    }
                }
            }
            DriverRole::ControllerInitiator => {
                let apdu = command::get_data(&get_do(CONTROLEE_INFO_DO_TAG));
                self.tunnel_data(TunnelMessage::GetControleeInfo, apdu, step).await;
            }
            // responders wait for the initiator
            DriverRole::ControllerResponder | DriverRole::ControleeResponder => {}
        }
    }

    async fn tunnel_data(&mut self, message: TunnelMessage, apdu: CommandApdu, step: &mut Step) {
        if self.terminal {
            return;
        }
        let payload = match apdu.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(?message, error = %e, "Tunnel request cannot be encoded");
                self.on_tunnel_failure(message, TunnelFailure::Local, step).await;
                return;
            }
        };
        match self.channel.tunnel(&payload).await {
            Ok(()) => {
                let id = self.next_timer_id();
                debug!(?message, ?id, "Tunnel request sent, waiting for reply");
                self.pending.push_back(PendingRequest { message, timer: id });
                step.actions.push(DriverAction::StartTimer {
                    id,
                    kind: TimerKind::TunnelTimeout,
                    after: self.params.tunnel_timeout,
                });
            }
            Err(e) => {
                warn!(?message, error = %e, "Tunnel request failed");
                self.on_tunnel_failure(message, TunnelFailure::Local, step).await;
            }
        }
    }

    async fn on_tunnel_failure(
        &mut self,
        message: TunnelMessage,
        reason: TunnelFailure,
        step: &mut Step,
    ) {
        warn!(?message, ?reason, "Terminating session after tunnel failure");
        let events = self.channel.terminate_locally().await;
        step.events.extend(events);
        self.finish(SecureSessionEvent::Aborted, step);
    }

    /// Terminates remote and local sessions, then reports `Aborted`
    async fn abort_session(&mut self, step: &mut Step) {
        self.terminate_session(step).await;
        self.finish(SecureSessionEvent::Aborted, step);
    }

    async fn terminate_session(&mut self, step: &mut Step) {
        if self.role.channel_role() == ChannelRole::Initiator
            && self.channel.is_established()
            && !self.terminal
        {
            // no reply expected from the peer
            match command::get_data(&terminate_session_get_do()).encode() {
                Ok(payload) => {
                    if let Err(e) = self.channel.tunnel(&payload).await {
                        warn!(error = %e, "Failed to send terminate session to peer");
                    }
                }
                Err(e) => warn!(error = %e, "Terminate session cannot be encoded"),
            }
        }
        let events = self.channel.terminate_locally().await;
        step.events.extend(events);
    }

    fn schedule_retry(&mut self, step: &mut Step) {
        if let Some(old) = self.retry.take() {
            step.actions.push(DriverAction::CancelTimer { id: old });
        }
        let id = self.next_timer_id();
        self.retry = Some(id);
        step.actions.push(DriverAction::StartTimer {
            id,
            kind: TimerKind::Retry,
            after: self.params.retry_delay,
        });
    }

    fn build_configuration(&mut self, peer: &PeerInfo) -> Option<SessionConfiguration> {
        let unique = *self
            .unique_session_id
            .get_or_insert_with(generate_random_session_id);
        match self
            .params
            .supplier
            .session_configuration(&self.params.local_capability, peer, unique)
        {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Cannot build session configuration");
                None
            }
        }
    }

    // ---- initiator ----

    async fn on_initiator_response(&mut self, resp: &DispatchResponse, step: &mut Step) {
        if resp.kind() == DispatchKind::TransactionCompleteWithError {
            warn!("Peer transaction completed with error");
            self.abort_session(step).await;
            return;
        }

        if let Some(request) = self.pending.pop_front() {
            let handled = self.on_tunnel_response(request.message, resp, step).await;
            if handled || self.terminal {
                step.actions.push(DriverAction::CancelTimer { id: request.timer });
                if handled {
                    return;
                }
            } else {
                warn!(message = ?request.message, "Reply does not answer the pending request");
                self.pending.push_front(request);
            }
        }

        if let Some(data) = resp.remote_data() {
            self.channel.send_raw(data).await;
        } else if let Some(data) = resp.host_data() {
            debug!(data = %hex::encode(data), "Unsolicited data to host");
        }

        if resp.is_aborted() {
            let events = self.channel.cleanup().await;
            step.events.extend(events);
            self.finish(SecureSessionEvent::Aborted, step);
        }
    }

    async fn on_tunnel_response(
        &mut self,
        message: TunnelMessage,
        resp: &DispatchResponse,
        step: &mut Step,
    ) -> bool {
        match message {
            TunnelMessage::PutControleeInfo => self.on_put_controlee_info(resp, step).await,
            TunnelMessage::GetSessionData => self.on_get_session_data(resp, step).await,
            TunnelMessage::GetControleeInfo => self.on_get_controlee_info(resp, step).await,
            TunnelMessage::PutSessionData => self.on_put_session_data(resp, step).await,
        }
    }

    async fn on_put_controlee_info(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        // the peer's status word, relayed to the host
        let Some(data) = resp.host_data().filter(|d| !d.is_empty() && d.len() < 5) else {
            warn!("Unexpected reply to PUT PeerInfo");
            return false;
        };
        let sw = StatusWord(be_bytes_to_i32(data) as u16);
        if sw.is_success() {
            self.tunnel_data(TunnelMessage::GetSessionData, get_session_data_apdu(), step)
                .await;
        } else {
            warn!(%sw, "Peer rejected PeerInfo");
            self.abort_session(step).await;
        }
        true
    }

    async fn on_get_session_data(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        let Some(host) = resp.host_data() else {
            warn!("Unexpected reply to GET session data");
            return false;
        };

        let rds = resp.rds_available();
        if let Some((id, _)) = rds {
            if self.default_session_id && self.unique_session_id != Some(id) {
                warn!(session_id = id, "RDS overrides the default session id");
            }
            self.unique_session_id = Some(id);
        }

        match resp.kind() {
            DispatchKind::RetryNeeded => {
                debug!("Peer has no session data yet");
                self.schedule_retry(step);
                return true;
            }
            DispatchKind::DataAvailable if is_session_data_do(host) => {
                let Some(config) = session_config_from_do(host) else {
                    warn!("Malformed session data from peer");
                    self.abort_session(step).await;
                    return true;
                };
                if rds.is_none() {
                    if !self.default_session_id {
                        self.unique_session_id = Some(config.session_id);
                    }
                    let put = command::put_data(&TlvDatum::new(EXTENDED_HEAD_LIST_TAG, host));
                    if let Err(e) = self.channel.send_local_command(&put).await {
                        warn!(error = %e, "Failed to store session data in the applet");
                        self.abort_session(step).await;
                        return true;
                    }
                }
                let session_id = self.unique_session_id.unwrap_or(config.session_id);
                self.ready(session_id, Some(config), step);
                return true;
            }
            _ => {}
        }

        if let Some((id, _)) = rds {
            self.read_local_session_data(id, step).await;
            return true;
        }

        warn!("Unexpected reply to GET session data");
        false
    }

    async fn on_get_controlee_info(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        let raw = resp
            .controlee_info()
            .or_else(|| resp.host_data().filter(|d| is_controlee_info_do(d)));
        if let Some(raw) = raw {
            let peer = if is_controlee_info_do(raw) {
                peer_info_from_do(raw)
            } else {
                PeerInfo::decode(raw)
            };
            match peer {
                Some(peer) => {
                    self.send_session_configuration(&peer, step).await;
                    return true;
                }
                None => warn!("Received PeerInfo is not usable"),
            }
        }

        if resp.host_data().is_some() {
            warn!("Unexpected reply to GET PeerInfo");
            self.abort_session(step).await;
            return true;
        }
        false
    }

    async fn send_session_configuration(&mut self, peer: &PeerInfo, step: &mut Step) {
        let Some(config) = self.build_configuration(peer) else {
            self.abort_session(step).await;
            return;
        };
        match session_data_do(&config) {
            Ok(datum) => {
                let apdu = command::put_data(&wrap_do(&datum));
                self.session_config = Some(config);
                self.tunnel_data(TunnelMessage::PutSessionData, apdu, step).await;
            }
            Err(e) => {
                warn!(error = %e, "Session configuration cannot be encoded");
                self.abort_session(step).await;
            }
        }
    }

    async fn on_put_session_data(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        if let Some((id, _)) = resp.rds_available() {
            self.unique_session_id = Some(id);
            let config = self.session_config.clone();
            self.ready(id, config, step);
            return true;
        }
        if resp.host_data().is_some() {
            warn!("Unexpected reply to PUT session data");
            self.abort_session(step).await;
            return true;
        }
        false
    }

    async fn read_local_session_data(&mut self, session_id: i32, step: &mut Step) {
        let get = command::get_data(&get_do(SESSION_DATA_DO_TAG));
        let config = match self.channel.send_local_command(&get).await {
            Ok(data) => session_config_from_do(&data),
            Err(e) => {
                warn!(error = %e, "Cannot read session data from the applet");
                None
            }
        };
        match config {
            Some(config) => self.ready(session_id, Some(config), step),
            None => {
                warn!("Applet holds no usable session data");
                self.abort_session(step).await;
            }
        }
    }

    // ---- responder ----

    async fn on_responder_response(&mut self, resp: &DispatchResponse, step: &mut Step) {
        if resp.is_aborted() {
            let events = self.channel.cleanup().await;
            step.events.extend(events);
            self.finish(SecureSessionEvent::Aborted, step);
            return;
        }

        if let Some(data) = resp.remote_data() {
            self.channel.send_raw(data).await;
        }

        let handled = match self.role {
            DriverRole::ControllerResponder => self.on_controller_responder(resp, step).await,
            DriverRole::ControleeResponder => self.on_controlee_responder(resp, step).await,
            _ => false,
        };
        if !handled {
            if let Some(data) = resp.host_data() {
                debug!(data = %hex::encode(data), "Unsolicited data to host");
            }
        }
    }

    async fn on_controller_responder(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        if let Some(info) = resp.controlee_info() {
            let peer = if is_controlee_info_do(info) {
                peer_info_from_do(info)
            } else {
                debug!("Reading PeerInfo from the applet");
                let get = command::get_data(&get_do(CONTROLEE_INFO_DO_TAG));
                match self.channel.send_local_command(&get).await {
                    Ok(data) => peer_info_from_do(&data),
                    Err(e) => {
                        warn!(error = %e, "PeerInfo not available in the applet");
                        None
                    }
                }
            };
            match peer {
                Some(peer) => self.put_local_session_configuration(&peer, step).await,
                None => self.abort_session(step).await,
            }
            return true;
        }

        if let Some((id, _)) = resp.rds_available() {
            let Some(config) = self.session_config.clone() else {
                warn!("RDS available before session data was generated");
                self.abort_session(step).await;
                return true;
            };
            if self.unique_session_id.is_some_and(|u| u != id) {
                warn!(session_id = id, "RDS session id differs from the generated one");
            }
            self.unique_session_id = Some(id);
            self.ready(id, Some(config), step);
            return true;
        }
        false
    }

    async fn put_local_session_configuration(&mut self, peer: &PeerInfo, step: &mut Step) {
        let Some(config) = self.build_configuration(peer) else {
            self.abort_session(step).await;
            return;
        };
        let put = match session_data_do(&config) {
            Ok(datum) => command::put_data(&wrap_do(&datum)),
            Err(e) => {
                warn!(error = %e, "Session configuration cannot be encoded");
                self.abort_session(step).await;
                return;
            }
        };
        match self.channel.send_local_command(&put).await {
            Ok(_) => self.session_config = Some(config),
            Err(e) => {
                warn!(error = %e, "Failed to put session data to the applet");
                self.abort_session(step).await;
            }
        }
    }

    async fn on_controlee_responder(&mut self, resp: &DispatchResponse, step: &mut Step) -> bool {
        let Some((id, data)) = resp.rds_available() else {
            return false;
        };
        if self.default_session_id && self.unique_session_id != Some(id) {
            warn!(session_id = id, "Default session id changed by RDS");
        }
        self.unique_session_id = Some(id);

        match data.filter(|d| is_session_data_do(d)).and_then(session_config_from_do) {
            Some(config) => {
                debug!("Session data carried in RDS notification");
                self.ready(id, Some(config), step);
            }
            None => self.read_local_session_data(id, step).await,
        }
        true
    }
}

fn get_session_data_apdu() -> CommandApdu {
    command::get_data(&get_do(SESSION_DATA_DO_TAG))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csml::dispatch::build;
    use crate::csml::{CommandApdu, ResponseApdu};
    use crate::secure::channel::AdfParams;
    use crate::session::profile::DefaultConfigurationSupplier;
    use crate::testing::{FakeSecureElement, RecordingTransport};

    const SW_OK: StatusWord = StatusWord::SUCCESS;

    fn params() -> DriverParams {
        DriverParams {
            local_peer_info: PeerInfo::default(),
            local_capability: DeviceCapability::default(),
            supplier: Arc::new(DefaultConfigurationSupplier::default()),
            tunnel_timeout: DEFAULT_TUNNEL_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            escalate_tunnel_timeout: false,
        }
    }

    fn driver(
        role: DriverRole,
        se: Arc<FakeSecureElement>,
        transport: Arc<RecordingTransport>,
        params: DriverParams,
    ) -> SessionDriver {
        let channel = SecureChannel::new(
            role.channel_role(),
            se,
            transport,
            AdfParams {
                oid: vec![0x2A],
                secure_blob: None,
                peer_oids: vec![vec![0x2B]],
            },
            Vec::new(),
            None,
        );
        SessionDriver::new(role, channel, params)
    }

    fn dispatch_reply(data: Vec<u8>) -> ResponseApdu {
        ResponseApdu::new(data, SW_OK)
    }

    fn tunnel_reply() -> ResponseApdu {
        ResponseApdu::new(vec![0x71, 3, 0x81, 1, 0xEE], SW_OK)
    }

    fn notifications(actions: &[DriverAction]) -> Vec<SecureSessionEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                DriverAction::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn terminal_count(actions: &[DriverAction]) -> usize {
        notifications(actions)
            .iter()
            .filter(|e| matches!(e, SecureSessionEvent::Aborted | SecureSessionEvent::Terminated))
            .count()
    }

    /// Initiator applet that establishes on the first DISPATCH and then
    /// answers with the queued replies
    fn initiator_applet(replies: Vec<ResponseApdu>) -> Arc<FakeSecureElement> {
        let mut queue: VecDeque<ResponseApdu> = replies.into();
        Arc::new(FakeSecureElement::new(move |apdu: &CommandApdu| match apdu.ins {
            command::INS_SELECT_ADF => ResponseApdu::status_only(SW_OK),
            command::INS_INITIATE_TRANSACTION => tunnel_reply(),
            command::INS_TUNNEL => tunnel_reply(),
            command::INS_DISPATCH => queue
                .pop_front()
                .unwrap_or_else(|| dispatch_reply(build::response(0x00, None, &[]))),
            _ => ResponseApdu::status_only(SW_OK),
        }))
    }

    fn established() -> ResponseApdu {
        dispatch_reply(build::response(0x00, None, &[build::established(None)]))
    }

    #[tokio::test]
    async fn test_controlee_initiator_happy_path() {
        let config = SessionConfiguration::new(0x0A0B).with_sub_session_id(2);
        let do_bytes = session_data_do(&config).unwrap().encode();
        let se = initiator_applet(vec![
            established(),
            dispatch_reply(build::response(0x81, Some(&[0x90, 0x00]), &[])),
            dispatch_reply(build::response(0x81, Some(&do_bytes), &[])),
        ]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se.clone(), transport.clone(), params());

        assert!(d.start().await.is_empty());
        let actions = d.on_transport_data(&[0x01]).await;
        assert!(matches!(actions.as_slice(), [DriverAction::StartTimer { kind: TimerKind::TunnelTimeout, .. }]));

        let actions = d.on_transport_data(&[0x02]).await;
        assert!(actions.iter().any(|a| matches!(a, DriverAction::CancelTimer { .. })));
        assert!(actions.iter().any(|a| matches!(a, DriverAction::StartTimer { .. })));

        let actions = d.on_transport_data(&[0x03]).await;
        assert_eq!(
            notifications(&actions),
            vec![SecureSessionEvent::SessionDataReady {
                session_id: 0x0A0B,
                data: Some(config),
                terminated: false,
            }]
        );
        // session data stored in the local applet
        assert!(se.transmitted_ins().contains(&command::INS_PUT_DATA));
    }

    #[tokio::test]
    async fn test_retry_needed_reissues_once() {
        let se = initiator_applet(vec![
            established(),
            dispatch_reply(build::response(0x81, Some(&[0x90, 0x00]), &[])),
            dispatch_reply(build::response(0x81, Some(&[0x87, 1, 0x00]), &[])),
        ]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se.clone(), transport, params());
        d.start().await;
        d.on_transport_data(&[1]).await;
        d.on_transport_data(&[2]).await;
        let tunnels_before = se.count_ins(command::INS_TUNNEL);

        let actions = d.on_transport_data(&[3]).await;
        let retry = actions.iter().find_map(|a| match a {
            DriverAction::StartTimer { id, kind: TimerKind::Retry, after } => Some((*id, *after)),
            _ => None,
        });
        let (retry_id, after) = retry.expect("retry timer");
        assert_eq!(after, DEFAULT_RETRY_DELAY);
        assert_eq!(se.count_ins(command::INS_TUNNEL), tunnels_before);

        d.on_timer(retry_id).await;
        assert_eq!(se.count_ins(command::INS_TUNNEL), tunnels_before + 1);
        // the same timer firing again is stale
        d.on_timer(retry_id).await;
        assert_eq!(se.count_ins(command::INS_TUNNEL), tunnels_before + 1);
    }

    #[tokio::test]
    async fn test_timeout_is_silent_by_default() {
        let se = initiator_applet(vec![established()]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se, transport, params());
        d.start().await;
        let actions = d.on_transport_data(&[1]).await;
        let DriverAction::StartTimer { id, .. } = actions[0] else {
            panic!("expected timer");
        };
        assert!(d.on_timer(id).await.is_empty());
        assert!(!d.is_terminal());
    }

    #[tokio::test]
    async fn test_timeout_escalates_when_configured() {
        let se = initiator_applet(vec![established()]);
        let transport = Arc::new(RecordingTransport::new());
        let mut p = params();
        p.escalate_tunnel_timeout = true;
        let mut d = driver(DriverRole::ControleeInitiator, se, transport, p);
        d.start().await;
        let actions = d.on_transport_data(&[1]).await;
        let DriverAction::StartTimer { id, .. } = actions[0] else {
            panic!("expected timer");
        };
        let actions = d.on_timer(id).await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
        assert!(d.is_terminal());
    }

    #[tokio::test]
    async fn test_transaction_error_aborts_exactly_once() {
        let se = initiator_applet(vec![
            established(),
            dispatch_reply(build::response(0xFF, None, &[])),
        ]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se.clone(), transport, params());
        d.start().await;
        d.on_transport_data(&[1]).await;
        let tunnels = se.count_ins(command::INS_TUNNEL);

        let actions = d.on_transport_data(&[2]).await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
        // terminate-session tunnelled to the peer before the local terminate
        assert_eq!(se.count_ins(command::INS_TUNNEL), tunnels + 1);
        assert!(se.transmitted_ins().contains(&command::INS_GET_DATA));

        let actions = d.terminate().await;
        assert_eq!(terminal_count(&actions), 0);
        assert_eq!(se.count_ins(command::INS_TUNNEL), tunnels + 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_with_pending_aborts() {
        let se = initiator_applet(vec![
            established(),
            ResponseApdu::status_only(StatusWord::UNKNOWN_ERROR),
        ]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se.clone(), transport, params());
        d.start().await;
        d.on_transport_data(&[1]).await;
        se.fail_transmit_ins(command::INS_DISPATCH);
        let actions = d.on_transport_data(&[2]).await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
    }

    #[tokio::test]
    async fn test_terminate_reports_terminated_once() {
        let se = initiator_applet(vec![established()]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeInitiator, se, transport, params());
        d.start().await;
        d.on_transport_data(&[1]).await;
        let actions = d.terminate().await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Terminated]);
        assert!(actions.iter().any(|a| matches!(a, DriverAction::CancelTimer { .. })));
        let actions = d.terminate().await;
        assert_eq!(terminal_count(&actions), 0);
    }

    #[tokio::test]
    async fn test_setup_error_aborts() {
        let se = Arc::new(FakeSecureElement::new(|_apdu: &CommandApdu| {
            ResponseApdu::status_only(StatusWord::FILE_NOT_FOUND)
        }));
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControllerInitiator, se, transport, params());
        let actions = d.start().await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
    }

    #[tokio::test]
    async fn test_controller_initiator_sends_configuration() {
        let peer_do = controlee_info_do(&PeerInfo::default()).unwrap().encode();
        let se = initiator_applet(vec![
            dispatch_reply(build::response(0x00, None, &[build::established(Some(0x55))])),
            dispatch_reply(build::response(0x00, None, &[build::controlee_info(&peer_do)])),
            dispatch_reply(build::response(0x00, None, &[build::rds_available(0x55, None)])),
        ]);
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControllerInitiator, se.clone(), transport, params());
        d.start().await;
        d.on_transport_data(&[1]).await;
        d.on_transport_data(&[2]).await;
        let actions = d.on_transport_data(&[3]).await;
        assert_eq!(
            notifications(&actions),
            vec![SecureSessionEvent::SessionDataReady {
                session_id: 0x55,
                data: Some(SessionConfiguration::new(0x55)),
                terminated: false,
            }]
        );
    }

    fn responder_applet(replies: Vec<ResponseApdu>, local: Vec<u8>) -> Arc<FakeSecureElement> {
        let mut queue: VecDeque<ResponseApdu> = replies.into();
        Arc::new(FakeSecureElement::new(move |apdu: &CommandApdu| match apdu.ins {
            command::INS_DISPATCH => queue
                .pop_front()
                .unwrap_or_else(|| dispatch_reply(build::response(0x00, None, &[]))),
            command::INS_GET_DATA => ResponseApdu::new(local.clone(), SW_OK),
            _ => ResponseApdu::status_only(SW_OK),
        }))
    }

    const SELECT: [u8; 5] = [0x00, 0xA4, 0x04, 0x00, 0x00];

    #[tokio::test]
    async fn test_controlee_responder_reads_local_session_data() {
        let config = SessionConfiguration::new(9);
        let local = session_data_do(&config).unwrap().encode();
        let se = responder_applet(
            vec![
                dispatch_reply(build::response(0x80, Some(&[0xAB]), &[build::established(None)])),
                dispatch_reply(build::response(0x00, None, &[build::rds_available(9, None)])),
            ],
            local,
        );
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeResponder, se, transport.clone(), params());
        d.start().await;
        d.on_transport_data(&SELECT).await;
        d.on_transport_data(&[1]).await;
        let actions = d.on_transport_data(&[2]).await;
        assert_eq!(
            notifications(&actions),
            vec![SecureSessionEvent::SessionDataReady {
                session_id: 9,
                data: Some(config),
                terminated: false,
            }]
        );
        assert!(transport.sent().contains(&vec![0xAB]));
    }

    #[tokio::test]
    async fn test_controller_responder_rds_without_config_aborts() {
        let se = responder_applet(
            vec![
                dispatch_reply(build::response(0x00, None, &[build::established(Some(3))])),
                dispatch_reply(build::response(0x00, None, &[build::rds_available(3, None)])),
            ],
            Vec::new(),
        );
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControllerResponder, se, transport, params());
        d.start().await;
        d.on_transport_data(&SELECT).await;
        d.on_transport_data(&[1]).await;
        let actions = d.on_transport_data(&[2]).await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
        assert_eq!(terminal_count(&actions), 1);
    }

    #[tokio::test]
    async fn test_controller_responder_generates_configuration() {
        let peer_do = controlee_info_do(&PeerInfo::default()).unwrap().encode();
        let se = responder_applet(
            vec![
                dispatch_reply(build::response(0x00, None, &[build::established(Some(3))])),
                dispatch_reply(build::response(0x00, None, &[build::controlee_info(&peer_do)])),
                dispatch_reply(build::response(0x00, None, &[build::rds_available(3, None)])),
            ],
            Vec::new(),
        );
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControllerResponder, se.clone(), transport, params());
        d.start().await;
        d.on_transport_data(&SELECT).await;
        d.on_transport_data(&[1]).await;
        d.on_transport_data(&[2]).await;
        assert!(se.transmitted_ins().contains(&command::INS_PUT_DATA));
        let actions = d.on_transport_data(&[3]).await;
        assert_eq!(
            notifications(&actions),
            vec![SecureSessionEvent::SessionDataReady {
                session_id: 3,
                data: Some(SessionConfiguration::new(3)),
                terminated: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_responder_abort_notification() {
        let se = responder_applet(
            vec![
                dispatch_reply(build::response(0x00, None, &[build::established(None)])),
                dispatch_reply(build::response(0x00, None, &[build::aborted()])),
            ],
            Vec::new(),
        );
        let transport = Arc::new(RecordingTransport::new());
        let mut d = driver(DriverRole::ControleeResponder, se, transport, params());
        d.start().await;
        d.on_transport_data(&SELECT).await;
        d.on_transport_data(&[1]).await;
        let actions = d.on_transport_data(&[2]).await;
        assert_eq!(notifications(&actions), vec![SecureSessionEvent::Aborted]);
        let actions = d.terminate().await;
        assert_eq!(terminal_count(&actions), 0);
    }

    #[test]
    fn test_role_mapping() {
        assert_eq!(
            DriverRole::new(UwbRole::Controller, ChannelRole::Initiator),
            DriverRole::ControllerInitiator
        );
        assert_eq!(
            DriverRole::new(UwbRole::Controlee, ChannelRole::Responder).channel_role(),
            ChannelRole::Responder
        );
        assert!(DriverRole::ControllerResponder.is_controller());
        assert!(!DriverRole::ControleeInitiator.is_controller());
    }
}
