// Session actor: one tokio task per ranging session
//
// The task owns the state, the SessionInfo, the protocol driver and the
// collaborators. Everything reaches it through one mailbox: API calls,
// collaborator results, transport payloads and timer expiries.

use super::collaborators::{
    CollaboratorEvent, DiscoveryProvider, RadioControl, RangingCallbacks, ReasonCode,
    SessionHandle, SessionInfo,
};
use super::profile::RoleProfile;
use super::state::{transition, CallbackKind, Effect, RangingState, SessionEvent};
use crate::config::PairingConfig;
use crate::records::SessionConfiguration;
use crate::secure::{
    DriverAction, DriverParams, SecureChannel, SecureElement, SecureSessionEvent, SessionDriver,
    TimerId, TransportProvider,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session task is not running")]
    NotRunning,

    #[error("Session limit of {0} reached")]
    LimitReached(usize),

    #[error("Session handle {0} already in use")]
    DuplicateHandle(SessionHandle),

    #[error("Unknown role profile: {0}")]
    UnknownProfile(String),
}

/// Downward collaborators of one session
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn DiscoveryProvider>,
    pub transport: Arc<dyn TransportProvider>,
    pub secure_element: Arc<dyn SecureElement>,
    pub radio: Arc<dyn RadioControl>,
    pub callbacks: Arc<dyn RangingCallbacks>,
}

#[derive(Debug)]
enum SessionCommand {
    Start,
    Stop,
    Close,
    Notify(CollaboratorEvent),
    Timer(TimerId),
    State(oneshot::Sender<RangingState>),
}

/// Handle to a running session task
#[derive(Debug, Clone)]
pub struct RangingSessionHandle {
    handle: SessionHandle,
    command_tx: mpsc::Sender<SessionCommand>,
}

impl RangingSessionHandle {
    pub fn session_handle(&self) -> SessionHandle {
        self.handle
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Close).await
    }

    /// Delivers a collaborator result to the session
    pub async fn notify(&self, event: CollaboratorEvent) -> Result<(), SessionError> {
        self.send(SessionCommand::Notify(event)).await
    }

    pub async fn state(&self) -> Result<RangingState, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SessionCommand::State(reply_tx)).await?;
        reply_rx.await.map_err(|_| SessionError::NotRunning)
    }

    /// True once the session task has ended
    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SessionError::NotRunning)
    }
}

/// Spawns the session task; it ends after the session reaches `EndSession`
/// and yields the final `SessionInfo`
pub fn spawn_session(
    handle: SessionHandle,
    profile: Arc<RoleProfile>,
    config: Arc<PairingConfig>,
    collaborators: Collaborators,
) -> (RangingSessionHandle, JoinHandle<SessionInfo>) {
    let (command_tx, command_rx) = mpsc::channel(config.session.mailbox_capacity.max(1));
    let actor = SessionActor {
        state: RangingState::Idle,
        info: SessionInfo::new(handle, 0),
        profile,
        config,
        collaborators,
        driver: None,
        timers: HashMap::new(),
        timer_tx: command_tx.downgrade(),
    };
    let task = tokio::spawn(actor.run(command_rx));
    (RangingSessionHandle { handle, command_tx }, task)
}

struct SessionActor {
    state: RangingState,
    info: SessionInfo,
    profile: Arc<RoleProfile>,
    config: Arc<PairingConfig>,
    collaborators: Collaborators,
    driver: Option<SessionDriver>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    timer_tx: mpsc::WeakSender<SessionCommand>,
}

impl SessionActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) -> SessionInfo {
        info!(
            session = %self.info.session_handle,
            profile = %self.profile.name,
            "Session task started"
        );
        while let Some(command) = command_rx.recv().await {
            self.handle_command(command).await;
            if self.state.is_end() {
                break;
            }
        }
        if !self.state.is_end() {
            info!(session = %self.info.session_handle, "Mailbox closed, closing session");
            self.dispatch(vec![SessionEvent::Close]).await;
            // collaborator replies can no longer arrive
            if !self.state.is_end() {
                self.dispatch(vec![SessionEvent::Abandoned]).await;
            }
        }
        self.cancel_timers();
        info!(session = %self.info.session_handle, "Session task finished");
        self.info
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => self.dispatch(vec![SessionEvent::Start]).await,
            SessionCommand::Stop => self.dispatch(vec![SessionEvent::Stop]).await,
            SessionCommand::Close => self.dispatch(vec![SessionEvent::Close]).await,
            SessionCommand::Notify(event) => self.on_collaborator_event(event).await,
            SessionCommand::Timer(id) => {
                self.timers.remove(&id);
                if let Some(driver) = self.driver.as_mut() {
                    let actions = driver.on_timer(id).await;
                    let events = self.apply_driver_actions(actions);
                    self.dispatch(events).await;
                }
            }
            SessionCommand::State(reply) => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn on_collaborator_event(&mut self, event: CollaboratorEvent) {
        let event = match event {
            CollaboratorEvent::TransportData(data) => {
                let Some(driver) = self.driver.as_mut() else {
                    debug!(len = data.len(), "Transport data before secure session, dropped");
                    return;
                };
                let actions = driver.on_transport_data(&data).await;
                let events = self.apply_driver_actions(actions);
                self.dispatch(events).await;
                return;
            }
            CollaboratorEvent::Discovered(peer) => SessionEvent::Discovered(peer),
            CollaboratorEvent::DiscoveryFailed => SessionEvent::DiscoveryFailed,
            CollaboratorEvent::TransportFailed => SessionEvent::TransportFailed,
            CollaboratorEvent::RangingOpened => SessionEvent::RangingOpened,
            CollaboratorEvent::RangingOpenFailed(reason) => SessionEvent::RangingOpenFailed(reason),
            CollaboratorEvent::RangingStarted => SessionEvent::RangingStarted,
            CollaboratorEvent::RangingStartFailed(reason) => {
                SessionEvent::RangingStartFailed(reason)
            }
            CollaboratorEvent::RangingStopped(reason) => SessionEvent::RangingStopped(reason),
            CollaboratorEvent::RangingEnded => SessionEvent::RangingEnded,
        };
        self.dispatch(vec![event]).await;
    }

    /// Runs the state machine until no follow-up events remain
    async fn dispatch(&mut self, events: Vec<SessionEvent>) {
        let mut queue: VecDeque<SessionEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            let (next, effects) = transition(self.state, event, &mut self.info);
            if next != self.state {
                info!(
                    session = %self.info.session_handle,
                    from = ?self.state,
                    to = ?next,
                    "Session state changed"
                );
            }
            self.state = next;
            for effect in effects {
                queue.extend(self.run_effect(effect).await);
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) -> Vec<SessionEvent> {
        let handle = self.info.session_handle;
        match effect {
            Effect::StartDiscovery => {
                match self
                    .collaborators
                    .discovery
                    .start_discovery(self.profile.discovery)
                    .await
                {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        warn!(error = %e, "Discovery could not start");
                        vec![SessionEvent::DiscoveryFailed]
                    }
                }
            }
            Effect::StopDiscovery => {
                if let Err(e) = self.collaborators.discovery.stop_discovery().await {
                    warn!(error = %e, "Failed to stop discovery");
                }
                Vec::new()
            }
            Effect::InitTransport(peer) => {
                match self.collaborators.transport.init(&peer).await {
                    Ok(()) => vec![SessionEvent::TransportStarted],
                    Err(e) => {
                        warn!(peer = %peer.id, error = %e, "Transport init failed");
                        vec![SessionEvent::TransportFailed]
                    }
                }
            }
            Effect::StartTransport => match self.collaborators.transport.start().await {
                Ok(()) => vec![SessionEvent::TransportCompleted],
                Err(e) => {
                    warn!(error = %e, "Transport start failed");
                    vec![SessionEvent::TransportFailed]
                }
            },
            Effect::StopTransport => {
                if let Err(e) = self.collaborators.transport.stop().await {
                    warn!(error = %e, "Failed to stop transport");
                }
                Vec::new()
            }
            Effect::InitSecureSession => self.init_secure_session().await,
            Effect::TerminateSecureSession => match self.driver.as_mut() {
                Some(driver) => {
                    let actions = driver.terminate().await;
                    self.apply_driver_actions(actions)
                }
                None => vec![SessionEvent::SecureSessionTerminated],
            },
            Effect::OpenRanging(config) => {
                match self.collaborators.radio.open_ranging(&self.info, &config).await {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        warn!(error = %e, "Radio refused to open ranging");
                        vec![SessionEvent::RangingOpenFailed(ReasonCode::RangingOpenFailed)]
                    }
                }
            }
            Effect::StartRanging => match self.collaborators.radio.start_ranging(handle).await {
                Ok(()) => Vec::new(),
                Err(e) => {
                    warn!(error = %e, "Radio refused to start ranging");
                    vec![SessionEvent::RangingStartFailed(ReasonCode::RangingStartFailed)]
                }
            },
            Effect::StopRanging => match self.collaborators.radio.stop_ranging(handle).await {
                Ok(()) => Vec::new(),
                Err(e) => {
                    warn!(error = %e, "Radio refused to stop ranging");
                    vec![SessionEvent::RangingStopped(ReasonCode::SystemPolicy)]
                }
            },
            Effect::CloseRanging => match self.collaborators.radio.close_ranging(handle).await {
                Ok(()) => Vec::new(),
                Err(e) => {
                    warn!(error = %e, "Radio refused to close ranging");
                    vec![SessionEvent::RangingEnded]
                }
            },
            Effect::TearDown => {
                self.tear_down().await;
                Vec::new()
            }
            Effect::Notify(kind, reason) => {
                self.notify(kind, reason);
                Vec::new()
            }
        }
    }

    async fn init_secure_session(&mut self) -> Vec<SessionEvent> {
        let local_info = match self.profile.peer_info.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Local PeerInfo cannot be encoded");
                return vec![SessionEvent::SecureSessionAborted];
            }
        };
        let channel = SecureChannel::new(
            self.profile.secure_role,
            self.collaborators.secure_element.clone(),
            self.collaborators.transport.clone(),
            self.profile.adf.clone(),
            local_info,
            self.profile.shared_session_id,
        );
        let secure = &self.config.secure_channel;
        let params = DriverParams {
            local_peer_info: self.profile.peer_info.clone(),
            local_capability: self.profile.capability.clone(),
            supplier: self.profile.supplier.clone(),
            tunnel_timeout: secure.tunnel_timeout(),
            retry_delay: secure.retry_delay(),
            escalate_tunnel_timeout: secure.escalate_tunnel_timeout,
        };
        let mut driver = SessionDriver::new(self.profile.driver_role(), channel, params);
        debug!(role = ?driver.role(), "Starting secure session");
        let actions = driver.start().await;
        self.driver = Some(driver);
        self.apply_driver_actions(actions)
    }

    /// Schedules timers and turns driver notifications into state events
    fn apply_driver_actions(&mut self, actions: Vec<DriverAction>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for action in actions {
            match action {
                DriverAction::Notify(SecureSessionEvent::SessionDataReady {
                    session_id,
                    data,
                    ..
                }) => {
                    let config = data.unwrap_or_else(|| SessionConfiguration::new(session_id));
                    events.push(SessionEvent::SecureSessionEstablished(config));
                }
                DriverAction::Notify(SecureSessionEvent::Aborted) => {
                    events.push(SessionEvent::SecureSessionAborted);
                }
                DriverAction::Notify(SecureSessionEvent::Terminated) => {
                    events.push(SessionEvent::SecureSessionTerminated);
                }
                DriverAction::StartTimer { id, kind, after } => {
                    let timer_tx = self.timer_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(tx) = timer_tx.upgrade() {
                            let _ = tx.send(SessionCommand::Timer(id)).await;
                        }
                    });
                    debug!(?id, ?kind, ?after, "Timer scheduled");
                    if let Some(old) = self.timers.insert(id, task) {
                        old.abort();
                    }
                }
                DriverAction::CancelTimer { id } => {
                    if let Some(task) = self.timers.remove(&id) {
                        task.abort();
                    }
                }
            }
        }
        events
    }

    fn cancel_timers(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }

    async fn tear_down(&mut self) {
        debug!(session = %self.info.session_handle, "Tearing down session");
        self.cancel_timers();
        if let Some(mut driver) = self.driver.take() {
            if !driver.is_terminal() {
                driver.terminate().await;
            }
            driver.cleanup().await;
        }
        if let Err(e) = self.collaborators.transport.stop().await {
            debug!(error = %e, "Transport stop during teardown");
        }
        if let Err(e) = self.collaborators.discovery.stop_discovery().await {
            debug!(error = %e, "Discovery stop during teardown");
        }
    }

    fn notify(&self, kind: CallbackKind, reason: ReasonCode) {
        let handle = self.info.session_handle;
        let callbacks = &self.collaborators.callbacks;
        match kind {
            CallbackKind::Opened => {
                let params = self.info.session_id.to_be_bytes();
                callbacks.on_opened(handle, reason, &params);
            }
            CallbackKind::OpenFailed => callbacks.on_open_failed(handle, reason, &[]),
            CallbackKind::Started => callbacks.on_started(handle, reason, &[]),
            CallbackKind::StartFailed => callbacks.on_start_failed(handle, reason, &[]),
            CallbackKind::Stopped => callbacks.on_stopped(handle, reason, &[]),
            CallbackKind::Closed => callbacks.on_closed(handle, reason, &[]),
        }
    }
}
