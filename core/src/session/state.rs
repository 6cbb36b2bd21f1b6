//! Ranging session state machine
//!
//! [`transition`] is a pure function over ([`RangingState`], [`SessionEvent`]).
//! It never touches a collaborator: side effects come back as [`Effect`]s for
//! the session actor to run. The table is role-agnostic; everything that
//! differs between controller and controlee lives in the profile.

use super::collaborators::{PeerDevice, ReasonCode, SessionInfo};
use crate::records::SessionConfiguration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingPhase {
    Opening,
    Opened,
    Started,
    Stopping,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingState {
    Idle,
    Discovery,
    Transport,
    /// `stop_requested`: a stop arrived while the secure session was running
    SecureSession { stop_requested: bool },
    Ranging { phase: RangingPhase },
    EndSession,
}

impl RangingState {
    pub fn is_end(&self) -> bool {
        matches!(self, RangingState::EndSession)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Stop,
    Close,
    DiscoveryFailed,
    Discovered(PeerDevice),
    TransportStarted,
    TransportCompleted,
    TransportFailed,
    SecureSessionEstablished(SessionConfiguration),
    SecureSessionAborted,
    SecureSessionTerminated,
    RangingOpened,
    RangingOpenFailed(ReasonCode),
    RangingStarted,
    RangingStartFailed(ReasonCode),
    RangingStopped(ReasonCode),
    RangingEnded,
    /// No further events can reach the session
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Opened,
    OpenFailed,
    Started,
    StartFailed,
    Stopped,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartDiscovery,
    StopDiscovery,
    InitTransport(PeerDevice),
    StartTransport,
    StopTransport,
    InitSecureSession,
    TerminateSecureSession,
    OpenRanging(SessionConfiguration),
    StartRanging,
    StopRanging,
    CloseRanging,
    TearDown,
    Notify(CallbackKind, ReasonCode),
}

type Step = (RangingState, Vec<Effect>);

fn stay(state: RangingState) -> Step {
    (state, Vec::new())
}

fn end(mut effects: Vec<Effect>, reason: ReasonCode) -> Step {
    effects.push(Effect::TearDown);
    effects.push(Effect::Notify(CallbackKind::Closed, reason));
    (RangingState::EndSession, effects)
}

fn open_failed(reason: ReasonCode) -> Step {
    end(vec![Effect::Notify(CallbackKind::OpenFailed, reason)], reason)
}

pub fn transition(state: RangingState, event: SessionEvent, info: &mut SessionInfo) -> Step {
    use RangingState::*;
    use SessionEvent as E;

    match (state, event) {
        (EndSession, event) => {
            debug!(?event, "Session ended, event dropped");
            stay(EndSession)
        }
        (_, E::Abandoned) => end(Vec::new(), ReasonCode::LocalApi),

        (Idle, E::Start) => (Discovery, vec![Effect::StartDiscovery]),
        (Idle, E::Stop | E::Close) => end(Vec::new(), ReasonCode::LocalApi),

        (Discovery, E::Start) => (Discovery, vec![Effect::StartDiscovery]),
        (Discovery, E::DiscoveryFailed) => (
            Discovery,
            vec![Effect::Notify(CallbackKind::OpenFailed, ReasonCode::DiscoveryFailed)],
        ),
        (Discovery, E::Discovered(peer)) => (Transport, vec![Effect::InitTransport(peer)]),
        (Discovery, E::Stop | E::Close) => end(Vec::new(), ReasonCode::LocalApi),

        (Transport, E::TransportStarted) => (Transport, vec![Effect::StartTransport]),
        (Transport, E::TransportCompleted) => (
            SecureSession {
                stop_requested: false,
            },
            vec![Effect::StopDiscovery, Effect::InitSecureSession],
        ),
        (Transport, E::TransportFailed) => open_failed(ReasonCode::TransportFailed),
        (Transport, E::Stop | E::Close) => end(vec![Effect::StopTransport], ReasonCode::LocalApi),

        (SecureSession { stop_requested }, E::SecureSessionEstablished(config)) => {
            if stop_requested {
                debug!("Stop pending, ignoring established secure session");
                stay(state)
            } else {
                info.apply_configuration(&config);
                (
                    Ranging {
                        phase: RangingPhase::Opening,
                    },
                    vec![Effect::OpenRanging(config)],
                )
            }
        }
        (SecureSession { stop_requested }, E::SecureSessionAborted) => {
            if stop_requested {
                end(Vec::new(), ReasonCode::LocalApi)
            } else {
                open_failed(ReasonCode::SecureSessionAborted)
            }
        }
        (SecureSession { stop_requested }, E::SecureSessionTerminated) => {
            let reason = if stop_requested {
                ReasonCode::LocalApi
            } else {
                ReasonCode::RemoteRequest
            };
            end(Vec::new(), reason)
        }
        (SecureSession { stop_requested: false }, E::Stop | E::Close) => (
            SecureSession {
                stop_requested: true,
            },
            vec![Effect::TerminateSecureSession],
        ),

        (Ranging { phase }, event) => ranging(phase, event),

        (state, event) => {
            debug!(?state, ?event, "Event not handled in this state");
            stay(state)
        }
    }
}

fn ranging(phase: RangingPhase, event: SessionEvent) -> Step {
    use RangingPhase::*;
    use SessionEvent as E;

    let at = |phase| RangingState::Ranging { phase };
    match (phase, event) {
        (_, E::RangingEnded) => end(Vec::new(), ReasonCode::LocalApi),
        (Opening, E::RangingOpened) => (
            at(Opened),
            vec![
                Effect::Notify(CallbackKind::Opened, ReasonCode::LocalApi),
                Effect::StartRanging,
            ],
        ),
        (Opening, E::RangingOpenFailed(reason)) => open_failed(reason),
        (Opened, E::RangingStarted) => (
            at(Started),
            vec![Effect::Notify(CallbackKind::Started, ReasonCode::LocalApi)],
        ),
        (Opened, E::RangingStartFailed(reason)) => (
            at(Opened),
            vec![Effect::Notify(CallbackKind::StartFailed, reason)],
        ),
        (Opened, E::Start) => (at(Opened), vec![Effect::StartRanging]),
        (Opened | Started, E::Stop) => (at(Stopping), vec![Effect::StopRanging]),
        (Opening, E::Stop) => (at(Closing), vec![Effect::CloseRanging]),
        (Stopping, E::RangingStopped(reason)) => (
            at(Closing),
            vec![Effect::Notify(CallbackKind::Stopped, reason), Effect::CloseRanging],
        ),
        (Started | Opened, E::RangingStopped(reason)) => (
            at(Opened),
            vec![Effect::Notify(CallbackKind::Stopped, reason)],
        ),
        (Opening | Opened | Started | Stopping, E::Close) => {
            (at(Closing), vec![Effect::CloseRanging])
        }
        (phase, event) => {
            debug!(?phase, ?event, "Ranging event not handled in this phase");
            stay(at(phase))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::collaborators::SessionHandle;

    fn info() -> SessionInfo {
        SessionInfo::new(SessionHandle(1), 0)
    }

    /// Feeds events in order, collecting every effect
    fn run(events: Vec<SessionEvent>) -> (RangingState, Vec<Effect>, SessionInfo) {
        let mut info = info();
        let mut state = RangingState::Idle;
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = transition(state, event, &mut info);
            state = next;
            all.extend(effects);
        }
        (state, all, info)
    }

    fn to_secure_session() -> Vec<SessionEvent> {
        vec![
            SessionEvent::Start,
            SessionEvent::Discovered(PeerDevice::new("peer")),
            SessionEvent::TransportStarted,
            SessionEvent::TransportCompleted,
        ]
    }

    fn to_ranging(phase: RangingPhase) -> Vec<SessionEvent> {
        let mut events = to_secure_session();
        events.push(SessionEvent::SecureSessionEstablished(SessionConfiguration::new(5)));
        match phase {
            RangingPhase::Opening => {}
            RangingPhase::Opened => events.push(SessionEvent::RangingOpened),
            RangingPhase::Started => {
                events.push(SessionEvent::RangingOpened);
                events.push(SessionEvent::RangingStarted);
            }
            RangingPhase::Stopping => {
                events.push(SessionEvent::RangingOpened);
                events.push(SessionEvent::RangingStarted);
                events.push(SessionEvent::Stop);
            }
            RangingPhase::Closing => {
                events.push(SessionEvent::RangingOpened);
                events.push(SessionEvent::Close);
            }
        }
        events
    }

    #[test]
    fn test_happy_path() {
        let mut events = to_ranging(RangingPhase::Started);
        events.push(SessionEvent::Stop);
        events.push(SessionEvent::RangingStopped(ReasonCode::LocalApi));
        events.push(SessionEvent::RangingEnded);
        let (state, effects, info) = run(events);

        assert_eq!(state, RangingState::EndSession);
        assert_eq!(info.session_id, 5);
        assert_eq!(
            effects,
            vec![
                Effect::StartDiscovery,
                Effect::InitTransport(PeerDevice::new("peer")),
                Effect::StartTransport,
                Effect::StopDiscovery,
                Effect::InitSecureSession,
                Effect::OpenRanging(SessionConfiguration::new(5)),
                Effect::Notify(CallbackKind::Opened, ReasonCode::LocalApi),
                Effect::StartRanging,
                Effect::Notify(CallbackKind::Started, ReasonCode::LocalApi),
                Effect::StopRanging,
                Effect::Notify(CallbackKind::Stopped, ReasonCode::LocalApi),
                Effect::CloseRanging,
                Effect::TearDown,
                Effect::Notify(CallbackKind::Closed, ReasonCode::LocalApi),
            ]
        );
    }

    #[test]
    fn test_discovery_failure_stays() {
        let (state, effects, _) = run(vec![SessionEvent::Start, SessionEvent::DiscoveryFailed]);
        assert_eq!(state, RangingState::Discovery);
        assert_eq!(
            effects.last(),
            Some(&Effect::Notify(CallbackKind::OpenFailed, ReasonCode::DiscoveryFailed))
        );
    }

    #[test]
    fn test_secure_session_abort() {
        let mut events = to_secure_session();
        events.push(SessionEvent::SecureSessionAborted);
        let (state, effects, _) = run(events);
        assert_eq!(state, RangingState::EndSession);
        assert!(effects.contains(&Effect::Notify(
            CallbackKind::OpenFailed,
            ReasonCode::SecureSessionAborted
        )));
        assert_eq!(effects.iter().filter(|e| **e == Effect::TearDown).count(), 1);
    }

    #[test]
    fn test_stop_during_secure_session_waits_for_termination() {
        let mut events = to_secure_session();
        events.push(SessionEvent::Stop);
        events.push(SessionEvent::Stop);
        let (state, effects, _) = run(events);
        assert_eq!(
            state,
            RangingState::SecureSession {
                stop_requested: true
            }
        );
        assert_eq!(
            effects.iter().filter(|e| **e == Effect::TerminateSecureSession).count(),
            1
        );
        assert!(!effects.contains(&Effect::TearDown));
    }

    #[test]
    fn test_start_failed_returns_to_opened() {
        let mut events = to_ranging(RangingPhase::Opened);
        events.push(SessionEvent::RangingStartFailed(ReasonCode::SystemPolicy));
        events.push(SessionEvent::Start);
        let (state, effects, _) = run(events);
        assert_eq!(
            state,
            RangingState::Ranging {
                phase: RangingPhase::Opened
            }
        );
        assert_eq!(effects.last(), Some(&Effect::StartRanging));
    }

    #[test]
    fn test_end_session_is_absorbing() {
        let mut info = info();
        for event in [
            SessionEvent::Start,
            SessionEvent::Stop,
            SessionEvent::RangingEnded,
            SessionEvent::Abandoned,
        ] {
            let (state, effects) = transition(RangingState::EndSession, event, &mut info);
            assert_eq!(state, RangingState::EndSession);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn test_abandoned_ends_from_any_state() {
        for prefix in [
            vec![SessionEvent::Start],
            to_secure_session(),
            to_ranging(RangingPhase::Closing),
        ] {
            let (state, _, mut info) = run(prefix);
            let (next, effects) = transition(state, SessionEvent::Abandoned, &mut info);
            assert!(next.is_end());
            assert_eq!(
                effects,
                vec![
                    Effect::TearDown,
                    Effect::Notify(CallbackKind::Closed, ReasonCode::LocalApi)
                ]
            );
        }
    }

    /// Answers each effect the way a well-behaved collaborator would
    fn acknowledgement(effect: &Effect) -> Option<SessionEvent> {
        match effect {
            Effect::TerminateSecureSession => Some(SessionEvent::SecureSessionTerminated),
            Effect::StopRanging => Some(SessionEvent::RangingStopped(ReasonCode::LocalApi)),
            Effect::CloseRanging => Some(SessionEvent::RangingEnded),
            _ => None,
        }
    }

    #[test]
    fn test_stop_from_every_state_ends_once() {
        let mut prefixes = vec![
            vec![],
            vec![SessionEvent::Start],
            vec![SessionEvent::Start, SessionEvent::Discovered(PeerDevice::new("p"))],
            to_secure_session(),
        ];
        for phase in [
            RangingPhase::Opening,
            RangingPhase::Opened,
            RangingPhase::Started,
            RangingPhase::Stopping,
            RangingPhase::Closing,
        ] {
            prefixes.push(to_ranging(phase));
        }

        for prefix in prefixes {
            let (mut state, _, mut info) = run(prefix.clone());
            assert!(!state.is_end(), "prefix {prefix:?} already ended");

            let mut queue = std::collections::VecDeque::from([SessionEvent::Stop]);
            let mut teardowns = 0;
            let mut closed = 0;
            while let Some(event) = queue.pop_front() {
                let (next, effects) = transition(state, event, &mut info);
                state = next;
                for effect in &effects {
                    match effect {
                        Effect::TearDown => teardowns += 1,
                        Effect::Notify(CallbackKind::Closed, _) => closed += 1,
                        other => queue.extend(acknowledgement(other)),
                    }
                }
                // a stop already in flight needs its pending acknowledgement
                if queue.is_empty() && !state.is_end() {
                    match state {
                        RangingState::Ranging {
                            phase: RangingPhase::Stopping,
                        } => queue.push_back(SessionEvent::RangingStopped(ReasonCode::LocalApi)),
                        RangingState::Ranging {
                            phase: RangingPhase::Closing,
                        } => queue.push_back(SessionEvent::RangingEnded),
                        _ => {}
                    }
                }
            }
            assert!(state.is_end(), "prefix {prefix:?} stuck in {state:?}");
            assert_eq!(teardowns, 1, "prefix {prefix:?}");
            assert_eq!(closed, 1, "prefix {prefix:?}");
        }
    }
}
