//! Ranging session: state machine, role profiles, collaborators and the
//! per-session actor

pub mod collaborators;
pub mod controller;
pub mod profile;
pub mod registry;
pub mod state;

pub use collaborators::{
    CollaboratorError, CollaboratorEvent, DiscoveryMode, DiscoveryProvider, PeerDevice,
    RadioControl, RangingCallbacks, ReasonCode, SessionHandle, SessionInfo, UwbAddress,
};
pub use controller::{spawn_session, Collaborators, RangingSessionHandle, SessionError};
pub use profile::{
    DefaultConfigurationSupplier, RoleProfile, SessionConfigurationSupplier, SupplyError, UwbRole,
};
pub use registry::SessionRegistry;
pub use state::{transition, CallbackKind, Effect, RangingPhase, RangingState, SessionEvent};
