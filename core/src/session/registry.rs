// Registry of concurrently running sessions, keyed by session handle

use super::collaborators::{SessionHandle, SessionInfo};
use super::controller::{spawn_session, Collaborators, RangingSessionHandle, SessionError};
use super::profile::RoleProfile;
use crate::config::PairingConfig;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct SessionEntry {
    handle: RangingSessionHandle,
    task: JoinHandle<SessionInfo>,
}

pub struct SessionRegistry {
    config: Arc<PairingConfig>,
    sessions: Mutex<HashMap<SessionHandle, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<PairingConfig>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a new session task; must run inside a tokio runtime
    pub fn open(
        &self,
        handle: SessionHandle,
        profile: Arc<RoleProfile>,
        collaborators: Collaborators,
    ) -> Result<RangingSessionHandle, SessionError> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, entry| !entry.task.is_finished());

        if sessions.contains_key(&handle) {
            return Err(SessionError::DuplicateHandle(handle));
        }
        let limit = self.config.session.max_sessions;
        if sessions.len() >= limit {
            warn!(limit, "Refusing to open another session");
            return Err(SessionError::LimitReached(limit));
        }

        let (session, task) = spawn_session(handle, profile, self.config.clone(), collaborators);
        sessions.insert(
            handle,
            SessionEntry {
                handle: session.clone(),
                task,
            },
        );
        info!(session = %handle, active = sessions.len(), "Session opened");
        Ok(session)
    }

    /// Opens a session with the profile named in the configuration
    pub fn open_configured(
        &self,
        handle: SessionHandle,
        collaborators: Collaborators,
    ) -> Result<RangingSessionHandle, SessionError> {
        let name = &self.config.session.profile;
        let profile = RoleProfile::by_name(name)
            .ok_or_else(|| SessionError::UnknownProfile(name.clone()))?;
        self.open(handle, Arc::new(profile), collaborators)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<RangingSessionHandle> {
        self.sessions
            .lock()
            .get(&handle)
            .filter(|entry| !entry.task.is_finished())
            .map(|entry| entry.handle.clone())
    }

    /// Sessions whose task is still running
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every session and waits for their tasks to finish
    pub async fn close_all(&self) -> Vec<SessionInfo> {
        let entries: Vec<SessionEntry> = self.sessions.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            // an already finished task has dropped its mailbox
            let _ = entry.handle.close().await;
        }
        join_all(entries.into_iter().map(|e| e.task))
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(error = %e, "Session task did not finish cleanly");
                    None
                }
            })
            .collect()
    }
}
