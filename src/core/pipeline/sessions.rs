use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::core::domain::{ExecutionState, SessionId};

#[derive(Debug)]
struct SessionEntry {
    state: ExecutionState,
    cancel: CancellationToken,
}

/// In-flight executions keyed by session. An entry exists exactly while its
/// `SessionClaim` is alive.
#[derive(Clone, Debug, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` as busy. Returns `None` when it already has an execution.
    pub fn claim(&self, session: &SessionId) -> Option<SessionClaim> {
        match self.sessions.entry(session.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let cancel = CancellationToken::new();
                entry.insert(SessionEntry {
                    state: ExecutionState::Queued,
                    cancel: cancel.clone(),
                });
                Some(SessionClaim {
                    session: session.clone(),
                    cancel,
                    registry: self.clone(),
                })
            }
        }
    }

    pub fn state(&self, session: &SessionId) -> Option<ExecutionState> {
        self.sessions.get(session).map(|entry| entry.state)
    }

    /// Returns whether there was an execution to cancel.
    pub fn cancel(&self, session: &SessionId) -> bool {
        match self.sessions.get(session) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn set_state(&self, session: &SessionId, state: ExecutionState) {
        if let Some(mut entry) = self.sessions.get_mut(session) {
            entry.state = state;
        }
    }

    fn release(&self, session: &SessionId) {
        self.sessions.remove(session);
    }
}

/// Exclusive right of one execution to its session. Dropping it frees the session.
#[derive(Debug)]
pub struct SessionClaim {
    session: SessionId,
    cancel: CancellationToken,
    registry: SessionRegistry,
}

impl SessionClaim {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_state(&self, state: ExecutionState) {
        tracing::debug!("Session {} is now {:?}", self.session, state);
        self.registry.set_state(&self.session, state);
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        self.registry.release(&self.session);
    }
}
