/// Identity gate: tracks who is signed in and announces changes
use crate::error::{Result, SyncError};
use crate::types::{Identity, IdentityId};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Current authentication state as seen by the sync layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdentityState {
    /// The ambient session has not been resolved yet
    Loading,
    /// Nobody is signed in
    Absent,
    /// Signed in
    Present(Identity),
}

impl IdentityState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            IdentityState::Present(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&IdentityId> {
        self.identity().map(|identity| &identity.id)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, IdentityState::Loading)
    }
}

/// A change the gate has announced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityTransition {
    pub previous: IdentityState,
    pub current: IdentityState,
}

pub type IdentityHandler = Box<dyn FnMut(&IdentityTransition) + Send>;

pub struct IdentityGate {
    state: IdentityState,
    handlers: Vec<IdentityHandler>,
}

impl IdentityGate {
    pub fn new() -> Self {
        Self {
            state: IdentityState::Loading,
            handlers: Vec::new(),
        }
    }

    pub fn current(&self) -> &IdentityState {
        &self.state
    }

    /// Handlers run in registration order, one transition at a time
    pub fn on_identity_change(&mut self, handler: IdentityHandler) {
        self.handlers.push(handler);
    }

    /// Apply the result of the startup session resolution.
    ///
    /// A failure counts as "absent"; the error is handed back for reporting.
    /// Ignored when an explicit sign-in/out already moved the gate out of
    /// `Loading`.
    pub fn resolve(
        &mut self,
        result: Result<Option<Identity>>,
    ) -> (Option<IdentityTransition>, Option<SyncError>) {
        if !self.state.is_loading() {
            debug!("Session resolution arrived after an explicit transition, ignoring");
            return (None, result.err());
        }

        match result {
            Ok(identity) => (self.set(identity), None),
            Err(e) => {
                warn!("Session resolution failed, treating as signed out: {}", e);
                let error = match e {
                    SyncError::IdentityResolution(_) => e,
                    other => SyncError::IdentityResolution(other.to_string()),
                };
                (self.set(None), Some(error))
            }
        }
    }

    /// Move to `next`; returns the transition when something actually changed.
    ///
    /// Identities compare by id: a display name refresh for the same id is
    /// recorded silently.
    pub fn set(&mut self, next: Option<Identity>) -> Option<IdentityTransition> {
        let next_state = match next {
            Some(identity) => IdentityState::Present(identity),
            None => IdentityState::Absent,
        };

        let same = match (&self.state, &next_state) {
            (IdentityState::Absent, IdentityState::Absent) => true,
            (IdentityState::Present(a), IdentityState::Present(b)) => a.id == b.id,
            _ => false,
        };
        if same {
            self.state = next_state;
            return None;
        }

        let transition = IdentityTransition {
            previous: std::mem::replace(&mut self.state, next_state),
            current: self.state.clone(),
        };
        info!(
            "Identity changed: {:?} -> {:?}",
            transition.previous.id(),
            transition.current.id()
        );

        for handler in self.handlers.iter_mut() {
            handler(&transition);
        }

        Some(transition)
    }
}

impl Default for IdentityGate {
    fn default() -> Self {
        Self::new()
    }
}
