/// Unread-state tracking, derived from message insert events only
use crate::types::{ConversationId, IdentityId, MessageInsertEvent, UnreadSet};
use std::sync::Arc;
use tracing::debug;

/// Owns the unread set for the current identity.
///
/// A conversation becomes unread when someone other than the current
/// identity posts into it, and becomes read again only through `mark_read`.
/// Nothing is persisted: a reset (identity change, restart) starts empty.
#[derive(Debug, Default)]
pub struct UnreadTracker {
    me: Option<IdentityId>,
    set: Arc<UnreadSet>,
}

impl UnreadTracker {
    pub fn new(me: Option<IdentityId>) -> Self {
        Self {
            me,
            set: Arc::new(UnreadSet::default()),
        }
    }

    /// Forget everything and start tracking for `me`.
    /// Returns whether the visible set changed.
    pub fn reset(&mut self, me: Option<IdentityId>) -> bool {
        self.me = me;
        if self.set.is_empty() {
            return false;
        }
        self.set = Arc::new(UnreadSet::default());
        true
    }

    /// Returns whether the set changed
    pub fn on_message_insert(&mut self, event: &MessageInsertEvent) -> bool {
        let Some(me) = &self.me else {
            debug!("Message insert while signed out, ignoring");
            return false;
        };
        if &event.sender_id == me {
            return false;
        }
        if self.set.contains(&event.conversation_id) {
            return false;
        }
        Arc::make_mut(&mut self.set).insert(event.conversation_id.clone())
    }

    /// Acknowledge a conversation. A no-op (returns `false`, set untouched)
    /// when it is already read.
    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> bool {
        if !self.set.contains(conversation_id) {
            return false;
        }
        Arc::make_mut(&mut self.set).remove(conversation_id)
    }

    pub fn current_set(&self) -> Arc<UnreadSet> {
        self.set.clone()
    }

    pub fn is_unread(&self, conversation_id: &ConversationId) -> bool {
        self.set.contains(conversation_id)
    }
}
