/// Shared types for the sync layer
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Identifier of an authenticated principal
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identifier of a two-party conversation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The signed-in principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }
}

/// One row of the conversation list, as delivered by a snapshot pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub counterpart_display_name: String,
    #[serde(default)]
    pub counterpart_avatar_ref: Option<String>,
    /// Empty when the conversation has no messages yet
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Read-only view of the conversations known for the current identity.
///
/// Keyed by conversation id, iterated in snapshot order. The engine hands
/// these out behind an `Arc`; only the projector builds or edits them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationSet {
    revision: u64,
    entries: IndexMap<ConversationId, ConversationSummary>,
}

impl ConversationSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(revision: u64, summaries: Vec<ConversationSummary>) -> Self {
        let mut entries = IndexMap::with_capacity(summaries.len());
        for summary in summaries {
            let id = summary.conversation_id.clone();
            if entries.insert(id.clone(), summary).is_some() {
                warn!("Snapshot listed conversation {} more than once, keeping the last entry", id);
            }
        }
        Self { revision, entries }
    }

    /// Bumped every time the projector publishes a different set
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationSummary> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationSummary> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ConversationId> {
        self.entries.keys()
    }

    /// Order-sensitive comparison of the entries, ignoring revisions
    pub(crate) fn same_entries(&self, other: &ConversationSet) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().eq(other.entries.iter())
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    pub(crate) fn remove(&mut self, id: &ConversationId) -> Option<(usize, ConversationSummary)> {
        self.entries
            .shift_remove_full(id)
            .map(|(index, _, summary)| (index, summary))
    }

    pub(crate) fn insert_at(&mut self, index: usize, summary: ConversationSummary) {
        let index = index.min(self.entries.len());
        self.entries
            .shift_insert(index, summary.conversation_id.clone(), summary);
    }
}

/// Conversations holding content the current identity has not acknowledged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UnreadSet(BTreeSet<ConversationId>);

impl UnreadSet {
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationId> {
        self.0.iter()
    }

    pub(crate) fn insert(&mut self, id: ConversationId) -> bool {
        self.0.insert(id)
    }

    pub(crate) fn remove(&mut self, id: &ConversationId) -> bool {
        self.0.remove(id)
    }
}

/// A message row was created in a conversation the identity takes part in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInsertEvent {
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub occurred_at: DateTime<Utc>,
}

/// Someone's display name or avatar may have changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileChangeEvent {
    pub subject_id: IdentityId,
}

/// Logical event channels opened per identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MessageInsert,
    ProfileUpdate,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::MessageInsert, Topic::ProfileUpdate];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::MessageInsert => f.write_str("message-insert"),
            Topic::ProfileUpdate => f.write_str("profile-update"),
        }
    }
}

/// One frame delivered by a transport channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    MessageInsert(MessageInsertEvent),
    ProfileChange(ProfileChangeEvent),
}

impl ChannelEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ChannelEvent::MessageInsert(_) => Topic::MessageInsert,
            ChannelEvent::ProfileChange(_) => Topic::ProfileUpdate,
        }
    }
}

/// Connection state of one topic channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Subscribing to the transport
    Connecting,
    /// Delivering events
    Live,
    /// Transport dropped, a reconnect is scheduled
    Disconnected,
    /// Reconnect attempts exhausted
    Failed,
}

/// Notifications streamed to UI consumers (SSE `/events`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The identity gate moved to a new state
    IdentityChanged { identity: Option<IdentityId> },
    /// A new conversation set was published
    ConversationsChanged { revision: u64, count: usize },
    /// The unread set changed
    UnreadChanged { unread: Vec<ConversationId> },
    /// A topic channel changed connection state
    ChannelChanged { topic: Topic, state: ChannelState },
    /// A recoverable error worth showing to the user
    Error { kind: ErrorKind, message: String },
}
