/// Boundary with the remote data store, realtime transport and auth session
use crate::error::Result;
use crate::types::{ChannelEvent, ConversationId, ConversationSummary, Identity, IdentityId, Topic};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of frames for one topic channel.
///
/// The stream ending, or yielding an `Err`, means the transport dropped the
/// channel; the subscriber reconnects.
pub type EventStream = BoxStream<'static, Result<ChannelEvent>>;

/// Request/response calls against the remote store
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Full list of conversation summaries for `identity`. No partial results.
    async fn fetch_snapshot(&self, identity: &IdentityId) -> Result<Vec<ConversationSummary>>;

    /// Remove a conversation server-side
    async fn delete_conversation(
        &self,
        identity: &IdentityId,
        conversation_id: &ConversationId,
    ) -> Result<()>;
}

/// Realtime change feed
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open one channel for `topic`, scoped to `identity`
    async fn connect(&self, topic: Topic, identity: &IdentityId) -> Result<EventStream>;
}

/// Ambient authentication session
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn resolve_session(&self) -> Result<Option<Identity>>;
}
