/// In-process remote: profiles, two-party conversations and messages held in memory.
/// Backs the demo server and the integration tests, with fault injection hooks.
use crate::error::{Result, SyncError};
use crate::remote::{ConversationBackend, EventStream, EventTransport, SessionSource};
use crate::types::{
    ChannelEvent, ConversationId, ConversationSummary, Identity, IdentityId, MessageInsertEvent,
    ProfileChangeEvent, Topic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{unfold, StreamExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info};

const PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConversation {
    pub id: ConversationId,
    pub participants: [IdentityId; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedMessage {
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Initial contents of a `MemoryRemote`, loadable from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub profiles: BTreeMap<IdentityId, Profile>,
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
    #[serde(default)]
    pub messages: Vec<SeedMessage>,
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(SyncError::Io)?;
        let seed: Seed = serde_json::from_str(&raw).map_err(SyncError::Serialization)?;
        Ok(seed)
    }
}

struct ChannelTx {
    topic: Topic,
    identity: IdentityId,
    tx: mpsc::UnboundedSender<Result<ChannelEvent>>,
}

#[derive(Default)]
struct Store {
    profiles: BTreeMap<IdentityId, Profile>,
    conversations: IndexMap<ConversationId, [IdentityId; 2]>,
    messages: Vec<SeedMessage>,
    channels: Vec<ChannelTx>,
    session: Option<Identity>,
}

impl Store {
    fn snapshot_for(&self, identity: &IdentityId) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .filter_map(|(id, participants)| {
                let counterpart = counterpart_of(participants, identity)?;
                let profile = self.profiles.get(counterpart);
                let last = self
                    .messages
                    .iter()
                    .filter(|m| &m.conversation_id == id)
                    .max_by_key(|m| m.sent_at);
                Some(ConversationSummary {
                    conversation_id: id.clone(),
                    counterpart_display_name: profile
                        .map(|p| p.display_name.clone())
                        .unwrap_or_else(|| counterpart.to_string()),
                    counterpart_avatar_ref: profile.and_then(|p| p.avatar_ref.clone()),
                    last_message_preview: last
                        .map(|m| m.body.chars().take(PREVIEW_MAX_CHARS).collect())
                        .unwrap_or_default(),
                    last_message_at: last.map(|m| m.sent_at),
                })
            })
            .collect();
        // Newest first, conversations without messages last
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        summaries
    }

    fn emit(&mut self, event: ChannelEvent, audience: impl Fn(&ChannelTx) -> bool) -> usize {
        self.channels.retain(|channel| !channel.tx.is_closed());
        let mut delivered = 0;
        for channel in self.channels.iter().filter(|c| audience(c)) {
            if channel.tx.send(Ok(event.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

fn counterpart_of<'a>(participants: &'a [IdentityId; 2], identity: &IdentityId) -> Option<&'a IdentityId> {
    if &participants[0] == identity {
        Some(&participants[1])
    } else if &participants[1] == identity {
        Some(&participants[0])
    } else {
        None
    }
}

#[derive(Default)]
struct Faults {
    failing_fetches: u32,
    failing_connects: u32,
    fail_deletes: bool,
    fail_session: bool,
}

/// Remote store and realtime feed living in this process
pub struct MemoryRemote {
    store: RwLock<Store>,
    faults: Mutex<Faults>,
    fetch_gate: watch::Sender<bool>,
    fetches: AtomicUsize,
    connects: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_store(Store::default())
    }

    pub fn from_seed(seed: Seed) -> Self {
        let mut store = Store {
            profiles: seed.profiles,
            messages: seed.messages,
            ..Default::default()
        };
        for conversation in seed.conversations {
            store
                .conversations
                .insert(conversation.id, conversation.participants);
        }
        store.messages.sort_by_key(|m| m.sent_at);
        Self::with_store(store)
    }

    fn with_store(store: Store) -> Self {
        let (fetch_gate, _) = watch::channel(true);
        Self {
            store: RwLock::new(store),
            faults: Mutex::new(Faults::default()),
            fetch_gate,
            fetches: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    // ─── Remote activity ────────────────────────────────────────────────────

    pub async fn set_session(&self, identity: Option<Identity>) {
        self.store.write().await.session = identity;
    }

    pub async fn upsert_profile(&self, id: impl Into<IdentityId>, profile: Profile) -> usize {
        let id = id.into();
        let mut store = self.store.write().await;
        store.profiles.insert(id.clone(), profile);
        let event = ChannelEvent::ProfileChange(ProfileChangeEvent { subject_id: id });
        // Profile updates are broadcast to everyone
        store.emit(event, |c| c.topic == Topic::ProfileUpdate)
    }

    pub async fn create_conversation(
        &self,
        id: impl Into<ConversationId>,
        a: impl Into<IdentityId>,
        b: impl Into<IdentityId>,
    ) {
        let mut store = self.store.write().await;
        store.conversations.insert(id.into(), [a.into(), b.into()]);
    }

    /// Store a message and notify both participants' message channels
    pub async fn post_message(
        &self,
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<IdentityId>,
        body: impl Into<String>,
    ) -> Result<MessageInsertEvent> {
        let conversation_id = conversation_id.into();
        let sender_id = sender_id.into();
        let mut store = self.store.write().await;

        let participants = store
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| {
                SyncError::Mutation(format!("unknown conversation {}", conversation_id))
            })?;
        if !participants.contains(&sender_id) {
            return Err(SyncError::Mutation(format!(
                "{} is not part of {}",
                sender_id, conversation_id
            )));
        }

        let sent_at = Utc::now();
        store.messages.push(SeedMessage {
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            body: body.into(),
            sent_at,
        });

        let event = MessageInsertEvent {
            conversation_id,
            sender_id,
            occurred_at: sent_at,
        };
        let delivered = store.emit(ChannelEvent::MessageInsert(event.clone()), |c| {
            c.topic == Topic::MessageInsert && participants.contains(&c.identity)
        });
        debug!(
            "Message in {} delivered to {} channels",
            event.conversation_id, delivered
        );
        Ok(event)
    }

    /// Push a raw frame to every channel of `topic`, bypassing the data model
    pub async fn push_frame(&self, topic: Topic, event: ChannelEvent) -> usize {
        let mut store = self.store.write().await;
        store.emit(event, |c| c.topic == topic)
    }

    // ─── Fault injection ────────────────────────────────────────────────────

    /// Drop every open channel, as a network loss would
    pub async fn disconnect_all(&self) {
        let mut store = self.store.write().await;
        info!("Dropping {} channels", store.channels.len());
        for channel in store.channels.drain(..) {
            let _ = channel.tx.send(Err(SyncError::ChannelConnection(
                "connection reset".to_string(),
            )));
        }
    }

    pub async fn fail_next_fetches(&self, n: u32) {
        self.faults.lock().await.failing_fetches = n;
    }

    pub async fn fail_next_connects(&self, n: u32) {
        self.faults.lock().await.failing_connects = n;
    }

    pub async fn fail_deletes(&self, fail: bool) {
        self.faults.lock().await.fail_deletes = fail;
    }

    pub async fn fail_session_resolution(&self, fail: bool) {
        self.faults.lock().await.fail_session = fail;
    }

    /// Park snapshot pulls until `release_fetches`
    pub fn hold_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    // ─── Inspection ─────────────────────────────────────────────────────────

    /// Snapshot pulls started so far (including parked ones)
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn open_channels(&self, topic: Topic) -> usize {
        let store = self.store.read().await;
        store
            .channels
            .iter()
            .filter(|c| c.topic == topic && !c.tx.is_closed())
            .count()
    }

    pub async fn has_conversation(&self, id: &ConversationId) -> bool {
        self.store.read().await.conversations.contains_key(id)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationBackend for MemoryRemote {
    async fn fetch_snapshot(&self, identity: &IdentityId) -> Result<Vec<ConversationSummary>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.fetch_gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.is_ok();
        if !opened {
            return Err(SyncError::SnapshotFetch("remote shut down".to_string()));
        }

        {
            let mut faults = self.faults.lock().await;
            if faults.failing_fetches > 0 {
                faults.failing_fetches -= 1;
                return Err(SyncError::SnapshotFetch("injected fetch failure".to_string()));
            }
        }

        let store = self.store.read().await;
        Ok(store.snapshot_for(identity))
    }

    async fn delete_conversation(
        &self,
        identity: &IdentityId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        if self.faults.lock().await.fail_deletes {
            return Err(SyncError::Mutation("injected delete failure".to_string()));
        }

        let mut store = self.store.write().await;
        match store.conversations.get(conversation_id) {
            Some(participants) if participants.contains(identity) => {}
            _ => {
                return Err(SyncError::Mutation(format!(
                    "{} cannot delete {}",
                    identity, conversation_id
                )))
            }
        }
        store.conversations.shift_remove(conversation_id);
        store.messages.retain(|m| &m.conversation_id != conversation_id);
        Ok(())
    }
}

#[async_trait]
impl EventTransport for MemoryRemote {
    async fn connect(&self, topic: Topic, identity: &IdentityId) -> Result<EventStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().await;
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(SyncError::ChannelConnection(
                    "injected connect failure".to_string(),
                ));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.store.write().await.channels.push(ChannelTx {
            topic,
            identity: identity.clone(),
            tx,
        });

        let stream = unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl SessionSource for MemoryRemote {
    async fn resolve_session(&self) -> Result<Option<Identity>> {
        if self.faults.lock().await.fail_session {
            return Err(SyncError::IdentityResolution(
                "injected session failure".to_string(),
            ));
        }
        Ok(self.store.read().await.session.clone())
    }
}
