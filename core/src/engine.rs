/// Sync engine: a single task owning the identity gate, subscriber, projector and tracker
///
/// All state lives inside the engine task and changes one message at a time.
/// Network work (snapshot pulls, deletes, channels, session resolution) runs
/// in spawned tasks that report back over an internal channel. Every identity
/// transition starts a new epoch; results stamped with an older epoch are
/// dropped on arrival.
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::identity::{IdentityGate, IdentityState, IdentityTransition};
use crate::projector::{Projector, RefreshOutcome, RefreshTicket, Removal};
use crate::remote::{ConversationBackend, EventTransport, SessionSource};
use crate::subscriber::{ChannelSink, Subscriber, SubscriptionId};
use crate::types::{
    ChannelState, ConversationId, ConversationSet, ConversationSummary, Identity,
    MessageInsertEvent, ProfileChangeEvent, SyncEvent, Topic, UnreadSet,
};
use crate::unread::UnreadTracker;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// External collaborators the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn ConversationBackend>,
    pub transport: Arc<dyn EventTransport>,
    pub session: Arc<dyn SessionSource>,
}

impl Collaborators {
    /// Use one object for all three roles
    pub fn from_remote<R>(remote: Arc<R>) -> Self
    where
        R: ConversationBackend + EventTransport + SessionSource + 'static,
    {
        Self {
            backend: remote.clone(),
            transport: remote.clone(),
            session: remote,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub topic: Topic,
    pub state: ChannelState,
}

/// Point-in-time view of the engine, for diagnostics and the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub identity: IdentityState,
    pub epoch: u64,
    pub conversations: usize,
    pub revision: u64,
    pub unread: usize,
    pub refreshing: bool,
    pub refresh_pending: bool,
    pub channels: Vec<ChannelStatus>,
}

impl EngineStatus {
    /// Signed in, both channels live and no pull outstanding
    pub fn is_settled(&self) -> bool {
        matches!(self.identity, IdentityState::Present(_))
            && !self.refreshing
            && !self.refresh_pending
            && self.channels.len() == Topic::ALL.len()
            && self.channels.iter().all(|c| c.state == ChannelState::Live)
    }
}

enum Command {
    SetIdentity(Option<Identity>),
    RefreshNow,
    Foregrounded,
    MarkRead(ConversationId),
    Delete {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Result<()>>,
    },
    OnIdentityChange(Box<dyn FnMut(&IdentityTransition) + Send>),
    Status(oneshot::Sender<EngineStatus>),
    Shutdown,
}

enum Internal {
    SessionResolved(Result<Option<Identity>>),
    MessageInserted(SubscriptionId, MessageInsertEvent),
    ProfileChanged(SubscriptionId, ProfileChangeEvent),
    ChannelChanged(SubscriptionId, Topic, ChannelState),
    ChannelError(SubscriptionId, Topic, SyncError),
    RefreshFinished(RefreshTicket, Result<Vec<ConversationSummary>>),
    DeleteFinished {
        epoch: u64,
        conversation_id: ConversationId,
        removal: Option<Removal>,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Forwards channel deliveries into the engine task
struct InternalSink(mpsc::UnboundedSender<Internal>);

impl ChannelSink for InternalSink {
    fn message_inserted(&self, subscription: SubscriptionId, event: MessageInsertEvent) {
        let _ = self.0.send(Internal::MessageInserted(subscription, event));
    }

    fn profile_changed(&self, subscription: SubscriptionId, event: ProfileChangeEvent) {
        let _ = self.0.send(Internal::ProfileChanged(subscription, event));
    }

    fn channel_changed(&self, subscription: SubscriptionId, topic: Topic, state: ChannelState) {
        let _ = self.0.send(Internal::ChannelChanged(subscription, topic, state));
    }

    fn channel_error(&self, subscription: SubscriptionId, topic: Topic, error: SyncError) {
        let _ = self.0.send(Internal::ChannelError(subscription, topic, error));
    }
}

pub struct SyncEngine {
    backend: Arc<dyn ConversationBackend>,
    session: Arc<dyn SessionSource>,
    gate: IdentityGate,
    subscriber: Subscriber,
    projector: Projector,
    tracker: UnreadTracker,
    epoch: u64,
    channel_states: HashMap<Topic, ChannelState>,
    poll_interval: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    conversations: Arc<watch::Sender<Arc<ConversationSet>>>,
    unread: Arc<watch::Sender<Arc<UnreadSet>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    /// Start the engine task. Must be called from within a tokio runtime.
    ///
    /// The engine resolves the ambient session first; until then it neither
    /// subscribes nor pulls.
    pub fn spawn(config: &Config, collaborators: Collaborators) -> EngineHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (conversations, _) = watch::channel(Arc::new(ConversationSet::empty()));
        let (unread, _) = watch::channel(Arc::new(UnreadSet::default()));
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let conversations = Arc::new(conversations);
        let unread = Arc::new(unread);

        let engine = SyncEngine {
            backend: collaborators.backend,
            session: collaborators.session,
            gate: IdentityGate::new(),
            subscriber: Subscriber::new(collaborators.transport, config.reconnect_policy()),
            projector: Projector::new(),
            tracker: UnreadTracker::new(None),
            epoch: 0,
            channel_states: HashMap::new(),
            poll_interval: config.poll_interval,
            commands,
            internal_tx,
            internal_rx,
            conversations: conversations.clone(),
            unread: unread.clone(),
            events: events.clone(),
        };
        tokio::spawn(engine.run());

        EngineHandle {
            commands: commands_tx,
            conversations,
            unread,
            events,
        }
    }

    async fn run(mut self) {
        info!("Sync engine started");
        self.resolve_session();

        let mut poll = self.poll_interval.map(|every| {
            let mut poll = interval_at(Instant::now() + every, every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
            poll
        });

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                _ = next_tick(&mut poll) => {
                    debug!("Periodic refresh");
                    self.trigger_refresh();
                }
            }
        }

        self.subscriber.close_current();
        info!("Sync engine stopped");
    }

    fn resolve_session(&self) {
        let session = self.session.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = session.resolve_session().await;
            let _ = tx.send(Internal::SessionResolved(result));
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetIdentity(next) => {
                if let Some(transition) = self.gate.set(next) {
                    self.on_transition(transition);
                }
            }
            Command::RefreshNow => self.trigger_refresh(),
            Command::Foregrounded => {
                info!("App foregrounded, refreshing");
                self.trigger_refresh();
            }
            Command::MarkRead(conversation_id) => {
                if self.tracker.mark_read(&conversation_id) {
                    debug!("Marked {} read", conversation_id);
                    self.publish_unread();
                }
            }
            Command::Delete {
                conversation_id,
                reply,
            } => self.start_delete(conversation_id, reply),
            Command::OnIdentityChange(handler) => self.gate.on_identity_change(handler),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SessionResolved(result) => {
                let (transition, error) = self.gate.resolve(result);
                if let Some(e) = error {
                    self.report(&e);
                }
                if let Some(transition) = transition {
                    self.on_transition(transition);
                }
            }
            Internal::MessageInserted(subscription, event) => {
                if !self.accepts(subscription) {
                    return;
                }
                if self.tracker.on_message_insert(&event) {
                    debug!("{} is now unread", event.conversation_id);
                    self.publish_unread();
                }
                self.trigger_refresh();
            }
            Internal::ProfileChanged(subscription, event) => {
                if !self.accepts(subscription) {
                    return;
                }
                debug!("Profile {} changed, refreshing", event.subject_id);
                self.trigger_refresh();
            }
            Internal::ChannelChanged(subscription, topic, state) => {
                if !self.accepts(subscription) {
                    return;
                }
                self.channel_states.insert(topic, state);
                let _ = self.events.send(SyncEvent::ChannelChanged { topic, state });
                // Covers events missed before the channel went live or while it was down
                if state == ChannelState::Live {
                    self.trigger_refresh();
                }
            }
            Internal::ChannelError(subscription, topic, error) => {
                if !self.accepts(subscription) {
                    return;
                }
                debug!("{} channel error reported", topic);
                self.report(&error);
            }
            Internal::RefreshFinished(ticket, result) => {
                let completion = self.projector.complete(ticket, result);
                match completion.outcome {
                    RefreshOutcome::Applied { changed: true } => self.publish_conversations(),
                    RefreshOutcome::Failed(e) => self.report(&e),
                    RefreshOutcome::Applied { changed: false } | RefreshOutcome::Discarded => {}
                }
                if let Some(ticket) = completion.follow_up {
                    self.start_refresh(ticket);
                }
            }
            Internal::DeleteFinished {
                epoch,
                conversation_id,
                removal,
                result,
                reply,
            } => self.finish_delete(epoch, conversation_id, removal, result, reply),
        }
    }

    fn accepts(&self, subscription: SubscriptionId) -> bool {
        let current = self.subscriber.is_current(subscription);
        if !current {
            debug!("Dropping delivery from closed subscription {}", subscription);
        }
        current
    }

    fn on_transition(&mut self, transition: IdentityTransition) {
        self.epoch += 1;
        self.subscriber.close_current();
        self.channel_states.clear();

        let me = transition.current.id().cloned();
        if self.projector.reset(self.epoch, me.clone()) {
            self.publish_conversations();
        }
        if self.tracker.reset(me.clone()) {
            self.publish_unread();
        }
        let _ = self.events.send(SyncEvent::IdentityChanged {
            identity: me.clone(),
        });

        if let Some(id) = me {
            let sink = Arc::new(InternalSink(self.internal_tx.clone()));
            self.subscriber.open(&id, sink);
            self.trigger_refresh();
        }
    }

    fn trigger_refresh(&mut self) {
        if let Some(ticket) = self.projector.trigger() {
            self.start_refresh(ticket);
        }
    }

    fn start_refresh(&self, ticket: RefreshTicket) {
        debug!("Starting refresh {} for {}", ticket.id, ticket.identity);
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_snapshot(&ticket.identity).await;
            let _ = tx.send(Internal::RefreshFinished(ticket, result));
        });
    }

    fn start_delete(&mut self, conversation_id: ConversationId, reply: oneshot::Sender<Result<()>>) {
        let Some(identity) = self.gate.current().id().cloned() else {
            let _ = reply.send(Err(SyncError::Mutation(
                "cannot delete while signed out".to_string(),
            )));
            return;
        };

        let removal = self.projector.remove_local(&conversation_id);
        if removal.is_some() {
            self.publish_conversations();
        }

        let epoch = self.epoch;
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.delete_conversation(&identity, &conversation_id).await;
            let _ = tx.send(Internal::DeleteFinished {
                epoch,
                conversation_id,
                removal,
                result,
                reply,
            });
        });
    }

    fn finish_delete(
        &mut self,
        epoch: u64,
        conversation_id: ConversationId,
        removal: Option<Removal>,
        result: Result<()>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let result = result.map_err(|e| match e {
            SyncError::Mutation(_) => e,
            other => SyncError::Mutation(other.to_string()),
        });

        if epoch != self.epoch {
            debug!("Delete of {} finished after identity change", conversation_id);
            let _ = reply.send(result);
            return;
        }

        match result {
            Ok(()) => {
                info!("Deleted conversation {}", conversation_id);
                // A snapshot may have brought it back while the call was running
                if self.projector.remove_local(&conversation_id).is_some() {
                    self.publish_conversations();
                }
                // A pull still running may have read the server before the
                // delete landed; queue one that reads after it
                if self.projector.is_refreshing() {
                    self.trigger_refresh();
                }
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!("Delete of {} failed: {}", conversation_id, e);
                if let Some(removal) = removal {
                    if self.projector.restore(removal) {
                        self.publish_conversations();
                    } else {
                        self.trigger_refresh();
                    }
                }
                self.report(&e);
                let _ = reply.send(Err(e));
            }
        }
    }

    fn publish_conversations(&self) {
        let set = self.projector.snapshot();
        let event = SyncEvent::ConversationsChanged {
            revision: set.revision(),
            count: set.len(),
        };
        self.conversations.send_replace(set);
        let _ = self.events.send(event);
    }

    fn publish_unread(&self) {
        let set = self.tracker.current_set();
        let event = SyncEvent::UnreadChanged {
            unread: set.iter().cloned().collect(),
        };
        self.unread.send_replace(set);
        let _ = self.events.send(event);
    }

    fn report(&self, error: &SyncError) {
        let _ = self.events.send(SyncEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn status(&self) -> EngineStatus {
        let set = self.projector.snapshot();
        EngineStatus {
            identity: self.gate.current().clone(),
            epoch: self.epoch,
            conversations: set.len(),
            revision: set.revision(),
            unread: self.tracker.current_set().len(),
            refreshing: self.projector.is_refreshing(),
            refresh_pending: self.projector.has_pending(),
            channels: Topic::ALL
                .iter()
                .filter_map(|topic| {
                    self.channel_states.get(topic).map(|state| ChannelStatus {
                        topic: *topic,
                        state: *state,
                    })
                })
                .collect(),
        }
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cloneable handle to a running engine; the UI-facing surface
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    conversations: Arc<watch::Sender<Arc<ConversationSet>>>,
    unread: Arc<watch::Sender<Arc<UnreadSet>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Receives a new snapshot each time the set changes
    pub fn subscribe_to_conversation_set(&self) -> watch::Receiver<Arc<ConversationSet>> {
        self.conversations.subscribe()
    }

    /// Receives a new snapshot each time the unread set changes
    pub fn subscribe_to_unread_set(&self) -> watch::Receiver<Arc<UnreadSet>> {
        self.unread.subscribe()
    }

    pub fn subscribe_to_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn conversations(&self) -> Arc<ConversationSet> {
        self.conversations.borrow().clone()
    }

    pub fn unread(&self) -> Arc<UnreadSet> {
        self.unread.borrow().clone()
    }

    pub fn refresh_now(&self) -> Result<()> {
        self.send(Command::RefreshNow)
    }

    /// The app came back from the background
    pub fn foregrounded(&self) -> Result<()> {
        self.send(Command::Foregrounded)
    }

    /// Acknowledge a conversation from the detail view
    pub fn mark_read(&self, conversation_id: impl Into<ConversationId>) -> Result<()> {
        self.send(Command::MarkRead(conversation_id.into()))
    }

    /// Remove a conversation; the entry disappears locally right away and
    /// comes back if the remote refuses
    pub async fn delete_conversation(&self, conversation_id: impl Into<ConversationId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Delete {
            conversation_id: conversation_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    /// Report a sign-in (`Some`) or sign-out (`None`) from the auth flow
    pub fn set_identity(&self, identity: Option<Identity>) -> Result<()> {
        self.send(Command::SetIdentity(identity))
    }

    pub fn on_identity_change(
        &self,
        handler: impl FnMut(&IdentityTransition) + Send + 'static,
    ) -> Result<()> {
        self.send(Command::OnIdentityChange(Box::new(handler)))
    }

    /// Round-trips through the engine task, so everything sent before it
    /// has been processed when it returns
    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}
