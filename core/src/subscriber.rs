/// Change-event subscriber: one message channel and one profile channel per identity
use crate::error::SyncError;
use crate::remote::EventTransport;
use crate::types::{
    ChannelEvent, ChannelState, IdentityId, MessageInsertEvent, ProfileChangeEvent, Topic,
};
use futures_util::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Identifies one `open` call; events carry it so late deliveries can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle returned by `Subscriber::open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub identity: IdentityId,
}

/// Receives what the channels deliver
pub trait ChannelSink: Send + Sync + 'static {
    fn message_inserted(&self, subscription: SubscriptionId, event: MessageInsertEvent);

    fn profile_changed(&self, subscription: SubscriptionId, event: ProfileChangeEvent);

    fn channel_changed(&self, subscription: SubscriptionId, topic: Topic, state: ChannelState);

    fn channel_error(&self, subscription: SubscriptionId, topic: Topic, error: SyncError);
}

/// Reconnect schedule for dropped channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before giving up (`None` = keep trying)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

struct OpenSubscription {
    handle: SubscriptionHandle,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl OpenSubscription {
    fn close(self) {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.tasks {
            task.abort();
        }
        info!(
            "Closed channels {} for {}",
            self.handle.id, self.handle.identity
        );
    }
}

/// Owns the topic channels for at most one identity at a time
pub struct Subscriber {
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    next_id: u64,
    current: Option<OpenSubscription>,
}

impl Subscriber {
    pub fn new(transport: Arc<dyn EventTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            next_id: 0,
            current: None,
        }
    }

    /// Open both topic channels for `identity`.
    ///
    /// Opening again for the same identity returns the existing handle.
    /// Opening for another identity closes the previous channels first.
    /// Must be called from within a tokio runtime.
    pub fn open(&mut self, identity: &IdentityId, sink: Arc<dyn ChannelSink>) -> SubscriptionHandle {
        if let Some(current) = &self.current {
            if &current.handle.identity == identity {
                debug!("Channels already open for {}", identity);
                return current.handle.clone();
            }
        }
        self.close_current();

        self.next_id += 1;
        let handle = SubscriptionHandle {
            id: SubscriptionId(self.next_id),
            identity: identity.clone(),
        };
        let closed = Arc::new(AtomicBool::new(false));

        let tasks = Topic::ALL
            .iter()
            .map(|&topic| {
                let channel = Channel {
                    topic,
                    subscription: handle.id,
                    identity: identity.clone(),
                    transport: self.transport.clone(),
                    sink: sink.clone(),
                    closed: closed.clone(),
                    policy: self.policy,
                };
                tokio::spawn(channel.run())
            })
            .collect();

        info!("Opened channels {} for {}", handle.id, identity);
        self.current = Some(OpenSubscription {
            handle: handle.clone(),
            closed,
            tasks,
        });
        handle
    }

    /// Close the channels behind `handle`. Returns `false` for a stale or
    /// already-closed handle.
    pub fn close(&mut self, handle: &SubscriptionHandle) -> bool {
        match &self.current {
            Some(current) if current.handle.id == handle.id => {
                self.close_current();
                true
            }
            _ => {
                debug!("Ignoring close for stale handle {}", handle.id);
                false
            }
        }
    }

    pub fn close_current(&mut self) {
        if let Some(current) = self.current.take() {
            current.close();
        }
    }

    /// Whether deliveries stamped with `id` may still be consumed
    pub fn is_current(&self, id: SubscriptionId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.handle.id == id)
    }

    pub fn current_handle(&self) -> Option<&SubscriptionHandle> {
        self.current.as_ref().map(|current| &current.handle)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close_current();
    }
}

/// One topic channel with its reconnect loop
struct Channel {
    topic: Topic,
    subscription: SubscriptionId,
    identity: IdentityId,
    transport: Arc<dyn EventTransport>,
    sink: Arc<dyn ChannelSink>,
    closed: Arc<AtomicBool>,
    policy: ReconnectPolicy,
}

impl Channel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, state: ChannelState) {
        if !self.is_closed() {
            self.sink.channel_changed(self.subscription, self.topic, state);
        }
    }

    async fn run(self) {
        let mut failures: u32 = 0;

        loop {
            if self.is_closed() {
                return;
            }
            self.report(ChannelState::Connecting);

            let error = match self.transport.connect(self.topic, &self.identity).await {
                Ok(mut stream) => {
                    if self.is_closed() {
                        return;
                    }
                    info!("{} channel live for {}", self.topic, self.identity);
                    failures = 0;
                    self.report(ChannelState::Live);

                    loop {
                        match stream.next().await {
                            Some(Ok(event)) => {
                                if self.is_closed() {
                                    return;
                                }
                                self.deliver(event);
                            }
                            Some(Err(e)) => break e,
                            None => {
                                break SyncError::ChannelConnection(format!(
                                    "{} channel closed by transport",
                                    self.topic
                                ))
                            }
                        }
                    }
                }
                Err(e) => e,
            };

            if self.is_closed() {
                return;
            }
            let error = match error {
                SyncError::ChannelConnection(_) => error,
                other => SyncError::ChannelConnection(other.to_string()),
            };
            warn!("{} channel for {} dropped: {}", self.topic, self.identity, error);
            self.sink.channel_error(self.subscription, self.topic, error);

            failures += 1;
            if let Some(max) = self.policy.max_attempts {
                if failures > max {
                    warn!(
                        "{} channel for {} giving up after {} attempts",
                        self.topic, self.identity, failures
                    );
                    self.report(ChannelState::Failed);
                    return;
                }
            }
            self.report(ChannelState::Disconnected);

            let delay = self.policy.backoff(failures);
            debug!("Reconnecting {} channel in {:?}", self.topic, delay);
            sleep(delay).await;
        }
    }

    fn deliver(&self, event: ChannelEvent) {
        if event.topic() != self.topic {
            debug!(
                "Dropping {} frame received on {} channel",
                event.topic(),
                self.topic
            );
            return;
        }
        match event {
            ChannelEvent::MessageInsert(event) => {
                self.sink.message_inserted(self.subscription, event)
            }
            ChannelEvent::ProfileChange(event) => {
                self.sink.profile_changed(self.subscription, event)
            }
        }
    }
}
