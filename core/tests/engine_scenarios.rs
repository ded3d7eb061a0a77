#![allow(clippy::field_reassign_with_default)]
/// Engine scenarios against the in-memory remote: unread tracking, identity
/// switches, refresh coalescing, deletes and failure handling
use async_trait::async_trait;
use inbox_sync::engine::{Collaborators, EngineHandle, EngineStatus, SyncEngine};
use inbox_sync::error::{ErrorKind, Result, SyncError};
use inbox_sync::identity::IdentityState;
use inbox_sync::memory::{MemoryRemote, Profile};
use inbox_sync::remote::ConversationBackend;
use inbox_sync::types::{ConversationId, ConversationSummary, Identity, IdentityId, SyncEvent};
use inbox_sync::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};

fn test_config() -> Config {
    let mut config = Config::default();
    config.reconnect_initial_backoff = Duration::from_millis(10);
    config.reconnect_max_backoff = Duration::from_millis(50);
    config
}

fn profile(name: &str) -> Profile {
    Profile {
        display_name: name.to_string(),
        avatar_ref: None,
    }
}

/// alice (a), bob (b), carol (c); c1 = a+b, c2 = a+c, c3 = b+c
async fn remote_with_session(session: Option<&str>) -> Arc<MemoryRemote> {
    let remote = Arc::new(MemoryRemote::new());
    remote.upsert_profile("a", profile("Alice")).await;
    remote.upsert_profile("b", profile("Bob")).await;
    remote.upsert_profile("c", profile("Carol")).await;
    remote.create_conversation("c1", "a", "b").await;
    remote.create_conversation("c2", "a", "c").await;
    remote.create_conversation("c3", "b", "c").await;
    remote.set_session(session.map(Identity::new)).await;
    remote
}

fn start(remote: &Arc<MemoryRemote>) -> EngineHandle {
    SyncEngine::spawn(&test_config(), Collaborators::from_remote(remote.clone()))
}

async fn wait_for(engine: &EngineHandle, pred: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
    timeout(Duration::from_secs(5), async {
        loop {
            let status = engine.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("engine did not reach the expected state")
}

async fn settle(engine: &EngineHandle, who: &str) -> EngineStatus {
    let who = IdentityId::from(who);
    wait_for(engine, |s| s.is_settled() && s.identity.id() == Some(&who)).await
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held")
}

async fn next_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

fn conversation_ids(engine: &EngineHandle) -> Vec<String> {
    engine
        .conversations()
        .ids()
        .map(|id| id.as_str().to_string())
        .collect()
}

fn preview(engine: &EngineHandle, id: &str) -> Option<String> {
    engine
        .conversations()
        .get(&ConversationId::from(id))
        .map(|s| s.last_message_preview.clone())
}

#[tokio::test]
async fn test_initial_snapshot_lists_own_conversations() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    let status = settle(&engine, "a").await;

    assert_eq!(status.conversations, 2);
    let set = engine.conversations();
    assert!(set.contains(&"c1".into()));
    assert!(set.contains(&"c2".into()));
    assert!(!set.contains(&"c3".into()));
    assert_eq!(
        set.get(&"c1".into()).unwrap().counterpart_display_name,
        "Bob"
    );
}

#[tokio::test]
async fn test_unread_follows_counterpart_messages_only() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    remote.post_message("c1", "b", "hi").await.unwrap();
    eventually(|| engine.unread().contains(&"c1".into())).await;
    eventually(|| preview(&engine, "c1").as_deref() == Some("hi")).await;

    // Replying does not acknowledge
    remote.post_message("c1", "a", "hello back").await.unwrap();
    eventually(|| preview(&engine, "c1").as_deref() == Some("hello back")).await;
    assert!(engine.unread().contains(&"c1".into()));

    engine.mark_read("c1").unwrap();
    engine.status().await.unwrap();
    assert!(engine.unread().is_empty());

    // Self-authored message in another conversation stays read
    remote.post_message("c2", "a", "ping").await.unwrap();
    eventually(|| preview(&engine, "c2").as_deref() == Some("ping")).await;
    settle(&engine, "a").await;
    assert!(engine.unread().is_empty());

    // Conversations the identity is not part of never reach it
    remote.post_message("c3", "b", "psst").await.unwrap();
    settle(&engine, "a").await;
    assert!(!engine.conversations().contains(&"c3".into()));
    assert!(engine.unread().is_empty());
}

#[tokio::test]
async fn test_mark_read_is_idempotent_without_notifications() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    let mut rx = engine.subscribe_to_unread_set();
    remote.post_message("c1", "b", "hi").await.unwrap();
    timeout(Duration::from_secs(5), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(rx.borrow_and_update().contains(&"c1".into()));

    engine.mark_read("c1").unwrap();
    engine.status().await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert!(rx.borrow_and_update().is_empty());

    engine.mark_read("c1").unwrap();
    engine.mark_read("never-seen").unwrap();
    engine.status().await.unwrap();
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_refresh_for_previous_identity_is_discarded() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    let before = remote.fetch_count();
    remote.hold_fetches();
    engine.refresh_now().unwrap();
    eventually(|| remote.fetch_count() == before + 1).await;

    engine.set_identity(None).unwrap();
    wait_for(&engine, |s| s.identity == IdentityState::Absent).await;
    assert!(engine.conversations().is_empty());

    remote.release_fetches();
    sleep(Duration::from_millis(50)).await;
    let status = engine.status().await.unwrap();
    assert!(!status.refreshing);
    assert_eq!(status.conversations, 0);
    assert!(engine.conversations().is_empty());
}

#[tokio::test]
async fn test_identity_switch_resets_unread_and_conversations() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    remote.post_message("c1", "b", "hi").await.unwrap();
    eventually(|| engine.unread().contains(&"c1".into())).await;

    let mut events = engine.subscribe_to_events();
    engine.set_identity(Some(Identity::new("b"))).unwrap();
    next_event(&mut events, |e| {
        matches!(e, SyncEvent::IdentityChanged { identity: Some(id) } if id.as_str() == "b")
    })
    .await;
    settle(&engine, "b").await;

    assert!(engine.unread().is_empty());
    let mut ids = conversation_ids(&engine);
    ids.sort();
    assert_eq!(ids, vec!["c1", "c3"]);

    // Old channels are gone; only b's remain
    remote.post_message("c2", "c", "for alice").await.unwrap();
    settle(&engine, "b").await;
    assert!(engine.unread().is_empty());
}

#[tokio::test]
async fn test_coalesced_refreshes_pull_exactly_twice() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    let base = remote.fetch_count();
    remote.hold_fetches();
    engine.refresh_now().unwrap();
    eventually(|| remote.fetch_count() == base + 1).await;

    for _ in 0..5 {
        engine.refresh_now().unwrap();
    }
    let status = engine.status().await.unwrap();
    assert!(status.refreshing);
    assert!(status.refresh_pending);
    assert_eq!(remote.fetch_count(), base + 1);

    remote.release_fetches();
    settle(&engine, "a").await;
    assert_eq!(remote.fetch_count(), base + 2);
}

#[tokio::test]
async fn test_failed_pull_keeps_current_set() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    let settled = settle(&engine, "a").await;

    let mut events = engine.subscribe_to_events();
    remote.fail_next_fetches(1).await;
    engine.refresh_now().unwrap();
    next_event(&mut events, |e| {
        matches!(e, SyncEvent::Error { kind: ErrorKind::SnapshotFetch, .. })
    })
    .await;

    let status = settle(&engine, "a").await;
    assert_eq!(status.revision, settled.revision);
    assert_eq!(status.conversations, 2);

    // Next pull succeeds again
    remote.post_message("c1", "b", "after failure").await.unwrap();
    eventually(|| preview(&engine, "c1").as_deref() == Some("after failure")).await;
}

#[tokio::test]
async fn test_delete_removes_locally_and_remotely() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    engine.delete_conversation("c1").await.unwrap();
    assert!(!engine.conversations().contains(&"c1".into()));
    assert!(!remote.has_conversation(&"c1".into()).await);

    engine.refresh_now().unwrap();
    settle(&engine, "a").await;
    assert_eq!(conversation_ids(&engine), vec!["c2"]);
}

#[tokio::test]
async fn test_failed_delete_restores_entry_in_place() {
    let remote = remote_with_session(Some("a")).await;
    remote.post_message("c2", "c", "newest").await.unwrap();
    let engine = start(&remote);
    settle(&engine, "a").await;
    let order = conversation_ids(&engine);
    assert_eq!(order, vec!["c2", "c1"]);

    remote.fail_deletes(true).await;
    let mut sets = engine.subscribe_to_conversation_set();
    let err = engine.delete_conversation("c2").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Mutation);

    assert_eq!(conversation_ids(&engine), order);
    assert!(sets.has_changed().unwrap());
    assert!(remote.has_conversation(&"c2".into()).await);
}

#[tokio::test]
async fn test_delete_while_signed_out_is_rejected() {
    let remote = remote_with_session(None).await;
    let engine = start(&remote);
    wait_for(&engine, |s| s.identity == IdentityState::Absent).await;

    let err = engine.delete_conversation("c1").await.unwrap_err();
    assert!(matches!(err, SyncError::Mutation(_)));
    assert!(remote.has_conversation(&"c1".into()).await);
}

#[tokio::test]
async fn test_session_resolution_failure_means_signed_out() {
    let remote = remote_with_session(Some("a")).await;
    remote.fail_session_resolution(true).await;
    let engine = start(&remote);
    let mut events = engine.subscribe_to_events();

    next_event(&mut events, |e| {
        matches!(e, SyncEvent::Error { kind: ErrorKind::IdentityResolution, .. })
    })
    .await;
    let status = wait_for(&engine, |s| s.identity == IdentityState::Absent).await;
    assert!(status.channels.is_empty());
    assert_eq!(remote.fetch_count(), 0);
    assert_eq!(remote.connect_count(), 0);
}

#[tokio::test]
async fn test_signed_out_engine_stays_idle() {
    let remote = remote_with_session(None).await;
    let engine = start(&remote);
    wait_for(&engine, |s| s.identity == IdentityState::Absent).await;

    engine.refresh_now().unwrap();
    engine.foregrounded().unwrap();
    let status = engine.status().await.unwrap();
    assert!(!status.refreshing);
    assert_eq!(remote.fetch_count(), 0);
    assert!(engine.conversations().is_empty());
}

#[tokio::test]
async fn test_profile_change_refreshes_names() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    let settled = settle(&engine, "a").await;

    // Someone unrelated: the re-pull finds nothing new
    remote.upsert_profile("z", profile("Zed")).await;
    let status = settle(&engine, "a").await;
    assert_eq!(status.revision, settled.revision);

    remote.upsert_profile("b", profile("Bobby")).await;
    eventually(|| {
        engine
            .conversations()
            .get(&"c1".into())
            .is_some_and(|s| s.counterpart_display_name == "Bobby")
    })
    .await;
}

#[tokio::test]
async fn test_foreground_pulls_fresh_snapshot() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    // Channels are gone, so only a pull can notice the new message
    remote.disconnect_all().await;
    remote.fail_next_connects(u32::MAX).await;
    remote.post_message("c2", "c", "while away").await.unwrap();

    engine.foregrounded().unwrap();
    eventually(|| preview(&engine, "c2").as_deref() == Some("while away")).await;
}

#[tokio::test]
async fn test_identity_handlers_run_in_order() {
    let remote = remote_with_session(None).await;
    let engine = start(&remote);
    wait_for(&engine, |s| s.identity == IdentityState::Absent).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let seen = seen.clone();
        engine
            .on_identity_change(move |t| {
                let who = t.current.id().map(|id| id.to_string());
                seen.lock().unwrap().push((name, who));
            })
            .unwrap();
    }

    engine.set_identity(Some(Identity::new("a"))).unwrap();
    // Same id again is not a transition
    engine.set_identity(Some(Identity::new("a"))).unwrap();
    engine.set_identity(None).unwrap();
    engine.status().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("first", Some("a".to_string())),
            ("second", Some("a".to_string())),
            ("first", None),
            ("second", None),
        ]
    );
}

#[tokio::test]
async fn test_handle_reports_stopped_engine() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    engine.shutdown().unwrap();
    let err = engine.status().await.unwrap_err();
    assert!(matches!(err, SyncError::EngineStopped));
    eventually(|| engine.refresh_now().is_err()).await;
}

#[tokio::test]
async fn test_cold_start_has_no_unread_state() {
    let remote = remote_with_session(Some("a")).await;
    // History that predates the engine
    remote.post_message("c1", "b", "sent before startup").await.unwrap();
    remote.post_message("c2", "c", "also before").await.unwrap();

    let engine = start(&remote);
    settle(&engine, "a").await;

    assert_eq!(preview(&engine, "c1").as_deref(), Some("sent before startup"));
    assert!(engine.unread().is_empty());
}

#[tokio::test]
async fn test_delete_leaves_unread_set_alone() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    remote.post_message("c1", "b", "hi").await.unwrap();
    eventually(|| engine.unread().contains(&"c1".into())).await;

    engine.delete_conversation("c1").await.unwrap();
    assert!(!engine.conversations().contains(&"c1".into()));
    assert!(engine.unread().contains(&"c1".into()));
}

/// Reads the remote right away but hands one armed snapshot back only after
/// `release`
struct LateSnapshots {
    remote: Arc<MemoryRemote>,
    armed: AtomicBool,
    gate: watch::Sender<bool>,
}

impl LateSnapshots {
    fn new(remote: Arc<MemoryRemote>) -> Self {
        Self {
            remote,
            armed: AtomicBool::new(false),
            gate: watch::channel(false).0,
        }
    }

    fn release(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl ConversationBackend for LateSnapshots {
    async fn fetch_snapshot(&self, identity: &IdentityId) -> Result<Vec<ConversationSummary>> {
        let snapshot = self.remote.fetch_snapshot(identity).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        snapshot
    }

    async fn delete_conversation(
        &self,
        identity: &IdentityId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        self.remote.delete_conversation(identity, conversation_id).await
    }
}

#[tokio::test]
async fn test_delete_outlasts_snapshot_read_before_it() {
    let remote = remote_with_session(Some("a")).await;
    let backend = Arc::new(LateSnapshots::new(remote.clone()));
    let collaborators = Collaborators {
        backend: backend.clone(),
        transport: remote.clone(),
        session: remote.clone(),
    };
    let engine = SyncEngine::spawn(&test_config(), collaborators);
    settle(&engine, "a").await;

    // This pull sees c1 on the server, then stalls
    let base = remote.fetch_count();
    backend.armed.store(true, Ordering::SeqCst);
    engine.refresh_now().unwrap();
    eventually(|| remote.fetch_count() == base + 1 && !backend.armed.load(Ordering::SeqCst)).await;

    engine.delete_conversation("c1").await.unwrap();
    assert!(!engine.conversations().contains(&"c1".into()));
    let status = engine.status().await.unwrap();
    assert!(status.refreshing);
    assert!(status.refresh_pending);

    backend.release();
    settle(&engine, "a").await;
    assert!(!remote.has_conversation(&"c1".into()).await);
    assert_eq!(conversation_ids(&engine), vec!["c2"]);
    assert!(remote.fetch_count() >= base + 2);
}

#[tokio::test]
async fn test_poll_interval_pulls_without_events() {
    let remote = remote_with_session(Some("a")).await;
    let mut config = test_config();
    config.poll_interval = Some(Duration::from_millis(20));
    let engine = SyncEngine::spawn(&config, Collaborators::from_remote(remote.clone()));
    settle(&engine, "a").await;

    let base = remote.fetch_count();
    eventually(|| remote.fetch_count() >= base + 3).await;
    let status = settle(&engine, "a").await;
    assert_eq!(status.conversations, 2);
}

#[tokio::test]
async fn test_no_polling_by_default() {
    let remote = remote_with_session(Some("a")).await;
    let engine = start(&remote);
    settle(&engine, "a").await;

    let base = remote.fetch_count();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.fetch_count(), base);
}
