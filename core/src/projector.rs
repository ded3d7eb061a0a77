/// Conversation projector: keeps the conversation set in step with snapshot pulls
///
/// Events never patch fields. Every trigger asks for a full snapshot, and a
/// snapshot replaces the whole set at once. At most one pull is outstanding;
/// triggers that arrive meanwhile collapse into a single follow-up pull.
use crate::error::{Result, SyncError};
use crate::remote::ConversationBackend;
use crate::types::{ConversationId, ConversationSet, ConversationSummary, IdentityId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Permission to run one snapshot pull, stamped with the identity scope it
/// was issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTicket {
    pub id: u64,
    pub epoch: u64,
    pub identity: IdentityId,
}

#[derive(Debug)]
pub enum RefreshOutcome {
    /// The snapshot was installed; `changed` is false when it matched the current set
    Applied { changed: bool },
    /// The pull failed; the previous set is untouched
    Failed(SyncError),
    /// The ticket belongs to an earlier identity scope or was superseded
    Discarded,
}

#[derive(Debug)]
pub struct Completion {
    pub outcome: RefreshOutcome,
    /// Pull to start next, when triggers arrived while this one was running
    pub follow_up: Option<RefreshTicket>,
}

/// Undo information for an optimistic local removal
#[derive(Debug, Clone)]
pub struct Removal {
    pub index: usize,
    pub summary: ConversationSummary,
    epoch: u64,
    snapshot_seq: u64,
}

#[derive(Debug, Default)]
pub struct Projector {
    epoch: u64,
    identity: Option<IdentityId>,
    set: Arc<ConversationSet>,
    revision: u64,
    /// Counts every snapshot installed, including ones equal to the current set
    snapshot_seq: u64,
    next_ticket: u64,
    in_flight: Option<u64>,
    pending: bool,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a new identity scope. Outstanding pulls are orphaned: their
    /// completions will be discarded. Returns whether the set changed.
    pub fn reset(&mut self, epoch: u64, identity: Option<IdentityId>) -> bool {
        self.epoch = epoch;
        self.identity = identity;
        self.in_flight = None;
        self.pending = false;

        if self.set.is_empty() {
            return false;
        }
        let mut empty = ConversationSet::empty();
        empty.set_revision(self.bump());
        self.set = Arc::new(empty);
        true
    }

    /// Ask for a fresh snapshot. Returns a ticket when a pull should start
    /// now, `None` when signed out or when the request was folded into the
    /// pull already running.
    pub fn trigger(&mut self) -> Option<RefreshTicket> {
        if self.identity.is_none() {
            return None;
        }
        if self.in_flight.is_some() {
            if !self.pending {
                debug!("Refresh in flight, scheduling one follow-up");
            }
            self.pending = true;
            return None;
        }
        self.issue()
    }

    /// Record the result of the pull started for `ticket`
    pub fn complete(
        &mut self,
        ticket: RefreshTicket,
        result: Result<Vec<ConversationSummary>>,
    ) -> Completion {
        if ticket.epoch != self.epoch || self.in_flight != Some(ticket.id) {
            debug!(
                "Discarding refresh {} for {} (epoch {}, current {})",
                ticket.id, ticket.identity, ticket.epoch, self.epoch
            );
            return Completion {
                outcome: RefreshOutcome::Discarded,
                follow_up: None,
            };
        }
        self.in_flight = None;

        let outcome = match result {
            Ok(summaries) => {
                self.snapshot_seq += 1;
                let mut next = ConversationSet::from_snapshot(0, summaries);
                if next.same_entries(&self.set) {
                    debug!("Refresh {} returned an unchanged snapshot", ticket.id);
                    RefreshOutcome::Applied { changed: false }
                } else {
                    next.set_revision(self.bump());
                    info!(
                        "Applied snapshot {} for {}: {} conversations",
                        ticket.id,
                        ticket.identity,
                        next.len()
                    );
                    self.set = Arc::new(next);
                    RefreshOutcome::Applied { changed: true }
                }
            }
            Err(e) => {
                warn!("Refresh {} for {} failed: {}", ticket.id, ticket.identity, e);
                let e = match e {
                    SyncError::SnapshotFetch(_) => e,
                    other => SyncError::SnapshotFetch(other.to_string()),
                };
                RefreshOutcome::Failed(e)
            }
        };

        let follow_up = if self.pending {
            self.pending = false;
            self.issue()
        } else {
            None
        };

        Completion { outcome, follow_up }
    }

    /// Pull and apply a snapshot in one step.
    ///
    /// Returns the current set without pulling when signed out or when a
    /// pull is already running (the request is folded into its follow-up).
    pub async fn refresh(
        &mut self,
        backend: &dyn ConversationBackend,
    ) -> Result<Arc<ConversationSet>> {
        match self.trigger() {
            Some(ticket) => self.drive(backend, ticket).await,
            None => Ok(self.snapshot()),
        }
    }

    /// Run the pull for `ticket`, then every follow-up queued behind it.
    ///
    /// Errors only when the last pull of the chain failed.
    pub async fn drive(
        &mut self,
        backend: &dyn ConversationBackend,
        ticket: RefreshTicket,
    ) -> Result<Arc<ConversationSet>> {
        let mut next = Some(ticket);
        let mut failure = None;
        while let Some(ticket) = next {
            let result = backend.fetch_snapshot(&ticket.identity).await;
            let completion = self.complete(ticket, result);
            failure = match completion.outcome {
                RefreshOutcome::Failed(e) => Some(e),
                RefreshOutcome::Applied { .. } | RefreshOutcome::Discarded => None,
            };
            next = completion.follow_up;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(self.snapshot()),
        }
    }

    /// Drop a conversation locally ahead of the remote confirmation
    pub fn remove_local(&mut self, conversation_id: &ConversationId) -> Option<Removal> {
        if !self.set.contains(conversation_id) {
            return None;
        }
        let revision = self.bump();
        let set = Arc::make_mut(&mut self.set);
        let (index, summary) = set.remove(conversation_id)?;
        set.set_revision(revision);
        Some(Removal {
            index,
            summary,
            epoch: self.epoch,
            snapshot_seq: self.snapshot_seq,
        })
    }

    /// Put back a removed entry after the remote refused the deletion.
    ///
    /// Skipped when a snapshot has been installed (even an identical one) or
    /// the identity changed since the removal; that snapshot is authoritative.
    pub fn restore(&mut self, removal: Removal) -> bool {
        if removal.epoch != self.epoch
            || removal.snapshot_seq != self.snapshot_seq
            || self.set.contains(&removal.summary.conversation_id)
        {
            return false;
        }
        let revision = self.bump();
        let set = Arc::make_mut(&mut self.set);
        set.insert_at(removal.index, removal.summary);
        set.set_revision(revision);
        true
    }

    pub fn snapshot(&self) -> Arc<ConversationSet> {
        self.set.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
    }

    fn issue(&mut self) -> Option<RefreshTicket> {
        let identity = self.identity.clone()?;
        self.next_ticket += 1;
        self.in_flight = Some(self.next_ticket);
        Some(RefreshTicket {
            id: self.next_ticket,
            epoch: self.epoch,
            identity,
        })
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
