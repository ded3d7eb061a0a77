/// Conversation list screen state: search, unread filter and edit-mode selection
use crate::types::{ConversationId, ConversationSet, ConversationSummary, UnreadSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    #[default]
    All,
    Unread,
}

impl Filter {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "all" => Some(Filter::All),
            "unread" => Some(Filter::Unread),
            _ => None,
        }
    }
}

/// One rendered list row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRow {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub unread: bool,
    pub selected: bool,
}

/// Local UI state layered over the engine's published sets.
///
/// Holds no conversation data of its own; every call to `rows` reads the
/// snapshots it is given.
#[derive(Debug, Default)]
pub struct ConversationListViewModel {
    query: String,
    filter: Filter,
    editing: bool,
    selected: BTreeSet<ConversationId>,
}

impl ConversationListViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    pub fn set_filter(&mut self, filter: Filter) {
        self.filter = filter;
    }

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn enter_edit_mode(&mut self) {
        self.editing = true;
    }

    /// Leaving edit mode drops the selection
    pub fn exit_edit_mode(&mut self) {
        self.editing = false;
        self.selected.clear();
    }

    /// Flip the selection of one row. Returns whether it is now selected;
    /// always `false` outside edit mode.
    pub fn toggle_selected(&mut self, conversation_id: &ConversationId) -> bool {
        if !self.editing {
            return false;
        }
        if self.selected.remove(conversation_id) {
            false
        } else {
            self.selected.insert(conversation_id.clone());
            true
        }
    }

    pub fn selected_for_deletion(&self) -> Vec<ConversationId> {
        self.selected.iter().cloned().collect()
    }

    /// Rows to render, newest first.
    ///
    /// Selections pointing at conversations that are gone from `set` are
    /// dropped along the way.
    pub fn rows(&mut self, set: &ConversationSet, unread: &UnreadSet) -> Vec<ConversationRow> {
        self.selected.retain(|id| set.contains(id));

        let needle = self.query.trim().to_lowercase();
        let mut rows: Vec<ConversationRow> = set
            .iter()
            .filter(|summary| matches_query(summary, &needle))
            .map(|summary| ConversationRow {
                unread: unread.contains(&summary.conversation_id),
                selected: self.selected.contains(&summary.conversation_id),
                summary: summary.clone(),
            })
            .filter(|row| self.filter == Filter::All || row.unread)
            .collect();

        // Stable sort; `None < Some`, so reversing puts undated rows last
        rows.sort_by(|a, b| b.summary.last_message_at.cmp(&a.summary.last_message_at));
        rows
    }

    /// Unread conversations that are actually listed
    pub fn unread_count(set: &ConversationSet, unread: &UnreadSet) -> usize {
        unread.iter().filter(|id| set.contains(id)).count()
    }
}

fn matches_query(summary: &ConversationSummary, needle: &str) -> bool {
    needle.is_empty()
        || summary
            .counterpart_display_name
            .to_lowercase()
            .contains(needle)
        || summary.last_message_preview.to_lowercase().contains(needle)
}
