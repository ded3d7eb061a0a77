/// Property tests for unread tracking: random insert/markRead interleavings
/// checked against a plain set model
use chrono::Utc;
use inbox_sync::types::{ConversationId, MessageInsertEvent};
use inbox_sync::unread::UnreadTracker;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const ME: &str = "u0";

#[derive(Debug, Clone)]
enum Op {
    Insert { conversation: u8, sender: u8 },
    MarkRead { conversation: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..5, 0u8..3).prop_map(|(conversation, sender)| Op::Insert {
            conversation,
            sender
        }),
        (0u8..5).prop_map(|conversation| Op::MarkRead { conversation }),
    ]
}

fn conversation(n: u8) -> ConversationId {
    ConversationId::from(format!("c{}", n))
}

fn insert(conversation_n: u8, sender: u8) -> MessageInsertEvent {
    MessageInsertEvent {
        conversation_id: conversation(conversation_n),
        sender_id: format!("u{}", sender).into(),
        occurred_at: Utc::now(),
    }
}

proptest! {
    #[test]
    fn test_tracker_matches_model(ops in prop::collection::vec(op_strategy(), 0..64)) {
        let mut tracker = UnreadTracker::new(Some(ME.into()));
        let mut model: BTreeSet<ConversationId> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Insert { conversation: c, sender } => {
                    let changed = tracker.on_message_insert(&insert(c, sender));
                    let expected = sender != 0 && model.insert(conversation(c));
                    prop_assert_eq!(changed, expected);
                }
                Op::MarkRead { conversation: c } => {
                    let changed = tracker.mark_read(&conversation(c));
                    prop_assert_eq!(changed, model.remove(&conversation(c)));
                }
            }
            let current: BTreeSet<ConversationId> =
                tracker.current_set().iter().cloned().collect();
            prop_assert_eq!(&current, &model);
        }
    }

    #[test]
    fn test_second_mark_read_changes_nothing(
        ops in prop::collection::vec(op_strategy(), 0..32),
        target in 0u8..5,
    ) {
        let mut tracker = UnreadTracker::new(Some(ME.into()));
        for op in ops {
            match op {
                Op::Insert { conversation: c, sender } => {
                    tracker.on_message_insert(&insert(c, sender));
                }
                Op::MarkRead { conversation: c } => {
                    tracker.mark_read(&conversation(c));
                }
            }
        }

        tracker.mark_read(&conversation(target));
        let before = tracker.current_set();
        prop_assert!(!tracker.mark_read(&conversation(target)));
        prop_assert!(Arc::ptr_eq(&before, &tracker.current_set()));
        prop_assert!(!tracker.is_unread(&conversation(target)));
    }
}
