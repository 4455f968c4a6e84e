use std::collections::BTreeSet;

use shared::domain::ConversationId;

/// Conversation rooms the session is subscribed to. Driven by navigation:
/// opening a conversation joins its room, navigating away leaves it.
#[derive(Debug, Default, Clone)]
pub struct RoomMembership {
    joined: BTreeSet<ConversationId>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the room was already joined.
    pub fn join(&mut self, conversation_id: ConversationId) -> bool {
        self.joined.insert(conversation_id)
    }

    /// Returns `false` when the room was not joined.
    pub fn leave(&mut self, conversation_id: &ConversationId) -> bool {
        self.joined.remove(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.joined.contains(conversation_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &ConversationId> {
        self.joined.iter()
    }

    pub fn len(&self) -> usize {
        self.joined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }

    pub fn clear(&mut self) {
        self.joined.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_join_and_double_leave_are_noops() {
        let mut rooms = RoomMembership::new();
        assert!(rooms.join(ConversationId::from("c1")));
        assert!(!rooms.join(ConversationId::from("c1")));
        assert_eq!(rooms.len(), 1);

        assert!(rooms.leave(&ConversationId::from("c1")));
        assert!(!rooms.leave(&ConversationId::from("c1")));
        assert!(rooms.is_empty());
    }

    #[test]
    fn rooms_iterate_in_stable_order() {
        let mut rooms = RoomMembership::new();
        for id in ["c3", "c1", "c2"] {
            rooms.join(ConversationId::from(id));
        }
        let order: Vec<_> = rooms.rooms().map(|id| id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2", "c3"]);
    }
}
