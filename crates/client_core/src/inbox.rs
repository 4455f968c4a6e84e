use std::collections::{HashMap, HashSet};

use shared::{
    domain::ConversationId,
    protocol::{ConversationSummary, Message},
};

/// Conversation list as this participant sees it. Hiding is a soft removal:
/// the row is kept and comes back when a new message arrives.
#[derive(Debug, Default, Clone)]
pub struct Inbox {
    conversations: HashMap<ConversationId, ConversationSummary>,
    hidden: HashSet<ConversationId>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, conversations: Vec<ConversationSummary>) {
        self.conversations = conversations
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
        self.hidden
            .retain(|id| self.conversations.contains_key(id));
    }

    pub fn upsert(&mut self, conversation: ConversationSummary) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Bumps the conversation for a newly arrived message. Returns `false`
    /// when the conversation is not known yet and must be fetched.
    pub fn touch(&mut self, message: &Message) -> bool {
        let Some(conversation) = self.conversations.get_mut(&message.conversation_id) else {
            return false;
        };
        if message.created_at >= conversation.last_activity_at {
            conversation.last_activity_at = message.created_at;
            conversation.last_message = Some(message.id.clone());
        }
        self.hidden.remove(&message.conversation_id);
        true
    }

    pub fn hide(&mut self, conversation_id: &ConversationId) -> bool {
        self.conversations.contains_key(conversation_id)
            && self.hidden.insert(conversation_id.clone())
    }

    pub fn unhide(&mut self, conversation_id: &ConversationId) {
        self.hidden.remove(conversation_id);
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.conversations.get(conversation_id)
    }

    /// Visible conversations, most recent activity first.
    pub fn visible(&self) -> Vec<ConversationSummary> {
        let mut rows: Vec<_> = self
            .conversations
            .values()
            .filter(|conversation| !self.hidden.contains(&conversation.id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows
    }
}
