//! Per-conversation message timeline.
//!
//! Real-time events, REST history pages and optimistic local sends all land
//! in one [`MessageStream`]. Entries are unique by canonical message id.
//! Settled messages are ordered by `(created_at, id)`. Local sends form a
//! tail in submission order and join the settled part once every earlier
//! submission has settled too.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, TempId, UserId},
    protocol::{Message, MessageBody},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub id: Option<MessageId>,
    pub temp_id: Option<TempId>,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl TimelineEntry {
    fn canonical(message: Message) -> Self {
        Self {
            id: Some(message.id),
            temp_id: message.client_id,
            sender_id: message.sender_id,
            body: message.body,
            created_at: message.created_at,
            state: DeliveryState::Sent,
        }
    }

    fn absorb(&mut self, message: Message) {
        self.id = Some(message.id);
        self.body = message.body;
        self.created_at = message.created_at;
        self.state = DeliveryState::Sent;
    }

    fn sort_key(&self) -> (DateTime<Utc>, Option<&MessageId>) {
        (self.created_at, self.id.as_ref())
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, DeliveryState::Failed { .. })
    }
}

/// Outcome of merging a message into the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// Folded into an existing optimistic entry.
    Merged,
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct MessageStream {
    conversation_id: ConversationId,
    // entries[..settled] is sorted by (created_at, id); the rest is the
    // local tail in submission order.
    entries: Vec<TimelineEntry>,
    settled: usize,
    ids: HashSet<MessageId>,
}

impl MessageStream {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            settled: 0,
            ids: HashSet::new(),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Oldest canonical id, used as the `before` cursor for older pages.
    pub fn oldest_id(&self) -> Option<&MessageId> {
        self.entries.iter().find_map(|entry| entry.id.as_ref())
    }

    pub fn apply_incoming(&mut self, message: Message) -> Applied {
        if self.ids.contains(&message.id) {
            return Applied::Duplicate;
        }

        // Broadcast of our own send racing ahead of the ack.
        if let Some(client_id) = message.client_id.clone() {
            if let Some(index) = self.unconfirmed_index(&client_id) {
                self.ids.insert(message.id.clone());
                self.entries[index].absorb(message);
                self.settle_tail();
                return Applied::Merged;
            }
        }

        self.ids.insert(message.id.clone());
        self.insert_settled(TimelineEntry::canonical(message));
        Applied::Inserted
    }

    /// Appends an unconfirmed local send at the tail of the timeline.
    pub fn apply_optimistic(
        &mut self,
        temp_id: TempId,
        sender_id: UserId,
        body: MessageBody,
        now: DateTime<Utc>,
    ) {
        self.entries.push(TimelineEntry {
            id: None,
            temp_id: Some(temp_id),
            sender_id,
            body,
            created_at: now,
            state: DeliveryState::Pending,
        });
    }

    /// Swaps the optimistic entry for its canonical form. The row keeps its
    /// place unless the server timestamp sorts it elsewhere.
    pub fn reconcile(&mut self, temp_id: &TempId, canonical: Message) -> Applied {
        let Some(mut index) = self
            .entries
            .iter()
            .position(|entry| entry.temp_id.as_ref() == Some(temp_id))
        else {
            return self.apply_incoming(canonical);
        };

        if self.entries[index].id.as_ref() == Some(&canonical.id) {
            return Applied::Duplicate;
        }

        // The broadcast may have landed as its own row if it lacked a client id.
        if self.ids.contains(&canonical.id) {
            if let Some(stray) = self
                .entries
                .iter()
                .position(|entry| entry.id.as_ref() == Some(&canonical.id))
            {
                self.remove_at(stray);
                if stray < index {
                    index -= 1;
                }
            }
        }

        let mut entry = self.remove_at(index);
        if let Some(previous) = entry.id.take() {
            self.ids.remove(&previous);
        }
        self.ids.insert(canonical.id.clone());
        entry.absorb(canonical);
        if index < self.settled {
            self.insert_settled(entry);
        } else {
            self.entries.insert(index, entry);
            self.settle_tail();
        }
        Applied::Merged
    }

    pub fn mark_failed(&mut self, temp_id: &TempId, reason: impl Into<String>) -> bool {
        match self.unconfirmed_index(temp_id) {
            Some(index) => {
                self.entries[index].state = DeliveryState::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    pub fn mark_pending(&mut self, temp_id: &TempId) -> bool {
        match self.unconfirmed_index(temp_id) {
            Some(index) => {
                self.entries[index].state = DeliveryState::Pending;
                true
            }
            None => false,
        }
    }

    /// Merges a REST page without disturbing entries already applied.
    /// Returns how many new rows were added.
    pub fn apply_history_page(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        let mut inserted = 0;
        for message in messages {
            if message.conversation_id != self.conversation_id {
                continue;
            }
            if self.apply_incoming(message) == Applied::Inserted {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn remove(&mut self, ids: &[MessageId]) -> usize {
        let doomed: HashSet<&MessageId> = ids.iter().filter(|id| self.ids.contains(*id)).collect();
        if doomed.is_empty() {
            return 0;
        }
        let is_doomed =
            |entry: &TimelineEntry| entry.id.as_ref().is_some_and(|id| doomed.contains(id));
        let settled_removed = self.entries[..self.settled]
            .iter()
            .filter(|entry| is_doomed(*entry))
            .count();
        let before = self.entries.len();
        self.entries.retain(|entry| !is_doomed(entry));
        self.settled -= settled_removed;
        for id in doomed {
            self.ids.remove(id);
        }
        self.settle_tail();
        before - self.entries.len()
    }

    fn unconfirmed_index(&self, temp_id: &TempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.id.is_none() && entry.temp_id.as_ref() == Some(temp_id))
    }

    fn remove_at(&mut self, index: usize) -> TimelineEntry {
        if index < self.settled {
            self.settled -= 1;
        }
        self.entries.remove(index)
    }

    fn insert_settled(&mut self, entry: TimelineEntry) {
        let index = self.entries[..self.settled]
            .partition_point(|existing| existing.sort_key() <= entry.sort_key());
        self.entries.insert(index, entry);
        self.settled += 1;
    }

    /// Moves confirmed sends at the head of the tail into the sorted part.
    fn settle_tail(&mut self) {
        while self.settled < self.entries.len()
            && self.entries[self.settled].state == DeliveryState::Sent
        {
            let entry = self.entries.remove(self.settled);
            self.insert_settled(entry);
        }
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
