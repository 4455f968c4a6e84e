use std::collections::{BTreeSet, HashMap};

use shared::{domain::ConversationId, protocol::UnreadCounts};

/// Per-conversation unread counters with an incrementally maintained total.
#[derive(Debug, Default, Clone)]
pub struct UnreadAggregator {
    counts: HashMap<ConversationId, u32>,
    total: u64,
    pending_mark_reads: BTreeSet<ConversationId>,
    read_seq: u64,
    last_read: HashMap<ConversationId, u64>,
}

impl UnreadAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the counter changed.
    pub fn on_message_arrived(&mut self, conversation_id: &ConversationId, is_active: bool) -> bool {
        if is_active {
            return false;
        }
        let count = self.counts.entry(conversation_id.clone()).or_insert(0);
        if *count == u32::MAX {
            return false;
        }
        *count += 1;
        self.total += 1;
        true
    }

    /// Zeroes the counter locally and records that the server must be told.
    pub fn on_conversation_opened(&mut self, conversation_id: &ConversationId) {
        self.set(conversation_id, 0);
        self.pending_mark_reads.insert(conversation_id.clone());
        self.read_seq += 1;
        self.last_read.insert(conversation_id.clone(), self.read_seq);
    }

    pub fn mark_read_confirmed(&mut self, conversation_id: &ConversationId) {
        self.pending_mark_reads.remove(conversation_id);
    }

    pub fn pending_mark_reads(&self) -> Vec<ConversationId> {
        self.pending_mark_reads.iter().cloned().collect()
    }

    /// Marks the point a server snapshot is requested from. Pass it back to
    /// [`Self::overwrite`] with the response.
    pub fn sync_token(&self) -> u64 {
        self.read_seq
    }

    /// Replaces local state with authoritative server counts. Conversations
    /// whose mark-read has not reached the server yet stay at zero, and
    /// conversations read after `since` keep their local count.
    pub fn overwrite(&mut self, counts: &HashMap<ConversationId, u32>, since: u64) {
        let kept: Vec<(ConversationId, u32)> = self
            .counts
            .iter()
            .filter(|(conversation_id, _)| self.read_after(conversation_id, since))
            .map(|(conversation_id, count)| (conversation_id.clone(), *count))
            .collect();
        self.counts.clear();
        self.total = 0;
        for (conversation_id, count) in counts {
            if *count == 0
                || self.pending_mark_reads.contains(conversation_id)
                || self.read_after(conversation_id, since)
            {
                continue;
            }
            self.counts.insert(conversation_id.clone(), *count);
            self.total += u64::from(*count);
        }
        for (conversation_id, count) in kept {
            self.total += u64::from(count);
            self.counts.insert(conversation_id, count);
        }
    }

    pub fn overwrite_from(&mut self, counts: &UnreadCounts, since: u64) {
        self.overwrite(&counts.conversations, since);
    }

    pub fn count(&self, conversation_id: &ConversationId) -> u32 {
        self.counts.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn read_after(&self, conversation_id: &ConversationId, since: u64) -> bool {
        self.last_read
            .get(conversation_id)
            .is_some_and(|seq| *seq > since)
    }

    fn set(&mut self, conversation_id: &ConversationId, value: u32) {
        let previous = if value == 0 {
            self.counts.remove(conversation_id).unwrap_or(0)
        } else {
            self.counts
                .insert(conversation_id.clone(), value)
                .unwrap_or(0)
        };
        self.total = self.total - u64::from(previous) + u64::from(value);
    }
}

/// Unread badge for the notification surface.
#[derive(Debug, Default, Clone)]
pub struct NotificationCounter {
    unread: u32,
    mark_all_pending: bool,
    opened_seq: u64,
}

impl NotificationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notification_arrived(&mut self) {
        self.unread = self.unread.saturating_add(1);
    }

    /// An unread notification was deleted before the surface was opened.
    pub fn on_notification_removed(&mut self) {
        self.unread = self.unread.saturating_sub(1);
    }

    pub fn on_notifications_opened(&mut self) {
        self.unread = 0;
        self.mark_all_pending = true;
        self.opened_seq += 1;
    }

    pub fn confirm_opened(&mut self) {
        self.mark_all_pending = false;
    }

    pub fn mark_all_pending(&self) -> bool {
        self.mark_all_pending
    }

    pub fn sync_token(&self) -> u64 {
        self.opened_seq
    }

    /// Applies the server badge unless the surface was opened after `since`.
    pub fn overwrite(&mut self, unread: u32, since: u64) {
        if self.mark_all_pending {
            self.unread = 0;
        } else if self.opened_seq <= since {
            self.unread = unread;
        }
    }

    pub fn clear(&mut self) {
        self.unread = 0;
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ConversationId {
        ConversationId::from(raw)
    }

    fn assert_total_matches(unread: &UnreadAggregator, ids: &[&str]) {
        let summed: u64 = ids.iter().map(|raw| u64::from(unread.count(&id(raw)))).sum();
        assert_eq!(unread.total(), summed);
    }

    #[test]
    fn active_conversation_does_not_count() {
        let mut unread = UnreadAggregator::new();
        assert!(!unread.on_message_arrived(&id("c1"), true));
        assert!(unread.on_message_arrived(&id("c1"), false));
        assert!(unread.on_message_arrived(&id("c1"), false));
        assert_eq!(unread.count(&id("c1")), 2);
        assert_eq!(unread.total(), 2);
    }

    #[test]
    fn opening_zeroes_and_queues_mark_read() {
        let mut unread = UnreadAggregator::new();
        unread.on_message_arrived(&id("c1"), false);
        unread.on_message_arrived(&id("c2"), false);

        unread.on_conversation_opened(&id("c1"));

        assert_eq!(unread.count(&id("c1")), 0);
        assert_eq!(unread.total(), 1);
        assert_eq!(unread.pending_mark_reads(), vec![id("c1")]);

        unread.mark_read_confirmed(&id("c1"));
        assert!(unread.pending_mark_reads().is_empty());
    }

    #[test]
    fn total_never_drifts_under_mixed_operations() {
        let ids = ["c1", "c2", "c3", "c4"];
        let mut unread = UnreadAggregator::new();
        // Deterministic pseudo-random walk over increments and resets.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let target = id(ids[(seed % ids.len() as u64) as usize]);
            match (seed >> 8) % 5 {
                0 => unread.on_conversation_opened(&target),
                1 => {
                    unread.on_message_arrived(&target, true);
                }
                2 => unread.mark_read_confirmed(&target),
                _ => {
                    unread.on_message_arrived(&target, false);
                }
            }
            assert_total_matches(&unread, &ids);
        }
    }

    #[test]
    fn increments_by_one_per_message_after_open() {
        let mut unread = UnreadAggregator::new();
        for _ in 0..5 {
            unread.on_message_arrived(&id("c1"), false);
        }
        unread.on_conversation_opened(&id("c1"));
        assert_eq!(unread.count(&id("c1")), 0);
        for expected in 1..=3 {
            unread.on_message_arrived(&id("c1"), false);
            assert_eq!(unread.count(&id("c1")), expected);
        }
    }

    #[test]
    fn overwrite_keeps_unconfirmed_reads_at_zero() {
        let mut unread = UnreadAggregator::new();
        unread.on_message_arrived(&id("c1"), false);
        unread.on_conversation_opened(&id("c1"));

        let server = HashMap::from([(id("c1"), 4), (id("c2"), 3), (id("c3"), 0)]);
        unread.overwrite(&server, unread.sync_token());

        assert_eq!(unread.count(&id("c1")), 0);
        assert_eq!(unread.count(&id("c2")), 3);
        assert_eq!(unread.total(), 3);

        unread.mark_read_confirmed(&id("c1"));
        unread.overwrite(&server, unread.sync_token());
        assert_eq!(unread.count(&id("c1")), 4);
        assert_eq!(unread.total(), 7);
    }

    #[test]
    fn notification_counter_zeroes_optimistically() {
        let mut counter = NotificationCounter::new();
        counter.on_notification_arrived();
        counter.on_notification_arrived();
        assert_eq!(counter.unread(), 2);

        counter.on_notifications_opened();
        assert_eq!(counter.unread(), 0);
        counter.overwrite(2, counter.sync_token());
        assert_eq!(counter.unread(), 0);

        counter.confirm_opened();
        counter.overwrite(1, counter.sync_token());
        assert_eq!(counter.unread(), 1);
    }

    #[test]
    fn snapshot_taken_before_a_read_cannot_restore_its_count() {
        let mut unread = UnreadAggregator::new();
        unread.on_message_arrived(&id("c1"), false);
        unread.on_message_arrived(&id("c2"), false);
        let token = unread.sync_token();

        unread.on_conversation_opened(&id("c1"));
        unread.mark_read_confirmed(&id("c1"));
        unread.on_message_arrived(&id("c1"), false);

        let stale = HashMap::from([(id("c1"), 6), (id("c2"), 2)]);
        unread.overwrite(&stale, token);

        assert_eq!(unread.count(&id("c1")), 1);
        assert_eq!(unread.count(&id("c2")), 2);
        assert_total_matches(&unread, &["c1", "c2"]);

        unread.overwrite(&stale, unread.sync_token());
        assert_eq!(unread.count(&id("c1")), 6);
    }

    #[test]
    fn notification_badge_tracks_removals_and_stale_snapshots() {
        let mut counter = NotificationCounter::new();
        counter.on_notification_arrived();
        counter.on_notification_arrived();
        counter.on_notification_removed();
        assert_eq!(counter.unread(), 1);

        let token = counter.sync_token();
        counter.on_notifications_opened();
        counter.confirm_opened();
        counter.overwrite(4, token);
        assert_eq!(counter.unread(), 0);

        counter.on_notification_removed();
        assert_eq!(counter.unread(), 0);
        counter.overwrite(3, counter.sync_token());
        counter.clear();
        assert_eq!(counter.unread(), 0);
    }
}
