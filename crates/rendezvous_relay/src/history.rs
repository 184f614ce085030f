/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rendezvous_protocol::Envelope;
use std::collections::VecDeque;

/// Sequence counter plus the bounded replay buffer of one session.
///
/// Every envelope consumes a sequence number, transient ones included, so a
/// gap seen by a poller is always a transient message and never a lost one.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    seq: u64,
    messages: VecDeque<Envelope>,
    capacity: usize,
}

impl HistoryLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            seq: 0,
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a ledger from durable state. Entries beyond capacity (e.g.
    /// after the configured capacity shrank) are trimmed oldest-first.
    pub fn restore(capacity: usize, seq: u64, messages: Vec<Envelope>) -> Self {
        let mut ledger = Self::new(capacity);
        ledger.seq = seq;
        ledger.messages = messages.into();
        ledger.evict_overflow();
        ledger
    }

    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> impl Iterator<Item = &Envelope> {
        self.messages.iter()
    }

    pub fn append(&mut self, envelope: &mut Envelope) -> u64 {
        self.seq += 1;
        envelope.seq = Some(self.seq);
        if !envelope.transient {
            self.messages.push_back(envelope.clone());
            self.evict_overflow();
        }
        self.seq
    }

    /// Persisted envelopes newer than `seq` that `client_id` should see:
    /// never its own messages, never unicasts addressed to someone else.
    pub fn since(&self, seq: u64, client_id: &str) -> Vec<Envelope> {
        self.messages
            .iter()
            .filter(|env| env.seq.unwrap_or(0) > seq)
            .filter(|env| !env.is_from(client_id))
            .filter(|env| env.is_visible_to(client_id))
            .cloned()
            .collect()
    }

    pub fn reset(&mut self) {
        self.seq = 0;
        self.messages.clear();
    }

    fn evict_overflow(&mut self) {
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_protocol::MessageKind;

    fn msg(from: &str, to: Option<&str>) -> Envelope {
        let mut env = Envelope::new("s", MessageKind::Signal);
        env.from = Some(from.to_string());
        env.to = to.map(str::to_string);
        env
    }

    #[test]
    fn seq_is_strictly_increasing_including_transient() {
        let mut ledger = HistoryLedger::new(10);
        let a = ledger.append(&mut msg("alice", None));
        let mut transient = msg("alice", None);
        transient.transient = true;
        let b = ledger.append(&mut transient);
        let c = ledger.append(&mut msg("bob", None));
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(ledger.len(), 2);
        let seqs: Vec<_> = ledger.messages().map(|e| e.seq.unwrap()).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn oldest_entries_are_evicted_first() {
        let mut ledger = HistoryLedger::new(3);
        for _ in 0..5 {
            ledger.append(&mut msg("alice", None));
        }
        assert_eq!(ledger.len(), 3);
        let seqs: Vec<_> = ledger.messages().map(|e| e.seq.unwrap()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(ledger.last_seq(), 5);
    }

    #[test]
    fn since_filters_by_seq_sender_and_addressee() {
        let mut ledger = HistoryLedger::new(100);
        ledger.append(&mut msg("alice", None)); // 1
        ledger.append(&mut msg("alice", Some("bob"))); // 2
        ledger.append(&mut msg("alice", Some("carol"))); // 3
        ledger.append(&mut msg("bob", None)); // 4
        ledger.append(&mut msg("carol", None)); // 5

        let for_bob: Vec<_> = ledger.since(0, "bob").iter().map(|e| e.seq.unwrap()).collect();
        assert_eq!(for_bob, vec![1, 2, 5]);

        let for_bob: Vec<_> = ledger.since(1, "bob").iter().map(|e| e.seq.unwrap()).collect();
        assert_eq!(for_bob, vec![2, 5]);

        let for_alice: Vec<_> = ledger.since(0, "alice").iter().map(|e| e.seq.unwrap()).collect();
        assert_eq!(for_alice, vec![4, 5]);

        for (n, client) in [(0, "dave"), (2, "carol"), (3, "bob")] {
            for env in ledger.since(n, client) {
                assert!(env.seq.unwrap() > n);
                assert!(!env.is_from(client));
                assert!(env.to.is_none() || env.to.as_deref() == Some(client));
            }
        }
    }

    #[test]
    fn restore_trims_to_capacity_and_keeps_seq() {
        let mut source = HistoryLedger::new(10);
        for _ in 0..6 {
            source.append(&mut msg("alice", None));
        }
        let stored: Vec<_> = source.messages().cloned().collect();
        let mut ledger = HistoryLedger::restore(4, source.last_seq(), stored);
        assert_eq!(ledger.len(), 4);
        assert_eq!(ledger.append(&mut msg("bob", None)), 7);
    }

    #[test]
    fn reset_starts_a_new_generation() {
        let mut ledger = HistoryLedger::new(10);
        ledger.append(&mut msg("alice", None));
        ledger.append(&mut msg("alice", None));
        ledger.reset();
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.append(&mut msg("alice", None)), 1);
    }
}
