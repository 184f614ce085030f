/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rendezvous_protocol::MessageKind;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOutcome {
    pub granted: bool,
    pub host_id: Option<String>,
}

/// Time-leased host role of a session.
///
/// The lease is renewed by any traffic from the host, so an active host never
/// needs explicit heartbeats. A lease older than the stale window can be
/// taken over by the next claimant.
#[derive(Debug, Clone)]
pub struct HostElection {
    host_id: Option<String>,
    host_updated_at: Option<i64>,
    approved: BTreeSet<String>,
    stale_window_ms: i64,
}

impl HostElection {
    pub fn new(stale_window_ms: i64) -> Self {
        Self {
            host_id: None,
            host_updated_at: None,
            approved: BTreeSet::new(),
            stale_window_ms: stale_window_ms.max(0),
        }
    }

    pub fn restore(
        stale_window_ms: i64,
        host_id: Option<String>,
        host_updated_at: Option<i64>,
        approved: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut election = Self::new(stale_window_ms);
        election.host_id = host_id.filter(|h| !h.is_empty());
        election.host_updated_at = host_updated_at;
        election.approved = approved.into_iter().collect();
        election
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn host_updated_at(&self) -> Option<i64> {
        self.host_updated_at
    }

    pub fn approved_clients(&self) -> impl Iterator<Item = &String> {
        self.approved.iter()
    }

    pub fn is_host(&self, client_id: &str) -> bool {
        self.host_id.as_deref() == Some(client_id)
    }

    fn is_stale(&self, now: i64) -> bool {
        match self.host_updated_at {
            Some(at) => now.saturating_sub(at) > self.stale_window_ms,
            None => true,
        }
    }

    pub fn claim(&mut self, candidate: &str, now: i64) -> ClaimOutcome {
        let granted = self.host_id.is_none() || self.is_host(candidate) || self.is_stale(now);
        if granted {
            self.host_id = Some(candidate.to_string());
            self.host_updated_at = Some(now);
        }
        ClaimOutcome {
            granted,
            host_id: self.host_id.clone(),
        }
    }

    /// Renews the lease when `from` is the current host.
    pub fn refresh_from(&mut self, from: &str, at: i64) -> bool {
        if !self.is_host(from) {
            return false;
        }
        self.host_updated_at = Some(at);
        true
    }

    pub fn is_approved(&self, client_id: &str) -> bool {
        self.is_host(client_id) || self.approved.contains(client_id)
    }

    /// Applies a `join-accept` / `join-deny` decision. Only the current host
    /// may decide; anything else is ignored. Returns whether the approved set
    /// changed.
    pub fn apply_join_decision(&mut self, from: &str, kind: &MessageKind, target: &str) -> bool {
        if !self.is_host(from) || target.is_empty() {
            return false;
        }
        match kind {
            MessageKind::JoinAccept => self.approved.insert(target.to_string()),
            MessageKind::JoinDeny => self.approved.remove(target),
            _ => false,
        }
    }

    pub fn clear_host(&mut self) {
        self.host_id = None;
        self.host_updated_at = None;
    }
}
