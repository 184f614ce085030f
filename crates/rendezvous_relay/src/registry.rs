/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rendezvous_protocol::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const REPLACED_REASON: &str = "replaced by newer connection";
pub const STALE_REASON: &str = "outbound queue unavailable";

static CONN_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnId = u64;

/// What the transport writer receives for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close(&'static str),
}

/// Per-recipient result of a send. A stale handle is evicted, never
/// escalated into a failure of the operation that triggered the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Stale,
}

/// Sender half of one live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: ConnId,
    tx: mpsc::Sender<Outbound>,
}

impl ConnHandle {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: CONN_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Never waits: a full queue means the peer is not keeping up and is
    /// treated like a closed one.
    pub fn send(&self, out: Outbound) -> Delivery {
        match self.tx.try_send(out) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Stale,
        }
    }

    pub fn close(&self, reason: &'static str) {
        let _ = self.tx.try_send(Outbound::Close(reason));
    }
}

#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: Vec<String>,
}

/// Client id <-> live connection map of one session; at most one live
/// connection per client id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_client: HashMap<String, ConnHandle>,
    by_conn: HashMap<ConnId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    pub fn client_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    pub fn handle_of(&self, client_id: &str) -> Option<&ConnHandle> {
        self.by_client.get(client_id)
    }

    /// Installs `handle` for `client_id`. A different live handle already held
    /// by that client is closed and returned. If `handle` was registered under
    /// another identity, that mapping is dropped first.
    pub fn attach(&mut self, client_id: &str, handle: ConnHandle) -> Option<ConnHandle> {
        if let Some(previous_id) = self.by_conn.get(&handle.id).cloned() {
            if previous_id == client_id {
                return None;
            }
            self.by_conn.remove(&handle.id);
            if self.by_client.get(&previous_id).map(|h| h.id) == Some(handle.id) {
                self.by_client.remove(&previous_id);
            }
        }

        self.by_conn.insert(handle.id, client_id.to_string());
        let replaced = self.by_client.insert(client_id.to_string(), handle)?;
        self.by_conn.remove(&replaced.id);
        info!(client = %client_id, conn = replaced.id, "connection replaced");
        replaced.close(REPLACED_REASON);
        Some(replaced)
    }

    /// Removes the mapping owned by `conn`. A superseded connection never
    /// evicts its replacement.
    pub fn detach(&mut self, conn: ConnId) -> Option<String> {
        let client_id = self.by_conn.remove(&conn)?;
        if self.by_client.get(&client_id).map(|h| h.id) == Some(conn) {
            self.by_client.remove(&client_id);
        }
        Some(client_id)
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &String> {
        self.by_client.keys()
    }

    /// Sends `frame` (the serialized `envelope`) to every live connection the
    /// envelope is visible to, skipping `excluded`. Stale handles are evicted.
    pub fn deliver_except(&mut self, excluded: Option<&str>, envelope: &Envelope, frame: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for (client_id, handle) in &self.by_client {
            if Some(client_id.as_str()) == excluded || !envelope.is_visible_to(client_id) {
                continue;
            }
            match handle.send(Outbound::Frame(frame.to_string())) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Stale => report.evicted.push(client_id.clone()),
            }
        }
        for client_id in &report.evicted {
            if let Some(handle) = self.by_client.remove(client_id) {
                debug!(client = %client_id, conn = handle.id, "evicting stale connection");
                self.by_conn.remove(&handle.id);
                handle.close(STALE_REASON);
            }
        }
        report
    }
}
