/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-session actor.
//!
//! Each session id is served by exactly one [`SessionActor`] that processes
//! one [`Command`] at a time, storage round trips included. That
//! serialization is what keeps `seq` assignment, host election and expiry
//! race free without any locking around session state.
//!
//! Every mutating operation follows the same shape: check out the durable
//! state (loading it on cold start), run the lifecycle check, dispatch,
//! commit the dirty keys as one batch, and only then fan out. When a commit
//! fails the in-memory state is discarded and reloaded by the next command,
//! so memory never runs ahead of what the store acknowledged.

use anyhow::Context as _;
use rendezvous_protocol::{validate_client_id, Envelope, EnvelopeError, MessageKind};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::election::HostElection;
use crate::history::HistoryLedger;
use crate::lifecycle::{Lifecycle, SessionLifecycle};
use crate::registry::{ConnHandle, ConnId, ConnectionRegistry, Outbound};
use crate::store::{keys, SessionStore, StoreWrite, StoredSession};

/// Sender id of envelopes synthesized by the relay itself.
pub const RELAY_ID: &str = "relay";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_history: usize,
    pub host_stale_ms: i64,
    pub resume_window_ms: i64,
    pub join_approval: bool,
    pub presence: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_history: 1000,
            host_stale_ms: 45_000,
            resume_window_ms: 12 * 60 * 1000,
            join_approval: false,
            presence: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Input(#[from] EnvelopeError),
    #[error("access denied")]
    AccessDenied,
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("session actor shut down")]
    Shutdown,
}

/// Durable part of a session, mirrored key by key into the store.
struct SessionState {
    history: HistoryLedger,
    election: HostElection,
    lifecycle: SessionLifecycle,
    snapshot: Option<Envelope>,
    dirty: BTreeSet<&'static str>,
}

impl SessionState {
    fn from_stored(settings: &SessionSettings, stored: &StoredSession) -> anyhow::Result<Self> {
        let seq = stored.get(keys::SEQ).and_then(Value::as_u64).unwrap_or(0);
        let messages: Vec<Envelope> = match stored.get(keys::MESSAGES) {
            Some(v) => serde_json::from_value(v.clone()).context("decode stored messages")?,
            None => Vec::new(),
        };
        let snapshot: Option<Envelope> = match stored.get(keys::SNAPSHOT) {
            Some(v) => Some(serde_json::from_value(v.clone()).context("decode stored snapshot")?),
            None => None,
        };
        let approved: Vec<String> = match stored.get(keys::APPROVED_CLIENTS) {
            Some(v) => serde_json::from_value(v.clone()).context("decode approved clients")?,
            None => Vec::new(),
        };
        let host = stored.get(keys::HOST).and_then(Value::as_str).map(str::to_string);
        let host_updated_at = stored.get(keys::HOST_UPDATED_AT).and_then(Value::as_i64);
        let last_activity = stored.get(keys::LAST_ACTIVITY).and_then(Value::as_i64);

        Ok(Self {
            history: HistoryLedger::restore(settings.max_history, seq, messages),
            election: HostElection::restore(settings.host_stale_ms, host, host_updated_at, approved),
            lifecycle: SessionLifecycle::new(settings.resume_window_ms, last_activity),
            snapshot,
            dirty: BTreeSet::new(),
        })
    }

    fn mark(&mut self, key: &'static str) {
        self.dirty.insert(key);
    }

    /// Wipes everything tied to the previous generation of the session.
    fn reset_generation(&mut self) {
        self.history.reset();
        self.election.clear_host();
        self.snapshot = None;
        for key in [
            keys::SEQ,
            keys::MESSAGES,
            keys::HOST,
            keys::HOST_UPDATED_AT,
            keys::SNAPSHOT,
            keys::LAST_ACTIVITY,
        ] {
            self.mark(key);
        }
    }

    fn append(&mut self, envelope: &mut Envelope) -> u64 {
        let seq = self.history.append(envelope);
        self.mark(keys::SEQ);
        if !envelope.transient {
            self.mark(keys::MESSAGES);
        }
        seq
    }

    fn take_writes(&mut self) -> anyhow::Result<Vec<StoreWrite>> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut writes = Vec::with_capacity(dirty.len());
        for key in dirty {
            let value = match key {
                keys::SEQ => Some(json!(self.history.last_seq())),
                keys::MESSAGES => {
                    let messages: Vec<&Envelope> = self.history.messages().collect();
                    Some(serde_json::to_value(messages).context("encode messages")?)
                }
                keys::HOST => self.election.host_id().map(Value::from),
                keys::HOST_UPDATED_AT => self.election.host_updated_at().map(Value::from),
                keys::LAST_ACTIVITY => self.lifecycle.last_activity().map(Value::from),
                keys::SNAPSHOT => match &self.snapshot {
                    Some(s) => Some(serde_json::to_value(s).context("encode snapshot")?),
                    None => None,
                },
                keys::APPROVED_CLIENTS => {
                    let approved: Vec<&String> = self.election.approved_clients().collect();
                    Some(json!(approved))
                }
                other => anyhow::bail!("unknown session key {other}"),
            };
            writes.push(match value {
                Some(value) => StoreWrite::Put { key, value },
                None => StoreWrite::Delete { key },
            });
        }
        Ok(writes)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Counts as activity; initializes the session on first touch.
    Activity,
    /// Applies a pending expiry but records nothing else.
    ReadOnly,
}

/// Envelope ready for fan-out, with the client id it must not be echoed to.
struct Outgoing {
    envelope: Envelope,
    excluded: Option<String>,
}

pub enum Command {
    Connect {
        client_id: String,
        outbound: mpsc::Sender<Outbound>,
        reply: oneshot::Sender<Result<ConnId, SessionError>>,
    },
    Receive {
        conn: ConnId,
        raw: String,
    },
    Post {
        envelope: Envelope,
        reply: oneshot::Sender<Result<u64, SessionError>>,
    },
    Poll {
        since: u64,
        client_id: String,
        reply: oneshot::Sender<Result<Vec<Envelope>, SessionError>>,
    },
    ReadSnapshot {
        client_id: String,
        reply: oneshot::Sender<Result<Option<Envelope>, SessionError>>,
    },
    Disconnect {
        conn: ConnId,
    },
}

impl Command {
    /// Answers a command the actor will never run. Callers going through
    /// `SessionHub::call` retry on a fresh actor.
    pub fn refuse(self) {
        match self {
            Command::Connect { reply, .. } => {
                let _ = reply.send(Err(SessionError::Shutdown));
            }
            Command::Post { reply, .. } => {
                let _ = reply.send(Err(SessionError::Shutdown));
            }
            Command::Poll { reply, .. } => {
                let _ = reply.send(Err(SessionError::Shutdown));
            }
            Command::ReadSnapshot { reply, .. } => {
                let _ = reply.send(Err(SessionError::Shutdown));
            }
            Command::Receive { .. } | Command::Disconnect { .. } => {}
        }
    }
}

pub struct SessionActor {
    session: String,
    settings: Arc<SessionSettings>,
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
    registry: ConnectionRegistry,
    state: Option<SessionState>,
}

impl SessionActor {
    pub fn new(
        session: String,
        settings: Arc<SessionSettings>,
        store: Arc<dyn SessionStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            session,
            settings,
            store,
            clock,
            registry: ConnectionRegistry::new(),
            state: None,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// No live connections: the actor can be retired without losing anything
    /// the store does not already hold.
    pub fn is_idle(&self) -> bool {
        self.registry.is_empty()
    }

    pub async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                client_id,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.connect(&client_id, outbound).await);
            }
            Command::Receive { conn, raw } => self.receive(conn, &raw).await,
            Command::Post { envelope, reply } => {
                let _ = reply.send(self.post(envelope).await);
            }
            Command::Poll {
                since,
                client_id,
                reply,
            } => {
                let _ = reply.send(self.poll(since, &client_id).await);
            }
            Command::ReadSnapshot { client_id, reply } => {
                let _ = reply.send(self.read_snapshot(&client_id).await);
            }
            Command::Disconnect { conn } => self.disconnect(conn).await,
        }
    }

    pub async fn connect(&mut self, client_id: &str, outbound: mpsc::Sender<Outbound>) -> Result<ConnId, SessionError> {
        let client_id = validate_client_id(client_id)?;
        let now = self.clock.now_ms();
        let mut state = self.begin(now, Entry::Activity).await?;

        let handle = ConnHandle::new(outbound);
        let conn = handle.id();

        let mut outgoing = Vec::new();
        if self.settings.presence {
            let mut clients: Vec<String> = self.registry.client_ids().cloned().collect();
            if !clients.contains(&client_id) {
                clients.push(client_id.clone());
            }
            outgoing.push(self.presence(&mut state, clients, &client_id, "join", now));
        }
        if state.lifecycle.touch(now) {
            state.mark(keys::LAST_ACTIVITY);
        }
        // The registry only changes once the store has accepted the
        // operation, so a failed connect leaves any previous socket alone.
        self.commit(&mut state).await?;
        self.registry.attach(&client_id, handle);
        self.state = Some(state);
        info!(session = %self.session, client = %client_id, conn, "client connected");
        self.fan_out(outgoing);
        Ok(conn)
    }

    /// Push path. Problems are logged and swallowed: there is nobody to report
    /// them to, and the sender can always catch up through `poll`.
    pub async fn receive(&mut self, conn: ConnId, raw: &str) {
        let Some(client_id) = self.registry.client_of(conn).map(str::to_string) else {
            debug!(session = %self.session, conn, "frame from detached connection dropped");
            return;
        };
        let envelope = match self.parse_frame(raw) {
            Ok(env) => env,
            Err(e) => {
                debug!(session = %self.session, client = %client_id, "dropping frame: {e}");
                return;
            }
        };
        if let Err(e) = self.process(envelope, &client_id, Some(conn)).await {
            error!(session = %self.session, client = %client_id, "push frame failed: {e}");
        }
    }

    /// Pull path. `envelope.from` must already be set by the caller.
    pub async fn post(&mut self, envelope: Envelope) -> Result<u64, SessionError> {
        let from = envelope
            .from
            .as_deref()
            .map(validate_client_id)
            .transpose()?
            .ok_or(EnvelopeError::InvalidClient)?;
        if envelope.session != self.session {
            return Err(EnvelopeError::InvalidSession.into());
        }
        self.process(envelope, &from, None).await
    }

    pub async fn poll(&mut self, since: u64, client_id: &str) -> Result<Vec<Envelope>, SessionError> {
        let now = self.clock.now_ms();
        let state = self.begin(now, Entry::ReadOnly).await?;
        let out = state.history.since(since, client_id);
        self.state = Some(state);
        Ok(out)
    }

    pub async fn read_snapshot(&mut self, client_id: &str) -> Result<Option<Envelope>, SessionError> {
        let now = self.clock.now_ms();
        let state = self.begin(now, Entry::ReadOnly).await?;
        let allowed = !self.settings.join_approval || state.election.is_approved(client_id);
        let snapshot = state.snapshot.clone();
        self.state = Some(state);
        if !allowed {
            debug!(session = %self.session, client = %client_id, "snapshot read denied");
            return Err(SessionError::AccessDenied);
        }
        Ok(snapshot)
    }

    pub async fn disconnect(&mut self, conn: ConnId) {
        let Some(client_id) = self.registry.detach(conn) else {
            return;
        };
        info!(
            session = %self.session,
            client = %client_id,
            conn,
            remaining = self.registry.len(),
            "client disconnected"
        );
        if !self.settings.presence {
            return;
        }
        let now = self.clock.now_ms();
        let result = async {
            let mut state = self.begin(now, Entry::Activity).await?;
            let clients = self.registry.client_ids().cloned().collect();
            let outgoing = self.presence(&mut state, clients, &client_id, "leave", now);
            if state.lifecycle.touch(now) {
                state.mark(keys::LAST_ACTIVITY);
            }
            self.commit(&mut state).await?;
            self.state = Some(state);
            Ok::<_, SessionError>(outgoing)
        }
        .await;
        match result {
            Ok(outgoing) => self.fan_out(vec![outgoing]),
            Err(e) => warn!(session = %self.session, "presence update failed: {e}"),
        }
    }

    fn parse_frame(&self, raw: &str) -> Result<Envelope, EnvelopeError> {
        let mut value: Value = serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if let Value::Object(obj) = &mut value {
            obj.entry("session").or_insert_with(|| Value::String(self.session.clone()));
        }
        let envelope = Envelope::from_value(value)?;
        if envelope.session != self.session {
            return Err(EnvelopeError::InvalidSession);
        }
        Ok(envelope)
    }

    /// Shared by push and pull: dispatch by kind, append, commit, fan out.
    async fn process(&mut self, mut envelope: Envelope, sender: &str, conn: Option<ConnId>) -> Result<u64, SessionError> {
        let now = self.clock.now_ms();
        envelope.default_from(sender);
        if envelope.ts.is_none() {
            envelope.ts = Some(now);
        }
        let from = envelope.from_id().to_string();

        let mut state = self.begin(now, Entry::Activity).await?;

        if state.election.refresh_from(&from, now) {
            state.mark(keys::HOST_UPDATED_AT);
        }

        let mut ack = None;
        let mut rebind = None;
        match &envelope.kind {
            MessageKind::HostClaim => {
                let outcome = state.election.claim(&from, now);
                if outcome.granted {
                    state.mark(keys::HOST);
                    state.mark(keys::HOST_UPDATED_AT);
                }
                info!(
                    session = %self.session,
                    candidate = %from,
                    granted = outcome.granted,
                    host = ?outcome.host_id,
                    "host claim"
                );
                let mut reply = Envelope::new(self.session.clone(), MessageKind::HostAck)
                    .with_field("hostId", Value::from(outcome.host_id))
                    .with_field("granted", outcome.granted);
                reply.from = Some(RELAY_ID.to_string());
                reply.to = Some(from.clone());
                reply.ts = Some(now);
                ack = Some(reply);
            }
            MessageKind::Reattach => {
                rebind = conn.and_then(|c| self.connection(c));
            }
            MessageKind::JoinAccept | MessageKind::JoinDeny if self.settings.join_approval => {
                let target = envelope
                    .to
                    .clone()
                    .or_else(|| envelope.str_field("clientId").map(str::to_string))
                    .unwrap_or_default();
                if state.election.apply_join_decision(&from, &envelope.kind, &target) {
                    state.mark(keys::APPROVED_CLIENTS);
                    info!(session = %self.session, client = %target, kind = %envelope.kind, "join decision");
                }
            }
            _ => {}
        }

        // A socket is never echoed its own frame, whatever `from` it claims.
        // A reattach speaks for the identity it is about to take over.
        let excluded = match (conn, &rebind) {
            (Some(_), None) => sender.to_string(),
            _ => from.clone(),
        };
        let seq = state.append(&mut envelope);
        if envelope.kind == MessageKind::Snapshot {
            state.snapshot = Some(envelope.clone());
            state.mark(keys::SNAPSHOT);
        }
        let mut outgoing = vec![Outgoing {
            envelope,
            excluded: Some(excluded),
        }];
        if let Some(mut ack) = ack {
            state.append(&mut ack);
            outgoing.push(Outgoing {
                envelope: ack,
                excluded: None,
            });
        }

        if state.lifecycle.touch(now) {
            state.mark(keys::LAST_ACTIVITY);
        }
        self.commit(&mut state).await?;
        if let Some(handle) = rebind {
            self.registry.attach(&from, handle);
            debug!(session = %self.session, client = %from, "reattached");
        }
        self.state = Some(state);
        self.fan_out(outgoing);
        Ok(seq)
    }

    fn connection(&self, conn: ConnId) -> Option<ConnHandle> {
        let client = self.registry.client_of(conn)?;
        self.registry.handle_of(client).cloned()
    }

    fn presence(&self, state: &mut SessionState, mut clients: Vec<String>, client_id: &str, event: &str, now: i64) -> Outgoing {
        clients.sort();
        let mut envelope = Envelope::new(self.session.clone(), MessageKind::Presence)
            .with_field("count", clients.len() as u64)
            .with_field("clients", json!(clients))
            .with_field("clientId", client_id)
            .with_field("event", event);
        envelope.from = Some(RELAY_ID.to_string());
        envelope.transient = true;
        envelope.ts = Some(now);
        state.append(&mut envelope);
        Outgoing {
            envelope,
            excluded: None,
        }
    }

    /// Checks the durable state out of the actor, loading it on cold start
    /// and applying any pending expiry before the caller proceeds.
    async fn begin(&mut self, now: i64, entry: Entry) -> Result<SessionState, SessionError> {
        let mut state = match self.state.take() {
            Some(state) => state,
            None => {
                let stored = self.store.load(&self.session).await.map_err(SessionError::Storage)?;
                let state = SessionState::from_stored(&self.settings, &stored).map_err(SessionError::Storage)?;
                debug!(
                    session = %self.session,
                    fresh = stored.is_empty(),
                    seq = state.history.last_seq(),
                    messages = state.history.len(),
                    "session state loaded"
                );
                state
            }
        };

        let status = match entry {
            Entry::Activity => state.lifecycle.check(now),
            Entry::ReadOnly => match state.lifecycle.peek(now) {
                Lifecycle::Expired { .. } => state.lifecycle.check(now),
                other => other,
            },
        };
        match status {
            Lifecycle::Fresh if entry == Entry::Activity => state.mark(keys::LAST_ACTIVITY),
            Lifecycle::Expired { idle_ms } => {
                info!(session = %self.session, idle_ms, "session expired; starting a new generation");
                state.reset_generation();
                self.commit(&mut state).await?;
            }
            _ => {}
        }
        Ok(state)
    }

    async fn commit(&self, state: &mut SessionState) -> Result<(), SessionError> {
        let writes = state.take_writes().map_err(SessionError::Storage)?;
        if writes.is_empty() {
            return Ok(());
        }
        debug!(
            session = %self.session,
            keys = ?writes.iter().map(StoreWrite::key).collect::<Vec<_>>(),
            "commit"
        );
        self.store.commit(&self.session, writes).await.map_err(|e| {
            error!(session = %self.session, "session commit failed: {e:#}");
            SessionError::Storage(e)
        })
    }

    fn fan_out(&mut self, outgoing: Vec<Outgoing>) {
        for Outgoing { envelope, excluded } in outgoing {
            let frame = match serde_json::to_string(&envelope) {
                Ok(v) => v,
                Err(e) => {
                    error!(session = %self.session, "serialize envelope failed: {e}");
                    continue;
                }
            };
            let report = self.registry.deliver_except(excluded.as_deref(), &envelope, &frame);
            debug!(
                session = %self.session,
                seq = ?envelope.seq,
                kind = %envelope.kind,
                delivered = report.delivered,
                evicted = report.evicted.len(),
                "fan-out"
            );
        }
    }
}

/// Cloneable mailbox address of a running [`SessionActor`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    pub async fn connect(&self, client_id: &str, outbound: mpsc::Sender<Outbound>) -> Result<ConnId, SessionError> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::Connect {
            client_id,
            outbound,
            reply,
        })
        .await
    }

    pub async fn receive(&self, conn: ConnId, raw: String) -> Result<(), SessionError> {
        self.tx
            .send(Command::Receive { conn, raw })
            .await
            .map_err(|_| SessionError::Shutdown)
    }

    pub async fn post(&self, envelope: Envelope) -> Result<u64, SessionError> {
        self.request(|reply| Command::Post { envelope, reply }).await
    }

    pub async fn poll(&self, since: u64, client_id: &str) -> Result<Vec<Envelope>, SessionError> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::Poll {
            since,
            client_id,
            reply,
        })
        .await
    }

    pub async fn read_snapshot(&self, client_id: &str) -> Result<Option<Envelope>, SessionError> {
        let client_id = client_id.to_string();
        self.request(|reply| Command::ReadSnapshot { client_id, reply }).await
    }

    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(Command::Disconnect { conn }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::REPLACED_REASON;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        actor: SessionActor,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn harness(settings: SessionSettings) -> Harness {
        let clock = ManualClock::new(T0);
        let store = Arc::new(MemoryStore::new());
        let actor = SessionActor::new("room".into(), Arc::new(settings), store.clone(), clock.clone());
        Harness { actor, clock, store }
    }

    async fn join(actor: &mut SessionActor, client: &str) -> (ConnId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = actor.connect(client, tx).await.unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Frame(frame) = msg {
                out.push(serde_json::from_str(&frame).unwrap());
            }
        }
        out
    }

    fn posted(from: &str, body: Value) -> Envelope {
        let mut env = Envelope::from_value(body).unwrap();
        env.default_from(from);
        env
    }

    #[tokio::test]
    async fn push_relays_to_addressee_only_and_never_echoes() {
        let mut h = harness(SessionSettings::default());
        let (alice, mut alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;

        h.actor
            .receive(alice, r#"{"type":"signal","to":"bob","payload":{"sdp":"offer"}}"#)
            .await;

        let got = drain(&mut bob_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].seq, Some(1));
        assert_eq!(got[0].from.as_deref(), Some("alice"));
        assert_eq!(got[0].session, "room");
        assert_eq!(got[0].fields["payload"]["sdp"], "offer");
        assert!(drain(&mut alice_rx).is_empty());

        assert_eq!(h.actor.poll(0, "bob").await.unwrap().len(), 1);
        assert!(h.actor.poll(1, "bob").await.unwrap().is_empty());
        assert!(h.actor.poll(0, "carol").await.unwrap().is_empty());
        assert!(h.actor.poll(0, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_or_foreign_frames_are_dropped() {
        let mut h = harness(SessionSettings::default());
        let (alice, _alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;

        h.actor.receive(alice, "not json").await;
        h.actor.receive(alice, r#"{"session":"other-room"}"#).await;
        h.actor.receive(alice, "[]").await;
        assert!(drain(&mut bob_rx).is_empty());

        h.actor.receive(alice, r#"{"type":"signal"}"#).await;
        let got = drain(&mut bob_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].seq, Some(1));
    }

    #[tokio::test]
    async fn push_excludes_the_socket_identity_not_the_claimed_sender() {
        let mut h = harness(SessionSettings::default());
        let (alice, mut alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;

        h.actor.receive(alice, r#"{"from":"alice-laptop"}"#).await;
        assert!(drain(&mut alice_rx).is_empty());
        let got = drain(&mut bob_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from.as_deref(), Some("alice-laptop"));

        h.actor.receive(alice, r#"{"from":"bob"}"#).await;
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn push_and_pull_share_one_sequence() {
        let mut h = harness(SessionSettings::default());
        let (alice, _alice_rx) = join(&mut h.actor, "alice").await;

        let mut seqs = Vec::new();
        for i in 0..6 {
            if i % 2 == 0 {
                h.actor.receive(alice, r#"{"type":"signal"}"#).await;
            } else {
                seqs.push(h.actor.post(posted("bob", json!({"session": "room"}))).await.unwrap());
            }
        }
        let transient = posted("bob", json!({"session": "room", "transient": true}));
        seqs.push(h.actor.post(transient).await.unwrap());

        let history = h.actor.poll(0, "carol").await.unwrap();
        let persisted: Vec<u64> = history.iter().map(|e| e.seq.unwrap()).collect();
        assert_eq!(persisted, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(seqs, vec![2, 4, 6, 7]);
        assert_eq!(h.actor.post(posted("bob", json!({"session": "room"}))).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn post_excludes_sender_by_identifier() {
        let mut h = harness(SessionSettings::default());
        let (_alice, mut alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;

        let seq = h.actor.post(posted("alice", json!({"session": "room"}))).await.unwrap();
        assert_eq!(seq, 1);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn post_requires_sender_and_matching_session() {
        let mut h = harness(SessionSettings::default());
        let env = Envelope::from_value(json!({"session": "room"})).unwrap();
        assert!(matches!(h.actor.post(env).await, Err(SessionError::Input(_))));
        let env = posted("alice", json!({"session": "elsewhere"}));
        assert!(matches!(h.actor.post(env).await, Err(SessionError::Input(_))));
        assert!(h.store.load("room").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn host_claims_are_acked_and_leased() {
        let mut h = harness(SessionSettings::default());
        let (alice, mut alice_rx) = join(&mut h.actor, "alice").await;
        let (bob, mut bob_rx) = join(&mut h.actor, "bob").await;

        h.actor.receive(alice, r#"{"type":"host-claim"}"#).await;
        let alice_got = drain(&mut alice_rx);
        assert_eq!(alice_got.len(), 1);
        let ack = &alice_got[0];
        assert_eq!(ack.kind, MessageKind::HostAck);
        assert_eq!(ack.seq, Some(2));
        assert_eq!(ack.to.as_deref(), Some("alice"));
        assert_eq!(ack.fields["granted"], true);
        assert_eq!(ack.fields["hostId"], "alice");
        // bob sees the claim itself, not alice's ack
        let bob_got = drain(&mut bob_rx);
        assert_eq!(bob_got.len(), 1);
        assert_eq!(bob_got[0].kind, MessageKind::HostClaim);

        h.clock.advance_ms(30_000);
        h.actor.receive(bob, r#"{"type":"host-claim"}"#).await;
        let bob_got = drain(&mut bob_rx);
        let ack = bob_got.iter().find(|e| e.kind == MessageKind::HostAck).unwrap();
        assert_eq!(ack.seq, Some(4));
        assert_eq!(ack.fields["granted"], false);
        assert_eq!(ack.fields["hostId"], "alice");
    }

    #[tokio::test]
    async fn stale_host_is_replaced_but_traffic_keeps_lease() {
        let mut h = harness(SessionSettings::default());
        let (alice, _alice_rx) = join(&mut h.actor, "alice").await;
        let (bob, mut bob_rx) = join(&mut h.actor, "bob").await;
        h.actor.receive(alice, r#"{"type":"host-claim"}"#).await;

        h.clock.advance_ms(40_000);
        h.actor.receive(alice, r#"{"type":"signal","candidate":"c1"}"#).await;
        h.clock.advance_ms(40_000);
        h.actor.receive(bob, r#"{"type":"host-claim"}"#).await;
        let ack = drain(&mut bob_rx).into_iter().find(|e| e.kind == MessageKind::HostAck).unwrap();
        assert_eq!(ack.fields["granted"], false);

        h.clock.advance_ms(46_000);
        h.actor.receive(bob, r#"{"type":"host-claim"}"#).await;
        let ack = drain(&mut bob_rx).into_iter().find(|e| e.kind == MessageKind::HostAck).unwrap();
        assert_eq!(ack.fields["granted"], true);
        assert_eq!(ack.fields["hostId"], "bob");
    }

    #[tokio::test]
    async fn every_claim_gets_exactly_one_ack_over_pull() {
        let mut h = harness(SessionSettings::default());
        for (i, who) in ["alice", "bob", "alice"].iter().enumerate() {
            let seq = h
                .actor
                .post(posted(who, json!({"session": "room", "type": "host-claim"})))
                .await
                .unwrap();
            assert_eq!(seq, (i as u64) * 2 + 1);
        }
        let acks: Vec<_> = h
            .actor
            .poll(0, "alice")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == MessageKind::HostAck)
            .collect();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.fields["granted"] == true));
        let bob_acks: Vec<_> = h
            .actor
            .poll(0, "bob")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == MessageKind::HostAck)
            .collect();
        assert_eq!(bob_acks.len(), 1);
        assert_eq!(bob_acks[0].fields["granted"], false);
    }

    #[tokio::test]
    async fn reconnect_replaces_old_connection() {
        let mut h = harness(SessionSettings::default());
        let (old, mut old_rx) = join(&mut h.actor, "alice").await;
        let (new, mut new_rx) = join(&mut h.actor, "alice").await;
        let (bob, _bob_rx) = join(&mut h.actor, "bob").await;
        assert_eq!(old_rx.try_recv().unwrap(), Outbound::Close(REPLACED_REASON));

        h.actor.receive(bob, r#"{"to":"alice"}"#).await;
        assert_eq!(drain(&mut new_rx).len(), 1);
        assert!(drain(&mut old_rx).is_empty());

        // the superseded socket closing must not evict its replacement
        h.actor.disconnect(old).await;
        h.actor.receive(bob, r#"{"to":"alice"}"#).await;
        assert_eq!(drain(&mut new_rx).len(), 1);
        h.actor.disconnect(new).await;
        assert!(!h.actor.is_idle());
    }

    #[tokio::test]
    async fn reattach_moves_connection_to_declared_identity() {
        let mut h = harness(SessionSettings::default());
        let (guest, mut guest_rx) = join(&mut h.actor, "guest-7").await;
        let (bob, _bob_rx) = join(&mut h.actor, "bob").await;
        h.actor.receive(guest, r#"{"type":"reattach","from":"alice"}"#).await;

        h.actor.receive(bob, r#"{"to":"alice","n":1}"#).await;
        let got = drain(&mut guest_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fields["n"], 1);

        h.actor.receive(bob, r#"{"to":"guest-7"}"#).await;
        assert!(drain(&mut guest_rx).is_empty());
    }

    #[tokio::test]
    async fn snapshot_keeps_only_latest() {
        let mut h = harness(SessionSettings::default());
        for n in 1..=2 {
            h.actor
                .post(posted("alice", json!({"session": "room", "type": "snapshot", "n": n})))
                .await
                .unwrap();
        }
        let snap = h.actor.read_snapshot("bob").await.unwrap().unwrap();
        assert_eq!(snap.fields["n"], 2);
        assert_eq!(snap.seq, Some(2));
        let stored = h.store.load("room").await.unwrap();
        assert_eq!(stored.get(keys::SNAPSHOT).unwrap()["n"], 2);
    }

    #[tokio::test]
    async fn snapshot_read_requires_approval_when_enabled() {
        let mut h = harness(SessionSettings {
            join_approval: true,
            ..SessionSettings::default()
        });
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "host-claim"})))
            .await
            .unwrap();
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "snapshot", "state": "x"})))
            .await
            .unwrap();

        assert!(h.actor.read_snapshot("alice").await.unwrap().is_some());
        assert!(matches!(h.actor.read_snapshot("bob").await, Err(SessionError::AccessDenied)));

        // a non-host cannot approve anyone
        h.actor
            .post(posted("carol", json!({"session": "room", "type": "join-accept", "to": "bob"})))
            .await
            .unwrap();
        assert!(matches!(h.actor.read_snapshot("bob").await, Err(SessionError::AccessDenied)));

        h.actor
            .post(posted("alice", json!({"session": "room", "type": "join-accept", "to": "bob"})))
            .await
            .unwrap();
        assert!(h.actor.read_snapshot("bob").await.unwrap().is_some());

        h.actor
            .post(posted("alice", json!({"session": "room", "type": "join-deny", "clientId": "bob"})))
            .await
            .unwrap();
        assert!(matches!(h.actor.read_snapshot("bob").await, Err(SessionError::AccessDenied)));
    }

    #[tokio::test]
    async fn idle_session_resets_on_next_operation() {
        let mut h = harness(SessionSettings::default());
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "host-claim"})))
            .await
            .unwrap();
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "snapshot"})))
            .await
            .unwrap();
        // the ack is addressed to alice, so bob replays the claim and snapshot
        assert_eq!(h.actor.poll(0, "bob").await.unwrap().len(), 2);

        h.clock.advance_ms(12 * 60 * 1000 + 1);
        assert!(h.actor.poll(0, "bob").await.unwrap().is_empty());
        assert!(h.actor.read_snapshot("bob").await.unwrap().is_none());
        let stored = h.store.load("room").await.unwrap();
        assert_eq!(stored.get(keys::SEQ), Some(&json!(0)));
        assert_eq!(stored.get(keys::HOST), None);
        assert_eq!(stored.get(keys::SNAPSHOT), None);
        assert_eq!(stored.get(keys::LAST_ACTIVITY), Some(&json!(T0 + 12 * 60 * 1000 + 1)));

        let seq = h
            .actor
            .post(posted("bob", json!({"session": "room", "type": "host-claim"})))
            .await
            .unwrap();
        assert_eq!(seq, 1);
        let ack = h.actor.poll(0, "bob").await.unwrap().pop().unwrap();
        assert_eq!(ack.kind, MessageKind::HostAck);
        assert_eq!(ack.fields["granted"], true);
    }

    #[tokio::test]
    async fn connect_after_idle_starts_a_new_generation() {
        let mut h = harness(SessionSettings::default());
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "snapshot"})))
            .await
            .unwrap();
        h.actor.post(posted("alice", json!({"session": "room"}))).await.unwrap();

        h.clock.advance_ms(12 * 60 * 1000 + 1);
        let (_bob, _bob_rx) = join(&mut h.actor, "bob").await;
        let stored = h.store.load("room").await.unwrap();
        assert_eq!(stored.get(keys::SEQ), Some(&json!(0)));
        assert_eq!(stored.get(keys::SNAPSHOT), None);
        assert!(h.actor.read_snapshot("bob").await.unwrap().is_none());
        assert_eq!(h.actor.post(posted("alice", json!({"session": "room"}))).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_after_idle_starts_a_new_generation() {
        let mut h = harness(SessionSettings::default());
        let (alice, _alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;
        h.actor.receive(alice, r#"{"type":"snapshot","n":1}"#).await;
        h.actor.receive(alice, r#"{"type":"signal"}"#).await;
        drain(&mut bob_rx);

        h.clock.advance_ms(12 * 60 * 1000 + 1);
        h.actor.receive(alice, r#"{"type":"signal","n":2}"#).await;
        let got = drain(&mut bob_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].seq, Some(1));
        let history = h.actor.poll(0, "bob").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].fields["n"], 2);
        assert!(h.actor.read_snapshot("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_does_not_count_as_activity() {
        let mut h = harness(SessionSettings::default());
        h.actor.post(posted("alice", json!({"session": "room"}))).await.unwrap();
        for _ in 0..3 {
            h.clock.advance_ms(5 * 60 * 1000);
            h.actor.poll(0, "bob").await.unwrap();
        }
        assert!(h.actor.poll(0, "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_on_untouched_session_writes_nothing() {
        let mut h = harness(SessionSettings::default());
        assert!(h.actor.poll(0, "bob").await.unwrap().is_empty());
        assert!(h.store.load("room").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restarted_actor_resumes_from_store() {
        let mut h = harness(SessionSettings::default());
        h.actor
            .post(posted("alice", json!({"session": "room", "type": "host-claim"})))
            .await
            .unwrap();
        h.actor.post(posted("alice", json!({"session": "room"}))).await.unwrap();

        let mut restarted = SessionActor::new(
            "room".into(),
            Arc::new(SessionSettings::default()),
            h.store.clone(),
            h.clock.clone(),
        );
        let seq = restarted
            .post(posted("bob", json!({"session": "room", "type": "host-claim"})))
            .await
            .unwrap();
        assert_eq!(seq, 4);
        let ack = restarted.poll(4, "bob").await.unwrap().pop().unwrap();
        assert_eq!(ack.fields["granted"], false);
        assert_eq!(ack.fields["hostId"], "alice");
    }

    #[tokio::test]
    async fn unknown_types_are_persisted_and_broadcast() {
        let mut h = harness(SessionSettings::default());
        let (alice, _alice_rx) = join(&mut h.actor, "alice").await;
        let (_bob, mut bob_rx) = join(&mut h.actor, "bob").await;
        h.actor.receive(alice, r#"{"type":"cursor-move","x":3}"#).await;
        let got = drain(&mut bob_rx);
        assert_eq!(got[0].kind, MessageKind::Other("cursor-move".into()));
        assert_eq!(h.actor.poll(0, "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn presence_broadcasts_connection_count() {
        let mut h = harness(SessionSettings {
            presence: true,
            ..SessionSettings::default()
        });
        let (_alice, mut alice_rx) = join(&mut h.actor, "alice").await;
        let (bob, _bob_rx) = join(&mut h.actor, "bob").await;
        let got = drain(&mut alice_rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].kind, MessageKind::Presence);
        assert_eq!(got[1].fields["count"], 2);
        assert_eq!(got[1].fields["clients"], json!(["alice", "bob"]));

        h.actor.disconnect(bob).await;
        let got = drain(&mut alice_rx);
        assert_eq!(got[0].fields["count"], 1);
        assert_eq!(got[0].fields["event"], "leave");
        // presence is transient: sequenced but not replayable
        assert!(h.actor.poll(0, "carol").await.unwrap().is_empty());
    }

    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn load(&self, session: &str) -> anyhow::Result<StoredSession> {
            self.inner.load(session).await
        }

        async fn commit(&self, session: &str, writes: Vec<StoreWrite>) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk on fire");
            }
            self.inner.commit(session, writes).await
        }

        async fn health_check(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_failure_surfaces_and_does_not_leak_state() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: AtomicBool::new(false),
        });
        let clock = ManualClock::new(T0);
        let mut actor = SessionActor::new("room".into(), Arc::new(SessionSettings::default()), store.clone(), clock);
        let (_bob, mut bob_rx) = join(&mut actor, "bob").await;
        assert_eq!(actor.post(posted("alice", json!({"session": "room"}))).await.unwrap(), 1);
        drain(&mut bob_rx);

        store.fail.store(true, Ordering::SeqCst);
        let err = actor.post(posted("alice", json!({"session": "room"}))).await;
        assert!(matches!(err, Err(SessionError::Storage(_))));
        assert!(drain(&mut bob_rx).is_empty());

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(actor.post(posted("alice", json!({"session": "room"}))).await.unwrap(), 2);
        assert_eq!(drain(&mut bob_rx)[0].seq, Some(2));
    }

    #[tokio::test]
    async fn failed_commit_leaves_connections_in_place() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: AtomicBool::new(false),
        });
        let clock = ManualClock::new(T0);
        let mut actor = SessionActor::new("room".into(), Arc::new(SessionSettings::default()), store.clone(), clock.clone());
        let (guest, mut guest_rx) = join(&mut actor, "guest-7").await;
        let (bob, _bob_rx) = join(&mut actor, "bob").await;

        store.fail.store(true, Ordering::SeqCst);
        actor.receive(guest, r#"{"type":"reattach","from":"alice"}"#).await;
        clock.advance_ms(1_000);
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(actor.connect("guest-7", tx).await, Err(SessionError::Storage(_))));
        assert!(guest_rx.try_recv().is_err());

        store.fail.store(false, Ordering::SeqCst);
        actor.receive(bob, r#"{"to":"guest-7"}"#).await;
        assert_eq!(drain(&mut guest_rx).len(), 1);
        actor.receive(bob, r#"{"to":"alice"}"#).await;
        assert!(drain(&mut guest_rx).is_empty());
    }
}
