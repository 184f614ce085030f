/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::session::{Command, SessionActor, SessionError, SessionHandle, SessionSettings};
use crate::store::SessionStore;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub mailbox: usize,
    pub actor_idle: Duration,
}

struct Slot {
    generation: u64,
    handle: SessionHandle,
}

struct HubInner {
    sessions: RwLock<HashMap<String, Slot>>,
    settings: Arc<SessionSettings>,
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
    cfg: HubConfig,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Directory of live session actors, spawned on first use.
///
/// An actor with no connections retires after `actor_idle` of silence. It
/// unregisters itself and closes its mailbox under the directory write lock,
/// then refuses anything still queued, so a session never has two actors
/// doing work at once.
#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

impl SessionHub {
    pub fn new(
        settings: SessionSettings,
        store: Arc<dyn SessionStore>,
        clock: SharedClock,
        cfg: HubConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: RwLock::new(HashMap::new()),
                settings: Arc::new(settings),
                store,
                clock,
                cfg,
                generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    /// Stops every actor after the command it is currently processing.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub async fn handle(&self, session: &str) -> SessionHandle {
        {
            let sessions = self.inner.sessions.read().await;
            if let Some(slot) = sessions.get(session) {
                if !slot.handle.is_closed() {
                    return slot.handle.clone();
                }
            }
        }
        let mut sessions = self.inner.sessions.write().await;
        if let Some(slot) = sessions.get(session) {
            if !slot.handle.is_closed() {
                return slot.handle.clone();
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let handle = self.spawn_actor(session.to_string(), generation);
        sessions.insert(
            session.to_string(),
            Slot {
                generation,
                handle: handle.clone(),
            },
        );
        handle
    }

    /// Runs `op` against the session's actor, retrying once on a fresh actor
    /// if the first one shut down before taking the command.
    pub async fn call<T, F, Fut>(&self, session: &str, op: F) -> Result<T, SessionError>
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        match op(self.handle(session).await).await {
            Err(SessionError::Shutdown) => {
                debug!(session = %session, "actor retired mid-request; retrying");
                op(self.handle(session).await).await
            }
            other => other,
        }
    }

    fn spawn_actor(&self, session: String, generation: u64) -> SessionHandle {
        let (tx, rx) = mpsc::channel(self.inner.cfg.mailbox.max(1));
        let actor = SessionActor::new(
            session,
            self.inner.settings.clone(),
            self.inner.store.clone(),
            self.inner.clock.clone(),
        );
        debug!(session = %actor.session(), generation, "session actor spawned");
        tokio::spawn(self.clone().run_actor(actor, rx, generation));
        SessionHandle::new(tx)
    }

    async fn run_actor(self, mut actor: SessionActor, mut rx: mpsc::Receiver<Command>, generation: u64) {
        let idle = self.inner.cfg.actor_idle;
        let shutdown = self.inner.shutdown.clone();
        loop {
            let next = if actor.is_idle() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = tokio::time::timeout(idle, rx.recv()) => res,
                }
            } else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    cmd = rx.recv() => Ok(cmd),
                }
            };
            match next {
                Ok(Some(cmd)) => actor.handle(cmd).await,
                Ok(None) => break,
                Err(_) => {
                    self.retire(&actor, &mut rx, generation).await;
                    break;
                }
            }
        }
        debug!(session = %actor.session(), generation, "session actor stopped");
    }

    /// Unregisters the actor, then turns away whatever reached its mailbox in
    /// the meantime. The directory lock is only held for the removal, so other
    /// sessions never wait on this one.
    async fn retire(&self, actor: &SessionActor, rx: &mut mpsc::Receiver<Command>, generation: u64) {
        {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.get(actor.session()).map(|s| s.generation) == Some(generation) {
                sessions.remove(actor.session());
            }
            rx.close();
        }
        let mut refused = 0usize;
        while let Some(cmd) = rx.recv().await {
            cmd.refuse();
            refused += 1;
        }
        info!(session = %actor.session(), refused, "idle session actor retired");
    }
}
