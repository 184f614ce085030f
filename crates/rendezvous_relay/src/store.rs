/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool::managed::QueueMode;
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::clock::now_ms;

/// Names of the durable values kept per session.
pub mod keys {
    pub const SEQ: &str = "seq";
    pub const MESSAGES: &str = "messages";
    pub const HOST: &str = "host";
    pub const HOST_UPDATED_AT: &str = "hostUpdatedAt";
    pub const LAST_ACTIVITY: &str = "lastActivity";
    pub const SNAPSHOT: &str = "snapshot";
    pub const APPROVED_CLIENTS: &str = "approvedClients";
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Put { key: &'static str, value: Value },
    Delete { key: &'static str },
}

impl StoreWrite {
    pub fn key(&self) -> &'static str {
        match self {
            StoreWrite::Put { key, .. } | StoreWrite::Delete { key } => key,
        }
    }
}

/// Every stored value of one session, as read at actor cold start.
#[derive(Debug, Clone, Default)]
pub struct StoredSession {
    values: HashMap<String, Value>,
}

impl StoredSession {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, key: String, value: Value) {
        self.values.insert(key, value);
    }
}

/// Durable per-session key/value substrate. A `commit` is applied atomically:
/// either every write in the batch lands or none does.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session: &str) -> Result<StoredSession>;
    async fn commit(&self, session: &str, writes: Vec<StoreWrite>) -> Result<()>;
    async fn health_check(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbDriver {
    Sqlite,
    Postgres,
    Memory,
}

impl DbDriver {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(DbDriver::Sqlite),
            "postgres" | "postgresql" | "pg" => Some(DbDriver::Postgres),
            "memory" | "mem" => Some(DbDriver::Memory),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub driver: DbDriver,
    pub path: PathBuf,
    pub db_url: Option<String>,
    pub db_synchronous: String,
    pub db_busy_timeout_ms: u64,
    pub pg_pool_max_size: usize,
    pub pg_pool_wait_ms: Option<u64>,
    pub pg_pool_queue_mode: QueueMode,
    pub pg_init_retries: usize,
    pub pg_init_backoff_ms: u64,
}

pub async fn build_store(cfg: &StoreConfig) -> Result<Box<dyn SessionStore>> {
    match cfg.driver {
        DbDriver::Sqlite => {
            let store = SqliteStore::open(cfg.path.clone(), cfg.db_synchronous.clone(), cfg.db_busy_timeout_ms).await?;
            info!(path = %cfg.path.display(), "session store: sqlite");
            Ok(Box::new(store))
        }
        DbDriver::Postgres => {
            let store = PgStore::connect(cfg).await?;
            info!("session store: postgres");
            Ok(Box::new(store))
        }
        DbDriver::Memory => {
            warn!("session store: memory (state is lost on restart)");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

fn encode(value: &Value) -> Result<String> {
    serde_json::to_string(value).context("encode session value")
}

fn decode(key: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("decode session value {key}"))
}

pub struct SqliteStore {
    path: PathBuf,
    synchronous: String,
    busy_timeout_ms: u64,
}

impl SqliteStore {
    pub async fn open(path: PathBuf, synchronous: String, busy_timeout_ms: u64) -> Result<Self> {
        let store = Self {
            path,
            synchronous,
            busy_timeout_ms,
        };
        let conn = store.open_conn()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS session_values (
              session TEXT NOT NULL,
              key TEXT NOT NULL,
              value_json TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY(session, key)
            );
            "#,
        )
        .with_context(|| format!("init db: {}", store.path.display()))?;
        Ok(store)
    }

    fn open_conn(&self) -> Result<Connection> {
        open_sqlite(&self.path, &self.synchronous, self.busy_timeout_ms)
    }
}

fn open_sqlite(path: &PathBuf, synchronous: &str, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", synchronous);
    let _ = conn.busy_timeout(Duration::from_millis(busy_timeout_ms));
    Ok(conn)
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, session: &str) -> Result<StoredSession> {
        let path = self.path.clone();
        let synchronous = self.synchronous.clone();
        let busy_timeout_ms = self.busy_timeout_ms;
        let session = session.to_string();
        tokio::task::spawn_blocking(move || -> Result<StoredSession> {
            let conn = open_sqlite(&path, &synchronous, busy_timeout_ms)?;
            let mut stmt = conn.prepare("SELECT key, value_json FROM session_values WHERE session = ?1")?;
            let mut rows = stmt.query(params![session])?;
            let mut out = StoredSession::default();
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let raw: String = row.get(1)?;
                let value = decode(&key, &raw)?;
                out.insert(key, value);
            }
            Ok(out)
        })
        .await?
    }

    async fn commit(&self, session: &str, writes: Vec<StoreWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let path = self.path.clone();
        let synchronous = self.synchronous.clone();
        let busy_timeout_ms = self.busy_timeout_ms;
        let session = session.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_sqlite(&path, &synchronous, busy_timeout_ms)?;
            let tx = conn.transaction()?;
            let now = now_ms();
            for write in &writes {
                match write {
                    StoreWrite::Put { key, value } => {
                        tx.execute(
                            r#"
                            INSERT INTO session_values(session, key, value_json, updated_at_ms)
                            VALUES (?1, ?2, ?3, ?4)
                            ON CONFLICT(session, key) DO UPDATE SET
                              value_json=excluded.value_json,
                              updated_at_ms=excluded.updated_at_ms
                            "#,
                            params![session, key, encode(value)?, now],
                        )?;
                    }
                    StoreWrite::Delete { key } => {
                        tx.execute(
                            "DELETE FROM session_values WHERE session = ?1 AND key = ?2",
                            params![session, key],
                        )?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn health_check(&self) -> Result<()> {
        let path = self.path.clone();
        let synchronous = self.synchronous.clone();
        let busy_timeout_ms = self.busy_timeout_ms;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_sqlite(&path, &synchronous, busy_timeout_ms)?;
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await?
    }
}

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let url = cfg
            .db_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("RENDEZVOUS_DB_URL is required for postgres"))?;
        let mut pg_cfg = deadpool_postgres::Config::new();
        pg_cfg.url = Some(url.to_string());
        pg_cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(cfg.pg_pool_max_size.max(1));
        pool_cfg.queue_mode = cfg.pg_pool_queue_mode;
        pool_cfg.timeouts = Timeouts {
            wait: cfg.pg_pool_wait_ms.map(Duration::from_millis),
            create: None,
            recycle: None,
        };
        pg_cfg.pool = Some(pool_cfg);
        let pool = pg_cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        let max_retries = cfg.pg_init_retries.max(1);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=max_retries {
            match pool.get().await {
                Ok(client) => {
                    client
                        .batch_execute(
                            r#"
                            CREATE TABLE IF NOT EXISTS session_values (
                              session TEXT NOT NULL,
                              key TEXT NOT NULL,
                              value_json TEXT NOT NULL,
                              updated_at_ms BIGINT NOT NULL,
                              PRIMARY KEY(session, key)
                            );
                            "#,
                        )
                        .await
                        .context("postgres schema")?;
                    return Ok(Self { pool });
                }
                Err(err) => {
                    last_err = Some(err.into());
                    let backoff_ms = (attempt as u64 * cfg.pg_init_backoff_ms).min(30_000);
                    warn!("postgres not ready (attempt {attempt}/{max_retries}); retrying in {backoff_ms}ms");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("postgres init failed")))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn load(&self, session: &str) -> Result<StoredSession> {
        let client = self.pool.get().await?;
        let rows = client
            .query("SELECT key, value_json FROM session_values WHERE session = $1", &[&session])
            .await?;
        let mut out = StoredSession::default();
        for row in rows {
            let key: String = row.get(0);
            let raw: String = row.get(1);
            let value = decode(&key, &raw)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    async fn commit(&self, session: &str, writes: Vec<StoreWrite>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let now = now_ms();
        for write in &writes {
            match write {
                StoreWrite::Put { key, value } => {
                    let raw = encode(value)?;
                    tx.execute(
                        r#"
                        INSERT INTO session_values(session, key, value_json, updated_at_ms)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT(session, key) DO UPDATE SET
                          value_json=EXCLUDED.value_json,
                          updated_at_ms=EXCLUDED.updated_at_ms
                        "#,
                        &[&session, key, &raw, &now],
                    )
                    .await?;
                }
                StoreWrite::Delete { key } => {
                    tx.execute(
                        "DELETE FROM session_values WHERE session = $1 AND key = $2",
                        &[&session, key],
                    )
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT 1", &[]).await?;
        let _: i32 = row.get(0);
        Ok(())
    }
}

/// Process-local store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, session: &str) -> Result<StoredSession> {
        let sessions = self.sessions.lock().await;
        let mut out = StoredSession::default();
        if let Some(values) = sessions.get(session) {
            for (k, v) in values {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(out)
    }

    async fn commit(&self, session: &str, writes: Vec<StoreWrite>) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let values = sessions.entry(session.to_string()).or_default();
        for write in writes {
            match write {
                StoreWrite::Put { key, value } => {
                    values.insert(key.to_string(), value);
                }
                StoreWrite::Delete { key } => {
                    values.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
