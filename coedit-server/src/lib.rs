//! Server-side collaboration core for the coedit multi-user code editor.
//!
//! Concurrent edits from every client of a document funnel into one
//! per-document engine, get reconciled by operational transformation into a
//! single converging text state, and fan back out to every participant.
//! The only process-wide state is the document registry; everything else is
//! owned by an engine or a session.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

pub mod auth;
pub mod bus;
mod engine;
mod gateway;
pub mod ot;
pub mod presence;
pub mod protocol;
pub mod store;

pub use engine::{ConnectionId, EngineConfig};

use crate::auth::{Authenticator, TokenFile, Unsecured};
use crate::bus::{FanoutBus, LocalBus};
use crate::engine::EngineHandle;
use crate::gateway::DetachedSession;
use crate::protocol::Color;
use crate::store::{DocumentStore, FileStore};

/// Unique identifier for a document or user.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);

impl Identifier {
    /// Maximum length of an identifier, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("identifier is too long");
        }
        if s.is_empty() || !s.chars().all(Self::valid_char) {
            anyhow::bail!("identifier contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("identifier contains invalid UTF-8")
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl serde::Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory for the file-backed document store.
    pub storage: PathBuf,
    /// Bearer-token registry file; `None` runs unsecured (dev mode).
    pub auth_tokens: Option<PathBuf>,
    /// Engine tunables.
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// A configuration with defaults rooted at `storage`.
    pub fn new(storage: PathBuf) -> Self {
        Self {
            storage,
            auth_tokens: None,
            engine: EngineConfig::default(),
        }
    }
}

/// The shared state of the server. The document registry inside is the only
/// process-wide mutable state of the collaboration core.
pub struct ServerState {
    config: ServerConfig,
    documents: Arc<DashMap<Identifier, EngineHandle>>,
    detached: DashMap<ConnectionId, DetachedSession>,
    colors: DashMap<String, Color>,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn FanoutBus>,
    auth: Arc<dyn Authenticator>,
    connections: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    start_time: u64,
}

impl ServerState {
    /// Build state from `config`, with the file store, the in-process bus
    /// and the configured authenticator.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::new(config.storage.clone()).await?);
        let auth: Arc<dyn Authenticator> = match &config.auth_tokens {
            Some(path) => Arc::new(TokenFile::load(path)?),
            None => Arc::new(Unsecured),
        };
        Ok(Self::with_parts(config, store, Arc::new(LocalBus::new()), auth))
    }

    /// Build state from explicit collaborators; how a deployment plugs in a
    /// real cross-node bus or a different store.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn FanoutBus>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            documents: Arc::new(DashMap::new()),
            detached: DashMap::new(),
            colors: DashMap::new(),
            store,
            bus,
            auth,
            connections: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// State over a temporary store, unsecured, for testing.
    pub async fn temporary() -> Result<Self> {
        Self::temporary_with(EngineConfig::default()).await
    }

    /// Temporary state with custom engine tunables, for testing.
    pub async fn temporary_with(engine: EngineConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::temporary().await?);
        let config = ServerConfig {
            storage: PathBuf::new(),
            auth_tokens: None,
            engine,
        };
        Ok(Self::with_parts(
            config,
            store,
            Arc::new(LocalBus::new()),
            Arc::new(Unsecured),
        ))
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn auth(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    pub(crate) fn next_connection(&self) -> ConnectionId {
        self.connections.fetch_add(1, Ordering::Relaxed)
    }

    /// The display color for a principal, drawn once and then stable for
    /// the lifetime of the process.
    pub(crate) fn color_for(&self, user_id: &str) -> Color {
        *self
            .colors
            .entry(user_id.to_owned())
            .or_insert_with(Color::random)
    }

    /// The live engine for `id`, spawning one (and loading the document)
    /// when none is running.
    pub(crate) fn open_document(&self, id: &Identifier) -> EngineHandle {
        use dashmap::mapref::entry::Entry;
        match self.documents.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    entry.insert(self.spawn_engine(id));
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => entry.insert(self.spawn_engine(id)).clone(),
        }
    }

    fn spawn_engine(&self, id: &Identifier) -> EngineHandle {
        engine::spawn(
            id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.config.engine.clone(),
            Arc::clone(&self.documents),
            &self.tracker,
            self.shutdown.clone(),
        )
    }

    /// Claim a detached session for a reconnect, if it is still within its
    /// grace window and belongs to the same principal.
    pub(crate) fn take_detached(
        &self,
        conn: ConnectionId,
        user_id: &str,
    ) -> Option<DetachedSession> {
        let matches = self
            .detached
            .get(&conn)
            .is_some_and(|entry| entry.user_id == user_id);
        if matches {
            self.detached.remove(&conn).map(|(_, entry)| entry)
        } else {
            None
        }
    }

    /// Park a disconnected session for the reconnect grace window, after
    /// which the engine is told it detached for real.
    pub(crate) fn register_detached(
        self: &Arc<Self>,
        conn: ConnectionId,
        user_id: String,
        engine: EngineHandle,
    ) {
        let expires_at = Instant::now() + self.config.engine.reconnect_grace;
        self.detached.insert(
            conn,
            DetachedSession {
                user_id,
                engine,
                expires_at,
            },
        );
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(expires_at) => {}
                _ = state.shutdown.cancelled() => return,
            }
            let expired = state
                .detached
                .get(&conn)
                .is_some_and(|entry| entry.expires_at <= Instant::now());
            if expired && let Some((_, entry)) = state.detached.remove(&conn) {
                info!(conn, "reconnect grace expired");
                entry.engine.detach(conn).await;
            }
        });
    }

    /// Flush and stop every engine. Called once on graceful shutdown; safe
    /// to call when nothing is running.
    pub async fn persist(&self) {
        info!("draining document engines");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("all documents persisted");
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of documents with a live engine.
    num_documents: usize,
    /// Sessions parked in the reconnect grace window.
    detached_sessions: usize,
}

/// The server's router: the collaboration socket plus two read-only
/// inspection endpoints.
pub fn server(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/socket", get(gateway::socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
) -> String {
    let live = state.documents.get(&id).map(|entry| entry.value().clone());
    if let Some(handle) = live
        && let Some((content, _, _)) = handle.inspect().await
    {
        return content;
    }
    state
        .store
        .load_document(&id)
        .await
        .map(|doc| doc.content)
        .unwrap_or_default()
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Json<Stats> {
    Json(Stats {
        start_time: state.start_time,
        num_documents: state.documents.len(),
        detached_sessions: state.detached.len(),
    })
}
