//! Per-document single-writer engine.
//!
//! One task owns each open document: its authoritative text, the monotonic
//! version counter, the bounded operation log and the per-client
//! acknowledged-version map. Every mutation flows through the engine's FIFO
//! inbox, which makes mutual exclusion implicit; the engine never blocks on
//! persistence or on a slow session's outbound queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::Identifier;
use crate::bus::{BusMessage, FanoutBus};
use crate::ot::{self, EditError, Operation};
use crate::presence::{PresenceEntry, PresenceUpdate};
use crate::protocol::{AppliedOp, Event, Member, MemberPresence, Outbound, SyncData, close};
use crate::store::{DocumentStore, PersistJob, PersistedDocument, Spooler, VersionRecord};

/// Stable identifier of one gateway connection.
pub type ConnectionId = u64;

/// Engine tunables. Defaults match the protocol's documented constants.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How often a dirty document is snapshotted to the store.
    pub autosave_interval: Duration,
    /// Grace period after the last detach before the engine terminates.
    pub drain_grace: Duration,
    /// How long a disconnected session keeps its membership.
    pub reconnect_grace: Duration,
    /// Connection idle timeout; clients heartbeat well inside it.
    pub idle_timeout: Duration,
    /// Floor on retained log entries; the log may grow past this to keep
    /// the oldest acknowledged version of an attached client reachable.
    pub log_limit: usize,
    /// Outbound queue capacity per session.
    pub outbound_capacity: usize,
    /// Upper bound on document length, in code points.
    pub max_content_len: usize,
    /// Sustained `document.op` rate allowed per connection, per second.
    pub op_rate: u32,
    /// Burst allowance on top of `op_rate`.
    pub op_burst: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(30),
            drain_grace: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            log_limit: 1024,
            outbound_capacity: 1024,
            max_content_len: 256 * 1024,
            op_rate: 64,
            op_burst: 128,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The engine's handle to one session's outbound path. Events go through a
/// bounded queue; the close channel carries a websocket close code past a
/// full queue.
#[derive(Debug)]
pub(crate) struct SessionSink {
    events: mpsc::Sender<Outbound>,
    close: mpsc::Sender<u16>,
}

enum SinkError {
    Full,
    Closed,
}

impl SessionSink {
    pub(crate) fn new(events: mpsc::Sender<Outbound>, close: mpsc::Sender<u16>) -> Self {
        Self { events, close }
    }

    fn send_event(&self, event: Event) -> Result<(), SinkError> {
        self.events
            .try_send(Outbound::Event(event))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SinkError::Full,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            })
    }

    fn shut(&self, code: u16) {
        self.close.try_send(code).ok();
    }
}

/// Inbox messages; the only way to touch a document.
pub(crate) enum EngineMsg {
    Attach {
        conn: ConnectionId,
        user: Member,
        sink: SessionSink,
        reply: oneshot::Sender<u64>,
    },
    Resume {
        conn: ConnectionId,
        sink: SessionSink,
        reply: oneshot::Sender<Result<(), EditError>>,
    },
    Suspend {
        conn: ConnectionId,
    },
    Detach {
        conn: ConnectionId,
    },
    Edit {
        conn: ConnectionId,
        op: Operation,
        reply: oneshot::Sender<Result<u64, EditError>>,
    },
    Presence {
        conn: ConnectionId,
        update: PresenceUpdate,
    },
    Sync {
        conn: ConnectionId,
        have_version: u64,
        reply: oneshot::Sender<Result<SyncData, EditError>>,
    },
    RemoteApplied {
        applied: AppliedOp,
    },
    Inspect {
        reply: oneshot::Sender<(String, u64, usize)>,
    },
}

/// Cheap cloneable handle to a running engine.
#[derive(Clone, Debug)]
pub(crate) struct EngineHandle {
    id: Identifier,
    tx: mpsc::Sender<EngineMsg>,
}

impl EngineHandle {
    pub(crate) fn id(&self) -> &Identifier {
        &self.id
    }

    /// Whether the engine task has terminated.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, msg: EngineMsg) -> Result<(), EditError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| EditError::UnknownDocument)
    }

    pub(crate) async fn attach(
        &self,
        conn: ConnectionId,
        user: Member,
        sink: SessionSink,
    ) -> Result<u64, EditError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMsg::Attach {
            conn,
            user,
            sink,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EditError::UnknownDocument)
    }

    pub(crate) async fn resume(
        &self,
        conn: ConnectionId,
        sink: SessionSink,
    ) -> Result<(), EditError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMsg::Resume { conn, sink, reply }).await?;
        rx.await.map_err(|_| EditError::UnknownDocument)?
    }

    pub(crate) async fn suspend(&self, conn: ConnectionId) {
        self.send(EngineMsg::Suspend { conn }).await.ok();
    }

    pub(crate) async fn detach(&self, conn: ConnectionId) {
        self.send(EngineMsg::Detach { conn }).await.ok();
    }

    pub(crate) async fn edit(
        &self,
        conn: ConnectionId,
        op: Operation,
    ) -> Result<u64, EditError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMsg::Edit { conn, op, reply }).await?;
        rx.await.map_err(|_| EditError::UnknownDocument)?
    }

    pub(crate) async fn presence(&self, conn: ConnectionId, update: PresenceUpdate) {
        self.send(EngineMsg::Presence { conn, update }).await.ok();
    }

    pub(crate) async fn sync(
        &self,
        conn: ConnectionId,
        have_version: u64,
    ) -> Result<SyncData, EditError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMsg::Sync {
            conn,
            have_version,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EditError::UnknownDocument)?
    }

    /// Current content, version and attached-session count.
    pub(crate) async fn inspect(&self) -> Option<(String, u64, usize)> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineMsg::Inspect { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Spawn the engine for `id` and its bus forwarder. The engine loads its
/// snapshot, serves its inbox until the drain grace expires with no
/// sessions attached (or the server shuts down), then runs a final
/// autosave and removes itself from `registry`.
pub(crate) fn spawn(
    id: Identifier,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn FanoutBus>,
    config: EngineConfig,
    registry: Arc<DashMap<Identifier, EngineHandle>>,
    tracker: &TaskTracker,
    shutdown: CancellationToken,
) -> EngineHandle {
    let (tx, inbox) = mpsc::channel(256);
    let handle = EngineHandle { id: id.clone(), tx };

    let stopped = CancellationToken::new();
    tracker.spawn(forward_bus(
        Arc::clone(&bus),
        id.clone(),
        handle.tx.clone(),
        stopped.clone(),
    ));

    let spool_cancel = CancellationToken::new();
    let engine = Engine {
        id,
        config,
        store: Arc::clone(&store),
        bus,
        spool: Spooler::start(store, spool_cancel.clone(), tracker),
        content: String::new(),
        version: 0,
        meta: Default::default(),
        log: VecDeque::new(),
        client_versions: HashMap::new(),
        peers: HashMap::new(),
        drain_at: None,
        last_saved: 0,
        last_timestamp: 0,
    };
    tracker.spawn(engine.run(
        inbox,
        handle.clone(),
        registry,
        shutdown,
        stopped,
        spool_cancel,
    ));
    handle
}

/// Mirrors the document's bus topic into the engine inbox as pre-versioned
/// operations.
async fn forward_bus(
    bus: Arc<dyn FanoutBus>,
    id: Identifier,
    tx: mpsc::Sender<EngineMsg>,
    stopped: CancellationToken,
) {
    let mut sub = bus.subscribe(&id);
    loop {
        let payload = tokio::select! {
            _ = stopped.cancelled() => break,
            payload = sub.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        match BusMessage::decode(&payload) {
            Ok(BusMessage::Applied {
                document,
                version,
                op,
            }) if document == id => {
                let applied = AppliedOp { version, op };
                if tx.send(EngineMsg::RemoteApplied { applied }).await.is_err() {
                    break;
                }
            }
            // Presence mirrors are consumed by peer-node gateways, not by
            // the authoritative engine.
            Ok(_) => {}
            Err(err) => warn!(%id, %err, "undecodable bus payload"),
        }
    }
}

struct Peer {
    client_id: String,
    user: Member,
    presence: PresenceEntry,
    /// `None` while the session is disconnected inside the reconnect grace.
    sink: Option<SessionSink>,
}

struct Engine {
    id: Identifier,
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn FanoutBus>,
    spool: Spooler,
    content: String,
    version: u64,
    meta: crate::store::DocumentMeta,
    log: VecDeque<AppliedOp>,
    client_versions: HashMap<String, u64>,
    peers: HashMap<ConnectionId, Peer>,
    /// Set while no sessions are attached; the engine terminates when it
    /// passes.
    drain_at: Option<Instant>,
    last_saved: u64,
    last_timestamp: i64,
}

enum Flow {
    Continue,
    Stop,
}

impl Engine {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<EngineMsg>,
        own: EngineHandle,
        registry: Arc<DashMap<Identifier, EngineHandle>>,
        shutdown: CancellationToken,
        stopped: CancellationToken,
        spool_cancel: CancellationToken,
    ) {
        // Loading: inbound messages buffer in the inbox until this resolves.
        match self.store.load_document(&self.id).await {
            Ok(doc) => {
                self.version = doc.meta.version;
                self.last_saved = doc.meta.version;
                self.content = doc.content;
                self.meta = doc.meta;
            }
            Err(crate::store::StoreError::NotFound) => {}
            Err(err) => {
                warn!(id = %self.id, %err, "snapshot load failed; starting empty");
            }
        }
        info!(id = %self.id, version = self.version, "document engine ready");

        // An engine that never sees an attach drains away on its own.
        self.drain_at = Some(Instant::now() + self.config.drain_grace);

        let mut autosave = time::interval_at(
            Instant::now() + self.config.autosave_interval,
            self.config.autosave_interval,
        );
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);

        loop {
            let drain_at = self.drain_at.unwrap_or(far_future);
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        if let Flow::Stop = self.handle(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = autosave.tick() => self.autosave(),
                _ = time::sleep_until(drain_at) => {
                    if self.peers.is_empty() {
                        info!(id = %self.id, "drain grace expired");
                        break;
                    }
                    self.drain_at = None;
                }
                _ = shutdown.cancelled() => {
                    self.close_all(close::SERVER_SHUTDOWN);
                    break;
                }
            }
        }

        // Terminated: flush the latest content before releasing the id.
        if self.version > self.last_saved {
            self.meta.version = self.version;
            let document = PersistedDocument {
                content: std::mem::take(&mut self.content),
                meta: self.meta.clone(),
            };
            if let Err(err) = self.store.save_document(&self.id, &document).await {
                error!(id = %self.id, version = self.version, %err, "final autosave failed");
            }
        }
        spool_cancel.cancel();
        stopped.cancel();
        registry.remove_if(&self.id, |_, h| h.tx.same_channel(&own.tx));
        info!(id = %self.id, version = self.version, "document engine terminated");
    }

    fn handle(&mut self, msg: EngineMsg) -> Flow {
        match msg {
            EngineMsg::Attach {
                conn,
                user,
                sink,
                reply,
            } => {
                self.drain_at = None;
                let client_id = conn.to_string();
                self.client_versions.insert(client_id.clone(), self.version);
                self.peers.insert(
                    conn,
                    Peer {
                        client_id,
                        user: user.clone(),
                        presence: PresenceEntry::default(),
                        sink: Some(sink),
                    },
                );
                info!(id = %self.id, conn, user = %user.user_id, "session attached");
                let snapshot = Event::Snapshot {
                    content: self.content.clone(),
                    version: self.version,
                    members: self.members(),
                };
                self.send_to(conn, snapshot);
                reply.send(self.version).ok();
                self.broadcast_except(conn, Event::UserJoined { user: user.clone() });
                self.publish_presence(&user, Some(PresenceEntry::default()));
            }
            EngineMsg::Resume { conn, sink, reply } => {
                let result = match self.peers.get_mut(&conn) {
                    Some(peer) => {
                        debug!(id = %self.id, conn, "session resumed");
                        peer.sink = Some(sink);
                        Ok(())
                    }
                    None => Err(EditError::UnknownDocument),
                };
                reply.send(result).ok();
            }
            EngineMsg::Suspend { conn } => {
                if let Some(peer) = self.peers.get_mut(&conn) {
                    debug!(id = %self.id, conn, "session suspended");
                    peer.sink = None;
                }
            }
            EngineMsg::Detach { conn } => self.detach(conn),
            EngineMsg::Edit { conn, op, reply } => match self.admit(conn, op) {
                Ok(applied) => {
                    reply.send(Ok(applied.version)).ok();
                    self.broadcast_except(
                        conn,
                        Event::Applied {
                            op: applied.op.clone(),
                            version: applied.version,
                        },
                    );
                    self.bus.publish(
                        &self.id,
                        BusMessage::Applied {
                            document: self.id.clone(),
                            version: applied.version,
                            op: applied.op.clone(),
                        }
                        .encode(),
                    );
                    let author = self
                        .peers
                        .get(&conn)
                        .map(|p| p.user.user_id.clone())
                        .unwrap_or_default();
                    self.spool.submit(PersistJob::Append {
                        id: self.id.clone(),
                        record: VersionRecord {
                            version: applied.version,
                            created_at: applied.op.timestamp,
                            op: applied.op,
                            author,
                        },
                    });
                }
                Err(err) => {
                    debug!(id = %self.id, conn, %err, "edit rejected");
                    reply.send(Err(err)).ok();
                }
            },
            EngineMsg::Presence { conn, update } => {
                let Some(peer) = self.peers.get_mut(&conn) else {
                    return Flow::Continue;
                };
                if peer.presence.apply(update, now_ms()) {
                    let user = peer.user.clone();
                    let entry = peer.presence.clone();
                    let members = self.members();
                    self.broadcast_except(conn, Event::PresenceUpdate { members });
                    self.publish_presence(&user, Some(entry));
                }
            }
            EngineMsg::Sync {
                conn,
                have_version,
                reply,
            } => {
                let result = self.sync_reply(conn, have_version);
                reply.send(result).ok();
            }
            EngineMsg::RemoteApplied { applied } => return self.remote_applied(applied),
            EngineMsg::Inspect { reply } => {
                reply
                    .send((self.content.clone(), self.version, self.peers.len()))
                    .ok();
            }
        }
        Flow::Continue
    }

    /// Steps 1-7 of edit admission: version checks, rebase against the log,
    /// bounds validation, apply, version assignment and log bookkeeping.
    fn admit(&mut self, conn: ConnectionId, mut op: Operation) -> Result<AppliedOp, EditError> {
        let Some(peer) = self.peers.get(&conn) else {
            return Err(EditError::UnknownDocument);
        };
        // The authoring client cannot be trusted to label itself.
        op.client_id = peer.client_id.clone();

        if op.base_version > self.version {
            return Err(EditError::FutureVersion {
                base: op.base_version,
                current: self.version,
            });
        }
        if op.base_version < self.version {
            let oldest = self
                .log
                .front()
                .map(|e| e.version)
                .unwrap_or(self.version + 1);
            if op.base_version + 1 < oldest {
                return Err(EditError::TooStale {
                    base: op.base_version,
                    oldest,
                });
            }
            for logged in &self.log {
                if logged.version <= op.base_version {
                    continue;
                }
                let (_, rebased) = ot::transform(&logged.op, &op);
                op = rebased;
            }
        }

        let content = ot::apply(&self.content, &op)?;
        if ot::char_len(&content) > self.config.max_content_len {
            return Err(EditError::OutOfRange);
        }

        self.version += 1;
        op.timestamp = self.next_timestamp();
        self.content = content;
        let applied = AppliedOp {
            version: self.version,
            op,
        };
        self.log.push_back(applied.clone());
        self.client_versions
            .insert(applied.op.client_id.clone(), self.version);
        self.prune_log();
        Ok(applied)
    }

    fn remote_applied(&mut self, applied: AppliedOp) -> Flow {
        if applied.version <= self.version {
            return Flow::Continue; // at-least-once replay, or our own publish
        }
        if applied.version != self.version + 1 {
            warn!(
                id = %self.id,
                version = self.version,
                remote = applied.version,
                "version gap on bus; dropping (clients resync)"
            );
            return Flow::Continue;
        }
        match ot::apply(&self.content, &applied.op) {
            Ok(content) => {
                self.content = content;
                self.version = applied.version;
                self.log.push_back(applied.clone());
                self.prune_log();
                self.broadcast(Event::Applied {
                    op: applied.op,
                    version: applied.version,
                });
                Flow::Continue
            }
            Err(err) => {
                // The version was assigned by an authoritative engine, so a
                // failed apply means divergent state. Terminate and reload.
                error!(
                    id = %self.id,
                    version = self.version,
                    remote = applied.version,
                    op = ?applied.op,
                    %err,
                    "pre-versioned operation failed to apply; terminating engine"
                );
                self.close_all(close::SERVER_SHUTDOWN);
                Flow::Stop
            }
        }
    }

    fn sync_reply(&mut self, conn: ConnectionId, have: u64) -> Result<SyncData, EditError> {
        let Some(peer) = self.peers.get(&conn) else {
            return Err(EditError::UnknownDocument);
        };
        let client_id = peer.client_id.clone();
        let oldest = self
            .log
            .front()
            .map(|e| e.version)
            .unwrap_or(self.version + 1);
        if have < self.version && have + 1 < oldest {
            // Pruned past the client; it has to rebase from a snapshot.
            self.client_versions.insert(client_id, self.version);
            return Ok(SyncData::Snapshot {
                content: self.content.clone(),
                version: self.version,
            });
        }
        let operations: Vec<AppliedOp> = self
            .log
            .iter()
            .filter(|e| e.version > have)
            .cloned()
            .collect();
        self.client_versions.insert(client_id, self.version);
        self.prune_log();
        Ok(SyncData::Operations { operations })
    }

    fn detach(&mut self, conn: ConnectionId) {
        let Some(peer) = self.peers.remove(&conn) else {
            return;
        };
        self.client_versions.remove(&peer.client_id);
        info!(id = %self.id, conn, user = %peer.user.user_id, "session detached");
        self.broadcast_except(
            conn,
            Event::UserLeft {
                user_id: peer.user.user_id.clone(),
            },
        );
        self.publish_presence(&peer.user, None);
        self.after_peer_removed();
    }

    /// Disconnect a session the engine cannot keep up with; membership is
    /// dropped and the client is expected to reconnect and re-sync.
    fn force_disconnect(&mut self, conn: ConnectionId, code: Option<u16>) {
        let Some(peer) = self.peers.remove(&conn) else {
            return;
        };
        self.client_versions.remove(&peer.client_id);
        if let (Some(sink), Some(code)) = (&peer.sink, code) {
            warn!(id = %self.id, conn, code, "outbound queue overflow; disconnecting session");
            sink.shut(code);
        }
        self.broadcast_except(
            conn,
            Event::UserLeft {
                user_id: peer.user.user_id.clone(),
            },
        );
        self.publish_presence(&peer.user, None);
        self.after_peer_removed();
    }

    fn after_peer_removed(&mut self) {
        if self.peers.is_empty() {
            info!(id = %self.id, "last session detached; draining");
            self.drain_at = Some(Instant::now() + self.config.drain_grace);
        }
    }

    fn broadcast(&mut self, event: Event) {
        self.fan_out(None, event);
    }

    fn broadcast_except(&mut self, skip: ConnectionId, event: Event) {
        self.fan_out(Some(skip), event);
    }

    fn fan_out(&mut self, skip: Option<ConnectionId>, event: Event) {
        let mut dropped = Vec::new();
        for (&conn, peer) in &self.peers {
            if Some(conn) == skip {
                continue;
            }
            let Some(sink) = &peer.sink else {
                continue; // suspended; it will re-sync on resume
            };
            if let Err(err) = sink.send_event(event.clone()) {
                let code = match err {
                    SinkError::Full => Some(close::BACKPRESSURE),
                    SinkError::Closed => None,
                };
                dropped.push((conn, code));
            }
        }
        for (conn, code) in dropped {
            self.force_disconnect(conn, code);
        }
    }

    fn send_to(&mut self, conn: ConnectionId, event: Event) {
        let Some(sink) = self.peers.get(&conn).and_then(|p| p.sink.as_ref()) else {
            return;
        };
        if let Err(err) = sink.send_event(event) {
            let code = match err {
                SinkError::Full => Some(close::BACKPRESSURE),
                SinkError::Closed => None,
            };
            self.force_disconnect(conn, code);
        }
    }

    fn publish_presence(&self, user: &Member, entry: Option<PresenceEntry>) {
        self.bus.publish(
            &self.id,
            BusMessage::Presence {
                document: self.id.clone(),
                user: user.clone(),
                entry,
            }
            .encode(),
        );
    }

    fn members(&self) -> Vec<MemberPresence> {
        self.peers
            .values()
            .map(|peer| MemberPresence {
                user: peer.user.clone(),
                presence: peer.presence.clone(),
            })
            .collect()
    }

    /// Evict the oldest log entries, keeping at least `log_limit` and never
    /// dropping an entry an attached client still needs.
    fn prune_log(&mut self) {
        let floor = self.min_acked();
        while self.log.len() > self.config.log_limit
            && self.log.front().is_some_and(|e| e.version <= floor)
        {
            self.log.pop_front();
        }
    }

    /// Lowest acknowledged version across attached clients, or the current
    /// version when nobody is attached.
    fn min_acked(&self) -> u64 {
        self.peers
            .values()
            .filter_map(|p| self.client_versions.get(&p.client_id))
            .copied()
            .min()
            .unwrap_or(self.version)
    }

    /// Strictly increasing acceptance timestamp.
    fn next_timestamp(&mut self) -> i64 {
        self.last_timestamp = now_ms().max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn autosave(&mut self) {
        if self.version <= self.last_saved {
            return;
        }
        self.meta.version = self.version;
        debug!(id = %self.id, version = self.version, "autosave");
        self.spool.submit(PersistJob::Save {
            id: self.id.clone(),
            document: PersistedDocument {
                content: self.content.clone(),
                meta: self.meta.clone(),
            },
        });
        self.last_saved = self.version;
    }

    fn close_all(&mut self, code: u16) {
        for peer in self.peers.values() {
            if let Some(sink) = &peer.sink {
                sink.shut(code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::protocol::Color;
    use crate::store::FileStore;

    fn member(name: &str) -> Member {
        Member {
            user_id: name.to_owned(),
            name: name.to_owned(),
            color: Color::random(),
        }
    }

    fn sink(capacity: usize) -> (SessionSink, mpsc::Receiver<Outbound>, mpsc::Receiver<u16>) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = mpsc::channel(1);
        (SessionSink::new(events_tx, close_tx), events_rx, close_rx)
    }

    async fn start(
        config: EngineConfig,
    ) -> (
        EngineHandle,
        Arc<DashMap<Identifier, EngineHandle>>,
        TaskTracker,
    ) {
        let id: Identifier = "doc".parse().unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(FileStore::temporary().await.unwrap());
        let bus: Arc<dyn FanoutBus> = Arc::new(LocalBus::new());
        let registry = Arc::new(DashMap::new());
        let tracker = TaskTracker::new();
        let handle = spawn(
            id.clone(),
            store,
            bus,
            config,
            Arc::clone(&registry),
            &tracker,
            CancellationToken::new(),
        );
        registry.insert(id, handle.clone());
        (handle, registry, tracker)
    }

    fn insert(pos: usize, text: &str, base: u64) -> Operation {
        Operation::insert(pos, text, base)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> Event {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
        {
            Outbound::Event(event) => event,
            other => panic!("unexpected outbound frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn versions_are_gap_free_and_content_converges() {
        let (engine, _registry, _tracker) = start(EngineConfig::default()).await;
        let (sink_a, mut rx_a, _close_a) = sink(64);
        let (sink_b, mut rx_b, _close_b) = sink(64);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        engine.attach(2, member("bob"), sink_b).await.unwrap();
        assert!(matches!(next_event(&mut rx_a).await, Event::Snapshot { .. }));
        assert!(matches!(next_event(&mut rx_b).await, Event::Snapshot { .. }));

        let v1 = engine.edit(1, insert(0, "A", 0)).await.unwrap();
        // Bob edits against version 0 without having seen Alice's insert.
        let v2 = engine.edit(2, insert(0, "B", 0)).await.unwrap();
        assert_eq!((v1, v2), (1, 2));

        let (content, version, peers) = engine.inspect().await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(peers, 2);
        // Client id "1" sorts before "2", so Alice's insert stays first.
        assert_eq!(content, "AB");
    }

    #[tokio::test]
    async fn future_version_is_rejected() {
        let (engine, _registry, _tracker) = start(EngineConfig::default()).await;
        let (sink_a, _rx_a, _close_a) = sink(8);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        let err = engine.edit(1, insert(0, "A", 5)).await.unwrap_err();
        assert_eq!(
            err,
            EditError::FutureVersion {
                base: 5,
                current: 0
            }
        );
    }

    #[tokio::test]
    async fn pruned_log_turns_old_bases_stale() {
        let config = EngineConfig {
            log_limit: 4,
            ..Default::default()
        };
        let (engine, _registry, _tracker) = start(config).await;
        let (sink_a, _rx_a, _close_a) = sink(64);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        for i in 0..10u64 {
            engine.edit(1, insert(0, "x", i)).await.unwrap();
        }
        // Alice has acknowledged version 10, so the log kept only the tail.
        let (sink_b, mut rx_b, _close_b) = sink(64);
        engine.attach(2, member("bob"), sink_b).await.unwrap();
        let Event::Snapshot { version, .. } = next_event(&mut rx_b).await else {
            panic!("expected snapshot");
        };
        assert_eq!(version, 10);

        let err = engine.edit(2, insert(0, "y", 3)).await.unwrap_err();
        assert!(matches!(err, EditError::TooStale { base: 3, .. }));

        // The documented recovery: sync, rebase, resubmit.
        let SyncData::Snapshot { version, .. } = engine.sync(2, 3).await.unwrap() else {
            panic!("expected snapshot sync");
        };
        assert_eq!(version, 10);
        assert_eq!(engine.edit(2, insert(0, "y", 10)).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn sync_returns_missing_suffix() {
        let (engine, _registry, _tracker) = start(EngineConfig::default()).await;
        let (sink_a, _rx_a, _close_a) = sink(64);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        for i in 0..5u64 {
            engine.edit(1, insert(0, "x", i)).await.unwrap();
        }
        let SyncData::Operations { operations } = engine.sync(1, 2).await.unwrap() else {
            panic!("expected log suffix");
        };
        assert_eq!(
            operations.iter().map(|a| a.version).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
    }

    #[tokio::test]
    async fn slow_session_is_disconnected_with_backpressure() {
        let config = EngineConfig::default();
        let (engine, _registry, _tracker) = start(config).await;
        // Bob's queue holds the snapshot and a single event, and he never
        // drains it.
        let (sink_b, _rx_b, mut close_b) = sink(2);
        let (sink_a, mut rx_a, _close_a) = sink(64);
        engine.attach(2, member("bob"), sink_b).await.unwrap();
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        assert!(matches!(next_event(&mut rx_a).await, Event::Snapshot { .. }));

        let mut acked = Vec::new();
        for i in 0..4u64 {
            acked.push(engine.edit(1, insert(0, "x", i)).await.unwrap());
        }
        // Alice keeps an unbroken version stream.
        assert_eq!(acked, vec![1, 2, 3, 4]);
        assert_eq!(close_b.recv().await, Some(close::BACKPRESSURE));
        let (_, _, peers) = engine.inspect().await.unwrap();
        assert_eq!(peers, 1);
    }

    #[tokio::test]
    async fn identical_presence_updates_broadcast_once() {
        let (engine, _registry, _tracker) = start(EngineConfig::default()).await;
        let (sink_a, _rx_a, _close_a) = sink(64);
        let (sink_b, mut rx_b, _close_b) = sink(64);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        engine.attach(2, member("bob"), sink_b).await.unwrap();
        assert!(matches!(next_event(&mut rx_b).await, Event::Snapshot { .. }));

        let pos = crate::presence::CursorPos { line: 1, column: 2 };
        engine.presence(1, PresenceUpdate::Cursor(pos)).await;
        engine.presence(1, PresenceUpdate::Cursor(pos)).await;
        engine.presence(1, PresenceUpdate::Typing(true)).await;

        let Event::PresenceUpdate { members } = next_event(&mut rx_b).await else {
            panic!("expected presence update");
        };
        let alice = members.iter().find(|m| m.user.user_id == "alice").unwrap();
        assert_eq!(alice.presence.cursor, Some(pos));
        assert!(!alice.presence.is_typing);
        // The duplicate cursor move produced nothing; the next frame is the
        // typing change.
        let Event::PresenceUpdate { members } = next_event(&mut rx_b).await else {
            panic!("expected presence update");
        };
        let alice = members.iter().find(|m| m.user.user_id == "alice").unwrap();
        assert!(alice.presence.is_typing);
    }

    #[tokio::test]
    async fn engine_drains_after_last_detach() {
        let config = EngineConfig {
            drain_grace: Duration::from_millis(50),
            ..Default::default()
        };
        let (engine, registry, tracker) = start(config).await;
        let (sink_a, _rx_a, _close_a) = sink(8);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        engine.edit(1, insert(0, "keep", 0)).await.unwrap();
        engine.detach(1).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !engine.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine did not terminate");
        tracker.close();
        tracker.wait().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reattach_within_grace_cancels_draining() {
        let config = EngineConfig {
            drain_grace: Duration::from_millis(200),
            ..Default::default()
        };
        let (engine, _registry, _tracker) = start(config).await;
        let (sink_a, _rx_a, _close_a) = sink(8);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        engine.edit(1, insert(0, "z", 0)).await.unwrap();
        engine.detach(1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (sink_b, _rx_b, _close_b) = sink(8);
        engine.attach(2, member("bob"), sink_b).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!engine.is_closed());
        let (content, version, _) = engine.inspect().await.unwrap();
        assert_eq!((content.as_str(), version), ("z", 1));
    }

    #[tokio::test]
    async fn bus_replays_are_deduplicated() {
        let (engine, _registry, _tracker) = start(EngineConfig::default()).await;
        let (sink_a, _rx_a, _close_a) = sink(64);
        engine.attach(1, member("alice"), sink_a).await.unwrap();
        engine.edit(1, insert(0, "A", 0)).await.unwrap();

        // Replay of version 1 must be ignored; version 2 applies verbatim.
        let replay = AppliedOp {
            version: 1,
            op: Operation::insert(0, "A", 0).by("1"),
        };
        engine
            .send(EngineMsg::RemoteApplied { applied: replay })
            .await
            .unwrap();
        let next = AppliedOp {
            version: 2,
            op: Operation::insert(1, "B", 1).by("peer"),
        };
        engine
            .send(EngineMsg::RemoteApplied { applied: next })
            .await
            .unwrap();

        let (content, version, _) = engine.inspect().await.unwrap();
        assert_eq!((content.as_str(), version), ("AB", 2));
    }
}
