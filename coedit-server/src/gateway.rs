//! Session gateway: the websocket edge of the engine.
//!
//! Each connection gets a reader task (this module's main loop) that parses
//! frames and forwards them to the right document engine, and a writer task
//! that drains a bounded outbound queue, coalescing presence bursts. The
//! gateway never reorders a client's operations: each request is forwarded
//! and answered before the next frame is read.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::engine::{ConnectionId, EngineHandle, SessionSink};
use crate::ot::EditError;
use crate::presence::PresenceUpdate;
use crate::protocol::{
    ErrorCode, Event, Member, Outbound, Request, RequestFrame, ResponseFrame, WireError, close,
};
use crate::{Identifier, ServerState};

/// Handshake parameters. Browsers cannot set headers on websocket
/// upgrades, so the bearer token rides the query string; non-browser
/// clients may use the `Authorization` header instead.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ConnectParams {
    token: Option<String>,
    document: Option<Identifier>,
    /// Prior connection id, to resume within the reconnect grace window.
    resume: Option<ConnectionId>,
}

/// A session retained after its socket dropped, waiting for a reconnect.
#[derive(Debug)]
pub(crate) struct DetachedSession {
    pub(crate) user_id: String,
    pub(crate) engine: EngineHandle,
    pub(crate) expires_at: Instant,
}

/// Handler for the `/api/socket` endpoint.
pub(crate) async fn socket_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ConnectParams>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params
        .token
        .clone()
        .or_else(|| bearer.map(|TypedHeader(auth)| auth.token().to_owned()));
    ws.on_upgrade(move |socket| serve(state, socket, params, token))
}

async fn serve(
    state: Arc<ServerState>,
    mut socket: WebSocket,
    params: ConnectParams,
    token: Option<String>,
) {
    let principal = match state.auth().verify(token.as_deref().unwrap_or("")).await {
        Ok(principal) => principal,
        Err(err) => {
            info!(%err, "closing unauthenticated connection");
            let frame = CloseFrame {
                code: close::UNAUTHORIZED,
                reason: err.to_string().into(),
            };
            socket.send(Message::Close(Some(frame))).await.ok();
            return;
        }
    };
    let member = Member {
        color: state.color_for(&principal.user_id),
        user_id: principal.user_id,
        name: principal.name,
    };

    let capacity = state.config().engine.outbound_capacity;
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = mpsc::channel(1);

    // A reconnect inside the grace window takes back its old id and its
    // engine membership; everything else gets a fresh identity.
    let mut resumed = None;
    let conn = match params.resume {
        Some(prior) => match state.take_detached(prior, &member.user_id) {
            Some(detached) => {
                let sink = SessionSink::new(outbound_tx.clone(), close_tx.clone());
                match detached.engine.resume(prior, sink).await {
                    Ok(()) => {
                        info!(conn = prior, user = %member.user_id, "session resumed");
                        resumed = Some(detached.engine);
                    }
                    Err(_) => debug!(conn = prior, "resume target gone; continuing fresh"),
                }
                prior
            }
            None => state.next_connection(),
        },
        None => state.next_connection(),
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, close_rx));

    outbound_tx
        .try_send(Outbound::Event(Event::Identity {
            connection_id: conn,
            user: member.clone(),
        }))
        .ok();

    let mut session = Session {
        conn,
        member,
        attached: resumed,
        limiter: RateLimiter::new(state.config().engine.op_rate, state.config().engine.op_burst),
        outbound: outbound_tx,
        close_tx,
        state: Arc::clone(&state),
    };

    // Handshake attach, when a document was named up front.
    if session.attached.is_none() && let Some(document) = params.document.clone() {
        if let Err(err) = session.join(document).await {
            session.push(Outbound::Event(Event::Error {
                code: err.code(),
                message: err.to_string(),
            }));
        }
    }

    let idle = state.config().engine.idle_timeout;
    let mut deadline = Instant::now() + idle;
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                deadline = Instant::now() + idle;
                match msg {
                    Message::Text(text) => match serde_json::from_str::<RequestFrame>(&text) {
                        Ok(frame) => {
                            if !session.handle(frame).await {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(conn, %err, "malformed frame; closing session");
                            session.push(Outbound::Event(Event::Error {
                                code: ErrorCode::Internal,
                                message: "malformed frame".into(),
                            }));
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    // Pings are answered by the websocket layer; anything
                    // else just proves liveness.
                    _ => {}
                }
            }
            _ = sleep_until(deadline) => {
                info!(conn, "idle timeout");
                session.close_tx.try_send(close::IDLE_TIMEOUT).ok();
                break;
            }
        }
    }

    // Keep the membership warm for a reconnect; the grace sweeper turns it
    // into a real detach if none arrives.
    if let Some(engine) = session.attached.take() {
        engine.suspend(conn).await;
        state.register_detached(conn, session.member.user_id.clone(), engine);
    }
    drop(session);
    writer.await.ok();
    debug!(conn, "connection closed");
}

struct Session {
    conn: ConnectionId,
    member: Member,
    attached: Option<EngineHandle>,
    limiter: RateLimiter,
    outbound: mpsc::Sender<Outbound>,
    close_tx: mpsc::Sender<u16>,
    state: Arc<ServerState>,
}

impl Session {
    /// Dispatch one request frame. Returns `false` when the session must
    /// end.
    async fn handle(&mut self, frame: RequestFrame) -> bool {
        let kind = frame.request.kind();
        let rid = frame.request_id;
        let response = match frame.request {
            Request::Ping => ResponseFrame::ok(kind, rid, json!("pong")),
            Request::DocumentJoin { document_id } => match self.join(document_id).await {
                Ok(version) => ResponseFrame::ok(kind, rid, json!({ "version": version })),
                Err(err) => ResponseFrame::err(kind, rid, WireError::from(&err)),
            },
            Request::DocumentLeave { document_id } => {
                match self.attached.take_if(|e| e.id() == &document_id) {
                    Some(engine) => {
                        engine.detach(self.conn).await;
                        ResponseFrame::ok_empty(kind, rid)
                    }
                    None => ResponseFrame::err(
                        kind,
                        rid,
                        WireError::new(ErrorCode::UnknownDocument, "not attached to that document"),
                    ),
                }
            }
            Request::DocumentOp { op } => match &self.attached {
                None => ResponseFrame::err(
                    kind,
                    rid,
                    WireError::new(ErrorCode::UnknownDocument, "no document attached"),
                ),
                Some(_) if !self.limiter.allow() => ResponseFrame::err(
                    kind,
                    rid,
                    WireError::new(ErrorCode::RateLimited, "operation rate exceeded"),
                ),
                Some(engine) => match engine.edit(self.conn, op).await {
                    Ok(version) => {
                        ResponseFrame::ok(kind, rid, json!({ "assignedVersion": version }))
                    }
                    Err(err) => ResponseFrame::err(kind, rid, WireError::from(&err)),
                },
            },
            Request::DocumentSync { have_version } => match &self.attached {
                None => ResponseFrame::err(
                    kind,
                    rid,
                    WireError::new(ErrorCode::UnknownDocument, "no document attached"),
                ),
                Some(engine) => match engine.sync(self.conn, have_version).await {
                    Ok(data) => ResponseFrame::ok(
                        kind,
                        rid,
                        serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
                    ),
                    Err(err) => ResponseFrame::err(kind, rid, WireError::from(&err)),
                },
            },
            Request::CursorMove { pos } => {
                self.presence(PresenceUpdate::Cursor(pos)).await;
                ResponseFrame::ok_empty(kind, rid)
            }
            Request::SelectionChange { range } => {
                self.presence(PresenceUpdate::Selection(range)).await;
                ResponseFrame::ok_empty(kind, rid)
            }
            Request::UserTyping { typing } => {
                self.presence(PresenceUpdate::Typing(typing)).await;
                ResponseFrame::ok_empty(kind, rid)
            }
        };
        self.push(Outbound::Response(response))
    }

    /// Detach from any prior document and attach to `id`, spawning its
    /// engine if need be. Retries once when racing a terminating engine.
    async fn join(&mut self, id: Identifier) -> Result<u64, EditError> {
        if let Some(prev) = self.attached.take() {
            prev.detach(self.conn).await;
        }
        for _ in 0..2 {
            let engine = self.state.open_document(&id);
            let sink = SessionSink::new(self.outbound.clone(), self.close_tx.clone());
            match engine.attach(self.conn, self.member.clone(), sink).await {
                Ok(version) => {
                    self.attached = Some(engine);
                    return Ok(version);
                }
                Err(EditError::UnknownDocument) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EditError::UnknownDocument)
    }

    async fn presence(&self, update: PresenceUpdate) {
        if let Some(engine) = &self.attached {
            engine.presence(self.conn, update).await;
        }
    }

    /// Enqueue an outbound frame. A full queue means the client cannot keep
    /// up even with its own replies; close with backpressure.
    fn push(&self, frame: Outbound) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close_tx.try_send(close::BACKPRESSURE).ok();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut close_rx: mpsc::Receiver<u16>,
) {
    loop {
        tokio::select! {
            code = close_rx.recv() => {
                let code = code.unwrap_or(1000);
                let frame = CloseFrame {
                    code,
                    reason: close_reason(code).into(),
                };
                ws_tx.send(Message::Close(Some(frame))).await.ok();
                return;
            }
            item = rx.recv() => match item {
                None => {
                    ws_tx.send(Message::Close(None)).await.ok();
                    return;
                }
                Some(first) => {
                    let mut batch = vec![first];
                    while let Ok(next) = rx.try_recv() {
                        batch.push(next);
                    }
                    coalesce_presence(&mut batch);
                    for item in batch {
                        if ws_tx.send(item.into()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Drop every pending `presence.update` but the newest; each carries the
/// full member set, so the last one wins.
fn coalesce_presence(batch: &mut Vec<Outbound>) {
    let is_presence =
        |o: &Outbound| matches!(o, Outbound::Event(Event::PresenceUpdate { .. }));
    let Some(last) = batch.iter().rposition(is_presence) else {
        return;
    };
    let mut index = 0;
    batch.retain(|o| {
        let keep = !is_presence(o) || index == last;
        index += 1;
        keep
    });
}

fn close_reason(code: u16) -> &'static str {
    match code {
        close::UNAUTHORIZED => "unauthorized",
        close::BACKPRESSURE => "outbound queue overflow",
        close::IDLE_TIMEOUT => "idle timeout",
        close::SERVER_SHUTDOWN => "server shutting down",
        _ => "closed",
    }
}

/// Token bucket guarding `document.op` per connection.
struct RateLimiter {
    tokens: f64,
    burst: f64,
    rate: f64,
    refilled: Instant,
}

impl RateLimiter {
    fn new(rate: u32, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            rate: rate as f64,
            refilled: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
