//! Wire protocol for the collaboration channel.
//!
//! Frames are JSON texts over a duplex websocket. Clients send request
//! frames `{type, requestId, payload}`; the server answers with response
//! frames `{type, requestId, ok, data|error}` and pushes event frames
//! `{type, payload}` that carry no request id. Validation of operation
//! shapes happens here at the boundary, not inside the OT core.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::Identifier;
use crate::ot::Operation;
use crate::presence::{CursorPos, PresenceEntry, SelectionRange};

/// Error codes visible to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorCode {
    /// The presented credential could not be resolved to a principal.
    #[error("unauthorized")]
    Unauthorized,
    /// No document with the requested id.
    #[error("unknown document")]
    UnknownDocument,
    /// The operation's base version is ahead of the server.
    #[error("future version")]
    FutureVersion,
    /// The history log no longer reaches the operation's base version.
    #[error("too stale")]
    TooStale,
    /// The operation's range falls outside the document.
    #[error("out of range")]
    OutOfRange,
    /// The session's outbound queue overflowed.
    #[error("backpressure")]
    Backpressure,
    /// The client exceeded the per-connection operation rate.
    #[error("rate limited")]
    RateLimited,
    /// Unexpected server-side failure; the client may retry.
    #[error("internal error")]
    Internal,
}

/// Websocket close codes used by the gateway.
pub mod close {
    /// Credential rejected during the handshake.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Outbound queue overflowed; reconnect and re-sync.
    pub const BACKPRESSURE: u16 = 4008;
    /// No frames received within the idle timeout.
    pub const IDLE_TIMEOUT: u16 = 4000;
    /// The server is shutting down.
    pub const SERVER_SHUTDOWN: u16 = 4503;
}

/// A structured error carried in response frames and error events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable explanation.
    pub message: String,
}

impl WireError {
    /// Build a wire error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&crate::ot::EditError> for WireError {
    fn from(err: &crate::ot::EditError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// An inbound frame: a request id plus the typed request.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    /// Client-chosen correlation id, echoed in the response.
    pub request_id: u64,
    /// The request itself.
    #[serde(flatten)]
    pub request: Request,
}

/// Requests a client may send.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Request {
    /// Detach from any prior document and attach to this one.
    #[serde(rename = "document.join")]
    DocumentJoin {
        /// Document to attach to.
        #[serde(rename = "documentId")]
        document_id: Identifier,
    },
    /// Detach from the named document.
    #[serde(rename = "document.leave")]
    DocumentLeave {
        /// Document to detach from.
        #[serde(rename = "documentId")]
        document_id: Identifier,
    },
    /// Submit an edit operation against the attached document.
    #[serde(rename = "document.op")]
    DocumentOp {
        /// The operation, with its declared base version.
        op: Operation,
    },
    /// Request the log suffix past `haveVersion`, or a snapshot if stale.
    #[serde(rename = "document.sync")]
    DocumentSync {
        /// Highest version the client has applied.
        #[serde(rename = "haveVersion")]
        have_version: u64,
    },
    /// Move the caller's cursor.
    #[serde(rename = "cursor.move")]
    CursorMove {
        /// New cursor position.
        pos: CursorPos,
    },
    /// Change the caller's selection; `None` collapses it.
    #[serde(rename = "selection.change")]
    SelectionChange {
        /// New selection range.
        range: Option<SelectionRange>,
    },
    /// Toggle the caller's typing indicator.
    #[serde(rename = "user.typing")]
    UserTyping {
        /// Whether the user is typing.
        typing: bool,
    },
    /// Heartbeat; refreshes the idle deadline.
    #[serde(rename = "ping")]
    Ping,
}

impl Request {
    /// The frame type string, echoed into the response frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::DocumentJoin { .. } => "document.join",
            Request::DocumentLeave { .. } => "document.leave",
            Request::DocumentOp { .. } => "document.op",
            Request::DocumentSync { .. } => "document.sync",
            Request::CursorMove { .. } => "cursor.move",
            Request::SelectionChange { .. } => "selection.change",
            Request::UserTyping { .. } => "user.typing",
            Request::Ping => "ping",
        }
    }
}

/// A response to one request frame.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// The request's frame type.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Correlation id copied from the request.
    pub request_id: u64,
    /// Whether the request succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure detail when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ResponseFrame {
    /// A successful response carrying `data`.
    pub fn ok(kind: &'static str, request_id: u64, data: serde_json::Value) -> Self {
        Self {
            kind,
            request_id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// A successful response with no payload.
    pub fn ok_empty(kind: &'static str, request_id: u64) -> Self {
        Self {
            kind,
            request_id,
            ok: true,
            data: None,
            error: None,
        }
    }

    /// A failed response carrying `error`.
    pub fn err(kind: &'static str, request_id: u64, error: WireError) -> Self {
        Self {
            kind,
            request_id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// An HSL display color. Hue is drawn at random per principal; saturation
/// and lightness stay in ranges that keep cursors readable on light and
/// dark themes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    /// Hue in degrees, `0..360`.
    pub hue: u16,
    /// Saturation percentage, `70..=95`.
    pub saturation: u8,
    /// Lightness percentage, `50..=70`.
    pub lightness: u8,
}

impl Color {
    /// Draw a fresh display color.
    pub fn random() -> Self {
        Self {
            hue: rand::random_range(0..360),
            saturation: rand::random_range(70..=95),
            lightness: rand::random_range(50..=70),
        }
    }
}

/// A user as co-editors see them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Principal id.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// Display color.
    pub color: Color,
}

/// A member together with their presence, as carried in snapshots and
/// `presence.update` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberPresence {
    /// Who.
    #[serde(flatten)]
    pub user: Member,
    /// Their cursor, selection and typing state.
    #[serde(flatten)]
    pub presence: PresenceEntry,
}

/// An operation with the server version the engine assigned to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOp {
    /// The assigned server version.
    pub version: u64,
    /// The transformed operation as applied.
    pub op: Operation,
}

/// Payload of a successful `document.sync` response: either the log suffix
/// the client is missing, or a full snapshot when the log has been pruned
/// past the client's version.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum SyncData {
    /// Log entries with versions above the client's.
    Operations {
        /// Entries in version order.
        operations: Vec<AppliedOp>,
    },
    /// Authoritative snapshot for a rebase.
    Snapshot {
        /// Full document content.
        content: String,
        /// Version the content is at.
        version: u64,
    },
}

/// Events pushed by the server without a correlating request.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    /// Tells a fresh connection its id and identity; the id is what a
    /// reconnect presents to resume within the grace window.
    #[serde(rename = "session.identity")]
    Identity {
        /// Assigned connection id.
        #[serde(rename = "connectionId")]
        connection_id: u64,
        /// The verified principal as co-editors will see it.
        user: Member,
    },
    /// Authoritative bootstrap state after an attach.
    #[serde(rename = "document.snapshot")]
    Snapshot {
        /// Full document content.
        content: String,
        /// Version the content is at.
        version: u64,
        /// Everyone currently attached.
        members: Vec<MemberPresence>,
    },
    /// An operation was applied; sent to every other attached session.
    #[serde(rename = "document.applied")]
    Applied {
        /// The transformed operation.
        op: Operation,
        /// Its assigned version.
        version: u64,
    },
    /// Presence changed for someone in the room.
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        /// Everyone currently attached, with presence.
        members: Vec<MemberPresence>,
    },
    /// A user attached.
    #[serde(rename = "user.joined")]
    UserJoined {
        /// The new member.
        user: Member,
    },
    /// A user detached.
    #[serde(rename = "user.left")]
    UserLeft {
        /// Principal id of the departed member.
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// An error not tied to a request.
    #[serde(rename = "error")]
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable explanation.
        message: String,
    },
}

/// Everything the writer task can put on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    /// Reply to a request frame.
    Response(ResponseFrame),
    /// Server-initiated event.
    Event(Event),
}

impl From<Outbound> for Message {
    fn from(frame: Outbound) -> Self {
        let serialized = serde_json::to_string(&frame).expect("failed serialize");
        Message::text(serialized)
    }
}
