//! Operational transformation over plain-text character operations.
//!
//! Pure functions with no I/O and no state beyond their arguments. All
//! positions and lengths are measured in Unicode code points, never bytes or
//! UTF-16 units, so indices agree across runtimes.

use serde::{Deserialize, Serialize};

use crate::protocol::ErrorCode;

/// The kind-specific half of an operation, tagged on the wire as
/// `{"kind": "insert" | "delete" | "retain", ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EditKind {
    /// Insert `text` before the character at `position`.
    Insert {
        /// The text to insert.
        text: String,
    },
    /// Remove `length` characters starting at `position`.
    Delete {
        /// Number of characters removed.
        length: usize,
    },
    /// Leave `length` characters untouched; identity on content.
    Retain {
        /// Width of the untouched window.
        length: usize,
    },
}

/// A single text operation together with the metadata the engine needs to
/// order it: the server version its author observed, a stable per-connection
/// client id, and the server acceptance timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Insert, delete or retain, with the kind-specific payload.
    #[serde(flatten)]
    pub kind: EditKind,
    /// Character index the operation acts at, in code points.
    pub position: usize,
    /// The server version the author had applied when producing this.
    pub base_version: u64,
    /// Stable identifier of the authoring connection.
    pub client_id: String,
    /// Milliseconds since the Unix epoch, assigned by the server at
    /// acceptance. Zero until then.
    #[serde(default)]
    pub timestamp: i64,
}

impl Operation {
    /// Construct an insert of `text` at `position`.
    pub fn insert(position: usize, text: impl Into<String>, base_version: u64) -> Self {
        Self {
            kind: EditKind::Insert { text: text.into() },
            position,
            base_version,
            client_id: String::new(),
            timestamp: 0,
        }
    }

    /// Construct a delete of `length` characters at `position`.
    pub fn delete(position: usize, length: usize, base_version: u64) -> Self {
        Self {
            kind: EditKind::Delete { length },
            position,
            base_version,
            client_id: String::new(),
            timestamp: 0,
        }
    }

    /// Construct a retain over `length` characters at `position`.
    pub fn retain(position: usize, length: usize, base_version: u64) -> Self {
        Self {
            kind: EditKind::Retain { length },
            position,
            base_version,
            client_id: String::new(),
            timestamp: 0,
        }
    }

    /// Same operation attributed to `client_id`.
    pub fn by(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Number of characters this operation adds to the document.
    fn inserted_len(&self) -> usize {
        match &self.kind {
            EditKind::Insert { text } => char_len(text),
            _ => 0,
        }
    }

    /// End of the operation's window, exclusive, in code points.
    fn end(&self) -> usize {
        match &self.kind {
            EditKind::Insert { .. } => self.position,
            EditKind::Delete { length } | EditKind::Retain { length } => self.position + length,
        }
    }
}

/// Rejections produced when admitting or applying an operation. These are
/// never fatal to a document; they affect only the submitting client.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    /// The operation's position or range falls outside the current content.
    #[error("operation range is outside the document")]
    OutOfRange,
    /// The declared base version is ahead of the server.
    #[error("base version {base} is ahead of the document version {current}")]
    FutureVersion {
        /// Version the client declared.
        base: u64,
        /// Version the server is at.
        current: u64,
    },
    /// The history log no longer reaches back to the declared base version.
    #[error("history no longer reaches back to version {base}; oldest retained is {oldest}")]
    TooStale {
        /// Version the client declared.
        base: u64,
        /// Oldest version still in the log.
        oldest: u64,
    },
    /// No document with the requested id.
    #[error("unknown document")]
    UnknownDocument,
}

impl EditError {
    /// The wire-level error code for this rejection.
    pub fn code(&self) -> ErrorCode {
        match self {
            EditError::OutOfRange => ErrorCode::OutOfRange,
            EditError::FutureVersion { .. } => ErrorCode::FutureVersion,
            EditError::TooStale { .. } => ErrorCode::TooStale,
            EditError::UnknownDocument => ErrorCode::UnknownDocument,
        }
    }
}

/// Length of `s` in code points.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the code point at index `cp`, or `s.len()` when `cp`
/// equals the code-point length. `None` when out of bounds.
fn byte_index(s: &str, cp: usize) -> Option<usize> {
    if cp == 0 {
        return Some(0);
    }
    s.char_indices()
        .nth(cp - 1)
        .map(|(idx, c)| idx + c.len_utf8())
}

/// Apply `op` to `content`, producing the new content.
///
/// Total for any operation whose position and length lie inside the
/// pre-apply content; out-of-bounds operations are rejected, not clamped.
pub fn apply(content: &str, op: &Operation) -> Result<String, EditError> {
    let len = char_len(content);
    match &op.kind {
        EditKind::Insert { text } => {
            if op.position > len {
                return Err(EditError::OutOfRange);
            }
            let at = byte_index(content, op.position).ok_or(EditError::OutOfRange)?;
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            Ok(out)
        }
        EditKind::Delete { length } => {
            if op.position + length > len {
                return Err(EditError::OutOfRange);
            }
            let start = byte_index(content, op.position).ok_or(EditError::OutOfRange)?;
            let end = byte_index(content, op.position + length).ok_or(EditError::OutOfRange)?;
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
        EditKind::Retain { length } => {
            if op.position + length > len {
                return Err(EditError::OutOfRange);
            }
            Ok(content.to_owned())
        }
    }
}

/// Inclusion transformation of the concurrent pair `(a, b)`, both defined on
/// the same document. Returns `(a', b')` such that applying `a` then `b'`
/// yields the same content as applying `b` then `a'`.
///
/// Deterministic in its inputs alone: concurrent inserts at the same
/// position are ordered by lexicographic comparison of their client ids,
/// never by wall-clock time, and the two inserted strings are never
/// interleaved. An insert that lands strictly inside a concurrent delete's
/// range is absorbed: it collapses to an empty insert at the delete's
/// position while the delete widens to cover the inserted text, so both
/// application orders converge on the delete's outcome.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let mut ap = a.clone();
    let mut bp = b.clone();
    match (&a.kind, &b.kind) {
        (EditKind::Insert { .. }, EditKind::Insert { .. }) => {
            let a_first = match a.position.cmp(&b.position) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                std::cmp::Ordering::Equal => a.client_id <= b.client_id,
            };
            if a_first {
                bp.position += a.inserted_len();
            } else {
                ap.position += b.inserted_len();
            }
        }
        (EditKind::Insert { text }, EditKind::Delete { length }) => {
            if a.position <= b.position {
                bp.position += char_len(text);
            } else if a.position >= b.end() {
                ap.position -= length;
            } else {
                ap.kind = EditKind::Insert { text: String::new() };
                ap.position = b.position;
                bp.kind = EditKind::Delete {
                    length: length + char_len(text),
                };
            }
        }
        (EditKind::Delete { length }, EditKind::Insert { text }) => {
            if b.position <= a.position {
                ap.position += char_len(text);
            } else if b.position >= a.end() {
                bp.position -= length;
            } else {
                bp.kind = EditKind::Insert { text: String::new() };
                bp.position = a.position;
                ap.kind = EditKind::Delete {
                    length: length + char_len(text),
                };
            }
        }
        (EditKind::Delete { length: la }, EditKind::Delete { length: lb }) => {
            if a.end() <= b.position {
                bp.position -= la;
            } else if b.end() <= a.position {
                ap.position -= lb;
            } else {
                // Overlapping ranges: the shared overlap is collapsed so that
                // replaying both deletes removes only the union.
                let overlap = a.end().min(b.end()) - a.position.max(b.position);
                ap.kind = EditKind::Delete {
                    length: la - overlap,
                };
                bp.kind = EditKind::Delete {
                    length: lb - overlap,
                };
                if a.position > b.position {
                    ap.position = b.position;
                }
                if b.position > a.position {
                    bp.position = a.position;
                }
            }
        }
        // Retain is transparent: the other side passes through unchanged and
        // the retain window shifts as a zero-net insert or delete would.
        (EditKind::Retain { .. }, EditKind::Insert { text }) => {
            shift_window(&mut ap, b.position, char_len(text));
        }
        (EditKind::Insert { text }, EditKind::Retain { .. }) => {
            shift_window(&mut bp, a.position, char_len(text));
        }
        (EditKind::Retain { .. }, EditKind::Delete { .. }) => {
            shrink_window(&mut ap, b.position, b.end());
        }
        (EditKind::Delete { .. }, EditKind::Retain { .. }) => {
            shrink_window(&mut bp, a.position, a.end());
        }
        (EditKind::Retain { .. }, EditKind::Retain { .. }) => {}
    }
    (ap, bp)
}

/// Adjust a retain window for a concurrent insert of `inserted` characters
/// at `at`.
fn shift_window(op: &mut Operation, at: usize, inserted: usize) {
    let EditKind::Retain { length } = &mut op.kind else {
        return;
    };
    if at <= op.position {
        op.position += inserted;
    } else if at < op.position + *length {
        *length += inserted;
    }
}

/// Adjust a retain window for a concurrent delete of `[from, to)`.
fn shrink_window(op: &mut Operation, from: usize, to: usize) {
    let EditKind::Retain { length } = &mut op.kind else {
        return;
    };
    let end = op.position + *length;
    if to <= op.position {
        op.position -= to - from;
    } else if end > from {
        let overlap = end.min(to) - op.position.max(from);
        *length -= overlap;
        if from < op.position {
            op.position = from;
        }
    }
}

/// Result of [`compose`]: a single equivalent operation when the pair
/// collapses, otherwise the ordered pair unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Composed {
    /// One operation equivalent to applying both inputs in order.
    One(Operation),
    /// The inputs do not collapse; apply them in order.
    Two(Operation, Operation),
}

/// Compose `a` then `b` (where `b` was produced on the document resulting
/// from `a`) into fewer operations. Used for log compaction, not on the hot
/// path. The collapsed operation keeps `a`'s identity metadata.
pub fn compose(a: &Operation, b: &Operation) -> Composed {
    match (&a.kind, &b.kind) {
        (EditKind::Retain { .. }, _) => Composed::One(b.clone()),
        (_, EditKind::Retain { .. }) => Composed::One(a.clone()),
        (EditKind::Insert { text: ta }, EditKind::Insert { text: tb }) => {
            // Second insert lands inside (or at either edge of) the first.
            if b.position >= a.position && b.position <= a.position + char_len(ta) {
                let split = byte_index(ta, b.position - a.position).unwrap_or(ta.len());
                let mut text = String::with_capacity(ta.len() + tb.len());
                text.push_str(&ta[..split]);
                text.push_str(tb);
                text.push_str(&ta[split..]);
                let mut op = a.clone();
                op.kind = EditKind::Insert { text };
                Composed::One(op)
            } else {
                Composed::Two(a.clone(), b.clone())
            }
        }
        (EditKind::Delete { length: la }, EditKind::Delete { length: lb }) => {
            // Second delete spans the seam left by the first.
            if b.position <= a.position && a.position <= b.end() {
                let mut op = a.clone();
                op.position = b.position;
                op.kind = EditKind::Delete { length: la + lb };
                Composed::One(op)
            } else {
                Composed::Two(a.clone(), b.clone())
            }
        }
        (EditKind::Insert { text: ta }, EditKind::Delete { length: lb }) => {
            let ta_len = char_len(ta);
            // Delete entirely within the inserted text: trim the insert.
            if b.position >= a.position && b.end() <= a.position + ta_len {
                let from = byte_index(ta, b.position - a.position).unwrap_or(ta.len());
                let to = byte_index(ta, b.position + lb - a.position).unwrap_or(ta.len());
                let mut text = String::with_capacity(ta.len() - (to - from));
                text.push_str(&ta[..from]);
                text.push_str(&ta[to..]);
                let mut op = a.clone();
                if text.is_empty() {
                    op.kind = EditKind::Retain { length: 0 };
                } else {
                    op.kind = EditKind::Insert { text };
                }
                Composed::One(op)
            } else {
                Composed::Two(a.clone(), b.clone())
            }
        }
        _ => Composed::Two(a.clone(), b.clone()),
    }
}
