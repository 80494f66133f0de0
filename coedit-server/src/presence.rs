//! Ephemeral per-user presence: cursor, selection and typing state.
//!
//! Presence is owned by the document engine that hosts the entry, mutated
//! only on its serialization loop, and never persisted.

use serde::{Deserialize, Serialize};

/// A cursor location in the document, zero-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    /// Line index.
    pub line: usize,
    /// Column index within the line, in code points.
    pub column: usize,
}

/// A selection as an anchor/head pair of code-point offsets. Head may be
/// before the anchor for backwards selections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    /// Fixed end of the selection.
    pub anchor: usize,
    /// Moving end of the selection.
    pub head: usize,
}

/// Presence state of one attached user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Last reported cursor, if any.
    pub cursor: Option<CursorPos>,
    /// Current selection, or `None` when collapsed.
    pub selection: Option<SelectionRange>,
    /// Whether the user is actively typing.
    pub is_typing: bool,
    /// Milliseconds since the Unix epoch of the last presence activity.
    pub last_activity: i64,
}

impl PresenceEntry {
    /// Fold `update` into the entry, stamping `now`. Returns whether anything
    /// visible to co-editors changed; `last_activity` alone does not count,
    /// so repeated identical updates produce no broadcast.
    pub fn apply(&mut self, update: PresenceUpdate, now: i64) -> bool {
        self.last_activity = now;
        match update {
            PresenceUpdate::Cursor(pos) => {
                let changed = self.cursor != Some(pos);
                self.cursor = Some(pos);
                changed
            }
            PresenceUpdate::Selection(range) => {
                let changed = self.selection != range;
                self.selection = range;
                changed
            }
            PresenceUpdate::Typing(flag) => {
                let changed = self.is_typing != flag;
                self.is_typing = flag;
                changed
            }
        }
    }
}

/// One inbound presence mutation, already demultiplexed from the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// `cursor.move`
    Cursor(CursorPos),
    /// `selection.change`
    Selection(Option<SelectionRange>),
    /// `user.typing`
    Typing(bool),
}
