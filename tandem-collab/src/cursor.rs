//! Cursor positions and the rule for moving other users' cursors when a
//! patch changes the buffer under them.

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::protocol::UserEntry;
use crate::roster::{ConnectionId, Roster};

/// 1-based text position. Serialized as `{"x": column, "y": line}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "x")]
    pub column: i64,
    #[serde(rename = "y")]
    pub line: i64,
}

impl Cursor {
    pub const ORIGIN: Cursor = Cursor { line: 1, column: 1 };

    /// Build a cursor, clamping both coordinates to at least 1.
    pub fn new(line: i64, column: i64) -> Self {
        Self {
            line: line.max(1),
            column: column.max(1),
        }
    }

    /// 0-based row for indexing into a buffer.
    pub fn row(&self) -> usize {
        self.line.saturating_sub(1).max(0) as usize
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::ORIGIN
    }
}

/// Move `cursor` to stay on the same text after `editor` applied `patch`.
///
/// Rules are tried in order and at most one applies:
/// 1. below the editor's line: shift by `change_y`;
/// 2. same line, right of the editor: shift column by `change_x`;
/// 3. line directly above, right of the editor, and exactly one line was
///    inserted: the line was split, move down one and shift the column.
///
/// Returns whether the cursor moved. Shifts saturate instead of wrapping.
pub fn shift_cursor(cursor: &mut Cursor, editor: Cursor, patch: &Patch) -> bool {
    let before = *cursor;
    if cursor.line > editor.line {
        cursor.line = cursor.line.saturating_add(patch.change_y).max(1);
    } else if cursor.line == editor.line && cursor.column > editor.column {
        cursor.column = cursor.column.saturating_add(patch.change_x).max(1);
    } else if cursor.line == editor.line.saturating_sub(1)
        && cursor.column > editor.column
        && patch.change_y == 1
    {
        cursor.line = cursor.line.saturating_add(1);
        cursor.column = cursor.column.saturating_add(patch.change_x).max(1);
    }
    *cursor != before
}

/// Apply [`shift_cursor`] to every roster entry except the editor.
///
/// Returns the entries whose cursor changed, in roster order, ready to be
/// appended to an update's `updated_cursors`.
pub fn shift_cursors_for_patch(
    patch: &Patch,
    editor: ConnectionId,
    roster: &mut Roster,
) -> Vec<UserEntry> {
    let Some(anchor) = roster.get_by_connection(editor).map(|identity| identity.cursor) else {
        return Vec::new();
    };

    roster
        .iter_mut()
        .filter(|identity| identity.connection != editor)
        .filter_map(|identity| {
            shift_cursor(&mut identity.cursor, anchor, patch).then(|| identity.to_entry())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(change_y: i64, change_x: i64) -> Patch {
        Patch {
            start: 0,
            end: 0,
            change_y,
            change_x,
            buffer: Vec::new(),
            buffer_size: 0,
        }
    }

    #[test]
    fn test_cursor_serializes_as_x_y() {
        let json = serde_json::to_value(Cursor::new(3, 7)).unwrap();
        assert_eq!(json, serde_json::json!({"x": 7, "y": 3}));
    }

    #[test]
    fn test_cursor_clamps_to_one() {
        assert_eq!(Cursor::new(0, -4), Cursor::ORIGIN);
        assert_eq!(Cursor::new(1, 1).row(), 0);
    }

    #[test]
    fn test_line_below_moves_by_change_y() {
        let mut cursor = Cursor::new(5, 2);
        assert!(shift_cursor(&mut cursor, Cursor::new(3, 1), &patch(2, 0)));
        assert_eq!(cursor, Cursor::new(7, 2));
    }

    #[test]
    fn test_line_above_untouched() {
        let mut cursor = Cursor::new(1, 9);
        assert!(!shift_cursor(&mut cursor, Cursor::new(3, 1), &patch(1, 4)));
        assert_eq!(cursor, Cursor::new(1, 9));
    }

    #[test]
    fn test_same_line_right_of_editor_shifts_column() {
        let mut cursor = Cursor::new(3, 10);
        assert!(shift_cursor(&mut cursor, Cursor::new(3, 4), &patch(0, 3)));
        assert_eq!(cursor, Cursor::new(3, 13));
    }

    #[test]
    fn test_same_line_left_of_editor_untouched() {
        let mut cursor = Cursor::new(3, 2);
        assert!(!shift_cursor(&mut cursor, Cursor::new(3, 4), &patch(0, 3)));
    }

    #[test]
    fn test_column_never_drops_below_one() {
        let mut cursor = Cursor::new(3, 5);
        assert!(shift_cursor(&mut cursor, Cursor::new(3, 2), &patch(0, -20)));
        assert_eq!(cursor.column, 1);
    }

    #[test]
    fn test_split_line_moves_cursor_down() {
        // Editor pressed enter on line 2 and now sits at the start of line 3.
        let mut cursor = Cursor::new(2, 8);
        assert!(shift_cursor(&mut cursor, Cursor::new(3, 1), &patch(1, -4)));
        assert_eq!(cursor, Cursor::new(3, 4));
    }

    #[test]
    fn test_rules_are_exclusive() {
        // Below the editor: only the line rule applies, column stays put.
        let mut cursor = Cursor::new(4, 10);
        shift_cursor(&mut cursor, Cursor::new(3, 1), &patch(1, 5));
        assert_eq!(cursor, Cursor::new(5, 10));
    }

    #[test]
    fn test_extreme_shifts_saturate() {
        let mut cursor = Cursor::new(5, 1);
        assert!(shift_cursor(&mut cursor, Cursor::new(2, 1), &patch(i64::MAX, 0)));
        assert_eq!(cursor.line, i64::MAX);

        let mut cursor = Cursor::new(5, 1);
        assert!(shift_cursor(&mut cursor, Cursor::new(2, 1), &patch(i64::MIN, 0)));
        assert_eq!(cursor.line, 1);

        let mut cursor = Cursor::new(2, 9);
        assert!(shift_cursor(&mut cursor, Cursor::new(2, 1), &patch(0, i64::MAX)));
        assert_eq!(cursor.column, i64::MAX);

        let far = Cursor { line: i64::MIN, column: 1 };
        assert_eq!(far.row(), 0);
    }

    #[test]
    fn test_roster_shift_skips_editor_and_reports_changes() {
        let mut roster = Roster::new(11);
        let editor = ConnectionId::new();
        let below = ConnectionId::new();
        let above = ConnectionId::new();
        roster.join("editor", editor).unwrap();
        roster.join("below", below).unwrap();
        roster.join("above", above).unwrap();

        roster.get_by_connection_mut(editor).unwrap().cursor = Cursor::new(2, 1);
        roster.get_by_connection_mut(below).unwrap().cursor = Cursor::new(3, 1);
        roster.get_by_connection_mut(above).unwrap().cursor = Cursor::new(1, 1);

        let changed = shift_cursors_for_patch(&patch(1, 0), editor, &mut roster);

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "below");
        assert_eq!(changed[0].cursor, Cursor::new(4, 1));
        assert_eq!(roster.get_by_connection(editor).unwrap().cursor, Cursor::new(2, 1));
        assert_eq!(roster.get_by_connection(above).unwrap().cursor, Cursor::new(1, 1));
    }

    #[test]
    fn test_unknown_editor_shifts_nothing() {
        let mut roster = Roster::new(11);
        roster.join("alice", ConnectionId::new()).unwrap();
        let changed = shift_cursors_for_patch(&patch(3, 0), ConnectionId::new(), &mut roster);
        assert!(changed.is_empty());
    }
}
