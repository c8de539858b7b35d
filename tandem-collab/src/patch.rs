//! Line-range patches between buffer snapshots.
//!
//! A patch says "replace lines `start..=end - change_y` of the pre-image with
//! `buffer`". The window is centered on the editor's cursor row and widened
//! by the line-count change, which brackets any single edit made at or near
//! the cursor.
//!
//! `change_x` is measured on the cursor row only. Edits away from the cursor
//! (multi-line pastes elsewhere, scripted changes) produce a width delta that
//! does not describe the real edit; it is only used for same-line cursor
//! shifting on the server.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Buffer edit descriptor exchanged in `update` packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// First replaced line (0-based).
    pub start: i64,
    /// Last line of the post-image window (0-based, inclusive). `-1` when
    /// the post-image is empty.
    pub end: i64,
    /// `len(new) - len(old)`.
    pub change_y: i64,
    /// Character-count change on the cursor row.
    pub change_x: i64,
    /// Replacement lines, i.e. `new[start..=end]`.
    pub buffer: Vec<String>,
    /// Line count of the post-image.
    pub buffer_size: usize,
}

impl Patch {
    /// Reject windows no [`compute_outgoing_patch`] call can produce.
    ///
    /// The window must start at or after line 0, `buffer` must hold exactly
    /// `end - start + 1` lines, and the line-count change cannot exceed the
    /// lines carried.
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: &str| {
            Err(SyncError::MalformedPacket(format!(
                "patch {}..={} (change_y {}): {reason}",
                self.start, self.end, self.change_y
            )))
        };

        if self.start < 0 {
            return malformed("negative start");
        }
        if self.end < self.start - 1 {
            return malformed("end before start");
        }
        let window = self.end.checked_sub(self.start).and_then(|d| d.checked_add(1));
        if window != Some(self.buffer.len() as i64) {
            return malformed("buffer does not fill the window");
        }
        if self.change_y > self.buffer.len() as i64 {
            return malformed("more lines inserted than carried");
        }
        if (self.buffer.len() as i64).checked_sub(self.change_y).is_none() {
            return malformed("line-count change out of range");
        }
        Ok(())
    }
}

fn width(line: &str) -> i64 {
    line.chars().count() as i64
}

/// Diff `current` against `previous` around the 0-based `cursor_row`.
///
/// Returns `None` when the snapshots are identical, so the caller can still
/// send a cursor-only update.
pub fn compute_outgoing_patch(
    previous: &[String],
    current: &[String],
    cursor_row: usize,
) -> Option<Patch> {
    if previous == current {
        return None;
    }

    let new_len = current.len() as i64;
    let old_len = previous.len() as i64;
    let change_y = new_len - old_len;
    let row = (cursor_row as i64).min((new_len - 1).max(0));

    let old_row = row - change_y;
    let change_x = if old_row >= 0 && old_row < old_len && row < new_len {
        width(&current[row as usize]) - width(&previous[old_row as usize])
    } else {
        0
    };

    let start = (row - change_y.abs()).max(0);
    let end = (row + change_y.abs()).min(new_len - 1);
    let buffer = if end >= start {
        current[start as usize..=end as usize].to_vec()
    } else {
        Vec::new()
    };

    Some(Patch {
        start,
        end,
        change_y,
        change_x,
        buffer,
        buffer_size: current.len(),
    })
}

/// Splice `patch` into `local`.
///
/// Applied to the sender's pre-image this reproduces the sender's post-image
/// exactly. Out-of-range indices are clamped rather than wrapped; callers
/// receiving patches off the wire run [`Patch::validate`] first.
pub fn apply_incoming_patch(local: &[String], patch: &Patch) -> Vec<String> {
    let len = local.len() as i64;
    let head = patch.start.clamp(0, len);
    let tail = patch
        .end
        .saturating_sub(patch.change_y)
        .saturating_add(1)
        .clamp(head, len);
    let (head, tail) = (head as usize, tail as usize);

    let mut result = Vec::with_capacity(head + patch.buffer.len() + (local.len() - tail));
    result.extend_from_slice(&local[..head]);
    result.extend(patch.buffer.iter().cloned());
    result.extend_from_slice(&local[tail..]);
    result
}
