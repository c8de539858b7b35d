//! Who is present: connected identities, their cursors and color slots.
//!
//! The server owns the authoritative [`Roster`]. Names are unique; a second
//! join with a taken name is rejected, never merged.

use std::fmt;

use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::protocol::UserEntry;

/// Color slot reserved for the local user's own cursor.
pub const SELF_COLOR_SLOT: usize = 0;

/// Opaque handle for one accepted transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out color slots from a monotonically increasing counter.
///
/// Slots cycle through `1..palette_size`; [`SELF_COLOR_SLOT`] is never
/// handed out. Freed slots are not recycled, so a late update for a user who
/// just left cannot paint over a newcomer with the same color.
#[derive(Debug, Clone)]
pub struct ColorAllocator {
    next: u64,
    palette_size: usize,
}

impl ColorAllocator {
    pub fn new(palette_size: usize) -> Self {
        Self {
            next: 0,
            palette_size,
        }
    }

    pub fn next_slot(&mut self) -> usize {
        let remote_slots = self.palette_size.saturating_sub(1).max(1) as u64;
        let slot = 1 + (self.next % remote_slots) as usize;
        self.next += 1;
        slot
    }
}

/// One joined user.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub connection: ConnectionId,
    pub cursor: Cursor,
    pub color_slot: usize,
}

impl Identity {
    /// Wire representation (`{name, cursor}`).
    pub fn to_entry(&self) -> UserEntry {
        UserEntry {
            name: self.name.clone(),
            cursor: self.cursor,
        }
    }
}

/// Check that `name` is non-empty and only uses letters, digits, `_`, `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidName(name.to_string()))
    }
}

/// Insertion-ordered set of joined identities.
#[derive(Debug, Clone)]
pub struct Roster {
    entries: Vec<Identity>,
    colors: ColorAllocator,
}

impl Roster {
    pub fn new(palette_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            colors: ColorAllocator::new(palette_size),
        }
    }

    /// Register `name` for `connection`.
    ///
    /// Fails with [`SyncError::InvalidName`] or [`SyncError::NameConflict`];
    /// on failure the roster is unchanged.
    pub fn join(&mut self, name: &str, connection: ConnectionId) -> Result<&Identity> {
        validate_name(name)?;
        if self.get_by_name(name).is_some() {
            return Err(SyncError::NameConflict(name.to_string()));
        }
        let color_slot = self.colors.next_slot();
        self.entries.push(Identity {
            name: name.to_string(),
            connection,
            cursor: Cursor::ORIGIN,
            color_slot,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Remove the identity bound to `connection`, if any.
    pub fn leave(&mut self, connection: ConnectionId) -> Option<Identity> {
        let index = self
            .entries
            .iter()
            .position(|identity| identity.connection == connection)?;
        Some(self.entries.remove(index))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Identity> {
        self.entries.iter().find(|identity| identity.name == name)
    }

    pub fn get_by_connection(&self, connection: ConnectionId) -> Option<&Identity> {
        self.entries
            .iter()
            .find(|identity| identity.connection == connection)
    }

    pub fn get_by_connection_mut(&mut self, connection: ConnectionId) -> Option<&mut Identity> {
        self.entries
            .iter_mut()
            .find(|identity| identity.connection == connection)
    }

    /// Every identity in join order.
    pub fn snapshot_all(&self) -> Vec<UserEntry> {
        self.entries.iter().map(Identity::to_entry).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Identity> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
