//! The editor surface the synchronization engine drives.
//!
//! The engine only talks to an [`EditorView`]; it never knows which editor
//! sits behind it. Implementations use interior mutability because the
//! background sync loop writes to the view while the foreground reads it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::cursor::Cursor;

/// How a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Capabilities the host editor exposes to the engine.
pub trait EditorView: Send + Sync + 'static {
    /// Current document lines.
    fn lines(&self) -> Vec<String>;
    fn set_lines(&self, lines: Vec<String>);

    /// Local cursor (1-based).
    fn cursor(&self) -> Cursor;
    fn set_cursor(&self, cursor: Cursor);

    fn notify(&self, message: &str, severity: Severity);
    fn redraw(&self);

    /// Show a remote user's cursor marker.
    fn add_marker(&self, id: u64, color_slot: usize, cursor: Cursor);
    fn remove_marker(&self, id: u64);

    /// Number of distinct marker colors, including the local user's slot.
    fn color_palette_size(&self) -> usize;

    /// Close the editor session. No-op for hosts without that notion.
    fn quit(&self) {}
}

/// A marker as drawn by [`MemoryView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub color_slot: usize,
    pub cursor: Cursor,
}

#[derive(Debug, Default)]
struct ViewState {
    lines: Vec<String>,
    cursor: Cursor,
    markers: BTreeMap<u64, Marker>,
    messages: Vec<(Severity, String)>,
    quit: bool,
}

/// In-memory [`EditorView`] for headless hosts and tests.
#[derive(Debug)]
pub struct MemoryView {
    state: Mutex<ViewState>,
    palette_size: usize,
}

impl MemoryView {
    pub fn new(palette_size: usize) -> Self {
        Self {
            state: Mutex::new(ViewState::default()),
            palette_size,
        }
    }

    pub fn with_lines<I, S>(palette_size: usize, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let view = Self::new(palette_size);
        view.lock().lines = lines.into_iter().map(Into::into).collect();
        view
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Markers currently shown, keyed by marker id.
    pub fn markers(&self) -> BTreeMap<u64, Marker> {
        self.lock().markers.clone()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.lock().messages.clone()
    }

    /// Drain notifications collected since the last call.
    pub fn take_messages(&self) -> Vec<(Severity, String)> {
        std::mem::take(&mut self.lock().messages)
    }

    pub fn has_quit(&self) -> bool {
        self.lock().quit
    }

    /// Edit the buffer and cursor in one step, as a keystroke would.
    ///
    /// The closure runs under the view lock, so nothing else (the sync loop
    /// included) can change the buffer between its checks and its writes.
    pub fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<String>, &mut Cursor) -> R,
    {
        let mut state = self.lock();
        let ViewState { lines, cursor, .. } = &mut *state;
        f(lines, cursor)
    }
}

impl EditorView for MemoryView {
    fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    fn set_lines(&self, lines: Vec<String>) {
        self.lock().lines = lines;
    }

    fn cursor(&self) -> Cursor {
        self.lock().cursor
    }

    fn set_cursor(&self, cursor: Cursor) {
        self.lock().cursor = cursor;
    }

    fn notify(&self, message: &str, severity: Severity) {
        self.lock().messages.push((severity, message.to_string()));
    }

    fn redraw(&self) {}

    fn add_marker(&self, id: u64, color_slot: usize, cursor: Cursor) {
        self.lock().markers.insert(id, Marker { color_slot, cursor });
    }

    fn remove_marker(&self, id: u64) {
        self.lock().markers.remove(&id);
    }

    fn color_palette_size(&self) -> usize {
        self.palette_size
    }

    fn quit(&self) {
        self.lock().quit = true;
    }
}
