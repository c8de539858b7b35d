//! Line-oriented terminal editor surface.
//!
//! Keeps the document in a [`MemoryView`] and prints notifications as they
//! arrive. The buffer is only printed on request (`:show`), since the sync
//! loop redraws after every packet.

use std::fmt::Write as _;

use tandem_collab::cursor::Cursor;
use tandem_collab::view::{EditorView, MemoryView, Severity};

pub struct TerminalView {
    inner: MemoryView,
}

impl TerminalView {
    pub fn new(palette_size: usize) -> Self {
        Self {
            inner: MemoryView::new(palette_size),
        }
    }

    /// Apply a local edit atomically; see [`MemoryView::edit`].
    pub fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<String>, &mut Cursor) -> R,
    {
        self.inner.edit(f)
    }

    /// The buffer with line numbers; `>` marks the local cursor line and
    /// `*` lines holding a remote cursor.
    pub fn render(&self) -> String {
        let cursor = self.inner.cursor();
        let markers = self.inner.markers();
        let mut out = String::new();
        for (i, line) in self.inner.lines().iter().enumerate() {
            let number = i as i64 + 1;
            let local = if number == cursor.line { '>' } else { ' ' };
            let remote = if markers.values().any(|m| m.cursor.line == number) {
                '*'
            } else {
                ' '
            };
            let _ = writeln!(out, "{local}{remote}{number:>4} | {line}");
        }
        let _ = write!(out, "-- cursor {}:{} --", cursor.line, cursor.column);
        out
    }
}

impl EditorView for TerminalView {
    fn lines(&self) -> Vec<String> {
        self.inner.lines()
    }

    fn set_lines(&self, lines: Vec<String>) {
        self.inner.set_lines(lines);
    }

    fn cursor(&self) -> Cursor {
        self.inner.cursor()
    }

    fn set_cursor(&self, cursor: Cursor) {
        self.inner.set_cursor(cursor);
    }

    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => println!("{message}"),
            Severity::Error => eprintln!("error: {message}"),
        }
    }

    fn redraw(&self) {
        self.inner.redraw();
    }

    fn add_marker(&self, id: u64, color_slot: usize, cursor: Cursor) {
        self.inner.add_marker(id, color_slot, cursor);
    }

    fn remove_marker(&self, id: u64) {
        self.inner.remove_marker(id);
    }

    fn color_palette_size(&self) -> usize {
        self.inner.color_palette_size()
    }

    fn quit(&self) {
        self.inner.quit();
    }
}
