// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The renderer's narrow write surface into the host editor.

/// Editable line buffer port.
///
/// The renderer never talks to an editor API directly; it emits single-line
/// replacements and contiguous insert/delete ranges through this trait. The
/// host groups one render's calls into a single undo unit.
pub trait EditorPort {
    /// Current buffer lines. An empty buffer reads as one empty line.
    fn lines(&self) -> Vec<String>;
    /// Replaces one existing line.
    fn replace_line(&mut self, index: usize, line: &str);
    /// Inserts lines before `index`.
    fn insert_lines(&mut self, index: usize, lines: &[String]);
    /// Removes the half-open line range `start..end`.
    fn remove_lines(&mut self, start: usize, end: usize);
}

/// In-memory buffer, used by tests and by headless rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryBuffer {
    lines: Vec<String>,
}

impl MemoryBuffer {
    /// Buffer holding `lines`.
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Current lines, normalized like [`EditorPort::lines`].
    #[must_use]
    pub fn into_lines(self) -> Vec<String> {
        if self.lines.is_empty() {
            vec![String::new()]
        } else {
            self.lines
        }
    }
}

impl EditorPort for MemoryBuffer {
    fn lines(&self) -> Vec<String> {
        if self.lines.is_empty() {
            vec![String::new()]
        } else {
            self.lines.clone()
        }
    }

    fn replace_line(&mut self, index: usize, line: &str) {
        if self.lines.is_empty() {
            self.lines.push(String::new());
        }
        if let Some(slot) = self.lines.get_mut(index) {
            *slot = line.to_owned();
        }
    }

    fn insert_lines(&mut self, index: usize, lines: &[String]) {
        if self.lines.is_empty() {
            self.lines.push(String::new());
        }
        let at = index.min(self.lines.len());
        self.lines.splice(at..at, lines.iter().cloned());
    }

    fn remove_lines(&mut self, start: usize, end: usize) {
        if self.lines.is_empty() {
            self.lines.push(String::new());
        }
        let start = start.min(self.lines.len());
        let end = end.min(self.lines.len());
        self.lines.drain(start..end);
    }
}
