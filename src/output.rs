//! Console output buffering.
//!
//! Child output arrives as decoded chunks that may end mid-line. A
//! [`LineAssembler`] turns chunks into complete lines, and a [`ConsoleBuffer`]
//! keeps a bounded scrollback per slot, showing the unfinished trailing line
//! until the next chunk completes it.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Splits a chunked stream into lines. `\r\n` and `\n` both end a line; a lone
/// `\r` is dropped.
#[derive(Debug, Default, Clone)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Feeds a chunk and returns every line it completed.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in chunk.chars() {
            match ch {
                '\n' => lines.push(std::mem::take(&mut self.partial)),
                '\r' => {}
                _ => self.partial.push(ch),
            }
        }
        lines
    }

    /// The unfinished trailing line.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Takes the unfinished line, if any.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

/// A fixed-capacity scrollback of console lines.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    max_lines: usize,
    lines: VecDeque<String>,
    assembler: LineAssembler,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            assembler: LineAssembler::default(),
        }
    }

    /// Appends a chunk of child output.
    ///
    /// Returns how many old lines were dropped to make room.
    pub fn push_chunk(&mut self, chunk: &str) -> usize {
        let mut dropped = 0;
        for line in self.assembler.feed(chunk) {
            dropped += self.push_complete(line);
        }
        dropped
    }

    /// Appends a whole line, finishing any partial one first.
    pub fn push_line(&mut self, line: impl Into<String>) -> usize {
        let mut dropped = 0;
        if let Some(partial) = self.assembler.take_partial() {
            dropped += self.push_complete(partial);
        }
        dropped + self.push_complete(line.into())
    }

    fn push_complete(&mut self, line: String) -> usize {
        let mut dropped = 0;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.assembler = LineAssembler::default();
    }

    /// Number of visible lines, counting an unfinished trailing line.
    pub fn len(&self) -> usize {
        self.lines.len() + usize::from(!self.assembler.partial().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible lines in order, ending with the unfinished line if there is one.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let partial = Some(self.assembler.partial()).filter(|p| !p.is_empty());
        self.lines.iter().map(String::as_str).chain(partial)
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
