//! Bounded line buffers for session output.
//!
//! Text is split on `\n`; a trailing fragment without a newline is kept as
//! the partial line and completed by the next feed. Only the most recent
//! `capacity` lines are retained. The session uses one over normalized text
//! as classifier context; the manager keeps one over raw text as the log.

use std::collections::VecDeque;

/// Ring buffer of recent output lines plus the current partial line.
#[derive(Debug, Clone)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    partial: String,
    capacity: usize,
}

impl LineBuffer {
    /// Create a buffer retaining at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            partial: String::new(),
            capacity,
        }
    }

    /// Append text, returning the number of lines completed by it.
    pub fn feed(&mut self, text: &str) -> usize {
        let mut completed = 0;
        let mut segments = text.split('\n').peekable();

        while let Some(segment) = segments.next() {
            self.partial.push_str(segment);
            if segments.peek().is_some() {
                let mut line = std::mem::take(&mut self.partial);
                if line.ends_with('\r') {
                    line.pop();
                }
                self.push_line(line);
                completed += 1;
            }
        }

        completed
    }

    /// Number of complete lines currently retained.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.partial.is_empty()
    }

    pub fn partial(&self) -> &str {
        &self.partial
    }

    /// Copy out the retained lines (partial line last), optionally only the
    /// most recent `tail` of them. Never longer than the capacity.
    pub fn snapshot(&self, tail: Option<usize>) -> Vec<String> {
        let mut all: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            all.push(self.partial.clone());
        }
        let keep = tail.unwrap_or(self.capacity).min(self.capacity);
        let start = all.len().saturating_sub(keep);
        all.split_off(start)
    }

    /// The retained text joined back together, partial line included.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text.push_str(&self.partial);
        text
    }

    /// The last `max_chars` characters of [`text`](Self::text).
    pub fn tail_chars(&self, max_chars: usize) -> String {
        let text = self.text();
        let count = text.chars().count();
        if count <= max_chars {
            return text;
        }
        text.chars().skip(count - max_chars).collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }

    fn push_line(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}
