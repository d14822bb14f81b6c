use std::collections::VecDeque;

use ahash::AHashMap;

/// Last `capacity` log lines per process, attached to exception reports.
#[derive(Debug)]
pub struct LogBuffer {
    lines: AHashMap<String, VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: AHashMap::new(),
            capacity,
        }
    }

    pub fn push(&mut self, process: &str, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let buffer = self.lines.entry(process.to_string()).or_default();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(line.into());
    }

    /// Oldest first.
    pub fn lines(&self, process: &str) -> Vec<String> {
        self.lines
            .get(process)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&mut self, process: &str) {
        self.lines.remove(process);
    }
}
