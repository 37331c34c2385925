#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default ring capacity; oldest entries are pruned past this.
pub const DEFAULT_CAPACITY: usize = 128;

/// One captured engine output line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: String,
    pub message: String,
}

/// Bounded ring of engine output lines, shared between the supervisor's
/// stream readers and whoever wants to display them.
///
/// `push` never fails and never blocks beyond the ring mutex; a poisoned
/// lock is ignored rather than propagated so logging can never take the
/// caller down.
#[derive(Debug, Clone)]
pub struct LogSink {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, message: String) {
        let entry = LogEntry {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            message,
        };

        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    /// Snapshot of the current ring contents, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_prunes_oldest() {
        let sink = LogSink::new(4);
        for i in 0..10 {
            sink.push(format!("line {}", i));
        }

        let entries = sink.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].message, "line 6");
        assert_eq!(entries[3].message, "line 9");
    }
}
