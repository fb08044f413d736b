//! Guest console output.
//!
//! `console.log` calls arrive as events. [`GuestLog`] keeps them for later
//! inspection and re-emits each line through `tracing`.

use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

/// One line of guest console output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// The agent instance that logged it.
    pub instance_id: String,
    /// The logged text.
    pub message: String,
    /// When it was received.
    pub timestamp: Instant,
}

/// Collected guest console output.
#[derive(Debug, Default)]
pub struct GuestLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl GuestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line from `instance_id`.
    pub fn record(&self, instance_id: &str, message: &str) {
        info!(instance_id, guest_log = true, "{}", message);
        self.entries.lock().push(LogEntry {
            instance_id: instance_id.to_string(),
            message: message.to_string(),
            timestamp: Instant::now(),
        });
    }

    /// Snapshot of every recorded line, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Messages logged by one instance.
    pub fn messages_for(&self, instance_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_records_in_order() {
        let log = GuestLog::new();

        log.record("a", "Hello");
        log.record("b", "Other");
        log.record("a", "World");

        assert_eq!(log.len(), 3);
        assert_eq!(log.entries()[1].instance_id, "b");
        assert_eq!(log.messages_for("a"), vec!["Hello", "World"]);
        assert!(log.messages_for("c").is_empty());
    }
}
