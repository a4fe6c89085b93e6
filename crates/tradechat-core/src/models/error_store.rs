use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorLevel {
    Warning,
    Error,
}

/// One captured WARN/ERROR log event
#[derive(Clone, Debug)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub level: ErrorLevel,
    pub message: String,
    pub target: String,
    pub fields: HashMap<String, String>,
}

/// Bounded diagnostics log, oldest entries evicted first.
/// Cloning shares the same underlying buffer.
#[derive(Clone)]
pub struct ErrorStore {
    entries: Arc<Mutex<VecDeque<ErrorEntry>>>,
    max_entries: usize,
}

impl ErrorStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn add_entry(&self, entry: ErrorEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);

        while entries.len() > self.max_entries {
            entries.pop_front();
        }
    }

    pub fn get_all_entries(&self) -> Vec<ErrorEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.level == ErrorLevel::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.level == ErrorLevel::Warning)
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: ErrorLevel, message: &str) -> ErrorEntry {
        ErrorEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            target: "test".to_string(),
            fields: HashMap::new(),
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let store = ErrorStore::new(2);
        store.add_entry(entry(ErrorLevel::Error, "one"));
        store.add_entry(entry(ErrorLevel::Warning, "two"));
        store.add_entry(entry(ErrorLevel::Error, "three"));

        let messages: Vec<String> = store
            .get_all_entries()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_counts_by_level() {
        let store = ErrorStore::new(10);
        store.add_entry(entry(ErrorLevel::Error, "a"));
        store.add_entry(entry(ErrorLevel::Warning, "b"));
        store.add_entry(entry(ErrorLevel::Warning, "c"));
        assert_eq!(store.error_count(), 1);
        assert_eq!(store.warning_count(), 2);

        store.clear();
        assert_eq!(store.get_all_entries().len(), 0);
    }
}
