//! Buffer management for captured log records
//!
//! The buffer is written by a single capture task and read by any number of
//! callers. Appends and snapshots are mutually exclusive per record; a snapshot
//! copies under the read lock, so eviction can never remove a record while a
//! copy is in flight.

use crate::{DeviceKitError, LogLevel, LogRecord, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::debug;

/// Configuration for buffer retention
#[derive(Debug, Clone, Default)]
pub struct BufferConfig {
    /// Maximum number of records kept; oldest are evicted first. `None` keeps all.
    pub max_records: Option<usize>,
}

/// Statistics about buffer usage
#[derive(Debug, Clone)]
pub struct BufferStats {
    pub total_records: usize,
    pub records_appended: u64,
    pub records_evicted: u64,
    pub records_by_level: HashMap<LogLevel, usize>,
    pub frozen: bool,
}

/// Thread-safe, ordered store of accepted log records
#[derive(Debug, Clone)]
pub struct LogBuffer {
    config: BufferConfig,
    records: Arc<RwLock<VecDeque<LogRecord>>>,
    appended: Arc<AtomicU64>,
    evicted: Arc<AtomicU64>,
    frozen: Arc<AtomicBool>,
}

impl LogBuffer {
    /// Create an unbounded buffer
    pub fn new() -> Self {
        Self::with_config(BufferConfig::default())
    }

    /// Create a buffer with custom retention
    pub fn with_config(config: BufferConfig) -> Self {
        Self {
            config,
            records: Arc::new(RwLock::new(VecDeque::new())),
            appended: Arc::new(AtomicU64::new(0)),
            evicted: Arc::new(AtomicU64::new(0)),
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append a record at the end, evicting the oldest when over capacity
    pub fn append(&self, record: LogRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer write lock")
        })?;

        // Checked under the write lock so an append cannot slip past `freeze`
        if self.frozen.load(Ordering::Acquire) {
            return Err(DeviceKitError::invalid("Log buffer is frozen"));
        }

        records.push_back(record);
        self.appended.fetch_add(1, Ordering::Relaxed);

        if let Some(max) = self.config.max_records {
            let mut evicted = 0u64;
            while records.len() > max {
                records.pop_front();
                evicted += 1;
            }
            if evicted > 0 {
                self.evicted.fetch_add(evicted, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Consistent point-in-time copy of all records, in arrival order
    pub fn snapshot(&self) -> Result<Vec<LogRecord>> {
        let records = self.records.read().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer read lock")
        })?;

        Ok(records.iter().cloned().collect())
    }

    /// Current number of records
    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the most recent N records
    pub fn get_recent(&self, count: usize) -> Result<Vec<LogRecord>> {
        let records = self.records.read().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer read lock")
        })?;

        let start_index = records.len().saturating_sub(count);
        Ok(records.range(start_index..).cloned().collect())
    }

    /// Get records of one level
    pub fn get_by_level(&self, level: LogLevel) -> Result<Vec<LogRecord>> {
        let records = self.records.read().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer read lock")
        })?;

        Ok(records
            .iter()
            .filter(|record| record.level == level)
            .cloned()
            .collect())
    }

    /// Get records captured within a time range (inclusive)
    pub fn get_range(&self, start: SystemTime, end: SystemTime) -> Result<Vec<LogRecord>> {
        let records = self.records.read().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer read lock")
        })?;

        Ok(records
            .iter()
            .filter(|record| record.timestamp >= start && record.timestamp <= end)
            .cloned()
            .collect())
    }

    /// Reject all further appends
    pub fn freeze(&self) {
        // Taking the write lock waits out an in-flight append
        let records = match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.frozen.store(true, Ordering::Release);
        debug!("Log buffer frozen with {} records", records.len());
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Get buffer statistics
    pub fn get_stats(&self) -> Result<BufferStats> {
        let records = self.records.read().map_err(|_| {
            DeviceKitError::invalid("Failed to acquire buffer read lock")
        })?;

        let mut records_by_level = HashMap::new();
        for record in records.iter() {
            *records_by_level.entry(record.level).or_insert(0) += 1;
        }

        Ok(BufferStats {
            total_records: records.len(),
            records_appended: self.appended.load(Ordering::Relaxed),
            records_evicted: self.evicted.load(Ordering::Relaxed),
            records_by_level,
            frozen: self.is_frozen(),
        })
    }

    /// Get buffer configuration
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn create_test_record(level: LogLevel, message: &str) -> LogRecord {
        LogRecord {
            level,
            ..LogRecord::unparsed(message)
        }
    }

    #[test]
    fn test_buffer_creation() {
        let buffer = LogBuffer::new();
        assert!(buffer.is_empty());
        let stats = buffer.get_stats().unwrap();
        assert_eq!(stats.total_records, 0);
        assert!(!stats.frozen);
    }

    #[test]
    fn test_append_preserves_order() {
        let buffer = LogBuffer::new();
        for i in 0..5 {
            buffer
                .append(create_test_record(LogLevel::Info, &format!("Message {}", i)))
                .unwrap();
        }

        let records = buffer.snapshot().unwrap();
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.message, format!("Message {}", i));
        }
    }

    #[test]
    fn test_buffer_get_recent() {
        let buffer = LogBuffer::new();
        for i in 0..5 {
            buffer
                .append(create_test_record(LogLevel::Info, &format!("Message {}", i)))
                .unwrap();
        }

        let recent = buffer.get_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "Message 2");
        assert_eq!(recent[2].message, "Message 4");
        assert_eq!(buffer.get_recent(50).unwrap().len(), 5);
    }

    #[test]
    fn test_buffer_get_by_level() {
        let buffer = LogBuffer::new();
        buffer.append(create_test_record(LogLevel::Info, "Info message")).unwrap();
        buffer.append(create_test_record(LogLevel::Error, "Error message")).unwrap();
        buffer.append(create_test_record(LogLevel::Info, "Another info")).unwrap();

        assert_eq!(buffer.get_by_level(LogLevel::Info).unwrap().len(), 2);
        let errors = buffer.get_by_level(LogLevel::Error).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Error message");
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let buffer = LogBuffer::with_config(BufferConfig {
            max_records: Some(3),
        });
        for i in 0..5 {
            buffer
                .append(create_test_record(LogLevel::Info, &format!("Message {}", i)))
                .unwrap();
        }

        let messages: Vec<String> = buffer
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.message)
            .collect();
        assert_eq!(messages, vec!["Message 2", "Message 3", "Message 4"]);

        let stats = buffer.get_stats().unwrap();
        assert_eq!(stats.records_appended, 5);
        assert_eq!(stats.records_evicted, 2);
    }

    #[test]
    fn test_frozen_buffer_rejects_appends() {
        let buffer = LogBuffer::new();
        buffer.append(create_test_record(LogLevel::Info, "before")).unwrap();
        buffer.freeze();

        assert!(buffer.is_frozen());
        assert!(buffer.append(create_test_record(LogLevel::Info, "after")).is_err());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_time_range() {
        let buffer = LogBuffer::new();
        let start = SystemTime::now();
        buffer.append(create_test_record(LogLevel::Info, "Message 1")).unwrap();
        thread::sleep(Duration::from_millis(10));
        let mid = SystemTime::now();
        buffer.append(create_test_record(LogLevel::Info, "Message 2")).unwrap();
        let end = SystemTime::now();

        assert_eq!(buffer.get_range(start, end).unwrap().len(), 2);
        let tail = buffer.get_range(mid, end).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "Message 2");
    }

    #[test]
    fn test_concurrent_snapshots_see_ordered_prefixes() {
        let buffer = LogBuffer::new();
        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    buffer
                        .append(create_test_record(LogLevel::Info, &i.to_string()))
                        .unwrap();
                }
            })
        };

        for _ in 0..50 {
            let snapshot = buffer.snapshot().unwrap();
            for (i, record) in snapshot.iter().enumerate() {
                assert_eq!(record.message, i.to_string());
            }
        }

        writer.join().unwrap();
        assert_eq!(buffer.len(), 500);
    }
}
