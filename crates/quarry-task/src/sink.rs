//! Record archive collaborator.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use quarry_protocol::operator::RecordKind;

/// External store for timestamped records. The core only appends to it and
/// reads ranges back for operators.
pub trait RecordSink: Send + Sync {
    fn store(&self, kind: RecordKind, timestamp: i64, record: String);

    /// Records of `kind` with `start <= timestamp <= end`, oldest first.
    fn load(&self, kind: RecordKind, start: i64, end: i64) -> Vec<String>;

    /// Oldest and newest timestamp held for `kind`.
    fn bounds(&self, kind: RecordKind) -> Option<(i64, i64)>;
}

/// In-memory [`RecordSink`], used when no archive is configured.
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<HashMap<RecordKind, Vec<(i64, String)>>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl RecordSink for MemoryRecordSink {
    fn store(&self, kind: RecordKind, timestamp: i64, record: String) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let list = records.entry(kind).or_default();
        // Keep sorted; records nearly always arrive in order.
        let index = list.partition_point(|(t, _)| *t <= timestamp);
        list.insert(index, (timestamp, record));
    }

    fn load(&self, kind: RecordKind, start: i64, end: i64) -> Vec<String> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .get(&kind)
            .map(|list| {
                list.iter()
                    .filter(|(t, _)| (start..=end).contains(t))
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bounds(&self, kind: RecordKind) -> Option<(i64, i64)> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let list = records.get(&kind)?;
        Some((list.first()?.0, list.last()?.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_range_in_order() {
        let sink = MemoryRecordSink::new();
        sink.store(RecordKind::Chat, 30, "c".into());
        sink.store(RecordKind::Chat, 10, "a".into());
        sink.store(RecordKind::Chat, 20, "b".into());
        sink.store(RecordKind::Logs, 15, "log".into());

        assert_eq!(sink.load(RecordKind::Chat, 10, 20), ["a", "b"]);
        assert_eq!(sink.bounds(RecordKind::Chat), Some((10, 30)));
        assert_eq!(sink.count(RecordKind::Logs), 1);
    }

    #[test]
    fn test_empty_kind() {
        let sink = MemoryRecordSink::new();
        assert!(sink.load(RecordKind::PingData, 0, i64::MAX).is_empty());
        assert_eq!(sink.bounds(RecordKind::PingData), None);
    }
}
