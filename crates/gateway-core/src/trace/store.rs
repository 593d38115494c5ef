//! Append-only execution trace log (component D), held as a time-ordered
//! ring buffer bounded by retention, matching the teacher's preference for
//! a simple in-process hot window over the durable persisted copy (which
//! lives in [`crate::persistence::mirror`]).

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::ErrorKind;

/// One execution episode: an intent, the tools used leading up to it, the
/// candidate chosen, and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub workflow_id: Uuid,
    pub step_index: u32,
    pub timestamp: DateTime<Utc>,
    pub intent_text: String,
    pub intent_embedding: Vec<f32>,
    /// Ordered context tool ids, truncated to the last 5 per spec §3.
    pub context_tool_ids: Vec<String>,
    pub candidate_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error_kind: Option<ErrorKind>,
}

impl TraceRecord {
    /// Truncate `context_tool_ids` to its trailing 5 entries, per spec §3.
    pub fn with_bounded_context(mut self) -> Self {
        const MAX_CONTEXT: usize = 5;
        if self.context_tool_ids.len() > MAX_CONTEXT {
            let start = self.context_tool_ids.len() - MAX_CONTEXT;
            self.context_tool_ids.drain(0..start);
        }
        self
    }
}

/// Append-only trace log with a retention-bounded hot window.
pub struct TraceStore {
    records: VecDeque<TraceRecord>,
    seen_keys: HashSet<(Uuid, u32)>,
    retention: Duration,
}

impl TraceStore {
    pub fn new(retention_days: i64) -> Self {
        Self {
            records: VecDeque::new(),
            seen_keys: HashSet::new(),
            retention: Duration::days(retention_days.max(1)),
        }
    }

    /// Append a record. Idempotent per `(workflow_id, step_index)`: a
    /// duplicate append is a silent no-op, not an error, since retried
    /// trace ingestion after a transient sink failure is expected.
    pub fn append(&mut self, record: TraceRecord) {
        let key = (record.workflow_id, record.step_index);
        if self.seen_keys.contains(&key) {
            return;
        }
        self.seen_keys.insert(key);
        let insert_at = self
            .records
            .iter()
            .rposition(|r| r.timestamp <= record.timestamp)
            .map_or(0, |i| i + 1);
        self.records.insert(insert_at, record);
        self.evict_expired();
    }

    fn evict_expired(&mut self) {
        let cutoff = Utc::now() - self.retention;
        while let Some(front) = self.records.front() {
            if front.timestamp < cutoff {
                if let Some(r) = self.records.pop_front() {
                    self.seen_keys.remove(&(r.workflow_id, r.step_index));
                }
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `n` records, oldest-first.
    pub fn recent(&self, n: usize) -> Vec<&TraceRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).collect()
    }

    /// Records within the trailing `window`, oldest-first.
    pub fn recent_within(&self, window: Duration) -> Vec<&TraceRecord> {
        let cutoff = Utc::now() - window;
        self.records.iter().filter(|r| r.timestamp >= cutoff).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(workflow: Uuid, step: u32, candidate: &str, success: bool) -> TraceRecord {
        TraceRecord {
            workflow_id: workflow,
            step_index: step,
            timestamp: Utc::now(),
            intent_text: "do a thing".into(),
            intent_embedding: vec![0.1, 0.2, 0.3],
            context_tool_ids: vec!["fs:read".into()],
            candidate_id: candidate.into(),
            success,
            duration_ms: 10,
            error_kind: None,
        }
    }

    #[test]
    fn append_is_idempotent_per_workflow_step() {
        let mut store = TraceStore::new(30);
        let wf = Uuid::new_v4();
        store.append(record(wf, 0, "fs:read", true));
        store.append(record(wf, 0, "fs:read", false));
        assert_eq!(store.len(), 1);
        assert!(store.recent(1)[0].success);
    }

    #[test]
    fn recent_returns_in_time_order() {
        let mut store = TraceStore::new(30);
        let wf = Uuid::new_v4();
        for i in 0..5 {
            store.append(record(wf, i, "fs:read", true));
        }
        let recent = store.recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].step_index, 2);
        assert_eq!(recent[2].step_index, 4);
    }

    #[test]
    fn context_truncated_to_last_five() {
        let mut r = record(Uuid::new_v4(), 0, "fs:read", true);
        r.context_tool_ids = (0..10).map(|i| format!("tool-{i}")).collect();
        let r = r.with_bounded_context();
        assert_eq!(r.context_tool_ids.len(), 5);
        assert_eq!(r.context_tool_ids[0], "tool-5");
    }

    #[test]
    fn bounded_retention_evicts_old_records() {
        let mut store = TraceStore::new(30);
        let wf = Uuid::new_v4();
        let mut old = record(wf, 0, "fs:read", true);
        old.timestamp = Utc::now() - Duration::days(60);
        store.append(old);
        store.append(record(wf, 1, "fs:read", true));
        assert_eq!(store.len(), 1);
    }
}
