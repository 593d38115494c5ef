//! TraceStats: the 17-scalar feature vector the SHGAT fusion MLP consumes
//! alongside the K head scores (spec §4.D/§4.E).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;

use crate::embedding::cosine_similarity;
use crate::graph::ErrorKind;

use super::store::{TraceRecord, TraceStore};

/// The 17 scalars consumed by the fusion MLP, all in `[0, 1]` except where noted.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceStats {
    pub historical_success_rate: f32,
    pub contextual_success_rate: f32,
    pub intent_similar_success_rate: f32,
    pub cooccurrence_with_context: f32,
    pub sequence_position: f32,
    pub recency_score: f32,
    pub usage_frequency: f32,
    pub avg_execution_time: f32,
    pub error_recovery_rate: f32,
    pub avg_path_length_to_success: f32,
    pub path_variance: f32,
    pub error_type_affinity: [f32; 6],
}

impl Default for TraceStats {
    /// Cold-start defaults (spec §4.D): everything at the neutral midpoint
    /// except counts (zero) and path length (3, a plausible workflow depth).
    fn default() -> Self {
        Self {
            historical_success_rate: 0.5,
            contextual_success_rate: 0.5,
            intent_similar_success_rate: 0.5,
            cooccurrence_with_context: 0.5,
            sequence_position: 0.5,
            recency_score: 0.5,
            usage_frequency: 0.0,
            avg_execution_time: 0.5,
            error_recovery_rate: 0.5,
            avg_path_length_to_success: 3.0,
            path_variance: 0.0,
            error_type_affinity: [0.5; 6],
        }
    }
}

impl TraceStats {
    /// Flattened for the fusion MLP: 11 scalars + 6 error-affinity = 17.
    pub fn to_vec(&self) -> Vec<f32> {
        let mut v = vec![
            self.historical_success_rate,
            self.contextual_success_rate,
            self.intent_similar_success_rate,
            self.cooccurrence_with_context,
            self.sequence_position,
            self.recency_score,
            self.usage_frequency,
            self.avg_execution_time,
            self.error_recovery_rate,
            self.avg_path_length_to_success,
            self.path_variance,
        ];
        v.extend_from_slice(&self.error_type_affinity);
        v
    }
}

fn context_hash(context_tool_ids: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for id in context_tool_ids {
        id.hash(&mut hasher);
    }
    hasher.finish()
}

/// Computes [`TraceStats`] for a `(intentEmbedding, candidateId, contextToolIds)`
/// triple over the rolling trace window, memoizing per `(candidate, contextHash)`
/// within a query (spec §4.D "Windowing").
pub struct TraceFeatureBuilder {
    recency_tau_days: f64,
    cache: LruCache<(String, u64), TraceStats>,
}

impl TraceFeatureBuilder {
    pub fn new(recency_tau_days: f64) -> Self {
        Self {
            recency_tau_days,
            cache: LruCache::new(NonZeroUsize::new(256).expect("256 is non-zero")),
        }
    }

    pub fn features_for(
        &mut self,
        store: &TraceStore,
        intent_embedding: &[f32],
        candidate_id: &str,
        context_tool_ids: &[String],
    ) -> TraceStats {
        let key = (candidate_id.to_string(), context_hash(context_tool_ids));
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let stats = Self::compute(store, intent_embedding, candidate_id, context_tool_ids, self.recency_tau_days);
        self.cache.put(key, stats.clone());
        stats
    }

    fn compute(
        store: &TraceStore,
        intent_embedding: &[f32],
        candidate_id: &str,
        context_tool_ids: &[String],
        recency_tau_days: f64,
    ) -> TraceStats {
        let candidate_records: Vec<&TraceRecord> =
            store.iter().filter(|r| r.candidate_id == candidate_id).collect();

        if candidate_records.is_empty() {
            return TraceStats::default();
        }

        let uses = candidate_records.len() as f32;
        let successes = candidate_records.iter().filter(|r| r.success).count() as f32;
        let historical_success_rate = successes / uses;

        let contextual: Vec<&&TraceRecord> = candidate_records
            .iter()
            .filter(|r| context_tool_ids.iter().any(|c| r.context_tool_ids.contains(c)))
            .collect();
        let contextual_success_rate = if contextual.is_empty() {
            0.5
        } else {
            contextual.iter().filter(|r| r.success).count() as f32 / contextual.len() as f32
        };

        let intent_similar: Vec<&&TraceRecord> = candidate_records
            .iter()
            .filter(|r| cosine_similarity(&r.intent_embedding, intent_embedding) >= 0.7)
            .collect();
        let intent_similar_success_rate = if intent_similar.is_empty() {
            0.5
        } else {
            intent_similar.iter().filter(|r| r.success).count() as f32 / intent_similar.len() as f32
        };

        let cooccurrence_with_context = if context_tool_ids.is_empty() {
            0.5
        } else {
            let hits: f32 = context_tool_ids
                .iter()
                .map(|c| {
                    let matches = candidate_records.iter().filter(|r| r.context_tool_ids.contains(c)).count();
                    matches as f32 / uses
                })
                .sum();
            (hits / context_tool_ids.len() as f32).clamp(0.0, 1.0)
        };

        let successful_positions: Vec<f32> = candidate_records
            .iter()
            .filter(|r| r.success && !r.context_tool_ids.is_empty())
            .map(|r| {
                let total = r.context_tool_ids.len() as f32 + 1.0;
                (r.context_tool_ids.len() as f32) / total
            })
            .collect();
        let sequence_position = if successful_positions.is_empty() {
            0.5
        } else {
            successful_positions.iter().sum::<f32>() / successful_positions.len() as f32
        };

        let newest = candidate_records.iter().map(|r| r.timestamp).max().unwrap();
        let age_days = (Utc::now() - newest).num_seconds().max(0) as f64 / 86_400.0;
        let recency_score = (-age_days / recency_tau_days).exp() as f32;

        let usage_frequency = (uses / 100.0).min(1.0);

        let avg_duration = candidate_records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / uses as f64;
        let mut all_durations: Vec<f64> = store.iter().map(|r| r.duration_ms as f64).collect();
        all_durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p95 = percentile(&all_durations, 0.95).max(1.0);
        let avg_execution_time = (avg_duration / p95).clamp(0.0, 1.0) as f32;

        let preceded_by_failure: Vec<&&TraceRecord> = candidate_records
            .iter()
            .filter(|r| {
                store
                    .iter()
                    .find(|p| p.workflow_id == r.workflow_id && p.step_index + 1 == r.step_index)
                    .is_some_and(|p| !p.success)
            })
            .collect();
        let error_recovery_rate = if preceded_by_failure.is_empty() {
            0.5
        } else {
            preceded_by_failure.iter().filter(|r| r.success).count() as f32 / preceded_by_failure.len() as f32
        };

        let path_lengths: Vec<f32> = candidate_records
            .iter()
            .filter_map(|r| {
                store
                    .iter()
                    .filter(|t| t.workflow_id == r.workflow_id && t.step_index >= r.step_index)
                    .max_by_key(|t| t.step_index)
                    .filter(|terminal| terminal.success)
                    .map(|terminal| (terminal.step_index - r.step_index) as f32)
            })
            .collect();
        let avg_path_length_to_success = if path_lengths.is_empty() {
            3.0
        } else {
            path_lengths.iter().sum::<f32>() / path_lengths.len() as f32
        };
        let path_variance = if path_lengths.len() < 2 {
            0.0
        } else {
            let mean = avg_path_length_to_success;
            path_lengths.iter().map(|p| (p - mean).powi(2)).sum::<f32>() / path_lengths.len() as f32
        };

        let mut error_type_affinity = [0.0_f32; 6];
        let failures = candidate_records.iter().filter(|r| !r.success).count() as f32;
        if failures > 0.0 {
            for kind in ErrorKind::ALL {
                let count = candidate_records
                    .iter()
                    .filter(|r| r.error_kind == Some(kind))
                    .count() as f32;
                error_type_affinity[kind.index()] = count / failures;
            }
        } else {
            error_type_affinity = [0.5; 6];
        }

        TraceStats {
            historical_success_rate,
            contextual_success_rate,
            intent_similar_success_rate,
            cooccurrence_with_context,
            sequence_position,
            recency_score,
            usage_frequency,
            avg_execution_time,
            error_recovery_rate,
            avg_path_length_to_success,
            path_variance,
            error_type_affinity,
        }
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 1.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
