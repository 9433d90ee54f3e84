//! Cleansing engine: validation scoring, deduplication, threshold policy
//!
//! Runs after transformation. Every record gets a quality score; duplicates
//! and (optionally) low-quality records are rejected with reasons, and the
//! survivors form the clean batch in their original order.

mod dedup;
mod validation;

pub use dedup::{DedupConfig, RecentKeyWindow};
pub use validation::{Predicate, ValidationRule};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use syncpipe_common::DataBatch;

use crate::error::{SyncError, SyncResult};
use validation::Validator;

fn default_score_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleansingRules {
    #[serde(default)]
    pub validations: Vec<ValidationRule>,
    #[serde(default)]
    pub dedup: Option<DedupConfig>,
    /// Records scoring below this are flagged
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    /// Exclude flagged records from the commit instead of keeping them
    #[serde(default)]
    pub reject_below_threshold: bool,
    #[serde(default)]
    pub allow_expressions: bool,
}

impl Default for CleansingRules {
    fn default() -> Self {
        Self {
            validations: Vec::new(),
            dedup: None,
            score_threshold: default_score_threshold(),
            reject_below_threshold: false,
            allow_expressions: false,
        }
    }
}

impl CleansingRules {
    pub fn validate(&self) -> SyncResult<()> {
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(SyncError::config(format!(
                "score_threshold must be within [0, 1], got {}",
                self.score_threshold
            )));
        }
        if let Some(dedup) = &self.dedup {
            if dedup.key_fields.is_empty() {
                return Err(SyncError::config("dedup.key_fields must not be empty"));
            }
        }
        Validator::compile(&self.validations, self.allow_expressions).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub row_id: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub row_id: String,
    pub score: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleansingResult {
    pub clean_batch: DataBatch,
    pub rejected: Vec<RejectedRecord>,
    /// One entry per input record, in input order
    pub quality_scores: Vec<QualityScore>,
    /// Dedup keys of the clean records, for the recent window
    pub dedup_keys: Vec<String>,
}

impl CleansingResult {
    pub fn flagged_count(&self) -> usize {
        self.quality_scores.iter().filter(|s| s.flagged).count()
    }
}

#[derive(Debug, Clone)]
pub struct CleansingEngine {
    window: Arc<RecentKeyWindow>,
}

impl Default for CleansingEngine {
    fn default() -> Self {
        Self::new(Arc::new(RecentKeyWindow::new()))
    }
}

impl CleansingEngine {
    pub fn new(window: Arc<RecentKeyWindow>) -> Self {
        Self { window }
    }

    pub fn window(&self) -> &Arc<RecentKeyWindow> {
        &self.window
    }

    pub fn cleanse(&self, batch: &DataBatch, rules: &CleansingRules, now: DateTime<Utc>) -> SyncResult<CleansingResult> {
        let validator = Validator::compile(&rules.validations, rules.allow_expressions)?;
        let assessments: Vec<_> = batch.records.iter().map(|r| validator.assess(r)).collect();
        let scores: Vec<f64> = assessments.iter().map(|a| a.score).collect();

        let mut reasons: Vec<Vec<String>> = vec![Vec::new(); batch.len()];

        let keys: Vec<String> = match &rules.dedup {
            Some(dedup) => {
                let keys: Vec<String> = batch.records.iter().map(|r| dedup.key_for(r)).collect();
                let survivors = dedup::select_survivors(&keys, &batch.records, &scores);
                for (index, beaten_by) in survivors.iter().enumerate() {
                    if let Some(winner) = beaten_by {
                        reasons[index].push(format!("duplicate of record {}", batch.records[*winner].row_id));
                    }
                }
                if dedup.recent_window_secs.is_some() {
                    for (index, key) in keys.iter().enumerate() {
                        if reasons[index].is_empty() && self.window.contains(&batch.source_id, key, now) {
                            reasons[index].push("duplicate key committed by a recent batch".to_string());
                        }
                    }
                }
                keys
            },
            None => Vec::new(),
        };

        let mut quality_scores = Vec::with_capacity(batch.len());
        for (index, record) in batch.records.iter().enumerate() {
            let assessment = &assessments[index];
            let flagged = assessment.score < rules.score_threshold;
            if flagged && rules.reject_below_threshold {
                reasons[index].push(format!(
                    "quality score {:.2} below threshold {:.2} (failed: {})",
                    assessment.score,
                    rules.score_threshold,
                    assessment.failed.join(", ")
                ));
            }
            quality_scores.push(QualityScore {
                row_id: record.row_id.clone(),
                score: assessment.score,
                flagged,
            });
        }

        let mut clean = Vec::new();
        let mut rejected = Vec::new();
        let mut dedup_keys = Vec::new();
        for (index, (record, reasons)) in batch.records.iter().zip(reasons).enumerate() {
            if reasons.is_empty() {
                clean.push(record.clone());
                if let Some(key) = keys.get(index) {
                    dedup_keys.push(key.clone());
                }
            } else {
                rejected.push(RejectedRecord {
                    row_id: record.row_id.clone(),
                    reasons,
                });
            }
        }

        tracing::debug!(
            batch_id = %batch.batch_id,
            clean = clean.len(),
            rejected = rejected.len(),
            "Batch cleansed"
        );

        Ok(CleansingResult {
            clean_batch: batch.with_records(clean),
            rejected,
            quality_scores,
            dedup_keys,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sync::transform::{NormalizationRule, NormalizeOp, TransformPipeline, TransformRules};
    use chrono::Duration;
    use syncpipe_common::{DataRecord, Value};

    fn batch(records: Vec<DataRecord>) -> DataBatch {
        DataBatch::new("crm", 0, Utc::now(), records)
    }

    #[test]
    fn test_normalized_duplicates_collapse() {
        let mut transform = TransformRules::default();
        transform.normalization.push(NormalizationRule {
            fields: vec!["name".into()],
            ops: vec![NormalizeOp::Lowercase, NormalizeOp::Trim],
            strict: false,
        });
        let rules = CleansingRules {
            dedup: Some(DedupConfig {
                key_fields: vec!["id".into(), "name".into()],
                recent_window_secs: None,
            }),
            ..Default::default()
        };
        let raw = batch(vec![
            DataRecord::new("r1").with_field("id", "a").with_field("name", "Bob "),
            DataRecord::new("r2").with_field("id", "a").with_field("name", "bob"),
        ]);

        let transformed = TransformPipeline::new().run(&raw, &transform).unwrap().batch;
        let result = CleansingEngine::default().cleanse(&transformed, &rules, Utc::now()).unwrap();

        assert_eq!(result.clean_batch.len(), 1);
        assert_eq!(result.clean_batch.records[0].get("name"), Some(&Value::from("bob")));
        assert_eq!(result.clean_batch.records[0].row_id, "r1");
        assert_eq!(result.rejected[0].row_id, "r2");
    }

    #[test]
    fn test_threshold_flags_or_rejects() {
        let mut rules = CleansingRules {
            validations: vec![ValidationRule {
                field: "email".into(),
                check: Predicate::Required,
                weight: 1.0,
            }],
            ..Default::default()
        };
        let input = batch(vec![
            DataRecord::new("1").with_field("email", "a@b.io"),
            DataRecord::new("2"),
        ]);

        let engine = CleansingEngine::default();
        let kept = engine.cleanse(&input, &rules, Utc::now()).unwrap();
        assert_eq!(kept.clean_batch.len(), 2);
        assert_eq!(kept.flagged_count(), 1);
        assert!(kept.quality_scores[1].flagged);

        rules.reject_below_threshold = true;
        let strict = engine.cleanse(&input, &rules, Utc::now()).unwrap();
        assert_eq!(strict.clean_batch.len(), 1);
        assert_eq!(strict.rejected[0].row_id, "2");
        assert!(strict.rejected[0].reasons[0].contains("email: required"));
    }

    #[test]
    fn test_recent_window_rejects_cross_batch_duplicates() {
        let rules = CleansingRules {
            dedup: Some(DedupConfig {
                key_fields: vec!["id".into()],
                recent_window_secs: Some(600),
            }),
            ..Default::default()
        };
        let engine = CleansingEngine::default();
        let now = Utc::now();

        let first = engine
            .cleanse(&batch(vec![DataRecord::new("1").with_field("id", 1i64)]), &rules, now)
            .unwrap();
        assert_eq!(first.dedup_keys, vec!["1"]);
        engine
            .window()
            .record("crm", first.dedup_keys, now, Duration::seconds(600));

        let second = engine
            .cleanse(
                &batch(vec![
                    DataRecord::new("1b").with_field("id", 1i64),
                    DataRecord::new("2").with_field("id", 2i64),
                ]),
                &rules,
                now + Duration::seconds(60),
            )
            .unwrap();
        assert_eq!(second.clean_batch.len(), 1);
        assert_eq!(second.rejected[0].row_id, "1b");
    }

    #[test]
    fn test_rules_validate() {
        let mut rules = CleansingRules {
            score_threshold: 1.5,
            ..Default::default()
        };
        assert!(rules.validate().is_err());
        rules.score_threshold = 0.5;
        rules.dedup = Some(DedupConfig {
            key_fields: vec![],
            recent_window_secs: None,
        });
        assert!(rules.validate().is_err());
    }
}
