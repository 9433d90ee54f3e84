//! Declarative transformation rules
//!
//! Rules are plain data loaded from the jobs file. The only escape hatch
//! for custom logic is the restricted expression language, and it is off
//! unless `allow_expressions = true`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use syncpipe_common::FieldType;

use super::expr::Expression;
use crate::error::{SyncError, SyncResult};

/// What happens to the batch when a strict rule fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialFailurePolicy {
    /// Drop everything; the failure carries no batch
    #[default]
    Discard,
    /// Attach the last successfully transformed batch to the failure
    RetainPartial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransformRules {
    #[serde(default)]
    pub field_mapping: Option<FieldMapping>,
    #[serde(default)]
    pub type_conversions: Vec<TypeConversion>,
    #[serde(default)]
    pub value_transforms: Vec<ValueTransform>,
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
    #[serde(default)]
    pub normalization: Vec<NormalizationRule>,
    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,
    #[serde(default)]
    pub allow_expressions: bool,
}

/// Source field -> target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldMapping {
    pub mappings: BTreeMap<String, String>,
    /// Keep unmapped fields under their original names
    #[serde(default)]
    pub pass_through: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeConversion {
    pub field: String,
    pub target: FieldType,
    /// chrono format string tried first for datetime targets
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ValueOp {
    Trim,
    Lowercase,
    Uppercase,
    Scale { factor: f64 },
    Round { decimals: u32 },
    Replace { from: String, to: String },
    Truncate { max_len: usize },
    /// Fill a missing or null field
    Default { value: serde_json::Value },
    Expression { expr: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueTransform {
    pub field: String,
    #[serde(flatten)]
    pub op: ValueOp,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnrichmentSource {
    Constant {
        value: serde_json::Value,
    },
    /// Map the value of `field` through a static table
    Lookup {
        field: String,
        table: BTreeMap<String, serde_json::Value>,
        #[serde(default)]
        default: Option<serde_json::Value>,
    },
    Concat {
        fields: Vec<String>,
        #[serde(default)]
        separator: String,
    },
    SourceId,
    BatchSequence,
    /// The batch's `produced_at`, never the wall clock
    BatchTimestamp,
    Expression {
        expr: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub target: String,
    #[serde(flatten)]
    pub source: EnrichmentSource,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeOp {
    Trim,
    Lowercase,
    CollapseWhitespace,
    /// Datetimes and datetime-like strings to RFC 3339, second precision, `Z` suffix
    Rfc3339,
    /// Whole floats to ints, numeric strings to numbers
    CanonicalNumber,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRule {
    pub fields: Vec<String>,
    pub ops: Vec<NormalizeOp>,
    #[serde(default)]
    pub strict: bool,
}

impl TransformRules {
    fn expressions(&self) -> impl Iterator<Item = &str> {
        let value_exprs = self.value_transforms.iter().filter_map(|t| match &t.op {
            ValueOp::Expression { expr } => Some(expr.as_str()),
            _ => None,
        });
        let enrich_exprs = self.enrichments.iter().filter_map(|e| match &e.source {
            EnrichmentSource::Expression { expr } => Some(expr.as_str()),
            _ => None,
        });
        value_exprs.chain(enrich_exprs)
    }

    /// Reject expressions when they are not allowed and check that every one parses
    pub fn validate(&self) -> SyncResult<()> {
        for expr in self.expressions() {
            if !self.allow_expressions {
                return Err(SyncError::config(format!(
                    "Expression '{}' used but allow_expressions is false",
                    expr
                )));
            }
            Expression::parse(expr)
                .map_err(|e| SyncError::config(format!("Invalid expression '{}': {}", expr, e)))?;
        }
        Ok(())
    }

    /// Whether output depends on batch metadata as well as record content
    pub fn uses_batch_metadata(&self) -> bool {
        self.enrichments.iter().any(|e| {
            matches!(
                e.source,
                EnrichmentSource::SourceId | EnrichmentSource::BatchSequence | EnrichmentSource::BatchTimestamp
            )
        })
    }
}
