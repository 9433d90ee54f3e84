//! The five transformation stages
//!
//! Every stage maps records one at a time. A failing record is routed to
//! the error list unless the rule that failed is `strict`, in which case
//! the stage stops and the whole batch fails.

use chrono::{SecondsFormat, SubsecRound};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use syncpipe_common::types::parse_datetime;
use syncpipe_common::{DataBatch, DataRecord, Value};

use super::expr::{round_to, Expression};
use super::rules::{EnrichmentSource, NormalizeOp, TransformRules, ValueOp};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    FieldMapping,
    TypeConversion,
    ValueTransform,
    Enrichment,
    Normalization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::FieldMapping => "field_mapping",
            StageKind::TypeConversion => "type_conversion",
            StageKind::ValueTransform => "value_transform",
            StageKind::Enrichment => "enrichment",
            StageKind::Normalization => "normalization",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record excluded by a non-strict rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    pub row_id: String,
    pub stage: StageKind,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub batch: DataBatch,
    pub errors: Vec<RecordError>,
}

/// A strict rule failed; the batch cannot continue
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub row_id: String,
    pub message: String,
}

/// Per-record rule failure
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RuleError {
    pub message: String,
    pub strict: bool,
}

impl RuleError {
    fn new(message: impl Into<String>, strict: bool) -> Self {
        Self {
            message: message.into(),
            strict,
        }
    }
}

pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure>;
}

fn map_records<F>(batch: &DataBatch, stage: StageKind, mut f: F) -> Result<TransformResult, StageFailure>
where
    F: FnMut(&DataRecord) -> Result<DataRecord, RuleError>,
{
    let mut records = Vec::with_capacity(batch.len());
    let mut errors = Vec::new();
    for record in &batch.records {
        match f(record) {
            Ok(out) => records.push(out),
            Err(e) if e.strict => {
                return Err(StageFailure {
                    row_id: record.row_id.clone(),
                    message: e.message,
                })
            },
            Err(e) => {
                tracing::debug!(row_id = %record.row_id, stage = %stage, error = %e.message, "Record excluded");
                errors.push(RecordError {
                    row_id: record.row_id.clone(),
                    stage,
                    kind: ErrorKind::Transform,
                    message: e.message,
                });
            },
        }
    }
    Ok(TransformResult {
        batch: batch.with_records(records),
        errors,
    })
}

/// Parse every expression of a rule list once per batch
fn compile<'a, I>(exprs: I) -> Result<Vec<Option<Expression>>, StageFailure>
where
    I: Iterator<Item = Option<&'a str>>,
{
    exprs
        .map(|expr| {
            expr.map(Expression::parse).transpose().map_err(|e| StageFailure {
                row_id: String::new(),
                message: format!("invalid expression: {}", e),
            })
        })
        .collect()
}

pub struct FieldMappingStage;

impl Stage for FieldMappingStage {
    fn kind(&self) -> StageKind {
        StageKind::FieldMapping
    }

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure> {
        let Some(mapping) = &rules.field_mapping else {
            return Ok(TransformResult {
                batch: batch.clone(),
                errors: Vec::new(),
            });
        };

        map_records(batch, self.kind(), |record| {
            let mut fields = BTreeMap::new();
            if mapping.pass_through {
                for (name, value) in &record.fields {
                    if !mapping.mappings.contains_key(name) {
                        fields.insert(name.clone(), value.clone());
                    }
                }
            }
            for (source, target) in &mapping.mappings {
                if let Some(value) = record.get(source) {
                    fields.insert(target.clone(), value.clone());
                }
            }
            Ok(record.with_fields(fields))
        })
    }
}

pub struct TypeConversionStage;

impl Stage for TypeConversionStage {
    fn kind(&self) -> StageKind {
        StageKind::TypeConversion
    }

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure> {
        map_records(batch, self.kind(), |record| {
            let mut fields = record.fields.clone();
            for conversion in &rules.type_conversions {
                let Some(value) = fields.get(&conversion.field) else {
                    continue;
                };
                let converted = value
                    .coerce(conversion.target, conversion.format.as_deref())
                    .map_err(|e| RuleError::new(format!("{}: {}", conversion.field, e), conversion.strict))?;
                fields.insert(conversion.field.clone(), converted);
            }
            Ok(record.with_fields(fields))
        })
    }
}

fn string_op(value: &Value, op: &str, f: impl FnOnce(&str) -> String) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(f(s))),
        other => Err(format!("{} expects a string, got {}", op, other.to_text())),
    }
}

fn apply_value_op(op: &ValueOp, value: &Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match op {
        ValueOp::Trim => string_op(value, "trim", |s| s.trim().to_string()),
        ValueOp::Lowercase => string_op(value, "lowercase", str::to_lowercase),
        ValueOp::Uppercase => string_op(value, "uppercase", str::to_uppercase),
        ValueOp::Replace { from, to } => string_op(value, "replace", |s| {
            if from.is_empty() {
                s.to_string()
            } else {
                s.replace(from.as_str(), to)
            }
        }),
        ValueOp::Truncate { max_len } => string_op(value, "truncate", |s| s.chars().take(*max_len).collect()),
        ValueOp::Scale { factor } => match value {
            Value::Int(i) if factor.fract() == 0.0 && factor.abs() < i64::MAX as f64 => i
                .checked_mul(*factor as i64)
                .map(Value::Int)
                .ok_or_else(|| "integer overflow while scaling".to_string()),
            Value::Int(i) => Ok(Value::Float(*i as f64 * factor)),
            Value::Float(f) => Ok(Value::Float(f * factor)),
            other => Err(format!("scale expects a number, got {}", other.to_text())),
        },
        ValueOp::Round { decimals } => match value {
            Value::Int(_) => Ok(value.clone()),
            Value::Float(f) => Ok(Value::Float(round_to(*f, i64::from(*decimals)))),
            other => Err(format!("round expects a number, got {}", other.to_text())),
        },
        // handled before the null short-circuit
        ValueOp::Default { .. } | ValueOp::Expression { .. } => Ok(value.clone()),
    }
}

pub struct ValueTransformStage;

impl Stage for ValueTransformStage {
    fn kind(&self) -> StageKind {
        StageKind::ValueTransform
    }

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure> {
        if rules.value_transforms.is_empty() {
            return Ok(TransformResult {
                batch: batch.clone(),
                errors: Vec::new(),
            });
        }

        let compiled = compile(rules.value_transforms.iter().map(|t| match &t.op {
            ValueOp::Expression { expr } => Some(expr.as_str()),
            _ => None,
        }))?;

        map_records(batch, self.kind(), |record| {
            let mut current = record.clone();
            for (transform, expr) in rules.value_transforms.iter().zip(&compiled) {
                let value = current.value_or_null(&transform.field);
                let next = match (&transform.op, expr) {
                    (ValueOp::Default { value: default }, _) => {
                        if value.is_null() {
                            Value::from_json(default.clone())
                        } else {
                            value
                        }
                    },
                    (ValueOp::Expression { .. }, Some(expr)) => expr
                        .evaluate(&current)
                        .map_err(|e| RuleError::new(format!("{}: {}", transform.field, e), transform.strict))?,
                    (op, _) => {
                        if current.get(&transform.field).is_none() {
                            continue;
                        }
                        apply_value_op(op, &value)
                            .map_err(|e| RuleError::new(format!("{}: {}", transform.field, e), transform.strict))?
                    },
                };
                let mut fields = current.fields.clone();
                fields.insert(transform.field.clone(), next);
                current = current.with_fields(fields);
            }
            Ok(current)
        })
    }
}

pub struct EnrichmentStage;

impl Stage for EnrichmentStage {
    fn kind(&self) -> StageKind {
        StageKind::Enrichment
    }

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure> {
        if rules.enrichments.is_empty() {
            return Ok(TransformResult {
                batch: batch.clone(),
                errors: Vec::new(),
            });
        }

        let compiled = compile(rules.enrichments.iter().map(|e| match &e.source {
            EnrichmentSource::Expression { expr } => Some(expr.as_str()),
            _ => None,
        }))?;

        map_records(batch, self.kind(), |record| {
            let mut current = record.clone();
            for (enrichment, expr) in rules.enrichments.iter().zip(&compiled) {
                let value = match (&enrichment.source, expr) {
                    (EnrichmentSource::Constant { value }, _) => Value::from_json(value.clone()),
                    (EnrichmentSource::Lookup { field, table, default }, _) => {
                        let key = current.value_or_null(field).to_text();
                        match table.get(&key).or(default.as_ref()) {
                            Some(found) => Value::from_json(found.clone()),
                            None => {
                                return Err(RuleError::new(
                                    format!("{}: no lookup entry for '{}'", enrichment.target, key),
                                    enrichment.strict,
                                ))
                            },
                        }
                    },
                    (EnrichmentSource::Concat { fields, separator }, _) => Value::String(
                        fields
                            .iter()
                            .map(|f| current.value_or_null(f).to_text())
                            .collect::<Vec<_>>()
                            .join(separator),
                    ),
                    (EnrichmentSource::SourceId, _) => Value::String(batch.source_id.clone()),
                    (EnrichmentSource::BatchSequence, _) => Value::Int(i64::from(batch.sequence)),
                    (EnrichmentSource::BatchTimestamp, _) => Value::DateTime(batch.produced_at),
                    (EnrichmentSource::Expression { .. }, Some(expr)) => expr
                        .evaluate(&current)
                        .map_err(|e| RuleError::new(format!("{}: {}", enrichment.target, e), enrichment.strict))?,
                    (EnrichmentSource::Expression { expr }, None) => {
                        return Err(RuleError::new(format!("expression '{}' was not compiled", expr), true))
                    },
                };
                let mut fields = current.fields.clone();
                fields.insert(enrichment.target.clone(), value);
                current = current.with_fields(fields);
            }
            Ok(current)
        })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Non-numeric strings are left alone
fn canonical_number(value: &Value) -> Value {
    match value {
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() && f.abs() < i64::MAX as f64 => Value::Int(*f as i64),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Value::Int(i);
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() => canonical_number(&Value::Float(f)),
                _ => value.clone(),
            }
        },
        other => other.clone(),
    }
}

fn normalize_value(op: NormalizeOp, value: &Value) -> Result<Value, String> {
    match (op, value) {
        (NormalizeOp::Trim, Value::String(s)) => Ok(Value::String(s.trim().to_string())),
        (NormalizeOp::Lowercase, Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        (NormalizeOp::CollapseWhitespace, Value::String(s)) => Ok(Value::String(collapse_whitespace(s))),
        (NormalizeOp::Rfc3339, Value::DateTime(dt)) => Ok(Value::DateTime(dt.trunc_subsecs(0))),
        (NormalizeOp::Rfc3339, Value::String(s)) => parse_datetime(s.trim(), None)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .ok_or_else(|| format!("'{}' is not a datetime", s)),
        (NormalizeOp::CanonicalNumber, v) => Ok(canonical_number(v)),
        (_, other) => Ok(other.clone()),
    }
}

pub struct NormalizationStage;

impl Stage for NormalizationStage {
    fn kind(&self) -> StageKind {
        StageKind::Normalization
    }

    fn apply(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, StageFailure> {
        if rules.normalization.is_empty() {
            return Ok(TransformResult {
                batch: batch.clone(),
                errors: Vec::new(),
            });
        }

        map_records(batch, self.kind(), |record| {
            let mut fields = record.fields.clone();
            for rule in &rules.normalization {
                for field in &rule.fields {
                    let Some(mut value) = fields.get(field).cloned() else {
                        continue;
                    };
                    for op in &rule.ops {
                        value = normalize_value(*op, &value)
                            .map_err(|e| RuleError::new(format!("{}: {}", field, e), rule.strict))?;
                    }
                    fields.insert(field.clone(), value);
                }
            }
            Ok(record.with_fields(fields))
        })
    }
}
