//! Validation predicates and quality scoring

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use syncpipe_common::{DataRecord, Value};

use crate::error::{SyncError, SyncResult};
use crate::sync::transform::Expression;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Predicate {
    Required,
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Pattern {
        regex: String,
    },
    OneOf {
        values: Vec<serde_json::Value>,
    },
    MinLength {
        len: usize,
    },
    MaxLength {
        len: usize,
    },
    /// Boolean expression over the whole record
    Expression {
        expr: String,
    },
}

impl Predicate {
    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Required => "required",
            Predicate::Range { .. } => "range",
            Predicate::Pattern { .. } => "pattern",
            Predicate::OneOf { .. } => "one_of",
            Predicate::MinLength { .. } => "min_length",
            Predicate::MaxLength { .. } => "max_length",
            Predicate::Expression { .. } => "expression",
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub field: String,
    #[serde(flatten)]
    pub check: Predicate,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

#[derive(Debug)]
enum Compiled {
    Plain,
    Pattern(Regex),
    Expression(Expression),
}

/// Validation rules with regexes and expressions parsed once
#[derive(Debug)]
pub(crate) struct Validator<'a> {
    checks: Vec<(&'a ValidationRule, Compiled)>,
    total_weight: f64,
}

/// Score of one record plus the names of the checks it failed
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Assessment {
    pub score: f64,
    pub failed: Vec<String>,
}

impl<'a> Validator<'a> {
    pub fn compile(rules: &'a [ValidationRule], allow_expressions: bool) -> SyncResult<Self> {
        let mut checks = Vec::with_capacity(rules.len());
        for rule in rules {
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(SyncError::config(format!(
                    "Validation weight for '{}' must be a non-negative number",
                    rule.field
                )));
            }
            let compiled = match &rule.check {
                Predicate::Pattern { regex } => Compiled::Pattern(
                    Regex::new(regex)
                        .map_err(|e| SyncError::config(format!("Invalid pattern for '{}': {}", rule.field, e)))?,
                ),
                Predicate::Expression { expr } => {
                    if !allow_expressions {
                        return Err(SyncError::config(format!(
                            "Expression check on '{}' used but allow_expressions is false",
                            rule.field
                        )));
                    }
                    Compiled::Expression(
                        Expression::parse(expr)
                            .map_err(|e| SyncError::config(format!("Invalid expression '{}': {}", expr, e)))?,
                    )
                },
                _ => Compiled::Plain,
            };
            checks.push((rule, compiled));
        }
        let total_weight = rules.iter().map(|r| r.weight).sum();
        Ok(Self { checks, total_weight })
    }

    pub fn assess(&self, record: &DataRecord) -> Assessment {
        if self.checks.is_empty() || self.total_weight <= 0.0 {
            return Assessment {
                score: 1.0,
                failed: Vec::new(),
            };
        }

        let mut passed_weight = 0.0;
        let mut failed = Vec::new();
        for (rule, compiled) in &self.checks {
            if passes(rule, compiled, record) {
                passed_weight += rule.weight;
            } else {
                failed.push(format!("{}: {}", rule.field, rule.check.name()));
            }
        }

        Assessment {
            score: (passed_weight / self.total_weight).clamp(0.0, 1.0),
            failed,
        }
    }
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_text().chars().count(),
    }
}

/// Missing and null values pass every check except `required`
fn passes(rule: &ValidationRule, compiled: &Compiled, record: &DataRecord) -> bool {
    let value = record.value_or_null(&rule.field);

    if let Compiled::Expression(expr) = compiled {
        return expr.evaluate_bool(record).unwrap_or(false);
    }
    if let Predicate::Required = rule.check {
        return match &value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        };
    }
    if value.is_null() {
        return true;
    }

    match (&rule.check, compiled) {
        (Predicate::Range { min, max }, _) => match value.as_f64() {
            Some(n) => min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m),
            None => false,
        },
        (_, Compiled::Pattern(regex)) => regex.is_match(&value.to_text()),
        (Predicate::OneOf { values }, _) => values
            .iter()
            .any(|allowed| Value::from_json(allowed.clone()).compare(&value) == Some(Ordering::Equal)),
        (Predicate::MinLength { len }, _) => text_len(&value) >= *len,
        (Predicate::MaxLength { len }, _) => text_len(&value) <= *len,
        _ => true,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn rule(field: &str, check: Predicate) -> ValidationRule {
        ValidationRule {
            field: field.into(),
            check,
            weight: 1.0,
        }
    }

    #[test]
    fn test_predicates() {
        let rules = vec![
            rule("email", Predicate::Required),
            rule(
                "email",
                Predicate::Pattern {
                    regex: r"^[^@\s]+@[^@\s]+$".into(),
                },
            ),
            rule(
                "age",
                Predicate::Range {
                    min: Some(0.0),
                    max: Some(130.0),
                },
            ),
            rule(
                "plan",
                Predicate::OneOf {
                    values: vec![serde_json::json!("free"), serde_json::json!("pro")],
                },
            ),
        ];
        let validator = Validator::compile(&rules, false).unwrap();

        let good = DataRecord::new("1")
            .with_field("email", "a@b.io")
            .with_field("age", 40i64)
            .with_field("plan", "pro");
        assert_eq!(validator.assess(&good).score, 1.0);

        let bad = DataRecord::new("2").with_field("age", 200i64).with_field("plan", "gold");
        let assessment = validator.assess(&bad);
        // missing email fails required but passes pattern
        assert_eq!(assessment.score, 0.25);
        assert_eq!(assessment.failed, vec!["email: required", "age: range", "plan: one_of"]);
    }

    #[test]
    fn test_weighted_score() {
        let mut rules = vec![
            rule("name", Predicate::Required),
            rule("name", Predicate::MaxLength { len: 3 }),
        ];
        rules[0].weight = 3.0;
        let validator = Validator::compile(&rules, false).unwrap();
        let record = DataRecord::new("1").with_field("name", "Alexander");
        assert_eq!(validator.assess(&record).score, 0.75);
    }

    #[test]
    fn test_no_predicates_scores_one() {
        let validator = Validator::compile(&[], false).unwrap();
        assert_eq!(validator.assess(&DataRecord::new("1")).score, 1.0);
    }

    #[test]
    fn test_expression_checks_need_opt_in() {
        let rules = vec![rule(
            "total",
            Predicate::Expression {
                expr: "total >= subtotal".into(),
            },
        )];
        assert!(Validator::compile(&rules, false).is_err());

        let validator = Validator::compile(&rules, true).unwrap();
        let ok = DataRecord::new("1").with_field("total", 10i64).with_field("subtotal", 8i64);
        let not_ok = DataRecord::new("2").with_field("total", 5i64).with_field("subtotal", 8i64);
        assert_eq!(validator.assess(&ok).score, 1.0);
        assert_eq!(validator.assess(&not_ok).score, 0.0);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rules = vec![rule("x", Predicate::Pattern { regex: "(".into() })];
        assert!(matches!(Validator::compile(&rules, false), Err(SyncError::Config(_))));
    }
}
