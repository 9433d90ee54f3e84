//! Transformation pipeline
//!
//! Runs the stages in fixed order: field mapping, type conversion, value
//! transform, enrichment, normalization. Records excluded by a stage never
//! reach the next one. Output is a pure function of the input batch and the
//! rules.

pub mod expr;
mod rules;
mod stages;

pub use expr::{ExprError, Expression};
pub use rules::{
    Enrichment, EnrichmentSource, FieldMapping, NormalizationRule, NormalizeOp, PartialFailurePolicy,
    TransformRules, TypeConversion, ValueOp, ValueTransform,
};
pub use stages::{
    EnrichmentStage, FieldMappingStage, NormalizationStage, RecordError, Stage, StageFailure, StageKind,
    TransformResult, TypeConversionStage, ValueTransformStage,
};

use syncpipe_common::DataBatch;

use crate::error::SyncError;

/// A strict rule failed and the batch was abandoned
#[derive(Debug, Clone, PartialEq)]
pub struct TransformFailure {
    pub stage: StageKind,
    pub row_id: String,
    pub message: String,
    /// Input of the failing stage, kept only under `RetainPartial`
    pub partial: Option<DataBatch>,
}

impl From<TransformFailure> for SyncError {
    fn from(failure: TransformFailure) -> Self {
        let message = if failure.row_id.is_empty() {
            failure.message
        } else {
            format!("record {}: {}", failure.row_id, failure.message)
        };
        SyncError::transform(failure.stage.as_str(), message)
    }
}

pub struct TransformPipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("stages", &self.stages.iter().map(|s| s.kind()).collect::<Vec<_>>())
            .finish()
    }
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self {
            stages: vec![
                Box::new(FieldMappingStage),
                Box::new(TypeConversionStage),
                Box::new(ValueTransformStage),
                Box::new(EnrichmentStage),
                Box::new(NormalizationStage),
            ],
        }
    }

    pub fn run(&self, batch: &DataBatch, rules: &TransformRules) -> Result<TransformResult, TransformFailure> {
        let mut current = batch.clone();
        let mut errors = Vec::new();

        for stage in &self.stages {
            match stage.apply(&current, rules) {
                Ok(result) => {
                    current = result.batch;
                    errors.extend(result.errors);
                },
                Err(failure) => {
                    tracing::warn!(
                        batch_id = %batch.batch_id,
                        stage = %stage.kind(),
                        row_id = %failure.row_id,
                        error = %failure.message,
                        "Strict transform rule failed; batch abandoned"
                    );
                    let partial = match rules.partial_failure {
                        PartialFailurePolicy::RetainPartial => Some(current),
                        PartialFailurePolicy::Discard => None,
                    };
                    return Err(TransformFailure {
                        stage: stage.kind(),
                        row_id: failure.row_id,
                        message: failure.message,
                        partial,
                    });
                },
            }
        }

        Ok(TransformResult {
            batch: current,
            errors,
        })
    }
}
