//! Typed failures raised by the tiling engine.
//!
//! Most functions return `anyhow::Result`; the variants below are attached as
//! the root cause so callers can classify a failure with
//! `error.downcast_ref::<PipelineError>()`.

use crate::types::ImageId;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The pending queue ran dry before every patch of an image was found.
    #[error(
        "consistency violation for image {image_id}: expected {expected} patches, found {found}"
    )]
    ConsistencyViolation {
        image_id: ImageId,
        expected: usize,
        found: usize,
    },

    /// The detached patches do not form a dense, uniformly shaped grid.
    #[error("patch grid for image {image_id} is malformed: {reason}")]
    GridMismatch { image_id: ImageId, reason: String },

    /// The injected transform returned an error for a batch.
    #[error("transform failed on batch {batch_index}")]
    TransformFailure {
        batch_index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The transform broke its one-output-per-input contract.
    #[error("transform returned {actual} outputs for a batch of {expected} patches")]
    TransformContract { expected: usize, actual: usize },

    /// Post-processing or persisting a single image failed.
    #[error("post-processing failed for image {image_id} ({name}): {reason}")]
    PostProcessFailure {
        image_id: ImageId,
        name: String,
        reason: String,
    },

    /// Configuration values cannot drive a run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Whether the failure must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::PostProcessFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_violation_is_fatal_and_downcastable() {
        let error: anyhow::Error = PipelineError::ConsistencyViolation {
            image_id: 3,
            expected: 16,
            found: 15,
        }
        .into();

        let typed = error
            .downcast_ref::<PipelineError>()
            .expect("should downcast to PipelineError");
        assert!(typed.is_fatal());
        assert!(error.to_string().contains("expected 16 patches, found 15"));
    }

    #[test]
    fn transform_failure_names_its_cause_once() {
        let error: anyhow::Error = PipelineError::TransformFailure {
            batch_index: 4,
            source: anyhow::anyhow!("device lost"),
        }
        .into();

        let rendered = format!("{error:#}");
        assert_eq!(rendered, "transform failed on batch 4: device lost");
        assert_eq!(rendered.matches("device lost").count(), 1);
    }

    #[test]
    fn post_process_failure_is_isolated() {
        let error = PipelineError::PostProcessFailure {
            image_id: 1,
            name: "tile_C01R02_x".to_string(),
            reason: "boom".to_string(),
        };
        assert!(!error.is_fatal());
    }
}
