use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ImageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Decode,
    PostProcess,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: ImageId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedImage {
    /// `None` when the file never got far enough to be assigned an identity.
    pub image_id: Option<ImageId>,
    pub name: String,
    pub stage: FailureStage,
    pub reason: String,
}

/// Outcome of a whole run: which images made it to the sink and which did not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: Vec<ImageRecord>,
    pub failed: Vec<FailedImage>,
}

impl RunReport {
    pub fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_success(&mut self, image_id: ImageId, name: impl Into<String>) {
        self.succeeded.push(ImageRecord {
            image_id,
            name: name.into(),
        });
    }

    pub fn record_failure(&mut self, failure: FailedImage) {
        self.failed.push(failure);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// True when at least one image failed.
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<ImageId> {
        self.failed.iter().filter_map(|f| f.image_id).collect()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_tracks_partial_runs() {
        let mut report = RunReport::start();
        report.record_success(0, "a");
        assert!(!report.is_partial());

        report.record_failure(FailedImage {
            image_id: Some(1),
            name: "b".to_string(),
            stage: FailureStage::PostProcess,
            reason: "boom".to_string(),
        });
        report.record_failure(FailedImage {
            image_id: None,
            name: "c".to_string(),
            stage: FailureStage::Decode,
            reason: "truncated".to_string(),
        });
        report.finish();

        assert!(report.is_partial());
        assert_eq!(report.failed_ids(), vec![1]);
        assert_eq!(report.total(), 3);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn report_serializes_stage_in_snake_case() {
        let failure = FailedImage {
            image_id: Some(4),
            name: "x".to_string(),
            stage: FailureStage::PostProcess,
            reason: "r".to_string(),
        };
        let json = serde_json::to_value(&failure).expect("failure should serialize");
        assert_eq!(json["stage"], "post_process");
    }
}
