//! Top-level orchestration: REFILL, DISPATCH, STITCH_ALL, POST_PROCESS_ALL,
//! repeated until every file is consumed, then DRAIN and DONE.
//!
//! The pending queue is owned by the loop and only touched between dispatch
//! rounds. Post-processing runs in the pool while the next round is loaded
//! and dispatched; completions are handed to the sink on this task as they
//! are polled, so the sink sees images in completion order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, MemoryConfig};
use crate::dispatch::{dispatch, DispatchSettings, Transform};
use crate::error::PipelineError;
use crate::loader::{BudgetedLoader, ImageSource, LoaderSettings};
use crate::memory::round_budget;
use crate::pool::{Completion, PostProcPool, WorkItem};
use crate::postproc::PostProcessor;
use crate::report::{FailedImage, FailureStage, RunReport};
use crate::sink::ResultSink;
use crate::stitch::detach_and_stitch;
use crate::types::FileRef;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub window_size: usize,
    pub stride: usize,
    pub batch_size: usize,
    pub extraction_workers: usize,
    pub post_process_workers: usize,
    pub memory: MemoryConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            window_size: config.tiling.window_size,
            stride: config.tiling.stride,
            batch_size: config.inference.batch_size,
            extraction_workers: config.inference.extraction_workers,
            post_process_workers: config.post_process.workers,
            memory: config.memory.clone(),
        }
    }

    fn loader(&self) -> LoaderSettings {
        LoaderSettings {
            window_size: self.window_size,
            stride: self.stride,
            inflation_factor: self.memory.inflation_factor,
        }
    }

    fn dispatch(&self) -> DispatchSettings {
        DispatchSettings {
            batch_size: self.batch_size,
            extraction_workers: self.extraction_workers,
            window_size: self.window_size,
        }
    }
}

pub struct Pipeline<S, T, K> {
    loader: BudgetedLoader<S>,
    transform: T,
    pool: PostProcPool,
    sink: K,
    settings: PipelineSettings,
}

impl<S, T, K> Pipeline<S, T, K>
where
    S: ImageSource,
    T: Transform,
    K: ResultSink,
{
    pub fn new(
        source: S,
        transform: T,
        processor: Arc<dyn PostProcessor>,
        sink: K,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            loader: BudgetedLoader::new(source, settings.loader()),
            pool: PostProcPool::new(processor, settings.post_process_workers),
            transform,
            sink,
            settings,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Process every file. Must run on a multi-threaded Tokio runtime.
    ///
    /// Returns `Err` only for fatal failures (consistency, grid, transform,
    /// final merge). Per-image failures are recorded in the report.
    pub async fn run(&mut self, files: Vec<FileRef>) -> Result<RunReport> {
        let mut report = RunReport::start();
        let mut pending: VecDeque<FileRef> = files.into();
        let started = Instant::now();
        info!(
            run_id = %report.run_id,
            files = pending.len(),
            window_size = self.settings.window_size,
            stride = self.settings.stride,
            batch_size = self.settings.batch_size,
            post_process_workers = self.pool.workers(),
            "Starting run"
        );

        let mut round = 0usize;
        while self.loader.has_pending(&pending) {
            round += 1;

            // REFILL
            let budget = round_budget(&self.settings.memory);
            let batch = self.loader.fill(&mut pending, budget)?;
            for failure in batch.rejected {
                report.record_failure(failure);
            }
            if batch.over_budget {
                warn!(round, budget_bytes = budget, "Round runs over the memory budget");
            }
            if batch.images.is_empty() {
                continue;
            }
            let images = batch.images;
            let patches: usize = images.iter().map(|image| image.patch_count()).sum();

            // DISPATCH
            let transform = &mut self.transform;
            let dispatch_settings = self.settings.dispatch();
            let mut queue =
                tokio::task::block_in_place(|| dispatch(&images, transform, dispatch_settings))?;

            // STITCH_ALL
            for image in &images {
                let stitched = detach_and_stitch(&mut queue, image)?;
                debug!(image = %image.name, id = image.id, "Stitched image");
                self.pool.submit(WorkItem::from(stitched));
            }
            if let Some(stray) = queue.iter().next() {
                return Err(PipelineError::GridMismatch {
                    image_id: stray.image_id,
                    reason: format!("{} patches were not claimed by any cached image", queue.len()),
                }
                .into());
            }
            drop(images);

            // POST_PROCESS_ALL: hand over whatever is already done, never wait here
            for completion in self.pool.poll_ready() {
                self.handle_completion(completion, &mut report);
            }

            info!(
                round,
                patches,
                remaining_files = pending.len(),
                in_flight = self.pool.pending(),
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Round complete"
            );
        }

        // DRAIN
        if !self.pool.is_idle() {
            info!(in_flight = self.pool.pending(), "Waiting for post-processing to drain");
        }
        while let Some(completion) = self.pool.next_completed().await {
            self.handle_completion(completion, &mut report);
        }

        // DONE
        report.finish();
        self.sink.finish(&report)?;

        info!(
            run_id = %report.run_id,
            rounds = round,
            images = report.total(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Run finished"
        );
        if report.is_partial() {
            warn!(failed_ids = ?report.failed_ids(), "Some images failed");
        }
        Ok(report)
    }

    fn handle_completion(&mut self, completion: Completion, report: &mut RunReport) {
        let Completion {
            image_id,
            name,
            outcome,
        } = completion;

        let processed = match outcome {
            Ok(processed) => processed,
            Err(error) => {
                let failure = PipelineError::PostProcessFailure {
                    image_id,
                    name: name.clone(),
                    reason: format!("{error:#}"),
                };
                error!(error = %failure, "Image failed");
                report.record_failure(FailedImage {
                    image_id: Some(image_id),
                    name,
                    stage: FailureStage::PostProcess,
                    reason: format!("{error:#}"),
                });
                return;
            }
        };

        match self.sink.persist(&processed) {
            Ok(()) => {
                debug!(image = %name, id = image_id, "Image persisted");
                report.record_success(image_id, name);
            }
            Err(error) => {
                let reason = format!("{error:#}");
                error!(image = %name, id = image_id, %reason, "Failed to persist image");
                report.record_failure(FailedImage {
                    image_id: Some(image_id),
                    name,
                    stage: FailureStage::Persist,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::{anyhow, bail};
    use ndarray::{s, Array2, Array3, Array4};

    use super::*;
    use crate::postproc::{PostProcOutput, ProcessedImage};
    use crate::types::StitchedResult;

    struct Solid;

    impl ImageSource for Solid {
        fn decode(&self, file: &FileRef) -> Result<Array3<u8>> {
            if file.name.starts_with("broken") {
                bail!("truncated file");
            }
            Ok(Array3::from_elem((12, 9, 3), file.name.len() as u8))
        }
    }

    #[derive(Default)]
    struct Recording {
        persisted: Vec<String>,
        finished: bool,
    }

    impl ResultSink for Recording {
        fn persist(&mut self, image: &ProcessedImage) -> Result<()> {
            if image.name == "reject" {
                bail!("disk full");
            }
            self.persisted.push(image.name.clone());
            Ok(())
        }

        fn finish(&mut self, _report: &RunReport) -> Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn settings(post_process_workers: usize) -> PipelineSettings {
        PipelineSettings {
            window_size: 8,
            stride: 4,
            batch_size: 5,
            extraction_workers: 0,
            post_process_workers,
            memory: MemoryConfig {
                budget_fraction: 1.0,
                inflation_factor: 1.0,
                available_bytes_override: Some(2_000),
            },
        }
    }

    fn crop(batch: Array4<u8>) -> Result<Array4<f32>> {
        Ok(batch.slice(s![.., 2..6, 2..6, ..]).mapv(f32::from))
    }

    fn empty_output(stitched: &StitchedResult) -> Result<PostProcOutput> {
        let (h, w) = (stitched.prediction_map.shape()[0], stitched.prediction_map.shape()[1]);
        Ok(PostProcOutput {
            instance_map: Array2::zeros((h, w)),
            instances: BTreeMap::new(),
            annotation: String::new(),
        })
    }

    fn files(names: &[&str]) -> Vec<FileRef> {
        names.iter().map(|name| FileRef::new(format!("{name}.png"))).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_file_reaches_the_sink_across_rounds() {
        // each 12x9 image pads to 16x16x3 = 768 bytes, so two fit per round
        let mut pipeline = Pipeline::new(Solid, crop, Arc::new(empty_output), Recording::default(), settings(2));
        let report = pipeline
            .run(files(&["a", "bb", "ccc", "dddd", "eeeee"]))
            .await
            .expect("run should succeed");

        assert!(!report.is_partial());
        assert_eq!(report.succeeded.len(), 5);
        let sink = pipeline.into_sink();
        assert!(sink.finished);
        let mut persisted = sink.persisted;
        persisted.sort();
        assert_eq!(persisted, vec!["a", "bb", "ccc", "dddd", "eeeee"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decode_and_persist_failures_are_isolated() {
        let mut pipeline = Pipeline::new(Solid, crop, Arc::new(empty_output), Recording::default(), settings(0));
        let report = pipeline
            .run(files(&["ok", "broken", "reject"]))
            .await
            .expect("run should complete");

        assert!(report.is_partial());
        let stages: Vec<FailureStage> = report.failed.iter().map(|f| f.stage).collect();
        assert_eq!(stages, vec![FailureStage::Decode, FailureStage::Persist]);
        assert_eq!(pipeline.sink().persisted, vec!["ok"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transform_failure_aborts_the_run() {
        let failing = |_batch: Array4<u8>| -> Result<Array4<f32>> { Err(anyhow!("device lost")) };
        let mut pipeline = Pipeline::new(Solid, failing, Arc::new(empty_output), Recording::default(), settings(1));
        let error = pipeline.run(files(&["a"])).await.expect_err("must fail");

        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::TransformFailure { .. })
        ));
        assert!(!pipeline.sink().finished);
    }
}
