//! Bounded post-processing pool.
//!
//! Each stitched image is processed independently on a blocking thread, at
//! most `workers` at a time. Results are collected in completion order. A
//! failed or panicking task never cancels its siblings: every submitted item
//! produces exactly one [`Completion`] carrying its image identity.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::postproc::{PostProcessor, ProcessedImage};
use crate::types::{ImageId, StitchedResult};

/// One image waiting for or undergoing post-processing.
#[derive(Debug)]
pub struct WorkItem {
    pub image_id: ImageId,
    pub name: String,
    pub stitched: StitchedResult,
}

impl From<StitchedResult> for WorkItem {
    fn from(stitched: StitchedResult) -> Self {
        Self {
            image_id: stitched.image_id,
            name: stitched.name.clone(),
            stitched,
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub image_id: ImageId,
    pub name: String,
    pub outcome: Result<ProcessedImage>,
}

pub struct PostProcPool {
    processor: Arc<dyn PostProcessor>,
    workers: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Completion>,
    ready: VecDeque<Completion>,
}

impl PostProcPool {
    /// `workers == 0` processes every item inline inside [`submit`](Self::submit).
    pub fn new(processor: Arc<dyn PostProcessor>, workers: usize) -> Self {
        Self {
            processor,
            workers,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Items submitted but not yet handed back.
    pub fn pending(&self) -> usize {
        self.tasks.len() + self.ready.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Queue `item` for processing. Must be called from within a Tokio runtime
    /// unless the pool is inline.
    pub fn submit(&mut self, item: WorkItem) {
        if self.workers == 0 {
            let completion = run_item(self.processor.as_ref(), item);
            self.ready.push_back(completion);
            return;
        }

        let processor = Arc::clone(&self.processor);
        let semaphore = Arc::clone(&self.semaphore);
        self.tasks.spawn(async move {
            let image_id = item.image_id;
            let name = item.name.clone();
            let _permit = semaphore.acquire_owned().await;
            match tokio::task::spawn_blocking(move || run_item(processor.as_ref(), item)).await {
                Ok(completion) => completion,
                Err(join_error) => Completion {
                    image_id,
                    name,
                    outcome: Err(anyhow!("post-processing task did not complete: {join_error}")),
                },
            }
        });
    }

    /// Every completion available right now, without waiting.
    pub fn poll_ready(&mut self) -> Vec<Completion> {
        let mut done: Vec<Completion> = self.ready.drain(..).collect();
        while let Some(joined) = self.tasks.try_join_next() {
            done.push(flatten(joined));
        }
        done
    }

    /// Wait for the next completion; `None` once nothing is outstanding.
    pub async fn next_completed(&mut self) -> Option<Completion> {
        if let Some(completion) = self.ready.pop_front() {
            return Some(completion);
        }
        self.tasks.join_next().await.map(flatten)
    }
}

fn flatten(joined: Result<Completion, tokio::task::JoinError>) -> Completion {
    // the wrapper task never panics and the set is never aborted
    joined.unwrap_or_else(|join_error| Completion {
        image_id: ImageId::MAX,
        name: String::new(),
        outcome: Err(anyhow!("post-processing wrapper task failed: {join_error}")),
    })
}

fn run_item(processor: &dyn PostProcessor, item: WorkItem) -> Completion {
    let started = Instant::now();
    let WorkItem {
        image_id,
        name,
        stitched,
    } = item;

    let outcome = match catch_unwind(AssertUnwindSafe(|| processor.process(&stitched))) {
        Ok(Ok(output)) => Ok(ProcessedImage::new(stitched, output)),
        Ok(Err(error)) => Err(error),
        Err(payload) => Err(anyhow!(
            "{} panicked: {}",
            processor.name(),
            panic_message(payload.as_ref())
        )),
    };

    debug!(
        image = %name,
        id = image_id,
        ok = outcome.is_ok(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Post-processing finished"
    );
    Completion {
        image_id,
        name,
        outcome,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::bail;
    use ndarray::{Array2, Array3, ArrayD, IxDyn};

    use super::*;
    use crate::postproc::PostProcOutput;
    use crate::types::{ImageShape, OverlayMetadata};

    fn item(image_id: ImageId) -> WorkItem {
        StitchedResult {
            image_id,
            name: format!("img{image_id}"),
            prediction_map: ArrayD::from_elem(IxDyn(&[2, 2]), image_id as f32),
            overlay: OverlayMetadata {
                source: Array3::zeros((2, 2, 3)),
                original_shape: ImageShape::new(2, 2, 3),
                top_left_offset: (0, 0),
                placement: None,
            },
        }
        .into()
    }

    fn processor_failing_on(bad: ImageId) -> Arc<dyn PostProcessor> {
        Arc::new(move |stitched: &StitchedResult| -> Result<PostProcOutput> {
            if stitched.image_id == bad {
                bail!("deliberate failure");
            }
            Ok(PostProcOutput {
                instance_map: Array2::zeros((2, 2)),
                instances: BTreeMap::new(),
                annotation: String::new(),
            })
        })
    }

    async fn drain(pool: &mut PostProcPool) -> Vec<Completion> {
        let mut done = pool.poll_ready();
        while let Some(completion) = pool.next_completed().await {
            done.push(completion);
        }
        done
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pooled_failure_does_not_cancel_siblings() {
        let mut pool = PostProcPool::new(processor_failing_on(2), 3);
        for id in 0..6 {
            pool.submit(item(id));
        }
        let done = drain(&mut pool).await;

        assert_eq!(done.len(), 6);
        let mut failed: Vec<ImageId> = done
            .iter()
            .filter(|c| c.outcome.is_err())
            .map(|c| c.image_id)
            .collect();
        failed.sort_unstable();
        assert_eq!(failed, vec![2]);
        assert!(pool.is_idle());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inline_pool_completes_during_submit() {
        let mut pool = PostProcPool::new(processor_failing_on(9), 0);
        pool.submit(item(0));
        pool.submit(item(1));
        assert_eq!(pool.pending(), 2);

        let done = pool.poll_ready();
        assert_eq!(done.iter().map(|c| c.image_id).collect::<Vec<_>>(), vec![0, 1]);
        assert!(done.iter().all(|c| c.outcome.is_ok()));
        assert!(pool.next_completed().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_processor_is_reported_with_identity() {
        let processor: Arc<dyn PostProcessor> =
            Arc::new(|stitched: &StitchedResult| -> Result<PostProcOutput> {
                if stitched.image_id == 1 {
                    panic!("corrupt map");
                }
                Ok(PostProcOutput {
                    instance_map: Array2::zeros((2, 2)),
                    instances: BTreeMap::new(),
                    annotation: String::new(),
                })
            });
        let mut pool = PostProcPool::new(processor, 2);
        for id in 0..3 {
            pool.submit(item(id));
        }
        let done = drain(&mut pool).await;

        let failure = done
            .iter()
            .find(|c| c.outcome.is_err())
            .expect("one task should fail");
        assert_eq!(failure.image_id, 1);
        assert_eq!(failure.name, "img1");
        let message = format!("{:#}", failure.outcome.as_ref().expect_err("failed"));
        assert!(message.contains("corrupt map"));
        assert_eq!(done.iter().filter(|c| c.outcome.is_ok()).count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processed_image_keeps_the_prediction_map() {
        let mut pool = PostProcPool::new(processor_failing_on(99), 1);
        pool.submit(item(5));
        let completion = pool.next_completed().await.expect("one completion");
        let processed = completion.outcome.expect("should succeed");
        assert_eq!(processed.image_id, 5);
        assert!(processed.prediction_map.iter().all(|&v| v == 5.0));
    }
}
