//! Streams patches from the cached images through the transform in batches.
//!
//! Patch extraction can run on worker threads. Batch `i` is always built by
//! worker `i % workers` and handed over on that worker's bounded channel, so
//! the transform sees batches in submission order while extraction runs
//! ahead by at most [`PREFETCH_PER_WORKER`] batches per worker.

use std::sync::mpsc::{sync_channel, Receiver};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{Array4, Axis};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::grid::patch_view;
use crate::stitch::PendingQueue;
use crate::types::{PaddedImage, PatchCoordinate, PatchOutput};

pub const PREFETCH_PER_WORKER: usize = 2;

/// The per-batch model call.
///
/// Receives `(N, window, window, channels)` pixels and must return exactly
/// `N` per-patch outputs shaped `(N, height, width, channels)`, in input order.
pub trait Transform: Send {
    fn name(&self) -> &str {
        "Transform"
    }

    fn run_batch(&mut self, batch: Array4<u8>) -> Result<Array4<f32>>;
}

impl<F> Transform for F
where
    F: FnMut(Array4<u8>) -> Result<Array4<f32>> + Send,
{
    fn run_batch(&mut self, batch: Array4<u8>) -> Result<Array4<f32>> {
        self(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub extraction_workers: usize,
    pub window_size: usize,
}

struct PatchRef {
    image_index: usize,
    coord: PatchCoordinate,
}

/// Run every patch of `images` through `transform`.
///
/// A transform error aborts the round; nothing is retried.
pub fn dispatch<T>(
    images: &[PaddedImage],
    transform: &mut T,
    settings: DispatchSettings,
) -> Result<PendingQueue>
where
    T: Transform + ?Sized,
{
    let patches: Vec<PatchRef> = images
        .iter()
        .enumerate()
        .flat_map(|(image_index, image)| {
            image
                .plan
                .coordinates(image.id)
                .into_iter()
                .map(move |coord| PatchRef { image_index, coord })
        })
        .collect();
    let batches: Vec<&[PatchRef]> = patches.chunks(settings.batch_size.max(1)).collect();

    let started = Instant::now();
    let mut queue = PendingQueue::with_capacity(patches.len());

    if settings.extraction_workers == 0 || batches.len() <= 1 {
        for (batch_index, batch) in batches.iter().enumerate() {
            let pixels = extract_batch(images, batch, settings.window_size)?;
            run_one(transform, batch_index, batch, pixels, &mut queue)?;
        }
    } else {
        let workers = settings.extraction_workers.min(batches.len());
        thread::scope(|scope| -> Result<()> {
            let mut receivers: Vec<Receiver<Result<Array4<u8>>>> = Vec::with_capacity(workers);
            for worker in 0..workers {
                let (tx, rx) = sync_channel(PREFETCH_PER_WORKER);
                receivers.push(rx);
                let batches = &batches;
                scope.spawn(move || {
                    for batch in batches.iter().skip(worker).step_by(workers) {
                        let pixels = extract_batch(images, batch, settings.window_size);
                        if tx.send(pixels).is_err() {
                            break;
                        }
                    }
                });
            }

            // receivers drop on early return, which unblocks and stops the workers
            for (batch_index, batch) in batches.iter().enumerate() {
                let pixels = receivers[batch_index % workers]
                    .recv()
                    .context("patch extraction worker exited early")??;
                run_one(transform, batch_index, batch, pixels, &mut queue)?;
            }
            Ok(())
        })?;
    }

    info!(
        transform = transform.name(),
        images = images.len(),
        patches = patches.len(),
        batches = batches.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Dispatched patches"
    );
    Ok(queue)
}

fn extract_batch(images: &[PaddedImage], batch: &[PatchRef], window: usize) -> Result<Array4<u8>> {
    let channels = batch
        .first()
        .map(|patch| images[patch.image_index].original_shape.channels)
        .unwrap_or(0);
    let mut pixels = Array4::<u8>::zeros((batch.len(), window, window, channels));
    for (mut slot, patch) in pixels.outer_iter_mut().zip(batch) {
        let image = &images[patch.image_index];
        if image.original_shape.channels != channels {
            return Err(PipelineError::InvalidConfig(format!(
                "image '{}' has {} channels but its batch has {channels}",
                image.name, image.original_shape.channels
            ))
            .into());
        }
        slot.assign(&patch_view(&image.pixels, &patch.coord, window));
    }
    Ok(pixels)
}

fn run_one<T>(
    transform: &mut T,
    batch_index: usize,
    batch: &[PatchRef],
    pixels: Array4<u8>,
    queue: &mut PendingQueue,
) -> Result<()>
where
    T: Transform + ?Sized,
{
    let started = Instant::now();
    let output = transform
        .run_batch(pixels)
        .map_err(|source| PipelineError::TransformFailure {
            batch_index,
            source,
        })?;

    let produced = output.len_of(Axis(0));
    if produced != batch.len() {
        return Err(PipelineError::TransformContract {
            expected: batch.len(),
            actual: produced,
        }
        .into());
    }

    for (patch, data) in batch.iter().zip(output.outer_iter()) {
        queue.push(PatchOutput {
            row: patch.coord.row,
            col: patch.coord.col,
            image_id: patch.coord.image_id,
            data: data.to_owned(),
        });
    }

    debug!(
        batch_index,
        patches = batch.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Transform batch complete"
    );
    Ok(())
}
