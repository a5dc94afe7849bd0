//! Regrouping per-patch outputs into whole-image prediction maps.

use anyhow::Result;
use ndarray::{s, Array3, ArrayD, Axis};
use tracing::debug;

use crate::error::PipelineError;
use crate::types::{ImageId, OverlayMetadata, PaddedImage, PatchOutput, StitchedResult};

/// Transform outputs not yet claimed by their image.
///
/// Owned by the orchestration loop and drained by one stitcher at a time.
/// Detaching an image is a stable partition: everything left behind keeps
/// its relative order.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: Vec<PatchOutput>,
}

impl PendingQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, output: PatchOutput) {
        self.items.push(output);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_for(&self, image_id: ImageId) -> usize {
        self.items.iter().filter(|item| item.image_id == image_id).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOutput> {
        self.items.iter()
    }

    #[cfg(test)]
    pub fn into_vec(self) -> Vec<PatchOutput> {
        self.items
    }

    /// Remove the first `expected` outputs tagged `image_id`, scanning from the front.
    ///
    /// Fails without touching the queue when fewer than `expected` are present.
    pub fn detach(&mut self, image_id: ImageId, expected: usize) -> Result<Vec<PatchOutput>> {
        if expected == 0 {
            return Ok(Vec::new());
        }

        let mut found = 0;
        let mut last_match = None;
        for (index, item) in self.items.iter().enumerate() {
            if item.image_id == image_id {
                found += 1;
                if found == expected {
                    last_match = Some(index);
                    break;
                }
            }
        }

        let Some(last_match) = last_match else {
            return Err(PipelineError::ConsistencyViolation {
                image_id,
                expected,
                found,
            }
            .into());
        };

        let untouched = self.items.split_off(last_match + 1);
        let scanned = std::mem::take(&mut self.items);
        let (detached, mut remaining): (Vec<_>, Vec<_>) = scanned
            .into_iter()
            .partition(|item| item.image_id == image_id);
        remaining.extend(untouched);
        self.items = remaining;

        Ok(detached)
    }
}

impl FromIterator<PatchOutput> for PendingQueue {
    fn from_iter<I: IntoIterator<Item = PatchOutput>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

/// Detach every patch of `image` from `queue` and reassemble its prediction map.
pub fn detach_and_stitch(queue: &mut PendingQueue, image: &PaddedImage) -> Result<StitchedResult> {
    let patches = queue.detach(image.id, image.patch_count())?;
    let prediction_map = assemble(
        image.id,
        patches,
        image.plan.rows,
        image.plan.cols,
        image.original_shape.height,
        image.original_shape.width,
    )?;

    debug!(
        image = %image.name,
        id = image.id,
        shape = ?prediction_map.shape(),
        remaining = queue.len(),
        "Stitched prediction map"
    );

    Ok(StitchedResult {
        image_id: image.id,
        name: image.name.clone(),
        prediction_map,
        overlay: OverlayMetadata {
            source: image.source_region().to_owned(),
            original_shape: image.original_shape,
            top_left_offset: image.top_left_offset(),
            placement: image.placement,
        },
    })
}

/// Tile `patches` row-major into a `rows x cols` grid and crop to `height x width`.
///
/// A single-channel result drops its channel axis.
pub fn assemble(
    image_id: ImageId,
    mut patches: Vec<PatchOutput>,
    rows: usize,
    cols: usize,
    height: usize,
    width: usize,
) -> Result<ArrayD<f32>> {
    let mismatch = |reason: String| -> anyhow::Error {
        PipelineError::GridMismatch { image_id, reason }.into()
    };

    if patches.len() != rows * cols {
        return Err(mismatch(format!(
            "{} patches cannot fill a {rows}x{cols} grid",
            patches.len()
        )));
    }
    patches.sort_by_key(|patch| (patch.row, patch.col));

    let Some(first) = patches.first() else {
        return Err(mismatch("no patches to assemble".to_string()));
    };
    let (patch_h, patch_w, channels) = first.data.dim();
    if rows * patch_h < height || cols * patch_w < width {
        return Err(mismatch(format!(
            "{rows}x{cols} patches of {patch_h}x{patch_w} cannot cover {height}x{width}"
        )));
    }

    let mut map = Array3::<f32>::zeros((rows * patch_h, cols * patch_w, channels));
    for (index, patch) in patches.iter().enumerate() {
        let (row, col) = (index / cols, index % cols);
        if (patch.row, patch.col) != (row, col) {
            return Err(mismatch(format!(
                "expected patch ({row}, {col}) but found ({}, {})",
                patch.row, patch.col
            )));
        }
        if patch.data.dim() != (patch_h, patch_w, channels) {
            return Err(mismatch(format!(
                "patch ({row}, {col}) has shape {:?}, expected {:?}",
                patch.data.dim(),
                (patch_h, patch_w, channels)
            )));
        }
        map.slice_mut(s![
            row * patch_h..(row + 1) * patch_h,
            col * patch_w..(col + 1) * patch_w,
            ..
        ])
        .assign(&patch.data);
    }

    let cropped = map.slice_move(s![..height, ..width, ..]);
    if channels == 1 {
        Ok(cropped.index_axis_move(Axis(2), 0).into_dyn())
    } else {
        Ok(cropped.into_dyn())
    }
}
