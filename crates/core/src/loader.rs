//! Memory-budgeted image caching.
//!
//! Each call to [`BudgetedLoader::fill`] decodes files in order, pads them,
//! and keeps accepting them while the running budget stays non-negative.
//! The first file of a round is always accepted, even when it alone exceeds
//! the budget. A file that would overrun the budget later in a round is held
//! back, already decoded, and opens the next round.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array3;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::grid::plan;
use crate::memory::estimated_cost;
use crate::report::{FailedImage, FailureStage};
use crate::types::{FileRef, ImageId, ImageShape, PaddedImage, SourceImage};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// Decodes a file into HWC 8-bit pixels.
pub trait ImageSource: Send + Sync {
    fn decode(&self, file: &FileRef) -> Result<Array3<u8>>;
}

/// Reads images from disk through the `image` crate, converted to RGB.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageSource;

impl ImageSource for FsImageSource {
    fn decode(&self, file: &FileRef) -> Result<Array3<u8>> {
        let decoded = image::open(&file.path)
            .with_context(|| format!("failed to decode image: {}", file.path.display()))?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
            .context("decoded buffer does not match image dimensions")
    }
}

/// List the image files directly inside `dir`, sorted by path.
pub fn discover_inputs(dir: &Path) -> Result<Vec<FileRef>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read input directory: {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_image_extension(path))
        .collect();
    paths.sort();

    Ok(paths.into_iter().map(FileRef::new).collect())
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Shuffle deterministically when a seed is given, randomly otherwise.
pub fn shuffle_files(files: &mut [FileRef], seed: Option<u64>) {
    match seed {
        Some(seed) => files.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed)),
        None => files.shuffle(&mut rand::rng()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoaderSettings {
    pub window_size: usize,
    pub stride: usize,
    pub inflation_factor: f64,
}

/// Images accepted in one caching round.
#[derive(Debug, Default)]
pub struct LoadedBatch {
    pub images: Vec<PaddedImage>,
    /// Files that could not be decoded; they are reported, not retried.
    pub rejected: Vec<FailedImage>,
    /// The budget could not hold even the first image of this round.
    pub over_budget: bool,
}

impl LoadedBatch {
    pub fn patch_count(&self) -> usize {
        self.images.iter().map(PaddedImage::patch_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

struct Prepared {
    image: PaddedImage,
    cost: u64,
}

pub struct BudgetedLoader<S> {
    source: S,
    settings: LoaderSettings,
    next_id: ImageId,
    carry: Option<Prepared>,
}

impl<S: ImageSource> BudgetedLoader<S> {
    pub fn new(source: S, settings: LoaderSettings) -> Self {
        Self {
            source,
            settings,
            next_id: 0,
            carry: None,
        }
    }

    /// Whether files remain, counting the one held back from the last round.
    pub fn has_pending(&self, pending: &VecDeque<FileRef>) -> bool {
        self.carry.is_some() || !pending.is_empty()
    }

    /// Cache as many files from the front of `pending` as `budget_bytes` allows.
    pub fn fill(&mut self, pending: &mut VecDeque<FileRef>, budget_bytes: u64) -> Result<LoadedBatch> {
        let mut batch = LoadedBatch::default();
        let mut remaining = i128::from(budget_bytes);

        loop {
            let prepared = match self.carry.take() {
                Some(prepared) => prepared,
                None => {
                    let Some(file) = pending.pop_front() else {
                        break;
                    };
                    let pixels = match self.source.decode(&file) {
                        Ok(pixels) => pixels,
                        Err(error) => {
                            let reason = format!("{error:#}");
                            warn!(file = %file.path.display(), %reason, "Skipping unreadable image");
                            batch.rejected.push(FailedImage {
                                image_id: None,
                                name: file.name.clone(),
                                stage: FailureStage::Decode,
                                reason,
                            });
                            continue;
                        }
                    };
                    self.prepare(&file, pixels)?
                }
            };

            if remaining - i128::from(prepared.cost) < 0 {
                if batch.images.is_empty() {
                    warn!(
                        image = %prepared.image.name,
                        cost_bytes = prepared.cost,
                        budget_bytes,
                        "Image exceeds the memory budget on its own; caching it alone"
                    );
                    batch.over_budget = true;
                    batch.images.push(prepared.image);
                } else {
                    debug!(
                        image = %prepared.image.name,
                        cost_bytes = prepared.cost,
                        "Memory budget exhausted; deferring image to next round"
                    );
                    self.carry = Some(prepared);
                }
                break;
            }

            remaining -= i128::from(prepared.cost);
            batch.images.push(prepared.image);
        }

        info!(
            images = batch.images.len(),
            patches = batch.patch_count(),
            rejected = batch.rejected.len(),
            budget_bytes,
            "Cached images for this round"
        );
        Ok(batch)
    }

    fn prepare(&mut self, file: &FileRef, pixels: Array3<u8>) -> Result<Prepared> {
        let shape = ImageShape::of(&pixels);
        let grid = plan(
            shape.height,
            shape.width,
            self.settings.window_size,
            self.settings.stride,
        )?;

        let source = SourceImage {
            id: self.next_id,
            name: file.name.clone(),
            pixels,
            placement: file.placement,
        };
        self.next_id += 1;

        let image = PaddedImage::from_source(source, grid);
        let padded = ImageShape::of(&image.pixels);
        let cost = estimated_cost(padded.byte_len(), self.settings.inflation_factor);

        debug!(
            image = %image.name,
            id = image.id,
            height = shape.height,
            width = shape.width,
            padded_height = padded.height,
            padded_width = padded.width,
            rows = grid.rows,
            cols = grid.cols,
            cost_bytes = cost,
            "Prepared image"
        );
        Ok(Prepared { image, cost })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::anyhow;

    use super::*;

    struct MapSource(HashMap<String, Array3<u8>>);

    impl MapSource {
        fn with_sizes(sizes: &[(&str, usize)]) -> Self {
            Self(
                sizes
                    .iter()
                    .map(|(name, edge)| (name.to_string(), Array3::zeros((*edge, *edge, 3))))
                    .collect(),
            )
        }
    }

    impl ImageSource for MapSource {
        fn decode(&self, file: &FileRef) -> Result<Array3<u8>> {
            self.0
                .get(&file.name)
                .cloned()
                .ok_or_else(|| anyhow!("no such image: {}", file.name))
        }
    }

    fn settings() -> LoaderSettings {
        LoaderSettings {
            window_size: 8,
            stride: 4,
            inflation_factor: 1.0,
        }
    }

    fn queue(names: &[&str]) -> VecDeque<FileRef> {
        names.iter().map(|name| FileRef::new(format!("{name}.png"))).collect()
    }

    // with window 8 / stride 4 a 10x10 image pads to 16x16x3 = 768 bytes
    const PADDED_10: u64 = 768;

    #[test]
    fn accepts_files_in_order_until_budget_runs_out() {
        let source = MapSource::with_sizes(&[("a", 10), ("b", 10), ("c", 10)]);
        let mut loader = BudgetedLoader::new(source, settings());
        let mut pending = queue(&["a", "b", "c"]);

        let batch = loader
            .fill(&mut pending, PADDED_10 * 2)
            .expect("fill should succeed");
        let names: Vec<&str> = batch.images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!batch.over_budget);
        assert!(pending.is_empty());
        assert!(loader.has_pending(&pending), "c is held back, not dropped");

        let next = loader
            .fill(&mut pending, PADDED_10 * 2)
            .expect("second fill should succeed");
        assert_eq!(next.images.len(), 1);
        assert_eq!(next.images[0].name, "c");
        assert_eq!(next.images[0].id, 2, "identity assigned at first decode is kept");
        assert!(!loader.has_pending(&pending));
    }

    #[test]
    fn exact_fit_is_accepted() {
        let source = MapSource::with_sizes(&[("a", 10), ("b", 10)]);
        let mut loader = BudgetedLoader::new(source, settings());
        let mut pending = queue(&["a", "b"]);
        let batch = loader.fill(&mut pending, PADDED_10 * 2).expect("fill should succeed");
        assert_eq!(batch.images.len(), 2);
    }

    #[test]
    fn oversized_first_image_is_still_cached_alone() {
        let source = MapSource::with_sizes(&[("big", 40), ("small", 10)]);
        let mut loader = BudgetedLoader::new(source, settings());
        let mut pending = queue(&["big", "small"]);

        let batch = loader.fill(&mut pending, 10).expect("fill should succeed");
        assert!(batch.over_budget);
        assert_eq!(batch.images.len(), 1);
        assert_eq!(batch.images[0].name, "big");
        assert_eq!(pending.len(), 1, "nothing after an oversized image is touched");
    }

    #[test]
    fn unreadable_files_are_reported_and_skipped() {
        let source = MapSource::with_sizes(&[("a", 10)]);
        let mut loader = BudgetedLoader::new(source, settings());
        let mut pending = queue(&["missing", "a"]);

        let batch = loader.fill(&mut pending, u64::MAX).expect("fill should succeed");
        assert_eq!(batch.images.len(), 1);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].name, "missing");
        assert_eq!(batch.rejected[0].stage, FailureStage::Decode);
        assert_eq!(batch.images[0].id, 0, "rejected files do not consume an identity");
    }

    #[test]
    fn padded_image_exposes_unpadded_source_region() {
        let mut pixels = Array3::zeros((10, 10, 3));
        pixels[[0, 0, 0]] = 7;
        pixels[[9, 9, 2]] = 9;
        let mut map = HashMap::new();
        map.insert("a".to_string(), pixels.clone());
        let mut loader = BudgetedLoader::new(MapSource(map), settings());
        let mut pending = queue(&["a"]);

        let batch = loader.fill(&mut pending, u64::MAX).expect("fill should succeed");
        let image = &batch.images[0];
        assert_eq!(image.top_left_offset(), (2, 2));
        assert_eq!(image.source_region(), pixels.view());
        assert_eq!(batch.patch_count(), image.plan.rows * image.plan.cols);
    }

    #[test]
    fn seeded_shuffle_is_deterministic() {
        let files: Vec<FileRef> = (0..20).map(|i| FileRef::new(format!("f{i}.png"))).collect();
        let mut first = files.clone();
        let mut second = files.clone();
        shuffle_files(&mut first, Some(42));
        shuffle_files(&mut second, Some(42));
        assert_eq!(first, second);
        assert_eq!(first.len(), files.len());
    }

    #[test]
    fn discover_inputs_lists_only_images_sorted() {
        let temp = tempfile::tempdir().expect("create temp dir");
        for name in ["b.PNG", "a.jpg", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"x").expect("write file");
        }
        std::fs::create_dir(temp.path().join("nested.png")).expect("create dir");

        let files = discover_inputs(temp.path()).expect("discover should succeed");
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
