use std::path::{Path, PathBuf};

use ndarray::{s, Array3, ArrayD, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::grid::{pad_reflect, GridPlan};

/// Tag tying a patch back to its source image while that image is resident.
pub type ImageId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    pub fn of<T>(array: &Array3<T>) -> Self {
        let (height, width, channels) = array.dim();
        Self::new(height, width, channels)
    }

    /// Bytes held by an 8-bit image of this shape.
    pub fn byte_len(&self) -> usize {
        self.height * self.width * self.channels
    }
}

/// Position and size of a tile on its parent slide, in slide pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

/// A source file scheduled for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    pub name: String,
    pub placement: Option<Placement>,
}

impl FileRef {
    /// Names the file after its stem, the way output artifacts are named.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = file_stem(&path);
        Self {
            path,
            name,
            placement: None,
        }
    }

    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = Some(placement);
        self
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A decoded image (HWC, 8-bit) with the identity assigned at load time.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub id: ImageId,
    pub name: String,
    pub pixels: Array3<u8>,
    pub placement: Option<Placement>,
}

impl SourceImage {
    pub fn shape(&self) -> ImageShape {
        ImageShape::of(&self.pixels)
    }
}

/// A source image after reflect padding, together with its patch grid.
#[derive(Debug, Clone)]
pub struct PaddedImage {
    pub id: ImageId,
    pub name: String,
    pub pixels: Array3<u8>,
    pub original_shape: ImageShape,
    pub plan: GridPlan,
    pub placement: Option<Placement>,
}

impl PaddedImage {
    /// Reflect-pad `source` so that `plan` tiles it exactly.
    pub fn from_source(source: SourceImage, plan: GridPlan) -> Self {
        let original_shape = source.shape();
        Self {
            id: source.id,
            name: source.name,
            pixels: pad_reflect(&source.pixels, &plan),
            original_shape,
            plan,
            placement: source.placement,
        }
    }

    /// Top-left corner of the unpadded image inside `pixels`.
    pub fn top_left_offset(&self) -> (usize, usize) {
        (self.plan.pad_top, self.plan.pad_left)
    }

    /// The original image region, without padding.
    pub fn source_region(&self) -> ArrayView3<'_, u8> {
        let (top, left) = self.top_left_offset();
        self.pixels.slice(s![
            top..top + self.original_shape.height,
            left..left + self.original_shape.width,
            ..
        ])
    }

    pub fn patch_count(&self) -> usize {
        self.plan.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchCoordinate {
    /// Top-left row offset into the padded image.
    pub y: usize,
    /// Top-left column offset into the padded image.
    pub x: usize,
    pub row: usize,
    pub col: usize,
    pub image_id: ImageId,
}

/// Transform output for one patch, tagged like the coordinate it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutput {
    pub row: usize,
    pub col: usize,
    pub image_id: ImageId,
    /// `(height, width, channels)`.
    pub data: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct OverlayMetadata {
    /// Unpadded source pixels, kept for consumers that draw on the image.
    pub source: Array3<u8>,
    pub original_shape: ImageShape,
    pub top_left_offset: (usize, usize),
    pub placement: Option<Placement>,
}

/// Full-resolution prediction map for one image, cropped to its original size.
///
/// `prediction_map` is `(height, width, channels)`, except that a
/// single-channel map loses its channel axis and is `(height, width)`.
/// Consumers that index channels must handle both ranks.
#[derive(Debug, Clone)]
pub struct StitchedResult {
    pub image_id: ImageId,
    pub name: String,
    pub prediction_map: ArrayD<f32>,
    pub overlay: OverlayMetadata,
}

impl StitchedResult {
    pub fn channels(&self) -> usize {
        match self.prediction_map.ndim() {
            2 => 1,
            _ => self.prediction_map.shape()[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ref_uses_stem_as_name() {
        let file = FileRef::new("/data/tma/slide_C03R07_40x.png");
        assert_eq!(file.name, "slide_C03R07_40x");
        assert!(file.placement.is_none());
    }

    #[test]
    fn image_shape_byte_len_counts_channels() {
        let shape = ImageShape::new(10, 20, 3);
        assert_eq!(shape.byte_len(), 600);
        assert_eq!(ImageShape::of(&Array3::<u8>::zeros((4, 5, 3))), ImageShape::new(4, 5, 3));
    }

    #[test]
    fn stitched_result_reports_channels_for_both_ranks() {
        let overlay = OverlayMetadata {
            source: Array3::zeros((2, 2, 3)),
            original_shape: ImageShape::new(2, 2, 3),
            top_left_offset: (0, 0),
            placement: None,
        };
        let squeezed = StitchedResult {
            image_id: 0,
            name: "a".to_string(),
            prediction_map: ArrayD::zeros(ndarray::IxDyn(&[2, 2])),
            overlay: overlay.clone(),
        };
        let full = StitchedResult {
            prediction_map: ArrayD::zeros(ndarray::IxDyn(&[2, 2, 4])),
            ..squeezed.clone()
        };
        assert_eq!(squeezed.channels(), 1);
        assert_eq!(full.channels(), 4);
    }
}
