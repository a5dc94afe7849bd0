//! Patch grid planning and reflect padding.
//!
//! A patch of `window_size` pixels is read every `stride` pixels; the
//! transform is expected to return a valid centre region of `stride`
//! pixels per patch. The image is padded by `(window_size - stride) / 2`
//! on the top/left so that the centre of patch `(r, c)` lands on original
//! pixel `(r * stride, c * stride)`, and by whatever the bottom/right needs
//! for the last row/column of patches to fit.

use anyhow::Result;
use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{ImageId, PatchCoordinate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPlan {
    pub pad_top: usize,
    pub pad_left: usize,
    pub pad_bottom: usize,
    pub pad_right: usize,
    pub rows: usize,
    pub cols: usize,
    pub window_size: usize,
    pub stride: usize,
    pub height: usize,
    pub width: usize,
}

/// Plan the patch grid for an image of `height x width`.
pub fn plan(height: usize, width: usize, window_size: usize, stride: usize) -> Result<GridPlan> {
    if stride == 0 || stride > window_size {
        return Err(PipelineError::InvalidConfig(format!(
            "stride ({stride}) must be in 1..={window_size} (window size)"
        ))
        .into());
    }
    if height == 0 || width == 0 {
        return Err(
            PipelineError::InvalidConfig(format!("cannot tile an empty {height}x{width} image"))
                .into(),
        );
    }

    let border = (window_size - stride) / 2;
    let (rows, pad_bottom) = axis_extent(height, window_size, stride, border);
    let (cols, pad_right) = axis_extent(width, window_size, stride, border);

    Ok(GridPlan {
        pad_top: border,
        pad_left: border,
        pad_bottom,
        pad_right,
        rows,
        cols,
        window_size,
        stride,
        height,
        width,
    })
}

/// Number of patch steps along one axis and the trailing padding it needs.
fn axis_extent(length: usize, window_size: usize, stride: usize, border: usize) -> (usize, usize) {
    let steps = ceil_div(length as i64 - stride as i64, stride as i64).max(0) as usize;
    let padded = steps * stride + window_size;
    (steps + 1, padded - border - length)
}

fn ceil_div(numerator: i64, denominator: i64) -> i64 {
    let quotient = numerator.div_euclid(denominator);
    if numerator.rem_euclid(denominator) == 0 {
        quotient
    } else {
        quotient + 1
    }
}

impl GridPlan {
    pub fn padded_height(&self) -> usize {
        self.pad_top + self.height + self.pad_bottom
    }

    pub fn padded_width(&self) -> usize {
        self.pad_left + self.width + self.pad_right
    }

    /// Number of patches in the grid.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row-major patch coordinates, all tagged with `image_id`.
    pub fn coordinates(&self, image_id: ImageId) -> Vec<PatchCoordinate> {
        let mut coords = Vec::with_capacity(self.len());
        for row in 0..self.rows {
            for col in 0..self.cols {
                coords.push(PatchCoordinate {
                    y: row * self.stride,
                    x: col * self.stride,
                    row,
                    col,
                    image_id,
                });
            }
        }
        coords
    }
}

/// Reflect-pad an HWC image according to `plan`.
///
/// Border pixels are mirrored without repeating the edge row/column; pads
/// longer than the image keep reflecting back and forth.
pub fn pad_reflect(image: &Array3<u8>, plan: &GridPlan) -> Array3<u8> {
    let (height, width, channels) = image.dim();
    let rows: Vec<usize> = (0..plan.padded_height())
        .map(|y| reflect_index(y as isize - plan.pad_top as isize, height))
        .collect();
    let cols: Vec<usize> = (0..plan.padded_width())
        .map(|x| reflect_index(x as isize - plan.pad_left as isize, width))
        .collect();

    Array3::from_shape_fn(
        (plan.padded_height(), plan.padded_width(), channels),
        |(y, x, c)| image[[rows[y], cols[x], c]],
    )
}

fn reflect_index(index: isize, length: usize) -> usize {
    if length <= 1 {
        return 0;
    }
    let period = 2 * (length as isize - 1);
    let folded = index.rem_euclid(period);
    if folded < length as isize {
        folded as usize
    } else {
        (period - folded) as usize
    }
}

/// View of the patch at `coord` inside a padded image.
pub fn patch_view<'a>(
    padded: &'a Array3<u8>,
    coord: &PatchCoordinate,
    window_size: usize,
) -> ArrayView3<'a, u8> {
    padded.slice(s![
        coord.y..coord.y + window_size,
        coord.x..coord.x + window_size,
        ..
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn fast_mode_scenario_produces_four_by_four_grid() {
        let plan = plan(500, 500, 256, 164).expect("plan should succeed");
        assert_eq!(plan.pad_top, 46);
        assert_eq!(plan.pad_left, 46);
        assert_eq!((plan.rows, plan.cols), (4, 4));
        assert_eq!(plan.len(), 16);
        assert_eq!(plan.padded_height(), 3 * 164 + 256);
        assert_eq!(plan.pad_bottom, 748 - 46 - 500);
    }

    #[test]
    fn padded_dims_are_stride_aligned_for_many_shapes() {
        for (window, stride) in [(256, 164), (270, 80), (64, 64), (33, 7)] {
            for length in [1, 2, 7, 63, 64, 80, 163, 164, 165, 500, 1001] {
                let plan = plan(length, length + 3, window, stride).expect("plan should succeed");
                for (padded, original) in [
                    (plan.padded_height(), plan.height),
                    (plan.padded_width(), plan.width),
                ] {
                    assert_eq!((padded - window) % stride, 0, "len={length} w={window} s={stride}");
                    assert!(padded >= original);
                }
                assert!(plan.rows * stride >= plan.height);
                assert!(plan.cols * stride >= plan.width);
            }
        }
    }

    #[test]
    fn image_equal_to_stride_is_a_single_patch_padded_on_every_side() {
        let plan = plan(164, 164, 256, 164).expect("plan should succeed");
        assert_eq!((plan.rows, plan.cols), (1, 1));
        assert_eq!(plan.pad_top, 46);
        assert_eq!(plan.pad_left, 46);
        assert_eq!(plan.pad_bottom, 46);
        assert_eq!(plan.pad_right, 46);
        assert_eq!(plan.padded_height(), 256);
    }

    #[test]
    fn image_smaller_than_stride_still_gets_one_patch() {
        let plan = plan(10, 5, 256, 164).expect("plan should succeed");
        assert_eq!((plan.rows, plan.cols), (1, 1));
        assert_eq!(plan.padded_height(), 256);
        assert_eq!(plan.padded_width(), 256);
    }

    #[test]
    fn rejects_stride_larger_than_window() {
        let error = plan(100, 100, 64, 80).expect_err("stride > window must fail");
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidConfig(_))
        ));
        assert!(plan(100, 100, 64, 0).is_err());
    }

    #[test]
    fn coordinates_are_dense_and_offset_by_stride() {
        let plan = plan(300, 200, 256, 164).expect("plan should succeed");
        let coords = plan.coordinates(7);
        assert_eq!(coords.len(), plan.rows * plan.cols);
        for coord in &coords {
            assert_eq!(coord.y, coord.row * 164);
            assert_eq!(coord.x, coord.col * 164);
            assert_eq!(coord.image_id, 7);
            assert!(coord.y + 256 <= plan.padded_height());
            assert!(coord.x + 256 <= plan.padded_width());
        }
        let mut seen: Vec<(usize, usize)> = coords.iter().map(|c| (c.row, c.col)).collect();
        seen.dedup();
        assert_eq!(seen.len(), coords.len());
    }

    #[test]
    fn reflect_index_mirrors_without_repeating_edge() {
        let mirrored: Vec<usize> = (-3..7).map(|i| reflect_index(i, 4)).collect();
        assert_eq!(mirrored, vec![3, 2, 1, 0, 1, 2, 3, 2, 1, 0]);
        assert_eq!(reflect_index(-5, 1), 0);
    }

    #[test]
    fn pad_reflect_preserves_interior_and_mirrors_border() {
        let row = Array1::from_iter(0u8..5);
        let image = Array3::from_shape_fn((5, 5, 1), |(y, x, _)| row[y] * 10 + row[x]);
        let plan = plan(5, 5, 6, 2).expect("plan should succeed");
        let padded = pad_reflect(&image, &plan);

        assert_eq!(padded.dim(), (plan.padded_height(), plan.padded_width(), 1));
        let top = plan.pad_top;
        let left = plan.pad_left;
        assert_eq!(padded[[top, left, 0]], image[[0, 0, 0]]);
        assert_eq!(padded[[top + 4, left + 4, 0]], image[[4, 4, 0]]);
        // one row above the image mirrors row 1, not row 0
        assert_eq!(padded[[top - 1, left, 0]], image[[1, 0, 0]]);
        assert_eq!(padded[[top, left - 2, 0]], image[[0, 2, 0]]);
    }

    #[test]
    fn patch_view_reads_window_at_coordinate() {
        let image = Array3::from_shape_fn((8, 8, 1), |(y, x, _)| (y * 8 + x) as u8);
        let coord = PatchCoordinate {
            y: 2,
            x: 4,
            row: 1,
            col: 2,
            image_id: 0,
        };
        let view = patch_view(&image, &coord, 3);
        assert_eq!(view.dim(), (3, 3, 1));
        assert_eq!(view[[0, 0, 0]], 2 * 8 + 4);
        assert_eq!(view[[2, 2, 0]], 4 * 8 + 6);
    }
}
