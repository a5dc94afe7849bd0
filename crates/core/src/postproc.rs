//! Turning a stitched prediction map into labelled instances.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::config::{CellType, PostProcessConfig};
use crate::halo::{HaloDocument, Layer, Region, DEFAULT_LINE_COLOR};
use crate::types::{ImageId, Placement, StitchedResult};

/// Per-instance geometry and class, serialized into the instance JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// `[[y0, x0], [y1, x1]]`, end exclusive.
    pub bbox: [[usize; 2]; 2],
    /// `[x, y]`.
    pub centroid: [f64; 2],
    /// Outer boundary as `[x, y]` points in image coordinates.
    pub contour: Vec<[i64; 2]>,
    #[serde(rename = "type")]
    pub type_id: Option<u32>,
    pub type_prob: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostProcOutput {
    /// 0 is background; instances are numbered from 1.
    pub instance_map: Array2<u32>,
    pub instances: BTreeMap<u32, InstanceInfo>,
    pub annotation: String,
}

/// Everything the sink needs about one finished image.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub image_id: ImageId,
    pub name: String,
    pub prediction_map: ArrayD<f32>,
    pub instance_map: Array2<u32>,
    pub instances: BTreeMap<u32, InstanceInfo>,
    pub annotation: String,
    pub placement: Option<Placement>,
}

impl ProcessedImage {
    /// Combine a stitched image with its post-processing output, dropping the overlay pixels.
    pub fn new(stitched: StitchedResult, output: PostProcOutput) -> Self {
        Self {
            image_id: stitched.image_id,
            name: stitched.name,
            prediction_map: stitched.prediction_map,
            instance_map: output.instance_map,
            instances: output.instances,
            annotation: output.annotation,
            placement: stitched.overlay.placement,
        }
    }
}

/// Post-processing strategy run once per stitched image, possibly on a worker thread.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str {
        "PostProcessor"
    }

    fn process(&self, stitched: &StitchedResult) -> Result<PostProcOutput>;
}

impl<F> PostProcessor for F
where
    F: Fn(&StitchedResult) -> Result<PostProcOutput> + Send + Sync,
{
    fn process(&self, stitched: &StitchedResult) -> Result<PostProcOutput> {
        self(stitched)
    }
}

/// Thresholds a foreground probability channel into 8-connected instances.
///
/// With `nr_types > 0` each instance is classified by majority vote over the
/// per-pixel arg-max of the type channels.
#[derive(Debug, Clone)]
pub struct ThresholdPostProcessor {
    settings: PostProcessConfig,
    cell_types: Vec<CellType>,
}

impl ThresholdPostProcessor {
    pub fn new(settings: PostProcessConfig, cell_types: Vec<CellType>) -> Self {
        Self {
            settings,
            cell_types,
        }
    }

    fn foreground<'a>(&self, map: &'a ArrayD<f32>) -> Result<ArrayView2<'a, f32>> {
        match map.ndim() {
            2 => Ok(map.view().into_dimensionality::<Ix2>()?),
            3 => {
                let map = map.view().into_dimensionality::<Ix3>()?;
                let channel = self.settings.foreground_channel;
                if channel >= map.len_of(Axis(2)) {
                    bail!(
                        "foreground channel {channel} out of range for a map with {} channels",
                        map.len_of(Axis(2))
                    );
                }
                Ok(map.index_axis_move(Axis(2), channel))
            }
            rank => bail!("prediction map must have 2 or 3 axes, got {rank}"),
        }
    }

    /// Per-pixel arg-max over the type channels, if the map carries them.
    fn type_argmax(&self, map: &ArrayD<f32>) -> Result<Option<Array2<u32>>> {
        let nr_types = self.settings.nr_types;
        if nr_types == 0 || map.ndim() == 2 {
            return Ok(None);
        }
        let map = map.view().into_dimensionality::<Ix3>()?;
        let offset = self.settings.type_channel_offset;
        let channels = map.len_of(Axis(2));
        if offset + nr_types > channels {
            bail!(
                "{nr_types} type channels from offset {offset} exceed the map's {channels} channels"
            );
        }
        let (height, width, _) = map.dim();
        Ok(Some(Array2::from_shape_fn((height, width), |(y, x)| {
            let mut best = 0;
            for t in 1..nr_types {
                if map[[y, x, offset + t]] > map[[y, x, offset + best]] {
                    best = t;
                }
            }
            best as u32
        })))
    }

    fn annotation(&self, instances: &BTreeMap<u32, InstanceInfo>) -> String {
        let mut doc = if self.settings.nr_types == 0 {
            let mut doc = HaloDocument::new();
            doc.push_layer(Layer::new("Nuclei", DEFAULT_LINE_COLOR));
            doc
        } else {
            HaloDocument::with_cell_types(&self.cell_types)
        };

        for info in instances.values() {
            let layer = match info.type_id {
                None => doc.layers.first_mut(),
                Some(0) => None,
                Some(type_id) => self
                    .cell_types
                    .iter()
                    .position(|cell| cell.id == type_id)
                    .and_then(|index| doc.layers.get_mut(index)),
            };
            if let Some(layer) = layer {
                layer.regions.push(Region::polygon(info.contour.clone()));
            }
        }
        doc.to_xml()
    }
}

impl PostProcessor for ThresholdPostProcessor {
    fn name(&self) -> &str {
        "ThresholdPostProcessor"
    }

    fn process(&self, stitched: &StitchedResult) -> Result<PostProcOutput> {
        let map = &stitched.prediction_map;
        let foreground = self.foreground(map)?;
        let types = self.type_argmax(map)?;

        let instance_map = label_instances(
            foreground,
            self.settings.foreground_threshold,
            self.settings.min_instance_area,
        )?;

        let mut instances = BTreeMap::new();
        if self.settings.return_centroids {
            for (id, stats) in instance_stats(&instance_map) {
                let contour = trace_outer_contour(&instance_map, id, stats.bbox)?;
                let (type_id, type_prob) = match &types {
                    Some(types) => {
                        let (type_id, prob) = vote_type(&instance_map, types, id, &stats);
                        (Some(type_id), Some(prob))
                    }
                    None => (None, None),
                };
                instances.insert(
                    id,
                    InstanceInfo {
                        bbox: stats.bbox,
                        centroid: [
                            stats.sum_x as f64 / stats.area as f64,
                            stats.sum_y as f64 / stats.area as f64,
                        ],
                        contour,
                        type_id,
                        type_prob,
                    },
                );
            }
        }

        let annotation = self.annotation(&instances);
        Ok(PostProcOutput {
            instance_map,
            instances,
            annotation,
        })
    }
}

/// Label 8-connected foreground regions, dropping those smaller than `min_area`.
///
/// Surviving instances are renumbered `1..=N` in raster order of their first pixel.
pub fn label_instances(
    foreground: ArrayView2<'_, f32>,
    threshold: f32,
    min_area: usize,
) -> Result<Array2<u32>> {
    let (height, width) = foreground.dim();
    let mask = GrayImage::from_fn(to_u32(width)?, to_u32(height)?, |x, y| {
        if foreground[[y as usize, x as usize]] > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let raw = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let max_label = raw.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut areas = vec![0usize; max_label + 1];
    for pixel in raw.pixels() {
        areas[pixel[0] as usize] += 1;
    }

    let mut remap = vec![0u32; max_label + 1];
    let mut next = 1u32;
    for pixel in raw.pixels() {
        let label = pixel[0] as usize;
        if label != 0 && remap[label] == 0 && areas[label] >= min_area.max(1) {
            remap[label] = next;
            next += 1;
        }
    }

    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        remap[raw.get_pixel(x as u32, y as u32)[0] as usize]
    }))
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow::anyhow!("dimension {value} exceeds u32"))
}

struct InstanceStats {
    area: usize,
    sum_x: usize,
    sum_y: usize,
    bbox: [[usize; 2]; 2],
}

fn instance_stats(instance_map: &Array2<u32>) -> BTreeMap<u32, InstanceStats> {
    let mut stats: BTreeMap<u32, InstanceStats> = BTreeMap::new();
    for ((y, x), &id) in instance_map.indexed_iter() {
        if id == 0 {
            continue;
        }
        let entry = stats.entry(id).or_insert(InstanceStats {
            area: 0,
            sum_x: 0,
            sum_y: 0,
            bbox: [[y, x], [y + 1, x + 1]],
        });
        entry.area += 1;
        entry.sum_x += x;
        entry.sum_y += y;
        entry.bbox[0][0] = entry.bbox[0][0].min(y);
        entry.bbox[0][1] = entry.bbox[0][1].min(x);
        entry.bbox[1][0] = entry.bbox[1][0].max(y + 1);
        entry.bbox[1][1] = entry.bbox[1][1].max(x + 1);
    }
    stats
}

/// Outer boundary of instance `id`, traced on its bounding box with a one-pixel margin.
fn trace_outer_contour(
    instance_map: &Array2<u32>,
    id: u32,
    bbox: [[usize; 2]; 2],
) -> Result<Vec<[i64; 2]>> {
    let [[y0, x0], [y1, x1]] = bbox;
    let crop = GrayImage::from_fn(to_u32(x1 - x0 + 2)?, to_u32(y1 - y0 + 2)?, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let inside = x >= 1 && y >= 1 && x - 1 < x1 - x0 && y - 1 < y1 - y0;
        if inside && instance_map[[y0 + y - 1, x0 + x - 1]] == id {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let contour = find_contours::<i64>(&crop)
        .into_iter()
        .find(|contour| contour.border_type == BorderType::Outer);
    let Some(contour) = contour else {
        bail!("instance {id} has no outer contour");
    };
    Ok(contour
        .points
        .into_iter()
        .map(|point| [point.x + x0 as i64 - 1, point.y + y0 as i64 - 1])
        .collect())
}

/// Most common type among the instance's pixels; background loses to any other class.
fn vote_type(
    instance_map: &Array2<u32>,
    types: &Array2<u32>,
    id: u32,
    stats: &InstanceStats,
) -> (u32, f32) {
    let [[y0, x0], [y1, x1]] = stats.bbox;
    let mut votes: BTreeMap<u32, usize> = BTreeMap::new();
    for y in y0..y1 {
        for x in x0..x1 {
            if instance_map[[y, x]] == id {
                *votes.entry(types[[y, x]]).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(u32, usize)> = votes.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let (mut winner, mut count) = ranked.first().copied().unwrap_or((0, 0));
    if winner == 0 {
        if let Some(&(second, second_count)) = ranked.get(1) {
            winner = second;
            count = second_count;
        }
    }
    (winner, count as f32 / stats.area.max(1) as f32)
}
