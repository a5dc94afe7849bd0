//! Persisting processed images.
//!
//! The sink runs on whichever task drains the post-processing pool, in
//! completion order. Nothing here may assume images arrive in file order.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array2;
use ndarray_npy::{WriteNpyError, WriteNpyExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{CellType, MergeRotation};
use crate::merge::{merge_tiles, MergeTile};
use crate::postproc::{InstanceInfo, ProcessedImage};
use crate::report::RunReport;
use crate::types::Placement;

pub trait ResultSink: Send {
    /// Store the artifacts of one image.
    fn persist(&mut self, image: &ProcessedImage) -> Result<()>;

    /// Called once after every image has been persisted or reported failed.
    fn finish(&mut self, report: &RunReport) -> Result<()>;
}

/// Instance JSON as written next to each image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceFile {
    pub mag: Option<f64>,
    pub nuc: BTreeMap<u32, InstanceInfo>,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub output_dir: PathBuf,
    pub slide_name: String,
    pub save_qupath: bool,
    pub save_raw_map: bool,
    pub merge_rotation: MergeRotation,
    pub cell_types: Vec<CellType>,
}

/// Writes per-image artifacts under `<output>/<kind>/<slide_name>/`.
pub struct FsResultSink {
    settings: SinkSettings,
    placed: Vec<(String, Placement)>,
}

impl FsResultSink {
    /// Recreate the per-slide output directories, discarding earlier results.
    pub fn create(settings: SinkSettings) -> Result<Self> {
        let mut kinds = vec!["halo", "json", "npy"];
        if settings.save_qupath {
            kinds.push("qupath");
        }
        for kind in kinds {
            let dir = settings.output_dir.join(kind).join(&settings.slide_name);
            recreate_dir(&dir)?;
        }
        info!(
            output_dir = %settings.output_dir.display(),
            slide = %settings.slide_name,
            "Prepared output directories"
        );
        Ok(Self {
            settings,
            placed: Vec::new(),
        })
    }

    fn artifact_path(&self, kind: &str, file_name: &str) -> PathBuf {
        self.settings
            .output_dir
            .join(kind)
            .join(&self.settings.slide_name)
            .join(file_name)
    }

    pub fn slide_annotation_path(&self) -> PathBuf {
        self.settings
            .output_dir
            .join("halo")
            .join(format!("{}.annotations", self.settings.slide_name))
    }

    pub fn report_path(&self) -> PathBuf {
        self.settings.output_dir.join("report.json")
    }

    fn write_qupath(&self, image: &ProcessedImage) -> Result<()> {
        let path = self.artifact_path("qupath", &format!("{}.tsv", image.name));
        let mut out = String::from("x\ty\tclass\tname\tcolor\n");
        for info in image.instances.values() {
            let type_id = info.type_id.unwrap_or(0);
            let cell = self.settings.cell_types.iter().find(|c| c.id == type_id);
            let (name, color) = match cell {
                Some(cell) => (cell.name.as_str(), qupath_color(cell.rgb)),
                None => ("Unclassified", qupath_color([0, 0, 0])),
            };
            out.push_str(&format!(
                "{:.1}\t{:.1}\t{type_id}\t{name}\t{color}\n",
                info.centroid[0], info.centroid[1]
            ));
        }
        fs::write(&path, out)
            .with_context(|| format!("failed to write QuPath export: {}", path.display()))
    }
}

impl ResultSink for FsResultSink {
    fn persist(&mut self, image: &ProcessedImage) -> Result<()> {
        let halo_path = self.artifact_path("halo", &format!("{}.annotations", image.name));
        fs::write(&halo_path, &image.annotation)
            .with_context(|| format!("failed to write annotation: {}", halo_path.display()))?;

        let json_path = self.artifact_path("json", &format!("{}.json", image.name));
        let instance_file = InstanceFile {
            mag: None,
            nuc: image.instances.clone(),
        };
        let json = serde_json::to_string(&instance_file)
            .context("failed to serialize instance info")?;
        fs::write(&json_path, json)
            .with_context(|| format!("failed to write instance info: {}", json_path.display()))?;

        let type_path = self.artifact_path("npy", &format!("{}_type.npy", image.name));
        write_npy_file(&type_path, |writer| instance_types(image).write_npy(writer))?;

        if self.settings.save_raw_map {
            let map_path = self.artifact_path("npy", &format!("{}_map.npy", image.name));
            write_npy_file(&map_path, |writer| {
                image.prediction_map.as_standard_layout().write_npy(writer)
            })?;
        }
        if self.settings.save_qupath {
            self.write_qupath(image)?;
        }

        if let Some(placement) = image.placement {
            self.placed.push((image.name.clone(), placement));
        }
        debug!(
            image = %image.name,
            instances = image.instances.len(),
            "Persisted image artifacts"
        );
        Ok(())
    }

    fn finish(&mut self, report: &RunReport) -> Result<()> {
        if self.placed.is_empty() {
            debug!("No placed tiles; skipping slide-level merge");
        } else {
            let mut tiles = Vec::with_capacity(self.placed.len());
            for (name, placement) in &self.placed {
                let path = self.artifact_path("json", &format!("{name}.json"));
                match read_instance_file(&path) {
                    Ok(file) => tiles.push(MergeTile {
                        placement: *placement,
                        instances: file.nuc,
                    }),
                    Err(error) => {
                        warn!(image = %name, error = %format!("{error:#}"), "Skipping tile in slide merge")
                    }
                }
            }
            let document = merge_tiles(
                &tiles,
                &self.settings.cell_types,
                self.settings.merge_rotation,
            );
            let path = self.slide_annotation_path();
            fs::write(&path, document.to_xml())
                .with_context(|| format!("failed to write slide annotation: {}", path.display()))?;
            info!(
                path = %path.display(),
                tiles = tiles.len(),
                regions = document.region_count(),
                "Wrote slide-level annotation"
            );
        }

        let path = self.report_path();
        let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
        let mut file = fs::File::create(&path)
            .with_context(|| format!("failed to create run report: {}", path.display()))?;
        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write run report: {}", path.display()))?;
        Ok(())
    }
}

pub fn read_instance_file(path: &Path) -> Result<InstanceFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read instance info: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse instance info: {}", path.display()))
}

/// `(instance id, type id)` rows in ascending id order; untyped instances get 0.
fn instance_types(image: &ProcessedImage) -> Array2<i32> {
    let mut pairs = Array2::zeros((image.instances.len(), 2));
    for (mut row, (&id, info)) in pairs.rows_mut().into_iter().zip(&image.instances) {
        row[0] = id as i32;
        row[1] = info.type_id.unwrap_or(0) as i32;
    }
    pairs
}

fn write_npy_file(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<fs::File>) -> Result<(), WriteNpyError>,
) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer).with_context(|| format!("failed to write {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to clear output directory: {}", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory: {}", dir.display()))
}

/// QuPath colours are signed packed ARGB with full alpha.
fn qupath_color([r, g, b]: [u8; 3]) -> i32 {
    (0xFF00_0000u32 | (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)) as i32
}
