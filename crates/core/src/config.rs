use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILESTITCH_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TilingConfig,
    pub inference: InferenceConfig,
    pub memory: MemoryConfig,
    pub post_process: PostProcessConfig,
    pub output: OutputConfig,
    pub cell_types: Vec<CellType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of the patches fed to the transform.
    pub window_size: usize,
    /// Spacing between patch origins; equals the transform's valid output size.
    pub stride: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub batch_size: usize,
    /// Threads extracting patches ahead of the transform (0 = inline).
    pub extraction_workers: usize,
    pub model_path: Option<PathBuf>,
    pub backend: String,
    pub trt_cache_dir: PathBuf,
    pub scale_to_unit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Share of currently available RAM one caching round may use.
    pub budget_fraction: f64,
    /// Resident cost of a cached image relative to its padded pixel bytes.
    pub inflation_factor: f64,
    pub available_bytes_override: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostProcessConfig {
    /// Worker count for post-processing (0 = inline on the calling thread).
    pub workers: usize,
    /// Number of type classes including background; 0 disables typing.
    pub nr_types: usize,
    pub return_centroids: bool,
    pub foreground_channel: usize,
    pub foreground_threshold: f32,
    pub min_instance_area: usize,
    pub type_channel_offset: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeRotation {
    #[serde(rename = "none")]
    Identity,
    /// Scanner tiles are exported a quarter turn off the slide axes.
    #[default]
    QuarterTurn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub save_qupath: bool,
    pub save_raw_map: bool,
    pub merge_rotation: MergeRotation,
}

/// One instance class: its type id, display name, and HALO/QuPath colours.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellType {
    pub id: u32,
    pub name: String,
    /// HALO `LineColor` (BGR packed into a decimal integer string).
    pub line_color: String,
    pub rgb: [u8; 3],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tiling: TilingConfig::default(),
            inference: InferenceConfig::default(),
            memory: MemoryConfig::default(),
            post_process: PostProcessConfig::default(),
            output: OutputConfig::default(),
            cell_types: default_cell_types(),
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            stride: 164,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            extraction_workers: 8,
            model_path: None,
            backend: "cuda".to_string(),
            trt_cache_dir: PathBuf::from("trt_cache"),
            scale_to_unit: false,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_fraction: 0.6,
            inflation_factor: 5.0,
            available_bytes_override: None,
        }
    }
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            nr_types: 0,
            return_centroids: true,
            foreground_channel: 0,
            foreground_threshold: 0.5,
            min_instance_area: 10,
            type_channel_offset: 1,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_qupath: false,
            save_raw_map: false,
            merge_rotation: MergeRotation::QuarterTurn,
        }
    }
}

pub fn default_cell_types() -> Vec<CellType> {
    [
        (1, "Inflammation", "16711680", [0, 0, 255]),
        (2, "Epithelium", "255", [255, 0, 0]),
        (3, "Miscellaneous", "16711935", [255, 0, 255]),
        (4, "Stroma", "32768", [0, 128, 0]),
        (5, "Mucin", "16776960", [0, 255, 255]),
    ]
    .into_iter()
    .map(|(id, name, line_color, rgb)| CellType {
        id,
        name: name.to_string(),
        line_color: line_color.to_string(),
        rgb,
    })
    .collect()
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Reject values that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(PipelineError::InvalidConfig(msg).into()) };

        if self.tiling.stride == 0 || self.tiling.stride > self.tiling.window_size {
            return invalid(format!(
                "tiling.stride ({}) must be in 1..={} (tiling.window_size)",
                self.tiling.stride, self.tiling.window_size
            ));
        }
        if self.inference.batch_size == 0 {
            return invalid("inference.batch_size must be at least 1".to_string());
        }
        if !(self.memory.budget_fraction > 0.0 && self.memory.budget_fraction <= 1.0) {
            return invalid(format!(
                "memory.budget_fraction ({}) must be in (0, 1]",
                self.memory.budget_fraction
            ));
        }
        if !(self.memory.inflation_factor > 0.0) {
            return invalid(format!(
                "memory.inflation_factor ({}) must be positive",
                self.memory.inflation_factor
            ));
        }
        Ok(())
    }

    pub fn cell_type(&self, id: u32) -> Option<&CellType> {
        self.cell_types.iter().find(|cell| cell.id == id)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESTITCH_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tiling.window_size, 256);
        assert_eq!(cfg.tiling.stride, 164);
        assert_eq!(cfg.inference.batch_size, 128);
        assert_eq!(cfg.inference.extraction_workers, 8);
        assert_eq!(cfg.post_process.workers, 16);
        assert_eq!(cfg.memory.budget_fraction, 0.6);
        assert_eq!(cfg.memory.inflation_factor, 5.0);
        assert_eq!(cfg.output.merge_rotation, MergeRotation::QuarterTurn);
        assert_eq!(cfg.cell_types.len(), 5);
        assert_eq!(cfg.cell_type(2).map(|c| c.name.as_str()), Some("Epithelium"));
        cfg.validate().expect("defaults should validate");
    }

    #[test]
    fn output_section_without_rotation_uses_quarter_turn() {
        let cfg: AppConfig = toml::from_str("[output]\nsave_qupath = true\n").expect("parse config");
        assert!(cfg.output.save_qupath);
        assert_eq!(cfg.output.merge_rotation, MergeRotation::QuarterTurn);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.output.merge_rotation = MergeRotation::Identity;
        original.memory.available_bytes_override = Some(1 << 30);
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        assert!(encoded.contains("merge_rotation = \"none\""));
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let decoded: AppConfig =
            toml::from_str("[tiling]\nwindow_size = 270\nstride = 80\n").expect("parse config");
        assert_eq!(decoded.tiling.window_size, 270);
        assert_eq!(decoded.tiling.stride, 80);
        assert_eq!(decoded.inference, InferenceConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn validate_rejects_bad_geometry_and_budget() {
        let mut cfg = AppConfig::default();
        cfg.tiling.stride = 300;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.memory.budget_fraction = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.inference.batch_size = 0;
        let error = cfg.validate().expect_err("zero batch size must fail");
        assert!(error.to_string().contains("batch_size"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let dir = temp.path().join("data");
        initialize_data_dir(&dir).expect("initialize data dir");
        assert!(dir.join("config.toml").exists());

        let custom_content = "[tiling]\nwindow_size = 270\n";
        fs::write(dir.join("config.toml"), custom_content).expect("write custom config");
        initialize_data_dir(&dir).expect("initialize data dir again");
        let content = fs::read_to_string(dir.join("config.toml")).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs")),
            PathBuf::from("/abs")
        );
    }
}
