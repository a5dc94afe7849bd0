//! TMA scanner summary: spot positions on the parent slide.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

use crate::types::{FileRef, Placement};

const COL_SPOT_ID: &str = "Spot Id 1";
const COL_VALID: &str = "Spot Valid";
const COL_TMA_COLUMN: &str = "TMA Column";
const COL_TMA_ROW: &str = "TMA Row";
const COL_LEFT: &str = "Left(pixels)";
const COL_TOP: &str = "Top (pixels)";
const COL_WIDTH: &str = "Width (pixels)";
const COL_HEIGHT: &str = "Height (pixels)";

/// Spot key used in tile file names, e.g. `C03R11`.
pub fn spot_key(column: &str, row: &str) -> String {
    format!("C{:0>2}R{:0>2}", column.trim(), row.trim())
}

pub fn load_summary(path: &Path) -> Result<BTreeMap<String, Placement>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read TMA summary: {}", path.display()))?;
    parse_summary(&raw).with_context(|| format!("invalid TMA summary: {}", path.display()))
}

/// Parse the comma-separated summary. Spots that are not valid or lack a
/// numeric patient id are skipped.
pub fn parse_summary(text: &str) -> Result<BTreeMap<String, Placement>> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next().ok_or_else(|| anyhow!("summary is empty"))?;
    let header = split_row(header);
    let columns: HashMap<&str, usize> = header
        .iter()
        .enumerate()
        .map(|(index, name)| (name.as_str(), index))
        .collect();
    let column = |name: &str| -> Result<usize> {
        columns
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("missing column '{name}'"))
    };
    let spot_id = column(COL_SPOT_ID)?;
    let valid = column(COL_VALID)?;
    let tma_column = column(COL_TMA_COLUMN)?;
    let tma_row = column(COL_TMA_ROW)?;
    let left = column(COL_LEFT)?;
    let top = column(COL_TOP)?;
    let width = column(COL_WIDTH)?;
    let height = column(COL_HEIGHT)?;

    let mut spots = BTreeMap::new();
    for (index, line) in lines.enumerate() {
        let line_no = index + 2;
        let fields = split_row(line);
        let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");

        let patient = field(spot_id);
        let is_valid = field(valid) == "true";
        if !is_valid || patient.is_empty() || !patient.chars().all(|c| c.is_ascii_digit()) {
            warn!(line = line_no, patient, "Ignoring invalid TMA spot");
            continue;
        }

        let number = |i: usize, name: &str| -> Result<i64> {
            let value = field(i);
            value
                .parse::<f64>()
                .map(|v| v as i64)
                .with_context(|| format!("line {line_no}: '{name}' is not a number: '{value}'"))
        };
        let placement = Placement {
            left: number(left, COL_LEFT)?,
            top: number(top, COL_TOP)?,
            width: number(width, COL_WIDTH)?,
            height: number(height, COL_HEIGHT)?,
        };
        if placement.width <= 0 || placement.height <= 0 {
            bail!("line {line_no}: spot has an empty extent");
        }
        spots.insert(spot_key(field(tma_column), field(tma_row)), placement);
    }

    debug!(spots = spots.len(), "Parsed TMA summary");
    Ok(spots)
}

/// Split one CSV record. Quoted fields may contain commas, and `""` inside
/// quotes is a literal quote. Records never span lines in scanner output.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// The spot key embedded in a tile name: the second-to-last `_` token.
pub fn spot_key_of(name: &str) -> Option<&str> {
    let mut tokens = name.rsplit('_');
    tokens.next()?;
    tokens.next()
}

/// Attach each file's spot placement; returns how many files matched.
pub fn attach_placements(files: &mut [FileRef], spots: &BTreeMap<String, Placement>) -> usize {
    let mut matched = 0;
    for file in files.iter_mut() {
        match spot_key_of(&file.name).and_then(|key| spots.get(key)) {
            Some(placement) => {
                file.placement = Some(*placement);
                matched += 1;
            }
            None => debug!(file = %file.name, "No TMA spot for file"),
        }
    }
    matched
}
