//! Slide-level merge of per-tile annotations.

use std::collections::BTreeMap;

use crate::config::{CellType, MergeRotation};
use crate::halo::{HaloDocument, Layer, Region, DEFAULT_LINE_COLOR};
use crate::postproc::InstanceInfo;
use crate::types::Placement;

pub const TILE_LAYER_NAME: &str = "Layer 1";

/// A persisted tile and where it sits on the slide.
#[derive(Debug, Clone)]
pub struct MergeTile {
    pub placement: Placement,
    pub instances: BTreeMap<u32, InstanceInfo>,
}

/// Map a tile-local `[x, y]` point into slide coordinates.
///
/// `QuarterTurn` rotates the tile by -90 degrees about its centre before
/// translating, for scanners whose tiles are exported rotated.
pub fn to_slide(point: [i64; 2], placement: &Placement, rotation: MergeRotation) -> [i64; 2] {
    let [x, y] = point;
    match rotation {
        MergeRotation::Identity => [x + placement.left, y + placement.top],
        MergeRotation::QuarterTurn => {
            let (w, h) = (placement.width, placement.height);
            [
                (w - h).div_euclid(2) + y + placement.left,
                (w + h).div_euclid(2) - x + placement.top,
            ]
        }
    }
}

/// One ellipse per tile on the first layer, then one polygon layer per cell type.
///
/// Instances without a positive type that matches a cell type are left out.
pub fn merge_tiles(
    tiles: &[MergeTile],
    cell_types: &[CellType],
    rotation: MergeRotation,
) -> HaloDocument {
    let mut document = HaloDocument::new();
    let tile_layer = document.push_layer(Layer::new(TILE_LAYER_NAME, DEFAULT_LINE_COLOR));
    for tile in tiles {
        let p = &tile.placement;
        tile_layer.regions.push(Region::ellipse(
            [p.left, p.top],
            [p.left + p.width, p.top + p.height],
        ));
    }

    for cell in cell_types {
        document.push_layer(Layer::new(cell.name.clone(), cell.line_color.clone()));
    }

    for tile in tiles {
        for info in tile.instances.values() {
            let Some(type_id) = info.type_id.filter(|&t| t > 0) else {
                continue;
            };
            let Some(index) = cell_types.iter().position(|cell| cell.id == type_id) else {
                continue;
            };
            let vertices = info
                .contour
                .iter()
                .map(|&point| to_slide(point, &tile.placement, rotation))
                .collect();
            // layer 0 is the tile layer
            document.layers[index + 1].regions.push(Region::polygon(vertices));
        }
    }
    document
}
