//! HALO `.annotations` XML writer.
//!
//! A document is a list of annotation layers, each holding polygon or
//! ellipse regions in pixel coordinates. Per-tile annotations and the
//! slide-level merge both render through [`HaloDocument::to_xml`].

use std::fmt::Write;

use crate::config::CellType;

/// `LineColor` of layers that are not tied to a cell type.
pub const DEFAULT_LINE_COLOR: &str = "65535";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Polygon,
    /// Axis-aligned ellipse given by two opposite bounding-box corners.
    Ellipse,
}

impl RegionKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Polygon => "Polygon",
            Self::Ellipse => "Ellipse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    /// `[x, y]` vertices.
    pub vertices: Vec<[i64; 2]>,
}

impl Region {
    pub fn polygon(vertices: Vec<[i64; 2]>) -> Self {
        Self {
            kind: RegionKind::Polygon,
            vertices,
        }
    }

    pub fn ellipse(top_left: [i64; 2], bottom_right: [i64; 2]) -> Self {
        Self {
            kind: RegionKind::Ellipse,
            vertices: vec![top_left, bottom_right],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub name: String,
    pub line_color: String,
    pub regions: Vec<Region>,
}

impl Layer {
    pub fn new(name: impl Into<String>, line_color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line_color: line_color.into(),
            regions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaloDocument {
    pub layers: Vec<Layer>,
}

impl HaloDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// One empty layer per cell type, in table order.
    pub fn with_cell_types(cell_types: &[CellType]) -> Self {
        Self {
            layers: cell_types
                .iter()
                .map(|cell| Layer::new(cell.name.clone(), cell.line_color.clone()))
                .collect(),
        }
    }

    pub fn push_layer(&mut self, layer: Layer) -> &mut Layer {
        self.layers.push(layer);
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }

    pub fn region_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.regions.len()).sum()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, r#"<?xml version="1.0" ?>"#);
        if self.layers.is_empty() {
            let _ = writeln!(out, "<Annotations/>");
            return out;
        }

        let _ = writeln!(out, "<Annotations>");
        for layer in &self.layers {
            let _ = writeln!(
                out,
                r#"  <Annotation LineColor="{}" Name="{}" Visible="True">"#,
                xml_escape(&layer.line_color),
                xml_escape(&layer.name),
            );
            if layer.regions.is_empty() {
                let _ = writeln!(out, "    <Regions/>");
            } else {
                let _ = writeln!(out, "    <Regions>");
                for region in &layer.regions {
                    write_region(&mut out, region);
                }
                let _ = writeln!(out, "    </Regions>");
            }
            let _ = writeln!(out, "  </Annotation>");
        }
        let _ = writeln!(out, "</Annotations>");
        out
    }
}

fn write_region(out: &mut String, region: &Region) {
    let _ = writeln!(
        out,
        r#"      <Region Type="{}" HasEndcaps="0" NegativeROA="0">"#,
        region.kind.as_str(),
    );
    let _ = writeln!(out, "        <Vertices>");
    for [x, y] in &region.vertices {
        let _ = writeln!(out, r#"          <V X="{x}" Y="{y}"/>"#);
    }
    let _ = writeln!(out, "        </Vertices>");
    let _ = writeln!(out, "        <Comments/>");
    let _ = writeln!(out, "      </Region>");
}

/// Escape the five XML special characters for attribute values.
fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_cell_types;

    #[test]
    fn empty_document_is_self_closing() {
        let xml = HaloDocument::new().to_xml();
        assert!(xml.starts_with(r#"<?xml version="1.0" ?>"#));
        assert!(xml.trim_end().ends_with("<Annotations/>"));
    }

    #[test]
    fn cell_type_layers_follow_table_order() {
        let doc = HaloDocument::with_cell_types(&default_cell_types());
        let names: Vec<&str> = doc.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Inflammation", "Epithelium", "Miscellaneous", "Stroma", "Mucin"]
        );
        assert_eq!(doc.layers[1].line_color, "255");
    }

    #[test]
    fn regions_render_vertices_in_order() {
        let mut doc = HaloDocument::new();
        let layer = doc.push_layer(Layer::new("Layer 1", DEFAULT_LINE_COLOR));
        layer.regions.push(Region::ellipse([10, 20], [110, 220]));
        layer.regions.push(Region::polygon(vec![[1, 2], [3, 4], [5, 6]]));

        let xml = doc.to_xml();
        assert!(xml.contains(r#"<Annotation LineColor="65535" Name="Layer 1" Visible="True">"#));
        assert!(xml.contains(r#"<Region Type="Ellipse" HasEndcaps="0" NegativeROA="0">"#));
        let first = xml.find(r#"<V X="1" Y="2"/>"#).expect("first vertex");
        let last = xml.find(r#"<V X="5" Y="6"/>"#).expect("last vertex");
        assert!(first < last);
        assert_eq!(doc.region_count(), 2);
    }

    #[test]
    fn layer_names_are_escaped() {
        let mut doc = HaloDocument::new();
        doc.push_layer(Layer::new("T & <B>", "1"));
        let xml = doc.to_xml();
        assert!(xml.contains(r#"Name="T &amp; &lt;B&gt;""#));
        assert!(xml.contains("<Regions/>"));
    }
}
