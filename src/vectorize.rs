//! Raster mask → GeoJSON polygons.
//!
//! Regions are 4-connected runs of equal non-zero value. Each region is
//! traced along pixel edges into an outer ring plus holes, so vertices sit on
//! pixel corners. Regions sharing a value are merged into one feature.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::geo::Affine;

/// A closed ring, first vertex repeated at the end.
pub type Ring = Vec<[f64; 2]>;
/// Outer ring followed by holes.
pub type PolygonRings = Vec<Ring>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: PolygonRings },
    MultiPolygon { coordinates: Vec<PolygonRings> },
}

impl Geometry {
    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Polygon { coordinates } => coordinates.is_empty(),
            Geometry::MultiPolygon { coordinates } => coordinates.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureProperties {
    pub uid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    pub properties: FeatureProperties,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Feature,
}

impl Feature {
    pub fn new(uid: i64, geometry: Geometry) -> Self {
        Self {
            kind: FeatureKind::Feature,
            properties: FeatureProperties {
                uid,
                score: None,
                text: None,
            },
            geometry,
        }
    }

    /// The placeholder returned when a mask has no regions.
    pub fn empty() -> Self {
        Feature::new(-1, Geometry::MultiPolygon { coordinates: Vec::new() })
    }
}

#[derive(Debug, Serialize)]
struct FeatureCollection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    features: &'a [Feature],
}

#[derive(Debug, thiserror::Error)]
pub enum VectorizeError {
    #[error("failed to write GeoJSON to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode GeoJSON: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Trace `mask` into features, one per distinct non-zero value.
///
/// The result is never empty: a mask without regions yields a single
/// feature with `uid = -1` and an empty MultiPolygon.
pub fn raster_to_vector(mask: &Array2<i32>, transform: Option<&Affine>) -> Vec<Feature> {
    let labels = label_regions(mask);

    // value -> polygons, in order of first appearance
    let mut order: Vec<i32> = Vec::new();
    let mut grouped: HashMap<i32, Vec<PolygonRings>> = HashMap::new();
    let edges = boundary_edges(&labels.ids, labels.regions.len());
    for (region, region_edges) in labels.regions.iter().zip(edges) {
        let polygons = trace_region(region_edges);
        grouped
            .entry(region.value)
            .or_insert_with(|| {
                order.push(region.value);
                Vec::new()
            })
            .extend(polygons);
    }

    let mut features: Vec<Feature> = order
        .into_iter()
        .filter_map(|value| {
            let mut polygons = grouped.remove(&value)?;
            if let Some(t) = transform {
                for polygon in polygons.iter_mut() {
                    georeference(polygon, t);
                }
            }
            let geometry = if polygons.len() == 1 {
                Geometry::Polygon {
                    coordinates: polygons.remove(0),
                }
            } else {
                Geometry::MultiPolygon {
                    coordinates: polygons,
                }
            };
            Some(Feature::new(value as i64, geometry))
        })
        .collect();

    if features.is_empty() {
        tracing::warn!("no polygons found; creating empty fallback GeoJSON");
        features.push(Feature::empty());
    }
    features
}

/// Write `features` as a FeatureCollection.
pub fn save_geojson(features: &[Feature], path: &Path) -> Result<(), VectorizeError> {
    let write_err = |source| VectorizeError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let body = serde_json::to_vec(&FeatureCollection {
        kind: "FeatureCollection",
        features,
    })?;
    fs::write(path, body).map_err(write_err)?;
    tracing::debug!(path = %path.display(), count = features.len(), "saved GeoJSON");
    Ok(())
}

fn georeference(polygon: &mut PolygonRings, transform: &Affine) {
    for ring in polygon.iter_mut() {
        for vertex in ring.iter_mut() {
            let (x, y) = transform.apply(vertex[0], vertex[1]);
            *vertex = [x, y];
        }
    }
}

struct Region {
    value: i32,
}

struct Labels {
    ids: Array2<u32>,
    regions: Vec<Region>,
}

// Component ids start at 1; 0 marks background.
fn label_regions(mask: &Array2<i32>) -> Labels {
    let (rows, cols) = mask.dim();
    let mut ids = Array2::<u32>::zeros((rows, cols));
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for row in 0..rows {
        for col in 0..cols {
            let value = mask[[row, col]];
            if value == 0 || ids[[row, col]] != 0 {
                continue;
            }
            let id = regions.len() as u32 + 1;
            regions.push(Region { value });
            ids[[row, col]] = id;
            stack.push((row, col));

            while let Some((r, c)) = stack.pop() {
                let mut visit = |nr: usize, nc: usize| {
                    if ids[[nr, nc]] == 0 && mask[[nr, nc]] == value {
                        ids[[nr, nc]] = id;
                        stack.push((nr, nc));
                    }
                };
                if r > 0 {
                    visit(r - 1, c);
                }
                if r + 1 < rows {
                    visit(r + 1, c);
                }
                if c > 0 {
                    visit(r, c - 1);
                }
                if c + 1 < cols {
                    visit(r, c + 1);
                }
            }
        }
    }

    Labels { ids, regions }
}

/// Unit step along a pixel edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Dir(i32, i32);

impl Dir {
    // Side of the edge the region pixel lies on.
    fn inside(self) -> Dir {
        Dir(-self.1, self.0)
    }

    fn reverse(self) -> Dir {
        Dir(-self.0, -self.1)
    }
}

type Vertex = (i32, i32);

type EdgeMap = HashMap<Vertex, Vec<Dir>>;

// Boundary edges of every region in one pass, indexed by `id - 1` and
// oriented so the region lies on `Dir::inside`.
fn boundary_edges(ids: &Array2<u32>, region_count: usize) -> Vec<EdgeMap> {
    let (rows, cols) = ids.dim();
    let id_at = |r: i64, c: i64| {
        if r < 0 || c < 0 || r as usize >= rows || c as usize >= cols {
            0
        } else {
            ids[[r as usize, c as usize]]
        }
    };

    let mut edges: Vec<EdgeMap> = (0..region_count).map(|_| HashMap::new()).collect();
    for row in 0..rows {
        for col in 0..cols {
            let id = ids[[row, col]];
            if id == 0 {
                continue;
            }
            let map = &mut edges[id as usize - 1];
            let (r, c) = (row as i64, col as i64);
            let (x, y) = (col as i32, row as i32);
            if id_at(r - 1, c) != id {
                map.entry((x, y)).or_default().push(Dir(1, 0));
            }
            if id_at(r, c + 1) != id {
                map.entry((x + 1, y)).or_default().push(Dir(0, 1));
            }
            if id_at(r + 1, c) != id {
                map.entry((x + 1, y + 1)).or_default().push(Dir(-1, 0));
            }
            if id_at(r, c - 1) != id {
                map.entry((x, y + 1)).or_default().push(Dir(0, -1));
            }
        }
    }
    edges
}

fn take_edge(edges: &mut EdgeMap, at: Vertex, dir: Dir) -> bool {
    if let Some(out) = edges.get_mut(&at) {
        if let Some(pos) = out.iter().position(|d| *d == dir) {
            out.swap_remove(pos);
            if out.is_empty() {
                edges.remove(&at);
            }
            return true;
        }
    }
    false
}

// Follow edges into closed rings. At a vertex with two exits the turn away
// from the region is taken, so a ring hugs one 4-connected background patch
// and never passes through the same vertex twice.
fn link_rings(mut edges: EdgeMap) -> Vec<Vec<(Vertex, Dir)>> {
    let mut starts: Vec<Vertex> = edges.keys().copied().collect();
    starts.sort_by_key(|&(x, y)| (y, x));

    let mut rings = Vec::new();
    for start in starts {
        while let Some(&first) = edges.get(&start).and_then(|out| out.first()) {
            take_edge(&mut edges, start, first);
            let mut ring = vec![(start, first)];
            let mut at = (start.0 + first.0, start.1 + first.1);
            let mut dir = first;

            loop {
                let mut next = None;
                for d in [dir.inside().reverse(), dir, dir.inside()] {
                    if at == start && d == first {
                        break;
                    }
                    if take_edge(&mut edges, at, d) {
                        next = Some(d);
                        break;
                    }
                }
                let Some(next) = next else { break };
                ring.push((at, next));
                at = (at.0 + next.0, at.1 + next.1);
                dir = next;
            }
            rings.push(ring);
        }
    }
    rings
}

// Drop vertices in the middle of straight runs and close the ring.
fn simplify(ring: &[(Vertex, Dir)]) -> Ring {
    let n = ring.len();
    let mut out: Ring = ring
        .iter()
        .enumerate()
        .filter(|(i, (_, dir))| ring[(i + n - 1) % n].1 != *dir)
        .map(|(_, ((x, y), _))| [*x as f64, *y as f64])
        .collect();
    if let Some(first) = out.first().copied() {
        out.push(first);
    }
    out
}

// Positive for outer rings, negative for holes (y grows downwards).
fn signed_area(ring: &[(Vertex, Dir)]) -> i64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let (x0, y0) = ring[i].0;
            let (x1, y1) = ring[(i + 1) % n].0;
            x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64
        })
        .sum()
}

// Centre of the background pixel just across the first edge of a hole.
fn hole_probe(ring: &[(Vertex, Dir)]) -> (f64, f64) {
    let ((x, y), dir) = ring[0];
    let away = dir.inside().reverse();
    (
        x as f64 + dir.0 as f64 / 2.0 + away.0 as f64 / 2.0,
        y as f64 + dir.1 as f64 / 2.0 + away.1 as f64 / 2.0,
    )
}

fn contains(ring: &Ring, (px, py): (f64, f64)) -> bool {
    let mut inside = false;
    for pair in ring.windows(2) {
        let ([x0, y0], [x1, y1]) = (pair[0], pair[1]);
        if (y0 > py) != (y1 > py) {
            let x_cross = x0 + (py - y0) / (y1 - y0) * (x1 - x0);
            if px < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn trace_region(edges: EdgeMap) -> Vec<PolygonRings> {
    let rings = link_rings(edges);

    let mut shells: Vec<PolygonRings> = Vec::new();
    let mut holes = Vec::new();
    for ring in rings {
        if signed_area(&ring) > 0 {
            shells.push(vec![simplify(&ring)]);
        } else {
            holes.push((hole_probe(&ring), simplify(&ring)));
        }
    }

    for (probe, hole) in holes {
        let owner = if shells.len() == 1 {
            Some(0)
        } else {
            shells.iter().position(|shell| contains(&shell[0], probe))
        };
        if let Some(i) = owner {
            shells[i].push(hole);
        }
    }
    shells
}
