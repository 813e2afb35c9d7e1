//! Heightfield layers: 2.5D slices of a tile's walkable surface
//!
//! A layer holds at most one walkable floor per column, which lets stacked
//! geometry such as bridges and multi-storey buildings live in separate
//! layers of the same tile.

use super::compact_heightfield::CompactHeightfield;
use super::heightfield::{DIR_OFFSET_X, DIR_OFFSET_Z};
use super::NULL_AREA;
use glam::Vec3;
use recast_common::{Error, Result};
use std::collections::VecDeque;

/// Marker for a layer cell with no walkable floor
pub const LAYER_EMPTY_HEIGHT: u16 = 0xffff;

/// Upper bound on the layers extracted from one tile
pub const MAX_LAYERS: usize = 32;

/// A single walkable slice of a tile
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldLayer {
    /// Grid width in cells, without the border
    pub width: i32,
    /// Grid depth in cells, without the border
    pub height: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    /// Lowest floor in the layer, in cell heights above the source field's `bmin.y`
    pub hmin: u16,
    /// Highest floor in the layer
    pub hmax: u16,
    /// Floor height per cell relative to `hmin`, or [`LAYER_EMPTY_HEIGHT`]
    pub heights: Vec<u16>,
    /// Area id per cell
    pub areas: Vec<u8>,
    /// Bounds of the used cells
    pub minx: i32,
    pub maxx: i32,
    pub miny: i32,
    pub maxy: i32,
}

impl HeightfieldLayer {
    /// Floor height and area of cell `(x, z)`, if the cell is walkable
    pub fn cell(&self, x: i32, z: i32) -> Option<(u16, u8)> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return None;
        }
        let idx = (x + z * self.width) as usize;
        let h = self.heights[idx];
        (h != LAYER_EMPTY_HEIGHT).then_some((h, self.areas[idx]))
    }

    /// Number of walkable cells
    pub fn walkable_cells(&self) -> usize {
        self.heights.iter().filter(|&&h| h != LAYER_EMPTY_HEIGHT).count()
    }
}

struct LayerRegion {
    ymin: u16,
    ymax: u16,
    /// Column occupancy bitset
    columns: Vec<u64>,
    spans: Vec<(i32, i32, usize)>,
}

impl LayerRegion {
    fn new(column_count: usize) -> Self {
        Self {
            ymin: u16::MAX,
            ymax: 0,
            columns: vec![0; column_count.div_ceil(64)],
            spans: Vec::new(),
        }
    }

    fn has_column(&self, col: usize) -> bool {
        self.columns[col / 64] & (1 << (col % 64)) != 0
    }

    fn add(&mut self, x: i32, z: i32, i: usize, col: usize, y: u16) {
        self.columns[col / 64] |= 1 << (col % 64);
        self.ymin = self.ymin.min(y);
        self.ymax = self.ymax.max(y);
        self.spans.push((x, z, i));
    }

    fn shares_column(&self, other: &LayerRegion) -> bool {
        self.columns
            .iter()
            .zip(&other.columns)
            .any(|(a, b)| a & b != 0)
    }

    fn absorb(&mut self, other: LayerRegion) {
        for (a, b) in self.columns.iter_mut().zip(&other.columns) {
            *a |= b;
        }
        self.ymin = self.ymin.min(other.ymin);
        self.ymax = self.ymax.max(other.ymax);
        self.spans.extend(other.spans);
    }
}

fn overlap_range(amin: u16, amax: u16, bmin: u16, bmax: u16) -> bool {
    amin <= bmax && amax >= bmin
}

/// Partitions the walkable spans of `chf` into layers
///
/// Spans are flood-filled into regions holding at most one span per column.
/// Regions whose height ranges come within `walkable_height * 4` of each
/// other and that never share a column are merged. The result is cropped
/// by `border_size` cells on every side and sorted bottom to top.
pub fn build_heightfield_layers(
    chf: &CompactHeightfield,
    border_size: i32,
    walkable_height: i32,
) -> Result<Vec<HeightfieldLayer>> {
    let w = chf.width;
    let h = chf.height;
    let lw = w - border_size * 2;
    let lh = h - border_size * 2;
    if lw <= 0 || lh <= 0 {
        return Err(Error::Recast(format!(
            "border {border_size} leaves no interior in a {w}x{h} field"
        )));
    }

    let column_count = (w * h) as usize;
    let mut assigned = vec![false; chf.spans.len()];
    let mut regions: Vec<LayerRegion> = Vec::new();

    for z in 0..h {
        for x in 0..w {
            let cell = chf.cell(x, z);
            for i in cell.index as usize..(cell.index + cell.count) as usize {
                if assigned[i] || chf.areas[i] == NULL_AREA {
                    continue;
                }

                let mut region = LayerRegion::new(column_count);
                let mut queue = VecDeque::new();
                assigned[i] = true;
                region.add(x, z, i, (x + z * w) as usize, chf.spans[i].y);
                queue.push_back((x, z, i));

                while let Some((cx, cz, ci)) = queue.pop_front() {
                    for dir in 0..4 {
                        let Some(ni) = chf.neighbour(cx, cz, ci, dir) else {
                            continue;
                        };
                        if assigned[ni] || chf.areas[ni] == NULL_AREA {
                            continue;
                        }
                        let nx = cx + DIR_OFFSET_X[dir];
                        let nz = cz + DIR_OFFSET_Z[dir];
                        let ncol = (nx + nz * w) as usize;
                        if region.has_column(ncol) {
                            continue;
                        }
                        assigned[ni] = true;
                        region.add(nx, nz, ni, ncol, chf.spans[ni].y);
                        queue.push_back((nx, nz, ni));
                    }
                }
                regions.push(region);
            }
        }
    }

    let merge_height = u16::try_from(walkable_height.max(0) * 4).unwrap_or(u16::MAX);
    let mut merged: Vec<LayerRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        let target = merged.iter_mut().find(|m| {
            overlap_range(
                m.ymin,
                m.ymax.saturating_add(merge_height),
                region.ymin,
                region.ymax.saturating_add(merge_height),
            ) && !m.shares_column(&region)
        });
        match target {
            Some(m) => m.absorb(region),
            None => merged.push(region),
        }
    }

    let mut layers = Vec::new();
    for region in merged {
        let interior: Vec<_> = region
            .spans
            .iter()
            .filter(|&&(x, z, _)| {
                x >= border_size && x < w - border_size && z >= border_size && z < h - border_size
            })
            .copied()
            .collect();
        if interior.is_empty() {
            continue;
        }

        let hmin = interior.iter().map(|&(_, _, i)| chf.spans[i].y).min().unwrap_or(0);
        let hmax = interior.iter().map(|&(_, _, i)| chf.spans[i].y).max().unwrap_or(0);
        let size = (lw * lh) as usize;
        let mut heights = vec![LAYER_EMPTY_HEIGHT; size];
        let mut areas = vec![NULL_AREA; size];
        let (mut minx, mut maxx, mut miny, mut maxy) = (lw, 0, lh, 0);

        for &(x, z, i) in &interior {
            let lx = x - border_size;
            let lz = z - border_size;
            let idx = (lx + lz * lw) as usize;
            heights[idx] = chf.spans[i].y - hmin;
            areas[idx] = chf.areas[i];
            minx = minx.min(lx);
            maxx = maxx.max(lx);
            miny = miny.min(lz);
            maxy = maxy.max(lz);
        }

        let border = border_size as f32 * chf.cs;
        layers.push(HeightfieldLayer {
            width: lw,
            height: lh,
            bmin: Vec3::new(
                chf.bmin.x + border,
                chf.bmin.y + f32::from(hmin) * chf.ch,
                chf.bmin.z + border,
            ),
            bmax: Vec3::new(
                chf.bmax.x - border,
                chf.bmin.y + f32::from(hmax) * chf.ch,
                chf.bmax.z - border,
            ),
            cs: chf.cs,
            ch: chf.ch,
            hmin,
            hmax,
            heights,
            areas,
            minx,
            maxx,
            miny,
            maxy,
        });
    }

    layers.sort_by_key(|l| l.hmin);
    if layers.len() > MAX_LAYERS {
        log::debug!(
            "tile produced {} layers, keeping the lowest {MAX_LAYERS}",
            layers.len()
        );
        layers.truncate(MAX_LAYERS);
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heightfield, WALKABLE_AREA};

    fn field(w: i32, h: i32) -> Heightfield {
        Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 20.0, h as f32),
            1.0,
            0.1,
        )
        .unwrap()
    }

    #[test]
    fn test_stacked_floors_split_into_layers() {
        let mut hf = field(4, 4);
        for z in 0..4 {
            for x in 0..4 {
                hf.add_span(x, z, 0, 10, WALKABLE_AREA, 1).unwrap();
                hf.add_span(x, z, 40, 50, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = CompactHeightfield::build(&hf, 5, 2).unwrap();
        let layers = build_heightfield_layers(&chf, 0, 5).unwrap();

        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].hmin, 10);
        assert_eq!(layers[1].hmin, 50);
        assert_eq!(layers[0].walkable_cells(), 16);
        assert_eq!(layers[1].cell(2, 2), Some((0, WALKABLE_AREA)));
    }

    #[test]
    fn test_border_is_cropped() {
        let mut hf = field(6, 6);
        for z in 0..6 {
            for x in 0..6 {
                hf.add_span(x, z, 0, 10 + x as u16, WALKABLE_AREA, 1).unwrap();
            }
        }
        let chf = CompactHeightfield::build(&hf, 5, 2).unwrap();
        let layers = build_heightfield_layers(&chf, 1, 5).unwrap();

        assert_eq!(layers.len(), 1);
        let layer = &layers[0];
        assert_eq!((layer.width, layer.height), (4, 4));
        assert_eq!(layer.hmin, 11);
        assert_eq!(layer.hmax, 14);
        assert_eq!(layer.cell(3, 0), Some((3, WALKABLE_AREA)));
        assert!((layer.bmin.x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_layer_count_is_capped() {
        let mut hf = field(2, 2);
        let floors = MAX_LAYERS as u16 + 8;
        for z in 0..2 {
            for x in 0..2 {
                for i in 0..floors {
                    hf.add_span(x, z, i * 20, i * 20 + 2, WALKABLE_AREA, 1).unwrap();
                }
            }
        }
        let chf = CompactHeightfield::build(&hf, 5, 2).unwrap();
        let layers = build_heightfield_layers(&chf, 0, 5).unwrap();

        // The lowest floors are kept
        assert_eq!(layers.len(), MAX_LAYERS);
        assert_eq!(layers[0].hmin, 2);
        assert_eq!(layers[MAX_LAYERS - 1].hmin, (MAX_LAYERS as u16 - 1) * 20 + 2);
        assert!(layers.iter().all(|l| l.walkable_cells() == 4));
    }

    #[test]
    fn test_empty_interior_is_rejected() {
        let hf = field(2, 2);
        let chf = CompactHeightfield::build(&hf, 5, 2).unwrap();
        assert!(build_heightfield_layers(&chf, 1, 5).is_err());
    }
}
