//! Tile cache builder for real-time mesh rebuilding
//!
//! Turns a decompressed layer, with the obstacles touching it stamped out,
//! into navmesh creation parameters. Walkable cells of equal area and
//! similar height are merged greedily into rectangles which become the
//! tile's polygons.

use super::tile_cache::{ObstacleData, TileCacheParams};
use super::tile_cache_data::TileCacheLayer;
use detour::{NavMeshCreateParams, PolyFlags, Status, DT_EXT_LINK, MESH_NULL_IDX};
use recast::{LAYER_EMPTY_HEIGHT, NULL_AREA};
use recast_common::{Error, Result};
use std::collections::HashMap;

/// Maximum vertices per polygon emitted by the builder
const NVP: usize = 6;

/// Hook applied to every tile before it is handed to the navmesh
///
/// Implementations assign polygon flags from area ids and may append
/// off-mesh connections for the tile.
pub trait TileCacheMeshProcess: Send {
    fn process(&self, params: &mut NavMeshCreateParams);
}

/// A merged run of cells `[x0, x1) x [z0, z1)` sharing one area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x0: i32,
    pub z0: i32,
    pub x1: i32,
    pub z1: i32,
    pub area: u8,
}

/// Converts cached layers into navmesh tile parameters
#[derive(Debug, Clone)]
pub struct TileCacheBuilder {
    cs: f32,
    ch: f32,
    walkable_height: f32,
    walkable_radius: f32,
    walkable_climb: f32,
}

impl TileCacheBuilder {
    /// Creates a builder using the cell and agent sizes of `params`
    pub fn new(params: &TileCacheParams) -> Self {
        Self {
            cs: params.cs,
            ch: params.ch,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
        }
    }

    /// Largest height difference, in cells, allowed inside one polygon
    fn climb_cells(&self) -> u16 {
        (self.walkable_climb / self.ch).floor().max(0.0) as u16
    }

    /// Clears the area of every cell covered by one of `obstacles`
    pub fn mark_obstacles<'a>(
        &self,
        layer: &mut TileCacheLayer,
        obstacles: impl IntoIterator<Item = &'a ObstacleData>,
    ) {
        for obstacle in obstacles {
            match obstacle {
                ObstacleData::Cylinder {
                    pos,
                    radius,
                    height,
                } => {
                    let r2 = radius * radius;
                    self.mark_cells(
                        layer,
                        [pos[0] - radius, pos[1], pos[2] - radius],
                        [pos[0] + radius, pos[1] + height, pos[2] + radius],
                        |cx, cz| {
                            let dx = cx - pos[0];
                            let dz = cz - pos[2];
                            dx * dx + dz * dz <= r2
                        },
                    );
                }
                ObstacleData::Box { bmin, bmax } => {
                    self.mark_cells(layer, *bmin, *bmax, |cx, cz| {
                        cx >= bmin[0] && cx <= bmax[0] && cz >= bmin[2] && cz <= bmax[2]
                    });
                }
            }
        }
    }

    fn mark_cells(
        &self,
        layer: &mut TileCacheLayer,
        bmin: [f32; 3],
        bmax: [f32; 3],
        inside: impl Fn(f32, f32) -> bool,
    ) {
        let origin = layer.header.bmin;
        let w = layer.width();
        let h = layer.height();

        let minx = (((bmin[0] - origin[0]) / self.cs).floor() as i32).max(0);
        let maxx = (((bmax[0] - origin[0]) / self.cs).ceil() as i32).min(w - 1);
        let minz = (((bmin[2] - origin[2]) / self.cs).floor() as i32).max(0);
        let maxz = (((bmax[2] - origin[2]) / self.cs).ceil() as i32).min(h - 1);

        for z in minz..=maxz {
            for x in minx..=maxx {
                let idx = (x + z * w) as usize;
                let height = layer.heights[idx];
                if height == LAYER_EMPTY_HEIGHT {
                    continue;
                }
                let cx = origin[0] + (x as f32 + 0.5) * self.cs;
                let cz = origin[2] + (z as f32 + 0.5) * self.cs;
                if !inside(cx, cz) {
                    continue;
                }
                let floor = origin[1] + f32::from(height) * self.ch;
                if floor > bmin[1] - self.ch && floor - self.ch < bmax[1] {
                    layer.areas[idx] = NULL_AREA;
                }
            }
        }
    }

    /// Greedily merges the walkable cells of `layer` into rectangles
    pub fn merge_cells(&self, layer: &TileCacheLayer) -> Vec<CellRect> {
        let w = layer.width();
        let h = layer.height();
        let climb = self.climb_cells();
        let mut used = vec![false; (w * h).max(0) as usize];
        let mut rects = Vec::new();

        // Range of heights after adding cell (x, z), if it may join
        let accepts = |used: &[bool], x: i32, z: i32, area: u8, lo: u16, hi: u16| {
            if used[(x + z * w) as usize] {
                return None;
            }
            let (ch, ca) = layer.cell(x, z)?;
            let (nlo, nhi) = (lo.min(ch), hi.max(ch));
            (ca == area && nhi - nlo <= climb).then_some((nlo, nhi))
        };

        for z in 0..h {
            for x in 0..w {
                if used[(x + z * w) as usize] {
                    continue;
                }
                let Some((h0, area)) = layer.cell(x, z) else {
                    continue;
                };
                let (mut lo, mut hi) = (h0, h0);

                let mut x1 = x + 1;
                while x1 < w {
                    match accepts(&used, x1, z, area, lo, hi) {
                        Some((l, u)) => {
                            (lo, hi) = (l, u);
                            x1 += 1;
                        }
                        None => break,
                    }
                }

                let mut z1 = z + 1;
                'rows: while z1 < h {
                    let (mut rlo, mut rhi) = (lo, hi);
                    for cx in x..x1 {
                        match accepts(&used, cx, z1, area, rlo, rhi) {
                            Some((l, u)) => (rlo, rhi) = (l, u),
                            None => break 'rows,
                        }
                    }
                    (lo, hi) = (rlo, rhi);
                    z1 += 1;
                }

                for rz in z..z1 {
                    for rx in x..x1 {
                        used[(rx + rz * w) as usize] = true;
                    }
                }
                rects.push(CellRect {
                    x0: x,
                    z0: z,
                    x1,
                    z1,
                    area,
                });
            }
        }
        rects
    }

    /// Builds navmesh creation parameters for `layer`
    ///
    /// Returns `Ok(None)` when the layer has no walkable cell left.
    pub fn build_params(&self, layer: &TileCacheLayer) -> Result<Option<NavMeshCreateParams>> {
        let rects = self.merge_cells(layer);
        if rects.is_empty() {
            return Ok(None);
        }

        let header = &layer.header;
        let w = layer.width();
        let h = layer.height();

        let mut verts: Vec<f32> = Vec::new();
        let mut vert_lookup: HashMap<(i32, i32, u16), u16> = HashMap::new();
        let mut vertex = |gx: i32, gz: i32, height: u16| -> Result<u16> {
            if let Some(&i) = vert_lookup.get(&(gx, gz, height)) {
                return Ok(i);
            }
            let i = u16::try_from(verts.len() / 3)
                .ok()
                .filter(|&i| i < MESH_NULL_IDX)
                .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;
            verts.extend_from_slice(&[
                header.bmin[0] + gx as f32 * self.cs,
                header.bmin[1] + f32::from(height) * self.ch,
                header.bmin[2] + gz as f32 * self.cs,
            ]);
            vert_lookup.insert((gx, gz, height), i);
            Ok(i)
        };
        let height_at = |x: i32, z: i32| layer.cell(x, z).map_or(0, |(hh, _)| hh);

        let mut polys = Vec::with_capacity(rects.len() * NVP * 2);
        let mut poly_areas = Vec::with_capacity(rects.len());
        for r in &rects {
            let corners = [
                vertex(r.x0, r.z0, height_at(r.x0, r.z0))?,
                vertex(r.x0, r.z1, height_at(r.x0, r.z1 - 1))?,
                vertex(r.x1, r.z1, height_at(r.x1 - 1, r.z1 - 1))?,
                vertex(r.x1, r.z0, height_at(r.x1 - 1, r.z0))?,
            ];
            let portal = |on_border: bool, side: u16| {
                if on_border {
                    DT_EXT_LINK | side
                } else {
                    MESH_NULL_IDX
                }
            };
            let mut entry = [MESH_NULL_IDX; NVP * 2];
            entry[..4].copy_from_slice(&corners);
            entry[NVP] = portal(r.x0 == 0, 4);
            entry[NVP + 1] = portal(r.z1 == h, 2);
            entry[NVP + 2] = portal(r.x1 == w, 0);
            entry[NVP + 3] = portal(r.z0 == 0, 6);
            polys.extend_from_slice(&entry);
            poly_areas.push(r.area);
        }

        let vert_count = verts.len() / 3;
        let mut bmax = header.bmax;
        bmax[1] = bmax[1].max(header.bmin[1] + f32::from(header.hmax - header.hmin) * self.ch);

        Ok(Some(NavMeshCreateParams {
            verts,
            vert_count,
            polys,
            poly_flags: vec![PolyFlags::WALK; rects.len()],
            poly_areas,
            poly_count: rects.len(),
            nvp: NVP,
            tile_x: header.tx,
            tile_y: header.ty,
            tile_layer: header.tlayer,
            bmin: header.bmin,
            bmax,
            walkable_height: self.walkable_height,
            walkable_radius: self.walkable_radius,
            walkable_climb: self.walkable_climb,
            ..NavMeshCreateParams::default()
        }))
    }
}
