//! Build parameters derived from settings and world bounds
//!
//! A [`BuildConfig`] is computed once per build and never changes
//! afterwards. It fixes the tile grid and how the 22 index bits of a polygon
//! reference are split between tile and polygon indices.

use detour::NavMeshParams;
use detour_tilecache::TileCacheParams;
use glam::Vec3;
use recast::RecastConfig;
use recast_common::{ilog2, next_pow2, Error, Result};

use crate::settings::RecastSettings;

/// Layers expected per tile column when sizing the tile tables
pub const EXPECTED_LAYERS_PER_TILE: u32 = 4;
/// Upper bound on the tile index bits
pub const MAX_TILE_BITS: u32 = 14;
/// Bits of a polygon reference shared by the tile and polygon indices
pub const REF_INDEX_BITS: u32 = 22;

/// How the world bounds are cut into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLayout {
    /// Square tiles of `tile_size` cells
    Tiled,
    /// One tile covering the whole grid
    Solo,
}

/// Immutable parameters of one build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub cs: f32,
    pub ch: f32,

    /// World grid size in cells
    pub grid_width: i32,
    pub grid_height: i32,
    /// Tile side in cells
    pub tile_size: i32,
    /// Tile grid size in tiles
    pub tile_width: i32,
    pub tile_height: i32,

    pub walkable_slope_angle: f32,
    /// Agent dimensions in cells
    pub walkable_height: i32,
    pub walkable_climb: i32,
    pub walkable_radius: i32,
    pub border_size: i32,

    pub max_edge_len: i32,
    pub max_simplification_error: f32,
    pub min_region_area: i32,
    pub merge_region_area: i32,
    pub max_verts_per_poly: i32,
    pub detail_sample_dist: f32,
    pub detail_sample_max_error: f32,

    pub tile_bits: u32,
    pub poly_bits: u32,
    pub max_tiles: u32,
    pub max_polys_per_tile: u32,

    /// Agent dimensions in world units
    pub agent_height: f32,
    pub agent_radius: f32,
    pub agent_max_climb: f32,
}

/// Splits the reference index bits for a `tw` x `th` tile grid
///
/// Returns `(tile_bits, poly_bits)`.
pub fn ref_bits(tw: i32, th: i32) -> (u32, u32) {
    let tiles = (tw.max(0) as u64) * (th.max(0) as u64) * u64::from(EXPECTED_LAYERS_PER_TILE);
    let tiles = u32::try_from(tiles).unwrap_or(u32::MAX).min(1 << 31);
    let tile_bits = ilog2(next_pow2(tiles)).min(MAX_TILE_BITS);
    (tile_bits, REF_INDEX_BITS - tile_bits)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

impl BuildConfig {
    /// Derives a tiled build over `bmin..bmax`
    pub fn derive(settings: &RecastSettings, bmin: [f32; 3], bmax: [f32; 3]) -> Result<Self> {
        Self::derive_with(settings, bmin, bmax, TileLayout::Tiled)
    }

    /// Derives a single-tile build covering `bmin..bmax`
    pub fn derive_solo(settings: &RecastSettings, bmin: [f32; 3], bmax: [f32; 3]) -> Result<Self> {
        Self::derive_with(settings, bmin, bmax, TileLayout::Solo)
    }

    fn derive_with(
        settings: &RecastSettings,
        bmin: [f32; 3],
        bmax: [f32; 3],
        layout: TileLayout,
    ) -> Result<Self> {
        let cs = settings.cell_size;
        let ch = settings.cell_height;
        if !(cs.is_finite() && cs > 0.0 && ch.is_finite() && ch > 0.0) {
            return Err(invalid("cell size and cell height must be positive"));
        }
        if !bmin.iter().chain(bmax.iter()).all(|v| v.is_finite()) {
            return Err(invalid("world bounds must be finite"));
        }
        if bmax[0] <= bmin[0] || bmax[2] <= bmin[2] {
            return Err(invalid(format!("degenerate world bounds {bmin:?}..{bmax:?}")));
        }
        if !(settings.agent_height > 0.0 && settings.agent_radius >= 0.0 && settings.agent_max_climb >= 0.0) {
            return Err(invalid("invalid agent dimensions"));
        }
        if !(0.0..=90.0).contains(&settings.agent_max_slope) {
            return Err(invalid("agent slope must be within 0..=90 degrees"));
        }
        if settings.verts_per_poly < 3 {
            return Err(invalid("too few vertices per polygon"));
        }

        let grid_width = ((bmax[0] - bmin[0]) / cs).ceil() as i32;
        let grid_height = ((bmax[2] - bmin[2]) / cs).ceil() as i32;
        if grid_width <= 0 || grid_height <= 0 {
            return Err(invalid(format!("empty grid {grid_width}x{grid_height}")));
        }

        let tile_size = match layout {
            TileLayout::Solo => grid_width.max(grid_height),
            TileLayout::Tiled if settings.tile_size > 0 => settings.tile_size,
            TileLayout::Tiled => {
                return Err(invalid(format!("tile size must be positive, got {}", settings.tile_size)));
            }
        };
        let tile_width = (grid_width + tile_size - 1) / tile_size;
        let tile_height = (grid_height + tile_size - 1) / tile_size;
        let (tile_bits, poly_bits) = ref_bits(tile_width, tile_height);

        let walkable_height = (settings.agent_height / ch).ceil() as i32;
        let walkable_climb = (settings.agent_max_climb / ch).floor() as i32;
        let walkable_radius = (settings.agent_radius / cs).ceil() as i32;

        let detail_sample_dist = if settings.detail_sample_dist < 0.9 {
            0.0
        } else {
            cs * settings.detail_sample_dist
        };

        Ok(Self {
            bmin,
            bmax,
            cs,
            ch,
            grid_width,
            grid_height,
            tile_size,
            tile_width,
            tile_height,
            walkable_slope_angle: settings.agent_max_slope,
            walkable_height,
            walkable_climb,
            walkable_radius,
            border_size: walkable_radius + 3,
            max_edge_len: (settings.edge_max_len / cs) as i32,
            max_simplification_error: settings.edge_max_error,
            min_region_area: (settings.region_min_size * settings.region_min_size) as i32,
            merge_region_area: (settings.region_merge_size * settings.region_merge_size) as i32,
            max_verts_per_poly: settings.verts_per_poly,
            detail_sample_dist,
            detail_sample_max_error: ch * settings.detail_sample_max_error,
            tile_bits,
            poly_bits,
            max_tiles: 1 << tile_bits,
            max_polys_per_tile: 1 << poly_bits,
            agent_height: settings.agent_height,
            agent_radius: settings.agent_radius,
            agent_max_climb: settings.agent_max_climb,
        })
    }

    /// Working width/depth of one tile including the border, in cells
    pub fn tile_working_size(&self) -> i32 {
        self.tile_size + self.border_size * 2
    }

    /// Side of one tile in world units
    pub fn tile_world_size(&self) -> f32 {
        self.tile_size as f32 * self.cs
    }

    pub fn tile_count(&self) -> usize {
        (self.tile_width as usize) * (self.tile_height as usize)
    }

    /// World bounds of tile `(tx, ty)` without the border
    pub fn tile_bounds(&self, tx: i32, ty: i32) -> ([f32; 3], [f32; 3]) {
        let tcs = self.tile_world_size();
        let bmin = [
            self.bmin[0] + tx as f32 * tcs,
            self.bmin[1],
            self.bmin[2] + ty as f32 * tcs,
        ];
        let bmax = [bmin[0] + tcs, self.bmax[1], bmin[2] + tcs];
        (bmin, bmax)
    }

    /// Voxel configuration for tile `(tx, ty)`, border included
    pub fn tile_recast_config(&self, tx: i32, ty: i32) -> RecastConfig {
        let mut cfg = RecastConfig {
            tile_size: self.tile_size,
            border_size: self.border_size,
            cs: self.cs,
            ch: self.ch,
            walkable_slope_angle: self.walkable_slope_angle,
            walkable_height: self.walkable_height,
            walkable_climb: self.walkable_climb,
            walkable_radius: self.walkable_radius,
            max_edge_len: self.max_edge_len,
            max_simplification_error: self.max_simplification_error,
            min_region_area: self.min_region_area,
            merge_region_area: self.merge_region_area,
            max_vertices_per_polygon: self.max_verts_per_poly,
            detail_sample_dist: self.detail_sample_dist,
            detail_sample_max_error: self.detail_sample_max_error,
            ..RecastConfig::default()
        };
        cfg.set_tile_bounds(Vec3::from_array(self.bmin), Vec3::from_array(self.bmax), tx, ty);
        cfg
    }

    pub fn nav_mesh_params(&self) -> NavMeshParams {
        NavMeshParams {
            origin: self.bmin,
            tile_width: self.tile_world_size(),
            tile_height: self.tile_world_size(),
            max_tiles: self.max_tiles,
            max_polys_per_tile: self.max_polys_per_tile,
        }
    }

    pub fn tile_cache_params(&self, max_obstacles: i32) -> TileCacheParams {
        let max_tiles = (self.tile_count() as u64 * u64::from(EXPECTED_LAYERS_PER_TILE)).min(i32::MAX as u64);
        TileCacheParams {
            origin: self.bmin,
            cs: self.cs,
            ch: self.ch,
            width: self.tile_size,
            height: self.tile_size,
            walkable_height: self.agent_height,
            walkable_radius: self.agent_radius,
            walkable_climb: self.agent_max_climb,
            max_simplification_error: self.max_simplification_error,
            max_tiles: max_tiles as i32,
            max_obstacles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds_100() -> ([f32; 3], [f32; 3]) {
        ([0.0, 0.0, 0.0], [100.0, 0.0, 100.0])
    }

    #[test]
    fn test_grid_scenario() {
        let (bmin, bmax) = bounds_100();
        let cfg = BuildConfig::derive(&RecastSettings::default(), bmin, bmax).unwrap();

        assert_eq!(cfg.grid_width, 334);
        assert_eq!(cfg.grid_height, 334);
        assert_eq!(cfg.tile_width, 7);
        assert_eq!(cfg.tile_height, 7);
        // 7 * 7 * 4 = 196 -> 256 -> 8 bits
        assert_eq!(cfg.tile_bits, 8);
        assert_eq!(cfg.poly_bits, 14);
        assert_eq!(cfg.max_tiles, 256);
        assert_eq!(cfg.max_polys_per_tile, 16384);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let (bmin, bmax) = bounds_100();
        let settings = RecastSettings::default();
        let a = BuildConfig::derive(&settings, bmin, bmax).unwrap();
        let b = BuildConfig::derive(&settings, bmin, bmax).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_voxel_agent_values() {
        let (bmin, bmax) = bounds_100();
        let cfg = BuildConfig::derive(&RecastSettings::default(), bmin, bmax).unwrap();
        // ceil(2.0 / 0.2), floor(0.9 / 0.2), ceil(0.6 / 0.3)
        assert_eq!(cfg.walkable_height, 10);
        assert_eq!(cfg.walkable_climb, 4);
        assert_eq!(cfg.walkable_radius, 2);
        assert_eq!(cfg.border_size, 5);
        assert_eq!(cfg.tile_working_size(), 58);
        assert_eq!(cfg.min_region_area, 64);
        assert_eq!(cfg.merge_region_area, 400);
        assert_eq!(cfg.max_edge_len, 40);
    }

    #[test]
    fn test_tile_bits_are_capped() {
        assert_eq!(ref_bits(1, 1), (2, 20));
        assert_eq!(ref_bits(1000, 1000), (14, 8));
        assert_eq!(ref_bits(0, 0), (0, 22));
    }

    #[test]
    fn test_degenerate_bounds_fail() {
        let settings = RecastSettings::default();
        assert!(BuildConfig::derive(&settings, [0.0; 3], [0.0; 3]).is_err());
        assert!(BuildConfig::derive(&settings, [0.0; 3], [10.0, 0.0, 0.0]).is_err());
        assert!(BuildConfig::derive(&settings, [0.0; 3], [f32::NAN, 0.0, 10.0]).is_err());

        let zero_tile = RecastSettings {
            tile_size: 0,
            ..RecastSettings::default()
        };
        assert!(matches!(
            BuildConfig::derive(&zero_tile, [0.0; 3], [10.0, 0.0, 10.0]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_solo_covers_bounds_with_one_tile() {
        let cfg =
            BuildConfig::derive_solo(&RecastSettings::default(), [0.0; 3], [30.0, 0.0, 12.0]).unwrap();
        assert_eq!(cfg.tile_width, 1);
        assert_eq!(cfg.tile_height, 1);
        assert_eq!(cfg.tile_size, 100);
    }

    #[test]
    fn test_layout_selects_tile_size() {
        let settings = RecastSettings {
            tile_size: 16,
            ..RecastSettings::default()
        };
        let bmax = [30.0, 0.0, 12.0];
        let tiled = BuildConfig::derive_with(&settings, [0.0; 3], bmax, TileLayout::Tiled).unwrap();
        let solo = BuildConfig::derive_with(&settings, [0.0; 3], bmax, TileLayout::Solo).unwrap();

        assert_eq!(tiled, BuildConfig::derive(&settings, [0.0; 3], bmax).unwrap());
        assert_eq!(solo, BuildConfig::derive_solo(&settings, [0.0; 3], bmax).unwrap());
        assert_eq!(tiled.tile_size, 16);
        assert_eq!((tiled.tile_width, tiled.tile_height), (7, 3));
        assert_eq!(solo.tile_size, 100);
        assert_eq!((solo.tile_width, solo.tile_height), (1, 1));

        // Solo builds ignore the configured tile size
        let zero_tile = RecastSettings {
            tile_size: 0,
            ..settings
        };
        assert!(BuildConfig::derive_solo(&zero_tile, [0.0; 3], bmax).is_ok());
    }

    #[test]
    fn test_tile_cache_params_follow_grid() {
        let (bmin, bmax) = bounds_100();
        let cfg = BuildConfig::derive(&RecastSettings::default(), bmin, bmax).unwrap();
        let params = cfg.tile_cache_params(2048);
        assert_eq!(params.max_tiles, 7 * 7 * 4);
        assert_eq!(params.width, 48);
        assert!((cfg.nav_mesh_params().tile_width - 14.4).abs() < 1e-4);
    }
}
