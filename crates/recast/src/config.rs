//! Voxel build configuration for a single tile

use glam::Vec3;
use recast_common::{Error, Result};

/// Configuration parameters for building one tile's heightfield layers
///
/// Voxel quantities (`walkable_*`, `border_size`, `tile_size`) are in cells;
/// `cs`/`ch` convert them to world units.
#[derive(Debug, Clone, PartialEq)]
pub struct RecastConfig {
    /// Working width of the field along x, including the border
    pub width: i32,
    /// Working height of the field along z, including the border
    pub height: i32,
    /// Width/depth of the tile proper, in cells
    pub tile_size: i32,
    /// Extra cells sampled around the tile so that filtering near the
    /// tile edge sees its neighbours' geometry
    pub border_size: i32,

    /// The width/depth resolution of the field (cell size)
    pub cs: f32,
    /// The height resolution of the field (cell height)
    pub ch: f32,

    /// The minimum bounds of the field's AABB, border included
    pub bmin: Vec3,
    /// The maximum bounds of the field's AABB, border included
    pub bmax: Vec3,

    /// The maximum slope in degrees that is considered walkable
    pub walkable_slope_angle: f32,
    /// Minimum floor to ceiling clearance that is still walkable
    pub walkable_height: i32,
    /// The maximum ledge height that is still traversable
    pub walkable_climb: i32,
    /// The distance to erode the walkable area away from obstructions
    pub walkable_radius: i32,

    /// The maximum allowed length for polygon edges, in cells (0 = unlimited)
    pub max_edge_len: i32,
    /// The maximum distance simplified edges may deviate from the raw outline
    pub max_simplification_error: f32,
    /// The minimum number of cells allowed to form isolated island areas
    pub min_region_area: i32,
    /// Regions smaller than this may be merged with larger neighbours
    pub merge_region_area: i32,
    /// The maximum number of vertices per polygon
    pub max_vertices_per_polygon: i32,

    /// Sampling distance for the detail mesh (0 disables sampling)
    pub detail_sample_dist: f32,
    /// Maximum deviation of the detail mesh from the heightfield
    pub detail_sample_max_error: f32,
}

impl Default for RecastConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            tile_size: 0,
            border_size: 0,
            cs: 0.3,
            ch: 0.2,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_slope_angle: 45.0,
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 2,
            max_edge_len: 40,
            max_simplification_error: 1.3,
            min_region_area: 64,
            merge_region_area: 400,
            max_vertices_per_polygon: 6,
            detail_sample_dist: 1.8,
            detail_sample_max_error: 0.2,
        }
    }
}

/// Grid size in cells covering `bmin..bmax` on the xz-plane
pub fn calc_grid_size(bmin: Vec3, bmax: Vec3, cs: f32) -> (i32, i32) {
    let w = ((bmax.x - bmin.x) / cs).ceil() as i32;
    let h = ((bmax.z - bmin.z) / cs).ceil() as i32;
    (w, h)
}

impl RecastConfig {
    /// Creates a new RecastConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bounds and derives the working grid size from them
    pub fn calculate_grid_size(&mut self, bmin: Vec3, bmax: Vec3) {
        self.bmin = bmin;
        self.bmax = bmax;
        let (w, h) = calc_grid_size(bmin, bmax, self.cs);
        self.width = w;
        self.height = h;
    }

    /// Sets the bounds for tile `(tx, ty)` of a tiled build
    ///
    /// The tile's own area starts at `origin + tile * tile_size * cs`; the
    /// working bounds are expanded by `border_size` cells on each side and
    /// the vertical range is taken from `world_bmin`/`world_bmax`.
    pub fn set_tile_bounds(&mut self, world_bmin: Vec3, world_bmax: Vec3, tx: i32, ty: i32) {
        let tcs = self.tile_size as f32 * self.cs;
        let border = self.border_size as f32 * self.cs;

        let mut bmin = Vec3::new(
            world_bmin.x + tx as f32 * tcs,
            world_bmin.y,
            world_bmin.z + ty as f32 * tcs,
        );
        let mut bmax = Vec3::new(bmin.x + tcs, world_bmax.y, bmin.z + tcs);
        bmin.x -= border;
        bmin.z -= border;
        bmax.x += border;
        bmax.z += border;

        self.bmin = bmin;
        self.bmax = bmax;
        self.width = self.tile_size + self.border_size * 2;
        self.height = self.tile_size + self.border_size * 2;
    }

    /// Validates the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidConfig(format!(
                "invalid grid size {}x{}",
                self.width, self.height
            )));
        }

        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::InvalidConfig(
                "cell size and cell height must be positive".to_string(),
            ));
        }

        if !(0.0..=90.0).contains(&self.walkable_slope_angle) {
            return Err(Error::InvalidConfig(
                "walkable slope angle must be within 0..=90 degrees".to_string(),
            ));
        }

        if self.walkable_height < 1 || self.walkable_climb < 0 || self.walkable_radius < 0 {
            return Err(Error::InvalidConfig(
                "invalid walkable agent dimensions".to_string(),
            ));
        }

        if self.max_vertices_per_polygon < 3 {
            return Err(Error::InvalidConfig(
                "too few vertices per polygon".to_string(),
            ));
        }

        if self.bmax.x <= self.bmin.x || self.bmax.z <= self.bmin.z {
            return Err(Error::InvalidConfig("degenerate build bounds".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_size_uses_ceil() {
        let (w, h) = calc_grid_size(Vec3::ZERO, Vec3::new(100.0, 0.0, 30.0), 0.3);
        assert_eq!(w, 334);
        assert_eq!(h, 100);
    }

    #[test]
    fn test_tile_bounds_include_border() {
        let mut cfg = RecastConfig {
            tile_size: 48,
            border_size: 5,
            ..Default::default()
        };
        cfg.set_tile_bounds(Vec3::ZERO, Vec3::new(100.0, 4.0, 100.0), 1, 0);
        assert_eq!(cfg.width, 58);
        assert!((cfg.bmin.x - (14.4 - 1.5)).abs() < 1e-4);
        assert!((cfg.bmax.x - (28.8 + 1.5)).abs() < 1e-4);
        assert!((cfg.bmax.y - 4.0).abs() < 1e-6);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate() {
        let mut cfg = RecastConfig::new();
        cfg.calculate_grid_size(Vec3::ZERO, Vec3::ZERO);
        assert!(cfg.validate().is_err());

        let mut cfg = RecastConfig::new();
        cfg.calculate_grid_size(Vec3::ZERO, Vec3::new(10.0, 1.0, 10.0));
        cfg.cs = -1.0;
        assert!(cfg.validate().is_err());
    }
}
