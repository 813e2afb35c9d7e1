//! Recast voxel pipeline for tiled navigation meshes
//!
//! Input triangles are rasterized into a span heightfield, filtered for
//! walkability, compacted, eroded by the agent radius and finally split
//! into 2.5D heightfield layers that the tile cache compresses and turns
//! into navmesh tiles.

mod area;
mod compact_heightfield;
mod config;
mod context;
mod heightfield;
mod heightfield_layers;
mod rasterization;

pub use area::{erode_walkable_area, mark_convex_poly_area, mark_walkable_triangles, ConvexVolume};
pub use compact_heightfield::{CompactCell, CompactHeightfield, CompactSpan};
pub use config::{calc_grid_size, RecastConfig};
pub use context::{LogEntry, LogLevel, RecastContext, TimerCategory};
pub use heightfield::{Heightfield, Span, DIR_OFFSET_X, DIR_OFFSET_Z};
pub use heightfield_layers::{
    build_heightfield_layers, HeightfieldLayer, LAYER_EMPTY_HEIGHT, MAX_LAYERS,
};
pub use rasterization::{rasterize_triangle, rasterize_triangles};

/// Area id of unwalkable spans
pub const NULL_AREA: u8 = 0;
/// Area id given to walkable spans before any area marking
pub const WALKABLE_AREA: u8 = 63;
/// Largest representable span height
pub const SPAN_MAX_HEIGHT: u16 = 0xffff;

/// Runs the voxel stages for one tile
#[derive(Debug)]
pub struct RecastBuilder {
    config: RecastConfig,
}

impl RecastBuilder {
    /// Creates a builder for the given tile configuration
    pub fn new(config: RecastConfig) -> Self {
        Self { config }
    }

    /// Gets a reference to the configuration
    pub fn config(&self) -> &RecastConfig {
        &self.config
    }

    /// Rasterizes `tris` and applies the walkable filters
    ///
    /// Triangles steeper than the walkable slope are rasterized as
    /// obstacles. Returns `Ok(None)` when nothing was rasterized.
    pub fn rasterize(
        &self,
        ctx: &mut RecastContext,
        verts: &[f32],
        tris: &[i32],
    ) -> recast_common::Result<Option<Heightfield>> {
        self.config.validate()?;
        let cfg = &self.config;

        ctx.start_timer(TimerCategory::Rasterization);
        let mut hf = Heightfield::new(cfg.width, cfg.height, cfg.bmin, cfg.bmax, cfg.cs, cfg.ch)?;
        let areas = mark_walkable_triangles(cfg.walkable_slope_angle, verts, tris);
        let rasterized = rasterize_triangles(&mut hf, verts, tris, &areas, cfg.walkable_climb);
        ctx.stop_timer(TimerCategory::Rasterization);
        rasterized?;

        if hf.span_count() == 0 {
            return Ok(None);
        }

        ctx.start_timer(TimerCategory::Filtering);
        hf.filter_low_hanging_walkable_obstacles(cfg.walkable_climb);
        hf.filter_ledge_spans(cfg.walkable_height, cfg.walkable_climb);
        hf.filter_walkable_low_height_spans(cfg.walkable_height);
        ctx.stop_timer(TimerCategory::Filtering);

        Ok(Some(hf))
    }

    /// Compacts `hf`, erodes it by the agent radius, stamps the convex
    /// volumes and extracts the tile's layers
    pub fn build_layers(
        &self,
        ctx: &mut RecastContext,
        hf: &Heightfield,
        volumes: &[ConvexVolume],
    ) -> recast_common::Result<Vec<HeightfieldLayer>> {
        let cfg = &self.config;

        ctx.start_timer(TimerCategory::CompactHeightfield);
        let chf = CompactHeightfield::build(hf, cfg.walkable_height, cfg.walkable_climb);
        let chf = chf.map(|mut chf| {
            erode_walkable_area(&mut chf, cfg.walkable_radius);
            for volume in volumes {
                mark_convex_poly_area(&mut chf, volume);
            }
            chf
        });
        ctx.stop_timer(TimerCategory::CompactHeightfield);
        let chf = chf?;

        ctx.start_timer(TimerCategory::Layers);
        let layers = build_heightfield_layers(&chf, cfg.border_size, cfg.walkable_height);
        ctx.stop_timer(TimerCategory::Layers);
        layers
    }

    /// Runs every stage and returns the tile's layers
    pub fn build_tile_layers(
        &self,
        ctx: &mut RecastContext,
        verts: &[f32],
        tris: &[i32],
        volumes: &[ConvexVolume],
    ) -> recast_common::Result<Vec<HeightfieldLayer>> {
        match self.rasterize(ctx, verts, tris)? {
            Some(hf) => self.build_layers(ctx, &hf, volumes),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn plane_config() -> RecastConfig {
        let mut cfg = RecastConfig {
            cs: 0.5,
            ch: 0.2,
            tile_size: 8,
            border_size: 2,
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 1,
            ..RecastConfig::default()
        };
        cfg.set_tile_bounds(Vec3::new(0.0, -1.0, 0.0), Vec3::new(8.0, 2.0, 8.0), 0, 0);
        cfg
    }

    #[test]
    fn test_plane_builds_single_layer() {
        let verts = [
            -2.0, 0.0, -2.0, 10.0, 0.0, -2.0, 10.0, 0.0, 10.0, -2.0, 0.0, 10.0,
        ];
        let tris = [0, 2, 1, 0, 3, 2];
        let mut ctx = RecastContext::new();
        let builder = RecastBuilder::new(plane_config());
        let layers = builder.build_tile_layers(&mut ctx, &verts, &tris, &[]).unwrap();

        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].width, 8);
        // The plane extends past the border, so erosion leaves the interior intact
        assert_eq!(layers[0].walkable_cells(), 64);
    }

    #[test]
    fn test_empty_input_yields_no_layers() {
        let mut ctx = RecastContext::new();
        let builder = RecastBuilder::new(plane_config());
        let layers = builder.build_tile_layers(&mut ctx, &[], &[], &[]).unwrap();
        assert!(layers.is_empty());
    }
}
