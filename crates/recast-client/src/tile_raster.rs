//! Per-tile voxelization into compressed cache layers, and the area to
//! polygon flag mapping applied when layers become navmesh tiles

use detour::nav_mesh::OFFMESH_CON_BIDIR;
use detour::{NavMeshCreateParams, PolyFlags};
use detour_tilecache::{TileCacheLayer, TileCacheMeshProcess, TileState};
use recast::{
    mark_walkable_triangles, rasterize_triangles, ConvexVolume, Heightfield, HeightfieldLayer,
    RecastBuilder, RecastConfig, RecastContext, TimerCategory, MAX_LAYERS, WALKABLE_AREA,
};
use recast_common::Result;

use crate::build_config::BuildConfig;
use crate::input_geom::{InputGeom, OffMeshLink};
use crate::settings::RecastSettings;

pub const AREA_GROUND: u8 = 0;
pub const AREA_WATER: u8 = 1;
pub const AREA_ROAD: u8 = 2;
pub const AREA_DOOR: u8 = 3;
pub const AREA_GRASS: u8 = 4;
pub const AREA_JUMP: u8 = 5;

/// Polygon flags for an area id, `None` for unknown areas
pub fn flags_for_area(area: u8) -> Option<PolyFlags> {
    match area {
        AREA_GROUND | AREA_GRASS | AREA_ROAD => Some(PolyFlags::WALK),
        AREA_WATER => Some(PolyFlags::SWIM),
        AREA_DOOR => Some(PolyFlags::WALK | PolyFlags::DOOR),
        AREA_JUMP => Some(PolyFlags::JUMP),
        _ => None,
    }
}

/// Assigns polygon flags from areas and attaches the off-mesh links
#[derive(Debug, Clone, Default)]
pub struct AreaFlagsProcess {
    links: Vec<OffMeshLink>,
}

impl AreaFlagsProcess {
    pub fn new(links: Vec<OffMeshLink>) -> Self {
        Self { links }
    }
}

impl TileCacheMeshProcess for AreaFlagsProcess {
    fn process(&self, params: &mut NavMeshCreateParams) {
        for (area, flags) in params.poly_areas.iter_mut().zip(&mut params.poly_flags) {
            if *area == WALKABLE_AREA {
                *area = AREA_GROUND;
            }
            if let Some(f) = flags_for_area(*area) {
                *flags = f;
            }
        }

        // The tile builder keeps only the links starting inside the tile
        for link in &self.links {
            params.off_mesh_con_verts.extend_from_slice(&link.start);
            params.off_mesh_con_verts.extend_from_slice(&link.end);
            params.off_mesh_con_rad.push(link.radius);
            params.off_mesh_con_flags.push(link.flags);
            params.off_mesh_con_areas.push(link.area);
            params
                .off_mesh_con_dir
                .push(if link.bidirectional { OFFMESH_CON_BIDIR } else { 0 });
            params.off_mesh_con_user_id.push(0);
        }
        params.off_mesh_con_count += self.links.len();
    }
}

/// Which of the span filters run after rasterization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanFilters {
    pub low_hanging_obstacles: bool,
    pub ledge_spans: bool,
    pub walkable_low_height_spans: bool,
}

impl SpanFilters {
    pub fn from_settings(settings: &RecastSettings) -> Self {
        Self {
            low_hanging_obstacles: settings.filter_low_hanging_obstacles,
            ledge_spans: settings.filter_ledge_spans,
            walkable_low_height_spans: settings.filter_walkable_low_height_spans,
        }
    }
}

/// Scratch state of one tile build
///
/// Owns the intermediate heightfield and layers; everything is released
/// when the value goes out of scope, whichever stage returned.
pub struct TileRasterContext {
    tx: i32,
    ty: i32,
    config: RecastConfig,
    heightfield: Option<Heightfield>,
    layers: Vec<HeightfieldLayer>,
    state: TileState,
}

impl TileRasterContext {
    pub fn new(build: &BuildConfig, tx: i32, ty: i32) -> Self {
        Self {
            tx,
            ty,
            config: build.tile_recast_config(tx, ty),
            heightfield: None,
            layers: Vec::new(),
            state: TileState::Unqueued,
        }
    }

    /// How far the tile got: `Unqueued`, `Rasterized` once it has layers,
    /// `Compressed` once they are cache records
    pub fn state(&self) -> TileState {
        self.state
    }

    /// Rasterizes the triangles overlapping the tile and filters the spans
    ///
    /// Returns `false` when the tile has no geometry.
    pub fn rasterize(
        &mut self,
        ctx: &mut RecastContext,
        geom: &InputGeom,
        filters: SpanFilters,
    ) -> Result<bool> {
        let cfg = &self.config;
        cfg.validate()?;

        let tris = geom.triangles_in_rect([cfg.bmin.x, cfg.bmin.z], [cfg.bmax.x, cfg.bmax.z]);
        if tris.is_empty() {
            return Ok(false);
        }
        let verts = &geom.mesh().vertices;

        ctx.start_timer(TimerCategory::Rasterization);
        let rasterized = Heightfield::new(cfg.width, cfg.height, cfg.bmin, cfg.bmax, cfg.cs, cfg.ch)
            .and_then(|mut hf| {
                let areas = mark_walkable_triangles(cfg.walkable_slope_angle, verts, &tris);
                rasterize_triangles(&mut hf, verts, &tris, &areas, cfg.walkable_climb)?;
                Ok(hf)
            });
        ctx.stop_timer(TimerCategory::Rasterization);
        let mut hf = rasterized?;

        if hf.span_count() == 0 {
            return Ok(false);
        }

        ctx.start_timer(TimerCategory::Filtering);
        if filters.low_hanging_obstacles {
            hf.filter_low_hanging_walkable_obstacles(cfg.walkable_climb);
        }
        if filters.ledge_spans {
            hf.filter_ledge_spans(cfg.walkable_height, cfg.walkable_climb);
        }
        if filters.walkable_low_height_spans {
            hf.filter_walkable_low_height_spans(cfg.walkable_height);
        }
        ctx.stop_timer(TimerCategory::Filtering);

        self.heightfield = Some(hf);
        Ok(true)
    }

    /// Compacts, erodes and marks the heightfield, then extracts its layers
    pub fn build_layers(&mut self, ctx: &mut RecastContext, volumes: &[ConvexVolume]) -> Result<usize> {
        let Some(hf) = self.heightfield.take() else {
            return Ok(0);
        };
        let builder = RecastBuilder::new(self.config.clone());
        self.layers = builder.build_layers(ctx, &hf, volumes)?;
        self.layers.truncate(MAX_LAYERS);
        if !self.layers.is_empty() {
            self.state = TileState::Rasterized;
        }
        Ok(self.layers.len())
    }

    /// Compresses every layer into a cache record
    pub fn compress(&mut self, ctx: &mut RecastContext) -> Result<Vec<Vec<u8>>> {
        ctx.start_timer(TimerCategory::TileCompression);
        let compressed: Result<Vec<_>> = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                TileCacheLayer::from_heightfield_layer(layer, self.tx, self.ty, i as i32)?.compress()
            })
            .collect();
        ctx.stop_timer(TimerCategory::TileCompression);
        if compressed.is_ok() && !self.layers.is_empty() {
            self.state = TileState::Compressed;
        }
        compressed
    }
}

/// Runs the voxel stages for tile `(tx, ty)` and returns its compressed layers
pub fn rasterize_tile_layers(
    ctx: &mut RecastContext,
    geom: &InputGeom,
    build: &BuildConfig,
    filters: SpanFilters,
    tx: i32,
    ty: i32,
) -> Result<Vec<Vec<u8>>> {
    let mut scratch = TileRasterContext::new(build, tx, ty);
    if !scratch.rasterize(ctx, geom, filters)? {
        return Ok(Vec::new());
    }
    if scratch.build_layers(ctx, geom.volumes())? == 0 {
        return Ok(Vec::new());
    }
    log::debug!("tile ({tx}, {ty}) {:?}", scratch.state());
    let layers = scratch.compress(ctx)?;
    log::debug!("tile ({tx}, {ty}) {:?}, {} layers", scratch.state(), layers.len());
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_geom::BuildSource;
    use crate::test_fixtures::{flat_plane_obj, small_world_settings};

    #[test]
    fn test_tile_state_through_the_stages() -> Result<()> {
        let settings = small_world_settings(32.0);
        let bounds = settings.world_bounds.unwrap();
        let build = BuildConfig::derive(&settings, bounds.min, bounds.max)?;
        let geom = InputGeom::load(&BuildSource::ObjBytes(flat_plane_obj(32.0).into_bytes()))?;
        let mut ctx = RecastContext::new();

        let mut scratch = TileRasterContext::new(&build, 0, 0);
        assert_eq!(scratch.state(), TileState::Unqueued);
        assert!(scratch.rasterize(&mut ctx, &geom, SpanFilters::from_settings(&settings))?);
        assert_eq!(scratch.state(), TileState::Unqueued);
        assert_eq!(scratch.build_layers(&mut ctx, &[])?, 1);
        assert_eq!(scratch.state(), TileState::Rasterized);
        assert_eq!(scratch.compress(&mut ctx)?.len(), 1);
        assert_eq!(scratch.state(), TileState::Compressed);
        Ok(())
    }

    #[test]
    fn test_area_flags() {
        assert_eq!(flags_for_area(AREA_GROUND), Some(PolyFlags::WALK));
        assert_eq!(flags_for_area(AREA_ROAD), Some(PolyFlags::WALK));
        assert_eq!(flags_for_area(AREA_WATER), Some(PolyFlags::SWIM));
        assert_eq!(
            flags_for_area(AREA_DOOR),
            Some(PolyFlags::WALK | PolyFlags::DOOR)
        );
        assert_eq!(flags_for_area(AREA_JUMP), Some(PolyFlags::JUMP));
        assert_eq!(flags_for_area(42), None);
    }

    #[test]
    fn test_process_remaps_walkable_area() {
        let mut params = NavMeshCreateParams {
            poly_areas: vec![WALKABLE_AREA, AREA_WATER, 42],
            poly_flags: vec![PolyFlags::WALK; 3],
            poly_count: 3,
            ..NavMeshCreateParams::default()
        };
        let process = AreaFlagsProcess::new(vec![OffMeshLink {
            start: [1.0, 0.0, 1.0],
            end: [5.0, 1.0, 1.0],
            radius: 0.5,
            bidirectional: true,
            area: AREA_JUMP,
            flags: PolyFlags::JUMP,
        }]);
        process.process(&mut params);

        assert_eq!(params.poly_areas, vec![AREA_GROUND, AREA_WATER, 42]);
        assert_eq!(
            params.poly_flags,
            vec![PolyFlags::WALK, PolyFlags::SWIM, PolyFlags::WALK]
        );
        assert_eq!(params.off_mesh_con_count, 1);
        assert_eq!(params.off_mesh_con_verts.len(), 6);
        assert_eq!(params.off_mesh_con_dir, vec![OFFMESH_CON_BIDIR]);
    }
}
