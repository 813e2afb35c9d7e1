//! Single-tile build covering the whole world
//!
//! The solo variant runs the same voxel pipeline as the tiled one over one
//! tile sized to the world, keeps the compressed layers it produced and
//! meshes them directly. It has no tile cache and therefore no obstacles.

use detour::{NavMesh, NavMeshBuilder, Status};
use detour_tilecache::{
    TileCacheBuilder, TileCacheLayer, TileCacheLayerHeader, TileCacheMeshProcess, TileCacheParams,
};
use recast::{RecastContext, TimerCategory};
use recast_common::{Error, Result};

use crate::build_config::BuildConfig;
use crate::input_geom::{InputGeom, OffMeshLink};
use crate::serialization::{BundleTile, NavMeshBundle};
use crate::settings::RecastSettings;
use crate::tile_raster::{rasterize_tile_layers, AreaFlagsProcess, SpanFilters};

#[derive(Default)]
pub struct SoloPipeline {
    config: Option<BuildConfig>,
    nav_mesh: Option<NavMesh>,
    cache_params: Option<TileCacheParams>,
    layers: Vec<Vec<u8>>,
    process: AreaFlagsProcess,
}

impl SoloPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&BuildConfig> {
        self.config.as_ref()
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.nav_mesh.as_ref()
    }

    /// Compressed layers of the last build or load
    pub fn layers(&self) -> &[Vec<u8>] {
        &self.layers
    }

    /// Derives the configuration and allocates an empty navmesh
    ///
    /// The previous build is always discarded.
    pub fn prepare_build(
        &mut self,
        settings: &RecastSettings,
        bmin: [f32; 3],
        bmax: [f32; 3],
        links: Vec<OffMeshLink>,
    ) -> Result<()> {
        let config = BuildConfig::derive_solo(settings, bmin, bmax)?;
        let nav_mesh = NavMesh::new(config.nav_mesh_params())?;
        self.cache_params = Some(config.tile_cache_params(0));
        self.nav_mesh = Some(nav_mesh);
        self.config = Some(config);
        self.layers.clear();
        self.process = AreaFlagsProcess::new(links);
        Ok(())
    }

    /// Voxelizes the world into compressed layers
    ///
    /// A failing tile is logged and leaves the pipeline without layers.
    pub fn rasterize(
        &mut self,
        ctx: &mut RecastContext,
        geom: &InputGeom,
        filters: SpanFilters,
    ) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::NavMeshGeneration("build was not prepared".to_string()))?;
        match rasterize_tile_layers(ctx, geom, config, filters, 0, 0) {
            Ok(layers) => {
                ctx.log_progress(format!("solo tile produced {} layers", layers.len()));
                self.layers = layers;
            }
            Err(e) => {
                log::warn!("solo tile failed to build: {e}");
                ctx.log_warning(format!("solo tile failed to build: {e}"));
                self.layers.clear();
            }
        }
        Ok(())
    }

    /// Meshes every layer into the navmesh, replacing what was there
    pub fn materialize(&mut self, ctx: &mut RecastContext) -> Result<()> {
        let (Some(nav_mesh), Some(params)) = (self.nav_mesh.as_mut(), self.cache_params.as_ref())
        else {
            return Err(Error::NavMeshGeneration("build was not prepared".to_string()));
        };

        ctx.start_timer(TimerCategory::NavMeshTiles);
        let stale: Vec<_> = nav_mesh
            .tiles()
            .filter_map(|(_, t)| t.header.as_ref().map(|h| (h.x, h.y, h.layer)))
            .collect();
        for (x, y, layer) in stale {
            if let Some(tile_ref) = nav_mesh.tile_ref_at(x, y, layer) {
                if let Err(e) = nav_mesh.remove_tile(tile_ref) {
                    log::warn!("removing stale solo tile failed: {e}");
                }
            }
        }

        let builder = TileCacheBuilder::new(params);
        let mut meshed = 0;
        for (i, data) in self.layers.iter().enumerate() {
            match mesh_layer(&builder, &self.process, data, nav_mesh) {
                Ok(true) => meshed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("solo layer {i} failed to mesh: {e}");
                    ctx.log_warning(format!("solo layer {i} failed to mesh: {e}"));
                }
            }
        }
        ctx.stop_timer(TimerCategory::NavMeshTiles);
        log::info!("solo navmesh holds {meshed} of {} layers", self.layers.len());
        Ok(())
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let (Some(nav_mesh), Some(params)) = (self.nav_mesh.as_ref(), self.cache_params.as_ref())
        else {
            return Err(Error::NavMeshGeneration("no navmesh has been built".to_string()));
        };
        NavMeshBundle {
            nav_mesh_params: *nav_mesh.params(),
            tile_cache_params: params.clone(),
            tiles: self
                .layers
                .iter()
                .enumerate()
                .map(|(i, data)| BundleTile {
                    tile_ref: i as u64,
                    data: data.clone(),
                })
                .collect(),
        }
        .to_bytes()
    }

    /// Replaces the navmesh with the one persisted in `data`
    pub fn load(&mut self, ctx: &mut RecastContext, data: &[u8], links: Vec<OffMeshLink>) -> Result<()> {
        let bundle = NavMeshBundle::from_bytes(data)?;
        let nav_mesh = NavMesh::new(bundle.nav_mesh_params)?;

        let mut layers = Vec::with_capacity(bundle.tiles.len());
        for tile in bundle.tiles {
            match TileCacheLayerHeader::from_bytes(&tile.data) {
                Ok(_) => layers.push(tile.data),
                Err(e) => {
                    log::warn!("skipping persisted layer {}: {e}", tile.tile_ref);
                    ctx.log_warning(format!("skipping persisted layer {}: {e}", tile.tile_ref));
                }
            }
        }

        self.config = None;
        self.nav_mesh = Some(nav_mesh);
        self.cache_params = Some(bundle.tile_cache_params);
        self.layers = layers;
        self.process = AreaFlagsProcess::new(links);
        self.materialize(ctx)
    }
}

/// Meshes one compressed layer; `Ok(false)` when it has no walkable cell
fn mesh_layer(
    builder: &TileCacheBuilder,
    process: &AreaFlagsProcess,
    data: &[u8],
    nav_mesh: &mut NavMesh,
) -> Result<bool> {
    let layer = TileCacheLayer::decompress(data)?;
    let Some(mut params) = builder.build_params(&layer)? else {
        return Ok(false);
    };
    process.process(&mut params);
    let tile = NavMeshBuilder::build_tile(&params)?;
    nav_mesh.add_tile(tile)?;
    Ok(true)
}

/// Error returned by obstacle operations on a solo build
pub fn obstacles_unsupported() -> Error {
    Error::Detour(Status::InvalidParam.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_geom::BuildSource;
    use crate::test_fixtures::{flat_plane_obj, init_logging, small_world_settings, two_level_obj};

    fn build(obj: &str) -> (SoloPipeline, RecastContext) {
        init_logging();
        let settings = small_world_settings(32.0);
        let geom = InputGeom::load(&BuildSource::ObjBytes(obj.as_bytes().to_vec())).unwrap();
        let bounds = settings.world_bounds.unwrap();
        let mut ctx = RecastContext::new();
        let mut solo = SoloPipeline::new();
        solo.prepare_build(&settings, bounds.min, bounds.max, Vec::new())
            .unwrap();
        solo.rasterize(&mut ctx, &geom, SpanFilters::from_settings(&settings))
            .unwrap();
        solo.materialize(&mut ctx).unwrap();
        (solo, ctx)
    }

    #[test]
    fn test_flat_plane_is_one_tile() {
        let (solo, _) = build(&flat_plane_obj(32.0));
        assert_eq!(solo.layers().len(), 1);
        let mesh = solo.nav_mesh().unwrap();
        assert_eq!(mesh.tile_count(), 1);
        assert!(mesh.tile_at(0, 0, 0).unwrap().ground_poly_count() > 0);
    }

    #[test]
    fn test_two_levels_become_two_layers() {
        let (solo, _) = build(&two_level_obj(32.0, 4.0));
        assert_eq!(solo.layers().len(), 2);
        assert_eq!(solo.nav_mesh().unwrap().tile_count(), 2);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (solo, mut ctx) = build(&flat_plane_obj(32.0));
        let bytes = solo.save().unwrap();

        let mut restored = SoloPipeline::new();
        restored.load(&mut ctx, &bytes, Vec::new()).unwrap();
        let a = solo.nav_mesh().unwrap().tile_at(0, 0, 0).unwrap();
        let b = restored.nav_mesh().unwrap().tile_at(0, 0, 0).unwrap();
        assert_eq!(a.polys.len(), b.polys.len());
        assert_eq!(restored.layers(), solo.layers());
    }

    #[test]
    fn test_materialize_twice_keeps_poly_count() {
        let (mut solo, mut ctx) = build(&flat_plane_obj(32.0));
        let before = solo.nav_mesh().unwrap().tile_at(0, 0, 0).unwrap().polys.len();
        solo.materialize(&mut ctx).unwrap();
        let mesh = solo.nav_mesh().unwrap();
        assert_eq!(mesh.tile_count(), 1);
        assert_eq!(mesh.tile_at(0, 0, 0).unwrap().polys.len(), before);
    }

    #[test]
    fn test_unprepared_pipeline_fails() {
        let mut ctx = RecastContext::new();
        let mut solo = SoloPipeline::new();
        assert!(solo.materialize(&mut ctx).is_err());
        assert!(solo.save().is_err());
    }
}
