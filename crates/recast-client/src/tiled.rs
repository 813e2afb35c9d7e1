//! Tiled build over a compressed layer cache
//!
//! Every grid tile is voxelized into compressed layers that live in a
//! [`TileCache`]. The live navmesh is produced from the cache, and
//! obstacles dirty the cached tiles they touch so that [`TiledPipeline::update`]
//! can rebuild them a few at a time.

use detour::NavMesh;
use detour_tilecache::{ObstacleRef, TileCache};
use recast::{RecastContext, TimerCategory};
use recast_common::{Error, Result};

use crate::build_config::BuildConfig;
use crate::input_geom::{InputGeom, OffMeshLink};
use crate::serialization::NavMeshBundle;
use crate::settings::RecastSettings;
use crate::solo::obstacles_unsupported;
use crate::tile_raster::{rasterize_tile_layers, AreaFlagsProcess, SpanFilters};

/// Outcome of a grid sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Tiles that produced at least one layer
    pub built_tiles: usize,
    /// Layers inserted into the cache
    pub cached_layers: usize,
    /// Tiles whose build failed
    pub failed_tiles: usize,
    /// Layers rejected by the cache, duplicates included
    pub rejected_layers: usize,
}

#[derive(Default)]
pub struct TiledPipeline {
    config: Option<BuildConfig>,
    nav_mesh: Option<NavMesh>,
    tile_cache: Option<TileCache>,
}

impl TiledPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&BuildConfig> {
        self.config.as_ref()
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.nav_mesh.as_ref()
    }

    pub fn tile_cache(&self) -> Option<&TileCache> {
        self.tile_cache.as_ref()
    }

    /// Derives the configuration and allocates the navmesh and cache
    ///
    /// With `additive` set an existing navmesh and cache are kept, and the
    /// sweep adds to them.
    pub fn prepare_build(
        &mut self,
        settings: &RecastSettings,
        bmin: [f32; 3],
        bmax: [f32; 3],
        links: Vec<OffMeshLink>,
        additive: bool,
    ) -> Result<()> {
        let config = BuildConfig::derive(settings, bmin, bmax)?;
        log::info!(
            "tiled build: {}x{} cells, {}x{} tiles, {} tile bits, {} poly bits",
            config.grid_width,
            config.grid_height,
            config.tile_width,
            config.tile_height,
            config.tile_bits,
            config.poly_bits
        );

        let keep = additive && self.nav_mesh.is_some() && self.tile_cache.is_some();
        if !keep {
            let nav_mesh = NavMesh::new(config.nav_mesh_params())?;
            let tile_cache = TileCache::new(config.tile_cache_params(settings.max_obstacles))?;
            self.nav_mesh = Some(nav_mesh);
            self.tile_cache = Some(tile_cache);
        }
        if let Some(cache) = self.tile_cache.as_mut() {
            cache.set_mesh_process(Box::new(AreaFlagsProcess::new(links)));
        }
        self.config = Some(config);
        Ok(())
    }

    /// Voxelizes every grid tile into the cache
    ///
    /// Failing tiles and rejected layers are logged and skipped.
    pub fn rasterize(
        &mut self,
        ctx: &mut RecastContext,
        geom: &InputGeom,
        filters: SpanFilters,
    ) -> Result<SweepStats> {
        let (Some(config), Some(cache)) = (self.config.as_ref(), self.tile_cache.as_mut()) else {
            return Err(Error::NavMeshGeneration("build was not prepared".to_string()));
        };

        let mut stats = SweepStats::default();
        for ty in 0..config.tile_height {
            for tx in 0..config.tile_width {
                let layers = match rasterize_tile_layers(ctx, geom, config, filters, tx, ty) {
                    Ok(layers) => layers,
                    Err(e) => {
                        log::warn!("tile ({tx}, {ty}) failed to build: {e}");
                        ctx.log_warning(format!("tile ({tx}, {ty}) failed to build: {e}"));
                        stats.failed_tiles += 1;
                        continue;
                    }
                };
                if !layers.is_empty() {
                    stats.built_tiles += 1;
                }
                for (i, data) in layers.into_iter().enumerate() {
                    match cache.add_tile(data) {
                        Ok(_) => stats.cached_layers += 1,
                        Err(e) => {
                            log::warn!("layer {i} of tile ({tx}, {ty}) was not cached: {e}");
                            ctx.log_warning(format!(
                                "layer {i} of tile ({tx}, {ty}) was not cached: {e}"
                            ));
                            stats.rejected_layers += 1;
                        }
                    }
                }
            }
        }

        ctx.log_progress(format!(
            "swept {} tiles: {} layers cached, {} tiles failed",
            config.tile_count(),
            stats.cached_layers,
            stats.failed_tiles
        ));
        Ok(stats)
    }

    /// Meshes every cached layer, replacing the navmesh tile at its location
    ///
    /// Returns the number of layers meshed.
    pub fn materialize(&mut self, ctx: &mut RecastContext) -> Result<usize> {
        let (Some(nav_mesh), Some(cache)) = (self.nav_mesh.as_mut(), self.tile_cache.as_mut()) else {
            return Err(Error::NavMeshGeneration("build was not prepared".to_string()));
        };

        ctx.start_timer(TimerCategory::NavMeshTiles);
        let refs: Vec<_> = cache.tiles().map(|(tile_ref, _)| tile_ref).collect();
        let mut meshed = 0;
        for tile_ref in refs {
            match cache.build_nav_mesh_tile(tile_ref, nav_mesh) {
                Ok(()) => meshed += 1,
                Err(e) => {
                    log::warn!("cached tile {tile_ref:#x} failed to mesh: {e}");
                    ctx.log_warning(format!("cached tile {tile_ref:#x} failed to mesh: {e}"));
                }
            }
        }
        ctx.stop_timer(TimerCategory::NavMeshTiles);
        log::info!(
            "navmesh holds {} tiles from {meshed} cached layers",
            nav_mesh.tile_count()
        );
        Ok(meshed)
    }

    /// Rebuilds a bounded batch of dirty tiles
    ///
    /// Returns `true` once nothing is left to rebuild.
    pub fn update(&mut self) -> Result<bool> {
        match (self.tile_cache.as_mut(), self.nav_mesh.as_mut()) {
            (Some(cache), Some(nav_mesh)) => cache.update(nav_mesh),
            _ => Ok(true),
        }
    }

    fn cache_mut(&mut self) -> Result<&mut TileCache> {
        self.tile_cache.as_mut().ok_or_else(obstacles_unsupported)
    }

    /// Adds a cylinder obstacle; its tiles are rebuilt by later updates
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        self.cache_mut()?.add_obstacle(pos, radius, height)
    }

    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleRef> {
        self.cache_mut()?.add_box_obstacle(bmin, bmax)
    }

    pub fn remove_obstacle(&mut self, obstacle_ref: ObstacleRef) -> Result<()> {
        self.cache_mut()?.remove_obstacle(obstacle_ref)
    }

    /// Removes every live obstacle
    pub fn clear_obstacles(&mut self) -> Result<()> {
        let cache = self.cache_mut()?;
        for obstacle_ref in cache.obstacle_refs() {
            cache.remove_obstacle(obstacle_ref)?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let (Some(nav_mesh), Some(cache)) = (self.nav_mesh.as_ref(), self.tile_cache.as_ref()) else {
            return Err(Error::NavMeshGeneration("no navmesh has been built".to_string()));
        };
        NavMeshBundle::from_tile_cache(*nav_mesh.params(), cache).to_bytes()
    }

    /// Restores a persisted bundle and meshes every cached tile
    ///
    /// Unless `additive` is set with a navmesh present, the navmesh and cache
    /// are recreated from the persisted parameters. Tiles the cache rejects
    /// are logged and skipped.
    pub fn load(
        &mut self,
        ctx: &mut RecastContext,
        data: &[u8],
        additive: bool,
        links: Vec<OffMeshLink>,
    ) -> Result<usize> {
        let bundle = NavMeshBundle::from_bytes(data)?;

        let keep = additive && self.nav_mesh.is_some() && self.tile_cache.is_some();
        if !keep {
            let nav_mesh = NavMesh::new(bundle.nav_mesh_params)?;
            let tile_cache = TileCache::new(bundle.tile_cache_params)?;
            self.config = None;
            self.nav_mesh = Some(nav_mesh);
            self.tile_cache = Some(tile_cache);
        }

        let cache = self
            .tile_cache
            .as_mut()
            .ok_or_else(|| Error::NavMeshGeneration("tile cache is missing".to_string()))?;
        cache.set_mesh_process(Box::new(AreaFlagsProcess::new(links)));

        let total = bundle.tiles.len();
        let mut inserted = 0;
        for tile in bundle.tiles {
            match cache.add_tile(tile.data) {
                Ok(_) => inserted += 1,
                Err(e) => {
                    log::warn!("persisted tile {:#x} was not cached: {e}", tile.tile_ref);
                    ctx.log_warning(format!(
                        "persisted tile {:#x} was not cached: {e}",
                        tile.tile_ref
                    ));
                }
            }
        }
        ctx.log_progress(format!("loaded {inserted} of {total} persisted tiles"));

        self.materialize(ctx)
    }
}
