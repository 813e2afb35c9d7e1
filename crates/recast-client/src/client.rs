//! One navigation client: a build pipeline, its crowd and its queries

use detour::{NavMesh, NavMeshQuery, PolyFlags, PolyRef};
use detour_tilecache::ObstacleRef;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use recast::{ConvexVolume, RecastContext, TimerCategory};
use recast_common::{Error, Result};

use crate::crowd_manager::CrowdManager;
use crate::debug_mesh::export_nav_mesh;
use crate::input_geom::{BuildSource, InputGeom, OffMeshLink};
use crate::messages::{AgentInfo, AgentParameters, BuildLog, DebugNavMesh, PathInfo};
use crate::path_service;
use crate::settings::RecastSettings;
use crate::solo::{obstacles_unsupported, SoloPipeline};
use crate::tile_raster::SpanFilters;
use crate::tiled::TiledPipeline;

/// Build variant of a client, fixed when the client is created
pub enum BuildPipeline {
    Solo(SoloPipeline),
    Tiled(TiledPipeline),
}

impl BuildPipeline {
    pub fn new(tiled: bool) -> Self {
        if tiled {
            BuildPipeline::Tiled(TiledPipeline::new())
        } else {
            BuildPipeline::Solo(SoloPipeline::new())
        }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, BuildPipeline::Tiled(_))
    }

    pub fn prepare_build(
        &mut self,
        settings: &RecastSettings,
        bmin: [f32; 3],
        bmax: [f32; 3],
        links: Vec<OffMeshLink>,
        additive: bool,
    ) -> Result<()> {
        match self {
            BuildPipeline::Solo(solo) => solo.prepare_build(settings, bmin, bmax, links),
            BuildPipeline::Tiled(tiled) => tiled.prepare_build(settings, bmin, bmax, links, additive),
        }
    }

    pub fn rasterize(
        &mut self,
        ctx: &mut RecastContext,
        geom: &InputGeom,
        filters: SpanFilters,
    ) -> Result<()> {
        match self {
            BuildPipeline::Solo(solo) => solo.rasterize(ctx, geom, filters),
            BuildPipeline::Tiled(tiled) => tiled.rasterize(ctx, geom, filters).map(|_| ()),
        }
    }

    pub fn materialize(&mut self, ctx: &mut RecastContext) -> Result<()> {
        match self {
            BuildPipeline::Solo(solo) => solo.materialize(ctx),
            BuildPipeline::Tiled(tiled) => tiled.materialize(ctx).map(|_| ()),
        }
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        match self {
            BuildPipeline::Solo(solo) => solo.nav_mesh(),
            BuildPipeline::Tiled(tiled) => tiled.nav_mesh(),
        }
    }

    /// One bounded step of the tile rebuild queue
    pub fn update(&mut self) -> Result<bool> {
        match self {
            BuildPipeline::Solo(_) => Ok(true),
            BuildPipeline::Tiled(tiled) => tiled.update(),
        }
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        match self {
            BuildPipeline::Solo(solo) => solo.save(),
            BuildPipeline::Tiled(tiled) => tiled.save(),
        }
    }

    pub fn load(
        &mut self,
        ctx: &mut RecastContext,
        data: &[u8],
        additive: bool,
        links: Vec<OffMeshLink>,
    ) -> Result<()> {
        match self {
            BuildPipeline::Solo(solo) => solo.load(ctx, data, links),
            BuildPipeline::Tiled(tiled) => tiled.load(ctx, data, additive, links).map(|_| ()),
        }
    }

    fn tiled_mut(&mut self) -> Result<&mut TiledPipeline> {
        match self {
            BuildPipeline::Tiled(tiled) => Ok(tiled),
            BuildPipeline::Solo(_) => Err(obstacles_unsupported()),
        }
    }
}

/// A navigation client
///
/// Owns its settings, build context, pipeline and crowd. Every mutating
/// call takes `&mut self`; a client is driven from one thread at a time.
pub struct RecastClient {
    settings: RecastSettings,
    ctx: RecastContext,
    pipeline: BuildPipeline,
    crowd: CrowdManager,
    rng: ChaCha8Rng,
    volumes: Vec<ConvexVolume>,
    off_mesh_links: Vec<OffMeshLink>,
}

impl RecastClient {
    pub fn new(tiled: bool) -> Result<Self> {
        Self::with_settings(tiled, RecastSettings::default())
    }

    pub fn with_settings(tiled: bool, settings: RecastSettings) -> Result<Self> {
        let crowd = CrowdManager::new(settings.max_agents, settings.agent_radius)?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(settings.random_seed),
            settings,
            ctx: RecastContext::new(),
            pipeline: BuildPipeline::new(tiled),
            crowd,
            volumes: Vec::new(),
            off_mesh_links: Vec::new(),
        })
    }

    pub fn settings(&self) -> &RecastSettings {
        &self.settings
    }

    pub fn is_tiled(&self) -> bool {
        self.pipeline.is_tiled()
    }

    pub fn pipeline(&self) -> &BuildPipeline {
        &self.pipeline
    }

    pub fn nav_mesh(&self) -> Option<&NavMesh> {
        self.pipeline.nav_mesh()
    }

    pub fn crowd(&self) -> &CrowdManager {
        &self.crowd
    }

    pub fn context(&self) -> &RecastContext {
        &self.ctx
    }

    /// Replaces the settings from JSON
    ///
    /// Agents are dropped and the random generator is reseeded. The navmesh
    /// is kept until the next build.
    pub fn load_settings(&mut self, data: &[u8]) -> Result<()> {
        let settings = RecastSettings::from_json(data)?;
        let crowd = CrowdManager::new(settings.max_agents, settings.agent_radius)?;
        self.rng = ChaCha8Rng::seed_from_u64(settings.random_seed);
        self.crowd = crowd;
        self.settings = settings;
        Ok(())
    }

    /// Convex volumes stamped onto the next builds
    pub fn set_convex_volumes(&mut self, volumes: Vec<ConvexVolume>) {
        self.volumes = volumes;
    }

    /// Off-mesh links baked into the next builds and loads
    pub fn set_off_mesh_links(&mut self, links: Vec<OffMeshLink>) {
        self.off_mesh_links = links;
    }

    /// Builds the navmesh from `source` and resets the crowd
    ///
    /// The configured world bounds are used when set, the mesh bounds
    /// otherwise. Tiles that fail are logged and skipped.
    pub fn build(&mut self, source: &BuildSource, additive: bool) -> Result<()> {
        self.ctx.reset_timers();
        self.ctx.start_timer(TimerCategory::Total);
        let result = self.run_build(source, additive);
        self.ctx.stop_timer(TimerCategory::Total);
        if let Err(e) = &result {
            log::error!("build failed: {e}");
            self.ctx.log_error(format!("build failed: {e}"));
        }
        result
    }

    fn run_build(&mut self, source: &BuildSource, additive: bool) -> Result<()> {
        let mut geom = InputGeom::load(source)?;
        geom.set_volumes(self.volumes.clone());
        geom.set_off_mesh_links(self.off_mesh_links.clone());

        let (bmin, bmax) = match self.settings.world_bounds {
            Some(bounds) => (bounds.min, bounds.max),
            None => geom.bounds(),
        };
        self.ctx.log_progress(format!(
            "building {} navmesh over {bmin:?} - {bmax:?}",
            if self.is_tiled() { "tiled" } else { "solo" }
        ));

        self.pipeline.prepare_build(
            &self.settings,
            bmin,
            bmax,
            geom.off_mesh_links().to_vec(),
            additive,
        )?;
        self.pipeline
            .rasterize(&mut self.ctx, &geom, SpanFilters::from_settings(&self.settings))?;
        self.pipeline.materialize(&mut self.ctx)?;
        self.reset_crowd()
    }

    fn reset_crowd(&mut self) -> Result<()> {
        self.ctx.start_timer(TimerCategory::Crowd);
        let result = self.crowd.reinitialize();
        self.ctx.stop_timer(TimerCategory::Crowd);
        result
    }

    /// Steps the crowd, then rebuilds a batch of dirty tiles
    ///
    /// Both steps run even when the first fails; the first error is
    /// returned. `Ok(true)` means no tile is waiting for a rebuild.
    pub fn update(&mut self, dt: f32) -> Result<bool> {
        let crowd_step = match self.pipeline.nav_mesh() {
            Some(nav_mesh) => self.crowd.update(dt, nav_mesh),
            None => Ok(()),
        };
        let tile_step = self.pipeline.update();
        if let Err(e) = &crowd_step {
            log::warn!("crowd update failed: {e}");
        }
        crowd_step.and(tile_step)
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        self.pipeline.save()
    }

    /// Restores a saved navmesh and resets the crowd
    pub fn load(&mut self, data: &[u8], additive: bool) -> Result<()> {
        self.pipeline
            .load(&mut self.ctx, data, additive, self.off_mesh_links.clone())?;
        self.reset_crowd()
    }

    pub fn get_debug_nav_mesh(&self, exclude: PolyFlags) -> Result<DebugNavMesh> {
        Ok(export_nav_mesh(self.require_nav_mesh()?, exclude))
    }

    fn require_nav_mesh(&self) -> Result<&NavMesh> {
        self.pipeline
            .nav_mesh()
            .ok_or_else(|| Error::NavMeshGeneration("no navmesh has been built".to_string()))
    }

    /// Adds an agent; a negative id means the pool is full
    pub fn add_agent(&mut self, params: &AgentParameters) -> Result<i32> {
        let nav_mesh = self
            .pipeline
            .nav_mesh()
            .ok_or_else(|| Error::NavMeshGeneration("no navmesh has been built".to_string()))?;
        self.crowd.add_agent(nav_mesh, params)
    }

    pub fn update_agent(&mut self, id: i32, params: &AgentParameters) -> Result<()> {
        self.crowd.update_agent(id, params)
    }

    pub fn remove_agent(&mut self, id: i32) -> Result<()> {
        self.crowd.remove_agent(id)
    }

    pub fn request_move_target(&mut self, id: i32, reference: PolyRef, pos: &[f32; 3]) -> Result<()> {
        self.crowd.request_move_target(id, reference, pos)
    }

    pub fn reset_move_target(&mut self, id: i32) -> Result<()> {
        self.crowd.reset_move_target(id)
    }

    pub fn get_agent_info(&self, id: i32) -> Result<AgentInfo> {
        self.crowd.agent_info(id)
    }

    /// Nearest polygon to `center` within `half_extents`; a null reference
    /// when there is none
    pub fn find_nearest_poly(&self, center: &[f32; 3], half_extents: &[f32; 3]) -> Result<(PolyRef, [f32; 3])> {
        let query = NavMeshQuery::new(self.require_nav_mesh()?);
        query.find_nearest_poly(center, half_extents, self.crowd.filter())
    }

    /// Random point on the mesh reachable from `start_ref` within
    /// `max_radius` of `center`
    pub fn find_random_point_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
    ) -> Result<(PolyRef, [f32; 3])> {
        let nav_mesh = self
            .pipeline
            .nav_mesh()
            .ok_or_else(|| Error::NavMeshGeneration("no navmesh has been built".to_string()))?;
        let mut query = NavMeshQuery::new(nav_mesh);
        query.find_random_point_around_circle(
            start_ref,
            center,
            max_radius,
            self.crowd.filter(),
            &mut self.rng,
        )
    }

    /// Polygon corridor between two points, smoothed when `detailed`
    pub fn get_path(
        &self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        detailed: bool,
    ) -> Result<PathInfo> {
        let filter = self.crowd.filter();
        let mut query = NavMeshQuery::new(self.require_nav_mesh()?);
        let corridor =
            path_service::find_path(&mut query, start_ref, end_ref, start_pos, end_pos, filter)?;

        let path_details = if detailed && !corridor.is_empty() {
            path_service::get_smooth_path(&query, &corridor, start_pos, end_pos, filter)?
                .into_iter()
                .flatten()
                .collect()
        } else {
            Vec::new()
        };

        Ok(PathInfo {
            path_refs: corridor.iter().map(|r| r.id()).collect(),
            path_details,
        })
    }

    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        self.pipeline.tiled_mut()?.add_obstacle(pos, radius, height)
    }

    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleRef> {
        self.pipeline.tiled_mut()?.add_box_obstacle(bmin, bmax)
    }

    pub fn remove_obstacle(&mut self, obstacle_ref: ObstacleRef) -> Result<()> {
        self.pipeline.tiled_mut()?.remove_obstacle(obstacle_ref)
    }

    pub fn clear_obstacles(&mut self) -> Result<()> {
        self.pipeline.tiled_mut()?.clear_obstacles()
    }

    pub fn get_log(&self) -> BuildLog {
        BuildLog::from_entries(self.ctx.logs())
    }

    /// Appends the per-stage timings of the last build to the log
    pub fn log_build_times(&mut self) {
        self.ctx.log_build_times();
    }
}
