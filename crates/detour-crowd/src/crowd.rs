//! Crowd management for Detour
//!
//! A [`Crowd`] owns a fixed pool of agents. Every [`Crowd::update`] plans
//! queued path requests, steers each agent along its corridor, avoids
//! neighbours and walls, and moves the agents over the mesh surface.
//!
//! The crowd does not borrow the navigation mesh. Operations that need the
//! mesh take it as an argument, so the owner is free to rebuild tiles
//! between updates; corridors that lost polygons are repaired on the next
//! update.

use std::collections::VecDeque;

use detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, Status, StraightPath, StraightPathFlags};
use recast_common::{
    dist_sqr_2d, sqr, tri_area_2d, vis_finite, vlen, vlen_sqr, vlerp, vmad, vscale, vsub, Error,
    Result,
};

use super::local_boundary::LocalBoundary;
use super::obstacle_avoidance::{ObstacleAvoidanceParams, ObstacleAvoidanceQuery};
use super::path_corridor::{PathCorridor, MAX_PATH_POLYS};
use super::proximity_grid::{GridAgent, ProximityGrid};

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
pub const MAX_CORNERS: usize = 4;

/// The maximum number of crowd avoidance configurations supported by the
/// crowd manager.
pub const MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

/// The maximum number of query filter types supported by the crowd manager.
pub const MAX_QUERY_FILTER_TYPE: usize = 16;

/// Path requests planned per update; the rest wait in the queue
pub const MAX_PATH_REQUESTS_PER_UPDATE: usize = 8;

const MAX_AVOID_CIRCLES: usize = 6;
const MAX_AVOID_SEGMENTS: usize = 8;

/// Corridor polygons checked for validity every update
const CHECK_LOOKAHEAD: usize = 10;
/// Seconds between topology optimizations of one agent
const OPT_TIME_THR: f32 = 0.5;
const COLLISION_RESOLVE_FACTOR: f32 = 0.7;
const COLLISION_ITERATIONS: usize = 4;

const DEFAULT_AGENT_RADIUS: f32 = 0.6;
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

/// The type of navigation mesh polygon the agent is currently traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not on the mesh.
    #[default]
    Invalid,
    /// The agent is traversing a normal navigation mesh polygon.
    Walking,
    /// The agent is traversing an off-mesh connection.
    OffMesh,
}

/// Progress of an agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
    /// The agent reached the end of its corridor
    Arrived,
}

/// Steering behaviours enabled for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct UpdateFlags(pub u8);

impl UpdateFlags {
    pub const ANTICIPATE_TURNS: UpdateFlags = UpdateFlags(1);
    pub const OBSTACLE_AVOIDANCE: UpdateFlags = UpdateFlags(2);
    pub const SEPARATION: UpdateFlags = UpdateFlags(4);
    pub const OPTIMIZE_VIS: UpdateFlags = UpdateFlags(8);
    pub const OPTIMIZE_TOPO: UpdateFlags = UpdateFlags(16);

    pub fn empty() -> Self {
        UpdateFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        UpdateFlags(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Check if flags contain the specified flag
    pub fn contains(&self, other: UpdateFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for UpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        UpdateFlags(self.0 | rhs.0)
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OBSTACLE_AVOIDANCE | UpdateFlags::SEPARATION
    }
}

/// Agent parameters for crowd
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct AgentParams {
    /// Radius of the agent
    pub radius: f32,
    /// Height of the agent
    pub height: f32,
    /// Maximum acceleration of the agent
    pub max_acceleration: f32,
    /// Maximum speed of the agent
    pub max_speed: f32,
    /// Neighbours and walls within this range affect steering
    pub collision_query_range: f32,
    /// Look-ahead distance for visibility optimization
    pub path_optimization_range: f32,
    /// How strongly the agent keeps away from its neighbours
    pub separation_weight: f32,
    /// Update flags for the agent
    pub update_flags: UpdateFlags,
    /// Index of the obstacle avoidance configuration
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter
    pub query_filter_type: u8,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: DEFAULT_AGENT_RADIUS * 12.0,
            path_optimization_range: DEFAULT_AGENT_RADIUS * 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 3,
            query_filter_type: 0,
        }
    }
}

impl AgentParams {
    fn validate(&self) -> Result<()> {
        let positive = |v: f32| v.is_finite() && v > 0.0;
        let non_negative = |v: f32| v.is_finite() && v >= 0.0;
        if !positive(self.radius)
            || !positive(self.height)
            || !non_negative(self.max_acceleration)
            || !non_negative(self.max_speed)
            || !non_negative(self.collision_query_range)
            || !non_negative(self.path_optimization_range)
            || !non_negative(self.separation_weight)
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok(())
    }

    /// Search box used to snap the agent onto the mesh
    pub fn placement_half_extents(&self) -> [f32; 3] {
        [self.radius * 2.0, self.height * 1.5, self.radius * 2.0]
    }
}

/// Progress along an off-mesh connection
#[derive(Debug, Clone, Copy)]
pub struct OffMeshAnimation {
    pub init_pos: [f32; 3],
    pub start_pos: [f32; 3],
    pub end_pos: [f32; 3],
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

/// A crowd agent
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    active: bool,
    state: CrowdAgentState,
    /// The corridor ends short of the requested target
    partial: bool,
    corridor: PathCorridor,
    boundary: LocalBoundary,
    topology_opt_time: f32,
    neis: Vec<usize>,
    desired_speed: f32,

    npos: [f32; 3],
    disp: [f32; 3],
    /// Desired velocity
    dvel: [f32; 3],
    /// Velocity after obstacle avoidance
    nvel: [f32; 3],
    vel: [f32; 3],

    params: AgentParams,
    corners: StraightPath,

    target_state: MoveRequestState,
    target_ref: PolyRef,
    /// Target position, or the desired velocity for velocity requests
    target_pos: [f32; 3],
    target_replan: bool,

    anim: Option<OffMeshAnimation>,
}

impl CrowdAgent {
    fn new() -> Self {
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor: PathCorridor::new(MAX_PATH_POLYS),
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::with_capacity(MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: [0.0; 3],
            disp: [0.0; 3],
            dvel: [0.0; 3],
            nvel: [0.0; 3],
            vel: [0.0; 3],
            params: AgentParams::default(),
            corners: StraightPath::default(),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::new(0),
            target_pos: [0.0; 3],
            target_replan: false,
            anim: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn get_state(&self) -> CrowdAgentState {
        self.state
    }

    pub fn get_target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn get_pos(&self) -> [f32; 3] {
        self.npos
    }

    pub fn get_vel(&self) -> [f32; 3] {
        self.vel
    }

    pub fn get_desired_vel(&self) -> [f32; 3] {
        self.dvel
    }

    pub fn get_target_pos(&self) -> [f32; 3] {
        self.target_pos
    }

    pub fn get_target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn get_params(&self) -> &AgentParams {
        &self.params
    }

    pub fn get_corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn get_boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    pub fn get_corners(&self) -> &StraightPath {
        &self.corners
    }

    pub fn get_neighbours(&self) -> &[usize] {
        &self.neis
    }

    pub fn get_off_mesh_animation(&self) -> Option<&OffMeshAnimation> {
        self.anim.as_ref()
    }

    fn has_path_target(&self) -> bool {
        self.target_state == MoveRequestState::Valid
    }

    fn integrate(&mut self, dt: f32) {
        // Fake dynamic constraint
        let max_delta = self.params.max_acceleration * dt;
        let mut dv = vsub(&self.nvel, &self.vel);
        let ds = vlen(&dv);
        if ds > max_delta {
            dv = vscale(&dv, max_delta / ds);
        }
        self.vel = vmad(&self.vel, &dv, 1.0);

        if vlen(&self.vel) > 0.0001 {
            self.npos = vmad(&self.npos, &self.vel, dt);
        } else {
            self.vel = [0.0; 3];
        }
    }

    /// Remaining distance to the goal, capped at `range`
    fn distance_to_goal(&self, range: f32) -> f32 {
        let Some(last) = self.corners.points.last() else {
            return range;
        };
        let end_of_path = self
            .corners
            .flags
            .last()
            .is_some_and(|f| f.contains(StraightPathFlags::END));
        if end_of_path {
            dist_sqr_2d(&self.npos, last).sqrt().min(range)
        } else {
            range
        }
    }

    fn straight_steer_direction(&self) -> [f32; 3] {
        let Some(first) = self.corners.points.first() else {
            return [0.0; 3];
        };
        normalize_2d(&vsub(first, &self.npos))
    }

    /// Blends the directions to the first two corners so the agent starts
    /// turning before it reaches a corner
    fn smooth_steer_direction(&self) -> [f32; 3] {
        let n = self.corners.len();
        if n == 0 {
            return [0.0; 3];
        }
        let p0 = self.corners.points[0];
        let p1 = self.corners.points[1.min(n - 1)];

        let dir0 = [p0[0] - self.npos[0], 0.0, p0[2] - self.npos[2]];
        let mut dir1 = [p1[0] - self.npos[0], 0.0, p1[2] - self.npos[2]];
        let len0 = vlen(&dir0);
        let len1 = vlen(&dir1);
        if len1 > 0.001 {
            dir1 = vscale(&dir1, 1.0 / len1);
        }

        let dir = [dir0[0] - dir1[0] * len0 * 0.5, 0.0, dir0[2] - dir1[2] * len0 * 0.5];
        normalize_2d(&dir)
    }
}

fn normalize_2d(v: &[f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[2] * v[2]).sqrt();
    if len > 1e-6 {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0; 3]
    }
}

fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= f32::EPSILON {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}

fn filter_index(filter_type: u8) -> usize {
    (filter_type as usize).min(MAX_QUERY_FILTER_TYPE - 1)
}

fn avoidance_index(avoidance_type: u8) -> usize {
    (avoidance_type as usize).min(MAX_OBSTAVOIDANCE_PARAMS - 1)
}

fn poly_passes(nav_mesh: &NavMesh, reference: PolyRef, filter: &QueryFilter) -> bool {
    nav_mesh
        .get_tile_and_poly_by_ref(reference)
        .is_ok_and(|(_, poly)| filter.pass_filter(poly.flags))
}

fn agent_not_found() -> Error {
    Error::Detour(Status::AgentNotFound.to_string())
}

/// Crowd manager
#[derive(Debug)]
pub struct Crowd {
    agents: Vec<CrowdAgent>,
    max_agent_radius: f32,
    filters: Vec<QueryFilter>,
    obstacle_params: [ObstacleAvoidanceParams; MAX_OBSTAVOIDANCE_PARAMS],
    obstacle_query: ObstacleAvoidanceQuery,
    grid: ProximityGrid,
    path_queue: VecDeque<usize>,
    velocity_sample_count: usize,
}

impl Crowd {
    /// Creates a crowd with room for `max_agents` agents no larger than
    /// `max_agent_radius`
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Result<Self> {
        if max_agents == 0 || !max_agent_radius.is_finite() || max_agent_radius <= 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        Ok(Self {
            agents: (0..max_agents).map(|_| CrowdAgent::new()).collect(),
            max_agent_radius,
            filters: vec![QueryFilter::default(); MAX_QUERY_FILTER_TYPE],
            obstacle_params: [ObstacleAvoidanceParams::default(); MAX_OBSTAVOIDANCE_PARAMS],
            obstacle_query: ObstacleAvoidanceQuery::new(MAX_AVOID_CIRCLES, MAX_AVOID_SEGMENTS),
            grid: ProximityGrid::new(max_agent_radius * 3.0),
            path_queue: VecDeque::new(),
            velocity_sample_count: 0,
        })
    }

    pub fn set_obstacle_avoidance_params(
        &mut self,
        idx: usize,
        params: ObstacleAvoidanceParams,
    ) -> Result<()> {
        let slot = self
            .obstacle_params
            .get_mut(idx)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        *slot = params;
        Ok(())
    }

    pub fn get_obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.obstacle_params.get(idx)
    }

    pub fn get_filter(&self, idx: usize) -> Option<&QueryFilter> {
        self.filters.get(idx)
    }

    pub fn get_editable_filter(&mut self, idx: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(idx)
    }

    pub fn get_max_agent_radius(&self) -> f32 {
        self.max_agent_radius
    }

    /// Capacity of the agent pool
    pub fn get_agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn get_active_agent_count(&self) -> usize {
        self.agents.iter().filter(|a| a.active).count()
    }

    /// Indices of the active agents
    pub fn active_agents(&self) -> impl Iterator<Item = usize> + '_ {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.active)
            .map(|(i, _)| i)
    }

    /// The agent at `idx` if it is active
    pub fn get_agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx).filter(|a| a.active)
    }

    /// Samples taken by obstacle avoidance during the last update
    pub fn get_velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    /// Adds an agent at the mesh point nearest to `pos`
    ///
    /// An agent placed away from the mesh is kept in the
    /// [`CrowdAgentState::Invalid`] state. Fails with `OutOfMemory` when the
    /// pool is full.
    pub fn add_agent(&mut self, nav_mesh: &NavMesh, pos: &[f32; 3], params: &AgentParams) -> Result<usize> {
        params.validate()?;
        if !vis_finite(pos) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let idx = self
            .agents
            .iter()
            .position(|a| !a.active)
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;

        let filter = &self.filters[filter_index(params.query_filter_type)];
        let query = NavMeshQuery::new(nav_mesh);
        let (reference, nearest) =
            query.find_nearest_poly(pos, &params.placement_half_extents(), filter)?;

        let agent = &mut self.agents[idx];
        *agent = CrowdAgent::new();
        agent.params = params.clone();
        agent.corridor.reset(reference, nearest);
        agent.boundary.reset();
        agent.npos = nearest;
        agent.state = if reference.is_valid() {
            CrowdAgentState::Walking
        } else {
            log::debug!("agent {idx} placed off the mesh at {pos:?}");
            CrowdAgentState::Invalid
        };
        agent.active = true;
        Ok(idx)
    }

    pub fn remove_agent(&mut self, idx: usize) -> Result<()> {
        let agent = self
            .agents
            .get_mut(idx)
            .filter(|a| a.active)
            .ok_or_else(agent_not_found)?;
        *agent = CrowdAgent::new();
        self.path_queue.retain(|&i| i != idx);
        Ok(())
    }

    pub fn update_agent_parameters(&mut self, idx: usize, params: &AgentParams) -> Result<()> {
        params.validate()?;
        let agent = self.active_agent_mut(idx)?;
        agent.params = params.clone();
        Ok(())
    }

    /// Queues a path request toward `pos` on polygon `reference`
    pub fn request_move_target(&mut self, idx: usize, reference: PolyRef, pos: &[f32; 3]) -> Result<()> {
        if !reference.is_valid() || !vis_finite(pos) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let agent = self.active_agent_mut(idx)?;
        agent.target_ref = reference;
        agent.target_pos = *pos;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::Requesting;
        Ok(())
    }

    /// Steers the agent with a fixed desired velocity
    pub fn request_move_velocity(&mut self, idx: usize, vel: &[f32; 3]) -> Result<()> {
        if !vis_finite(vel) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let agent = self.active_agent_mut(idx)?;
        agent.target_ref = PolyRef::new(0);
        agent.target_pos = *vel;
        agent.target_replan = false;
        agent.target_state = MoveRequestState::Velocity;
        Ok(())
    }

    pub fn reset_move_target(&mut self, idx: usize) -> Result<()> {
        let agent = self.active_agent_mut(idx)?;
        agent.target_ref = PolyRef::new(0);
        agent.target_pos = [0.0; 3];
        agent.dvel = [0.0; 3];
        agent.target_replan = false;
        agent.target_state = MoveRequestState::None;
        self.path_queue.retain(|&i| i != idx);
        Ok(())
    }

    fn active_agent_mut(&mut self, idx: usize) -> Result<&mut CrowdAgent> {
        self.agents
            .get_mut(idx)
            .filter(|a| a.active)
            .ok_or_else(agent_not_found)
    }

    /// Advances the simulation by `dt` seconds
    pub fn update(&mut self, dt: f32, nav_mesh: &NavMesh) -> Result<()> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        self.velocity_sample_count = 0;

        let mut query = NavMeshQuery::new(nav_mesh);
        let active: Vec<usize> = self.active_agents().collect();

        self.check_path_validity(&query, &active);
        self.update_move_requests(&mut query);
        self.update_topology_optimization(nav_mesh, &active, dt);

        self.grid.clear();
        for &i in &active {
            let agent = &self.agents[i];
            self.grid.add_agent(GridAgent {
                id: i,
                pos: agent.npos,
                radius: agent.params.radius,
            });
        }

        self.update_neighbours(nav_mesh, &mut query, &active);
        self.update_corners(&query, &active);
        self.trigger_off_mesh_connections(nav_mesh, &active);
        self.calculate_steering(&active);
        self.plan_velocities(&active);

        for &i in &active {
            let agent = &mut self.agents[i];
            if agent.state == CrowdAgentState::Walking {
                agent.integrate(dt);
            }
        }

        self.handle_collisions(&active);
        self.move_agents(&query, &active);
        self.update_off_mesh_animations(&active, dt);
        Ok(())
    }

    /// Repairs corridors whose polygons were removed or disabled and
    /// schedules a replan where needed
    fn check_path_validity(&mut self, query: &NavMeshQuery, active: &[usize]) {
        let nav_mesh = query.nav_mesh();
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking {
                continue;
            }
            let filter = &self.filters[filter_index(agent.params.query_filter_type)];
            let ext = agent.params.placement_half_extents();
            let mut replan = false;

            if !poly_passes(nav_mesh, agent.corridor.get_first_poly(), filter) {
                match query.find_nearest_poly(&agent.npos, &ext, filter) {
                    Ok((reference, nearest)) if reference.is_valid() => {
                        agent.corridor.fix_path_start(reference, &nearest);
                        agent.boundary.reset();
                        agent.npos = nearest;
                        replan = true;
                    }
                    _ => {
                        log::debug!("agent {i} lost the mesh");
                        agent.corridor.reset(PolyRef::new(0), agent.npos);
                        agent.partial = false;
                        agent.boundary.reset();
                        agent.state = CrowdAgentState::Invalid;
                        continue;
                    }
                }
            }

            let has_target = !matches!(
                agent.target_state,
                MoveRequestState::None | MoveRequestState::Failed | MoveRequestState::Velocity
            );
            if has_target && !poly_passes(nav_mesh, agent.target_ref, filter) {
                match query.find_nearest_poly(&agent.target_pos, &ext, filter) {
                    Ok((reference, nearest)) if reference.is_valid() => {
                        agent.target_ref = reference;
                        agent.target_pos = nearest;
                        replan = true;
                    }
                    _ => {
                        let first = agent.corridor.get_first_poly();
                        agent.corridor.reset(first, agent.npos);
                        agent.partial = false;
                        agent.target_ref = PolyRef::new(0);
                        agent.target_state = MoveRequestState::None;
                    }
                }
            }

            if !agent.corridor.is_valid(CHECK_LOOKAHEAD, nav_mesh, filter) {
                let first = agent.corridor.get_first_poly();
                if let Err(e) = agent.corridor.trim_invalid_path(first, &agent.npos, nav_mesh, filter) {
                    log::debug!("agent {i}: failed to trim corridor: {e}");
                }
                agent.boundary.reset();
                replan = true;
            }

            if replan && !matches!(agent.target_state, MoveRequestState::None | MoveRequestState::Velocity) {
                agent.target_replan = true;
                agent.target_state = MoveRequestState::Requesting;
            }
        }
    }

    fn update_move_requests(&mut self, query: &mut NavMeshQuery) {
        for (i, agent) in self.agents.iter_mut().enumerate() {
            if agent.active && agent.target_state == MoveRequestState::Requesting {
                agent.target_state = MoveRequestState::WaitingForQueue;
                if !self.path_queue.contains(&i) {
                    self.path_queue.push_back(i);
                }
            }
        }

        let mut budget = MAX_PATH_REQUESTS_PER_UPDATE;
        while budget > 0 {
            let Some(i) = self.path_queue.pop_front() else {
                break;
            };
            let agent = &mut self.agents[i];
            if !agent.active || agent.target_state != MoveRequestState::WaitingForQueue {
                continue;
            }
            budget -= 1;
            agent.target_state = MoveRequestState::WaitingForPath;

            let filter = &self.filters[filter_index(agent.params.query_filter_type)];
            let result = query.find_path(
                agent.corridor.get_first_poly(),
                agent.target_ref,
                &agent.npos,
                &agent.target_pos,
                filter,
                MAX_PATH_POLYS,
            );
            match result {
                Ok((path, status)) if !path.is_empty() => {
                    let last = path[path.len() - 1];
                    agent.partial = status == Status::PartialResult || last != agent.target_ref;
                    let mut target = agent.target_pos;
                    if agent.partial {
                        if let Ok(p) = query.closest_point_on_poly_boundary(last, &target) {
                            target = p;
                        }
                    }
                    agent.corridor.set_corridor(target, &path);
                    agent.boundary.reset();
                    agent.target_replan = false;
                    agent.target_state = MoveRequestState::Valid;
                }
                Ok(_) => agent.target_state = MoveRequestState::Failed,
                Err(e) => {
                    log::debug!("path request for agent {i} failed: {e}");
                    agent.target_state = MoveRequestState::Failed;
                }
            }
        }
    }

    fn update_topology_optimization(&mut self, nav_mesh: &NavMesh, active: &[usize], dt: f32) {
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking
                || !agent.has_path_target()
                || !agent.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO)
            {
                continue;
            }
            agent.topology_opt_time += dt;
            if agent.topology_opt_time < OPT_TIME_THR {
                continue;
            }
            agent.topology_opt_time = 0.0;
            let filter = &self.filters[filter_index(agent.params.query_filter_type)];
            if let Err(e) = agent.corridor.optimize_path_topology(nav_mesh, filter) {
                log::debug!("agent {i}: topology optimization failed: {e}");
            }
        }
    }

    fn update_neighbours(&mut self, nav_mesh: &NavMesh, query: &mut NavMeshQuery, active: &[usize]) {
        for &i in active {
            if self.agents[i].state != CrowdAgentState::Walking {
                continue;
            }

            let (pos, height, range) = {
                let agent = &self.agents[i];
                (agent.npos, agent.params.height, agent.params.collision_query_range)
            };
            let neis: Vec<usize> = self
                .grid
                .query_agents(&pos, range, self.max_agent_radius)
                .into_iter()
                .filter(|&j| j != i)
                .filter(|&j| {
                    let other = &self.agents[j];
                    (other.npos[1] - pos[1]).abs() < (height + other.params.height) * 0.5
                })
                .take(MAX_NEIGHBOURS)
                .collect();

            let agent = &mut self.agents[i];
            agent.neis = neis;

            let filter = &self.filters[filter_index(agent.params.query_filter_type)];
            let update_thr = range * 0.25;
            if dist_sqr_2d(&pos, agent.boundary.get_center()) > sqr(update_thr)
                || !agent.boundary.is_valid(nav_mesh, filter)
            {
                let first = agent.corridor.get_first_poly();
                if let Err(e) = agent.boundary.update(first, &pos, range, query, filter) {
                    log::debug!("agent {i}: failed to collect walls: {e}");
                    agent.boundary.reset();
                }
            }
        }
    }

    fn update_corners(&mut self, query: &NavMeshQuery, active: &[usize]) {
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking || !agent.has_path_target() {
                agent.corners = StraightPath::default();
                continue;
            }

            agent.corners = match agent.corridor.find_corners(query, MAX_CORNERS) {
                Ok(corners) => corners,
                Err(e) => {
                    log::debug!("agent {i}: failed to find corners: {e}");
                    StraightPath::default()
                }
            };

            let n = agent.corners.len();
            if n > 0 && agent.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) {
                let target = agent.corners.points[1.min(n - 1)];
                let filter = &self.filters[filter_index(agent.params.query_filter_type)];
                let range = agent.params.path_optimization_range;
                if let Err(e) = agent.corridor.optimize_path_visibility(&target, range, query, filter) {
                    log::debug!("agent {i}: visibility optimization failed: {e}");
                }
            }
        }
    }

    fn trigger_off_mesh_connections(&mut self, nav_mesh: &NavMesh, active: &[usize]) {
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking || !agent.has_path_target() {
                continue;
            }
            let Some(last) = agent.corners.len().checked_sub(1) else {
                continue;
            };
            if !agent.corners.flags[last].contains(StraightPathFlags::OFFMESH_CONNECTION) {
                continue;
            }
            let trigger_radius = agent.params.radius * 2.25;
            if dist_sqr_2d(&agent.npos, &agent.corners.points[last]) > sqr(trigger_radius) {
                continue;
            }

            let con_ref = agent.corners.refs[last];
            match agent.corridor.move_over_offmesh_connection(con_ref, nav_mesh) {
                Ok(Some((start, end))) => {
                    let tmax = dist_sqr_2d(&start, &end).sqrt() / agent.params.max_speed.max(0.001) * 0.5;
                    agent.anim = Some(OffMeshAnimation {
                        init_pos: agent.npos,
                        start_pos: start,
                        end_pos: end,
                        poly_ref: con_ref,
                        t: 0.0,
                        tmax,
                    });
                    agent.state = CrowdAgentState::OffMesh;
                    agent.corners = StraightPath::default();
                    agent.neis.clear();
                    log::trace!("agent {i} entered off-mesh connection {}", con_ref.id());
                }
                Ok(None) => {}
                Err(e) => log::debug!("agent {i}: failed to enter off-mesh connection: {e}"),
            }
        }
    }

    fn calculate_steering(&mut self, active: &[usize]) {
        let positions: Vec<[f32; 3]> = self.agents.iter().map(|a| a.npos).collect();

        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking {
                continue;
            }

            let mut dvel = [0.0; 3];
            match agent.target_state {
                MoveRequestState::Velocity => {
                    dvel = agent.target_pos;
                    agent.desired_speed = vlen(&agent.target_pos);
                }
                MoveRequestState::Valid => {
                    let dir = if agent.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                        agent.smooth_steer_direction()
                    } else {
                        agent.straight_steer_direction()
                    };
                    // Slow down near the end of the path
                    let slow_down_radius = agent.params.radius * 2.0;
                    let speed_scale = agent.distance_to_goal(slow_down_radius) / slow_down_radius;
                    agent.desired_speed = agent.params.max_speed;
                    dvel = vscale(&dir, agent.desired_speed * speed_scale);
                }
                _ => agent.desired_speed = 0.0,
            }

            if agent.params.update_flags.contains(UpdateFlags::SEPARATION)
                && agent.params.separation_weight > 0.0
                && agent.params.collision_query_range > 0.0
            {
                let sep_dist = agent.params.collision_query_range;
                let inv_sep_dist = 1.0 / sep_dist;
                let mut disp = [0.0; 3];
                let mut w = 0.0;

                for &j in &agent.neis {
                    let other = positions[j];
                    let diff = [agent.npos[0] - other[0], 0.0, agent.npos[2] - other[2]];
                    let dist_sqr = vlen_sqr(&diff);
                    if dist_sqr < 0.00001 || dist_sqr > sqr(sep_dist) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = agent.params.separation_weight * (1.0 - sqr(dist * inv_sep_dist));
                    disp = vmad(&disp, &diff, weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    dvel = vmad(&dvel, &disp, 1.0 / w);
                    let speed_sqr = vlen_sqr(&dvel);
                    let desired_sqr = sqr(agent.desired_speed);
                    if speed_sqr > desired_sqr {
                        dvel = vscale(&dvel, desired_sqr / speed_sqr);
                    }
                }
            }

            agent.dvel = dvel;
        }
    }

    fn plan_velocities(&mut self, active: &[usize]) {
        for &i in active {
            if self.agents[i].state != CrowdAgentState::Walking {
                continue;
            }
            let agent = &self.agents[i];
            if !agent.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                self.agents[i].nvel = self.agents[i].dvel;
                continue;
            }

            self.obstacle_query.reset();
            for &j in &agent.neis {
                let nei = &self.agents[j];
                self.obstacle_query.add_circle(&nei.npos, nei.params.radius, &nei.vel, &nei.dvel);
            }
            for s in 0..agent.boundary.get_segment_count() {
                let Some((p, q)) = agent.boundary.get_segment(s) else {
                    continue;
                };
                // Walls facing away from the agent
                if tri_area_2d(&agent.npos, &p, &q) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(&p, &q);
            }

            let params = self.obstacle_params[avoidance_index(agent.params.obstacle_avoidance_type)];
            let (nvel, samples) = self.obstacle_query.sample_velocity_adaptive(
                &agent.npos,
                agent.params.radius,
                agent.desired_speed,
                &agent.vel,
                &agent.dvel,
                &params,
            );
            self.velocity_sample_count += samples;
            self.agents[i].nvel = nvel;
        }
    }

    /// Pushes overlapping agents apart
    fn handle_collisions(&mut self, active: &[usize]) {
        for _ in 0..COLLISION_ITERATIONS {
            for &i in active {
                let agent = &self.agents[i];
                if agent.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut disp = [0.0; 3];
                let mut w = 0.0;
                for &j in &agent.neis {
                    let nei = &self.agents[j];
                    let mut diff = [agent.npos[0] - nei.npos[0], 0.0, agent.npos[2] - nei.npos[2]];
                    let dist_sqr = vlen_sqr(&diff);
                    let reach = agent.params.radius + nei.params.radius;
                    if dist_sqr > sqr(reach) {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let pen = if dist < 0.0001 {
                        // Agents on top of each other, push apart sideways
                        diff = if i > j {
                            [-agent.dvel[2], 0.0, agent.dvel[0]]
                        } else {
                            [agent.dvel[2], 0.0, -agent.dvel[0]]
                        };
                        0.01
                    } else {
                        (1.0 / dist) * ((reach - dist) * 0.5) * COLLISION_RESOLVE_FACTOR
                    };
                    disp = vmad(&disp, &diff, pen);
                    w += 1.0;
                }
                if w > 0.0001 {
                    disp = vscale(&disp, 1.0 / w);
                }
                self.agents[i].disp = disp;
            }

            for &i in active {
                let agent = &mut self.agents[i];
                if agent.state == CrowdAgentState::Walking {
                    agent.npos = vmad(&agent.npos, &agent.disp, 1.0);
                }
            }
        }
    }

    fn move_agents(&mut self, query: &NavMeshQuery, active: &[usize]) {
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::Walking {
                continue;
            }

            let filter = &self.filters[filter_index(agent.params.query_filter_type)];
            match agent.corridor.move_position(&agent.npos, query, filter) {
                Ok(_) => agent.npos = agent.corridor.get_pos(),
                Err(e) => {
                    log::debug!("agent {i}: failed to move along surface: {e}");
                    agent.npos = agent.corridor.get_pos();
                }
            }

            // Without a path target the corridor is just the current polygon
            if matches!(agent.target_state, MoveRequestState::None | MoveRequestState::Velocity) {
                let first = agent.corridor.get_first_poly();
                agent.corridor.reset(first, agent.npos);
                agent.partial = false;
            }

            if agent.has_path_target() {
                let target = agent.corridor.get_target();
                let on_last_poly = agent.corridor.get_path_count() <= 1;
                let close = dist_sqr_2d(&agent.npos, &target) <= sqr(agent.params.radius)
                    && (agent.npos[1] - target[1]).abs() < agent.params.height;
                if on_last_poly && close {
                    agent.target_state = MoveRequestState::Arrived;
                    agent.dvel = [0.0; 3];
                    agent.corners = StraightPath::default();
                    log::trace!("agent {i} arrived");
                }
            }
        }
    }

    fn update_off_mesh_animations(&mut self, active: &[usize], dt: f32) {
        for &i in active {
            let agent = &mut self.agents[i];
            if agent.state != CrowdAgentState::OffMesh {
                continue;
            }
            let Some(anim) = agent.anim.as_mut() else {
                agent.state = CrowdAgentState::Walking;
                continue;
            };

            anim.t += dt;
            if anim.t > anim.tmax {
                agent.npos = anim.end_pos;
                agent.anim = None;
                agent.state = CrowdAgentState::Walking;
                agent.vel = [0.0; 3];
                agent.dvel = [0.0; 3];
                continue;
            }

            // Approach the start point, then cross to the end point
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            agent.npos = if anim.t < ta {
                vlerp(&anim.init_pos, &anim.start_pos, tween(anim.t, 0.0, ta))
            } else {
                vlerp(&anim.start_pos, &anim.end_pos, tween(anim.t, ta, tb))
            };
            agent.vel = [0.0; 3];
            agent.dvel = [0.0; 3];
        }
    }
}
