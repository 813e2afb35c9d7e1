//! Fixed-capacity agent pool over the crowd simulation

use detour::{NavMesh, PolyFlags, PolyRef, QueryFilter, Status};
use detour_crowd::{Crowd, ObstacleAvoidanceParams};
use recast_common::{Error, Result};

use crate::messages::{AgentInfo, AgentParameters};
use crate::tile_raster::AREA_WATER;

/// Returned by [`CrowdManager::add_agent`] when every slot is taken
pub const POOL_EXHAUSTED: i32 = -1;

/// Adaptive sampling (divisions, rings, depth) of the low, medium, good and
/// high avoidance presets
const AVOIDANCE_PRESETS: [(u8, u8, u8); 4] = [(5, 2, 1), (5, 2, 2), (7, 2, 3), (7, 3, 3)];

/// Avoidance parameters of preset `idx`, 0 (low) to 3 (high)
pub fn avoidance_preset(idx: usize) -> Option<ObstacleAvoidanceParams> {
    let &(divs, rings, depth) = AVOIDANCE_PRESETS.get(idx)?;
    Some(ObstacleAvoidanceParams {
        vel_bias: 0.5,
        adaptive_divs: divs,
        adaptive_rings: rings,
        adaptive_depth: depth,
        ..ObstacleAvoidanceParams::default()
    })
}

/// The filter shared by agents and client queries
pub fn default_query_filter() -> QueryFilter {
    let mut filter = QueryFilter {
        include_flags: PolyFlags::WALK | PolyFlags::SWIM | PolyFlags::DOOR | PolyFlags::JUMP,
        exclude_flags: PolyFlags::DISABLED,
        ..QueryFilter::default()
    };
    filter.set_area_cost(AREA_WATER, 10.0);
    filter
}

pub struct CrowdManager {
    crowd: Crowd,
    filter: QueryFilter,
}

impl CrowdManager {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Result<Self> {
        let mut crowd = Crowd::new(max_agents, max_agent_radius)?;
        for idx in 0..AVOIDANCE_PRESETS.len() {
            if let Some(params) = avoidance_preset(idx) {
                crowd.set_obstacle_avoidance_params(idx, params)?;
            }
        }
        let filter = default_query_filter();
        if let Some(slot) = crowd.get_editable_filter(0) {
            *slot = filter.clone();
        }
        Ok(Self { crowd, filter })
    }

    /// Drops every agent and rebuilds the pool with the same capacity
    pub fn reinitialize(&mut self) -> Result<()> {
        let fresh = Self::new(self.crowd.get_agent_count(), self.crowd.get_max_agent_radius())?;
        *self = fresh;
        Ok(())
    }

    pub fn crowd(&self) -> &Crowd {
        &self.crowd
    }

    /// Query filter 0
    pub fn filter(&self) -> &QueryFilter {
        &self.filter
    }

    pub fn capacity(&self) -> usize {
        self.crowd.get_agent_count()
    }

    pub fn active_agent_count(&self) -> usize {
        self.crowd.get_active_agent_count()
    }

    /// Adds an agent at `params.initial_position`
    ///
    /// Returns the agent id, or [`POOL_EXHAUSTED`] without touching the pool
    /// when it is full.
    pub fn add_agent(&mut self, nav_mesh: &NavMesh, params: &AgentParameters) -> Result<i32> {
        if self.active_agent_count() >= self.capacity() {
            log::debug!("agent pool of {} is full", self.capacity());
            return Ok(POOL_EXHAUSTED);
        }
        let idx = self
            .crowd
            .add_agent(nav_mesh, &params.initial_position, &params.to_agent_params())?;
        i32::try_from(idx).map_err(|_| Error::Detour(Status::OutOfMemory.to_string()))
    }

    pub fn update_agent(&mut self, id: i32, params: &AgentParameters) -> Result<()> {
        let idx = agent_index(id)?;
        self.crowd.update_agent_parameters(idx, &params.to_agent_params())
    }

    pub fn remove_agent(&mut self, id: i32) -> Result<()> {
        self.crowd.remove_agent(agent_index(id)?)
    }

    pub fn request_move_target(&mut self, id: i32, reference: PolyRef, pos: &[f32; 3]) -> Result<()> {
        self.crowd.request_move_target(agent_index(id)?, reference, pos)
    }

    pub fn reset_move_target(&mut self, id: i32) -> Result<()> {
        self.crowd.reset_move_target(agent_index(id)?)
    }

    pub fn agent_info(&self, id: i32) -> Result<AgentInfo> {
        let agent = self
            .crowd
            .get_agent(agent_index(id)?)
            .ok_or_else(|| Error::Detour(Status::AgentNotFound.to_string()))?;
        Ok(AgentInfo::from_agent(id, agent))
    }

    /// Advances every agent by `dt` seconds
    pub fn update(&mut self, dt: f32, nav_mesh: &NavMesh) -> Result<()> {
        self.crowd.update(dt, nav_mesh)
    }
}

fn agent_index(id: i32) -> Result<usize> {
    usize::try_from(id).map_err(|_| Error::Detour(Status::InvalidParam.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::flat_nav_mesh;
    use detour_crowd::{CrowdAgentState, MoveRequestState};

    fn agent_at(pos: [f32; 3]) -> AgentParameters {
        AgentParameters {
            radius: 0.5,
            height: 2.0,
            initial_position: pos,
            ..AgentParameters::default()
        }
    }

    #[test]
    fn test_presets_installed() {
        let manager = CrowdManager::new(4, 0.6).unwrap();
        for (idx, &(divs, rings, depth)) in AVOIDANCE_PRESETS.iter().enumerate() {
            let params = manager.crowd().get_obstacle_avoidance_params(idx).unwrap();
            assert_eq!(params.vel_bias, 0.5);
            assert_eq!(params.adaptive_divs, divs);
            assert_eq!(params.adaptive_rings, rings);
            assert_eq!(params.adaptive_depth, depth);
        }
        assert!(avoidance_preset(4).is_none());

        let filter = manager.filter();
        assert!(filter.include_flags.contains(PolyFlags::SWIM | PolyFlags::JUMP));
        assert_eq!(filter.exclude_flags, PolyFlags::DISABLED);
        assert_eq!(filter.area_cost[AREA_WATER as usize], 10.0);
    }

    #[test]
    fn test_full_pool_returns_negative_id() {
        let mesh = flat_nav_mesh();
        let mut manager = CrowdManager::new(2, 0.6).unwrap();
        assert_eq!(manager.add_agent(&mesh, &agent_at([2.0, 0.0, 2.0])).unwrap(), 0);
        assert_eq!(manager.add_agent(&mesh, &agent_at([4.0, 0.0, 4.0])).unwrap(), 1);

        let id = manager.add_agent(&mesh, &agent_at([6.0, 0.0, 6.0])).unwrap();
        assert!(id < 0);
        assert_eq!(manager.active_agent_count(), 2);

        // A freed slot is reused
        manager.remove_agent(0).unwrap();
        assert_eq!(manager.add_agent(&mesh, &agent_at([6.0, 0.0, 6.0])).unwrap(), 0);
    }

    #[test]
    fn test_agent_walks_to_target() {
        let mesh = flat_nav_mesh();
        let mut manager = CrowdManager::new(8, 0.6).unwrap();
        let id = manager.add_agent(&mesh, &agent_at([1.0, 0.0, 1.0])).unwrap();
        assert_eq!(
            manager.crowd().get_agent(id as usize).unwrap().get_state(),
            CrowdAgentState::Walking
        );

        let query = detour::NavMeshQuery::new(&mesh);
        let target = [8.0, 0.0, 8.0];
        let (reference, nearest) = query
            .find_nearest_poly(&target, &[1.0, 2.0, 1.0], manager.filter())
            .unwrap();
        manager.request_move_target(id, reference, &nearest).unwrap();

        let start = manager.agent_info(id).unwrap().position;
        for _ in 0..40 {
            manager.update(0.1, &mesh).unwrap();
        }
        let info = manager.agent_info(id).unwrap();
        let before = recast_common::vdist(&start, &target);
        let after = recast_common::vdist(&info.position, &target);
        assert!(after < before, "agent did not approach the target");

        manager.reset_move_target(id).unwrap();
        assert_eq!(
            manager.crowd().get_agent(id as usize).unwrap().get_target_state(),
            MoveRequestState::None
        );
    }

    #[test]
    fn test_invalid_ids_fail() {
        let mut manager = CrowdManager::new(2, 0.6).unwrap();
        assert!(manager.remove_agent(-3).is_err());
        assert!(manager.agent_info(1).is_err());
        assert!(manager.update_agent(5, &AgentParameters::default()).is_err());
    }

    #[test]
    fn test_reinitialize_drops_agents() {
        let mesh = flat_nav_mesh();
        let mut manager = CrowdManager::new(3, 0.6).unwrap();
        manager.add_agent(&mesh, &agent_at([2.0, 0.0, 2.0])).unwrap();
        manager.reinitialize().unwrap();
        assert_eq!(manager.active_agent_count(), 0);
        assert_eq!(manager.capacity(), 3);
    }
}
