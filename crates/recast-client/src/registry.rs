//! Table of independent clients addressed by (area, layer)
//!
//! The registry is an owned value; every operation names its slot. Calls
//! on an empty or out-of-range slot fail with `NotFound` and change
//! nothing. Byte payloads in and out are JSON messages, except for
//! [`AreaLayerRegistry::save`] and [`AreaLayerRegistry::load`], which
//! carry the binary navmesh bundle.

use detour::{PolyFlags, PolyRef, Status};
use detour_tilecache::ObstacleRef;
use recast_common::{Error, Result};

use crate::client::RecastClient;
use crate::debug_mesh::DEFAULT_EXCLUDE_FLAGS;
use crate::input_geom::BuildSource;
use crate::messages::{self, AgentParameters};

#[derive(Default)]
pub struct AreaLayerRegistry {
    areas: usize,
    layers: usize,
    slots: Vec<Option<RecastClient>>,
}

fn not_found() -> Error {
    Error::Detour(Status::NotFound.to_string())
}

impl AreaLayerRegistry {
    /// An empty registry; call [`Self::configure`] before use
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the table with `total_areas` x `total_layers` empty slots
    pub fn configure(&mut self, total_areas: usize, total_layers: usize) -> Result<()> {
        let count = total_areas
            .checked_mul(total_layers)
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "registry of {total_areas} areas by {total_layers} layers"
                ))
            })?;
        self.areas = total_areas;
        self.layers = total_layers;
        self.slots = (0..count).map(|_| None).collect();
        log::debug!("registry configured with {count} slots");
        Ok(())
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.areas, self.layers)
    }

    fn index(&self, area: usize, layer: usize) -> Option<usize> {
        (area < self.areas && layer < self.layers).then(|| area * self.layers + layer)
    }

    /// Creates the client of a slot, replacing any existing one
    pub fn initialize(&mut self, area: usize, layer: usize, tiled: bool) -> Result<()> {
        let index = self.index(area, layer).ok_or_else(not_found)?;
        let client = RecastClient::new(tiled)?;
        if self.slots[index].replace(client).is_some() {
            log::debug!("slot ({area}, {layer}) reinitialized");
        }
        Ok(())
    }

    /// Releases the client of a slot
    pub fn destroy(&mut self, area: usize, layer: usize) -> Result<()> {
        let index = self.index(area, layer).ok_or_else(not_found)?;
        self.slots[index].take().map(|_| ()).ok_or_else(not_found)
    }

    pub fn client(&self, area: usize, layer: usize) -> Result<&RecastClient> {
        self.index(area, layer)
            .and_then(|i| self.slots[i].as_ref())
            .ok_or_else(not_found)
    }

    pub fn client_mut(&mut self, area: usize, layer: usize) -> Result<&mut RecastClient> {
        self.index(area, layer)
            .and_then(|i| self.slots[i].as_mut())
            .ok_or_else(not_found)
    }

    /// Disjoint borrows of every occupied slot
    pub fn slots_mut(&mut self) -> impl Iterator<Item = (usize, usize, &mut RecastClient)> {
        let layers = self.layers;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(move |(i, slot)| slot.as_mut().map(|c| (i / layers, i % layers, c)))
    }

    /// Releases a buffer returned by the registry
    pub fn free_buffer(&self, buffer: Vec<u8>) {
        drop(buffer);
    }

    /// Steps the crowd and the tile rebuild queue of a slot
    pub fn update(&mut self, area: usize, layer: usize, dt: f32) -> Result<bool> {
        self.client_mut(area, layer)?.update(dt)
    }

    pub fn load_settings(&mut self, area: usize, layer: usize, data: &[u8]) -> Result<()> {
        self.client_mut(area, layer)?.load_settings(data)
    }

    pub fn build(&mut self, area: usize, layer: usize, source: &BuildSource, additive: bool) -> Result<()> {
        self.client_mut(area, layer)?.build(source, additive)
    }

    pub fn load(&mut self, area: usize, layer: usize, data: &[u8], additive: bool) -> Result<()> {
        self.client_mut(area, layer)?.load(data, additive)
    }

    pub fn save(&self, area: usize, layer: usize) -> Result<Vec<u8>> {
        self.client(area, layer)?.save()
    }

    /// `DebugNavMesh` JSON without disabled polygons
    pub fn get_debug_nav_mesh(&self, area: usize, layer: usize) -> Result<Vec<u8>> {
        self.get_debug_nav_mesh_filtered(area, layer, DEFAULT_EXCLUDE_FLAGS)
    }

    pub fn get_debug_nav_mesh_filtered(
        &self,
        area: usize,
        layer: usize,
        exclude: PolyFlags,
    ) -> Result<Vec<u8>> {
        messages::to_json(&self.client(area, layer)?.get_debug_nav_mesh(exclude)?)
    }

    /// Adds an agent from `AgentParameters` JSON; a negative id means the
    /// pool is full
    pub fn add_agent(&mut self, area: usize, layer: usize, params: &[u8]) -> Result<i32> {
        let client = self.client_mut(area, layer)?;
        let params: AgentParameters = messages::from_json(params)?;
        client.add_agent(&params)
    }

    pub fn update_agent(&mut self, area: usize, layer: usize, id: i32, params: &[u8]) -> Result<()> {
        let client = self.client_mut(area, layer)?;
        let params: AgentParameters = messages::from_json(params)?;
        client.update_agent(id, &params)
    }

    pub fn remove_agent(&mut self, area: usize, layer: usize, id: i32) -> Result<()> {
        self.client_mut(area, layer)?.remove_agent(id)
    }

    pub fn request_move_target(
        &mut self,
        area: usize,
        layer: usize,
        id: i32,
        poly_ref: u32,
        pos: &[f32; 3],
    ) -> Result<()> {
        self.client_mut(area, layer)?
            .request_move_target(id, PolyRef::new(poly_ref), pos)
    }

    pub fn reset_move_target(&mut self, area: usize, layer: usize, id: i32) -> Result<()> {
        self.client_mut(area, layer)?.reset_move_target(id)
    }

    /// `AgentInfo` JSON of an agent
    pub fn get_agent_info(&self, area: usize, layer: usize, id: i32) -> Result<Vec<u8>> {
        messages::to_json(&self.client(area, layer)?.get_agent_info(id)?)
    }

    pub fn find_nearest_poly(
        &self,
        area: usize,
        layer: usize,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Result<(u32, [f32; 3])> {
        let (reference, point) = self
            .client(area, layer)?
            .find_nearest_poly(center, half_extents)?;
        Ok((reference.id(), point))
    }

    pub fn find_random_point_around_circle(
        &mut self,
        area: usize,
        layer: usize,
        start_ref: u32,
        center: &[f32; 3],
        max_radius: f32,
    ) -> Result<(u32, [f32; 3])> {
        let (reference, point) = self
            .client_mut(area, layer)?
            .find_random_point_around_circle(PolyRef::new(start_ref), center, max_radius)?;
        Ok((reference.id(), point))
    }

    /// `PathInfo` JSON of a path query
    #[allow(clippy::too_many_arguments)]
    pub fn get_path(
        &self,
        area: usize,
        layer: usize,
        start_ref: u32,
        end_ref: u32,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        detailed: bool,
    ) -> Result<Vec<u8>> {
        let path = self.client(area, layer)?.get_path(
            PolyRef::new(start_ref),
            PolyRef::new(end_ref),
            start_pos,
            end_pos,
            detailed,
        )?;
        messages::to_json(&path)
    }

    pub fn add_obstacle(
        &mut self,
        area: usize,
        layer: usize,
        pos: [f32; 3],
        radius: f32,
        height: f32,
    ) -> Result<ObstacleRef> {
        self.client_mut(area, layer)?.add_obstacle(pos, radius, height)
    }

    pub fn add_box_obstacle(
        &mut self,
        area: usize,
        layer: usize,
        bmin: [f32; 3],
        bmax: [f32; 3],
    ) -> Result<ObstacleRef> {
        self.client_mut(area, layer)?.add_box_obstacle(bmin, bmax)
    }

    pub fn remove_obstacle(&mut self, area: usize, layer: usize, obstacle_ref: ObstacleRef) -> Result<()> {
        self.client_mut(area, layer)?.remove_obstacle(obstacle_ref)
    }

    pub fn clear_obstacles(&mut self, area: usize, layer: usize) -> Result<()> {
        self.client_mut(area, layer)?.clear_obstacles()
    }

    /// `BuildLog` JSON of a slot's build context
    pub fn get_log(&self, area: usize, layer: usize) -> Result<Vec<u8>> {
        messages::to_json(&self.client(area, layer)?.get_log())
    }

    pub fn log_build_times(&mut self, area: usize, layer: usize) -> Result<()> {
        self.client_mut(area, layer)?.log_build_times();
        Ok(())
    }
}
