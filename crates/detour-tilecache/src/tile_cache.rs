//! Tile cache implementation for Detour
//!
//! The [`TileCache`] owns the compressed layers of every tile together with
//! the dynamic obstacle table. Adding or removing an obstacle queues the
//! tiles it touches; [`TileCache::update`] rebuilds a bounded number of
//! queued tiles into the navigation mesh per call.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use detour::{MeshTile, NavMesh, NavMeshBuilder, Status};
use recast_common::{overlap_bounds, Error, Result};

use super::tile_cache_builder::{TileCacheBuilder, TileCacheMeshProcess};
use super::tile_cache_data::{TileCacheLayer, TileCacheLayerHeader};

/// Reference to a compressed tile: `salt << 16 | index`
pub type CompressedTileRef = u32;

/// Reference to an obstacle: `salt << 16 | index`
pub type ObstacleRef = u32;

/// Number of queued tiles rebuilt by one [`TileCache::update`] call
pub const MAX_UPDATE_TILES_PER_STEP: usize = 8;

const REF_SALT_SHIFT: u32 = 16;
const REF_INDEX_MASK: u32 = (1 << REF_SALT_SHIFT) - 1;

/// Tile cache parameters
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheParams {
    /// Origin of the tile grid
    pub origin: [f32; 3],
    /// Cell size (horizontal resolution)
    pub cs: f32,
    /// Cell height (vertical resolution)
    pub ch: f32,
    /// Tile width in cells
    pub width: i32,
    /// Tile depth in cells
    pub height: i32,
    /// Agent dimensions in world units
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub max_simplification_error: f32,
    /// Capacity of the tile table
    pub max_tiles: i32,
    /// Capacity of the obstacle table
    pub max_obstacles: i32,
}

impl Default for TileCacheParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            cs: 0.3,
            ch: 0.2,
            width: 48,
            height: 48,
            walkable_height: 2.0,
            walkable_radius: 0.6,
            walkable_climb: 0.9,
            max_simplification_error: 1.3,
            max_tiles: 256,
            max_obstacles: 2048,
        }
    }
}

impl TileCacheParams {
    /// Size of the serialized form in bytes
    pub const SERIALIZED_SIZE: usize = 52;

    /// Serializes the parameters as a little-endian blob
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SERIALIZED_SIZE);
        for v in self.origin.iter().chain([&self.cs, &self.ch]) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        for v in [
            self.walkable_height,
            self.walkable_radius,
            self.walkable_climb,
            self.max_simplification_error,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.max_tiles.to_le_bytes());
        out.extend_from_slice(&self.max_obstacles.to_le_bytes());
        out
    }

    /// Parses a blob written by [`TileCacheParams::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SERIALIZED_SIZE {
            return Err(Error::Serialization(format!(
                "tile cache params blob is {} bytes, expected {}",
                data.len(),
                Self::SERIALIZED_SIZE
            )));
        }
        let mut c = Cursor::new(data);
        let mut origin = [0.0; 3];
        for v in &mut origin {
            *v = c.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            origin,
            cs: c.read_f32::<LittleEndian>()?,
            ch: c.read_f32::<LittleEndian>()?,
            width: c.read_i32::<LittleEndian>()?,
            height: c.read_i32::<LittleEndian>()?,
            walkable_height: c.read_f32::<LittleEndian>()?,
            walkable_radius: c.read_f32::<LittleEndian>()?,
            walkable_climb: c.read_f32::<LittleEndian>()?,
            max_simplification_error: c.read_f32::<LittleEndian>()?,
            max_tiles: c.read_i32::<LittleEndian>()?,
            max_obstacles: c.read_i32::<LittleEndian>()?,
        })
    }

    fn validate(&self) -> Result<()> {
        if !recast_common::vis_finite(&self.origin) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        if self.cs <= 0.0 || self.ch <= 0.0 || self.width <= 0 || self.height <= 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let slots = 1..=(1 << REF_SALT_SHIFT);
        if !slots.contains(&self.max_tiles) || !(0..=(1 << REF_SALT_SHIFT)).contains(&self.max_obstacles)
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok(())
    }
}

/// Build lifecycle of a tile
///
/// `Rasterized` and `Compressed` only exist while a tile is being built,
/// before its layers reach a cache; the builder reports them.
/// [`TileCache::tile_state`] returns one of `Unqueued`, `Cached` or `Meshed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum TileState {
    /// Not built yet, or the build failed
    Unqueued,
    /// Voxelized into layers
    Rasterized,
    /// Layers compressed, not yet inserted
    Compressed,
    /// Held by the cache
    Cached,
    /// Materialized into the navmesh
    Meshed,
}

/// A compressed tile slot
#[derive(Debug, Clone, Default)]
pub struct CompressedTile {
    /// Reuse counter of the slot
    pub salt: u32,
    pub header: Option<TileCacheLayerHeader>,
    /// Header followed by the compressed cells
    pub data: Vec<u8>,
    meshed: bool,
    next: Option<usize>,
}

impl CompressedTile {
    /// Whether the tile has been materialized into the navmesh
    pub fn is_meshed(&self) -> bool {
        self.meshed
    }
}

/// Obstacle shape
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleData {
    /// Upright cylinder standing on `pos`
    Cylinder {
        pos: [f32; 3],
        radius: f32,
        height: f32,
    },
    /// Axis-aligned box
    Box { bmin: [f32; 3], bmax: [f32; 3] },
}

impl ObstacleData {
    /// World bounds of the shape
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        match self {
            ObstacleData::Cylinder {
                pos,
                radius,
                height,
            } => (
                [pos[0] - radius, pos[1], pos[2] - radius],
                [pos[0] + radius, pos[1] + height, pos[2] + radius],
            ),
            ObstacleData::Box { bmin, bmax } => (*bmin, *bmax),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            ObstacleData::Cylinder {
                pos,
                radius,
                height,
            } => {
                recast_common::vis_finite(pos)
                    && radius.is_finite()
                    && *radius > 0.0
                    && height.is_finite()
                    && *height > 0.0
            }
            ObstacleData::Box { bmin, bmax } => {
                recast_common::vis_finite(bmin)
                    && recast_common::vis_finite(bmax)
                    && (0..3).all(|i| bmin[i] <= bmax[i])
            }
        }
    }
}

/// Obstacle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum ObstacleState {
    /// Free slot
    Empty,
    /// Added; touched tiles are waiting for a rebuild
    Processing,
    /// Applied to every touched tile
    Processed,
    /// Removed; touched tiles are waiting for a rebuild
    Removing,
}

/// Obstacle in the tile cache
#[derive(Debug, Clone)]
pub struct Obstacle {
    pub data: ObstacleData,
    pub state: ObstacleState,
    /// Reuse counter of the slot, never zero
    pub salt: u16,
    /// Tiles overlapped by the obstacle
    pub touched: Vec<CompressedTileRef>,
    /// Touched tiles not rebuilt since the last state change
    pub pending: Vec<CompressedTileRef>,
    next: Option<usize>,
}

/// Tile cache structure
pub struct TileCache {
    params: TileCacheParams,
    tiles: Vec<CompressedTile>,
    next_free: Option<usize>,
    /// Tile slots per grid column
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
    obstacles: Vec<Obstacle>,
    next_free_obstacle: Option<usize>,
    /// Dirty tiles in FIFO order
    update_queue: VecDeque<CompressedTileRef>,
    builder: TileCacheBuilder,
    mesh_process: Option<Box<dyn TileCacheMeshProcess>>,
}

impl fmt::Debug for TileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileCache")
            .field("params", &self.params)
            .field("tile_count", &self.tile_count())
            .field("obstacle_count", &self.obstacle_count())
            .field("queued", &self.update_queue.len())
            .finish()
    }
}

impl TileCache {
    /// Creates an empty tile cache
    pub fn new(params: TileCacheParams) -> Result<Self> {
        params.validate()?;

        let max_tiles = params.max_tiles as usize;
        let mut tiles = vec![CompressedTile::default(); max_tiles];
        for (i, tile) in tiles.iter_mut().enumerate() {
            tile.salt = 1;
            tile.next = (i + 1 < max_tiles).then_some(i + 1);
        }

        let max_obstacles = params.max_obstacles as usize;
        let obstacles = (0..max_obstacles)
            .map(|i| Obstacle {
                data: ObstacleData::Box {
                    bmin: [0.0; 3],
                    bmax: [0.0; 3],
                },
                state: ObstacleState::Empty,
                salt: 1,
                touched: Vec::new(),
                pending: Vec::new(),
                next: (i + 1 < max_obstacles).then_some(i + 1),
            })
            .collect();

        Ok(Self {
            builder: TileCacheBuilder::new(&params),
            params,
            tiles,
            next_free: (max_tiles > 0).then_some(0),
            pos_lookup: HashMap::new(),
            obstacles,
            next_free_obstacle: (max_obstacles > 0).then_some(0),
            update_queue: VecDeque::new(),
            mesh_process: None,
        })
    }

    /// Sets the hook run on every tile before it enters the navmesh
    pub fn set_mesh_process(&mut self, process: Box<dyn TileCacheMeshProcess>) {
        self.mesh_process = Some(process);
    }

    pub fn params(&self) -> &TileCacheParams {
        &self.params
    }

    /// Number of occupied tile slots
    pub fn tile_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.header.is_some()).count()
    }

    fn encode_tile_ref(&self, index: usize) -> CompressedTileRef {
        (self.tiles[index].salt << REF_SALT_SHIFT) | index as u32
    }

    fn decode_tile_ref(&self, tile_ref: CompressedTileRef) -> Option<usize> {
        let index = (tile_ref & REF_INDEX_MASK) as usize;
        let tile = self.tiles.get(index)?;
        (tile.header.is_some() && tile.salt == tile_ref >> REF_SALT_SHIFT).then_some(index)
    }

    /// Occupied tiles with their references, in slot order
    pub fn tiles(&self) -> impl Iterator<Item = (CompressedTileRef, &CompressedTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| t.header.is_some() && !t.data.is_empty())
            .map(|(i, t)| (self.encode_tile_ref(i), t))
    }

    pub fn tile_by_ref(&self, tile_ref: CompressedTileRef) -> Option<&CompressedTile> {
        self.decode_tile_ref(tile_ref).map(|i| &self.tiles[i])
    }

    /// References of every layer cached at grid column `(tx, ty)`
    pub fn tiles_at(&self, tx: i32, ty: i32) -> Vec<CompressedTileRef> {
        self.pos_lookup
            .get(&(tx, ty))
            .map(|slots| slots.iter().map(|&i| self.encode_tile_ref(i)).collect())
            .unwrap_or_default()
    }

    pub fn tile_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<CompressedTileRef> {
        self.index_at(tx, ty, tlayer).map(|i| self.encode_tile_ref(i))
    }

    fn index_at(&self, tx: i32, ty: i32, tlayer: i32) -> Option<usize> {
        self.pos_lookup.get(&(tx, ty))?.iter().copied().find(|&i| {
            self.tiles[i]
                .header
                .as_ref()
                .is_some_and(|h| h.tlayer == tlayer)
        })
    }

    /// Lifecycle state of the tile at `(tx, ty, tlayer)` as far as the cache knows
    pub fn tile_state(&self, tx: i32, ty: i32, tlayer: i32) -> TileState {
        match self.index_at(tx, ty, tlayer) {
            Some(i) if self.tiles[i].meshed => TileState::Meshed,
            Some(_) => TileState::Cached,
            None => TileState::Unqueued,
        }
    }

    /// Inserts a compressed tile
    ///
    /// Fails with `AlreadyExists` when the location is taken; the cached
    /// tile is kept.
    pub fn add_tile(&mut self, data: Vec<u8>) -> Result<CompressedTileRef> {
        let header = TileCacheLayerHeader::from_bytes(&data)?;
        if self.index_at(header.tx, header.ty, header.tlayer).is_some() {
            return Err(Error::Detour(Status::AlreadyExists.to_string()));
        }
        let index = self
            .next_free
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;

        let tile = &mut self.tiles[index];
        self.next_free = tile.next.take();
        self.pos_lookup
            .entry((header.tx, header.ty))
            .or_default()
            .push(index);
        tile.header = Some(header);
        tile.data = data;
        tile.meshed = false;

        Ok(self.encode_tile_ref(index))
    }

    /// Removes a tile and returns its data
    ///
    /// Its navmesh tile, if any, is left to the caller.
    pub fn remove_tile(&mut self, tile_ref: CompressedTileRef) -> Result<Vec<u8>> {
        let index = self
            .decode_tile_ref(tile_ref)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;

        let tile = &mut self.tiles[index];
        let header = tile.header.take();
        let data = std::mem::take(&mut tile.data);
        tile.meshed = false;
        tile.salt = (tile.salt + 1) & REF_INDEX_MASK;
        if tile.salt == 0 {
            tile.salt = 1;
        }
        tile.next = self.next_free;
        self.next_free = Some(index);

        if let Some(h) = header {
            if let Some(slots) = self.pos_lookup.get_mut(&(h.tx, h.ty)) {
                slots.retain(|&i| i != index);
                if slots.is_empty() {
                    self.pos_lookup.remove(&(h.tx, h.ty));
                }
            }
        }
        self.update_queue.retain(|&r| r != tile_ref);
        for obstacle in &mut self.obstacles {
            obstacle.touched.retain(|&r| r != tile_ref);
            obstacle.pending.retain(|&r| r != tile_ref);
        }
        Ok(data)
    }

    /// Tiles whose bounds overlap `bmin..bmax`
    pub fn query_tiles(&self, bmin: &[f32; 3], bmax: &[f32; 3]) -> Vec<CompressedTileRef> {
        let tw = self.params.width as f32 * self.params.cs;
        let th = self.params.height as f32 * self.params.cs;
        let tx0 = ((bmin[0] - self.params.origin[0]) / tw).floor() as i32;
        let tx1 = ((bmax[0] - self.params.origin[0]) / tw).floor() as i32;
        let ty0 = ((bmin[2] - self.params.origin[2]) / th).floor() as i32;
        let ty1 = ((bmax[2] - self.params.origin[2]) / th).floor() as i32;

        let mut out = Vec::new();
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                let Some(slots) = self.pos_lookup.get(&(tx, ty)) else {
                    continue;
                };
                for &i in slots {
                    let Some(h) = self.tiles[i].header.as_ref() else {
                        continue;
                    };
                    let mut tmin = h.bmin;
                    let mut tmax = h.bmax;
                    tmin[1] -= self.params.ch;
                    tmax[1] += self.params.ch;
                    if overlap_bounds(bmin, bmax, &tmin, &tmax) {
                        out.push(self.encode_tile_ref(i));
                    }
                }
            }
        }
        out
    }

    fn queue_tile(&mut self, tile_ref: CompressedTileRef) {
        if !self.update_queue.contains(&tile_ref) {
            self.update_queue.push_back(tile_ref);
        }
    }

    /// Adds an upright cylinder obstacle standing on `pos`
    pub fn add_obstacle(&mut self, pos: [f32; 3], radius: f32, height: f32) -> Result<ObstacleRef> {
        self.insert_obstacle(ObstacleData::Cylinder {
            pos,
            radius,
            height,
        })
    }

    /// Adds an axis-aligned box obstacle
    pub fn add_box_obstacle(&mut self, bmin: [f32; 3], bmax: [f32; 3]) -> Result<ObstacleRef> {
        self.insert_obstacle(ObstacleData::Box { bmin, bmax })
    }

    fn insert_obstacle(&mut self, data: ObstacleData) -> Result<ObstacleRef> {
        if !data.is_valid() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let index = self
            .next_free_obstacle
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;

        let (bmin, bmax) = data.bounds();
        let touched = self.query_tiles(&bmin, &bmax);
        for &r in &touched {
            self.queue_tile(r);
        }

        let obstacle = &mut self.obstacles[index];
        self.next_free_obstacle = obstacle.next.take();
        obstacle.data = data;
        obstacle.state = ObstacleState::Processing;
        obstacle.pending = touched.clone();
        obstacle.touched = touched;

        log::debug!(
            "obstacle {index} added, {} tiles queued",
            obstacle.touched.len()
        );
        Ok((u32::from(obstacle.salt) << REF_SALT_SHIFT) | index as u32)
    }

    fn decode_obstacle_ref(&self, obstacle_ref: ObstacleRef) -> Option<usize> {
        let index = (obstacle_ref & REF_INDEX_MASK) as usize;
        let obstacle = self.obstacles.get(index)?;
        (obstacle.state != ObstacleState::Empty
            && u32::from(obstacle.salt) == obstacle_ref >> REF_SALT_SHIFT)
            .then_some(index)
    }

    pub fn obstacle_by_ref(&self, obstacle_ref: ObstacleRef) -> Option<&Obstacle> {
        self.decode_obstacle_ref(obstacle_ref)
            .map(|i| &self.obstacles[i])
    }

    /// References of all obstacles that are not being removed
    pub fn obstacle_refs(&self) -> Vec<ObstacleRef> {
        self.obstacles
            .iter()
            .enumerate()
            .filter(|(_, o)| {
                matches!(
                    o.state,
                    ObstacleState::Processing | ObstacleState::Processed
                )
            })
            .map(|(i, o)| (u32::from(o.salt) << REF_SALT_SHIFT) | i as u32)
            .collect()
    }

    /// Number of occupied obstacle slots, including ones being removed
    pub fn obstacle_count(&self) -> usize {
        self.obstacles
            .iter()
            .filter(|o| o.state != ObstacleState::Empty)
            .count()
    }

    /// Removes an obstacle; its slot is freed once its tiles are rebuilt
    pub fn remove_obstacle(&mut self, obstacle_ref: ObstacleRef) -> Result<()> {
        let index = self
            .decode_obstacle_ref(obstacle_ref)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        if self.obstacles[index].state == ObstacleState::Removing {
            return Ok(());
        }

        let touched = self.obstacles[index].touched.clone();
        for &r in &touched {
            self.queue_tile(r);
        }
        let obstacle = &mut self.obstacles[index];
        obstacle.state = ObstacleState::Removing;
        obstacle.pending = touched;
        Ok(())
    }

    /// Whether no tile is waiting for a rebuild
    pub fn is_up_to_date(&self) -> bool {
        self.update_queue.is_empty()
    }

    /// Rebuilds up to [`MAX_UPDATE_TILES_PER_STEP`] queued tiles, oldest first
    ///
    /// Returns `true` when the queue is empty afterwards. A failed tile is
    /// logged and dequeued; the first failure is returned after the batch.
    pub fn update(&mut self, nav_mesh: &mut NavMesh) -> Result<bool> {
        let mut first_error = None;

        for _ in 0..MAX_UPDATE_TILES_PER_STEP {
            let Some(tile_ref) = self.update_queue.pop_front() else {
                break;
            };
            if let Err(e) = self.build_nav_mesh_tile(tile_ref, nav_mesh) {
                log::warn!("rebuilding tile {tile_ref:#x} failed: {e}");
                first_error.get_or_insert(e);
            }
            for obstacle in &mut self.obstacles {
                if matches!(
                    obstacle.state,
                    ObstacleState::Processing | ObstacleState::Removing
                ) {
                    obstacle.pending.retain(|&r| r != tile_ref);
                }
            }
        }
        self.settle_obstacles();

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.update_queue.is_empty()),
        }
    }

    /// Advances obstacles whose pending tiles have all been rebuilt
    fn settle_obstacles(&mut self) {
        for index in 0..self.obstacles.len() {
            let obstacle = &mut self.obstacles[index];
            if !obstacle.pending.is_empty() {
                continue;
            }
            match obstacle.state {
                ObstacleState::Processing => obstacle.state = ObstacleState::Processed,
                ObstacleState::Removing => {
                    obstacle.state = ObstacleState::Empty;
                    obstacle.touched.clear();
                    obstacle.salt = obstacle.salt.wrapping_add(1).max(1);
                    obstacle.next = self.next_free_obstacle;
                    self.next_free_obstacle = Some(index);
                }
                _ => {}
            }
        }
    }

    /// Rebuilds the navmesh tile of a cached layer, replacing any tile
    /// already at that location
    ///
    /// On failure the previous navmesh tile is gone as well and the layer
    /// reports [`TileState::Cached`] until a later rebuild succeeds.
    pub fn build_nav_mesh_tile(
        &mut self,
        tile_ref: CompressedTileRef,
        nav_mesh: &mut NavMesh,
    ) -> Result<()> {
        let index = self
            .decode_tile_ref(tile_ref)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        let (tx, ty, tlayer) = match &self.tiles[index].header {
            Some(h) => (h.tx, h.ty, h.tlayer),
            None => return Err(Error::Detour(Status::InvalidParam.to_string())),
        };

        self.tiles[index].meshed = false;
        let built = self.build_mesh_tile(index, tile_ref);
        if let Some(old) = nav_mesh.tile_ref_at(tx, ty, tlayer) {
            nav_mesh.remove_tile(old)?;
        }
        if let Some(tile) = built? {
            nav_mesh.add_tile(tile)?;
        }
        self.tiles[index].meshed = true;
        Ok(())
    }

    /// Meshes a cached layer with its obstacles; `None` when nothing is
    /// walkable
    fn build_mesh_tile(&self, index: usize, tile_ref: CompressedTileRef) -> Result<Option<MeshTile>> {
        let mut layer = TileCacheLayer::decompress(&self.tiles[index].data)?;
        let obstacles = self
            .obstacles
            .iter()
            .filter(|o| {
                matches!(
                    o.state,
                    ObstacleState::Processing | ObstacleState::Processed
                ) && o.touched.contains(&tile_ref)
            })
            .map(|o| &o.data);
        self.builder.mark_obstacles(&mut layer, obstacles);

        let Some(mut params) = self.builder.build_params(&layer)? else {
            return Ok(None);
        };
        if let Some(process) = &self.mesh_process {
            process.process(&mut params);
        }
        NavMeshBuilder::build_tile(&params).map(Some)
    }

    /// Builds every cached layer of grid column `(tx, ty)`
    pub fn build_nav_mesh_tiles_at(&mut self, tx: i32, ty: i32, nav_mesh: &mut NavMesh) -> Result<()> {
        for tile_ref in self.tiles_at(tx, ty) {
            self.build_nav_mesh_tile(tile_ref, nav_mesh)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile_cache_data::{TILECACHE_MAGIC, TILECACHE_VERSION};
    use detour::NavMeshParams;

    fn flat_tile_data(tx: i32, ty: i32) -> Vec<u8> {
        let layer = TileCacheLayer {
            header: TileCacheLayerHeader {
                magic: TILECACHE_MAGIC,
                version: TILECACHE_VERSION,
                tx,
                ty,
                tlayer: 0,
                bmin: [tx as f32 * 8.0, 0.0, ty as f32 * 8.0],
                bmax: [tx as f32 * 8.0 + 8.0, 0.0, ty as f32 * 8.0 + 8.0],
                hmin: 0,
                hmax: 0,
                width: 8,
                height: 8,
                minx: 0,
                maxx: 7,
                miny: 0,
                maxy: 7,
            },
            heights: vec![0; 64],
            areas: vec![63; 64],
        };
        layer.compress().unwrap()
    }

    fn cache() -> TileCache {
        TileCache::new(TileCacheParams {
            cs: 1.0,
            ch: 0.5,
            width: 8,
            height: 8,
            walkable_climb: 0.5,
            max_tiles: 16,
            max_obstacles: 4,
            ..TileCacheParams::default()
        })
        .unwrap()
    }

    fn nav_mesh() -> NavMesh {
        NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 8.0,
            tile_height: 8.0,
            max_tiles: 16,
            max_polys_per_tile: 256,
        })
        .unwrap()
    }

    #[test]
    fn test_params_blob_round_trip() {
        let params = cache().params().clone();
        let bytes = params.to_bytes();
        assert_eq!(bytes.len(), TileCacheParams::SERIALIZED_SIZE);
        assert_eq!(TileCacheParams::from_bytes(&bytes).unwrap(), params);
    }

    #[test]
    fn test_invalid_params() {
        assert!(TileCache::new(TileCacheParams {
            cs: 0.0,
            ..TileCacheParams::default()
        })
        .is_err());
        assert!(TileCache::new(TileCacheParams {
            max_tiles: 0,
            ..TileCacheParams::default()
        })
        .is_err());
    }

    #[test]
    fn test_duplicate_tile_keeps_first() {
        let mut tc = cache();
        let first = tc.add_tile(flat_tile_data(0, 0)).unwrap();
        let err = tc.add_tile(flat_tile_data(0, 0)).unwrap_err();
        assert!(err.to_string().contains(&Status::AlreadyExists.to_string()));
        assert_eq!(tc.tile_count(), 1);
        assert_eq!(tc.tile_at(0, 0, 0), Some(first));
    }

    #[test]
    fn test_tile_state_follows_meshing() {
        let mut tc = cache();
        let mut mesh = nav_mesh();
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Unqueued);
        let r = tc.add_tile(flat_tile_data(0, 0)).unwrap();
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Cached);
        tc.build_nav_mesh_tile(r, &mut mesh).unwrap();
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Meshed);

        // Rebuilding replaces the tile instead of duplicating it
        tc.build_nav_mesh_tile(r, &mut mesh).unwrap();
        assert_eq!(mesh.tile_count(), 1);

        tc.remove_tile(r).unwrap();
        assert!(tc.tile_by_ref(r).is_none());
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Unqueued);
    }

    #[test]
    fn test_failed_rebuild_leaves_tile_unmeshed() {
        let mut tc = cache();
        // Room for the single open rectangle, not for the ring around a hole
        let mut mesh = NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: 8.0,
            tile_height: 8.0,
            max_tiles: 16,
            max_polys_per_tile: 2,
        })
        .unwrap();
        let r = tc.add_tile(flat_tile_data(0, 0)).unwrap();
        tc.build_nav_mesh_tile(r, &mut mesh).unwrap();
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Meshed);

        let ob = tc.add_obstacle([4.0, 0.0, 4.0], 1.5, 2.0).unwrap();
        assert!(tc.update(&mut mesh).is_err());
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Cached);
        assert!(!tc.tile_by_ref(r).unwrap().is_meshed());
        assert_eq!(mesh.tile_count(), 0);
        assert!(mesh.tile_at(0, 0, 0).is_none());

        // Recovers once the obstacle is gone
        tc.remove_obstacle(ob).unwrap();
        assert!(tc.update(&mut mesh).unwrap());
        assert_eq!(tc.tile_state(0, 0, 0), TileState::Meshed);
        assert_eq!(mesh.tile_count(), 1);
    }

    #[test]
    fn test_obstacle_lifecycle() {
        let mut tc = cache();
        let mut mesh = nav_mesh();
        for (x, y) in [(0, 0), (1, 0)] {
            let r = tc.add_tile(flat_tile_data(x, y)).unwrap();
            tc.build_nav_mesh_tile(r, &mut mesh).unwrap();
        }
        let polys_before = mesh.tile_at(0, 0, 0).unwrap().ground_poly_count();

        // Straddles both tiles
        let ob = tc.add_obstacle([8.0, 0.0, 4.0], 1.0, 2.0).unwrap();
        assert_eq!(tc.obstacle_by_ref(ob).unwrap().state, ObstacleState::Processing);
        assert_eq!(tc.obstacle_by_ref(ob).unwrap().touched.len(), 2);
        assert!(!tc.is_up_to_date());

        assert!(tc.update(&mut mesh).unwrap());
        assert_eq!(tc.obstacle_by_ref(ob).unwrap().state, ObstacleState::Processed);
        assert!(mesh.tile_at(0, 0, 0).unwrap().ground_poly_count() > polys_before);

        tc.remove_obstacle(ob).unwrap();
        assert_eq!(tc.obstacle_by_ref(ob).unwrap().state, ObstacleState::Removing);
        assert!(tc.update(&mut mesh).unwrap());
        assert!(tc.obstacle_by_ref(ob).is_none());
        assert_eq!(tc.obstacle_count(), 0);
        assert_eq!(
            mesh.tile_at(0, 0, 0).unwrap().ground_poly_count(),
            polys_before
        );

        // The freed slot comes back under a new salt
        let again = tc.add_box_obstacle([1.0, 0.0, 1.0], [2.0, 1.0, 2.0]).unwrap();
        assert_ne!(again, ob);
        assert_eq!(again & REF_INDEX_MASK, ob & REF_INDEX_MASK);
    }

    #[test]
    fn test_obstacle_table_full_and_invalid_shapes() {
        let mut tc = cache();
        for i in 0..4 {
            tc.add_obstacle([i as f32, 0.0, 0.0], 0.5, 1.0).unwrap();
        }
        assert!(tc.add_obstacle([0.0; 3], 0.5, 1.0).is_err());
        assert!(tc.remove_obstacle(0xdead_0000).is_err());

        let mut tc = cache();
        assert!(tc.add_obstacle([0.0; 3], -1.0, 1.0).is_err());
        assert!(tc.add_box_obstacle([1.0; 3], [0.0; 3]).is_err());
        assert_eq!(tc.obstacle_count(), 0);
    }

    #[test]
    fn test_update_budget_is_bounded() {
        let mut tc = cache();
        let mut mesh = nav_mesh();
        for y in 0..4 {
            for x in 0..3 {
                tc.add_tile(flat_tile_data(x, y)).unwrap();
            }
        }
        // Covers all 12 tiles
        tc.add_box_obstacle([1.0, -1.0, 1.0], [23.0, 1.0, 31.0]).unwrap();
        assert!(!tc.update(&mut mesh).unwrap());
        assert_eq!(mesh.tile_count(), MAX_UPDATE_TILES_PER_STEP);
        assert!(tc.update(&mut mesh).unwrap());
        assert_eq!(mesh.tile_count(), 12);
    }
}
