//! Build and runtime settings loaded from JSON

use recast_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Region partitioning scheme requested for the voxel build
///
/// The layer pipeline always partitions by heightfield layers; the value is
/// kept so settings round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionType {
    #[default]
    Watershed,
    Monotone,
    Layers,
}

/// Explicit world bounds overriding the input geometry's box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// Settings for one client instance
///
/// Missing JSON fields take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecastSettings {
    pub cell_size: f32,
    pub cell_height: f32,
    pub agent_height: f32,
    pub agent_radius: f32,
    pub agent_max_climb: f32,
    /// Degrees
    pub agent_max_slope: f32,
    pub region_min_size: f32,
    pub region_merge_size: f32,
    pub edge_max_len: f32,
    pub edge_max_error: f32,
    pub verts_per_poly: i32,
    pub detail_sample_dist: f32,
    pub detail_sample_max_error: f32,
    /// Tile side in cells
    pub tile_size: i32,
    pub max_obstacles: i32,
    pub max_agents: usize,
    pub world_bounds: Option<WorldBounds>,
    pub random_seed: u64,
    pub partition_type: PartitionType,
    pub filter_low_hanging_obstacles: bool,
    pub filter_ledge_spans: bool,
    pub filter_walkable_low_height_spans: bool,
}

impl Default for RecastSettings {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0,
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            tile_size: 48,
            max_obstacles: 2048,
            max_agents: 1000,
            world_bounds: None,
            random_seed: 0x5EED,
            partition_type: PartitionType::Watershed,
            filter_low_hanging_obstacles: true,
            filter_ledge_spans: true,
            filter_walkable_low_height_spans: true,
        }
    }
}

impl RecastSettings {
    /// Parses settings from JSON bytes
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(format!("invalid settings: {e}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
