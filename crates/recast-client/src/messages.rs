//! JSON message payloads exchanged with callers

use detour_crowd::{AgentParams, CrowdAgent, CrowdAgentState, MoveRequestState, UpdateFlags};
use recast::{LogEntry, LogLevel};
use recast_common::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Parses a JSON message
pub fn from_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Serializes a JSON message
pub fn to_json<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))
}

/// Parameters for adding or updating a crowd agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentParameters {
    pub radius: f32,
    pub height: f32,
    pub max_acceleration: f32,
    pub max_speed: f32,
    pub collision_query_range: f32,
    pub path_optimization_range: f32,
    pub separation_weight: f32,
    /// Bit set of the crowd update flags
    pub update_flags: u8,
    /// Avoidance preset, 0 (low) to 3 (high)
    pub obstacle_avoidance_type: u8,
    pub query_filter_type: u8,
    /// Spawn position, used by AddAgent only
    pub initial_position: [f32; 3],
}

impl Default for AgentParameters {
    fn default() -> Self {
        let params = AgentParams::default();
        Self {
            radius: params.radius,
            height: params.height,
            max_acceleration: params.max_acceleration,
            max_speed: params.max_speed,
            collision_query_range: params.collision_query_range,
            path_optimization_range: params.path_optimization_range,
            separation_weight: params.separation_weight,
            update_flags: params.update_flags.bits(),
            obstacle_avoidance_type: params.obstacle_avoidance_type,
            query_filter_type: params.query_filter_type,
            initial_position: [0.0; 3],
        }
    }
}

impl AgentParameters {
    pub fn to_agent_params(&self) -> AgentParams {
        AgentParams {
            radius: self.radius,
            height: self.height,
            max_acceleration: self.max_acceleration,
            max_speed: self.max_speed,
            collision_query_range: self.collision_query_range,
            path_optimization_range: self.path_optimization_range,
            separation_weight: self.separation_weight,
            update_flags: UpdateFlags::from_bits(self.update_flags),
            obstacle_avoidance_type: self.obstacle_avoidance_type,
            query_filter_type: self.query_filter_type,
        }
    }
}

/// Movement state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Invalid,
    Walking,
    OffMesh,
}

impl From<CrowdAgentState> for AgentState {
    fn from(state: CrowdAgentState) -> Self {
        match state {
            CrowdAgentState::Invalid => AgentState::Invalid,
            CrowdAgentState::Walking => AgentState::Walking,
            CrowdAgentState::OffMesh => AgentState::OffMesh,
        }
    }
}

/// Progress of an agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
    Arrived,
}

impl From<MoveRequestState> for TargetState {
    fn from(state: MoveRequestState) -> Self {
        match state {
            MoveRequestState::None => TargetState::None,
            MoveRequestState::Failed => TargetState::Failed,
            MoveRequestState::Valid => TargetState::Valid,
            MoveRequestState::Requesting => TargetState::Requesting,
            MoveRequestState::WaitingForQueue => TargetState::WaitingForQueue,
            MoveRequestState::WaitingForPath => TargetState::WaitingForPath,
            MoveRequestState::Velocity => TargetState::Velocity,
            MoveRequestState::Arrived => TargetState::Arrived,
        }
    }
}

/// Kinematics of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: i32,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub desired_velocity: [f32; 3],
    pub target_position: [f32; 3],
    pub target_state: TargetState,
    pub state: AgentState,
    pub partial: bool,
}

impl AgentInfo {
    pub fn from_agent(id: i32, agent: &CrowdAgent) -> Self {
        Self {
            id,
            position: agent.get_pos(),
            velocity: agent.get_vel(),
            desired_velocity: agent.get_desired_vel(),
            target_position: agent.get_target_pos(),
            target_state: agent.get_target_state().into(),
            state: agent.get_state().into(),
            partial: agent.is_partial(),
        }
    }
}

/// Result of a path query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathInfo {
    /// Polygon corridor from start to end
    pub path_refs: Vec<u32>,
    /// Smoothed polyline as flat xyz triples, when requested
    pub path_details: Vec<f32>,
}

/// Triangulated polygons of one navmesh tile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugTile {
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    /// The tile's vertex positions
    pub vertices: Vec<[f32; 3]>,
    /// Indices into `vertices`
    pub triangles: Vec<[u32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DebugOffMeshConnection {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub radius: f32,
    pub bidirectional: bool,
}

/// Geometry export for visualization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugNavMesh {
    pub tiles: Vec<DebugTile>,
    pub off_mesh_connections: Vec<DebugOffMeshConnection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub level: String,
    pub message: String,
}

/// Build context log of a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildLog {
    pub entries: Vec<BuildLogEntry>,
}

impl BuildLog {
    pub fn from_entries(entries: &[LogEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| BuildLogEntry {
                level: match e.level {
                    LogLevel::Debug => "debug",
                    LogLevel::Progress => "progress",
                    LogLevel::Warning => "warning",
                    LogLevel::Error => "error",
                }
                .to_string(),
                message: e.message.clone(),
            })
            .collect();
        Self { entries }
    }
}
