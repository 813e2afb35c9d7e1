//! Multi-agent crowd simulation on navigation meshes
//!
//! Agents follow path corridors over a shared Detour mesh, steer around
//! each other with sampled velocity obstacles and keep clear of walls.
//!
//! # Example
//!
//! ```rust,ignore
//! use detour_crowd::{AgentParams, Crowd};
//!
//! let mut crowd = Crowd::new(128, 0.6)?;
//! let agent = crowd.add_agent(&nav_mesh, &start_pos, &AgentParams::default())?;
//! crowd.request_move_target(agent, target_poly, &target_pos)?;
//!
//! loop {
//!     crowd.update(1.0 / 30.0, &nav_mesh)?;
//! }
//! ```
//!
//! # Architecture
//!
//! - [`Crowd`]: agent pool, path request queue and the update loop
//! - [`PathCorridor`]: the polygon corridor an agent follows
//! - [`LocalBoundary`]: nearby wall segments
//! - [`ObstacleAvoidanceQuery`]: velocity sampling against neighbours and walls
//! - [`ProximityGrid`]: spatial hash for neighbour lookups

pub mod crowd;
pub mod local_boundary;
pub mod obstacle_avoidance;
pub mod path_corridor;
pub mod proximity_grid;

pub use crowd::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use proximity_grid::*;

#[cfg(test)]
mod crowd_tests;
