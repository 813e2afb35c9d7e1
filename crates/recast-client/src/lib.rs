//! Navigation runtime built on the Recast and Detour crates
//!
//! A [`RecastClient`] turns world geometry into a tiled navigation mesh,
//! keeps the compressed tile layers in a cache so that dynamic obstacles
//! can rebuild single tiles, simulates a crowd of agents and answers path
//! queries with optional smoothing. An [`AreaLayerRegistry`] holds any
//! number of independent clients addressed by `(area, layer)`.
//!
//! # Example
//!
//! ```rust,ignore
//! use recast_client::{AreaLayerRegistry, BuildSource};
//!
//! let mut registry = AreaLayerRegistry::new();
//! registry.configure(1, 1)?;
//! registry.initialize(0, 0, true)?;
//! registry.build(0, 0, &BuildSource::Path("world.obj".into()), false)?;
//!
//! let door = registry.add_obstacle(0, 0, [12.0, 0.0, 4.0], 1.0, 2.0)?;
//! loop {
//!     registry.update(0, 0, 1.0 / 30.0)?;
//! }
//! ```

pub mod build_config;
pub mod client;
pub mod crowd_manager;
pub mod debug_mesh;
pub mod input_geom;
pub mod messages;
pub mod path_service;
pub mod registry;
pub mod serialization;
pub mod settings;
pub mod solo;
pub mod tile_raster;
pub mod tiled;

#[cfg(test)]
mod test_fixtures;
#[cfg(test)]
mod obstacle_tests;

pub use build_config::{BuildConfig, TileLayout};
pub use client::{BuildPipeline, RecastClient};
pub use crowd_manager::{CrowdManager, POOL_EXHAUSTED};
pub use input_geom::{BuildSource, InputGeom, OffMeshLink};
pub use registry::AreaLayerRegistry;
pub use serialization::NavMeshBundle;
pub use settings::{RecastSettings, WorldBounds};
