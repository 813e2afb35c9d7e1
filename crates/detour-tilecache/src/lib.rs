//! Compressed layer cache and dynamic obstacles for Detour navigation meshes
//!
//! Each tile of the world is kept as one or more compressed heightfield
//! layers. Obstacles are applied when a layer is rebuilt, so adding or
//! removing one only touches the tiles it overlaps.
//!
//! # Example
//!
//! ```rust,ignore
//! use detour_tilecache::{TileCache, TileCacheParams};
//!
//! let mut cache = TileCache::new(TileCacheParams::default())?;
//! for data in compressed_layers {
//!     cache.add_tile(data)?;
//! }
//!
//! let obstacle = cache.add_obstacle([10.0, 0.0, 10.0], 2.0, 4.0)?;
//! while !cache.update(&mut nav_mesh)? {}
//!
//! cache.remove_obstacle(obstacle)?;
//! while !cache.update(&mut nav_mesh)? {}
//! ```
//!
//! # Architecture
//!
//! - [`TileCache`]: tile table, obstacle table and rebuild queue
//! - [`TileCacheBuilder`]: turns a layer into navmesh tile parameters
//! - [`TileCacheLayer`]: decompressed layer cells

pub mod tile_cache;
pub mod tile_cache_builder;
pub mod tile_cache_data;

pub use tile_cache::*;
pub use tile_cache_builder::*;
pub use tile_cache_data::*;
