//! Detour: tiled polygon navigation mesh and path queries
//!
//! A [`NavMesh`] is a grid of tiles, each holding convex polygons and
//! optional off-mesh connections. Polygons are linked to each other inside
//! a tile and across tile borders. [`NavMeshQuery`] runs spatial and path
//! queries against a borrowed mesh.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use recast_common::{Error, Result};
use std::io::Cursor;

pub mod nav_mesh;
pub mod nav_mesh_builder;
pub mod nav_mesh_query;
mod status;

#[cfg(test)]
mod detour_multi_tile_tests;
#[cfg(test)]
mod test_mesh_helpers;

pub use nav_mesh::{Link, MeshTile, NavMesh, OffMeshConnection, Poly, TileHeader, TileRef};
pub use nav_mesh_builder::{NavMeshBuilder, NavMeshCreateParams};
pub use nav_mesh_query::{NavMeshQuery, StraightPath, StraightPathFlags, DEFAULT_MAX_NODES};
pub use status::Status;

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Edge flag marking a portal to a neighbouring tile; the low bits hold the side
pub const DT_EXT_LINK: u16 = 0x8000;

/// Vertex slot marker for unused polygon vertices
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Number of area ids addressable by a [`QueryFilter`]
pub const MAX_AREAS: usize = 64;

/// Reference to a polygon: salt, tile index and polygon index packed into 32 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u32);

impl PolyRef {
    /// Creates a new polygon reference
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Gets the raw id
    pub const fn id(&self) -> u32 {
        self.0
    }

    /// Checks if the reference is non-null
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<PolyRef> for u32 {
    fn from(r: PolyRef) -> Self {
        r.0
    }
}

/// Polygon ability flags, matched against [`QueryFilter`] include/exclude masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyFlags(u16);

impl PolyFlags {
    pub const EMPTY: PolyFlags = PolyFlags(0);
    /// Ability to walk (ground, grass, road)
    pub const WALK: PolyFlags = PolyFlags(0x01);
    /// Ability to swim (water)
    pub const SWIM: PolyFlags = PolyFlags(0x02);
    /// Ability to move through doors
    pub const DOOR: PolyFlags = PolyFlags(0x04);
    /// Ability to jump
    pub const JUMP: PolyFlags = PolyFlags(0x08);
    /// Disabled polygon
    pub const DISABLED: PolyFlags = PolyFlags(0x10);
    /// All abilities
    pub const ALL: PolyFlags = PolyFlags(0xffff);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// All bits of `other` are set
    pub const fn contains(&self, other: PolyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    pub const fn intersects(&self, other: PolyFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: PolyFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PolyFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PolyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Polygon kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Convex ground polygon
    #[default]
    Ground,
    /// Two-vertex polygon standing for an off-mesh connection
    OffMeshConnection,
}

/// Navigation mesh initialization parameters
///
/// `max_tiles` and `max_polys_per_tile` determine how many bits of a
/// [`PolyRef`] go to the tile and polygon indices.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World-space origin of the tile grid
    pub origin: [f32; 3],
    /// Tile width along x in world units
    pub tile_width: f32,
    /// Tile depth along z in world units
    pub tile_height: f32,
    pub max_tiles: u32,
    pub max_polys_per_tile: u32,
}

impl NavMeshParams {
    /// Size of the serialized form in bytes
    pub const SERIALIZED_SIZE: usize = 28;

    /// Serializes the parameters as a little-endian blob
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SERIALIZED_SIZE);
        for v in self.origin {
            out.write_f32::<LittleEndian>(v).ok();
        }
        out.write_f32::<LittleEndian>(self.tile_width).ok();
        out.write_f32::<LittleEndian>(self.tile_height).ok();
        out.write_u32::<LittleEndian>(self.max_tiles).ok();
        out.write_u32::<LittleEndian>(self.max_polys_per_tile).ok();
        out
    }

    /// Parses a blob written by [`NavMeshParams::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SERIALIZED_SIZE {
            return Err(Error::Serialization(format!(
                "navmesh params blob is {} bytes, expected {}",
                data.len(),
                Self::SERIALIZED_SIZE
            )));
        }
        let mut cursor = Cursor::new(data);
        let mut origin = [0.0; 3];
        for v in &mut origin {
            *v = cursor.read_f32::<LittleEndian>()?;
        }
        Ok(Self {
            origin,
            tile_width: cursor.read_f32::<LittleEndian>()?,
            tile_height: cursor.read_f32::<LittleEndian>()?,
            max_tiles: cursor.read_u32::<LittleEndian>()?,
            max_polys_per_tile: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Polygon filter and traversal costs for queries
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons with any of these flags are rejected
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area id
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::ALL,
            exclude_flags: PolyFlags::EMPTY,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    /// Checks whether a polygon with `flags` may be visited
    #[inline]
    pub fn pass_filter(&self, flags: PolyFlags) -> bool {
        flags.intersects(self.include_flags) && !flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across a polygon of `area`
    #[inline]
    pub fn get_cost(&self, pa: &[f32; 3], pb: &[f32; 3], area: u8) -> f32 {
        let cost = self.area_cost.get(area as usize).copied().unwrap_or(1.0);
        recast_common::vdist(pa, pb) * cost
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_blob_round_trip() {
        let params = NavMeshParams {
            origin: [1.0, -2.0, 3.5],
            tile_width: 14.4,
            tile_height: 14.4,
            max_tiles: 256,
            max_polys_per_tile: 16384,
        };
        let bytes = params.to_bytes();
        assert_eq!(bytes.len(), NavMeshParams::SERIALIZED_SIZE);
        assert_eq!(NavMeshParams::from_bytes(&bytes).unwrap(), params);
        assert!(NavMeshParams::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_filter_flags() {
        let filter = QueryFilter {
            include_flags: PolyFlags::WALK | PolyFlags::SWIM,
            exclude_flags: PolyFlags::DISABLED,
            ..QueryFilter::default()
        };
        assert!(filter.pass_filter(PolyFlags::WALK));
        assert!(!filter.pass_filter(PolyFlags::WALK | PolyFlags::DISABLED));
        assert!(!filter.pass_filter(PolyFlags::JUMP));
    }
}
