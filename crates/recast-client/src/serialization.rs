//! Persisted navmesh bundle
//!
//! A bundle holds the navmesh parameters, the tile cache parameters and the
//! compressed layer of every cached tile. Tiles are written in the cache's
//! slot order, which is not stable across rebuilds.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use detour::{NavMeshParams, Status};
use detour_tilecache::{TileCache, TileCacheParams};
use recast_common::{Error, Result};
use std::io::{Cursor, Read};

/// Bundle magic number ('NVTB')
pub const BUNDLE_MAGIC: u32 = 0x4254_564E;
pub const BUNDLE_VERSION: u32 = 1;

/// One persisted compressed tile
#[derive(Debug, Clone, PartialEq)]
pub struct BundleTile {
    /// Cache reference at save time, informational only
    pub tile_ref: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshBundle {
    pub nav_mesh_params: NavMeshParams,
    pub tile_cache_params: TileCacheParams,
    pub tiles: Vec<BundleTile>,
}

impl NavMeshBundle {
    /// Collects every cached tile with a header and data
    pub fn from_tile_cache(nav_mesh_params: NavMeshParams, cache: &TileCache) -> Self {
        let tiles = cache
            .tiles()
            .filter(|(_, tile)| tile.header.is_some() && !tile.data.is_empty())
            .map(|(tile_ref, tile)| BundleTile {
                tile_ref: u64::from(tile_ref),
                data: tile.data.clone(),
            })
            .collect();
        Self {
            nav_mesh_params,
            tile_cache_params: cache.params().clone(),
            tiles,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tile_count = u32::try_from(self.tiles.len())
            .map_err(|_| Error::Serialization("too many tiles".to_string()))?;

        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(BUNDLE_MAGIC)?;
        out.write_u32::<LittleEndian>(BUNDLE_VERSION)?;
        out.write_u32::<LittleEndian>(tile_count)?;
        write_blob(&mut out, &self.nav_mesh_params.to_bytes())?;
        write_blob(&mut out, &self.tile_cache_params.to_bytes())?;
        for tile in &self.tiles {
            out.write_u64::<LittleEndian>(tile.tile_ref)?;
            write_blob(&mut out, &tile.data)?;
        }
        Ok(out)
    }

    /// Parses a bundle
    ///
    /// A bad header fails. A truncated tile entry ends the tile list and the
    /// tiles before it are kept.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(data);
        let magic = c.read_u32::<LittleEndian>()?;
        if magic != BUNDLE_MAGIC {
            return Err(Error::Detour(Status::WrongMagic.to_string()));
        }
        let version = c.read_u32::<LittleEndian>()?;
        if version != BUNDLE_VERSION {
            return Err(Error::Detour(Status::WrongVersion.to_string()));
        }
        let tile_count = c.read_u32::<LittleEndian>()?;
        let nav_mesh_params = NavMeshParams::from_bytes(&read_blob(&mut c)?)?;
        let tile_cache_params = TileCacheParams::from_bytes(&read_blob(&mut c)?)?;

        let mut tiles = Vec::new();
        for i in 0..tile_count {
            let entry = c
                .read_u64::<LittleEndian>()
                .map_err(Error::from)
                .and_then(|tile_ref| Ok((tile_ref, read_blob(&mut c)?)));
            match entry {
                Ok((tile_ref, data)) => tiles.push(BundleTile { tile_ref, data }),
                Err(e) => {
                    log::warn!("bundle truncated at tile {i} of {tile_count}: {e}");
                    break;
                }
            }
        }

        Ok(Self {
            nav_mesh_params,
            tile_cache_params,
            tiles,
        })
    }
}

fn write_blob(out: &mut Vec<u8>, blob: &[u8]) -> Result<()> {
    let len = u32::try_from(blob.len())
        .map_err(|_| Error::Serialization(format!("blob of {} bytes is too large", blob.len())))?;
    out.write_u32::<LittleEndian>(len)?;
    out.extend_from_slice(blob);
    Ok(())
}

fn read_blob(c: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = c.read_u32::<LittleEndian>()? as usize;
    let remaining = c.get_ref().len().saturating_sub(c.position() as usize);
    if len > remaining {
        return Err(Error::Serialization(format!(
            "blob of {len} bytes overruns the {remaining} remaining"
        )));
    }
    let mut blob = vec![0u8; len];
    c.read_exact(&mut blob)?;
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(tile_count: usize) -> NavMeshBundle {
        NavMeshBundle {
            nav_mesh_params: NavMeshParams {
                origin: [0.0; 3],
                tile_width: 14.4,
                tile_height: 14.4,
                max_tiles: 256,
                max_polys_per_tile: 16384,
            },
            tile_cache_params: TileCacheParams::default(),
            tiles: (0..tile_count)
                .map(|i| BundleTile {
                    tile_ref: i as u64 + 1,
                    data: vec![i as u8; 10 + i],
                })
                .collect(),
        }
    }

    #[test]
    fn test_bundle_round_trip() {
        let original = bundle(3);
        let bytes = original.to_bytes().unwrap();
        assert_eq!(NavMeshBundle::from_bytes(&bytes).unwrap(), original);
    }

    #[test]
    fn test_truncated_tile_is_skipped() {
        let original = bundle(3);
        let bytes = original.to_bytes().unwrap();
        // Cut into the payload of the last tile
        let parsed = NavMeshBundle::from_bytes(&bytes[..bytes.len() - 4]).unwrap();
        assert_eq!(parsed.tiles.len(), 2);
        assert_eq!(parsed.tiles[..], original.tiles[..2]);
    }

    #[test]
    fn test_bad_header_fails() {
        let mut bytes = bundle(1).to_bytes().unwrap();
        assert!(NavMeshBundle::from_bytes(&bytes[..6]).is_err());
        // Truncated inside the parameter blobs
        assert!(NavMeshBundle::from_bytes(&bytes[..20]).is_err());
        bytes[0] ^= 0xff;
        assert!(NavMeshBundle::from_bytes(&bytes).is_err());
    }
}
