//! Compressed tile cache layer format
//!
//! A compressed tile is a fixed little-endian header followed by an LZ4
//! block holding the per-cell heights and area ids. The header stays
//! uncompressed so the cache can place a tile without decompressing it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use detour::Status;
use recast::{HeightfieldLayer, LAYER_EMPTY_HEIGHT, NULL_AREA};
use recast_common::{Error, Result};
use std::io::{Cursor, Read};

/// Magic number for tile cache data ('TILE')
pub const TILECACHE_MAGIC: u32 = 0x4C49_4554;

/// Version number for tile cache data format
pub const TILECACHE_VERSION: u32 = 1;

/// Tile cache layer header
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileCacheLayerHeader {
    pub magic: u32,
    pub version: u32,
    /// Tile grid position
    pub tx: i32,
    pub ty: i32,
    pub tlayer: i32,
    /// World bounds of the layer; `bmin.y` is the floor of height 0
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Height range in cells
    pub hmin: u16,
    pub hmax: u16,
    /// Grid size in cells
    pub width: u16,
    pub height: u16,
    /// Bounds of the used cells
    pub minx: u16,
    pub maxx: u16,
    pub miny: u16,
    pub maxy: u16,
}

impl TileCacheLayerHeader {
    /// Size of the serialized header in bytes
    pub const SIZE: usize = 60;

    /// Checks the magic and version
    pub fn validate(&self) -> Result<()> {
        if self.magic != TILECACHE_MAGIC {
            return Err(Error::Detour(Status::WrongMagic.to_string()));
        }
        if self.version != TILECACHE_VERSION {
            return Err(Error::Detour(Status::WrongVersion.to_string()));
        }
        Ok(())
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<LittleEndian>(self.magic)?;
        out.write_u32::<LittleEndian>(self.version)?;
        out.write_i32::<LittleEndian>(self.tx)?;
        out.write_i32::<LittleEndian>(self.ty)?;
        out.write_i32::<LittleEndian>(self.tlayer)?;
        for v in self.bmin.iter().chain(&self.bmax) {
            out.write_f32::<LittleEndian>(*v)?;
        }
        for v in [
            self.hmin, self.hmax, self.width, self.height, self.minx, self.maxx, self.miny,
            self.maxy,
        ] {
            out.write_u16::<LittleEndian>(v)?;
        }
        Ok(())
    }

    /// Reads the header at the start of a compressed tile
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }
        let mut c = Cursor::new(data);
        let magic = c.read_u32::<LittleEndian>()?;
        let version = c.read_u32::<LittleEndian>()?;
        let tx = c.read_i32::<LittleEndian>()?;
        let ty = c.read_i32::<LittleEndian>()?;
        let tlayer = c.read_i32::<LittleEndian>()?;
        let mut bmin = [0.0; 3];
        let mut bmax = [0.0; 3];
        for v in bmin.iter_mut().chain(bmax.iter_mut()) {
            *v = c.read_f32::<LittleEndian>()?;
        }
        let mut small = [0u16; 8];
        for v in &mut small {
            *v = c.read_u16::<LittleEndian>()?;
        }
        let [hmin, hmax, width, height, minx, maxx, miny, maxy] = small;
        let header = Self {
            magic,
            version,
            tx,
            ty,
            tlayer,
            bmin,
            bmax,
            hmin,
            hmax,
            width,
            height,
            minx,
            maxx,
            miny,
            maxy,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Decompressed tile cache layer
#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheLayer {
    pub header: TileCacheLayerHeader,
    /// Floor height per cell relative to `header.bmin.y`, or [`LAYER_EMPTY_HEIGHT`]
    pub heights: Vec<u16>,
    /// Area id per cell
    pub areas: Vec<u8>,
}

impl TileCacheLayer {
    /// Wraps a heightfield layer for tile `(tx, ty)`
    pub fn from_heightfield_layer(
        layer: &HeightfieldLayer,
        tx: i32,
        ty: i32,
        tlayer: i32,
    ) -> Result<Self> {
        let dim = |v: i32| {
            u16::try_from(v).map_err(|_| Error::Detour(Status::InvalidParam.to_string()))
        };
        let header = TileCacheLayerHeader {
            magic: TILECACHE_MAGIC,
            version: TILECACHE_VERSION,
            tx,
            ty,
            tlayer,
            bmin: layer.bmin.to_array(),
            bmax: layer.bmax.to_array(),
            hmin: layer.hmin,
            hmax: layer.hmax,
            width: dim(layer.width)?,
            height: dim(layer.height)?,
            minx: dim(layer.minx)?,
            maxx: dim(layer.maxx)?,
            miny: dim(layer.miny)?,
            maxy: dim(layer.maxy)?,
        };
        Ok(Self {
            header,
            heights: layer.heights.clone(),
            areas: layer.areas.clone(),
        })
    }

    pub fn width(&self) -> i32 {
        i32::from(self.header.width)
    }

    pub fn height(&self) -> i32 {
        i32::from(self.header.height)
    }

    /// Floor height and area of cell `(x, z)` if it is walkable
    pub fn cell(&self, x: i32, z: i32) -> Option<(u16, u8)> {
        if x < 0 || z < 0 || x >= self.width() || z >= self.height() {
            return None;
        }
        let idx = (x + z * self.width()) as usize;
        let h = self.heights[idx];
        (h != LAYER_EMPTY_HEIGHT && self.areas[idx] != NULL_AREA).then_some((h, self.areas[idx]))
    }

    /// Serializes the header and compresses the cell data
    pub fn compress(&self) -> Result<Vec<u8>> {
        let cells = self.heights.len();
        if self.areas.len() != cells
            || cells != usize::from(self.header.width) * usize::from(self.header.height)
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let mut payload = Vec::with_capacity(cells * 3);
        for &h in &self.heights {
            payload.write_u16::<LittleEndian>(h)?;
        }
        payload.extend_from_slice(&self.areas);

        let mut out = Vec::with_capacity(TileCacheLayerHeader::SIZE + cells);
        self.header.write(&mut out)?;
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));
        Ok(out)
    }

    /// Decompresses a tile written by [`TileCacheLayer::compress`]
    pub fn decompress(data: &[u8]) -> Result<Self> {
        let header = TileCacheLayerHeader::from_bytes(data)?;
        let payload = lz4_flex::decompress_size_prepended(&data[TileCacheLayerHeader::SIZE..])
            .map_err(|e| Error::Serialization(format!("tile layer decompression failed: {e}")))?;

        let cells = usize::from(header.width) * usize::from(header.height);
        if payload.len() != cells * 3 {
            return Err(Error::Detour(Status::DataCorrupted.to_string()));
        }
        let mut c = Cursor::new(&payload);
        let mut heights = Vec::with_capacity(cells);
        for _ in 0..cells {
            heights.push(c.read_u16::<LittleEndian>()?);
        }
        let mut areas = vec![0u8; cells];
        c.read_exact(&mut areas)?;

        Ok(Self {
            header,
            heights,
            areas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> TileCacheLayer {
        let mut heights = vec![3u16; 16];
        heights[5] = LAYER_EMPTY_HEIGHT;
        TileCacheLayer {
            header: TileCacheLayerHeader {
                magic: TILECACHE_MAGIC,
                version: TILECACHE_VERSION,
                tx: 2,
                ty: -1,
                tlayer: 1,
                bmin: [0.0, 1.0, 0.0],
                bmax: [4.0, 1.5, 4.0],
                hmin: 5,
                hmax: 8,
                width: 4,
                height: 4,
                minx: 0,
                maxx: 3,
                miny: 0,
                maxy: 3,
            },
            heights,
            areas: vec![63; 16],
        }
    }

    #[test]
    fn test_compressed_layer_keeps_cells() {
        let original = layer();
        let data = original.compress().unwrap();
        let header = TileCacheLayerHeader::from_bytes(&data).unwrap();
        assert_eq!((header.tx, header.ty, header.tlayer), (2, -1, 1));

        let restored = TileCacheLayer::decompress(&data).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.cell(1, 1), None);
        assert_eq!(restored.cell(2, 1), Some((3, 63)));
    }

    #[test]
    fn test_corrupt_data_rejected() {
        let mut data = layer().compress().unwrap();
        data[0] ^= 0xff;
        assert!(TileCacheLayer::decompress(&data).is_err());

        let data = layer().compress().unwrap();
        assert!(TileCacheLayer::decompress(&data[..TileCacheLayerHeader::SIZE + 2]).is_err());
        assert!(TileCacheLayerHeader::from_bytes(&data[..10]).is_err());
    }
}
