//! Navigation mesh builder for creating tiles from polygon data
//!
//! The builder turns flat polygon arrays into a [`MeshTile`] ready for
//! [`NavMesh::add_tile`](crate::NavMesh::add_tile). Links are not created
//! here; the mesh links a tile when it is added.

use super::nav_mesh::{OffMeshConnection, OFFMESH_CON_BIDIR};
use super::{
    MeshTile, Poly, PolyFlags, PolyType, Status, TileHeader, DT_EXT_LINK, MAX_VERTS_PER_POLY,
    MESH_NULL_IDX,
};
use recast_common::{Error, Result};

/// Input for building one navigation mesh tile
#[derive(Debug, Clone, Default)]
pub struct NavMeshCreateParams {
    /// Vertex positions [x,y,z,...] in world units
    pub verts: Vec<f32>,
    pub vert_count: usize,
    /// `poly_count * nvp * 2` entries: `nvp` vertex indices padded with
    /// [`MESH_NULL_IDX`], then `nvp` edge flags (`DT_EXT_LINK | side` on tile
    /// borders, [`MESH_NULL_IDX`] otherwise)
    pub polys: Vec<u16>,
    pub poly_flags: Vec<PolyFlags>,
    pub poly_areas: Vec<u8>,
    pub poly_count: usize,
    /// Maximum vertices per polygon in `polys`
    pub nvp: usize,

    /// Off-mesh connection endpoints [sx,sy,sz,ex,ey,ez,...]
    pub off_mesh_con_verts: Vec<f32>,
    pub off_mesh_con_rad: Vec<f32>,
    pub off_mesh_con_flags: Vec<PolyFlags>,
    pub off_mesh_con_areas: Vec<u8>,
    /// [`OFFMESH_CON_BIDIR`] for two-way connections
    pub off_mesh_con_dir: Vec<u8>,
    pub off_mesh_con_user_id: Vec<u32>,
    pub off_mesh_con_count: usize,

    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
}

/// Builder for creating navigation mesh tiles from polygon data
pub struct NavMeshBuilder;

impl NavMeshBuilder {
    /// Builds an unlinked tile
    pub fn build_tile(params: &NavMeshCreateParams) -> Result<MeshTile> {
        Self::validate_params(params)?;

        // Only connections starting inside this tile belong to it
        let stored_cons: Vec<usize> = (0..params.off_mesh_con_count)
            .filter(|&i| {
                let p = &params.off_mesh_con_verts[i * 6..i * 6 + 3];
                p[0] >= params.bmin[0]
                    && p[0] <= params.bmax[0]
                    && p[2] >= params.bmin[2]
                    && p[2] <= params.bmax[2]
            })
            .collect();

        let mut tile = MeshTile::new();
        tile.header = Some(TileHeader {
            bmin: params.bmin,
            bmax: params.bmax,
            walkable_height: params.walkable_height,
            walkable_radius: params.walkable_radius,
            walkable_climb: params.walkable_climb,
            poly_count: params.poly_count + stored_cons.len(),
            vert_count: params.vert_count + stored_cons.len() * 2,
            off_mesh_con_count: stored_cons.len(),
            ..TileHeader::new(params.tile_x, params.tile_y, params.tile_layer)
        });

        tile.verts = params.verts[..params.vert_count * 3].to_vec();
        tile.polys = Self::build_polygons(params)?;

        for &i in &stored_cons {
            let base_vert = (tile.verts.len() / 3) as u16;
            let pos: [f32; 6] = std::array::from_fn(|k| params.off_mesh_con_verts[i * 6 + k]);
            tile.verts.extend_from_slice(&pos);

            let flags = params
                .off_mesh_con_flags
                .get(i)
                .copied()
                .unwrap_or(PolyFlags::JUMP);
            let area = params.off_mesh_con_areas.get(i).copied().unwrap_or(0);
            let mut poly = Poly::new(area, PolyType::OffMeshConnection, flags);
            poly.verts[0] = base_vert;
            poly.verts[1] = base_vert + 1;
            poly.vert_count = 2;

            let poly_index = tile.polys.len() as u16;
            tile.polys.push(poly);
            tile.off_mesh_connections.push(OffMeshConnection {
                pos,
                rad: params.off_mesh_con_rad.get(i).copied().unwrap_or(0.0),
                poly: poly_index,
                flags: params
                    .off_mesh_con_dir
                    .get(i)
                    .copied()
                    .unwrap_or(0)
                    & OFFMESH_CON_BIDIR,
                user_id: params.off_mesh_con_user_id.get(i).copied().unwrap_or(0),
            });
        }

        Ok(tile)
    }

    fn validate_params(params: &NavMeshCreateParams) -> Result<()> {
        if params.nvp < 3 || params.nvp > MAX_VERTS_PER_POLY {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        if params.poly_count == 0 && params.off_mesh_con_count == 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        if params.vert_count >= MESH_NULL_IDX as usize
            || params.verts.len() < params.vert_count * 3
            || params.polys.len() != params.poly_count * params.nvp * 2
            || params.off_mesh_con_verts.len() < params.off_mesh_con_count * 6
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok(())
    }

    fn build_polygons(params: &NavMeshCreateParams) -> Result<Vec<Poly>> {
        let nvp = params.nvp;
        let mut polys = Vec::with_capacity(params.poly_count);

        for i in 0..params.poly_count {
            let area = params.poly_areas.get(i).copied().unwrap_or(0);
            let flags = params.poly_flags.get(i).copied().unwrap_or(PolyFlags::WALK);
            let mut poly = Poly::new(area, PolyType::Ground, flags);

            let src = &params.polys[i * nvp * 2..(i + 1) * nvp * 2];
            for j in 0..nvp {
                let v = src[j];
                if v == MESH_NULL_IDX {
                    break;
                }
                if v as usize >= params.vert_count {
                    return Err(Error::Detour(Status::InvalidParam.to_string()));
                }
                poly.verts[j] = v;
                let edge = src[nvp + j];
                poly.neis[j] = if edge != MESH_NULL_IDX && edge & DT_EXT_LINK != 0 {
                    edge
                } else {
                    0
                };
                poly.vert_count += 1;
            }
            if poly.vert_count < 3 {
                return Err(Error::Detour(Status::InvalidParam.to_string()));
            }
            polys.push(poly);
        }
        Ok(polys)
    }
}
