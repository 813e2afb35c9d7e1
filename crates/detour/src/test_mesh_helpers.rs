//! Small flat meshes shared by the unit tests

use crate::nav_mesh_builder::NavMeshBuilder;
use crate::{
    MeshTile, NavMesh, NavMeshCreateParams, NavMeshParams, PolyFlags, DT_EXT_LINK, MESH_NULL_IDX,
};

/// Side of a tile grid cell in the test meshes
pub const TILE_SIZE: f32 = 4.0;

pub fn grid_params(max_tiles: u32, max_polys: u32) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0; 3],
        tile_width: TILE_SIZE,
        tile_height: TILE_SIZE,
        max_tiles,
        max_polys_per_tile: max_polys,
    }
}

/// A flat tile at grid cell `(tx, ty)` split into 2x2 square polygons
///
/// Outer edges carry portal flags toward the side they face.
pub fn quad_params(tx: i32, ty: i32, size: f32) -> NavMeshCreateParams {
    let nvp = 6;
    let ox = tx as f32 * size;
    let oz = ty as f32 * size;
    let half = size / 2.0;

    let mut verts = Vec::with_capacity(27);
    for iz in 0..3 {
        for ix in 0..3 {
            verts.extend_from_slice(&[ox + ix as f32 * half, 0.0, oz + iz as f32 * half]);
        }
    }
    let v = |ix: u16, iz: u16| iz * 3 + ix;

    let mut polys = Vec::with_capacity(4 * nvp * 2);
    for qz in 0..2u16 {
        for qx in 0..2u16 {
            let (x0, x1, z0, z1) = (qx, qx + 1, qz, qz + 1);
            let mut entry = vec![MESH_NULL_IDX; nvp * 2];
            entry[..4].copy_from_slice(&[v(x0, z0), v(x0, z1), v(x1, z1), v(x1, z0)]);
            let border = |on_border: bool, side: u16| {
                if on_border {
                    DT_EXT_LINK | side
                } else {
                    MESH_NULL_IDX
                }
            };
            entry[nvp] = border(x0 == 0, 4);
            entry[nvp + 1] = border(z1 == 2, 2);
            entry[nvp + 2] = border(x1 == 2, 0);
            entry[nvp + 3] = border(z0 == 0, 6);
            polys.extend_from_slice(&entry);
        }
    }

    NavMeshCreateParams {
        verts,
        vert_count: 9,
        polys,
        poly_flags: vec![PolyFlags::WALK; 4],
        poly_areas: vec![0; 4],
        poly_count: 4,
        nvp,
        tile_x: tx,
        tile_y: ty,
        tile_layer: 0,
        bmin: [ox, -1.0, oz],
        bmax: [ox + size, 1.0, oz + size],
        walkable_height: 2.0,
        walkable_radius: 0.5,
        walkable_climb: 0.5,
        ..NavMeshCreateParams::default()
    }
}

pub fn flat_tile(x: i32, y: i32, layer: i32) -> MeshTile {
    let mut params = quad_params(x, y, TILE_SIZE);
    params.tile_layer = layer;
    NavMeshBuilder::build_tile(&params).unwrap()
}

/// A mesh holding flat tiles at the given grid cells
pub fn flat_mesh(cells: &[(i32, i32)]) -> NavMesh {
    let mut mesh = NavMesh::new(grid_params(16, 64)).unwrap();
    for &(x, y) in cells {
        mesh.add_tile(flat_tile(x, y, 0)).unwrap();
    }
    mesh
}
