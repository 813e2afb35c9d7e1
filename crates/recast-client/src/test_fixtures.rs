//! Procedural geometry shared by the client tests

use std::fmt::Write as _;
use std::path::PathBuf;

use detour::{
    NavMesh, NavMeshBuilder, NavMeshCreateParams, NavMeshParams, PolyFlags, DT_EXT_LINK,
    MESH_NULL_IDX,
};
use tempfile::TempDir;

use crate::settings::{RecastSettings, WorldBounds};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// OBJ text for a set of axis-aligned quads `(x0, z0, x1, z1, y)`
pub fn quads_obj(quads: &[(f32, f32, f32, f32, f32)]) -> String {
    let mut obj = String::new();
    for (i, &(x0, z0, x1, z1, y)) in quads.iter().enumerate() {
        let _ = writeln!(obj, "v {x0} {y} {z0}");
        let _ = writeln!(obj, "v {x0} {y} {z1}");
        let _ = writeln!(obj, "v {x1} {y} {z1}");
        let _ = writeln!(obj, "v {x1} {y} {z0}");
        let b = i * 4 + 1;
        let _ = writeln!(obj, "f {} {} {}", b, b + 1, b + 2);
        let _ = writeln!(obj, "f {} {} {}", b, b + 2, b + 3);
    }
    obj
}

/// A flat square of side `size` at y = 0
pub fn flat_plane_obj(size: f32) -> String {
    quads_obj(&[(0.0, 0.0, size, size, 0.0)])
}

/// A ground plane with a raised deck over its middle third, high enough
/// to walk underneath
pub fn two_level_obj(size: f32, deck_height: f32) -> String {
    let third = size / 3.0;
    quads_obj(&[
        (0.0, 0.0, size, size, 0.0),
        (third, 0.0, third * 2.0, size, deck_height),
    ])
}

/// A flat square of side `size` with a square hole of side `hole` in the
/// middle
pub fn plane_with_hole_obj(size: f32, hole: f32) -> String {
    let a = (size - hole) / 2.0;
    let b = a + hole;
    quads_obj(&[
        (0.0, 0.0, size, a, 0.0),
        (0.0, b, size, size, 0.0),
        (0.0, a, a, b, 0.0),
        (b, a, size, b, 0.0),
    ])
}

/// Writes `obj` to a fresh temporary directory
pub fn write_obj(obj: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh.obj");
    std::fs::write(&path, obj).unwrap();
    (dir, path)
}

/// Settings sized for small test worlds
pub fn small_world_settings(size: f32) -> RecastSettings {
    RecastSettings {
        cell_size: 0.5,
        cell_height: 0.2,
        agent_radius: 0.5,
        tile_size: 32,
        max_agents: 8,
        world_bounds: Some(WorldBounds {
            min: [0.0, -1.0, 0.0],
            max: [size, 6.0, size],
        }),
        ..RecastSettings::default()
    }
}

/// One flat 10 x 10 tile split into 2 x 2 polygons
pub fn flat_nav_mesh() -> NavMesh {
    let nvp = 6;
    let mut verts = Vec::new();
    for iz in 0..3 {
        for ix in 0..3 {
            verts.extend_from_slice(&[ix as f32 * 5.0, 0.0, iz as f32 * 5.0]);
        }
    }
    let v = |ix: u16, iz: u16| iz * 3 + ix;
    let border = |on: bool, side: u16| if on { DT_EXT_LINK | side } else { MESH_NULL_IDX };

    let mut polys = Vec::new();
    for qz in 0..2u16 {
        for qx in 0..2u16 {
            let mut entry = vec![MESH_NULL_IDX; nvp * 2];
            entry[..4].copy_from_slice(&[v(qx, qz), v(qx, qz + 1), v(qx + 1, qz + 1), v(qx + 1, qz)]);
            entry[nvp] = border(qx == 0, 4);
            entry[nvp + 1] = border(qz == 1, 2);
            entry[nvp + 2] = border(qx == 1, 0);
            entry[nvp + 3] = border(qz == 0, 6);
            polys.extend_from_slice(&entry);
        }
    }

    let params = NavMeshCreateParams {
        vert_count: 9,
        verts,
        polys,
        poly_flags: vec![PolyFlags::WALK; 4],
        poly_areas: vec![0; 4],
        poly_count: 4,
        nvp,
        bmin: [0.0, -1.0, 0.0],
        bmax: [10.0, 1.0, 10.0],
        walkable_height: 2.0,
        walkable_radius: 0.5,
        walkable_climb: 0.5,
        ..NavMeshCreateParams::default()
    };
    let mut mesh = NavMesh::new(NavMeshParams {
        origin: [0.0; 3],
        tile_width: 10.0,
        tile_height: 10.0,
        max_tiles: 4,
        max_polys_per_tile: 64,
    })
    .unwrap();
    mesh.add_tile(NavMeshBuilder::build_tile(&params).unwrap())
        .unwrap();
    mesh
}
