//! Triangulated navmesh export for visualization

use detour::nav_mesh::OFFMESH_CON_BIDIR;
use detour::{NavMesh, PolyFlags, PolyType};

use crate::messages::{DebugNavMesh, DebugOffMeshConnection, DebugTile};

/// Polygons carrying any of these flags are left out by default
pub const DEFAULT_EXCLUDE_FLAGS: PolyFlags = PolyFlags::DISABLED;

/// Fans every ground polygon of every tile into triangles
///
/// Polygons whose flags intersect `exclude` are skipped. Off-mesh
/// connections are listed with their world-space endpoints.
pub fn export_nav_mesh(nav_mesh: &NavMesh, exclude: PolyFlags) -> DebugNavMesh {
    let mut out = DebugNavMesh::default();

    for (_, tile) in nav_mesh.tiles() {
        let Some(header) = tile.header.as_ref() else {
            continue;
        };

        let mut triangles = Vec::new();
        for poly in &tile.polys {
            if poly.poly_type != PolyType::Ground || poly.flags.intersects(exclude) {
                continue;
            }
            let verts = &poly.verts[..usize::from(poly.vert_count)];
            for j in 2..verts.len() {
                triangles.push([
                    u32::from(verts[0]),
                    u32::from(verts[j - 1]),
                    u32::from(verts[j]),
                ]);
            }
        }

        out.tiles.push(DebugTile {
            tile_x: header.x,
            tile_y: header.y,
            tile_layer: header.layer,
            vertices: tile
                .verts
                .chunks_exact(3)
                .map(|v| [v[0], v[1], v[2]])
                .collect(),
            triangles,
        });

        for con in &tile.off_mesh_connections {
            let excluded = tile
                .polys
                .get(usize::from(con.poly))
                .is_some_and(|p| p.flags.intersects(exclude));
            if excluded {
                continue;
            }
            out.off_mesh_connections.push(DebugOffMeshConnection {
                start: con.start(),
                end: con.end(),
                radius: con.rad,
                bidirectional: con.flags & OFFMESH_CON_BIDIR != 0,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::flat_nav_mesh;

    #[test]
    fn test_quads_fan_into_two_triangles() {
        let mesh = flat_nav_mesh();
        let debug = export_nav_mesh(&mesh, DEFAULT_EXCLUDE_FLAGS);
        assert_eq!(debug.tiles.len(), 1);
        let tile = &debug.tiles[0];
        assert_eq!(tile.vertices.len(), 9);
        assert_eq!(tile.triangles.len(), 8);
        assert!(tile
            .triangles
            .iter()
            .flatten()
            .all(|&i| (i as usize) < tile.vertices.len()));
        assert!(debug.off_mesh_connections.is_empty());
    }

    #[test]
    fn test_disabled_polys_are_omitted() {
        let mut mesh = flat_nav_mesh();
        let query = detour::NavMeshQuery::new(&mesh);
        let (reference, _) = query
            .find_nearest_poly(&[2.5, 0.0, 2.5], &[1.0, 1.0, 1.0], &detour::QueryFilter::default())
            .unwrap();
        drop(query);
        mesh.set_poly_flags(reference, PolyFlags::WALK | PolyFlags::DISABLED)
            .unwrap();

        let debug = export_nav_mesh(&mesh, DEFAULT_EXCLUDE_FLAGS);
        assert_eq!(debug.tiles[0].triangles.len(), 6);
        let everything = export_nav_mesh(&mesh, PolyFlags::EMPTY);
        assert_eq!(everything.tiles[0].triangles.len(), 8);
    }
}
