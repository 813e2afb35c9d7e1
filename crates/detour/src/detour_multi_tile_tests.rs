//! Queries across tile borders, off-mesh connections and tile replacement

use crate::nav_mesh::OFFMESH_CON_BIDIR;
use crate::test_mesh_helpers::{flat_mesh, flat_tile, quad_params, TILE_SIZE};
use crate::{
    NavMeshBuilder, NavMeshQuery, PolyFlags, PolyRef, PolyType, QueryFilter, Status,
    StraightPathFlags,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const EXT: [f32; 3] = [1.0, 2.0, 1.0];

fn nearest(query: &NavMeshQuery, pos: [f32; 3]) -> PolyRef {
    let (r, _) = query
        .find_nearest_poly(&pos, &EXT, &QueryFilter::default())
        .unwrap();
    assert!(r.is_valid(), "no polygon near {pos:?}");
    r
}

#[test]
fn test_path_crosses_tile_border() {
    let mesh = flat_mesh(&[(0, 0), (1, 0)]);
    let mut query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();

    let start = [1.0, 0.0, 1.0];
    let end = [7.0, 0.0, 3.0];
    let start_ref = nearest(&query, start);
    let end_ref = nearest(&query, end);

    let (path, status) = query
        .find_path(start_ref, end_ref, &start, &end, &filter, 256)
        .unwrap();
    assert_eq!(status, Status::Success);
    assert_eq!(path.first(), Some(&start_ref));
    assert_eq!(path.last(), Some(&end_ref));
    assert!(path.len() >= 3);

    let straight = query.find_straight_path(&start, &end, &path, 32).unwrap();
    // Open ground: start and end only
    assert_eq!(straight.len(), 2);
    assert!(straight.flags[0].contains(StraightPathFlags::START));
    assert!(straight.flags[1].contains(StraightPathFlags::END));
    assert!((straight.points[1][0] - end[0]).abs() < 1e-4);
}

#[test]
fn test_funnel_turns_around_missing_tile() {
    // L-shaped corridor: (0,0) -> (1,0) -> (1,1)
    let mesh = flat_mesh(&[(0, 0), (1, 0), (1, 1)]);
    let mut query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();

    let start = [1.0, 0.0, 1.0];
    let end = [5.0, 0.0, 7.0];
    let (path, status) = query
        .find_path(nearest(&query, start), nearest(&query, end), &start, &end, &filter, 256)
        .unwrap();
    assert_eq!(status, Status::Success);

    let straight = query.find_straight_path(&start, &end, &path, 32).unwrap();
    assert_eq!(straight.len(), 3);
    let corner = straight.points[1];
    assert!((corner[0] - TILE_SIZE).abs() < 1e-3 && (corner[2] - TILE_SIZE).abs() < 1e-3);
}

#[test]
fn test_removed_tile_breaks_path_until_readded() {
    let mut mesh = flat_mesh(&[(0, 0), (1, 0), (2, 0)]);
    let filter = QueryFilter::default();
    let start = [1.0, 0.0, 2.0];
    let end = [11.0, 0.0, 2.0];

    let middle = mesh.tile_ref_at(1, 0, 0).unwrap();
    mesh.remove_tile(middle).unwrap();
    {
        let mut query = NavMeshQuery::new(&mesh);
        let (path, status) = query
            .find_path(nearest(&query, start), nearest(&query, end), &start, &end, &filter, 256)
            .unwrap();
        assert_eq!(status, Status::PartialResult);
        let (_, last_tile, _) = mesh.decode_poly_ref(*path.last().unwrap());
        let (_, first_tile, _) = mesh.decode_poly_ref(path[0]);
        assert_eq!(first_tile, last_tile);
    }

    mesh.add_tile(flat_tile(1, 0, 0)).unwrap();
    let mut query = NavMeshQuery::new(&mesh);
    let (_, status) = query
        .find_path(nearest(&query, start), nearest(&query, end), &start, &end, &filter, 256)
        .unwrap();
    assert_eq!(status, Status::Success);
}

#[test]
fn test_node_budget_yields_partial_path() {
    let mesh = flat_mesh(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
    let mut query = NavMeshQuery::with_max_nodes(&mesh, 3);
    let start = [1.0, 0.0, 1.0];
    let end = [15.0, 0.0, 1.0];
    let (path, status) = query
        .find_path(
            nearest(&query, start),
            nearest(&query, end),
            &start,
            &end,
            &QueryFilter::default(),
            256,
        )
        .unwrap();
    assert_eq!(status, Status::PartialResult);
    assert!(!path.is_empty() && path.len() <= 3);
}

#[test]
fn test_off_mesh_connection_bridges_diagonal_tiles() {
    let mut mesh = crate::NavMesh::new(crate::test_mesh_helpers::grid_params(16, 64)).unwrap();
    let mut params = quad_params(0, 0, TILE_SIZE);
    params.off_mesh_con_verts = vec![3.5, 0.0, 3.5, 4.5, 0.0, 4.5];
    params.off_mesh_con_rad = vec![0.6];
    params.off_mesh_con_dir = vec![0];
    params.off_mesh_con_flags = vec![PolyFlags::JUMP];
    params.off_mesh_con_count = 1;
    mesh.add_tile(NavMeshBuilder::build_tile(&params).unwrap()).unwrap();
    mesh.add_tile(flat_tile(1, 1, 0)).unwrap();

    let mut query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();
    let start = [1.0, 0.0, 1.0];
    let end = [6.0, 0.0, 6.0];
    let (path, status) = query
        .find_path(nearest(&query, start), nearest(&query, end), &start, &end, &filter, 256)
        .unwrap();
    assert_eq!(status, Status::Success);
    assert!(path.iter().any(|r| {
        mesh.get_tile_and_poly_by_ref(*r)
            .is_ok_and(|(_, p)| p.poly_type == PolyType::OffMeshConnection)
    }));

    let straight = query.find_straight_path(&start, &end, &path, 32).unwrap();
    assert!(straight
        .flags
        .iter()
        .any(|f| f.contains(StraightPathFlags::OFFMESH_CONNECTION)));

    // One-way: no way back
    let (_, back) = query
        .find_path(nearest(&query, end), nearest(&query, start), &end, &start, &filter, 256)
        .unwrap();
    assert_eq!(back, Status::PartialResult);

    // Excluding jump abilities disables the shortcut
    let no_jump = QueryFilter {
        include_flags: PolyFlags::WALK,
        ..QueryFilter::default()
    };
    let (_, status) = query
        .find_path(nearest(&query, start), nearest(&query, end), &start, &end, &no_jump, 256)
        .unwrap();
    assert_eq!(status, Status::PartialResult);

    // A two-way connection links back from the landing polygon
    let mut mesh = crate::NavMesh::new(crate::test_mesh_helpers::grid_params(16, 64)).unwrap();
    params.off_mesh_con_dir = vec![OFFMESH_CON_BIDIR];
    mesh.add_tile(NavMeshBuilder::build_tile(&params).unwrap()).unwrap();
    mesh.add_tile(flat_tile(1, 1, 0)).unwrap();
    let mut query = NavMeshQuery::new(&mesh);
    let (_, back) = query
        .find_path(nearest(&query, end), nearest(&query, start), &end, &start, &filter, 256)
        .unwrap();
    assert_eq!(back, Status::Success);
}

#[test]
fn test_move_along_surface_stops_at_wall() {
    let mesh = flat_mesh(&[(0, 0), (1, 0)]);
    let query = NavMeshQuery::new(&mesh);
    let start = [1.0, 0.0, 1.0];
    let start_ref = nearest(&query, start);

    let (pos, visited) = query
        .move_along_surface(start_ref, &start, &[6.0, 0.0, 1.0], &QueryFilter::default())
        .unwrap();
    assert!((pos[0] - 6.0).abs() < 1e-4);
    assert_eq!(visited[0], start_ref);
    assert!(visited.len() >= 2);

    let (pos, _) = query
        .move_along_surface(start_ref, &start, &[1.0, 0.0, -3.0], &QueryFilter::default())
        .unwrap();
    assert!(pos[2].abs() < 1e-4, "clamped to the -z border, got {pos:?}");
}

#[test]
fn test_raycast_reports_wall_hit() {
    let mesh = flat_mesh(&[(0, 0), (1, 0)]);
    let query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();
    let start = [1.0, 0.0, 1.5];
    let start_ref = nearest(&query, start);

    let (t, _, path) = query
        .raycast(start_ref, &start, &[7.0, 0.0, 1.5], &filter, 16)
        .unwrap();
    assert_eq!(t, f32::MAX);
    assert!(path.len() >= 2);

    let (t, normal, _) = query
        .raycast(start_ref, &start, &[13.0, 0.0, 1.5], &filter, 16)
        .unwrap();
    assert!((t - 7.0 / 12.0).abs() < 1e-3);
    assert!((normal[0] + 1.0).abs() < 1e-3);
}

#[test]
fn test_random_point_is_reachable_and_seeded() {
    let mesh = flat_mesh(&[(0, 0), (1, 0)]);
    let mut query = NavMeshQuery::new(&mesh);
    let filter = QueryFilter::default();
    let center = [4.0, 0.0, 2.0];
    let start_ref = nearest(&query, center);

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let (r1, p1) = query
        .find_random_point_around_circle(start_ref, &center, 3.0, &filter, &mut rng)
        .unwrap();
    assert!(mesh.is_valid_poly_ref(r1));
    assert!((0.0..=8.0).contains(&p1[0]) && (0.0..=4.0).contains(&p1[2]));

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let (r2, p2) = query
        .find_random_point_around_circle(start_ref, &center, 3.0, &filter, &mut rng)
        .unwrap();
    assert_eq!((r1, p1), (r2, p2));
}

#[test]
fn test_wall_segments_of_border_polygon() {
    let mesh = flat_mesh(&[(0, 0)]);
    let query = NavMeshQuery::new(&mesh);
    let r = nearest(&query, [1.0, 0.0, 1.0]);
    let walls = query.get_poly_wall_segments(r, &QueryFilter::default()).unwrap();
    // Corner polygon: -x and -z edges face nothing
    assert_eq!(walls.len(), 2);
}
