//! Obstacle-driven tile rebuilds

use detour::NavMesh;
use recast_common::Result;

use crate::client::RecastClient;
use crate::input_geom::BuildSource;
use crate::test_fixtures::{flat_plane_obj, init_logging, small_world_settings};

const EXT: [f32; 3] = [0.2, 2.0, 0.2];

fn flat_client(size: f32) -> Result<RecastClient> {
    init_logging();
    let mut client = RecastClient::with_settings(true, small_world_settings(size))?;
    client.build(&BuildSource::ObjBytes(flat_plane_obj(size).into_bytes()), false)?;
    Ok(client)
}

/// Polygon count of every navmesh tile, keyed by grid location
fn poly_counts(mesh: &NavMesh) -> Vec<((i32, i32, i32), usize)> {
    let mut counts: Vec<_> = mesh
        .tiles()
        .filter_map(|(_, t)| {
            t.header
                .as_ref()
                .map(|h| ((h.x, h.y, h.layer), t.polys.len()))
        })
        .collect();
    counts.sort();
    counts
}

fn drain(client: &mut RecastClient) -> Result<usize> {
    let mut steps = 1;
    while !client.update(0.0)? {
        steps += 1;
        assert!(steps < 100, "rebuild queue never drained");
    }
    Ok(steps)
}

fn walkable_at(client: &RecastClient, x: f32, z: f32) -> Result<bool> {
    let (reference, _) = client.find_nearest_poly(&[x, 0.0, z], &EXT)?;
    Ok(reference.is_valid())
}

#[test]
fn test_obstacle_blocks_until_removed() -> Result<()> {
    let mut client = flat_client(32.0)?;
    assert!(walkable_at(&client, 8.0, 8.0)?);

    let obstacle = client.add_obstacle([8.0, 0.0, 8.0], 1.5, 2.0)?;
    // Deferred until the queue is stepped
    assert!(walkable_at(&client, 8.0, 8.0)?);
    drain(&mut client)?;
    assert!(!walkable_at(&client, 8.0, 8.0)?);
    assert!(walkable_at(&client, 12.0, 12.0)?);

    client.remove_obstacle(obstacle)?;
    drain(&mut client)?;
    assert!(walkable_at(&client, 8.0, 8.0)?);
    Ok(())
}

#[test]
fn test_box_obstacle_spanning_tiles() -> Result<()> {
    let mut client = flat_client(32.0)?;
    // Straddles the border between the four tiles
    client.add_box_obstacle([14.0, -0.5, 14.0], [18.0, 2.0, 18.0])?;
    drain(&mut client)?;
    for (x, z) in [(15.0, 15.0), (17.0, 15.0), (15.0, 17.0), (17.0, 17.0)] {
        assert!(!walkable_at(&client, x, z)?, "({x}, {z}) is still walkable");
    }
    assert!(walkable_at(&client, 4.0, 4.0)?);
    Ok(())
}

#[test]
fn test_add_then_remove_is_a_no_op() -> Result<()> {
    let mut client = flat_client(32.0)?;
    let before = poly_counts(client.nav_mesh().unwrap());
    let ext = [1.0, 2.0, 1.0];
    let (start_ref, start) = client.find_nearest_poly(&[2.0, 0.0, 2.0], &ext)?;
    let (end_ref, end) = client.find_nearest_poly(&[30.0, 0.0, 30.0], &ext)?;
    let path_before = client.get_path(start_ref, end_ref, &start, &end, false)?;

    let obstacle = client.add_obstacle([16.0, 0.0, 16.0], 2.0, 2.0)?;
    client.remove_obstacle(obstacle)?;
    drain(&mut client)?;

    assert_eq!(poly_counts(client.nav_mesh().unwrap()), before);
    // Tiles were rebuilt, so the references changed; re-query them
    let (start_ref, start) = client.find_nearest_poly(&[2.0, 0.0, 2.0], &ext)?;
    let (end_ref, end) = client.find_nearest_poly(&[30.0, 0.0, 30.0], &ext)?;
    let path_after = client.get_path(start_ref, end_ref, &start, &end, false)?;
    assert_eq!(path_after.path_refs.len(), path_before.path_refs.len());
    assert_eq!(path_after.path_refs.last(), Some(&end_ref.id()));
    Ok(())
}

#[test]
fn test_rebuild_is_idempotent() -> Result<()> {
    let mut client = flat_client(32.0)?;
    let before = poly_counts(client.nav_mesh().unwrap());

    // Rebuilding every tile twice without any change
    for _ in 0..2 {
        let bytes = client.save()?;
        client.load(&bytes, true)?;
    }
    let mesh = client.nav_mesh().unwrap();
    assert_eq!(mesh.tile_count(), before.len());
    assert_eq!(poly_counts(mesh), before);
    Ok(())
}

#[test]
fn test_clear_obstacles_restores_mesh() -> Result<()> {
    let mut client = flat_client(32.0)?;
    let before = poly_counts(client.nav_mesh().unwrap());
    client.add_obstacle([6.0, 0.0, 6.0], 1.0, 2.0)?;
    client.add_obstacle([24.0, 0.0, 24.0], 1.0, 2.0)?;
    drain(&mut client)?;
    assert_ne!(poly_counts(client.nav_mesh().unwrap()), before);

    client.clear_obstacles()?;
    drain(&mut client)?;
    assert_eq!(poly_counts(client.nav_mesh().unwrap()), before);
    Ok(())
}

#[test]
fn test_stale_obstacle_ref_fails() -> Result<()> {
    let mut client = flat_client(32.0)?;
    let obstacle = client.add_obstacle([8.0, 0.0, 8.0], 1.0, 2.0)?;
    client.remove_obstacle(obstacle)?;
    drain(&mut client)?;
    assert!(client.remove_obstacle(obstacle).is_err());
    Ok(())
}
