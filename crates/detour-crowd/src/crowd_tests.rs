//! Crowd simulation tests on small flat meshes

use detour::{
    NavMesh, NavMeshBuilder, NavMeshCreateParams, NavMeshParams, NavMeshQuery, PolyFlags, PolyRef,
    QueryFilter, DT_EXT_LINK, MESH_NULL_IDX,
};
use recast_common::{dist_sqr_2d, vlen};

use crate::{
    AgentParams, Crowd, CrowdAgentState, MoveRequestState, ObstacleAvoidanceParams, UpdateFlags,
};

const TILE_SIZE: f32 = 8.0;

/// A flat tile at `(tx, 0)` split into 2x2 square polygons
fn tile_params(tx: i32) -> NavMeshCreateParams {
    let nvp = 6;
    let ox = tx as f32 * TILE_SIZE;
    let half = TILE_SIZE / 2.0;

    let mut verts = Vec::with_capacity(27);
    for iz in 0..3 {
        for ix in 0..3 {
            verts.extend_from_slice(&[ox + ix as f32 * half, 0.0, iz as f32 * half]);
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
        tile_y: 0,
        tile_layer: 0,
        bmin: [ox, -1.0, 0.0],
        bmax: [ox + TILE_SIZE, 1.0, TILE_SIZE],
        walkable_height: 2.0,
        walkable_radius: 0.5,
        walkable_climb: 0.5,
        ..NavMeshCreateParams::default()
    }
}

/// A row of `tiles` flat tiles along +x
fn strip_mesh(tiles: i32) -> NavMesh {
    let mut mesh = NavMesh::new(NavMeshParams {
        origin: [0.0; 3],
        tile_width: TILE_SIZE,
        tile_height: TILE_SIZE,
        max_tiles: 16,
        max_polys_per_tile: 16,
    })
    .unwrap();
    for tx in 0..tiles {
        let tile = NavMeshBuilder::build_tile(&tile_params(tx)).unwrap();
        mesh.add_tile(tile).unwrap();
    }
    mesh
}

fn poly_at(mesh: &NavMesh, pos: &[f32; 3]) -> PolyRef {
    let query = NavMeshQuery::new(mesh);
    let (r, _) = query
        .find_nearest_poly(pos, &[0.5, 1.0, 0.5], &QueryFilter::default())
        .unwrap();
    assert!(r.is_valid());
    r
}

#[test]
fn test_full_pool_rejects_agent() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(2, 0.6).unwrap();
    let params = AgentParams::default();

    crowd.add_agent(&mesh, &[2.0, 0.0, 2.0], &params).unwrap();
    crowd.add_agent(&mesh, &[6.0, 0.0, 2.0], &params).unwrap();
    assert!(crowd.add_agent(&mesh, &[4.0, 0.0, 6.0], &params).is_err());
    assert_eq!(crowd.get_active_agent_count(), 2);
}

#[test]
fn test_invalid_construction() {
    assert!(Crowd::new(0, 0.6).is_err());
    assert!(Crowd::new(4, 0.0).is_err());
    assert!(Crowd::new(4, f32::NAN).is_err());
}

#[test]
fn test_agent_placed_off_mesh_is_invalid() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let idx = crowd
        .add_agent(&mesh, &[50.0, 0.0, 50.0], &AgentParams::default())
        .unwrap();
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.get_state(), CrowdAgentState::Invalid);

    // Invalid agents are left alone by the simulation
    crowd.update(0.1, &mesh).unwrap();
    assert_eq!(crowd.get_agent(idx).unwrap().get_pos(), [50.0, 0.0, 50.0]);
}

#[test]
fn test_agent_reaches_target() {
    let mesh = strip_mesh(2);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let params = AgentParams::default();
    let idx = crowd.add_agent(&mesh, &[1.0, 0.0, 1.0], &params).unwrap();
    assert_eq!(crowd.get_agent(idx).unwrap().get_state(), CrowdAgentState::Walking);

    let target = [14.0, 0.0, 5.0];
    let target_ref = poly_at(&mesh, &target);
    crowd.request_move_target(idx, target_ref, &target).unwrap();
    assert_eq!(
        crowd.get_agent(idx).unwrap().get_target_state(),
        MoveRequestState::Requesting
    );

    let mut steps = 0;
    while steps < 300 {
        crowd.update(0.1, &mesh).unwrap();
        steps += 1;
        if crowd.get_agent(idx).unwrap().get_target_state() == MoveRequestState::Arrived {
            break;
        }
    }

    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.get_target_state(), MoveRequestState::Arrived);
    assert!(dist_sqr_2d(&agent.get_pos(), &target).sqrt() <= params.radius + 0.01);
    assert!(!agent.is_partial());
}

#[test]
fn test_reset_move_target_stops_agent() {
    let mesh = strip_mesh(2);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let idx = crowd
        .add_agent(&mesh, &[1.0, 0.0, 4.0], &AgentParams::default())
        .unwrap();

    let target = [15.0, 0.0, 4.0];
    crowd
        .request_move_target(idx, poly_at(&mesh, &target), &target)
        .unwrap();
    for _ in 0..5 {
        crowd.update(0.1, &mesh).unwrap();
    }
    assert!(vlen(&crowd.get_agent(idx).unwrap().get_vel()) > 0.1);

    crowd.reset_move_target(idx).unwrap();
    assert_eq!(
        crowd.get_agent(idx).unwrap().get_target_state(),
        MoveRequestState::None
    );
    for _ in 0..20 {
        crowd.update(0.1, &mesh).unwrap();
    }

    let agent = crowd.get_agent(idx).unwrap();
    assert!(vlen(&agent.get_vel()) < 1e-3);
    let before = agent.get_pos();
    crowd.update(0.1, &mesh).unwrap();
    assert_eq!(crowd.get_agent(idx).unwrap().get_pos(), before);
}

#[test]
fn test_move_request_validation() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let idx = crowd
        .add_agent(&mesh, &[2.0, 0.0, 2.0], &AgentParams::default())
        .unwrap();

    assert!(crowd
        .request_move_target(idx, PolyRef::new(0), &[4.0, 0.0, 4.0])
        .is_err());
    let target_ref = poly_at(&mesh, &[6.0, 0.0, 6.0]);
    assert!(crowd.request_move_target(3, target_ref, &[6.0, 0.0, 6.0]).is_err());
    assert!(crowd.request_move_target(99, target_ref, &[6.0, 0.0, 6.0]).is_err());
}

#[test]
fn test_remove_agent_frees_slot() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(1, 0.6).unwrap();
    let params = AgentParams::default();
    let idx = crowd.add_agent(&mesh, &[2.0, 0.0, 2.0], &params).unwrap();

    crowd.remove_agent(idx).unwrap();
    assert!(crowd.get_agent(idx).is_none());
    assert_eq!(crowd.get_active_agent_count(), 0);
    assert!(crowd.remove_agent(idx).is_err());

    let again = crowd.add_agent(&mesh, &[3.0, 0.0, 3.0], &params).unwrap();
    assert_eq!(again, idx);
}

#[test]
fn test_velocity_request_moves_agent() {
    let mesh = strip_mesh(2);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let idx = crowd
        .add_agent(&mesh, &[4.0, 0.0, 4.0], &AgentParams::default())
        .unwrap();

    crowd.request_move_velocity(idx, &[1.0, 0.0, 0.0]).unwrap();
    for _ in 0..10 {
        crowd.update(0.1, &mesh).unwrap();
    }
    let agent = crowd.get_agent(idx).unwrap();
    assert_eq!(agent.get_target_state(), MoveRequestState::Velocity);
    assert!(agent.get_pos()[0] > 4.5);
}

#[test]
fn test_overlapping_agents_are_pushed_apart() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let params = AgentParams::default();
    let a = crowd.add_agent(&mesh, &[4.0, 0.0, 4.0], &params).unwrap();
    let b = crowd.add_agent(&mesh, &[4.1, 0.0, 4.0], &params).unwrap();

    crowd.update(0.1, &mesh).unwrap();

    let pa = crowd.get_agent(a).unwrap().get_pos();
    let pb = crowd.get_agent(b).unwrap().get_pos();
    assert!(dist_sqr_2d(&pa, &pb).sqrt() > 0.5);
    assert_eq!(crowd.get_agent(a).unwrap().get_neighbours(), &[b]);
}

#[test]
fn test_update_agent_parameters() {
    let mesh = strip_mesh(1);
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let idx = crowd
        .add_agent(&mesh, &[2.0, 0.0, 2.0], &AgentParams::default())
        .unwrap();

    let params = AgentParams {
        max_speed: 1.0,
        update_flags: UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OPTIMIZE_VIS,
        ..AgentParams::default()
    };
    crowd.update_agent_parameters(idx, &params).unwrap();
    assert_eq!(crowd.get_agent(idx).unwrap().get_params(), &params);

    let bad = AgentParams {
        radius: -1.0,
        ..AgentParams::default()
    };
    assert!(crowd.update_agent_parameters(idx, &bad).is_err());
}

#[test]
fn test_avoidance_params_slots() {
    let mut crowd = Crowd::new(4, 0.6).unwrap();
    let params = ObstacleAvoidanceParams {
        vel_bias: 0.5,
        adaptive_divs: 5,
        adaptive_rings: 2,
        adaptive_depth: 1,
        ..ObstacleAvoidanceParams::default()
    };

    crowd.set_obstacle_avoidance_params(0, params).unwrap();
    assert_eq!(crowd.get_obstacle_avoidance_params(0), Some(&params));
    assert!(crowd.set_obstacle_avoidance_params(8, params).is_err());
    assert!(crowd.get_obstacle_avoidance_params(8).is_none());
}
