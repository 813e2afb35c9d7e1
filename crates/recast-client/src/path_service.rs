//! Coarse corridor search and greedy corridor smoothing
//!
//! The smoother walks the corridor in fixed steps along the surface and
//! re-fits the corridor after every step. It never backtracks, so each step
//! has bounded cost and the polyline is approximate rather than optimal.

use detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, Status, StraightPathFlags};
use detour_crowd::merge_corridor_start_moved;
use recast_common::{in_range, vdot, vmad, vsub, Error, Result};

/// Longest corridor returned by a path query
pub const MAX_PATH_POLYS: usize = 256;
/// Most points in a smoothed path
pub const MAX_PATH_SMOOTH: usize = 2048;
/// Distance advanced per smoothing step
pub const STEP_SIZE: f32 = 2.0;
/// Distance below which a point counts as reached
pub const SLOP: f32 = 1e-4;
/// Straight path lookahead when picking a steer target
pub const MAX_STEER_POINTS: usize = 3;

const MAX_SHORTCUT_NEIS: usize = 16;
const MAX_SHORTCUT_LOOKAHEAD: usize = 6;

/// Next point to steer towards along a corridor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteerTarget {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    pub reference: PolyRef,
}

/// Finds the polygon corridor from `start_ref` to `end_ref`
///
/// Both references must be valid. The corridor holds at most
/// [`MAX_PATH_POLYS`] polygons and may end short of `end_ref`.
pub fn find_path(
    query: &mut NavMeshQuery,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    filter: &QueryFilter,
) -> Result<Vec<PolyRef>> {
    let nav_mesh = query.nav_mesh();
    if !nav_mesh.is_valid_poly_ref(start_ref) || !nav_mesh.is_valid_poly_ref(end_ref) {
        return Err(Error::Detour(Status::InvalidParam.to_string()));
    }
    let (path, status) =
        query.find_path(start_ref, end_ref, start_pos, end_pos, filter, MAX_PATH_POLYS)?;
    if status == Status::PartialResult {
        log::debug!("partial path of {} polygons", path.len());
    }
    Ok(path)
}

/// Picks the first straight-path corner farther than `min_target_dist`, or
/// the first off-mesh connection start
pub fn get_steer_target(
    query: &NavMeshQuery,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    min_target_dist: f32,
    path: &[PolyRef],
) -> Option<SteerTarget> {
    let steer_path = query
        .find_straight_path(start_pos, end_pos, path, MAX_STEER_POINTS)
        .ok()?;

    let ns = (0..steer_path.len()).find(|&i| {
        steer_path.flags[i].contains(StraightPathFlags::OFFMESH_CONNECTION)
            || !in_range(&steer_path.points[i], start_pos, min_target_dist, 1000.0)
    })?;

    let mut pos = steer_path.points[ns];
    pos[1] = start_pos[1];
    Some(SteerTarget {
        pos,
        flags: steer_path.flags[ns],
        reference: steer_path.refs[ns],
    })
}

/// Drops the corridor polygons skipped by a neighbour of the first polygon
///
/// Looks up to six polygons ahead; the walker may have wandered into a
/// polygon adjacent to one further along the corridor.
pub fn fixup_shortcuts(path: &mut Vec<PolyRef>, nav_mesh: &NavMesh) {
    if path.len() < 3 {
        return;
    }
    let Ok((_, poly)) = nav_mesh.get_tile_and_poly_by_ref(path[0]) else {
        return;
    };
    let neis: Vec<PolyRef> = poly
        .links
        .iter()
        .map(|l| l.reference)
        .filter(|r| r.is_valid())
        .take(MAX_SHORTCUT_NEIS)
        .collect();

    let look_ahead = MAX_SHORTCUT_LOOKAHEAD.min(path.len());
    let cut = (2..look_ahead).rev().find(|&i| neis.contains(&path[i]));
    if let Some(cut) = cut {
        path.drain(1..cut);
    }
}

fn snap_height(nav_mesh: &NavMesh, reference: PolyRef, pos: &mut [f32; 3]) {
    if let Ok(Some(h)) = nav_mesh.get_poly_height(reference, pos) {
        pos[1] = h;
    }
}

/// Walks `corridor` from `start_pos` towards `end_pos` and returns the
/// dense polyline, at most [`MAX_PATH_SMOOTH`] points
///
/// An off-mesh connection contributes its entry point, duplicated when
/// needed to keep the point count even, followed by its exit point.
pub fn get_smooth_path(
    query: &NavMeshQuery,
    corridor: &[PolyRef],
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    filter: &QueryFilter,
) -> Result<Vec<[f32; 3]>> {
    let (Some(&first), Some(&last)) = (corridor.first(), corridor.last()) else {
        return Ok(Vec::new());
    };
    let nav_mesh = query.nav_mesh();
    let mut polys: Vec<PolyRef> = corridor.iter().take(MAX_PATH_POLYS).copied().collect();

    let mut iter_pos = query.closest_point_on_poly_boundary(first, start_pos)?;
    let target_pos = query.closest_point_on_poly_boundary(last, end_pos)?;

    let mut smooth = Vec::with_capacity(64);
    smooth.push(iter_pos);

    while !polys.is_empty() && smooth.len() < MAX_PATH_SMOOTH {
        let Some(steer) = get_steer_target(query, &iter_pos, &target_pos, SLOP, &polys) else {
            break;
        };
        let end_of_path = steer.flags.contains(StraightPathFlags::END);
        let off_mesh = steer.flags.contains(StraightPathFlags::OFFMESH_CONNECTION);

        // Step towards the steer target, landing on it when it is close
        let delta = vsub(&steer.pos, &iter_pos);
        let mut len = vdot(&delta, &delta).sqrt();
        if (end_of_path || off_mesh) && len < STEP_SIZE {
            len = 1.0;
        } else {
            len = STEP_SIZE / len;
        }
        let move_target = vmad(&iter_pos, &delta, len);

        let (mut result, visited) =
            query.move_along_surface(polys[0], &iter_pos, &move_target, filter)?;
        merge_corridor_start_moved(&mut polys, MAX_PATH_POLYS, &visited);
        fixup_shortcuts(&mut polys, nav_mesh);
        if let Some(&head) = polys.first() {
            snap_height(nav_mesh, head, &mut result);
        }
        iter_pos = result;

        if end_of_path && in_range(&iter_pos, &steer.pos, SLOP, 1.0) {
            iter_pos = target_pos;
            if smooth.len() < MAX_PATH_SMOOTH {
                smooth.push(iter_pos);
            }
            break;
        }

        if off_mesh && in_range(&iter_pos, &steer.pos, SLOP, 1.0) {
            // Advance the corridor past the connection
            let Some(i) = polys.iter().position(|&r| r == steer.reference) else {
                break;
            };
            let prev_ref = if i > 0 { polys[i - 1] } else { PolyRef::default() };
            let con_ref = polys[i];
            if i > 0 {
                polys.drain(..=i);
            }

            if let Ok((con_start, con_end)) =
                nav_mesh.get_off_mesh_connection_poly_end_points(prev_ref, con_ref)
            {
                if smooth.len() < MAX_PATH_SMOOTH {
                    smooth.push(con_start);
                    // Pad to an even count before the exit point
                    if smooth.len() % 2 == 1 && smooth.len() < MAX_PATH_SMOOTH {
                        smooth.push(con_start);
                    }
                }
                iter_pos = con_end;
                if let Some(&head) = polys.first() {
                    snap_height(nav_mesh, head, &mut iter_pos);
                }
            }
        }

        if smooth.len() < MAX_PATH_SMOOTH {
            smooth.push(iter_pos);
        }
    }

    Ok(smooth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use detour::{
        NavMeshBuilder, NavMeshCreateParams, NavMeshParams, PolyFlags, DT_EXT_LINK, MESH_NULL_IDX,
    };

    const TILE: f32 = 10.0;

    /// Flat tile `(tx, ty)` split into `n` x `n` square polygons
    fn tile_params(tx: i32, ty: i32, n: u16) -> NavMeshCreateParams {
        let nvp = 6;
        let step = TILE / n as f32;
        let ox = tx as f32 * TILE;
        let oz = ty as f32 * TILE;
        let mut verts = Vec::new();
        for iz in 0..=n {
            for ix in 0..=n {
                verts.extend_from_slice(&[ox + ix as f32 * step, 0.0, oz + iz as f32 * step]);
            }
        }
        let v = |ix: u16, iz: u16| iz * (n + 1) + ix;
        let border = |on: bool, side: u16| if on { DT_EXT_LINK | side } else { MESH_NULL_IDX };

        let mut polys = Vec::new();
        for qz in 0..n {
            for qx in 0..n {
                let mut entry = vec![MESH_NULL_IDX; nvp * 2];
                entry[..4].copy_from_slice(&[
                    v(qx, qz),
                    v(qx, qz + 1),
                    v(qx + 1, qz + 1),
                    v(qx + 1, qz),
                ]);
                entry[nvp] = border(qx == 0, 4);
                entry[nvp + 1] = border(qz + 1 == n, 2);
                entry[nvp + 2] = border(qx + 1 == n, 0);
                entry[nvp + 3] = border(qz == 0, 6);
                polys.extend_from_slice(&entry);
            }
        }

        let count = usize::from(n * n);
        NavMeshCreateParams {
            vert_count: verts.len() / 3,
            verts,
            polys,
            poly_flags: vec![PolyFlags::WALK; count],
            poly_areas: vec![0; count],
            poly_count: count,
            nvp,
            tile_x: tx,
            tile_y: ty,
            tile_layer: 0,
            bmin: [ox, -1.0, oz],
            bmax: [ox + TILE, 1.0, oz + TILE],
            walkable_height: 2.0,
            walkable_radius: 0.5,
            walkable_climb: 0.5,
            ..NavMeshCreateParams::default()
        }
    }

    fn empty_mesh() -> NavMesh {
        NavMesh::new(NavMeshParams {
            origin: [0.0; 3],
            tile_width: TILE,
            tile_height: TILE,
            max_tiles: 16,
            max_polys_per_tile: 256,
        })
        .unwrap()
    }

    fn strip(tiles: i32, n: u16) -> NavMesh {
        let mut mesh = empty_mesh();
        for tx in 0..tiles {
            mesh.add_tile(NavMeshBuilder::build_tile(&tile_params(tx, 0, n)).unwrap())
                .unwrap();
        }
        mesh
    }

    const LINK_START: [f32; 3] = [9.0, 0.0, 9.0];
    const LINK_END: [f32; 3] = [11.0, 0.0, 11.0];

    /// Tiles (0, 0) and (1, 1) touching only at a corner, joined by a
    /// one-way link across the corner
    fn linked_diagonal() -> NavMesh {
        let mut first = tile_params(0, 0, 1);
        first.off_mesh_con_verts = [LINK_START, LINK_END].concat();
        first.off_mesh_con_rad = vec![0.5];
        first.off_mesh_con_flags = vec![PolyFlags::JUMP];
        first.off_mesh_con_areas = vec![0];
        first.off_mesh_con_dir = vec![0];
        first.off_mesh_con_user_id = vec![1];
        first.off_mesh_con_count = 1;

        let mut mesh = empty_mesh();
        mesh.add_tile(NavMeshBuilder::build_tile(&first).unwrap())
            .unwrap();
        mesh.add_tile(NavMeshBuilder::build_tile(&tile_params(1, 1, 1)).unwrap())
            .unwrap();
        mesh
    }

    fn close(a: &[f32; 3], b: &[f32; 3]) -> bool {
        (0..3).all(|i| (a[i] - b[i]).abs() < 1e-3)
    }

    /// Smooths the linked corridor from `start` and returns the points with
    /// the index of the link entry
    fn smooth_across_link(start: [f32; 3]) -> (Vec<[f32; 3]>, usize) {
        let mesh = linked_diagonal();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let end = [18.0, 0.0, 18.0];
        let s = nearest(&query, &start);
        let e = nearest(&query, &end);

        let corridor = find_path(&mut query, s, e, &start, &end, &filter).unwrap();
        // Ground polygon, link, ground polygon
        assert_eq!(corridor.len(), 3);
        assert_eq!(corridor.last(), Some(&e));

        let points = get_smooth_path(&query, &corridor, &start, &end, &filter).unwrap();
        assert_eq!(points.last(), Some(&end));
        let entry = points.iter().position(|p| close(p, &LINK_START)).unwrap();
        (points, entry)
    }

    fn nearest(query: &NavMeshQuery, pos: &[f32; 3]) -> PolyRef {
        let (r, _) = query
            .find_nearest_poly(pos, &[1.0, 2.0, 1.0], &QueryFilter::default())
            .unwrap();
        assert!(r.is_valid());
        r
    }

    #[test]
    fn test_smooth_path_reaches_target() {
        let mesh = strip(3, 4);
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 1.0];
        let end = [28.0, 0.0, 9.0];
        let s = nearest(&query, &start);
        let e = nearest(&query, &end);

        let corridor = find_path(&mut query, s, e, &start, &end, &filter).unwrap();
        assert_eq!(corridor.first(), Some(&s));
        assert_eq!(corridor.last(), Some(&e));

        let points = get_smooth_path(&query, &corridor, &start, &end, &filter).unwrap();
        assert!(points.len() >= 2);
        assert!(points.len() <= MAX_PATH_SMOOTH);
        let last = points[points.len() - 1];
        assert!((last[0] - end[0]).abs() < 1e-3 && (last[2] - end[2]).abs() < 1e-3);

        // Consecutive points are never further apart than one step
        for w in points.windows(2) {
            let d = vsub(&w[1], &w[0]);
            assert!(vdot(&d, &d).sqrt() <= STEP_SIZE + 1e-3);
        }
    }

    #[test]
    fn test_off_mesh_link_pads_odd_count() {
        // Five steps, then the landing on the entry: the entry is point 6
        let (points, entry) = smooth_across_link([1.0, 0.0, 1.0]);
        assert_eq!(entry, 6);
        assert!(close(&points[entry + 1], &LINK_START));
        assert!(close(&points[entry + 2], &LINK_END));

        // The walk resumes from the exit without revisiting the first tile
        assert!(points[entry + 2..].iter().all(|p| p[0] >= 11.0 - 1e-3));
        for w in points[entry + 2..].windows(2) {
            let d = vsub(&w[1], &w[0]);
            assert!(vdot(&d, &d).sqrt() <= STEP_SIZE + 1e-3);
        }
    }

    #[test]
    fn test_off_mesh_link_even_count_is_not_padded() {
        // Four steps, then the landing: the entry is point 5
        let (points, entry) = smooth_across_link([3.0, 0.0, 3.0]);
        assert_eq!(entry, 5);
        assert!(close(&points[entry + 1], &LINK_END));
        assert_eq!((entry + 1) % 2, 0);
        assert_eq!(
            points.iter().filter(|p| close(p, &LINK_START)).count(),
            1
        );
    }

    #[test]
    fn test_single_polygon_corridor_terminates() {
        let mesh = strip(1, 1);
        let query = NavMeshQuery::new(&mesh);
        let start = [1.0, 0.0, 1.0];
        let end = [9.0, 0.0, 9.0];
        let r = nearest(&query, &start);

        let points =
            get_smooth_path(&query, &[r], &start, &end, &QueryFilter::default()).unwrap();
        assert!(points.len() <= MAX_PATH_SMOOTH);
        assert_eq!(points.last(), Some(&end));
    }

    #[test]
    fn test_empty_corridor_yields_no_points() {
        let mesh = strip(1, 1);
        let query = NavMeshQuery::new(&mesh);
        let points =
            get_smooth_path(&query, &[], &[0.0; 3], &[1.0, 0.0, 1.0], &QueryFilter::default())
                .unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn test_invalid_reference_fails() {
        let mesh = strip(1, 2);
        let mut query = NavMeshQuery::new(&mesh);
        let start = [1.0, 0.0, 1.0];
        let s = nearest(&query, &start);
        let result = find_path(
            &mut query,
            s,
            PolyRef::new(0),
            &start,
            &[5.0, 0.0, 5.0],
            &QueryFilter::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fixup_shortcuts_cuts_to_neighbour() {
        let mesh = strip(1, 4);
        let query = NavMeshQuery::new(&mesh);
        let p = |x: f32, z: f32| nearest(&query, &[x, 0.0, z]);

        // A detour around the first polygon's right neighbour
        let detour = vec![
            p(1.25, 1.25),
            p(1.25, 3.75),
            p(3.75, 3.75),
            p(3.75, 1.25),
            p(6.25, 1.25),
        ];
        let mut path = detour.clone();
        fixup_shortcuts(&mut path, &mesh);
        assert_eq!(path, vec![detour[0], detour[3], detour[4]]);

        let mut short = detour[..2].to_vec();
        fixup_shortcuts(&mut short, &mesh);
        assert_eq!(short, detour[..2]);
    }

    #[test]
    fn test_merge_corridor_scenario() {
        let p = |i: u32| PolyRef::new(100 + i);
        let mut path = vec![p(0), p(1), p(2), p(3)];
        merge_corridor_start_moved(&mut path, MAX_PATH_POLYS, &[p(5), p(2), p(1)]);
        assert_eq!(path, vec![p(1), p(2), p(3)]);

        let mut untouched = vec![p(0), p(1)];
        merge_corridor_start_moved(&mut untouched, MAX_PATH_POLYS, &[p(7), p(8)]);
        assert_eq!(untouched, vec![p(0), p(1)]);
    }
}
