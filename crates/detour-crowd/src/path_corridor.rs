//! Path corridor implementation for Detour
//!
//! A corridor is the polygon path an agent follows, together with its
//! current position on the first polygon and its target on the last. It
//! is kept valid incrementally: moving the position trims or splices the
//! front of the path instead of searching again.

use detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, Status, StraightPath, StraightPathFlags};
use recast_common::{dist_sqr_2d, vdist, Error, Result};

/// Default capacity of a corridor
pub const MAX_PATH_POLYS: usize = 256;

/// Corners closer than this to the position are skipped
const MIN_TARGET_DIST: f32 = 0.01;

/// Node budget of the local search used by topology optimization
const MAX_TOPOLOGY_NODES: usize = 32;

/// Re-fits the front of `path` after moving across the `visited` polygons
///
/// `visited` is in travel order, start first. The corridor is spliced at the
/// furthest polygon shared by both lists, searching both from the tail, so
/// that it starts with the polygons walked since that point. Without a
/// shared polygon the path is left unchanged.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited) else {
        return;
    };

    // Visited tail from the shared polygon on, newest first
    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    let rest = path.get(furthest_path + 1..).unwrap_or_default();
    let room = max_path.saturating_sub(merged.len());
    merged.extend(rest.iter().take(room));
    *path = merged;
}

/// Re-fits the front of `path` after a shortcut search found `visited`
///
/// `visited` starts at the current polygon. The corridor is spliced at the
/// furthest polygon shared by both lists, keeping `visited` up to it.
pub fn merge_corridor_start_shortcut(
    path: &mut Vec<PolyRef>,
    max_path: usize,
    visited: &[PolyRef],
) {
    let Some((furthest_path, furthest_visited)) = furthest_common(path, visited) else {
        return;
    };
    if furthest_visited == 0 {
        return;
    }

    let mut merged: Vec<PolyRef> = visited[..furthest_visited].to_vec();
    let room = max_path.saturating_sub(merged.len());
    merged.extend(path[furthest_path..].iter().take(room));
    *path = merged;
}

/// Furthest `(path index, visited index)` pair naming the same polygon
///
/// The path is scanned from its tail; for the first path entry found in
/// `visited`, the earliest matching visited index is kept.
fn furthest_common(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, r)| visited.iter().position(|v| v == r).map(|j| (i, j)))
}

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position, on the first polygon
    pos: [f32; 3],
    /// Target position, on the last polygon
    target: [f32; 3],
    /// Polygon path from position to target
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new(MAX_PATH_POLYS)
    }
}

impl PathCorridor {
    /// Creates an empty corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        Self {
            pos: [0.0; 3],
            target: [0.0; 3],
            path: Vec::with_capacity(max_path),
            max_path: max_path.max(1),
        }
    }

    /// Resets the corridor to a single polygon at `pos`
    pub fn reset(&mut self, reference: PolyRef, pos: [f32; 3]) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if reference.is_valid() {
            self.path.push(reference);
        }
    }

    /// Replaces the path, which must start at the current polygon
    pub fn set_corridor(&mut self, target: [f32; 3], path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path
            .extend(path.iter().take(self.max_path).copied());
    }

    /// Corner points from the position toward the target
    ///
    /// Corners right at the position are dropped, and the list ends at the
    /// first off-mesh connection.
    pub fn find_corners(&self, query: &NavMeshQuery, max_corners: usize) -> Result<StraightPath> {
        if self.path.is_empty() {
            return Ok(StraightPath::default());
        }

        let mut corners = query.find_straight_path(&self.pos, &self.target, &self.path, max_corners)?;

        let skip = corners
            .points
            .iter()
            .zip(&corners.flags)
            .take_while(|(p, f)| {
                !f.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    && dist_sqr_2d(p, &self.pos) <= MIN_TARGET_DIST * MIN_TARGET_DIST
            })
            .count();
        corners.points.drain(..skip);
        corners.flags.drain(..skip);
        corners.refs.drain(..skip);

        if let Some(i) = corners
            .flags
            .iter()
            .position(|f| f.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.points.truncate(i + 1);
            corners.flags.truncate(i + 1);
            corners.refs.truncate(i + 1);
        }
        Ok(corners)
    }

    /// Skips ahead along the path when `next` is in direct view
    ///
    /// Only the part of the segment within `path_optimization_range` is
    /// tested.
    pub fn optimize_path_visibility(
        &mut self,
        next: &[f32; 3],
        path_optimization_range: f32,
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        if self.path.is_empty() {
            return Ok(());
        }

        let mut goal = *next;
        let dist = dist_sqr_2d(&self.pos, &goal).sqrt();
        // Too close to be worth it
        if dist < 0.01 {
            return Ok(());
        }
        let dist = dist.min(path_optimization_range);
        let dir = [goal[0] - self.pos[0], 0.0, goal[2] - self.pos[2]];
        let len = (dir[0] * dir[0] + dir[2] * dir[2]).sqrt();
        goal = [
            self.pos[0] + dir[0] / len * dist,
            goal[1],
            self.pos[2] + dir[2] / len * dist,
        ];

        let (t, _, visited) = query.raycast(self.path[0], &self.pos, &goal, filter, self.max_path)?;
        if visited.len() > 1 && t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &visited);
        }
        Ok(())
    }

    /// Looks for a shorter route through the start of the corridor with a
    /// small local search
    ///
    /// Returns `true` when the corridor was changed.
    pub fn optimize_path_topology(&mut self, nav_mesh: &NavMesh, filter: &QueryFilter) -> Result<bool> {
        if self.path.len() < 3 {
            return Ok(false);
        }

        let mut query = NavMeshQuery::with_max_nodes(nav_mesh, MAX_TOPOLOGY_NODES);
        let last = self.path[self.path.len() - 1];
        let (res, _) = query.find_path(self.path[0], last, &self.pos, &self.target, filter, self.max_path)?;

        let before = self.path.clone();
        if res.len() > 1 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &res);
        }
        Ok(self.path != before)
    }

    /// Advances the corridor past the off-mesh connection `offmesh_ref`
    ///
    /// Returns the connection's (start, end) points in travel direction, or
    /// `None` when the connection is not near the front of the path.
    pub fn move_over_offmesh_connection(
        &mut self,
        offmesh_ref: PolyRef,
        nav_mesh: &NavMesh,
    ) -> Result<Option<([f32; 3], [f32; 3])>> {
        let Some(npos) = self.path.iter().position(|&r| r == offmesh_ref) else {
            return Ok(None);
        };
        if npos == 0 {
            return Ok(None);
        }

        let prev_ref = self.path[npos - 1];
        self.path.drain(..=npos);

        let (start, end) = nav_mesh.get_off_mesh_connection_poly_end_points(prev_ref, offmesh_ref)?;
        self.pos = end;
        Ok(Some((start, end)))
    }

    /// Moves the position toward `new_pos` along the surface
    ///
    /// Returns `true` when the position moved.
    pub fn move_position(
        &mut self,
        new_pos: &[f32; 3],
        query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        if self.path.is_empty() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let (mut result, visited) = query.move_along_surface(self.path[0], &self.pos, new_pos, filter)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        if let Some(h) = query.get_poly_height(self.path[0], &result)? {
            result[1] = h;
        }
        let moved = result != self.pos;
        self.pos = result;
        Ok(moved)
    }

    /// Makes `safe_ref` the first polygon, keeping the rest of the path
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: &[f32; 3]) {
        self.pos = *safe_pos;
        if self.path.first() != Some(&safe_ref) {
            self.path.insert(0, safe_ref);
            self.path.truncate(self.max_path);
        }
    }

    /// Cuts the path at the first polygon that is gone or no longer passes
    /// the filter
    ///
    /// When even the first polygon is invalid the corridor restarts at
    /// `safe_ref`. The target is clamped onto the new last polygon.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: &[f32; 3],
        nav_mesh: &NavMesh,
        filter: &QueryFilter,
    ) -> Result<()> {
        let valid = self
            .path
            .iter()
            .take_while(|&&r| poly_passes(nav_mesh, r, filter))
            .count();

        if valid == 0 {
            self.pos = *safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(valid);
        }

        let last = self.path[self.path.len() - 1];
        let query = NavMeshQuery::new(nav_mesh);
        self.target = query.closest_point_on_poly_boundary(last, &self.target)?;
        Ok(())
    }

    /// Whether the first `max_look_ahead` polygons are still usable
    pub fn is_valid(&self, max_look_ahead: usize, nav_mesh: &NavMesh, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&r| poly_passes(nav_mesh, r, filter))
    }

    pub fn get_pos(&self) -> [f32; 3] {
        self.pos
    }

    pub fn get_target(&self) -> [f32; 3] {
        self.target
    }

    pub fn get_path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn get_path_count(&self) -> usize {
        self.path.len()
    }

    /// First polygon, or a null reference for an empty corridor
    pub fn get_first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or_default()
    }

    /// Last polygon, or a null reference for an empty corridor
    pub fn get_last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or_default()
    }

    /// Straight-line distance from the position to the target
    pub fn distance_to_target(&self) -> f32 {
        vdist(&self.pos, &self.target)
    }
}

fn poly_passes(nav_mesh: &NavMesh, reference: PolyRef, filter: &QueryFilter) -> bool {
    nav_mesh
        .get_tile_and_poly_by_ref(reference)
        .is_ok_and(|(_, poly)| filter.pass_filter(poly.flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&i| PolyRef::new(i)).collect()
    }

    #[test]
    fn test_merge_moved_splices_at_furthest_common_polygon() {
        let mut path = refs(&[10, 11, 12, 13]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[15, 12, 11]));
        // Walked 12 -> 11 since the shared polygon; 13 follows
        assert_eq!(path, refs(&[11, 12, 13]));
    }

    #[test]
    fn test_merge_moved_forward() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[1, 2, 3]));
        assert_eq!(path, refs(&[3, 4, 5]));
    }

    #[test]
    fn test_merge_moved_without_common_polygon_is_noop() {
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_moved(&mut path, 256, &refs(&[7, 8]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_merge_moved_respects_capacity() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_moved(&mut path, 3, &refs(&[1, 9]));
        assert_eq!(path, refs(&[9, 1, 2]));
    }

    #[test]
    fn test_merge_shortcut_keeps_search_prefix() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        merge_corridor_start_shortcut(&mut path, 256, &refs(&[1, 7, 4]));
        assert_eq!(path, refs(&[1, 7, 4, 5]));
    }

    #[test]
    fn test_reset_and_set_corridor() {
        let mut corridor = PathCorridor::new(4);
        corridor.reset(PolyRef::new(3), [1.0, 0.0, 1.0]);
        assert_eq!(corridor.get_path(), &refs(&[3])[..]);
        assert_eq!(corridor.get_target(), [1.0, 0.0, 1.0]);

        corridor.set_corridor([5.0, 0.0, 5.0], &refs(&[3, 4, 5, 6, 7, 8]));
        assert_eq!(corridor.get_path_count(), 4);
        assert_eq!(corridor.get_last_poly(), PolyRef::new(6));

        corridor.reset(PolyRef::new(0), [0.0; 3]);
        assert!(corridor.get_path().is_empty());
        assert!(!corridor.get_first_poly().is_valid());
    }
}
