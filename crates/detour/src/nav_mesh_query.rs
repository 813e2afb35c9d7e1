//! Navigation mesh query implementation for Detour
//!
//! Provides spatial queries and pathfinding on a borrowed [`NavMesh`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use rand::Rng;

use super::nav_mesh::{closest_point_on_boundary, point_in_poly, NULL_LINK_EDGE};
use super::{NavMesh, PolyRef, PolyType, QueryFilter, Status};
use recast_common::{dist_point_segment_sqr_2d, tri_area_2d, vdist, vdist_sqr, vlerp, Error, Result};

/// Default size of the search node pool
pub const DEFAULT_MAX_NODES: usize = 2048;

/// Heuristic scale keeping A* admissible under float error
const H_SCALE: f32 = 0.999;

/// Capacity of the breadth-first stack in `move_along_surface`
const MAX_SURFACE_STACK: usize = 48;

/// Maximum number of polygons reported as visited by `move_along_surface`
pub const MAX_VISITED: usize = 16;

/// Maximum number of neighbours considered per polygon edge
const MAX_EDGE_NEIS: usize = 8;

/// Straight path vertex flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StraightPathFlags(u8);

impl StraightPathFlags {
    pub const NONE: StraightPathFlags = StraightPathFlags(0);
    /// The vertex is the start position
    pub const START: StraightPathFlags = StraightPathFlags(0x01);
    /// The vertex is the end position
    pub const END: StraightPathFlags = StraightPathFlags(0x02);
    /// The vertex is the start of an off-mesh connection
    pub const OFFMESH_CONNECTION: StraightPathFlags = StraightPathFlags(0x04);

    pub fn contains(&self, flag: StraightPathFlags) -> bool {
        self.0 & flag.0 != 0
    }
}

/// Corner points of a straight path with per-vertex flags and polygons
#[derive(Debug, Clone, Default)]
pub struct StraightPath {
    pub points: Vec<[f32; 3]>,
    pub flags: Vec<StraightPathFlags>,
    /// Polygon entered at each vertex; null for the end vertex
    pub refs: Vec<PolyRef>,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Appends a vertex, merging it with the previous one when they coincide
    ///
    /// Returns `true` once the path is complete or full.
    fn append(
        &mut self,
        pos: [f32; 3],
        flags: StraightPathFlags,
        reference: PolyRef,
        max: usize,
    ) -> bool {
        match self.points.last() {
            Some(last) if vequal(last, &pos) => {
                if let Some(f) = self.flags.last_mut() {
                    *f = flags;
                }
                if let Some(r) = self.refs.last_mut() {
                    *r = reference;
                }
            }
            _ => {
                self.points.push(pos);
                self.flags.push(flags);
                self.refs.push(reference);
                if self.points.len() >= max {
                    return true;
                }
            }
        }
        flags == StraightPathFlags::END
    }
}

#[inline]
fn vequal(a: &[f32; 3], b: &[f32; 3]) -> bool {
    const THR: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);
    vdist_sqr(a, b) < THR
}

/// State of a node in the search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Open,
    Closed,
}

/// Node in the search graph
#[derive(Debug, Clone)]
struct Node {
    poly: PolyRef,
    parent: Option<usize>,
    pos: [f32; 3],
    cost: f32,
    total: f32,
    state: NodeState,
}

/// Node wrapper for the binary heap (priority queue)
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    f: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap; NaN sorts last
        other.f.total_cmp(&self.f)
    }
}

/// Result of a segment versus convex polygon test
struct SegmentHit {
    tmax: f32,
    seg_max: Option<usize>,
}

/// Clips segment `p0-p1` against a convex polygon on the xz-plane
fn intersect_segment_poly_2d(p0: &[f32; 3], p1: &[f32; 3], verts: &[[f32; 3]]) -> Option<SegmentHit> {
    const EPS: f32 = 0.000_000_01;
    let mut tmin = 0.0f32;
    let mut tmax = 1.0f32;
    let mut seg_max = None;
    let dir = [p1[0] - p0[0], 0.0, p1[2] - p0[2]];

    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        let edge = [verts[i][0] - verts[j][0], 0.0, verts[i][2] - verts[j][2]];
        let diff = [p0[0] - verts[j][0], 0.0, p0[2] - verts[j][2]];
        let num = edge[2] * diff[0] - edge[0] * diff[2];
        let den = dir[2] * edge[0] - dir[0] * edge[2];
        if den.abs() < EPS {
            if num < 0.0 {
                return None;
            }
            j = i;
            continue;
        }
        let t = num / den;
        if den < 0.0 {
            if t > tmin {
                tmin = t;
                if tmin > tmax {
                    return None;
                }
            }
        } else if t < tmax {
            tmax = t;
            seg_max = Some(j);
            if tmax < tmin {
                return None;
            }
        }
        j = i;
    }
    Some(SegmentHit { tmax, seg_max })
}

/// Uniform random point inside a convex polygon, from two samples in [0, 1)
fn random_point_in_convex_poly(pts: &[[f32; 3]], s: f32, t: f32) -> [f32; 3] {
    let n = pts.len();
    let mut areas = vec![0.0f32; n];
    let mut area_sum = 0.0;
    for i in 2..n {
        areas[i] = tri_area_2d(&pts[0], &pts[i - 1], &pts[i]);
        area_sum += areas[i].max(0.001);
    }

    let thr = s * area_sum;
    let mut acc = 0.0;
    let mut u = 1.0;
    let mut tri = n - 1;
    for (i, &dacc) in areas.iter().enumerate().skip(2) {
        if thr >= acc && thr < acc + dacc {
            u = (thr - acc) / dacc;
            tri = i;
            break;
        }
        acc += dacc;
    }

    let v = t.sqrt();
    let a = 1.0 - v;
    let b = (1.0 - u) * v;
    let c = u * v;
    let (pa, pb, pc) = (&pts[0], &pts[tri - 1], &pts[tri]);
    [
        a * pa[0] + b * pb[0] + c * pc[0],
        a * pa[1] + b * pb[1] + c * pc[1],
        a * pa[2] + b * pb[2] + c * pc[2],
    ]
}

/// Navigation mesh query structure
#[derive(Debug)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    max_nodes: usize,
    nodes: Vec<Node>,
    node_lookup: HashMap<PolyRef, usize>,
    open_list: BinaryHeap<HeapNode>,
}

impl<'a> NavMeshQuery<'a> {
    /// Creates a new navigation mesh query with the default node pool
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_max_nodes(nav_mesh, DEFAULT_MAX_NODES)
    }

    /// Creates a query whose searches expand at most `max_nodes` polygons
    pub fn with_max_nodes(nav_mesh: &'a NavMesh, max_nodes: usize) -> Self {
        Self {
            nav_mesh,
            max_nodes: max_nodes.max(1),
            nodes: Vec::with_capacity(max_nodes),
            node_lookup: HashMap::new(),
            open_list: BinaryHeap::new(),
        }
    }

    /// Gets a reference to the navigation mesh
    pub fn nav_mesh(&self) -> &NavMesh {
        self.nav_mesh
    }

    fn reset_search(&mut self) {
        self.nodes.clear();
        self.node_lookup.clear();
        self.open_list.clear();
    }

    /// Finds or allocates the node for `poly`; `None` when the pool is full
    fn node_for(&mut self, poly: PolyRef) -> Option<(usize, bool)> {
        if let Some(&index) = self.node_lookup.get(&poly) {
            return Some((index, false));
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let index = self.nodes.len();
        self.nodes.push(Node {
            poly,
            parent: None,
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            state: NodeState::Open,
        });
        self.node_lookup.insert(poly, index);
        Some((index, true))
    }

    /// Finds the polygon nearest to `center` within `half_extents`
    ///
    /// Returns a null reference when no polygon is in range.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<(PolyRef, [f32; 3])> {
        if !recast_common::vis_finite(center) || !recast_common::vis_finite(half_extents) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok(self
            .nav_mesh
            .find_nearest_poly_in_bounds(center, half_extents, |p| filter.pass_filter(p.flags))
            .unwrap_or((PolyRef::new(0), *center)))
    }

    /// Closest point on polygon `reference` to `pos`, and whether `pos` lies over it
    pub fn closest_point_on_poly(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<([f32; 3], bool)> {
        self.nav_mesh.closest_point_on_poly(reference, pos)
    }

    /// `pos` when it lies inside the polygon, else the closest point on its outline
    pub fn closest_point_on_poly_boundary(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<[f32; 3]> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        if poly.poly_type == PolyType::Ground && point_in_poly(&verts, pos) {
            return Ok(*pos);
        }
        Ok(closest_point_on_boundary(&verts, pos))
    }

    /// Surface height of polygon `reference` at `pos`
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        self.nav_mesh.get_poly_height(reference, pos)
    }

    /// Portal between two adjacent polygons as (left, right)
    pub fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<([f32; 3], [f32; 3])> {
        self.portal_points(from, to).map(|(l, r, _, _)| (l, r))
    }

    /// Midpoint of the portal between two adjacent polygons
    pub fn get_edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right) = self.get_portal_points(from, to)?;
        Ok(vlerp(&left, &right, 0.5))
    }

    fn portal_points(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> Result<([f32; 3], [f32; 3], PolyType, PolyType)> {
        let (from_tile, from_poly) = self.nav_mesh.get_tile_and_poly_by_ref(from)?;
        let (to_tile, to_poly) = self.nav_mesh.get_tile_and_poly_by_ref(to)?;
        let types = (from_poly.poly_type, to_poly.poly_type);

        let link = from_poly
            .links
            .iter()
            .find(|l| l.reference == to)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let v = from_tile.vert(from_poly.verts[link.edge as usize & 1]);
            return Ok((v, v, types.0, types.1));
        }
        if to_poly.poly_type == PolyType::OffMeshConnection {
            let back = to_poly
                .links
                .iter()
                .find(|l| l.reference == from)
                .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
            let v = to_tile.vert(to_poly.verts[back.edge as usize & 1]);
            return Ok((v, v, types.0, types.1));
        }
        if link.edge == NULL_LINK_EDGE {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let nv = from_poly.vert_count as usize;
        let e = link.edge as usize;
        let v0 = from_tile.vert(from_poly.verts[e]);
        let v1 = from_tile.vert(from_poly.verts[(e + 1) % nv]);
        if link.bmin != 0 || link.bmax != 255 {
            let s = 1.0 / 255.0;
            let left = vlerp(&v0, &v1, f32::from(link.bmin) * s);
            let right = vlerp(&v0, &v1, f32::from(link.bmax) * s);
            return Ok((left, right, types.0, types.1));
        }
        Ok((v0, v1, types.0, types.1))
    }

    /// Finds a polygon corridor from `start_ref` to `end_ref` with A*
    ///
    /// The returned status is `PartialResult` when the end could not be
    /// reached, either because it is disconnected or because the node pool
    /// ran out; the corridor then leads to the polygon closest to the end.
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<(Vec<PolyRef>, Status)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !self.nav_mesh.is_valid_poly_ref(end_ref)
            || !recast_common::vis_finite(start_pos)
            || !recast_common::vis_finite(end_pos)
            || max_path == 0
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if start_ref == end_ref {
            return Ok((vec![start_ref], Status::Success));
        }

        self.reset_search();
        let (start_idx, _) = self
            .node_for(start_ref)
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;
        let start_total = vdist(start_pos, end_pos) * H_SCALE;
        {
            let start = &mut self.nodes[start_idx];
            start.pos = *start_pos;
            start.total = start_total;
        }
        self.open_list.push(HeapNode {
            index: start_idx,
            f: start_total,
        });

        let mut last_best = start_idx;
        let mut last_best_cost = start_total;
        let mut out_of_nodes = false;
        let nav_mesh = self.nav_mesh;

        while let Some(HeapNode { index: best_idx, .. }) = self.open_list.pop() {
            if self.nodes[best_idx].state == NodeState::Closed {
                continue;
            }
            self.nodes[best_idx].state = NodeState::Closed;

            let best_ref = self.nodes[best_idx].poly;
            if best_ref == end_ref {
                last_best = best_idx;
                break;
            }

            let Ok((_, best_poly)) = nav_mesh.get_tile_and_poly_by_ref(best_ref) else {
                continue;
            };
            let parent_ref = self.nodes[best_idx].parent.map(|p| self.nodes[p].poly);
            let best_pos = self.nodes[best_idx].pos;
            let best_cost = self.nodes[best_idx].cost;

            for link in &best_poly.links {
                let neighbour_ref = link.reference;
                if Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Ok((_, neighbour_poly)) = nav_mesh.get_tile_and_poly_by_ref(neighbour_ref)
                else {
                    continue;
                };
                if !filter.pass_filter(neighbour_poly.flags) {
                    continue;
                }

                let Some((nidx, is_new)) = self.node_for(neighbour_ref) else {
                    out_of_nodes = true;
                    continue;
                };
                if is_new {
                    self.nodes[nidx].pos = self
                        .get_edge_mid_point(best_ref, neighbour_ref)
                        .unwrap_or(best_pos);
                }
                let neighbour_pos = self.nodes[nidx].pos;

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let cur = filter.get_cost(&best_pos, &neighbour_pos, best_poly.area);
                    let end = filter.get_cost(&neighbour_pos, end_pos, neighbour_poly.area);
                    (best_cost + cur + end, 0.0)
                } else {
                    let cur = filter.get_cost(&best_pos, &neighbour_pos, best_poly.area);
                    (best_cost + cur, vdist(&neighbour_pos, end_pos) * H_SCALE)
                };
                let total = cost + heuristic;

                if !is_new && total >= self.nodes[nidx].total {
                    continue;
                }

                let node = &mut self.nodes[nidx];
                node.parent = Some(best_idx);
                node.cost = cost;
                node.total = total;
                node.state = NodeState::Open;
                self.open_list.push(HeapNode { index: nidx, f: total });

                if heuristic < last_best_cost {
                    last_best_cost = heuristic;
                    last_best = nidx;
                }
            }
        }

        let mut path = Vec::new();
        let mut cur = Some(last_best);
        while let Some(idx) = cur {
            path.push(self.nodes[idx].poly);
            cur = self.nodes[idx].parent;
        }
        path.reverse();

        let mut status = Status::Success;
        if self.nodes[last_best].poly != end_ref || out_of_nodes {
            status = Status::PartialResult;
        }
        if path.len() > max_path {
            path.truncate(max_path);
            status = Status::PartialResult;
        }
        if out_of_nodes {
            log::debug!("find_path ran out of nodes after {} polygons", self.nodes.len());
        }
        Ok((path, status))
    }

    /// Finds the corner points of the funnel through `path`
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<StraightPath> {
        if path.is_empty() || max_points == 0 {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let closest_start = self.closest_point_on_poly_boundary(path[0], start_pos)?;
        let closest_end = self.closest_point_on_poly_boundary(path[path.len() - 1], end_pos)?;

        let mut sp = StraightPath::default();
        if sp.append(closest_start, StraightPathFlags::START, path[0], max_points) {
            return Ok(sp);
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut portal_left = apex;
            let mut portal_right = apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = Some(path[0]);
            let mut right_ref = Some(path[0]);

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    match self.portal_points(path[i], path[i + 1]) {
                        Ok((l, r, _, to_type)) => (l, r, to_type),
                        Err(_) => {
                            // Corridor is broken: end at the closest reachable point
                            let end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            sp.append(end, StraightPathFlags::NONE, path[i], max_points);
                            return Ok(sp);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                // Starting right on the first portal
                if i == 0 && i + 1 < path.len() {
                    let (d, _) = dist_point_segment_sqr_2d(&apex, &left, &right);
                    if d < 0.001 * 0.001 {
                        i += 1;
                        continue;
                    }
                }

                let next_ref = path.get(i + 1).copied();

                if tri_area_2d(&apex, &portal_right, &right) <= 0.0 {
                    if vequal(&apex, &portal_right) || tri_area_2d(&apex, &portal_left, &right) > 0.0
                    {
                        portal_right = right;
                        right_ref = next_ref;
                        right_type = to_type;
                        right_index = i;
                    } else {
                        apex = portal_left;
                        apex_index = left_index;
                        let flags = match (left_ref, left_type) {
                            (None, _) => StraightPathFlags::END,
                            (Some(_), PolyType::OffMeshConnection) => {
                                StraightPathFlags::OFFMESH_CONNECTION
                            }
                            _ => StraightPathFlags::NONE,
                        };
                        if sp.append(apex, flags, left_ref.unwrap_or_default(), max_points) {
                            return Ok(sp);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                if tri_area_2d(&apex, &portal_left, &left) >= 0.0 {
                    if vequal(&apex, &portal_left) || tri_area_2d(&apex, &portal_right, &left) < 0.0
                    {
                        portal_left = left;
                        left_ref = next_ref;
                        left_type = to_type;
                        left_index = i;
                    } else {
                        apex = portal_right;
                        apex_index = right_index;
                        let flags = match (right_ref, right_type) {
                            (None, _) => StraightPathFlags::END,
                            (Some(_), PolyType::OffMeshConnection) => {
                                StraightPathFlags::OFFMESH_CONNECTION
                            }
                            _ => StraightPathFlags::NONE,
                        };
                        if sp.append(apex, flags, right_ref.unwrap_or_default(), max_points) {
                            return Ok(sp);
                        }
                        portal_left = apex;
                        portal_right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        sp.append(closest_end, StraightPathFlags::END, PolyRef::new(0), max_points);
        Ok(sp)
    }

    /// Moves from `start_pos` toward `end_pos` while staying on the surface
    ///
    /// Returns the reached position and the polygons visited on the way,
    /// start first, at most [`MAX_VISITED`] of them. The y of the result
    /// is not snapped to the surface.
    pub fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<([f32; 3], Vec<PolyRef>)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !recast_common::vis_finite(start_pos)
            || !recast_common::vis_finite(end_pos)
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        // (polygon, parent) pairs
        let mut nodes: Vec<(PolyRef, Option<usize>)> = vec![(start_ref, None)];
        let mut seen = HashSet::from([start_ref]);
        let mut stack = VecDeque::from([0usize]);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = 0;

        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = (vdist(start_pos, end_pos) / 2.0 + 0.001).powi(2);

        while let Some(cur) = stack.pop_front() {
            let cur_ref = nodes[cur].0;
            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(cur_ref)?;
            let verts = tile.poly_verts(poly);

            if point_in_poly(&verts, end_pos) {
                best_node = cur;
                best_pos = *end_pos;
                break;
            }

            let nv = verts.len();
            for j in 0..nv {
                let mut neis = Vec::with_capacity(MAX_EDGE_NEIS);
                for link in poly.links.iter().filter(|l| l.edge as usize == j) {
                    if let Ok((_, npoly)) = self.nav_mesh.get_tile_and_poly_by_ref(link.reference)
                    {
                        if filter.pass_filter(npoly.flags) && neis.len() < MAX_EDGE_NEIS {
                            neis.push(link.reference);
                        }
                    }
                }

                let vj = &verts[j];
                let vi = &verts[(j + 1) % nv];
                if neis.is_empty() {
                    let (d, t) = dist_point_segment_sqr_2d(end_pos, vj, vi);
                    if d < best_dist {
                        best_pos = vlerp(vj, vi, t);
                        best_dist = d;
                        best_node = cur;
                    }
                    continue;
                }

                for nei in neis {
                    if seen.contains(&nei) {
                        continue;
                    }
                    let (d, _) = dist_point_segment_sqr_2d(&search_pos, vj, vi);
                    if d > search_rad_sqr {
                        continue;
                    }
                    if stack.len() < MAX_SURFACE_STACK {
                        seen.insert(nei);
                        nodes.push((nei, Some(cur)));
                        stack.push_back(nodes.len() - 1);
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut cur = Some(best_node);
        while let Some(idx) = cur {
            visited.push(nodes[idx].0);
            cur = nodes[idx].1;
        }
        visited.reverse();
        visited.truncate(MAX_VISITED);

        Ok((best_pos, visited))
    }

    /// Casts a ray along the surface from `start_pos` toward `end_pos`
    ///
    /// Returns the hit parameter (`f32::MAX` when the end is reached without
    /// hitting a wall), the wall normal and the polygons crossed.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<(f32, [f32; 3], Vec<PolyRef>)> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let mut t = 0.0;
        let mut path = Vec::new();
        let mut cur_ref = start_ref;

        loop {
            let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(cur_ref)?;
            let verts = tile.poly_verts(poly);
            let Some(hit) = intersect_segment_poly_2d(start_pos, end_pos, &verts) else {
                return Ok((t, [0.0; 3], path));
            };
            if hit.tmax > t {
                t = hit.tmax;
            }
            if path.len() < max_path {
                path.push(cur_ref);
            }

            let Some(seg_max) = hit.seg_max else {
                return Ok((f32::MAX, [0.0; 3], path));
            };

            let nv = verts.len();
            let va = verts[seg_max];
            let vb = verts[(seg_max + 1) % nv];
            let hit_pos = vlerp(start_pos, end_pos, hit.tmax);

            let next = poly.links.iter().find_map(|link| {
                if link.edge as usize != seg_max {
                    return None;
                }
                let (_, npoly) = self.nav_mesh.get_tile_and_poly_by_ref(link.reference).ok()?;
                if npoly.poly_type != PolyType::Ground || !filter.pass_filter(npoly.flags) {
                    return None;
                }
                if link.bmin == 0 && link.bmax == 255 {
                    return Some(link.reference);
                }
                let (_, s) = dist_point_segment_sqr_2d(&hit_pos, &va, &vb);
                let lo = f32::from(link.bmin) / 255.0 - 0.001;
                let hi = f32::from(link.bmax) / 255.0 + 0.001;
                (s >= lo && s <= hi).then_some(link.reference)
            });

            match next {
                Some(next_ref) => cur_ref = next_ref,
                None => {
                    let dx = vb[0] - va[0];
                    let dz = vb[2] - va[2];
                    let len = (dx * dx + dz * dz).sqrt().max(f32::EPSILON);
                    return Ok((t, [dz / len, 0.0, -dx / len], path));
                }
            }
        }
    }

    /// Polygons reachable from `start_ref` whose portals touch the circle
    pub fn find_polys_around_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
    ) -> Result<Vec<PolyRef>> {
        let mut found = Vec::new();
        self.dijkstra_in_circle(start_ref, center, radius, filter, |r, _| found.push(r))?;
        Ok(found)
    }

    /// Picks a random point on a polygon reachable within `max_radius` of `center`
    ///
    /// Polygons are weighted by area. The point may lie slightly outside the
    /// circle, since whole polygons are sampled.
    pub fn find_random_point_around_circle<R: Rng + ?Sized>(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
        filter: &QueryFilter,
        rng: &mut R,
    ) -> Result<(PolyRef, [f32; 3])> {
        let nav_mesh = self.nav_mesh;
        let mut area_sum = 0.0f32;
        let mut chosen: Option<PolyRef> = None;

        self.dijkstra_in_circle(start_ref, center, max_radius, filter, |r, verts| {
            if verts.len() < 3 {
                return;
            }
            let area: f32 = (2..verts.len())
                .map(|i| tri_area_2d(&verts[0], &verts[i - 1], &verts[i]).abs() * 0.5)
                .sum();
            area_sum += area;
            let u: f32 = rng.gen();
            if u * area_sum <= area {
                chosen = Some(r);
            }
        })?;

        let chosen = chosen.ok_or_else(|| Error::Detour(Status::Failure.to_string()))?;
        let (tile, poly) = nav_mesh.get_tile_and_poly_by_ref(chosen)?;
        let verts = tile.poly_verts(poly);
        let s: f32 = rng.gen();
        let t: f32 = rng.gen();
        let mut pt = random_point_in_convex_poly(&verts, s, t);
        if let Some(h) = nav_mesh.get_poly_height(chosen, &pt)? {
            pt[1] = h;
        }
        Ok((chosen, pt))
    }

    fn dijkstra_in_circle(
        &mut self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
        mut visit: impl FnMut(PolyRef, &[[f32; 3]]),
    ) -> Result<()> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref)
            || !recast_common::vis_finite(center)
            || !(radius >= 0.0 && radius.is_finite())
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let nav_mesh = self.nav_mesh;
        let (_, start_poly) = nav_mesh.get_tile_and_poly_by_ref(start_ref)?;
        if !filter.pass_filter(start_poly.flags) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        self.reset_search();
        let (start_idx, _) = self
            .node_for(start_ref)
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;
        self.nodes[start_idx].pos = *center;
        self.open_list.push(HeapNode { index: start_idx, f: 0.0 });
        let radius_sqr = radius * radius;

        while let Some(HeapNode { index: best_idx, .. }) = self.open_list.pop() {
            if self.nodes[best_idx].state == NodeState::Closed {
                continue;
            }
            self.nodes[best_idx].state = NodeState::Closed;
            let best_ref = self.nodes[best_idx].poly;
            let Ok((tile, poly)) = nav_mesh.get_tile_and_poly_by_ref(best_ref) else {
                continue;
            };
            if poly.poly_type == PolyType::Ground {
                visit(best_ref, &tile.poly_verts(poly));
            }

            let parent_ref = self.nodes[best_idx].parent.map(|p| self.nodes[p].poly);
            let best_pos = self.nodes[best_idx].pos;
            let best_total = self.nodes[best_idx].total;

            for link in &poly.links {
                let neighbour_ref = link.reference;
                if Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Ok((_, npoly)) = nav_mesh.get_tile_and_poly_by_ref(neighbour_ref) else {
                    continue;
                };
                if !filter.pass_filter(npoly.flags) {
                    continue;
                }
                let Ok((va, vb)) = self.get_portal_points(best_ref, neighbour_ref) else {
                    continue;
                };
                let (d, _) = dist_point_segment_sqr_2d(center, &va, &vb);
                if d > radius_sqr {
                    continue;
                }
                let Some((nidx, is_new)) = self.node_for(neighbour_ref) else {
                    continue;
                };
                if self.nodes[nidx].state == NodeState::Closed && !is_new {
                    continue;
                }
                if is_new {
                    self.nodes[nidx].pos = vlerp(&va, &vb, 0.5);
                }
                let total = best_total + vdist(&best_pos, &self.nodes[nidx].pos);
                if !is_new && total >= self.nodes[nidx].total {
                    continue;
                }
                let node = &mut self.nodes[nidx];
                node.parent = Some(best_idx);
                node.total = total;
                node.state = NodeState::Open;
                self.open_list.push(HeapNode { index: nidx, f: total });
            }
        }
        Ok(())
    }

    /// Edges of `reference` with no passable neighbour, as segment pairs
    pub fn get_poly_wall_segments(
        &self,
        reference: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<([f32; 3], [f32; 3])>> {
        let (tile, poly) = self.nav_mesh.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        let nv = verts.len();
        let mut segments = Vec::new();
        for j in 0..nv {
            let passable = poly.links.iter().any(|l| {
                l.edge as usize == j
                    && self
                        .nav_mesh
                        .get_tile_and_poly_by_ref(l.reference)
                        .is_ok_and(|(_, p)| filter.pass_filter(p.flags))
            });
            if !passable {
                segments.push((verts[j], verts[(j + 1) % nv]));
            }
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_exits_through_far_edge() {
        let square = [[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [1.0, 0.0, 0.0]];
        let hit = intersect_segment_poly_2d(&[0.5, 0.0, 0.5], &[1.5, 0.0, 0.5], &square).unwrap();
        assert_eq!(hit.seg_max, Some(2));
        assert!((hit.tmax - 0.5).abs() < 1e-6);

        let inside =
            intersect_segment_poly_2d(&[0.2, 0.0, 0.2], &[0.8, 0.0, 0.8], &square).unwrap();
        assert_eq!(inside.seg_max, None);
    }

    #[test]
    fn test_random_point_stays_inside() {
        let square = [[0.0, 0.0, 0.0], [0.0, 0.0, 2.0], [2.0, 0.0, 2.0], [2.0, 0.0, 0.0]];
        for (s, t) in [(0.0, 0.0), (0.3, 0.9), (0.99, 0.5), (0.5, 0.999)] {
            let p = random_point_in_convex_poly(&square, s, t);
            assert!((0.0..=2.0).contains(&p[0]) && (0.0..=2.0).contains(&p[2]), "{p:?}");
        }
    }
}
