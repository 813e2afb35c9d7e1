use detour::{NavMesh, NavMeshQuery, PolyRef, QueryFilter};
use recast_common::{dist_point_segment_sqr_2d, Result};

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    p: [f32; 3],
    q: [f32; 3],
    /// Squared distance to the center, for pruning
    d: f32,
}

/// Wall segments around an agent, nearest first
#[derive(Debug, Clone, Default)]
pub struct LocalBoundary {
    center: [f32; 3],
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.center = [f32::MAX; 3];
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects the walls of the polygons reachable within
    /// `collision_query_range` of `pos`
    pub fn update(
        &mut self,
        reference: PolyRef,
        pos: &[f32; 3],
        collision_query_range: f32,
        query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        self.center = *pos;
        self.segs.clear();
        self.polys.clear();
        if !reference.is_valid() {
            return Ok(());
        }

        let mut polys = query.find_polys_around_circle(reference, pos, collision_query_range, filter)?;
        polys.truncate(MAX_LOCAL_POLYS);

        let range_sqr = collision_query_range * collision_query_range;
        for &poly in &polys {
            for (p, q) in query.get_poly_wall_segments(poly, filter)? {
                let (d, _) = dist_point_segment_sqr_2d(pos, &p, &q);
                if d > range_sqr {
                    continue;
                }
                self.add_segment(Segment { p, q, d });
            }
        }
        self.polys = polys;
        Ok(())
    }

    /// Whether every polygon the walls came from still exists and passes
    /// the filter
    pub fn is_valid(&self, nav_mesh: &NavMesh, filter: &QueryFilter) -> bool {
        !self.polys.is_empty()
            && self.polys.iter().all(|&r| {
                nav_mesh
                    .get_tile_and_poly_by_ref(r)
                    .is_ok_and(|(_, poly)| filter.pass_filter(poly.flags))
            })
    }

    pub fn get_center(&self) -> &[f32; 3] {
        &self.center
    }

    pub fn get_segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Segment `i` as (start, end)
    pub fn get_segment(&self, i: usize) -> Option<([f32; 3], [f32; 3])> {
        self.segs.get(i).map(|s| (s.p, s.q))
    }

    fn add_segment(&mut self, seg: Segment) {
        let at = self.segs.partition_point(|s| s.d <= seg.d);
        if at >= MAX_LOCAL_SEGS {
            return;
        }
        self.segs.insert(at, seg);
        self.segs.truncate(MAX_LOCAL_SEGS);
    }
}
