//! Velocity sampling obstacle avoidance
//!
//! Candidate velocities are scored by how far they stray from the desired
//! and current velocity, which side of other agents they pass, and how soon
//! they hit a neighbouring agent or wall. The cheapest candidate wins.

use std::f32::consts::PI;

use recast_common::{dist_point_segment_sqr_2d, sqr};

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

/// Neighbouring agent treated as a moving circle
#[derive(Debug, Clone, Default)]
pub struct ObstacleCircle {
    pub p: [f32; 3],
    pub vel: [f32; 3],
    pub dvel: [f32; 3],
    pub rad: f32,
    /// Direction to the obstacle, used for side selection
    dp: [f32; 3],
    /// Preferred passing side
    np: [f32; 3],
}

/// Wall segment near the agent
#[derive(Debug, Clone, Default)]
pub struct ObstacleSegment {
    pub p: [f32; 3],
    pub q: [f32; 3],
    /// The agent is touching the segment
    touch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ObstacleAvoidanceParams {
    pub vel_bias: f32,
    pub weight_des_vel: f32,
    pub weight_cur_vel: f32,
    pub weight_side: f32,
    pub weight_toi: f32,
    pub horiz_time: f32,
    pub grid_size: u8,
    pub adaptive_divs: u8,
    pub adaptive_rings: u8,
    pub adaptive_depth: u8,
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

/// Scores candidate velocities against the circles and segments added
/// since the last [`ObstacleAvoidanceQuery::reset`]
#[derive(Debug)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,
    max_circles: usize,
    circles: Vec<ObstacleCircle>,
    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    pub fn add_circle(&mut self, pos: &[f32; 3], rad: f32, vel: &[f32; 3], dvel: &[f32; 3]) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: *pos,
            vel: *vel,
            dvel: *dvel,
            rad,
            ..ObstacleCircle::default()
        });
    }

    pub fn add_segment(&mut self, p: &[f32; 3], q: &[f32; 3]) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment {
            p: *p,
            q: *q,
            touch: false,
        });
    }

    pub fn circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Samples a regular grid of velocities around the biased desired velocity
    ///
    /// Returns the chosen velocity and the number of samples taken.
    pub fn sample_velocity_grid(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
    ) -> ([f32; 3], usize) {
        self.prepare(pos, dvel, vmax, params);

        let mut nvel = [0.0; 3];
        let gs = params.grid_size.max(2) as usize;
        let cvx = dvel[0] * params.vel_bias;
        let cvz = dvel[2] * params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - params.vel_bias) / (gs - 1) as f32;
        let half = (gs - 1) as f32 * cs * 0.5;

        let mut min_penalty = f32::MAX;
        let mut ns = 0;
        for y in 0..gs {
            for x in 0..gs {
                let vcand = [cvx + x as f32 * cs - half, 0.0, cvz + y as f32 * cs - half];
                if sqr(vcand[0]) + sqr(vcand[2]) > sqr(vmax + cs / 2.0) {
                    continue;
                }
                let penalty = self.process_sample(&vcand, cs, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }
        (nvel, ns)
    }

    /// Samples rings of velocities around the desired direction, then
    /// refines around the best one `adaptive_depth` times
    ///
    /// Returns the chosen velocity and the number of samples taken.
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: &[f32; 3],
        rad: f32,
        vmax: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        params: &ObstacleAvoidanceParams,
    ) -> ([f32; 3], usize) {
        self.prepare(pos, dvel, vmax, params);

        let ndivs = (params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
        let nrings = (params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
        let depth = params.adaptive_depth as usize;

        let da = (1.0 / ndivs as f32) * PI * 2.0;
        let (sa, ca) = da.sin_cos();

        // Desired direction, and the same rotated half a division
        let d0 = normalize_2d(dvel);
        let d1 = rotate_2d(&d0, da * 0.5);
        let dirs = [d0, d1];

        let mut pattern: Vec<[f32; 2]> = Vec::with_capacity(1 + nrings * ndivs);
        pattern.push([0.0, 0.0]);
        for j in 0..nrings {
            let r = (nrings - j) as f32 / nrings as f32;
            let d = dirs[j % 2];
            let first = [d[0] * r, d[2] * r];
            pattern.push(first);
            let mut last1 = first;
            let mut last2 = first;
            for _ in (1..ndivs.saturating_sub(1)).step_by(2) {
                let left = [last1[0] * ca + last1[1] * sa, -last1[0] * sa + last1[1] * ca];
                let right = [last2[0] * ca - last2[1] * sa, last2[0] * sa + last2[1] * ca];
                pattern.push(left);
                pattern.push(right);
                last1 = left;
                last2 = right;
            }
            if ndivs & 1 == 0 {
                pattern.push([last2[0] * ca - last2[1] * sa, last2[0] * sa + last2[1] * ca]);
            }
        }

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = [dvel[0] * params.vel_bias, 0.0, dvel[2] * params.vel_bias];
        let mut ns = 0;

        for _ in 0..depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = [0.0; 3];
            for pat in &pattern {
                let vcand = [res[0] + pat[0] * cr, 0.0, res[2] + pat[1] * cr];
                if sqr(vcand[0]) + sqr(vcand[2]) > sqr(vmax + 0.001) {
                    continue;
                }
                let penalty = self.process_sample(&vcand, cr / 10.0, pos, rad, vel, dvel, min_penalty);
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }
            res = bvel;
            cr *= 0.5;
        }
        (res, ns)
    }

    fn prepare(&mut self, pos: &[f32; 3], dvel: &[f32; 3], vmax: f32, params: &ObstacleAvoidanceParams) {
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };

        for cir in &mut self.circles {
            cir.dp = normalize_2d(&[cir.p[0] - pos[0], 0.0, cir.p[2] - pos[2]]);
            let dv = [cir.dvel[0] - dvel[0], 0.0, cir.dvel[2] - dvel[2]];
            // Pass on the side the relative motion is already heading to
            let a = recast_common::tri_area_2d(&[0.0; 3], &cir.dp, &dv);
            cir.np = if a < 0.01 {
                [-cir.dp[2], 0.0, cir.dp[0]]
            } else {
                [cir.dp[2], 0.0, -cir.dp[0]]
            };
        }

        for seg in &mut self.segments {
            let (d, _) = dist_point_segment_sqr_2d(pos, &seg.p, &seg.q);
            seg.touch = d < sqr(0.01);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: &[f32; 3],
        _cs: f32,
        pos: &[f32; 3],
        rad: f32,
        vel: &[f32; 3],
        dvel: &[f32; 3],
        min_penalty: f32,
    ) -> f32 {
        let p = &self.params;
        let vpen = p.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = p.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        // Time of impact below which this sample cannot beat the best one
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (p.weight_toi / min_pen - 0.1) * p.horiz_time;
        if t_threshold - p.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        let mut tmin = p.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // Reciprocal velocity
            let vab = [
                vcand[0] * 2.0 - vel[0] - cir.vel[0],
                0.0,
                vcand[2] * 2.0 - vel[2] - cir.vel[2],
            ];
            side += (dot_2d(&cir.dp, &vab) * 0.5 + 0.5)
                .min(dot_2d(&cir.np, &vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, &vab, &cir.p, cir.rad) else {
                continue;
            };
            // Already overlapping: push apart
            if htmin < 0.0 && htmax > 0.0 {
                htmin = -htmin * 0.5;
            }
            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let mut htmin = if seg.touch {
                let sdir = [seg.q[0] - seg.p[0], 0.0, seg.q[2] - seg.p[2]];
                let snorm = [-sdir[2], 0.0, sdir[0]];
                // Moving away from the wall
                if dot_2d(&snorm, vcand) < 0.0 {
                    continue;
                }
                0.0
            } else {
                match isect_ray_seg(pos, vcand, &seg.p, &seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };
            htmin *= 2.0;
            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        if nside > 0 {
            side /= nside as f32;
        }
        let spen = p.weight_side * side;
        let tpen = p.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));

        vpen + vcpen + spen + tpen
    }
}

fn dot_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

fn dist_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    (sqr(b[0] - a[0]) + sqr(b[2] - a[2])).sqrt()
}

fn perp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

fn normalize_2d(v: &[f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[2] * v[2]).sqrt();
    if len > 0.0001 {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0; 3]
    }
}

fn rotate_2d(v: &[f32; 3], ang: f32) -> [f32; 3] {
    let (s, c) = ang.sin_cos();
    [v[0] * c - v[2] * s, 0.0, v[0] * s + v[2] * c]
}

/// Entry and exit times of a circle moving with `v` through another circle
fn sweep_circle_circle(
    c0: &[f32; 3],
    r0: f32,
    v: &[f32; 3],
    c1: &[f32; 3],
    r1: f32,
) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = [c1[0] - c0[0], 0.0, c1[2] - c0[2]];
    let r = r0 + r1;
    let c = dot_2d(&s, &s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, &s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Ray parameter where the ray `ap + t * u` crosses segment `bp..bq`
fn isect_ray_seg(ap: &[f32; 3], u: &[f32; 3], bp: &[f32; 3], bq: &[f32; 3]) -> Option<f32> {
    let v = [bq[0] - bp[0], 0.0, bq[2] - bp[2]];
    let w = [ap[0] - bp[0], 0.0, ap[2] - bp[2]];
    let d = perp_2d(u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    let d = 1.0 / d;
    let t = perp_2d(&v, &w) * d;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, &w) * d;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_keeps_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = [2.0, 0.0, 0.0];
        let params = ObstacleAvoidanceParams::default();
        let (nvel, ns) =
            query.sample_velocity_adaptive(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params);
        assert!(ns > 0);
        assert!(dist_2d(&nvel, &dvel) < 0.3, "got {nvel:?}");
    }

    #[test]
    fn test_head_on_agent_is_avoided() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let dvel = [2.0, 0.0, 0.0];
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[-2.0, 0.0, 0.0], &[-2.0, 0.0, 0.0]);
        assert_eq!(query.circle_count(), 1);

        let params = ObstacleAvoidanceParams::default();
        let (nvel, _) = query.sample_velocity_grid(&[0.0; 3], 0.5, 2.0, &dvel, &dvel, &params);
        // Steers sideways or slows down rather than ploughing ahead
        assert!(nvel[2].abs() > 0.1 || nvel[0] < 1.5, "got {nvel:?}");
    }

    #[test]
    fn test_capacity_limits() {
        let mut query = ObstacleAvoidanceQuery::new(1, 1);
        query.add_circle(&[1.0, 0.0, 0.0], 0.5, &[0.0; 3], &[0.0; 3]);
        query.add_circle(&[2.0, 0.0, 0.0], 0.5, &[0.0; 3], &[0.0; 3]);
        query.add_segment(&[0.0; 3], &[1.0, 0.0, 0.0]);
        query.add_segment(&[0.0; 3], &[0.0, 0.0, 1.0]);
        assert_eq!((query.circle_count(), query.segment_count()), (1, 1));
        query.reset();
        assert_eq!((query.circle_count(), query.segment_count()), (0, 0));
    }

    #[test]
    fn test_ray_segment_intersection() {
        let t = isect_ray_seg(&[0.0; 3], &[2.0, 0.0, 0.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]);
        assert!((t.unwrap() - 0.5).abs() < 1e-5);
        assert!(isect_ray_seg(&[0.0; 3], &[0.0, 0.0, 1.0], &[1.0, 0.0, -1.0], &[1.0, 0.0, 1.0]).is_none());
    }
}
