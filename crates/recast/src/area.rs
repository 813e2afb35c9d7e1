//! Walkable area marking and erosion

use super::compact_heightfield::CompactHeightfield;
use super::heightfield::{DIR_OFFSET_X, DIR_OFFSET_Z};
use super::{NULL_AREA, WALKABLE_AREA};
use recast_common::{deg_to_rad, point_in_polygon_2d};
use std::collections::VecDeque;

/// A convex polygon that stamps an area id onto the spans it covers
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ConvexVolume {
    /// Polygon outline on the xz-plane
    pub verts: Vec<[f32; 3]>,
    pub hmin: f32,
    pub hmax: f32,
    pub area: u8,
}

/// Returns an area id per triangle: walkable when the triangle's slope is
/// below `walkable_slope_angle` degrees, null otherwise
pub fn mark_walkable_triangles(walkable_slope_angle: f32, verts: &[f32], tris: &[i32]) -> Vec<u8> {
    let threshold = deg_to_rad(walkable_slope_angle).cos();
    let vert = |i: i32| {
        let b = i as usize * 3;
        [verts[b], verts[b + 1], verts[b + 2]]
    };

    tris.chunks_exact(3)
        .map(|t| {
            let v0 = vert(t[0]);
            let v1 = vert(t[1]);
            let v2 = vert(t[2]);
            let e0 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
            let e1 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];
            let n = [
                e0[1] * e1[2] - e0[2] * e1[1],
                e0[2] * e1[0] - e0[0] * e1[2],
                e0[0] * e1[1] - e0[1] * e1[0],
            ];
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            // Either winding counts; the surface only needs to face up or down
            if len > 0.0 && (n[1] / len).abs() > threshold {
                WALKABLE_AREA
            } else {
                NULL_AREA
            }
        })
        .collect()
}

/// Shrinks the walkable area by `radius` cells away from obstructions
/// and unwalkable edges
pub fn erode_walkable_area(chf: &mut CompactHeightfield, radius: i32) {
    if radius <= 0 {
        return;
    }

    let mut dist = vec![u16::MAX; chf.spans.len()];
    let mut queue = VecDeque::new();

    for z in 0..chf.height {
        for x in 0..chf.width {
            let cell = chf.cell(x, z);
            for i in cell.index as usize..(cell.index + cell.count) as usize {
                if chf.areas[i] == NULL_AREA {
                    continue;
                }
                let on_boundary = (0..4).any(|dir| match chf.neighbour(x, z, i, dir) {
                    Some(n) => chf.areas[n] == NULL_AREA,
                    None => true,
                });
                if on_boundary {
                    dist[i] = 0;
                    queue.push_back((x, z, i));
                }
            }
        }
    }

    while let Some((x, z, i)) = queue.pop_front() {
        let next = dist[i].saturating_add(1);
        if i32::from(next) >= radius {
            continue;
        }
        for dir in 0..4 {
            if let Some(n) = chf.neighbour(x, z, i, dir) {
                if chf.areas[n] != NULL_AREA && dist[n] > next {
                    dist[n] = next;
                    queue.push_back((x + DIR_OFFSET_X[dir], z + DIR_OFFSET_Z[dir], n));
                }
            }
        }
    }

    for (area, &d) in chf.areas.iter_mut().zip(&dist) {
        if i32::from(d) < radius {
            *area = NULL_AREA;
        }
    }
}

/// Stamps `volume.area` onto walkable spans whose cell centre lies inside
/// the volume and whose floor is within its height range
pub fn mark_convex_poly_area(chf: &mut CompactHeightfield, volume: &ConvexVolume) {
    if volume.verts.len() < 3 {
        return;
    }

    let mut vmin = volume.verts[0];
    let mut vmax = volume.verts[0];
    for v in &volume.verts[1..] {
        vmin[0] = vmin[0].min(v[0]);
        vmin[2] = vmin[2].min(v[2]);
        vmax[0] = vmax[0].max(v[0]);
        vmax[2] = vmax[2].max(v[2]);
    }

    let ics = 1.0 / chf.cs;
    let minx = (((vmin[0] - chf.bmin.x) * ics) as i32).max(0);
    let maxx = (((vmax[0] - chf.bmin.x) * ics) as i32).min(chf.width - 1);
    let minz = (((vmin[2] - chf.bmin.z) * ics) as i32).max(0);
    let maxz = (((vmax[2] - chf.bmin.z) * ics) as i32).min(chf.height - 1);
    let miny = ((volume.hmin - chf.bmin.y) / chf.ch).floor() as i32;
    let maxy = ((volume.hmax - chf.bmin.y) / chf.ch).ceil() as i32;

    for z in minz..=maxz {
        for x in minx..=maxx {
            let cell = chf.cell(x, z);
            for i in cell.index as usize..(cell.index + cell.count) as usize {
                if chf.areas[i] == NULL_AREA {
                    continue;
                }
                let y = i32::from(chf.spans[i].y);
                if y < miny || y > maxy {
                    continue;
                }
                let p = [
                    chf.bmin.x + (x as f32 + 0.5) * chf.cs,
                    0.0,
                    chf.bmin.z + (z as f32 + 0.5) * chf.cs,
                ];
                if point_in_polygon_2d(&p, &volume.verts) {
                    chf.areas[i] = volume.area;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Heightfield;
    use glam::Vec3;

    fn flat_chf(w: i32, h: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 10.0, h as f32),
            1.0,
            0.1,
        )
        .unwrap();
        for z in 0..h {
            for x in 0..w {
                hf.add_span(x, z, 0, 10, WALKABLE_AREA, 1).unwrap();
            }
        }
        CompactHeightfield::build(&hf, 5, 2).unwrap()
    }

    #[test]
    fn test_slope_marking() {
        let verts = [
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, // flat
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 5.0, 0.0, // wall
        ];
        let areas = mark_walkable_triangles(45.0, &verts, &[0, 1, 2, 3, 4, 5]);
        assert_eq!(areas, vec![WALKABLE_AREA, NULL_AREA]);
    }

    #[test]
    fn test_erode_removes_rings() {
        let mut chf = flat_chf(7, 7);
        erode_walkable_area(&mut chf, 2);
        let walkable: Vec<(i32, i32)> = (0..7)
            .flat_map(|z| (0..7).map(move |x| (x, z)))
            .filter(|&(x, z)| {
                let c = chf.cell(x, z);
                chf.areas[c.index as usize] != NULL_AREA
            })
            .collect();
        // Two rings removed from a 7x7 field leaves the 3x3 centre
        assert_eq!(walkable.len(), 9);
        assert!(walkable.contains(&(3, 3)));
        assert!(!walkable.contains(&(1, 3)));
    }

    #[test]
    fn test_convex_volume_marks_area() {
        let mut chf = flat_chf(4, 4);
        let volume = ConvexVolume {
            verts: vec![[0.0, 0.0, 0.0], [0.0, 0.0, 2.0], [2.0, 0.0, 2.0], [2.0, 0.0, 0.0]],
            hmin: -1.0,
            hmax: 2.0,
            area: 1,
        };
        mark_convex_poly_area(&mut chf, &volume);
        assert_eq!(chf.areas[chf.cell(0, 0).index as usize], 1);
        assert_eq!(chf.areas[chf.cell(1, 1).index as usize], 1);
        assert_eq!(chf.areas[chf.cell(3, 3).index as usize], WALKABLE_AREA);
    }
}
