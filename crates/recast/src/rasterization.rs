//! Triangle rasterization into a span heightfield
//!
//! Each triangle is clipped against every cell row and then every cell it
//! overlaps; the vertical extent of the clipped polygon becomes a span.

use super::heightfield::Heightfield;
use super::SPAN_MAX_HEIGHT;
use recast_common::{Error, Result};

/// Keeps the part of `poly` where `axis >= offset` (`keep_above`) or
/// `axis <= offset`.
fn clip_poly(poly: &[[f32; 3]], axis: usize, offset: f32, keep_above: bool) -> Vec<[f32; 3]> {
    let mut out = Vec::with_capacity(poly.len() + 2);
    let n = poly.len();
    if n == 0 {
        return out;
    }
    let side = |p: &[f32; 3]| {
        let d = p[axis] - offset;
        if keep_above { d } else { -d }
    };

    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        let da = side(&a);
        let db = side(&b);
        if da >= 0.0 {
            out.push(a);
        }
        if (da >= 0.0) != (db >= 0.0) {
            let t = da / (da - db);
            out.push([
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
            ]);
        }
    }
    out
}

/// Rasterizes a single triangle into the heightfield
pub fn rasterize_triangle(
    hf: &mut Heightfield,
    v0: [f32; 3],
    v1: [f32; 3],
    v2: [f32; 3],
    area: u8,
    flag_merge_threshold: i32,
) -> Result<()> {
    let bmin = hf.bmin;
    let bmax = hf.bmax;
    let tri = [v0, v1, v2];

    let mut tmin = v0;
    let mut tmax = v0;
    for v in &tri[1..] {
        for axis in 0..3 {
            tmin[axis] = tmin[axis].min(v[axis]);
            tmax[axis] = tmax[axis].max(v[axis]);
        }
    }
    if tmin[0] > bmax.x
        || tmax[0] < bmin.x
        || tmin[1] > bmax.y
        || tmax[1] < bmin.y
        || tmin[2] > bmax.z
        || tmax[2] < bmin.z
    {
        return Ok(());
    }

    let ics = 1.0 / hf.cs;
    let ich = 1.0 / hf.ch;
    let by = bmax.y - bmin.y;

    let z0 = (((tmin[2] - bmin.z) * ics).floor() as i32).clamp(0, hf.height - 1);
    let z1 = (((tmax[2] - bmin.z) * ics).floor() as i32).clamp(0, hf.height - 1);

    for z in z0..=z1 {
        let cz = bmin.z + z as f32 * hf.cs;
        let row = clip_poly(&tri, 2, cz, true);
        let row = clip_poly(&row, 2, cz + hf.cs, false);
        if row.len() < 3 {
            continue;
        }

        let (mut rmin, mut rmax) = (row[0][0], row[0][0]);
        for p in &row[1..] {
            rmin = rmin.min(p[0]);
            rmax = rmax.max(p[0]);
        }
        let x0 = (((rmin - bmin.x) * ics).floor() as i32).clamp(0, hf.width - 1);
        let x1 = (((rmax - bmin.x) * ics).floor() as i32).clamp(0, hf.width - 1);

        for x in x0..=x1 {
            let cx = bmin.x + x as f32 * hf.cs;
            let cell = clip_poly(&row, 0, cx, true);
            let cell = clip_poly(&cell, 0, cx + hf.cs, false);
            if cell.len() < 3 {
                continue;
            }

            let mut smin = cell[0][1];
            let mut smax = cell[0][1];
            for p in &cell[1..] {
                smin = smin.min(p[1]);
                smax = smax.max(p[1]);
            }
            smin -= bmin.y;
            smax -= bmin.y;
            if smax < 0.0 || smin > by {
                continue;
            }
            let smin = smin.max(0.0);
            let smax = smax.min(by);

            let max = i32::from(SPAN_MAX_HEIGHT);
            let ismin = ((smin * ich).floor() as i32).clamp(0, max);
            let ismax = ((smax * ich).ceil() as i32).clamp(ismin + 1, max);
            hf.add_span(x, z, ismin as u16, ismax as u16, area, flag_merge_threshold)?;
        }
    }

    Ok(())
}

/// Rasterizes indexed triangles with per-triangle area ids
pub fn rasterize_triangles(
    hf: &mut Heightfield,
    verts: &[f32],
    tris: &[i32],
    areas: &[u8],
    flag_merge_threshold: i32,
) -> Result<()> {
    if tris.len() % 3 != 0 || areas.len() != tris.len() / 3 {
        return Err(Error::Recast(format!(
            "{} indices do not match {} triangle areas",
            tris.len(),
            areas.len()
        )));
    }

    let vert = |i: i32| -> Result<[f32; 3]> {
        let base = usize::try_from(i)
            .ok()
            .map(|i| i * 3)
            .filter(|&b| b + 2 < verts.len())
            .ok_or_else(|| Error::Recast(format!("vertex index {i} out of range")))?;
        Ok([verts[base], verts[base + 1], verts[base + 2]])
    };

    for (tri, &area) in tris.chunks_exact(3).zip(areas) {
        rasterize_triangle(
            hf,
            vert(tri[0])?,
            vert(tri[1])?,
            vert(tri[2])?,
            area,
            flag_merge_threshold,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;
    use glam::Vec3;

    #[test]
    fn test_rasterize_flat_quad_covers_every_cell() {
        let mut hf =
            Heightfield::new(4, 4, Vec3::ZERO, Vec3::new(4.0, 2.0, 4.0), 1.0, 0.1).unwrap();
        let verts = [0.0, 1.0, 0.0, 4.0, 1.0, 0.0, 4.0, 1.0, 4.0, 0.0, 1.0, 4.0];
        let tris = [0, 1, 2, 0, 2, 3];
        rasterize_triangles(&mut hf, &verts, &tris, &[WALKABLE_AREA; 2], 1).unwrap();

        for z in 0..4 {
            for x in 0..4 {
                let column = hf.column(x, z);
                assert_eq!(column.len(), 1, "cell ({x}, {z})");
                assert_eq!(column[0].smax, 11);
                assert_eq!(column[0].area, WALKABLE_AREA);
            }
        }
    }

    #[test]
    fn test_triangle_outside_bounds_is_ignored() {
        let mut hf =
            Heightfield::new(2, 2, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0), 1.0, 0.1).unwrap();
        rasterize_triangle(
            &mut hf,
            [10.0, 0.0, 10.0],
            [11.0, 0.0, 10.0],
            [10.0, 0.0, 11.0],
            WALKABLE_AREA,
            1,
        )
        .unwrap();
        assert_eq!(hf.span_count(), 0);
    }

    #[test]
    fn test_mismatched_areas_rejected() {
        let mut hf =
            Heightfield::new(2, 2, Vec3::ZERO, Vec3::new(2.0, 2.0, 2.0), 1.0, 0.1).unwrap();
        let verts = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        assert!(rasterize_triangles(&mut hf, &verts, &[0, 1, 2], &[], 1).is_err());
        assert!(rasterize_triangles(&mut hf, &verts, &[0, 1, 7], &[1], 1).is_err());
    }
}
