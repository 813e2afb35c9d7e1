//! Scalar and vector helpers operating on `[f32; 3]` positions

/// Squares a value
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Clamps a value to the range [min, max]
#[inline]
pub fn clamp<T: PartialOrd>(v: T, min: T, max: T) -> T {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

/// Returns the next power of two greater than or equal to `x`
pub fn next_pow2(x: u32) -> u32 {
    if x <= 1 {
        return 1;
    }
    let mut v = x - 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v.wrapping_add(1)
}

/// Integer base-2 logarithm (floor)
pub fn ilog2(x: u32) -> u32 {
    if x == 0 { 0 } else { 31 - x.leading_zeros() }
}

/// Degrees to radians
#[inline]
pub fn deg_to_rad(deg: f32) -> f32 {
    deg * std::f32::consts::PI / 180.0
}

#[inline]
pub fn vadd(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &[f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Scaled vector addition: `a + b * s`
#[inline]
pub fn vmad(a: &[f32; 3], b: &[f32; 3], s: f32) -> [f32; 3] {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

/// Linear interpolation between two points
#[inline]
pub fn vlerp(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
    ]
}

#[inline]
pub fn vdot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Dot product on the xz-plane
#[inline]
pub fn vdot_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

#[inline]
pub fn vlen(v: &[f32; 3]) -> f32 {
    vdot(v, v).sqrt()
}

#[inline]
pub fn vlen_sqr(v: &[f32; 3]) -> f32 {
    vdot(v, v)
}

#[inline]
pub fn vdist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vlen(&vsub(b, a))
}

#[inline]
pub fn vdist_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vlen_sqr(&vsub(b, a))
}

/// Normalizes a vector, returning zero for degenerate input
pub fn vnormalize(v: &[f32; 3]) -> [f32; 3] {
    let len = vlen(v);
    if len > f32::EPSILON {
        vscale(v, 1.0 / len)
    } else {
        [0.0; 3]
    }
}

#[inline]
pub fn vmin(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

/// Checks that two points are within `r` on the xz-plane and `h` vertically
#[inline]
pub fn in_range(a: &[f32; 3], b: &[f32; 3], r: f32, h: f32) -> bool {
    let dx = b[0] - a[0];
    let dy = b[1] - a[1];
    let dz = b[2] - a[2];
    (dx * dx + dz * dz) < r * r && dy.abs() < h
}

/// Checks that every component is finite
#[inline]
pub fn vis_finite(v: &[f32; 3]) -> bool {
    v.iter().all(|c| c.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_pow2() {
        assert_eq!(next_pow2(0), 1);
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(3), 4);
        assert_eq!(next_pow2(196), 256);
        assert_eq!(next_pow2(256), 256);
    }

    #[test]
    fn test_ilog2() {
        assert_eq!(ilog2(1), 0);
        assert_eq!(ilog2(256), 8);
        assert_eq!(ilog2(255), 7);
    }

    #[test]
    fn test_in_range_respects_vertical_tolerance() {
        let a = [0.0, 0.0, 0.0];
        assert!(in_range(&a, &[0.5, 0.5, 0.0], 1.0, 1.0));
        assert!(!in_range(&a, &[0.5, 1.5, 0.0], 1.0, 1.0));
        assert!(!in_range(&a, &[1.5, 0.0, 0.0], 1.0, 1.0));
    }
}
