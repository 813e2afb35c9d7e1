//! Compact heightfield: the open space above walkable spans, with
//! neighbour connectivity

use glam::Vec3;
use recast_common::{Error, Result};

use super::heightfield::{Heightfield, DIR_OFFSET_X, DIR_OFFSET_Z};
use super::{NULL_AREA, SPAN_MAX_HEIGHT};

/// Column descriptor pointing into the span array
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactCell {
    pub index: u32,
    pub count: u32,
}

/// Open span above a walkable floor
#[derive(Debug, Clone, Copy)]
pub struct CompactSpan {
    /// Floor height, in cell heights above `bmin.y`
    pub y: u16,
    /// Clearance above the floor
    pub h: u16,
    /// Neighbour span per direction, as an index within the neighbour column
    pub con: [Option<u16>; 4],
}

/// Compact heightfield built from walkable spans
#[derive(Debug, Clone)]
pub struct CompactHeightfield {
    pub width: i32,
    pub height: i32,
    pub walkable_height: i32,
    pub walkable_climb: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub cells: Vec<CompactCell>,
    pub spans: Vec<CompactSpan>,
    /// Area id per span
    pub areas: Vec<u8>,
}

impl CompactHeightfield {
    /// Builds the compact representation of every walkable span
    pub fn build(hf: &Heightfield, walkable_height: i32, walkable_climb: i32) -> Result<Self> {
        let w = hf.width;
        let h = hf.height;
        let mut cells = vec![CompactCell::default(); (w * h) as usize];
        let mut spans = Vec::new();
        let mut areas = Vec::new();

        for z in 0..h {
            for x in 0..w {
                let column = hf.column(x, z);
                let cell = &mut cells[(x + z * w) as usize];
                cell.index = spans.len() as u32;
                for (si, s) in column.iter().enumerate() {
                    if s.area == NULL_AREA {
                        continue;
                    }
                    let top = column.get(si + 1).map_or(SPAN_MAX_HEIGHT, |n| n.smin);
                    spans.push(CompactSpan {
                        y: s.smax,
                        h: top.saturating_sub(s.smax),
                        con: [None; 4],
                    });
                    areas.push(s.area);
                }
                cell.count = spans.len() as u32 - cell.index;
            }
        }

        if spans.len() > u32::MAX as usize {
            return Err(Error::Recast("too many walkable spans".to_string()));
        }

        let mut chf = Self {
            width: w,
            height: h,
            walkable_height,
            walkable_climb,
            bmin: hf.bmin,
            bmax: hf.bmax,
            cs: hf.cs,
            ch: hf.ch,
            cells,
            spans,
            areas,
        };
        chf.build_connections();
        Ok(chf)
    }

    fn build_connections(&mut self) {
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cells[(x + z * self.width) as usize];
                for i in cell.index..cell.index + cell.count {
                    let s = self.spans[i as usize];
                    let mut con = [None; 4];
                    for (dir, slot) in con.iter_mut().enumerate() {
                        let nx = x + DIR_OFFSET_X[dir];
                        let nz = z + DIR_OFFSET_Z[dir];
                        if nx < 0 || nz < 0 || nx >= self.width || nz >= self.height {
                            continue;
                        }
                        let ncell = self.cells[(nx + nz * self.width) as usize];
                        for k in 0..ncell.count {
                            let ns = self.spans[(ncell.index + k) as usize];
                            let bot = i32::from(s.y.max(ns.y));
                            let top = (i32::from(s.y) + i32::from(s.h))
                                .min(i32::from(ns.y) + i32::from(ns.h));
                            if top - bot >= self.walkable_height
                                && (i32::from(ns.y) - i32::from(s.y)).abs() <= self.walkable_climb
                            {
                                *slot = Some(k as u16);
                                break;
                            }
                        }
                    }
                    self.spans[i as usize].con = con;
                }
            }
        }
    }

    /// Cell descriptor of column `(x, z)`
    #[inline]
    pub fn cell(&self, x: i32, z: i32) -> CompactCell {
        self.cells[(x + z * self.width) as usize]
    }

    /// Global span index of the neighbour of span `i` at `(x, z)` in `dir`
    #[inline]
    pub fn neighbour(&self, x: i32, z: i32, i: usize, dir: usize) -> Option<usize> {
        let k = self.spans[i].con[dir]?;
        let ncell = self.cell(x + DIR_OFFSET_X[dir], z + DIR_OFFSET_Z[dir]);
        Some(ncell.index as usize + k as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WALKABLE_AREA;

    #[test]
    fn test_connections_respect_climb() {
        let mut hf =
            Heightfield::new(3, 1, Vec3::ZERO, Vec3::new(3.0, 10.0, 1.0), 1.0, 0.1).unwrap();
        hf.add_span(0, 0, 0, 10, WALKABLE_AREA, 1).unwrap();
        hf.add_span(1, 0, 0, 12, WALKABLE_AREA, 1).unwrap();
        hf.add_span(2, 0, 0, 30, WALKABLE_AREA, 1).unwrap();
        let chf = CompactHeightfield::build(&hf, 5, 3).unwrap();

        assert_eq!(chf.spans.len(), 3);
        // +x from the first span reaches the second (climb 2)
        assert_eq!(chf.neighbour(0, 0, 0, 2), Some(1));
        // The third is 18 cells higher
        assert_eq!(chf.neighbour(1, 0, 1, 2), None);
    }
}
