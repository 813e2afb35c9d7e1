//! Span heightfield and walkable span filters

use glam::Vec3;
use recast_common::{Error, Result};

use super::{NULL_AREA, SPAN_MAX_HEIGHT};

/// Direction offsets along x for the 4-neighbourhood (-x, +z, +x, -z)
pub const DIR_OFFSET_X: [i32; 4] = [-1, 0, 1, 0];
/// Direction offsets along z for the 4-neighbourhood (-x, +z, +x, -z)
pub const DIR_OFFSET_Z: [i32; 4] = [0, 1, 0, -1];

/// A solid span in a heightfield column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Span {
    /// Lower limit of the span, in cell heights above `bmin.y`
    pub smin: u16,
    /// Upper limit of the span; the walkable floor when `area` is set
    pub smax: u16,
    /// Area id of the span's top surface
    pub area: u8,
}

/// Dynamic heightfield of solid spans
///
/// Columns keep their spans sorted bottom to top with no overlaps.
#[derive(Debug, Clone)]
pub struct Heightfield {
    pub width: i32,
    pub height: i32,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    columns: Vec<Vec<Span>>,
}

impl Heightfield {
    /// Creates an empty heightfield
    pub fn new(width: i32, height: i32, bmin: Vec3, bmax: Vec3, cs: f32, ch: f32) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::Recast(format!(
                "heightfield dimensions must be positive, got {width}x{height}"
            )));
        }
        Ok(Self {
            width,
            height,
            bmin,
            bmax,
            cs,
            ch,
            columns: vec![Vec::new(); (width * height) as usize],
        })
    }

    /// Spans of column `(x, z)`, bottom to top
    #[inline]
    pub fn column(&self, x: i32, z: i32) -> &[Span] {
        &self.columns[(x + z * self.width) as usize]
    }

    /// Total number of spans
    pub fn span_count(&self) -> usize {
        self.columns.iter().map(Vec::len).sum()
    }

    /// Adds a span, merging it with any spans it overlaps
    ///
    /// When the tops of merged spans are within `flag_merge_threshold`, the
    /// higher area id wins.
    pub fn add_span(
        &mut self,
        x: i32,
        z: i32,
        smin: u16,
        smax: u16,
        area: u8,
        flag_merge_threshold: i32,
    ) -> Result<()> {
        if x < 0 || z < 0 || x >= self.width || z >= self.height {
            return Err(Error::Recast(format!("span ({x}, {z}) outside heightfield")));
        }
        if smin > smax {
            return Err(Error::Recast(format!("inverted span {smin}..{smax}")));
        }

        let column = &mut self.columns[(x + z * self.width) as usize];
        let mut new_span = Span { smin, smax, area };

        let mut i = 0;
        while i < column.len() {
            let cur = column[i];
            if cur.smin > new_span.smax {
                break;
            }
            if cur.smax < new_span.smin {
                i += 1;
                continue;
            }

            if cur.smin < new_span.smin {
                new_span.smin = cur.smin;
            }
            if cur.smax > new_span.smax {
                new_span.smax = cur.smax;
            }
            if (i32::from(new_span.smax) - i32::from(cur.smax)).abs() <= flag_merge_threshold {
                new_span.area = new_span.area.max(cur.area);
            }
            column.remove(i);
        }
        column.insert(i, new_span);
        Ok(())
    }

    /// Marks non-walkable spans as walkable when their top is within
    /// `walkable_climb` of the walkable span directly below
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: i32) {
        for column in &mut self.columns {
            let mut previous_walkable = false;
            let mut previous_area = NULL_AREA;
            let mut previous_smax = 0i32;
            for span in column.iter_mut() {
                let walkable = span.area != NULL_AREA;
                if !walkable
                    && previous_walkable
                    && (i32::from(span.smax) - previous_smax).abs() <= walkable_climb
                {
                    span.area = previous_area;
                }
                previous_walkable = walkable;
                previous_area = span.area;
                previous_smax = i32::from(span.smax);
            }
        }
    }

    /// Removes walkable spans next to a drop higher than `walkable_climb`,
    /// or whose accessible neighbours are too uneven
    pub fn filter_ledge_spans(&mut self, walkable_height: i32, walkable_climb: i32) {
        let max_height = i32::from(SPAN_MAX_HEIGHT);
        let mut to_clear = Vec::new();

        for z in 0..self.height {
            for x in 0..self.width {
                let column = self.column(x, z);
                for (si, span) in column.iter().enumerate() {
                    if span.area == NULL_AREA {
                        continue;
                    }
                    let bot = i32::from(span.smax);
                    let top = column
                        .get(si + 1)
                        .map_or(max_height, |next| i32::from(next.smin));

                    let mut min_neighbor_height = max_height;
                    let mut accessible_min = bot;
                    let mut accessible_max = bot;

                    for dir in 0..4 {
                        let dx = x + DIR_OFFSET_X[dir];
                        let dz = z + DIR_OFFSET_Z[dir];
                        if dx < 0 || dz < 0 || dx >= self.width || dz >= self.height {
                            min_neighbor_height = min_neighbor_height.min(-walkable_climb - bot);
                            continue;
                        }

                        let neighbor = self.column(dx, dz);
                        let nbot = -walkable_climb;
                        let ntop = neighbor
                            .first()
                            .map_or(max_height, |n| i32::from(n.smin));
                        if top.min(ntop) - bot.max(nbot) > walkable_height {
                            min_neighbor_height = min_neighbor_height.min(nbot - bot);
                        }

                        for (ni, n) in neighbor.iter().enumerate() {
                            let nbot = i32::from(n.smax);
                            let ntop = neighbor
                                .get(ni + 1)
                                .map_or(max_height, |next| i32::from(next.smin));
                            if top.min(ntop) - bot.max(nbot) > walkable_height {
                                min_neighbor_height = min_neighbor_height.min(nbot - bot);
                                if (nbot - bot).abs() <= walkable_climb {
                                    accessible_min = accessible_min.min(nbot);
                                    accessible_max = accessible_max.max(nbot);
                                }
                            }
                        }
                    }

                    if min_neighbor_height < -walkable_climb
                        || accessible_max - accessible_min > walkable_climb
                    {
                        to_clear.push(((x + z * self.width) as usize, si));
                    }
                }
            }
        }

        for (column, si) in to_clear {
            self.columns[column][si].area = NULL_AREA;
        }
    }

    /// Removes walkable spans without `walkable_height` of clearance above
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: i32) {
        let max_height = i32::from(SPAN_MAX_HEIGHT);
        for column in &mut self.columns {
            for si in 0..column.len() {
                let bot = i32::from(column[si].smax);
                let top = column
                    .get(si + 1)
                    .map_or(max_height, |next| i32::from(next.smin));
                if top - bot < walkable_height {
                    column[si].area = NULL_AREA;
                }
            }
        }
    }
}
