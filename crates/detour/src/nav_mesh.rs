//! Navigation mesh implementation for Detour
//!
//! The navigation mesh is a fixed-capacity array of tile slots. Each slot
//! carries a salt that is bumped whenever its tile is removed, so polygon
//! references into a removed or rebuilt tile stop validating.

use std::collections::HashMap;

use super::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, Status, DT_EXT_LINK, MAX_VERTS_PER_POLY,
};
use recast_common::{
    closest_point_on_segment_2d, dist_point_segment_sqr_2d, ilog2, next_pow2, point_in_polygon_2d,
    vdist_sqr, Error, Result,
};

/// Reference to a tile slot: a [`PolyRef`] whose polygon index is zero
pub type TileRef = u32;

/// Link edge/side marker for links that do not sit on a polygon edge
pub const NULL_LINK_EDGE: u8 = 0xff;

/// Off-mesh connection may be traversed in both directions
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Smallest salt width that still detects stale references reliably
const MIN_SALT_BITS: u32 = 10;

/// Tolerance for matching edges that lie on the same line
const EDGE_EPS: f32 = 0.01;

/// Link between two polygons
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Link {
    /// Reference to the connected polygon
    pub reference: PolyRef,
    /// Edge of the owning polygon the link sits on, or [`NULL_LINK_EDGE`]
    pub edge: u8,
    /// Tile side for links crossing a tile border, or [`NULL_LINK_EDGE`]
    pub side: u8,
    /// Start of the shared portal along the edge, 0..=255
    pub bmin: u8,
    /// End of the shared portal along the edge, 0..=255
    pub bmax: u8,
}

/// Polygon in the navigation mesh
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// Outgoing links, rebuilt whenever the tile or a neighbour changes
    pub links: Vec<Link>,
    /// Vertex indices into the tile's vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per-edge portal flags: `DT_EXT_LINK | side` on tile borders, 0 otherwise
    pub neis: [u16; MAX_VERTS_PER_POLY],
    pub flags: PolyFlags,
    pub vert_count: u8,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Creates a new polygon
    pub fn new(area: u8, poly_type: PolyType, flags: PolyFlags) -> Self {
        Self {
            area,
            poly_type,
            flags,
            ..Self::default()
        }
    }
}

/// Off-mesh connection between two points on the mesh
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    /// Start and end positions
    pub pos: [f32; 6],
    /// Snap radius at the endpoints
    pub rad: f32,
    /// Index of the connection's polygon within the tile
    pub poly: u16,
    /// [`OFFMESH_CON_BIDIR`] or 0
    pub flags: u8,
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn start(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    pub fn end(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }
}

/// Tile header information
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    /// Tile position (x, y, layer)
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    /// Bounding box of the tile
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Agent dimensions in world units the tile was built for
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub poly_count: usize,
    pub vert_count: usize,
    pub off_mesh_con_count: usize,
}

impl TileHeader {
    /// Creates a new tile header
    pub fn new(x: i32, y: i32, layer: i32) -> Self {
        Self {
            x,
            y,
            layer,
            bmin: [0.0; 3],
            bmax: [0.0; 3],
            walkable_height: 0.0,
            walkable_radius: 0.0,
            walkable_climb: 0.0,
            poly_count: 0,
            vert_count: 0,
            off_mesh_con_count: 0,
        }
    }
}

/// Mesh tile in the navigation mesh
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct MeshTile {
    /// Salt of the slot holding the tile
    pub salt: u32,
    /// Present while the slot is occupied
    pub header: Option<TileHeader>,
    pub polys: Vec<Poly>,
    /// Vertices [x,y,z,...]
    pub verts: Vec<f32>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
    /// Next free slot in the free list
    next: Option<usize>,
}

impl MeshTile {
    /// Creates a new empty mesh tile
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of vertex `i`
    #[inline]
    pub fn vert(&self, i: u16) -> [f32; 3] {
        let b = i as usize * 3;
        [self.verts[b], self.verts[b + 1], self.verts[b + 2]]
    }

    /// Vertex positions of `poly`, in winding order
    pub fn poly_verts(&self, poly: &Poly) -> Vec<[f32; 3]> {
        poly.verts[..poly.vert_count as usize]
            .iter()
            .map(|&v| self.vert(v))
            .collect()
    }

    /// Number of ground polygons in the tile
    pub fn ground_poly_count(&self) -> usize {
        self.polys
            .iter()
            .filter(|p| p.poly_type == PolyType::Ground)
            .count()
    }

    fn poly_bounds(&self, poly: &Poly) -> ([f32; 3], [f32; 3]) {
        let mut bmin = [f32::MAX; 3];
        let mut bmax = [f32::MIN; 3];
        for v in self.poly_verts(poly) {
            for k in 0..3 {
                bmin[k] = bmin[k].min(v[k]);
                bmax[k] = bmax[k].max(v[k]);
            }
        }
        (bmin, bmax)
    }
}

/// Surface height of a triangle at `p`, when `p` lies inside it on the xz-plane
fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;
    let v0 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let v1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v2 = [p[0] - a[0], 0.0, p[2] - a[2]];

    let mut denom = v0[0] * v1[2] - v0[2] * v1[0];
    if denom.abs() < EPS {
        return None;
    }
    let mut u = v1[2] * v2[0] - v1[0] * v2[2];
    let mut v = v0[0] * v2[2] - v0[2] * v2[0];
    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    let tol = EPS * denom;
    if u >= -tol && v >= -tol && u + v <= denom + tol {
        Some(a[1] + (v0[1] * u + v1[1] * v) / denom)
    } else {
        None
    }
}

/// Height of a convex polygon at `pos`, via a triangle fan
pub(crate) fn poly_height(verts: &[[f32; 3]], pos: &[f32; 3]) -> Option<f32> {
    (1..verts.len().saturating_sub(1))
        .find_map(|i| closest_height_point_triangle(pos, &verts[0], &verts[i], &verts[i + 1]))
}

/// Opposite tile side
#[inline]
pub fn opposite_side(side: u8) -> u8 {
    (side + 4) & 0x7
}

/// Tile grid offset of a side (0 = +x, 2 = +z, 4 = -x, 6 = -z)
pub fn side_offset(side: u8) -> (i32, i32) {
    match side & 0x7 {
        0 => (1, 0),
        1 => (1, 1),
        2 => (0, 1),
        3 => (-1, 1),
        4 => (-1, 0),
        5 => (-1, -1),
        6 => (0, -1),
        _ => (1, -1),
    }
}

/// Polygon on an edge candidate list: reference and overlap along the edge
struct EdgeContact {
    reference: PolyRef,
    tmin: f32,
    tmax: f32,
}

/// Parameter of `p` along `a -> b` on the xz-plane
fn edge_param(a: &[f32; 3], b: &[f32; 3], p: &[f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    let d = dx * dx + dz * dz;
    if d <= 0.0 {
        return 0.0;
    }
    ((p[0] - a[0]) * dx + (p[2] - a[2]) * dz) / d
}

/// Portal overlap of edge `a-b` and an opposite edge `c-d`, as parameters on `a-b`
fn edge_overlap(
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
    d: &[f32; 3],
    climb: f32,
) -> Option<(f32, f32)> {
    let len = ((b[0] - a[0]).powi(2) + (b[2] - a[2]).powi(2)).sqrt();
    if len <= EDGE_EPS {
        return None;
    }
    // Both endpoints of c-d must lie on the line through a-b
    let line_dist = |p: &[f32; 3]| {
        ((b[0] - a[0]) * (p[2] - a[2]) - (b[2] - a[2]) * (p[0] - a[0])).abs() / len
    };
    if line_dist(c) > EDGE_EPS || line_dist(d) > EDGE_EPS {
        return None;
    }
    let tc = edge_param(a, b, c);
    let td = edge_param(a, b, d);
    // Opposite winding only
    if tc <= td {
        return None;
    }
    let tmin = td.max(0.0);
    let tmax = tc.min(1.0);
    if (tmax - tmin) * len <= EDGE_EPS {
        return None;
    }

    let height_on = |p: &[f32; 3], q: &[f32; 3], t: f32| p[1] + (q[1] - p[1]) * t;
    for t in [tmin, tmax] {
        let ya = height_on(a, b, t);
        let s = if (tc - td).abs() > f32::EPSILON {
            (t - td) / (tc - td)
        } else {
            0.0
        };
        let yb = height_on(d, c, s);
        if (ya - yb).abs() > climb {
            return None;
        }
    }
    Some((tmin, tmax))
}

#[inline]
fn quantize(t: f32) -> u8 {
    (t.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// A navigation mesh made of tiles
#[derive(Debug, Clone)]
pub struct NavMesh {
    params: NavMeshParams,
    tile_bits: u32,
    poly_bits: u32,
    salt_bits: u32,
    tiles: Vec<MeshTile>,
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
    next_free: Option<usize>,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if params.max_tiles == 0
            || params.max_polys_per_tile == 0
            || params.tile_width <= 0.0
            || params.tile_height <= 0.0
        {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let tile_bits = ilog2(next_pow2(params.max_tiles));
        let poly_bits = ilog2(next_pow2(params.max_polys_per_tile));
        let salt_bits = 32u32.saturating_sub(tile_bits + poly_bits).min(31);
        if salt_bits < MIN_SALT_BITS {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        let max_tiles = params.max_tiles as usize;
        let mut tiles = Vec::with_capacity(max_tiles);
        for i in 0..max_tiles {
            tiles.push(MeshTile {
                salt: 1,
                next: (i + 1 < max_tiles).then_some(i + 1),
                ..MeshTile::default()
            });
        }

        log::debug!(
            "navmesh created: {} tiles ({tile_bits} bits), {} polys per tile ({poly_bits} bits), {salt_bits} salt bits",
            params.max_tiles,
            params.max_polys_per_tile
        );

        Ok(Self {
            params,
            tile_bits,
            poly_bits,
            salt_bits,
            tiles,
            pos_lookup: HashMap::new(),
            next_free: Some(0),
        })
    }

    /// Gets the navigation mesh parameters
    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Number of occupied tile slots
    pub fn tile_count(&self) -> usize {
        self.tiles.iter().filter(|t| t.header.is_some()).count()
    }

    /// Occupied tiles with their slot index
    pub fn tiles(&self) -> impl Iterator<Item = (usize, &MeshTile)> {
        self.tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| t.header.is_some())
    }

    /// Tile in slot `index`, if occupied
    pub fn tile_by_index(&self, index: usize) -> Option<&MeshTile> {
        self.tiles.get(index).filter(|t| t.header.is_some())
    }

    /// Encodes a polygon reference
    #[inline]
    pub fn encode_poly_ref(&self, salt: u32, tile: u32, poly: u32) -> PolyRef {
        PolyRef::new(
            (salt << (self.poly_bits + self.tile_bits)) | (tile << self.poly_bits) | poly,
        )
    }

    /// Decodes a polygon reference into (salt, tile, poly)
    #[inline]
    pub fn decode_poly_ref(&self, reference: PolyRef) -> (u32, u32, u32) {
        let id = reference.id();
        let salt_mask = (1u32 << self.salt_bits) - 1;
        let tile_mask = (1u32 << self.tile_bits) - 1;
        let poly_mask = (1u32 << self.poly_bits) - 1;
        (
            (id >> (self.poly_bits + self.tile_bits)) & salt_mask,
            (id >> self.poly_bits) & tile_mask,
            id & poly_mask,
        )
    }

    /// Base polygon reference of the tile in slot `index`
    pub fn poly_ref_base(&self, index: usize) -> PolyRef {
        let salt = self.tiles.get(index).map_or(0, |t| t.salt);
        self.encode_poly_ref(salt, index as u32, 0)
    }

    /// Tile reference of the tile in slot `index`
    pub fn tile_ref(&self, index: usize) -> TileRef {
        self.poly_ref_base(index).id()
    }

    /// Grid location of the tile containing `pos`
    pub fn calc_tile_loc(&self, pos: &[f32; 3]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    /// Slot indices of all layers at grid location `(x, y)`
    pub fn tile_indices_at(&self, x: i32, y: i32) -> &[usize] {
        self.pos_lookup.get(&(x, y)).map_or(&[], Vec::as_slice)
    }

    /// Tile at grid location `(x, y, layer)`
    pub fn tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.tile_index_at(x, y, layer).map(|i| &self.tiles[i])
    }

    /// Tile reference at grid location `(x, y, layer)`
    pub fn tile_ref_at(&self, x: i32, y: i32, layer: i32) -> Option<TileRef> {
        self.tile_index_at(x, y, layer).map(|i| self.tile_ref(i))
    }

    fn tile_index_at(&self, x: i32, y: i32, layer: i32) -> Option<usize> {
        self.tile_indices_at(x, y)
            .iter()
            .copied()
            .find(|&i| self.tiles[i].header.as_ref().is_some_and(|h| h.layer == layer))
    }

    /// Checks that `reference` points at an existing polygon of a live tile
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(reference).is_ok()
    }

    /// Resolves a polygon reference
    pub fn get_tile_and_poly_by_ref(&self, reference: PolyRef) -> Result<(&MeshTile, &Poly)> {
        let (tile, poly) = self.resolve(reference)?;
        Ok((&self.tiles[tile], &self.tiles[tile].polys[poly]))
    }

    /// Slot and polygon index of `reference`
    pub(crate) fn resolve(&self, reference: PolyRef) -> Result<(usize, usize)> {
        if !reference.is_valid() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        let (salt, it, ip) = self.decode_poly_ref(reference);
        let tile = self
            .tiles
            .get(it as usize)
            .filter(|t| t.header.is_some() && t.salt == salt)
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        if ip as usize >= tile.polys.len() {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        Ok((it as usize, ip as usize))
    }

    /// Off-mesh connection backing polygon `reference`
    pub fn get_off_mesh_connection_by_ref(&self, reference: PolyRef) -> Option<&OffMeshConnection> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference).ok()?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return None;
        }
        let (_, _, ip) = self.decode_poly_ref(reference);
        tile.off_mesh_connections
            .iter()
            .find(|con| u32::from(con.poly) == ip)
    }

    /// Entry and exit points of an off-mesh connection when arriving from `prev_ref`
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> Result<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return Err(Error::Detour(Status::Failure.to_string()));
        }

        let (mut idx0, mut idx1) = (0, 1);
        if let Some(link) = poly.links.iter().find(|l| l.edge == 0) {
            if link.reference != prev_ref {
                idx0 = 1;
                idx1 = 0;
            }
        }
        Ok((tile.vert(poly.verts[idx0]), tile.vert(poly.verts[idx1])))
    }

    /// Surface height of polygon `reference` at `pos`
    pub fn get_poly_height(&self, reference: PolyRef, pos: &[f32; 3]) -> Result<Option<f32>> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        let verts = tile.poly_verts(poly);
        if poly.poly_type == PolyType::OffMeshConnection {
            let (_, t) = dist_point_segment_sqr_2d(pos, &verts[0], &verts[1]);
            return Ok(Some(verts[0][1] + (verts[1][1] - verts[0][1]) * t));
        }
        Ok(poly_height(&verts, pos))
    }

    /// Closest point on polygon `reference` to `pos`, and whether `pos` lies over it
    pub fn closest_point_on_poly(
        &self,
        reference: PolyRef,
        pos: &[f32; 3],
    ) -> Result<([f32; 3], bool)> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(reference)?;
        Ok(Self::closest_point_on_tile_poly(tile, poly, pos))
    }

    pub(crate) fn closest_point_on_tile_poly(
        tile: &MeshTile,
        poly: &Poly,
        pos: &[f32; 3],
    ) -> ([f32; 3], bool) {
        let verts = tile.poly_verts(poly);
        if poly.poly_type == PolyType::OffMeshConnection {
            return (closest_point_on_segment_2d(pos, &verts[0], &verts[1]), false);
        }
        if let Some(h) = poly_height(&verts, pos) {
            return ([pos[0], h, pos[2]], true);
        }
        (closest_point_on_boundary(&verts, pos), false)
    }

    /// Nearest polygon to `center` within `half_extents` in one tile
    fn find_nearest_poly_in_tile(
        &self,
        tile_index: usize,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        let tile = &self.tiles[tile_index];
        let header = tile.header.as_ref()?;
        let qmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let qmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];
        let base = self.poly_ref_base(tile_index);

        let mut best: Option<(PolyRef, [f32; 3], f32)> = None;
        for (ip, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            let (bmin, bmax) = tile.poly_bounds(poly);
            if !recast_common::overlap_bounds(&qmin, &qmax, &bmin, &bmax) {
                continue;
            }
            let (pt, over) = Self::closest_point_on_tile_poly(tile, poly, center);
            let d = if over {
                let dy = ((center[1] - pt[1]).abs() - header.walkable_climb).max(0.0);
                dy * dy
            } else {
                vdist_sqr(center, &pt)
            };
            if best.as_ref().map_or(true, |b| d < b.2) {
                best = Some((PolyRef::new(base.id() | ip as u32), pt, d));
            }
        }
        best.map(|(r, p, _)| (r, p))
    }

    /// Adds a tile and links it with its neighbours
    ///
    /// Fails with `AlreadyExists` when a tile occupies the same
    /// `(x, y, layer)` and with `OutOfMemory` when all slots are taken.
    pub fn add_tile(&mut self, mut tile: MeshTile) -> Result<TileRef> {
        let header = tile
            .header
            .clone()
            .ok_or_else(|| Error::Detour(Status::InvalidParam.to_string()))?;
        if tile.polys.len() > (1usize << self.poly_bits) {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }
        if self.tile_index_at(header.x, header.y, header.layer).is_some() {
            return Err(Error::Detour(Status::AlreadyExists.to_string()));
        }
        let index = self
            .next_free
            .ok_or_else(|| Error::Detour(Status::OutOfMemory.to_string()))?;

        self.next_free = self.tiles[index].next;
        tile.salt = self.tiles[index].salt;
        tile.next = None;
        for poly in &mut tile.polys {
            poly.links.clear();
        }
        self.tiles[index] = tile;
        self.pos_lookup
            .entry((header.x, header.y))
            .or_default()
            .push(index);

        self.connect_int_links(index);
        self.base_off_mesh_links(index);
        self.connect_ext_off_mesh_links(index, index);

        // Other layers in the same column
        let same_column: Vec<usize> = self
            .tile_indices_at(header.x, header.y)
            .iter()
            .copied()
            .filter(|&i| i != index)
            .collect();
        for other in same_column {
            self.connect_ext_off_mesh_links(index, other);
            self.connect_ext_off_mesh_links(other, index);
        }

        for side in 0..8u8 {
            let (dx, dy) = side_offset(side);
            let neighbours = self.tile_indices_at(header.x + dx, header.y + dy).to_vec();
            for other in neighbours {
                if side % 2 == 0 {
                    self.connect_ext_links(index, other, side);
                    self.connect_ext_links(other, index, opposite_side(side));
                }
                self.connect_ext_off_mesh_links(index, other);
                self.connect_ext_off_mesh_links(other, index);
            }
        }

        Ok(self.tile_ref(index))
    }

    /// Removes a tile, unlinking it from its neighbours
    ///
    /// The slot's salt is bumped so that references into the removed tile
    /// no longer validate.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Result<MeshTile> {
        let (salt, it, _) = self.decode_poly_ref(PolyRef::new(tile_ref));
        let index = it as usize;
        let valid = self
            .tiles
            .get(index)
            .is_some_and(|t| t.header.is_some() && t.salt == salt);
        if !valid {
            return Err(Error::Detour(Status::InvalidParam.to_string()));
        }

        if let Some(header) = self.tiles[index].header.as_ref() {
            let key = (header.x, header.y);
            if let Some(list) = self.pos_lookup.get_mut(&key) {
                list.retain(|&i| i != index);
                if list.is_empty() {
                    self.pos_lookup.remove(&key);
                }
            }
        }

        let (tile_bits, poly_bits) = (self.tile_bits, self.poly_bits);
        let tile_mask = (1u32 << tile_bits) - 1;
        for tile in self.tiles.iter_mut().filter(|t| t.header.is_some()) {
            for poly in &mut tile.polys {
                poly.links
                    .retain(|l| ((l.reference.id() >> poly_bits) & tile_mask) != it);
            }
        }

        let mut removed = std::mem::take(&mut self.tiles[index]);
        for poly in &mut removed.polys {
            poly.links.clear();
        }

        let salt_mask = (1u32 << self.salt_bits) - 1;
        let mut next_salt = (salt + 1) & salt_mask;
        if next_salt == 0 {
            next_salt = 1;
        }
        self.tiles[index].salt = next_salt;
        self.tiles[index].next = self.next_free;
        self.next_free = Some(index);

        Ok(removed)
    }

    /// Links ground polygons of one tile that share an edge segment
    fn connect_int_links(&mut self, index: usize) {
        let tile = &self.tiles[index];
        let Some(climb) = tile.header.as_ref().map(|h| h.walkable_climb) else {
            return;
        };
        let base = self.poly_ref_base(index).id();
        let bounds: Vec<_> = tile.polys.iter().map(|p| tile.poly_bounds(p)).collect();

        let mut new_links: Vec<(usize, Link)> = Vec::new();
        for (ip, poly) in tile.polys.iter().enumerate() {
            if poly.poly_type != PolyType::Ground {
                continue;
            }
            let nv = poly.vert_count as usize;
            for j in 0..nv {
                if poly.neis[j] & DT_EXT_LINK != 0 {
                    continue;
                }
                let va = tile.vert(poly.verts[j]);
                let vb = tile.vert(poly.verts[(j + 1) % nv]);

                for (iq, other) in tile.polys.iter().enumerate() {
                    if iq == ip || other.poly_type != PolyType::Ground {
                        continue;
                    }
                    let (omin, omax) = bounds[iq];
                    let (pmin, pmax) = bounds[ip];
                    if omin[0] > pmax[0] + EDGE_EPS
                        || omax[0] < pmin[0] - EDGE_EPS
                        || omin[2] > pmax[2] + EDGE_EPS
                        || omax[2] < pmin[2] - EDGE_EPS
                    {
                        continue;
                    }
                    let onv = other.vert_count as usize;
                    for k in 0..onv {
                        if other.neis[k] & DT_EXT_LINK != 0 {
                            continue;
                        }
                        let vc = tile.vert(other.verts[k]);
                        let vd = tile.vert(other.verts[(k + 1) % onv]);
                        if let Some((tmin, tmax)) = edge_overlap(&va, &vb, &vc, &vd, climb) {
                            new_links.push((
                                ip,
                                Link {
                                    reference: PolyRef::new(base | iq as u32),
                                    edge: j as u8,
                                    side: NULL_LINK_EDGE,
                                    bmin: quantize(tmin),
                                    bmax: quantize(tmax),
                                },
                            ));
                        }
                    }
                }
            }
        }

        let tile = &mut self.tiles[index];
        for (ip, link) in new_links {
            tile.polys[ip].links.push(link);
        }
    }

    /// Links border edges of tile `index` on `side` to tile `target`
    fn connect_ext_links(&mut self, index: usize, target: usize, side: u8) {
        let (Some(header), Some(target_header)) = (
            self.tiles[index].header.as_ref(),
            self.tiles[target].header.as_ref(),
        ) else {
            return;
        };
        let climb = header.walkable_climb.max(target_header.walkable_climb);
        let tile = &self.tiles[index];
        let target_tile = &self.tiles[target];
        let target_base = self.poly_ref_base(target).id();
        let wanted = DT_EXT_LINK | u16::from(opposite_side(side));

        let mut new_links: Vec<(usize, Link)> = Vec::new();
        for (ip, poly) in tile.polys.iter().enumerate() {
            let nv = poly.vert_count as usize;
            for j in 0..nv {
                if poly.neis[j] != DT_EXT_LINK | u16::from(side) {
                    continue;
                }
                let va = tile.vert(poly.verts[j]);
                let vb = tile.vert(poly.verts[(j + 1) % nv]);

                let contacts = target_tile.polys.iter().enumerate().flat_map(|(iq, other)| {
                    let onv = other.vert_count as usize;
                    (0..onv).filter_map(move |k| {
                        if other.neis[k] != wanted {
                            return None;
                        }
                        let vc = target_tile.vert(other.verts[k]);
                        let vd = target_tile.vert(other.verts[(k + 1) % onv]);
                        edge_overlap(&va, &vb, &vc, &vd, climb).map(|(tmin, tmax)| EdgeContact {
                            reference: PolyRef::new(target_base | iq as u32),
                            tmin,
                            tmax,
                        })
                    })
                });
                for contact in contacts {
                    new_links.push((
                        ip,
                        Link {
                            reference: contact.reference,
                            edge: j as u8,
                            side,
                            bmin: quantize(contact.tmin),
                            bmax: quantize(contact.tmax),
                        },
                    ));
                }
            }
        }

        let tile = &mut self.tiles[index];
        for (ip, link) in new_links {
            tile.polys[ip].links.push(link);
        }
    }

    /// Links the start of every off-mesh connection in tile `index` to the
    /// ground polygon below it
    fn base_off_mesh_links(&mut self, index: usize) {
        let Some(climb) = self.tiles[index].header.as_ref().map(|h| h.walkable_climb) else {
            return;
        };
        let base = self.poly_ref_base(index).id();
        let cons = self.tiles[index].off_mesh_connections.clone();

        for con in cons {
            let ext = [con.rad, climb, con.rad];
            let Some((land_ref, nearest)) =
                self.find_nearest_poly_in_tile(index, &con.start(), &ext)
            else {
                continue;
            };
            if (nearest[0] - con.pos[0]).powi(2) + (nearest[2] - con.pos[2]).powi(2)
                > con.rad * con.rad
            {
                continue;
            }

            let con_ref = PolyRef::new(base | u32::from(con.poly));
            let (_, _, land_ip) = self.decode_poly_ref(land_ref);
            let tile = &mut self.tiles[index];
            let Some(con_poly) = tile.polys.get(con.poly as usize) else {
                continue;
            };
            let v = con_poly.verts[0] as usize * 3;
            tile.verts[v..v + 3].copy_from_slice(&nearest);

            tile.polys[con.poly as usize].links.push(Link {
                reference: land_ref,
                edge: 0,
                side: NULL_LINK_EDGE,
                bmin: 0,
                bmax: 0,
            });
            tile.polys[land_ip as usize].links.push(Link {
                reference: con_ref,
                edge: NULL_LINK_EDGE,
                side: NULL_LINK_EDGE,
                bmin: 0,
                bmax: 0,
            });
        }
    }

    /// Links the end of every off-mesh connection owned by tile `target`
    /// that lands inside tile `index`
    fn connect_ext_off_mesh_links(&mut self, index: usize, target: usize) {
        let Some(header) = self.tiles[index].header.clone() else {
            return;
        };
        if self.tiles[target].header.is_none() {
            return;
        }
        let target_base = self.poly_ref_base(target).id();
        let cons = self.tiles[target].off_mesh_connections.clone();

        for con in cons {
            let end = con.end();
            if end[0] < header.bmin[0]
                || end[0] > header.bmax[0]
                || end[2] < header.bmin[2]
                || end[2] > header.bmax[2]
            {
                continue;
            }
            let ext = [con.rad, header.walkable_climb, con.rad];
            let Some((land_ref, nearest)) = self.find_nearest_poly_in_tile(index, &end, &ext)
            else {
                continue;
            };
            if (nearest[0] - end[0]).powi(2) + (nearest[2] - end[2]).powi(2) > con.rad * con.rad {
                continue;
            }

            let con_ref = PolyRef::new(target_base | u32::from(con.poly));
            {
                let target_tile = &mut self.tiles[target];
                let Some(con_poly) = target_tile.polys.get(con.poly as usize) else {
                    continue;
                };
                let v = con_poly.verts[1] as usize * 3;
                target_tile.verts[v..v + 3].copy_from_slice(&nearest);
                target_tile.polys[con.poly as usize].links.push(Link {
                    reference: land_ref,
                    edge: 1,
                    side: NULL_LINK_EDGE,
                    bmin: 0,
                    bmax: 0,
                });
            }

            if con.flags & OFFMESH_CON_BIDIR != 0 {
                let (_, _, land_ip) = self.decode_poly_ref(land_ref);
                self.tiles[index].polys[land_ip as usize]
                    .links
                    .push(Link {
                        reference: con_ref,
                        edge: NULL_LINK_EDGE,
                        side: NULL_LINK_EDGE,
                        bmin: 0,
                        bmax: 0,
                    });
            }
        }
    }

    /// Updates the flags of a polygon
    pub fn set_poly_flags(&mut self, reference: PolyRef, flags: PolyFlags) -> Result<()> {
        let (tile, poly) = self.resolve(reference)?;
        self.tiles[tile].polys[poly].flags = flags;
        Ok(())
    }

    /// Slot indices of tiles whose grid cell overlaps `bmin..bmax`
    pub(crate) fn tiles_in_bounds(&self, bmin: &[f32; 3], bmax: &[f32; 3]) -> Vec<usize> {
        let (minx, miny) = self.calc_tile_loc(bmin);
        let (maxx, maxy) = self.calc_tile_loc(bmax);
        let mut out = Vec::new();
        for y in miny..=maxy {
            for x in minx..=maxx {
                out.extend_from_slice(self.tile_indices_at(x, y));
            }
        }
        out
    }

    /// Nearest polygon among all tiles touching the query box
    pub(crate) fn find_nearest_poly_in_bounds(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        pass: impl Fn(&Poly) -> bool,
    ) -> Option<(PolyRef, [f32; 3])> {
        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        let mut best: Option<(PolyRef, [f32; 3], f32)> = None;
        for index in self.tiles_in_bounds(&bmin, &bmax) {
            let tile = &self.tiles[index];
            let Some(header) = tile.header.as_ref() else {
                continue;
            };
            let base = self.poly_ref_base(index).id();
            for (ip, poly) in tile.polys.iter().enumerate() {
                if poly.poly_type != PolyType::Ground || !pass(poly) {
                    continue;
                }
                let (pmin, pmax) = tile.poly_bounds(poly);
                if !recast_common::overlap_bounds(&bmin, &bmax, &pmin, &pmax) {
                    continue;
                }
                let (pt, over) = Self::closest_point_on_tile_poly(tile, poly, center);
                let d = if over {
                    let dy = ((center[1] - pt[1]).abs() - header.walkable_climb).max(0.0);
                    dy * dy
                } else {
                    vdist_sqr(center, &pt)
                };
                if best.as_ref().map_or(true, |b| d < b.2) {
                    best = Some((PolyRef::new(base | ip as u32), pt, d));
                }
            }
        }
        best.map(|(r, p, _)| (r, p))
    }
}

/// Closest point on the outline of a polygon, with interpolated height
pub(crate) fn closest_point_on_boundary(verts: &[[f32; 3]], pos: &[f32; 3]) -> [f32; 3] {
    let n = verts.len();
    let mut best = verts.first().copied().unwrap_or(*pos);
    let mut best_d = f32::MAX;
    for i in 0..n {
        let a = &verts[i];
        let b = &verts[(i + 1) % n];
        let (d, t) = dist_point_segment_sqr_2d(pos, a, b);
        if d < best_d {
            best_d = d;
            best = [
                a[0] + (b[0] - a[0]) * t,
                a[1] + (b[1] - a[1]) * t,
                a[2] + (b[2] - a[2]) * t,
            ];
        }
    }
    best
}

/// Checks whether `pos` lies inside the polygon outline on the xz-plane
pub(crate) fn point_in_poly(verts: &[[f32; 3]], pos: &[f32; 3]) -> bool {
    point_in_polygon_2d(pos, verts)
}
