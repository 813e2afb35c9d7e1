//! Input geometry: the triangle mesh, a chunked spatial index over it and
//! the build-time extras (convex volumes and off-mesh links)

use std::path::PathBuf;

use detour::PolyFlags;
use recast::ConvexVolume;
use recast_common::{overlap_rect_2d, Error, Result, TriMesh};

/// Triangles per leaf of the chunked index
pub const TRIS_PER_CHUNK: usize = 256;

/// Where a build reads its geometry from
#[derive(Debug, Clone, PartialEq)]
pub enum BuildSource {
    /// Wavefront OBJ file on disk
    Path(PathBuf),
    /// OBJ text held in memory
    ObjBytes(Vec<u8>),
}

/// A traversal link baked into the tile holding its start point
#[derive(Debug, Clone, PartialEq)]
pub struct OffMeshLink {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub radius: f32,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: PolyFlags,
}

#[derive(Debug, Clone, Copy)]
struct ChunkyNode {
    bmin: [f32; 2],
    bmax: [f32; 2],
    /// Leaf: first triangle. Internal: negated escape offset.
    i: i32,
    n: usize,
}

#[derive(Debug, Clone, Copy)]
struct BoundsItem {
    bmin: [f32; 2],
    bmax: [f32; 2],
    tri: usize,
}

/// Bounding volume tree over triangle xz-bounds, stored flat in
/// depth-first order with escape offsets
#[derive(Debug, Clone, Default)]
pub struct ChunkyTriMesh {
    nodes: Vec<ChunkyNode>,
    tris: Vec<i32>,
    max_tris_per_chunk: usize,
}

impl ChunkyTriMesh {
    pub fn build(verts: &[f32], tris: &[i32], tris_per_chunk: usize) -> Self {
        let vert = |i: i32| {
            let b = i as usize * 3;
            [verts[b], verts[b + 2]]
        };
        let mut items: Vec<BoundsItem> = tris
            .chunks_exact(3)
            .enumerate()
            .map(|(tri, t)| {
                let mut bmin = vert(t[0]);
                let mut bmax = bmin;
                for &v in &t[1..] {
                    let p = vert(v);
                    for k in 0..2 {
                        bmin[k] = bmin[k].min(p[k]);
                        bmax[k] = bmax[k].max(p[k]);
                    }
                }
                BoundsItem { bmin, bmax, tri }
            })
            .collect();

        let mut chunky = Self {
            nodes: Vec::new(),
            tris: Vec::with_capacity(tris.len()),
            max_tris_per_chunk: 0,
        };
        chunky.subdivide(&mut items, tris_per_chunk.max(1), tris);
        chunky
    }

    fn subdivide(&mut self, items: &mut [BoundsItem], tris_per_chunk: usize, in_tris: &[i32]) {
        let icur = self.nodes.len();
        let (bmin, bmax) = extents(items);
        self.nodes.push(ChunkyNode {
            bmin,
            bmax,
            i: 0,
            n: 0,
        });

        if items.len() <= tris_per_chunk {
            let node = &mut self.nodes[icur];
            node.i = (self.tris.len() / 3) as i32;
            node.n = items.len();
            for item in items.iter() {
                self.tris
                    .extend_from_slice(&in_tris[item.tri * 3..item.tri * 3 + 3]);
            }
            self.max_tris_per_chunk = self.max_tris_per_chunk.max(items.len());
            return;
        }

        let axis = if bmax[0] - bmin[0] >= bmax[1] - bmin[1] { 0 } else { 1 };
        items.sort_by(|a, b| a.bmin[axis].total_cmp(&b.bmin[axis]));
        let (left, right) = items.split_at_mut(items.len() / 2);
        self.subdivide(left, tris_per_chunk, in_tris);
        self.subdivide(right, tris_per_chunk, in_tris);

        let escape = self.nodes.len() - icur;
        self.nodes[icur].i = -(escape as i32);
    }

    /// Leaf chunks whose bounds overlap the xz rectangle
    pub fn chunks_overlapping_rect(&self, bmin: [f32; 2], bmax: [f32; 2]) -> Vec<usize> {
        let mut ids = Vec::new();
        let mut i = 0;
        while i < self.nodes.len() {
            let node = &self.nodes[i];
            let overlap = overlap_rect_2d(&bmin, &bmax, &node.bmin, &node.bmax);
            let leaf = node.i >= 0;
            if leaf && overlap && node.n > 0 {
                ids.push(i);
            }
            if overlap || leaf {
                i += 1;
            } else {
                i += node.i.unsigned_abs() as usize;
            }
        }
        ids
    }

    /// Triangle indices of chunk `id`
    pub fn chunk_tris(&self, id: usize) -> &[i32] {
        match self.nodes.get(id) {
            Some(node) if node.i >= 0 => {
                let start = node.i as usize * 3;
                &self.tris[start..start + node.n * 3]
            }
            _ => &[],
        }
    }

    pub fn max_tris_per_chunk(&self) -> usize {
        self.max_tris_per_chunk
    }
}

fn extents(items: &[BoundsItem]) -> ([f32; 2], [f32; 2]) {
    let mut bmin = [f32::MAX; 2];
    let mut bmax = [f32::MIN; 2];
    for item in items {
        for k in 0..2 {
            bmin[k] = bmin[k].min(item.bmin[k]);
            bmax[k] = bmax[k].max(item.bmax[k]);
        }
    }
    (bmin, bmax)
}

/// Geometry and build extras of one client
#[derive(Debug, Clone)]
pub struct InputGeom {
    mesh: TriMesh,
    chunky: ChunkyTriMesh,
    bmin: [f32; 3],
    bmax: [f32; 3],
    volumes: Vec<ConvexVolume>,
    off_mesh_links: Vec<OffMeshLink>,
}

impl InputGeom {
    /// Loads the mesh from `source` and indexes it
    pub fn load(source: &BuildSource) -> Result<Self> {
        let mesh = match source {
            BuildSource::Path(path) => TriMesh::from_obj(path)?,
            BuildSource::ObjBytes(bytes) => TriMesh::from_obj_bytes(bytes)?,
        };
        Self::from_mesh(mesh)
    }

    pub fn from_mesh(mesh: TriMesh) -> Result<Self> {
        if mesh.tri_count == 0 {
            return Err(Error::InvalidMesh("input mesh has no triangles".to_string()));
        }
        let (bmin, bmax) = mesh.calculate_bounds();
        let chunky = ChunkyTriMesh::build(&mesh.vertices, &mesh.indices, TRIS_PER_CHUNK);
        log::debug!(
            "indexed {} triangles into chunks of at most {}",
            mesh.tri_count,
            chunky.max_tris_per_chunk()
        );
        Ok(Self {
            mesh,
            chunky,
            bmin: bmin.to_array(),
            bmax: bmax.to_array(),
            volumes: Vec::new(),
            off_mesh_links: Vec::new(),
        })
    }

    pub fn mesh(&self) -> &TriMesh {
        &self.mesh
    }

    /// Bounds of the mesh vertices
    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        (self.bmin, self.bmax)
    }

    /// Indices of the triangles whose chunk overlaps the xz rectangle
    pub fn triangles_in_rect(&self, bmin: [f32; 2], bmax: [f32; 2]) -> Vec<i32> {
        self.chunky
            .chunks_overlapping_rect(bmin, bmax)
            .into_iter()
            .flat_map(|id| self.chunky.chunk_tris(id).iter().copied())
            .collect()
    }

    pub fn volumes(&self) -> &[ConvexVolume] {
        &self.volumes
    }

    pub fn set_volumes(&mut self, volumes: Vec<ConvexVolume>) {
        self.volumes = volumes;
    }

    pub fn off_mesh_links(&self) -> &[OffMeshLink] {
        &self.off_mesh_links
    }

    pub fn set_off_mesh_links(&mut self, links: Vec<OffMeshLink>) {
        self.off_mesh_links = links;
    }
}
