//! Triangle soup loading from Wavefront OBJ data

use crate::{Error, Result};
use glam::Vec3;

#[cfg(feature = "std")]
use std::path::Path;

/// A simple indexed triangle mesh
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    /// Flat vertex array `[x, y, z, ...]`
    pub vertices: Vec<f32>,
    /// Triangle indices, 3 per triangle
    pub indices: Vec<i32>,
    /// Number of vertices
    pub vert_count: usize,
    /// Number of triangles
    pub tri_count: usize,
}

impl TriMesh {
    /// Creates a new empty triangle mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a mesh from an OBJ file on disk
    #[cfg(feature = "std")]
    pub fn from_obj<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_obj_str(&content)
    }

    /// Parses OBJ content held in memory
    ///
    /// ```
    /// use recast_common::TriMesh;
    ///
    /// let mesh = TriMesh::from_obj_bytes(b"v 0 0 0\nv 1 0 0\nv 0 0 1\nf 1 2 3\n").unwrap();
    /// assert_eq!(mesh.tri_count, 1);
    /// ```
    pub fn from_obj_bytes(data: &[u8]) -> Result<Self> {
        let content = std::str::from_utf8(data)
            .map_err(|e| Error::InvalidMesh(format!("OBJ data is not UTF-8: {e}")))?;
        Self::from_obj_str(content)
    }

    /// Parses OBJ content from a string
    pub fn from_obj_str(content: &str) -> Result<Self> {
        let mut mesh = Self::new();
        for (line_no, line) in content.lines().enumerate() {
            mesh.parse_line(line)
                .map_err(|e| Error::InvalidMesh(format!("line {}: {e}", line_no + 1)))?;
        }
        mesh.validate()?;
        Ok(mesh)
    }

    fn parse_line(&mut self, line: &str) -> std::result::Result<(), String> {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("v") => {
                let mut coords = [0.0f32; 3];
                for (axis, c) in coords.iter_mut().enumerate() {
                    let token = tokens
                        .next()
                        .ok_or_else(|| format!("vertex is missing coordinate {axis}"))?;
                    *c = token
                        .parse::<f32>()
                        .map_err(|_| format!("vertex coordinate '{token}' is not a number"))?;
                }
                self.vertices.extend_from_slice(&coords);
                self.vert_count += 1;
            }
            Some("f") => {
                let mut face = Vec::with_capacity(4);
                for token in tokens {
                    let index_str = token.split('/').next().unwrap_or_default();
                    let index = index_str
                        .parse::<i32>()
                        .map_err(|_| format!("face index '{index_str}' is not a number"))?;
                    // Negative indices are relative to the current end of the vertex list
                    let resolved = if index < 0 {
                        self.vert_count as i32 + index
                    } else {
                        index - 1
                    };
                    face.push(resolved);
                }
                if face.len() < 3 {
                    return Err("face has fewer than 3 vertices".to_string());
                }
                for i in 1..face.len() - 1 {
                    self.indices
                        .extend_from_slice(&[face[0], face[i], face[i + 1]]);
                    self.tri_count += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let vert_count = self.vert_count as i32;
        if let Some(bad) = self.indices.iter().find(|&&i| i < 0 || i >= vert_count) {
            return Err(Error::InvalidMesh(format!(
                "triangle index {bad} out of range (vertex count {vert_count})"
            )));
        }
        Ok(())
    }

    /// Returns vertex `i` as a position
    #[inline]
    pub fn vertex(&self, i: usize) -> [f32; 3] {
        [
            self.vertices[i * 3],
            self.vertices[i * 3 + 1],
            self.vertices[i * 3 + 2],
        ]
    }

    /// Calculates the axis-aligned bounding box of the mesh
    pub fn calculate_bounds(&self) -> (Vec3, Vec3) {
        if self.vert_count == 0 {
            return (Vec3::ZERO, Vec3::ZERO);
        }
        let mut bmin = Vec3::splat(f32::MAX);
        let mut bmax = Vec3::splat(f32::MIN);
        for v in self.vertices.chunks_exact(3) {
            let p = Vec3::new(v[0], v[1], v[2]);
            bmin = bmin.min(p);
            bmax = bmax.max(p);
        }
        (bmin, bmax)
    }
}
