//! Core mesh data types.

use nalgebra::{Point3, Vector3};

use crate::error::{WearError, WearResult};

/// A triangle mesh with per-vertex positions and normals.
///
/// Coordinates are in millimeters. Each stage that derives a new mesh
/// (separation, trimming) produces an independent copy.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct Mesh {
    /// Vertex positions.
    pub positions: Vec<Point3<f64>>,

    /// Unit vertex normals, one per position.
    pub normals: Vec<Vector3<f64>>,

    /// Triangle faces as indices into the vertex arrays.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(vertex_count: usize, face_count: usize) -> Self {
        Self {
            positions: Vec::with_capacity(vertex_count),
            normals: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
        }
    }

    /// Build a mesh from flat buffers as handed over by a mesh loader.
    ///
    /// `positions` and `normals` are `xyz` triples, `indices` are triangle
    /// triples. If `normals` is empty or does not match `positions`, vertex
    /// normals are recomputed from the faces.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::InvalidMesh`] for empty or misaligned buffers and
    /// non-finite coordinates, and [`WearError::InvalidVertexIndex`] for
    /// indices out of range.
    pub fn from_buffers(positions: &[f64], normals: &[f64], indices: &[u32]) -> WearResult<Self> {
        if positions.len() % 3 != 0 {
            return Err(WearError::invalid_mesh(format!(
                "position buffer length {} is not a multiple of 3",
                positions.len()
            )));
        }
        if indices.len() % 3 != 0 {
            return Err(WearError::invalid_mesh(format!(
                "index buffer length {} is not a multiple of 3",
                indices.len()
            )));
        }

        let positions: Vec<Point3<f64>> = positions
            .chunks_exact(3)
            .map(|c| Point3::new(c[0], c[1], c[2]))
            .collect();
        let faces: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        let mut mesh = Self {
            positions,
            normals: Vec::new(),
            faces,
        };
        mesh.validate()?;

        if normals.len() == mesh.positions.len() * 3 {
            mesh.normals = normals
                .chunks_exact(3)
                .map(|c| {
                    let n = Vector3::new(c[0], c[1], c[2]);
                    n.try_normalize(1e-12).unwrap_or_else(Vector3::zeros)
                })
                .collect();
        } else {
            mesh.compute_vertex_normals();
        }

        Ok(mesh)
    }

    /// Build a mesh from positions and faces, computing vertex normals.
    pub fn from_parts(positions: Vec<Point3<f64>>, faces: Vec<[u32; 3]>) -> Self {
        let mut mesh = Self {
            positions,
            normals: Vec::new(),
            faces,
        };
        mesh.compute_vertex_normals();
        mesh
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() || self.faces.is_empty()
    }

    /// Check structural invariants: non-empty, finite coordinates, indices in range.
    pub fn validate(&self) -> WearResult<()> {
        if self.positions.is_empty() {
            return Err(WearError::invalid_mesh("mesh has no vertices"));
        }
        if self.faces.is_empty() {
            return Err(WearError::invalid_mesh("mesh has no faces"));
        }

        for (i, p) in self.positions.iter().enumerate() {
            if !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()) {
                return Err(WearError::invalid_mesh(format!(
                    "vertex {} has a non-finite coordinate",
                    i
                )));
            }
        }

        self.check_indices()
    }

    /// Check that every face index is in range.
    pub fn check_indices(&self) -> WearResult<()> {
        let vertex_count = self.positions.len();
        for (face_index, face) in self.faces.iter().enumerate() {
            for &v in face {
                if v as usize >= vertex_count {
                    return Err(WearError::invalid_vertex_index(face_index, v, vertex_count));
                }
            }
        }
        Ok(())
    }

    /// Mean of all vertex positions.
    pub fn centroid(&self) -> Point3<f64> {
        if self.positions.is_empty() {
            return Point3::origin();
        }
        let sum: Vector3<f64> = self.positions.iter().map(|p| p.coords).sum();
        Point3::from(sum / self.positions.len() as f64)
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if mesh is empty.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = *self.positions.first()?;
        let mut min = first;
        let mut max = first;

        for p in &self.positions[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some((min, max))
    }

    /// The three corner positions of a face.
    #[inline]
    pub fn face_positions(&self, face_idx: usize) -> [Point3<f64>; 3] {
        let [i0, i1, i2] = self.faces[face_idx];
        [
            self.positions[i0 as usize],
            self.positions[i1 as usize],
            self.positions[i2 as usize],
        ]
    }

    /// Centroid of a face.
    pub fn face_centroid(&self, face_idx: usize) -> Point3<f64> {
        let [a, b, c] = self.face_positions(face_idx);
        Point3::from((a.coords + b.coords + c.coords) / 3.0)
    }

    /// Unit normal of a face from its winding, `(v1 - v0) x (v2 - v0)`.
    ///
    /// Degenerate faces fall back to the average of their vertex normals.
    pub fn face_normal(&self, face_idx: usize) -> Vector3<f64> {
        let [a, b, c] = self.face_positions(face_idx);
        let n = (b - a).cross(&(c - a));
        if let Some(unit) = n.try_normalize(1e-20) {
            return unit;
        }

        let [i0, i1, i2] = self.faces[face_idx];
        if self.normals.len() == self.positions.len() {
            let avg = self.normals[i0 as usize] + self.normals[i1 as usize] + self.normals[i2 as usize];
            avg.try_normalize(1e-12).unwrap_or_else(Vector3::zeros)
        } else {
            Vector3::zeros()
        }
    }

    /// Area of a face.
    pub fn face_area(&self, face_idx: usize) -> f64 {
        let [a, b, c] = self.face_positions(face_idx);
        (b - a).cross(&(c - a)).norm() * 0.5
    }

    /// Total surface area.
    pub fn surface_area(&self) -> f64 {
        (0..self.faces.len()).map(|f| self.face_area(f)).sum()
    }

    /// Recompute vertex normals as area-weighted averages of face normals.
    pub fn compute_vertex_normals(&mut self) {
        let mut normals = vec![Vector3::zeros(); self.positions.len()];

        for &[i0, i1, i2] in &self.faces {
            let (Some(a), Some(b), Some(c)) = (
                self.positions.get(i0 as usize),
                self.positions.get(i1 as usize),
                self.positions.get(i2 as usize),
            ) else {
                continue;
            };
            // Unnormalized cross product weights by twice the face area.
            let n = (b - a).cross(&(c - a));
            normals[i0 as usize] += n;
            normals[i1 as usize] += n;
            normals[i2 as usize] += n;
        }

        for n in &mut normals {
            *n = n.try_normalize(1e-20).unwrap_or_else(Vector3::zeros);
        }

        self.normals = normals;
    }

    /// Build an independent mesh from a subset of faces.
    ///
    /// Vertices referenced by the kept faces are compacted in order of first
    /// use, so a vertex shared by several kept faces appears exactly once.
    pub fn submesh(&self, face_ids: &[u32]) -> Mesh {
        let mut remap = vec![u32::MAX; self.positions.len()];
        let has_normals = self.normals.len() == self.positions.len();
        let mut out = Mesh::with_capacity(face_ids.len(), face_ids.len());

        for &f in face_ids {
            let face = self.faces[f as usize];
            let mut new_face = [0u32; 3];
            for (slot, &v) in new_face.iter_mut().zip(face.iter()) {
                let v = v as usize;
                if remap[v] == u32::MAX {
                    remap[v] = out.positions.len() as u32;
                    out.positions.push(self.positions[v]);
                    if has_normals {
                        out.normals.push(self.normals[v]);
                    }
                }
                *slot = remap[v];
            }
            out.faces.push(new_face);
        }

        if !has_normals {
            out.compute_vertex_normals();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_triangles() -> Mesh {
        Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_from_buffers() {
        let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let mesh = Mesh::from_buffers(&positions, &[], &[0, 1, 2]).unwrap();
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.face_count(), 1);
        assert_relative_eq!(mesh.normals[0].z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_buffers_rejects_bad_index() {
        let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let err = Mesh::from_buffers(&positions, &[], &[0, 1, 7]).unwrap_err();
        assert!(matches!(
            err,
            WearError::InvalidVertexIndex {
                face_index: 0,
                vertex_index: 7,
                vertex_count: 3
            }
        ));
    }

    #[test]
    fn test_from_buffers_rejects_misaligned() {
        assert!(Mesh::from_buffers(&[0.0, 1.0], &[], &[]).is_err());
        assert!(Mesh::from_buffers(&[0.0; 9], &[], &[0, 1]).is_err());
        assert!(Mesh::from_buffers(&[], &[], &[]).is_err());
    }

    #[test]
    fn test_from_buffers_rejects_nan() {
        let positions = [f64::NAN, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        assert!(Mesh::from_buffers(&positions, &[], &[0, 1, 2]).is_err());
    }

    #[test]
    fn test_face_geometry() {
        let mesh = two_triangles();
        assert_relative_eq!(mesh.face_area(0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(mesh.surface_area(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(mesh.face_normal(0).z, 1.0, epsilon = 1e-12);

        let c = mesh.face_centroid(0);
        assert_relative_eq!(c.x, 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(c.y, 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_submesh_welds_shared_vertices() {
        let mesh = two_triangles();
        let sub = mesh.submesh(&[1]);
        assert_eq!(sub.vertex_count(), 3);
        assert_eq!(sub.faces, vec![[0, 1, 2]]);

        let both = mesh.submesh(&[0, 1]);
        assert_eq!(both.vertex_count(), 4);
        assert_eq!(both.normals.len(), 4);
    }

    #[test]
    fn test_bounds_and_centroid() {
        let mesh = two_triangles();
        let (min, max) = mesh.bounds().unwrap();
        assert_eq!(min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(max, Point3::new(1.0, 1.0, 0.0));
        assert_relative_eq!(mesh.centroid().x, 0.5, epsilon = 1e-12);
        assert!(Mesh::new().bounds().is_none());
    }
}
