//! Vertex adjacency graph in compressed sparse row form.
//!
//! The graph is built in two passes directly into flat arrays: a counting
//! pass sizes each vertex's slot, a fill pass writes both directions of every
//! face edge, and a final per-vertex sort + dedup compacts shared edges.

use hashbrown::HashMap;
use tracing::debug;

use crate::error::WearResult;
use crate::types::Mesh;

/// Undirected, weighted vertex graph of a triangle mesh.
///
/// Neighbor lists are sorted by vertex index and deduplicated. Weights are
/// Euclidean edge lengths, so `weight(u, v) == weight(v, u)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshGraph {
    offsets: Vec<usize>,
    neighbors: Vec<u32>,
    weights: Vec<f64>,
}

impl MeshGraph {
    /// Build the graph for a mesh.
    ///
    /// # Errors
    ///
    /// Returns [`crate::WearError::InvalidVertexIndex`] if any face references
    /// a vertex out of range.
    pub fn build(mesh: &Mesh) -> WearResult<Self> {
        mesh.check_indices()?;
        let vertex_count = mesh.vertex_count();

        // Pass 1: every face contributes two slots to each of its corners.
        let mut raw_offsets = vec![0usize; vertex_count + 1];
        for face in &mesh.faces {
            for &v in face {
                raw_offsets[v as usize + 1] += 2;
            }
        }
        for i in 0..vertex_count {
            raw_offsets[i + 1] += raw_offsets[i];
        }

        // Pass 2: fill both directions of each face edge.
        let mut cursor = raw_offsets.clone();
        let mut raw = vec![0u32; raw_offsets[vertex_count]];
        for &[a, b, c] in &mesh.faces {
            for (u, v) in [(a, b), (b, c), (c, a)] {
                raw[cursor[u as usize]] = v;
                cursor[u as usize] += 1;
                raw[cursor[v as usize]] = u;
                cursor[v as usize] += 1;
            }
        }

        // Compact: sort and dedup each slot in place, then copy forward.
        let mut offsets = Vec::with_capacity(vertex_count + 1);
        offsets.push(0);
        let mut write = 0usize;
        for v in 0..vertex_count {
            let (start, end) = (raw_offsets[v], raw_offsets[v + 1]);
            raw[start..end].sort_unstable();

            let mut last = u32::MAX;
            for read in start..end {
                let n = raw[read];
                if n != last && n as usize != v {
                    raw[write] = n;
                    write += 1;
                    last = n;
                }
            }
            offsets.push(write);
        }
        raw.truncate(write);
        raw.shrink_to_fit();

        let mut weights = Vec::with_capacity(raw.len());
        for v in 0..vertex_count {
            let p = mesh.positions[v];
            for &n in &raw[offsets[v]..offsets[v + 1]] {
                weights.push((mesh.positions[n as usize] - p).norm());
            }
        }

        debug!(
            vertices = vertex_count,
            edges = raw.len() / 2,
            "Built mesh graph"
        );

        Ok(Self {
            offsets,
            neighbors: raw,
            weights,
        })
    }

    /// Number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Number of undirected edges.
    #[inline]
    pub fn edge_count(&self) -> usize {
        self.neighbors.len() / 2
    }

    /// Check if the graph has no vertices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertex_count() == 0
    }

    /// Neighbor indices of a vertex, sorted ascending.
    #[inline]
    pub fn neighbors(&self, vertex: usize) -> &[u32] {
        match (self.offsets.get(vertex), self.offsets.get(vertex + 1)) {
            (Some(&s), Some(&e)) => &self.neighbors[s..e],
            _ => &[],
        }
    }

    /// Edge weights of a vertex, parallel to [`MeshGraph::neighbors`].
    #[inline]
    pub fn weights(&self, vertex: usize) -> &[f64] {
        match (self.offsets.get(vertex), self.offsets.get(vertex + 1)) {
            (Some(&s), Some(&e)) => &self.weights[s..e],
            _ => &[],
        }
    }

    /// Iterate `(neighbor, weight)` pairs of a vertex.
    pub fn edges(&self, vertex: usize) -> impl Iterator<Item = (u32, f64)> + '_ {
        self.neighbors(vertex)
            .iter()
            .copied()
            .zip(self.weights(vertex).iter().copied())
    }

    /// Weight of the edge `(u, v)`, if it exists.
    pub fn weight(&self, u: usize, v: usize) -> Option<f64> {
        let ns = self.neighbors(u);
        ns.binary_search(&(v as u32))
            .ok()
            .map(|i| self.weights(u)[i])
    }

    /// Raw CSR offsets (`vertex_count + 1` entries).
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }
}

/// Edges referenced by exactly one triangle, as `(min, max)` vertex pairs.
///
/// The result is sorted.
pub fn find_boundary_edges(mesh: &Mesh) -> Vec<(u32, u32)> {
    let mut counts: HashMap<(u32, u32), u32> = HashMap::with_capacity(mesh.faces.len() * 3 / 2);
    for &[a, b, c] in &mesh.faces {
        for (u, v) in [(a, b), (b, c), (c, a)] {
            let key = if u < v { (u, v) } else { (v, u) };
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    let mut edges: Vec<(u32, u32)> = counts
        .into_iter()
        .filter(|&(_, count)| count == 1)
        .map(|(edge, _)| edge)
        .collect();
    edges.sort_unstable();
    edges
}

/// Vertices lying on a boundary edge, sorted ascending.
pub fn find_boundary_vertices(mesh: &Mesh) -> Vec<u32> {
    let mut vertices: Vec<u32> = find_boundary_edges(mesh)
        .into_iter()
        .flat_map(|(a, b)| [a, b])
        .collect();
    vertices.sort_unstable();
    vertices.dedup();
    vertices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WearError;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn square() -> Mesh {
        Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(3.0, 0.0, 0.0),
                Point3::new(3.0, 4.0, 0.0),
                Point3::new(0.0, 4.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_graph_from_square() {
        let graph = MeshGraph::build(&square()).unwrap();
        assert_eq!(graph.vertex_count(), 4);
        // 4 sides + 1 diagonal, the diagonal counted once despite two faces.
        assert_eq!(graph.edge_count(), 5);
        assert_eq!(graph.neighbors(0), &[1, 2, 3]);
        assert_eq!(graph.neighbors(1), &[0, 2]);
    }

    #[test]
    fn test_graph_weights() {
        let graph = MeshGraph::build(&square()).unwrap();
        assert_relative_eq!(graph.weight(0, 1).unwrap(), 3.0, epsilon = 1e-12);
        assert_relative_eq!(graph.weight(0, 2).unwrap(), 5.0, epsilon = 1e-12);
        assert_eq!(graph.weight(0, 2), graph.weight(2, 0));
        assert!(graph.weight(1, 3).is_none());
    }

    #[test]
    fn test_graph_offsets_monotone() {
        let graph = MeshGraph::build(&square()).unwrap();
        assert!(graph.offsets().windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*graph.offsets().last().unwrap(), 10);
    }

    #[test]
    fn test_graph_isolated_vertex() {
        let mut mesh = square();
        mesh.positions.push(Point3::new(10.0, 10.0, 10.0));
        let graph = MeshGraph::build(&mesh).unwrap();
        assert_eq!(graph.vertex_count(), 5);
        assert!(graph.neighbors(4).is_empty());
    }

    #[test]
    fn test_graph_rejects_bad_index() {
        let mut mesh = square();
        mesh.faces.push([0, 1, 9]);
        assert!(matches!(
            MeshGraph::build(&mesh),
            Err(WearError::InvalidVertexIndex { .. })
        ));
    }

    #[test]
    fn test_boundary() {
        let mesh = square();
        let edges = find_boundary_edges(&mesh);
        assert_eq!(edges, vec![(0, 1), (0, 3), (1, 2), (2, 3)]);
        assert_eq!(find_boundary_vertices(&mesh), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_closed_mesh_has_no_boundary() {
        let mesh = Mesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
                Point3::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 1, 3], [1, 2, 3], [0, 3, 2]],
        );
        assert!(find_boundary_edges(&mesh).is_empty());
    }
}
