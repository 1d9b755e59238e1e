//! PLY mesh loading.
//!
//! Supports ASCII and binary PLY with `vertex` elements carrying `x`, `y`,
//! `z` (and optionally `nx`, `ny`, `nz`) and `face` elements carrying a
//! `vertex_indices` list. Polygons are fan-triangulated.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use cup_wear::Mesh;
use ply_rs::parser::Parser;
use ply_rs::ply::{DefaultElement, Property};
use tracing::{debug, info};

/// Load a triangle mesh from a PLY file.
pub fn load_ply(path: &Path) -> Result<Mesh> {
    info!("Loading mesh from {:?}", path);

    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut reader = BufReader::new(file);

    let parser = Parser::<DefaultElement>::new();
    let ply = parser
        .read_ply(&mut reader)
        .map_err(|e| anyhow!("PLY parse error in {:?}: {:?}", path, e))?;

    let mut positions: Vec<f64> = Vec::new();
    let mut normals: Vec<f64> = Vec::new();
    if let Some(vertices) = ply.payload.get("vertex") {
        positions.reserve(vertices.len() * 3);
        for vertex in vertices {
            for name in ["x", "y", "z"] {
                positions.push(ply_float(vertex.get(name)).with_context(|| {
                    format!("Missing or invalid vertex property {:?} in {:?}", name, path)
                })?);
            }
            if let (Some(nx), Some(ny), Some(nz)) = (
                ply_float(vertex.get("nx")),
                ply_float(vertex.get("ny")),
                ply_float(vertex.get("nz")),
            ) {
                normals.extend([nx, ny, nz]);
            }
        }
    }

    // Partial normals are ignored; the mesh recomputes them.
    if normals.len() != positions.len() {
        normals.clear();
    }

    let mut indices: Vec<u32> = Vec::new();
    if let Some(faces) = ply.payload.get("face") {
        for face in faces {
            let polygon = face
                .get("vertex_indices")
                .or_else(|| face.get("vertex_index"))
                .and_then(ply_index_list)
                .with_context(|| format!("Face without a vertex index list in {:?}", path))?;
            for i in 1..polygon.len().saturating_sub(1) {
                indices.extend([polygon[0], polygon[i], polygon[i + 1]]);
            }
        }
    }

    if indices.is_empty() {
        bail!("{:?} contains no faces", path);
    }

    debug!(
        "PLY loaded: {} vertices, {} triangles",
        positions.len() / 3,
        indices.len() / 3
    );

    Ok(Mesh::from_buffers(&positions, &normals, &indices)?)
}

fn ply_float(prop: Option<&Property>) -> Option<f64> {
    match prop? {
        Property::Float(v) => Some(*v as f64),
        Property::Double(v) => Some(*v),
        Property::Int(v) => Some(*v as f64),
        Property::UInt(v) => Some(*v as f64),
        Property::Short(v) => Some(*v as f64),
        Property::UShort(v) => Some(*v as f64),
        Property::Char(v) => Some(*v as f64),
        Property::UChar(v) => Some(*v as f64),
        _ => None,
    }
}

fn ply_index_list(prop: &Property) -> Option<Vec<u32>> {
    match prop {
        Property::ListInt(v) => v.iter().map(|&i| u32::try_from(i).ok()).collect(),
        Property::ListUInt(v) => Some(v.clone()),
        Property::ListShort(v) => v.iter().map(|&i| u32::try_from(i).ok()).collect(),
        Property::ListUShort(v) => Some(v.iter().map(|&i| i as u32).collect()),
        Property::ListUChar(v) => Some(v.iter().map(|&i| i as u32).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("cupwear-{}-{}.ply", name, std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const QUAD: &str = "ply
format ascii 1.0
element vertex 4
property float x
property float y
property float z
element face 1
property list uchar int vertex_indices
end_header
0 0 0
1 0 0
1 1 0
0 1 0
4 0 1 2 3
";

    #[test]
    fn test_load_quad_is_fan_triangulated() {
        let path = write_temp("quad", QUAD);
        let mesh = load_ply(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.faces, vec![[0, 1, 2], [0, 2, 3]]);
        assert_eq!(mesh.normals.len(), 4);
    }

    #[test]
    fn test_load_rejects_out_of_range_index() {
        let broken = QUAD.replace("4 0 1 2 3", "3 0 1 9");
        let path = write_temp("broken", &broken);
        let err = load_ply(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        let wear = err.downcast_ref::<cup_wear::WearError>().unwrap();
        assert_eq!(wear.code(), cup_wear::ErrorCode::InvalidVertexIndex);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_ply(Path::new("/nonexistent/cup.ply")).is_err());
    }
}
