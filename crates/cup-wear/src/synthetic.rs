//! Synthetic cup geometry for tests, benchmarks and demos.
//!
//! All generators build ring-structured triangulations: a pole vertex, then
//! rings of constant polar angle whose vertex counts follow the ring
//! circumference, stitched together with a zipper so the triangle size stays
//! close to the requested spacing everywhere.
//!
//! # Example
//!
//! ```
//! use cup_wear::synthetic::{apply_radial_defect, hemisphere_cap, RadialDefect};
//! use nalgebra::Point3;
//!
//! let mut cap = hemisphere_cap(14.0, 0.5, 80.0);
//! let dent = RadialDefect::dent(30.0, 45.0, 2.0, 5.0);
//! let moved = apply_radial_defect(&mut cap, &Point3::origin(), &dent);
//! assert!(moved > 0);
//! ```

use std::f64::consts::{PI, TAU};
use std::ops::Range;

use nalgebra::{Point3, Vector3};

use crate::types::Mesh;

/// Direction of a synthetic surface defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectKind {
    /// Material removed (inward).
    Dent,
    /// Material added (outward).
    Bump,
}

/// A cosine-profile radial perturbation centered on a point of a sphere.
///
/// Displacement at distance `d` from the defect center is
/// `magnitude * (1 + cos(π d / r)) / 2` for `d < r`, with `r` half the width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadialDefect {
    pub kind: DefectKind,
    /// Polar angle of the defect center from +Z (degrees).
    pub polar_deg: f64,
    /// Azimuth of the defect center around +Z from +X (degrees).
    pub azimuth_deg: f64,
    /// Diameter of the affected region (mm).
    pub width_mm: f64,
    /// Peak displacement (µm).
    pub magnitude_um: f64,
}

impl RadialDefect {
    /// An inward defect.
    pub fn dent(polar_deg: f64, azimuth_deg: f64, width_mm: f64, depth_um: f64) -> Self {
        Self {
            kind: DefectKind::Dent,
            polar_deg,
            azimuth_deg,
            width_mm,
            magnitude_um: depth_um,
        }
    }

    /// An outward defect.
    pub fn bump(polar_deg: f64, azimuth_deg: f64, width_mm: f64, height_um: f64) -> Self {
        Self {
            kind: DefectKind::Bump,
            polar_deg,
            azimuth_deg,
            width_mm,
            magnitude_um: height_um,
        }
    }

    /// Unit direction from the sphere center to the defect center.
    pub fn direction(&self) -> Vector3<f64> {
        let (theta, phi) = (self.polar_deg.to_radians(), self.azimuth_deg.to_radians());
        Vector3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos())
    }
}

/// Displace vertices radially about `center` by a defect profile.
///
/// The defect is centered where its direction meets the sphere through the
/// mesh at the mean vertex radius. Vertex normals are recomputed. Returns
/// the number of vertices moved.
pub fn apply_radial_defect(mesh: &mut Mesh, center: &Point3<f64>, defect: &RadialDefect) -> usize {
    if mesh.positions.is_empty() {
        return 0;
    }
    let radius = mesh.positions.iter().map(|p| (p - center).norm()).sum::<f64>()
        / mesh.vertex_count() as f64;
    let defect_center = center + defect.direction() * radius;
    let half_width = defect.width_mm / 2.0;
    let sign = match defect.kind {
        DefectKind::Dent => -1.0,
        DefectKind::Bump => 1.0,
    };

    let mut moved = 0;
    for p in &mut mesh.positions {
        let d = (*p - defect_center).norm();
        if d >= half_width {
            continue;
        }
        let Some(radial) = (*p - center).try_normalize(1e-15) else {
            continue;
        };
        let profile = 0.5 * (1.0 + (PI * d / half_width).cos());
        *p += radial * (sign * defect.magnitude_um * 1e-3 * profile);
        moved += 1;
    }

    mesh.compute_vertex_normals();
    moved
}

/// A spherical cap around +Z, centered at the origin.
///
/// The pole is exactly `(0, 0, radius)` and the last ring lies exactly at
/// `max_polar_deg`. Faces are wound so normals face into the cavity, as on
/// the bearing surface of a cup.
pub fn hemisphere_cap(radius: f64, spacing: f64, max_polar_deg: f64) -> Mesh {
    let mut builder = RingBuilder::default();
    let pole = builder.point(Point3::new(0.0, 0.0, radius));
    let rings = builder.cap_rings(radius, spacing, max_polar_deg);
    builder.cap_faces(pole, &rings, true);
    builder.finish()
}

/// A two-surface cup: concave inner cap, convex outer cap and a flat rim.
///
/// Both caps span 90° and are centered at the origin; the rim annulus joins
/// their last rings in the `z = 0` plane.
pub fn cup_shell(inner_radius: f64, outer_radius: f64, spacing: f64) -> Mesh {
    let mut builder = RingBuilder::default();

    let inner_pole = builder.point(Point3::new(0.0, 0.0, inner_radius));
    let inner_rings = builder.cap_rings(inner_radius, spacing, 90.0);
    builder.cap_faces(inner_pole, &inner_rings, true);

    let outer_pole = builder.point(Point3::new(0.0, 0.0, outer_radius));
    let outer_rings = builder.cap_rings(outer_radius, spacing, 90.0);
    builder.cap_faces(outer_pole, &outer_rings, false);

    if let (Some(inner_rim), Some(outer_rim)) = (inner_rings.last(), outer_rings.last()) {
        builder.stitch(inner_rim.clone(), outer_rim.clone(), true);
    }

    builder.finish()
}

/// A closed UV sphere centered at the origin with outward normals.
///
/// `rings` is the number of latitude bands (at least 2) and `segments` the
/// number of vertices per latitude ring (at least 3).
pub fn uv_sphere(radius: f64, rings: usize, segments: usize) -> Mesh {
    let rings = rings.max(2);
    let segments = segments.max(3);
    let mut builder = RingBuilder::default();

    let top = builder.point(Point3::new(0.0, 0.0, radius));
    let latitudes: Vec<Range<u32>> = (1..rings)
        .map(|k| builder.ring(radius, k as f64 * PI / rings as f64, segments))
        .collect();
    let bottom = builder.point(Point3::new(0.0, 0.0, -radius));

    builder.cap_faces(top, &latitudes, false);
    if let Some(last) = latitudes.last() {
        builder.fan(bottom, last.clone(), true);
    }
    builder.finish()
}

/// A flat `nx` x `ny` vertex grid in the XY plane with +Z normals.
///
/// Vertex `(x, y)` has index `y * nx + x`. Each cell is split along its
/// `(x, y)`-`(x + 1, y + 1)` diagonal.
pub fn grid(nx: usize, ny: usize, spacing: f64) -> Mesh {
    let mut positions = Vec::with_capacity(nx * ny);
    for y in 0..ny {
        for x in 0..nx {
            positions.push(Point3::new(x as f64 * spacing, y as f64 * spacing, 0.0));
        }
    }

    let mut faces = Vec::with_capacity(2 * nx.saturating_sub(1) * ny.saturating_sub(1));
    for y in 0..ny.saturating_sub(1) {
        for x in 0..nx.saturating_sub(1) {
            let v00 = (y * nx + x) as u32;
            let v10 = v00 + 1;
            let v01 = v00 + nx as u32;
            let v11 = v01 + 1;
            faces.push([v00, v10, v11]);
            faces.push([v00, v11, v01]);
        }
    }

    Mesh::from_parts(positions, faces)
}

#[derive(Default)]
struct RingBuilder {
    positions: Vec<Point3<f64>>,
    faces: Vec<[u32; 3]>,
}

impl RingBuilder {
    fn point(&mut self, p: Point3<f64>) -> u32 {
        self.positions.push(p);
        (self.positions.len() - 1) as u32
    }

    /// A ring of `count` vertices at polar angle `theta` on a sphere.
    fn ring(&mut self, radius: f64, theta: f64, count: usize) -> Range<u32> {
        let start = self.positions.len() as u32;
        let (s, c) = theta.sin_cos();
        for i in 0..count {
            let phi = TAU * i as f64 / count as f64;
            self.positions.push(Point3::new(
                radius * s * phi.cos(),
                radius * s * phi.sin(),
                radius * c,
            ));
        }
        start..self.positions.len() as u32
    }

    /// Rings from the first step below the pole down to `max_polar_deg`.
    fn cap_rings(&mut self, radius: f64, spacing: f64, max_polar_deg: f64) -> Vec<Range<u32>> {
        let max_polar = max_polar_deg.clamp(1.0, 180.0).to_radians();
        let ring_count = ((max_polar * radius / spacing).ceil() as usize).max(1);
        let step = max_polar / ring_count as f64;

        (1..=ring_count)
            .map(|k| {
                let theta = k as f64 * step;
                let circumference = TAU * radius * theta.sin();
                let count = ((circumference / spacing).round() as usize).max(6);
                self.ring(radius, theta, count)
            })
            .collect()
    }

    fn cap_faces(&mut self, pole: u32, rings: &[Range<u32>], inward: bool) {
        if let Some(first) = rings.first() {
            self.fan(pole, first.clone(), inward);
        }
        for pair in rings.windows(2) {
            self.stitch(pair[0].clone(), pair[1].clone(), inward);
        }
    }

    fn push(&mut self, a: u32, b: u32, c: u32, flip: bool) {
        self.faces.push(if flip { [a, c, b] } else { [a, b, c] });
    }

    /// Triangles from `apex` to each ring edge.
    ///
    /// Unflipped triangles are counter-clockwise seen from +Z.
    fn fan(&mut self, apex: u32, ring: Range<u32>, flip: bool) {
        let n = ring.end - ring.start;
        for i in 0..n {
            let a = ring.start + i;
            let b = ring.start + (i + 1) % n;
            self.push(apex, a, b, flip);
        }
    }

    /// Zipper between two rings that both start at azimuth 0.
    ///
    /// Unflipped triangles are counter-clockwise seen from +Z when `inner`
    /// is the ring closer to the +Z axis.
    fn stitch(&mut self, inner: Range<u32>, outer: Range<u32>, flip: bool) {
        let na = (inner.end - inner.start) as usize;
        let nb = (outer.end - outer.start) as usize;
        let a = |i: usize| inner.start + (i % na) as u32;
        let b = |j: usize| outer.start + (j % nb) as u32;

        let (mut i, mut j) = (0usize, 0usize);
        while i < na || j < nb {
            let advance_inner = if i == na {
                false
            } else if j == nb {
                true
            } else {
                (i + 1) * nb <= (j + 1) * na
            };
            if advance_inner {
                self.push(a(i), b(j), a(i + 1), flip);
                i += 1;
            } else {
                self.push(a(i), b(j), b(j + 1), flip);
                j += 1;
            }
        }
    }

    fn finish(self) -> Mesh {
        Mesh::from_parts(self.positions, self.faces)
    }
}
