//! Benchmarks for cup wear analysis.
//!
//! Run with: cargo bench -p cup-wear
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p cup-wear -- --save-baseline main
//! 2. After changes: cargo bench -p cup-wear -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use cup_wear::synthetic::{RadialDefect, apply_radial_defect, cup_shell, hemisphere_cap};
use cup_wear::{
    AnalysisParams, GeodesicSolver, Mesh, MeshGraph, NoOpProgressReporter, analyze, dijkstra,
    fit_ellipsoid, fit_sphere, fit_sphere_robust, separate_faces,
};
use nalgebra::{Point3, Vector3};

// =============================================================================
// Test Mesh Generation
// =============================================================================

/// A 14 mm cup cap with one 5 µm dent.
fn dented_cap(spacing: f64) -> Mesh {
    let mut cap = hemisphere_cap(14.0, spacing, 90.0);
    apply_radial_defect(&mut cap, &Point3::origin(), &RadialDefect::dent(30.0, 45.0, 2.0, 5.0));
    cap
}

fn test_caps() -> Vec<(&'static str, Mesh)> {
    vec![
        ("cap_1.0mm", dented_cap(1.0)),
        ("cap_0.5mm", dented_cap(0.5)),
        ("cap_0.25mm", dented_cap(0.25)),
    ]
}

// =============================================================================
// Graph Benchmarks
// =============================================================================

fn bench_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("Graph");

    for (name, mesh) in &test_caps() {
        group.throughput(Throughput::Elements(mesh.face_count() as u64));

        group.bench_with_input(BenchmarkId::new("build", name), mesh, |b, mesh| {
            b.iter(|| MeshGraph::build(black_box(mesh)))
        });

        if let Ok(graph) = MeshGraph::build(mesh) {
            group.bench_with_input(BenchmarkId::new("dijkstra", name), &graph, |b, graph| {
                b.iter(|| dijkstra(black_box(graph), 0))
            });
        }
    }

    group.finish();
}

// =============================================================================
// Fitting Benchmarks
// =============================================================================

fn bench_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("Fitting");

    for (name, mesh) in &test_caps() {
        let points = &mesh.positions;
        group.throughput(Throughput::Elements(points.len() as u64));

        group.bench_with_input(BenchmarkId::new("sphere", name), points, |b, points| {
            b.iter(|| fit_sphere(black_box(points)))
        });

        group.bench_with_input(BenchmarkId::new("sphere_robust", name), points, |b, points| {
            b.iter(|| fit_sphere_robust(black_box(points), 3))
        });

        group.bench_with_input(BenchmarkId::new("ellipsoid", name), points, |b, points| {
            b.iter(|| fit_ellipsoid(black_box(points)))
        });
    }

    group.finish();
}

// =============================================================================
// Stage Benchmarks
// =============================================================================

fn bench_separation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Separation");

    for spacing in [1.0, 0.5] {
        let shell = cup_shell(14.0, 16.0, spacing);
        group.throughput(Throughput::Elements(shell.face_count() as u64));

        group.bench_with_input(
            BenchmarkId::new("separate_faces", format!("shell_{spacing}mm")),
            &shell,
            |b, shell| b.iter(|| separate_faces(black_box(shell))),
        );
    }

    group.finish();
}

fn bench_meridians(c: &mut Criterion) {
    let mut group = c.benchmark_group("Meridians");
    group.sample_size(20);

    let mesh = dented_cap(0.5);
    let Ok(graph) = MeshGraph::build(&mesh) else {
        return;
    };
    let Ok(sphere) = fit_sphere(&mesh.positions) else {
        return;
    };

    for count in [36, 360] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("compute_all", count), &count, |b, &count| {
            b.iter(|| {
                GeodesicSolver::new(&mesh, &graph, &sphere, &Vector3::z(), count, 500)
                    .map(|solver| solver.compute_all(&NoOpProgressReporter))
            })
        });
    }

    group.finish();
}

// =============================================================================
// Full Analysis Benchmarks
// =============================================================================

fn bench_full_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("FullAnalysis");
    group.sample_size(10);

    for (name, mesh) in &test_caps() {
        group.throughput(Throughput::Elements(mesh.face_count() as u64));

        group.bench_with_input(BenchmarkId::new("quick", name), mesh, |b, mesh| {
            b.iter(|| analyze(black_box(mesh.clone()), AnalysisParams::quick()))
        });

        group.bench_with_input(BenchmarkId::new("default", name), mesh, |b, mesh| {
            b.iter(|| analyze(black_box(mesh.clone()), AnalysisParams::default()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_graph,
    bench_fitting,
    bench_separation,
    bench_meridians,
    bench_full_analysis,
);

criterion_main!(benches);
