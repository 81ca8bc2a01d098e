// benches/gpu_benchmarks.rs — Texture engine benchmarks.
//
// Mirrors the host_convolution group in benchmarks.rs so CPU and GPU
// numbers sit side by side.
//
//   cargo bench --bench gpu_benchmarks
//
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Criterion measures wall time, including buffer uploads, bind group
// creation, submit and the blocking readback. That is what a caller of the
// operator pays per call. The first iterations pay pipeline compilation on
// some drivers, so warm-up is set explicitly.

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use num_complex::Complex32;

use tex_nufft::gpu::{GpuDevice, TextureEngine};
use tex_nufft::sector::SectorMap;
use tex_nufft::{ConvolutionEngine, Dimensions, Grid, InterpolationMode, NufftConfig};

fn radial(spokes: usize, per_spoke: usize) -> Vec<[f32; 3]> {
    let mut coords = Vec::with_capacity(spokes * per_spoke);
    for s in 0..spokes {
        let a = std::f32::consts::PI * s as f32 / spokes as f32;
        for i in 0..per_spoke {
            let r = i as f32 / per_spoke as f32 - 0.5;
            coords.push([r * a.cos(), r * a.sin(), 0.0]);
        }
    }
    coords
}

fn bench_gpu_passes(c: &mut Criterion) {
    let gpu = Arc::new(GpuDevice::new().expect("no GPU adapter"));
    eprintln!("[gpu_benchmarks] {gpu}");
    let coords = radial(128, 256);
    let samples = vec![Complex32::new(1.0, 0.5); coords.len()];

    let mut group = c.benchmark_group("gpu_convolution");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(20);
    for mode in [InterpolationMode::Table, InterpolationMode::Surface2D, InterpolationMode::Volume3D] {
        let config = NufftConfig::new(4, 8, 2.0, Dimensions::new_2d(128, 128)).with_interpolation(mode);
        let engine = TextureEngine::new(gpu.clone(), &config).unwrap();
        let sectors = SectorMap::assign(&coords, config.grid_dims(), config.sector_width);

        group.bench_function(BenchmarkId::new("adjoint", mode.name()), |b| {
            b.iter(|| {
                let mut grid = Grid::zeros(config.grid_dims());
                engine.convolve_adjoint(&samples, &coords, &sectors, &mut grid).unwrap();
                grid
            })
        });

        let mut grid = Grid::zeros(config.grid_dims());
        engine.convolve_adjoint(&samples, &coords, &sectors, &mut grid).unwrap();
        group.bench_function(BenchmarkId::new("forward", mode.name()), |b| {
            let mut out = vec![Complex32::new(0.0, 0.0); coords.len()];
            b.iter(|| engine.convolve_forward(&grid, &coords, &sectors, &mut out).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gpu_passes);
criterion_main!(benches);
