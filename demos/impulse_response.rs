// demos/impulse_response.rs — Point response of the NUFFT operator.
//
// Grids a single k-space sample, reconstructs the image and compares it
// with the plane wave the sample represents. The magnitude is drawn as
// ASCII shades (flat means the deapodization undid the kernel roll-off)
// and the worst-case error is printed for each interpolation mode.
//
// USAGE
// ─────
//   cargo run --example impulse_response                 # GPU, k = (0.1, -0.2)
//   cargo run --example impulse_response -- host         # CPU engine
//   cargo run --example impulse_response -- gpu 0.3 0.05 # custom k
//
// Set RUST_LOG=tex_nufft=debug to see kernel construction and dispatch logs.

use num_complex::Complex32;
use tracing_subscriber::EnvFilter;

use tex_nufft::{Dimensions, EngineKind, Grid, InterpolationMode, NufftConfig, NufftOperator, OutputMode};

const SIZE: u32 = 24;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tex_nufft=info")))
        .init();

    // --- Parse arguments ---
    let args: Vec<String> = std::env::args().collect();
    let kind = match args.get(1).map(String::as_str) {
        Some("host") => EngineKind::Host,
        _ => EngineKind::Gpu,
    };
    let kx: f32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0.1);
    let ky: f32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(-0.2);

    eprintln!("[impulse_response] {kind:?} engine, {SIZE}×{SIZE} image, k = ({kx}, {ky})");

    for mode in [InterpolationMode::Table, InterpolationMode::Surface2D, InterpolationMode::Volume3D] {
        let config = NufftConfig::new(5, 8, 2.0, Dimensions::new_2d(SIZE, SIZE)).with_interpolation(mode);
        let mut op = match NufftOperator::new(&config, vec![[kx, ky, 0.0]], kind) {
            Ok(op) => op,
            Err(e) => {
                eprintln!("[impulse_response] {mode}: {e}");
                continue;
            }
        };

        let image = match op.perform_adjoint(&[Complex32::new(1.0, 0.0)], OutputMode::Deapodization) {
            Ok(image) => image,
            Err(e) => {
                eprintln!("[impulse_response] {mode}: adjoint failed: {e}");
                continue;
            }
        };

        println!("{} ({})", mode, op.interpolation_type_name());
        draw(&image);
        println!("max |error| vs plane wave: {:.2e}\n", max_error(&image, kx, ky));
    }
}

/// Worst deviation from exp(2πi k·(x - N/2)).
fn max_error(image: &Grid, kx: f32, ky: f32) -> f32 {
    let c = (SIZE / 2) as f32;
    let mut worst = 0.0f32;
    for y in 0..SIZE {
        for x in 0..SIZE {
            let phase = std::f32::consts::TAU * (kx * (x as f32 - c) + ky * (y as f32 - c));
            let want = Complex32::from_polar(1.0, phase);
            worst = worst.max((image.get(x, y, 0) - want).norm());
        }
    }
    worst
}

fn draw(image: &Grid) {
    const SHADES: &[u8] = b" .:-=+*#%@";
    let peak = image.as_slice().iter().fold(0.0f32, |m, v| m.max(v.norm()));
    for y in 0..SIZE {
        let row: String = (0..SIZE)
            .map(|x| {
                let t = if peak > 0.0 { image.get(x, y, 0).norm() / peak } else { 0.0 };
                SHADES[((t * (SHADES.len() - 1) as f32).round() as usize).min(SHADES.len() - 1)] as char
            })
            .collect();
        println!("  {row}");
    }
}
