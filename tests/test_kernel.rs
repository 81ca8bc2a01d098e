// tests/test_kernel.rs — Integration tests for the kernel representation.

use tex_nufft::bounds::{MinMaxBounds, MINMAX_BUCKETS};
use tex_nufft::engine::KernelRepresentation;
use tex_nufft::kernel::{table_entries, KaiserBessel, KernelTable, VOLUME_MAX_ENTRIES};
use tex_nufft::textures::{kernel_weight, SoftwareTexture};
use tex_nufft::{ConfigError, Dimensions, InterpolationMode, NufftConfig};

fn config(width: u32, mode: InterpolationMode) -> NufftConfig {
    NufftConfig::new(width, 8, 2.0, Dimensions::new_2d(32, 32)).with_interpolation(mode)
}

// ===== Kernel table =====

#[test]
fn table_peaks_at_one_and_decays() {
    let table = KernelTable::build(&config(4, InterpolationMode::Table)).unwrap();
    let profile = table.profile();
    assert_eq!(profile[0], 1.0);
    // Kaiser–Bessel is monotone on [0, 1].
    for w in profile.windows(2) {
        assert!(w[1] <= w[0] + 1e-7, "profile not decreasing: {} → {}", w[0], w[1]);
    }
    assert!(*profile.last().unwrap() < 1e-3);
}

#[test]
fn table_sizes_follow_interpolation_mode() {
    let full = table_entries(3, 2.0);
    let table = KernelTable::build(&config(3, InterpolationMode::Table)).unwrap();
    assert_eq!(table.extent(), [full, 1, 1]);

    let surface = KernelTable::build(&config(3, InterpolationMode::Surface2D)).unwrap();
    let n = surface.entries();
    assert_eq!(surface.extent(), [n, n, 1]);
    assert_eq!(surface.as_slice().len(), n * n);

    let volume = KernelTable::build(&config(3, InterpolationMode::Volume3D)).unwrap();
    assert_eq!(volume.entries(), VOLUME_MAX_ENTRIES.min(full));
    assert_eq!(volume.size_bytes(), volume.entries().pow(3) * 4);
}

#[test]
fn tabulated_values_match_reference_kernel() {
    for mode in [InterpolationMode::Table, InterpolationMode::Surface2D, InterpolationMode::Volume3D] {
        let table = KernelTable::build(&config(5, mode)).unwrap();
        let err = table.max_tabulation_error();
        assert!(err < 1e-6, "{mode}: tabulation error {err}");
    }
}

#[test]
fn invalid_width_is_rejected() {
    let err = KernelTable::build(&config(0, InterpolationMode::Table)).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidKernelWidth { width: 0, .. }));
}

// ===== Min/max bounds =====

#[test]
fn bounds_cover_the_kernel_footprint() {
    for width in [1, 2, 3, 4, 7] {
        let table = KernelTable::build(&config(width, InterpolationMode::Table)).unwrap();
        let bounds = MinMaxBounds::compute(&table);
        assert_eq!(bounds.buckets(), MINMAX_BUCKETS);
        assert!(bounds.max_span() <= width as usize + 1, "W={width}: span {}", bounds.max_span());

        let r = table.kernel().radius();
        for (b, &[lo, hi]) in bounds.as_slice().iter().enumerate() {
            assert!(lo <= hi, "W={width} bucket {b}");
            // Every cell with a non-negligible weight for some fraction in
            // the bucket must lie inside [lo, hi].
            for step in 0..8 {
                let f = (b as f64 + step as f64 / 8.0) / MINMAX_BUCKETS as f64;
                for off in -(width as i32 + 1)..=(width as i32 + 1) {
                    let d = (off as f64 - f).abs();
                    if table.kernel().eval(d / r) > 1e-4 {
                        assert!(off >= lo && off <= hi, "W={width} f={f}: offset {off} outside [{lo}, {hi}]");
                    }
                }
            }
        }
    }
}

// ===== Software sampling =====

#[test]
fn sampled_weights_track_the_continuous_kernel() {
    let kb = KaiserBessel::new(4, 2.0);
    for mode in [InterpolationMode::Table, InterpolationMode::Surface2D, InterpolationMode::Volume3D] {
        let repr = KernelRepresentation::build(&config(4, mode)).unwrap();
        let tex = SoftwareTexture::upload(&repr.table).unwrap();
        let tol = if mode == InterpolationMode::Volume3D { 2e-3 } else { 2e-4 };
        for i in 0..=20 {
            let u = [i as f32 / 20.0, 0.3, 0.1];
            let want = (kb.eval(u[0] as f64) * kb.eval(0.3) * kb.eval(0.1)) as f32;
            let got = kernel_weight(&tex, mode, u);
            assert!((got - want).abs() < tol, "{mode} u={u:?}: {got} vs {want}");
        }
    }
}

#[test]
fn distances_past_the_support_clamp_to_the_edge() {
    let repr = KernelRepresentation::build(&config(3, InterpolationMode::Table)).unwrap();
    let tex = SoftwareTexture::upload(&repr.table).unwrap();
    let edge = tex.sample([1.0, 0.0, 0.0]);
    assert_eq!(tex.sample([1.7, 0.0, 0.0]), edge);
    assert_eq!(tex.sample([-0.2, 0.0, 0.0]), tex.sample([0.0, 0.0, 0.0]));
}
