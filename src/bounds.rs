// bounds.rs — Per-bucket grid-offset ranges used to prune convolution loops.
//
// A sample at grid position p (one axis) only touches cells c with
// |c - p| < r_eff, where r_eff is the radius beyond which the tabulated
// kernel is negligible. Writing p = floor(p) + f with f ∈ [0, 1), the
// offsets c - floor(p) that can matter depend only on f. We discretise f
// into MINMAX_BUCKETS buckets and store, per bucket, the inclusive
// [min, max] offset range:
//
//   bucket b covers f ∈ [b/B, (b+1)/B]
//   min = floor(b/B - r_eff) + 1
//   max = ceil((b+1)/B + r_eff) - 1
//
// The bucket interval is treated as closed, so a position that lands on a
// bucket edge is covered by both neighbours (the wider range wins). Ranges
// never exclude a cell within r_eff of a position in the bucket; they may
// include a cell that is only reached from part of the bucket.
//
// The same table serves every axis since the kernel is separable and
// isotropic.

use crate::kernel::KernelTable;

/// Kernel values at or below this (relative to the peak of 1.0) are pruned.
pub const NEGLIGIBILITY_THRESHOLD: f32 = 1e-5;

/// Number of fractional-position buckets.
pub const MINMAX_BUCKETS: usize = 32;

/// Min/max offset pairs indexed by fractional-position bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxBounds {
    ranges: Vec<[i32; 2]>,
    effective_radius: f64,
}

impl MinMaxBounds {
    /// Derive the bounds from a built kernel table.
    pub fn compute(table: &KernelTable) -> Self {
        let profile = table.profile();
        let last = profile.len() - 1;
        let u_eff = profile
            .iter()
            .rposition(|&v| v > NEGLIGIBILITY_THRESHOLD)
            .map(|l| ((l + 1) as f64 / last as f64).min(1.0))
            .unwrap_or(0.0);
        Self::from_radius(u_eff * table.kernel().radius())
    }

    /// Bounds for an explicit effective radius (grid cells).
    pub fn from_radius(effective_radius: f64) -> Self {
        let b = MINMAX_BUCKETS as f64;
        let ranges = (0..MINMAX_BUCKETS)
            .map(|bucket| {
                let lo = bucket as f64 / b;
                let hi = (bucket + 1) as f64 / b;
                let min = (lo - effective_radius).floor() as i32 + 1;
                let max = (hi + effective_radius).ceil() as i32 - 1;
                [min, max.max(min)]
            })
            .collect();
        MinMaxBounds { ranges, effective_radius }
    }

    /// Radius (grid cells) beyond which the kernel is negligible.
    pub fn effective_radius(&self) -> f64 {
        self.effective_radius
    }

    pub fn buckets(&self) -> usize {
        self.ranges.len()
    }

    pub fn as_slice(&self) -> &[[i32; 2]] {
        &self.ranges
    }

    /// Offset range for the fractional position `f ∈ [0, 1)`.
    #[inline]
    pub fn range_for(&self, f: f32) -> [i32; 2] {
        self.ranges[bucket_of(f, self.ranges.len())]
    }

    /// Widest span over all buckets, in cells.
    pub fn max_span(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| (r[1] - r[0] + 1) as usize)
            .max()
            .unwrap_or(0)
    }
}

/// Bucket index of a fractional position. Must match `axis_bounds` in
/// `kernel_lookup.wgsl`.
#[inline]
pub fn bucket_of(f: f32, buckets: usize) -> usize {
    ((f * buckets as f32) as usize).min(buckets - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dimensions, InterpolationMode, NufftConfig};

    fn bounds_for(width: u32, osf: f32) -> (KernelTable, MinMaxBounds) {
        let config = NufftConfig::new(width, 8, osf, Dimensions::new_2d(32, 32))
            .with_interpolation(InterpolationMode::Table);
        let table = KernelTable::build(&config).unwrap();
        let bounds = MinMaxBounds::compute(&table);
        (table, bounds)
    }

    #[test]
    fn test_width_one_selects_nearest_cell() {
        let (_, bounds) = bounds_for(1, 2.0);
        for b in 0..MINMAX_BUCKETS {
            let expected = if b < MINMAX_BUCKETS / 2 { 0 } else { 1 };
            assert_eq!(bounds.as_slice()[b], [expected, expected], "bucket {b}");
        }
        assert_eq!(bounds.max_span(), 1);
    }

    #[test]
    fn test_width_three_spans_three_cells_at_bucket_zero() {
        let (_, bounds) = bounds_for(3, 2.0);
        assert_eq!(bounds.range_for(0.0), [-1, 1]);
        assert_eq!(bounds.range_for(0.99), [0, 2]);
    }

    #[test]
    fn test_min_not_greater_than_max() {
        for width in 1..=16 {
            let (_, bounds) = bounds_for(width, 1.5);
            assert!(bounds.as_slice().iter().all(|r| r[0] <= r[1]));
        }
    }

    #[test]
    fn test_no_under_pruning() {
        for osf in [1.25f32, 2.0] {
            for width in 1..=16u32 {
                let (table, bounds) = bounds_for(width, osf);
                let kernel = table.kernel();
                for step in 0..400 {
                    let f = step as f32 / 400.0;
                    let [min, max] = bounds.range_for(f);
                    for c in -12..=12 {
                        let v = kernel.eval_distance((c as f64 - f as f64).abs());
                        if v > NEGLIGIBILITY_THRESHOLD as f64 * 1.0001 {
                            assert!(
                                (min..=max).contains(&c),
                                "W={width} osf={osf} f={f}: offset {c} (k={v}) outside [{min}, {max}]"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_bounds_widen_with_radius() {
        let mut prev: Option<MinMaxBounds> = None;
        for width in 1..=16 {
            let (_, bounds) = bounds_for(width, 2.0);
            if let Some(p) = &prev {
                assert!(bounds.effective_radius() >= p.effective_radius());
                for (a, b) in p.as_slice().iter().zip(bounds.as_slice()) {
                    assert!(b[0] <= a[0] && b[1] >= a[1], "W={width}: {a:?} -> {b:?}");
                }
            }
            prev = Some(bounds);
        }
    }

    #[test]
    fn test_bucket_of_clamps() {
        assert_eq!(bucket_of(0.0, 32), 0);
        assert_eq!(bucket_of(0.999_999, 32), 31);
        assert_eq!(bucket_of(1.0, 32), 31);
        assert_eq!(bucket_of(0.5, 32), 16);
    }
}
