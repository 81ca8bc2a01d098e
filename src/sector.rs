// sector.rs — Spatial bins of non-uniform samples.
//
// The grid is tiled by cubes (squares in 2D) of `sector_width` cells. Each
// sample belongs to the sector containing its grid position. Convolution
// engines walk sectors rather than raw sample order so that concurrently
// running workers touch nearby grid memory.
//
// Deciding *how* samples are binned belongs to the base operator. This
// module only supplies the read-only descriptor the engines consume, plus
// a straightforward counting-sort builder so the core can be driven on its
// own.

use crate::config::Dimensions;

/// Fold a normalised coordinate into [-0.5, 0.5). k-space is periodic with
/// period 1, so any finite coordinate maps to a valid grid position.
#[inline]
pub fn wrap_coordinate(k: f32) -> f32 {
    k - (k + 0.5).floor()
}

/// Read-only sector descriptors for one trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct SectorMap {
    /// Sectors along x, y, z.
    counts: [u32; 3],
    sector_width: u32,
    /// `offsets[s]..offsets[s + 1]` indexes `sample_order` for sector s.
    offsets: Vec<u32>,
    /// Sample indices sorted by sector.
    sample_order: Vec<u32>,
    /// Grid coordinates of each sector's centre cell.
    centers: Vec<[u32; 3]>,
}

impl SectorMap {
    /// Bin `coords` (normalised k-space in [-0.5, 0.5)) onto `grid`.
    pub fn assign(coords: &[[f32; 3]], grid: Dimensions, sector_width: u32) -> Self {
        let dims = grid.as_array();
        let rank = grid.rank();
        let counts = [0, 1, 2].map(|a| {
            if a < rank { dims[a].div_ceil(sector_width) } else { 1 }
        });
        let n_sectors = (counts[0] * counts[1] * counts[2]) as usize;

        let sector_of = |c: &[f32; 3]| -> usize {
            let mut s = [0u32; 3];
            for a in 0..rank {
                let g = dims[a] as f32;
                let p = ((wrap_coordinate(c[a]) + 0.5) * g).rem_euclid(g);
                s[a] = ((p as u32) / sector_width).min(counts[a] - 1);
            }
            ((s[2] * counts[1] + s[1]) * counts[0] + s[0]) as usize
        };

        // Counting sort: histogram, prefix sum, scatter.
        let assignment: Vec<usize> = coords.iter().map(sector_of).collect();
        let mut offsets = vec![0u32; n_sectors + 1];
        for &s in &assignment {
            offsets[s + 1] += 1;
        }
        for s in 0..n_sectors {
            offsets[s + 1] += offsets[s];
        }
        let mut cursor = offsets.clone();
        let mut sample_order = vec![0u32; coords.len()];
        for (i, &s) in assignment.iter().enumerate() {
            sample_order[cursor[s] as usize] = i as u32;
            cursor[s] += 1;
        }

        let mut centers = Vec::with_capacity(n_sectors);
        for sz in 0..counts[2] {
            for sy in 0..counts[1] {
                for sx in 0..counts[0] {
                    let center = |s: u32, a: usize| {
                        if a < rank { (s * sector_width + sector_width / 2).min(dims[a] - 1) } else { 0 }
                    };
                    centers.push([center(sx, 0), center(sy, 1), center(sz, 2)]);
                }
            }
        }

        SectorMap { counts, sector_width, offsets, sample_order, centers }
    }

    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    pub fn counts(&self) -> [u32; 3] {
        self.counts
    }

    pub fn sector_width(&self) -> u32 {
        self.sector_width
    }

    pub fn num_samples(&self) -> usize {
        self.sample_order.len()
    }

    /// Sample indices belonging to sector `s`.
    pub fn samples_in(&self, s: usize) -> &[u32] {
        let start = self.offsets[s] as usize;
        let end = self.offsets[s + 1] as usize;
        &self.sample_order[start..end]
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn sample_order(&self) -> &[u32] {
        &self.sample_order
    }

    pub fn centers(&self) -> &[[u32; 3]] {
        &self.centers
    }
}
