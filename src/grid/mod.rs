//! Representation of the global mesh and its decomposition into
//! per-rank sub-domains

use serde::{Deserialize, Serialize};

use crate::error::PicError;
use crate::particle::Vec3;

mod balance;
mod cic;
mod field;

pub use self::balance::*;
pub use self::cic::*;
pub use self::field::*;

/// A half-open box of cell indices, `lo[i] <= n[i] < hi[i]`.
/// Indices are signed so that ghost layers and periodic images, which
/// lie outside the global domain, can be described too.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBox {
    pub lo: [i64; 3],
    pub hi: [i64; 3],
}

impl IndexBox {
    pub fn new(lo: [i64; 3], hi: [i64; 3]) -> Self {
        IndexBox { lo, hi }
    }

    /// Number of cells along `axis`.
    pub fn dim(&self, axis: usize) -> usize {
        (self.hi[axis] - self.lo[axis]).max(0) as usize
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.dim(0), self.dim(1), self.dim(2)]
    }

    /// Total number of cells.
    pub fn len(&self) -> usize {
        self.dim(0) * self.dim(1) * self.dim(2)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, idx: [i64; 3]) -> bool {
        (0..3).all(|i| self.lo[i] <= idx[i] && idx[i] < self.hi[i])
    }

    /// The overlap of two boxes, or `None` if they are disjoint.
    pub fn intersect(&self, other: &IndexBox) -> Option<IndexBox> {
        let mut lo = [0; 3];
        let mut hi = [0; 3];
        for i in 0..3 {
            lo[i] = self.lo[i].max(other.lo[i]);
            hi[i] = self.hi[i].min(other.hi[i]);
            if lo[i] >= hi[i] {
                return None;
            }
        }
        Some(IndexBox { lo, hi })
    }

    /// Grows the box by `w` cells on every face.
    pub fn extend_all(&self, w: usize) -> IndexBox {
        let w = w as i64;
        IndexBox {
            lo: [self.lo[0] - w, self.lo[1] - w, self.lo[2] - w],
            hi: [self.hi[0] + w, self.hi[1] + w, self.hi[2] + w],
        }
    }

    pub fn shift(&self, by: [i64; 3]) -> IndexBox {
        IndexBox {
            lo: [self.lo[0] + by[0], self.lo[1] + by[1], self.lo[2] + by[2]],
            hi: [self.hi[0] + by[0], self.hi[1] + by[1], self.hi[2] + by[2]],
        }
    }

    /// Visits every index in row-major order (last axis fastest).
    pub fn iter(&self) -> impl Iterator<Item = [i64; 3]> {
        let (lo, hi) = (self.lo, self.hi);
        (lo[0]..hi[0]).flat_map(move |i| {
            (lo[1]..hi[1]).flat_map(move |j| (lo[2]..hi[2]).map(move |k| [i, j, k]))
        })
    }

    /// Position of `idx` relative to the lower corner.
    pub fn offset(&self, idx: [i64; 3]) -> [usize; 3] {
        [
            (idx[0] - self.lo[0]) as usize,
            (idx[1] - self.lo[1]) as usize,
            (idx[2] - self.lo[2]) as usize,
        ]
    }

    /// Position of `idx` in a row-major array covering this box.
    pub fn row_major_offset(&self, idx: [i64; 3]) -> usize {
        let [i, j, k] = self.offset(idx);
        (i * self.dim(1) + j) * self.dim(2) + k
    }

    /// Cuts the box along `axis` at absolute index `at`, returning the
    /// lower and upper parts.
    pub fn split(&self, axis: usize, at: i64) -> (IndexBox, IndexBox) {
        let mut left = *self;
        let mut right = *self;
        left.hi[axis] = at;
        right.lo[axis] = at;
        (left, right)
    }
}

/// The periodic simulation box: `n` cells per axis of size `h`, lower
/// corner at `origin`. Fixed for the duration of a run.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDomain {
    pub n: [usize; 3],
    pub origin: [f64; 3],
    pub h: [f64; 3],
}

impl GlobalDomain {
    /// A domain with lower corner at the origin and side lengths `extent`.
    pub fn new(n: [usize; 3], extent: [f64; 3]) -> Self {
        GlobalDomain {
            n,
            origin: [0.0; 3],
            h: [extent[0] / n[0] as f64, extent[1] / n[1] as f64, extent[2] / n[2] as f64],
        }
    }

    pub fn index_box(&self) -> IndexBox {
        IndexBox::new([0; 3], [self.n[0] as i64, self.n[1] as i64, self.n[2] as i64])
    }

    pub fn extent(&self, axis: usize) -> f64 {
        self.n[axis] as f64 * self.h[axis]
    }

    pub fn cell_volume(&self) -> f64 {
        self.h[0] * self.h[1] * self.h[2]
    }

    pub fn volume(&self) -> f64 {
        self.extent(0) * self.extent(1) * self.extent(2)
    }

    pub fn cells(&self) -> usize {
        self.n[0] * self.n[1] * self.n[2]
    }

    /// Index of the cell containing `x`, which must already be wrapped
    /// into the domain.
    pub fn cell_of(&self, x: Vec3) -> [i64; 3] {
        let mut idx = [0; 3];
        for i in 0..3 {
            let c = ((x[i] - self.origin[i]) / self.h[i]).floor() as i64;
            idx[i] = c.max(0).min(self.n[i] as i64 - 1);
        }
        idx
    }

    pub fn cell_centre(&self, idx: [i64; 3]) -> Vec3 {
        Vec3::zero().map(|i, _| self.origin[i] + (idx[i] as f64 + 0.5) * self.h[i])
    }

    /// Maps a position back into the domain through the periodic boundaries.
    pub fn wrap(&self, x: Vec3) -> Vec3 {
        x.map(|i, c| {
            let len = self.extent(i);
            let mut r = (c - self.origin[i]).rem_euclid(len);
            // rem_euclid can round up to len itself
            if r >= len {
                r = 0.0;
            }
            self.origin[i] + r
        })
    }

    /// The shortest periodic image of a displacement.
    pub fn min_image(&self, dx: Vec3) -> Vec3 {
        dx.map(|i, c| {
            let len = self.extent(i);
            c - len * (c / len).round()
        })
    }
}

/// Each axis of the domain is either split among ranks or kept whole.
///
/// - `Decomposed`: the load balancer may cut along this axis.
/// - `Whole`: every sub-domain spans the full length of this axis.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum AxisTag {
    Decomposed,
    Whole,
}

/// Assignment of one sub-box of the global domain to each rank of a
/// communicator. The boxes tile the domain with no gaps and no overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    boxes: Vec<IndexBox>,
    tags: [AxisTag; 3],
}

impl Partition {
    pub fn new(boxes: Vec<IndexBox>, tags: [AxisTag; 3]) -> Self {
        Partition { boxes, tags }
    }

    /// Splits the domain among `nranks` ranks as if every cell carried
    /// the same load.
    pub fn uniform(domain: &GlobalDomain, tags: [AxisTag; 3], nranks: usize) -> Result<Self, PicError> {
        let load = ndarray::Array3::<f64>::ones((domain.n[0], domain.n[1], domain.n[2]));
        let boxes = orb(&load, domain.index_box(), &tags, nranks).ok_or_else(|| {
            PicError::config(format!(
                "a {}x{}x{} grid cannot be bisected among {} ranks along the decomposed axes",
                domain.n[0], domain.n[1], domain.n[2], nranks
            ))
        })?;
        Ok(Partition { boxes, tags })
    }

    pub fn nranks(&self) -> usize {
        self.boxes.len()
    }

    pub fn tags(&self) -> &[AxisTag; 3] {
        &self.tags
    }

    pub fn boxes(&self) -> &[IndexBox] {
        &self.boxes
    }

    pub fn local_box(&self, rank: usize) -> IndexBox {
        self.boxes[rank]
    }

    /// Rank owning the given cell of the global domain.
    pub fn owner_of(&self, idx: [i64; 3]) -> Option<usize> {
        self.boxes.iter().position(|b| b.contains(idx))
    }

    /// Checks that the boxes cover `domain` exactly once, returning a
    /// description of the first defect found.
    pub fn check_tiling(&self, domain: &GlobalDomain) -> Result<(), String> {
        let global = domain.index_box();
        let mut covered = 0;
        for (r, b) in self.boxes.iter().enumerate() {
            if b.is_empty() {
                return Err(format!("rank {} owns no cells", r));
            }
            if b.intersect(&global) != Some(*b) {
                return Err(format!("rank {} owns cells outside the domain: {:?}", r, b));
            }
            for (s, other) in self.boxes.iter().enumerate().skip(r + 1) {
                if let Some(overlap) = b.intersect(other) {
                    return Err(format!("ranks {} and {} overlap in {:?}", r, s, overlap));
                }
            }
            covered += b.len();
        }
        if covered != global.len() {
            return Err(format!("{} of {} cells are owned", covered, global.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxes_intersect_and_split() {
        let a = IndexBox::new([0, 0, 0], [4, 4, 4]);
        let b = IndexBox::new([2, -1, 3], [6, 2, 8]);
        assert_eq!(a.intersect(&b), Some(IndexBox::new([2, 0, 3], [4, 2, 4])));
        assert_eq!(a.intersect(&a.shift([4, 0, 0])), None);

        let (l, r) = a.split(1, 1);
        assert_eq!(l.len() + r.len(), a.len());
        assert_eq!(l.hi[1], 1);
        assert_eq!(a.extend_all(1).len(), 216);
    }

    #[test]
    fn iteration_is_row_major() {
        let b = IndexBox::new([1, 0, 0], [3, 2, 3]);
        for (n, idx) in b.iter().enumerate() {
            assert_eq!(b.row_major_offset(idx), n);
        }
        assert_eq!(b.iter().count(), b.len());
    }

    #[test]
    fn positions_wrap_periodically() {
        let domain = GlobalDomain::new([8, 8, 8], [2.0, 2.0, 2.0]);
        let x = domain.wrap(Vec3::new(-0.25, 2.5, 1.0));
        assert!((x.x - 1.75).abs() < 1e-15);
        assert!((x.y - 0.5).abs() < 1e-15);
        assert_eq!(domain.cell_of(x), [7, 2, 4]);
        let d = domain.min_image(Vec3::new(1.9, -1.2, 0.3));
        assert!((d.x + 0.1).abs() < 1e-12);
        assert!((d.y - 0.8).abs() < 1e-12);
    }

    #[test]
    fn uniform_partition_tiles_domain() {
        let domain = GlobalDomain::new([16, 16, 16], [1.0, 1.0, 1.0]);
        let tags = [AxisTag::Decomposed; 3];
        for nranks in 1..9 {
            let partition = Partition::uniform(&domain, tags, nranks).unwrap();
            assert_eq!(partition.nranks(), nranks);
            assert_eq!(partition.check_tiling(&domain), Ok(()));
        }
    }

    #[test]
    fn whole_axes_are_never_cut() {
        let domain = GlobalDomain::new([8, 8, 8], [1.0, 1.0, 1.0]);
        let tags = [AxisTag::Whole, AxisTag::Decomposed, AxisTag::Whole];
        let partition = Partition::uniform(&domain, tags, 4).unwrap();
        for b in partition.boxes() {
            assert_eq!(b.dim(0), 8);
            assert_eq!(b.dim(2), 8);
            assert_eq!(b.dim(1), 2);
        }
    }

    #[test]
    fn too_many_ranks_is_a_configuration_error() {
        let domain = GlobalDomain::new([2, 8, 8], [1.0, 1.0, 1.0]);
        let tags = [AxisTag::Decomposed, AxisTag::Whole, AxisTag::Whole];
        assert!(Partition::uniform(&domain, tags, 3).is_err());
    }
}
