//! Mesh quantities stored over a rank's sub-domain plus a ghost layer

use ndarray::{s, Array4, ArrayView4, ArrayViewMut4};

use super::{GlobalDomain, IndexBox, Partition};
use crate::comm::{util, Communicator};
use crate::error::PicError;

/// Width of the ghost layer. Cloud-in-cell touches at most one cell
/// beyond the one containing a particle.
pub const GHOST_WIDTH: usize = 1;

/// Cell-centred values over the owned box extended by `GHOST_WIDTH`
/// cells on every face. The last array axis runs over components, e.g.
/// one for charge density and three for the electric field.
///
/// Ghost values are undefined until `fill_ghosts` has been called.
#[derive(Debug, Clone)]
pub struct GhostedField {
    owned: IndexBox,
    ghosted: IndexBox,
    data: Array4<f64>,
}

/// Periodic image offsets, in units of the domain size.
fn images() -> impl Iterator<Item = [i64; 3]> {
    (-1..=1).flat_map(|i| (-1..=1).flat_map(move |j| (-1..=1).map(move |k| [i, j, k])))
}

/// The pieces of `owner`'s box (and its periodic images) that fall inside
/// `ghosted`, as (image shift in cells, overlap in `ghosted` coordinates).
/// Both ends of an exchange compute the same list in the same order,
/// so the messages carry only values.
fn overlaps(owner: &IndexBox, ghosted: &IndexBox, n: [usize; 3], skip_identity: bool) -> Vec<([i64; 3], IndexBox)> {
    images()
        .filter(|m| !(skip_identity && *m == [0, 0, 0]))
        .filter_map(|m| {
            let shift = [m[0] * n[0] as i64, m[1] * n[1] as i64, m[2] * n[2] as i64];
            owner.shift(shift).intersect(ghosted).map(|overlap| (shift, overlap))
        })
        .collect()
}

fn unshift(idx: [i64; 3], shift: [i64; 3]) -> [i64; 3] {
    [idx[0] - shift[0], idx[1] - shift[1], idx[2] - shift[2]]
}

impl GhostedField {
    pub fn new(owned: IndexBox, components: usize) -> Self {
        let ghosted = owned.extend_all(GHOST_WIDTH);
        let [nx, ny, nz] = ghosted.shape();
        GhostedField {
            owned,
            ghosted,
            data: Array4::zeros((nx, ny, nz, components)),
        }
    }

    pub fn owned(&self) -> IndexBox {
        self.owned
    }

    pub fn ghosted(&self) -> IndexBox {
        self.ghosted
    }

    pub fn components(&self) -> usize {
        self.data.dim().3
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Value of component `c` at global index `idx`, which may lie in the
    /// ghost layer.
    pub fn get(&self, idx: [i64; 3], c: usize) -> f64 {
        let [i, j, k] = self.ghosted.offset(idx);
        self.data[[i, j, k, c]]
    }

    pub fn get_mut(&mut self, idx: [i64; 3], c: usize) -> &mut f64 {
        let [i, j, k] = self.ghosted.offset(idx);
        &mut self.data[[i, j, k, c]]
    }

    /// The owned cells, without ghosts.
    pub fn interior(&self) -> ArrayView4<f64> {
        let w = GHOST_WIDTH;
        let [nx, ny, nz] = self.owned.shape();
        self.data.slice(s![w..w + nx, w..w + ny, w..w + nz, ..])
    }

    pub fn interior_mut(&mut self) -> ArrayViewMut4<f64> {
        let w = GHOST_WIDTH;
        let [nx, ny, nz] = self.owned.shape();
        self.data.slice_mut(s![w..w + nx, w..w + ny, w..w + nz, ..])
    }

    fn pack(&self, region: &IndexBox) -> Vec<f64> {
        let nc = self.components();
        let mut buf = Vec::with_capacity(region.len() * nc);
        for idx in region.iter() {
            for c in 0..nc {
                buf.push(self.get(idx, c));
            }
        }
        buf
    }

    /// Adds the contributions deposited in ghost cells onto the ranks that
    /// own those cells, through the periodic boundaries where necessary.
    /// Afterwards the owned cells hold complete sums.
    ///
    /// Must be called on all processes.
    pub fn accumulate_ghosts(&mut self, comm: &impl Communicator, domain: &GlobalDomain, partition: &Partition) -> Result<(), PicError> {
        let me = comm.rank();
        let nc = self.components();

        for peer in (0..comm.size()).filter(|&r| r != me) {
            let mut buf = Vec::new();
            for (_, region) in overlaps(&partition.local_box(peer), &self.ghosted, domain.n, false) {
                buf.extend(self.pack(&region));
            }
            comm.send(peer, util::f64s_to_bytes(&buf))?;
        }

        for (shift, region) in overlaps(&self.owned, &self.ghosted, domain.n, true) {
            for idx in region.iter() {
                for c in 0..nc {
                    let v = self.get(idx, c);
                    *self.get_mut(unshift(idx, shift), c) += v;
                }
            }
        }

        for peer in (0..comm.size()).filter(|&r| r != me) {
            let values = util::bytes_to_f64s(&comm.recv(peer)?)?;
            let peer_ghosted = partition.local_box(peer).extend_all(GHOST_WIDTH);
            let mut it = values.into_iter();
            for (shift, region) in overlaps(&self.owned, &peer_ghosted, domain.n, false) {
                for idx in region.iter() {
                    for c in 0..nc {
                        let v = it.next().ok_or_else(|| PicError::Comm(format!("short ghost message from rank {}", peer)))?;
                        *self.get_mut(unshift(idx, shift), c) += v;
                    }
                }
            }
        }
        Ok(())
    }

    /// Copies owned values into the ghost layers of neighbouring ranks
    /// (and of this rank, through the periodic boundaries).
    ///
    /// Must be called on all processes.
    pub fn fill_ghosts(&mut self, comm: &impl Communicator, domain: &GlobalDomain, partition: &Partition) -> Result<(), PicError> {
        let me = comm.rank();
        let nc = self.components();

        for peer in (0..comm.size()).filter(|&r| r != me) {
            let peer_ghosted = partition.local_box(peer).extend_all(GHOST_WIDTH);
            let mut buf = Vec::new();
            for (shift, region) in overlaps(&self.owned, &peer_ghosted, domain.n, false) {
                for idx in region.iter() {
                    for c in 0..nc {
                        buf.push(self.get(unshift(idx, shift), c));
                    }
                }
            }
            comm.send(peer, util::f64s_to_bytes(&buf))?;
        }

        for (shift, region) in overlaps(&self.owned, &self.ghosted, domain.n, true) {
            for idx in region.iter() {
                for c in 0..nc {
                    let v = self.get(unshift(idx, shift), c);
                    *self.get_mut(idx, c) = v;
                }
            }
        }

        for peer in (0..comm.size()).filter(|&r| r != me) {
            let values = util::bytes_to_f64s(&comm.recv(peer)?)?;
            let mut it = values.into_iter();
            for (_, region) in overlaps(&partition.local_box(peer), &self.ghosted, domain.n, false) {
                for idx in region.iter() {
                    for c in 0..nc {
                        *self.get_mut(idx, c) = it.next().ok_or_else(|| PicError::Comm(format!("short ghost message from rank {}", peer)))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sum of each component over the owned cells of all ranks.
    ///
    /// Must be called on all processes.
    pub fn global_sum(&self, comm: &impl Communicator) -> Result<Vec<f64>, PicError> {
        let mut sums: Vec<f64> = (0..self.components())
            .map(|c| self.interior().slice(s![.., .., .., c]).sum())
            .collect();
        comm.all_reduce_sum(&mut sums)?;
        Ok(sums)
    }

    /// Largest absolute value of component `c` over all ranks.
    ///
    /// Must be called on all processes.
    pub fn max_abs(&self, comm: &impl Communicator, c: usize) -> Result<f64, PicError> {
        let local = self.interior()
            .slice(s![.., .., .., c])
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        comm.max(local)
    }

    pub fn is_finite(&self) -> bool {
        self.interior().iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use crate::grid::AxisTag;

    fn label(idx: [i64; 3]) -> f64 {
        (100 * idx[0] + 10 * idx[1] + idx[2]) as f64
    }

    #[test]
    fn ghosts_hold_periodic_neighbours() {
        for nranks in [1, 2, 3] {
            ThreadComm::run(nranks, |comm| {
                let domain = GlobalDomain::new([6, 4, 5], [1.0, 1.0, 1.0]);
                let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], comm.size()).unwrap();
                let mut field = GhostedField::new(partition.local_box(comm.rank()), 2);
                for idx in field.owned().iter() {
                    *field.get_mut(idx, 0) = label(idx);
                    *field.get_mut(idx, 1) = -label(idx);
                }
                field.fill_ghosts(&comm, &domain, &partition).unwrap();

                let n = domain.n;
                for idx in field.ghosted().iter() {
                    let wrapped = [
                        idx[0].rem_euclid(n[0] as i64),
                        idx[1].rem_euclid(n[1] as i64),
                        idx[2].rem_euclid(n[2] as i64),
                    ];
                    assert_eq!(field.get(idx, 0), label(wrapped));
                    assert_eq!(field.get(idx, 1), -label(wrapped));
                }
            });
        }
    }

    #[test]
    fn accumulation_conserves_the_total() {
        let got = ThreadComm::run(4, |comm| {
            let domain = GlobalDomain::new([8, 8, 8], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], comm.size()).unwrap();
            let mut field = GhostedField::new(partition.local_box(comm.rank()), 1);
            // one unit in every cell, ghosts included
            field.data.fill(1.0);
            let ghosted_cells = field.ghosted().len() as f64;
            let expected = comm.sum(ghosted_cells).unwrap();
            field.accumulate_ghosts(&comm, &domain, &partition).unwrap();
            (field.global_sum(&comm).unwrap()[0], expected)
        });
        for (sum, expected) in got {
            assert_eq!(sum, expected);
        }
    }

    #[test]
    fn reductions_cover_owned_cells_only() {
        let got = ThreadComm::run(2, |comm| {
            let domain = GlobalDomain::new([4, 4, 4], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 2).unwrap();
            let mut field = GhostedField::new(partition.local_box(comm.rank()), 1);
            field.data.fill(1000.0);
            field.interior_mut().fill(-2.0);
            (
                field.global_sum(&comm).unwrap()[0],
                field.max_abs(&comm, 0).unwrap(),
            )
        });
        for (sum, max) in got {
            assert_eq!(sum, -128.0);
            assert_eq!(max, 2.0);
        }
    }
}
