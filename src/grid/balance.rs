//! Dynamic load balancing by orthogonal recursive bisection

use std::cmp::Reverse;

use log::{debug, info, warn};
use ndarray::{s, Array3, Axis};

use super::{AxisTag, GlobalDomain, IndexBox, Partition};
use crate::comm::Communicator;
use crate::error::PicError;
use crate::particle::Particle;

/// Work estimate per cell over one rank's sub-domain. Only meaningful for
/// the partition it was measured on: a metric whose region no longer
/// matches the rank's box is stale and contributes nothing to a
/// repartition.
#[derive(Debug, Clone)]
pub struct LoadMetric {
    region: IndexBox,
    weights: Array3<f64>,
}

impl LoadMetric {
    /// Number of particles per cell (nearest grid point).
    pub fn from_particles(domain: &GlobalDomain, region: IndexBox, particles: &[Particle]) -> Self {
        let mut weights = Array3::<f64>::zeros(region.shape());
        for pt in particles {
            let idx = domain.cell_of(pt.x);
            if region.contains(idx) {
                let [i, j, k] = region.offset(idx);
                weights[[i, j, k]] += 1.0;
            }
        }
        LoadMetric { region, weights }
    }

    pub fn region(&self) -> IndexBox {
        self.region
    }

    pub fn is_current(&self, partition: &Partition, rank: usize) -> bool {
        rank < partition.nranks() && partition.local_box(rank) == self.region
    }
}

/// Decides when the domain should be repartitioned, and how.
#[derive(Debug, Copy, Clone)]
pub struct LoadBalancer {
    threshold: f64,
    interval: usize,
}

impl LoadBalancer {
    /// Repartitioning is considered every `interval` steps, and happens if
    /// the ratio of the largest to the mean per-rank load exceeds
    /// `threshold`. A threshold of 1.0 or below switches balancing off.
    pub fn new(threshold: f64, interval: usize) -> Self {
        LoadBalancer {
            threshold,
            interval: interval.max(1),
        }
    }

    pub fn disabled() -> Self {
        LoadBalancer::new(1.0, 1)
    }

    pub fn is_enabled(&self, nranks: usize) -> bool {
        self.threshold > 1.0 && nranks > 1
    }

    /// Ratio of the largest per-rank load to the mean, 1.0 if there is no
    /// load at all. Must be called on all processes.
    pub fn imbalance(comm: &impl Communicator, local_load: f64) -> Result<f64, PicError> {
        let mut v = [local_load, local_load];
        comm.all_reduce_sum(&mut v[..1])?;
        comm.all_reduce_max(&mut v[1..])?;
        let mean = v[0] / comm.size() as f64;
        if mean > 0.0 {
            Ok(v[1] / mean)
        } else {
            Ok(1.0)
        }
    }

    /// Whether the partition should be rebuilt at step `step`. Collective
    /// whenever balancing is enabled and `step` falls on the cadence; every
    /// rank reaches the same answer.
    pub fn should_repartition(&self, comm: &impl Communicator, local_load: f64, step: usize) -> Result<bool, PicError> {
        if !self.is_enabled(comm.size()) || step % self.interval != 0 {
            return Ok(false);
        }
        let ratio = Self::imbalance(comm, local_load)?;
        debug!("step {}: load imbalance {:.3}", step, ratio);
        Ok(ratio > self.threshold)
    }

    /// Builds a new partition by recursive bisection of the global load.
    /// The per-rank metrics are assembled into a global array on every
    /// rank, so all ranks compute the same partition; an unchanged metric
    /// always yields an unchanged partition.
    ///
    /// Must be called on all processes. Afterwards every field and
    /// particle set distributed according to `current` has to be
    /// redistributed.
    pub fn repartition(
        &self,
        comm: &impl Communicator,
        domain: &GlobalDomain,
        current: &Partition,
        metric: &LoadMetric,
        is_first_call: bool,
    ) -> Result<Partition, PicError> {
        let global_box = domain.index_box();
        let mut load = vec![0.0; domain.cells()];
        if metric.is_current(current, comm.rank()) {
            for idx in metric.region.iter() {
                let [i, j, k] = metric.region.offset(idx);
                load[global_box.row_major_offset(idx)] = metric.weights[[i, j, k]];
            }
        } else {
            debug!("rank {} discards a stale load metric", comm.rank());
        }
        comm.all_reduce_sum(&mut load)?;
        let load = Array3::from_shape_vec((domain.n[0], domain.n[1], domain.n[2]), load)
            .map_err(|e| PicError::Comm(format!("load metric has the wrong shape: {}", e)))?;

        let boxes = match orb(&load, global_box, current.tags(), comm.size()) {
            Some(boxes) => boxes,
            None => {
                warn!("load cannot be bisected among {} ranks, keeping the current partition", comm.size());
                return Ok(current.clone());
            }
        };
        let partition = Partition::new(boxes, *current.tags());
        if let Err(msg) = partition.check_tiling(domain) {
            warn!("bisection gave an invalid partition ({}), keeping the current one", msg);
            return Ok(current.clone());
        }

        if comm.rank() == 0 {
            let per_rank: Vec<f64> = partition.boxes()
                .iter()
                .map(|b| region_load(&load, b))
                .collect();
            let mean = per_rank.iter().sum::<f64>() / per_rank.len() as f64;
            let max = per_rank.iter().cloned().fold(0.0, f64::max);
            let predicted = if mean > 0.0 { max / mean } else { 1.0 };
            if is_first_call {
                info!("initial partition over {} ranks, predicted imbalance {:.3}", comm.size(), predicted);
            } else if partition == *current {
                debug!("repartition left the partition unchanged");
            } else {
                info!("repartitioned over {} ranks, predicted imbalance {:.3}", comm.size(), predicted);
            }
        }

        Ok(partition)
    }
}

fn region_load(load: &Array3<f64>, region: &IndexBox) -> f64 {
    load.slice(s![
        region.lo[0] as usize..region.hi[0] as usize,
        region.lo[1] as usize..region.hi[1] as usize,
        region.lo[2] as usize..region.hi[2] as usize
    ])
    .sum()
}

/// Load summed over slabs perpendicular to each axis.
fn project(load: &Array3<f64>, region: &IndexBox) -> [Vec<f64>; 3] {
    let view = load.slice(s![
        region.lo[0] as usize..region.hi[0] as usize,
        region.lo[1] as usize..region.hi[1] as usize,
        region.lo[2] as usize..region.hi[2] as usize
    ]);
    [
        view.sum_axis(Axis(2)).sum_axis(Axis(1)).to_vec(),
        view.sum_axis(Axis(2)).sum_axis(Axis(0)).to_vec(),
        view.sum_axis(Axis(1)).sum_axis(Axis(0)).to_vec(),
    ]
}

/// Number of cells in the region counting decomposed axes only, i.e.
/// the most ranks it could be split among.
fn capacity(region: &IndexBox, tags: &[AxisTag; 3]) -> usize {
    (0..3)
        .filter(|&i| tags[i] == AxisTag::Decomposed)
        .map(|i| region.dim(i))
        .product()
}

#[derive(Debug, Copy, Clone)]
struct Cut {
    axis: usize,
    at: usize,
    left: f64,
    miss: f64,
    off_centre: f64,
    extent: usize,
}

impl Cut {
    fn key(&self) -> (f64, Reverse<usize>, usize, f64) {
        (self.miss, Reverse(self.extent), self.axis, self.off_centre)
    }
}

/// Splits `region` into `nranks` boxes of roughly equal load and returns
/// them in rank order, or `None` if the region has too few cells along
/// its decomposed axes.
///
/// At each level the ranks are divided `n/2 : n - n/2` and the region is
/// cut where the left-hand load comes closest to its proportional share.
/// Of all axes, the one that admits the closest cut wins; ties go to the
/// longest axis, then the lowest. Within an axis, ties go to the cut
/// nearest the proportional midpoint. A side that would carry no load at
/// all is shrunk to the fewest cells its ranks need, which hands the
/// empty space to its loaded neighbour.
pub fn orb(load: &Array3<f64>, region: IndexBox, tags: &[AxisTag; 3], nranks: usize) -> Option<Vec<IndexBox>> {
    if nranks == 0 {
        return None;
    }
    let mut leaves = Vec::with_capacity(nranks);
    bisect(load, region, tags, nranks, &mut leaves)?;
    Some(leaves)
}

fn bisect(load: &Array3<f64>, region: IndexBox, tags: &[AxisTag; 3], nranks: usize, leaves: &mut Vec<IndexBox>) -> Option<()> {
    if nranks == 1 {
        leaves.push(region);
        return Some(());
    }

    let nl = nranks / 2;
    let nr = nranks - nl;
    let cap = capacity(&region, tags);
    if cap < nranks {
        return None;
    }

    let projections = project(load, &region);
    let total: f64 = projections[0].iter().sum();
    let target = total * (nl as f64) / (nranks as f64);

    let mut best: Option<Cut> = None;
    for axis in (0..3).filter(|&i| tags[i] == AxisTag::Decomposed) {
        let d = region.dim(axis);
        if d < 2 {
            continue;
        }
        let q = cap / d;
        let mid = (d as f64) * (nl as f64) / (nranks as f64);
        let mut left = 0.0;
        for at in 1..d {
            left += projections[axis][at - 1];
            if at * q < nl || (d - at) * q < nr {
                continue;
            }
            let cut = Cut {
                axis,
                at,
                left,
                miss: (left - target).abs(),
                off_centre: (at as f64 - mid).abs(),
                extent: d,
            };
            if best.map_or(true, |b| cut.key() < b.key()) {
                best = Some(cut);
            }
        }
    }
    let mut cut = best?;

    // merge an empty side into its neighbour
    if total > 0.0 {
        let d = region.dim(cut.axis);
        let q = cap / d;
        if cut.left == 0.0 {
            cut.at = (nl + q - 1) / q;
        } else if cut.left >= total {
            cut.at = d - (nr + q - 1) / q;
        }
    }

    let (lower, upper) = region.split(cut.axis, region.lo[cut.axis] + cut.at as i64);
    bisect(load, lower, tags, nl, leaves)?;
    bisect(load, upper, tags, nr, leaves)
}
