//! Initial conditions for Landau damping

use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

use super::{Particle, Vec3};
use crate::grid::{GlobalDomain, Partition};

/// Draws particles from a Maxwellian in momentum and the density
/// `(1 + α cos(k x))(1 + α cos(k y))(1 + α cos(k z))` in position.
///
/// Every rank generates the same sequence of particles and keeps those it
/// owns, so the result depends only on the seed and not on how the domain
/// is partitioned.
#[derive(Debug, Copy, Clone)]
pub struct LandauSampler {
    pub alpha: f64,
    pub k: f64,
    pub seed: u64,
}

impl LandauSampler {
    pub fn new(alpha: f64, k: f64, seed: u64) -> Self {
        LandauSampler { alpha, k, seed }
    }

    /// Unnormalized number density at `x`.
    pub fn density(&self, domain: &GlobalDomain, x: Vec3) -> f64 {
        (0..3)
            .map(|i| 1.0 + self.alpha * (self.k * (x[i] - domain.origin[i])).cos())
            .product()
    }

    // integral of the density along one axis, from the origin to s
    fn cdf(&self, s: f64) -> f64 {
        s + (self.alpha / self.k) * (self.k * s).sin()
    }

    /// Inverts the cumulative distribution along an axis of length `len`
    /// for a uniform deviate `u`, by Newton's method.
    fn invert(&self, u: f64, len: f64) -> f64 {
        let target = u * self.cdf(len);
        let mut s = u * len;
        for _ in 0..30 {
            let f = self.cdf(s) - target;
            let df = 1.0 + self.alpha * (self.k * s).cos();
            let delta = f / df;
            s -= delta;
            if delta.abs() < 1.0e-14 * len {
                break;
            }
        }
        s.max(0.0).min(len)
    }

    /// The particles owned by `rank`, out of `count` in total. Each carries
    /// charge `-V / count`, where `V` is the domain volume, so the plasma is
    /// neutral against a uniform background of unit density.
    pub fn sample(&self, domain: &GlobalDomain, partition: &Partition, rank: usize, count: usize) -> Vec<Particle> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let q = -domain.volume() / (count as f64);
        let owned = partition.local_box(rank);

        let mut pt = Vec::new();
        for id in 0..count as u64 {
            let u: [f64; 3] = [rng.gen(), rng.gen(), rng.gen()];
            let p = Vec3::new(
                rng.sample(StandardNormal),
                rng.sample(StandardNormal),
                rng.sample(StandardNormal),
            );
            let x = domain.wrap(Vec3::zero().map(|i, _| {
                domain.origin[i] + self.invert(u[i], domain.extent(i))
            }));
            if owned.contains(domain.cell_of(x)) {
                pt.push(Particle::new(id, x, p, q));
            }
        }
        pt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::AxisTag;

    #[test]
    fn sampling_is_independent_of_the_partition() {
        let domain = GlobalDomain::new([8, 8, 8], [4.0 * std::f64::consts::PI; 3]);
        let sampler = LandauSampler::new(0.05, 0.5, 7);
        let one = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 1).unwrap();
        let three = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 3).unwrap();

        let reference = sampler.sample(&domain, &one, 0, 200);
        let mut split: Vec<Particle> = (0..3)
            .flat_map(|r| sampler.sample(&domain, &three, r, 200))
            .collect();
        split.sort_by_key(|pt| pt.id);
        assert_eq!(reference, split);

        let total: f64 = reference.iter().map(|pt| pt.q).sum();
        assert!((total + domain.volume()).abs() < 1e-9 * domain.volume());
    }

    #[test]
    fn inverse_cdf_is_accurate() {
        let sampler = LandauSampler::new(0.5, 0.5, 0);
        let len = 4.0 * std::f64::consts::PI;
        for &u in &[0.0, 0.1, 0.37, 0.5, 0.9, 0.999] {
            let s = sampler.invert(u, len);
            assert!((sampler.cdf(s) / sampler.cdf(len) - u).abs() < 1e-12);
        }
    }
}
