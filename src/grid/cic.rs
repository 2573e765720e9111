//! Cloud-in-cell coupling between particles and the mesh

use std::sync::atomic::{AtomicU64, Ordering};

use rayon::prelude::*;

use super::{GhostedField, GlobalDomain, Partition};
use crate::comm::Communicator;
use crate::error::PicError;
use crate::particle::{Particle, Vec3};

/// The eight cells surrounding a position and their linear weights.
/// Deposition and interpolation both go through this type, so the
/// weights they use at a given position are identical.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Stencil {
    base: [i64; 3],
    w: [[f64; 2]; 3],
}

impl Stencil {
    pub fn at(domain: &GlobalDomain, x: Vec3) -> Self {
        let mut base = [0; 3];
        let mut w = [[0.0; 2]; 3];
        for i in 0..3 {
            // measured from the centre of cell -1
            let l = (x[i] - domain.origin[i]) / domain.h[i] + 0.5;
            let g = l.floor();
            let frac = l - g;
            base[i] = g as i64 - 1;
            w[i] = [1.0 - frac, frac];
        }
        Stencil { base, w }
    }

    /// The cells and weights, in a fixed order.
    pub fn vertices(&self) -> impl Iterator<Item = ([i64; 3], f64)> + '_ {
        (0..8).map(move |n| {
            let (a, b, c) = (n >> 2, (n >> 1) & 1, n & 1);
            let idx = [self.base[0] + a as i64, self.base[1] + b as i64, self.base[2] + c as i64];
            (idx, self.w[0][a] * self.w[1][b] * self.w[2][c])
        })
    }
}

fn atomic_add(cell: &AtomicU64, value: f64) {
    let mut old = cell.load(Ordering::Relaxed);
    loop {
        let new = (f64::from_bits(old) + value).to_bits();
        match cell.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => old = current,
        }
    }
}

/// Deposits `attribute(particle)` onto component 0 of `field`, then folds
/// ghost contributions onto their owners. Particles must lie within the
/// calling rank's sub-domain. Existing values in the field are kept.
///
/// Must be called on all processes.
pub fn scatter<C, F>(
    comm: &C,
    domain: &GlobalDomain,
    partition: &Partition,
    field: &mut GhostedField,
    particles: &[Particle],
    attribute: F,
) -> Result<(), PicError>
where
    C: Communicator,
    F: Fn(&Particle) -> f64 + Sync,
{
    let ghosted = field.ghosted();
    let buffer: Vec<AtomicU64> = (0..ghosted.len()).map(|_| AtomicU64::new(0)).collect();

    particles.par_iter().for_each(|pt| {
        let a = attribute(pt);
        for (idx, w) in Stencil::at(domain, pt.x).vertices() {
            atomic_add(&buffer[ghosted.row_major_offset(idx)], a * w);
        }
    });

    for (idx, cell) in ghosted.iter().zip(buffer.iter()) {
        *field.get_mut(idx, 0) += f64::from_bits(cell.load(Ordering::Relaxed));
    }

    field.accumulate_ghosts(comm, domain, partition)
}

/// Interpolates the three components of `field` (whose ghosts must be
/// filled) onto each particle's stored field.
pub fn gather(domain: &GlobalDomain, field: &GhostedField, particles: &mut [Particle]) {
    particles.par_iter_mut().for_each(|pt| {
        let mut e = Vec3::zero();
        for (idx, w) in Stencil::at(domain, pt.x).vertices() {
            for c in 0..3 {
                e[c] += w * field.get(idx, c);
            }
        }
        pt.e = e;
    });
}
