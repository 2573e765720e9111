use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

mod sampler;
mod vec3;

// Re-export for use in main
pub use self::sampler::*;
pub use self::vec3::*;

// For local use
use crate::comm::Communicator;
use crate::error::PicError;
use crate::grid::{GlobalDomain, Partition};

/// A macroparticle. `e` is the electric field at the particle's position,
/// as last interpolated from the mesh.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub id: u64,
    pub x: Vec3,
    pub p: Vec3,
    pub q: f64,
    pub e: Vec3,
}

impl Particle {
    pub fn new(id: u64, x: Vec3, p: Vec3, q: f64) -> Self {
        Particle { id, x, p, q, e: Vec3::zero() }
    }
}

/// The particles held by one rank. Outside of `drift` and `migrate`,
/// every particle lies in the sub-domain owned by that rank.
#[derive(Debug, Clone, Default)]
pub struct ParticleSet {
    store: Vec<Particle>,
}

impl ParticleSet {
    pub fn new(store: Vec<Particle>) -> Self {
        ParticleSet { store }
    }

    pub fn new_empty() -> Self {
        ParticleSet { store: Vec::new() }
    }

    /// Selects, from a complete list, the particles that `rank` owns.
    pub fn from_global(domain: &GlobalDomain, partition: &Partition, rank: usize, all: &[Particle]) -> Self {
        let owned = partition.local_box(rank);
        let store = all.iter()
            .filter(|pt| owned.contains(domain.cell_of(domain.wrap(pt.x))))
            .map(|pt| Particle { x: domain.wrap(pt.x), ..*pt })
            .collect();
        ParticleSet { store }
    }

    pub fn all(&self) -> &[Particle] {
        &self.store[..]
    }

    pub fn all_mut(&mut self) -> &mut [Particle] {
        &mut self.store[..]
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Updates momenta using the stored field, `p += (q/m) E dt`.
    pub fn kick(&mut self, q_over_m: f64, dt: f64) {
        self.store.par_iter_mut()
            .for_each(|pt| pt.p += (q_over_m * dt) * pt.e);
    }

    /// Updates positions using the current momenta. Particles may leave
    /// the rank's sub-domain; call `migrate` afterwards.
    pub fn drift(&mut self, dt: f64) {
        self.store.par_iter_mut()
            .for_each(|pt| pt.x += dt * pt.p);
    }

    /// Wraps positions through the periodic boundaries and sends every
    /// particle to the rank that owns its cell under `partition`.
    /// Also used to redistribute particles after a repartition.
    ///
    /// Must be called on all processes.
    pub fn migrate(&mut self, comm: &impl Communicator, domain: &GlobalDomain, partition: &Partition) -> Result<(), PicError> {
        let me = comm.rank();
        self.store.par_iter_mut()
            .for_each(|pt| pt.x = domain.wrap(pt.x));

        let mut outgoing: Vec<Vec<Particle>> = vec![Vec::new(); comm.size()];
        let mut kept = Vec::with_capacity(self.store.len());
        for pt in self.store.drain(..) {
            let idx = domain.cell_of(pt.x);
            let dest = partition.owner_of(idx)
                .ok_or_else(|| PicError::Comm(format!("no rank owns cell {:?}", idx)))?;
            if dest == me {
                kept.push(pt);
            } else {
                outgoing[dest].push(pt);
            }
        }

        let sent: usize = outgoing.iter().map(Vec::len).sum();
        for (dest, pts) in outgoing.iter().enumerate().filter(|(r, _)| *r != me) {
            comm.send_value(dest, pts)?;
        }
        for source in (0..comm.size()).filter(|&r| r != me) {
            let mut pts: Vec<Particle> = comm.recv_value(source)?;
            kept.append(&mut pts);
        }
        if sent > 0 {
            debug!("rank {} sent {} particles, now holds {}", me, sent, kept.len());
        }

        self.store = kept;
        Ok(())
    }

    /// Every particle of every rank, ordered by id.
    ///
    /// Must be called on all processes.
    pub fn gather_all(&self, comm: &impl Communicator) -> Result<Vec<Particle>, PicError> {
        let mut all: Vec<Particle> = comm.all_gather_value(&self.store)?
            .into_iter()
            .flatten()
            .collect();
        all.par_sort_unstable_by_key(|pt| pt.id);
        Ok(all)
    }

    /// Must be called on all processes.
    pub fn total_charge(&self, comm: &impl Communicator) -> Result<f64, PicError> {
        comm.sum(self.store.iter().map(|pt| pt.q).sum())
    }

    pub fn is_finite(&self) -> bool {
        self.store.par_iter().all(|pt| pt.x.is_finite() && pt.p.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use crate::grid::AxisTag;

    #[test]
    fn migrate_delivers_particles_to_owners() {
        let got = ThreadComm::run(3, |comm| {
            let domain = GlobalDomain::new([12, 6, 6], [3.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed, AxisTag::Whole, AxisTag::Whole], 3).unwrap();

            // every rank starts with a sample spread over the whole domain,
            // some of it outside the periodic box
            let base = 100 * comm.rank() as u64;
            let pts = (0..100).map(|n| {
                let s = n as f64 / 100.0;
                Particle::new(base + n, Vec3::new(7.0 * s - 2.0, s, 0.5), Vec3::zero(), 1.0)
            });
            let mut set = ParticleSet::new(pts.collect());
            set.migrate(&comm, &domain, &partition).unwrap();

            let owned = partition.local_box(comm.rank());
            assert!(set.all().iter().all(|pt| owned.contains(domain.cell_of(pt.x))));
            set.gather_all(&comm).unwrap().len()
        });
        assert!(got.iter().all(|&n| n == 300));
    }

    #[test]
    fn small_steps_cross_the_boundary_once() {
        let got = ThreadComm::run(2, |comm| {
            let domain = GlobalDomain::new([16, 16, 16], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 2).unwrap();
            let all: Vec<Particle> = (0..1024u64)
                .map(|n| {
                    let f = |m: u64| ((n * m) % 1021) as f64 / 1021.0;
                    let p = Vec3::new(f(3) - 0.5, f(5) - 0.5, f(11) - 0.5);
                    Particle::new(n, Vec3::new(f(7), f(13), f(29)), p, 1.0 / 1024.0)
                })
                .collect();
            let mut set = ParticleSet::from_global(&domain, &partition, comm.rank(), &all);

            // zero field, |p| < 0.87, so dt = 0.05 moves less than a cell
            let dt = 0.05;
            set.kick(-1.0, 0.5 * dt);
            set.drift(dt);
            set.migrate(&comm, &domain, &partition).unwrap();
            set.kick(-1.0, 0.5 * dt);

            let owned = partition.local_box(comm.rank());
            assert!(set.all().iter().all(|pt| owned.contains(domain.cell_of(pt.x))));

            let after = set.gather_all(&comm).unwrap();
            after.iter()
                .zip(all.iter())
                .all(|(a, b)| {
                    let d = domain.min_image(a.x - b.x);
                    (0..3).all(|i| d[i].abs() < domain.h[i] && (d[i] - dt * b.p[i]).abs() < 1e-12)
                })
        });
        assert!(got.iter().all(|&ok| ok));
    }
}
