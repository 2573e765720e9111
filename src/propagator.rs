//! Leapfrog advance of a particle set and its self-consistent field

use log::debug;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::diagnostics::{FieldStats, TimeSeries};
use crate::error::PicError;
use crate::grid::{self, AxisTag, GhostedField, GlobalDomain, LoadBalancer, LoadMetric, Partition};
use crate::particle::{Particle, ParticleSet};
use crate::solver::{FieldSolver, Solver};

/// The operations a time-slice driver needs from a propagator.
pub trait Stepper {
    /// Brings the field into agreement with the current particles
    /// (and, if balancing is enabled, the partition into agreement with
    /// the load) before the first step.
    fn initialize(&mut self) -> Result<(), PicError>;

    /// Advances by one timestep.
    fn advance(&mut self) -> Result<(), PicError>;

    /// Measures the field and records it in the attached time series.
    fn dump(&mut self) -> Result<FieldStats, PicError>;
}

#[derive(Debug, Copy, Clone)]
pub struct StepParams {
    pub dt: f64,
    pub q_over_m: f64,
    /// Subtract a uniform background so the total charge density is zero.
    pub neutralize: bool,
}

/// Everything needed to build a propagator for a group of ranks. The
/// coarse and fine propagators of a time slice, and the serial reference
/// run, are all built from the same setup.
#[derive(Debug, Clone)]
pub struct PropagatorSetup {
    pub domain: GlobalDomain,
    pub tags: [AxisTag; 3],
    pub solver: String,
    pub balancer: LoadBalancer,
    pub params: StepParams,
}

impl PropagatorSetup {
    /// A propagator over `comm`, with the domain split evenly among its
    /// ranks and no particles loaded.
    pub fn build<'a, C: Communicator>(&self, comm: &'a C) -> Result<LeapfrogPropagator<'a, C, Solver>, PicError> {
        let partition = Partition::uniform(&self.domain, self.tags, comm.size())?;
        let solver = Solver::from_tag(&self.solver)?;
        Ok(LeapfrogPropagator::new(comm, self.domain, partition, solver, self.balancer, self.params))
    }
}

/// The complete state of the system at one instant: every particle,
/// ordered by id, with the field it last sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: f64,
    pub particles: Vec<Particle>,
}

impl Snapshot {
    pub fn new(time: f64, mut particles: Vec<Particle>) -> Self {
        particles.sort_unstable_by_key(|pt| pt.id);
        Snapshot { time, particles }
    }

    /// The parareal update `g_new + f_old - g_old`, applied particle by
    /// particle. Positions are differenced by minimum image and the
    /// result wrapped back into the domain.
    pub fn corrected(domain: &GlobalDomain, g_new: &Snapshot, f_old: &Snapshot, g_old: &Snapshot) -> Snapshot {
        debug_assert_eq!(g_new.particles.len(), f_old.particles.len());
        debug_assert_eq!(g_new.particles.len(), g_old.particles.len());
        let particles = g_new.particles.iter()
            .zip(f_old.particles.iter().zip(g_old.particles.iter()))
            .map(|(g, (f, o))| {
                debug_assert!(g.id == f.id && g.id == o.id);
                Particle {
                    id: g.id,
                    x: domain.wrap(g.x + domain.min_image(f.x - o.x)),
                    p: g.p + f.p - o.p,
                    q: g.q,
                    e: g.e + f.e - o.e,
                }
            })
            .collect();
        Snapshot { time: g_new.time, particles }
    }

    /// `|U - V| / |U|` over positions and momenta, with positions
    /// differenced by minimum image.
    pub fn relative_distance(&self, other: &Snapshot, domain: &GlobalDomain) -> f64 {
        let (diff, norm) = self.particles.iter()
            .zip(other.particles.iter())
            .fold((0.0, 0.0), |(diff, norm), (a, b)| {
                let dx = domain.min_image(a.x - b.x);
                let dp = a.p - b.p;
                (diff + dx.norm_sqr() + dp.norm_sqr(), norm + a.x.norm_sqr() + a.p.norm_sqr())
            });
        if norm > 0.0 {
            (diff / norm).sqrt()
        } else {
            diff.sqrt()
        }
    }
}

/// Kick-drift-kick integrator for one group of ranks. Holds no global
/// clock: time and step count are local to the propagator and reset by
/// `propagate`.
pub struct LeapfrogPropagator<'a, C: Communicator, S: FieldSolver> {
    comm: &'a C,
    domain: GlobalDomain,
    partition: Partition,
    particles: ParticleSet,
    rho: GhostedField,
    e: GhostedField,
    solver: S,
    balancer: LoadBalancer,
    params: StepParams,
    total_charge: f64,
    step: usize,
    time: f64,
    output: TimeSeries,
    output_interval: usize,
}

impl<'a, C: Communicator, S: FieldSolver> LeapfrogPropagator<'a, C, S> {
    pub fn new(
        comm: &'a C,
        domain: GlobalDomain,
        partition: Partition,
        solver: S,
        balancer: LoadBalancer,
        params: StepParams,
    ) -> Self {
        let owned = partition.local_box(comm.rank());
        LeapfrogPropagator {
            comm,
            domain,
            rho: GhostedField::new(owned, 1),
            e: GhostedField::new(owned, 3),
            partition,
            particles: ParticleSet::new_empty(),
            solver,
            balancer,
            params,
            total_charge: 0.0,
            step: 0,
            time: 0.0,
            output: TimeSeries::discard(),
            output_interval: 1,
        }
    }

    /// Records a diagnostics row every `interval` steps of `propagate`.
    pub fn with_output(&mut self, output: TimeSeries, interval: usize) -> &mut Self {
        self.output = output;
        self.output_interval = interval.max(1);
        self
    }

    /// Replaces the particles with this rank's share of `all`.
    pub fn load(&mut self, time: f64, all: &[Particle]) {
        self.particles = ParticleSet::from_global(&self.domain, &self.partition, self.comm.rank(), all);
        self.time = time;
        self.step = 0;
    }

    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn field(&self) -> &GhostedField {
        &self.e
    }

    pub fn density(&self) -> &GhostedField {
        &self.rho
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_timestep(&mut self, dt: f64) {
        self.params.dt = dt;
    }

    pub fn flush_output(&mut self) -> Result<(), PicError> {
        self.output.flush()
    }

    /// Runs `steps` steps of size `dt` starting from `start`, and returns
    /// the end state (on every rank of the group) with its field stats.
    ///
    /// Must be called on all processes.
    pub fn propagate(&mut self, start: &Snapshot, steps: usize, dt: f64) -> Result<(Snapshot, FieldStats), PicError> {
        self.set_timestep(dt);
        self.load(start.time, &start.particles);
        self.initialize()?;
        for _ in 0..steps {
            self.advance()?;
            if self.step % self.output_interval == 0 {
                self.dump()?;
            }
        }
        self.flush_output()?;

        let end = Snapshot {
            time: self.time,
            particles: self.particles.gather_all(self.comm)?,
        };
        let stats = FieldStats::measure(self.comm, &self.domain, &self.e)?;
        Ok((end, stats))
    }

    fn adopt(&mut self, partition: Partition) -> Result<(), PicError> {
        self.partition = partition;
        let owned = self.partition.local_box(self.comm.rank());
        self.rho = GhostedField::new(owned, 1);
        self.e = GhostedField::new(owned, 3);
        self.particles.migrate(self.comm, &self.domain, &self.partition)
    }

    fn repartition(&mut self, is_first_call: bool) -> Result<(), PicError> {
        let owned = self.partition.local_box(self.comm.rank());
        let metric = LoadMetric::from_particles(&self.domain, owned, self.particles.all());
        let partition = self.balancer.repartition(self.comm, &self.domain, &self.partition, &metric, is_first_call)?;
        if partition != self.partition {
            self.adopt(partition)?;
        }
        Ok(())
    }

    /// Deposit, solve and interpolate: afterwards every particle carries
    /// the field at its position.
    fn update_field(&mut self) -> Result<(), PicError> {
        let comm = self.comm;

        self.rho.clear();
        grid::scatter(comm, &self.domain, &self.partition, &mut self.rho, self.particles.all(), |pt| pt.q)?;

        let deposited = self.rho.global_sum(comm)?[0];
        if self.total_charge != 0.0 {
            debug!(
                "step {}: relative charge error {:.3e}",
                self.step,
                ((self.total_charge - deposited) / self.total_charge).abs()
            );
        }

        let cell_volume = self.domain.cell_volume();
        let background = if self.params.neutralize {
            self.total_charge / self.domain.volume()
        } else {
            0.0
        };
        self.rho.interior_mut().par_mapv_inplace(|v| v / cell_volume - background);

        self.solver.set_charge_density(&self.rho);
        self.solver.solve(comm, &self.domain, &mut self.e)?;
        if !self.e.is_finite() {
            return Err(PicError::NonFinite { stage: "field solve", step: self.step });
        }

        self.e.fill_ghosts(comm, &self.domain, &self.partition)?;
        grid::gather(&self.domain, &self.e, self.particles.all_mut());
        Ok(())
    }
}

impl<'a, C: Communicator, S: FieldSolver> Stepper for LeapfrogPropagator<'a, C, S> {
    fn initialize(&mut self) -> Result<(), PicError> {
        self.total_charge = self.particles.total_charge(self.comm)?;
        if self.balancer.is_enabled(self.comm.size()) {
            self.repartition(true)?;
        }
        self.update_field()
    }

    fn advance(&mut self) -> Result<(), PicError> {
        let dt = self.params.dt;
        let q_over_m = self.params.q_over_m;

        self.particles.kick(q_over_m, 0.5 * dt);
        self.particles.drift(dt);
        self.particles.migrate(self.comm, &self.domain, &self.partition)?;

        if self.balancer.should_repartition(self.comm, self.particles.len() as f64, self.step)? {
            self.repartition(false)?;
        }

        self.update_field()?;
        self.particles.kick(q_over_m, 0.5 * dt);
        if !self.particles.is_finite() {
            return Err(PicError::NonFinite { stage: "kick", step: self.step });
        }

        self.step += 1;
        self.time += dt;
        Ok(())
    }

    fn dump(&mut self) -> Result<FieldStats, PicError> {
        let stats = FieldStats::measure(self.comm, &self.domain, &self.e)?;
        self.output.push(self.time, &stats)?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use crate::grid::AxisTag;
    use crate::particle::{LandauSampler, Vec3};
    use crate::solver::Solver;

    fn params(dt: f64) -> StepParams {
        StepParams { dt, q_over_m: -1.0, neutralize: true }
    }

    #[test]
    fn scenario_conserves_charge_and_locality() {
        let got = ThreadComm::run(2, |comm| {
            let domain = GlobalDomain::new([16, 16, 16], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 2).unwrap();
            let all: Vec<Particle> = (0..1024u64)
                .map(|n| {
                    let f = |m: u64| ((n * m + 17) % 1019) as f64 / 1019.0;
                    let p = Vec3::new(f(3) - 0.5, f(5) - 0.5, f(11) - 0.5);
                    Particle::new(n, Vec3::new(f(7), f(13), f(29)), p, 1.0 / 1024.0)
                })
                .collect();

            let mut prop = LeapfrogPropagator::new(
                &comm, domain, partition,
                Solver::from_tag("fft").unwrap(),
                LoadBalancer::disabled(),
                StepParams { dt: 0.05, q_over_m: 0.0, neutralize: false },
            );
            prop.load(0.0, &all);
            prop.initialize().unwrap();

            // deposited density times cell volume recovers the charge
            let deposited = prop.density().global_sum(&comm).unwrap()[0] * domain.cell_volume();
            assert!((deposited - 1.0).abs() < 1e-10);

            prop.advance().unwrap();
            let owned = prop.partition().local_box(comm.rank());
            assert!(prop.particles().all().iter().all(|pt| owned.contains(domain.cell_of(pt.x))));

            let after = prop.particles().gather_all(&comm).unwrap();
            after.iter().zip(all.iter()).all(|(a, b)| {
                let d = domain.min_image(a.x - b.x);
                (0..3).all(|i| d[i].abs() < domain.h[i])
            })
        });
        assert!(got.iter().all(|&ok| ok));
    }

    #[test]
    fn balanced_run_matches_unbalanced_run() {
        let run = |threshold: f64| {
            ThreadComm::run(2, |comm| {
                let domain = GlobalDomain::new([8, 8, 8], [4.0 * std::f64::consts::PI; 3]);
                let tags = [AxisTag::Decomposed; 3];
                let partition = Partition::uniform(&domain, tags, 2).unwrap();
                let sampler = LandauSampler::new(0.3, 0.5, 3);
                let single = Partition::uniform(&domain, tags, 1).unwrap();
                let start = Snapshot::new(0.0, sampler.sample(&domain, &single, 0, 400));

                let mut prop = LeapfrogPropagator::new(
                    &comm, domain, partition,
                    Solver::from_tag("fft").unwrap(),
                    LoadBalancer::new(threshold, 1),
                    params(0.1),
                );
                let (end, _) = prop.propagate(&start, 4, 0.1).unwrap();
                end
            })
        };
        let plain = run(1.0);
        let balanced = run(1.0001);
        let domain = GlobalDomain::new([8, 8, 8], [4.0 * std::f64::consts::PI; 3]);
        assert_eq!(plain[0], plain[1]);
        assert!(plain[0].relative_distance(&balanced[0], &domain) < 1e-10);
    }

    /// Writes a uniform `E_x`, zero on the first solve and `later` after.
    struct StepField {
        solves: usize,
        later: f64,
    }

    impl FieldSolver for StepField {
        fn name(&self) -> &'static str {
            "step"
        }

        fn set_charge_density(&mut self, _rho: &GhostedField) {}

        fn solve(&mut self, _comm: &impl Communicator, _domain: &GlobalDomain, e: &mut GhostedField) -> Result<(), PicError> {
            let value = if self.solves == 0 { 0.0 } else { self.later };
            self.solves += 1;
            e.interior_mut().fill(0.0);
            e.interior_mut().index_axis_mut(ndarray::Axis(3), 0).fill(value);
            Ok(())
        }
    }

    #[test]
    fn nan_momentum_aborts_at_the_field_solve() {
        let got = ThreadComm::run(1, |comm| {
            let domain = GlobalDomain::new([4, 4, 4], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 1).unwrap();
            let mut prop = LeapfrogPropagator::new(
                &comm, domain, partition,
                Solver::from_tag("fft").unwrap(),
                LoadBalancer::disabled(),
                params(0.1),
            );
            let bad = Particle::new(0, Vec3::new(0.3, 0.6, 0.2), Vec3::new(f64::NAN, 0.0, 0.0), -1.0);
            let good = Particle::new(1, Vec3::new(0.7, 0.1, 0.9), Vec3::zero(), -1.0);
            prop.load(0.0, &[bad, good]);
            assert!(prop.initialize().is_ok());
            prop.advance()
        });
        match &got[0] {
            Err(PicError::NonFinite { stage, step }) => {
                assert_eq!(*stage, "field solve");
                assert_eq!(*step, 0);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn momentum_overflow_aborts_at_the_kick() {
        let got = ThreadComm::run(1, |comm| {
            let domain = GlobalDomain::new([4, 4, 4], [1.0, 1.0, 1.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 1).unwrap();
            let mut prop = LeapfrogPropagator::new(
                &comm, domain, partition,
                StepField { solves: 0, later: 1.0e300 },
                LoadBalancer::disabled(),
                StepParams { dt: 0.1, q_over_m: -1.0e10, neutralize: true },
            );
            let pt = Particle::new(0, Vec3::new(0.3, 0.6, 0.2), Vec3::new(0.5, 0.0, 0.0), -1.0);
            prop.load(0.0, &[pt]);
            assert!(prop.initialize().is_ok());
            prop.advance()
        });
        match &got[0] {
            Err(PicError::NonFinite { stage, step }) => {
                assert_eq!(*stage, "kick");
                assert_eq!(*step, 0);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn correction_reproduces_the_fine_state() {
        let domain = GlobalDomain::new([4, 4, 4], [1.0, 1.0, 1.0]);
        let pt = |x: f64, p: f64| Particle::new(0, Vec3::new(x, 0.5, 0.5), Vec3::new(p, 0.0, 0.0), 1.0);
        let g_old = Snapshot::new(1.0, vec![pt(0.95, 1.0)]);
        let f_old = Snapshot::new(1.0, vec![pt(0.05, 1.5)]);
        // same coarse prediction: corrected state is the fine state
        let u = Snapshot::corrected(&domain, &g_old, &f_old, &g_old);
        assert!((u.particles[0].x.x - 0.05).abs() < 1e-12);
        assert!((u.particles[0].p.x - 1.5).abs() < 1e-12);
        assert!(u.relative_distance(&f_old, &domain) < 1e-12);
        assert!(g_old.relative_distance(&f_old, &domain) > 0.0);
    }
}
