//! Time-parallel integration by parareal correction
//!
//! The horizon is cut into K slices of equal duration and the world
//! communicator into K groups of R ranks; group `i` owns slice `i`.
//! Each iteration runs the fine propagator on every slice concurrently,
//! then sweeps through the slices in order applying
//! `U[i+1] = G(U[i]) + F(U_old[i]) - G(U_old[i])`, where `F` and `G` are
//! the fine and coarse propagators. Slice start states travel from group
//! `i` to group `i + 1` over a handoff communicator that links the ranks
//! with the same local rank in every group.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::PicError;
use crate::propagator::{PropagatorSetup, Snapshot};

#[derive(Debug, Copy, Clone)]
pub struct PararealConfig {
    pub slices: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Coarse steps per slice.
    pub coarse_steps: usize,
    /// Fine steps per slice.
    pub fine_steps: usize,
}

/// One time slice, as seen by the group that owns it.
#[derive(Debug, Clone)]
pub struct TimeSlice {
    pub index: usize,
    pub t_start: f64,
    pub t_end: f64,
    /// Latest estimate of the state at `t_start`.
    pub start: Snapshot,
    /// Coarse propagation of `start`; not needed on the last slice.
    pub coarse_end: Option<Snapshot>,
    /// Fine propagation of the previous estimate of `start`.
    pub fine_end: Option<Snapshot>,
}

#[derive(Debug, Clone, Default)]
pub struct PararealIterationState {
    pub iteration: usize,
    /// Change in this slice's start state during the latest correction.
    pub residual: f64,
    /// Largest residual over all slices, per iteration.
    pub history: Vec<f64>,
    pub converged: bool,
}

/// Field quantities at the end of a slice in the accepted trajectory.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceSummary {
    pub index: usize,
    pub t_end: f64,
    pub energy: f64,
    pub max_amplitude: f64,
    pub residual: f64,
}

/// Outcome of a parareal run, identical on every rank of the world.
#[derive(Debug, Clone)]
pub struct PararealReport {
    pub iterations: usize,
    pub converged: bool,
    /// Largest slice residual after each iteration.
    pub residuals: Vec<f64>,
    /// Fine end state of the last slice.
    pub solution: Snapshot,
    pub slices: Vec<SliceSummary>,
}

pub struct Coordinator {
    setup: PropagatorSetup,
    config: PararealConfig,
    t_start: f64,
    t_end: f64,
}

impl Coordinator {
    pub fn new(setup: PropagatorSetup, config: PararealConfig, t_start: f64, t_end: f64) -> Self {
        Coordinator { setup, config, t_start, t_end }
    }

    fn slice_bounds(&self, index: usize) -> (f64, f64) {
        let width = (self.t_end - self.t_start) / self.config.slices as f64;
        (self.t_start + index as f64 * width, self.t_start + (index + 1) as f64 * width)
    }

    pub fn fine_dt(&self) -> f64 {
        (self.t_end - self.t_start) / (self.config.slices * self.config.fine_steps) as f64
    }

    pub fn coarse_dt(&self) -> f64 {
        (self.t_end - self.t_start) / (self.config.slices * self.config.coarse_steps) as f64
    }

    /// Runs the fine propagator over the whole horizon without slicing,
    /// on every rank of `comm`.
    ///
    /// Must be called on all processes.
    pub fn run_serial<C: Communicator>(&self, comm: &C, initial: &Snapshot) -> Result<Snapshot, PicError> {
        let mut fine = self.setup.build(comm)?;
        let steps = self.config.slices * self.config.fine_steps;
        let (end, _) = fine.propagate(initial, steps, self.fine_dt())?;
        Ok(end)
    }

    /// Must be called on all processes of `world`, whose size must be a
    /// multiple of the number of slices.
    pub fn run<W: Communicator>(&self, world: &W, initial: &Snapshot) -> Result<PararealReport, PicError> {
        let k = self.config.slices;
        if k == 0 || world.size() % k != 0 {
            return Err(PicError::config(format!(
                "{} ranks cannot be divided among {} time slices",
                world.size(), k
            )));
        }
        let ranks_per_slice = world.size() / k;
        let i = world.rank() / ranks_per_slice;
        let is_root = world.rank() == 0;

        let group = world.split(i)?;
        let handoff = world.split(group.rank())?;

        let mut fine = self.setup.build(&group)?;
        let mut coarse = self.setup.build(&group)?;
        let (fine_dt, coarse_dt) = (self.fine_dt(), self.coarse_dt());
        let domain = self.setup.domain;
        let last = i + 1 == k;

        if is_root {
            info!(
                "parareal over {} slices of {} ranks, {} fine and {} coarse steps per slice",
                k, ranks_per_slice, self.config.fine_steps, self.config.coarse_steps
            );
        }

        // Initial coarse sweep, strictly in slice order
        let (t_start, t_end) = self.slice_bounds(i);
        let start = if i == 0 {
            initial.clone()
        } else {
            handoff.recv_value(i - 1)?
        };
        let coarse_end = coarse.propagate(&start, self.config.coarse_steps, coarse_dt)?.0;
        if !last {
            handoff.send_value(i + 1, &coarse_end)?;
        }
        let mut slice = TimeSlice {
            index: i,
            t_start,
            t_end,
            start,
            coarse_end: Some(coarse_end),
            fine_end: None,
        };

        let mut state = PararealIterationState::default();
        let mut fine_stats = None;

        while state.iteration < self.config.max_iterations {
            state.iteration += 1;

            // Fine sweep, concurrent over slices
            let (f, stats) = fine.propagate(&slice.start, self.config.fine_steps, fine_dt)?;
            fine_stats = Some(stats);

            // Correction, pipelined in slice order
            let new_start = if i == 0 {
                slice.start.clone()
            } else {
                handoff.recv_value(i - 1)?
            };
            if !last {
                let g_new = coarse.propagate(&new_start, self.config.coarse_steps, coarse_dt)?.0;
                let g_old = slice.coarse_end.as_ref().ok_or_else(|| {
                    PicError::Comm(format!("slice {} has no coarse prediction", i))
                })?;
                let next = Snapshot::corrected(&domain, &g_new, &f, g_old);
                handoff.send_value(i + 1, &next)?;
                slice.coarse_end = Some(g_new);
            }

            state.residual = new_start.relative_distance(&slice.start, &domain);
            slice.start = new_start;
            slice.fine_end = Some(f);

            let max_residual = world.max(state.residual)?;
            state.history.push(max_residual);
            if is_root {
                info!("parareal iteration {}: max residual {:.3e}", state.iteration, max_residual);
            }
            if max_residual < self.config.tolerance {
                state.converged = true;
                break;
            }
        }

        if is_root && !state.converged {
            warn!(
                "parareal did not converge in {} iterations, residual {:.3e} (tolerance {:.1e})",
                state.iteration,
                state.history.last().cloned().unwrap_or(f64::NAN),
                self.config.tolerance
            );
        }

        // Summaries from each group root, in slice order
        let summary = match (group.rank() == 0, fine_stats) {
            (true, Some(stats)) => Some(SliceSummary {
                index: i,
                t_end: slice.t_end,
                energy: stats.energy,
                max_amplitude: stats.max_amplitude,
                residual: state.residual,
            }),
            _ => None,
        };
        let slices: Vec<SliceSummary> = world.all_gather_value(&summary)?
            .into_iter()
            .flatten()
            .collect();

        // The accepted end state lives on the last group; hand it to the first
        let fine_end = slice.fine_end.unwrap_or_else(|| slice.start.clone());
        if k > 1 && last {
            handoff.send_value(0, &fine_end)?;
        }
        let solution = if i == 0 {
            let solution = if k > 1 { handoff.recv_value(k - 1)? } else { fine_end };
            handoff.broadcast_value(Some(&solution))?
        } else {
            handoff.broadcast_value::<Snapshot>(None)?
        };

        Ok(PararealReport {
            iterations: state.iteration,
            converged: state.converged,
            residuals: state.history,
            solution,
            slices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use crate::grid::{AxisTag, GlobalDomain, LoadBalancer, Partition};
    use crate::particle::LandauSampler;
    use crate::propagator::StepParams;
    use std::f64::consts::PI;

    fn setup(threshold: f64) -> PropagatorSetup {
        PropagatorSetup {
            domain: GlobalDomain::new([8, 8, 8], [4.0 * PI; 3]),
            tags: [AxisTag::Decomposed; 3],
            solver: "fft".to_owned(),
            balancer: LoadBalancer::new(threshold, 1),
            params: StepParams { dt: 0.0, q_over_m: -1.0, neutralize: true },
        }
    }

    fn initial(setup: &PropagatorSetup) -> Snapshot {
        let single = Partition::uniform(&setup.domain, setup.tags, 1).unwrap();
        let sampler = LandauSampler::new(0.05, 0.5, 42);
        Snapshot::new(0.0, sampler.sample(&setup.domain, &single, 0, 512))
    }

    fn config() -> PararealConfig {
        PararealConfig {
            slices: 2,
            tolerance: 1e-6,
            max_iterations: 20,
            coarse_steps: 1,
            fine_steps: 4,
        }
    }

    #[test]
    fn converges_to_the_serial_fine_solution() {
        let setup = setup(1.0);
        let start = initial(&setup);
        let coordinator = Coordinator::new(setup.clone(), config(), 0.0, 1.6);

        let reference = ThreadComm::run(1, |comm| coordinator.run_serial(&comm, &start).unwrap());
        let reports = ThreadComm::run(2, |world| coordinator.run(&world, &start).unwrap());

        for report in &reports {
            assert!(report.converged);
            assert!(report.iterations <= 20);
            assert_eq!(report.slices.len(), 2);
            assert!(report.solution.relative_distance(&reference[0], &setup.domain) < 1e-6);
        }
        assert_eq!(reports[0].residuals, reports[1].residuals);
    }

    #[test]
    fn slices_may_span_several_ranks() {
        let setup = setup(1.05);
        let start = initial(&setup);
        let coordinator = Coordinator::new(setup.clone(), config(), 0.0, 0.8);

        let reference = ThreadComm::run(2, |comm| coordinator.run_serial(&comm, &start).unwrap());
        let reports = ThreadComm::run(4, |world| coordinator.run(&world, &start).unwrap());

        for report in &reports {
            assert!(report.converged);
            assert!(report.solution.relative_distance(&reference[0], &setup.domain) < 1e-6);
        }
    }

    #[test]
    fn exhausted_budget_still_returns_a_trajectory() {
        let setup = setup(1.0);
        let start = initial(&setup);
        let mut config = config();
        config.slices = 3;
        config.max_iterations = 1;
        let coordinator = Coordinator::new(setup, config, 0.0, 1.2);

        let reports = ThreadComm::run(3, |world| coordinator.run(&world, &start).unwrap());
        for report in &reports {
            assert!(!report.converged);
            assert_eq!(report.iterations, 1);
            assert_eq!(report.solution.particles.len(), 512);
        }
    }

    #[test]
    fn uneven_rank_counts_are_rejected() {
        let setup = setup(1.0);
        let start = initial(&setup);
        let coordinator = Coordinator::new(setup, config(), 0.0, 1.0);
        let got = ThreadComm::run(3, |world| coordinator.run(&world, &start).is_err());
        assert!(got.iter().all(|&e| e));
    }
}
