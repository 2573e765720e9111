//! Electrostatic field solvers for the periodic domain
//!
//! The propagator only relies on the `FieldSolver` contract: hand over
//! the charge density, get back the electric field. Both backends
//! assemble the global density on every rank of the group and solve
//! redundantly, which is adequate for the grid sizes a single time slice
//! works with.

use ndarray::Array3;

use crate::comm::Communicator;
use crate::error::PicError;
use crate::grid::{GhostedField, GlobalDomain, IndexBox};

mod iterative;
mod spectral;

pub use self::iterative::*;
pub use self::spectral::*;

pub trait FieldSolver {
    /// Short tag identifying the backend.
    fn name(&self) -> &'static str;

    /// Takes a copy of the owned part of the charge density.
    fn set_charge_density(&mut self, rho: &GhostedField);

    /// Writes the electric field into the owned cells of `e`, which must
    /// have three components. Ghosts are left untouched.
    ///
    /// Must be called on all processes.
    fn solve(&mut self, comm: &impl Communicator, domain: &GlobalDomain, e: &mut GhostedField) -> Result<(), PicError>;
}

/// The available backends, selected by tag.
#[derive(Debug)]
pub enum Solver {
    Spectral(SpectralSolver),
    Iterative(CgSolver),
}

impl Solver {
    /// - `fft`: spectral Poisson solver
    /// - `cg`: conjugate gradient on the finite-difference Laplacian
    pub fn from_tag(tag: &str) -> Result<Self, PicError> {
        match tag {
            "fft" => Ok(Solver::Spectral(SpectralSolver::new())),
            "cg" => Ok(Solver::Iterative(CgSolver::new(1.0e-12, 10_000))),
            "open" => Err(PicError::config(
                "the open-boundary solver is incompatible with the periodic domain",
            )),
            "p3m" => Err(PicError::config(
                "the P3M solver (particle-particle corrections) is not available",
            )),
            _ => Err(PicError::config(format!(
                "unknown field solver '{}', expected one of: fft, cg",
                tag
            ))),
        }
    }
}

impl FieldSolver for Solver {
    fn name(&self) -> &'static str {
        match self {
            Solver::Spectral(s) => s.name(),
            Solver::Iterative(s) => s.name(),
        }
    }

    fn set_charge_density(&mut self, rho: &GhostedField) {
        match self {
            Solver::Spectral(s) => s.set_charge_density(rho),
            Solver::Iterative(s) => s.set_charge_density(rho),
        }
    }

    fn solve(&mut self, comm: &impl Communicator, domain: &GlobalDomain, e: &mut GhostedField) -> Result<(), PicError> {
        match self {
            Solver::Spectral(s) => s.solve(comm, domain, e),
            Solver::Iterative(s) => s.solve(comm, domain, e),
        }
    }
}

/// Owned density values of one rank, as handed to a solver.
#[derive(Debug, Clone)]
pub(crate) struct LocalDensity {
    region: IndexBox,
    values: Vec<f64>,
}

impl LocalDensity {
    pub(crate) fn empty() -> Self {
        LocalDensity {
            region: IndexBox::new([0; 3], [0; 3]),
            values: Vec::new(),
        }
    }

    pub(crate) fn copy_from(rho: &GhostedField) -> Self {
        let region = rho.owned();
        let values = region.iter().map(|idx| rho.get(idx, 0)).collect();
        LocalDensity { region, values }
    }

    /// The density over the whole domain, identical on every rank.
    pub(crate) fn assemble(&self, comm: &impl Communicator, domain: &GlobalDomain) -> Result<Array3<f64>, PicError> {
        let global_box = domain.index_box();
        let mut global = vec![0.0; domain.cells()];
        for (idx, v) in self.region.iter().zip(self.values.iter()) {
            global[global_box.row_major_offset(idx)] = *v;
        }
        comm.all_reduce_sum(&mut global)?;
        Array3::from_shape_vec((domain.n[0], domain.n[1], domain.n[2]), global)
            .map_err(|e| PicError::Comm(format!("density has the wrong shape: {}", e)))
    }
}

/// Copies the owned part of a global field into `e`.
pub(crate) fn store_owned(global: &[Array3<f64>; 3], e: &mut GhostedField) {
    for idx in e.owned().iter() {
        let g = [idx[0] as usize, idx[1] as usize, idx[2] as usize];
        for c in 0..3 {
            *e.get_mut(idx, c) = global[c][g];
        }
    }
}
