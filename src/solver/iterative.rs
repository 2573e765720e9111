use log::{debug, warn};
use ndarray::{Array3, Zip};

use super::{store_owned, FieldSolver, LocalDensity};
use crate::comm::Communicator;
use crate::error::PicError;
use crate::grid::{GhostedField, GlobalDomain};

/// Conjugate-gradient solution of the seven-point periodic Poisson
/// problem, `-L phi = rho - <rho>`, followed by `E = -grad phi` by central
/// differences.
#[derive(Debug)]
pub struct CgSolver {
    rho: LocalDensity,
    tolerance: f64,
    max_iterations: usize,
}

fn neighbour(i: usize, n: usize, forward: bool) -> usize {
    if forward {
        if i + 1 == n { 0 } else { i + 1 }
    } else if i == 0 {
        n - 1
    } else {
        i - 1
    }
}

/// `-L phi` on the periodic grid with spacings `h`.
fn neg_laplacian(phi: &Array3<f64>, h: &[f64; 3]) -> Array3<f64> {
    let (nx, ny, nz) = phi.dim();
    let inv = [1.0 / (h[0] * h[0]), 1.0 / (h[1] * h[1]), 1.0 / (h[2] * h[2])];
    Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
        let centre = phi[[i, j, k]];
        let dx = 2.0 * centre - phi[[neighbour(i, nx, true), j, k]] - phi[[neighbour(i, nx, false), j, k]];
        let dy = 2.0 * centre - phi[[i, neighbour(j, ny, true), k]] - phi[[i, neighbour(j, ny, false), k]];
        let dz = 2.0 * centre - phi[[i, j, neighbour(k, nz, true)]] - phi[[i, j, neighbour(k, nz, false)]];
        dx * inv[0] + dy * inv[1] + dz * inv[2]
    })
}

fn dot(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, x, y| acc + x * y)
}

impl CgSolver {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        CgSolver {
            rho: LocalDensity::empty(),
            tolerance,
            max_iterations,
        }
    }

    fn potential(&self, rho: &Array3<f64>, h: &[f64; 3]) -> Array3<f64> {
        let mean = rho.mean().unwrap_or(0.0);
        let b = rho.mapv(|v| v - mean);
        let mut phi = Array3::<f64>::zeros(rho.dim());

        let b_norm = dot(&b, &b).sqrt();
        if b_norm == 0.0 {
            return phi;
        }

        let mut r = b.clone();
        let mut p = r.clone();
        let mut rr = dot(&r, &r);
        for iteration in 0..self.max_iterations {
            let ap = neg_laplacian(&p, h);
            let alpha = rr / dot(&p, &ap);
            phi.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &ap);
            let rr_new = dot(&r, &r);
            if rr_new.sqrt() <= self.tolerance * b_norm {
                debug!("cg converged in {} iterations", iteration + 1);
                return phi;
            }
            let beta = rr_new / rr;
            p = &r + &(beta * &p);
            rr = rr_new;
        }
        warn!(
            "cg stopped after {} iterations with relative residual {:.3e}",
            self.max_iterations,
            rr.sqrt() / b_norm
        );
        phi
    }
}

impl FieldSolver for CgSolver {
    fn name(&self) -> &'static str {
        "cg"
    }

    fn set_charge_density(&mut self, rho: &GhostedField) {
        self.rho = LocalDensity::copy_from(rho);
    }

    fn solve(&mut self, comm: &impl Communicator, domain: &GlobalDomain, e: &mut GhostedField) -> Result<(), PicError> {
        let rho = self.rho.assemble(comm, domain)?;
        let phi = self.potential(&rho, &domain.h);

        let (nx, ny, nz) = phi.dim();
        let h = domain.h;
        let field = [
            Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
                -(phi[[neighbour(i, nx, true), j, k]] - phi[[neighbour(i, nx, false), j, k]]) / (2.0 * h[0])
            }),
            Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
                -(phi[[i, neighbour(j, ny, true), k]] - phi[[i, neighbour(j, ny, false), k]]) / (2.0 * h[1])
            }),
            Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
                -(phi[[i, j, neighbour(k, nz, true)]] - phi[[i, j, neighbour(k, nz, false)]]) / (2.0 * h[2])
            }),
        ];

        store_owned(&field, e);
        Ok(())
    }
}
