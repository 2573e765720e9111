use std::f64::consts::PI;

use ndarray::{Array3, Axis};
use num::complex::Complex64;
use rustfft::FftPlanner;

use super::{store_owned, FieldSolver, LocalDensity};
use crate::comm::Communicator;
use crate::error::PicError;
use crate::grid::{GhostedField, GlobalDomain};

/// Solves Poisson's equation by Fourier transform,
/// `E(k) = -i k rho(k) / |k|^2`, with the mean of the density removed.
#[derive(Debug)]
pub struct SpectralSolver {
    rho: LocalDensity,
}

/// Signed wavenumber of mode `m` on an axis of `n` points and length `len`.
/// The Nyquist mode has no well-defined sign and yields `None`.
fn wavenumber(m: usize, n: usize, len: f64) -> Option<f64> {
    if 2 * m == n {
        None
    } else if 2 * m < n {
        Some(2.0 * PI * m as f64 / len)
    } else {
        Some(2.0 * PI * (m as f64 - n as f64) / len)
    }
}

fn wavenumber_sqr(m: usize, n: usize, len: f64) -> f64 {
    let m = m.min(n - m) as f64;
    (2.0 * PI * m / len).powi(2)
}

fn fft_3d(planner: &mut FftPlanner<f64>, data: &mut Array3<Complex64>, inverse: bool) {
    for axis in 0..3 {
        let n = data.len_of(Axis(axis));
        let fft = if inverse {
            planner.plan_fft_inverse(n)
        } else {
            planner.plan_fft_forward(n)
        };
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        for mut lane in data.lanes_mut(Axis(axis)) {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            fft.process(&mut buffer);
            for (v, b) in lane.iter_mut().zip(buffer.iter()) {
                *v = *b;
            }
        }
    }
}

impl SpectralSolver {
    pub fn new() -> Self {
        SpectralSolver { rho: LocalDensity::empty() }
    }
}

impl Default for SpectralSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldSolver for SpectralSolver {
    fn name(&self) -> &'static str {
        "fft"
    }

    fn set_charge_density(&mut self, rho: &GhostedField) {
        self.rho = LocalDensity::copy_from(rho);
    }

    fn solve(&mut self, comm: &impl Communicator, domain: &GlobalDomain, e: &mut GhostedField) -> Result<(), PicError> {
        let rho = self.rho.assemble(comm, domain)?;
        let mut planner = FftPlanner::new();

        let mut rho_k = rho.mapv(|v| Complex64::new(v, 0.0));
        fft_3d(&mut planner, &mut rho_k, false);

        let norm = 1.0 / domain.cells() as f64;
        let mut field = [
            Array3::<f64>::zeros(rho.dim()),
            Array3::<f64>::zeros(rho.dim()),
            Array3::<f64>::zeros(rho.dim()),
        ];

        for c in 0..3 {
            let mut e_k = Array3::<Complex64>::zeros(rho.dim());
            for ((i, j, l), v) in e_k.indexed_iter_mut() {
                let m = [i, j, l];
                let k2: f64 = (0..3)
                    .map(|a| wavenumber_sqr(m[a], domain.n[a], domain.extent(a)))
                    .sum();
                *v = match wavenumber(m[c], domain.n[c], domain.extent(c)) {
                    Some(kc) if k2 > 0.0 => {
                        Complex64::new(0.0, -kc / k2) * rho_k[[i, j, l]] * norm
                    },
                    _ => Complex64::new(0.0, 0.0),
                };
            }
            fft_3d(&mut planner, &mut e_k, true);
            field[c] = e_k.mapv(|v| v.re);
        }

        store_owned(&field, e);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavenumbers_are_signed() {
        let k = |m, n| wavenumber(m, n, 2.0 * PI).map(|k| k.round() as i64);
        assert_eq!(k(0, 8), Some(0));
        assert_eq!(k(3, 8), Some(3));
        assert_eq!(k(4, 8), None);
        assert_eq!(k(5, 8), Some(-3));
        assert_eq!(k(2, 5), Some(2));
        assert_eq!(k(3, 5), Some(-2));
        assert!((wavenumber_sqr(5, 8, 2.0 * PI) - 9.0).abs() < 1e-12);
        assert!((wavenumber_sqr(4, 8, 2.0 * PI) - 16.0).abs() < 1e-12);
    }
}
