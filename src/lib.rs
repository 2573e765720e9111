//! Particle-in-cell simulation of electrostatic plasmas on a distributed,
//! dynamically load-balanced grid, with optional parallelism in time.

pub mod comm;
pub mod diagnostics;
pub mod error;
pub mod grid;
pub mod parareal;
pub mod particle;
pub mod propagator;
pub mod setup;
pub mod solver;

pub use error::PicError;
