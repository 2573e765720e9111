//! Errors that abort a run.

use thiserror::Error;

use crate::setup::InputError;

/// Things that can go wrong while setting up or advancing a simulation.
///
/// Partition degeneracies are not represented here: the load balancer
/// resolves them internally. Failure of the time-parallel loop to converge
/// is not an error either, see [`crate::parareal::PararealReport`].
#[derive(Debug, Error)]
pub enum PicError {
    /// Unsupported or inconsistent configuration, detected before any
    /// compute begins.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input file could not be read or parsed.
    #[error(transparent)]
    Input(#[from] InputError),

    /// A message could not be encoded, decoded or delivered. Collective
    /// failures cannot be recovered from, because every rank would have to
    /// agree on a new partition.
    #[error("communication failure: {0}")]
    Comm(String),

    /// Field or particle data became NaN or infinite.
    #[error("non-finite values after {stage} at step {step}")]
    NonFinite { stage: &'static str, step: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PicError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PicError::Config(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for PicError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PicError::Comm(format!("unable to encode message: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for PicError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PicError::Comm(format!("unable to decode message: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_names_stage_and_step() {
        let err = PicError::NonFinite { stage: "field solve", step: 12 };
        assert_eq!(err.to_string(), "non-finite values after field solve at step 12");
    }

    #[test]
    fn config_errors_are_prefixed() {
        let err = PicError::config("open-boundary solver on a periodic domain");
        assert!(err.to_string().starts_with("configuration error"));
    }
}
