//! This module exports a minimal message-passing API, encapsulated by the
//! `Communicator` trait. Implementors only need to write `send` and `recv`
//! for a given transport (in-process channels, or MPI with the `mpi`
//! feature). The trait then provides default implementations of the
//! collectives the solver needs: barrier, broadcast, reduce, all-reduce,
//! all-gather and communicator splitting.
//!
//! Every component receives its communicator explicitly, so several
//! independent rank groups (one per time slice) can coexist in one process.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::PicError;

mod local;
#[cfg(feature = "mpi")]
mod mpi_comm;
pub mod util;

pub use self::local::ThreadComm;
#[cfg(feature = "mpi")]
pub use self::mpi_comm::MpiComm;

/// Interface for a group of ranks that can exchange messages. All
/// collective methods must be called by every rank of the communicator in
/// the same order.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of ranks in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return without waiting for the matching receive to be posted.
    fn send(&self, dest: usize, message: Vec<u8>) -> Result<(), PicError>;

    /// Must be implemented to receive the next message from the given peer.
    /// Messages between a pair of ranks arrive in the order they were sent.
    fn recv(&self, source: usize) -> Result<Vec<u8>, PicError>;

    /// Blocks until every rank has arrived.
    fn barrier(&self) -> Result<(), PicError> {
        self.all_reduce(|a, _| Ok(a), Vec::new()).map(|_| ())
    }

    /// Binomial tree broadcast from rank 0. The message buffer must be
    /// `Some` on rank 0 and is ignored elsewhere.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Result<Vec<u8>, PicError> {
        let r = self.rank();
        let p = self.size();

        let value = if r == 0 {
            value.ok_or_else(|| PicError::Comm("broadcast root has no message".to_owned()))?
        } else {
            self.recv(r - (1 << r.trailing_zeros()))?
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, value.clone())?
            }
        }
        Ok(value)
    }

    /// Binomial tree reduce onto rank 0. All ranks return `None` except the
    /// root. The operator is applied as `f(lower ranks, higher ranks)`, so
    /// it need not be commutative.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Result<Option<Vec<u8>>, PicError>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>, PicError>,
    {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(r + one)?)?
                }
            } else {
                self.send(r - one, value)?;
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// Reduce followed by broadcast; every rank gets the same bytes.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Result<Vec<u8>, PicError>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>, PicError>,
    {
        let reduced = self.reduce(f, value)?;
        self.broadcast(reduced)
    }

    /// Collects every rank's message on rank 0, in rank order.
    ///
    fn gather(&self, value: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, PicError> {
        if self.rank() == 0 {
            let mut all = Vec::with_capacity(self.size());
            all.push(value);
            for source in 1..self.size() {
                all.push(self.recv(source)?);
            }
            Ok(Some(all))
        } else {
            self.send(0, value)?;
            Ok(None)
        }
    }

    /// Every rank gets every rank's message, in rank order.
    ///
    fn all_gather(&self, value: Vec<u8>) -> Result<Vec<Vec<u8>>, PicError> {
        let packed = match self.gather(value)? {
            Some(all) => Some(rmp_serde::to_vec(&all)?),
            None => None,
        };
        let bytes = self.broadcast(packed)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    /// Element-wise global sum, in place. The summation order depends only
    /// on the communicator size, so all ranks see bit-identical results.
    ///
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), PicError> {
        let bytes = self.all_reduce(
            |a, b| util::zip_f64_bytes(&a, &b, |x, y| x + y),
            util::f64s_to_bytes(values),
        )?;
        values.copy_from_slice(&util::bytes_to_f64s(&bytes)?);
        Ok(())
    }

    /// Element-wise global maximum, in place.
    ///
    fn all_reduce_max(&self, values: &mut [f64]) -> Result<(), PicError> {
        let bytes = self.all_reduce(
            |a, b| util::zip_f64_bytes(&a, &b, f64::max),
            util::f64s_to_bytes(values),
        )?;
        values.copy_from_slice(&util::bytes_to_f64s(&bytes)?);
        Ok(())
    }

    fn sum(&self, value: f64) -> Result<f64, PicError> {
        let mut v = [value];
        self.all_reduce_sum(&mut v)?;
        Ok(v[0])
    }

    fn max(&self, value: f64) -> Result<f64, PicError> {
        let mut v = [value];
        self.all_reduce_max(&mut v)?;
        Ok(v[0])
    }

    fn send_value<T: Serialize>(&self, dest: usize, value: &T) -> Result<(), PicError> {
        self.send(dest, rmp_serde::to_vec(value)?)
    }

    fn recv_value<T: DeserializeOwned>(&self, source: usize) -> Result<T, PicError> {
        Ok(rmp_serde::from_slice(&self.recv(source)?)?)
    }

    /// Typed broadcast from rank 0; `value` must be `Some` on rank 0.
    fn broadcast_value<T>(&self, value: Option<&T>) -> Result<T, PicError>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = match value {
            Some(v) if self.rank() == 0 => Some(rmp_serde::to_vec(v)?),
            _ => None,
        };
        Ok(rmp_serde::from_slice(&self.broadcast(bytes)?)?)
    }

    fn all_gather_value<T>(&self, value: &T) -> Result<Vec<T>, PicError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.all_gather(rmp_serde::to_vec(value)?)?
            .iter()
            .map(|bytes| rmp_serde::from_slice(bytes).map_err(PicError::from))
            .collect()
    }

    /// Partitions the ranks by `color`. Collective; each rank gets a view of
    /// the ranks sharing its color, ordered by their rank here.
    ///
    fn split(&self, color: usize) -> Result<SubComm<'_, Self>, PicError>
    where
        Self: Sized,
    {
        let colors: Vec<usize> = self.all_gather_value(&color)?;
        let members: Vec<usize> = colors
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == color)
            .map(|(r, _)| r)
            .collect();
        let rank = members
            .iter()
            .position(|&r| r == self.rank())
            .ok_or_else(|| PicError::Comm("rank missing from its own split".to_owned()))?;
        Ok(SubComm {
            parent: self,
            members,
            rank,
        })
    }
}

/// A subset of a parent communicator's ranks, renumbered from zero.
/// Messages travel over the parent's transport.
pub struct SubComm<'a, C: Communicator> {
    parent: &'a C,
    members: Vec<usize>,
    rank: usize,
}

impl<'a, C: Communicator> Communicator for SubComm<'a, C> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, message: Vec<u8>) -> Result<(), PicError> {
        self.parent.send(self.members[dest], message)
    }

    fn recv(&self, source: usize) -> Result<Vec<u8>, PicError> {
        self.parent.recv(self.members[source])
    }
}
