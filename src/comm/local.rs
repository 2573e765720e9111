use crossbeam_channel::{unbounded, Receiver, Sender};

use super::Communicator;
use crate::error::PicError;

/// Ranks living as threads of the current process, connected by one
/// unbounded FIFO channel per ordered pair of ranks. Sends never block.
/// When a rank drops its communicator (for example on an early error
/// return), peers waiting on it receive a `PicError::Comm` instead of
/// hanging.
///
pub struct ThreadComm {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Receiver<Vec<u8>>>,
}

impl ThreadComm {
    /// Creates the communicators for a world of `size` ranks; element `r`
    /// belongs to rank `r` and should be moved onto that rank's thread.
    ///
    pub fn world(size: usize) -> Vec<ThreadComm> {
        let channels: Vec<Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)>> = (0..size)
            .map(|_| (0..size).map(|_| unbounded()).collect())
            .collect();

        (0..size)
            .map(|rank| ThreadComm {
                rank,
                senders: (0..size).map(|dest| channels[rank][dest].0.clone()).collect(),
                receivers: (0..size).map(|source| channels[source][rank].1.clone()).collect(),
            })
            .collect()
    }

    /// Runs `f` once per rank, each on its own scoped thread, and returns
    /// the results in rank order. A panic on any rank is propagated.
    ///
    pub fn run<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Sync,
        T: Send,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Self::world(size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: usize, message: Vec<u8>) -> Result<(), PicError> {
        self.senders[dest]
            .send(message)
            .map_err(|_| PicError::Comm(format!("rank {} has hung up on rank {}", dest, self.rank)))
    }

    fn recv(&self, source: usize) -> Result<Vec<u8>, PicError> {
        self.receivers[source]
            .recv()
            .map_err(|_| PicError::Comm(format!("rank {} has hung up on rank {}", source, self.rank)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_between_a_pair_arrive_in_order() {
        let got = ThreadComm::run(2, |comm| {
            if comm.rank() == 0 {
                for i in 0..10u8 {
                    comm.send(1, vec![i]).unwrap();
                }
                Vec::new()
            } else {
                (0..10).map(|_| comm.recv(0).unwrap()[0]).collect()
            }
        });
        assert_eq!(got[1], (0..10u8).collect::<Vec<_>>());
    }

    #[test]
    fn departed_peer_is_reported() {
        let got = ThreadComm::run(2, |comm| {
            if comm.rank() == 0 {
                drop(comm);
                true
            } else {
                comm.recv(0).is_err()
            }
        });
        assert!(got[1]);
    }
}
