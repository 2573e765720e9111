use ::mpi::environment::Universe;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::*;

use super::Communicator;
use crate::error::PicError;

/// One rank per MPI process. Sends are buffered, so the MPI buffer must be
/// large enough to hold every message in flight between two receives.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(universe: &mut Universe, buffer_size: usize) -> Self {
        universe.set_buffer_size(buffer_size);
        MpiComm { world: universe.world() }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn send(&self, dest: usize, message: Vec<u8>) -> Result<(), PicError> {
        self.world.process_at_rank(dest as i32).buffered_send(&message[..]);
        Ok(())
    }

    fn recv(&self, source: usize) -> Result<Vec<u8>, PicError> {
        let (message, _) = self.world.process_at_rank(source as i32).receive_vec::<u8>();
        Ok(message)
    }

    fn barrier(&self) -> Result<(), PicError> {
        self.world.barrier();
        Ok(())
    }
}
