//! Scalar time series of field quantities

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::comm::Communicator;
use crate::error::PicError;
use crate::grid::{GhostedField, GlobalDomain};

/// Field energy and peak amplitude, the quantities used to follow the
/// decay of a Landau-damped wave.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FieldStats {
    /// `sum |E_x|^2 dV` over the domain.
    pub energy: f64,
    /// `max |E_x|` over the domain.
    pub max_amplitude: f64,
}

impl FieldStats {
    /// Must be called on all processes.
    pub fn measure(comm: &impl Communicator, domain: &GlobalDomain, e: &GhostedField) -> Result<Self, PicError> {
        let local: f64 = e.interior()
            .index_axis(ndarray::Axis(3), 0)
            .iter()
            .map(|v| v * v)
            .sum();
        let energy = comm.sum(local)? * domain.cell_volume();
        let max_amplitude = e.max_abs(comm, 0)?;
        Ok(FieldStats { energy, max_amplitude })
    }
}

/// A whitespace-delimited text file with one row per recorded step.
/// Only rank 0 of the communicator it was created on holds the file;
/// writes on other ranks are ignored.
pub struct TimeSeries {
    file: Option<BufWriter<File>>,
}

impl TimeSeries {
    /// Must be called on all processes.
    pub fn create(comm: &impl Communicator, path: &Path) -> Result<Self, PicError> {
        let file = if comm.rank() == 0 {
            let mut file = BufWriter::new(File::create(path)?);
            writeln!(file, "# time field_energy max_ex")?;
            Some(file)
        } else {
            None
        };
        Ok(TimeSeries { file })
    }

    /// A series that records nothing.
    pub fn discard() -> Self {
        TimeSeries { file: None }
    }

    pub fn push(&mut self, time: f64, stats: &FieldStats) -> Result<(), PicError> {
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{:.6e} {:.12e} {:.12e}", time, stats.energy, stats.max_amplitude)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PicError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadComm;
    use crate::grid::{AxisTag, Partition};

    #[test]
    fn stats_reduce_over_ranks() {
        let got = ThreadComm::run(2, |comm| {
            let domain = GlobalDomain::new([4, 4, 4], [2.0, 2.0, 2.0]);
            let partition = Partition::uniform(&domain, [AxisTag::Decomposed; 3], 2).unwrap();
            let mut e = GhostedField::new(partition.local_box(comm.rank()), 3);
            e.interior_mut().fill(0.5);
            *e.get_mut(partition.local_box(comm.rank()).lo, 0) = -3.0 * (comm.rank() + 1) as f64;
            FieldStats::measure(&comm, &domain, &e).unwrap()
        });
        // 62 cells at 0.25, plus 9 and 36, times a cell volume of 1/8
        let expected = (62.0 * 0.25 + 9.0 + 36.0) / 8.0;
        for stats in got {
            assert!((stats.energy - expected).abs() < 1e-12);
            assert_eq!(stats.max_amplitude, 6.0);
        }
    }

    #[test]
    fn only_rank_zero_writes() {
        let dir = std::env::temp_dir().join(format!("parapic-series-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("series.dat");
        ThreadComm::run(2, |comm| {
            let mut series = TimeSeries::create(&comm, &path).unwrap();
            let stats = FieldStats { energy: 1.5, max_amplitude: 0.25 };
            series.push(0.5, &stats).unwrap();
            series.flush().unwrap();
        });
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('#'));
        let cols: Vec<f64> = lines[1].split_whitespace().map(|s| s.parse().unwrap()).collect();
        assert_eq!(cols, vec![0.5, 1.5, 0.25]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
