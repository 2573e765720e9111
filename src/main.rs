use std::error::Error;
use std::path::{Path, PathBuf};

use log::{error, info};
use simple_logger::SimpleLogger;

use parapic::comm::Communicator;
use parapic::diagnostics::{FieldStats, TimeSeries};
use parapic::grid::Partition;
use parapic::parareal::Coordinator;
use parapic::propagator::{Snapshot, Stepper};
use parapic::setup::{ettc, Configuration, InputError, Mode, Parameters, PrettyDuration};
use parapic::PicError;

fn run_serial<W: Communicator>(world: &W, params: &Parameters, output_dir: &Path) -> Result<(), PicError> {
    let domain = params.domain();
    let mut sim = params.setup().build(world)?;

    let mine = params.sampler().sample(&domain, sim.partition(), world.rank(), params.particles);
    sim.load(0.0, &mine);
    sim.with_output(TimeSeries::create(world, &output_dir.join("fields.dat"))?, params.output_interval);

    sim.initialize()?;
    sim.dump()?;

    let total_steps = params.total_steps();
    let runtime = std::time::Instant::now();

    for step in 1..=total_steps {
        sim.advance()?;
        if step % params.output_interval == 0 || step == total_steps {
            let stats = sim.dump()?;
            if world.rank() == 0 {
                info!(
                    "step {: >6} at t = {: >8.3}, field energy = {:.6e}, RT = {}, ETTC = {}",
                    step, sim.time(), stats.energy,
                    PrettyDuration::from(runtime.elapsed()),
                    PrettyDuration::from(ettc(runtime, step, total_steps))
                );
            }
        }
    }
    sim.flush_output()?;

    if world.rank() == 0 {
        info!("{} steps completed, RT = {}", total_steps, PrettyDuration::from(runtime.elapsed()));
    }
    Ok(())
}

fn run_parareal<W: Communicator>(world: &W, params: &Parameters, output_dir: &Path) -> Result<(), PicError> {
    let domain = params.domain();

    // Every rank draws the full initial state; it is cheap and deterministic
    let single = Partition::uniform(&domain, params.tags, 1)?;
    let initial = Snapshot::new(0.0, params.sampler().sample(&domain, &single, 0, params.particles));

    let runtime = std::time::Instant::now();
    let coordinator = Coordinator::new(params.setup(), params.parareal(), 0.0, params.t_end);
    let report = coordinator.run(world, &initial)?;

    let mut series = TimeSeries::create(world, &output_dir.join("slices.dat"))?;
    for slice in &report.slices {
        let stats = FieldStats { energy: slice.energy, max_amplitude: slice.max_amplitude };
        series.push(slice.t_end, &stats)?;
    }
    series.flush()?;

    if world.rank() == 0 {
        info!(
            "parareal {} after {} iterations, RT = {}",
            if report.converged { "converged" } else { "stopped" },
            report.iterations,
            PrettyDuration::from(runtime.elapsed())
        );
    }
    Ok(())
}

fn run<W: Communicator>(world: &W, params: &Parameters, output_dir: &Path) -> Result<(), PicError> {
    match params.mode {
        Mode::Serial => run_serial(world, params, output_dir),
        Mode::Parareal => run_parareal(world, params, output_dir),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Prepare configuration file

    let args: Vec<String> = std::env::args().collect();
    let path = args
        .get(1)
        .ok_or(InputError::InvalidInputFile("no file supplied"))?;
    let path = PathBuf::from(path);
    let output_dir = path.parent().unwrap_or(Path::new("")).to_path_buf();

    let mut config = Configuration::from_file(&path)?;
    config.with_context("constants");
    let params = Parameters::from_config(&config)?;

    SimpleLogger::new().with_level(params.log_level).init()?;
    params.validate()?;

    #[cfg(feature = "mpi")] {
        let mut universe = mpi::initialize().ok_or(PicError::Comm("unable to initialize MPI".to_owned()))?;
        let world = parapic::comm::MpiComm::new(&mut universe, params.message_buffer_size());
        if world.rank() == 0 {
            info!("running on {} processes with {} threads each", world.size(), rayon::current_num_threads());
        }
        run(&world, &params, &output_dir)?;
    }

    #[cfg(not(feature = "mpi"))] {
        let size = params.world_size();
        info!("running on {} ranks with {} threads in total", size, rayon::current_num_threads());
        let results = parapic::comm::ThreadComm::run(size, |world| run(&world, &params, &output_dir));

        // A failing rank leaves its peers with broken channels, so report
        // the first error that is not a communication failure
        let mut errors: Vec<PicError> = results.into_iter().filter_map(|r| r.err()).collect();
        if !errors.is_empty() {
            let first = errors.iter()
                .position(|e| !matches!(e, PicError::Comm(_)))
                .unwrap_or(0);
            let err = errors.swap_remove(first);
            error!("{}", err);
            return Err(err.into());
        }
    }

    Ok(())
}
