//! Parse input configuration file

use std::fmt;
use std::error::Error;
use std::path::Path;
use yaml_rust::{YamlLoader, yaml::Yaml};
use meval::Context;
use log::LevelFilter;

use crate::error::PicError;
use crate::grid::{AxisTag, GlobalDomain, LoadBalancer, Partition, GHOST_WIDTH};
use crate::parareal::PararealConfig;
use crate::particle::LandauSampler;
use crate::propagator::{PropagatorSetup, StepParams};
use crate::solver::Solver;

pub enum InputError {
    InvalidInputFile(&'static str),
    CouldNotParse(String, String),
    MissingField(String, String),
}

impl fmt::Debug for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InputError::*;
        let help_msg = "Usage: parapic input-file";
        match self {
            InvalidInputFile(s) => write!(f, "invalid input file: {}\n{}", s, help_msg),
            CouldNotParse(token,field) => write!(f, "unable to parse '{}' = '{}' in configuration file", token, field),
            MissingField(section,field) => write!(f, "unable to find '{}' in section '{}' with correct type in configuration file", field, section),
        }
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for InputError {}

/// Represents the input configuration, can be queried
/// for desired parameters
pub struct Configuration<'a> {
    input: Yaml,
    ctx: Context<'a>,
}

impl<'a> Configuration<'a> {
    pub fn from_file(path: &Path) -> Result<Configuration<'a>, InputError> {
        let contents = std::fs::read_to_string(path).map_err(|_e| InputError::InvalidInputFile("unable to read file"))?;
        Configuration::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Configuration<'a>, InputError> {
        let input = YamlLoader::load_from_str(contents).map_err(|_e| InputError::InvalidInputFile("yaml trouble"))?;
        let input = input.first().ok_or(InputError::InvalidInputFile("yaml trouble"))?;
        Ok(Configuration {
            input: input.clone(),
            ctx: Context::new(),
        })
    }

    /// Loads user-defined constants from `section` into the context used
    /// to evaluate expressions. `pi` and `e` are always available.
    pub fn with_context(&mut self, section: &str) -> &mut Self {
        self.ctx
            .func3("step", |x, min, max| if x >= min && x < max {1.0} else {0.0});

        // Read in from 'constants' block
        let tmp = self.ctx.clone(); // a constant cannot depend on other constants yet...

        if let Some(hash) = self.input[section].as_hash() {
            for (a, b) in hash {
                match (a, b) {
                    (Yaml::String(s), Yaml::Real(v)) => {
                        if let Ok(num) = v.parse::<f64>() {self.ctx.var(s, num);}
                    },
                    (Yaml::String(s), Yaml::Integer(v)) => {
                        self.ctx.var(s, *v as f64);
                    },
                    (Yaml::String(s), Yaml::String(v)) => {
                        if let Ok(expr) = v.parse::<meval::Expr>() {
                            if let Ok(num) = expr.eval_with_context(&tmp) {self.ctx.var(s, num);}
                        }
                    },
                    _ => ()
                }
            }
        }

        self
    }

    /// Whether `field` is present in `section` at all.
    pub fn has(&self, section: &str, field: &str) -> bool {
        !self.input[section][field].is_badvalue()
    }

    pub fn real(&self, section: &str, field: &str) -> Result<f64, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::Real(s) => s.parse::<f64>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone())),
            Yaml::Integer(i) => Ok(*i as f64),
            Yaml::String(s) => {
                let expr = s.parse::<meval::Expr>().map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))?;
                expr.eval_with_context(&self.ctx).map_err(|_| InputError::CouldNotParse(name.clone(), s.clone()))
            },
            _ => Err(InputError::MissingField(section.to_owned(), name)),
        }
    }

    pub fn integer(&self, section: &str, field: &str) -> Result<i64, InputError> {
        match &self.input[section][field] {
            Yaml::Integer(i) => Ok(*i),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn bool(&self, section: &str, field: &str) -> Result<bool, InputError> {
        match &self.input[section][field] {
            Yaml::Boolean(b) => Ok(*b),
            _ => Err(InputError::MissingField(section.to_owned(), field.to_owned())),
        }
    }

    pub fn strings(&self, section: &str, field: &str) -> Result<Vec<String>, InputError> {
        let name = field.to_owned();
        match &self.input[section][field] {
            Yaml::String(s) => {
                Ok(vec![s.clone()])
            },
            Yaml::Array(array) => {
                // a is a vec of Vec<Yaml>
                let take_yaml_string = |y: &Yaml| -> Option<String> {
                    match y {
                        Yaml::String(s) => Some(s.clone()),
                        _ => None
                    }
                };
                let got: Vec<String> = array.iter().filter_map(take_yaml_string).collect();
                if got.is_empty() {
                    Err(InputError::CouldNotParse(section.to_owned(), name))
                } else {
                    Ok(got)
                }
            },
            _ => Err(InputError::MissingField(section.to_owned(), name))
        }
    }

    pub fn string(&self, section: &str, field: &str) -> Result<String, InputError> {
        let strs = self.strings(section, field)?;
        Ok(strs[0].clone())
    }

    fn real_or(&self, section: &str, field: &str, default: f64) -> Result<f64, InputError> {
        if self.has(section, field) { self.real(section, field) } else { Ok(default) }
    }

    /// A non-negative integer, such as a cell or particle count.
    pub fn count(&self, section: &str, field: &str) -> Result<usize, InputError> {
        let i = self.integer(section, field)?;
        usize::try_from(i).map_err(|_| InputError::CouldNotParse(field.to_owned(), i.to_string()))
    }

    fn count_or(&self, section: &str, field: &str, default: usize) -> Result<usize, InputError> {
        if self.has(section, field) { self.count(section, field) } else { Ok(default) }
    }

    fn bool_or(&self, section: &str, field: &str, default: bool) -> Result<bool, InputError> {
        if self.has(section, field) { self.bool(section, field) } else { Ok(default) }
    }

    fn string_or(&self, section: &str, field: &str, default: &str) -> Result<String, InputError> {
        if self.has(section, field) { self.string(section, field) } else { Ok(default.to_owned()) }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// One propagator over the whole horizon.
    Serial,
    /// Time slices run concurrently and corrected iteratively.
    Parareal,
}

/// The run parameters, read from a configuration file and checked
/// before any work begins.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub n: [usize; 3],
    pub extent: [f64; 3],
    pub tags: [AxisTag; 3],
    pub dt: f64,
    pub t_end: f64,
    pub particles: usize,
    pub solver: String,
    pub interpolation: String,
    pub load_balance_threshold: f64,
    pub balance_interval: usize,
    pub charge_to_mass: f64,
    pub neutralize: bool,
    pub output_interval: usize,
    pub mode: Mode,
    pub ranks: usize,
    pub log_level: LevelFilter,
    pub slices: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub coarse_steps: usize,
    pub alpha: f64,
    pub k: f64,
    pub seed: u64,
}

impl Parameters {
    pub fn from_config(config: &Configuration) -> Result<Self, PicError> {
        let k = config.real_or("landau", "k", 0.5)?;
        let alpha = config.real_or("landau", "alpha", 0.05)?;
        let seed = config.count_or("landau", "seed", 42)? as u64;

        let period = 2.0 * std::f64::consts::PI / k;
        let n = [
            config.count("control", "nx")?,
            config.count("control", "ny")?,
            config.count("control", "nz")?,
        ];
        let extent = [
            config.real_or("control", "lx", period)?,
            config.real_or("control", "ly", period)?,
            config.real_or("control", "lz", period)?,
        ];

        let tags = if config.has("control", "decomposition") {
            let names = config.strings("control", "decomposition")?;
            if names.len() != 3 {
                return Err(PicError::config(format!(
                    "'decomposition' needs one entry per axis, got {}", names.len()
                )));
            }
            let mut tags = [AxisTag::Decomposed; 3];
            for (tag, name) in tags.iter_mut().zip(names.iter()) {
                *tag = match name.as_str() {
                    "parallel" => AxisTag::Decomposed,
                    "serial" => AxisTag::Whole,
                    other => return Err(PicError::config(format!(
                        "unknown decomposition '{}', expected 'parallel' or 'serial'", other
                    ))),
                };
            }
            tags
        } else {
            [AxisTag::Decomposed; 3]
        };

        let mode = match config.string_or("control", "mode", "parareal")?.as_str() {
            "serial" => Mode::Serial,
            "parareal" => Mode::Parareal,
            other => return Err(PicError::config(format!(
                "unknown mode '{}', expected 'serial' or 'parareal'", other
            ))),
        };

        let log_level = config.string_or("control", "log_level", "info")?
            .parse::<LevelFilter>()
            .map_err(|_| PicError::config("log_level must be one of error, warn, info, debug, trace"))?;

        Ok(Parameters {
            n,
            extent,
            tags,
            dt: config.real("control", "dt")?,
            t_end: config.real("control", "end")?,
            particles: config.count("control", "particles")?,
            solver: config.string_or("control", "solver", "fft")?,
            interpolation: config.string_or("control", "interpolation", "cic")?,
            load_balance_threshold: config.real_or("control", "load_balance_threshold", 1.0)?,
            balance_interval: config.count_or("control", "balance_interval", 1)?,
            charge_to_mass: config.real_or("control", "charge_to_mass", -1.0)?,
            neutralize: config.bool_or("control", "neutralize", true)?,
            output_interval: config.count_or("control", "output_interval", 1)?,
            mode,
            ranks: config.count_or("control", "ranks", 1)?,
            log_level,
            slices: config.count_or("parareal", "slices", 2)?,
            tolerance: config.real_or("parareal", "tolerance", 1.0e-6)?,
            max_iterations: config.count_or("parareal", "max_iterations", 20)?,
            coarse_steps: config.count_or("parareal", "coarse_steps", 1)?,
            alpha,
            k,
            seed,
        })
    }

    /// Rejects every unsupported or inconsistent combination of options.
    pub fn validate(&self) -> Result<(), PicError> {
        if !(self.dt > 0.0) || !(self.t_end > 0.0) {
            return Err(PicError::config("dt and end must be positive"));
        }
        if self.particles == 0 {
            return Err(PicError::config("at least one particle is required"));
        }
        for i in 0..3 {
            if self.n[i] < 2 * GHOST_WIDTH {
                return Err(PicError::config(format!(
                    "axis {} has {} cells, fewer than the ghost layers need", i, self.n[i]
                )));
            }
            if !(self.extent[i] > 0.0) {
                return Err(PicError::config(format!("axis {} has non-positive length", i)));
            }
        }
        let storage = self.n.iter()
            .try_fold(3usize, |acc, &n| acc.checked_mul(n + 2 * GHOST_WIDTH))
            .filter(|&len| len <= isize::MAX as usize / std::mem::size_of::<f64>());
        if storage.is_none() {
            return Err(PicError::config(format!("a {:?} grid is too large to store", self.n)));
        }
        if self.interpolation != "cic" {
            return Err(PicError::config(format!(
                "interpolation '{}' is not supported, only 'cic' is", self.interpolation
            )));
        }
        Solver::from_tag(&self.solver)?;

        if self.ranks == 0 || self.slices == 0 || self.coarse_steps == 0 || self.max_iterations == 0 {
            return Err(PicError::config("ranks, slices, coarse_steps and max_iterations must be at least one"));
        }
        if self.balance_interval == 0 || self.output_interval == 0 {
            return Err(PicError::config("balance_interval and output_interval must be at least one"));
        }
        if !(self.tolerance > 0.0) {
            return Err(PicError::config("parareal tolerance must be positive"));
        }
        if !(self.alpha >= 0.0 && self.alpha < 1.0) || !(self.k > 0.0) {
            return Err(PicError::config("landau alpha must lie in [0, 1) and k must be positive"));
        }
        if self.fine_steps() == 0 {
            return Err(PicError::config("each time slice must be at least one timestep long"));
        }

        Partition::uniform(&self.domain(), self.tags, self.ranks)?;
        Ok(())
    }

    pub fn domain(&self) -> GlobalDomain {
        GlobalDomain::new(self.n, self.extent)
    }

    /// Fine steps per time slice; the whole run in serial mode is
    /// `slices * fine_steps()` steps.
    pub fn fine_steps(&self) -> usize {
        let slice = self.t_end / self.slices.max(1) as f64;
        (slice / self.dt).round() as usize
    }

    pub fn total_steps(&self) -> usize {
        match self.mode {
            Mode::Serial => (self.t_end / self.dt).round() as usize,
            Mode::Parareal => self.slices * self.fine_steps(),
        }
    }

    /// Number of ranks the run needs when every rank is a thread.
    pub fn world_size(&self) -> usize {
        match self.mode {
            Mode::Serial => self.ranks,
            Mode::Parareal => self.slices * self.ranks,
        }
    }

    pub fn setup(&self) -> PropagatorSetup {
        PropagatorSetup {
            domain: self.domain(),
            tags: self.tags,
            solver: self.solver.clone(),
            balancer: if self.load_balance_threshold > 1.0 {
                LoadBalancer::new(self.load_balance_threshold, self.balance_interval)
            } else {
                LoadBalancer::disabled()
            },
            params: StepParams {
                dt: self.dt,
                q_over_m: self.charge_to_mass,
                neutralize: self.neutralize,
            },
        }
    }

    pub fn parareal(&self) -> PararealConfig {
        PararealConfig {
            slices: self.slices,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            coarse_steps: self.coarse_steps,
            fine_steps: self.fine_steps(),
        }
    }

    pub fn sampler(&self) -> LandauSampler {
        LandauSampler::new(self.alpha, self.k, self.seed)
    }

    /// Rough upper bound on the bytes in flight between two ranks, used
    /// to size the MPI send buffer.
    pub fn message_buffer_size(&self) -> usize {
        let cells = self.n[0] * self.n[1] * self.n[2];
        8 * (128 * self.particles + 32 * cells)
    }
}

pub fn ettc (start: std::time::Instant, current: usize, total: usize) -> std::time::Duration {
    let rt = start.elapsed().as_secs_f64();
    let ettc = rt * ((total - current) as f64) / (current as f64);
    std::time::Duration::from_secs_f64(ettc)
}

pub struct PrettyDuration {
    pub duration: std::time::Duration,
}

impl From<std::time::Duration> for PrettyDuration {
    fn from(duration: std::time::Duration) -> PrettyDuration {
        PrettyDuration {duration: duration}
    }
}

impl fmt::Display for PrettyDuration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut t = self.duration.as_secs();
        let s = t % 60;
        t /= 60;
        let min = t % 60;
        t /= 60;
        let hr = t % 24;
        let d = t / 24;
        if d > 0 {
            write!(f, "{}d {:02}:{:02}:{:02}", d, hr, min, s)
        } else {
            write!(f, "{:02}:{:02}:{:02}", hr, min, s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = "
constants:
  wavenumber: 0.5

control:
  nx: 16
  ny: 8
  nz: 8
  lx: 2 * pi / wavenumber
  dt: 0.05
  end: 2.0
  particles: 4096
  decomposition: [parallel, parallel, serial]
  load_balance_threshold: 1.1
  mode: serial
  ranks: 2

parareal:
  slices: 4
  tolerance: 1.0e-8

landau:
  alpha: 0.1
  k: wavenumber
";

    fn parse(input: &str) -> Result<Parameters, PicError> {
        let mut config = Configuration::from_str(input)?;
        config.with_context("constants");
        Parameters::from_config(&config)
    }

    #[test]
    fn reads_options_and_defaults() {
        let p = parse(INPUT).unwrap();
        assert_eq!(p.n, [16, 8, 8]);
        assert!((p.extent[0] - 4.0 * std::f64::consts::PI).abs() < 1e-12);
        assert!((p.extent[1] - p.extent[0]).abs() < 1e-12);
        assert_eq!(p.tags, [AxisTag::Decomposed, AxisTag::Decomposed, AxisTag::Whole]);
        assert_eq!(p.mode, Mode::Serial);
        assert_eq!(p.solver, "fft");
        assert_eq!(p.slices, 4);
        assert_eq!(p.max_iterations, 20);
        assert_eq!(p.fine_steps(), 10);
        assert_eq!(p.world_size(), 2);
        assert_eq!(p.log_level, LevelFilter::Info);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let input = INPUT.replace("  dt: 0.05\n", "");
        match parse(&input) {
            Err(PicError::Input(InputError::MissingField(section, field))) => {
                assert_eq!(section, "control");
                assert_eq!(field, "dt");
            },
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unsupported_options_are_rejected_up_front() {
        let cases = [
            ("  mode: serial\n", "  mode: serial\n  solver: open\n"),
            ("  mode: serial\n", "  mode: serial\n  solver: p3m\n"),
            ("  mode: serial\n", "  mode: serial\n  interpolation: tsc\n"),
            ("  ranks: 2\n", "  ranks: 200\n"),
            ("  dt: 0.05\n", "  dt: -0.05\n"),
            ("  nz: 8\n", "  nz: 1\n"),
            ("  alpha: 0.1\n", "  alpha: 1.5\n"),
            ("  nx: 16\n", "  nx: 4611686018427387904\n"),
        ];
        for (from, to) in cases.iter() {
            let input = INPUT.replace(from, to);
            let p = parse(&input).unwrap();
            match p.validate() {
                Err(PicError::Config(_)) => (),
                other => panic!("{:?} gave {:?}", to, other),
            }
        }
        assert!(parse(&INPUT.replace("mode: serial", "mode: sideways")).is_err());
    }

    #[test]
    fn negative_counts_are_parse_errors() {
        let cases = [
            ("  nz: 8\n", "  nz: -8\n"),
            ("  nx: 16\n", "  nx: -4\n"),
            ("  particles: 4096\n", "  particles: -1\n"),
            ("  slices: 4\n", "  slices: -2\n"),
        ];
        for (from, to) in cases.iter() {
            let input = INPUT.replace(from, to);
            match parse(&input) {
                Err(PicError::Input(InputError::CouldNotParse(_, value))) => {
                    assert!(value.starts_with('-'));
                },
                other => panic!("{:?} gave {:?}", to, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn durations_are_pretty() {
        let d = PrettyDuration::from(std::time::Duration::from_secs(90061));
        assert_eq!(d.to_string(), "1d 01:01:01");
    }
}
