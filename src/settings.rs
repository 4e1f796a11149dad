use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use tracing::info;

use crate::collision::{BinScheme, HeightBands};
use crate::container::{ContainerConfig, Execution};
use crate::source::SourceConfig;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let settings = load_default_config().unwrap();
        assert!(settings.time_step > 0.0);
        assert!(matches!(settings.source, SourceConfig::Shell(_)));
        assert!(matches!(settings.detector, DetectorScheme::HeightBands(_)));

        // survives a round trip through the settings dump
        let text = toml::to_string(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = load_default_config().unwrap();

        let mut bad = base.clone();
        bad.time_step = 0.0;
        assert!(validate_config(&bad).is_err());

        let mut bad = base.clone();
        bad.container.chunk_width = 0;
        assert!(validate_config(&bad).is_err());

        let mut bad = base.clone();
        bad.container.shrink_threshold = 1.5;
        assert!(validate_config(&bad).is_err());

        let mut bad = base;
        bad.container.padding = -0.1;
        assert!(validate_config(&bad).is_err());
    }
}

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub mesh: MeshSettings,
    pub container: ContainerConfig,
    pub boundary: BoundarySettings,
    pub source: SourceConfig,
    pub detector: DetectorScheme,
    /// Push time step in seconds.
    pub time_step: f64,
    pub num_steps: usize,
    /// Steps between histogram read-backs. 0 disables checkpoints.
    #[serde(default)]
    pub checkpoint_interval: usize,
    #[serde(default)]
    pub execution: Execution,
    /// Size of the global rayon pool; all cores when unset.
    pub threads: Option<usize>,
    pub seed: Option<u64>,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
}

fn default_directory() -> PathBuf {
    PathBuf::from("impic_run")
}

/// Structured box mesh.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MeshSettings {
    pub lo: [f64; 3],
    pub hi: [f64; 3],
    pub divisions: [usize; 3],
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BoundarySettings {
    /// Extra reach beyond the element size when registering candidate faces.
    pub candidate_radius: f64,
}

/// How wall hits are binned.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum DetectorScheme {
    /// One bin per boundary face.
    Faces,
    HeightBands(HeightBands),
}

impl DetectorScheme {
    pub fn to_bin_scheme(&self, num_faces: usize) -> BinScheme {
        match self {
            DetectorScheme::Faces => BinScheme::FaceTags {
                detector_ids: (0..num_faces).map(Some).collect(),
            },
            DetectorScheme::HeightBands(bands) => BinScheme::HeightBands(*bands),
        }
    }
}

pub fn load_default_config() -> Result<Settings> {
    let impic_dir = retrieve_project_root()?;
    let default_config_file = impic_dir.join("config/default.toml");

    let settings: Config = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .context("loading default configuration")?;

    let config: Settings = settings
        .try_deserialize()
        .context("deserializing default configuration")?;

    validate_config(&config)?;

    Ok(config)
}

pub fn load_config() -> Result<Settings> {
    let impic_dir = retrieve_project_root()?;

    let default_config_file = impic_dir.join("config/default.toml");
    let local_config = impic_dir.join("config/local.toml");

    // a local config takes precedence over the default one
    let config_file = if local_config.exists() {
        info!("Using local configuration: {:?}", local_config);
        local_config
    } else {
        info!("Using default configuration: {:?}", default_config_file);
        default_config_file
    };

    let settings: Config = Config::builder()
        .add_source(File::from(config_file).required(true))
        .add_source(
            Environment::with_prefix("IMPIC")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .context("loading configuration")?;

    let mut config: Settings = settings
        .try_deserialize()
        .context("deserializing configuration")?;

    // command-line arguments override everything else
    let args = CliArgs::parse();

    if let Some(dt) = args.dt {
        config.time_step = dt;
    }
    if let Some(steps) = args.steps {
        config.num_steps = steps;
    }
    if let Some(interval) = args.checkpoint {
        config.checkpoint_interval = interval;
    }
    if let Some(radius) = args.radius {
        config.boundary.candidate_radius = radius;
    }
    if let Some(width) = args.chunk_width {
        config.container.chunk_width = width;
    }
    if let Some(sigma) = args.sigma {
        config.container.sigma = sigma;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if args.serial {
        config.execution = Execution::Serial;
    }
    if let Some(dir) = args.dir {
        config.directory = dir;
    }

    validate_config(&config)?;

    info!("{}", config);

    Ok(config)
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the IMPIC_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("IMPIC_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }

    let exe_path = env::current_exe().context("locating the current executable")?;
    let mut current_dir = exe_path.parent();
    while let Some(dir) = current_dir {
        if dir.join("config").is_dir() {
            return Ok(dir.to_path_buf());
        }
        current_dir = dir.parent();
    }
    bail!("could not find the project root directory; set IMPIC_ROOT_DIR")
}

fn validate_config(config: &Settings) -> Result<()> {
    if !(config.time_step > 0.0) {
        bail!("time step must be greater than 0, got {}", config.time_step);
    }
    if config.container.chunk_width == 0 {
        bail!("chunk width must be at least 1");
    }
    if config.container.sigma == 0 {
        bail!("sigma must be at least 1");
    }
    if !(config.container.padding >= 0.0) {
        bail!("padding must not be negative, got {}", config.container.padding);
    }
    let threshold = config.container.shrink_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        bail!("shrink threshold must lie in (0, 1], got {}", threshold);
    }
    if config.boundary.candidate_radius < 0.0 {
        bail!("candidate radius must not be negative");
    }
    if config.mesh.divisions.contains(&0) {
        bail!("mesh divisions must be at least 1 along every axis");
    }
    if (0..3).any(|i| config.mesh.hi[i] <= config.mesh.lo[i]) {
        bail!("mesh upper corner must lie above the lower corner");
    }
    if let DetectorScheme::HeightBands(bands) = &config.detector {
        if !(bands.band_height > 0.0) {
            bail!("band height must be greater than 0");
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(version, about = "IMPIC - impurity particle transport on tetrahedral meshes")]
pub struct CliArgs {
    /// Time step of the particle push, in seconds.
    #[arg(long)]
    dt: Option<f64>,

    /// Number of time steps to run.
    #[arg(short = 'n', long)]
    steps: Option<usize>,

    /// Steps between histogram checkpoints. 0 disables them.
    #[arg(long)]
    checkpoint: Option<usize>,

    /// Extra distance beyond the element size within which boundary faces
    /// are registered as candidates of an element.
    #[arg(short, long)]
    radius: Option<f64>,

    /// Number of slots per container row.
    #[arg(long)]
    chunk_width: Option<usize>,

    /// Number of elements sorted together by particle count.
    #[arg(long)]
    sigma: Option<usize>,

    /// Random seed for the particle source.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Size of the worker thread pool.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Run every kernel on a single thread.
    #[arg(long)]
    serial: bool,

    /// Output directory.
    #[arg(short, long)]
    dir: Option<PathBuf>,
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Mesh: {:?} to {:?}, {:?} divisions
  - Chunk Width: {}, Sigma: {}
  - Candidate Radius: {:.6}
  - Time Step: {:e}
  - Steps: {} (checkpoint every {})
  - Execution: {:?}
  - Output: {:?}
  ",
            self.mesh.lo,
            self.mesh.hi,
            self.mesh.divisions,
            self.container.chunk_width,
            self.container.sigma,
            self.boundary.candidate_radius,
            self.time_step,
            self.num_steps,
            self.checkpoint_interval,
            self.execution,
            self.directory,
        )
    }
}
