use anyhow::{Context, Result};
use impic::settings;
use impic::simulation::Simulation;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "impic=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = settings::load_config()?;
    if let Some(threads) = settings.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring the worker thread pool")?;
    }

    let mut simulation = Simulation::new(settings)?;
    simulation.run()?;
    simulation.writeup()
}
