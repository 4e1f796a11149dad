//! Time stepping of impurity particles on a boundary-aware mesh.
//!
//! [`Simulation`] owns every piece of per-run state: the mesh, the boundary
//! candidate list, the particle container, the detector histogram and the
//! latest distance-to-boundary result. One [`Simulation::step`] performs
//!
//! 1. a ballistic push, remembering the previous position,
//! 2. wall collision detection against the candidate faces,
//! 3. binning of the collisions into the histogram,
//! 4. a container rebuild that drops collided and escaped particles and
//!    moves the rest to the element now holding them,
//! 5. the distance-to-boundary search on the rebuilt container.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::bdry::BoundaryFaceIndex;
use crate::collision::{
    find_wall_collisions, store_collisions, BinScheme, Collisions, HitHistogram,
};
use crate::container::{Destination, Execution, ParticleContainer};
use crate::distance::{find_distance_to_boundary, BoundaryDistances};
use crate::mesh::{MeshTopology, TetMesh};
use crate::output::{self, RunSummary};
use crate::settings::Settings;
use crate::source;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceConfig;

    fn settings_with(rows: Vec<[f64; 6]>) -> Settings {
        let mut settings = crate::settings::load_default_config().unwrap();
        settings.mesh.lo = [0.0; 3];
        settings.mesh.hi = [1.0; 3];
        settings.mesh.divisions = [2, 2, 2];
        settings.source = SourceConfig::Tabular { rows };
        settings.time_step = 0.1;
        settings
    }

    #[test]
    fn particle_crossing_the_floor_is_counted_and_removed() {
        let mut settings = settings_with(vec![
            [0.3, 0.2, 0.05, 0.0, 0.0, -1.0],
            [0.6, 0.6, 0.5, 0.1, 0.0, 0.0],
        ]);
        settings.detector = crate::settings::DetectorScheme::Faces;
        let mut sim = Simulation::new(settings).unwrap();
        assert_eq!(sim.container.num_live(), 2);

        let stats = sim.step().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.removed, 1);
        assert_eq!(sim.container.num_live(), 1);
        assert_eq!(sim.histogram.total(), 1);

        let (elem, slot, p) = sim.container.live_particles().next().unwrap();
        assert_eq!(p.id, 1);
        assert!((p.pos.x - 0.61).abs() < 1e-12);
        assert!(sim.mesh.contains(elem, &p.pos));
        // the survivor sits 0.39 from the side at x = 1
        let nearest = sim.distances.nearest(slot).unwrap();
        assert!((nearest.distance - 0.39).abs() < 1e-9);
    }

    #[test]
    fn serial_and_parallel_runs_agree() {
        let rows: Vec<[f64; 6]> = (0..40)
            .map(|i| {
                let f = i as f64 / 40.0;
                [0.1 + 0.8 * f, 0.5, 0.2 + 0.6 * f, 0.3 - f, 0.5 * f, -0.4]
            })
            .collect();
        let mut serial = settings_with(rows.clone());
        serial.execution = Execution::Serial;
        let mut parallel = settings_with(rows);
        parallel.execution = Execution::Parallel;

        let mut a = Simulation::new(serial).unwrap();
        let mut b = Simulation::new(parallel).unwrap();
        for _ in 0..6 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_eq!(a.histogram.snapshot(), b.histogram.snapshot());
        assert_eq!(a.container.num_live(), b.container.num_live());
        let ids = |sim: &Simulation| {
            let mut ids: Vec<u64> = sim.container.live_particles().map(|(_, _, p)| p.id).collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(ids(&a), ids(&b));
    }
}

/// Outcome of one time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepStats {
    pub step: usize,
    pub live: usize,
    pub removed: usize,
    /// Collisions binned by the detector this step.
    pub hits: u64,
}

#[derive(Debug)]
pub struct Simulation {
    pub settings: Settings,
    pub mesh: TetMesh,
    pub index: BoundaryFaceIndex,
    pub container: ParticleContainer,
    /// Nearest boundary face per slot of the current layout.
    pub distances: BoundaryDistances,
    pub scheme: BinScheme,
    pub histogram: HitHistogram,
    /// Completed steps.
    pub step: usize,
    initial_particles: usize,
    elapsed: Duration,
}

impl Simulation {
    pub fn new(settings: Settings) -> Result<Self> {
        let mesh = TetMesh::structured_box(
            settings.mesh.lo,
            settings.mesh.hi,
            settings.mesh.divisions,
        );
        info!(
            "Built mesh: {} elements, {} boundary faces",
            mesh.nelems(),
            mesh.boundary_faces().len()
        );

        let index = BoundaryFaceIndex::build(&mesh, settings.boundary.candidate_radius);
        index.check_mesh(&mesh)?;

        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let emitted = settings
            .source
            .build()?
            .emit(&mut rng)
            .context("emitting initial particles")?;
        let container = source::seed_container(settings.container.clone(), &mesh, &emitted)?;

        let scheme = settings.detector.to_bin_scheme(mesh.boundary_faces().len());
        let histogram = HitHistogram::new(scheme.num_bins());
        let distances = find_distance_to_boundary(&container, &index, settings.execution)?;

        Ok(Self {
            initial_particles: container.num_live(),
            settings,
            mesh,
            index,
            container,
            distances,
            scheme,
            histogram,
            step: 0,
            elapsed: Duration::ZERO,
        })
    }

    fn exec(&self) -> Execution {
        self.settings.execution
    }

    /// Straight-line move over one time step.
    pub fn push(&mut self) {
        let dt = self.settings.time_step;
        let exec = self.exec();
        self.container.parallel_for_mut(exec, |_, _, live, p| {
            if !live {
                return;
            }
            *p.pos_prev = *p.pos;
            *p.pos += *p.vel * dt;
        });
    }

    /// Where every live particle goes after a push.
    fn destinations(&self, collisions: &Collisions) -> Vec<Option<Destination>> {
        let positions = self.container.positions();
        let mesh = &self.mesh;
        self.container.parallel_map(self.exec(), |elem, slot, live| {
            if !live {
                return None;
            }
            if collisions.hit(slot).is_some() {
                return Some(Destination::Remove);
            }
            Some(match mesh.locate(&positions[slot], Some(elem)) {
                Some(next) => Destination::Element(next),
                None => Destination::Remove,
            })
        })
    }

    pub fn step(&mut self) -> Result<StepStats> {
        let exec = self.exec();
        self.push();

        let collisions = find_wall_collisions(&self.container, &self.index, exec)?;
        let hits = store_collisions(
            &self.container,
            &collisions,
            &self.scheme,
            &self.histogram,
            exec,
        );

        let dest = self.destinations(&collisions);
        let before = self.container.num_live();
        self.container
            .rebuild(&dest)
            .with_context(|| format!("rebuilding the container at step {}", self.step + 1))?;

        self.distances = find_distance_to_boundary(&self.container, &self.index, exec)?;
        self.step += 1;

        let stats = StepStats {
            step: self.step,
            live: self.container.num_live(),
            removed: before - self.container.num_live(),
            hits,
        };
        debug!(
            "step {}: {} live, {} removed, {} hits, {} near the boundary",
            stats.step,
            stats.live,
            stats.removed,
            stats.hits,
            self.distances.num_found()
        );
        Ok(stats)
    }

    /// Reads the histogram back and logs it.
    pub fn checkpoint(&self) -> Vec<u64> {
        let counts = self.histogram.snapshot();
        info!(
            "step {}: {} hits recorded, {} particles live",
            self.step,
            counts.iter().sum::<u64>(),
            self.container.num_live()
        );
        for (bin, count) in counts.iter().enumerate().filter(|(_, c)| **c > 0) {
            debug!("  bin {} : {}", bin, count);
        }
        counts
    }

    /// Runs the configured number of steps, stopping early once every
    /// particle is gone.
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        let n = self.settings.num_steps;
        let interval = self.settings.checkpoint_interval;
        info!(
            "Running {} steps with {} particles...",
            n,
            self.container.num_live()
        );

        let pb = ProgressBar::new(n as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
            )?
            .progress_chars("█▇▆▅▄▃▂▁"),
        );
        pb.set_message("step");

        for _ in 0..n {
            let stats = self.step()?;
            pb.inc(1);
            if interval > 0 && stats.step % interval == 0 {
                pb.suspend(|| self.checkpoint());
            }
            if stats.live == 0 {
                info!("No particles left after step {}", stats.step);
                break;
            }
        }
        pb.finish_and_clear();

        self.elapsed += start.elapsed();
        info!(
            "Time taken: {:.2?}, Time per step: {:.2?}",
            self.elapsed,
            self.elapsed / self.step.max(1) as u32
        );
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        let counts = self.histogram.snapshot();
        RunSummary {
            timestamp: Local::now(),
            steps: self.step,
            time_step: self.settings.time_step,
            num_elems: self.mesh.nelems(),
            num_boundary_faces: self.mesh.boundary_faces().len(),
            candidate_entries: self.index.num_entries(),
            initial_particles: self.initial_particles,
            live_particles: self.container.num_live(),
            total_hits: counts.iter().sum(),
            histogram: counts,
            distances: self.distances.summary(),
            elapsed_secs: self.elapsed.as_secs_f64(),
        }
    }

    /// Writes the histogram, the run summary and the effective settings.
    pub fn writeup(&self) -> Result<()> {
        let dir = &self.settings.directory;
        let counts = self.histogram.snapshot();
        let path = output::write_histogram(&counts, "hits", dir)?;
        info!("Wrote histogram to {:?}", path);
        output::write_summary(&self.summary(), dir)?;
        output::write_settings(&self.settings, dir)?;
        Ok(())
    }
}
