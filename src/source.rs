//! Initial impurity particles.
//!
//! A source emits positions and velocities; [`seed_container`] locates each
//! emission in the mesh, groups them by element and fills a fresh container.

use anyhow::{anyhow, bail, Result};
use nalgebra::{Point3, Vector3};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::container::{ContainerConfig, ParticleContainer, ParticleRecord};
use crate::csr;
use crate::mesh::{MeshTopology, TetMesh};

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn shell() -> ShellSource {
        ShellSource {
            num_particles: 200,
            center: [0.5, 0.5, 0.5],
            radius: 0.2,
            theta: 90.0,
            phi: 0.0,
            spread: 30.0,
            speed: 2.0,
            speed_std: 0.1,
        }
    }

    #[test]
    fn shell_emissions_lie_on_the_shell() {
        let source = shell();
        let mut rng = StdRng::seed_from_u64(1);
        let emitted = source.emit(&mut rng).unwrap();
        assert_eq!(emitted.len(), 200);
        let center = Point3::from(source.center);
        for e in &emitted {
            let offset = e.pos - center;
            assert!((offset.norm() - 0.2).abs() < 1e-12);
            // moving away from the centre, inside the angular window
            assert!(e.vel.dot(&offset) > 0.0);
            assert!(offset.x > 0.0);
        }
    }

    #[test]
    fn same_seed_same_particles() {
        let source = shell();
        let a = source.emit(&mut StdRng::seed_from_u64(7)).unwrap();
        let b = source.emit(&mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tabular_rows() {
        let source = TabularSource::new(array![
            [0.1, 0.2, 0.3, 1.0, 0.0, 0.0],
            [0.9, 0.9, 0.9, 0.0, 0.0, -1.0]
        ])
        .unwrap();
        let emitted = source.emit(&mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(emitted[1].pos, Point3::new(0.9, 0.9, 0.9));
        assert_eq!(emitted[1].vel, Vector3::new(0.0, 0.0, -1.0));

        assert!(TabularSource::new(Array2::zeros((3, 4))).is_err());
    }

    #[test]
    fn seeding_skips_points_outside_the_mesh() {
        let mesh = TetMesh::structured_box([0.0; 3], [1.0; 3], [2, 2, 2]);
        let source = TabularSource::new(array![
            [0.1, 0.1, 0.1, 0.0, 0.0, 0.0],
            [2.0, 0.5, 0.5, 0.0, 0.0, 0.0],
            [0.8, 0.7, 0.9, 0.0, 0.0, 0.0],
            [0.12, 0.1, 0.1, 0.0, 0.0, 0.0]
        ])
        .unwrap();
        let emitted = source.emit(&mut StdRng::seed_from_u64(0)).unwrap();
        let container = seed_container(ContainerConfig::default(), &mesh, &emitted).unwrap();
        assert_eq!(container.num_live(), 3);

        let mut ids: Vec<u64> = container.live_particles().map(|(_, _, p)| p.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 2, 3]);
        for (elem, _, p) in container.live_particles() {
            assert!(mesh.contains(elem, &p.pos));
        }
    }
}

/// One emitted particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emission {
    pub pos: Point3<f64>,
    pub vel: Vector3<f64>,
}

pub trait ParticleSource {
    fn emit(&self, rng: &mut StdRng) -> Result<Vec<Emission>>;
}

/// Particles on a sphere around `center`, within `spread` degrees of the
/// direction (`theta`, `phi`), moving radially outward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellSource {
    pub num_particles: usize,
    pub center: [f64; 3],
    pub radius: f64,
    /// Polar angle of the direction in degrees.
    pub theta: f64,
    /// Azimuth of the direction in degrees.
    pub phi: f64,
    pub spread: f64,
    pub speed: f64,
    pub speed_std: f64,
}

impl ParticleSource for ShellSource {
    fn emit(&self, rng: &mut StdRng) -> Result<Vec<Emission>> {
        let speeds = Normal::new(self.speed, self.speed_std)
            .map_err(|e| anyhow!("invalid speed distribution: {}", e))?;
        let center = Point3::from(self.center);
        let spread = self.spread.abs();

        let emitted = (0..self.num_particles)
            .map(|_| {
                let theta = (self.theta + rng.random_range(-spread..=spread)).to_radians();
                let phi = (self.phi + rng.random_range(-spread..=spread)).to_radians();
                let dir = Vector3::new(
                    theta.sin() * phi.cos(),
                    theta.sin() * phi.sin(),
                    theta.cos(),
                );
                let speed: f64 = rng.sample(speeds);
                Emission {
                    pos: center + dir * self.radius,
                    vel: dir * speed.abs(),
                }
            })
            .collect();
        Ok(emitted)
    }
}

/// Particles read from rows of `x y z vx vy vz`.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularSource {
    data: Array2<f64>,
}

impl TabularSource {
    pub fn new(data: Array2<f64>) -> Result<Self> {
        if data.ncols() != 6 {
            bail!(
                "particle table needs 6 columns (x y z vx vy vz), got {}",
                data.ncols()
            );
        }
        Ok(Self { data })
    }

    pub fn from_rows(rows: &[[f64; 6]]) -> Result<Self> {
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Self::new(Array2::from_shape_vec((rows.len(), 6), flat)?)
    }
}

impl ParticleSource for TabularSource {
    fn emit(&self, _rng: &mut StdRng) -> Result<Vec<Emission>> {
        Ok(self
            .data
            .rows()
            .into_iter()
            .map(|r| Emission {
                pos: Point3::new(r[0], r[1], r[2]),
                vel: Vector3::new(r[3], r[4], r[5]),
            })
            .collect())
    }
}

/// Source selection as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Shell(ShellSource),
    Tabular { rows: Vec<[f64; 6]> },
}

impl SourceConfig {
    pub fn build(&self) -> Result<Box<dyn ParticleSource>> {
        Ok(match self {
            SourceConfig::Shell(shell) => Box::new(shell.clone()),
            SourceConfig::Tabular { rows } => Box::new(TabularSource::from_rows(rows)?),
        })
    }
}

/// Fills a new container with the emissions that fall inside `mesh`.
///
/// Particle ids are emission indices. Emissions outside the mesh are
/// dropped with a warning.
pub fn seed_container(
    config: ContainerConfig,
    mesh: &TetMesh,
    emitted: &[Emission],
) -> Result<ParticleContainer> {
    let mut hint = None;
    let elems: Vec<Option<usize>> = emitted
        .iter()
        .map(|e| {
            let found = mesh.locate(&e.pos, hint);
            hint = found.or(hint);
            found
        })
        .collect();

    let outside = elems.iter().filter(|e| e.is_none()).count();
    if outside > 0 {
        warn!(
            "{} of {} particles lie outside the mesh and are skipped",
            outside,
            emitted.len()
        );
    }

    let (offsets, members) = csr::group_by_key(mesh.nelems(), &elems);
    let mut particles = Vec::with_capacity(members.len());
    for elem in 0..mesh.nelems() {
        for &i in &members[csr::range(&offsets, elem)] {
            let e = &emitted[i];
            particles.push((elem, ParticleRecord::new(i as u64, e.pos, e.vel)));
        }
    }

    let container = ParticleContainer::from_particles(config, mesh.nelems(), particles)?;
    info!(
        "Seeded {} particles into {} elements ({} slots)",
        container.num_live(),
        mesh.nelems(),
        container.capacity()
    );
    Ok(container)
}
