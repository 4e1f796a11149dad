//! Structure-of-arrays particle container.
//!
//! Particles live in a padded slot array split into rows of `chunk_width`
//! slots. Each mesh element owns a contiguous run of rows, so a kernel that
//! walks the slots sees the particles of one element together. A slot is
//! either live or padding; padding slots hold no meaningful data and every
//! kernel receives the liveness flag so it can skip them.
//!
//! Elements are laid out by descending particle count inside windows of
//! `sigma` elements (the Sell-C-sigma ordering), which keeps rows of similar
//! occupancy next to each other.
//!
//! The container is rebuilt whenever particles change element: every live
//! particle receives a [`Destination`], records are moved to their new slots
//! and the storage grows or lazily shrinks. Slot indices are invalidated by a
//! rebuild; particle ids are not.

use std::cmp::Reverse;
use std::collections::{HashSet, TryReserveError};
use std::ops::Range;

use itertools::multizip;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::csr;
use crate::error::ContainerError;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(chunk_width: usize, sigma: usize) -> ContainerConfig {
        ContainerConfig {
            chunk_width,
            sigma,
            ..ContainerConfig::default()
        }
    }

    fn ids(container: &ParticleContainer) -> Vec<u64> {
        let mut ids: Vec<u64> = container.live_particles().map(|(_, _, p)| p.id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn rows_are_pinned_to_elements() {
        let container = ParticleContainer::new(config(4, 1), &[3, 0, 5], 0).unwrap();
        assert_eq!(container.num_live(), 8);
        assert_eq!(container.capacity(), 12);
        assert_eq!(container.element_slots(0), 0..4);
        assert_eq!(container.element_slots(1), 4..4);
        assert_eq!(container.element_slots(2), 4..12);
        assert_eq!(container.element_counts(), vec![3, 0, 5]);

        let seen: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();
        container.parallel_for(Execution::Parallel, |elem, _, live| {
            if live {
                seen[elem].fetch_add(1, Ordering::Relaxed);
            }
        });
        let seen: Vec<usize> = seen.into_iter().map(AtomicUsize::into_inner).collect();
        assert_eq!(seen, vec![3, 0, 5]);
        assert_eq!(ids(&container), (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn sigma_orders_by_count() {
        let container = ParticleContainer::new(config(2, 3), &[1, 5, 3, 2], 0).unwrap();
        // first window [0, 1, 2] sorted by count, then element 3 alone
        assert_eq!(container.element_slots(1), 0..6);
        assert_eq!(container.element_slots(2), 6..10);
        assert_eq!(container.element_slots(0), 10..12);
        assert_eq!(container.element_slots(3), 12..14);
    }

    #[test]
    fn rebuild_keeps_ids() {
        let mut container = ParticleContainer::new(config(4, 2), &[4, 3, 2, 1], 0).unwrap();
        let before = ids(&container);

        for round in 0..3 {
            let dest: Vec<Option<Destination>> = (0..container.capacity())
                .map(|slot| {
                    container
                        .record(slot)
                        .map(|p| Destination::Element((p.id as usize + round) % 4))
                })
                .collect();
            container.rebuild(&dest).unwrap();
            assert_eq!(ids(&container), before);
        }

        for (elem, _, p) in container.live_particles() {
            assert_eq!(elem, (p.id as usize + 2) % 4);
        }
    }

    #[test]
    fn rebuild_moves_record_data() {
        let mut container = ParticleContainer::new(config(2, 1), &[2, 0], 0).unwrap();
        container.parallel_for_mut(Execution::Parallel, |_, _, live, p| {
            if live {
                *p.pos = Point3::new(p.id as f64, 1.0, 2.0);
                *p.charge = 3;
            }
        });
        let dest: Vec<_> = (0..container.capacity())
            .map(|slot| container.record(slot).map(|_| Destination::Element(1)))
            .collect();
        container.rebuild(&dest).unwrap();

        for (elem, slot, p) in container.live_particles() {
            assert_eq!(elem, 1);
            assert_eq!(p.pos, Point3::new(p.id as f64, 1.0, 2.0));
            assert_eq!(p.charge, 3);
            assert_eq!(container.velocities()[slot], p.vel);
        }

        // the flat views agree with the mask
        let mask = container.mask();
        assert_eq!(mask.len(), container.capacity());
        assert_eq!(mask.iter().filter(|&&live| live).count(), 2);
        let charges = container.charges();
        for slot in 0..container.capacity() {
            assert_eq!(charges[slot] == 3, mask[slot]);
        }
    }

    #[test]
    fn remove_and_insert() {
        let mut container = ParticleContainer::new(config(4, 1), &[2, 2], 0).unwrap();
        let dest: Vec<_> = (0..container.capacity())
            .map(|slot| {
                container.record(slot).map(|p| {
                    if p.id % 2 == 0 {
                        Destination::Remove
                    } else {
                        Destination::Element(0)
                    }
                })
            })
            .collect();
        let incoming = vec![(1, ParticleRecord::new(10, Point3::origin(), Vector3::zeros()))];
        container.rebuild_with(&dest, incoming).unwrap();
        assert_eq!(ids(&container), vec![1, 3, 10]);
        assert_eq!(container.element_counts(), vec![2, 1]);
    }

    #[test]
    fn rebuild_rejects_bad_destinations() {
        let mut container = ParticleContainer::new(config(4, 1), &[2], 0).unwrap();
        let mut dest = vec![None; container.capacity()];
        assert!(matches!(
            container.rebuild(&dest),
            Err(ContainerError::Unassigned { slot: 0, .. })
        ));

        dest[0] = Some(Destination::Element(0));
        dest[1] = Some(Destination::Element(7));
        assert!(matches!(
            container.rebuild(&dest),
            Err(ContainerError::ElementOutOfRange { element: 7, .. })
        ));

        assert!(matches!(
            container.rebuild(&dest[..1]),
            Err(ContainerError::LengthMismatch { .. })
        ));

        dest[1] = Some(Destination::Element(0));
        let duplicate = vec![(0, ParticleRecord::new(1, Point3::origin(), Vector3::zeros()))];
        assert!(matches!(
            container.rebuild_with(&dest, duplicate),
            Err(ContainerError::DuplicateId(1))
        ));
        // failed rebuilds leave the container untouched
        assert_eq!(container.num_live(), 2);
    }

    #[test]
    fn capacity_limit_is_an_allocation_error() {
        let limited = ContainerConfig {
            chunk_width: 4,
            max_capacity: Some(8),
            ..ContainerConfig::default()
        };
        assert!(matches!(
            ParticleContainer::new(limited.clone(), &[5, 5], 0),
            Err(ContainerError::Allocation { requested: 16, .. })
        ));
        assert!(ParticleContainer::new(limited, &[4, 4], 0).is_ok());
    }

    #[test]
    fn oversized_request_is_an_allocation_error() {
        assert!(matches!(
            ParticleContainer::new(ContainerConfig::default(), &[1], usize::MAX),
            Err(ContainerError::Allocation {
                source: Some(_),
                ..
            })
        ));
    }

    #[test]
    fn storage_grows_and_shrinks_lazily() {
        let cfg = ContainerConfig {
            chunk_width: 4,
            sigma: 1,
            padding: 0.5,
            shrink_threshold: 0.25,
            max_capacity: None,
        };
        let mut container = ParticleContainer::new(cfg, &[8, 8], 0).unwrap();
        assert_eq!(container.capacity(), 16);
        let allocated = container.allocated();
        assert!(allocated >= 16);

        // halve the population: allocation is kept
        let dest: Vec<_> = (0..container.capacity())
            .map(|slot| {
                container.record(slot).map(|p| {
                    if p.id < 8 {
                        Destination::Element(0)
                    } else {
                        Destination::Remove
                    }
                })
            })
            .collect();
        container.rebuild(&dest).unwrap();
        assert_eq!(container.capacity(), 8);
        assert_eq!(container.allocated(), allocated);

        // drop below the shrink threshold: allocation is reclaimed
        let dest: Vec<_> = (0..container.capacity())
            .map(|slot| {
                container.record(slot).map(|p| {
                    if p.id == 0 {
                        Destination::Element(1)
                    } else {
                        Destination::Remove
                    }
                })
            })
            .collect();
        container.rebuild(&dest).unwrap();
        assert_eq!(container.capacity(), 4);
        assert!(container.allocated() < allocated);
        assert!(container.allocated() >= container.capacity());
    }

    #[test]
    fn serial_and_parallel_dispatch_agree() {
        let mut container = ParticleContainer::new(config(3, 2), &[4, 1, 6], 0).unwrap();
        container.parallel_for_mut(Execution::Serial, |elem, slot, live, p| {
            if live {
                *p.vel = Vector3::new(elem as f64, slot as f64, p.id as f64);
            }
        });
        let serial = container.parallel_map(Execution::Serial, |e, s, live| (e, s, live));
        let parallel = container.parallel_map(Execution::Parallel, |e, s, live| (e, s, live));
        assert_eq!(serial, parallel);
        for (elem, slot, p) in container.live_particles() {
            assert_eq!(p.vel, Vector3::new(elem as f64, slot as f64, p.id as f64));
        }
    }
}

/// How per-slot kernels are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// One slot after another on the calling thread.
    Serial,
    /// Slots spread over the rayon thread pool.
    #[default]
    Parallel,
}

/// Layout and growth parameters of a [`ParticleContainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Slots per row.
    pub chunk_width: usize,
    /// Window of elements sorted by particle count.
    pub sigma: usize,
    /// Fractional slack added when the storage has to grow.
    pub padding: f64,
    /// Storage is reclaimed once the required slots fall below this
    /// fraction of the allocation.
    pub shrink_threshold: f64,
    /// Hard limit on the number of slots.
    #[serde(default)]
    pub max_capacity: Option<usize>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            chunk_width: 32,
            sigma: 1,
            padding: 0.1,
            shrink_threshold: 0.5,
            max_capacity: None,
        }
    }
}

/// Where a live particle goes on the next rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Element(usize),
    Remove,
}

/// One impurity particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleRecord {
    pub pos_prev: Point3<f64>,
    pub pos: Point3<f64>,
    pub id: u64,
    pub efield_prev: Vector3<f64>,
    pub vel: Vector3<f64>,
    pub charge: i32,
    pub first_ionize_z: f64,
    pub prev_ionize: i32,
    pub first_ionize_t: f64,
    pub prev_recombine: f64,
}

impl Default for ParticleRecord {
    fn default() -> Self {
        Self {
            pos_prev: Point3::origin(),
            pos: Point3::origin(),
            id: 0,
            efield_prev: Vector3::zeros(),
            vel: Vector3::zeros(),
            charge: 0,
            first_ionize_z: 0.0,
            prev_ionize: 0,
            first_ionize_t: 0.0,
            prev_recombine: 0.0,
        }
    }
}

impl ParticleRecord {
    /// Particle at `pos` with no history: the previous position is `pos` too.
    pub fn new(id: u64, pos: Point3<f64>, vel: Vector3<f64>) -> Self {
        Self {
            pos_prev: pos,
            pos,
            id,
            vel,
            ..Self::default()
        }
    }
}

/// Mutable view of one slot, handed to [`ParticleContainer::parallel_for_mut`].
///
/// The id is read-only: it is the only handle on a particle that survives a
/// rebuild.
#[derive(Debug)]
pub struct ParticleMut<'a> {
    pub id: u64,
    pub pos_prev: &'a mut Point3<f64>,
    pub pos: &'a mut Point3<f64>,
    pub efield_prev: &'a mut Vector3<f64>,
    pub vel: &'a mut Vector3<f64>,
    pub charge: &'a mut i32,
    pub first_ionize_z: &'a mut f64,
    pub prev_ionize: &'a mut i32,
    pub first_ionize_t: &'a mut f64,
    pub prev_recombine: &'a mut f64,
}

/// Row assignment for one particle distribution.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    chunk_width: usize,
    elem_start: Vec<usize>,
    elem_rows: Vec<usize>,
    row_elems: Vec<usize>,
}

impl Layout {
    fn new(config: &ContainerConfig, counts: &[usize]) -> Self {
        let chunk_width = config.chunk_width.max(1);
        let mut order: Vec<usize> = (0..counts.len()).collect();
        for window in order.chunks_mut(config.sigma.max(1)) {
            window.sort_by_key(|&e| Reverse(counts[e]));
        }

        let mut elem_start = vec![0; counts.len()];
        let mut elem_rows = vec![0; counts.len()];
        let mut row_elems = Vec::new();
        for e in order {
            let rows = counts[e].div_ceil(chunk_width);
            elem_start[e] = row_elems.len() * chunk_width;
            elem_rows[e] = rows;
            row_elems.extend(std::iter::repeat(e).take(rows));
        }

        Self {
            chunk_width,
            elem_start,
            elem_rows,
            row_elems,
        }
    }

    fn capacity(&self) -> usize {
        self.row_elems.len() * self.chunk_width
    }

    fn element_slots(&self, elem: usize) -> Range<usize> {
        let start = self.elem_start[elem];
        start..start + self.elem_rows[elem] * self.chunk_width
    }

    #[inline]
    fn element_of_slot(&self, slot: usize) -> usize {
        self.row_elems[slot / self.chunk_width]
    }
}

/// Applies `$body` to every per-slot storage vector, bound to `$v`.
macro_rules! each_store {
    ($self:ident, $v:ident => $body:expr) => {{
        {
            let $v = &mut $self.mask;
            $body;
        }
        {
            let $v = &mut $self.pos_prev;
            $body;
        }
        {
            let $v = &mut $self.pos;
            $body;
        }
        {
            let $v = &mut $self.id;
            $body;
        }
        {
            let $v = &mut $self.efield_prev;
            $body;
        }
        {
            let $v = &mut $self.vel;
            $body;
        }
        {
            let $v = &mut $self.charge;
            $body;
        }
        {
            let $v = &mut $self.first_ionize_z;
            $body;
        }
        {
            let $v = &mut $self.prev_ionize;
            $body;
        }
        {
            let $v = &mut $self.first_ionize_t;
            $body;
        }
        {
            let $v = &mut $self.prev_recombine;
            $body;
        }
    }};
}

/// Padded structure-of-arrays storage of particles grouped by element.
#[derive(Debug, Clone)]
pub struct ParticleContainer {
    config: ContainerConfig,
    num_elems: usize,
    layout: Layout,
    num_live: usize,
    mask: Vec<bool>,
    pos_prev: Vec<Point3<f64>>,
    pos: Vec<Point3<f64>>,
    id: Vec<u64>,
    efield_prev: Vec<Vector3<f64>>,
    vel: Vec<Vector3<f64>>,
    charge: Vec<i32>,
    first_ionize_z: Vec<f64>,
    prev_ionize: Vec<i32>,
    first_ionize_t: Vec<f64>,
    prev_recombine: Vec<f64>,
}

impl ParticleContainer {
    /// Allocates live slots for `counts[e]` particles in each element `e`.
    ///
    /// Particles get sequential ids in element order and default fields, to
    /// be filled by a [`parallel_for_mut`](Self::parallel_for_mut) pass. At
    /// least `capacity` slots are reserved up front.
    pub fn new(
        config: ContainerConfig,
        counts: &[usize],
        capacity: usize,
    ) -> Result<Self, ContainerError> {
        let mut next_id = 0;
        let mut particles = Vec::with_capacity(counts.iter().sum());
        for (elem, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                let record = ParticleRecord::new(next_id, Point3::origin(), Vector3::zeros());
                particles.push((elem, record));
                next_id += 1;
            }
        }

        let mut container = Self::empty(config, counts.len());
        container.reserve(capacity.max(Layout::new(&container.config, counts).capacity()))?;
        container.store(particles)?;
        Ok(container)
    }

    /// Seeds the container with particles already assigned to elements.
    pub fn from_particles(
        config: ContainerConfig,
        num_elems: usize,
        particles: Vec<(usize, ParticleRecord)>,
    ) -> Result<Self, ContainerError> {
        let mut container = Self::empty(config, num_elems);
        container.check_particles(&particles, &mut HashSet::new())?;
        container.store(particles)?;
        Ok(container)
    }

    fn empty(config: ContainerConfig, num_elems: usize) -> Self {
        let layout = Layout::new(&config, &vec![0; num_elems]);
        Self {
            config,
            num_elems,
            layout,
            num_live: 0,
            mask: Vec::new(),
            pos_prev: Vec::new(),
            pos: Vec::new(),
            id: Vec::new(),
            efield_prev: Vec::new(),
            vel: Vec::new(),
            charge: Vec::new(),
            first_ionize_z: Vec::new(),
            prev_ionize: Vec::new(),
            first_ionize_t: Vec::new(),
            prev_recombine: Vec::new(),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn num_elems(&self) -> usize {
        self.num_elems
    }

    /// Number of slots kernels iterate over, live or not.
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    /// Number of slots the backing storage can hold without reallocating.
    pub fn allocated(&self) -> usize {
        self.mask.capacity()
    }

    pub fn num_live(&self) -> usize {
        self.num_live
    }

    pub fn chunk_width(&self) -> usize {
        self.layout.chunk_width
    }

    pub fn element_slots(&self, elem: usize) -> Range<usize> {
        self.layout.element_slots(elem)
    }

    pub fn element_of_slot(&self, slot: usize) -> usize {
        self.layout.element_of_slot(slot)
    }

    pub fn is_live(&self, slot: usize) -> bool {
        self.mask[slot]
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn positions(&self) -> &[Point3<f64>] {
        &self.pos
    }

    pub fn prev_positions(&self) -> &[Point3<f64>] {
        &self.pos_prev
    }

    pub fn ids(&self) -> &[u64] {
        &self.id
    }

    pub fn velocities(&self) -> &[Vector3<f64>] {
        &self.vel
    }

    pub fn charges(&self) -> &[i32] {
        &self.charge
    }

    /// Live particles per element.
    pub fn element_counts(&self) -> Vec<usize> {
        (0..self.num_elems)
            .map(|e| self.element_slots(e).filter(|&s| self.mask[s]).count())
            .collect()
    }

    /// Copy of the record in `slot`, `None` for a padding slot.
    pub fn record(&self, slot: usize) -> Option<ParticleRecord> {
        if !self.mask[slot] {
            return None;
        }
        Some(ParticleRecord {
            pos_prev: self.pos_prev[slot],
            pos: self.pos[slot],
            id: self.id[slot],
            efield_prev: self.efield_prev[slot],
            vel: self.vel[slot],
            charge: self.charge[slot],
            first_ionize_z: self.first_ionize_z[slot],
            prev_ionize: self.prev_ionize[slot],
            first_ionize_t: self.first_ionize_t[slot],
            prev_recombine: self.prev_recombine[slot],
        })
    }

    /// `(element, slot, record)` of every live particle in slot order.
    pub fn live_particles(&self) -> impl Iterator<Item = (usize, usize, ParticleRecord)> + '_ {
        (0..self.capacity())
            .filter_map(move |slot| self.record(slot).map(|p| (self.element_of_slot(slot), slot, p)))
    }

    /// Calls `kernel(element, slot, live)` for every slot.
    ///
    /// Padding slots are visited too; the kernel must check `live` before
    /// reading particle fields. Slot order is unspecified under
    /// [`Execution::Parallel`].
    pub fn parallel_for<F>(&self, exec: Execution, kernel: F)
    where
        F: Fn(usize, usize, bool) + Sync + Send,
    {
        let layout = &self.layout;
        let mask = &self.mask;
        match exec {
            Execution::Serial => {
                for slot in 0..layout.capacity() {
                    kernel(layout.element_of_slot(slot), slot, mask[slot]);
                }
            }
            Execution::Parallel => (0..layout.capacity())
                .into_par_iter()
                .for_each(|slot| kernel(layout.element_of_slot(slot), slot, mask[slot])),
        }
    }

    /// Collects `kernel(element, slot, live)` over every slot, indexed by slot.
    pub fn parallel_map<T, F>(&self, exec: Execution, kernel: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize, usize, bool) -> T + Sync + Send,
    {
        let layout = &self.layout;
        let mask = &self.mask;
        match exec {
            Execution::Serial => (0..layout.capacity())
                .map(|slot| kernel(layout.element_of_slot(slot), slot, mask[slot]))
                .collect(),
            Execution::Parallel => (0..layout.capacity())
                .into_par_iter()
                .map(|slot| kernel(layout.element_of_slot(slot), slot, mask[slot]))
                .collect(),
        }
    }

    /// Fallible [`parallel_map`](Self::parallel_map); stops at an error.
    pub fn try_parallel_map<T, E, F>(&self, exec: Execution, kernel: F) -> Result<Vec<T>, E>
    where
        T: Send,
        E: Send,
        F: Fn(usize, usize, bool) -> Result<T, E> + Sync + Send,
    {
        let layout = &self.layout;
        let mask = &self.mask;
        match exec {
            Execution::Serial => (0..layout.capacity())
                .map(|slot| kernel(layout.element_of_slot(slot), slot, mask[slot]))
                .collect(),
            Execution::Parallel => (0..layout.capacity())
                .into_par_iter()
                .map(|slot| kernel(layout.element_of_slot(slot), slot, mask[slot]))
                .collect(),
        }
    }

    /// Calls `kernel(element, slot, live, particle)` with mutable access to
    /// the fields of each slot. Every slot is handed to exactly one call.
    pub fn parallel_for_mut<F>(&mut self, exec: Execution, kernel: F)
    where
        F: Fn(usize, usize, bool, ParticleMut<'_>) + Sync + Send,
    {
        let Self {
            layout,
            mask,
            pos_prev,
            pos,
            id,
            efield_prev,
            vel,
            charge,
            first_ionize_z,
            prev_ionize,
            first_ionize_t,
            prev_recombine,
            ..
        } = self;
        let layout = &*layout;

        let call = |slot: usize,
                    (live, pos_prev, pos, id, efield_prev, vel, charge, fiz, pi, fit, prc): (
            &bool,
            &mut Point3<f64>,
            &mut Point3<f64>,
            &u64,
            &mut Vector3<f64>,
            &mut Vector3<f64>,
            &mut i32,
            &mut f64,
            &mut i32,
            &mut f64,
            &mut f64,
        )| {
            kernel(
                layout.element_of_slot(slot),
                slot,
                *live,
                ParticleMut {
                    id: *id,
                    pos_prev,
                    pos,
                    efield_prev,
                    vel,
                    charge,
                    first_ionize_z: fiz,
                    prev_ionize: pi,
                    first_ionize_t: fit,
                    prev_recombine: prc,
                },
            )
        };

        match exec {
            Execution::Serial => multizip((
                mask.iter(),
                pos_prev.iter_mut(),
                pos.iter_mut(),
                id.iter(),
                efield_prev.iter_mut(),
                vel.iter_mut(),
                charge.iter_mut(),
                first_ionize_z.iter_mut(),
                prev_ionize.iter_mut(),
                first_ionize_t.iter_mut(),
                prev_recombine.iter_mut(),
            ))
            .enumerate()
            .for_each(|(slot, fields)| call(slot, fields)),
            Execution::Parallel => (
                mask.par_iter(),
                pos_prev.par_iter_mut(),
                pos.par_iter_mut(),
                id.par_iter(),
                efield_prev.par_iter_mut(),
                vel.par_iter_mut(),
                charge.par_iter_mut(),
                first_ionize_z.par_iter_mut(),
                prev_ionize.par_iter_mut(),
                first_ionize_t.par_iter_mut(),
                prev_recombine.par_iter_mut(),
            )
                .into_par_iter()
                .enumerate()
                .for_each(|(slot, fields)| call(slot, fields)),
        }
    }

    /// Moves every live particle to its destination.
    ///
    /// `dest` holds one entry per slot; entries of padding slots are ignored
    /// and a live slot without an entry is an error. On error the container
    /// is left as it was.
    pub fn rebuild(&mut self, dest: &[Option<Destination>]) -> Result<(), ContainerError> {
        self.rebuild_with(dest, Vec::new())
    }

    /// [`rebuild`](Self::rebuild) that also adds `incoming` particles.
    ///
    /// Within an element, surviving particles keep their slot order and
    /// incoming particles follow them.
    pub fn rebuild_with(
        &mut self,
        dest: &[Option<Destination>],
        incoming: Vec<(usize, ParticleRecord)>,
    ) -> Result<(), ContainerError> {
        if dest.len() != self.capacity() {
            return Err(ContainerError::LengthMismatch {
                expected: self.capacity(),
                found: dest.len(),
            });
        }

        let mut survivors = Vec::with_capacity(self.num_live + incoming.len());
        let mut removed = 0;
        for (slot, d) in dest.iter().enumerate() {
            let Some(record) = self.record(slot) else {
                continue;
            };
            match d {
                None => {
                    return Err(ContainerError::Unassigned {
                        slot,
                        id: record.id,
                    })
                }
                Some(Destination::Remove) => removed += 1,
                Some(Destination::Element(elem)) => {
                    if *elem >= self.num_elems {
                        return Err(ContainerError::ElementOutOfRange {
                            element: *elem,
                            num_elems: self.num_elems,
                        });
                    }
                    survivors.push((*elem, record));
                }
            }
        }

        let mut seen: HashSet<u64> = survivors.iter().map(|(_, p)| p.id).collect();
        self.check_particles(&incoming, &mut seen)?;
        let added = incoming.len();
        survivors.extend(incoming);

        self.store(survivors)?;
        debug!(
            "Rebuilt particle container: {} live, {} removed, {} added, {} slots",
            self.num_live,
            removed,
            added,
            self.capacity()
        );
        Ok(())
    }

    fn check_particles(
        &self,
        particles: &[(usize, ParticleRecord)],
        seen: &mut HashSet<u64>,
    ) -> Result<(), ContainerError> {
        for (elem, p) in particles {
            if *elem >= self.num_elems {
                return Err(ContainerError::ElementOutOfRange {
                    element: *elem,
                    num_elems: self.num_elems,
                });
            }
            if !seen.insert(p.id) {
                return Err(ContainerError::DuplicateId(p.id));
            }
        }
        Ok(())
    }

    /// Lays out `particles` and writes them into the storage.
    fn store(&mut self, particles: Vec<(usize, ParticleRecord)>) -> Result<(), ContainerError> {
        let keys: Vec<Option<usize>> = particles.iter().map(|(e, _)| Some(*e)).collect();
        let (offsets, members) = csr::group_by_key(self.num_elems, &keys);
        let counts: Vec<usize> = (0..self.num_elems)
            .map(|e| offsets[e + 1] - offsets[e])
            .collect();
        let layout = Layout::new(&self.config, &counts);
        let slots = layout.capacity();

        self.reserve(slots)?;
        let blank = ParticleRecord::default();
        each_store!(self, v => v.clear());
        self.mask.resize(slots, false);
        self.pos_prev.resize(slots, blank.pos_prev);
        self.pos.resize(slots, blank.pos);
        self.id.resize(slots, blank.id);
        self.efield_prev.resize(slots, blank.efield_prev);
        self.vel.resize(slots, blank.vel);
        self.charge.resize(slots, blank.charge);
        self.first_ionize_z.resize(slots, blank.first_ionize_z);
        self.prev_ionize.resize(slots, blank.prev_ionize);
        self.first_ionize_t.resize(slots, blank.first_ionize_t);
        self.prev_recombine.resize(slots, blank.prev_recombine);

        for elem in 0..self.num_elems {
            let start = layout.elem_start[elem];
            for (k, &i) in members[csr::range(&offsets, elem)].iter().enumerate() {
                self.write(start + k, &particles[i].1);
            }
        }

        self.layout = layout;
        self.num_live = particles.len();
        self.maybe_shrink(slots);
        Ok(())
    }

    fn write(&mut self, slot: usize, p: &ParticleRecord) {
        self.mask[slot] = true;
        self.pos_prev[slot] = p.pos_prev;
        self.pos[slot] = p.pos;
        self.id[slot] = p.id;
        self.efield_prev[slot] = p.efield_prev;
        self.vel[slot] = p.vel;
        self.charge[slot] = p.charge;
        self.first_ionize_z[slot] = p.first_ionize_z;
        self.prev_ionize[slot] = p.prev_ionize;
        self.first_ionize_t[slot] = p.first_ionize_t;
        self.prev_recombine[slot] = p.prev_recombine;
    }

    /// Slot count with padding, saturating so that oversized requests fail
    /// in the allocator.
    fn padded(&self, slots: usize) -> usize {
        let extra = (slots as f64 * self.config.padding.max(0.0)).ceil() as usize;
        let target = slots.saturating_add(extra);
        match self.config.max_capacity {
            Some(max) => target.min(max),
            None => target,
        }
    }

    /// Ensures the storage holds at least `slots` slots, growing with padding.
    fn reserve(&mut self, slots: usize) -> Result<(), ContainerError> {
        if let Some(max) = self.config.max_capacity {
            if slots > max {
                return Err(ContainerError::Allocation {
                    requested: slots,
                    source: None,
                });
            }
        }
        if slots <= self.allocated() {
            return Ok(());
        }

        let target = self.padded(slots);
        let alloc_err = |source: TryReserveError| ContainerError::Allocation {
            requested: target,
            source: Some(source),
        };
        each_store!(self, v => grow(v, target).map_err(alloc_err)?);
        info!("Grew particle storage to {} slots", self.allocated());
        Ok(())
    }

    fn maybe_shrink(&mut self, slots: usize) {
        let allocated = self.allocated();
        if (slots as f64) < self.config.shrink_threshold * allocated as f64 {
            let target = self.padded(slots);
            each_store!(self, v => v.shrink_to(target));
            debug!(
                "Shrank particle storage from {} to {} slots",
                allocated,
                self.allocated()
            );
        }
    }
}

fn grow<T>(v: &mut Vec<T>, target: usize) -> Result<(), TryReserveError> {
    if v.capacity() < target {
        v.try_reserve_exact(target - v.len())?;
    }
    Ok(())
}
