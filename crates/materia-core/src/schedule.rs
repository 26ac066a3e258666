//! Events that change the particle population during a run.
//!
//! Every event is keyed by the step at which it fires.
//! Change-material and remove events go from pending to applied exactly once,
//! so a run resumed from a checkpoint can retire the events
//! that the checkpoint already reflects without applying them again.

use std::{collections::BTreeMap, sync::Arc};

use nalgebra as na;

use crate::{
    config::{AddParticlesConfig, ConfigError},
    material::Material,
    particle::{Particle, ParticleError},
    Voigt,
};

/// Lifecycle of a scheduled event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    /// Not yet fired.
    Pending,
    /// Fired, either in this run or in the run a checkpoint came from.
    Applied,
}

//
// change material
//

/// Reassignment of particle sets to a material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeMaterialEvent {
    /// The material assigned to the sets.
    pub material_id: usize,
    /// Ids of the particle sets.
    pub set_ids: Vec<usize>,
    /// Whether the event has fired.
    pub state: EventState,
}

/// Change-material events by step.
#[derive(Clone, Debug, Default)]
pub struct ChangeMaterialSchedule {
    steps: BTreeMap<usize, Vec<ChangeMaterialEvent>>,
}

impl ChangeMaterialSchedule {
    /// Schedule particle set `set_id` to switch to `material_id` at `step`.
    ///
    /// Sets switching to the same material at the same step share an event.
    pub fn insert(&mut self, step: usize, set_id: usize, material_id: usize) {
        let events = self.steps.entry(step).or_default();
        match events
            .iter_mut()
            .find(|e| e.material_id == material_id && e.state == EventState::Pending)
        {
            Some(event) => {
                if !event.set_ids.contains(&set_id) {
                    event.set_ids.push(set_id);
                }
            }
            None => events.push(ChangeMaterialEvent {
                material_id,
                set_ids: vec![set_id],
                state: EventState::Pending,
            }),
        }
    }

    /// Pending events at `step`.
    pub fn pending_at(&self, step: usize) -> Vec<ChangeMaterialEvent> {
        self.steps
            .get(&step)
            .into_iter()
            .flatten()
            .filter(|e| e.state == EventState::Pending)
            .cloned()
            .collect()
    }

    /// Mark every event at `step` applied, returning how many were pending.
    pub fn mark_applied(&mut self, step: usize) -> usize {
        let mut count = 0;
        for event in self.steps.get_mut(&step).into_iter().flatten() {
            if event.state == EventState::Pending {
                event.state = EventState::Applied;
                count += 1;
            }
        }
        count
    }

    /// Scheduled steps strictly before `step`, in order.
    pub fn steps_before(&self, step: usize) -> Vec<usize> {
        self.steps.range(..step).map(|(s, _)| *s).collect()
    }

    /// Every event at `step`.
    pub fn events_at(&self, step: usize) -> &[ChangeMaterialEvent] {
        self.steps.get(&step).map(|e| e.as_slice()).unwrap_or(&[])
    }

    /// Number of events not yet applied.
    pub fn pending_count(&self) -> usize {
        self.steps
            .values()
            .flatten()
            .filter(|e| e.state == EventState::Pending)
            .count()
    }
}

//
// remove
//

/// Particle sets scheduled for removal.
///
/// `check_sets` holds the sets still to be removed, by step,
/// and `remove_sets` the ones already removed.
#[derive(Clone, Debug, Default)]
pub struct RemoveSchedule {
    check_sets: BTreeMap<usize, Vec<usize>>,
    remove_sets: Vec<usize>,
}

impl RemoveSchedule {
    /// Schedule the particles of set `set_id` to be removed at `step`.
    pub fn insert(&mut self, step: usize, set_id: usize) {
        let sets = self.check_sets.entry(step).or_default();
        if !sets.contains(&set_id) {
            sets.push(set_id);
        }
    }

    /// Take the sets due at `step`, recording them as removed.
    pub fn take_due(&mut self, step: usize) -> Vec<usize> {
        let due = self.check_sets.remove(&step).unwrap_or_default();
        self.remove_sets.extend_from_slice(&due);
        due
    }

    /// Record every set due before `step` as removed
    /// without returning them for removal.
    pub fn retire_before(&mut self, step: usize) -> Vec<usize> {
        let later = self.check_sets.split_off(&step);
        let retired: Vec<usize> = std::mem::replace(&mut self.check_sets, later)
            .into_values()
            .flatten()
            .collect();
        self.remove_sets.extend_from_slice(&retired);
        retired
    }

    /// Sets still to be removed, by step.
    pub fn check_sets(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.check_sets
    }

    /// Sets already removed.
    pub fn remove_sets(&self) -> &[usize] {
        &self.remove_sets
    }
}

//
// add particles
//

/// Periodic insertion of a particle.
///
/// A particle is due at every step `start_step + k * interval`
/// up to and including `end_step`, if given.
/// Ids are handed out consecutively from the configured first id,
/// on every rank, even though only one rank attaches the particle,
/// so all ranks agree on the next id.
#[derive(Clone, Debug)]
pub struct AddParticleSchedule<const DIM: usize> {
    start_step: usize,
    interval: usize,
    end_step: Option<usize>,
    first_id: usize,
    next_id: usize,
    material_id: usize,
    volume: f64,
    coordinates: na::SVector<f64, DIM>,
    stress: Voigt,
    velocity: na::SVector<f64, DIM>,
}

impl<const DIM: usize> AddParticleSchedule<DIM> {
    /// Build a schedule from its configuration.
    pub fn from_config(config: &AddParticlesConfig) -> Result<Self, ConfigError> {
        let vector = |field: &'static str, values: &[f64]| {
            if values.len() == DIM {
                Ok(na::SVector::<f64, DIM>::from_column_slice(values))
            } else {
                Err(ConfigError::VectorLength {
                    field,
                    expected: DIM,
                    found: values.len(),
                })
            }
        };

        if config.interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "add_particles.interval",
                value: 0.,
            });
        }
        if !(config.volume > 0.) {
            return Err(ConfigError::InvalidValue {
                field: "add_particles.volume",
                value: config.volume,
            });
        }
        let stress = match config.stress.len() {
            0 => Voigt::zeros(),
            6 => Voigt::from_column_slice(&config.stress),
            found => {
                return Err(ConfigError::VectorLength {
                    field: "add_particles.stress",
                    expected: 6,
                    found,
                })
            }
        };
        let velocity = if config.velocity.is_empty() {
            na::SVector::zeros()
        } else {
            vector("add_particles.velocity", &config.velocity)?
        };

        Ok(Self {
            start_step: config.start_step,
            interval: config.interval,
            end_step: config.end_step,
            first_id: config.first_id,
            next_id: config.first_id,
            material_id: config.material_id,
            volume: config.volume,
            coordinates: vector("add_particles.coordinates", &config.coordinates)?,
            stress,
            velocity,
        })
    }

    /// Id of the material given to new particles.
    pub fn material_id(&self) -> usize {
        self.material_id
    }

    /// Id the next particle will get.
    pub fn next_id(&self) -> usize {
        self.next_id
    }

    /// Whether a particle is added at `step`.
    pub fn is_due(&self, step: usize) -> bool {
        step >= self.start_step
            && (step - self.start_step) % self.interval == 0
            && self.end_step.map_or(true, |end| step <= end)
    }

    /// Number of steps in `0..step` at which a particle is due.
    pub fn count_due_before(&self, step: usize) -> usize {
        let last = match self.end_step {
            Some(end) => step.min(end + 1),
            None => step,
        };
        if last <= self.start_step {
            0
        } else {
            (last - 1 - self.start_step) / self.interval + 1
        }
    }

    /// Create the next particle and advance the id counter.
    pub fn next_particle(
        &mut self,
        material: Arc<dyn Material<DIM>>,
    ) -> Result<Particle<DIM>, ParticleError> {
        let mut particle = Particle::new(self.next_id, self.coordinates);
        particle.assign_volume(self.volume)?;
        particle.assign_material(material);
        particle.compute_mass()?;
        particle.assign_stress(self.stress);
        particle.assign_velocity(self.velocity);
        self.next_id += 1;
        Ok(particle)
    }

    /// Advance the id counter without creating a particle.
    pub fn skip_particle(&mut self) {
        self.next_id += 1;
    }

    /// Set the id counter to where a run starting at step 0
    /// would have it at the start of `step`.
    pub fn skip_to(&mut self, step: usize) {
        self.next_id = self.first_id + self.count_due_before(step);
    }
}
