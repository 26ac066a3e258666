//! JSON description of an analysis.
//!
//! The configuration names the analysis scheme and time stepping,
//! the materials and sets, the boundary conditions on those sets
//! and the events that change the particle population during the run.
//! Mesh geometry and the initial particles are built separately,
//! see [`Mesh`][crate::Mesh] and the [`gmsh`][crate::gmsh] module.
//!
//! ```
//! # use materia_core::config::SimulationConfig;
//! let config = SimulationConfig::from_json_str(r#"{
//!     "analysis": {
//!         "type": "MPMExplicitUSF2D",
//!         "dt": 1.0e-4,
//!         "nsteps": 100,
//!         "gravity": [0.0, -9.81]
//!     },
//!     "materials": [
//!         {"type": "LinearElastic", "id": 0, "density": 1800.0,
//!          "youngs_modulus": 1.0e7, "poisson_ratio": 0.3}
//!     ],
//!     "particle_properties": [{"material_id": 0}]
//! }"#)?;
//! assert_eq!(config.analysis.nsteps, 100);
//! # Ok::<(), materia_core::ConfigError>(())
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    material::{MaterialConfig, MaterialError},
    solver::Scheme,
};

/// Error in a simulation configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The JSON is malformed or doesn't match the expected structure.
    #[error("invalid configuration JSON")]
    Json(#[from] serde_json::Error),
    /// The analysis type isn't recognised.
    #[error("unknown analysis type {0:?}")]
    UnknownAnalysisType(String),
    /// The analysis is for a different dimension than the mesh.
    #[error("analysis is {analysis}D but the mesh is {mesh}D")]
    DimensionMismatch {
        /// Dimension named by the analysis type.
        analysis: usize,
        /// Dimension of the mesh.
        mesh: usize,
    },
    /// A vector has the wrong number of components.
    #[error("{field}: expected {expected} components, found {found}")]
    VectorLength {
        /// Name of the field.
        field: &'static str,
        /// Required length.
        expected: usize,
        /// Given length.
        found: usize,
    },
    /// A value is out of its valid range.
    #[error("{field}: invalid value {value}")]
    InvalidValue {
        /// Name of the field.
        field: &'static str,
        /// The offending value.
        value: f64,
    },
    /// A direction is not less than the mesh dimension.
    #[error("invalid direction {dir}")]
    InvalidDirection {
        /// The direction.
        dir: usize,
    },
    /// Two materials share an id.
    #[error("duplicate material id {material}")]
    DuplicateMaterial {
        /// The shared id.
        material: usize,
    },
    /// A material id refers to no configured material.
    #[error("unknown material id {material}")]
    UnknownMaterial {
        /// The material id.
        material: usize,
    },
    /// A particle set id refers to no set.
    #[error("unknown particle set {set}")]
    UnknownParticleSet {
        /// The set id.
        set: usize,
    },
    /// Resuming was requested but there is nothing to resume from.
    #[error("no checkpoint to resume from at step {step}")]
    MissingCheckpoint {
        /// The requested resume step.
        step: usize,
    },
    /// A material has invalid parameters.
    #[error(transparent)]
    Material(#[from] MaterialError),
}

/// The whole analysis description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Scheme, time stepping and population events.
    pub analysis: AnalysisConfig,
    /// Materials by id.
    #[serde(default)]
    pub materials: Vec<MaterialConfig>,
    /// Particle sets by id.
    #[serde(default)]
    pub particle_sets: Vec<SetConfig>,
    /// Node sets by id, in addition to any from the mesh file.
    #[serde(default)]
    pub node_sets: Vec<SetConfig>,
    /// Initial material assignments.
    #[serde(default)]
    pub particle_properties: Vec<ParticlePropertiesConfig>,
    /// Prescribed nodal velocities.
    #[serde(default)]
    pub velocity_constraints: Vec<VelocityConstraintConfig>,
    /// Concentrated nodal forces.
    #[serde(default)]
    pub nodal_tractions: Vec<NodalTractionConfig>,
    /// Tractions on particles.
    #[serde(default)]
    pub particle_tractions: Vec<ParticleTractionConfig>,
}

/// Scheme, time stepping and population events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Analysis type, e.g. `MPMExplicitUSF2D` or `MPMExplicitUSL3D`.
    #[serde(rename = "type")]
    pub analysis_type: String,
    /// Time step size.
    pub dt: f64,
    /// Number of steps to run, counted from step 0.
    pub nsteps: usize,
    /// Output is written every `output_steps` steps.
    #[serde(default = "default_output_steps")]
    pub output_steps: usize,
    /// Gravitational acceleration. Empty means none.
    #[serde(default)]
    pub gravity: Vec<f64>,
    /// Set particle velocity to the interpolated nodal velocity
    /// instead of integrating nodal acceleration.
    #[serde(default)]
    pub velocity_update: bool,
    /// Smooth pressure over the mesh before computing stress.
    #[serde(default)]
    pub pressure_smoothing: bool,
    /// Compute particle strain energy every step.
    #[serde(default)]
    pub strain_energy: bool,
    /// Force Newton inversion of local coordinates on or off.
    #[serde(default)]
    pub isoparametric: Option<bool>,
    /// Resume from a checkpoint.
    #[serde(default)]
    pub resume: Option<ResumeConfig>,
    /// Periodic particle insertion.
    #[serde(default)]
    pub add_particles: Option<AddParticlesConfig>,
    /// Material changes of particle sets.
    #[serde(default)]
    pub change_materials: Vec<ChangeMaterialConfig>,
    /// Removal of particle sets.
    #[serde(default)]
    pub remove_particles: Vec<RemoveParticlesConfig>,
}

fn default_output_steps() -> usize {
    100
}

/// Where to resume a run from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Whether to resume at all.
    pub resume: bool,
    /// The step to resume at, as recorded in the checkpoint.
    pub step: usize,
}

/// Periodic particle insertion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddParticlesConfig {
    /// First step at which a particle is added.
    pub start_step: usize,
    /// Steps between additions.
    pub interval: usize,
    /// Last step at which a particle may be added.
    #[serde(default)]
    pub end_step: Option<usize>,
    /// Id of the first added particle.
    pub first_id: usize,
    /// Material of added particles.
    pub material_id: usize,
    /// Volume of each added particle.
    pub volume: f64,
    /// Where particles are added.
    pub coordinates: Vec<f64>,
    /// Initial stress in Voigt order. Empty means zero.
    #[serde(default)]
    pub stress: Vec<f64>,
    /// Initial velocity. Empty means zero.
    #[serde(default)]
    pub velocity: Vec<f64>,
}

/// Reassignment of a particle set's material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMaterialConfig {
    /// Step at which the material changes.
    pub step: usize,
    /// The particle set.
    pub set_id: usize,
    /// The new material.
    pub material_id: usize,
}

/// Removal of a particle set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveParticlesConfig {
    /// Step at which the particles are removed.
    pub step: usize,
    /// The particle set.
    pub set_id: usize,
}

/// A set of particle or node ids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfig {
    /// Id of the set.
    pub id: usize,
    /// Members of the set.
    pub ids: Vec<usize>,
}

/// Initial material of a particle set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticlePropertiesConfig {
    /// The particle set, or every particle if absent.
    #[serde(default)]
    pub set_id: Option<usize>,
    /// The material.
    pub material_id: usize,
}

/// A prescribed velocity component on a node set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VelocityConstraintConfig {
    /// The node set.
    pub set_id: usize,
    /// Direction of the component.
    pub dir: usize,
    /// Prescribed velocity.
    pub velocity: f64,
}

/// A concentrated force component on a node set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodalTractionConfig {
    /// The node set.
    pub set_id: usize,
    /// Direction of the component.
    pub dir: usize,
    /// Force on every node of the set.
    pub force: f64,
}

/// A traction component on a particle set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleTractionConfig {
    /// The particle set.
    pub set_id: usize,
    /// Direction of the component.
    pub dir: usize,
    /// Traction on every particle of the set.
    pub traction: f64,
}

/// Split an analysis type like `MPMExplicitUSL3D` into its scheme and dimension.
pub fn parse_analysis_type(analysis_type: &str) -> Result<(Scheme, usize), ConfigError> {
    let unknown = || ConfigError::UnknownAnalysisType(analysis_type.to_string());
    let rest = analysis_type
        .strip_prefix("MPMExplicit")
        .ok_or_else(unknown)?;
    let (scheme, dim) = if let Some(dim) = rest.strip_prefix("USF") {
        (Scheme::Usf, dim)
    } else if let Some(dim) = rest.strip_prefix("USL") {
        (Scheme::Usl, dim)
    } else {
        return Err(unknown());
    };
    let dim: usize = dim
        .strip_suffix('D')
        .and_then(|d| d.parse().ok())
        .filter(|d| (1..=3).contains(d))
        .ok_or_else(unknown)?;
    Ok((scheme, dim))
}

impl SimulationConfig {
    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check everything that can be checked without a mesh,
    /// returning the scheme of the analysis.
    pub fn validate<const DIM: usize>(&self) -> Result<Scheme, ConfigError> {
        let analysis = &self.analysis;
        let (scheme, dim) = parse_analysis_type(&analysis.analysis_type)?;
        if dim != DIM {
            return Err(ConfigError::DimensionMismatch {
                analysis: dim,
                mesh: DIM,
            });
        }
        if !(analysis.dt > 0. && analysis.dt.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field: "analysis.dt",
                value: analysis.dt,
            });
        }
        if analysis.output_steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "analysis.output_steps",
                value: 0.,
            });
        }
        if !analysis.gravity.is_empty() && analysis.gravity.len() != DIM {
            return Err(ConfigError::VectorLength {
                field: "analysis.gravity",
                expected: DIM,
                found: analysis.gravity.len(),
            });
        }

        let mut material_ids = BTreeSet::new();
        for material in &self.materials {
            if !material_ids.insert(material.id()) {
                return Err(ConfigError::DuplicateMaterial {
                    material: material.id(),
                });
            }
            material.build::<DIM>()?;
        }
        let check_material = |material: usize| {
            if material_ids.contains(&material) {
                Ok(())
            } else {
                Err(ConfigError::UnknownMaterial { material })
            }
        };
        for props in &self.particle_properties {
            check_material(props.material_id)?;
        }
        for change in &analysis.change_materials {
            check_material(change.material_id)?;
        }
        if let Some(add) = &analysis.add_particles {
            check_material(add.material_id)?;
            // full validation happens when the schedule is built
            crate::schedule::AddParticleSchedule::<DIM>::from_config(add)?;
        }

        let dirs = self
            .velocity_constraints
            .iter()
            .map(|c| c.dir)
            .chain(self.nodal_tractions.iter().map(|t| t.dir))
            .chain(self.particle_tractions.iter().map(|t| t.dir));
        for dir in dirs {
            if dir >= DIM {
                return Err(ConfigError::InvalidDirection { dir });
            }
        }

        Ok(scheme)
    }

    /// Gravity as a vector, zero if not given.
    ///
    /// Assumes the configuration has been validated.
    pub fn gravity<const DIM: usize>(&self) -> nalgebra::SVector<f64, DIM> {
        if self.analysis.gravity.len() == DIM {
            nalgebra::SVector::from_column_slice(&self.analysis.gravity)
        } else {
            nalgebra::SVector::zeros()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
        "analysis": {
            "type": "MPMExplicitUSL2D",
            "dt": 0.001,
            "nsteps": 10,
            "output_steps": 5,
            "gravity": [0.0, -9.81],
            "velocity_update": true,
            "resume": {"resume": true, "step": 5},
            "change_materials": [{"step": 3, "set_id": 1, "material_id": 1}],
            "remove_particles": [{"step": 4, "set_id": 2}],
            "add_particles": {
                "start_step": 0, "interval": 2, "first_id": 1000,
                "material_id": 0, "volume": 0.01, "coordinates": [0.5, 0.5]
            }
        },
        "materials": [
            {"type": "LinearElastic", "id": 0, "density": 1800.0,
             "youngs_modulus": 1.0e7, "poisson_ratio": 0.3},
            {"type": "Newtonian", "id": 1, "density": 1000.0,
             "bulk_modulus": 2.0e6, "dynamic_viscosity": 1.0e-3}
        ],
        "particle_sets": [{"id": 1, "ids": [0, 1]}, {"id": 2, "ids": [2]}],
        "node_sets": [{"id": 0, "ids": [0, 1, 2]}],
        "particle_properties": [{"material_id": 0}],
        "velocity_constraints": [{"set_id": 0, "dir": 1, "velocity": 0.0}]
    }"#;

    #[test]
    fn parse_full_config() {
        let config = SimulationConfig::from_json_str(BASE).expect("valid json");
        assert_eq!(config.validate::<2>().expect("valid config"), Scheme::Usl);
        assert_eq!(config.analysis.output_steps, 5);
        assert_eq!(
            config.analysis.resume,
            Some(ResumeConfig {
                resume: true,
                step: 5
            })
        );
        assert_eq!(config.particle_properties[0].set_id, None);
        assert_eq!(config.gravity::<2>(), nalgebra::Vector2::new(0., -9.81));
        assert!(!config.analysis.pressure_smoothing);
    }

    #[test]
    fn analysis_types() {
        assert!(matches!(
            parse_analysis_type("MPMExplicitUSF3D"),
            Ok((Scheme::Usf, 3))
        ));
        assert!(matches!(
            parse_analysis_type("MPMExplicitUSL1D"),
            Ok((Scheme::Usl, 1))
        ));
        for bad in ["MPMExplicitUSF4D", "MPMImplicitUSF2D", "MPMExplicitMUSL2D", "MPMExplicitUSL"] {
            assert!(
                matches!(parse_analysis_type(bad), Err(ConfigError::UnknownAnalysisType(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn validation_errors() {
        let config = SimulationConfig::from_json_str(BASE).expect("valid json");
        assert!(matches!(
            config.validate::<3>(),
            Err(ConfigError::DimensionMismatch {
                analysis: 2,
                mesh: 3
            })
        ));

        let mut bad_dt = config.clone();
        bad_dt.analysis.dt = 0.;
        assert!(matches!(
            bad_dt.validate::<2>(),
            Err(ConfigError::InvalidValue {
                field: "analysis.dt",
                ..
            })
        ));

        let mut bad_gravity = config.clone();
        bad_gravity.analysis.gravity = vec![0., 0., -9.81];
        assert!(matches!(
            bad_gravity.validate::<2>(),
            Err(ConfigError::VectorLength { found: 3, .. })
        ));

        let mut unknown_material = config.clone();
        unknown_material.analysis.change_materials[0].material_id = 7;
        assert!(matches!(
            unknown_material.validate::<2>(),
            Err(ConfigError::UnknownMaterial { material: 7 })
        ));

        let mut bad_dir = config.clone();
        bad_dir.velocity_constraints[0].dir = 2;
        assert!(matches!(
            bad_dir.validate::<2>(),
            Err(ConfigError::InvalidDirection { dir: 2 })
        ));

        let mut duplicate = config;
        duplicate.materials.push(duplicate.materials[0].clone());
        assert!(matches!(
            duplicate.validate::<2>(),
            Err(ConfigError::DuplicateMaterial { material: 0 })
        ));

        assert!(matches!(
            SimulationConfig::from_json_str("{\"analysis\": {}}"),
            Err(ConfigError::Json(_))
        ));
    }
}
