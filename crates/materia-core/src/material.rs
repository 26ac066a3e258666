//! Constitutive models.
//!
//! Particles hold their material as an `Arc<dyn Material<DIM>>`,
//! so many particles share one instance and the model can be swapped
//! at runtime by pointing a particle at another instance.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::Voigt;

/// Named per-particle state variables of a material.
pub type StateVars = BTreeMap<String, f64>;

/// Name of the state variable holding pressure,
/// read and written by pressure smoothing.
pub const PRESSURE: &str = "pressure";

/// Error in constructing a material.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MaterialError {
    /// A constitutive parameter is out of its valid range.
    #[error("material {material}: invalid {name} {value}")]
    InvalidParameter {
        /// Id of the material.
        material: usize,
        /// Name of the parameter.
        name: &'static str,
        /// The offending value.
        value: f64,
    },
}

/// Kinematic state of the particle whose stress is being computed.
#[derive(Clone, Copy, Debug)]
pub struct ParticleContext {
    /// Id of the particle.
    pub id: usize,
    /// Current volume.
    pub volume: f64,
    /// Current mass density.
    pub mass_density: f64,
    /// Accumulated strain.
    pub strain: Voigt,
    /// Strain rate of the current step.
    pub strain_rate: Voigt,
}

/// A constitutive law.
pub trait Material<const DIM: usize>: Send + Sync + Debug {
    /// Id of this material, unique within a simulation.
    fn id(&self) -> usize;

    /// Initial mass density.
    fn density(&self) -> f64;

    /// State variables a particle starts out with when assigned this material.
    fn initialise_state_variables(&self) -> StateVars {
        StateVars::new()
    }

    /// Compute the updated stress from the current stress and a strain increment.
    fn compute_stress(
        &self,
        stress: &Voigt,
        dstrain: &Voigt,
        particle: &ParticleContext,
        state_vars: &mut StateVars,
    ) -> Voigt;
}

/// Zero the components that don't exist in `DIM` dimensions.
/// Normal stresses are kept since lower-dimensional problems are plane strain.
fn zero_out_of_plane<const DIM: usize>(mut stress: Voigt) -> Voigt {
    if DIM < 3 {
        stress[4] = 0.;
        stress[5] = 0.;
    }
    if DIM < 2 {
        stress[3] = 0.;
    }
    stress
}

fn check_positive(material: usize, name: &'static str, value: f64) -> Result<(), MaterialError> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(MaterialError::InvalidParameter {
            material,
            name,
            value,
        })
    }
}

//
// linear elastic
//

/// Isotropic linear elasticity with an incremental Hookean update.
#[derive(Clone, Debug)]
pub struct LinearElastic {
    id: usize,
    density: f64,
    youngs_modulus: f64,
    poisson_ratio: f64,
    de: na::SMatrix<f64, 6, 6>,
}

impl LinearElastic {
    /// Create a linear elastic material.
    pub fn new(
        id: usize,
        density: f64,
        youngs_modulus: f64,
        poisson_ratio: f64,
    ) -> Result<Self, MaterialError> {
        check_positive(id, "density", density)?;
        check_positive(id, "youngs_modulus", youngs_modulus)?;
        if !(poisson_ratio > -1. && poisson_ratio < 0.5) {
            return Err(MaterialError::InvalidParameter {
                material: id,
                name: "poisson_ratio",
                value: poisson_ratio,
            });
        }

        let e = youngs_modulus;
        let nu = poisson_ratio;
        let lambda = e * nu / ((1. + nu) * (1. - 2. * nu));
        let shear = e / (2. * (1. + nu));
        let mut de = na::SMatrix::<f64, 6, 6>::zeros();
        for i in 0..3 {
            for j in 0..3 {
                de[(i, j)] = lambda;
            }
            de[(i, i)] = lambda + 2. * shear;
            // shear strains are engineering strains
            de[(i + 3, i + 3)] = shear;
        }

        Ok(Self {
            id,
            density,
            youngs_modulus,
            poisson_ratio,
            de,
        })
    }

    /// Young's modulus.
    pub fn youngs_modulus(&self) -> f64 {
        self.youngs_modulus
    }

    /// Poisson's ratio.
    pub fn poisson_ratio(&self) -> f64 {
        self.poisson_ratio
    }

    /// Speed of the compression wave, which bounds the stable time step.
    pub fn p_wave_speed(&self) -> f64 {
        (self.de[(0, 0)] / self.density).sqrt()
    }
}

impl<const DIM: usize> Material<DIM> for LinearElastic {
    fn id(&self) -> usize {
        self.id
    }

    fn density(&self) -> f64 {
        self.density
    }

    fn compute_stress(
        &self,
        stress: &Voigt,
        dstrain: &Voigt,
        _particle: &ParticleContext,
        _state_vars: &mut StateVars,
    ) -> Voigt {
        zero_out_of_plane::<DIM>(stress + self.de * dstrain)
    }
}

//
// newtonian fluid
//

/// Weakly compressible Newtonian fluid.
///
/// Pressure is carried as the state variable [`PRESSURE`]
/// and evolves with the volumetric strain increment,
/// so it can be smoothed over the mesh between steps.
#[derive(Clone, Debug)]
pub struct Newtonian {
    id: usize,
    density: f64,
    bulk_modulus: f64,
    dynamic_viscosity: f64,
}

impl Newtonian {
    /// Create a Newtonian fluid.
    pub fn new(
        id: usize,
        density: f64,
        bulk_modulus: f64,
        dynamic_viscosity: f64,
    ) -> Result<Self, MaterialError> {
        check_positive(id, "density", density)?;
        check_positive(id, "bulk_modulus", bulk_modulus)?;
        if !(dynamic_viscosity >= 0. && dynamic_viscosity.is_finite()) {
            return Err(MaterialError::InvalidParameter {
                material: id,
                name: "dynamic_viscosity",
                value: dynamic_viscosity,
            });
        }
        Ok(Self {
            id,
            density,
            bulk_modulus,
            dynamic_viscosity,
        })
    }
}

impl<const DIM: usize> Material<DIM> for Newtonian {
    fn id(&self) -> usize {
        self.id
    }

    fn density(&self) -> f64 {
        self.density
    }

    fn initialise_state_variables(&self) -> StateVars {
        StateVars::from([(PRESSURE.to_string(), 0.)])
    }

    fn compute_stress(
        &self,
        _stress: &Voigt,
        dstrain: &Voigt,
        particle: &ParticleContext,
        state_vars: &mut StateVars,
    ) -> Voigt {
        let volumetric_increment = dstrain[0] + dstrain[1] + dstrain[2];
        let pressure = state_vars.entry(PRESSURE.to_string()).or_insert(0.);
        *pressure -= self.bulk_modulus * volumetric_increment;
        let pressure = *pressure;

        let rate = &particle.strain_rate;
        let mean_rate = (rate[0] + rate[1] + rate[2]) / 3.;
        let mu = self.dynamic_viscosity;
        let mut stress = Voigt::zeros();
        for i in 0..3 {
            stress[i] = -pressure + 2. * mu * (rate[i] - mean_rate);
            stress[i + 3] = mu * rate[i + 3];
        }
        zero_out_of_plane::<DIM>(stress)
    }
}

//
// configuration
//

/// Serializable description of a material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MaterialConfig {
    /// See [`LinearElastic`].
    LinearElastic {
        /// Material id.
        id: usize,
        /// Mass density.
        density: f64,
        /// Young's modulus.
        youngs_modulus: f64,
        /// Poisson's ratio.
        poisson_ratio: f64,
    },
    /// See [`Newtonian`].
    Newtonian {
        /// Material id.
        id: usize,
        /// Mass density.
        density: f64,
        /// Bulk modulus.
        bulk_modulus: f64,
        /// Dynamic viscosity.
        dynamic_viscosity: f64,
    },
}

impl MaterialConfig {
    /// Id of the described material.
    pub fn id(&self) -> usize {
        match self {
            Self::LinearElastic { id, .. } | Self::Newtonian { id, .. } => *id,
        }
    }

    /// Construct the described material.
    pub fn build<const DIM: usize>(&self) -> Result<Arc<dyn Material<DIM>>, MaterialError> {
        Ok(match *self {
            Self::LinearElastic {
                id,
                density,
                youngs_modulus,
                poisson_ratio,
            } => Arc::new(LinearElastic::new(
                id,
                density,
                youngs_modulus,
                poisson_ratio,
            )?),
            Self::Newtonian {
                id,
                density,
                bulk_modulus,
                dynamic_viscosity,
            } => Arc::new(Newtonian::new(
                id,
                density,
                bulk_modulus,
                dynamic_viscosity,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn context(strain_rate: Voigt) -> ParticleContext {
        ParticleContext {
            id: 0,
            volume: 1.,
            mass_density: 1000.,
            strain: Voigt::zeros(),
            strain_rate,
        }
    }

    #[test]
    fn linear_elastic_uniaxial_strain() {
        let mat = LinearElastic::new(0, 1000., 1.0e6, 0.25).expect("valid parameters");
        let mut dstrain = Voigt::zeros();
        dstrain[0] = 1.0e-3;
        let mut vars = StateVars::new();
        let stress =
            Material::<3>::compute_stress(&mat, &Voigt::zeros(), &dstrain, &context(dstrain), &mut vars);

        let lambda = 1.0e6 * 0.25 / (1.25 * 0.5);
        let shear = 1.0e6 / 2.5;
        assert_relative_eq!(stress[0], (lambda + 2. * shear) * 1.0e-3);
        assert_relative_eq!(stress[1], lambda * 1.0e-3);
        assert_relative_eq!(stress[2], lambda * 1.0e-3);
        assert!(
            stress.iter().skip(3).all(|s| *s == 0.),
            "uniaxial normal strain shouldn't produce shear stress, got {stress:?}"
        );
    }

    #[test]
    fn linear_elastic_shear_is_incremental() {
        let mat = LinearElastic::new(0, 1000., 1.0e6, 0.0).expect("valid parameters");
        let mut dstrain = Voigt::zeros();
        dstrain[3] = 2.0e-3;
        let mut vars = StateVars::new();
        let ctx = context(dstrain);
        let once = Material::<2>::compute_stress(&mat, &Voigt::zeros(), &dstrain, &ctx, &mut vars);
        let twice = Material::<2>::compute_stress(&mat, &once, &dstrain, &ctx, &mut vars);
        assert_relative_eq!(once[3], 0.5e6 * 2.0e-3);
        assert_relative_eq!(twice[3], 2. * once[3]);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert_eq!(
            LinearElastic::new(7, 1000., 1.0e6, 0.5).err(),
            Some(MaterialError::InvalidParameter {
                material: 7,
                name: "poisson_ratio",
                value: 0.5
            })
        );
        assert!(LinearElastic::new(0, -1., 1.0e6, 0.3).is_err());
        assert!(Newtonian::new(0, 1000., 0., 1.0e-3).is_err());
    }

    #[test]
    fn newtonian_pressure_tracks_compression() {
        let mat = Newtonian::new(1, 1000., 2.0e6, 0.).expect("valid parameters");
        let mut vars = Material::<2>::initialise_state_variables(&mat);
        assert_eq!(vars.get(PRESSURE), Some(&0.));

        let mut dstrain = Voigt::zeros();
        dstrain[0] = -1.0e-4;
        dstrain[1] = -1.0e-4;
        let stress =
            Material::<2>::compute_stress(&mat, &Voigt::zeros(), &dstrain, &context(dstrain), &mut vars);
        assert_relative_eq!(vars[PRESSURE], 400.);
        // inviscid, so stress is pure pressure
        for i in 0..3 {
            assert_relative_eq!(stress[i], -400.);
        }
    }

    #[test]
    fn config_builds_materials() {
        let json = r#"[
            {"type": "LinearElastic", "id": 0, "density": 1800.0,
             "youngs_modulus": 1.0e7, "poisson_ratio": 0.3},
            {"type": "Newtonian", "id": 3, "density": 1000.0,
             "bulk_modulus": 2.0e9, "dynamic_viscosity": 1.0e-3}
        ]"#;
        let configs: Vec<MaterialConfig> = serde_json::from_str(json).expect("valid json");
        assert_eq!(configs.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![0, 3]);
        for config in &configs {
            let mat = config.build::<2>().expect("valid material");
            assert_eq!(mat.id(), config.id());
        }
        let fluid = configs[1].build::<2>().expect("valid material");
        assert!(fluid.initialise_state_variables().contains_key(PRESSURE));
    }
}
