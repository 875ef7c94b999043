//! Pipeline configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration:
//!
//! ```toml
//! ensemble_size = 50
//! seed = 7
//!
//! [simulation]
//! dt = 0.01
//! length = 100
//! burn_in = 500
//!
//! [gan]
//! steps = 2000
//! lr = 4e-4
//!
//! [gan.generator]
//! length = 100
//!
//! [gan.discriminator]
//! length = 100
//! ```

use crate::gan::GanConfig;
use crate::lorenz::ParameterSet;
use crate::metrics::EvaluationConfig;
use crate::simulate::{InitialConditionBox, SimulationConfig};
use crate::sindy::IdentifyConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Lorenz parameters used to produce the training ensemble.
    pub parameters: ParameterSet,
    /// Number of ground-truth trajectories.
    pub ensemble_size: usize,
    /// Seed for the ground-truth ensemble.
    pub seed: u64,
    /// Maximum monomial degree for the sparse identifier's library.
    pub library_degree: u8,
    pub simulation: SimulationConfig,
    pub bounds: InitialConditionBox,
    pub gan: GanConfig,
    pub identify: IdentifyConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parameters: ParameterSet::classic(),
            ensemble_size: 50,
            seed: 0,
            library_degree: 2,
            simulation: SimulationConfig::default(),
            bounds: InitialConditionBox::default(),
            gan: GanConfig::default(),
            identify: IdentifyConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

fn section(name: &str, r: Result<()>) -> Result<()> {
    r.map_err(|e| Error::Config(format!("[{name}] {e}")))
}

impl PipelineConfig {
    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check each section, then the cross-section constraints.
    pub fn validate(&self) -> Result<()> {
        section(
            "parameters",
            ParameterSet::new(self.parameters.sigma, self.parameters.rho, self.parameters.beta)
                .map(|_| ()),
        )?;
        section("simulation", self.simulation.validate())?;
        section("bounds", self.bounds.validate())?;
        section("gan", self.gan.validate())?;
        section("identify", self.identify.validate())?;
        section("evaluation", self.evaluation.validate())?;

        if self.ensemble_size == 0 {
            return Err(Error::Config("ensemble_size must be >= 1".to_string()));
        }
        if self.library_degree == 0 {
            return Err(Error::Config("library_degree must be >= 1".to_string()));
        }
        if self.gan.generator.length != self.simulation.length {
            return Err(Error::Config(format!(
                "gan.generator.length ({}) must equal simulation.length ({})",
                self.gan.generator.length, self.simulation.length
            )));
        }
        if self.evaluation.sample_dt != self.simulation.dt {
            return Err(Error::Config(format!(
                "evaluation.sample_dt ({}) must equal simulation.dt ({})",
                self.evaluation.sample_dt, self.simulation.dt
            )));
        }
        Ok(())
    }
}
