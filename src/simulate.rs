//! Ground-truth trajectories.
//!
//! Integration is fixed-step and deterministic: identical `(field, x0, config)` reproduce
//! bit-identical output. Random ensembles derive one RNG stream per trajectory index, so the
//! result does not depend on how `rayon` schedules the work.

use crate::lorenz::{is_finite_state, State, VectorField};
use crate::ode::{self, OdeMethod};
use crate::trajectory::Trajectory;
use crate::{Error, Result};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Sampling interval between stored states.
    pub dt: f64,
    /// Trajectory length `L` (including the initial condition).
    pub length: usize,
    /// Integrator.
    pub method: OdeMethod,
    /// Integrator steps per stored sample (internal step is `dt / substeps`).
    pub substeps: usize,
    /// Samples discarded before the stored trajectory starts (ensembles only).
    pub burn_in: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            length: 100,
            method: OdeMethod::Rk4,
            substeps: 1,
            burn_in: 0,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(Error::InvalidInput("dt must be positive and finite"));
        }
        if self.length < 2 {
            return Err(Error::InvalidInput("trajectory length must be >= 2"));
        }
        if self.substeps == 0 {
            return Err(Error::InvalidInput("substeps must be >= 1"));
        }
        Ok(())
    }
}

/// Integrate `field` from `x0`, storing `cfg.length` samples spaced `cfg.dt` apart.
///
/// Row 0 is `x0` exactly. `cfg.burn_in` is ignored here (see [`simulate_ensemble`]).
pub fn simulate<F: VectorField + ?Sized>(
    field: &F,
    x0: &State,
    cfg: &SimulationConfig,
) -> Result<Trajectory> {
    cfg.validate()?;
    field.validate()?;
    if !is_finite_state(x0) {
        return Err(Error::InvalidInput("initial condition must be finite"));
    }

    let h = cfg.dt / cfg.substeps as f64;
    let mut states = Array2::<f64>::zeros((cfg.length, 3));
    for k in 0..3 {
        states[[0, k]] = x0[k];
    }

    let mut f = |s: &State| field.derivative(s);
    let mut x = *x0;
    for i in 1..cfg.length {
        for _ in 0..cfg.substeps {
            x = ode::step(cfg.method, &x, h, &mut f);
        }
        if !is_finite_state(&x) {
            let partial = Trajectory::from_array(states)?.prefix(i);
            return Err(Error::Diverged { step: i, partial });
        }
        for k in 0..3 {
            states[[i, k]] = x[k];
        }
    }

    Trajectory::from_array(states)
}

/// Axis-aligned box initial conditions are drawn from (uniformly, per coordinate).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialConditionBox {
    pub lo: State,
    pub hi: State,
}

impl Default for InitialConditionBox {
    fn default() -> Self {
        Self {
            lo: [-15.0, -20.0, 5.0],
            hi: [15.0, 20.0, 40.0],
        }
    }
}

impl InitialConditionBox {
    pub fn validate(&self) -> Result<()> {
        for k in 0..3 {
            if !self.lo[k].is_finite() || !self.hi[k].is_finite() {
                return Err(Error::InvalidInput("initial-condition box must be finite"));
            }
            if self.lo[k] > self.hi[k] {
                return Err(Error::InvalidInput("initial-condition box has lo > hi"));
            }
        }
        Ok(())
    }

    pub fn sample(&self, rng: &mut impl Rng) -> State {
        let mut s = [0.0; 3];
        for k in 0..3 {
            s[k] = rng.random_range(self.lo[k]..=self.hi[k]);
        }
        s
    }
}

/// Simulate `n` trajectories from initial conditions drawn in `bounds`.
///
/// Each draw is advanced `cfg.burn_in` samples before the stored trajectory starts, so the
/// stored initial condition is the post-transient state.
pub fn simulate_ensemble<F: VectorField + Sync + ?Sized>(
    field: &F,
    bounds: &InitialConditionBox,
    n: usize,
    cfg: &SimulationConfig,
    seed: u64,
) -> Result<Vec<Trajectory>> {
    cfg.validate()?;
    field.validate()?;
    bounds.validate()?;
    if n == 0 {
        return Err(Error::InvalidInput("ensemble size must be >= 1"));
    }

    let h = cfg.dt / cfg.substeps as f64;
    (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(i as u64);
            let drawn = bounds.sample(&mut rng);
            let x0 = ode::integrate_fixed(cfg.method, &drawn, h, cfg.burn_in * cfg.substeps, |s| {
                field.derivative(s)
            });
            if !is_finite_state(&x0) {
                return Err(Error::Diverged {
                    step: 0,
                    partial: Trajectory::from_states(&[drawn])?,
                });
            }
            simulate(field, &x0, cfg)
        })
        .collect()
}
