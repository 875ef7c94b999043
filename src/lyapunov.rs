//! Largest Lyapunov exponent by twin-trajectory renormalization (Benettin et al.).
//!
//! A reference trajectory and a twin displaced by `d0` are integrated side by side. Every
//! `renorm_interval` steps the separation `δ` is measured, `ln(δ / d0)` is accumulated, and the
//! twin is pulled back to distance `d0` along the current separation direction. The exponent is
//! the accumulated log-growth divided by elapsed time.
//!
//! Numerical trouble (separation collapsing to zero, blowing up, or going non-finite) stops the
//! run early and is reported in [`NumericalStatus`] alongside the partial estimate.

use crate::lorenz::{distance, is_finite_state, State, VectorField};
use crate::ode::{self, OdeMethod};
use crate::trajectory::Trajectory;
use crate::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Separations above this are treated as overflow (the twin has left the neighbourhood).
const OVERFLOW_SEPARATION: f64 = 1e100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyapunovConfig {
    pub dt: f64,
    pub method: OdeMethod,
    /// Steps integrated (reference only) before measuring.
    pub transient_steps: usize,
    /// Steps between renormalizations.
    pub renorm_interval: usize,
    /// Number of renormalizations (the measurement budget).
    pub renormalizations: usize,
    /// Initial and renormalized separation.
    pub d0: f64,
}

impl Default for LyapunovConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            method: OdeMethod::Rk4,
            transient_steps: 1_000,
            renorm_interval: 10,
            renormalizations: 2_000,
            d0: 1e-8,
        }
    }
}

impl LyapunovConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(Error::InvalidInput("dt must be positive and finite"));
        }
        if self.renorm_interval == 0 || self.renormalizations == 0 {
            return Err(Error::InvalidInput("renorm_interval and renormalizations must be >= 1"));
        }
        if !(self.d0 > 0.0) || !self.d0.is_finite() {
            return Err(Error::InvalidInput("d0 must be positive and finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericalStatus {
    Stable,
    /// Separation collapsed to zero at renormalization `at`.
    Underflow { at: usize },
    /// Separation exceeded the overflow bound at renormalization `at`.
    Overflow { at: usize },
    /// A state went non-finite at renormalization `at` (0 also covers the transient).
    NonFinite { at: usize },
}

impl NumericalStatus {
    pub fn is_stable(&self) -> bool {
        matches!(self, NumericalStatus::Stable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovEstimate {
    /// Exponent over the completed renormalizations (NaN if none completed).
    pub exponent: f64,
    /// Running estimate after each renormalization.
    pub history: Vec<f64>,
    pub status: NumericalStatus,
    /// Completed renormalizations.
    pub renormalizations: usize,
}

fn advance<F: VectorField + ?Sized>(
    field: &F,
    cfg: &LyapunovConfig,
    x: &State,
    steps: usize,
) -> State {
    ode::integrate_fixed(cfg.method, x, cfg.dt, steps, |s| field.derivative(s))
}

/// Largest Lyapunov exponent of `field` starting from `x0`.
pub fn largest_lyapunov<F: VectorField + ?Sized>(
    field: &F,
    x0: &State,
    cfg: &LyapunovConfig,
) -> Result<LyapunovEstimate> {
    cfg.validate()?;
    field.validate()?;
    if !is_finite_state(x0) {
        return Err(Error::InvalidInput("initial condition must be finite"));
    }

    let mut history = Vec::with_capacity(cfg.renormalizations);
    let mut x = advance(field, cfg, x0, cfg.transient_steps);
    if !is_finite_state(&x) {
        return Ok(LyapunovEstimate {
            exponent: f64::NAN,
            history,
            status: NumericalStatus::NonFinite { at: 0 },
            renormalizations: 0,
        });
    }

    let dir = 1.0 / 3f64.sqrt();
    let mut y = [x[0] + cfg.d0 * dir, x[1] + cfg.d0 * dir, x[2] + cfg.d0 * dir];
    let span = cfg.renorm_interval as f64 * cfg.dt;
    let mut log_sum = 0.0;
    let mut status = NumericalStatus::Stable;
    let mut done = 0;

    for r in 0..cfg.renormalizations {
        x = advance(field, cfg, &x, cfg.renorm_interval);
        y = advance(field, cfg, &y, cfg.renorm_interval);
        if !is_finite_state(&x) || !is_finite_state(&y) {
            status = NumericalStatus::NonFinite { at: r };
            break;
        }
        let delta = distance(&x, &y);
        if !delta.is_finite() {
            status = NumericalStatus::NonFinite { at: r };
            break;
        }
        if delta < f64::MIN_POSITIVE {
            status = NumericalStatus::Underflow { at: r };
            break;
        }
        if delta > OVERFLOW_SEPARATION {
            status = NumericalStatus::Overflow { at: r };
            break;
        }

        log_sum += (delta / cfg.d0).ln();
        done += 1;
        history.push(log_sum / (done as f64 * span));

        let s = cfg.d0 / delta;
        for k in 0..3 {
            y[k] = x[k] + (y[k] - x[k]) * s;
        }
    }

    let exponent = if done > 0 {
        log_sum / (done as f64 * span)
    } else {
        f64::NAN
    };
    if !status.is_stable() {
        warn!(?status, renormalizations = done, "lyapunov estimate stopped early");
    }
    debug!(exponent, renormalizations = done, "lyapunov estimate");

    Ok(LyapunovEstimate {
        exponent,
        history,
        status,
        renormalizations: done,
    })
}

/// Lyapunov estimates anchored at the final state of each trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleLyapunov {
    /// Mean over the anchors that finished stably; `None` if none did.
    pub mean: Option<f64>,
    /// Population standard deviation over the same anchors.
    pub std: f64,
    /// Exponents of the stable anchors, in input order.
    pub exponents: Vec<f64>,
    /// Anchors excluded because of numerical trouble.
    pub failed: usize,
}

pub fn ensemble_lyapunov<F: VectorField + Sync + ?Sized>(
    field: &F,
    trajectories: &[Trajectory],
    cfg: &LyapunovConfig,
) -> Result<EnsembleLyapunov> {
    cfg.validate()?;
    field.validate()?;
    if trajectories.is_empty() {
        return Err(Error::InvalidInput("need at least one trajectory"));
    }

    let results: Vec<Option<f64>> = trajectories
        .par_iter()
        .map(|t| {
            let anchor = t.last();
            match largest_lyapunov(field, &anchor, cfg) {
                Ok(est) if est.status.is_stable() && est.exponent.is_finite() => Some(est.exponent),
                _ => None,
            }
        })
        .collect();

    let exponents: Vec<f64> = results.iter().flatten().copied().collect();
    let failed = results.len() - exponents.len();
    if failed > 0 {
        warn!(failed, total = results.len(), "lyapunov anchors excluded");
    }
    let (mean, std) = if exponents.is_empty() {
        (None, f64::NAN)
    } else {
        let n = exponents.len() as f64;
        let m = exponents.iter().sum::<f64>() / n;
        let v = exponents.iter().map(|e| (e - m).powi(2)).sum::<f64>() / n;
        (Some(m), v.sqrt())
    };

    Ok(EnsembleLyapunov {
        mean,
        std,
        exponents,
        failed,
    })
}
