//! Lorenz-63 state space and parameters.
//!
//! \[
//! \dot x = \sigma (y - x), \quad \dot y = x(\rho - z) - y, \quad \dot z = xy - \beta z
//! \]

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// One point `(x, y, z)` in phase space.
pub type State = [f64; 3];

/// Coordinate names, in storage order.
pub const COORDS: [&str; 3] = ["x", "y", "z"];

/// Anything that can be integrated by [`crate::simulate::simulate`] and judged by
/// [`crate::lyapunov::largest_lyapunov`].
pub trait VectorField {
    /// Time derivative at `s` (autonomous systems only).
    fn derivative(&self, s: &State) -> State;

    /// Reject malformed fields before integration starts.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

impl<F: VectorField + ?Sized> VectorField for &F {
    fn derivative(&self, s: &State) -> State {
        (**self).derivative(s)
    }

    fn validate(&self) -> Result<()> {
        (**self).validate()
    }
}

/// `(σ, ρ, β)`. Immutable once a trajectory has been produced from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub sigma: f64,
    pub rho: f64,
    pub beta: f64,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::classic()
    }
}

impl ParameterSet {
    /// Checked constructor: all three parameters must be finite.
    pub fn new(sigma: f64, rho: f64, beta: f64) -> Result<Self> {
        let p = Self { sigma, rho, beta };
        p.check()?;
        Ok(p)
    }

    /// Lorenz's original chaotic regime `(10, 28, 8/3)`.
    pub fn classic() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }

    fn check(&self) -> Result<()> {
        if !(self.sigma.is_finite() && self.rho.is_finite() && self.beta.is_finite()) {
            return Err(Error::InvalidInput("sigma, rho and beta must be finite"));
        }
        Ok(())
    }

    /// Equilibria of the field: the origin, plus `C±` when `ρ > 1` and `β > 0`.
    pub fn fixed_points(&self) -> Vec<State> {
        let mut out = vec![[0.0, 0.0, 0.0]];
        if self.rho > 1.0 && self.beta > 0.0 {
            let r = (self.beta * (self.rho - 1.0)).sqrt();
            out.push([r, r, self.rho - 1.0]);
            out.push([-r, -r, self.rho - 1.0]);
        }
        out
    }
}

impl VectorField for ParameterSet {
    #[inline]
    fn derivative(&self, s: &State) -> State {
        let [x, y, z] = *s;
        [
            self.sigma * (y - x),
            x * (self.rho - z) - y,
            x * y - self.beta * z,
        ]
    }

    fn validate(&self) -> Result<()> {
        self.check()
    }
}

#[inline]
pub(crate) fn is_finite_state(s: &State) -> bool {
    s.iter().all(|v| v.is_finite())
}

#[inline]
pub(crate) fn distance(a: &State, b: &State) -> f64 {
    let mut s = 0.0;
    for k in 0..3 {
        let d = a[k] - b[k];
        s += d * d;
    }
    s.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_points_are_stationary() {
        let p = ParameterSet::classic();
        let fps = p.fixed_points();
        assert_eq!(fps.len(), 3);
        for fp in &fps {
            let v = p.derivative(fp);
            for k in 0..3 {
                assert!(v[k].abs() < 1e-12, "derivative at {fp:?} not zero: {v:?}");
            }
        }
    }

    #[test]
    fn only_origin_below_pitchfork() {
        let p = ParameterSet::new(10.0, 0.5, 8.0 / 3.0).unwrap();
        assert_eq!(p.fixed_points(), vec![[0.0, 0.0, 0.0]]);
    }

    #[test]
    fn non_finite_parameters_are_rejected() {
        assert!(ParameterSet::new(f64::NAN, 28.0, 8.0 / 3.0).is_err());
        assert!(ParameterSet::new(10.0, f64::INFINITY, 8.0 / 3.0).is_err());
        let raw = ParameterSet {
            sigma: 10.0,
            rho: 28.0,
            beta: f64::NEG_INFINITY,
        };
        assert!(raw.validate().is_err());
    }
}
