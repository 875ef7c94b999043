//! Sparse identification of the governing equations.
//!
//! Given sampled trajectories, estimate time derivatives by finite differences, evaluate a
//! candidate library of monomials `x^a y^b z^c` at every sample, and solve `Θ ξ_k ≈ ẋ_k` for each
//! coordinate `k` with sequentially thresholded least squares (STLSQ):
//!
//! 1. solve on the full library,
//! 2. zero every coefficient with `|ξ| < threshold`,
//! 3. re-solve on the surviving terms, and repeat until the support stops changing.
//!
//! Least squares goes through an SVD of the column-scaled library matrix (`nalgebra`), so
//! rank-deficient data still yields the minimum-norm solution. Poor conditioning and
//! non-convergence are reported in [`FitDiagnostics`], not raised as errors.

use crate::lorenz::{ParameterSet, State, VectorField, COORDS};
use crate::trajectory::Trajectory;
use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// `x^a y^b z^c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Monomial {
    pub powers: [u8; 3],
}

impl Monomial {
    pub const fn new(a: u8, b: u8, c: u8) -> Self {
        Self { powers: [a, b, c] }
    }

    pub fn degree(&self) -> u32 {
        self.powers.iter().map(|&p| p as u32).sum()
    }

    #[inline]
    pub fn eval(&self, s: &State) -> f64 {
        let mut v = 1.0;
        for k in 0..3 {
            v *= s[k].powi(self.powers[k] as i32);
        }
        v
    }
}

impl fmt::Display for Monomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.degree() == 0 {
            return f.write_str("1");
        }
        let mut first = true;
        for k in 0..3 {
            let p = self.powers[k];
            if p == 0 {
                continue;
            }
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            if p == 1 {
                write!(f, "{}", COORDS[k])?;
            } else {
                write!(f, "{}^{}", COORDS[k], p)?;
            }
        }
        Ok(())
    }
}

/// Ordered candidate terms, fixed for one fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisLibrary {
    terms: Vec<Monomial>,
}

impl BasisLibrary {
    /// All monomials up to `max_degree`, ordered by degree, then `x` before `y` before `z`.
    ///
    /// Degree 2 gives `1, x, y, z, x^2, x y, x z, y^2, y z, z^2`.
    pub fn polynomial(max_degree: u8) -> Result<Self> {
        if max_degree > 6 {
            return Err(Error::InvalidInput("polynomial library degree must be <= 6"));
        }
        let mut terms = Vec::new();
        for d in 0..=max_degree {
            for a in (0..=d).rev() {
                for b in (0..=d - a).rev() {
                    terms.push(Monomial::new(a, b, d - a - b));
                }
            }
        }
        Ok(Self { terms })
    }

    pub fn from_terms(terms: Vec<Monomial>) -> Result<Self> {
        if terms.is_empty() {
            return Err(Error::InvalidInput("library must contain at least one term"));
        }
        for (i, t) in terms.iter().enumerate() {
            if terms[..i].contains(t) {
                return Err(Error::InvalidInput("library terms must be distinct"));
            }
        }
        Ok(Self { terms })
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[Monomial] {
        &self.terms
    }

    pub fn names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.to_string()).collect()
    }

    pub fn index_of(&self, term: Monomial) -> Option<usize> {
        self.terms.iter().position(|&t| t == term)
    }

    /// `Θ`: one row per state, one column per term.
    pub fn matrix(&self, trajectory: &Trajectory) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((trajectory.len(), self.len()));
        for i in 0..trajectory.len() {
            let s = trajectory.state(i);
            for (j, t) in self.terms.iter().enumerate() {
                out[[i, j]] = t.eval(&s);
            }
        }
        out
    }
}

/// Finite-difference scheme for derivative estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Differentiation {
    /// Second-order central differences (needs 3 samples).
    CentralDifference,
    /// Fourth-order five-point stencil (needs 5 samples).
    #[default]
    FivePoint,
}

impl Differentiation {
    fn min_samples(self) -> usize {
        match self {
            Differentiation::CentralDifference => 3,
            Differentiation::FivePoint => 5,
        }
    }
}

/// Estimate `dx/dt` at every sample. Boundaries use one-sided stencils of the same order.
pub fn estimate_derivatives(
    trajectory: &Trajectory,
    dt: f64,
    method: Differentiation,
) -> Result<Array2<f64>> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(Error::InvalidInput("dt must be positive and finite"));
    }
    let n = trajectory.len();
    if n < method.min_samples() {
        return Err(Error::InvalidInput("trajectory too short for the derivative stencil"));
    }
    let x = trajectory.view();
    let mut d = Array2::<f64>::zeros((n, 3));
    for k in 0..3 {
        let c = x.column(k);
        match method {
            Differentiation::CentralDifference => {
                let h2 = 2.0 * dt;
                d[[0, k]] = (-3.0 * c[0] + 4.0 * c[1] - c[2]) / h2;
                for i in 1..n - 1 {
                    d[[i, k]] = (c[i + 1] - c[i - 1]) / h2;
                }
                d[[n - 1, k]] = (3.0 * c[n - 1] - 4.0 * c[n - 2] + c[n - 3]) / h2;
            }
            Differentiation::FivePoint => {
                let h12 = 12.0 * dt;
                d[[0, k]] =
                    (-25.0 * c[0] + 48.0 * c[1] - 36.0 * c[2] + 16.0 * c[3] - 3.0 * c[4]) / h12;
                d[[1, k]] = (-3.0 * c[0] - 10.0 * c[1] + 18.0 * c[2] - 6.0 * c[3] + c[4]) / h12;
                for i in 2..n - 2 {
                    d[[i, k]] = (-c[i + 2] + 8.0 * c[i + 1] - 8.0 * c[i - 1] + c[i - 2]) / h12;
                }
                let m = n - 1;
                d[[m - 1, k]] =
                    (3.0 * c[m] + 10.0 * c[m - 1] - 18.0 * c[m - 2] + 6.0 * c[m - 3] - c[m - 4])
                        / h12;
                d[[m, k]] = (25.0 * c[m] - 48.0 * c[m - 1] + 36.0 * c[m - 2] - 16.0 * c[m - 3]
                    + 3.0 * c[m - 4])
                    / h12;
            }
        }
    }
    Ok(d)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    /// Coefficients with magnitude below this are pruned (in raw units).
    pub threshold: f64,
    /// Tikhonov weight on the column-scaled problem (0 = plain least squares).
    pub ridge: f64,
    pub max_iter: usize,
    /// Condition numbers above this set `ill_conditioned`.
    pub max_condition: f64,
    pub differentiation: Differentiation,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            threshold: 0.1,
            ridge: 0.0,
            max_iter: 20,
            max_condition: 1e10,
            differentiation: Differentiation::FivePoint,
        }
    }
}

impl IdentifyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold >= 0.0) || !self.threshold.is_finite() {
            return Err(Error::InvalidInput("threshold must be finite and nonnegative"));
        }
        if !(self.ridge >= 0.0) || !self.ridge.is_finite() {
            return Err(Error::InvalidInput("ridge must be finite and nonnegative"));
        }
        if self.max_iter == 0 {
            return Err(Error::InvalidInput("max_iter must be >= 1"));
        }
        if !(self.max_condition > 1.0) {
            return Err(Error::InvalidInput("max_condition must be > 1"));
        }
        Ok(())
    }
}

/// A sparse polynomial vector field: `ẋ_k = Σ_j coefficients[j, k] θ_j(x)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub library: BasisLibrary,
    /// `terms × 3`.
    pub coefficients: Array2<f64>,
}

impl FittedModel {
    pub fn new(library: BasisLibrary, coefficients: Array2<f64>) -> Result<Self> {
        if coefficients.dim() != (library.len(), 3) {
            return Err(Error::Shape("coefficients must be terms × 3"));
        }
        Ok(Self {
            library,
            coefficients,
        })
    }

    pub fn coefficient(&self, term: Monomial, dim: usize) -> Option<f64> {
        self.library.index_of(term).map(|j| self.coefficients[[j, dim]])
    }

    /// Read `(σ, ρ, β)` off the Lorenz-shaped terms: `y` in `ẋ`, `x` in `ẏ`, `-z` in `ż`.
    pub fn lorenz_parameters(&self) -> Result<ParameterSet> {
        let missing = Error::InvalidInput("library lacks the linear terms x, y, z");
        let sigma = self.coefficient(Monomial::new(0, 1, 0), 0);
        let rho = self.coefficient(Monomial::new(1, 0, 0), 1);
        let beta = self.coefficient(Monomial::new(0, 0, 1), 2);
        match (sigma, rho, beta) {
            (Some(s), Some(r), Some(b)) => ParameterSet::new(s, r, -b),
            _ => Err(missing),
        }
    }

    /// Number of nonzero coefficients.
    pub fn active_terms(&self) -> usize {
        self.coefficients.iter().filter(|&&c| c != 0.0).count()
    }

    /// Human-readable equations, one per coordinate.
    pub fn equations(&self) -> Vec<String> {
        (0..3)
            .map(|k| {
                let mut rhs = String::new();
                for (j, term) in self.library.terms().iter().enumerate() {
                    let c = self.coefficients[[j, k]];
                    if c == 0.0 {
                        continue;
                    }
                    if rhs.is_empty() {
                        rhs.push_str(&format!("{c:.4}"));
                    } else if c < 0.0 {
                        rhs.push_str(&format!(" - {:.4}", -c));
                    } else {
                        rhs.push_str(&format!(" + {c:.4}"));
                    }
                    if term.degree() > 0 {
                        rhs.push_str(&format!(" {term}"));
                    }
                }
                if rhs.is_empty() {
                    rhs.push('0');
                }
                format!("d{}/dt = {rhs}", COORDS[k])
            })
            .collect()
    }
}

impl VectorField for FittedModel {
    fn derivative(&self, s: &State) -> State {
        let mut d = [0.0; 3];
        for (j, term) in self.library.terms().iter().enumerate() {
            let v = term.eval(s);
            for k in 0..3 {
                let c = self.coefficients[[j, k]];
                if c != 0.0 {
                    d[k] += c * v;
                }
            }
        }
        d
    }

    fn validate(&self) -> Result<()> {
        if self.coefficients.iter().all(|c| c.is_finite()) {
            Ok(())
        } else {
            Err(Error::InvalidInput("fitted coefficients must be finite"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    /// Per-coordinate RMSE between fitted and estimated derivatives.
    pub rmse: [f64; 3],
    pub r2: [f64; 3],
    /// `σ_max / σ_min` of the column-scaled library; `None` when it is rank deficient.
    pub condition_number: Option<f64>,
    /// Largest number of thresholding passes used by any coordinate.
    pub iterations: usize,
    /// Every coordinate's support stabilized within `max_iter`.
    pub converged: bool,
    pub ill_conditioned: bool,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub model: FittedModel,
    pub diagnostics: FitDiagnostics,
}

impl Identification {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let id: Identification = serde_json::from_str(s)?;
        if id.model.coefficients.dim() != (id.model.library.len(), 3) {
            return Err(Error::Shape("coefficients must be terms × 3"));
        }
        Ok(id)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Least squares on the selected columns of the scaled library; zeros elsewhere.
fn solve_support(
    theta: &DMatrix<f64>,
    y: &DVector<f64>,
    support: &[bool],
    ridge: f64,
) -> Result<Vec<f64>> {
    let cols: Vec<usize> = (0..support.len()).filter(|&j| support[j]).collect();
    let mut xi = vec![0.0; support.len()];
    if cols.is_empty() {
        return Ok(xi);
    }
    let n = theta.nrows();
    let m = cols.len();
    let extra = if ridge > 0.0 { m } else { 0 };
    let sr = ridge.sqrt();
    let a = DMatrix::from_fn(n + extra, m, |i, j| {
        if i < n {
            theta[(i, cols[j])]
        } else if i - n == j {
            sr
        } else {
            0.0
        }
    });
    let b = DVector::from_fn(n + extra, |i, _| if i < n { y[i] } else { 0.0 });
    let svd = a.svd(true, true);
    let smax = svd.singular_values.max();
    let sol = svd
        .solve(&b, smax * 1e-12)
        .map_err(Error::InvalidInput)?;
    for (j, &c) in cols.iter().enumerate() {
        xi[c] = sol[j];
    }
    Ok(xi)
}

/// Fit a sparse model to `trajectories` sampled every `dt`.
pub fn identify(
    trajectories: &[Trajectory],
    dt: f64,
    library: &BasisLibrary,
    cfg: &IdentifyConfig,
) -> Result<Identification> {
    cfg.validate()?;
    let first = trajectories
        .first()
        .ok_or(Error::InvalidInput("need at least one trajectory"))?;
    if trajectories.iter().any(|t| t.len() != first.len()) {
        return Err(Error::InvalidInput("trajectories must share one length"));
    }
    if trajectories.iter().any(|t| !t.is_finite()) {
        return Err(Error::InvalidInput("trajectories must be finite"));
    }
    let p = library.len();
    if p == 0 {
        return Err(Error::InvalidInput("library must contain at least one term"));
    }

    let n = first.len() * trajectories.len();
    if n < p {
        return Err(Error::InvalidInput("fewer samples than library terms"));
    }

    // Stack Θ and ẋ over all trajectories.
    let mut theta = DMatrix::<f64>::zeros(n, p);
    let mut dx = DMatrix::<f64>::zeros(n, 3);
    let mut row = 0;
    for t in trajectories {
        let d = estimate_derivatives(t, dt, cfg.differentiation)?;
        let th = library.matrix(t);
        for i in 0..t.len() {
            for j in 0..p {
                theta[(row, j)] = th[[i, j]];
            }
            for k in 0..3 {
                dx[(row, k)] = d[[i, k]];
            }
            row += 1;
        }
    }

    // Column scaling.
    let scales: Vec<f64> = (0..p)
        .map(|j| {
            let s = theta.column(j).norm();
            if s > 0.0 && s.is_finite() {
                s
            } else {
                1.0
            }
        })
        .collect();
    let mut scaled = theta.clone();
    for j in 0..p {
        let s = scales[j];
        scaled.column_mut(j).iter_mut().for_each(|v| *v /= s);
    }

    let sv = scaled.clone().svd(false, false).singular_values;
    let smax = sv.max();
    let smin = sv.min();
    let rank_tol = smax * p as f64 * f64::EPSILON;
    let condition_number = (smin > rank_tol).then(|| smax / smin);
    let ill_conditioned = condition_number.map_or(true, |c| !(c <= cfg.max_condition));

    let mut coefficients = Array2::<f64>::zeros((p, 3));
    let mut iterations = 0;
    let mut converged = true;
    for k in 0..3 {
        let y = dx.column(k).into_owned();
        let mut support = vec![true; p];
        let mut xi = solve_support(&scaled, &y, &support, cfg.ridge)?;
        let mut stable = false;
        let mut it = 0;
        while it < cfg.max_iter {
            it += 1;
            let next: Vec<bool> = (0..p)
                .map(|j| support[j] && (xi[j] / scales[j]).abs() >= cfg.threshold)
                .collect();
            if next == support {
                stable = true;
                break;
            }
            support = next;
            xi = solve_support(&scaled, &y, &support, cfg.ridge)?;
        }
        iterations = iterations.max(it);
        converged &= stable;
        for j in 0..p {
            coefficients[[j, k]] = if support[j] { xi[j] / scales[j] } else { 0.0 };
        }
    }

    // Residual diagnostics against the estimated derivatives.
    let mut rmse = [0.0; 3];
    let mut r2 = [0.0; 3];
    for k in 0..3 {
        let mut ss_res = 0.0;
        let mut mean = 0.0;
        for i in 0..n {
            mean += dx[(i, k)];
        }
        mean /= n as f64;
        let mut ss_tot = 0.0;
        for i in 0..n {
            let mut pred = 0.0;
            for j in 0..p {
                pred += theta[(i, j)] * coefficients[[j, k]];
            }
            let r = dx[(i, k)] - pred;
            ss_res += r * r;
            ss_tot += (dx[(i, k)] - mean).powi(2);
        }
        rmse[k] = (ss_res / n as f64).sqrt();
        r2[k] = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res <= f64::EPSILON {
            1.0
        } else {
            0.0
        };
    }

    if ill_conditioned {
        warn!(?condition_number, "library matrix is ill-conditioned");
    }
    if !converged {
        warn!(max_iter = cfg.max_iter, "thresholded least squares did not converge");
    }
    debug!(samples = n, terms = p, iterations, ?rmse, "sparse identification done");

    Ok(Identification {
        model: FittedModel {
            library: library.clone(),
            coefficients,
        },
        diagnostics: FitDiagnostics {
            rmse,
            r2,
            condition_number,
            iterations,
            converged,
            ill_conditioned,
            samples: n,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::{simulate, SimulationConfig};
    use proptest::prelude::*;

    #[test]
    fn quadratic_library_order_and_names() {
        let lib = BasisLibrary::polynomial(2).unwrap();
        assert_eq!(
            lib.names(),
            vec!["1", "x", "y", "z", "x^2", "x y", "x z", "y^2", "y z", "z^2"]
        );
        assert_eq!(BasisLibrary::polynomial(3).unwrap().len(), 20);
        assert!(BasisLibrary::from_terms(vec![]).is_err());
        assert!(BasisLibrary::from_terms(vec![Monomial::new(1, 0, 0); 2]).is_err());
    }

    #[test]
    fn five_point_beats_central_difference() {
        let dt = 0.05;
        let states: Vec<State> = (0..60)
            .map(|i| {
                let t = i as f64 * dt;
                [t.sin(), (2.0 * t).cos(), t * t]
            })
            .collect();
        let traj = Trajectory::from_states(&states).unwrap();
        let err = |m| {
            let d = estimate_derivatives(&traj, dt, m).unwrap();
            (0..60)
                .map(|i| {
                    let t = i as f64 * dt;
                    (d[[i, 0]] - t.cos()).abs()
                        + (d[[i, 1]] + 2.0 * (2.0 * t).sin()).abs()
                        + (d[[i, 2]] - 2.0 * t).abs()
                })
                .fold(0.0, f64::max)
        };
        let e5 = err(Differentiation::FivePoint);
        let e2 = err(Differentiation::CentralDifference);
        assert!(e5 < e2, "five-point {e5} vs central {e2}");
        assert!(e5 < 1e-3);
    }

    #[test]
    fn short_input_is_rejected() {
        let traj = Trajectory::from_states(&[[0.0; 3]; 4]).unwrap();
        assert!(estimate_derivatives(&traj, 0.01, Differentiation::FivePoint).is_err());
        assert!(estimate_derivatives(&traj, 0.01, Differentiation::CentralDifference).is_ok());
        let lib = BasisLibrary::polynomial(2).unwrap();
        assert!(identify(&[], 0.01, &lib, &IdentifyConfig::default()).is_err());
        // 4 samples < 10 terms.
        let cfg = IdentifyConfig {
            differentiation: Differentiation::CentralDifference,
            ..IdentifyConfig::default()
        };
        assert!(matches!(identify(&[traj], 0.01, &lib, &cfg), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn recovers_classic_parameters_from_short_clean_run() {
        let p = ParameterSet::classic();
        let dt = 0.002;
        let cfg = SimulationConfig {
            dt,
            length: 2_000,
            ..SimulationConfig::default()
        };
        let t = simulate(&p, &[-8.0, 7.0, 27.0], &cfg).unwrap();
        let lib = BasisLibrary::polynomial(2).unwrap();
        let id = identify(&[t], dt, &lib, &IdentifyConfig::default()).unwrap();
        let est = id.model.lorenz_parameters().unwrap();
        assert!((est.sigma - 10.0).abs() / 10.0 < 1e-2, "{est:?}");
        assert!((est.rho - 28.0).abs() / 28.0 < 1e-2, "{est:?}");
        assert!((est.beta - 8.0 / 3.0).abs() / (8.0 / 3.0) < 1e-2, "{est:?}");
        assert!(id.diagnostics.converged);
        assert_eq!(id.model.active_terms(), 7);
        assert!(id.diagnostics.r2.iter().all(|&r| r > 0.999));
    }

    #[test]
    fn lorenz_parameters_need_linear_terms() {
        let lib = BasisLibrary::from_terms(vec![Monomial::new(0, 0, 0)]).unwrap();
        let m = FittedModel::new(lib, Array2::zeros((1, 3))).unwrap();
        assert!(m.lorenz_parameters().is_err());
        assert_eq!(m.equations()[0], "dx/dt = 0");
    }

    #[test]
    fn fitted_model_is_a_vector_field() {
        let lib = BasisLibrary::polynomial(2).unwrap();
        let mut c = Array2::<f64>::zeros((lib.len(), 3));
        let (s, r, b) = (10.0, 28.0, 8.0 / 3.0);
        c[[1, 0]] = -s;
        c[[2, 0]] = s;
        c[[1, 1]] = r;
        c[[2, 1]] = -1.0;
        c[[6, 1]] = -1.0;
        c[[5, 2]] = 1.0;
        c[[3, 2]] = -b;
        let m = FittedModel::new(lib, c).unwrap();
        let p = ParameterSet::classic();
        let x = [1.5, -2.0, 20.0];
        let (a, e) = (m.derivative(&x), p.derivative(&x));
        for k in 0..3 {
            assert!((a[k] - e[k]).abs() < 1e-12);
        }
        let eq = m.equations();
        assert_eq!(eq[0], "dx/dt = -10.0000 x + 10.0000 y");
        assert!(eq[2].contains("x y"));
    }

    #[test]
    fn constant_data_is_flagged_ill_conditioned() {
        let traj = Trajectory::from_states(&[[2.0, 3.0, 4.0]; 50]).unwrap();
        let lib = BasisLibrary::polynomial(2).unwrap();
        let id = identify(&[traj], 0.01, &lib, &IdentifyConfig::default()).unwrap();
        assert!(id.diagnostics.ill_conditioned);
        assert!(id
            .diagnostics
            .condition_number
            .map_or(true, |c| c > IdentifyConfig::default().max_condition));
        assert!(id.model.coefficients.iter().all(|c| c.is_finite()));
    }

    #[test]
    fn json_round_trip_through_file() {
        let lib = BasisLibrary::polynomial(1).unwrap();
        let mut c = Array2::<f64>::zeros((lib.len(), 3));
        c[[2, 0]] = 1.25;
        let id = Identification {
            model: FittedModel::new(lib, c).unwrap(),
            diagnostics: FitDiagnostics {
                rmse: [0.1, 0.2, 0.3],
                r2: [0.9, 0.8, 0.7],
                condition_number: Some(12.0),
                iterations: 2,
                converged: true,
                ill_conditioned: false,
                samples: 100,
            },
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.json");
        id.save_json(&path).unwrap();
        assert_eq!(Identification::load_json(&path).unwrap(), id);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 16,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_exact_sparse_linear_system_is_recovered(
            a in 0.5f64..3.0,
            b in 0.5f64..3.0,
        ) {
            // ẋ = -a x + y, ẏ = -x - a y, ż = -b z: a damped rotation.
            struct Linear { a: f64, b: f64 }
            impl VectorField for Linear {
                fn derivative(&self, s: &State) -> State {
                    [-self.a * s[0] + s[1], -s[0] - self.a * s[1], -self.b * s[2]]
                }
            }
            let dt = 0.001;
            let cfg = SimulationConfig { dt, length: 800, ..SimulationConfig::default() };
            let t = simulate(&Linear { a, b }, &[2.0, -1.0, 3.0], &cfg).unwrap();
            let lib = BasisLibrary::polynomial(1).unwrap();
            let id = identify(&[t], dt, &lib, &IdentifyConfig::default()).unwrap();
            let m = &id.model;
            prop_assert!((m.coefficient(Monomial::new(1, 0, 0), 0).unwrap() + a).abs() < 1e-3);
            prop_assert!((m.coefficient(Monomial::new(0, 0, 1), 2).unwrap() + b).abs() < 1e-3);
            prop_assert_eq!(m.coefficient(Monomial::new(0, 0, 0), 0).unwrap(), 0.0);
        }
    }
}
