//! Fidelity metrics for chaotic trajectories (small + explicit).
//!
//! These helpers are "glass box":
//! - they do not hide integration settings (every Lyapunov estimate carries its config),
//! - they surface the exact scalar computed (and what it is *not*).
//!
//! Pointwise errors are meaningless between two chaotic trajectories after a few Lyapunov times,
//! so the comparisons here are distributional (moments, 1-D Wasserstein per coordinate) or
//! dynamical (Lyapunov exponent, neighbour divergence rate).

use crate::lorenz::{distance, VectorField, COORDS};
use crate::lyapunov::{ensemble_lyapunov, EnsembleLyapunov, LyapunovConfig};
use crate::sindy::{identify, BasisLibrary, Identification, IdentifyConfig};
use crate::trajectory::Trajectory;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Per-coordinate mean and (population) variance over every state of every trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateStats {
    pub mean: [f64; 3],
    pub variance: [f64; 3],
    pub count: usize,
}

impl CoordinateStats {
    pub fn std(&self) -> [f64; 3] {
        self.variance.map(f64::sqrt)
    }
}

pub fn coordinate_stats(trajectories: &[Trajectory]) -> Result<CoordinateStats> {
    if trajectories.is_empty() {
        return Err(Error::InvalidInput("need at least one trajectory"));
    }
    let mut count = 0usize;
    let mut mean = [0.0f64; 3];
    let mut m2 = [0.0f64; 3];
    // Welford, so large ensembles do not lose precision.
    for t in trajectories {
        for row in t.view().rows() {
            count += 1;
            for k in 0..3 {
                let d = row[k] - mean[k];
                mean[k] += d / count as f64;
                m2[k] += d * (row[k] - mean[k]);
            }
        }
    }
    Ok(CoordinateStats {
        mean,
        variance: m2.map(|v| v / count as f64),
        count,
    })
}

/// Exact 1-D Wasserstein-1 distance between two empirical distributions with uniform weights.
///
/// Computed as \(\int |F_a(x) - F_b(x)|\,dx\) over the merged support. Inputs need not be sorted
/// or of equal size.
pub fn wasserstein_1d(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.is_empty() || b.is_empty() {
        return Err(Error::InvalidInput("wasserstein_1d needs non-empty samples"));
    }
    if a.iter().chain(b).any(|v| !v.is_finite()) {
        return Err(Error::InvalidInput("wasserstein_1d needs finite samples"));
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (na, nb) = (a.len() as f64, b.len() as f64);

    let mut all: Vec<f64> = a.iter().chain(b.iter()).copied().collect();
    all.sort_by(f64::total_cmp);

    let (mut ia, mut ib) = (0usize, 0usize);
    let mut w = 0.0;
    for pair in all.windows(2) {
        let x = pair[0];
        while ia < a.len() && a[ia] <= x {
            ia += 1;
        }
        while ib < b.len() && b[ib] <= x {
            ib += 1;
        }
        let gap = pair[1] - x;
        if gap > 0.0 {
            w += (ia as f64 / na - ib as f64 / nb).abs() * gap;
        }
    }
    Ok(w)
}

fn coordinate_samples(trajectories: &[Trajectory], k: usize) -> Vec<f64> {
    trajectories
        .iter()
        .flat_map(|t| t.view().column(k).to_vec())
        .collect()
}

/// [`wasserstein_1d`] on each coordinate's pooled marginal.
pub fn wasserstein_per_coordinate(
    real: &[Trajectory],
    candidate: &[Trajectory],
) -> Result<[f64; 3]> {
    let mut out = [0.0; 3];
    for (k, w) in out.iter_mut().enumerate() {
        *w = wasserstein_1d(&coordinate_samples(real, k), &coordinate_samples(candidate, k))?;
    }
    Ok(out)
}

/// Mean log-separation of nearest-neighbour pairs as they evolve (Rosenstein-style).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceCurve {
    /// `k * dt` for `k = 0..=horizon`.
    pub times: Vec<f64>,
    pub mean_log_separation: Vec<f64>,
    /// Least-squares slope of `mean_log_separation` against `times`.
    ///
    /// A model-free divergence rate. It approaches the largest Lyapunov exponent only when the
    /// neighbours are close and the horizon sits in the linear regime; it is not a substitute
    /// for [`crate::lyapunov::largest_lyapunov`].
    pub slope: f64,
    /// Neighbour pairs averaged.
    pub pairs: usize,
}

/// Nearest-neighbour separation growth across an ensemble, from data alone.
///
/// Reference points are taken every `stride` samples; each reference's neighbour is the closest
/// state in any *other* trajectory that still has `horizon` samples ahead of it.
pub fn divergence_curve(
    trajectories: &[Trajectory],
    dt: f64,
    horizon: usize,
    stride: usize,
) -> Result<DivergenceCurve> {
    if !(dt > 0.0) || !dt.is_finite() {
        return Err(Error::InvalidInput("dt must be positive and finite"));
    }
    if horizon == 0 || stride == 0 {
        return Err(Error::InvalidInput("horizon and stride must be >= 1"));
    }
    if trajectories.len() < 2 {
        return Err(Error::InvalidInput("divergence curve needs at least two trajectories"));
    }
    if trajectories.iter().any(|t| t.len() <= horizon || !t.is_finite()) {
        return Err(Error::InvalidInput("trajectories must be finite and longer than horizon"));
    }

    let mut sums = vec![0.0f64; horizon + 1];
    let mut counts = vec![0usize; horizon + 1];
    let mut pairs = 0usize;

    for (a, ta) in trajectories.iter().enumerate() {
        for i in (0..ta.len() - horizon).step_by(stride) {
            let s = ta.state(i);
            let mut best: Option<(f64, usize, usize)> = None;
            for (b, tb) in trajectories.iter().enumerate() {
                if b == a {
                    continue;
                }
                for j in 0..tb.len() - horizon {
                    let d = distance(&s, &tb.state(j));
                    if d > 0.0 && best.map_or(true, |(bd, _, _)| d < bd) {
                        best = Some((d, b, j));
                    }
                }
            }
            let Some((_, b, j)) = best else { continue };
            let tb = &trajectories[b];
            pairs += 1;
            for k in 0..=horizon {
                let d = distance(&ta.state(i + k), &tb.state(j + k));
                if d > 0.0 {
                    sums[k] += d.ln();
                    counts[k] += 1;
                }
            }
        }
    }

    if pairs == 0 || counts.iter().any(|&c| c == 0) {
        return Err(Error::InvalidInput("no usable neighbour pairs"));
    }
    let times: Vec<f64> = (0..=horizon).map(|k| k as f64 * dt).collect();
    let mean_log_separation: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &c)| s / c as f64)
        .collect();
    let slope = least_squares_slope(&times, &mean_log_separation);

    Ok(DivergenceCurve {
        times,
        mean_log_separation,
        slope,
        pairs,
    })
}

fn least_squares_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
    }
    if sxx > 0.0 {
        sxy / sxx
    } else {
        0.0
    }
}

/// Mean polygonal length `Σ_t |x_t - x_{t-1}|` of the trajectories.
///
/// Unlike pooled moments this sees motion: an ensemble that holds its initial conditions scores 0
/// however well its states are spread.
pub fn mean_path_length(trajectories: &[Trajectory]) -> Result<f64> {
    if trajectories.is_empty() {
        return Err(Error::InvalidInput("need at least one trajectory"));
    }
    let total: f64 = trajectories
        .iter()
        .map(|t| {
            (1..t.len())
                .map(|i| distance(&t.state(i - 1), &t.state(i)))
                .sum::<f64>()
        })
        .sum();
    Ok(total / trajectories.len() as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub lyapunov: LyapunovConfig,
    /// Sampling interval of the trajectories being compared.
    pub sample_dt: f64,
    pub divergence_horizon: usize,
    pub divergence_stride: usize,
    /// Polynomial degree of the library each ensemble's own field is identified with.
    pub library_degree: u8,
    pub identify: IdentifyConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            lyapunov: LyapunovConfig::default(),
            sample_dt: 0.01,
            divergence_horizon: 20,
            divergence_stride: 10,
            library_degree: 2,
            identify: IdentifyConfig::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        self.lyapunov.validate()?;
        self.identify.validate()?;
        if !(self.sample_dt > 0.0) || !self.sample_dt.is_finite() {
            return Err(Error::InvalidInput("sample_dt must be positive and finite"));
        }
        if self.divergence_horizon == 0 || self.divergence_stride == 0 {
            return Err(Error::InvalidInput("divergence horizon and stride must be >= 1"));
        }
        if self.library_degree == 0 {
            return Err(Error::InvalidInput("library_degree must be >= 1"));
        }
        Ok(())
    }
}

/// `a / b`, or `None` when `b` is zero or the quotient is not finite.
fn ratio(a: f64, b: f64) -> Option<f64> {
    let r = a / b;
    (b != 0.0 && r.is_finite()).then_some(r)
}

/// Side-by-side comparison of a reference ensemble and a candidate ensemble.
///
/// Three exponents are reported, each tied to a named field:
/// - `reference_lyapunov`: the caller's known `field`, anchored at the real trajectories;
/// - `real_lyapunov`: the field identified from the real ensemble alone;
/// - `candidate_lyapunov`: the field identified from the candidate ensemble alone.
///
/// Only the last two depend on the data's dynamics, so [`Self::lyapunov_gap`] compares those.
/// `reference_lyapunov` checks that identification from real data reproduces the known field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FidelityReport {
    pub real_stats: CoordinateStats,
    pub candidate_stats: CoordinateStats,
    /// `|mean_candidate - mean_real| / std_real` per coordinate; `None` for a constant real
    /// coordinate.
    pub mean_gap: [Option<f64>; 3],
    /// `var_candidate / var_real` per coordinate; `None` for a constant real coordinate.
    pub variance_ratio: [Option<f64>; 3],
    pub wasserstein: [f64; 3],
    pub real_path_length: f64,
    pub candidate_path_length: f64,
    pub reference_lyapunov: EnsembleLyapunov,
    /// Sparse models identified from each ensemble; `None` when identification failed.
    pub real_model: Option<Identification>,
    pub candidate_model: Option<Identification>,
    /// Exponents of `real_model`, anchored at each real trajectory's last state.
    pub real_lyapunov: Option<EnsembleLyapunov>,
    /// Exponents of `candidate_model`, anchored at each candidate trajectory's last state.
    pub candidate_lyapunov: Option<EnsembleLyapunov>,
    /// Divergence curves, `None` when the ensemble gave no usable neighbour pairs.
    pub real_divergence: Option<DivergenceCurve>,
    pub candidate_divergence: Option<DivergenceCurve>,
}

/// Identify a field from `trajectories` and estimate its exponent at their last states.
fn identified_lyapunov(
    trajectories: &[Trajectory],
    library: &BasisLibrary,
    cfg: &EvaluationConfig,
    label: &'static str,
) -> (Option<Identification>, Option<EnsembleLyapunov>) {
    let id = match identify(trajectories, cfg.sample_dt, library, &cfg.identify) {
        Ok(id) => id,
        Err(e) => {
            warn!(ensemble = label, error = %e, "identification failed");
            return (None, None);
        }
    };
    match ensemble_lyapunov(&id.model, trajectories, &cfg.lyapunov) {
        Ok(lyap) => (Some(id), Some(lyap)),
        Err(e) => {
            warn!(ensemble = label, error = %e, "identified field rejected");
            (Some(id), None)
        }
    }
}

impl FidelityReport {
    pub fn compare<F: VectorField + Sync + ?Sized>(
        real: &[Trajectory],
        candidate: &[Trajectory],
        field: &F,
        cfg: &EvaluationConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        if candidate.iter().any(|t| !t.is_finite()) {
            return Err(Error::InvalidInput("candidate trajectories must be finite"));
        }
        let real_stats = coordinate_stats(real)?;
        let candidate_stats = coordinate_stats(candidate)?;
        let real_std = real_stats.std();
        let mut mean_gap = [None; 3];
        let mut variance_ratio = [None; 3];
        for k in 0..3 {
            mean_gap[k] = ratio((candidate_stats.mean[k] - real_stats.mean[k]).abs(), real_std[k]);
            variance_ratio[k] = ratio(candidate_stats.variance[k], real_stats.variance[k]);
        }
        let wasserstein = wasserstein_per_coordinate(real, candidate)?;

        let reference_lyapunov = ensemble_lyapunov(field, real, &cfg.lyapunov)?;
        let library = BasisLibrary::polynomial(cfg.library_degree)?;
        let (real_model, real_lyapunov) = identified_lyapunov(real, &library, cfg, "real");
        let (candidate_model, candidate_lyapunov) =
            identified_lyapunov(candidate, &library, cfg, "candidate");

        let curve = |t: &[Trajectory]| {
            divergence_curve(t, cfg.sample_dt, cfg.divergence_horizon, cfg.divergence_stride).ok()
        };
        let report = Self {
            real_stats,
            candidate_stats,
            mean_gap,
            variance_ratio,
            wasserstein,
            real_path_length: mean_path_length(real)?,
            candidate_path_length: mean_path_length(candidate)?,
            reference_lyapunov,
            real_model,
            candidate_model,
            real_lyapunov,
            candidate_lyapunov,
            real_divergence: curve(real),
            candidate_divergence: curve(candidate),
        };
        info!(
            mean_gap = ?report.mean_gap,
            variance_ratio = ?report.variance_ratio,
            path_length_ratio = ?report.path_length_ratio(),
            reference_lyapunov = ?report.reference_lyapunov.mean,
            real_lyapunov = ?report.real_lyapunov.as_ref().and_then(|l| l.mean),
            candidate_lyapunov = ?report.candidate_lyapunov.as_ref().and_then(|l| l.mean),
            "fidelity report"
        );
        Ok(report)
    }

    /// `candidate_path_length / real_path_length`.
    pub fn path_length_ratio(&self) -> Option<f64> {
        ratio(self.candidate_path_length, self.real_path_length)
    }

    /// `|λ_candidate - λ_real|` between the two identified fields, when both produced an
    /// estimate.
    pub fn lyapunov_gap(&self) -> Option<f64> {
        let mean = |l: &Option<EnsembleLyapunov>| l.as_ref().and_then(|l| l.mean);
        match (mean(&self.real_lyapunov), mean(&self.candidate_lyapunov)) {
            (Some(a), Some(b)) => Some((a - b).abs()),
            _ => None,
        }
    }

    /// One line per coordinate, then path length and the Lyapunov comparison.
    pub fn summary(&self) -> Vec<String> {
        let opt = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"));
        let mut lines: Vec<String> = (0..3)
            .map(|k| {
                format!(
                    "{}: mean {:.3} vs {:.3}, var ratio {}, W1 {:.3}",
                    COORDS[k],
                    self.real_stats.mean[k],
                    self.candidate_stats.mean[k],
                    opt(self.variance_ratio[k]),
                    self.wasserstein[k]
                )
            })
            .collect();
        lines.push(format!(
            "path length: real {:.3} vs candidate {:.3}",
            self.real_path_length, self.candidate_path_length
        ));
        let mean = |l: &Option<EnsembleLyapunov>| opt(l.as_ref().and_then(|l| l.mean));
        lines.push(format!(
            "lyapunov: reference {} | identified real {} vs candidate {}",
            opt(self.reference_lyapunov.mean),
            mean(&self.real_lyapunov),
            mean(&self.candidate_lyapunov)
        ));
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorenz::ParameterSet;
    use crate::simulate::{simulate_ensemble, InitialConditionBox, SimulationConfig};
    use proptest::prelude::*;

    #[test]
    fn stats_match_hand_computation() -> Result<()> {
        let a = Trajectory::from_states(&[[1.0, 0.0, 2.0], [3.0, 0.0, 2.0]])?;
        let b = Trajectory::from_states(&[[5.0, 4.0, 2.0], [7.0, 0.0, 2.0]])?;
        let s = coordinate_stats(&[a, b])?;
        assert_eq!(s.count, 4);
        assert!((s.mean[0] - 4.0).abs() < 1e-12);
        assert!((s.variance[0] - 5.0).abs() < 1e-12);
        assert!((s.mean[1] - 1.0).abs() < 1e-12);
        assert_eq!(s.variance[2], 0.0);
        Ok(())
    }

    #[test]
    fn wasserstein_known_values() -> Result<()> {
        assert!((wasserstein_1d(&[0.0], &[1.0])? - 1.0).abs() < 1e-12);
        assert!((wasserstein_1d(&[0.0, 1.0], &[0.0, 1.0])?).abs() < 1e-12);
        // Half the mass moves by 2.
        assert!((wasserstein_1d(&[0.0, 0.0], &[0.0, 2.0])? - 1.0).abs() < 1e-12);
        assert!(wasserstein_1d(&[], &[1.0]).is_err());
        assert!(wasserstein_1d(&[f64::NAN], &[1.0]).is_err());
        Ok(())
    }

    #[test]
    fn divergence_slope_separates_chaos_from_decay() {
        let bounds = InitialConditionBox::default();
        let chaotic = simulate_ensemble(
            &ParameterSet::classic(),
            &bounds,
            20,
            &SimulationConfig {
                length: 400,
                burn_in: 500,
                ..SimulationConfig::default()
            },
            1,
        )
        .unwrap();
        let c = divergence_curve(&chaotic, 0.01, 40, 20).unwrap();
        assert_eq!(c.times.len(), 41);
        assert!(c.pairs > 0);
        assert!(c.slope > 0.0, "slope = {}", c.slope);

        let decaying = simulate_ensemble(
            &ParameterSet::new(10.0, 0.5, 8.0 / 3.0).unwrap(),
            &bounds,
            12,
            &SimulationConfig {
                length: 400,
                ..SimulationConfig::default()
            },
            1,
        )
        .unwrap();
        let d = divergence_curve(&decaying, 0.01, 40, 20).unwrap();
        assert!(d.slope < 0.0, "slope = {}", d.slope);

        assert!(divergence_curve(&chaotic[..1], 0.01, 40, 20).is_err());
        assert!(divergence_curve(&chaotic, 0.01, 400, 20).is_err());
    }

    fn short_eval() -> EvaluationConfig {
        EvaluationConfig {
            lyapunov: LyapunovConfig {
                transient_steps: 100,
                renormalizations: 300,
                ..LyapunovConfig::default()
            },
            ..EvaluationConfig::default()
        }
    }

    fn attractor_ensemble(n: usize, seed: u64) -> Vec<Trajectory> {
        simulate_ensemble(
            &ParameterSet::classic(),
            &InitialConditionBox::default(),
            n,
            &SimulationConfig {
                length: 100,
                burn_in: 300,
                ..SimulationConfig::default()
            },
            seed,
        )
        .unwrap()
    }

    #[test]
    fn report_against_itself_is_tight() {
        let p = ParameterSet::classic();
        let data = attractor_ensemble(6, 9);
        let r = FidelityReport::compare(&data, &data, &p, &short_eval()).unwrap();
        for k in 0..3 {
            assert!(r.mean_gap[k].unwrap() < 1e-12);
            assert!((r.variance_ratio[k].unwrap() - 1.0).abs() < 1e-12);
            assert!(r.wasserstein[k] < 1e-12);
        }
        assert_eq!(r.path_length_ratio(), Some(1.0));
        assert_eq!(r.lyapunov_gap(), Some(0.0));
        assert_eq!(r.summary().len(), 5);

        // Identification from clean real data reproduces the known field's exponent.
        let reference = r.reference_lyapunov.mean.unwrap();
        let identified = r.real_lyapunov.as_ref().and_then(|l| l.mean).unwrap();
        assert!(reference > 0.0);
        assert!((reference - identified).abs() < 0.3, "{reference} vs {identified}");
    }

    #[test]
    fn frozen_candidate_is_judged_by_its_own_dynamics() {
        // Each candidate holds its initial condition: the pooled moments look like the
        // attractor, but nothing moves.
        let p = ParameterSet::classic();
        let real = attractor_ensemble(6, 9);
        let frozen: Vec<Trajectory> = real
            .iter()
            .map(|t| Trajectory::from_states(&vec![t.initial(); t.len()]).unwrap())
            .collect();
        let r = FidelityReport::compare(&real, &frozen, &p, &short_eval()).unwrap();

        assert_eq!(r.candidate_path_length, 0.0);
        assert_eq!(r.path_length_ratio(), Some(0.0));
        let frozen_lambda = r.candidate_lyapunov.as_ref().and_then(|l| l.mean).unwrap();
        assert!(frozen_lambda.abs() < 0.05, "λ = {frozen_lambda}");
        assert!(r.lyapunov_gap().unwrap() > 0.3);
    }

    #[test]
    fn constant_real_coordinate_has_no_relative_gap() {
        let line = |z: f64| {
            let states: Vec<_> = (0..20).map(|i| [i as f64, -(i as f64), z]).collect();
            Trajectory::from_states(&states).unwrap()
        };
        let cfg = EvaluationConfig {
            lyapunov: LyapunovConfig {
                transient_steps: 10,
                renormalizations: 20,
                ..LyapunovConfig::default()
            },
            ..EvaluationConfig::default()
        };
        let r = FidelityReport::compare(
            &[line(5.0), line(5.0)],
            &[line(6.0), line(6.0)],
            &ParameterSet::classic(),
            &cfg,
        )
        .unwrap();
        assert_eq!(r.mean_gap[0], Some(0.0));
        assert_eq!(r.variance_ratio[0], Some(1.0));
        assert_eq!(r.mean_gap[2], None);
        assert_eq!(r.variance_ratio[2], None);
        assert!(r.summary()[2].contains("n/a"));
    }

    #[test]
    fn path_length_of_a_unit_staircase() -> Result<()> {
        let t = Trajectory::from_states(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0]])?;
        assert!((mean_path_length(&[t])? - 2.0).abs() < 1e-12);
        assert!(mean_path_length(&[]).is_err());
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_wasserstein_of_shift_is_shift(
            xs in prop::collection::vec(-100.0f64..100.0, 1..64),
            c in -10.0f64..10.0,
        ) {
            let ys: Vec<f64> = xs.iter().map(|x| x + c).collect();
            let w = wasserstein_1d(&xs, &ys).unwrap();
            prop_assert!((w - c.abs()).abs() < 1e-9 * (1.0 + c.abs()) * xs.len() as f64);
        }

        #[test]
        fn prop_wasserstein_is_symmetric_and_nonnegative(
            xs in prop::collection::vec(-50.0f64..50.0, 1..40),
            ys in prop::collection::vec(-50.0f64..50.0, 1..40),
        ) {
            let a = wasserstein_1d(&xs, &ys).unwrap();
            let b = wasserstein_1d(&ys, &xs).unwrap();
            prop_assert!(a >= 0.0);
            prop_assert!((a - b).abs() < 1e-9);
        }
    }
}
