//! Adversarial training as an explicit state machine.
//!
//! Training state is the tuple `(θ_G, θ_D, optimizer moments, t)` held in [`TrainState`].
//! [`train_step`] maps one state to the next and never mutates its input; the RNG for step `t` is
//! derived from `(seed, t)`, so stepping a restored checkpoint reproduces an uninterrupted run
//! bit-for-bit.
//!
//! Per step:
//! - draw one smoothed real label `~ N(label_mean, label_std)`, clipped at 1,
//! - `d_steps` discriminator updates on a batch of real trajectories vs. generated ones
//!   conditioned on the same initial states,
//! - `g_steps` generator updates with the non-saturating loss, backpropagated through the frozen
//!   discriminator into the generator's recurrence.
//!
//! Diagnostics (diversity on fixed noise, discriminator saturation) are reported and
//! logged. They are never acted on automatically.

use crate::checkpoint;
use crate::discriminator::{ConditionalDiscriminator, DiscriminatorConfig};
use crate::generator::{ConditionalGenerator, GeneratorConfig};
use crate::lorenz::State;
use crate::nn::{self, Adam};
use crate::trajectory::{common_length, Normalizer, Trajectory};
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Fixed seed for the diversity noise (kept constant across the whole run).
const DIVERSITY_SEED: u64 = 42;

/// Stop once the d_loss / g_loss ratio stops moving.
///
/// The mean ratio over the last `window` steps is compared with the mean over the `window` steps
/// before it; an absolute change below `tolerance` counts as a plateau.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    pub window: usize,
    pub tolerance: f64,
}

impl Default for EarlyStop {
    fn default() -> Self {
        Self {
            window: 50,
            tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GanConfig {
    pub generator: GeneratorConfig,
    pub discriminator: DiscriminatorConfig,
    pub batch_size: usize,
    /// Step budget (total, counted from step 0).
    pub steps: usize,
    /// Discriminator learning rate.
    pub lr: f32,
    /// Generator learning rate is `lr * g_factor`.
    pub g_factor: f32,
    pub d_steps: usize,
    pub g_steps: usize,
    pub seed: u64,
    pub label_mean: f64,
    pub label_std: f64,
    pub early_stop: Option<EarlyStop>,
    /// Measure diversity every `check_every` steps (0 disables it).
    pub check_every: usize,
    pub diversity_samples: usize,
    pub collapse_threshold: f64,
    pub saturation_threshold: f64,
    /// Write a checkpoint every `checkpoint_every` steps when a directory is given.
    pub checkpoint_every: Option<usize>,
}

impl Default for GanConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            discriminator: DiscriminatorConfig::default(),
            batch_size: 32,
            steps: 500,
            lr: 4e-4,
            g_factor: 0.25,
            d_steps: 1,
            g_steps: 1,
            seed: 0,
            label_mean: 0.9,
            label_std: 0.005,
            early_stop: None,
            check_every: 20,
            diversity_samples: 8,
            collapse_threshold: 1e-4,
            saturation_threshold: 1e-3,
            checkpoint_every: None,
        }
    }
}

impl GanConfig {
    pub fn validate(&self) -> Result<()> {
        self.generator.validate()?;
        self.discriminator.validate()?;
        if self.generator.length != self.discriminator.length {
            return Err(Error::Shape("generator and discriminator lengths differ"));
        }
        if self.batch_size == 0 || self.d_steps == 0 || self.g_steps == 0 {
            return Err(Error::InvalidInput("batch_size, d_steps and g_steps must be >= 1"));
        }
        let positive = |v: f32| v > 0.0 && v.is_finite();
        if !positive(self.lr) || !positive(self.g_factor) {
            return Err(Error::InvalidInput("lr and g_factor must be positive and finite"));
        }
        if !(self.label_mean > 0.0 && self.label_mean <= 1.0) {
            return Err(Error::InvalidInput("label_mean must be in (0, 1]"));
        }
        if !(self.label_std >= 0.0) || !self.label_std.is_finite() {
            return Err(Error::InvalidInput("label_std must be finite and nonnegative"));
        }
        if self.check_every > 0 && self.diversity_samples < 2 {
            return Err(Error::InvalidInput("diversity_samples must be >= 2 when check_every > 0"));
        }
        if let Some(es) = &self.early_stop {
            if es.window == 0 || !(es.tolerance >= 0.0) {
                return Err(Error::InvalidInput("early_stop needs window >= 1 and tolerance >= 0"));
            }
        }
        if self.checkpoint_every == Some(0) {
            return Err(Error::InvalidInput("checkpoint_every must be >= 1"));
        }
        Ok(())
    }
}

/// Everything that changes during training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub generator: ConditionalGenerator,
    pub discriminator: ConditionalDiscriminator,
    pub opt_g: Adam,
    pub opt_d: Adam,
    /// Number of accepted steps so far.
    pub step: usize,
}

impl TrainState {
    /// Fresh models around a given normalizer.
    pub fn new(cfg: &GanConfig, normalizer: Normalizer) -> Result<Self> {
        cfg.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let generator = ConditionalGenerator::new(cfg.generator.clone(), normalizer, &mut rng)?;
        let discriminator =
            ConditionalDiscriminator::new(cfg.discriminator.clone(), normalizer, &mut rng)?;
        Ok(Self {
            generator,
            discriminator,
            opt_g: Adam::new(cfg.lr * cfg.g_factor),
            opt_d: Adam::new(cfg.lr),
            step: 0,
        })
    }

    /// Fresh models with the normalizer fitted on `data`.
    pub fn init(cfg: &GanConfig, data: &[Trajectory]) -> Result<Self> {
        check_dataset(cfg, data)?;
        Self::new(cfg, Normalizer::fit(data)?)
    }
}

/// Per-step diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Index of the step this report describes (state step before the update).
    pub step: usize,
    pub d_loss: f64,
    pub g_loss: f64,
    /// Mean discriminator score on the real batch.
    pub d_real_score: f64,
    /// Mean discriminator score on the generated batch.
    pub d_fake_score: f64,
    pub real_label: f64,
    /// Diversity, present on measurement steps only.
    pub diversity: Option<f64>,
    pub mode_collapse: bool,
    pub discriminator_saturated: bool,
    /// `false` when a non-finite loss or gradient rejected the update.
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    /// The configured step budget was reached.
    Budget,
    /// Early stopping fired after `step` steps.
    Plateau { step: usize },
    /// A non-finite loss was produced at `step`; the returned state is the last good one.
    NumericalInstability { step: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub reports: Vec<StepReport>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn last(&self) -> Option<&StepReport> {
        self.reports.last()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub state: TrainState,
    pub history: TrainingHistory,
    pub termination: Termination,
}

fn check_dataset(cfg: &GanConfig, data: &[Trajectory]) -> Result<()> {
    let len = common_length(data)?;
    if len != cfg.generator.length {
        return Err(Error::Shape("dataset trajectory length differs from generator length"));
    }
    if data.iter().any(|t| !t.is_finite()) {
        return Err(Error::InvalidInput("dataset contains non-finite states"));
    }
    Ok(())
}

fn diversity_noise(cfg: &GanConfig) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(DIVERSITY_SEED);
    let nd = cfg.generator.noise_dim;
    Array2::from_shape_fn((cfg.diversity_samples, nd), |_| {
        rand_distr::StandardNormal.sample(&mut rng)
    })
}

fn rejected(step: usize, real_label: f64) -> StepReport {
    StepReport {
        step,
        d_loss: f64::NAN,
        g_loss: f64::NAN,
        d_real_score: f64::NAN,
        d_fake_score: f64::NAN,
        real_label,
        diversity: None,
        mode_collapse: false,
        discriminator_saturated: false,
        accepted: false,
    }
}

/// Advance `state` by one adversarial step.
///
/// Returns the new state and its report. If any loss or gradient is non-finite the input state is
/// returned unchanged and the report has `accepted == false`.
pub fn train_step(
    state: &TrainState,
    data: &[Trajectory],
    cfg: &GanConfig,
) -> Result<(TrainState, StepReport)> {
    cfg.validate()?;
    check_dataset(cfg, data)?;
    if state.generator.config != cfg.generator || state.discriminator.config != cfg.discriminator {
        return Err(Error::InvalidInput("train state architecture differs from config"));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    // Stream 0 is reserved for initialization.
    rng.set_stream(state.step as u64 + 1);

    let smoothing = Normal::new(cfg.label_mean, cfg.label_std)
        .map_err(|_| Error::InvalidInput("invalid label smoothing distribution"))?;
    let real_label = smoothing.sample(&mut rng).min(1.0);
    let label = real_label as f32;

    let mut next = state.clone();
    let n = data.len();
    let b = cfg.batch_size;
    let inv_b = 1.0 / b as f32;

    // Discriminator.
    let (mut d_loss, mut d_real, mut d_fake) = (0.0f64, 0.0f64, 0.0f64);
    for _ in 0..cfg.d_steps {
        let mut grads = None;
        let (mut real_sum, mut fake_sum) = (0.0f64, 0.0f64);
        let (mut real_score, mut fake_score) = (0.0f64, 0.0f64);
        for _ in 0..b {
            let real = &data[rng.random_range(0..n)];
            let u_real = next.generator.normalizer.normalize_trajectory(real);
            let z = next.generator.sample_noise(&mut rng);
            let (_, g_trace) = next.generator.forward_traced(&z.view(), &real.initial())?;

            let (logit, tr) = next.discriminator.forward_normalized(&u_real.view())?;
            let (l, dl) = nn::bce_with_logit(logit, label);
            real_sum += l as f64;
            real_score += nn::sigmoid(logit) as f64;
            let (g_real, _) = next.discriminator.backward(&tr, 0.5 * dl * inv_b);

            let (logit, tr) = next.discriminator.forward_normalized(&g_trace.normalized().view())?;
            let (l, dl) = nn::bce_with_logit(logit, 0.0);
            fake_sum += l as f64;
            fake_score += nn::sigmoid(logit) as f64;
            let (g_fake, _) = next.discriminator.backward(&tr, 0.5 * dl * inv_b);

            let mut pair = g_real;
            pair.accumulate(&g_fake);
            match grads.as_mut() {
                None => grads = Some(pair),
                Some(acc) => acc.accumulate(&pair),
            }
        }
        let bf = b as f64;
        d_loss = 0.5 * (real_sum / bf + fake_sum / bf);
        d_real = real_score / bf;
        d_fake = fake_score / bf;
        let grads = grads.ok_or(Error::InvalidInput("batch_size must be >= 1"))?;
        if !d_loss.is_finite() || !grads.is_finite() {
            warn!(step = state.step, d_loss, "non-finite discriminator loss; step rejected");
            return Ok((state.clone(), rejected(state.step, real_label)));
        }
        next.discriminator.apply(&grads, &mut next.opt_d);
    }

    // Generator, through the updated (frozen) discriminator.
    let mut g_loss = 0.0f64;
    for _ in 0..cfg.g_steps {
        let mut grads = None;
        let mut sum = 0.0f64;
        for _ in 0..b {
            let x0 = data[rng.random_range(0..n)].initial();
            let z = next.generator.sample_noise(&mut rng);
            let (_, g_trace) = next.generator.forward_traced(&z.view(), &x0)?;
            let (logit, tr) = next.discriminator.forward_normalized(&g_trace.normalized().view())?;
            let (l, dl) = nn::bce_with_logit(logit, label);
            sum += l as f64;
            let (_, du) = next.discriminator.backward(&tr, dl * inv_b);
            let g = next.generator.backward(&g_trace, &du.view())?;
            match grads.as_mut() {
                None => grads = Some(g),
                Some(acc) => acc.accumulate(&g),
            }
        }
        g_loss = sum / b as f64;
        let grads = grads.ok_or(Error::InvalidInput("batch_size must be >= 1"))?;
        if !g_loss.is_finite() || !grads.is_finite() {
            warn!(step = state.step, g_loss, "non-finite generator loss; step rejected");
            return Ok((state.clone(), rejected(state.step, real_label)));
        }
        next.generator.apply(&grads, &mut next.opt_g);
    }

    let mut report = StepReport {
        step: state.step,
        d_loss,
        g_loss,
        d_real_score: d_real,
        d_fake_score: d_fake,
        real_label,
        diversity: None,
        mode_collapse: false,
        discriminator_saturated: d_loss < cfg.saturation_threshold,
        accepted: true,
    };

    if cfg.check_every > 0 && (state.step + 1) % cfg.check_every == 0 {
        let noise = diversity_noise(cfg);
        let div = next.generator.diversity(&data[0].initial(), &noise.view())?;
        report.diversity = Some(div);
        report.mode_collapse = div < cfg.collapse_threshold;
    }

    if report.mode_collapse {
        warn!(step = state.step, diversity = report.diversity, "possible mode collapse");
    }
    if report.discriminator_saturated {
        warn!(step = state.step, d_loss, "discriminator saturated");
    }
    debug!(
        step = state.step,
        d_loss,
        g_loss,
        d_real = report.d_real_score,
        d_fake = report.d_fake_score,
        "gan step"
    );

    next.step += 1;
    Ok((next, report))
}

fn plateaued(reports: &[StepReport], es: &EarlyStop) -> bool {
    let w = es.window;
    if reports.len() < 2 * w {
        return false;
    }
    let ratio = |r: &StepReport| r.d_loss / r.g_loss.max(1e-12);
    let tail = &reports[reports.len() - 2 * w..];
    let prev: f64 = tail[..w].iter().map(ratio).sum::<f64>() / w as f64;
    let now: f64 = tail[w..].iter().map(ratio).sum::<f64>() / w as f64;
    (now - prev).abs() < es.tolerance
}

/// Train from scratch until the budget, a plateau, or numerical instability.
pub fn train(data: &[Trajectory], cfg: &GanConfig) -> Result<TrainOutcome> {
    let state = TrainState::init(cfg, data)?;
    resume(state, data, cfg, None)
}

/// Continue training `state` until `cfg.steps` total steps.
///
/// With `checkpoint_dir` set and `cfg.checkpoint_every = Some(k)`, a checkpoint is written after
/// every `k`-th step and once more at termination.
pub fn resume(
    mut state: TrainState,
    data: &[Trajectory],
    cfg: &GanConfig,
    checkpoint_dir: Option<&Path>,
) -> Result<TrainOutcome> {
    cfg.validate()?;
    check_dataset(cfg, data)?;
    if let Some(dir) = checkpoint_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut history = TrainingHistory::default();
    let mut termination = Termination::Budget;
    info!(
        from = state.step,
        to = cfg.steps,
        generator_params = state.generator.parameter_count(),
        discriminator_params = state.discriminator.parameter_count(),
        "gan training start"
    );

    while state.step < cfg.steps {
        let (next, report) = train_step(&state, data, cfg)?;
        let accepted = report.accepted;
        history.reports.push(report);
        if !accepted {
            termination = Termination::NumericalInstability { step: state.step };
            break;
        }
        state = next;

        if let (Some(dir), Some(every)) = (checkpoint_dir, cfg.checkpoint_every) {
            if state.step % every == 0 {
                let path = checkpoint::save_in_dir(dir, cfg, &state)?;
                info!(step = state.step, path = %path.display(), "checkpoint written");
            }
        }

        if let Some(es) = &cfg.early_stop {
            if plateaued(&history.reports, es) {
                termination = Termination::Plateau { step: state.step };
                break;
            }
        }
    }

    if let Some(dir) = checkpoint_dir {
        checkpoint::save_in_dir(dir, cfg, &state)?;
    }
    info!(step = state.step, ?termination, "gan training finished");

    Ok(TrainOutcome {
        state,
        history,
        termination,
    })
}

/// Sample one generated trajectory per initial condition, seeded explicitly.
pub fn sample(
    generator: &ConditionalGenerator,
    initial_conditions: &[State],
    seed: u64,
) -> Result<Vec<Trajectory>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    generator.generate_batch(initial_conditions, &mut rng)
}

/// Mean discriminator score over a set of trajectories.
pub fn mean_score(
    discriminator: &ConditionalDiscriminator,
    trajectories: &[Trajectory],
) -> Result<f64> {
    if trajectories.is_empty() {
        return Err(Error::InvalidInput("need at least one trajectory"));
    }
    let scores = trajectories
        .iter()
        .map(|t| discriminator.score(t).map(|s| s as f64))
        .collect::<Result<Array1<f64>>>()?;
    Ok(scores.mean().unwrap_or(f64::NAN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorenz::ParameterSet;
    use crate::simulate::{simulate_ensemble, InitialConditionBox, SimulationConfig};

    fn tiny_cfg(len: usize) -> GanConfig {
        GanConfig {
            generator: GeneratorConfig {
                noise_dim: 4,
                hidden: 8,
                length: len,
                max_norm: 3.0,
            },
            discriminator: DiscriminatorConfig {
                length: len,
                channels: 4,
                kernel: 3,
                hidden: 4,
                alpha: 0.2,
            },
            batch_size: 4,
            steps: 6,
            check_every: 3,
            diversity_samples: 3,
            seed: 11,
            ..GanConfig::default()
        }
    }

    fn tiny_data(len: usize) -> Vec<Trajectory> {
        let sim = SimulationConfig {
            length: len,
            burn_in: 100,
            ..SimulationConfig::default()
        };
        simulate_ensemble(
            &ParameterSet::classic(),
            &InitialConditionBox::default(),
            6,
            &sim,
            3,
        )
        .unwrap()
    }

    #[test]
    fn train_step_is_pure_and_deterministic() {
        let cfg = tiny_cfg(16);
        let data = tiny_data(16);
        let s0 = TrainState::init(&cfg, &data).unwrap();
        let before = s0.clone();
        let (a, ra) = train_step(&s0, &data, &cfg).unwrap();
        let (b, rb) = train_step(&s0, &data, &cfg).unwrap();
        assert_eq!(s0, before);
        assert_eq!(a, b);
        assert_eq!(ra, rb);
        assert_eq!(a.step, 1);
        assert!(ra.accepted);
        assert!(ra.d_loss.is_finite() && ra.g_loss.is_finite());
        assert!((0.0..=1.0).contains(&ra.d_real_score));
        assert!(ra.real_label <= 1.0);
        assert_ne!(a.discriminator, s0.discriminator);
        assert_ne!(a.generator, s0.generator);
    }

    #[test]
    fn train_runs_to_budget_and_measures_diversity() {
        let cfg = tiny_cfg(16);
        let data = tiny_data(16);
        let out = train(&data, &cfg).unwrap();
        assert_eq!(out.termination, Termination::Budget);
        assert_eq!(out.state.step, 6);
        assert_eq!(out.history.len(), 6);
        let measured: Vec<_> = out
            .history
            .reports
            .iter()
            .filter(|r| r.diversity.is_some())
            .map(|r| r.step)
            .collect();
        assert_eq!(measured, vec![2, 5]);
        let json = out.history.to_json().unwrap();
        assert!(json.contains("d_loss"));
    }

    #[test]
    fn early_stop_fires_on_flat_ratio() {
        let flat = |step| StepReport {
            step,
            d_loss: 0.7,
            g_loss: 0.7,
            d_real_score: 0.5,
            d_fake_score: 0.5,
            real_label: 0.9,
            diversity: None,
            mode_collapse: false,
            discriminator_saturated: false,
            accepted: true,
        };
        let reports: Vec<_> = (0..8).map(flat).collect();
        let es = EarlyStop {
            window: 4,
            tolerance: 1e-6,
        };
        assert!(plateaued(&reports, &es));
        assert!(!plateaued(&reports[..7], &es));
    }

    #[test]
    fn non_finite_update_is_rejected_without_mutation() {
        let cfg = tiny_cfg(16);
        let data = tiny_data(16);
        let mut s0 = TrainState::init(&cfg, &data).unwrap();
        s0.discriminator.out_b[0] = f32::NAN;
        let (s1, r) = train_step(&s0, &data, &cfg).unwrap();
        assert!(!r.accepted);
        assert_eq!(s1.step, s0.step);
        assert_eq!(s1.generator, s0.generator);

        let out = resume(s0, &data, &cfg, None).unwrap();
        assert_eq!(out.termination, Termination::NumericalInstability { step: 0 });
    }

    #[test]
    fn dataset_length_must_match_generator() {
        let cfg = tiny_cfg(16);
        let data = tiny_data(12);
        assert!(matches!(TrainState::init(&cfg, &data), Err(Error::Shape(_))));
        assert!(TrainState::init(&cfg, &[]).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = tiny_cfg(16);
        cfg.discriminator.length = 15;
        assert!(cfg.validate().is_err());
        let cfg = GanConfig {
            label_std: -1.0,
            ..tiny_cfg(16)
        };
        assert!(cfg.validate().is_err());
    }
}
