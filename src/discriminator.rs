//! Conditional temporal-convolution discriminator.
//!
//! Per-step features are `[u_t, u_t - u_{t-1}]` (position and increment, normalized units). A
//! valid 1-D convolution over time, leaky ReLU, and mean pooling summarize the dynamics; the pooled
//! summary is concatenated with the conditioning state `u_0` and mapped through one dense hidden
//! layer to a scalar logit.
//!
//! Gradients are available both for the parameters and for the input trajectory, which is how
//! the generator is trained through a frozen discriminator.

use crate::nn::{self, Adam};
use crate::trajectory::{Normalizer, Trajectory};
use crate::{Error, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

const FEATURES: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// Expected trajectory length `L`.
    pub length: usize,
    /// Convolution output channels.
    pub channels: usize,
    /// Convolution kernel width (time steps).
    pub kernel: usize,
    /// Dense hidden width.
    pub hidden: usize,
    /// Leaky ReLU negative slope.
    pub alpha: f32,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            length: 100,
            channels: 16,
            kernel: 5,
            hidden: 16,
            alpha: 0.2,
        }
    }
}

impl DiscriminatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.hidden == 0 || self.kernel == 0 {
            return Err(Error::InvalidInput("channels, hidden and kernel must be >= 1"));
        }
        if self.length < 2 || self.kernel > self.length {
            return Err(Error::InvalidInput("need 2 <= length and kernel <= length"));
        }
        if !(self.alpha >= 0.0) || !self.alpha.is_finite() {
            return Err(Error::InvalidInput("alpha must be finite and nonnegative"));
        }
        Ok(())
    }

    fn positions(&self) -> usize {
        self.length - self.kernel + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalDiscriminator {
    pub config: DiscriminatorConfig,
    pub normalizer: Normalizer,
    /// channels × 6 × kernel
    pub(crate) conv_w: Array3<f32>,
    pub(crate) conv_b: Array1<f32>,
    /// hidden × (channels + 3)
    pub(crate) dense_w: Array2<f32>,
    pub(crate) dense_b: Array1<f32>,
    pub(crate) out_w: Array1<f32>,
    pub(crate) out_b: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct DiscriminatorGrads {
    pub(crate) conv_w: Array3<f32>,
    pub(crate) conv_b: Array1<f32>,
    pub(crate) dense_w: Array2<f32>,
    pub(crate) dense_b: Array1<f32>,
    pub(crate) out_w: Array1<f32>,
    pub(crate) out_b: Array1<f32>,
}

impl DiscriminatorGrads {
    fn zeros(cfg: &DiscriminatorConfig) -> Self {
        Self {
            conv_w: Array3::zeros((cfg.channels, FEATURES, cfg.kernel)),
            conv_b: Array1::zeros(cfg.channels),
            dense_w: Array2::zeros((cfg.hidden, cfg.channels + 3)),
            dense_b: Array1::zeros(cfg.hidden),
            out_w: Array1::zeros(cfg.hidden),
            out_b: Array1::zeros(1),
        }
    }

    pub fn accumulate(&mut self, other: &DiscriminatorGrads) {
        self.conv_w += &other.conv_w;
        self.conv_b += &other.conv_b;
        self.dense_w += &other.dense_w;
        self.dense_b += &other.dense_b;
        self.out_w += &other.out_w;
        self.out_b += &other.out_b;
    }

    pub fn scale(&mut self, s: f32) {
        self.conv_w *= s;
        self.conv_b *= s;
        self.dense_w *= s;
        self.dense_b *= s;
        self.out_w *= s;
        self.out_b *= s;
    }

    pub fn is_finite(&self) -> bool {
        self.conv_w.iter().all(|x| x.is_finite())
            && self.dense_w.iter().all(|x| x.is_finite())
            && [&self.conv_b, &self.dense_b, &self.out_w, &self.out_b]
                .iter()
                .all(|a| a.iter().all(|x| x.is_finite()))
    }
}

/// Activations kept for the backward pass.
#[derive(Debug, Clone)]
pub struct DiscriminatorTrace {
    features: Array2<f32>,
    pre: Array2<f32>,
    pooled: Array1<f32>,
    hidden_pre: Array1<f32>,
    hidden: Array1<f32>,
}

impl ConditionalDiscriminator {
    pub fn new(
        config: DiscriminatorConfig,
        normalizer: Normalizer,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        config.validate()?;
        let (c, k, h) = (config.channels, config.kernel, config.hidden);
        let a = (6.0 / ((FEATURES * k) + c) as f32).sqrt();
        let conv_w = Array3::from_shape_fn((c, FEATURES, k), |_| rng.random_range(-a..a));
        let out_w = nn::glorot(1, h, 1.0, rng).row(0).to_owned();
        Ok(Self {
            conv_w,
            conv_b: Array1::zeros(c),
            dense_w: nn::glorot(h, c + 3, 1.0, rng),
            dense_b: Array1::zeros(h),
            out_w,
            out_b: Array1::zeros(1),
            config,
            normalizer,
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.conv_w.len()
            + self.conv_b.len()
            + self.dense_w.len()
            + self.dense_b.len()
            + self.out_w.len()
            + self.out_b.len()
    }

    /// Every parameter has the dimensions its config implies.
    pub fn check_shapes(&self) -> Result<()> {
        self.config.validate()?;
        let cfg = &self.config;
        let vectors = [
            (&self.conv_b, cfg.channels),
            (&self.dense_b, cfg.hidden),
            (&self.out_w, cfg.hidden),
            (&self.out_b, 1),
        ];
        if self.conv_w.dim() != (cfg.channels, FEATURES, cfg.kernel)
            || self.dense_w.dim() != (cfg.hidden, cfg.channels + 3)
            || vectors.iter().any(|(b, n)| b.len() != *n)
        {
            return Err(Error::Shape("discriminator parameters do not match its config"));
        }
        Ok(())
    }

    /// Raw logit for a trajectory in Lorenz coordinates (conditioned on its own first state).
    pub fn logit(&self, trajectory: &Trajectory) -> Result<f32> {
        let u = self.normalizer.normalize_trajectory(trajectory);
        self.forward_normalized(&u.view()).map(|(l, _)| l)
    }

    /// Realism score in `[0, 1]`.
    pub fn score(&self, trajectory: &Trajectory) -> Result<f32> {
        self.logit(trajectory).map(nn::sigmoid)
    }

    /// Forward pass on a normalized `L × 3` trajectory; row 0 is the condition.
    pub fn forward_normalized(&self, u: &ArrayView2<f32>) -> Result<(f32, DiscriminatorTrace)> {
        self.check_shapes()?;
        let cfg = &self.config;
        let len = cfg.length;
        if u.dim() != (len, 3) {
            return Err(Error::Shape("discriminator input must be length × 3"));
        }
        let alpha = cfg.alpha;
        let positions = cfg.positions();

        let mut features = Array2::<f32>::zeros((len, FEATURES));
        for t in 0..len {
            for k in 0..3 {
                features[[t, k]] = u[[t, k]];
                if t > 0 {
                    features[[t, 3 + k]] = u[[t, k]] - u[[t - 1, k]];
                }
            }
        }

        let mut pre = Array2::<f32>::zeros((cfg.channels, positions));
        let mut pooled = Array1::<f32>::zeros(cfg.channels + 3);
        for c in 0..cfg.channels {
            let mut acc = 0.0f32;
            for p in 0..positions {
                let mut s = self.conv_b[c];
                for j in 0..cfg.kernel {
                    for i in 0..FEATURES {
                        s += self.conv_w[[c, i, j]] * features[[p + j, i]];
                    }
                }
                pre[[c, p]] = s;
                acc += nn::leaky_relu(s, alpha);
            }
            pooled[c] = acc / positions as f32;
        }
        for k in 0..3 {
            pooled[cfg.channels + k] = u[[0, k]];
        }

        let hidden_pre = self.dense_w.dot(&pooled) + &self.dense_b;
        let hidden = hidden_pre.mapv(|x| nn::leaky_relu(x, alpha));
        let logit = self.out_w.dot(&hidden) + self.out_b[0];

        Ok((
            logit,
            DiscriminatorTrace {
                features,
                pre,
                pooled,
                hidden_pre,
                hidden,
            },
        ))
    }

    /// Backpropagate `dL/dlogit`. Returns parameter gradients and `dL/du` (`L × 3`).
    pub fn backward(
        &self,
        trace: &DiscriminatorTrace,
        dlogit: f32,
    ) -> (DiscriminatorGrads, Array2<f32>) {
        let cfg = &self.config;
        let alpha = cfg.alpha;
        let len = cfg.length;
        let positions = cfg.positions();
        let mut g = DiscriminatorGrads::zeros(cfg);

        // Output layer.
        g.out_w.scaled_add(dlogit, &trace.hidden);
        g.out_b[0] = dlogit;

        // Dense hidden layer.
        let dhidden_pre = Array1::from_shape_fn(cfg.hidden, |i| {
            dlogit * self.out_w[i] * nn::leaky_relu_grad(trace.hidden_pre[i], alpha)
        });
        nn::add_outer(&mut g.dense_w, &dhidden_pre.view(), &trace.pooled.view());
        g.dense_b += &dhidden_pre;
        let dpooled = self.dense_w.t().dot(&dhidden_pre);

        // Convolution + pooling.
        let mut dfeatures = Array2::<f32>::zeros((len, FEATURES));
        let inv_p = 1.0 / positions as f32;
        for c in 0..cfg.channels {
            let dpool = dpooled[c] * inv_p;
            if dpool == 0.0 {
                continue;
            }
            for p in 0..positions {
                let dpre = dpool * nn::leaky_relu_grad(trace.pre[[c, p]], alpha);
                g.conv_b[c] += dpre;
                for j in 0..cfg.kernel {
                    for i in 0..FEATURES {
                        g.conv_w[[c, i, j]] += dpre * trace.features[[p + j, i]];
                        dfeatures[[p + j, i]] += dpre * self.conv_w[[c, i, j]];
                    }
                }
            }
        }

        // Features -> trajectory.
        let mut du = Array2::<f32>::zeros((len, 3));
        for t in 0..len {
            for k in 0..3 {
                du[[t, k]] += dfeatures[[t, k]];
                if t > 0 {
                    let dinc = dfeatures[[t, 3 + k]];
                    du[[t, k]] += dinc;
                    du[[t - 1, k]] -= dinc;
                }
            }
        }
        for k in 0..3 {
            du[[0, k]] += dpooled[cfg.channels + k];
        }

        (g, du)
    }

    /// One Adam round over all parameters.
    pub fn apply(&mut self, grads: &DiscriminatorGrads, opt: &mut Adam) {
        opt.begin_round();
        opt.update(0, &mut self.conv_w, &grads.conv_w);
        opt.update(1, &mut self.conv_b, &grads.conv_b);
        opt.update(2, &mut self.dense_w, &grads.dense_w);
        opt.update(3, &mut self.dense_b, &grads.dense_b);
        opt.update(4, &mut self.out_w, &grads.out_w);
        opt.update(5, &mut self.out_b, &grads.out_b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorenz::ParameterSet;
    use crate::simulate::{simulate, SimulationConfig};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small() -> ConditionalDiscriminator {
        let cfg = DiscriminatorConfig {
            length: 10,
            channels: 4,
            kernel: 3,
            hidden: 5,
            alpha: 0.2,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let mut d = ConditionalDiscriminator::new(cfg, Normalizer::identity(), &mut rng).unwrap();
        d.conv_b = Array1::from_vec(vec![0.1, -0.1, 0.05, 0.0]);
        d.dense_b = Array1::from_vec(vec![0.02, -0.03, 0.1, 0.0, 0.05]);
        d
    }

    fn wavy_input() -> Array2<f32> {
        Array2::from_shape_fn((10, 3), |(t, k)| {
            ((t as f32) * 0.37 + (k as f32) * 1.3).sin() * 1.5 + 0.1 * k as f32
        })
    }

    #[test]
    fn resized_parameters_are_rejected_before_the_forward_pass() {
        let mut d = small();
        d.check_shapes().unwrap();
        d.dense_w = Array2::zeros((5, 6));
        assert!(matches!(d.check_shapes(), Err(Error::Shape(_))));
        assert!(matches!(
            d.forward_normalized(&wavy_input().view()),
            Err(Error::Shape(_))
        ));

        let mut d = small();
        d.config.channels = 5;
        assert!(d.check_shapes().is_err());
    }

    #[test]
    fn score_is_in_unit_interval_for_lorenz_data() {
        let p = ParameterSet::classic();
        let cfg = SimulationConfig::default();
        let t = simulate(&p, &[1.0, 1.0, 20.0], &cfg).unwrap();
        let nz = Normalizer::fit(&[t.clone()]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let d =
            ConditionalDiscriminator::new(DiscriminatorConfig::default(), nz, &mut rng).unwrap();
        let s = d.score(&t).unwrap();
        assert!((0.0..=1.0).contains(&s));
        assert!(d.logit(&t).unwrap().is_finite());
    }

    #[test]
    fn wrong_length_is_a_shape_error() {
        let d = small();
        let u = Array2::<f32>::zeros((9, 3));
        assert!(matches!(d.forward_normalized(&u.view()), Err(Error::Shape(_))));
    }

    #[test]
    fn input_gradient_matches_finite_differences() {
        let d = small();
        let u = wavy_input();
        let (_, trace) = d.forward_normalized(&u.view()).unwrap();
        let (_, du) = d.backward(&trace, 1.0);
        let h = 1e-2f32;
        for &(t, k) in &[(0usize, 0usize), (3, 1), (6, 2), (9, 0)] {
            let mut up = u.clone();
            up[[t, k]] += h;
            let mut um = u.clone();
            um[[t, k]] -= h;
            let lp = d.forward_normalized(&up.view()).unwrap().0;
            let lm = d.forward_normalized(&um.view()).unwrap().0;
            let fd = (lp - lm) / (2.0 * h);
            assert!(
                (du[[t, k]] - fd).abs() <= 2e-2 * (1.0 + fd.abs()),
                "du[{t},{k}] analytic={} fd={fd}",
                du[[t, k]]
            );
        }
    }

    #[test]
    fn parameter_gradient_matches_finite_differences() {
        let d = small();
        let u = wavy_input();
        let (_, trace) = d.forward_normalized(&u.view()).unwrap();
        let (g, _) = d.backward(&trace, 1.0);
        let h = 1e-2f32;
        let logit = |d: &ConditionalDiscriminator| d.forward_normalized(&u.view()).unwrap().0;

        for &(c, i, j) in &[(0usize, 0usize, 0usize), (2, 4, 1), (3, 5, 2)] {
            let mut dp = d.clone();
            dp.conv_w[[c, i, j]] += h;
            let mut dm = d.clone();
            dm.conv_w[[c, i, j]] -= h;
            let fd = (logit(&dp) - logit(&dm)) / (2.0 * h);
            assert!(
                (g.conv_w[[c, i, j]] - fd).abs() <= 2e-2 * (1.0 + fd.abs()),
                "conv_w analytic={} fd={fd}",
                g.conv_w[[c, i, j]]
            );
        }
        for &(i, j) in &[(0usize, 1usize), (4, 6)] {
            let mut dp = d.clone();
            dp.dense_w[[i, j]] += h;
            let mut dm = d.clone();
            dm.dense_w[[i, j]] -= h;
            let fd = (logit(&dp) - logit(&dm)) / (2.0 * h);
            assert!((g.dense_w[[i, j]] - fd).abs() <= 2e-2 * (1.0 + fd.abs()));
        }
        assert!((g.out_b[0] - 1.0).abs() < 1e-6);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_logit_is_finite_for_finite_input(
            vals in prop::collection::vec(-1e3f32..1e3f32, 30),
        ) {
            let d = small();
            let u = Array2::from_shape_vec((10, 3), vals).unwrap();
            let (l, _) = d.forward_normalized(&u.view()).unwrap();
            prop_assert!(l.is_finite());
            prop_assert!((0.0..=1.0).contains(&nn::sigmoid(l)));
        }
    }
}
