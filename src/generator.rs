//! Conditional recurrent generator.
//!
//! Maps `(z, x0)` to a trajectory of length `L` in normalized coordinates:
//!
//! \[
//! h_0 = \tanh(A z + B c + b_0), \quad
//! h_t = \tanh(W h_{t-1} + U u_{t-1} + b), \quad
//! u_t = u_{t-1} + V h_t + b_v,
//! \]
//!
//! with `c = u_0 = normalize(x0)`. Each step conditions on the noise (through `h`) and on the
//! evolving output history (through `u_{t-1}`). The residual output layer starts at zero, so an
//! untrained generator holds its initial condition.
//!
//! The first emitted state is overwritten with `x0` after denormalization. This is a hard
//! post-processing override: it holds bit-for-bit for every weight setting, including inference
//! on initial conditions never seen in training.

use crate::lorenz::{is_finite_state, State};
use crate::nn::{self, Adam};
use crate::trajectory::{Normalizer, Trajectory};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Generator shape and constraint knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Noise vector length.
    pub noise_dim: usize,
    /// Recurrent state width.
    pub hidden: usize,
    /// Output trajectory length `L`.
    pub length: usize,
    /// Row-norm cap applied to the recurrent kernels after each update.
    pub max_norm: f32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            noise_dim: 16,
            hidden: 32,
            length: 100,
            max_norm: 3.0,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.noise_dim == 0 || self.hidden == 0 {
            return Err(Error::InvalidInput("noise_dim and hidden must be >= 1"));
        }
        if self.length < 2 {
            return Err(Error::InvalidInput("generator length must be >= 2"));
        }
        if !(self.max_norm > 0.0) || !self.max_norm.is_finite() {
            return Err(Error::InvalidInput("max_norm must be positive and finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalGenerator {
    pub config: GeneratorConfig,
    pub normalizer: Normalizer,
    /// `A`: hidden × noise_dim
    pub(crate) w_z: Array2<f32>,
    /// `B`: hidden × 3
    pub(crate) w_c: Array2<f32>,
    pub(crate) b_0: Array1<f32>,
    /// `W`: hidden × hidden
    pub(crate) w_hh: Array2<f32>,
    /// `U`: hidden × 3
    pub(crate) w_uh: Array2<f32>,
    pub(crate) b_h: Array1<f32>,
    /// `V`: 3 × hidden
    pub(crate) w_out: Array2<f32>,
    pub(crate) b_out: Array1<f32>,
}

/// Gradients with the same layout as [`ConditionalGenerator`]'s parameters.
#[derive(Debug, Clone)]
pub struct GeneratorGrads {
    pub(crate) w_z: Array2<f32>,
    pub(crate) w_c: Array2<f32>,
    pub(crate) b_0: Array1<f32>,
    pub(crate) w_hh: Array2<f32>,
    pub(crate) w_uh: Array2<f32>,
    pub(crate) b_h: Array1<f32>,
    pub(crate) w_out: Array2<f32>,
    pub(crate) b_out: Array1<f32>,
}

impl GeneratorGrads {
    fn zeros(cfg: &GeneratorConfig) -> Self {
        let h = cfg.hidden;
        Self {
            w_z: Array2::zeros((h, cfg.noise_dim)),
            w_c: Array2::zeros((h, 3)),
            b_0: Array1::zeros(h),
            w_hh: Array2::zeros((h, h)),
            w_uh: Array2::zeros((h, 3)),
            b_h: Array1::zeros(h),
            w_out: Array2::zeros((3, h)),
            b_out: Array1::zeros(3),
        }
    }

    /// `self += other`.
    pub fn accumulate(&mut self, other: &GeneratorGrads) {
        self.w_z += &other.w_z;
        self.w_c += &other.w_c;
        self.b_0 += &other.b_0;
        self.w_hh += &other.w_hh;
        self.w_uh += &other.w_uh;
        self.b_h += &other.b_h;
        self.w_out += &other.w_out;
        self.b_out += &other.b_out;
    }

    pub fn scale(&mut self, s: f32) {
        self.w_z *= s;
        self.w_c *= s;
        self.b_0 *= s;
        self.w_hh *= s;
        self.w_uh *= s;
        self.b_h *= s;
        self.w_out *= s;
        self.b_out *= s;
    }

    pub fn is_finite(&self) -> bool {
        [&self.w_z, &self.w_c, &self.w_hh, &self.w_uh, &self.w_out]
            .iter()
            .all(|a| a.iter().all(|x| x.is_finite()))
            && [&self.b_0, &self.b_h, &self.b_out]
                .iter()
                .all(|a| a.iter().all(|x| x.is_finite()))
    }
}

/// Everything the backward pass needs from one forward pass.
#[derive(Debug, Clone)]
pub struct GeneratorTrace {
    z: Array1<f32>,
    /// Hidden states, row `t` is `h_t` (`L × hidden`).
    h: Array2<f32>,
    /// Normalized outputs, row `t` is `u_t` (`L × 3`). Row 0 is the condition `c`.
    u: Array2<f32>,
}

impl GeneratorTrace {
    /// The generated trajectory in normalized coordinates.
    pub fn normalized(&self) -> &Array2<f32> {
        &self.u
    }
}

impl ConditionalGenerator {
    /// Fresh generator: Glorot-uniform recurrent weights, zero output layer.
    pub fn new(config: GeneratorConfig, normalizer: Normalizer, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let h = config.hidden;
        Ok(Self {
            w_z: nn::glorot(h, config.noise_dim, 1.0, rng),
            w_c: nn::glorot(h, 3, 1.0, rng),
            b_0: Array1::zeros(h),
            w_hh: nn::glorot(h, h, 1.0, rng),
            w_uh: nn::glorot(h, 3, 1.0, rng),
            b_h: Array1::zeros(h),
            w_out: Array2::zeros((3, h)),
            b_out: Array1::zeros(3),
            config,
            normalizer,
        })
    }

    pub fn length(&self) -> usize {
        self.config.length
    }

    pub fn noise_dim(&self) -> usize {
        self.config.noise_dim
    }

    pub fn parameter_count(&self) -> usize {
        self.w_z.len()
            + self.w_c.len()
            + self.b_0.len()
            + self.w_hh.len()
            + self.w_uh.len()
            + self.b_h.len()
            + self.w_out.len()
            + self.b_out.len()
    }

    /// Every parameter has the dimensions its config implies.
    pub fn check_shapes(&self) -> Result<()> {
        self.config.validate()?;
        let h = self.config.hidden;
        let matrices = [
            (&self.w_z, (h, self.config.noise_dim)),
            (&self.w_c, (h, 3)),
            (&self.w_hh, (h, h)),
            (&self.w_uh, (h, 3)),
            (&self.w_out, (3, h)),
        ];
        let vectors = [(&self.b_0, h), (&self.b_h, h), (&self.b_out, 3)];
        if matrices.iter().any(|(w, dim)| w.dim() != *dim)
            || vectors.iter().any(|(b, n)| b.len() != *n)
        {
            return Err(Error::Shape("generator parameters do not match its config"));
        }
        Ok(())
    }

    /// Draw one standard-normal noise vector.
    pub fn sample_noise(&self, rng: &mut impl Rng) -> Array1<f32> {
        Array1::from_shape_fn(self.config.noise_dim, |_| StandardNormal.sample(&mut *rng))
    }

    /// Generate one trajectory and keep the intermediate activations for [`Self::backward`].
    pub fn forward_traced(
        &self,
        noise: &ArrayView1<f32>,
        x0: &State,
    ) -> Result<(Trajectory, GeneratorTrace)> {
        self.check_shapes()?;
        if noise.len() != self.config.noise_dim {
            return Err(Error::InvalidInput("noise length must equal noise_dim"));
        }
        if noise.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput("noise must be finite"));
        }
        if !is_finite_state(x0) {
            return Err(Error::InvalidInput("initial condition must be finite"));
        }

        let len = self.config.length;
        let hid = self.config.hidden;
        let c = Array1::from_vec(self.normalizer.normalize(x0).to_vec());

        let mut h = Array2::<f32>::zeros((len, hid));
        let mut u = Array2::<f32>::zeros((len, 3));

        let h0 = (self.w_z.dot(noise) + self.w_c.dot(&c) + &self.b_0).mapv(f32::tanh);
        h.row_mut(0).assign(&h0);
        u.row_mut(0).assign(&c);

        for t in 1..len {
            let a = self.w_hh.dot(&h.row(t - 1)) + self.w_uh.dot(&u.row(t - 1)) + &self.b_h;
            let ht = a.mapv(f32::tanh);
            let ut = &u.row(t - 1) + &self.w_out.dot(&ht) + &self.b_out;
            h.row_mut(t).assign(&ht);
            u.row_mut(t).assign(&ut);
        }

        let mut states = Array2::<f64>::zeros((len, 3));
        for t in 1..len {
            let x = self.normalizer.denormalize(&[u[[t, 0]], u[[t, 1]], u[[t, 2]]]);
            for k in 0..3 {
                states[[t, k]] = x[k];
            }
        }
        // Hard-set the conditioning state.
        for k in 0..3 {
            states[[0, k]] = x0[k];
        }

        let traj = Trajectory::from_array(states)?;
        Ok((
            traj,
            GeneratorTrace {
                z: noise.to_owned(),
                h,
                u,
            },
        ))
    }

    /// Generate one trajectory from explicit noise.
    pub fn generate(&self, noise: &ArrayView1<f32>, x0: &State) -> Result<Trajectory> {
        self.forward_traced(noise, x0).map(|(t, _)| t)
    }

    /// Generate one trajectory per initial condition, drawing fresh noise for each.
    pub fn generate_batch(&self, x0s: &[State], rng: &mut impl Rng) -> Result<Vec<Trajectory>> {
        x0s.iter()
            .map(|x0| {
                let z = self.sample_noise(rng);
                self.generate(&z.view(), x0)
            })
            .collect()
    }

    /// Backpropagate `dL/du` (`L × 3`, normalized coordinates) through one forward pass.
    ///
    /// Row 0 of `grad_u` is ignored: the first state is the condition, not a model output.
    pub fn backward(
        &self,
        trace: &GeneratorTrace,
        grad_u: &ArrayView2<f32>,
    ) -> Result<GeneratorGrads> {
        let len = self.config.length;
        if grad_u.dim() != (len, 3) {
            return Err(Error::Shape("grad_u must be length × 3"));
        }

        let mut g = GeneratorGrads::zeros(&self.config);
        let mut du_next = Array1::<f32>::zeros(3);
        let mut dh_next = Array1::<f32>::zeros(self.config.hidden);

        for t in (1..len).rev() {
            let ht = trace.h.row(t);
            let du = &grad_u.row(t) + &du_next;

            nn::add_outer(&mut g.w_out, &du.view(), &ht);
            g.b_out += &du;

            let dh = self.w_out.t().dot(&du) + &dh_next;
            let da = Array1::from_shape_fn(dh.len(), |i| dh[i] * nn::tanh_grad_from_output(ht[i]));

            nn::add_outer(&mut g.w_hh, &da.view(), &trace.h.row(t - 1));
            nn::add_outer(&mut g.w_uh, &da.view(), &trace.u.row(t - 1));
            g.b_h += &da;

            dh_next = self.w_hh.t().dot(&da);
            du_next = du + self.w_uh.t().dot(&da);
        }

        let h0 = trace.h.row(0);
        let da0 = Array1::from_shape_fn(h0.len(), |i| {
            dh_next[i] * nn::tanh_grad_from_output(h0[i])
        });
        nn::add_outer(&mut g.w_z, &da0.view(), &trace.z.view());
        nn::add_outer(&mut g.w_c, &da0.view(), &trace.u.row(0));
        g.b_0 += &da0;

        Ok(g)
    }

    /// One Adam round over all parameters, then the max-norm constraint on recurrent kernels.
    pub fn apply(&mut self, grads: &GeneratorGrads, opt: &mut Adam) {
        opt.begin_round();
        opt.update(0, &mut self.w_z, &grads.w_z);
        opt.update(1, &mut self.w_c, &grads.w_c);
        opt.update(2, &mut self.b_0, &grads.b_0);
        opt.update(3, &mut self.w_hh, &grads.w_hh);
        opt.update(4, &mut self.w_uh, &grads.w_uh);
        opt.update(5, &mut self.b_h, &grads.b_h);
        opt.update(6, &mut self.w_out, &grads.w_out);
        opt.update(7, &mut self.b_out, &grads.b_out);
        nn::max_norm_rows(&mut self.w_hh, self.config.max_norm);
        nn::max_norm_rows(&mut self.w_uh, self.config.max_norm);
    }

    /// Mean per-element variance across noise draws for one initial condition
    /// (normalized units). Near zero means the noise is being ignored.
    pub fn diversity(&self, x0: &State, noises: &ArrayView2<f32>) -> Result<f64> {
        let k = noises.nrows();
        if k < 2 {
            return Err(Error::InvalidInput("diversity needs at least two noise draws"));
        }
        let len = self.config.length;
        let mut sum = Array2::<f64>::zeros((len, 3));
        let mut sum_sq = Array2::<f64>::zeros((len, 3));
        for z in noises.rows() {
            let (_, trace) = self.forward_traced(&z, x0)?;
            for (i, &v) in trace.u.iter().enumerate() {
                let (t, c) = (i / 3, i % 3);
                sum[[t, c]] += v as f64;
                sum_sq[[t, c]] += (v as f64) * (v as f64);
            }
        }
        let kf = k as f64;
        let mut total = 0.0;
        for (s, sq) in sum.iter().zip(sum_sq.iter()) {
            let mean = s / kf;
            total += (sq / kf - mean * mean).max(0.0);
        }
        Ok(total / (len * 3) as f64)
    }
}
