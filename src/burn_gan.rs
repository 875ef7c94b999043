//! Burn-backed (opt-in) adversarial training that exports to the ndarray model pair.
//!
//! Design goal: use Burn autodiff + Adam to train the same generator/discriminator architecture,
//! but keep the public model types ([`ConditionalGenerator`], [`ConditionalDiscriminator`])
//! unchanged by exporting learned parameters back into them. Burn never leaks into the default
//! API surface.
//!
//! The step loop mirrors [`crate::gan::train_step`]: per-step RNG from `(seed, step)`, smoothed
//! real labels, `d_steps` discriminator updates then `g_steps` generator updates, and the
//! max-norm constraint on the recurrent kernels. Optimizer moments are not exported, so a
//! Burn-trained pair continues in [`crate::gan`] with fresh Adam state.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::activation::{leaky_relu, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use burn_nn::conv::{Conv1d, Conv1dConfig};
use burn_nn::{Linear, LinearConfig};
use burn_optim::{AdamConfig, GradientsParams, LearningRate, Optimizer};
use ndarray::{Array1, Array2, Array3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use tracing::{debug, info, warn};

use crate::discriminator::{ConditionalDiscriminator, DiscriminatorConfig};
use crate::gan::{GanConfig, Termination};
use crate::generator::{ConditionalGenerator, GeneratorConfig};
use crate::trajectory::{common_length, Normalizer, Trajectory};
use crate::{Error, Result};

/// Default burn backend for GAN training: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

#[derive(Module, Debug)]
struct BurnGenerator<B: Backend> {
    w_z: Linear<B>,
    w_c: Linear<B>,
    w_hh: Linear<B>,
    w_uh: Linear<B>,
    w_out: Linear<B>,
    length: usize,
}

impl<B: Backend> BurnGenerator<B> {
    fn new(device: &B::Device, cfg: &GeneratorConfig) -> Self {
        let h = cfg.hidden;
        let mut w_out = LinearConfig::new(h, 3).init(device);
        // Residual output starts at zero: an untrained generator holds its initial condition.
        w_out.weight = w_out.weight.map(|w| w.zeros_like().require_grad());
        w_out.bias = w_out
            .bias
            .map(|b| b.map(|t| t.zeros_like().require_grad()));
        Self {
            w_z: LinearConfig::new(cfg.noise_dim, h).with_bias(false).init(device),
            w_c: LinearConfig::new(3, h).init(device),
            w_hh: LinearConfig::new(h, h).with_bias(false).init(device),
            w_uh: LinearConfig::new(3, h).init(device),
            w_out,
            length: cfg.length,
        }
    }

    /// `z`: `[batch, noise_dim]`, `c`: `[batch, 3]` (normalized). Returns `[batch, length, 3]`
    /// with row 0 equal to `c`.
    fn forward(&self, z: Tensor<B, 2>, c: Tensor<B, 2>) -> Tensor<B, 3> {
        let mut h = tanh(self.w_z.forward(z) + self.w_c.forward(c.clone()));
        let mut u = c;
        let mut out = Vec::with_capacity(self.length);
        out.push(u.clone());
        for _ in 1..self.length {
            h = tanh(self.w_hh.forward(h) + self.w_uh.forward(u.clone()));
            u = u + self.w_out.forward(h.clone());
            out.push(u.clone());
        }
        Tensor::stack(out, 1)
    }

    fn apply_max_norm(mut self, max_norm: f32) -> Self {
        self.w_hh.weight = self.w_hh.weight.map(|w| max_norm_columns(w, max_norm));
        self.w_uh.weight = self.w_uh.weight.map(|w| max_norm_columns(w, max_norm));
        self
    }
}

/// Burn stores `Linear` weights as `[in, out]`, so a row of the ndarray `[out, in]` kernel is a
/// column here.
fn max_norm_columns<B: Backend>(w: Tensor<B, 2>, max_norm: f32) -> Tensor<B, 2> {
    let w = w.detach();
    let norms = w.clone().powf_scalar(2.0).sum_dim(0).sqrt().clamp_min(1e-12);
    let scale = norms.recip().mul_scalar(max_norm).clamp_max(1.0);
    (w * scale).require_grad()
}

#[derive(Module, Debug)]
struct BurnDiscriminator<B: Backend> {
    conv: Conv1d<B>,
    dense: Linear<B>,
    out: Linear<B>,
    alpha: f64,
}

impl<B: Backend> BurnDiscriminator<B> {
    fn new(device: &B::Device, cfg: &DiscriminatorConfig) -> Self {
        Self {
            conv: Conv1dConfig::new(6, cfg.channels, cfg.kernel).init(device),
            dense: LinearConfig::new(cfg.channels + 3, cfg.hidden).init(device),
            out: LinearConfig::new(cfg.hidden, 1).init(device),
            alpha: cfg.alpha as f64,
        }
    }

    /// `u`: `[batch, length, 3]` normalized; returns logits `[batch, 1]`.
    fn forward(&self, u: Tensor<B, 3>) -> Tensor<B, 2> {
        let [b, l, _] = u.dims();
        let device = u.device();
        let inc = u.clone().slice([0..b, 1..l, 0..3]) - u.clone().slice([0..b, 0..l - 1, 0..3]);
        let inc = Tensor::cat(vec![Tensor::zeros([b, 1, 3], &device), inc], 1);
        let feats = Tensor::cat(vec![u.clone(), inc], 2).swap_dims(1, 2);

        let conv = leaky_relu(self.conv.forward(feats), self.alpha);
        let [_, ch, _] = conv.dims();
        let pooled = conv.mean_dim(2).reshape([b, ch]);
        let cond = u.slice([0..b, 0..1, 0..3]).reshape([b, 3]);
        let g = Tensor::cat(vec![pooled, cond], 1);
        let h = leaky_relu(self.dense.forward(g), self.alpha);
        self.out.forward(h)
    }
}

/// Mean binary cross-entropy on logits against a constant label.
fn bce_with_logits<B: Backend>(logits: Tensor<B, 2>, label: f32) -> Tensor<B, 1> {
    let pos = logits.clone().clamp_min(0.0);
    let soft = logits.clone().abs().neg().exp().log1p();
    (pos - logits.mul_scalar(label) + soft).mean()
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> Result<f64> {
    t.into_data()
        .to_vec::<f32>()
        .ok()
        .and_then(|v| v.first().copied())
        .map(|v| v as f64)
        .ok_or(Error::Shape("expected a scalar tensor"))
}

fn tensor_data<B: Backend, const D: usize>(t: &Tensor<B, D>) -> Result<Vec<f32>> {
    t.to_data()
        .to_vec::<f32>()
        .map_err(|_| Error::Shape("burn tensor export failed"))
}

/// `[in, out]` burn weight → `[out, in]` ndarray kernel.
fn export_linear<B: Backend>(l: &Linear<B>) -> Result<(Array2<f32>, Array1<f32>)> {
    let [d_in, d_out] = l.weight.dims();
    let flat = tensor_data(&l.weight.val())?;
    let w = Array2::from_shape_fn((d_out, d_in), |(j, i)| flat[i * d_out + j]);
    let b = match &l.bias {
        Some(b) => Array1::from_vec(tensor_data(&b.val())?),
        None => Array1::zeros(d_out),
    };
    Ok((w, b))
}

impl<B: Backend> BurnGenerator<B> {
    fn export(
        &self,
        config: GeneratorConfig,
        normalizer: Normalizer,
    ) -> Result<ConditionalGenerator> {
        let (w_z, _) = export_linear(&self.w_z)?;
        let (w_c, b_0) = export_linear(&self.w_c)?;
        let (w_hh, _) = export_linear(&self.w_hh)?;
        let (w_uh, b_h) = export_linear(&self.w_uh)?;
        let (w_out, b_out) = export_linear(&self.w_out)?;
        Ok(ConditionalGenerator {
            config,
            normalizer,
            w_z,
            w_c,
            b_0,
            w_hh,
            w_uh,
            b_h,
            w_out,
            b_out,
        })
    }
}

impl<B: Backend> BurnDiscriminator<B> {
    fn export(
        &self,
        config: DiscriminatorConfig,
        normalizer: Normalizer,
    ) -> Result<ConditionalDiscriminator> {
        // Conv1d weight is [out_channels, in_channels, kernel], same as ours.
        let conv_w = Array3::from_shape_vec(
            (config.channels, 6, config.kernel),
            tensor_data(&self.conv.weight.val())?,
        )
        .map_err(|_| Error::Shape("conv weight shape mismatch"))?;
        let conv_b = match &self.conv.bias {
            Some(b) => Array1::from_vec(tensor_data(&b.val())?),
            None => Array1::zeros(config.channels),
        };
        let (dense_w, dense_b) = export_linear(&self.dense)?;
        let (out_w, out_b) = export_linear(&self.out)?;
        Ok(ConditionalDiscriminator {
            config,
            normalizer,
            conv_w,
            conv_b,
            dense_w,
            dense_b,
            out_w: out_w.row(0).to_owned(),
            out_b,
        })
    }
}

fn to_tensor_2<B: Backend>(device: &B::Device, x: Array2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    Tensor::from_data(TensorData::new(x.into_raw_vec_and_offset().0, [n, d]), device)
}

fn to_tensor_3<B: Backend>(device: &B::Device, x: Array3<f32>) -> Tensor<B, 3> {
    let (n, l, d) = x.dim();
    Tensor::from_data(TensorData::new(x.into_raw_vec_and_offset().0, [n, l, d]), device)
}

/// Result of a Burn training run.
#[derive(Debug, Clone)]
pub struct BurnGanOutcome {
    pub generator: ConditionalGenerator,
    pub discriminator: ConditionalDiscriminator,
    /// Losses of completed steps only.
    pub d_losses: Vec<f64>,
    pub g_losses: Vec<f64>,
    /// On [`Termination::NumericalInstability`] the exported models are the ones from before
    /// the failing step.
    pub termination: Termination,
}

struct Batch {
    reals: Array3<f32>,
    conds: Array2<f32>,
    noise: Array2<f32>,
}

fn sample_batch(
    data: &[Trajectory],
    normalizer: &Normalizer,
    cfg: &GanConfig,
    rng: &mut ChaCha8Rng,
) -> Batch {
    let (b, l, nz) = (cfg.batch_size, cfg.generator.length, cfg.generator.noise_dim);
    let mut reals = Array3::<f32>::zeros((b, l, 3));
    let mut conds = Array2::<f32>::zeros((b, 3));
    for i in 0..b {
        let t = &data[rng.random_range(0..data.len())];
        let u = normalizer.normalize_trajectory(t);
        reals.slice_mut(ndarray::s![i, .., ..]).assign(&u);
        conds.row_mut(i).assign(&u.row(0));
    }
    let noise = Array2::from_shape_fn((b, nz), |_| StandardNormal.sample(&mut *rng));
    Batch {
        reals,
        conds,
        noise,
    }
}

/// Train with Burn autodiff and export the model pair.
pub fn train_gan_burn(
    device: &<BurnBackend as Backend>::Device,
    data: &[Trajectory],
    cfg: &GanConfig,
) -> Result<BurnGanOutcome> {
    cfg.validate()?;
    let len = common_length(data)?;
    if len != cfg.generator.length {
        return Err(Error::Shape("dataset trajectory length differs from generator length"));
    }
    let normalizer = Normalizer::fit(data)?;
    let smoothing = Normal::new(cfg.label_mean, cfg.label_std)
        .map_err(|_| Error::InvalidInput("invalid label smoothing distribution"))?;

    let mut generator = BurnGenerator::<BurnBackend>::new(device, &cfg.generator);
    let mut discriminator = BurnDiscriminator::<BurnBackend>::new(device, &cfg.discriminator);
    let adam = AdamConfig::new().with_epsilon(1e-7);
    let mut opt_g = adam.init::<BurnBackend, BurnGenerator<BurnBackend>>();
    let mut opt_d = adam.init::<BurnBackend, BurnDiscriminator<BurnBackend>>();
    let lr_d = cfg.lr as LearningRate;
    let lr_g = (cfg.lr * cfg.g_factor) as LearningRate;

    let mut d_losses = Vec::with_capacity(cfg.steps);
    let mut g_losses = Vec::with_capacity(cfg.steps);
    let mut termination = Termination::Budget;
    info!(steps = cfg.steps, batch = cfg.batch_size, "burn gan training start");

    'steps: for step in 0..cfg.steps {
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        rng.set_stream(step as u64 + 1);
        let label = smoothing.sample(&mut rng).min(1.0) as f32;
        let last_finite = (generator.clone(), discriminator.clone());

        let mut d_loss = f64::NAN;
        for _ in 0..cfg.d_steps {
            let batch = sample_batch(data, &normalizer, cfg, &mut rng);
            let reals = to_tensor_3::<BurnBackend>(device, batch.reals);
            let conds = to_tensor_2::<BurnBackend>(device, batch.conds);
            let noise = to_tensor_2::<BurnBackend>(device, batch.noise);
            let fakes = generator.forward(noise, conds).detach();

            let loss = (bce_with_logits(discriminator.forward(reals), label)
                + bce_with_logits(discriminator.forward(fakes), 0.0))
            .mul_scalar(0.5);
            d_loss = scalar(loss.clone())?;
            if !d_loss.is_finite() {
                warn!(step, d_loss, "non-finite discriminator loss; stopping");
                (generator, discriminator) = last_finite;
                termination = Termination::NumericalInstability { step };
                break 'steps;
            }
            let grads = GradientsParams::from_grads(loss.backward(), &discriminator);
            discriminator = opt_d.step(lr_d, discriminator, grads);
        }

        let mut g_loss = f64::NAN;
        for _ in 0..cfg.g_steps {
            let batch = sample_batch(data, &normalizer, cfg, &mut rng);
            let conds = to_tensor_2::<BurnBackend>(device, batch.conds);
            let noise = to_tensor_2::<BurnBackend>(device, batch.noise);
            let fakes = generator.forward(noise, conds);
            let loss = bce_with_logits(discriminator.forward(fakes), label);
            g_loss = scalar(loss.clone())?;
            if !g_loss.is_finite() {
                warn!(step, g_loss, "non-finite generator loss; stopping");
                (generator, discriminator) = last_finite;
                termination = Termination::NumericalInstability { step };
                break 'steps;
            }
            let grads = GradientsParams::from_grads(loss.backward(), &generator);
            generator = opt_g
                .step(lr_g, generator, grads)
                .apply_max_norm(cfg.generator.max_norm);
        }

        debug!(step, d_loss, g_loss, "burn gan step");
        d_losses.push(d_loss);
        g_losses.push(g_loss);
    }

    Ok(BurnGanOutcome {
        generator: generator.export(cfg.generator.clone(), normalizer)?,
        discriminator: discriminator.export(cfg.discriminator.clone(), normalizer)?,
        d_losses,
        g_losses,
        termination,
    })
}

/// Mean realism score of a batch under the Burn discriminator (used to cross-check exports).
#[cfg(test)]
fn burn_scores<B: Backend>(disc: &BurnDiscriminator<B>, u: Tensor<B, 3>) -> Result<Vec<f32>> {
    tensor_data(&burn::tensor::activation::sigmoid(disc.forward(u)))
}
