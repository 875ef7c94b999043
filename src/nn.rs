//! Shared building blocks for the generator and discriminator.
//!
//! These are intentionally boring: Adam over `ndarray` tensors, Glorot-uniform initialization,
//! leaky ReLU, and binary cross-entropy on logits. Gradients are written by hand next to each
//! model's forward pass.

use ndarray::{Array, Array2, ArrayView1, Dimension};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Adam with bias correction.
///
/// Moment buffers are keyed by a caller-chosen `slot` per parameter tensor, so one optimizer can
/// serve a whole model as long as the model always visits its tensors in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u64,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Number of completed update rounds.
    pub fn rounds(&self) -> u64 {
        self.t
    }

    /// Start a new update round (advances the bias-correction clock).
    pub fn begin_round(&mut self) {
        self.t += 1;
    }

    /// Apply one Adam update to `param` in place.
    pub fn update<D: Dimension>(
        &mut self,
        slot: usize,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
    ) {
        debug_assert_eq!(param.shape(), grad.shape());
        let n = param.len();
        while self.m.len() <= slot {
            self.m.push(Vec::new());
            self.v.push(Vec::new());
        }
        if self.m[slot].len() != n {
            self.m[slot] = vec![0.0; n];
            self.v[slot] = vec![0.0; n];
        }

        let t = self.t.max(1) as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);
        let m = &mut self.m[slot];
        let v = &mut self.v[slot];
        for (i, (p, &g)) in param.iter_mut().zip(grad.iter()).enumerate() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = m[i] / bc1;
            let v_hat = v[i] / bc2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// Glorot-uniform `(rows × cols)` matrix scaled by `gain`.
pub fn glorot(rows: usize, cols: usize, gain: f32, rng: &mut impl Rng) -> Array2<f32> {
    let a = gain * (6.0 / (rows + cols) as f32).sqrt();
    let mut w = Array2::<f32>::zeros((rows, cols));
    if a > 0.0 {
        for x in w.iter_mut() {
            *x = rng.random_range(-a..a);
        }
    }
    w
}

/// Rescale each row of `w` so its L2 norm is at most `max_norm`.
pub fn max_norm_rows(w: &mut Array2<f32>, max_norm: f32) {
    for mut row in w.rows_mut() {
        let n = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if n > max_norm {
            let s = max_norm / n;
            row.mapv_inplace(|x| x * s);
        }
    }
}

#[inline]
pub fn leaky_relu(x: f32, alpha: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        alpha * x
    }
}

#[inline]
pub fn leaky_relu_grad(x: f32, alpha: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        alpha
    }
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Binary cross-entropy on a logit against a (possibly smoothed) label.
///
/// Returns `(loss, d loss / d logit)`. Stable for large `|logit|`.
#[inline]
pub fn bce_with_logit(logit: f32, label: f32) -> (f32, f32) {
    let loss = logit.max(0.0) - logit * label + (-logit.abs()).exp().ln_1p();
    (loss, sigmoid(logit) - label)
}

/// Elementwise `tanh` derivative given the activation `h = tanh(a)`.
#[inline]
pub fn tanh_grad_from_output(h: f32) -> f32 {
    1.0 - h * h
}

/// `out += a ⊗ b` (outer product accumulation).
#[inline]
pub fn add_outer(out: &mut Array2<f32>, a: &ArrayView1<'_, f32>, b: &ArrayView1<'_, f32>) {
    debug_assert_eq!(out.nrows(), a.len());
    debug_assert_eq!(out.ncols(), b.len());
    for (i, &ai) in a.iter().enumerate() {
        if ai == 0.0 {
            continue;
        }
        for (j, &bj) in b.iter().enumerate() {
            out[[i, j]] += ai * bj;
        }
    }
}
