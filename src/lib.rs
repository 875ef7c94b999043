//! # lorenzgan
//!
//! Synthetic Lorenz-63 trajectories from a conditional recurrent GAN, sparse recovery of the
//! governing equations, and chaos-aware fidelity metrics.
//!
//! This crate is intentionally small:
//!
//! - it implements a **simulator**, a **generator/discriminator pair** with a step-indexed
//!   adversarial training loop, a **sparse identifier** (SINDy-style STLSQ), and an **evaluator**,
//! - networks are tiny `ndarray` models with hand-written gradients and Adam; no GPU framework types
//!   leak through the public API in the default feature set,
//! - it does not provide a CLI or experiment runner (see `demos/` for runnable pipelines).
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every stochastic routine takes a `seed` (or its config does).
//!   Simulation is bit-for-bit reproducible.
//! - **Conditioning is exact**: the first state of every simulated *and* generated trajectory is the
//!   supplied initial condition, bit-for-bit, regardless of training quality.
//! - **Bounded numerics**: every iterative routine has a fixed iteration budget and reports
//!   non-convergence / instability as a flag alongside the best partial result.
//! - **No hidden normalization**: the generator owns its [`trajectory::Normalizer`]; everything
//!   else works in raw Lorenz coordinates.
//!
//! ## Module map
//!
//! - `lorenz`: state vectors, the Lorenz-63 parameter set, the [`lorenz::VectorField`] seam
//! - `ode`: fixed-step integrators (`Euler`, `Heun`, `Rk4`)
//! - `simulate`: ground-truth trajectories and random-IC ensembles
//! - `trajectory`: the fixed-length trajectory type and per-coordinate normalization
//! - `nn`: Adam, initializers, and the loss pieces shared by both networks
//! - `generator`: conditional recurrent generator with a hard-set first state
//! - `discriminator`: conditional temporal-convolution discriminator
//! - `gan`: explicit `(θ_G, θ_D, t)` training state machine, diagnostics, early stopping
//! - `checkpoint`: versioned binary snapshots of the model pair
//! - `sindy`: candidate library, derivative estimation, thresholded least squares
//! - `lyapunov`: largest Lyapunov exponent by twin-trajectory renormalization
//! - `metrics`: distributional distances, divergence curves, fidelity reports
//! - `config`: TOML-loadable pipeline configuration
//!
//! Optional training backends (e.g. `burn`) are **feature-gated** and export back into the
//! `ndarray` model types.
//!
//! ## References (conceptual anchors)
//!
//! - Lorenz, *Deterministic Nonperiodic Flow* (J. Atmos. Sci., 1963).
//! - Goodfellow et al., *Generative Adversarial Nets* (NeurIPS 2014).
//! - Esteban et al., *Real-valued (Medical) Time Series Generation with Recurrent Conditional GANs*
//!   (arXiv:1706.02633).
//! - Brunton, Proctor & Kutz, *Discovering governing equations from data by sparse identification
//!   of nonlinear dynamical systems* (PNAS, 2016).
//! - Benettin et al., *Lyapunov characteristic exponents for smooth dynamical systems* (Meccanica, 1980).
//! - Rosenstein, Collins & De Luca, *A practical method for calculating largest Lyapunov exponents
//!   from small data sets* (Physica D, 1993).

pub mod checkpoint;
pub mod config;
pub mod discriminator;
pub mod gan;
pub mod generator;
pub mod lorenz;
pub mod lyapunov;
pub mod metrics;
pub mod nn;
pub mod ode;
pub mod simulate;
pub mod sindy;
pub mod trajectory;

#[cfg(feature = "burn")]
pub mod burn_gan;

use trajectory::Trajectory;

/// lorenzgan error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    /// Integration produced a non-finite state. `partial` holds the finite prefix.
    #[error("integration diverged at step {step} (kept {} finite states)", partial.len())]
    Diverged { step: usize, partial: Trajectory },
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
