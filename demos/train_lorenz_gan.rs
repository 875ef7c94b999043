//! Train the conditional GAN on a simulated Lorenz ensemble and compare generated rollouts
//! against held-out ground truth.
//!
//! Run:
//!   cargo run --release --example train_lorenz_gan -- [config.toml] [checkpoint_dir]
//!
//! `RUST_LOG=lorenzgan=debug` shows per-step losses.

use lorenzgan::config::PipelineConfig;
use lorenzgan::gan::{self, TrainState};
use lorenzgan::metrics::FidelityReport;
use lorenzgan::simulate::simulate_ensemble;
use lorenzgan::{checkpoint, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lorenzgan=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let cfg = match args.next() {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let checkpoint_dir = args.next().map(PathBuf::from);

    let data = simulate_ensemble(
        &cfg.parameters,
        &cfg.bounds,
        cfg.ensemble_size,
        &cfg.simulation,
        cfg.seed,
    )?;
    let held_out = simulate_ensemble(
        &cfg.parameters,
        &cfg.bounds,
        cfg.ensemble_size,
        &cfg.simulation,
        cfg.seed.wrapping_add(1),
    )?;

    // Pick up where a previous run left off if the directory has a checkpoint.
    let state = match checkpoint_dir
        .as_deref()
        .map(checkpoint::latest_in_dir)
        .transpose()?
        .flatten()
    {
        Some(path) => {
            println!("resuming from {}", path.display());
            checkpoint::Checkpoint::load(&path)?.into_state()
        }
        None => TrainState::init(&cfg.gan, &data)?,
    };

    let outcome = gan::resume(state, &data, &cfg.gan, checkpoint_dir.as_deref())?;
    println!(
        "stopped after {} steps: {:?}",
        outcome.state.step, outcome.termination
    );
    if let Some(last) = outcome.history.last() {
        println!(
            "last step: d_loss={:.4} g_loss={:.4} D(real)={:.3} D(fake)={:.3}",
            last.d_loss, last.g_loss, last.d_real_score, last.d_fake_score
        );
    }

    let x0s: Vec<_> = held_out.iter().map(|t| t.initial()).collect();
    let generated = gan::sample(&outcome.state.generator, &x0s, cfg.seed)?;
    let report = FidelityReport::compare(&held_out, &generated, &cfg.parameters, &cfg.evaluation)?;
    for line in report.summary() {
        println!("{line}");
    }
    Ok(())
}
