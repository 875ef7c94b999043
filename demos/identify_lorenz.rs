//! Recover the Lorenz equations from a simulated ensemble by sparse regression, then check the
//! recovered system's largest Lyapunov exponent against the true one.
//!
//! Run:
//!   cargo run --release --example identify_lorenz -- [config.toml] [out.json]

use lorenzgan::config::PipelineConfig;
use lorenzgan::lyapunov::largest_lyapunov;
use lorenzgan::simulate::simulate_ensemble;
use lorenzgan::sindy::{identify, BasisLibrary};
use lorenzgan::Result;
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
    let out = args.next();

    let data = simulate_ensemble(
        &cfg.parameters,
        &cfg.bounds,
        cfg.ensemble_size,
        &cfg.simulation,
        cfg.seed,
    )?;
    let library = BasisLibrary::polynomial(cfg.library_degree)?;
    let id = identify(&data, cfg.simulation.dt, &library, &cfg.identify)?;

    for eq in id.model.equations() {
        println!("{eq}");
    }
    let d = &id.diagnostics;
    println!(
        "samples={} iterations={} converged={} condition={:?} r2={:?}",
        d.samples, d.iterations, d.converged, d.condition_number, d.r2
    );
    match id.model.lorenz_parameters() {
        Ok(p) => println!(
            "sigma={:.4} rho={:.4} beta={:.4} (true {:.4} {:.4} {:.4})",
            p.sigma, p.rho, p.beta, cfg.parameters.sigma, cfg.parameters.rho, cfg.parameters.beta
        ),
        Err(e) => println!("not a Lorenz-form model: {e}"),
    }

    let x0 = data[0].initial();
    let truth = largest_lyapunov(&cfg.parameters, &x0, &cfg.evaluation.lyapunov)?;
    let fitted = largest_lyapunov(&id.model, &x0, &cfg.evaluation.lyapunov)?;
    println!(
        "largest Lyapunov exponent: true {:.3}, identified {:.3} ({:?})",
        truth.exponent, fitted.exponent, fitted.status
    );

    if let Some(path) = out {
        id.save_json(&path)?;
        println!("wrote {path}");
    }
    Ok(())
}
