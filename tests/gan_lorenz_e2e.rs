use lorenzgan::gan::{self, GanConfig, Termination, TrainState};
use lorenzgan::lorenz::ParameterSet;
use lorenzgan::lyapunov::LyapunovConfig;
use lorenzgan::metrics::{EvaluationConfig, FidelityReport};
use lorenzgan::simulate::{simulate_ensemble, InitialConditionBox, SimulationConfig};
use lorenzgan::trajectory::Trajectory;

/// Checks that only a generator that actually moves along the flow can pass. Pooled moments
/// are left out: an ensemble that holds each initial condition already matches them.
fn reproduces_motion(report: &FidelityReport) -> Result<(), String> {
    let ratio = report
        .path_length_ratio()
        .ok_or_else(|| "no path length ratio".to_string())?;
    if !(0.5..=1.5).contains(&ratio) {
        return Err(format!("path length ratio {ratio}"));
    }
    if report.candidate_model.is_none() {
        return Err("no field identified from generated data".to_string());
    }
    Ok(())
}

fn evaluation() -> EvaluationConfig {
    EvaluationConfig {
        lyapunov: LyapunovConfig {
            transient_steps: 500,
            renormalizations: 1_000,
            ..LyapunovConfig::default()
        },
        ..EvaluationConfig::default()
    }
}

fn ensembles() -> (Vec<Trajectory>, Vec<Trajectory>) {
    let p = ParameterSet::classic();
    let sim = SimulationConfig {
        length: 100,
        burn_in: 500,
        ..SimulationConfig::default()
    };
    let data = simulate_ensemble(&p, &InitialConditionBox::default(), 50, &sim, 1).unwrap();
    let held_out = simulate_ensemble(&p, &InitialConditionBox::default(), 20, &sim, 2).unwrap();
    (data, held_out)
}

fn config() -> GanConfig {
    GanConfig {
        batch_size: 16,
        steps: 60,
        seed: 4,
        ..GanConfig::default()
    }
}

#[test]
fn trained_generator_moves_along_the_attractor() {
    let p = ParameterSet::classic();
    let (data, held_out) = ensembles();
    let cfg = config();
    let out = gan::train(&data, &cfg).unwrap();
    assert_eq!(out.termination, Termination::Budget);
    assert!(out.history.reports.iter().all(|r| r.accepted));
    assert!(out
        .history
        .reports
        .iter()
        .all(|r| r.d_loss.is_finite() && r.g_loss.is_finite()));

    let x0s: Vec<_> = held_out.iter().map(|t| t.initial()).collect();
    let generated = gan::sample(&out.state.generator, &x0s, 99).unwrap();
    for (g, x0) in generated.iter().zip(&x0s) {
        assert_eq!(g.initial(), *x0);
        assert!(g.is_finite());
    }

    let report = FidelityReport::compare(&held_out, &generated, &p, &evaluation()).unwrap();
    reproduces_motion(&report).unwrap();
    for k in 0..3 {
        let gap = report.mean_gap[k].unwrap();
        let var = report.variance_ratio[k].unwrap();
        assert!(gap < 1.0, "mean gap {:?}", report.mean_gap);
        assert!((0.1..=10.0).contains(&var), "variance ratio {:?}", report.variance_ratio);
    }

    // The field identified from held-out data carries the known exponent.
    let reference = report.reference_lyapunov.mean.unwrap();
    let real = report.real_lyapunov.as_ref().and_then(|l| l.mean).unwrap();
    assert!(reference > 0.0);
    assert!((reference - real).abs() < 0.3, "λ reference {reference} vs identified {real}");

    let d_real = gan::mean_score(&out.state.discriminator, &held_out).unwrap();
    assert!((0.0..=1.0).contains(&d_real));
}

#[test]
fn untrained_generator_is_rejected() {
    let p = ParameterSet::classic();
    let (data, held_out) = ensembles();
    let state = TrainState::init(&config(), &data).unwrap();

    let x0s: Vec<_> = held_out.iter().map(|t| t.initial()).collect();
    let generated = gan::sample(&state.generator, &x0s, 99).unwrap();
    let report = FidelityReport::compare(&held_out, &generated, &p, &evaluation()).unwrap();

    assert!(reproduces_motion(&report).is_err());
    let ratio = report.path_length_ratio().unwrap();
    assert!(ratio < 0.01, "path length ratio {ratio}");
    let frozen = report.candidate_lyapunov.as_ref().and_then(|l| l.mean);
    assert!(frozen.map_or(true, |l| l < 0.3), "λ = {frozen:?}");
    assert!(report.lyapunov_gap().map_or(true, |g| g > 0.3));
}
