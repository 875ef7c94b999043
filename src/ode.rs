//! Minimal fixed-step ODE integrators for autonomous 3-D fields.
//!
//! \[
//! \frac{ds}{dt} = f(s)
//! \]
//!
//! Deterministic and fixed-step only: the step size is always the caller's.

use crate::lorenz::State;
use serde::{Deserialize, Serialize};

/// Fixed-step method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OdeMethod {
    /// Explicit Euler (1st order).
    Euler,
    /// Heun / explicit trapezoid / RK2 (2nd order).
    Heun,
    /// Classic Runge-Kutta (4th order).
    #[default]
    Rk4,
}

#[inline]
fn axpy(x: &State, a: f64, v: &State) -> State {
    [x[0] + a * v[0], x[1] + a * v[1], x[2] + a * v[2]]
}

/// Advance `x` by one step of size `dt`.
#[inline]
pub fn step(method: OdeMethod, x: &State, dt: f64, f: &mut impl FnMut(&State) -> State) -> State {
    match method {
        OdeMethod::Euler => {
            let v = f(x);
            axpy(x, dt, &v)
        }
        OdeMethod::Heun => {
            let v0 = f(x);
            // predictor
            let x_pred = axpy(x, dt, &v0);
            // corrector
            let v1 = f(&x_pred);
            [
                x[0] + 0.5 * dt * (v0[0] + v1[0]),
                x[1] + 0.5 * dt * (v0[1] + v1[1]),
                x[2] + 0.5 * dt * (v0[2] + v1[2]),
            ]
        }
        OdeMethod::Rk4 => {
            let k1 = f(x);
            let k2 = f(&axpy(x, 0.5 * dt, &k1));
            let k3 = f(&axpy(x, 0.5 * dt, &k2));
            let k4 = f(&axpy(x, dt, &k3));
            let w = dt / 6.0;
            [
                x[0] + w * (k1[0] + 2.0 * k2[0] + 2.0 * k3[0] + k4[0]),
                x[1] + w * (k1[1] + 2.0 * k2[1] + 2.0 * k3[1] + k4[1]),
                x[2] + w * (k1[2] + 2.0 * k2[2] + 2.0 * k3[2] + k4[2]),
            ]
        }
    }
}

/// Integrate forward with fixed steps and return the final state.
///
/// - `x0`: initial state
/// - `dt`: step size
/// - `steps`: number of steps (0 returns `x0`)
/// - `f`: returns the velocity \(f(s)\)
pub fn integrate_fixed(
    method: OdeMethod,
    x0: &State,
    dt: f64,
    steps: usize,
    mut f: impl FnMut(&State) -> State,
) -> State {
    debug_assert!(dt.is_finite());
    let mut x = *x0;
    for _ in 0..steps {
        x = step(method, &x, dt, &mut f);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decay(x: &State) -> State {
        [-x[0], -x[1], -x[2]]
    }

    #[test]
    fn higher_order_is_more_accurate_on_dx_dt_eq_minus_x() {
        // ODE: dx/dt = -x, x(0)=1, exact x(1)=e^-1.
        let x0 = [1.0, 1.0, 1.0];
        let exact = (-1.0f64).exp();

        let steps = 20usize;
        let dt = 1.0 / (steps as f64);

        let euler = integrate_fixed(OdeMethod::Euler, &x0, dt, steps, decay);
        let heun = integrate_fixed(OdeMethod::Heun, &x0, dt, steps, decay);
        let rk4 = integrate_fixed(OdeMethod::Rk4, &x0, dt, steps, decay);

        let err_euler = (euler[0] - exact).abs();
        let err_heun = (heun[0] - exact).abs();
        let err_rk4 = (rk4[0] - exact).abs();

        assert!(
            err_heun < err_euler,
            "expected Heun to beat Euler: err_heun={err_heun} err_euler={err_euler}"
        );
        assert!(
            err_rk4 < err_heun,
            "expected RK4 to beat Heun: err_rk4={err_rk4} err_heun={err_heun}"
        );
        assert!(err_rk4 < 1e-6, "rk4 error too large: {err_rk4}");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_constant_field_is_exact_for_all_methods(
            steps in 1usize..200,
            dt in 1e-3f64..1.0f64,
            x0 in prop::array::uniform3(-10.0f64..10.0f64),
            c in prop::array::uniform3(-10.0f64..10.0f64),
        ) {
            let scale = dt * (steps as f64);
            for method in [OdeMethod::Euler, OdeMethod::Heun, OdeMethod::Rk4] {
                let out = integrate_fixed(method, &x0, dt, steps, |_x| c);
                for k in 0..3 {
                    let expected = x0[k] + scale * c[k];
                    // Floating addition accumulates rounding error over many steps.
                    let tol = 1e-9 * (1.0 + expected.abs() + scale * c[k].abs());
                    prop_assert!((out[k] - expected).abs() <= tol, "{method:?} mismatch at {k}");
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_error_decreases_with_more_steps(
            steps in 5usize..80,
        ) {
            let x0 = [1.0, 1.0, 1.0];
            let exact = (-1.0f64).exp();
            let dt1 = 1.0 / (steps as f64);
            let dt2 = 1.0 / ((2 * steps) as f64);

            for method in [OdeMethod::Euler, OdeMethod::Heun, OdeMethod::Rk4] {
                let e1 = integrate_fixed(method, &x0, dt1, steps, decay);
                let e2 = integrate_fixed(method, &x0, dt2, 2 * steps, decay);
                let err1 = (e1[0] - exact).abs();
                let err2 = (e2[0] - exact).abs();
                prop_assert!(err2 <= err1 + 1e-14, "{method:?} error did not decrease: {err1} -> {err2}");
            }
        }
    }
}
