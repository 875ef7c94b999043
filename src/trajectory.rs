//! The fixed-length trajectory type and per-coordinate normalization.

use crate::lorenz::State;
use crate::metrics::coordinate_stats;
use crate::{Error, Result};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// An ordered sequence of states (`len × 3`). Row 0 is the initial condition.
///
/// Trajectories are never mutated after creation and never reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array2<f64>", into = "Array2<f64>")]
pub struct Trajectory {
    states: Array2<f64>,
}

impl TryFrom<Array2<f64>> for Trajectory {
    type Error = Error;

    fn try_from(states: Array2<f64>) -> Result<Self> {
        Self::from_array(states)
    }
}

impl From<Trajectory> for Array2<f64> {
    fn from(t: Trajectory) -> Self {
        t.states
    }
}

impl Trajectory {
    /// Wrap a `len × 3` array (`len >= 1`).
    pub fn from_array(states: Array2<f64>) -> Result<Self> {
        if states.ncols() != 3 {
            return Err(Error::Shape("trajectory must have exactly 3 columns"));
        }
        if states.nrows() == 0 {
            return Err(Error::Shape("trajectory must contain at least one state"));
        }
        Ok(Self { states })
    }

    pub fn from_states(states: &[State]) -> Result<Self> {
        let mut a = Array2::<f64>::zeros((states.len(), 3));
        for (i, st) in states.iter().enumerate() {
            for k in 0..3 {
                a[[i, k]] = st[k];
            }
        }
        Self::from_array(a)
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.states.nrows()
    }

    /// Always `false`: a trajectory holds at least its initial condition.
    pub fn is_empty(&self) -> bool {
        self.states.nrows() == 0
    }

    pub fn state(&self, i: usize) -> State {
        [self.states[[i, 0]], self.states[[i, 1]], self.states[[i, 2]]]
    }

    pub fn initial(&self) -> State {
        self.state(0)
    }

    pub fn last(&self) -> State {
        self.state(self.len() - 1)
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.states.view()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.states
    }

    pub fn is_finite(&self) -> bool {
        self.states.iter().all(|v| v.is_finite())
    }

    /// The first `n` states (clamped to `len`).
    pub(crate) fn prefix(&self, n: usize) -> Self {
        let n = n.clamp(1, self.len());
        Self {
            states: self.states.slice(s![..n, ..]).to_owned(),
        }
    }
}

/// Check that a non-empty batch shares one length; returns it.
pub fn common_length(trajectories: &[Trajectory]) -> Result<usize> {
    let first = trajectories
        .first()
        .ok_or(Error::InvalidInput("need at least one trajectory"))?;
    let len = first.len();
    if trajectories.iter().any(|t| t.len() != len) {
        return Err(Error::Shape("all trajectories must have the same length"));
    }
    Ok(len)
}

/// Per-coordinate affine map `u = (x - mean) / std`.
///
/// Networks see `f32` values of order one; the simulator and evaluator see raw coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: State,
    pub std: State,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::identity()
    }
}

impl Normalizer {
    const MIN_STD: f64 = 1e-6;

    pub fn identity() -> Self {
        Self {
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }

    /// Fit mean and standard deviation over every state of every trajectory.
    pub fn fit(trajectories: &[Trajectory]) -> Result<Self> {
        if trajectories.is_empty() {
            return Err(Error::InvalidInput("need at least one trajectory to fit a normalizer"));
        }
        if trajectories.iter().any(|t| !t.is_finite()) {
            return Err(Error::InvalidInput("cannot fit a normalizer on non-finite states"));
        }
        let stats = coordinate_stats(trajectories)?;
        let mean = stats.mean;
        let std = stats.std().map(|s| s.max(Self::MIN_STD));
        Ok(Self { mean, std })
    }

    #[inline]
    pub fn normalize(&self, s: &State) -> [f32; 3] {
        [
            ((s[0] - self.mean[0]) / self.std[0]) as f32,
            ((s[1] - self.mean[1]) / self.std[1]) as f32,
            ((s[2] - self.mean[2]) / self.std[2]) as f32,
        ]
    }

    #[inline]
    pub fn denormalize(&self, u: &[f32; 3]) -> State {
        [
            u[0] as f64 * self.std[0] + self.mean[0],
            u[1] as f64 * self.std[1] + self.mean[1],
            u[2] as f64 * self.std[2] + self.mean[2],
        ]
    }

    /// Normalize a whole trajectory into an `len × 3` `f32` array.
    pub fn normalize_trajectory(&self, t: &Trajectory) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((t.len(), 3));
        for i in 0..t.len() {
            let u = self.normalize(&t.state(i));
            for k in 0..3 {
                out[[i, k]] = u[k];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_shapes() {
        assert!(Trajectory::from_array(Array2::zeros((4, 2))).is_err());
        assert!(Trajectory::from_array(Array2::zeros((0, 3))).is_err());
        assert!(common_length(&[]).is_err());
    }

    #[test]
    fn deserialization_applies_the_same_shape_checks() {
        let ok = Trajectory::from_states(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).unwrap();
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(serde_json::from_str::<Trajectory>(&json).unwrap(), ok);

        let empty = serde_json::to_string(&Array2::<f64>::zeros((0, 3))).unwrap();
        assert!(serde_json::from_str::<Trajectory>(&empty).is_err());
        let two_columns = serde_json::to_string(&Array2::<f64>::zeros((4, 2))).unwrap();
        assert!(serde_json::from_str::<Trajectory>(&two_columns).is_err());
    }

    #[test]
    fn normalizer_keeps_precision_far_from_the_origin() {
        let t = Trajectory::from_states(&[[1e9, 0.0, 0.0], [1e9 + 1.0, 0.0, 0.0]]).unwrap();
        let nz = Normalizer::fit(&[t]).unwrap();
        assert_eq!(nz.mean[0], 1e9 + 0.5);
        assert!((nz.std[0] - 0.5).abs() < 1e-9, "std = {}", nz.std[0]);
        assert_eq!(nz.std[1], 1e-6);
    }

    #[test]
    fn normalizer_fit_centers_and_scales() {
        let a = Trajectory::from_states(&[[1.0, 10.0, -5.0], [3.0, 30.0, -5.0]]).unwrap();
        let nz = Normalizer::fit(&[a.clone()]).unwrap();
        assert!((nz.mean[0] - 2.0).abs() < 1e-12);
        assert!((nz.std[1] - 10.0).abs() < 1e-12);
        // Constant coordinate: floor instead of division by zero.
        assert_eq!(nz.std[2], Normalizer::MIN_STD);

        let u = nz.normalize_trajectory(&a);
        assert!((u[[0, 0]] + 1.0).abs() < 1e-6);
        assert!((u[[1, 1]] - 1.0).abs() < 1e-6);

        let back = nz.denormalize(&[u[[1, 0]], u[[1, 1]], u[[1, 2]]]);
        assert!((back[0] - 3.0).abs() < 1e-5);
        assert!((back[1] - 30.0).abs() < 1e-4);
    }

    #[test]
    fn common_length_detects_mismatch() {
        let a = Trajectory::from_states(&[[0.0; 3], [1.0; 3]]).unwrap();
        let b = Trajectory::from_states(&[[0.0; 3]]).unwrap();
        assert_eq!(common_length(&[a.clone(), a.clone()]).unwrap(), 2);
        assert!(common_length(&[a, b]).is_err());
    }
}
