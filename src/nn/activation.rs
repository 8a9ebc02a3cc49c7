//! Activation functions and their derivatives.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Tanh,
    Sigmoid,
    Linear,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::ReLU => x.max(0.0),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Linear => x,
        }
    }

    /// Derivative as a function of the pre-activation.
    pub fn derivative(&self, x: f64) -> f64 {
        match self {
            Activation::ReLU => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - x.tanh().powi(2),
            Activation::Sigmoid => {
                let s = self.apply(x);
                s * (1.0 - s)
            }
            Activation::Linear => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_derivatives_match_central_differences() {
        let eps = 1e-6;
        for act in [Activation::Tanh, Activation::Sigmoid, Activation::Linear] {
            for &x in &[-1.3, 0.4, 2.0] {
                let numeric = (act.apply(x + eps) - act.apply(x - eps)) / (2.0 * eps);
                assert_abs_diff_eq!(act.derivative(x), numeric, epsilon = 1e-6);
            }
        }
        // ReLU away from the kink
        assert_eq!(Activation::ReLU.derivative(1.0), 1.0);
        assert_eq!(Activation::ReLU.derivative(-1.0), 0.0);
    }
}
