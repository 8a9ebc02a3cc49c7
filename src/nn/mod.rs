//! Neural network building blocks.
//!
//! Layers keep forward caches and implement analytic backward passes, with
//! parameters and accumulated gradients exposed as flat vectors for the
//! optimizer.

pub mod activation;
pub mod attention;
pub mod conv1d;
pub mod linear;
pub mod mlp;
pub mod optimizer;
pub mod setconv;

pub use activation::Activation;
pub use attention::MultiHeadAttention;
pub use conv1d::{Conv1d, ConvNet};
pub use linear::Linear;
pub use mlp::Mlp;
pub use optimizer::{Adam, Optimizer, Sgd};
pub use setconv::{SetConvDecoder, SetConvEncoder};

/// Flat parameter and gradient plumbing shared by all layers and models.
pub trait Parameterized {
    fn num_parameters(&self) -> usize;

    /// Append parameters to `out` in a fixed order.
    fn collect_parameters(&self, out: &mut Vec<f64>);

    /// Append accumulated gradients to `out`, in the same order.
    fn collect_gradients(&self, out: &mut Vec<f64>);

    /// Read parameters back from an iterator, in the same order.
    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>);

    /// Reset accumulated gradients to zero.
    fn zero_gradients(&mut self);
}

/// Softplus with a numerically stable large-argument branch.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Derivative of softplus.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_softplus() {
        assert_abs_diff_eq!(softplus(0.0), 2.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(softplus(100.0), 100.0, epsilon = 1e-9);
        assert!(softplus(-20.0) > 0.0);
    }

    #[test]
    fn test_sigmoid_is_softplus_derivative() {
        let eps = 1e-6;
        for &x in &[-2.0, 0.0, 1.5] {
            let numeric = (softplus(x + eps) - softplus(x - eps)) / (2.0 * eps);
            assert_abs_diff_eq!(sigmoid(x), numeric, epsilon = 1e-6);
        }
    }
}
