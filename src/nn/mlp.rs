//! Pointwise multi-layer perceptron over batched sets.

use ndarray::Array3;

use super::{Activation, Linear, Parameterized};

/// A stack of dense layers with an activation between them and a linear last
/// layer, applied pointwise: every non-feature axis is preserved. Extra
/// leading axes (e.g. latent samples) are folded into the batch axis by the
/// caller.
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    last_pre: Vec<Array3<f64>>,
}

impl Mlp {
    /// Build from explicit layer sizes, e.g. `[in, hidden, hidden, out]`.
    pub fn new(sizes: &[usize], activation: Activation) -> Self {
        assert!(sizes.len() >= 2, "Mlp needs at least input and output sizes");
        let layers = sizes
            .windows(2)
            .map(|w| Linear::new(w[0], w[1]))
            .collect();
        Self {
            layers,
            activation,
            last_pre: Vec::new(),
        }
    }

    /// Convenience constructor: `num_hidden` hidden layers of width `hidden`.
    pub fn with_hidden(
        input: usize,
        hidden: usize,
        num_hidden: usize,
        output: usize,
        activation: Activation,
    ) -> Self {
        let mut sizes = vec![input];
        sizes.extend(std::iter::repeat(hidden).take(num_hidden));
        sizes.push(output);
        Self::new(&sizes, activation)
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].input_size()
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1].output_size()
    }

    pub fn forward(&mut self, input: &Array3<f64>) -> Array3<f64> {
        self.last_pre.clear();
        let num_layers = self.layers.len();
        let mut current = input.clone();
        for i in 0..num_layers {
            let z = self.layers[i].forward(&current);
            if i + 1 < num_layers {
                self.last_pre.push(z.clone());
                current = z.mapv(|v| self.activation.apply(v));
            } else {
                current = z;
            }
        }
        current
    }

    pub fn backward(&mut self, output_gradient: &Array3<f64>) -> Array3<f64> {
        let num_layers = self.layers.len();
        let mut grad = output_gradient.clone();
        for i in (0..num_layers).rev() {
            grad = self.layers[i].backward(&grad);
            if i > 0 {
                let pre = &self.last_pre[i - 1];
                grad = &grad * &pre.mapv(|v| self.activation.derivative(v));
            }
        }
        grad
    }
}

impl Parameterized for Mlp {
    fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.num_parameters()).sum()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        for layer in &self.layers {
            layer.collect_parameters(out);
        }
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        for layer in &self.layers {
            layer.collect_gradients(out);
        }
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        for layer in &mut self.layers {
            layer.load_parameters(src);
        }
    }

    fn zero_gradients(&mut self) {
        for layer in &mut self.layers {
            layer.zero_gradients();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{s, Array4};

    #[test]
    fn test_shape_transport() {
        let mut mlp = Mlp::with_hidden(5, 16, 2, 3, Activation::ReLU);
        let input = Array3::ones((4, 7, 5));
        let output = mlp.forward(&input);
        assert_eq!(output.dim(), (4, 7, 3));
    }

    #[test]
    fn test_extra_sample_axis_is_preserved() {
        // An extra leading sample axis folds into the batch axis and comes
        // back out with every non-feature axis intact.
        let (samples, batch, points) = (3, 4, 6);
        let mut mlp = Mlp::with_hidden(2, 8, 1, 5, Activation::Tanh);

        let input = Array4::from_shape_fn((samples, batch, points, 2), |(s, b, n, c)| {
            (s + b + n + c) as f64 * 0.1
        });

        let mut folded = Array3::zeros((samples * batch, points, 2));
        for si in 0..samples {
            for bi in 0..batch {
                folded
                    .slice_mut(s![si * batch + bi, .., ..])
                    .assign(&input.slice(s![si, bi, .., ..]));
            }
        }

        let output = mlp.forward(&folded);
        assert_eq!(output.dim(), (samples * batch, points, 5));

        let mut unfolded = Array4::zeros((samples, batch, points, 5));
        for si in 0..samples {
            for bi in 0..batch {
                unfolded
                    .slice_mut(s![si, bi, .., ..])
                    .assign(&output.slice(s![si * batch + bi, .., ..]));
            }
        }
        assert_eq!(unfolded.dim(), (samples, batch, points, 5));
    }

    #[test]
    fn test_gradient_check() {
        let mut mlp = Mlp::with_hidden(3, 6, 2, 2, Activation::Tanh);
        let input = Array3::from_shape_fn((2, 3, 3), |(b, n, c)| {
            0.3 * b as f64 - 0.1 * n as f64 + 0.2 * c as f64
        });

        let loss = |mlp: &mut Mlp| -> f64 { mlp.forward(&input).mapv(|v| v * v).sum() };

        let out = mlp.forward(&input);
        mlp.backward(&out.mapv(|v| 2.0 * v));

        let mut analytic = Vec::new();
        mlp.collect_gradients(&mut analytic);
        let mut params = Vec::new();
        mlp.collect_parameters(&mut params);

        let eps = 1e-6;
        for i in (0..params.len()).step_by(7) {
            let mut plus = params.clone();
            plus[i] += eps;
            mlp.load_parameters(&mut plus.into_iter());
            let f_plus = loss(&mut mlp);

            let mut minus = params.clone();
            minus[i] -= eps;
            mlp.load_parameters(&mut minus.into_iter());
            let f_minus = loss(&mut mlp);

            let numeric = (f_plus - f_minus) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-4);
        }
        mlp.load_parameters(&mut params.into_iter());
    }

    #[test]
    fn test_input_gradient_check() {
        let mut mlp = Mlp::with_hidden(2, 5, 1, 1, Activation::Tanh);
        let input =
            Array3::from_shape_fn((1, 4, 2), |(_, n, c)| 0.2 * n as f64 - 0.3 * c as f64);

        let out = mlp.forward(&input);
        let dinput = mlp.backward(&Array3::ones(out.dim()));

        let eps = 1e-6;
        for n in 0..4 {
            for c in 0..2 {
                let mut plus = input.clone();
                plus[[0, n, c]] += eps;
                let f_plus: f64 = mlp.forward(&plus).sum();
                let mut minus = input.clone();
                minus[[0, n, c]] -= eps;
                let f_minus: f64 = mlp.forward(&minus).sum();
                let numeric = (f_plus - f_minus) / (2.0 * eps);
                assert_abs_diff_eq!(dinput[[0, n, c]], numeric, epsilon = 1e-5);
            }
        }
    }
}
