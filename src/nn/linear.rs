//! Batched dense layer.

use ndarray::{s, Array1, Array2, Array3, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use super::Parameterized;

/// A dense layer applied pointwise over the trailing feature axis.
///
/// Inputs are `(batch, points, in)` and outputs `(batch, points, out)`; the
/// same weights act on every point of every batch element. The forward input
/// is cached for the backward pass, and gradients accumulate until
/// `zero_gradients`.
pub struct Linear {
    pub weights: Array2<f64>,
    pub biases: Array1<f64>,
    pub grad_weights: Array2<f64>,
    pub grad_biases: Array1<f64>,
    input_size: usize,
    output_size: usize,
    last_input: Option<Array3<f64>>,
}

impl Linear {
    /// Xavier-initialized dense layer.
    pub fn new(input_size: usize, output_size: usize) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        let weights = Array2::random((input_size, output_size), Uniform::new(-limit, limit));

        Self {
            weights,
            biases: Array1::zeros(output_size),
            grad_weights: Array2::zeros((input_size, output_size)),
            grad_biases: Array1::zeros(output_size),
            input_size,
            output_size,
            last_input: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Forward pass, caching the input.
    pub fn forward(&mut self, input: &Array3<f64>) -> Array3<f64> {
        let (b, n, _) = input.dim();
        let mut output = Array3::zeros((b, n, self.output_size));
        for bi in 0..b {
            let x = input.slice(s![bi, .., ..]);
            let mut y = x.dot(&self.weights);
            for mut row in y.rows_mut() {
                row += &self.biases;
            }
            output.slice_mut(s![bi, .., ..]).assign(&y);
        }
        self.last_input = Some(input.clone());
        output
    }

    /// Backward pass: accumulate weight/bias gradients, return the input
    /// gradient.
    pub fn backward(&mut self, output_gradient: &Array3<f64>) -> Array3<f64> {
        let input = self
            .last_input
            .as_ref()
            .expect("Must call forward before backward");
        let (b, n, _) = input.dim();

        let mut input_gradient = Array3::zeros((b, n, self.input_size));
        for bi in 0..b {
            let x = input.slice(s![bi, .., ..]);
            let dy = output_gradient.slice(s![bi, .., ..]);
            self.grad_weights = &self.grad_weights + &x.t().dot(&dy);
            self.grad_biases = &self.grad_biases + &dy.sum_axis(Axis(0));
            input_gradient
                .slice_mut(s![bi, .., ..])
                .assign(&dy.dot(&self.weights.t()));
        }
        input_gradient
    }
}

impl Parameterized for Linear {
    fn num_parameters(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        out.extend(self.weights.iter());
        out.extend(self.biases.iter());
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        out.extend(self.grad_weights.iter());
        out.extend(self.grad_biases.iter());
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        for w in self.weights.iter_mut() {
            *w = src.next().expect("parameter vector too short");
        }
        for b in self.biases.iter_mut() {
            *b = src.next().expect("parameter vector too short");
        }
    }

    fn zero_gradients(&mut self) {
        self.grad_weights.fill(0.0);
        self.grad_biases.fill(0.0);
    }
}
