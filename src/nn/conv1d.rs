//! Same-padded 1-D convolution layers for the grid-based models.

use ndarray::{Array1, Array3};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

use super::{Activation, Parameterized};

/// A 1-D convolution with stride 1 and same padding.
///
/// Inputs are `(batch, length, in_channels)` and outputs
/// `(batch, length, out_channels)`. The kernel size must be odd so the
/// padding is symmetric.
pub struct Conv1d {
    /// Kernel weights, `(out_channels, in_channels, kernel_size)`
    pub weights: Array3<f64>,
    pub biases: Array1<f64>,
    pub grad_weights: Array3<f64>,
    pub grad_biases: Array1<f64>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    last_input: Option<Array3<f64>>,
}

impl Conv1d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        assert!(
            kernel_size % 2 == 1,
            "kernel size must be odd for same padding"
        );
        let std = (2.0 / (in_channels * kernel_size) as f64).sqrt();
        let weights = Array3::random(
            (out_channels, in_channels, kernel_size),
            Normal::new(0.0, std).unwrap(),
        );

        Self {
            weights,
            biases: Array1::zeros(out_channels),
            grad_weights: Array3::zeros((out_channels, in_channels, kernel_size)),
            grad_biases: Array1::zeros(out_channels),
            in_channels,
            out_channels,
            kernel_size,
            last_input: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&mut self, input: &Array3<f64>) -> Array3<f64> {
        let (b, len, _) = input.dim();
        let pad = self.kernel_size / 2;
        let mut output = Array3::zeros((b, len, self.out_channels));

        for bi in 0..b {
            for t in 0..len {
                for o in 0..self.out_channels {
                    let mut sum = self.biases[o];
                    for dk in 0..self.kernel_size {
                        let src = t + dk;
                        if src < pad || src - pad >= len {
                            continue;
                        }
                        let s = src - pad;
                        for i in 0..self.in_channels {
                            sum += input[[bi, s, i]] * self.weights[[o, i, dk]];
                        }
                    }
                    output[[bi, t, o]] = sum;
                }
            }
        }

        self.last_input = Some(input.clone());
        output
    }

    pub fn backward(&mut self, output_gradient: &Array3<f64>) -> Array3<f64> {
        let input = self
            .last_input
            .as_ref()
            .expect("Must call forward before backward");
        let (b, len, _) = input.dim();
        let pad = self.kernel_size / 2;
        let mut input_gradient = Array3::zeros((b, len, self.in_channels));

        for bi in 0..b {
            for t in 0..len {
                for o in 0..self.out_channels {
                    let dy = output_gradient[[bi, t, o]];
                    if dy == 0.0 {
                        continue;
                    }
                    self.grad_biases[o] += dy;
                    for dk in 0..self.kernel_size {
                        let src = t + dk;
                        if src < pad || src - pad >= len {
                            continue;
                        }
                        let s = src - pad;
                        for i in 0..self.in_channels {
                            self.grad_weights[[o, i, dk]] += dy * input[[bi, s, i]];
                            input_gradient[[bi, s, i]] += dy * self.weights[[o, i, dk]];
                        }
                    }
                }
            }
        }

        input_gradient
    }
}

impl Parameterized for Conv1d {
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

/// A stack of same-padded convolutions with ReLU between layers and a linear
/// last layer.
pub struct ConvNet {
    layers: Vec<Conv1d>,
    pub activation: Activation,
    last_pre: Vec<Array3<f64>>,
}

impl ConvNet {
    /// `channels` holds the full channel trajectory, e.g.
    /// `[in, hidden, hidden, out]`.
    pub fn new(channels: &[usize], kernel_size: usize) -> Self {
        assert!(channels.len() >= 2);
        let layers = channels
            .windows(2)
            .map(|w| Conv1d::new(w[0], w[1], kernel_size))
            .collect();
        Self {
            layers,
            activation: Activation::ReLU,
            last_pre: Vec::new(),
        }
    }

    pub fn output_channels(&self) -> usize {
        self.layers[self.layers.len() - 1].out_channels()
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

impl Parameterized for ConvNet {
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
