//! The convolutional conditional neural process: the context set is mapped
//! onto a uniform grid by a set convolution, processed by a 1-D CNN, and
//! read off at the target locations. Fully deterministic.

use ndarray::{Array1, Array3};

use crate::config::ModelConfig;
use crate::nn::setconv::make_grid;
use crate::nn::{ConvNet, Parameterized, SetConvDecoder, SetConvEncoder};

use super::{data_range, merge_prediction_grad, split_prediction, Prediction};

pub struct ConvCnp {
    pub(crate) encoder: SetConvEncoder,
    pub(crate) cnn: ConvNet,
    pub(crate) decoder: SetConvDecoder,
    points_per_unit: f64,
    grid_margin: f64,
    dim_y: usize,

    grid: Option<Array1<f64>>,
    features: Option<Array3<f64>>,
    dec_pre: Option<Array3<f64>>,
    dec_noise_fixed: bool,
    dh_acc: Option<Array3<f64>>,
}

/// CNN channel trajectory: density plus signal channels in, two heads per
/// output dimension out.
fn cnn_channels(cfg: &ModelConfig) -> Vec<usize> {
    let mut channels = vec![1 + cfg.dim_y];
    channels.extend(std::iter::repeat(cfg.cnn_channels).take(cfg.cnn_layers - 1));
    channels.push(2 * cfg.dim_y);
    channels
}

impl ConvCnp {
    pub fn new(cfg: &ModelConfig) -> Self {
        // Length scales start at twice the grid spacing.
        let init_scale = 2.0 / cfg.points_per_unit;
        Self {
            encoder: SetConvEncoder::new(init_scale),
            cnn: ConvNet::new(&cnn_channels(cfg), cfg.kernel_size),
            decoder: SetConvDecoder::new(init_scale),
            points_per_unit: cfg.points_per_unit,
            grid_margin: cfg.grid_margin,
            dim_y: cfg.dim_y,
            grid: None,
            features: None,
            dec_pre: None,
            dec_noise_fixed: false,
            dh_acc: None,
        }
    }

    pub fn encode_context(&mut self, xc: &Array3<f64>, yc: &Array3<f64>, xt: &Array3<f64>) {
        let (lo, hi) = data_range(xc, xt);
        let grid = make_grid(lo, hi, self.points_per_unit, self.grid_margin);
        let enc = self.encoder.forward(xc, yc, &grid);
        self.features = Some(self.cnn.forward(&enc));
        self.grid = Some(grid);
    }

    pub fn decode(&mut self, xt: &Array3<f64>, noise: Option<f64>) -> Prediction {
        let grid = self.grid.as_ref().expect("encode_context before decode");
        let features = self
            .features
            .as_ref()
            .expect("encode_context before decode");
        let raw = self.decoder.forward(features, grid, xt);
        let (pred, pre) = split_prediction(&raw, self.dim_y, noise);
        self.dec_pre = Some(pre);
        self.dec_noise_fixed = noise.is_some();
        pred
    }

    pub fn decode_backward(&mut self, d_mean: &Array3<f64>, d_sigma: &Array3<f64>) {
        let pre = self.dec_pre.as_ref().expect("decode before decode_backward");
        let d_raw = merge_prediction_grad(d_mean, d_sigma, pre, self.dec_noise_fixed);
        let d_features = self.decoder.backward(&d_raw);
        match &mut self.dh_acc {
            Some(acc) => *acc += &d_features,
            None => self.dh_acc = Some(d_features),
        }
    }

    pub fn backward_context(&mut self) {
        if let Some(d_features) = self.dh_acc.take() {
            let d_enc = self.cnn.backward(&d_features);
            self.encoder.backward(&d_enc);
        }
    }
}

impl Parameterized for ConvCnp {
    fn num_parameters(&self) -> usize {
        self.encoder.num_parameters() + self.cnn.num_parameters() + self.decoder.num_parameters()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        self.encoder.collect_parameters(out);
        self.cnn.collect_parameters(out);
        self.decoder.collect_parameters(out);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        self.encoder.collect_gradients(out);
        self.cnn.collect_gradients(out);
        self.decoder.collect_gradients(out);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.encoder.load_parameters(src);
        self.cnn.load_parameters(src);
        self.decoder.load_parameters(src);
    }

    fn zero_gradients(&mut self) {
        self.encoder.zero_gradients();
        self.cnn.zero_gradients();
        self.decoder.zero_gradients();
        self.dh_acc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::nn::Activation;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            points_per_unit: 4.0,
            cnn_channels: 4,
            cnn_layers: 2,
            kernel_size: 3,
            ..ModelConfig::default()
        }
    }

    fn toy_task() -> (Array3<f64>, Array3<f64>, Array3<f64>) {
        let xc = Array3::from_shape_fn((2, 3, 1), |(b, i, _)| -1.0 + 0.7 * i as f64 + 0.1 * b as f64);
        let yc = xc.mapv(|v: f64| v.sin());
        let xt = Array3::from_shape_fn((2, 4, 1), |(b, i, _)| -0.8 + 0.5 * i as f64 - 0.1 * b as f64);
        (xc, yc, xt)
    }

    #[test]
    fn test_shapes_and_grid_coverage() {
        let mut model = ConvCnp::new(&tiny_config());
        let (xc, yc, xt) = toy_task();

        model.encode_context(&xc, &yc, &xt);
        let grid = model.grid.as_ref().unwrap();
        let (lo, hi) = data_range(&xc, &xt);
        assert!(grid[0] <= lo && grid[grid.len() - 1] >= hi);

        let pred = model.decode(&xt, None);
        assert_eq!(pred.mean.dim(), (2, 4, 1));
        assert!(pred.sigma.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_translation_equivariance() {
        // Shifting context and targets together shifts the grid with them,
        // so predictions are (approximately) unchanged.
        let mut model = ConvCnp::new(&tiny_config());
        let (xc, yc, xt) = toy_task();

        model.encode_context(&xc, &yc, &xt);
        let pred = model.decode(&xt, None);

        let shift = 3.0;
        let xc_s = xc.mapv(|v| v + shift);
        let xt_s = xt.mapv(|v| v + shift);
        model.encode_context(&xc_s, &yc, &xt_s);
        let pred_s = model.decode(&xt_s, None);

        for (a, b) in pred.mean.iter().zip(pred_s.mean.iter()) {
            // The grid is anchored to the data range, so it shifts with the
            // inputs and equivariance holds up to rounding.
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_end_to_end_gradient_check() {
        let mut model = ConvCnp::new(&tiny_config());
        // Smooth activation keeps the central-difference check away from the
        // ReLU kink.
        model.cnn.activation = Activation::Tanh;
        let (xc, yc, xt) = toy_task();
        let yt = xt.mapv(|v: f64| v.cos());

        let loss = |model: &mut ConvCnp| -> f64 {
            model.encode_context(&xc, &yc, &xt);
            let pred = model.decode(&xt, None);
            -super::super::distribution::log_prob(&yt, &pred.mean, &pred.sigma).sum()
        };

        model.zero_gradients();
        model.encode_context(&xc, &yc, &xt);
        let pred = model.decode(&xt, None);
        let seed = ndarray::Array1::from_elem(2, -1.0);
        let (d_mean, d_sigma) = super::super::distribution::log_prob_grad_params(
            &yt, &pred.mean, &pred.sigma, &seed,
        );
        model.decode_backward(&d_mean, &d_sigma);
        model.backward_context();

        let mut analytic = Vec::new();
        model.collect_gradients(&mut analytic);
        let mut params = Vec::new();
        model.collect_parameters(&mut params);

        let eps = 1e-5;
        for i in (0..params.len()).step_by(7) {
            let mut plus = params.clone();
            plus[i] += eps;
            model.load_parameters(&mut plus.into_iter());
            let f_plus = loss(&mut model);

            let mut minus = params.clone();
            minus[i] -= eps;
            model.load_parameters(&mut minus.into_iter());
            let f_minus = loss(&mut model);

            let numeric = (f_plus - f_minus) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-3);
        }
        model.load_parameters(&mut params.into_iter());
    }
}
