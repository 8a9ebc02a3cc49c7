//! The convolutional latent neural process: like the conditional variant,
//! but the encoder CNN outputs a diagonal Gaussian over a latent function on
//! the grid. A sample from it is run through a second CNN and read off at
//! the target locations.

use ndarray::{Array1, Array3};

use crate::config::ModelConfig;
use crate::nn::setconv::make_grid;
use crate::nn::{ConvNet, Parameterized, SetConvDecoder, SetConvEncoder};

use super::{
    data_range, merge_latent_grad, merge_prediction_grad, split_latent, split_prediction,
    LatentDist, LatentGrad, Prediction,
};

pub struct ConvNp {
    pub(crate) encoder: SetConvEncoder,
    pub(crate) cnn_enc: ConvNet,
    pub(crate) cnn_dec: ConvNet,
    pub(crate) decoder: SetConvDecoder,
    points_per_unit: f64,
    grid_margin: f64,
    dim_y: usize,
    dim_z: usize,

    grid: Option<Array1<f64>>,
    lat_pre_context: Option<Array3<f64>>,
    lat_pre_full: Option<Array3<f64>>,
    dec_pre: Option<Array3<f64>>,
    dec_noise_fixed: bool,
}

fn enc_channels(cfg: &ModelConfig) -> Vec<usize> {
    let mut channels = vec![1 + cfg.dim_y];
    channels.extend(std::iter::repeat(cfg.cnn_channels).take(cfg.cnn_layers - 1));
    channels.push(2 * cfg.dim_z);
    channels
}

fn dec_channels(cfg: &ModelConfig) -> Vec<usize> {
    let mut channels = vec![cfg.dim_z];
    channels.extend(std::iter::repeat(cfg.cnn_channels).take(cfg.cnn_layers - 1));
    channels.push(2 * cfg.dim_y);
    channels
}

impl ConvNp {
    pub fn new(cfg: &ModelConfig) -> Self {
        let init_scale = 2.0 / cfg.points_per_unit;
        Self {
            encoder: SetConvEncoder::new(init_scale),
            cnn_enc: ConvNet::new(&enc_channels(cfg), cfg.kernel_size),
            cnn_dec: ConvNet::new(&dec_channels(cfg), cfg.kernel_size),
            decoder: SetConvDecoder::new(init_scale),
            points_per_unit: cfg.points_per_unit,
            grid_margin: cfg.grid_margin,
            dim_y: cfg.dim_y,
            dim_z: cfg.dim_z,
            grid: None,
            lat_pre_context: None,
            lat_pre_full: None,
            dec_pre: None,
            dec_noise_fixed: false,
        }
    }

    fn encode_on_grid(&mut self, x: &Array3<f64>, y: &Array3<f64>) -> (LatentDist, Array3<f64>) {
        let grid = self.grid.as_ref().expect("grid must be laid out first");
        let enc = self.encoder.forward(x, y, grid);
        let raw = self.cnn_enc.forward(&enc);
        split_latent(&raw, self.dim_z)
    }

    /// Returns the prior over the latent function on the grid, one
    /// distribution entry per grid cell.
    pub fn encode_context(
        &mut self,
        xc: &Array3<f64>,
        yc: &Array3<f64>,
        xt: &Array3<f64>,
    ) -> LatentDist {
        let (lo, hi) = data_range(xc, xt);
        self.grid = Some(make_grid(lo, hi, self.points_per_unit, self.grid_margin));
        let (dist, pre) = self.encode_on_grid(xc, yc);
        self.lat_pre_context = Some(pre);
        dist
    }

    /// Proposal from context and targets jointly, on the grid laid out by
    /// `encode_context`.
    pub fn encode_full(&mut self, x: &Array3<f64>, y: &Array3<f64>) -> LatentDist {
        let (dist, pre) = self.encode_on_grid(x, y);
        self.lat_pre_full = Some(pre);
        dist
    }

    pub fn decode(&mut self, z: &Array3<f64>, xt: &Array3<f64>, noise: Option<f64>) -> Prediction {
        let grid = self.grid.as_ref().expect("encode_context before decode");
        let features = self.cnn_dec.forward(z);
        let raw = self.decoder.forward(&features, grid, xt);
        let (pred, pre) = split_prediction(&raw, self.dim_y, noise);
        self.dec_pre = Some(pre);
        self.dec_noise_fixed = noise.is_some();
        pred
    }

    /// Backward through the most recent `decode`, returning the gradient
    /// with respect to the latent grid sample.
    pub fn decode_backward(&mut self, d_mean: &Array3<f64>, d_sigma: &Array3<f64>) -> Array3<f64> {
        let pre = self.dec_pre.as_ref().expect("decode before decode_backward");
        let d_raw = merge_prediction_grad(d_mean, d_sigma, pre, self.dec_noise_fixed);
        let d_features = self.decoder.backward(&d_raw);
        self.cnn_dec.backward(&d_features)
    }

    pub fn latent_backward_full(&mut self, grad: &LatentGrad) {
        let pre = self
            .lat_pre_full
            .take()
            .expect("encode_full before latent_backward_full");
        let d_raw = merge_latent_grad(grad, &pre);
        let d_enc = self.cnn_enc.backward(&d_raw);
        self.encoder.backward(&d_enc);
    }

    pub fn backward_context(&mut self, grad: &LatentGrad) {
        let pre = self
            .lat_pre_context
            .take()
            .expect("encode_context before backward_context");
        let d_raw = merge_latent_grad(grad, &pre);
        let d_enc = self.cnn_enc.backward(&d_raw);
        self.encoder.backward(&d_enc);
    }
}

impl Parameterized for ConvNp {
    fn num_parameters(&self) -> usize {
        self.encoder.num_parameters()
            + self.cnn_enc.num_parameters()
            + self.cnn_dec.num_parameters()
            + self.decoder.num_parameters()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        self.encoder.collect_parameters(out);
        self.cnn_enc.collect_parameters(out);
        self.cnn_dec.collect_parameters(out);
        self.decoder.collect_parameters(out);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        self.encoder.collect_gradients(out);
        self.cnn_enc.collect_gradients(out);
        self.cnn_dec.collect_gradients(out);
        self.decoder.collect_gradients(out);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.encoder.load_parameters(src);
        self.cnn_enc.load_parameters(src);
        self.cnn_dec.load_parameters(src);
        self.decoder.load_parameters(src);
    }

    fn zero_gradients(&mut self) {
        self.encoder.zero_gradients();
        self.cnn_enc.zero_gradients();
        self.cnn_dec.zero_gradients();
        self.decoder.zero_gradients();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::nn::Activation;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            dim_z: 2,
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
    fn test_latent_lives_on_grid() {
        let mut model = ConvNp::new(&tiny_config());
        let (xc, yc, xt) = toy_task();

        let prior = model.encode_context(&xc, &yc, &xt);
        let g = model.grid.as_ref().unwrap().len();
        assert_eq!(prior.mean.dim(), (2, g, 2));

        let pred = model.decode(&prior.mean.clone(), &xt, None);
        assert_eq!(pred.mean.dim(), (2, 4, 1));
        assert!(pred.sigma.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_end_to_end_gradient_check() {
        let mut model = ConvNp::new(&tiny_config());
        // Smooth activation keeps the central-difference check away from the
        // ReLU kink.
        model.cnn_enc.activation = Activation::Tanh;
        model.cnn_dec.activation = Activation::Tanh;
        let (xc, yc, xt) = toy_task();
        let yt = xt.mapv(|v: f64| v.cos());

        let loss = |model: &mut ConvNp| -> f64 {
            let prior = model.encode_context(&xc, &yc, &xt);
            let pred = model.decode(&prior.mean.clone(), &xt, None);
            -super::super::distribution::log_prob(&yt, &pred.mean, &pred.sigma).sum()
        };

        model.zero_gradients();
        let prior = model.encode_context(&xc, &yc, &xt);
        let pred = model.decode(&prior.mean.clone(), &xt, None);
        let seed = ndarray::Array1::from_elem(2, -1.0);
        let (d_mean, d_sigma) = super::super::distribution::log_prob_grad_params(
            &yt, &pred.mean, &pred.sigma, &seed,
        );
        let d_z = model.decode_backward(&d_mean, &d_sigma);
        let grad = LatentGrad {
            d_mean: d_z,
            d_sigma: Array3::zeros(prior.sigma.dim()),
        };
        model.backward_context(&grad);

        let mut analytic = Vec::new();
        model.collect_gradients(&mut analytic);
        let mut params = Vec::new();
        model.collect_parameters(&mut params);

        let eps = 1e-5;
        for i in (0..params.len()).step_by(11) {
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
