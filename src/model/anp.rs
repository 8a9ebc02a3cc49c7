//! The attentive neural process: the deterministic path cross-attends from
//! target locations to the context set, so each target gets its own
//! representation instead of one pooled vector. The latent path is the same
//! global encoder as the vanilla neural process.

use ndarray::Array3;

use crate::config::ModelConfig;
use crate::nn::{Activation, Mlp, MultiHeadAttention, Parameterized};

use super::{
    broadcast_points, concat_channels, merge_latent_grad, merge_prediction_grad, split_latent,
    split_prediction, sum_points, LatentDist, LatentGrad, Prediction,
};

pub struct Anp {
    pub(crate) point_encoder: Mlp,
    pub(crate) query_embed: Mlp,
    pub(crate) key_embed: Mlp,
    pub(crate) attention: MultiHeadAttention,
    pub(crate) lat_encoder: Mlp,
    pub(crate) decoder: Mlp,
    dim_y: usize,
    dim_r: usize,
    dim_z: usize,

    // Context caches
    xc: Option<Array3<f64>>,
    values: Option<Array3<f64>>,
    lat_pre_context: Option<Array3<f64>>,
    lat_n_context: usize,

    // Full-set latent caches
    lat_pre_full: Option<Array3<f64>>,
    lat_n_full: usize,

    // Decode caches and accumulators
    dec_pre: Option<Array3<f64>>,
    dec_noise_fixed: bool,
    dr_star_acc: Option<Array3<f64>>,
}

impl Anp {
    pub fn new(cfg: &ModelConfig) -> Self {
        let in_dim = cfg.dim_x + cfg.dim_y;
        Self {
            point_encoder: Mlp::with_hidden(
                in_dim,
                cfg.hidden,
                cfg.num_layers,
                cfg.dim_r,
                Activation::ReLU,
            ),
            query_embed: Mlp::with_hidden(cfg.dim_x, cfg.hidden, 1, cfg.dim_r, Activation::ReLU),
            key_embed: Mlp::with_hidden(cfg.dim_x, cfg.hidden, 1, cfg.dim_r, Activation::ReLU),
            attention: MultiHeadAttention::new(cfg.dim_r, cfg.num_heads),
            lat_encoder: Mlp::with_hidden(
                in_dim,
                cfg.hidden,
                cfg.num_layers,
                2 * cfg.dim_z,
                Activation::ReLU,
            ),
            decoder: Mlp::with_hidden(
                cfg.dim_x + cfg.dim_r + cfg.dim_z,
                cfg.hidden,
                cfg.num_layers,
                2 * cfg.dim_y,
                Activation::ReLU,
            ),
            dim_y: cfg.dim_y,
            dim_r: cfg.dim_r,
            dim_z: cfg.dim_z,
            xc: None,
            values: None,
            lat_pre_context: None,
            lat_n_context: 0,
            lat_pre_full: None,
            lat_n_full: 0,
            dec_pre: None,
            dec_noise_fixed: false,
            dr_star_acc: None,
        }
    }

    fn encode_latent(&mut self, x: &Array3<f64>, y: &Array3<f64>) -> (LatentDist, Array3<f64>, usize) {
        let input = concat_channels(&[x.view(), y.view()]);
        let per_point = self.lat_encoder.forward(&input);
        let n = per_point.shape()[1];
        let pooled = sum_points(&per_point).mapv(|v| v / n as f64);
        let (dist, pre) = split_latent(&pooled, self.dim_z);
        (dist, pre, n)
    }

    fn backward_latent(&mut self, grad: &LatentGrad, pre: &Array3<f64>, n: usize) {
        let d_pooled = merge_latent_grad(grad, pre);
        let d_per_point = broadcast_points(&d_pooled.mapv(|v| v / n as f64), n);
        self.lat_encoder.backward(&d_per_point);
    }

    pub fn encode_context(&mut self, xc: &Array3<f64>, yc: &Array3<f64>) -> LatentDist {
        let input = concat_channels(&[xc.view(), yc.view()]);
        self.values = Some(self.point_encoder.forward(&input));
        self.xc = Some(xc.clone());

        let (dist, pre, n) = self.encode_latent(xc, yc);
        self.lat_pre_context = Some(pre);
        self.lat_n_context = n;
        dist
    }

    pub fn encode_full(&mut self, x: &Array3<f64>, y: &Array3<f64>) -> LatentDist {
        let (dist, pre, n) = self.encode_latent(x, y);
        self.lat_pre_full = Some(pre);
        self.lat_n_full = n;
        dist
    }

    pub fn decode(&mut self, xt: &Array3<f64>, z: &Array3<f64>, noise: Option<f64>) -> Prediction {
        let xc = self.xc.as_ref().expect("encode_context before decode");
        let values = self.values.as_ref().expect("encode_context before decode");

        let query = self.query_embed.forward(xt);
        let key = self.key_embed.forward(xc);
        let r_star = self.attention.forward(&query, &key, values);

        let m = xt.shape()[1];
        let input = concat_channels(&[xt.view(), r_star.view(), broadcast_points(z, m).view()]);
        let raw = self.decoder.forward(&input);
        let (pred, pre) = split_prediction(&raw, self.dim_y, noise);
        self.dec_pre = Some(pre);
        self.dec_noise_fixed = noise.is_some();
        pred
    }

    pub fn decode_backward(&mut self, d_mean: &Array3<f64>, d_sigma: &Array3<f64>) -> Array3<f64> {
        let pre = self.dec_pre.as_ref().expect("decode before decode_backward");
        let d_raw = merge_prediction_grad(d_mean, d_sigma, pre, self.dec_noise_fixed);
        let d_input = self.decoder.backward(&d_raw);

        let dim_x = d_input.shape()[2] - self.dim_r - self.dim_z;
        let d_r_star = d_input
            .slice(ndarray::s![.., .., dim_x..dim_x + self.dim_r])
            .to_owned();
        let d_z = d_input
            .slice(ndarray::s![.., .., dim_x + self.dim_r..])
            .to_owned();

        match &mut self.dr_star_acc {
            Some(acc) => *acc += &d_r_star,
            None => self.dr_star_acc = Some(d_r_star),
        }
        sum_points(&d_z)
    }

    pub fn latent_backward_full(&mut self, grad: &LatentGrad) {
        let pre = self
            .lat_pre_full
            .take()
            .expect("encode_full before latent_backward_full");
        let n = self.lat_n_full;
        self.backward_latent(grad, &pre, n);
    }

    /// Backward through the attention path and the latent prior.
    ///
    /// The attention forward caches are taken from the last `decode`; the
    /// query, key and value inputs are identical across latent samples, so
    /// accumulated gradients can be pushed through once.
    pub fn backward_context(&mut self, grad: Option<&LatentGrad>) {
        if let Some(g) = grad {
            let pre = self
                .lat_pre_context
                .take()
                .expect("encode_context before backward_context");
            let n = self.lat_n_context;
            self.backward_latent(g, &pre, n);
        }
        if let Some(d_r_star) = self.dr_star_acc.take() {
            let (d_query, d_key, d_values) = self.attention.backward(&d_r_star);
            self.query_embed.backward(&d_query);
            self.key_embed.backward(&d_key);
            self.point_encoder.backward(&d_values);
        }
    }
}

impl Parameterized for Anp {
    fn num_parameters(&self) -> usize {
        self.point_encoder.num_parameters()
            + self.query_embed.num_parameters()
            + self.key_embed.num_parameters()
            + self.attention.num_parameters()
            + self.lat_encoder.num_parameters()
            + self.decoder.num_parameters()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        self.point_encoder.collect_parameters(out);
        self.query_embed.collect_parameters(out);
        self.key_embed.collect_parameters(out);
        self.attention.collect_parameters(out);
        self.lat_encoder.collect_parameters(out);
        self.decoder.collect_parameters(out);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        self.point_encoder.collect_gradients(out);
        self.query_embed.collect_gradients(out);
        self.key_embed.collect_gradients(out);
        self.attention.collect_gradients(out);
        self.lat_encoder.collect_gradients(out);
        self.decoder.collect_gradients(out);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.point_encoder.load_parameters(src);
        self.query_embed.load_parameters(src);
        self.key_embed.load_parameters(src);
        self.attention.load_parameters(src);
        self.lat_encoder.load_parameters(src);
        self.decoder.load_parameters(src);
    }

    fn zero_gradients(&mut self) {
        self.point_encoder.zero_gradients();
        self.query_embed.zero_gradients();
        self.key_embed.zero_gradients();
        self.attention.zero_gradients();
        self.lat_encoder.zero_gradients();
        self.decoder.zero_gradients();
        self.dr_star_acc = None;
    }
}
