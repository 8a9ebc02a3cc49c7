//! Neural process models.
//!
//! All models share one protocol, driven by the losses:
//!
//! 1. `encode_context` conditions the model on the context set and, for
//!    latent models, returns the prior over the latent variable.
//! 2. `encode_full` (latent models only) conditions the latent encoder on
//!    context and targets jointly, yielding the proposal or posterior.
//! 3. `decode` maps target locations (plus a latent sample, if any) to a
//!    diagonal Gaussian prediction. It may be called once per sample.
//! 4. `decode_backward` runs the decoder backward for the sample whose
//!    forward pass is cached, accumulating parameter gradients and handing
//!    back the gradient with respect to the latent sample.
//! 5. `latent_backward_full` / `backward_context` push accumulated
//!    distribution-parameter gradients through the respective encoders.
//!
//! Gradients accumulate across samples and are cleared by `zero_gradients`.

use ndarray::{Array3, ArrayView3, Axis};

use crate::config::{ModelConfig, ModelName};
use crate::nn::{sigmoid, softplus, Parameterized};

pub mod anp;
pub mod convcnp;
pub mod convnp;
pub mod distribution;
pub mod np;

pub use anp::Anp;
pub use convcnp::ConvCnp;
pub use convnp::ConvNp;
pub use distribution::{LatentDist, LatentGrad};
pub use np::Np;

/// Lower bound on the predictive standard deviation.
const SIGMA_MIN: f64 = 1e-3;

/// A diagonal Gaussian predictive distribution over target outputs.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mean: Array3<f64>,
    pub sigma: Array3<f64>,
}

/// Split a raw decoder output `(batch, m, 2 * dy)` into a prediction.
///
/// The noise head goes through a shifted softplus so sigma stays positive
/// and bounded away from zero. When `noise` is given the sigma channel is
/// clamped to that value instead and carries no gradient.
///
/// Returns the prediction and the cached pre-activation `(batch, m, dy)`.
pub(crate) fn split_prediction(
    raw: &Array3<f64>,
    dim_y: usize,
    noise: Option<f64>,
) -> (Prediction, Array3<f64>) {
    let (b, m, c) = raw.dim();
    debug_assert_eq!(c, 2 * dim_y);

    let mean = raw.slice(ndarray::s![.., .., ..dim_y]).to_owned();
    let pre = raw.slice(ndarray::s![.., .., dim_y..]).to_owned();
    let sigma = match noise {
        Some(v) => Array3::from_elem((b, m, dim_y), v),
        None => pre.mapv(|p| SIGMA_MIN + softplus(p)),
    };
    (Prediction { mean, sigma }, pre)
}

/// Inverse of [`split_prediction`] for gradients: combine mean and sigma
/// gradients into the raw decoder output gradient.
pub(crate) fn merge_prediction_grad(
    d_mean: &Array3<f64>,
    d_sigma: &Array3<f64>,
    pre: &Array3<f64>,
    noise_fixed: bool,
) -> Array3<f64> {
    let (b, m, dy) = d_mean.dim();
    let mut d_raw = Array3::zeros((b, m, 2 * dy));
    d_raw
        .slice_mut(ndarray::s![.., .., ..dy])
        .assign(d_mean);
    if !noise_fixed {
        let d_pre = d_sigma * &pre.mapv(sigmoid);
        d_raw.slice_mut(ndarray::s![.., .., dy..]).assign(&d_pre);
    }
    d_raw
}

/// Split raw latent-encoder output `(batch, k, 2 * dz)` into a distribution.
///
/// The sigma channel is squashed into `(0.1, 1.0)`, which keeps early
/// training away from both collapsed and exploding latents.
///
/// Returns the distribution and the cached pre-activation `(batch, k, dz)`.
pub(crate) fn split_latent(raw: &Array3<f64>, dim_z: usize) -> (LatentDist, Array3<f64>) {
    let (_, _, c) = raw.dim();
    debug_assert_eq!(c, 2 * dim_z);

    let mean = raw.slice(ndarray::s![.., .., ..dim_z]).to_owned();
    let pre = raw.slice(ndarray::s![.., .., dim_z..]).to_owned();
    let sigma = pre.mapv(|p| 0.1 + 0.9 * sigmoid(p));
    (LatentDist { mean, sigma }, pre)
}

/// Inverse of [`split_latent`] for gradients.
pub(crate) fn merge_latent_grad(grad: &LatentGrad, pre: &Array3<f64>) -> Array3<f64> {
    let (b, k, dz) = grad.d_mean.dim();
    let mut d_raw = Array3::zeros((b, k, 2 * dz));
    d_raw
        .slice_mut(ndarray::s![.., .., ..dz])
        .assign(&grad.d_mean);
    let d_pre = &grad.d_sigma
        * &pre.mapv(|p| {
            let s = sigmoid(p);
            0.9 * s * (1.0 - s)
        });
    d_raw.slice_mut(ndarray::s![.., .., dz..]).assign(&d_pre);
    d_raw
}

/// Concatenate along the channel axis.
pub(crate) fn concat_channels(parts: &[ArrayView3<f64>]) -> Array3<f64> {
    ndarray::concatenate(Axis(2), parts).expect("channel concatenation shape mismatch")
}

/// Repeat a `(batch, 1, c)` representation across `m` points.
pub(crate) fn broadcast_points(rep: &Array3<f64>, m: usize) -> Array3<f64> {
    let (b, _, c) = rep.dim();
    Array3::from_shape_fn((b, m, c), |(bi, _, ci)| rep[[bi, 0, ci]])
}

/// Sum a `(batch, m, c)` gradient over the point axis, keeping the axis.
pub(crate) fn sum_points(grad: &Array3<f64>) -> Array3<f64> {
    let (b, m, c) = grad.dim();
    let mut out = Array3::zeros((b, 1, c));
    for bi in 0..b {
        for i in 0..m {
            for ci in 0..c {
                out[[bi, 0, ci]] += grad[[bi, i, ci]];
            }
        }
    }
    out
}

/// Smallest and largest input location across context and target sets.
pub(crate) fn data_range(xc: &Array3<f64>, xt: &Array3<f64>) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in xc.iter().chain(xt.iter()) {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    (lo, hi)
}

/// A neural process model behind a common interface.
pub enum NeuralProcess {
    ConvCnp(ConvCnp),
    ConvNp(ConvNp),
    Anp(Anp),
    Np(Np),
}

impl NeuralProcess {
    pub fn build(name: ModelName, cfg: &ModelConfig) -> Self {
        match name {
            ModelName::Convcnp => NeuralProcess::ConvCnp(ConvCnp::new(cfg)),
            ModelName::Convnp => NeuralProcess::ConvNp(ConvNp::new(cfg)),
            ModelName::Anp => NeuralProcess::Anp(Anp::new(cfg)),
            ModelName::Np => NeuralProcess::Np(Np::new(cfg)),
        }
    }

    pub fn has_latent(&self) -> bool {
        !matches!(self, NeuralProcess::ConvCnp(_))
    }

    /// Condition on the context set. Target locations are needed up front so
    /// the grid-based models can lay their grid over the full input range.
    pub fn encode_context(
        &mut self,
        xc: &Array3<f64>,
        yc: &Array3<f64>,
        xt: &Array3<f64>,
    ) -> Option<LatentDist> {
        match self {
            NeuralProcess::ConvCnp(m) => {
                m.encode_context(xc, yc, xt);
                None
            }
            NeuralProcess::ConvNp(m) => Some(m.encode_context(xc, yc, xt)),
            NeuralProcess::Anp(m) => Some(m.encode_context(xc, yc)),
            NeuralProcess::Np(m) => Some(m.encode_context(xc, yc)),
        }
    }

    /// Condition the latent encoder on context and targets jointly. Must be
    /// called after `encode_context` for the same task.
    pub fn encode_full(&mut self, x: &Array3<f64>, y: &Array3<f64>) -> Option<LatentDist> {
        match self {
            NeuralProcess::ConvCnp(_) => None,
            NeuralProcess::ConvNp(m) => Some(m.encode_full(x, y)),
            NeuralProcess::Anp(m) => Some(m.encode_full(x, y)),
            NeuralProcess::Np(m) => Some(m.encode_full(x, y)),
        }
    }

    /// Predict at the target locations, optionally clamping the noise.
    pub fn decode(
        &mut self,
        xt: &Array3<f64>,
        z: Option<&Array3<f64>>,
        noise: Option<f64>,
    ) -> Prediction {
        match self {
            NeuralProcess::ConvCnp(m) => {
                debug_assert!(z.is_none());
                m.decode(xt, noise)
            }
            NeuralProcess::ConvNp(m) => m.decode(z.expect("latent sample required"), xt, noise),
            NeuralProcess::Anp(m) => m.decode(xt, z.expect("latent sample required"), noise),
            NeuralProcess::Np(m) => m.decode(xt, z.expect("latent sample required"), noise),
        }
    }

    /// Backward through the most recent `decode`. Returns the gradient with
    /// respect to the latent sample for latent models.
    pub fn decode_backward(
        &mut self,
        d_mean: &Array3<f64>,
        d_sigma: &Array3<f64>,
    ) -> Option<Array3<f64>> {
        match self {
            NeuralProcess::ConvCnp(m) => {
                m.decode_backward(d_mean, d_sigma);
                None
            }
            NeuralProcess::ConvNp(m) => Some(m.decode_backward(d_mean, d_sigma)),
            NeuralProcess::Anp(m) => Some(m.decode_backward(d_mean, d_sigma)),
            NeuralProcess::Np(m) => Some(m.decode_backward(d_mean, d_sigma)),
        }
    }

    /// Push proposal-parameter gradients through the full-set latent encoder.
    /// Valid while the `encode_full` caches are live.
    pub fn latent_backward_full(&mut self, grad: &LatentGrad) {
        match self {
            NeuralProcess::ConvCnp(_) => {}
            NeuralProcess::ConvNp(m) => m.latent_backward_full(grad),
            NeuralProcess::Anp(m) => m.latent_backward_full(grad),
            NeuralProcess::Np(m) => m.latent_backward_full(grad),
        }
    }

    /// Backward through the context encoders: the deterministic path using
    /// the gradients accumulated by `decode_backward`, and the latent prior
    /// path using `grad`. Valid while the `encode_context` caches are live.
    pub fn backward_context(&mut self, grad: Option<&LatentGrad>) {
        match self {
            NeuralProcess::ConvCnp(m) => m.backward_context(),
            NeuralProcess::ConvNp(m) => {
                if let Some(g) = grad {
                    m.backward_context(g);
                }
            }
            NeuralProcess::Anp(m) => m.backward_context(grad),
            NeuralProcess::Np(m) => m.backward_context(grad),
        }
    }
}

impl Parameterized for NeuralProcess {
    fn num_parameters(&self) -> usize {
        match self {
            NeuralProcess::ConvCnp(m) => m.num_parameters(),
            NeuralProcess::ConvNp(m) => m.num_parameters(),
            NeuralProcess::Anp(m) => m.num_parameters(),
            NeuralProcess::Np(m) => m.num_parameters(),
        }
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        match self {
            NeuralProcess::ConvCnp(m) => m.collect_parameters(out),
            NeuralProcess::ConvNp(m) => m.collect_parameters(out),
            NeuralProcess::Anp(m) => m.collect_parameters(out),
            NeuralProcess::Np(m) => m.collect_parameters(out),
        }
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        match self {
            NeuralProcess::ConvCnp(m) => m.collect_gradients(out),
            NeuralProcess::ConvNp(m) => m.collect_gradients(out),
            NeuralProcess::Anp(m) => m.collect_gradients(out),
            NeuralProcess::Np(m) => m.collect_gradients(out),
        }
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        match self {
            NeuralProcess::ConvCnp(m) => m.load_parameters(src),
            NeuralProcess::ConvNp(m) => m.load_parameters(src),
            NeuralProcess::Anp(m) => m.load_parameters(src),
            NeuralProcess::Np(m) => m.load_parameters(src),
        }
    }

    fn zero_gradients(&mut self) {
        match self {
            NeuralProcess::ConvCnp(m) => m.zero_gradients(),
            NeuralProcess::ConvNp(m) => m.zero_gradients(),
            NeuralProcess::Anp(m) => m.zero_gradients(),
            NeuralProcess::Np(m) => m.zero_gradients(),
        }
    }
}
