//! Diagonal Gaussian distributions: log-densities, KL divergence and
//! reparameterized sampling, with the gradients the losses need.

use ndarray::{Array1, Array3};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

const LOG_2PI: f64 = 1.8378770664093453;

/// A diagonal Gaussian over `(batch, points, channels)` values.
///
/// Global latent variables use a single point (`points == 1`); the
/// convolutional latent models use one point per grid cell.
#[derive(Debug, Clone)]
pub struct LatentDist {
    pub mean: Array3<f64>,
    pub sigma: Array3<f64>,
}

/// Gradients with respect to a distribution's parameters.
#[derive(Debug, Clone)]
pub struct LatentGrad {
    pub d_mean: Array3<f64>,
    pub d_sigma: Array3<f64>,
}

impl LatentDist {
    pub fn shape(&self) -> (usize, usize, usize) {
        self.mean.dim()
    }

    /// Reparameterized sample: returns `(z, eps)` with `z = mean + sigma * eps`.
    pub fn sample(&self, rng: &mut impl Rng) -> (Array3<f64>, Array3<f64>) {
        let eps = Array3::from_shape_fn(self.mean.dim(), |_| StandardNormal.sample(rng));
        let z = &self.mean + &(&self.sigma * &eps);
        (z, eps)
    }
}

impl LatentGrad {
    pub fn zeros_like(dist: &LatentDist) -> Self {
        Self {
            d_mean: Array3::zeros(dist.mean.dim()),
            d_sigma: Array3::zeros(dist.sigma.dim()),
        }
    }
}

/// Per-batch Gaussian log-density of `y`, summed over points and channels.
pub fn log_prob(y: &Array3<f64>, mean: &Array3<f64>, sigma: &Array3<f64>) -> Array1<f64> {
    let (b, n, c) = y.dim();
    let mut out = Array1::zeros(b);
    for bi in 0..b {
        let mut sum = 0.0;
        for i in 0..n {
            for ci in 0..c {
                let s = sigma[[bi, i, ci]];
                let r = (y[[bi, i, ci]] - mean[[bi, i, ci]]) / s;
                sum += -0.5 * LOG_2PI - s.ln() - 0.5 * r * r;
            }
        }
        out[bi] = sum;
    }
    out
}

/// Gradients of `sum_b seed[b] * log_prob(y; mean, sigma)[b]` with respect to
/// the mean and sigma.
pub fn log_prob_grad_params(
    y: &Array3<f64>,
    mean: &Array3<f64>,
    sigma: &Array3<f64>,
    seed: &Array1<f64>,
) -> (Array3<f64>, Array3<f64>) {
    let (b, n, c) = y.dim();
    let mut d_mean = Array3::zeros(y.dim());
    let mut d_sigma = Array3::zeros(y.dim());
    for bi in 0..b {
        for i in 0..n {
            for ci in 0..c {
                let s = sigma[[bi, i, ci]];
                let diff = y[[bi, i, ci]] - mean[[bi, i, ci]];
                d_mean[[bi, i, ci]] = seed[bi] * diff / (s * s);
                d_sigma[[bi, i, ci]] = seed[bi] * (diff * diff / (s * s * s) - 1.0 / s);
            }
        }
    }
    (d_mean, d_sigma)
}

/// Gradient of `sum_b seed[b] * log_prob(z; mean, sigma)[b]` with respect to
/// the evaluation point `z`.
pub fn log_prob_grad_value(
    z: &Array3<f64>,
    mean: &Array3<f64>,
    sigma: &Array3<f64>,
    seed: &Array1<f64>,
) -> Array3<f64> {
    let (b, n, c) = z.dim();
    let mut dz = Array3::zeros(z.dim());
    for bi in 0..b {
        for i in 0..n {
            for ci in 0..c {
                let s = sigma[[bi, i, ci]];
                dz[[bi, i, ci]] = seed[bi] * (mean[[bi, i, ci]] - z[[bi, i, ci]]) / (s * s);
            }
        }
    }
    dz
}

/// Per-batch KL divergence `KL(q || p)` between diagonal Gaussians, summed
/// over points and channels.
pub fn kl_divergence(q: &LatentDist, p: &LatentDist) -> Array1<f64> {
    let (b, n, c) = q.mean.dim();
    let mut out = Array1::zeros(b);
    for bi in 0..b {
        let mut sum = 0.0;
        for i in 0..n {
            for ci in 0..c {
                let (mq, sq) = (q.mean[[bi, i, ci]], q.sigma[[bi, i, ci]]);
                let (mp, sp) = (p.mean[[bi, i, ci]], p.sigma[[bi, i, ci]]);
                sum += (sp / sq).ln() + (sq * sq + (mq - mp).powi(2)) / (2.0 * sp * sp) - 0.5;
            }
        }
        out[bi] = sum;
    }
    out
}

/// Gradients of `sum_b seed[b] * KL(q || p)[b]` with respect to both
/// distributions' parameters. Returns `(grad_q, grad_p)`.
pub fn kl_divergence_grad(
    q: &LatentDist,
    p: &LatentDist,
    seed: &Array1<f64>,
) -> (LatentGrad, LatentGrad) {
    let (b, n, c) = q.mean.dim();
    let mut gq = LatentGrad::zeros_like(q);
    let mut gp = LatentGrad::zeros_like(p);
    for bi in 0..b {
        for i in 0..n {
            for ci in 0..c {
                let (mq, sq) = (q.mean[[bi, i, ci]], q.sigma[[bi, i, ci]]);
                let (mp, sp) = (p.mean[[bi, i, ci]], p.sigma[[bi, i, ci]]);
                let w = seed[bi];
                gq.d_mean[[bi, i, ci]] = w * (mq - mp) / (sp * sp);
                gq.d_sigma[[bi, i, ci]] = w * (sq / (sp * sp) - 1.0 / sq);
                gp.d_mean[[bi, i, ci]] = w * (mp - mq) / (sp * sp);
                gp.d_sigma[[bi, i, ci]] =
                    w * (1.0 / sp - (sq * sq + (mq - mp).powi(2)) / (sp * sp * sp));
            }
        }
    }
    (gq, gp)
}

/// Numerically stable log-mean-exp over a slice.
pub fn log_mean_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + (sum / values.len() as f64).ln()
}
