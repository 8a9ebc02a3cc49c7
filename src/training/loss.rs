//! Training objectives.
//!
//! All three objectives return the per-task negative objective averaged over
//! the batch, in nats. With `train` set they also accumulate parameter
//! gradients into the model using a two-pass scheme: the first pass runs all
//! latent samples forward and collects their log-weights, the second pass
//! re-runs the decoder per sample and pushes back a seed scaled by that
//! sample's softmax weight. Only one sample's decoder caches are ever live.

use ndarray::{Array1, Array3};
use rand::Rng;

use crate::config::LossName;
use crate::nn::Parameterized;
use crate::data::Task;
use crate::model::distribution::{
    kl_divergence, kl_divergence_grad, log_mean_exp, log_prob, log_prob_grad_params,
    log_prob_grad_value,
};
use crate::model::{LatentDist, LatentGrad, NeuralProcess};

/// Per-call loss settings.
#[derive(Debug, Clone, Copy)]
pub struct LossSettings {
    /// Monte-Carlo samples of the latent variable.
    pub num_samples: usize,
    /// Clamp the predictive noise to this value (early-training aid).
    pub noise: Option<f64>,
}

/// Evaluate one objective on one batch of tasks. With `train` set, leaves
/// the gradients of the objective accumulated in the model.
pub fn compute_loss(
    model: &mut NeuralProcess,
    loss: LossName,
    task: &Task,
    settings: &LossSettings,
    train: bool,
    rng: &mut impl Rng,
) -> f64 {
    match loss {
        LossName::Loglik => loglik(model, task, settings, false, train, rng),
        LossName::LoglikIw => loglik(model, task, settings, true, train, rng),
        LossName::Elbo => elbo(model, task, settings, train, rng),
    }
}

fn accumulate_reparam(grad: &mut LatentGrad, d_z: &Array3<f64>, eps: &Array3<f64>) {
    grad.d_mean += d_z;
    grad.d_sigma += &(d_z * eps);
}

/// Monte-Carlo log-likelihood, plain or importance-weighted.
///
/// Plain: samples come from the prior and the objective is the
/// log-mean-exp of the predictive log-densities. Importance-weighted:
/// samples come from a proposal conditioned on context and targets jointly,
/// and each sample's weight picks up the prior-minus-proposal log-density.
fn loglik(
    model: &mut NeuralProcess,
    task: &Task,
    settings: &LossSettings,
    importance_weighted: bool,
    train: bool,
    rng: &mut impl Rng,
) -> f64 {
    if train {
        model.zero_gradients();
    }
    let b = task.batch_size();

    let prior = match model.encode_context(&task.xc, &task.yc, &task.xt) {
        Some(p) => p,
        None => {
            // Deterministic model: a single forward pass, no sampling.
            let pred = model.decode(&task.xt, None, settings.noise);
            let logp = log_prob(&task.yt, &pred.mean, &pred.sigma);
            let objective = -logp.sum() / b as f64;
            if train {
                let seed = Array1::from_elem(b, -1.0 / b as f64);
                let (d_mean, d_sigma) =
                    log_prob_grad_params(&task.yt, &pred.mean, &pred.sigma, &seed);
                model.decode_backward(&d_mean, &d_sigma);
                model.backward_context(None);
            }
            return objective;
        }
    };

    let proposal: Option<LatentDist> = if importance_weighted {
        let union = task.with_context_in_targets();
        Some(
            model
                .encode_full(&union.xt, &union.yt)
                .expect("importance weighting needs a latent model"),
        )
    } else {
        None
    };
    let sampling = proposal.as_ref().unwrap_or(&prior);

    let num = settings.num_samples;
    let mut samples = Vec::with_capacity(num);
    let mut noises = Vec::with_capacity(num);
    let mut log_weights: Vec<Array1<f64>> = Vec::with_capacity(num);
    for _ in 0..num {
        let (z, eps) = sampling.sample(rng);
        let pred = model.decode(&task.xt, Some(&z), settings.noise);
        let mut lw = log_prob(&task.yt, &pred.mean, &pred.sigma);
        if importance_weighted {
            lw = lw + log_prob(&z, &prior.mean, &prior.sigma)
                - log_prob(&z, &sampling.mean, &sampling.sigma);
        }
        samples.push(z);
        noises.push(eps);
        log_weights.push(lw);
    }

    let mut objective = 0.0;
    for bi in 0..b {
        let per_sample: Vec<f64> = log_weights.iter().map(|lw| lw[bi]).collect();
        objective -= log_mean_exp(&per_sample) / b as f64;
    }

    if train {
        // Softmax of the log-weights over the sample axis, per task.
        let mut weights = vec![vec![0.0; b]; num];
        for bi in 0..b {
            let max = log_weights
                .iter()
                .map(|lw| lw[bi])
                .fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = log_weights.iter().map(|lw| (lw[bi] - max).exp()).sum();
            for si in 0..num {
                weights[si][bi] = (log_weights[si][bi] - max).exp() / total;
            }
        }

        let mut g_sampling = LatentGrad::zeros_like(sampling);
        let mut g_prior = LatentGrad::zeros_like(&prior);
        for si in 0..num {
            let seed = Array1::from_shape_fn(b, |bi| -weights[si][bi] / b as f64);
            let pred = model.decode(&task.xt, Some(&samples[si]), settings.noise);
            let (d_mean, d_sigma) = log_prob_grad_params(&task.yt, &pred.mean, &pred.sigma, &seed);
            let mut d_z = model
                .decode_backward(&d_mean, &d_sigma)
                .expect("latent model");

            if importance_weighted {
                let z = &samples[si];
                d_z = d_z + log_prob_grad_value(z, &prior.mean, &prior.sigma, &seed)
                    - log_prob_grad_value(z, &sampling.mean, &sampling.sigma, &seed);

                let (dm, ds) = log_prob_grad_params(z, &prior.mean, &prior.sigma, &seed);
                g_prior.d_mean += &dm;
                g_prior.d_sigma += &ds;
                let (dm, ds) = log_prob_grad_params(z, &sampling.mean, &sampling.sigma, &seed);
                g_sampling.d_mean -= &dm;
                g_sampling.d_sigma -= &ds;
            }
            accumulate_reparam(&mut g_sampling, &d_z, &noises[si]);
        }

        if importance_weighted {
            model.latent_backward_full(&g_sampling);
            // Restore the context-pass caches before the prior backward.
            model.encode_context(&task.xc, &task.yc, &task.xt);
            model.backward_context(Some(&g_prior));
        } else {
            model.backward_context(Some(&g_sampling));
        }
    }

    objective
}

/// Evidence lower bound with an analytic KL term.
///
/// The context set is subsumed into the target set so the reconstruction
/// covers the union of both, and the posterior is encoded from that union.
fn elbo(
    model: &mut NeuralProcess,
    task: &Task,
    settings: &LossSettings,
    train: bool,
    rng: &mut impl Rng,
) -> f64 {
    if train {
        model.zero_gradients();
    }
    let union = task.with_context_in_targets();
    let b = union.batch_size();

    let prior = model
        .encode_context(&union.xc, &union.yc, &union.xt)
        .expect("the ELBO objective needs a latent model");
    let posterior = model
        .encode_full(&union.xt, &union.yt)
        .expect("the ELBO objective needs a latent model");
    let kl = kl_divergence(&posterior, &prior);

    let num = settings.num_samples;
    let mut samples = Vec::with_capacity(num);
    let mut noises = Vec::with_capacity(num);
    let mut reconstruction = Array1::zeros(b);
    for _ in 0..num {
        let (z, eps) = posterior.sample(rng);
        let pred = model.decode(&union.xt, Some(&z), settings.noise);
        reconstruction += &log_prob(&union.yt, &pred.mean, &pred.sigma);
        samples.push(z);
        noises.push(eps);
    }
    reconstruction.mapv_inplace(|v| v / num as f64);

    let objective = (&kl - &reconstruction).sum() / b as f64;

    if train {
        let mut g_posterior = LatentGrad::zeros_like(&posterior);
        let seed = Array1::from_elem(b, -1.0 / (num * b) as f64);
        for si in 0..num {
            let pred = model.decode(&union.xt, Some(&samples[si]), settings.noise);
            let (d_mean, d_sigma) =
                log_prob_grad_params(&union.yt, &pred.mean, &pred.sigma, &seed);
            let d_z = model
                .decode_backward(&d_mean, &d_sigma)
                .expect("latent model");
            accumulate_reparam(&mut g_posterior, &d_z, &noises[si]);
        }

        // The KL enters with a positive sign.
        let kl_seed = Array1::from_elem(b, 1.0 / b as f64);
        let (gq, gp) = kl_divergence_grad(&posterior, &prior, &kl_seed);
        g_posterior.d_mean += &gq.d_mean;
        g_posterior.d_sigma += &gq.d_sigma;

        model.latent_backward_full(&g_posterior);
        model.encode_context(&union.xc, &union.yc, &union.xt);
        model.backward_context(Some(&gp));
    }

    objective
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::config::{ModelConfig, ModelName};
    use crate::model::np::Np;
    use crate::nn::{Activation, Mlp, Parameterized};

    fn toy_task() -> Task {
        let xc = Array3::from_shape_fn((2, 3, 1), |(b, i, _)| -1.0 + 0.7 * i as f64 + 0.1 * b as f64);
        let yc = xc.mapv(|v: f64| v.sin());
        let xt = Array3::from_shape_fn((2, 4, 1), |(b, i, _)| -0.8 + 0.5 * i as f64 - 0.1 * b as f64);
        let yt = xt.mapv(|v: f64| v.sin());
        Task { xc, yc, xt, yt }
    }

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            dim_r: 4,
            dim_z: 2,
            hidden: 6,
            num_layers: 1,
            num_heads: 2,
            points_per_unit: 4.0,
            cnn_channels: 4,
            cnn_layers: 2,
            kernel_size: 3,
            ..ModelConfig::default()
        }
    }

    /// An NP with tanh activations, so finite differences stay clean.
    fn smooth_np() -> NeuralProcess {
        let mut np = Np::new(&tiny_config());
        np.det_encoder = Mlp::with_hidden(2, 6, 1, 4, Activation::Tanh);
        np.lat_encoder = Mlp::with_hidden(2, 6, 1, 4, Activation::Tanh);
        np.decoder = Mlp::with_hidden(7, 6, 1, 2, Activation::Tanh);
        NeuralProcess::Np(np)
    }

    #[test]
    fn test_deterministic_loglik_matches_direct_computation() {
        let mut model = NeuralProcess::build(ModelName::Convcnp, &tiny_config());
        let task = toy_task();
        let settings = LossSettings {
            num_samples: 1,
            noise: None,
        };

        let mut rng = StdRng::seed_from_u64(1);
        let loss = compute_loss(&mut model, LossName::Loglik, &task, &settings, false, &mut rng);

        model.encode_context(&task.xc, &task.yc, &task.xt);
        let pred = model.decode(&task.xt, None, None);
        let direct = -log_prob(&task.yt, &pred.mean, &pred.sigma).sum() / 2.0;
        assert_abs_diff_eq!(loss, direct, epsilon = 1e-10);
    }

    #[test]
    fn test_all_losses_finite_on_all_models() {
        let task = toy_task();
        let settings = LossSettings {
            num_samples: 3,
            noise: None,
        };
        let mut rng = StdRng::seed_from_u64(2);

        for name in [ModelName::Convnp, ModelName::Anp, ModelName::Np] {
            for loss in [LossName::Loglik, LossName::LoglikIw, LossName::Elbo] {
                let mut model = NeuralProcess::build(name, &tiny_config());
                let value = compute_loss(&mut model, loss, &task, &settings, true, &mut rng);
                assert!(value.is_finite(), "{:?}/{:?} produced {}", name, loss, value);

                let mut grads = Vec::new();
                model.collect_gradients(&mut grads);
                assert!(grads.iter().all(|g| g.is_finite()));
                assert!(grads.iter().any(|g| g.abs() > 0.0));
            }
        }
    }

    /// Reparameterized losses are deterministic functions of the parameters
    /// once the RNG seed is pinned, so finite differences apply end to end.
    fn loss_gradient_check(loss: LossName, num_samples: usize, stride: usize) {
        let mut model = smooth_np();
        let task = toy_task();
        let settings = LossSettings {
            num_samples,
            noise: None,
        };

        let eval = |model: &mut NeuralProcess| -> f64 {
            let mut rng = StdRng::seed_from_u64(77);
            compute_loss(model, loss, &task, &settings, false, &mut rng)
        };

        let mut rng = StdRng::seed_from_u64(77);
        compute_loss(&mut model, loss, &task, &settings, true, &mut rng);

        let mut analytic = Vec::new();
        model.collect_gradients(&mut analytic);
        let mut params = Vec::new();
        model.collect_parameters(&mut params);

        let eps = 1e-5;
        for i in (0..params.len()).step_by(stride) {
            let mut plus = params.clone();
            plus[i] += eps;
            model.load_parameters(&mut plus.into_iter());
            let f_plus = eval(&mut model);

            let mut minus = params.clone();
            minus[i] -= eps;
            model.load_parameters(&mut minus.into_iter());
            let f_minus = eval(&mut model);

            let numeric = (f_plus - f_minus) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[i], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_loglik_gradient_check() {
        loss_gradient_check(LossName::Loglik, 3, 19);
    }

    #[test]
    fn test_loglik_iw_gradient_check() {
        loss_gradient_check(LossName::LoglikIw, 3, 19);
    }

    #[test]
    fn test_elbo_gradient_check() {
        loss_gradient_check(LossName::Elbo, 2, 19);
    }

    #[test]
    fn test_fixed_noise_is_used() {
        let mut model = smooth_np();
        let task = toy_task();
        let settings = LossSettings {
            num_samples: 2,
            noise: Some(0.05),
        };
        let mut rng = StdRng::seed_from_u64(3);
        compute_loss(&mut model, LossName::Loglik, &task, &settings, false, &mut rng);

        let prior = model.encode_context(&task.xc, &task.yc, &task.xt).unwrap();
        let pred = model.decode(&task.xt, Some(&prior.mean.clone()), Some(0.05));
        assert!(pred.sigma.iter().all(|&s| (s - 0.05).abs() < 1e-12));
    }
}
