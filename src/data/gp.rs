//! Gaussian processes with closed-form joint sampling and posteriors.

use ndarray::{Array1, Array2};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use super::StochasticProcess;

/// Jitter added to covariance diagonals before factorization.
const JITTER: f64 = 1e-8;

/// Stationary covariance kernels over 1-D inputs.
#[derive(Debug, Clone, Copy)]
pub enum Kernel {
    /// Exponentiated quadratic with the given length scale.
    Eq { scale: f64 },
    /// Matern-5/2 with the given length scale.
    Matern52 { scale: f64 },
    /// Periodic structure under a long EQ decay envelope.
    WeaklyPeriodic { period: f64, decay: f64 },
}

impl Kernel {
    /// Evaluate k(x, x') as a function of the separation.
    pub fn eval(&self, x1: f64, x2: f64) -> f64 {
        let r = (x1 - x2).abs();
        match *self {
            Kernel::Eq { scale } => (-0.5 * (r / scale).powi(2)).exp(),
            Kernel::Matern52 { scale } => {
                let s = 5.0_f64.sqrt() * r / scale;
                (1.0 + s + s * s / 3.0) * (-s).exp()
            }
            Kernel::WeaklyPeriodic { period, decay } => {
                let periodic = (-2.0 * (std::f64::consts::PI * r / period).sin().powi(2)).exp();
                let envelope = (-0.5 * (r / decay).powi(2)).exp();
                periodic * envelope
            }
        }
    }

    /// Covariance matrix between two sets of locations.
    pub fn matrix(&self, xa: &Array1<f64>, xb: &Array1<f64>) -> Array2<f64> {
        Array2::from_shape_fn((xa.len(), xb.len()), |(i, j)| self.eval(xa[i], xb[j]))
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix.
///
/// Returns `None` if a pivot goes non-positive despite the jitter.
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solve L x = b with L lower triangular.
fn solve_lower(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solve L^T x = b with L lower triangular.
fn solve_upper(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = b[i];
        for k in i + 1..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// A zero-mean Gaussian process prior.
pub struct GaussianProcess {
    kernel: Kernel,
    /// Observation noise variance assumed in the posterior.
    noise: f64,
}

impl GaussianProcess {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            noise: 1e-8,
        }
    }

    pub fn with_noise(kernel: Kernel, noise: f64) -> Self {
        Self { kernel, noise }
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }
}

impl StochasticProcess for GaussianProcess {
    fn sample_joint(&self, x: &Array1<f64>, rng: &mut dyn RngCore) -> Array1<f64> {
        let n = x.len();
        let mut cov = self.kernel.matrix(x, x);
        for i in 0..n {
            cov[[i, i]] += JITTER;
        }
        // With jitter on the diagonal the factorization only fails on
        // pathological inputs (e.g. exactly duplicated locations); fall back
        // to growing the jitter until it succeeds.
        let mut jitter = JITTER;
        let l = loop {
            if let Some(l) = cholesky(&cov) {
                break l;
            }
            jitter *= 10.0;
            for i in 0..n {
                cov[[i, i]] += jitter;
            }
        };

        let eps = Array1::from_shape_fn(n, |_| StandardNormal.sample(rng));
        l.dot(&eps)
    }

    fn posterior(
        &self,
        xc: &Array1<f64>,
        yc: &Array1<f64>,
        xs: &Array1<f64>,
    ) -> Option<(Array1<f64>, Array1<f64>)> {
        let n = xc.len();
        if n == 0 {
            let var = Array1::from_shape_fn(xs.len(), |i| self.kernel.eval(xs[i], xs[i]));
            return Some((Array1::zeros(xs.len()), var));
        }

        let mut kcc = self.kernel.matrix(xc, xc);
        for i in 0..n {
            kcc[[i, i]] += self.noise + JITTER;
        }
        let l = cholesky(&kcc)?;

        // alpha = Kcc^-1 yc via two triangular solves
        let alpha = solve_upper(&l, &solve_lower(&l, yc));

        let ksc = self.kernel.matrix(xs, xc);
        let mean = ksc.dot(&alpha);

        let mut var = Array1::<f64>::zeros(xs.len());
        for i in 0..xs.len() {
            let ks = ksc.row(i).to_owned();
            let v = solve_lower(&l, &ks);
            let reduction: f64 = v.iter().map(|a| a * a).sum();
            var[i] = (self.kernel.eval(xs[i], xs[i]) - reduction).max(0.0);
        }

        Some((mean, var))
    }

    fn name(&self) -> &'static str {
        match self.kernel {
            Kernel::Eq { .. } => "eq",
            Kernel::Matern52 { .. } => "matern",
            Kernel::WeaklyPeriodic { .. } => "weakly-periodic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_cholesky_reconstructs() {
        let a = ndarray::arr2(&[[4.0, 2.0, 0.6], [2.0, 5.0, 1.5], [0.6, 1.5, 3.0]]);
        let l = cholesky(&a).unwrap();
        let rec = l.dot(&l.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(rec[[i, j]], a[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_triangular_solves() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 5.0]]);
        let l = cholesky(&a).unwrap();
        let b = ndarray::arr1(&[1.0, 2.0]);
        let x = solve_upper(&l, &solve_lower(&l, &b));
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(back[1], 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_joint_sample_marginal_variance() {
        // Marginal variance of an EQ GP is k(x, x) = 1; the sample variance
        // over many independent draws should land near it.
        let gp = GaussianProcess::new(Kernel::Eq { scale: 0.25 });
        let mut rng = StdRng::seed_from_u64(42);
        let x = ndarray::arr1(&[0.0, 1.0, 2.0]);

        let draws = 2000;
        let mut sum_sq = 0.0;
        for _ in 0..draws {
            let y = gp.sample_joint(&x, &mut rng);
            sum_sq += y[0] * y[0];
        }
        let var = sum_sq / draws as f64;
        assert!((var - 1.0).abs() < 0.15, "marginal variance {}", var);
    }

    #[test]
    fn test_posterior_interpolates_observations() {
        let gp = GaussianProcess::new(Kernel::Eq { scale: 0.5 });
        let xc = ndarray::arr1(&[-1.0, 0.0, 1.0]);
        let yc = ndarray::arr1(&[0.5, -0.2, 0.7]);
        let (mean, var) = gp.posterior(&xc, &yc, &xc).unwrap();

        for i in 0..3 {
            assert_abs_diff_eq!(mean[i], yc[i], epsilon = 1e-3);
            assert!(var[i] < 1e-3);
        }
    }

    #[test]
    fn test_posterior_reverts_to_prior_far_away() {
        let gp = GaussianProcess::new(Kernel::Eq { scale: 0.25 });
        let xc = ndarray::arr1(&[0.0]);
        let yc = ndarray::arr1(&[3.0]);
        let xs = ndarray::arr1(&[50.0]);
        let (mean, var) = gp.posterior(&xc, &yc, &xs).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_context_posterior_is_prior() {
        let gp = GaussianProcess::new(Kernel::Matern52 { scale: 0.25 });
        let xs = ndarray::arr1(&[0.0, 1.0]);
        let (mean, var) = gp
            .posterior(&Array1::zeros(0), &Array1::zeros(0), &xs)
            .unwrap();
        assert_eq!(mean[0], 0.0);
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matern_and_periodic_kernels_are_valid() {
        for kernel in [
            Kernel::Matern52 { scale: 0.25 },
            Kernel::WeaklyPeriodic {
                period: 1.0,
                decay: 4.0,
            },
        ] {
            assert_abs_diff_eq!(kernel.eval(0.3, 0.3), 1.0, epsilon = 1e-12);
            assert!(kernel.eval(0.0, 1.0) < 1.0);
            // Symmetry
            assert_abs_diff_eq!(kernel.eval(0.1, 0.9), kernel.eval(0.9, 0.1), epsilon = 1e-12);
        }
    }
}
