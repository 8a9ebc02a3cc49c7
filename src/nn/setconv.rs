//! Set convolutions: moving between off-grid point sets and a uniform grid
//! with an RBF kernel whose length scale is learned in log space.

use ndarray::{Array1, Array3};

use super::Parameterized;

/// Division guard for the density normalization.
const DENSITY_EPS: f64 = 1e-8;

fn rbf_weight(delta: f64, scale: f64) -> f64 {
    (-0.5 * (delta / scale).powi(2)).exp()
}

struct EncoderCache {
    weights: Array3<f64>,
    density: Array3<f64>,
    signal: Array3<f64>,
    xc: Array3<f64>,
    yc: Array3<f64>,
    grid: Array1<f64>,
}

/// Maps a context set onto a grid as a density channel plus
/// density-normalized value channels.
pub struct SetConvEncoder {
    pub log_scale: f64,
    pub grad_log_scale: f64,
    cache: Option<EncoderCache>,
}

impl SetConvEncoder {
    /// The initial length scale is typically twice the grid spacing.
    pub fn new(init_scale: f64) -> Self {
        Self {
            log_scale: init_scale.ln(),
            grad_log_scale: 0.0,
            cache: None,
        }
    }

    /// Forward pass. `xc` is `(batch, n, 1)`, `yc` is `(batch, n, dy)` and
    /// the output is `(batch, grid, 1 + dy)` with the density first.
    pub fn forward(
        &mut self,
        xc: &Array3<f64>,
        yc: &Array3<f64>,
        grid: &Array1<f64>,
    ) -> Array3<f64> {
        let (b, n, _) = xc.dim();
        let dy = yc.shape()[2];
        let g = grid.len();
        let scale = self.log_scale.exp();

        let mut weights = Array3::zeros((b, n, g));
        let mut density = Array3::zeros((b, g, 1));
        let mut signal = Array3::zeros((b, g, dy));

        for bi in 0..b {
            for i in 0..n {
                let x = xc[[bi, i, 0]];
                for gi in 0..g {
                    let w = rbf_weight(x - grid[gi], scale);
                    weights[[bi, i, gi]] = w;
                    density[[bi, gi, 0]] += w;
                    for c in 0..dy {
                        signal[[bi, gi, c]] += w * yc[[bi, i, c]];
                    }
                }
            }
        }

        let mut output = Array3::zeros((b, g, 1 + dy));
        for bi in 0..b {
            for gi in 0..g {
                let d = density[[bi, gi, 0]];
                output[[bi, gi, 0]] = d;
                for c in 0..dy {
                    output[[bi, gi, 1 + c]] = signal[[bi, gi, c]] / (d + DENSITY_EPS);
                }
            }
        }

        self.cache = Some(EncoderCache {
            weights,
            density,
            signal,
            xc: xc.clone(),
            yc: yc.clone(),
            grid: grid.clone(),
        });
        output
    }

    /// Backward pass. Only the length scale is learnable; the inputs are
    /// data, so no input gradient is produced.
    pub fn backward(&mut self, output_gradient: &Array3<f64>) {
        let cache = self
            .cache
            .as_ref()
            .expect("Must call forward before backward");
        let (b, n, g) = cache.weights.dim();
        let dy = cache.yc.shape()[2];
        let scale = self.log_scale.exp();

        for bi in 0..b {
            for gi in 0..g {
                let d = cache.density[[bi, gi, 0]];
                let denom = d + DENSITY_EPS;

                // Gradient reaching the raw density and signal sums.
                let mut d_density = output_gradient[[bi, gi, 0]];
                for c in 0..dy {
                    let dnorm = output_gradient[[bi, gi, 1 + c]];
                    d_density -= dnorm * cache.signal[[bi, gi, c]] / (denom * denom);
                }

                for i in 0..n {
                    let w = cache.weights[[bi, i, gi]];
                    let mut dw = d_density;
                    for c in 0..dy {
                        let dnorm = output_gradient[[bi, gi, 1 + c]];
                        dw += dnorm / denom * cache.yc[[bi, i, c]];
                    }
                    let delta = cache.xc[[bi, i, 0]] - cache.grid[gi];
                    self.grad_log_scale += dw * w * (delta / scale).powi(2);
                }
            }
        }
    }
}

impl Parameterized for SetConvEncoder {
    fn num_parameters(&self) -> usize {
        1
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        out.push(self.log_scale);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        out.push(self.grad_log_scale);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.log_scale = src.next().expect("parameter vector too short");
    }

    fn zero_gradients(&mut self) {
        self.grad_log_scale = 0.0;
    }
}

struct DecoderCache {
    weights: Array3<f64>,
    features: Array3<f64>,
    xt: Array3<f64>,
    grid: Array1<f64>,
}

/// Reads grid features off at arbitrary target locations by RBF-weighted
/// summation.
pub struct SetConvDecoder {
    pub log_scale: f64,
    pub grad_log_scale: f64,
    cache: Option<DecoderCache>,
}

impl SetConvDecoder {
    pub fn new(init_scale: f64) -> Self {
        Self {
            log_scale: init_scale.ln(),
            grad_log_scale: 0.0,
            cache: None,
        }
    }

    /// `features` is `(batch, grid, c)`, `xt` is `(batch, m, 1)`; output is
    /// `(batch, m, c)`.
    pub fn forward(
        &mut self,
        features: &Array3<f64>,
        grid: &Array1<f64>,
        xt: &Array3<f64>,
    ) -> Array3<f64> {
        let (b, g, c) = features.dim();
        let m = xt.shape()[1];
        let scale = self.log_scale.exp();

        let mut weights = Array3::zeros((b, m, g));
        let mut output = Array3::zeros((b, m, c));
        for bi in 0..b {
            for mi in 0..m {
                let x = xt[[bi, mi, 0]];
                for gi in 0..g {
                    let w = rbf_weight(x - grid[gi], scale);
                    weights[[bi, mi, gi]] = w;
                    for ci in 0..c {
                        output[[bi, mi, ci]] += w * features[[bi, gi, ci]];
                    }
                }
            }
        }

        self.cache = Some(DecoderCache {
            weights,
            features: features.clone(),
            xt: xt.clone(),
            grid: grid.clone(),
        });
        output
    }

    /// Backward pass: returns the gradient with respect to the grid features
    /// and accumulates the length-scale gradient.
    pub fn backward(&mut self, output_gradient: &Array3<f64>) -> Array3<f64> {
        let cache = self
            .cache
            .as_ref()
            .expect("Must call forward before backward");
        let (b, m, g) = cache.weights.dim();
        let c = cache.features.shape()[2];
        let scale = self.log_scale.exp();

        let mut d_features = Array3::zeros(cache.features.dim());
        for bi in 0..b {
            for mi in 0..m {
                let x = cache.xt[[bi, mi, 0]];
                for gi in 0..g {
                    let w = cache.weights[[bi, mi, gi]];
                    let mut dw_inner = 0.0;
                    for ci in 0..c {
                        let dy = output_gradient[[bi, mi, ci]];
                        d_features[[bi, gi, ci]] += w * dy;
                        dw_inner += dy * cache.features[[bi, gi, ci]];
                    }
                    let delta = x - cache.grid[gi];
                    self.grad_log_scale += dw_inner * w * (delta / scale).powi(2);
                }
            }
        }
        d_features
    }
}

impl Parameterized for SetConvDecoder {
    fn num_parameters(&self) -> usize {
        1
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        out.push(self.log_scale);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        out.push(self.grad_log_scale);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.log_scale = src.next().expect("parameter vector too short");
    }

    fn zero_gradients(&mut self) {
        self.grad_log_scale = 0.0;
    }
}

/// Uniform grid covering `[lo, hi]` extended by `margin`, at the given
/// resolution.
pub fn make_grid(lo: f64, hi: f64, points_per_unit: f64, margin: f64) -> Array1<f64> {
    let lo = lo - margin;
    let hi = hi + margin;
    let num = (((hi - lo) * points_per_unit).ceil() as usize).max(2);
    Array1::linspace(lo, hi, num)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_grid_covers_range() {
        let grid = make_grid(-2.0, 2.0, 16.0, 0.1);
        assert!(grid[0] <= -2.0);
        assert!(grid[grid.len() - 1] >= 2.0);
        assert!(grid.len() >= 64);
    }

    #[test]
    fn test_encoder_density_counts_points() {
        // With a tiny length scale each context point contributes weight ~1
        // to its nearest grid cell only, so the density sums to ~n.
        let mut enc = SetConvEncoder::new(0.05);
        let grid = make_grid(-1.0, 1.0, 8.0, 0.0);
        let xc = Array3::from_shape_fn((1, 3, 1), |(_, i, _)| -0.5 + 0.5 * i as f64);
        let yc = Array3::ones((1, 3, 1));
        let out = enc.forward(&xc, &yc, &grid);

        let total_density: f64 = (0..grid.len()).map(|gi| out[[0, gi, 0]]).sum();
        assert!(total_density > 2.0 && total_density < 5.0);
    }

    #[test]
    fn test_encoder_scale_gradient_check() {
        let mut enc = SetConvEncoder::new(0.3);
        let grid = make_grid(-1.0, 1.0, 4.0, 0.0);
        let xc = Array3::from_shape_fn((2, 3, 1), |(b, i, _)| -0.6 + 0.4 * i as f64 + 0.1 * b as f64);
        let yc = Array3::from_shape_fn((2, 3, 1), |(b, i, _)| 0.5 * i as f64 - 0.2 * b as f64);

        let out = enc.forward(&xc, &yc, &grid);
        enc.backward(&out.mapv(|v| 2.0 * v));
        let analytic = enc.grad_log_scale;

        let eps = 1e-6;
        let loss_at = |log_scale: f64, enc: &mut SetConvEncoder| -> f64 {
            enc.log_scale = log_scale;
            enc.forward(&xc, &yc, &grid).mapv(|v| v * v).sum()
        };
        let base = enc.log_scale;
        let numeric = (loss_at(base + eps, &mut enc) - loss_at(base - eps, &mut enc)) / (2.0 * eps);
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-4);
    }

    #[test]
    fn test_decoder_feature_gradient_check() {
        let mut dec = SetConvDecoder::new(0.25);
        let grid = make_grid(-1.0, 1.0, 4.0, 0.0);
        let g = grid.len();
        let features = Array3::from_shape_fn((1, g, 2), |(_, gi, c)| {
            0.1 * gi as f64 - 0.2 * c as f64
        });
        let xt = Array3::from_shape_fn((1, 3, 1), |(_, i, _)| -0.5 + 0.4 * i as f64);

        let out = dec.forward(&features, &grid, &xt);
        let d_features = dec.backward(&Array3::ones(out.dim()));

        let eps = 1e-6;
        for gi in (0..g).step_by(3) {
            for c in 0..2 {
                let mut plus = features.clone();
                plus[[0, gi, c]] += eps;
                let f_plus: f64 = dec.forward(&plus, &grid, &xt).sum();
                let mut minus = features.clone();
                minus[[0, gi, c]] -= eps;
                let f_minus: f64 = dec.forward(&minus, &grid, &xt).sum();
                let numeric = (f_plus - f_minus) / (2.0 * eps);
                assert_abs_diff_eq!(d_features[[0, gi, c]], numeric, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_decoder_scale_gradient_check() {
        let mut dec = SetConvDecoder::new(0.25);
        let grid = make_grid(-1.0, 1.0, 4.0, 0.0);
        let g = grid.len();
        let features = Array3::from_shape_fn((1, g, 1), |(_, gi, _)| (gi as f64 * 0.7).sin());
        let xt = Array3::from_shape_fn((1, 4, 1), |(_, i, _)| -0.7 + 0.35 * i as f64);

        let out = dec.forward(&features, &grid, &xt);
        dec.backward(&out.mapv(|v| 2.0 * v));
        let analytic = dec.grad_log_scale;

        let eps = 1e-6;
        let base = dec.log_scale;
        let loss_at = |log_scale: f64, dec: &mut SetConvDecoder| -> f64 {
            dec.log_scale = log_scale;
            dec.forward(&features, &grid, &xt).mapv(|v| v * v).sum()
        };
        let numeric = (loss_at(base + eps, &mut dec) - loss_at(base - eps, &mut dec)) / (2.0 * eps);
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-4);
    }
}
