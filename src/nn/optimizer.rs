//! First-order optimizers over flat parameter vectors.

use serde::{Deserialize, Serialize};

/// Optimizer interface: update parameters in place from gradients.
pub trait Optimizer {
    fn step(&mut self, params: &mut [f64], grads: &[f64]);
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

/// Plain stochastic gradient descent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        for (p, g) in params.iter_mut().zip(grads.iter()) {
            *p -= self.learning_rate * g;
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    #[serde(skip)]
    t: usize,
    #[serde(skip)]
    m: Vec<f64>,
    #[serde(skip)]
    v: Vec<f64>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
            self.t = 0;
        }
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for i in 0..params.len() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * grads[i];
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * grads[i] * grads[i];
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_descends_quadratic() {
        let mut opt = Sgd::new(0.1);
        let mut params = vec![5.0];
        for _ in 0..100 {
            let grads = vec![2.0 * params[0]];
            opt.step(&mut params, &grads);
        }
        assert!(params[0].abs() < 1e-3);
    }

    #[test]
    fn test_adam_descends_quadratic() {
        let mut opt = Adam::new(0.1);
        let mut params = vec![5.0, -3.0];
        for _ in 0..500 {
            let grads: Vec<f64> = params.iter().map(|p| 2.0 * p).collect();
            opt.step(&mut params, &grads);
        }
        assert!(params[0].abs() < 1e-2);
        assert!(params[1].abs() < 1e-2);
    }

    #[test]
    fn test_adam_first_step_size_is_bounded_by_lr() {
        let mut opt = Adam::new(0.01);
        let mut params = vec![1.0];
        opt.step(&mut params, &[1000.0]);
        // Bias-corrected Adam moves roughly lr on the first step regardless
        // of gradient magnitude.
        assert!((1.0 - params[0] - 0.01).abs() < 1e-6);
    }
}
