//! A batch of context/target regression tasks.

use ndarray::Array3;

/// One sampled batch of tasks.
///
/// Arrays are shaped `(batch, points, dims)`. Context and target sets share
/// the batch axis; within a batch every task has the same context count and
/// the same target count, so the arrays are rectangular by construction.
#[derive(Debug, Clone)]
pub struct Task {
    /// Context input locations, `(batch, num_context, dim_x)`
    pub xc: Array3<f64>,
    /// Context output values, `(batch, num_context, dim_y)`
    pub yc: Array3<f64>,
    /// Target input locations, `(batch, num_target, dim_x)`
    pub xt: Array3<f64>,
    /// Target output values, `(batch, num_target, dim_y)`
    pub yt: Array3<f64>,
}

impl Task {
    pub fn batch_size(&self) -> usize {
        self.xc.shape()[0]
    }

    pub fn num_context(&self) -> usize {
        self.xc.shape()[1]
    }

    pub fn num_target(&self) -> usize {
        self.xt.shape()[1]
    }

    /// Check the shape invariants: context arrays agree on point count,
    /// target arrays agree on point count, and all four share the batch axis.
    pub fn validate(&self) -> bool {
        let b = self.xc.shape()[0];
        self.yc.shape()[0] == b
            && self.xt.shape()[0] == b
            && self.yt.shape()[0] == b
            && self.xc.shape()[1] == self.yc.shape()[1]
            && self.xt.shape()[1] == self.yt.shape()[1]
    }

    /// A task whose target set subsumes the context set, used by the ELBO
    /// objective so the training signal covers the union of both sets.
    pub fn with_context_in_targets(&self) -> Task {
        let b = self.batch_size();
        let n = self.num_context();
        let m = self.num_target();
        let dim_x = self.xc.shape()[2];
        let dim_y = self.yc.shape()[2];

        let mut xt = Array3::zeros((b, n + m, dim_x));
        let mut yt = Array3::zeros((b, n + m, dim_y));
        for bi in 0..b {
            for i in 0..n {
                for d in 0..dim_x {
                    xt[[bi, i, d]] = self.xc[[bi, i, d]];
                }
                for d in 0..dim_y {
                    yt[[bi, i, d]] = self.yc[[bi, i, d]];
                }
            }
            for i in 0..m {
                for d in 0..dim_x {
                    xt[[bi, n + i, d]] = self.xt[[bi, i, d]];
                }
                for d in 0..dim_y {
                    yt[[bi, n + i, d]] = self.yt[[bi, i, d]];
                }
            }
        }

        Task {
            xc: self.xc.clone(),
            yc: self.yc.clone(),
            xt,
            yt,
        }
    }
}
