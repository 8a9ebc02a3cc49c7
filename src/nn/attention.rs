//! Multi-head scaled dot-product cross-attention.

use ndarray::{s, Array2, Array3};

use super::{Linear, Parameterized};

/// Single-head scaled dot-product attention.
///
/// `query` is `(m, d)`, `key` and `value` are `(n, d)`. Returns the output
/// `(m, d)` and the attention weights `(m, n)`.
pub fn scaled_dot_product_attention(
    query: &Array2<f64>,
    key: &Array2<f64>,
    value: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let d_k = query.ncols() as f64;
    let scale = 1.0 / d_k.sqrt();

    let mut scores = query.dot(&key.t());
    scores.mapv_inplace(|v| v * scale);

    // Row-wise softmax, max-subtracted for stability.
    let mut attn = scores;
    for mut row in attn.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f64 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    let output = attn.dot(value);
    (output, attn)
}

/// Backward pass of single-head attention.
///
/// Returns gradients with respect to query, key and value.
fn attention_backward(
    query: &Array2<f64>,
    key: &Array2<f64>,
    value: &Array2<f64>,
    attn: &Array2<f64>,
    d_output: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let d_k = query.ncols() as f64;
    let scale = 1.0 / d_k.sqrt();

    let d_value = attn.t().dot(d_output);
    let d_attn = d_output.dot(&value.t());

    // Softmax Jacobian per row: ds = a * (da - <da, a>)
    let mut d_scores = Array2::zeros(attn.dim());
    for i in 0..attn.nrows() {
        let a = attn.row(i);
        let da = d_attn.row(i);
        let inner: f64 = a.iter().zip(da.iter()).map(|(x, y)| x * y).sum();
        for j in 0..attn.ncols() {
            d_scores[[i, j]] = a[j] * (da[j] - inner);
        }
    }

    let mut d_query = d_scores.dot(key);
    d_query.mapv_inplace(|v| v * scale);
    let mut d_key = d_scores.t().dot(query);
    d_key.mapv_inplace(|v| v * scale);

    (d_query, d_key, d_value)
}

struct AttentionCache {
    q: Array3<f64>,
    k: Array3<f64>,
    v: Array3<f64>,
    // Attention weights per (batch, head), row-major over heads.
    attn: Vec<Array2<f64>>,
}

/// Multi-head cross-attention with input/output projections.
///
/// Queries attend over the key/value set; all three inputs carry `d_model`
/// features.
pub struct MultiHeadAttention {
    query_proj: Linear,
    key_proj: Linear,
    value_proj: Linear,
    output_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    cache: Option<AttentionCache>,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, num_heads: usize) -> Self {
        assert!(
            d_model % num_heads == 0,
            "d_model must be divisible by num_heads"
        );
        Self {
            query_proj: Linear::new(d_model, d_model),
            key_proj: Linear::new(d_model, d_model),
            value_proj: Linear::new(d_model, d_model),
            output_proj: Linear::new(d_model, d_model),
            num_heads,
            head_dim: d_model / num_heads,
            cache: None,
        }
    }

    /// Forward pass. `query` is `(batch, m, d_model)`; `key` and `value` are
    /// `(batch, n, d_model)`.
    pub fn forward(
        &mut self,
        query: &Array3<f64>,
        key: &Array3<f64>,
        value: &Array3<f64>,
    ) -> Array3<f64> {
        let (b, m, d_model) = query.dim();

        let q = self.query_proj.forward(query);
        let k = self.key_proj.forward(key);
        let v = self.value_proj.forward(value);

        let mut concat = Array3::zeros((b, m, d_model));
        let mut attn_cache = Vec::with_capacity(b * self.num_heads);
        for bi in 0..b {
            for h in 0..self.num_heads {
                let cols = h * self.head_dim..(h + 1) * self.head_dim;
                let q_h = q.slice(s![bi, .., cols.clone()]).to_owned();
                let k_h = k.slice(s![bi, .., cols.clone()]).to_owned();
                let v_h = v.slice(s![bi, .., cols.clone()]).to_owned();
                let (out_h, attn) = scaled_dot_product_attention(&q_h, &k_h, &v_h);
                concat.slice_mut(s![bi, .., cols]).assign(&out_h);
                attn_cache.push(attn);
            }
        }

        self.cache = Some(AttentionCache {
            q,
            k,
            v,
            attn: attn_cache,
        });

        self.output_proj.forward(&concat)
    }

    /// Backward pass: accumulate projection gradients and return gradients
    /// for the query, key and value inputs.
    pub fn backward(
        &mut self,
        output_gradient: &Array3<f64>,
    ) -> (Array3<f64>, Array3<f64>, Array3<f64>) {
        let d_concat = self.output_proj.backward(output_gradient);
        let cache = self
            .cache
            .as_ref()
            .expect("Must call forward before backward");

        let (b, _, _) = cache.q.dim();
        let mut dq = Array3::zeros(cache.q.dim());
        let mut dk = Array3::zeros(cache.k.dim());
        let mut dv = Array3::zeros(cache.v.dim());

        for bi in 0..b {
            for h in 0..self.num_heads {
                let cols = h * self.head_dim..(h + 1) * self.head_dim;
                let q_h = cache.q.slice(s![bi, .., cols.clone()]).to_owned();
                let k_h = cache.k.slice(s![bi, .., cols.clone()]).to_owned();
                let v_h = cache.v.slice(s![bi, .., cols.clone()]).to_owned();
                let attn = &cache.attn[bi * self.num_heads + h];
                let d_out = d_concat.slice(s![bi, .., cols.clone()]).to_owned();

                let (dq_h, dk_h, dv_h) = attention_backward(&q_h, &k_h, &v_h, attn, &d_out);
                dq.slice_mut(s![bi, .., cols.clone()]).assign(&dq_h);
                dk.slice_mut(s![bi, .., cols.clone()]).assign(&dk_h);
                dv.slice_mut(s![bi, .., cols]).assign(&dv_h);
            }
        }

        let d_query = self.query_proj.backward(&dq);
        let d_key = self.key_proj.backward(&dk);
        let d_value = self.value_proj.backward(&dv);
        (d_query, d_key, d_value)
    }
}

impl Parameterized for MultiHeadAttention {
    fn num_parameters(&self) -> usize {
        self.query_proj.num_parameters()
            + self.key_proj.num_parameters()
            + self.value_proj.num_parameters()
            + self.output_proj.num_parameters()
    }

    fn collect_parameters(&self, out: &mut Vec<f64>) {
        self.query_proj.collect_parameters(out);
        self.key_proj.collect_parameters(out);
        self.value_proj.collect_parameters(out);
        self.output_proj.collect_parameters(out);
    }

    fn collect_gradients(&self, out: &mut Vec<f64>) {
        self.query_proj.collect_gradients(out);
        self.key_proj.collect_gradients(out);
        self.value_proj.collect_gradients(out);
        self.output_proj.collect_gradients(out);
    }

    fn load_parameters(&mut self, src: &mut dyn Iterator<Item = f64>) {
        self.query_proj.load_parameters(src);
        self.key_proj.load_parameters(src);
        self.value_proj.load_parameters(src);
        self.output_proj.load_parameters(src);
    }

    fn zero_gradients(&mut self) {
        self.query_proj.zero_gradients();
        self.key_proj.zero_gradients();
        self.value_proj.zero_gradients();
        self.output_proj.zero_gradients();
    }
}
