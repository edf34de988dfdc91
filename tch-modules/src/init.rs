use crate::common::*;

/// Xavier (Glorot) uniform initializer for a weight with the given fans.
pub fn xavier_uniform(fan_in: i64, fan_out: i64) -> nn::Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    nn::Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Bias value such that the sigmoid of the initial logits equals `prior_prob`.
pub fn prior_prob_bias(prior_prob: f64) -> f64 {
    -((1.0 - prior_prob) / prior_prob).ln()
}

/// Fully connected layer with Xavier uniform weights and the default bias init.
pub fn xavier_linear<'p>(
    path: impl Borrow<nn::Path<'p>>,
    in_dim: i64,
    out_dim: i64,
    bias: bool,
) -> nn::Linear {
    nn::linear(
        path,
        in_dim,
        out_dim,
        nn::LinearConfig {
            ws_init: xavier_uniform(in_dim, out_dim),
            bs_init: None,
            bias,
        },
    )
}
