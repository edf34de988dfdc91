use crate::common::*;

/// Sinusoidal embedding of scalar positions, e.g. diffusion timesteps.
///
/// Produces `[sin(t * f_0), ..., sin(t * f_{h-1}), cos(t * f_0), ..., cos(t * f_{h-1})]`
/// with `h = dim / 2` and geometrically spaced frequencies from 1 down to 1/10000.
#[derive(Debug, Clone)]
pub struct SinusoidalEmbedding {
    dim: i64,
}

impl SinusoidalEmbedding {
    pub fn new(dim: i64) -> Result<Self> {
        ensure!(
            dim >= 4 && dim % 2 == 0,
            "embedding dimension must be an even number >= 4, but get {}",
            dim
        );
        Ok(Self { dim })
    }

    pub fn dim(&self) -> i64 {
        self.dim
    }
}

impl nn::Module for SinusoidalEmbedding {
    fn forward(&self, time: &Tensor) -> Tensor {
        let half_dim = self.dim / 2;
        let scale = 10000f64.ln() / (half_dim - 1) as f64;
        let freqs = (Tensor::arange(half_dim, (Kind::Float, time.device())) * -scale).exp();
        let args = time.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
        Tensor::cat(&[args.sin(), args.cos()], -1)
    }
}
