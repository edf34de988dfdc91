use crate::{common::*, init::xavier_uniform};

/// Multi-head scaled dot-product attention with packed input projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiheadAttentionInit {
    pub embed_dim: i64,
    pub num_heads: i64,
    pub dropout: R64,
}

impl MultiheadAttentionInit {
    pub fn new(embed_dim: i64, num_heads: i64) -> Self {
        Self {
            embed_dim,
            num_heads,
            dropout: r64(0.0),
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<MultiheadAttention> {
        let path = path.borrow();
        let Self {
            embed_dim,
            num_heads,
            dropout,
        } = self;

        ensure!(
            embed_dim > 0 && num_heads > 0,
            "embed_dim and num_heads must be positive"
        );
        ensure!(
            embed_dim % num_heads == 0,
            "embed_dim ({}) must be divisible by num_heads ({})",
            embed_dim,
            num_heads
        );

        let in_proj_weight = path.var(
            "in_proj_weight",
            &[3 * embed_dim, embed_dim],
            xavier_uniform(embed_dim, 3 * embed_dim),
        );
        let in_proj_bias = path.zeros("in_proj_bias", &[3 * embed_dim]);
        let out_proj = nn::linear(
            path / "out_proj",
            embed_dim,
            embed_dim,
            nn::LinearConfig {
                ws_init: xavier_uniform(embed_dim, embed_dim),
                bs_init: Some(nn::Init::Const(0.0)),
                bias: true,
            },
        );

        Ok(MultiheadAttention {
            in_proj_weight,
            in_proj_bias,
            out_proj,
            embed_dim,
            num_heads,
            dropout: dropout.raw(),
        })
    }
}

#[derive(Debug)]
pub struct MultiheadAttention {
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: nn::Linear,
    embed_dim: i64,
    num_heads: i64,
    dropout: f64,
}

impl MultiheadAttention {
    /// Attend over sequences laid out as `[seq_len, batch, embed_dim]`.
    pub fn forward_t(&self, query: &Tensor, key: &Tensor, value: &Tensor, train: bool) -> Result<Tensor> {
        let Self {
            ref in_proj_weight,
            ref in_proj_bias,
            ref out_proj,
            embed_dim,
            num_heads,
            dropout,
        } = *self;

        let (tgt_len, batch_size, query_dim) = query.size3()?;
        let (src_len, key_batch, key_dim) = key.size3()?;
        ensure!(
            query_dim == embed_dim && key_dim == embed_dim,
            "expect embedding size {}, but get query {} and key {}",
            embed_dim,
            query_dim,
            key_dim
        );
        ensure!(
            key_batch == batch_size && value.size() == key.size(),
            "query, key and value shapes do not agree: {:?}, {:?}, {:?}",
            query.size(),
            key.size(),
            value.size()
        );

        let head_dim = embed_dim / num_heads;
        let weights = in_proj_weight.chunk(3, 0);
        let biases = in_proj_bias.chunk(3, 0);
        let project = |xs: &Tensor, index: usize, len: i64| -> Tensor {
            (xs.matmul(&weights[index].transpose(0, 1)) + &biases[index])
                .contiguous()
                .view([len, batch_size * num_heads, head_dim])
                .transpose(0, 1)
        };

        let q = project(query, 0, tgt_len) * (head_dim as f64).powf(-0.5);
        let k = project(key, 1, src_len);
        let v = project(value, 2, src_len);

        let attn = q
            .bmm(&k.transpose(1, 2))
            .softmax(-1, q.kind())
            .dropout(dropout, train);
        let output = attn
            .bmm(&v)
            .transpose(0, 1)
            .contiguous()
            .view([tgt_len, batch_size, embed_dim])
            .apply(out_proj);

        Ok(output)
    }
}
