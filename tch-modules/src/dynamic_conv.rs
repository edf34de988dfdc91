use crate::{common::*, init::xavier_linear};

/// Instance interaction through convolution weights generated per proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConvInit {
    pub hidden_dim: i64,
    pub dim_dynamic: i64,
    pub num_dynamic: i64,
    /// Number of pooled positions per proposal, i.e. `out_h * out_w`.
    pub num_positions: i64,
}

impl DynamicConvInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<DynamicConv> {
        let path = path.borrow();
        let Self {
            hidden_dim,
            dim_dynamic,
            num_dynamic,
            num_positions,
        } = self;

        ensure!(
            hidden_dim > 0 && dim_dynamic > 0 && num_positions > 0,
            "hidden_dim, dim_dynamic and num_positions must be positive"
        );
        ensure!(
            num_dynamic == 2,
            "only two generated layers are supported, but get num_dynamic = {}",
            num_dynamic
        );

        let num_params = hidden_dim * dim_dynamic;
        let dynamic_layer = xavier_linear(
            path / "dynamic_layer",
            hidden_dim,
            num_dynamic * num_params,
            true,
        );
        let norm1 = nn::layer_norm(path / "norm1", vec![dim_dynamic], Default::default());
        let norm2 = nn::layer_norm(path / "norm2", vec![hidden_dim], Default::default());
        let out_layer = xavier_linear(
            path / "out_layer",
            hidden_dim * num_positions,
            hidden_dim,
            true,
        );
        let norm3 = nn::layer_norm(path / "norm3", vec![hidden_dim], Default::default());

        Ok(DynamicConv {
            dynamic_layer,
            norm1,
            norm2,
            out_layer,
            norm3,
            hidden_dim,
            dim_dynamic,
            num_positions,
        })
    }
}

#[derive(Debug)]
pub struct DynamicConv {
    dynamic_layer: nn::Linear,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    out_layer: nn::Linear,
    norm3: nn::LayerNorm,
    hidden_dim: i64,
    dim_dynamic: i64,
    num_positions: i64,
}

impl DynamicConv {
    /// Interact `[1, N, D]` proposal embeddings with `[N, D, K]` pooled features.
    ///
    /// Returns the updated `[N, D]` embeddings.
    pub fn forward(&self, embeddings: &Tensor, features: &Tensor) -> Result<Tensor> {
        let Self {
            ref dynamic_layer,
            ref norm1,
            ref norm2,
            ref out_layer,
            ref norm3,
            hidden_dim,
            dim_dynamic,
            num_positions,
        } = *self;

        let (one, num_instances, emb_dim) = embeddings.size3()?;
        let (feat_instances, feat_dim, positions) = features.size3()?;
        ensure!(
            one == 1 && emb_dim == hidden_dim,
            "expect embeddings in shape [1, N, {}], but get {:?}",
            hidden_dim,
            embeddings.size()
        );
        ensure!(
            feat_instances == num_instances && feat_dim == hidden_dim && positions == num_positions,
            "expect features in shape [{}, {}, {}], but get {:?}",
            num_instances,
            hidden_dim,
            num_positions,
            features.size()
        );

        let num_params = hidden_dim * dim_dynamic;
        let features = features.permute([0, 2, 1]);
        let parameters = embeddings.apply(dynamic_layer).permute([1, 0, 2]);
        let param1 = parameters
            .narrow(2, 0, num_params)
            .reshape([-1, hidden_dim, dim_dynamic]);
        let param2 = parameters
            .narrow(2, num_params, num_params)
            .reshape([-1, dim_dynamic, hidden_dim]);

        let output = features
            .bmm(&param1)
            .apply(norm1)
            .relu()
            .bmm(&param2)
            .apply(norm2)
            .relu()
            .flatten(1, -1)
            .apply(out_layer)
            .apply(norm3)
            .relu();

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(vs: &nn::VarStore) -> Result<DynamicConv> {
        DynamicConvInit {
            hidden_dim: 16,
            dim_dynamic: 4,
            num_dynamic: 2,
            num_positions: 9,
        }
        .build(&vs.root() / "inst_interact")
    }

    #[test]
    fn dynamic_conv_shape_and_determinism() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = build(&vs)?;
        let embeddings = Tensor::randn([1, 5, 16], (Kind::Float, Device::Cpu));
        let features = Tensor::randn([5, 16, 9], (Kind::Float, Device::Cpu));

        let lhs = conv.forward(&embeddings, &features)?;
        let rhs = conv.forward(&embeddings, &features)?;
        ensure!(lhs.size() == vec![5, 16]);
        ensure!(lhs.equal(&rhs));
        ensure!(lhs.min().double_value(&[]) >= 0.0);
        Ok(())
    }

    #[test]
    fn proposals_do_not_interact() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = build(&vs)?;
        let embeddings = Tensor::randn([1, 3, 16], (Kind::Float, Device::Cpu));
        let features = Tensor::randn([3, 16, 9], (Kind::Float, Device::Cpu));

        let full = conv.forward(&embeddings, &features)?;
        let single = conv.forward(&embeddings.narrow(1, 1, 1), &features.narrow(0, 1, 1))?;
        ensure!(full.narrow(0, 1, 1).allclose(&single, 1e-5, 1e-6, false));
        Ok(())
    }

    #[test]
    fn dynamic_conv_validation() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = build(&vs)?;
        let embeddings = Tensor::randn([1, 5, 16], (Kind::Float, Device::Cpu));
        let features = Tensor::randn([4, 16, 9], (Kind::Float, Device::Cpu));
        ensure!(conv.forward(&embeddings, &features).is_err());

        let result = DynamicConvInit {
            hidden_dim: 16,
            dim_dynamic: 4,
            num_dynamic: 3,
            num_positions: 9,
        }
        .build(&vs.root() / "bad");
        ensure!(result.is_err());
        Ok(())
    }
}
