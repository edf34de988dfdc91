use crate::{common::*, init::xavier_linear};

/// Bias-free linear layer followed by layer normalization and an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearNormActInit {
    pub in_dim: i64,
    pub out_dim: i64,
    pub activation: Activation,
}

impl LinearNormActInit {
    pub fn new(in_dim: i64, out_dim: i64) -> Self {
        Self {
            in_dim,
            out_dim,
            activation: Activation::Relu,
        }
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> LinearNormAct {
        let path = path.borrow();
        let Self {
            in_dim,
            out_dim,
            activation,
        } = self;

        LinearNormAct {
            linear: xavier_linear(path / "linear", in_dim, out_dim, false),
            norm: nn::layer_norm(path / "norm", vec![out_dim], Default::default()),
            activation,
        }
    }
}

#[derive(Debug)]
pub struct LinearNormAct {
    linear: nn::Linear,
    norm: nn::LayerNorm,
    activation: Activation,
}

impl nn::Module for LinearNormAct {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let Self {
            ref linear,
            ref norm,
            activation,
        } = *self;

        xs.apply(linear).apply(norm).activation(activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_norm_act_shape() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = LinearNormActInit::new(8, 12).build(&vs.root() / "block");
        let xs = Tensor::randn([2, 5, 8], (Kind::Float, Device::Cpu));
        let ys = block.forward(&xs);
        ensure!(ys.size() == vec![2, 5, 12]);
        ensure!(ys.min().double_value(&[]) >= 0.0);
        Ok(())
    }
}
