use crate::Activation;
use tch::{nn, Tensor};

impl nn::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        use Activation::*;

        match *self {
            Relu => xs.relu(),
            Gelu => xs.gelu("none"),
            Silu => silu(xs),
        }
    }
}

pub fn silu(tensor: &Tensor) -> Tensor {
    tensor * tensor.sigmoid()
}
