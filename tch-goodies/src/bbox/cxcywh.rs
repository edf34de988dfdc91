use super::XYXYTensor;
use crate::common::*;

/// Checked tensor of boxes in `(cx, cy, w, h)` form with shape `[..., 4]`.
#[derive(Debug, Getters)]
pub struct CxCyWHTensor {
    #[get = "pub"]
    pub(crate) tensor: Tensor,
}

/// Unchecked tensor of boxes in `(cx, cy, w, h)` form.
#[derive(Debug)]
pub struct CxCyWHTensorUnchecked {
    pub tensor: Tensor,
}

impl CxCyWHTensor {
    pub fn from_packed(tensor: Tensor) -> Result<Self> {
        CxCyWHTensorUnchecked { tensor }.try_into()
    }

    pub fn into_packed(self) -> Tensor {
        self.tensor
    }

    pub fn num_samples(&self) -> i64 {
        self.tensor.numel() as i64 / 4
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            tensor: self.tensor.shallow_clone(),
        }
    }

    pub fn cx(&self) -> Tensor {
        self.tensor.select(-1, 0)
    }

    pub fn cy(&self) -> Tensor {
        self.tensor.select(-1, 1)
    }

    pub fn w(&self) -> Tensor {
        self.tensor.select(-1, 2)
    }

    pub fn h(&self) -> Tensor {
        self.tensor.select(-1, 3)
    }
}

impl TryFrom<CxCyWHTensorUnchecked> for CxCyWHTensor {
    type Error = Error;

    fn try_from(from: CxCyWHTensorUnchecked) -> Result<Self, Self::Error> {
        let CxCyWHTensorUnchecked { tensor } = from;
        let size = tensor.size();
        ensure!(
            size.last() == Some(&4),
            "expect box tensor with last dimension 4, but get shape {:?}",
            size
        );
        ensure!(
            tensor.kind().is_floating_point(),
            "box tensor must have floating point kind, but get {:?}",
            tensor.kind()
        );
        Ok(Self { tensor })
    }
}

impl From<CxCyWHTensor> for CxCyWHTensorUnchecked {
    fn from(from: CxCyWHTensor) -> Self {
        let CxCyWHTensor { tensor } = from;
        Self { tensor }
    }
}

impl From<&XYXYTensor> for CxCyWHTensor {
    fn from(from: &XYXYTensor) -> Self {
        let x1 = from.x1();
        let y1 = from.y1();
        let x2 = from.x2();
        let y2 = from.y2();
        let tensor = Tensor::stack(
            &[
                (&x1 + &x2) / 2.0,
                (&y1 + &y2) / 2.0,
                &x2 - &x1,
                &y2 - &y1,
            ],
            -1,
        );
        Self { tensor }
    }
}

impl From<XYXYTensor> for CxCyWHTensor {
    fn from(from: XYXYTensor) -> Self {
        (&from).into()
    }
}
