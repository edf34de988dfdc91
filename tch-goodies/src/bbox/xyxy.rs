use super::CxCyWHTensor;
use crate::common::*;
use bbox::{Rect as _, XYXY};

/// Checked tensor of boxes in `(x1, y1, x2, y2)` form with shape `[..., 4]`.
#[derive(Debug, Getters)]
pub struct XYXYTensor {
    #[get = "pub"]
    pub(crate) tensor: Tensor,
}

/// Unchecked tensor of boxes in `(x1, y1, x2, y2)` form.
#[derive(Debug)]
pub struct XYXYTensorUnchecked {
    pub tensor: Tensor,
}

impl XYXYTensor {
    pub fn from_packed(tensor: Tensor) -> Result<Self> {
        XYXYTensorUnchecked { tensor }.try_into()
    }

    pub fn into_packed(self) -> Tensor {
        self.tensor
    }

    /// Number of boxes across all leading dimensions.
    pub fn num_samples(&self) -> i64 {
        self.tensor.numel() as i64 / 4
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            tensor: self.tensor.shallow_clone(),
        }
    }

    pub fn x1(&self) -> Tensor {
        self.tensor.select(-1, 0)
    }

    pub fn y1(&self) -> Tensor {
        self.tensor.select(-1, 1)
    }

    pub fn x2(&self) -> Tensor {
        self.tensor.select(-1, 2)
    }

    pub fn y2(&self) -> Tensor {
        self.tensor.select(-1, 3)
    }

    pub fn w(&self) -> Tensor {
        self.x2() - self.x1()
    }

    pub fn h(&self) -> Tensor {
        self.y2() - self.y1()
    }

    pub fn area(&self) -> Tensor {
        self.w() * self.h()
    }

    /// Multiply by per-coordinate factors broadcastable to `[..., 4]`, e.g. `whwh`.
    pub fn scale(&self, factors: &Tensor) -> Self {
        Self {
            tensor: &self.tensor * factors,
        }
    }

    /// Divide by per-coordinate factors broadcastable to `[..., 4]`.
    pub fn normalize(&self, factors: &Tensor) -> Self {
        Self {
            tensor: &self.tensor / factors,
        }
    }

    pub fn detach(&self) -> Self {
        Self {
            tensor: self.tensor.detach(),
        }
    }

    /// Copy the boxes to the host. Degenerate boxes are collapsed to zero size.
    pub fn to_rects(&self) -> Result<Vec<XYXY<f64>>> {
        let values = Vec::<f64>::try_from(
            &self
                .tensor
                .to_device(Device::Cpu)
                .to_kind(Kind::Double)
                .reshape([-1]),
        )?;
        let rects = values
            .chunks_exact(4)
            .map(|xyxy| {
                let [x1, y1, x2, y2] = [xyxy[0], xyxy[1], xyxy[2], xyxy[3]];
                XYXY::try_from_xyxy([x1, y1, x2.max(x1), y2.max(y1)])
            })
            .try_collect()?;
        Ok(rects)
    }
}

impl TryFrom<XYXYTensorUnchecked> for XYXYTensor {
    type Error = Error;

    fn try_from(from: XYXYTensorUnchecked) -> Result<Self, Self::Error> {
        let XYXYTensorUnchecked { tensor } = from;
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

impl From<XYXYTensor> for XYXYTensorUnchecked {
    fn from(from: XYXYTensor) -> Self {
        let XYXYTensor { tensor } = from;
        Self { tensor }
    }
}

impl From<&CxCyWHTensor> for XYXYTensor {
    fn from(from: &CxCyWHTensor) -> Self {
        let cx = from.cx();
        let cy = from.cy();
        let half_w = from.w() / 2.0;
        let half_h = from.h() / 2.0;
        let tensor = Tensor::stack(
            &[&cx - &half_w, &cy - &half_h, &cx + &half_w, &cy + &half_h],
            -1,
        );
        Self { tensor }
    }
}

impl From<CxCyWHTensor> for XYXYTensor {
    fn from(from: CxCyWHTensor) -> Self {
        (&from).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbox::{Rect, RectNum};

    #[test]
    fn checked_shape() -> Result<()> {
        ensure!(XYXYTensor::from_packed(Tensor::zeros([3, 5], (Kind::Float, Device::Cpu))).is_err());
        ensure!(XYXYTensor::from_packed(Tensor::zeros([3, 4], (Kind::Int64, Device::Cpu))).is_err());
        let boxes = XYXYTensor::from_packed(Tensor::zeros([2, 3, 4], (Kind::Float, Device::Cpu)))?;
        ensure!(boxes.num_samples() == 6);
        Ok(())
    }

    #[test]
    fn host_rects() -> Result<()> {
        let boxes = XYXYTensor::from_packed(
            Tensor::from_slice(&[1f32, 2.0, 3.0, 4.0, 5.0, 5.0, 4.0, 6.0]).view([2, 4]),
        )?;
        let rects = boxes.to_rects()?;
        ensure!(rects.len() == 2);
        ensure!(rects[0].xyxy() == [1.0, 2.0, 3.0, 4.0]);
        ensure!(rects[1].w() == 0.0);
        Ok(())
    }
}
