use crate::{bbox::XYXYTensor, common::*};
use bbox::RectFloat as _;
use std::cmp::Ordering;

/// Class-aware greedy non-maximum suppression.
///
/// Boxes of different labels never suppress each other. A box is dropped when
/// its IoU with a kept, higher-scored box of the same label exceeds
/// `iou_threshold`. Returns the indices of kept boxes ordered by descending score.
pub fn batched_nms(
    bboxes: &XYXYTensor,
    scores: &Tensor,
    labels: &Tensor,
    iou_threshold: f64,
) -> Result<Tensor> {
    tch::no_grad(|| -> Result<_> {
        ensure!(
            bboxes.tensor().dim() == 2,
            "boxes should be a 2d tensor, but get shape {:?}",
            bboxes.tensor().size()
        );
        let n_bboxes = bboxes.num_samples();
        let n_scores = scores
            .size1()
            .map_err(|_| format_err!("scores should be a 1d tensor"))?;
        let n_labels = labels
            .size1()
            .map_err(|_| format_err!("labels should be a 1d tensor"))?;
        ensure!(
            n_bboxes == n_scores && n_bboxes == n_labels,
            "boxes, scores and labels should have same number of elements in dimension 0"
        );
        let device = bboxes.device();

        let rects = bboxes.to_rects()?;
        let scores = Vec::<f64>::try_from(&scores.to_device(Device::Cpu).to_kind(Kind::Double))?;
        let labels = Vec::<i64>::try_from(&labels.to_device(Device::Cpu).to_kind(Kind::Int64))?;

        let order: Vec<usize> = (0..rects.len())
            .sorted_by(|&lhs, &rhs| {
                scores[rhs]
                    .partial_cmp(&scores[lhs])
                    .unwrap_or(Ordering::Equal)
            })
            .collect();

        let mut suppressed = vec![false; rects.len()];
        let mut keep: Vec<i64> = vec![];

        for (nth, &li) in order.iter().enumerate() {
            if suppressed[li] {
                continue;
            }
            keep.push(li as i64);
            let lhs_bbox = &rects[li];

            for &ri in &order[(nth + 1)..] {
                if suppressed[ri] || labels[ri] != labels[li] {
                    continue;
                }
                let iou = lhs_bbox.iou_with(&rects[ri], 0.0);
                if iou > iou_threshold {
                    suppressed[ri] = true;
                }
            }
        }

        debug!("nms keeps {} out of {} boxes", keep.len(), rects.len());

        Ok(Tensor::from_slice(&keep)
            .set_requires_grad(false)
            .to_device(device))
    })
}

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes(values: &[f32]) -> Result<XYXYTensor> {
        XYXYTensor::from_packed(Tensor::from_slice(values).view([-1, 4]))
    }

    #[test]
    fn nms_suppresses_same_class_overlaps() -> Result<()> {
        let bboxes = boxes(&[
            0.0, 0.0, 10.0, 10.0, //
            1.0, 1.0, 11.0, 11.0, //
            50.0, 50.0, 60.0, 60.0, //
        ])?;
        let scores = Tensor::from_slice(&[0.8f32, 0.9, 0.3]);
        let labels = Tensor::from_slice(&[1i64, 1, 1]);
        let keep = batched_nms(&bboxes, &scores, &labels, 0.5)?;
        ensure!(Vec::<i64>::try_from(&keep)? == vec![1, 2]);
        Ok(())
    }

    #[test]
    fn nms_keeps_other_class_overlaps() -> Result<()> {
        let bboxes = boxes(&[
            0.0, 0.0, 10.0, 10.0, //
            0.0, 0.0, 10.0, 10.0, //
        ])?;
        let scores = Tensor::from_slice(&[0.8f32, 0.9]);
        let labels = Tensor::from_slice(&[0i64, 3]);
        let keep = batched_nms(&bboxes, &scores, &labels, 0.5)?;
        ensure!(Vec::<i64>::try_from(&keep)? == vec![1, 0]);
        Ok(())
    }

    #[test]
    fn nms_on_empty_input() -> Result<()> {
        let bboxes = XYXYTensor::from_packed(Tensor::zeros([0, 4], (Kind::Float, Device::Cpu)))?;
        let scores = Tensor::zeros([0], (Kind::Float, Device::Cpu));
        let labels = Tensor::zeros([0], (Kind::Int64, Device::Cpu));
        let keep = batched_nms(&bboxes, &scores, &labels, 0.5)?;
        ensure!(keep.is_empty());
        Ok(())
    }

    #[test]
    fn nms_rejects_mismatched_lengths() {
        let bboxes = boxes(&[0.0, 0.0, 1.0, 1.0]).unwrap();
        let scores = Tensor::from_slice(&[0.5f32, 0.2]);
        let labels = Tensor::from_slice(&[0i64]);
        assert!(batched_nms(&bboxes, &scores, &labels, 0.5).is_err());
    }

    #[test]
    fn sum_of_tensors() -> Result<()> {
        let sum = Tensor::f_sum_tensors([
            Tensor::from(1.0f64),
            Tensor::from(2.5f64),
            Tensor::from(0.5f64),
        ])?;
        ensure!((sum.double_value(&[]) - 4.0).abs() < 1e-9);
        ensure!(Tensor::f_sum_tensors(Vec::<Tensor>::new()).is_err());
        Ok(())
    }
}
