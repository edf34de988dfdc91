use crate::{common::*, roi_align::roi_align};

const LEVEL_TOLERANCE: f64 = 1e-5;

/// Multi-level region pooler over a feature pyramid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiPoolerInit {
    /// Output tile size in `(height, width)`.
    pub output_size: (i64, i64),
    /// Spatial scale of each level, i.e. the reciprocal of its stride, finest first.
    pub scales: Vec<R64>,
    pub sampling_ratio: i64,
    pub aligned: bool,
    pub canonical_box_size: R64,
    pub canonical_level: i64,
}

impl RoiPoolerInit {
    pub fn new(output_size: i64, scales: Vec<R64>) -> Self {
        Self {
            output_size: (output_size, output_size),
            scales,
            sampling_ratio: 2,
            aligned: true,
            canonical_box_size: r64(224.0),
            canonical_level: 4,
        }
    }

    pub fn build(self) -> Result<RoiPooler> {
        let Self {
            output_size,
            scales,
            sampling_ratio,
            aligned,
            canonical_box_size,
            canonical_level,
        } = self;

        ensure!(
            output_size.0 > 0 && output_size.1 > 0,
            "output size must be positive, but get {:?}",
            output_size
        );
        ensure!(
            sampling_ratio > 0,
            "sampling_ratio must be positive, but get {}",
            sampling_ratio
        );
        ensure!(
            canonical_box_size > 0.0,
            "canonical_box_size must be positive, but get {}",
            canonical_box_size
        );
        ensure!(!scales.is_empty(), "at least one pyramid level is required");

        let levels: Vec<i64> = scales
            .iter()
            .map(|&scale| -> Result<_> {
                ensure!(scale > 0.0, "level scale must be positive, but get {}", scale);
                let level = -scale.raw().log2();
                ensure!(
                    (level - level.round()).abs() < LEVEL_TOLERANCE,
                    "level scale {} is not a power of two",
                    scale
                );
                Ok(level.round() as i64)
            })
            .try_collect()?;

        let min_level = levels[0];
        let max_level = levels[levels.len() - 1];
        ensure!(
            0 <= min_level && min_level <= max_level,
            "pyramid levels must satisfy 0 <= min_level <= max_level, but get {} and {}",
            min_level,
            max_level
        );
        ensure!(
            levels
                .iter()
                .enumerate()
                .all(|(index, &level)| level == min_level + index as i64),
            "pyramid levels must be contiguous, but get {:?}",
            levels
        );

        Ok(RoiPooler {
            output_size,
            scales: scales.into_iter().map(|scale| scale.raw()).collect(),
            sampling_ratio,
            aligned,
            min_level,
            max_level,
            canonical_box_size: canonical_box_size.raw(),
            canonical_level,
        })
    }
}

#[derive(Debug, CopyGetters)]
pub struct RoiPooler {
    #[get_copy = "pub"]
    output_size: (i64, i64),
    scales: Vec<f64>,
    sampling_ratio: i64,
    aligned: bool,
    #[get_copy = "pub"]
    min_level: i64,
    #[get_copy = "pub"]
    max_level: i64,
    canonical_box_size: f64,
    canonical_level: i64,
}

impl RoiPooler {
    pub fn num_levels(&self) -> usize {
        self.scales.len()
    }

    /// Map each `[K, 4]` corner-form box to a zero-based index into the pyramid.
    pub fn assign_boxes_to_levels(&self, boxes: &Tensor) -> Tensor {
        let Self {
            min_level,
            max_level,
            canonical_box_size,
            canonical_level,
            ..
        } = *self;

        let box_sizes = ((boxes.select(1, 2) - boxes.select(1, 0))
            * (boxes.select(1, 3) - boxes.select(1, 1)))
        .sqrt();
        let levels = (box_sizes / canonical_box_size + 1e-8).log2() + canonical_level as f64;
        levels
            .floor()
            .clamp(min_level as f64, max_level as f64)
            .to_kind(Kind::Int64)
            - min_level
    }

    /// Pool `[batch, num_boxes, 4]` pixel boxes against `features`, finest level first.
    ///
    /// The output is `[batch * num_boxes, channels, out_h, out_w]` in box order.
    pub fn forward(&self, features: &[impl Borrow<Tensor>], boxes: &XYXYTensor) -> Result<Tensor> {
        let Self {
            output_size,
            ref scales,
            sampling_ratio,
            aligned,
            ..
        } = *self;

        ensure!(
            features.len() == scales.len(),
            "expect {} feature levels, but get {}",
            scales.len(),
            features.len()
        );
        let (batch_size, num_boxes, _) = boxes.tensor().size3().with_context(|| {
            format!(
                "expect boxes in shape [batch, num_boxes, 4], but get {:?}",
                boxes.tensor().size()
            )
        })?;

        let shapes: Vec<_> = features
            .iter()
            .map(|feature| {
                let feature = feature.borrow();
                feature.size4().with_context(|| {
                    format!(
                        "expect feature map in shape [batch, channels, height, width], but get {:?}",
                        feature.size()
                    )
                })
            })
            .try_collect()?;
        ensure!(
            shapes.iter().all(|&(b, _, _, _)| b == batch_size),
            "batch size of boxes ({}) does not match that of feature maps {:?}",
            batch_size,
            shapes
        );
        let channels = shapes[0].1;
        ensure!(
            shapes.iter().all(|&(_, c, _, _)| c == channels),
            "all feature levels must have the same number of channels, but get {:?}",
            shapes
        );

        let first = features[0].borrow();
        let device = first.device();
        let flat_boxes = boxes.tensor().reshape([-1, 4]).to_kind(first.kind());
        let batch_indices = Tensor::arange(batch_size, (Kind::Int64, device))
            .view([batch_size, 1])
            .expand([batch_size, num_boxes], false)
            .reshape([-1]);

        if scales.len() == 1 {
            return roi_align(
                first,
                &flat_boxes,
                &batch_indices,
                output_size,
                scales[0],
                sampling_ratio,
                aligned,
            );
        }

        let levels = tch::no_grad(|| self.assign_boxes_to_levels(&flat_boxes));
        let (out_h, out_w) = output_size;
        let output = Tensor::zeros(
            [batch_size * num_boxes, channels, out_h, out_w],
            (first.kind(), device),
        );

        let output = izip!(features, scales).enumerate().try_fold(
            output,
            |output, (level, (feature, &scale))| -> Result<_> {
                let indices = levels.eq(level as i64).nonzero().squeeze_dim(1);
                if indices.is_empty() {
                    return Ok(output);
                }
                let pooled = roi_align(
                    feature.borrow(),
                    &flat_boxes.index_select(0, &indices),
                    &batch_indices.index_select(0, &indices),
                    output_size,
                    scale,
                    sampling_ratio,
                    aligned,
                )?;
                Ok(output.index_copy(0, &indices, &pooled))
            },
        )?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scales(strides: &[f64]) -> Vec<R64> {
        strides.iter().map(|&stride| r64(1.0 / stride)).collect()
    }

    /// Two-channel map: the image x coordinate and a constant level tag.
    fn tagged_map(batch: i64, stride: i64, size: i64, tag: f64) -> Tensor {
        let xs = (Tensor::arange(size, (Kind::Double, Device::Cpu)) + 0.5) * stride as f64;
        let xs = xs.view([1, 1, 1, size]).expand([batch, 1, size, size], false);
        let tags = Tensor::full([batch, 1, size, size], tag, (Kind::Double, Device::Cpu));
        Tensor::cat(&[xs, tags], 1)
    }

    fn square(cx: f64, cy: f64, side: f64) -> [f64; 4] {
        let half = side / 2.0;
        [cx - half, cy - half, cx + half, cy + half]
    }

    #[test]
    fn invalid_levels_are_rejected() {
        assert!(RoiPoolerInit::new(7, scales(&[4.0, 16.0])).build().is_err());
        assert!(RoiPoolerInit::new(7, scales(&[4.0, 6.0])).build().is_err());
        assert!(RoiPoolerInit::new(7, scales(&[16.0, 8.0])).build().is_err());
        assert!(RoiPoolerInit::new(7, scales(&[0.5])).build().is_err());
        assert!(RoiPoolerInit::new(7, vec![]).build().is_err());
        assert!(RoiPoolerInit::new(0, scales(&[4.0])).build().is_err());
        assert!(RoiPoolerInit {
            canonical_box_size: r64(0.0),
            ..RoiPoolerInit::new(7, scales(&[4.0]))
        }
        .build()
        .is_err());
    }

    #[test]
    fn level_assignment_is_monotonic() -> Result<()> {
        let pooler = RoiPoolerInit::new(7, scales(&[4.0, 8.0, 16.0, 32.0])).build()?;
        ensure!(pooler.min_level() == 2 && pooler.max_level() == 5);

        let sides = [1.0, 8.0, 32.0, 64.0, 112.0, 224.0, 448.0, 900.0, 4000.0];
        let boxes: Vec<f64> = sides.iter().flat_map(|&side| square(0.0, 0.0, side)).collect();
        let boxes = Tensor::from_slice(&boxes).view([-1, 4]);
        let levels = Vec::<i64>::try_from(&pooler.assign_boxes_to_levels(&boxes))?;

        ensure!(levels.iter().all(|&level| (0..4).contains(&level)));
        ensure!(levels.windows(2).all(|pair| pair[0] <= pair[1]));
        ensure!(levels[0] == 0 && levels[levels.len() - 1] == 3);
        // a canonical box lands on the canonical level
        ensure!(levels[5] == 4 - 2);
        Ok(())
    }

    #[test]
    fn single_level_keeps_box_order() -> Result<()> {
        let pooler = RoiPoolerInit::new(2, scales(&[4.0])).build()?;
        let features = [tagged_map(2, 4, 64, 0.0)];
        let centers = [40.0, 120.0, 200.0, 80.0, 160.0, 20.0];
        let boxes: Vec<f64> = centers.iter().flat_map(|&cx| square(cx, 100.0, 16.0)).collect();
        let boxes = XYXYTensor::from_packed(Tensor::from_slice(&boxes).view([2, 3, 4]))?;

        let output = pooler.forward(&features, &boxes)?;
        ensure!(output.size() == vec![6, 2, 2, 2]);
        let pooled_cx = output.select(1, 0).mean_dim(&[1i64, 2][..], false, Kind::Double);
        let expect = Tensor::from_slice(&centers);
        ensure!(pooled_cx.allclose(&expect, 1e-6, 1e-6, false));
        Ok(())
    }

    #[test]
    fn multi_level_keeps_box_order() -> Result<()> {
        let pooler = RoiPoolerInit::new(2, scales(&[4.0, 8.0, 16.0])).build()?;
        let features = [
            tagged_map(1, 4, 128, 0.0),
            tagged_map(1, 8, 64, 1.0),
            tagged_map(1, 16, 32, 2.0),
        ];
        // alternate small and large boxes so levels interleave
        let boxes = [(120.0, 8.0), (200.0, 400.0), (260.0, 16.0), (240.0, 200.0), (60.0, 8.0)];
        let flat: Vec<f64> = boxes.iter().flat_map(|&(cx, side)| square(cx, 256.0, side)).collect();
        let xyxy = XYXYTensor::from_packed(Tensor::from_slice(&flat).view([1, -1, 4]))?;

        let output = pooler.forward(&features, &xyxy)?;
        ensure!(output.size() == vec![5, 2, 2, 2]);

        let levels = Vec::<i64>::try_from(
            &pooler.assign_boxes_to_levels(&xyxy.tensor().view([-1, 4])),
        )?;
        ensure!(levels.iter().unique().count() >= 2);

        let pooled = output.mean_dim(&[2i64, 3][..], false, Kind::Double);
        for (index, &(cx, _)) in boxes.iter().enumerate() {
            let index = index as i64;
            ensure!((pooled.double_value(&[index, 0]) - cx).abs() < 1e-6);
            ensure!((pooled.double_value(&[index, 1]) - levels[index as usize] as f64).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn empty_level_is_skipped() -> Result<()> {
        let pooler = RoiPoolerInit::new(2, scales(&[4.0, 8.0, 16.0])).build()?;
        let features = [
            tagged_map(2, 4, 128, 0.0),
            tagged_map(2, 8, 64, 1.0),
            tagged_map(2, 16, 32, 2.0),
        ];
        // only the finest and the coarsest levels receive boxes
        let boxes = [(120.0, 8.0), (200.0, 400.0), (60.0, 8.0), (280.0, 400.0)];
        let flat: Vec<f64> = boxes.iter().flat_map(|&(cx, side)| square(cx, 256.0, side)).collect();
        let xyxy = XYXYTensor::from_packed(Tensor::from_slice(&flat).view([2, 2, 4]))?;

        let levels = Vec::<i64>::try_from(
            &pooler.assign_boxes_to_levels(&xyxy.tensor().view([-1, 4])),
        )?;
        ensure!(levels == vec![0, 2, 0, 2]);

        let output = pooler.forward(&features, &xyxy)?;
        ensure!(output.size() == vec![4, 2, 2, 2]);
        let pooled = output.mean_dim(&[2i64, 3][..], false, Kind::Double);
        for (index, &(cx, _)) in boxes.iter().enumerate() {
            let index = index as i64;
            ensure!((pooled.double_value(&[index, 0]) - cx).abs() < 1e-6);
            ensure!((pooled.double_value(&[index, 1]) - levels[index as usize] as f64).abs() < 1e-9);
        }
        Ok(())
    }

    #[test]
    fn contract_violations() -> Result<()> {
        let pooler = RoiPoolerInit::new(2, scales(&[4.0, 8.0])).build()?;
        let boxes = XYXYTensor::from_packed(Tensor::zeros([1, 3, 4], (Kind::Double, Device::Cpu)))?;

        let one_level = [tagged_map(1, 4, 8, 0.0)];
        ensure!(pooler.forward(&one_level, &boxes).is_err());

        let wrong_batch = [tagged_map(2, 4, 8, 0.0), tagged_map(2, 8, 4, 1.0)];
        ensure!(pooler.forward(&wrong_batch, &boxes).is_err());

        let flat_boxes = XYXYTensor::from_packed(Tensor::zeros([3, 4], (Kind::Double, Device::Cpu)))?;
        let maps = [tagged_map(1, 4, 8, 0.0), tagged_map(1, 8, 4, 1.0)];
        ensure!(pooler.forward(&maps, &flat_boxes).is_err());
        Ok(())
    }
}
