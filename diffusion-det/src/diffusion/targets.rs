use super::DiffusionProcess;
use crate::common::*;
use tch_goodies::sample_indices;

const PLACEHOLDER_STD: f64 = 1.0 / 6.0;
const PLACEHOLDER_MEAN: f64 = 0.5;
const MIN_PLACEHOLDER_SIZE: f64 = 1e-4;

/// Ground truth of one training image.
#[derive(Debug)]
pub struct TargetInstances {
    /// Normalized center-form boxes in shape `[M, 4]`.
    pub boxes: CxCyWHTensor,
    /// Class indices in shape `[M]`.
    pub labels: Tensor,
    pub image_size: HW<i64>,
}

/// Proposals of one image corrupted by the forward process.
#[derive(Debug)]
pub struct DiffusedProposals {
    /// Normalized corner-form boxes in shape `[num_proposals, 4]`.
    pub boxes: XYXYTensor,
    /// The injected noise in shape `[num_proposals, 4]`.
    pub noise: Tensor,
    pub timestep: i64,
}

/// Ground truth record consumed by the criterion.
#[derive(Debug)]
pub struct PreparedTarget {
    pub labels: Tensor,
    /// Normalized center-form boxes `[M, 4]`.
    pub boxes: CxCyWHTensor,
    /// Pixel corner-form boxes `[M, 4]`.
    pub boxes_xyxy: XYXYTensor,
    /// `[w, h, w, h]` of the image.
    pub image_size_xyxy: Tensor,
    /// `image_size_xyxy` repeated per box, `[M, 4]`.
    pub image_size_xyxy_tgt: Tensor,
    /// Pixel areas `[M]`.
    pub area: Tensor,
}

/// Batched training inputs of the head and the matching targets.
#[derive(Debug)]
pub struct PreparedTargets {
    pub targets: Vec<PreparedTarget>,
    /// Normalized corner-form boxes `[B, num_proposals, 4]`.
    pub diffused_boxes: Tensor,
    pub noises: Tensor,
    /// Timesteps `[B]`.
    pub timesteps: Tensor,
}

impl DiffusionProcess {
    /// Pad or subsample `[M, 4]` normalized center-form boxes to exactly `num_proposals`.
    ///
    /// An empty set is replaced by a whole-image box. Padding boxes are drawn from
    /// `N(0.5, (1/6)^2)` with sizes floored at `1e-4`. Subsampling keeps the input order.
    pub fn pad_ground_truth<R>(&self, gt_boxes: &Tensor, rng: &mut R) -> Result<Tensor>
    where
        R: Rng + ?Sized,
    {
        let num_proposals = self.num_proposals;
        ensure!(
            gt_boxes.dim() == 2 && gt_boxes.size()[1] == 4,
            "expect ground truth boxes in shape [M, 4], but get {:?}",
            gt_boxes.size()
        );
        let device = gt_boxes.device();

        let gt_boxes = if gt_boxes.size()[0] == 0 {
            debug!("no ground truth boxes, use a whole-image placeholder");
            Tensor::from_slice(&[0.5f32, 0.5, 1.0, 1.0])
                .view([1, 4])
                .to_device(device)
        } else {
            gt_boxes.to_kind(Kind::Float)
        };
        let num_gt = gt_boxes.size()[0];

        let padded = match num_gt.cmp(&num_proposals) {
            std::cmp::Ordering::Less => {
                let placeholder = randn_tensor(rng, &[num_proposals - num_gt, 4], device)
                    * PLACEHOLDER_STD
                    + PLACEHOLDER_MEAN;
                let placeholder = Tensor::cat(
                    &[
                        placeholder.narrow(1, 0, 2),
                        placeholder.narrow(1, 2, 2).clamp_min(MIN_PLACEHOLDER_SIZE),
                    ],
                    1,
                );
                Tensor::cat(&[gt_boxes, placeholder], 0)
            }
            std::cmp::Ordering::Greater => {
                warn!(
                    "{} ground truth boxes exceed {} proposals, subsampling",
                    num_gt, num_proposals
                );
                let mut indices =
                    sample_indices(rng, num_gt as usize, num_proposals as usize)?;
                indices.sort_unstable();
                gt_boxes.index_select(0, &Tensor::from_slice(&indices).to_device(device))
            }
            std::cmp::Ordering::Equal => gt_boxes,
        };

        Ok(padded)
    }

    /// Corrupt the ground truth of one image at a random timestep.
    pub fn prepare_diffusion_concat<R>(
        &self,
        gt_boxes: &CxCyWHTensor,
        rng: &mut R,
    ) -> Result<DiffusedProposals>
    where
        R: Rng + ?Sized,
    {
        let Self {
            ref schedule,
            num_proposals,
            scale,
            ..
        } = *self;
        let device = gt_boxes.tensor().device();

        let timestep = rng.gen_range(0..schedule.num_timesteps());
        let noise = randn_tensor(rng, &[num_proposals, 4], device);
        let x_start = self.pad_ground_truth(gt_boxes.tensor(), rng)?;
        let x_start = (x_start * 2.0 - 1.0) * scale;

        let timesteps = Tensor::from_slice(&[timestep]).to_device(device);
        let x = schedule
            .q_sample(&x_start.unsqueeze(0), &timesteps, &noise.unsqueeze(0))?
            .squeeze_dim(0)
            .clamp(-scale, scale);
        let x = (x / scale + 1.0) / 2.0;
        let boxes = XYXYTensor::from(CxCyWHTensor::from_packed(x)?);

        Ok(DiffusedProposals {
            boxes,
            noise,
            timestep,
        })
    }

    /// Diffuse the ground truth of every image and build the criterion targets.
    pub fn prepare_targets<R>(
        &self,
        targets: &[TargetInstances],
        rng: &mut R,
    ) -> Result<PreparedTargets>
    where
        R: Rng + ?Sized,
    {
        ensure!(!targets.is_empty(), "at least one target is required");

        let mut prepared = vec![];
        let mut diffused_boxes = vec![];
        let mut noises = vec![];
        let mut timesteps = vec![];

        for target in targets {
            let TargetInstances {
                ref boxes,
                ref labels,
                image_size,
            } = *target;
            let device = boxes.tensor().device();
            let num_boxes = boxes.num_samples();
            ensure!(
                labels.size() == vec![num_boxes],
                "expect {} labels, but get shape {:?}",
                num_boxes,
                labels.size()
            );

            let DiffusedProposals {
                boxes: diffused,
                noise,
                timestep,
            } = self.prepare_diffusion_concat(boxes, rng)?;
            diffused_boxes.push(diffused.into_packed());
            noises.push(noise);
            timesteps.push(timestep);

            let image_size_xyxy =
                Tensor::from_slice(&image_size.cast::<f32>().whwh()).to_device(device);
            let boxes_xyxy = XYXYTensor::from(boxes).scale(&image_size_xyxy);
            let area = boxes_xyxy.area();

            prepared.push(PreparedTarget {
                labels: labels.to_kind(Kind::Int64),
                boxes: boxes.shallow_clone(),
                boxes_xyxy,
                image_size_xyxy_tgt: image_size_xyxy.unsqueeze(0).repeat([num_boxes, 1]),
                image_size_xyxy,
                area,
            });
        }

        let device = diffused_boxes[0].device();
        Ok(PreparedTargets {
            targets: prepared,
            diffused_boxes: Tensor::stack(&diffused_boxes, 0),
            noises: Tensor::stack(&noises, 0),
            timesteps: Tensor::from_slice(&timesteps).to_device(device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::DiffusionProcessInit;
    use rand::{rngs::StdRng, SeedableRng};

    fn process(num_proposals: i64) -> DiffusionProcess {
        DiffusionProcessInit {
            num_timesteps: 1000,
            num_proposals,
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    fn gt_boxes() -> Tensor {
        Tensor::from_slice(&[0.3f32, 0.4, 0.2, 0.1, 0.7, 0.6, 0.4, 0.5]).view([2, 4])
    }

    #[test]
    fn pad_to_num_proposals() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let padded = process(5).pad_ground_truth(&gt_boxes(), &mut rng)?;

        ensure!(padded.size() == vec![5, 4]);
        ensure!(padded.narrow(0, 0, 2).allclose(&gt_boxes(), 1e-6, 1e-6, false));
        let min_size = padded.narrow(1, 2, 2).min().double_value(&[]);
        ensure!(min_size >= MIN_PLACEHOLDER_SIZE - 1e-9);
        Ok(())
    }

    #[test]
    fn empty_ground_truth_uses_whole_image() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(2);
        let empty = Tensor::zeros([0, 4], (Kind::Float, Device::Cpu));
        let padded = process(3).pad_ground_truth(&empty, &mut rng)?;

        ensure!(padded.size() == vec![3, 4]);
        let first = Vec::<f32>::try_from(&padded.select(0, 0))?;
        ensure!(first == vec![0.5, 0.5, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn subsample_keeps_order() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let boxes = Tensor::arange(40, (Kind::Float, Device::Cpu)).view([10, 4]) / 40.0;
        let picked = process(4).pad_ground_truth(&boxes, &mut rng)?;

        ensure!(picked.size() == vec![4, 4]);
        let first_column = Vec::<f32>::try_from(&picked.select(1, 0))?;
        ensure!(first_column.windows(2).all(|pair| pair[0] < pair[1]));
        Ok(())
    }

    #[test]
    fn diffused_boxes_stay_in_unit_range() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(4);
        let process = process(6);
        let gt = CxCyWHTensor::from_packed(gt_boxes())?;
        let DiffusedProposals {
            boxes,
            noise,
            timestep,
        } = process.prepare_diffusion_concat(&gt, &mut rng)?;

        ensure!(boxes.tensor().size() == vec![6, 4]);
        ensure!(noise.size() == vec![6, 4]);
        ensure!((0..1000).contains(&timestep));

        // corner form of centers and sizes within [0, 1]
        let cxcywh = CxCyWHTensor::from(&boxes);
        ensure!(cxcywh.cx().min().double_value(&[]) >= -1e-6);
        ensure!(cxcywh.cx().max().double_value(&[]) <= 1.0 + 1e-6);
        ensure!(cxcywh.w().min().double_value(&[]) >= -1e-6);
        Ok(())
    }

    #[test]
    fn prepared_targets_are_batched() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let process = process(4);
        let targets = vec![
            TargetInstances {
                boxes: CxCyWHTensor::from_packed(gt_boxes())?,
                labels: Tensor::from_slice(&[1i64, 2]),
                image_size: HW::from_hw([100, 200]),
            },
            TargetInstances {
                boxes: CxCyWHTensor::from_packed(Tensor::zeros([0, 4], (Kind::Float, Device::Cpu)))?,
                labels: Tensor::zeros([0], (Kind::Int64, Device::Cpu)),
                image_size: HW::from_hw([50, 50]),
            },
        ];

        let prepared = process.prepare_targets(&targets, &mut rng)?;
        ensure!(prepared.diffused_boxes.size() == vec![2, 4, 4]);
        ensure!(prepared.noises.size() == vec![2, 4, 4]);
        ensure!(prepared.timesteps.size() == vec![2]);

        let first = &prepared.targets[0];
        ensure!(Vec::<f32>::try_from(&first.image_size_xyxy)? == vec![200.0, 100.0, 200.0, 100.0]);
        ensure!(first.image_size_xyxy_tgt.size() == vec![2, 4]);
        // 0.2 * 200 by 0.1 * 100
        approx::assert_abs_diff_eq!(first.area.double_value(&[0]), 400.0, epsilon = 1e-3);
        ensure!(prepared.targets[1].area.size() == vec![0]);
        Ok(())
    }

    #[test]
    fn same_seed_reproduces_targets() -> Result<()> {
        let process = process(4);
        // empty, padded and subsampled ground truth
        let targets = || -> Result<Vec<TargetInstances>> {
            let many = Tensor::arange(40, (Kind::Float, Device::Cpu)).view([10, 4]) / 40.0;
            Ok(vec![
                TargetInstances {
                    boxes: CxCyWHTensor::from_packed(Tensor::zeros([0, 4], (Kind::Float, Device::Cpu)))?,
                    labels: Tensor::zeros([0], (Kind::Int64, Device::Cpu)),
                    image_size: HW::from_hw([50, 50]),
                },
                TargetInstances {
                    boxes: CxCyWHTensor::from_packed(gt_boxes())?,
                    labels: Tensor::from_slice(&[1i64, 2]),
                    image_size: HW::from_hw([100, 200]),
                },
                TargetInstances {
                    boxes: CxCyWHTensor::from_packed(many)?,
                    labels: Tensor::arange(10, (Kind::Int64, Device::Cpu)),
                    image_size: HW::from_hw([64, 64]),
                },
            ])
        };

        let lhs = process.prepare_targets(&targets()?, &mut StdRng::seed_from_u64(12))?;
        let rhs = process.prepare_targets(&targets()?, &mut StdRng::seed_from_u64(12))?;
        ensure!(lhs.timesteps.equal(&rhs.timesteps));
        ensure!(lhs.noises.equal(&rhs.noises));
        ensure!(lhs.diffused_boxes.equal(&rhs.diffused_boxes));

        let other = process.prepare_targets(&targets()?, &mut StdRng::seed_from_u64(13))?;
        ensure!(!other.noises.equal(&lhs.noises));
        Ok(())
    }

    #[test]
    fn mismatched_labels_are_rejected() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(6);
        let targets = vec![TargetInstances {
            boxes: CxCyWHTensor::from_packed(gt_boxes())?,
            labels: Tensor::from_slice(&[1i64]),
            image_size: HW::from_hw([10, 10]),
        }];
        ensure!(process(4).prepare_targets(&targets, &mut rng).is_err());
        Ok(())
    }
}
