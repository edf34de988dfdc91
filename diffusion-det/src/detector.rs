//! The assembled detector.

use crate::{
    common::*,
    config::Config,
    diffusion::{
        images_whwh, DiffusionProcess, DiffusionProcessInit, FeatureDenoiser, PreparedTargets,
        TargetInstances,
    },
    inference::{Detections, PostProcessor, PostProcessorInit, ScoreMode},
    loss::{Criterion, DetectionOutputs, LossWeights, WeightedLosses},
    model::{BoxDeltaDecoder, DiffusionDetHeadInit, HeadOutput, HeadSeries, HeadSeriesInit},
};
use tch_modules::RoiPoolerInit;

/// Produces the multi-scale feature maps consumed by the head, finest first.
pub trait Backbone {
    /// Map `[B, 3, H, W]` images to `[B, C, H_l, W_l]` feature maps.
    fn forward_t(&self, images: &Tensor, train: bool) -> Result<Vec<Tensor>>;
}

#[derive(Debug, Clone)]
pub struct DiffusionDetInit {
    pub config: Config,
}

impl DiffusionDetInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<DiffusionDet> {
        let path = path.borrow();
        let Self { config } = self;
        config.validate()?;

        let Config {
            num_classes,
            num_proposals,
            ref head,
            ref pooler,
            ref inference,
            ref loss,
            ..
        } = config;

        let pooler_init = RoiPoolerInit {
            output_size: (pooler.resolution, pooler.resolution),
            scales: pooler.scales(),
            sampling_ratio: pooler.sampling_ratio,
            aligned: true,
            canonical_box_size: pooler.canonical_box_size,
            canonical_level: pooler.canonical_level,
        };
        let score_mode = if config.uses_sigmoid_scores() {
            ScoreMode::Sigmoid
        } else {
            ScoreMode::Softmax
        };

        let head_series = HeadSeriesInit {
            head: DiffusionDetHeadInit {
                hidden_dim: head.hidden_dim,
                dim_feedforward: head.dim_feedforward,
                num_attn_heads: head.num_attn_heads,
                dropout: head.dropout,
                activation: head.activation,
                dim_dynamic: head.dim_dynamic,
                num_dynamic: head.num_dynamic,
                num_cls: head.num_cls,
                num_reg: head.num_reg,
                num_logits: config.num_logits(),
                prior_prob: config.uses_sigmoid_scores().then(|| loss.prior_prob),
                pooler: pooler_init,
                box_decoder: BoxDeltaDecoder::default(),
            },
            num_heads: head.num_heads,
            deep_supervision: head.deep_supervision,
        }
        .build(path / "head")?;

        let process = DiffusionProcessInit::from_config(&config).build()?;
        let post = PostProcessorInit {
            num_classes,
            num_proposals,
            score_mode,
            use_nms: inference.use_nms,
            nms_iou_threshold: inference.nms_iou_threshold,
        }
        .build()?;
        let loss_weights = LossWeights::new(loss, head.num_heads, head.deep_supervision);

        info!(
            "built DiffusionDet with {} head stages, {} proposals, {} sampling steps, {} pyramid levels",
            head.num_heads,
            num_proposals,
            config.diffusion.sampling_steps,
            pooler.levels.len()
        );

        Ok(DiffusionDet {
            head: head_series,
            process,
            post,
            loss_weights,
            num_levels: pooler.levels.len(),
            device: path.device(),
        })
    }
}

#[derive(Debug, Getters)]
pub struct DiffusionDet {
    #[getset(get = "pub")]
    head: HeadSeries,
    #[getset(get = "pub")]
    process: DiffusionProcess,
    #[getset(get = "pub")]
    post: PostProcessor,
    #[getset(get = "pub")]
    loss_weights: LossWeights,
    num_levels: usize,
    device: Device,
}

/// Training predictions and the targets they are matched against.
#[derive(Debug)]
pub struct TrainingOutput {
    pub output: HeadOutput,
    pub targets: PreparedTargets,
}

impl DiffusionDet {
    fn check_features(&self, features: &[Tensor], batch_size: usize) -> Result<()> {
        ensure!(
            features.len() == self.num_levels,
            "expect {} feature levels, but get {}",
            self.num_levels,
            features.len()
        );
        features.iter().try_for_each(|feature| -> Result<_> {
            ensure!(
                feature.dim() == 4 && feature.size()[0] == batch_size as i64,
                "expect feature maps in shape [{}, C, H, W], but get {:?}",
                batch_size,
                feature.size()
            );
            Ok(())
        })
    }

    /// Denoise corrupted ground truth boxes at random timesteps.
    pub fn forward_train<R>(
        &self,
        features: &[Tensor],
        targets: &[TargetInstances],
        rng: &mut R,
    ) -> Result<TrainingOutput>
    where
        R: Rng + ?Sized,
    {
        self.check_features(features, targets.len())?;

        let prepared = self.process.prepare_targets(targets, rng)?;
        let image_sizes: Vec<_> = targets.iter().map(|target| target.image_size).collect();
        let whwh = images_whwh(&image_sizes, self.device)?;
        let boxes = XYXYTensor::from_packed(&prepared.diffused_boxes * whwh.unsqueeze(1))?;

        let output = self
            .head
            .forward_t(features, &boxes, &prepared.timesteps, true)?;

        Ok(TrainingOutput {
            output,
            targets: prepared,
        })
    }

    /// Run a training step through the criterion and weight its terms.
    pub fn forward_loss<C, R>(
        &self,
        features: &[Tensor],
        targets: &[TargetInstances],
        criterion: &C,
        rng: &mut R,
    ) -> Result<WeightedLosses>
    where
        C: Criterion + ?Sized,
        R: Rng + ?Sized,
    {
        let TrainingOutput { output, targets } = self.forward_train(features, targets, rng)?;
        let losses = criterion.forward(&DetectionOutputs::from(&output), &targets.targets)?;
        self.loss_weights.weight_losses(losses)
    }

    /// Sample detections for images of the given sizes.
    pub fn forward_inference<R>(
        &self,
        features: &[Tensor],
        image_sizes: &[HW<i64>],
        rng: &mut R,
    ) -> Result<Vec<Detections>>
    where
        R: Rng + ?Sized,
    {
        self.check_features(features, image_sizes.len())?;

        tch::no_grad(|| -> Result<_> {
            let whwh = images_whwh(image_sizes, self.device)?;
            let denoiser = FeatureDenoiser {
                head: &self.head,
                features,
                train: false,
            };
            let output = self.process.ddim_sample(&denoiser, &whwh, &self.post, rng)?;
            Ok(output.detections)
        })
    }
}

/// A backbone paired with the detector.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct DiffusionDetector<B>
where
    B: Backbone,
{
    #[derivative(Debug = "ignore")]
    pub backbone: B,
    pub model: DiffusionDet,
}

impl<B> DiffusionDetector<B>
where
    B: Backbone,
{
    pub fn forward_train<R>(
        &self,
        images: &Tensor,
        targets: &[TargetInstances],
        rng: &mut R,
    ) -> Result<TrainingOutput>
    where
        R: Rng + ?Sized,
    {
        let features = self.backbone.forward_t(images, true)?;
        self.model.forward_train(&features, targets, rng)
    }

    /// Detect objects in a `[B, 3, H, W]` batch, treating every image as `H x W`.
    pub fn forward_inference<R>(&self, images: &Tensor, rng: &mut R) -> Result<Vec<Detections>>
    where
        R: Rng + ?Sized,
    {
        let (batch_size, _, height, width) = images.size4().map_err(|_| {
            format_err!("expect images in shape [B, 3, H, W], but get {:?}", images.size())
        })?;
        let image_size = HW::try_from_hw([height, width])?;
        let image_sizes = vec![image_size; batch_size as usize];

        let features = self.backbone.forward_t(images, false)?;
        self.model.forward_inference(&features, &image_sizes, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PyramidLevel;
    use rand::{rngs::StdRng, SeedableRng};

    fn tiny_config() -> Config {
        let mut config = Config {
            num_classes: 3,
            num_proposals: 8,
            ..Default::default()
        };
        config.head.hidden_dim = 8;
        config.head.dim_feedforward = 16;
        config.head.num_attn_heads = 2;
        config.head.dim_dynamic = 4;
        config.head.num_heads = 2;
        config.pooler.resolution = 2;
        config.pooler.levels = vec![
            PyramidLevel {
                name: "p2".into(),
                stride: 4,
                channels: 8,
            },
            PyramidLevel {
                name: "p3".into(),
                stride: 8,
                channels: 8,
            },
        ];
        config
    }

    /// Average pooling into two pyramid levels plus a projection to 8 channels.
    #[derive(Debug)]
    struct PoolBackbone {
        weight: Tensor,
    }

    impl Backbone for PoolBackbone {
        fn forward_t(&self, images: &Tensor, _train: bool) -> Result<Vec<Tensor>> {
            let projected = images.permute([0, 2, 3, 1]).matmul(&self.weight).permute([0, 3, 1, 2]);
            Ok(vec![
                projected.avg_pool2d([4, 4], [4, 4], [0, 0], false, true, None::<i64>),
                projected.avg_pool2d([8, 8], [8, 8], [0, 0], false, true, None::<i64>),
            ])
        }
    }

    struct ConstantCriterion;

    impl Criterion for ConstantCriterion {
        fn forward(
            &self,
            outputs: &DetectionOutputs,
            targets: &[crate::diffusion::PreparedTarget],
        ) -> Result<IndexMap<String, Tensor>> {
            ensure!(outputs.aux_outputs.len() == 1);
            ensure!(targets.len() == outputs.pred_logits.size()[0] as usize);
            let mean = outputs.pred_boxes.mean(Kind::Float);
            Ok(["loss_ce", "loss_bbox", "loss_giou", "loss_ce_0", "loss_bbox_0", "loss_giou_0"]
                .into_iter()
                .map(|name| (name.to_string(), mean.shallow_clone()))
                .collect())
        }
    }

    fn targets() -> Result<Vec<TargetInstances>> {
        Ok(vec![
            TargetInstances {
                boxes: CxCyWHTensor::from_packed(
                    Tensor::from_slice(&[0.5f32, 0.5, 0.5, 0.5]).view([1, 4]),
                )?,
                labels: Tensor::from_slice(&[2i64]),
                image_size: HW::from_hw([64, 64]),
            },
            TargetInstances {
                boxes: CxCyWHTensor::from_packed(Tensor::zeros([0, 4], (Kind::Float, Device::Cpu)))?,
                labels: Tensor::zeros([0], (Kind::Int64, Device::Cpu)),
                image_size: HW::from_hw([48, 64]),
            },
        ])
    }

    #[test]
    fn train_and_loss() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DiffusionDetInit {
            config: tiny_config(),
        }
        .build(&vs.root())?;
        let detector = DiffusionDetector {
            backbone: PoolBackbone {
                weight: Tensor::ones([3, 8], (Kind::Float, Device::Cpu)) / 3.0,
            },
            model,
        };

        let mut rng = StdRng::seed_from_u64(11);
        let images = Tensor::rand([2, 3, 64, 64], (Kind::Float, Device::Cpu));
        let TrainingOutput { output, targets } =
            detector.forward_train(&images, &targets()?, &mut rng)?;
        ensure!(output.class_logits.size() == vec![2, 2, 8, 3]);
        ensure!(targets.timesteps.size() == vec![2]);

        let features = detector.backbone.forward_t(&images, true)?;
        let losses = detector
            .model
            .forward_loss(&features, &targets()?, &ConstantCriterion, &mut rng)?;
        ensure!(losses.terms.len() == 6);
        ensure!(losses.total.requires_grad());
        Ok(())
    }

    #[test]
    fn inference_per_image() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DiffusionDetInit {
            config: tiny_config(),
        }
        .build(&vs.root())?;

        let mut rng = StdRng::seed_from_u64(12);
        let features = vec![
            Tensor::randn([2, 8, 16, 16], (Kind::Float, Device::Cpu)),
            Tensor::randn([2, 8, 8, 8], (Kind::Float, Device::Cpu)),
        ];
        let sizes = vec![HW::from_hw([64, 64]), HW::from_hw([48, 64])];
        let detections = model.forward_inference(&features, &sizes, &mut rng)?;

        ensure!(detections.len() == 2);
        ensure!(detections.iter().all(|dets| dets.len() <= 8));
        ensure!(model.forward_inference(&features[..1], &sizes, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = tiny_config();
        config.pooler.levels[0].channels = 16;
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(DiffusionDetInit { config }.build(&vs.root()).is_err());
    }
}
