//! Model configuration format.

use crate::common::*;

/// The main model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of object categories, excluding background.
    pub num_classes: i64,
    /// Number of box proposals per image.
    pub num_proposals: i64,
    pub head: HeadConfig,
    pub pooler: PoolerConfig,
    pub diffusion: DiffusionConfig,
    pub inference: InferenceConfig,
    pub loss: LossConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether classification uses one sigmoid per class instead of a softmax with background.
    pub fn uses_sigmoid_scores(&self) -> bool {
        self.loss.use_focal || self.loss.use_fed_loss
    }

    /// Number of classification logits produced per proposal.
    pub fn num_logits(&self) -> i64 {
        if self.uses_sigmoid_scores() {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    pub fn validate(&self) -> Result<()> {
        let Self {
            num_classes,
            num_proposals,
            ref head,
            ref pooler,
            ref diffusion,
            ref inference,
            ref loss,
        } = *self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(num_proposals > 0, "num_proposals must be positive");

        {
            let HeadConfig {
                hidden_dim,
                dim_feedforward,
                num_attn_heads,
                dropout,
                dim_dynamic,
                num_dynamic,
                num_cls,
                num_reg,
                num_heads,
                ..
            } = *head;

            ensure!(
                hidden_dim > 0 && dim_feedforward > 0 && dim_dynamic > 0,
                "hidden_dim, dim_feedforward and dim_dynamic must be positive"
            );
            ensure!(
                hidden_dim % 2 == 0 && hidden_dim >= 4,
                "hidden_dim must be an even number >= 4, but get {}",
                hidden_dim
            );
            ensure!(
                num_attn_heads > 0 && hidden_dim % num_attn_heads == 0,
                "hidden_dim ({}) must be divisible by num_attn_heads ({})",
                hidden_dim,
                num_attn_heads
            );
            ensure!(
                (0.0..1.0).contains(&dropout.raw()),
                "dropout must be in range [0, 1), but get {}",
                dropout
            );
            ensure!(num_dynamic == 2, "num_dynamic must be 2, but get {}", num_dynamic);
            ensure!(
                num_cls >= 0 && num_reg >= 0,
                "num_cls and num_reg must be non-negative"
            );
            ensure!(num_heads > 0, "num_heads must be positive");
        }

        {
            let PoolerConfig {
                resolution,
                sampling_ratio,
                canonical_box_size,
                ref levels,
                ..
            } = *pooler;

            ensure!(resolution > 0, "pooler resolution must be positive");
            ensure!(sampling_ratio > 0, "sampling_ratio must be positive");
            ensure!(
                canonical_box_size > 0.0,
                "canonical_box_size must be positive"
            );
            ensure!(!levels.is_empty(), "at least one pyramid level is required");
            levels.iter().try_for_each(|level| -> Result<_> {
                ensure!(
                    level.stride > 0,
                    "the stride of level '{}' must be positive",
                    level.name
                );
                ensure!(
                    level.channels == head.hidden_dim,
                    "the channels of level '{}' ({}) must equal hidden_dim ({})",
                    level.name,
                    level.channels,
                    head.hidden_dim
                );
                Ok(())
            })?;
        }

        {
            let DiffusionConfig {
                num_timesteps,
                sampling_steps,
                snr_scale,
                ddim_eta,
                renewal_threshold,
            } = *diffusion;

            ensure!(num_timesteps > 0, "num_timesteps must be positive");
            ensure!(
                sampling_steps > 0 && sampling_steps <= num_timesteps,
                "sampling_steps must be in range [1, {}], but get {}",
                num_timesteps,
                sampling_steps
            );
            ensure!(snr_scale > 0.0, "snr_scale must be positive");
            ensure!(ddim_eta >= 0.0, "ddim_eta must be non-negative");
            ensure!(
                (0.0..=1.0).contains(&renewal_threshold.raw()),
                "renewal_threshold must be in range [0, 1]"
            );
        }

        {
            let InferenceConfig {
                nms_iou_threshold, ..
            } = *inference;
            ensure!(
                (0.0..=1.0).contains(&nms_iou_threshold.raw()),
                "nms_iou_threshold must be in range [0, 1]"
            );
        }

        {
            let LossConfig {
                prior_prob,
                class_weight,
                giou_weight,
                l1_weight,
                ..
            } = *loss;
            ensure!(
                prior_prob > 0.0 && prior_prob < 1.0,
                "prior_prob must be in range (0, 1), but get {}",
                prior_prob
            );
            ensure!(
                class_weight >= 0.0 && giou_weight >= 0.0 && l1_weight >= 0.0,
                "loss weights must be non-negative"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_classes: 80,
            num_proposals: 300,
            head: Default::default(),
            pooler: Default::default(),
            diffusion: Default::default(),
            inference: Default::default(),
            loss: Default::default(),
        }
    }
}

/// Detection head options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    pub hidden_dim: i64,
    pub dim_feedforward: i64,
    pub num_attn_heads: i64,
    pub dropout: R64,
    pub activation: Activation,
    pub dim_dynamic: i64,
    pub num_dynamic: i64,
    /// Depth of the classification branch.
    pub num_cls: i64,
    /// Depth of the regression branch.
    pub num_reg: i64,
    /// Number of stacked head stages.
    pub num_heads: i64,
    pub deep_supervision: bool,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 256,
            dim_feedforward: 2048,
            num_attn_heads: 8,
            dropout: r64(0.0),
            activation: Activation::Relu,
            dim_dynamic: 64,
            num_dynamic: 2,
            num_cls: 1,
            num_reg: 3,
            num_heads: 6,
            deep_supervision: true,
        }
    }
}

/// A feature pyramid level consumed by the head.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PyramidLevel {
    pub name: String,
    pub stride: i64,
    pub channels: i64,
}

/// Region pooling options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolerConfig {
    pub resolution: i64,
    pub sampling_ratio: i64,
    pub canonical_box_size: R64,
    pub canonical_level: i64,
    /// Input levels, finest first.
    pub levels: Vec<PyramidLevel>,
}

impl PoolerConfig {
    pub fn scales(&self) -> Vec<R64> {
        self.levels
            .iter()
            .map(|level| r64(1.0 / level.stride as f64))
            .collect()
    }
}

impl Default for PoolerConfig {
    fn default() -> Self {
        let levels = [("p2", 4), ("p3", 8), ("p4", 16), ("p5", 32)]
            .into_iter()
            .map(|(name, stride)| PyramidLevel {
                name: name.into(),
                stride,
                channels: 256,
            })
            .collect();

        Self {
            resolution: 7,
            sampling_ratio: 2,
            canonical_box_size: r64(224.0),
            canonical_level: 4,
            levels,
        }
    }
}

/// Diffusion process options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub num_timesteps: i64,
    pub sampling_steps: i64,
    /// Signal-to-noise scale of the box space.
    pub snr_scale: R64,
    pub ddim_eta: R64,
    /// Proposals whose best class confidence does not exceed this value are renewed.
    pub renewal_threshold: R64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_timesteps: 1000,
            sampling_steps: 1,
            snr_scale: r64(2.0),
            ddim_eta: r64(1.0),
            renewal_threshold: r64(0.5),
        }
    }
}

/// Post-processing options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub use_nms: bool,
    pub nms_iou_threshold: R64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            use_nms: true,
            nms_iou_threshold: r64(0.5),
        }
    }
}

/// Classification and loss weighting options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub use_focal: bool,
    pub use_fed_loss: bool,
    pub prior_prob: R64,
    pub class_weight: R64,
    pub giou_weight: R64,
    pub l1_weight: R64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            use_focal: true,
            use_fed_loss: false,
            prior_prob: r64(0.01),
            class_weight: r64(2.0),
            giou_weight: r64(2.0),
            l1_weight: r64(5.0),
        }
    }
}
