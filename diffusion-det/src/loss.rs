//! Loss term weighting on top of an external set-prediction criterion.

use crate::{common::*, config::LossConfig, diffusion::PreparedTarget, model::HeadOutput};
use log::{log_enabled, Level};

pub const CLASS_LOSS: &str = "loss_ce";
pub const L1_LOSS: &str = "loss_bbox";
pub const GIOU_LOSS: &str = "loss_giou";

/// Predictions handed to the criterion.
#[derive(Debug)]
pub struct DetectionOutputs {
    /// Final-stage logits `[B, N, num_logits]`.
    pub pred_logits: Tensor,
    /// Final-stage pixel corner boxes `[B, N, 4]`.
    pub pred_boxes: Tensor,
    /// `(logits, boxes)` of the earlier stages under deep supervision.
    pub aux_outputs: Vec<(Tensor, Tensor)>,
}

impl From<&HeadOutput> for DetectionOutputs {
    fn from(output: &HeadOutput) -> Self {
        Self {
            pred_logits: output.last_logits(),
            pred_boxes: output.last_boxes(),
            aux_outputs: output.aux_outputs(),
        }
    }
}

/// Matches predictions to targets and computes named loss terms.
///
/// Auxiliary stage terms are suffixed with `_{stage}`.
pub trait Criterion {
    fn forward(
        &self,
        outputs: &DetectionOutputs,
        targets: &[PreparedTarget],
    ) -> Result<IndexMap<String, Tensor>>;
}

/// Per-term loss multipliers.
#[derive(Debug, Clone, PartialEq)]
pub struct LossWeights {
    weights: IndexMap<String, f64>,
}

/// Weighted loss terms and their sum.
#[derive(Debug)]
pub struct WeightedLosses {
    pub terms: IndexMap<String, Tensor>,
    /// The sum of every term.
    pub total: Tensor,
}

impl LossWeights {
    /// Build the table for `num_heads` stages, adding suffixed entries for
    /// the auxiliary stages under deep supervision.
    pub fn new(config: &LossConfig, num_heads: i64, deep_supervision: bool) -> Self {
        let base = [
            (CLASS_LOSS, config.class_weight.raw()),
            (L1_LOSS, config.l1_weight.raw()),
            (GIOU_LOSS, config.giou_weight.raw()),
        ];
        let num_aux = if deep_supervision { num_heads - 1 } else { 0 };

        let suffixed = (0..num_aux).flat_map(|stage| {
            base.iter()
                .map(move |&(name, weight)| (format!("{}_{}", name, stage), weight))
        });
        let weights = base
            .iter()
            .map(|&(name, weight)| (name.to_string(), weight))
            .chain(suffixed)
            .collect();

        Self { weights }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.weights.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights
            .iter()
            .map(|(name, &weight)| (name.as_str(), weight))
    }

    /// Multiply every weighted term by its weight and sum the weighted terms.
    ///
    /// Terms without a weight are kept as is for reporting and do not enter the
    /// total. Every weighted term must be present.
    pub fn weight_losses(&self, losses: IndexMap<String, Tensor>) -> Result<WeightedLosses> {
        if let Some(missing) = self
            .weights
            .keys()
            .find(|name| !losses.contains_key(name.as_str()))
        {
            bail!("the criterion did not produce the '{}' term", missing);
        }

        let terms: IndexMap<String, Tensor> = losses
            .into_iter()
            .map(|(name, loss)| {
                let loss = match self.weights.get(&name) {
                    Some(&weight) => loss * weight,
                    None => loss,
                };
                (name, loss)
            })
            .collect();

        if log_enabled!(Level::Debug) {
            for (name, loss) in &terms {
                debug!("{} = {:.5}", name, loss.double_value(&[]));
            }
        }

        let total = Tensor::f_sum_tensors(self.weights.keys().map(|name| &terms[name]))?;
        Ok(WeightedLosses { terms, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(value: f64) -> Tensor {
        Tensor::from(value)
    }

    #[test]
    fn weight_table_with_deep_supervision() {
        let weights = LossWeights::new(&LossConfig::default(), 3, true);
        let names: Vec<_> = weights.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "loss_ce",
                "loss_bbox",
                "loss_giou",
                "loss_ce_0",
                "loss_bbox_0",
                "loss_giou_0",
                "loss_ce_1",
                "loss_bbox_1",
                "loss_giou_1",
            ]
        );
        assert_eq!(weights.get("loss_bbox_1"), Some(5.0));
        assert_eq!(LossWeights::new(&LossConfig::default(), 3, false).len(), 3);
    }

    #[test]
    fn weighted_sum() -> Result<()> {
        let weights = LossWeights::new(&LossConfig::default(), 1, true);
        let losses: IndexMap<String, Tensor> = [
            ("loss_ce", 1.0),
            ("loss_bbox", 0.5),
            ("loss_giou", 0.25),
            ("loss_extra", 3.0),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), scalar(value)))
        .collect();

        let WeightedLosses { terms, total } = weights.weight_losses(losses)?;
        approx::assert_abs_diff_eq!(terms["loss_bbox"].double_value(&[]), 2.5);
        // 2 * 1 + 5 * 0.5 + 2 * 0.25, the unweighted term is only reported
        approx::assert_abs_diff_eq!(total.double_value(&[]), 5.0, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(terms["loss_extra"].double_value(&[]), 3.0);
        Ok(())
    }

    #[test]
    fn missing_term_is_an_error() {
        let weights = LossWeights::new(&LossConfig::default(), 2, true);
        let losses: IndexMap<String, Tensor> = [("loss_ce", 1.0), ("loss_bbox", 1.0), ("loss_giou", 1.0)]
            .into_iter()
            .map(|(name, value)| (name.to_string(), scalar(value)))
            .collect();
        assert!(weights.weight_losses(losses).is_err());
    }
}
