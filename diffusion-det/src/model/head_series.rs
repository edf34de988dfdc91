use super::head::{DiffusionDetHead, DiffusionDetHeadInit};
use crate::common::*;
use tch_modules::{xavier_linear, SinusoidalEmbedding};

/// Maps integer timesteps to `[batch, 4 * dim]` embeddings.
#[derive(Debug)]
pub struct TimeMlp {
    embedding: SinusoidalEmbedding,
    linear1: nn::Linear,
    linear2: nn::Linear,
}

impl TimeMlp {
    pub fn new<'p>(path: impl Borrow<nn::Path<'p>>, dim: i64) -> Result<Self> {
        let path = path.borrow();
        let time_dim = dim * 4;
        Ok(Self {
            embedding: SinusoidalEmbedding::new(dim)?,
            linear1: xavier_linear(path / "linear1", dim, time_dim, true),
            linear2: xavier_linear(path / "linear2", time_dim, time_dim, true),
        })
    }
}

impl nn::Module for TimeMlp {
    fn forward(&self, timesteps: &Tensor) -> Tensor {
        let Self {
            ref embedding,
            ref linear1,
            ref linear2,
        } = *self;

        timesteps
            .apply(embedding)
            .apply(linear1)
            .activation(Activation::Gelu)
            .apply(linear2)
    }
}

/// Stack of independently parameterized head stages.
#[derive(Debug, Clone)]
pub struct HeadSeriesInit {
    pub head: DiffusionDetHeadInit,
    pub num_heads: i64,
    /// Return the outputs of every stage instead of the last one only.
    pub deep_supervision: bool,
}

impl HeadSeriesInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<HeadSeries> {
        let path = path.borrow();
        let Self {
            head,
            num_heads,
            deep_supervision,
        } = self;

        ensure!(num_heads > 0, "num_heads must be positive");
        let hidden_dim = head.hidden_dim;
        let time_mlp = TimeMlp::new(path / "time_mlp", hidden_dim)?;
        let heads: Vec<_> = (0..num_heads)
            .map(|index| head.clone().build(path / "head_series" / index.to_string()))
            .try_collect()?;

        Ok(HeadSeries {
            time_mlp,
            heads,
            deep_supervision,
        })
    }
}

#[derive(Debug)]
pub struct HeadSeries {
    time_mlp: TimeMlp,
    heads: Vec<DiffusionDetHead>,
    deep_supervision: bool,
}

/// Predictions of the stacked head.
#[derive(Debug)]
pub struct HeadOutput {
    /// Class logits in shape `[stages, batch, num_proposals, num_logits]`.
    pub class_logits: Tensor,
    /// Pixel corner boxes in shape `[stages, batch, num_proposals, 4]`.
    pub pred_boxes: Tensor,
}

impl HeadOutput {
    pub fn num_stages(&self) -> i64 {
        self.class_logits.size()[0]
    }

    /// Class logits of the final stage, `[batch, num_proposals, num_logits]`.
    pub fn last_logits(&self) -> Tensor {
        self.class_logits.select(0, -1)
    }

    /// Boxes of the final stage, `[batch, num_proposals, 4]`.
    pub fn last_boxes(&self) -> Tensor {
        self.pred_boxes.select(0, -1)
    }

    /// `(class_logits, pred_boxes)` of every stage before the final one.
    pub fn aux_outputs(&self) -> Vec<(Tensor, Tensor)> {
        (0..(self.num_stages() - 1))
            .map(|stage| {
                (
                    self.class_logits.select(0, stage),
                    self.pred_boxes.select(0, stage),
                )
            })
            .collect()
    }
}

impl HeadSeries {
    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn deep_supervision(&self) -> bool {
        self.deep_supervision
    }

    /// Run every stage on `[batch, num_proposals, 4]` pixel boxes at `[batch]` timesteps.
    pub fn forward_t(
        &self,
        features: &[impl Borrow<Tensor>],
        boxes: &XYXYTensor,
        timesteps: &Tensor,
        train: bool,
    ) -> Result<HeadOutput> {
        let Self {
            ref time_mlp,
            ref heads,
            deep_supervision,
        } = *self;

        let time = time_mlp.forward(timesteps);

        let mut boxes = boxes.shallow_clone();
        let mut stage_logits = vec![];
        let mut stage_boxes = vec![];

        for head in heads {
            let output = head.forward_t(features, &boxes, &time, train)?;
            boxes = output.pred_boxes.detach();

            if deep_supervision || stage_logits.is_empty() {
                stage_logits.push(output.class_logits);
                stage_boxes.push(output.pred_boxes.into_packed());
            } else {
                stage_logits[0] = output.class_logits;
                stage_boxes[0] = output.pred_boxes.into_packed();
            }
        }

        Ok(HeadOutput {
            class_logits: Tensor::stack(&stage_logits, 0),
            pred_boxes: Tensor::stack(&stage_boxes, 0),
        })
    }
}
