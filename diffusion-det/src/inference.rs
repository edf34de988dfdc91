//! Conversion of head predictions into scored, labeled boxes.

use crate::common::*;
use tch_goodies::batched_nms;

/// How class logits are turned into confidences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreMode {
    /// One independent sigmoid per class, used with focal or federated loss.
    Sigmoid,
    /// Softmax over the classes plus a trailing background logit.
    Softmax,
}

#[derive(Debug, Clone)]
pub struct PostProcessorInit {
    pub num_classes: i64,
    /// Number of detections kept per image by top-k selection.
    pub num_proposals: i64,
    pub score_mode: ScoreMode,
    pub use_nms: bool,
    pub nms_iou_threshold: R64,
}

impl PostProcessorInit {
    pub fn build(self) -> Result<PostProcessor> {
        let Self {
            num_classes,
            num_proposals,
            score_mode,
            use_nms,
            nms_iou_threshold,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(num_proposals > 0, "num_proposals must be positive");
        ensure!(
            (0.0..=1.0).contains(&nms_iou_threshold.raw()),
            "nms_iou_threshold must be in range [0, 1]"
        );

        Ok(PostProcessor {
            num_classes,
            num_proposals,
            score_mode,
            use_nms,
            nms_iou_threshold: nms_iou_threshold.raw(),
        })
    }
}

#[derive(Debug, Clone, CopyGetters)]
pub struct PostProcessor {
    #[getset(get_copy = "pub")]
    num_classes: i64,
    #[getset(get_copy = "pub")]
    num_proposals: i64,
    #[getset(get_copy = "pub")]
    score_mode: ScoreMode,
    #[getset(get_copy = "pub")]
    use_nms: bool,
    nms_iou_threshold: f64,
}

/// Detections of one image.
#[derive(Debug)]
pub struct Detections {
    /// Pixel corner boxes in shape `[K, 4]`.
    pub boxes: XYXYTensor,
    /// Scores in shape `[K]`.
    pub scores: Tensor,
    /// Class indices in shape `[K]`.
    pub labels: Tensor,
}

impl Detections {
    pub fn len(&self) -> i64 {
        self.scores.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_select(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            boxes: XYXYTensor::from_packed(self.boxes.tensor().index_select(0, indices))?,
            scores: self.scores.index_select(0, indices),
            labels: self.labels.index_select(0, indices),
        })
    }

    /// Concatenate detections of the same image.
    pub fn cat(detections: &[Detections]) -> Result<Self> {
        ensure!(!detections.is_empty(), "no detections to concatenate");
        let boxes: Vec<_> = detections
            .iter()
            .map(|det| det.boxes.tensor().shallow_clone())
            .collect();
        let scores: Vec<_> = detections.iter().map(|det| &det.scores).collect();
        let labels: Vec<_> = detections.iter().map(|det| &det.labels).collect();

        Ok(Self {
            boxes: XYXYTensor::from_packed(Tensor::cat(&boxes, 0))?,
            scores: Tensor::cat(&scores, 0),
            labels: Tensor::cat(&labels, 0),
        })
    }
}

impl PostProcessor {
    /// Best class confidence of each proposal from `[N, num_logits]` logits.
    pub fn confidence(&self, logits: &Tensor) -> Tensor {
        self.class_scores(logits).amax(&[-1i64][..], false)
    }

    /// Per-class scores `[N, num_classes]`, dropping the background column in softmax mode.
    fn class_scores(&self, logits: &Tensor) -> Tensor {
        match self.score_mode {
            ScoreMode::Sigmoid => logits.sigmoid(),
            ScoreMode::Softmax => logits
                .softmax(-1, logits.kind())
                .narrow(-1, 0, self.num_classes),
        }
    }

    /// Score and label the proposals of one image without suppression.
    ///
    /// `logits` is `[N, num_logits]` and `boxes` is `[N, 4]` in pixels.
    pub fn select(&self, logits: &Tensor, boxes: &XYXYTensor) -> Result<Detections> {
        let Self {
            num_classes,
            num_proposals,
            score_mode,
            ..
        } = *self;

        let (num_boxes, num_logits) = logits
            .size2()
            .map_err(|_| format_err!("expect 2d logits, but get shape {:?}", logits.size()))?;
        ensure!(
            boxes.num_samples() == num_boxes && boxes.tensor().dim() == 2,
            "expect boxes in shape [{}, 4], but get {:?}",
            num_boxes,
            boxes.tensor().size()
        );
        let expect_logits = match score_mode {
            ScoreMode::Sigmoid => num_classes,
            ScoreMode::Softmax => num_classes + 1,
        };
        ensure!(
            num_logits == expect_logits,
            "expect {} logits per proposal, but get {}",
            expect_logits,
            num_logits
        );

        let device = logits.device();
        let scores = self.class_scores(logits);

        match score_mode {
            ScoreMode::Sigmoid => {
                let num_pairs = num_boxes * num_classes;
                let (scores, pair_indices) =
                    scores
                        .flatten(0, 1)
                        .topk(num_proposals.min(num_pairs), 0, true, true);
                let labels = Tensor::arange(num_classes, (Kind::Int64, device))
                    .repeat([num_boxes])
                    .index_select(0, &pair_indices);
                let box_indices = Tensor::arange(num_boxes, (Kind::Int64, device))
                    .unsqueeze(1)
                    .expand([num_boxes, num_classes], false)
                    .reshape([-1])
                    .index_select(0, &pair_indices);
                let boxes =
                    XYXYTensor::from_packed(boxes.tensor().index_select(0, &box_indices))?;

                Ok(Detections {
                    boxes,
                    scores,
                    labels,
                })
            }
            ScoreMode::Softmax => {
                let (scores, labels) = scores.max_dim(-1, false);
                Ok(Detections {
                    boxes: boxes.shallow_clone(),
                    scores,
                    labels,
                })
            }
        }
    }

    /// Apply class-aware suppression when enabled.
    pub fn suppress(&self, detections: Detections) -> Result<Detections> {
        if !self.use_nms || detections.is_empty() {
            return Ok(detections);
        }
        let keep = batched_nms(
            &detections.boxes,
            &detections.scores,
            &detections.labels,
            self.nms_iou_threshold,
        )?;
        detections.index_select(&keep)
    }

    /// Single-shot inference on `[B, N, num_logits]` logits and `[B, N, 4]` pixel boxes.
    pub fn inference(&self, logits: &Tensor, boxes: &Tensor) -> Result<Vec<Detections>> {
        ensure!(
            logits.dim() == 3 && boxes.dim() == 3,
            "expect batched logits and boxes, but get shapes {:?} and {:?}",
            logits.size(),
            boxes.size()
        );
        let batch_size = logits.size()[0];
        ensure!(
            boxes.size()[0] == batch_size,
            "logits and boxes have different batch sizes"
        );

        (0..batch_size)
            .map(|index| {
                let boxes = XYXYTensor::from_packed(boxes.select(0, index))?;
                let detections = self.select(&logits.select(0, index), &boxes)?;
                self.suppress(detections)
            })
            .try_collect()
    }
}
