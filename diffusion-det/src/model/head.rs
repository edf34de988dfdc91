use crate::common::*;
use tch_modules::{
    prior_prob_bias, xavier_linear, xavier_uniform, DynamicConv, DynamicConvInit, LinearNormAct,
    LinearNormActInit, MultiheadAttention, MultiheadAttentionInit, RoiPooler, RoiPoolerInit,
};

/// Decodes `(dx, dy, dw, dh)` deltas against reference corner boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxDeltaDecoder {
    pub weights: [f64; 4],
    /// Upper bound of `dw` and `dh` before exponentiation.
    pub scale_clamp: f64,
}

impl Default for BoxDeltaDecoder {
    fn default() -> Self {
        Self {
            weights: [2.0, 2.0, 1.0, 1.0],
            scale_clamp: (1000.0f64 / 16.0).ln(),
        }
    }
}

impl BoxDeltaDecoder {
    /// Apply `[K, 4]` deltas to `[K, 4]` corner-form boxes.
    pub fn apply_deltas(&self, deltas: &Tensor, boxes: &Tensor) -> Tensor {
        let Self {
            weights: [wx, wy, ww, wh],
            scale_clamp,
        } = *self;

        let boxes = boxes.to_kind(deltas.kind());
        let widths = boxes.select(1, 2) - boxes.select(1, 0);
        let heights = boxes.select(1, 3) - boxes.select(1, 1);
        let ctr_x = boxes.select(1, 0) + &widths * 0.5;
        let ctr_y = boxes.select(1, 1) + &heights * 0.5;

        let dx = deltas.select(1, 0) / wx;
        let dy = deltas.select(1, 1) / wy;
        let dw = (deltas.select(1, 2) / ww).clamp_max(scale_clamp);
        let dh = (deltas.select(1, 3) / wh).clamp_max(scale_clamp);

        let pred_ctr_x = dx * &widths + ctr_x;
        let pred_ctr_y = dy * &heights + ctr_y;
        let pred_w = dw.exp() * widths;
        let pred_h = dh.exp() * heights;

        Tensor::stack(
            &[
                &pred_ctr_x - &pred_w * 0.5,
                &pred_ctr_y - &pred_h * 0.5,
                &pred_ctr_x + &pred_w * 0.5,
                &pred_ctr_y + &pred_h * 0.5,
            ],
            -1,
        )
    }
}

/// One refinement stage of the detection head.
#[derive(Debug, Clone)]
pub struct DiffusionDetHeadInit {
    pub hidden_dim: i64,
    pub dim_feedforward: i64,
    pub num_attn_heads: i64,
    pub dropout: R64,
    pub activation: Activation,
    pub dim_dynamic: i64,
    pub num_dynamic: i64,
    pub num_cls: i64,
    pub num_reg: i64,
    /// Number of classification logits per proposal.
    pub num_logits: i64,
    /// Initial bias of the classification logits, set for sigmoid scoring.
    pub prior_prob: Option<R64>,
    pub pooler: RoiPoolerInit,
    pub box_decoder: BoxDeltaDecoder,
}

impl DiffusionDetHeadInit {
    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<DiffusionDetHead> {
        let path = path.borrow();
        let Self {
            hidden_dim,
            dim_feedforward,
            num_attn_heads,
            dropout,
            activation,
            dim_dynamic,
            num_dynamic,
            num_cls,
            num_reg,
            num_logits,
            prior_prob,
            pooler,
            box_decoder,
        } = self;

        ensure!(num_logits > 0, "num_logits must be positive");
        let (out_h, out_w) = pooler.output_size;
        let pooler = pooler.build()?;

        let self_attn = MultiheadAttentionInit {
            embed_dim: hidden_dim,
            num_heads: num_attn_heads,
            dropout,
        }
        .build(path / "self_attn")?;
        let inst_interact = DynamicConvInit {
            hidden_dim,
            dim_dynamic,
            num_dynamic,
            num_positions: out_h * out_w,
        }
        .build(path / "inst_interact")?;

        let linear1 = xavier_linear(path / "linear1", hidden_dim, dim_feedforward, true);
        let linear2 = xavier_linear(path / "linear2", dim_feedforward, hidden_dim, true);
        let norm1 = nn::layer_norm(path / "norm1", vec![hidden_dim], Default::default());
        let norm2 = nn::layer_norm(path / "norm2", vec![hidden_dim], Default::default());
        let norm3 = nn::layer_norm(path / "norm3", vec![hidden_dim], Default::default());

        let block_time_mlp = xavier_linear(
            path / "block_time_mlp",
            hidden_dim * 4,
            hidden_dim * 2,
            true,
        );

        let cls_module: Vec<_> = (0..num_cls)
            .map(|index| {
                LinearNormActInit::new(hidden_dim, hidden_dim)
                    .build(path / "cls_module" / index.to_string())
            })
            .collect();
        let reg_module: Vec<_> = (0..num_reg)
            .map(|index| {
                LinearNormActInit::new(hidden_dim, hidden_dim)
                    .build(path / "reg_module" / index.to_string())
            })
            .collect();

        let class_logits = nn::linear(
            path / "class_logits",
            hidden_dim,
            num_logits,
            nn::LinearConfig {
                ws_init: xavier_uniform(hidden_dim, num_logits),
                bs_init: prior_prob.map(|prob| nn::Init::Const(prior_prob_bias(prob.raw()))),
                bias: true,
            },
        );
        let bboxes_delta = xavier_linear(path / "bboxes_delta", hidden_dim, 4, true);

        Ok(DiffusionDetHead {
            pooler,
            self_attn,
            inst_interact,
            linear1,
            linear2,
            norm1,
            norm2,
            norm3,
            block_time_mlp,
            cls_module,
            reg_module,
            class_logits,
            bboxes_delta,
            box_decoder,
            activation,
            hidden_dim,
            dropout: dropout.raw(),
        })
    }
}

#[derive(Debug)]
pub struct DiffusionDetHead {
    pooler: RoiPooler,
    self_attn: MultiheadAttention,
    inst_interact: DynamicConv,
    linear1: nn::Linear,
    linear2: nn::Linear,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
    block_time_mlp: nn::Linear,
    cls_module: Vec<LinearNormAct>,
    reg_module: Vec<LinearNormAct>,
    class_logits: nn::Linear,
    bboxes_delta: nn::Linear,
    box_decoder: BoxDeltaDecoder,
    activation: Activation,
    hidden_dim: i64,
    dropout: f64,
}

/// Outputs of a single head stage.
#[derive(Debug)]
pub struct HeadStageOutput {
    /// Class logits in shape `[batch, num_proposals, num_logits]`.
    pub class_logits: Tensor,
    /// Refined pixel corner boxes in shape `[batch, num_proposals, 4]`.
    pub pred_boxes: XYXYTensor,
    /// Proposal embeddings in shape `[1, batch * num_proposals, hidden_dim]`.
    pub embeddings: Tensor,
}

impl DiffusionDetHead {
    /// Refine `[batch, num_proposals, 4]` pixel boxes given a `[batch, 4 * hidden_dim]`
    /// time embedding.
    pub fn forward_t(
        &self,
        features: &[impl Borrow<Tensor>],
        boxes: &XYXYTensor,
        time_emb: &Tensor,
        train: bool,
    ) -> Result<HeadStageOutput> {
        let Self {
            ref pooler,
            ref self_attn,
            ref inst_interact,
            ref linear1,
            ref linear2,
            ref norm1,
            ref norm2,
            ref norm3,
            ref block_time_mlp,
            ref cls_module,
            ref reg_module,
            ref class_logits,
            ref bboxes_delta,
            ref box_decoder,
            activation,
            hidden_dim,
            dropout,
        } = *self;

        let (batch_size, num_proposals, _) = boxes.tensor().size3()?;
        let (time_batch, time_dim) = time_emb.size2()?;
        ensure!(
            time_batch == batch_size && time_dim == hidden_dim * 4,
            "expect time embedding in shape [{}, {}], but get {:?}",
            batch_size,
            hidden_dim * 4,
            time_emb.size()
        );
        let num_instances = batch_size * num_proposals;

        // roi features
        let roi_features = pooler.forward(features, boxes)?;
        let roi_channels = roi_features.size()[1];
        ensure!(
            roi_channels == hidden_dim,
            "feature channels ({}) must equal hidden_dim ({})",
            roi_channels,
            hidden_dim
        );
        let roi_features = roi_features.view([num_instances, hidden_dim, -1]);
        let pro_features = roi_features
            .mean_dim(&[-1i64][..], false, roi_features.kind())
            .view([batch_size, num_proposals, hidden_dim])
            .permute([1, 0, 2]);

        // self attention among the proposals of each image
        let pro_features2 =
            self_attn.forward_t(&pro_features, &pro_features, &pro_features, train)?;
        let pro_features = (pro_features + pro_features2.dropout(dropout, train)).apply(norm1);

        // instance interaction
        let pro_features = pro_features
            .permute([1, 0, 2])
            .reshape([1, num_instances, hidden_dim]);
        let pro_features2 = inst_interact.forward(&pro_features, &roi_features)?;
        let obj_features = (pro_features + pro_features2.dropout(dropout, train)).apply(norm2);

        // feed-forward
        let obj_features2 = obj_features
            .apply(linear1)
            .activation(activation)
            .dropout(dropout, train)
            .apply(linear2);
        let obj_features = (obj_features + obj_features2.dropout(dropout, train)).apply(norm3);

        // timestep modulation
        let fc_feature = obj_features.transpose(0, 1).reshape([num_instances, -1]);
        let scale_shift = time_emb
            .silu_ext()
            .apply(block_time_mlp)
            .unsqueeze(1)
            .expand([batch_size, num_proposals, hidden_dim * 2], false)
            .reshape([num_instances, hidden_dim * 2]);
        let scale_shift = scale_shift.chunk(2, 1);
        let fc_feature = fc_feature * (&scale_shift[0] + 1.0) + &scale_shift[1];

        // prediction branches
        let cls_feature = cls_module
            .iter()
            .fold(fc_feature.shallow_clone(), |xs, layer| xs.apply(layer));
        let reg_feature = reg_module
            .iter()
            .fold(fc_feature, |xs, layer| xs.apply(layer));
        let logits = cls_feature.apply(class_logits);
        let deltas = reg_feature.apply(bboxes_delta);
        let pred_boxes =
            box_decoder.apply_deltas(&deltas, &boxes.tensor().reshape([num_instances, 4]));

        Ok(HeadStageOutput {
            class_logits: logits.view([batch_size, num_proposals, -1]),
            pred_boxes: XYXYTensor::from_packed(pred_boxes.view([batch_size, num_proposals, 4]))?,
            embeddings: obj_features,
        })
    }
}
