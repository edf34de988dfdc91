use super::{DdimCoefficients, DiffusionProcess};
use crate::{
    common::*,
    inference::{Detections, PostProcessor},
    model::{HeadOutput, HeadSeries},
};

/// Anything that refines pixel corner boxes at given timesteps.
pub trait BoxDenoiser {
    /// Refine `[B, N, 4]` pixel boxes at `[B]` timesteps.
    fn denoise(&self, boxes: &XYXYTensor, timesteps: &Tensor) -> Result<HeadOutput>;
}

/// The stacked head bound to the feature maps of one batch.
#[derive(Debug)]
pub struct FeatureDenoiser<'a> {
    pub head: &'a HeadSeries,
    pub features: &'a [Tensor],
    pub train: bool,
}

impl<'a> BoxDenoiser for FeatureDenoiser<'a> {
    fn denoise(&self, boxes: &XYXYTensor, timesteps: &Tensor) -> Result<HeadOutput> {
        self.head
            .forward_t(self.features, boxes, timesteps, self.train)
    }
}

/// Denoiser predictions mapped back into the diffusion space.
#[derive(Debug)]
pub struct ModelPrediction {
    pub pred_noise: Tensor,
    /// Predicted clean state, `[B, N, 4]` center form in `[-scale, scale]`.
    pub x_start: Tensor,
    pub output: HeadOutput,
}

#[derive(Debug)]
pub struct SamplingOutput {
    /// Detections per image.
    pub detections: Vec<Detections>,
    /// The predicted clean state of the last step, `[B, N, 4]`.
    pub final_state: Tensor,
}

/// One DDIM update `x_start * sqrt(a_next) + c * pred_noise + sigma * noise`.
pub fn ddim_step(
    x_start: &Tensor,
    pred_noise: &Tensor,
    noise: &Tensor,
    coefs: &DdimCoefficients,
) -> Tensor {
    let DdimCoefficients {
        sqrt_alpha_next,
        c,
        sigma,
    } = *coefs;
    x_start * sqrt_alpha_next + pred_noise * c + noise * sigma
}

impl DiffusionProcess {
    /// Run the denoiser on the diffusion state `x` `[B, N, 4]`.
    ///
    /// `images_whwh` is `[B, 4]` and maps normalized boxes to pixels.
    pub fn model_predictions<D>(
        &self,
        denoiser: &D,
        x: &Tensor,
        timesteps: &Tensor,
        images_whwh: &Tensor,
    ) -> Result<ModelPrediction>
    where
        D: BoxDenoiser + ?Sized,
    {
        let Self {
            ref schedule,
            scale,
            ..
        } = *self;
        let whwh = images_whwh.unsqueeze(1);

        let x_boxes = (x.clamp(-scale, scale) / scale + 1.0) / 2.0;
        let x_boxes = XYXYTensor::from(CxCyWHTensor::from_packed(x_boxes)?).scale(&whwh);

        let output = denoiser.denoise(&x_boxes, timesteps)?;

        let x_start = XYXYTensor::from_packed(output.last_boxes())?.normalize(&whwh);
        let x_start = CxCyWHTensor::from(&x_start).into_packed();
        let x_start = ((x_start * 2.0 - 1.0) * scale).clamp(-scale, scale);
        let pred_noise = schedule.predict_noise_from_start(x, timesteps, &x_start)?;

        Ok(ModelPrediction {
            pred_noise,
            x_start,
            output,
        })
    }

    /// DDIM reverse sampling from pure noise.
    ///
    /// Each step keeps the proposals whose confidence exceeds the renewal threshold,
    /// moves them to the next timestep and refills the set with fresh noise. With
    /// more than one step, the detections of every step are pooled per image and
    /// suppressed together.
    pub fn ddim_sample<D, R>(
        &self,
        denoiser: &D,
        images_whwh: &Tensor,
        post: &PostProcessor,
        rng: &mut R,
    ) -> Result<SamplingOutput>
    where
        D: BoxDenoiser + ?Sized,
        R: Rng + ?Sized,
    {
        let Self {
            ref schedule,
            num_proposals,
            sampling_steps,
            eta,
            renewal_threshold,
            ..
        } = *self;

        let (batch_size, _) = images_whwh.size2().map_err(|_| {
            format_err!(
                "expect image sizes in shape [B, 4], but get {:?}",
                images_whwh.size()
            )
        })?;
        let device = images_whwh.device();
        let ensemble = sampling_steps > 1;

        let mut img = randn_tensor(rng, &[batch_size, num_proposals, 4], device);
        let mut ensembled: Vec<Vec<Detections>> = (0..batch_size).map(|_| vec![]).collect();
        let mut last_output = None;

        for (time, time_next) in schedule.sampling_time_pairs(sampling_steps)? {
            let timesteps = Tensor::full([batch_size], time, (Kind::Int64, device));
            let ModelPrediction {
                pred_noise,
                x_start,
                output,
            } = self.model_predictions(denoiser, &img, &timesteps, images_whwh)?;
            let logits = output.last_logits();

            if ensemble {
                let boxes = output.last_boxes();
                for (index, dets) in ensembled.iter_mut().enumerate() {
                    let index = index as i64;
                    let image_boxes = XYXYTensor::from_packed(boxes.select(0, index))?;
                    dets.push(post.select(&logits.select(0, index), &image_boxes)?);
                }
            }

            if time_next < 0 {
                img = x_start;
                last_output = Some(output);
                continue;
            }

            let coefs = schedule.ddim_coefficients(time, time_next, eta)?;
            let mut next_states = vec![];

            for index in 0..batch_size {
                let keep = post
                    .confidence(&logits.select(0, index))
                    .gt(renewal_threshold)
                    .nonzero()
                    .squeeze_dim(1);
                let num_remain = keep.size()[0];

                let x_start = x_start.select(0, index).index_select(0, &keep);
                let pred_noise = pred_noise.select(0, index).index_select(0, &keep);
                let noise = randn_tensor(rng, &[num_remain, 4], device);
                let stepped = ddim_step(&x_start, &pred_noise, &noise, &coefs);

                let renewed = randn_tensor(rng, &[num_proposals - num_remain, 4], device);
                debug!(
                    "step {} -> {}, image {}: {} proposals kept, {} renewed",
                    time,
                    time_next,
                    index,
                    num_remain,
                    num_proposals - num_remain
                );
                next_states.push(Tensor::cat(&[stepped.to_kind(Kind::Float), renewed], 0));
            }

            img = Tensor::stack(&next_states, 0);
            last_output = Some(output);
        }

        let detections = if ensemble {
            ensembled
                .into_iter()
                .map(|dets| post.suppress(Detections::cat(&dets)?))
                .try_collect()?
        } else {
            let output =
                last_output.ok_or_else(|| format_err!("the sampler ran zero steps"))?;
            post.inference(&output.last_logits(), &output.last_boxes())?
        };

        Ok(SamplingOutput {
            detections,
            final_state: img,
        })
    }
}
