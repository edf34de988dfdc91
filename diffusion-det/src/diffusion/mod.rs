//! The box diffusion process: forward corruption for training and DDIM sampling for inference.

mod sampler;
mod schedule;
mod targets;

pub use sampler::*;
pub use schedule::*;
pub use targets::*;

use crate::{common::*, config::Config};

#[derive(Debug, Clone)]
pub struct DiffusionProcessInit {
    pub num_timesteps: i64,
    pub num_proposals: i64,
    /// Signal-to-noise scale; clean boxes live in `[-scale, scale]`.
    pub snr_scale: R64,
    pub sampling_steps: i64,
    pub ddim_eta: R64,
    pub renewal_threshold: R64,
}

impl Default for DiffusionProcessInit {
    fn default() -> Self {
        Self {
            num_timesteps: 1000,
            num_proposals: 300,
            snr_scale: r64(2.0),
            sampling_steps: 1,
            ddim_eta: r64(1.0),
            renewal_threshold: r64(0.5),
        }
    }
}

impl DiffusionProcessInit {
    pub fn from_config(config: &Config) -> Self {
        let Config {
            num_proposals,
            ref diffusion,
            ..
        } = *config;

        Self {
            num_timesteps: diffusion.num_timesteps,
            num_proposals,
            snr_scale: diffusion.snr_scale,
            sampling_steps: diffusion.sampling_steps,
            ddim_eta: diffusion.ddim_eta,
            renewal_threshold: diffusion.renewal_threshold,
        }
    }

    pub fn build(self) -> Result<DiffusionProcess> {
        let Self {
            num_timesteps,
            num_proposals,
            snr_scale,
            sampling_steps,
            ddim_eta,
            renewal_threshold,
        } = self;

        ensure!(num_proposals > 0, "num_proposals must be positive");
        ensure!(snr_scale > 0.0, "snr_scale must be positive");
        ensure!(ddim_eta >= 0.0, "ddim_eta must be non-negative");

        let schedule = DiffusionSchedule::cosine(num_timesteps)?;
        // validates the step count against the schedule
        schedule.sampling_time_pairs(sampling_steps)?;

        Ok(DiffusionProcess {
            schedule,
            num_proposals,
            scale: snr_scale.raw(),
            sampling_steps,
            eta: ddim_eta.raw(),
            renewal_threshold: renewal_threshold.raw(),
        })
    }
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct DiffusionProcess {
    #[getset(get = "pub")]
    schedule: DiffusionSchedule,
    #[getset(get_copy = "pub")]
    num_proposals: i64,
    #[getset(get_copy = "pub")]
    scale: f64,
    #[getset(get_copy = "pub")]
    sampling_steps: i64,
    eta: f64,
    renewal_threshold: f64,
}

/// Stack per-image sizes into `[B, 4]` `(w, h, w, h)` factors.
pub fn images_whwh(image_sizes: &[HW<i64>], device: Device) -> Result<Tensor> {
    ensure!(!image_sizes.is_empty(), "at least one image size is required");
    let values: Vec<f32> = image_sizes
        .iter()
        .flat_map(|size| size.cast::<f32>().whwh())
        .collect();
    Ok(Tensor::from_slice(&values)
        .view([image_sizes.len() as i64, 4])
        .to_device(device))
}
