//! DiffusionDet: object detection as denoising diffusion over box proposals.
//!
//! Noisy proposal boxes are refined by a stack of dynamic-convolution heads
//! conditioned on the diffusion timestep. Training corrupts ground truth boxes
//! with the forward process, and inference runs a DDIM sampler that renews
//! low-confidence proposals between steps.

mod common;
pub mod config;
pub mod detector;
pub mod diffusion;
pub mod inference;
pub mod loss;
pub mod model;

pub use config::Config;
pub use detector::*;
pub use diffusion::*;
pub use inference::*;
pub use loss::*;
pub use model::*;
