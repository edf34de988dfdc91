//! Host-side random sampling so that results only depend on the caller's generator.

use crate::common::*;
use rand::{seq::index, Rng};
use rand_distr::StandardNormal;

/// Draw a tensor of i.i.d. standard normal values with the given shape.
pub fn randn_tensor<R>(rng: &mut R, shape: &[i64], device: Device) -> Tensor
where
    R: Rng + ?Sized,
{
    let numel: i64 = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_slice(&values).view(shape).to_device(device)
}

/// Pick `amount` distinct indices out of `0..length` uniformly at random.
pub fn sample_indices<R>(rng: &mut R, length: usize, amount: usize) -> Result<Vec<i64>>
where
    R: Rng + ?Sized,
{
    ensure!(
        amount <= length,
        "cannot sample {} distinct indices out of {}",
        amount,
        length
    );
    let indices = index::sample(rng, length, amount)
        .into_iter()
        .map(|index| index as i64)
        .collect();
    Ok(indices)
}
