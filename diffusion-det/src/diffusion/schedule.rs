use crate::common::*;

const COSINE_OFFSET: f64 = 0.008;
const MAX_BETA: f64 = 0.999;

/// Precomputed noise-retention coefficients of a diffusion process.
///
/// All tables are indexed by timestep `0..num_timesteps` and kept on the host in
/// double precision. Tensor-valued lookups gather from them per sample.
#[derive(Debug, Clone, CopyGetters)]
pub struct DiffusionSchedule {
    #[get_copy = "pub"]
    num_timesteps: i64,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
}

/// Coefficients of one DDIM update from `t` to `t_next`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DdimCoefficients {
    /// `sqrt(alpha_cumprod[t_next])`, scaling the predicted clean state.
    pub sqrt_alpha_next: f64,
    /// Scale of the predicted noise.
    pub c: f64,
    /// Scale of the fresh noise.
    pub sigma: f64,
}

impl DiffusionSchedule {
    /// Build the cosine schedule with `num_timesteps` steps.
    pub fn cosine(num_timesteps: i64) -> Result<Self> {
        ensure!(num_timesteps > 0, "num_timesteps must be positive");

        let total = num_timesteps as f64;
        let cumprod_at = |step: i64| -> f64 {
            let ratio = (step as f64 / total + COSINE_OFFSET) / (1.0 + COSINE_OFFSET);
            (ratio * std::f64::consts::FRAC_PI_2).cos().powi(2)
        };
        let curve: Vec<f64> = (0..=num_timesteps).map(cumprod_at).collect();
        let betas = curve
            .iter()
            .tuple_windows()
            .map(|(&prev, &next)| (1.0 - next / prev).clamp(0.0, MAX_BETA));
        let alphas_cumprod: Vec<f64> = betas
            .scan(1.0, |prod, beta| {
                *prod *= 1.0 - beta;
                Some(*prod)
            })
            .collect();

        Self::from_alphas_cumprod(alphas_cumprod)
    }

    /// Build a schedule from explicit cumulative products, which must lie in `(0, 1]`.
    pub fn from_alphas_cumprod(alphas_cumprod: Vec<f64>) -> Result<Self> {
        ensure!(!alphas_cumprod.is_empty(), "the schedule must not be empty");
        ensure!(
            alphas_cumprod.iter().all(|&alpha| alpha > 0.0 && alpha <= 1.0),
            "cumulative alphas must lie in (0, 1]"
        );

        let map = |f: fn(f64) -> f64| -> Vec<f64> { alphas_cumprod.iter().cloned().map(f).collect() };
        let sqrt_alphas_cumprod = map(|alpha| alpha.sqrt());
        let sqrt_one_minus_alphas_cumprod = map(|alpha| (1.0 - alpha).sqrt());
        let sqrt_recip_alphas_cumprod = map(|alpha| (1.0 / alpha).sqrt());
        let sqrt_recipm1_alphas_cumprod = map(|alpha| (1.0 / alpha - 1.0).sqrt());

        Ok(Self {
            num_timesteps: alphas_cumprod.len() as i64,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
        })
    }

    pub fn alpha_cumprod(&self, timestep: i64) -> Result<f64> {
        ensure!(
            (0..self.num_timesteps).contains(&timestep),
            "timestep {} is out of range [0, {})",
            timestep,
            self.num_timesteps
        );
        Ok(self.alphas_cumprod[timestep as usize])
    }

    /// Strictly decreasing `(t, t_next)` pairs of a `sampling_steps`-step reverse pass.
    ///
    /// The grid is `linspace(-1, T - 1, sampling_steps + 1)` truncated towards zero,
    /// so the last pair always ends at the terminal sentinel `-1`.
    pub fn sampling_time_pairs(&self, sampling_steps: i64) -> Result<Vec<(i64, i64)>> {
        ensure!(
            sampling_steps > 0 && sampling_steps <= self.num_timesteps,
            "sampling_steps must be in range [1, {}], but get {}",
            self.num_timesteps,
            sampling_steps
        );

        let start = -1.0;
        let end = (self.num_timesteps - 1) as f64;
        let times: Vec<i64> = (0..=sampling_steps)
            .rev()
            .map(|index| (start + (end - start) * index as f64 / sampling_steps as f64) as i64)
            .collect();
        let pairs: Vec<_> = times.into_iter().tuple_windows().collect();

        ensure!(
            pairs.iter().all(|&(time, time_next)| time > time_next),
            "sampling_steps = {} yields repeated timesteps",
            sampling_steps
        );
        Ok(pairs)
    }

    /// Coefficients of the DDIM update from `timestep` to `next_timestep >= 0`.
    pub fn ddim_coefficients(
        &self,
        timestep: i64,
        next_timestep: i64,
        eta: f64,
    ) -> Result<DdimCoefficients> {
        let alpha = self.alpha_cumprod(timestep)?;
        let alpha_next = self.alpha_cumprod(next_timestep)?;
        let sigma = eta * ((1.0 - alpha / alpha_next) * (1.0 - alpha_next) / (1.0 - alpha)).sqrt();
        let c = (1.0 - alpha_next - sigma.powi(2)).sqrt();
        ensure!(
            sigma.is_finite() && c.is_finite(),
            "invalid DDIM coefficients from timestep {} to {}",
            timestep,
            next_timestep
        );

        Ok(DdimCoefficients {
            sqrt_alpha_next: alpha_next.sqrt(),
            c,
            sigma,
        })
    }

    /// Forward corruption `sqrt(a_t) * x_start + sqrt(1 - a_t) * noise`.
    ///
    /// `timesteps` holds one timestep per leading-dimension entry of `x_start`.
    pub fn q_sample(&self, x_start: &Tensor, timesteps: &Tensor, noise: &Tensor) -> Result<Tensor> {
        ensure!(
            x_start.size() == noise.size(),
            "x_start and noise shapes differ: {:?} vs {:?}",
            x_start.size(),
            noise.size()
        );
        let signal = self.extract(&self.sqrt_alphas_cumprod, timesteps, x_start)?;
        let noise_scale = self.extract(&self.sqrt_one_minus_alphas_cumprod, timesteps, x_start)?;
        Ok(signal * x_start + noise_scale * noise)
    }

    /// Recover the noise from a noisy state and its predicted clean state.
    pub fn predict_noise_from_start(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        x_start: &Tensor,
    ) -> Result<Tensor> {
        let recip = self.extract(&self.sqrt_recip_alphas_cumprod, timesteps, x_t)?;
        let recipm1 = self.extract(&self.sqrt_recipm1_alphas_cumprod, timesteps, x_t)?;
        Ok((recip * x_t - x_start) / recipm1)
    }

    /// Recover the clean state from a noisy state and its noise.
    pub fn predict_start_from_noise(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        let recip = self.extract(&self.sqrt_recip_alphas_cumprod, timesteps, x_t)?;
        let recipm1 = self.extract(&self.sqrt_recipm1_alphas_cumprod, timesteps, x_t)?;
        Ok(recip * x_t - recipm1 * noise)
    }

    /// Gather `table[t]` per sample, shaped to broadcast against `like`.
    fn extract(&self, table: &[f64], timesteps: &Tensor, like: &Tensor) -> Result<Tensor> {
        let batch_size = timesteps
            .size1()
            .map_err(|_| format_err!("timesteps must be a 1d tensor"))?;
        let shape = like.size();
        ensure!(
            shape.first() == Some(&batch_size),
            "expect {} samples to match the timesteps, but get shape {:?}",
            batch_size,
            shape
        );

        let steps = Vec::<i64>::try_from(&timesteps.to_device(Device::Cpu).to_kind(Kind::Int64))?;
        let values: Vec<f64> = steps
            .into_iter()
            .map(|step| -> Result<_> {
                ensure!(
                    (0..self.num_timesteps).contains(&step),
                    "timestep {} is out of range [0, {})",
                    step,
                    self.num_timesteps
                );
                Ok(table[step as usize])
            })
            .try_collect()?;

        let broadcast_shape: Vec<i64> = iter::once(batch_size)
            .chain(iter::repeat(1).take(shape.len() - 1))
            .collect();
        let coefs = Tensor::from_slice(&values)
            .to_kind(like.kind())
            .to_device(like.device())
            .view(broadcast_shape.as_slice());
        Ok(coefs)
    }
}
