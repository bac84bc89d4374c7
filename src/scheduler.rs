//! Noise schedules for the latent denoising loop.
//!
//! The sampler itself runs inside the model library; this module resolves the
//! configured schedule into the concrete sigma list handed across that
//! boundary, so the same configuration always produces the same schedule.
//!
//! ## Karras schedule
//!
//! ```text
//! σ_i = (σ_max^(1/ρ) + i / (n - 1) · (σ_min^(1/ρ) - σ_max^(1/ρ)))^ρ,  i = 0..n
//! ```
//!
//! followed by a terminal `σ_n = 0`.

use serde::{Deserialize, Serialize};

/// Sigma spacing family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleFamily {
    /// Karras et al. (2022) polynomial spacing, dense near `sigma_min`.
    Karras,
    /// Evenly spaced sigmas between the bounds.
    Linear,
}

/// Noise schedule bounds and family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseSchedule {
    #[serde(default = "default_family")]
    pub family: ScheduleFamily,

    /// Smallest non-terminal sigma (default: 1e-3).
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f64,

    /// Largest sigma, where sampling starts (default: 160).
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f64,

    /// Karras exponent ρ (default: 7). Ignored by [`ScheduleFamily::Linear`].
    #[serde(default = "default_rho")]
    pub rho: f64,

    /// Stochastic churn per step; 0 gives a deterministic ODE sampler.
    #[serde(default)]
    pub s_churn: f64,
}

impl Default for NoiseSchedule {
    fn default() -> Self {
        Self {
            family: default_family(),
            sigma_min: default_sigma_min(),
            sigma_max: default_sigma_max(),
            rho: default_rho(),
            s_churn: 0.0,
        }
    }
}

impl NoiseSchedule {
    /// Resolve the schedule for `steps` denoising iterations.
    ///
    /// Returns `steps + 1` sigmas, strictly decreasing, ending in 0.
    pub fn sigmas(&self, steps: usize) -> Vec<f64> {
        let mut sigmas = Vec::with_capacity(steps + 1);
        let denom = (steps.max(2) - 1) as f64;

        match self.family {
            ScheduleFamily::Karras => {
                let min_inv_rho = self.sigma_min.powf(1.0 / self.rho);
                let max_inv_rho = self.sigma_max.powf(1.0 / self.rho);
                for i in 0..steps {
                    let ramp = i as f64 / denom;
                    sigmas.push((max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(self.rho));
                }
            }
            ScheduleFamily::Linear => {
                for i in 0..steps {
                    let ramp = i as f64 / denom;
                    sigmas.push(self.sigma_max + ramp * (self.sigma_min - self.sigma_max));
                }
            }
        }

        // Terminal sigma = 0.
        sigmas.push(0.0);
        sigmas
    }

    /// Check the bounds are usable.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.sigma_min.is_finite() && self.sigma_min > 0.0) {
            return Err(format!("sigma_min must be positive, got {}", self.sigma_min));
        }
        if !(self.sigma_max.is_finite() && self.sigma_max > self.sigma_min) {
            return Err(format!(
                "sigma_max must exceed sigma_min ({}), got {}",
                self.sigma_min, self.sigma_max
            ));
        }
        if self.family == ScheduleFamily::Karras && !(self.rho.is_finite() && self.rho > 0.0) {
            return Err(format!("rho must be positive, got {}", self.rho));
        }
        if !(self.s_churn.is_finite() && self.s_churn >= 0.0) {
            return Err(format!("s_churn must be non-negative, got {}", self.s_churn));
        }
        Ok(())
    }
}

fn default_family() -> ScheduleFamily {
    ScheduleFamily::Karras
}

fn default_sigma_min() -> f64 {
    1e-3
}

fn default_sigma_max() -> f64 {
    160.0
}

fn default_rho() -> f64 {
    7.0
}
