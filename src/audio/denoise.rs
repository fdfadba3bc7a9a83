//! # Noise Suppression
//!
//! The suppression engine itself is external; this module defines the seam, a
//! small bundled filter, and the window policy that decides *which part* of a
//! unit is suppressed.
//!
//! ## Window Policy:
//! The legacy middleware filtered only the first two 10ms windows of every
//! audio unit and replaced the unit with their concatenation. For the device's
//! 20ms frames this covers the whole frame; anything longer is cut to 20ms.
//! That looks like an incomplete application of the filter rather than a
//! deliberate choice, but clients were tuned against it, so it stays the
//! default (`leading`). `whole` suppresses the complete unit instead.

use crate::audio::processor::PcmUnit;
use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::sync::Arc;

/// Width of each leading window, in milliseconds.
const LEADING_WINDOW_MS: u64 = 10;

/// Number of leading windows suppressed under [`NoiseWindowPolicy::LeadingWindows`].
const LEADING_WINDOW_COUNT: u64 = 2;

/// Removes background noise from an audio unit.
pub trait NoiseSuppressor: Send {
    fn suppress(&mut self, unit: &PcmUnit) -> Result<PcmUnit>;

    /// Drop adaptive state so the next request starts clean.
    fn reset(&mut self) {}
}

/// Builds a fresh suppressor for a new session.
pub type DenoiserFactory = Arc<dyn Fn() -> Box<dyn NoiseSuppressor> + Send + Sync>;

/// Which part of each unit is passed through the suppressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseWindowPolicy {
    /// Suppress `[0ms,10ms)` and `[10ms,20ms)` separately and keep only their concatenation
    LeadingWindows,
    /// Suppress the entire unit
    WholeUnit,
}

impl FromStr for NoiseWindowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "leading" => Ok(NoiseWindowPolicy::LeadingWindows),
            "whole" => Ok(NoiseWindowPolicy::WholeUnit),
            other => Err(anyhow!(
                "Unknown noise window policy '{}' (expected 'leading' or 'whole')",
                other
            )),
        }
    }
}

impl NoiseWindowPolicy {
    /// Run `suppressor` over `unit` according to this policy.
    pub fn apply(&self, suppressor: &mut dyn NoiseSuppressor, unit: &PcmUnit) -> Result<PcmUnit> {
        match self {
            NoiseWindowPolicy::WholeUnit => suppressor.suppress(unit),
            NoiseWindowPolicy::LeadingWindows => {
                let mut output = PcmUnit::default();
                for window in 0..LEADING_WINDOW_COUNT {
                    let start = window * LEADING_WINDOW_MS;
                    let slice = unit.slice_ms(start, start + LEADING_WINDOW_MS);
                    output.append(suppressor.suppress(&slice)?);
                }
                Ok(output)
            }
        }
    }
}

/// Three-point moving-average low-pass filter.
///
/// Not a real denoiser, but it takes the edge off hiss without touching the
/// speech band much, and it is stateless, which makes it a safe default engine.
#[derive(Debug, Default)]
pub struct MovingAverageDenoiser;

impl NoiseSuppressor for MovingAverageDenoiser {
    fn suppress(&mut self, unit: &PcmUnit) -> Result<PcmUnit> {
        let original = unit.samples();
        if original.len() < 3 {
            return Ok(unit.clone());
        }

        let mut filtered = original.to_vec();
        for i in 1..original.len() - 1 {
            let avg = (original[i - 1] as i32 + original[i] as i32 + original[i + 1] as i32) / 3;
            filtered[i] = avg as i16;
        }
        Ok(PcmUnit::new(filtered))
    }
}

/// Factory for the bundled filter.
pub fn moving_average_factory() -> DenoiserFactory {
    Arc::new(|| Box::new(MovingAverageDenoiser) as Box<dyn NoiseSuppressor>)
}
