// src/transfer_function/sampler.rs
//! Transfer-function sampling strategies
//!
//! A [`Sampler`] is a stateless strategy: it reads the tables owned by a
//! [`TransferFunctionTables`](super::TransferFunctionTables) and never holds
//! data of its own, so it can be copied freely between the transfer function,
//! the renderer and the shader composer.

use super::TransferFunctionTables;
use crate::math::Rgba;

/// How a ray sample reads the transfer function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sampler {
    /// Point sample at the current intensity
    #[default]
    Regular,
    /// Mean color/opacity over the segment between the previous and the
    /// current ray sample. Reduces banding at coarse step sizes.
    PreIntegrated,
}

impl Sampler {
    /// Sample the tables.
    ///
    /// `previous` is the intensity of the preceding ray sample. The first
    /// sample of a ray has none and falls back to a point sample, as does a
    /// zero-length segment.
    pub fn sample(self, tables: &TransferFunctionTables, previous: Option<f32>, current: f32) -> Rgba {
        let x1 = tables.position(current);
        match (self, previous) {
            (Sampler::PreIntegrated, Some(previous)) => {
                tables.segment_between(tables.position(previous), x1)
            }
            _ => tables.regular_at(x1),
        }
    }

    /// Short identifier used in shader labels and logs
    pub fn label(self) -> &'static str {
        match self {
            Sampler::Regular => "regular",
            Sampler::PreIntegrated => "preintegrated",
        }
    }
}
