// src/prelude.rs
//! # Volren Prelude
//!
//! Commonly used types in one import.
//!
//! ```rust
//! use volren::prelude::*;
//!
//! let mut renderer = volren::cpu_renderer()?;
//! renderer.set_volume_interpreter(VolumeInterpreter::IsoSurface);
//! renderer.set_transfer_function_sampler(Sampler::PreIntegrated);
//! # Ok::<(), VolumeRenderError>(())
//! ```

pub use crate::aggregation::{
    AggregationConfig, AggregationRule, AggregatorManager, ChannelSettings, CustomRule,
};
pub use crate::error::{Result, VolumeRenderError};
pub use crate::interpreter::VolumeInterpreter;
pub use crate::math::{Aabb, Ray, Rgba};
pub use crate::performance::{FrameMetrics, PerformanceMetrics};
pub use crate::renderer::{
    Camera, ControllerStatus, CpuBackend, FrameBuffer, FrameReport, MultiVolumeRenderer,
    Projection, RenderBackend, RenderController, RenderSettings, Viewport, WgpuBackend,
};
pub use crate::transfer_function::{ControlPoint, Sampler, TransferFunction};
pub use crate::volume::{Volume, VolumeData, VolumeDataEvent, VolumeId};
