// src/renderer/controller.rs
//! Cross-thread configuration handle
//!
//! The render thread owns the renderer and every GPU resource. Other threads
//! talk to it through a [`RenderController`]: each call validates what it can
//! locally and enqueues a [`RenderCommand`]. The renderer drains the whole
//! queue at the start of a frame, so one frame never sees half of a batch.

use crate::aggregation::AggregationConfig;
use crate::error::{Result, VolumeRenderError};
use crate::interpreter::VolumeInterpreter;
use crate::transfer_function::{ControlPoint, Sampler, TransferFunction};
use crate::volume::{Volume, VolumeId};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::sync::Arc;

use super::settings::RenderSettings;

/// A queued configuration change
#[derive(Debug)]
pub enum RenderCommand {
    SetVolumeInterpreter(VolumeInterpreter),
    SetIsoValue(f32),
    SetTransferFunctionSampler(Sampler),
    SetAggregationConfig(AggregationConfig),
    UpdateTransferFunction(Vec<ControlPoint>),
    SetRenderSettings(RenderSettings),
    AddVolume(VolumeId, Box<Volume>),
    ReplaceVolume(VolumeId, Box<Volume>),
    RemoveVolume(VolumeId),
}

/// State the renderer publishes for other threads
#[derive(Debug, Clone, Default)]
pub struct ControllerStatus {
    pub global_max_volume_value: f32,
    pub global_min_volume_value: f32,
    pub volume_count: usize,
    pub frames_rendered: u64,
    /// Most recent rejected command or configuration failure
    pub last_error: Option<VolumeRenderError>,
}

pub(crate) type SharedStatus = Arc<RwLock<ControllerStatus>>;

/// Cloneable, thread-safe handle for queueing configuration changes
#[derive(Debug, Clone)]
pub struct RenderController {
    commands: Sender<RenderCommand>,
    status: SharedStatus,
}

impl RenderController {
    pub(crate) fn new(commands: Sender<RenderCommand>, status: SharedStatus) -> Self {
        Self { commands, status }
    }

    pub fn set_volume_interpreter(&self, interpreter: VolumeInterpreter) -> Result<()> {
        self.send(RenderCommand::SetVolumeInterpreter(interpreter))
    }

    /// Queue an iso-value; it is clamped to `[0, global max]` when applied
    pub fn set_iso_value(&self, value: f32) -> Result<()> {
        self.send(RenderCommand::SetIsoValue(value))
    }

    pub fn set_transfer_function_sampler(&self, sampler: Sampler) -> Result<()> {
        self.send(RenderCommand::SetTransferFunctionSampler(sampler))
    }

    pub fn set_aggregation_config(&self, config: AggregationConfig) -> Result<()> {
        self.send(RenderCommand::SetAggregationConfig(config))
    }

    /// Queue a whole control-point table. Invalid tables are rejected here,
    /// before they reach the render thread.
    pub fn update_transfer_function(&self, points: Vec<ControlPoint>) -> Result<()> {
        TransferFunction::validate_points(&points)?;
        self.send(RenderCommand::UpdateTransferFunction(points))
    }

    pub fn set_render_settings(&self, settings: RenderSettings) -> Result<()> {
        settings.validate()?;
        self.send(RenderCommand::SetRenderSettings(settings))
    }

    pub fn add_volume(&self, id: VolumeId, volume: Volume) -> Result<()> {
        self.send(RenderCommand::AddVolume(id, Box::new(volume)))
    }

    pub fn replace_volume(&self, id: VolumeId, volume: Volume) -> Result<()> {
        self.send(RenderCommand::ReplaceVolume(id, Box::new(volume)))
    }

    pub fn remove_volume(&self, id: VolumeId) -> Result<()> {
        self.send(RenderCommand::RemoveVolume(id))
    }

    /// Snapshot of the renderer's published state
    pub fn status(&self) -> ControllerStatus {
        self.status.read().clone()
    }

    /// Global maximum as of the last applied volume change
    pub fn global_max_volume_value(&self) -> f32 {
        self.status.read().global_max_volume_value
    }

    fn send(&self, command: RenderCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VolumeRenderError::NoRenderableState {
                reason: "renderer has shut down".into(),
            })
    }
}
