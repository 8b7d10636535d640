// src/renderer/mod.rs
//! # Multi-Volume Renderer
//!
//! [`MultiVolumeRenderer`] owns the loaded volumes, the aggregation config,
//! the transfer function and the interpreter selection, and drives one
//! [`RenderBackend`] through the per-frame sequence:
//!
//! 1. drain queued [`RenderCommand`]s and resolve the bound volumes
//! 2. rebuild the program if the structural configuration changed, and
//!    re-upload the transfer function if its revision changed
//! 3. march one ray per pixel through the combined bounds
//! 4. return the pixels in a [`FrameReport`]
//!
//! Setters never touch the backend. They only change the inputs the next
//! frame's [`ShaderVariant`] is computed from, so the variant key comparison
//! in step 2 is the single place where programs are invalidated.
//!
//! ## Usage
//!
//! ```
//! use volren::prelude::*;
//! use cgmath::{InnerSpace, Matrix4, SquareMatrix, Vector3};
//!
//! let mut renderer = MultiVolumeRenderer::new(CpuBackend::new(), RenderSettings::default())?;
//! let volume = Volume::from_fn("ball", [16, 16, 16], Matrix4::identity(), |p| {
//!     1.0 - (p - Vector3::new(0.5, 0.5, 0.5)).magnitude()
//! })?;
//! renderer.add_volume(VolumeId(0), volume)?;
//!
//! let camera = Camera::perspective(Vector3::new(0.5, 0.5, 3.0), Vector3::new(0.5, 0.5, 0.5));
//! let report = renderer.render_frame(&camera, Viewport::new(8, 8))?;
//! assert!(report.rebuilt);
//! # Ok::<(), volren::VolumeRenderError>(())
//! ```

pub mod backend;
pub mod camera;
pub mod controller;
pub mod cpu;
pub mod gpu;
pub mod raymarch;
pub mod settings;

pub use backend::{FrameBuffer, FrameInputs, FrameOutput, RenderBackend};
pub use camera::{Camera, Projection, RayGenerator, Viewport};
pub use controller::{ControllerStatus, RenderCommand, RenderController};
pub use cpu::{CpuBackend, CpuProgram};
pub use gpu::{WgpuBackend, WgpuProgram};
pub use settings::RenderSettings;

use crate::aggregation::{ActiveVolume, AggregationConfig, AggregatorManager};
use crate::error::{Result, VolumeRenderError};
use crate::interpreter::{InterpreterParams, VolumeInterpreter};
use crate::performance::{FrameMetrics, PerformanceMetrics, PerformanceMonitor};
use crate::shader::{compose, ShaderVariant};
use crate::transfer_function::{ControlPoint, Sampler, TransferFunction};
use crate::volume::{ListenerId, Volume, VolumeDataEvent, VolumeDataManager, VolumeId};
use cgmath::Vector4;
use controller::SharedStatus;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

/// Volumes a single program can bind
pub const MAX_BOUND_VOLUMES: usize = 4;

/// Resources valid for one structural configuration
pub struct RenderSession<P> {
    program: P,
    variant: ShaderVariant,
    key: String,
    bound: Vec<ActiveVolume>,
    tf_revision: Option<u64>,
}

impl<P> RenderSession<P> {
    pub fn program(&self) -> &P {
        &self.program
    }

    pub fn variant(&self) -> &ShaderVariant {
        &self.variant
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifiers of the volumes the program was built for
    pub fn bound_volumes(&self) -> Vec<VolumeId> {
        self.bound.iter().map(|v| v.id).collect()
    }
}

/// Everything a frame produced
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: FrameBuffer,
    /// A new program was built for this frame
    pub rebuilt: bool,
    /// Set when the requested configuration failed and the last good program drew the frame
    pub config_error: Option<VolumeRenderError>,
    pub metrics: FrameMetrics,
    /// Key of the program that drew the frame
    pub program_key: String,
}

/// Per-frame orchestration of the volume-rendering pipeline
pub struct MultiVolumeRenderer<B: RenderBackend> {
    backend: B,
    settings: RenderSettings,
    data: VolumeDataManager,
    aggregator: AggregatorManager,
    transfer_function: TransferFunction,
    interpreter: VolumeInterpreter,
    iso_value: f32,
    session: Option<RenderSession<B::Program>>,
    /// Last variant that failed to build, so it is not retried every frame
    failed: Option<(String, VolumeRenderError)>,
    commands: Receiver<RenderCommand>,
    command_sender: Sender<RenderCommand>,
    status: SharedStatus,
    monitor: PerformanceMonitor,
}

impl<B: RenderBackend> MultiVolumeRenderer<B> {
    /// Create a renderer with no volumes and a linear ramp over `[0, 1]`
    ///
    /// # Arguments
    /// * `backend` - Executes the composed programs
    /// * `settings` - Initial ray-marching parameters
    pub fn new(backend: B, settings: RenderSettings) -> Result<Self> {
        settings.validate()?;
        let transfer_function = TransferFunction::with_table_size(
            vec![
                ControlPoint::new(0.0, Vector4::new(0.0, 0.0, 0.0, 0.0)),
                ControlPoint::new(1.0, Vector4::new(1.0, 1.0, 1.0, 1.0)),
            ],
            settings.table_size,
        )?;

        let status: SharedStatus = Arc::new(RwLock::new(Default::default()));
        let mut data = VolumeDataManager::new();
        let published = status.clone();
        data.add_listener(move |event| {
            published.write().global_max_volume_value = event.global_max_volume_value;
        });

        let (command_sender, commands) = crossbeam_channel::unbounded();
        log::info!("Volume renderer created on the {} backend", backend.name());

        Ok(Self {
            backend,
            settings,
            data,
            aggregator: AggregatorManager::default(),
            transfer_function,
            interpreter: VolumeInterpreter::default(),
            iso_value: settings.iso_value,
            session: None,
            failed: None,
            commands,
            command_sender,
            status,
            monitor: PerformanceMonitor::new(),
        })
    }

    /// Handle for queueing configuration changes from other threads
    pub fn controller(&self) -> RenderController {
        RenderController::new(self.command_sender.clone(), self.status.clone())
    }

    pub fn set_volume_interpreter(&mut self, interpreter: VolumeInterpreter) {
        if self.interpreter != interpreter {
            log::debug!("Interpreter set to {}", interpreter.label());
            self.interpreter = interpreter;
        }
    }

    pub fn interpreter(&self) -> VolumeInterpreter {
        self.interpreter
    }

    /// Set the iso-value, clamped to `[0, global max]`. Returns the stored value.
    pub fn set_iso_value(&mut self, value: f32) -> f32 {
        let clamped = self.clamp_iso(value);
        if clamped != value {
            log::warn!("Iso-value {} clamped to {}", value, clamped);
        }
        self.iso_value = clamped;
        clamped
    }

    /// Iso-value the next frame uses
    pub fn iso_value(&self) -> f32 {
        self.clamp_iso(self.iso_value)
    }

    pub fn set_transfer_function_sampler(&mut self, sampler: Sampler) {
        if self.transfer_function.set_sampler(sampler) {
            log::debug!("Transfer function sampler set to {}", sampler.label());
        }
    }

    pub fn set_aggregation_config(&mut self, config: AggregationConfig) -> Result<()> {
        self.aggregator.set_config(config)?;
        self.aggregator.sync_with(&self.data);
        Ok(())
    }

    /// Include or exclude one loaded volume from the aggregate
    pub fn set_volume_enabled(&mut self, id: VolumeId, enabled: bool) -> Result<()> {
        self.aggregator.set_enabled(id, enabled)
    }

    pub fn set_volume_weight(&mut self, id: VolumeId, weight: f32) -> Result<()> {
        self.aggregator.set_weight(id, weight)
    }

    /// Replace the transfer function's control points; rejected tables leave the current one active
    pub fn update_transfer_function(&mut self, points: Vec<ControlPoint>) -> Result<()> {
        self.transfer_function.update_control_points(points)
    }

    pub fn set_settings(&mut self, settings: RenderSettings) -> Result<()> {
        settings.validate()?;
        self.transfer_function.resize_table(settings.table_size)?;
        self.settings = settings;
        Ok(())
    }

    pub fn add_volume(&mut self, id: VolumeId, volume: Volume) -> Result<()> {
        self.data.add_volume(id, volume)?;
        self.after_volume_change();
        Ok(())
    }

    pub fn replace_volume(&mut self, id: VolumeId, volume: Volume) -> Result<()> {
        self.data.replace_volume(id, volume)?;
        self.after_volume_change();
        Ok(())
    }

    pub fn remove_volume(&mut self, id: VolumeId) -> Result<Arc<Volume>> {
        let volume = self.data.remove_volume(id)?;
        self.after_volume_change();
        Ok(volume)
    }

    /// Register a callback for volume add/replace/remove events
    pub fn add_volume_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&VolumeDataEvent) + Send + Sync + 'static,
    {
        self.data.add_listener(listener)
    }

    pub fn remove_volume_listener(&mut self, id: ListenerId) -> bool {
        self.data.remove_listener(id)
    }

    pub fn subscribe_volume_events(&mut self) -> Receiver<VolumeDataEvent> {
        self.data.subscribe()
    }

    pub fn volumes(&self) -> &VolumeDataManager {
        &self.data
    }

    pub fn aggregator(&self) -> &AggregatorManager {
        &self.aggregator
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.transfer_function
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn session(&self) -> Option<&RenderSession<B::Program>> {
        self.session.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        self.monitor.get_metrics()
    }

    /// Render one frame with the latest configuration.
    ///
    /// Queued commands are applied first. If the structural configuration
    /// changed, the program is rebuilt before drawing; when that fails the
    /// previous program and its volume set draw the frame and the failure is
    /// reported in [`FrameReport::config_error`].
    pub fn render_frame(&mut self, camera: &Camera, viewport: Viewport) -> Result<FrameReport> {
        self.monitor.begin_frame();
        self.drain_commands();
        let rays = camera.ray_generator(viewport)?;

        let active = self.aggregator.active_volumes(&self.data);
        let variant = ShaderVariant {
            interpreter: self.interpreter,
            sampler: self.transfer_function.sampler(),
            aggregation: self.aggregator.rule().clone(),
            volumes: active.iter().map(|v| v.id).collect(),
        };
        let key = variant.key();

        let mut rebuilt = false;
        let mut config_error = None;
        let current = self.session.as_ref().is_some_and(|s| s.key == key);
        if current {
            if let Some(session) = self.session.as_mut() {
                session.bound = active;
            }
        } else {
            match self.rebuild(variant, key, active) {
                Ok(session) => {
                    self.session = Some(session);
                    rebuilt = true;
                }
                Err(err) => config_error = Some(err),
            }
        }

        let iso_value = self.iso_value();
        let iso_color = self.transfer_function.lookup(iso_value);
        let interpreter_params = InterpreterParams {
            iso_value,
            iso_color: Vector4::new(iso_color.x, iso_color.y, iso_color.z, 1.0),
            termination_threshold: self.settings.effective_threshold(),
        };

        let Some(session) = self.session.as_mut() else {
            let reason = match &config_error {
                Some(err) => format!("no program has been built: {}", err),
                None => "no program has been built".to_string(),
            };
            let err = VolumeRenderError::NoRenderableState { reason };
            self.status.write().last_error = Some(err.clone());
            return Err(err);
        };
        if let Some(err) = &config_error {
            log::warn!("Drawing with last good program {}: {}", session.key, err);
        }

        self.backend.bind_volumes(&session.bound)?;
        let revision = self.transfer_function.revision();
        if session.tf_revision != Some(revision) {
            self.backend
                .upload_transfer_function(self.transfer_function.tables(), session.variant.sampler)?;
            session.tf_revision = Some(revision);
        }

        let inputs = FrameInputs {
            rays: &rays,
            settings: &self.settings,
            interpreter_params,
        };
        let output = self.backend.draw(&session.program, &inputs)?;
        let program_key = session.key.clone();

        let metrics = self.monitor.end_frame(output.stats, rebuilt);
        {
            let mut status = self.status.write();
            status.frames_rendered += 1;
            if config_error.is_some() {
                status.last_error = config_error.clone();
            }
        }

        Ok(FrameReport {
            frame: output.frame,
            rebuilt,
            config_error,
            metrics,
            program_key,
        })
    }

    /// Release the session and every backend resource
    pub fn shutdown(&mut self) {
        if self.session.take().is_some() {
            log::info!("Render session released ({})", self.monitor.summary());
        }
        self.failed = None;
        self.backend.release();
    }

    fn rebuild(
        &mut self,
        variant: ShaderVariant,
        key: String,
        active: Vec<ActiveVolume>,
    ) -> Result<RenderSession<B::Program>> {
        if let Some((failed_key, err)) = &self.failed {
            if *failed_key == key {
                return Err(err.clone());
            }
        }

        let built = compose(&variant).and_then(|shader| self.backend.compile(&shader, &variant));
        match built {
            Ok(program) => {
                log::info!("Render session {} ready", key);
                self.failed = None;
                Ok(RenderSession {
                    program,
                    variant,
                    key,
                    bound: active,
                    tf_revision: None,
                })
            }
            Err(err) => {
                log::error!("Failed to build program {}: {}", key, err);
                self.failed = Some((key, err.clone()));
                Err(err)
            }
        }
    }

    fn drain_commands(&mut self) {
        let commands: Vec<RenderCommand> = self.commands.try_iter().collect();
        if commands.is_empty() {
            return;
        }
        log::debug!("Applying {} queued command(s)", commands.len());
        for command in commands {
            if let Err(err) = self.apply(command) {
                log::warn!("Rejected queued command: {}", err);
                self.status.write().last_error = Some(err);
            }
        }
    }

    fn apply(&mut self, command: RenderCommand) -> Result<()> {
        match command {
            RenderCommand::SetVolumeInterpreter(interpreter) => self.set_volume_interpreter(interpreter),
            RenderCommand::SetIsoValue(value) => {
                self.set_iso_value(value);
            }
            RenderCommand::SetTransferFunctionSampler(sampler) => self.set_transfer_function_sampler(sampler),
            RenderCommand::SetAggregationConfig(config) => self.set_aggregation_config(config)?,
            RenderCommand::UpdateTransferFunction(points) => self.update_transfer_function(points)?,
            RenderCommand::SetRenderSettings(settings) => self.set_settings(settings)?,
            RenderCommand::AddVolume(id, volume) => self.add_volume(id, *volume)?,
            RenderCommand::ReplaceVolume(id, volume) => self.replace_volume(id, *volume)?,
            RenderCommand::RemoveVolume(id) => {
                self.remove_volume(id)?;
            }
        }
        Ok(())
    }

    fn after_volume_change(&mut self) {
        self.aggregator.sync_with(&self.data);
        let mut status = self.status.write();
        status.global_min_volume_value = self.data.global_min_volume_value();
        status.volume_count = self.data.len();
    }

    fn clamp_iso(&self, value: f32) -> f32 {
        let hi = self.data.global_max_volume_value().max(0.0);
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, hi)
        }
    }
}
