// src/renderer/cpu.rs
//! Software reference backend
//!
//! Runs the same strategy functions the composed shader encodes, one ray per
//! pixel on the calling thread. Deterministic, so it is what the test suite
//! renders with.

use super::backend::{FrameBuffer, FrameInputs, FrameOutput, RenderBackend};
use super::raymarch::{march_ray, Field, MarchParams};
use super::MAX_BOUND_VOLUMES;
use crate::aggregation::ActiveVolume;
use crate::error::{Result, VolumeRenderError};
use crate::performance::FrameStats;
use crate::shader::{ComposedShader, ShaderVariant, ENTRY_POINT};
use crate::transfer_function::{Sampler, TransferFunctionTables};
use crate::volume::VolumeId;

/// A "compiled" CPU program: the variant it executes
#[derive(Debug, Clone)]
pub struct CpuProgram {
    key: String,
    variant: ShaderVariant,
}

impl CpuProgram {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn variant(&self) -> &ShaderVariant {
        &self.variant
    }
}

#[derive(Debug, Default)]
pub struct CpuBackend {
    volumes: Vec<ActiveVolume>,
    tables: Option<TransferFunctionTables>,
    compiled: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful compilations
    pub fn compiled_programs(&self) -> u64 {
        self.compiled
    }

    /// Identifiers of the bound volumes, in binding order
    pub fn bound_volumes(&self) -> Vec<VolumeId> {
        self.volumes.iter().map(|v| v.id).collect()
    }

    pub fn has_transfer_function(&self) -> bool {
        self.tables.is_some()
    }
}

impl RenderBackend for CpuBackend {
    type Program = CpuProgram;

    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(&mut self, shader: &ComposedShader, variant: &ShaderVariant) -> Result<CpuProgram> {
        let key = variant.key();
        if shader.key != key {
            return Err(VolumeRenderError::ShaderCompilation {
                label: shader.label.clone(),
                message: format!("shader was composed for {} but compiled for {}", shader.key, key),
            });
        }
        if !shader.source.contains(&format!("fn {}(", ENTRY_POINT)) {
            return Err(VolumeRenderError::ShaderCompilation {
                label: shader.label.clone(),
                message: format!("missing entry point `{}`", ENTRY_POINT),
            });
        }
        self.compiled += 1;
        log::debug!("Compiled CPU program {}", key);
        Ok(CpuProgram {
            key,
            variant: variant.clone(),
        })
    }

    fn bind_volumes(&mut self, volumes: &[ActiveVolume]) -> Result<()> {
        if volumes.len() > MAX_BOUND_VOLUMES {
            return Err(VolumeRenderError::TooManyVolumes {
                count: volumes.len(),
                max: MAX_BOUND_VOLUMES,
            });
        }
        let unchanged = self.volumes.len() == volumes.len()
            && self
                .volumes
                .iter()
                .zip(volumes)
                .all(|(a, b)| a.id == b.id && a.revision == b.revision);
        if !unchanged {
            log::debug!("Binding {} volume(s) on the CPU backend", volumes.len());
        }
        self.volumes = volumes.to_vec();
        Ok(())
    }

    fn upload_transfer_function(&mut self, tables: &TransferFunctionTables, sampler: Sampler) -> Result<()> {
        log::debug!("Uploading {}-entry {} transfer function", tables.size(), sampler.label());
        self.tables = Some(tables.clone());
        Ok(())
    }

    fn draw(&mut self, program: &CpuProgram, inputs: &FrameInputs<'_>) -> Result<FrameOutput> {
        let tables = self.tables.as_ref().ok_or_else(|| VolumeRenderError::NoRenderableState {
            reason: "no transfer function uploaded".into(),
        })?;
        let bound: Vec<VolumeId> = self.volumes.iter().map(|v| v.id).collect();
        if bound != program.variant.volumes {
            return Err(VolumeRenderError::NoRenderableState {
                reason: format!("program {} does not match the bound volumes", program.key),
            });
        }

        let field = Field::new(&self.volumes, &program.variant.aggregation)?;
        let params = MarchParams {
            step_size: inputs.settings.step_size,
            max_steps: inputs.settings.max_steps,
            interpreter: program.variant.interpreter,
            sampler: program.variant.sampler,
            tables,
            interpreter_params: inputs.interpreter_params,
        };

        let viewport = inputs.rays.viewport();
        let background = inputs.settings.background;
        let mut frame = FrameBuffer::filled(viewport.width, viewport.height, [0.0; 4]);
        let mut stats = FrameStats::default();

        for y in 0..viewport.height {
            for x in 0..viewport.width {
                let ray = inputs.rays.ray(x, y);
                let result = march_ray(&field, &ray, &params);
                let c = result.accumulator.resolve(background);
                frame.set(x, y, [c.x, c.y, c.z, c.w]);

                stats.rays += 1;
                stats.samples += u64::from(result.samples);
                stats.terminated_rays += u64::from(result.terminated);
            }
        }

        Ok(FrameOutput { frame, stats })
    }

    fn release(&mut self) {
        self.volumes.clear();
        self.tables = None;
    }
}
