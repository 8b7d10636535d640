// src/shader/mod.rs
//! # Shader Composition
//!
//! The ray-marching shader is assembled from interchangeable WGSL fragments.
//! [`compose`] is a pure function of a [`ShaderVariant`]: the same variant
//! always yields the same source, and the variant key is what the renderer
//! compares to decide whether its current program is stale.

pub mod fragments;

use crate::aggregation::AggregationRule;
use crate::error::{Result, VolumeRenderError};
use crate::interpreter::VolumeInterpreter;
use crate::renderer::MAX_BOUND_VOLUMES;
use crate::transfer_function::Sampler;
use crate::volume::VolumeId;
use std::fmt::Write;

/// Binding index of the first volume texture
pub const FIRST_VOLUME_BINDING: u32 = 5;

/// Compute entry point of every composed shader
pub const ENTRY_POINT: &str = "main";

/// Workgroup edge length declared by the entry point
pub const WORKGROUP_SIZE: u32 = 8;

const AGGREGATION_FUNCTIONS: [&str; 3] = [
    "fn aggregate_init(",
    "fn aggregate_step(",
    "fn aggregate_finish(",
];

/// The structural inputs a shader program depends on
#[derive(Debug, Clone)]
pub struct ShaderVariant {
    pub interpreter: VolumeInterpreter,
    pub sampler: Sampler,
    pub aggregation: AggregationRule,
    /// Bound volumes in binding order
    pub volumes: Vec<VolumeId>,
}

impl ShaderVariant {
    /// Cache key; two variants with equal keys compose to identical programs
    pub fn key(&self) -> String {
        let ids: Vec<String> = self.volumes.iter().map(|id| id.0.to_string()).collect();
        format!(
            "{}/{}/{}/[{}]",
            self.interpreter.label(),
            self.sampler.label(),
            self.aggregation.key(),
            ids.join(",")
        )
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }
}

impl PartialEq for ShaderVariant {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

/// WGSL source for one variant
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedShader {
    pub key: String,
    pub label: String,
    pub source: String,
}

/// Assemble the ray-marching shader for a variant
pub fn compose(variant: &ShaderVariant) -> Result<ComposedShader> {
    let key = variant.key();
    let label = format!("raymarch {}", key);

    if variant.volume_count() > MAX_BOUND_VOLUMES {
        return Err(VolumeRenderError::TooManyVolumes {
            count: variant.volume_count(),
            max: MAX_BOUND_VOLUMES,
        });
    }

    let aggregation = variant.aggregation.wgsl();
    if let Some(missing) = AGGREGATION_FUNCTIONS
        .iter()
        .find(|signature| !aggregation.contains(*signature))
    {
        return Err(VolumeRenderError::ShaderCompilation {
            label,
            message: format!(
                "aggregation rule '{}' does not define `{}...)`",
                variant.aggregation.key(),
                missing
            ),
        });
    }

    let sampler = match variant.sampler {
        Sampler::Regular => fragments::SAMPLER_REGULAR,
        Sampler::PreIntegrated => fragments::SAMPLER_PREINTEGRATED,
    };
    let interpreter = match variant.interpreter {
        VolumeInterpreter::Transparent => fragments::INTERPRETER_TRANSPARENT,
        VolumeInterpreter::IsoSurface => fragments::INTERPRETER_ISOSURFACE,
    };

    let mut source = String::new();
    source.push_str(&format!("// {}\n", label));
    source.push_str(fragments::HEADER);
    source.push('\n');
    source.push_str(&aggregation);
    source.push_str(&field_source(variant.volume_count()));
    source.push_str(fragments::VOLUME_SAMPLING);
    source.push_str(fragments::TRANSFER_FUNCTION);
    source.push_str(sampler);
    source.push_str(interpreter);
    source.push_str(fragments::ENTRY_POINT);

    log::debug!("Composed shader {} ({} bytes)", key, source.len());
    Ok(ComposedShader { key, label, source })
}

/// Volume texture declarations and the aggregated `field_at` function.
///
/// `field_at` returns `(value, present)`; `present` is zero where no bound
/// volume covers the position.
fn field_source(count: usize) -> String {
    let mut out = String::new();
    for i in 0..count {
        let _ = writeln!(
            out,
            "@group(0) @binding({}) var volume_{}: texture_3d<f32>;",
            FIRST_VOLUME_BINDING + i as u32,
            i
        );
    }

    out.push_str("\nfn field_at(p: vec3<f32>) -> vec2<f32> {\n");
    out.push_str("    var acc = aggregate_init();\n");
    out.push_str("    var count = 0u;\n");
    for i in 0..count {
        let _ = write!(
            out,
            "    let local_{i} = to_voxel_space({i}u, p);\n    \
             if (inside_unit_cube(local_{i})) {{\n        \
             acc = aggregate_step(acc, trilinear(volume_{i}, local_{i}), volume_block.slots[{i}u].params.x);\n        \
             count = count + 1u;\n    }}\n"
        );
    }
    out.push_str("    if (count == 0u) {\n        return vec2<f32>(0.0, 0.0);\n    }\n");
    out.push_str("    return vec2<f32>(aggregate_finish(acc, count), 1.0);\n}\n");
    out
}
