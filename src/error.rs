// src/error.rs
//! Error types for the volume rendering core
//!
//! Every fallible operation in the crate returns [`Result`], which carries a
//! [`VolumeRenderError`]. Errors are raised at the mutation boundary so that the
//! renderer never observes a half-applied change.

use crate::volume::VolumeId;

/// Errors produced by the volume rendering core
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VolumeRenderError {
    #[error("Invalid transfer function: {reason}")]
    InvalidTransferFunction { reason: String },

    #[error("Invalid volume: {reason}")]
    InvalidVolume { reason: String },

    #[error("Volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("Volume already exists: {0}")]
    VolumeAlreadyExists(VolumeId),

    #[error("Too many bound volumes: {count} (maximum {max})")]
    TooManyVolumes { count: usize, max: usize },

    #[error("Shader compilation failed for {label}: {message}")]
    ShaderCompilation { label: String, message: String },

    #[error("No renderable state: {reason}")]
    NoRenderableState { reason: String },

    #[error("Invalid render settings: {field}")]
    InvalidSettings { field: String },

    #[error("GPU operation '{operation}' failed: {message}")]
    GpuOperation { operation: String, message: String },
}

impl VolumeRenderError {
    pub(crate) fn transfer_function(reason: impl Into<String>) -> Self {
        Self::InvalidTransferFunction {
            reason: reason.into(),
        }
    }

    pub(crate) fn volume(reason: impl Into<String>) -> Self {
        Self::InvalidVolume {
            reason: reason.into(),
        }
    }

    pub(crate) fn gpu(operation: &str, message: impl std::fmt::Display) -> Self {
        Self::GpuOperation {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error invalidates the structural configuration of a frame
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ShaderCompilation { .. } | Self::TooManyVolumes { .. }
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, VolumeRenderError>;
