// src/error.rs
//! Error handling for the whole orchestrator.
//!
//! Every failure the frame loop can observe maps onto one [`RenderError`]
//! variant. Only [`RenderError::ContextLost`] is recovered globally (device
//! teardown and rebuild); everything else is recovered locally by skipping the
//! mesh or draw that produced it.

use std::fmt;
use thiserror::Error;

/// Main error type. Cheap to clone so per-mesh failures can be recorded
/// into stats and logged without giving up ownership.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RenderError {
    /// Buffer/texture creation failed; the device is likely out of memory,
    /// or the pool ceiling would be exceeded.
    #[error("allocation of {size} bytes for `{label}` failed: {reason}")]
    AllocationFailure {
        label: String,
        size: u64,
        reason: String,
    },

    /// Shader module or pipeline creation failed.
    #[error("pipeline `{label}` failed to compile: {diagnostics}")]
    PipelineCompileFailure { label: String, diagnostics: String },

    /// The device was invalidated. Triggers full recovery.
    #[error("GPU device lost: {reason}")]
    ContextLost { reason: String },

    /// Operation on a destroyed or never-created resource.
    #[error("invalid {kind} handle #{id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// A fixed per-frame budget ran out.
    #[error("{what} capacity exceeded (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: u64 },

    /// Swapchain image could not be acquired (outdated, lost, timed out).
    #[error("surface unavailable: {reason}")]
    SurfaceUnavailable { reason: String },

    /// Geometry descriptor is internally inconsistent.
    #[error("geometry #{geometry} is malformed: {reason}")]
    InvalidGeometry { geometry: u64, reason: String },

    /// Environment cubemap or BRDF data is malformed.
    #[error("environment map #{environment} is malformed: {reason}")]
    InvalidEnvironment { environment: u64, reason: String },

    /// Configuration rejected by validation or parsing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<RenderError>,
    },
}

/// Coarse classification used for stats and skip accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Allocation,
    PipelineCompile,
    ContextLost,
    InvalidHandle,
    CapacityExceeded,
    Surface,
    InvalidInput,
    Other,
}

impl RenderError {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    /// Add context to any error (chainable).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    #[inline]
    pub fn allocation(label: impl Into<String>, size: u64, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            label: label.into(),
            size,
            reason: reason.into(),
        }
    }

    #[inline]
    pub fn context_lost(reason: impl Into<String>) -> Self {
        Self::ContextLost {
            reason: reason.into(),
        }
    }

    /// Strips `WithContext` layers and returns the innermost error.
    pub fn root(&self) -> &RenderError {
        let mut err = self;
        while let RenderError::WithContext { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            RenderError::AllocationFailure { .. } => ErrorKind::Allocation,
            RenderError::PipelineCompileFailure { .. } => ErrorKind::PipelineCompile,
            RenderError::ContextLost { .. } => ErrorKind::ContextLost,
            RenderError::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            RenderError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            RenderError::SurfaceUnavailable { .. } => ErrorKind::Surface,
            RenderError::InvalidGeometry { .. } | RenderError::InvalidEnvironment { .. } => {
                ErrorKind::InvalidInput
            }
            _ => ErrorKind::Other,
        }
    }

    #[inline]
    pub fn is_context_lost(&self) -> bool {
        self.kind() == ErrorKind::ContextLost
    }

    #[inline]
    pub fn is_allocation_failure(&self) -> bool {
        self.kind() == ErrorKind::Allocation
    }

    #[inline]
    pub fn is_invalid_handle(&self) -> bool {
        self.kind() == ErrorKind::InvalidHandle
    }

    #[inline]
    pub fn is_capacity_exceeded(&self) -> bool {
        self.kind() == ErrorKind::CapacityExceeded
    }

    /// Short remedy hint appended to per-mesh warnings.
    pub fn remedy(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Allocation => "raise the buffer pool memory ceiling or reduce scene geometry",
            ErrorKind::PipelineCompile => "check the material's shader source against its vertex layout",
            ErrorKind::ContextLost => "the renderer will rebuild all GPU state on the next frame",
            ErrorKind::InvalidHandle => "a resource was used after destruction; caches may be stale",
            ErrorKind::CapacityExceeded => "raise max_draws_per_frame or reduce visible meshes",
            ErrorKind::Surface => "the surface will be reconfigured on the next frame",
            ErrorKind::InvalidInput => "fix the source asset data",
            ErrorKind::Other => "see the error message",
        }
    }
}

/// Crate `Result` alias; use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sees_through_context() {
        let err = RenderError::context_lost("driver reset").context("while uploading geometry");
        assert!(err.is_context_lost());
        assert_eq!(err.kind(), ErrorKind::ContextLost);
        assert!(err.to_string().contains("while uploading geometry"));
    }

    #[test]
    fn allocation_message_names_parameters() {
        let err = RenderError::allocation("geometry:7:position", 4096, "out of memory");
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("geometry:7:position"));
        assert!(err.is_allocation_failure());
    }
}
