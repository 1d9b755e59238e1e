//! Error types for wear analysis with rich diagnostics.
//!
//! This module provides:
//! - Machine-readable error codes for programmatic handling
//! - Stage context, so a caller always knows which pipeline stage failed
//! - Terminal display via miette
//!
//! # Error Codes
//!
//! Each error has a unique code in the format `WEAR-XXXX`:
//! - `WEAR-1xxx`: Input mesh errors (malformed indices, empty or non-finite data)
//! - `WEAR-2xxx`: Sequencing errors (a stage invoked before its dependency)
//! - `WEAR-3xxx`: Numerical errors (singular systems, recovered internally)
//! - `WEAR-4xxx`: Parameter and configuration errors
//!
//! # Example
//!
//! ```
//! use cup_wear::{ErrorCode, WearError};
//!
//! let err = WearError::invalid_vertex_index(5, 100, 50);
//! assert_eq!(err.code(), ErrorCode::InvalidVertexIndex);
//! assert_eq!(err.code().as_str(), "WEAR-1002");
//! ```

use miette::Diagnostic;
use thiserror::Error;

use crate::pipeline::PipelineStage;

/// Result type alias for wear analysis operations.
pub type WearResult<T> = Result<T, WearError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Input mesh errors (1xxx)
    /// WEAR-1001: Mesh data is malformed or empty
    InvalidMesh = 1001,
    /// WEAR-1002: Face references a vertex that does not exist
    InvalidVertexIndex = 1002,

    // Sequencing errors (2xxx)
    /// WEAR-2001: Stage invoked before its dependency ran
    PreconditionViolation = 2001,

    // Numerical errors (3xxx)
    /// WEAR-3001: Non-invertible system during a fit
    NumericalSingularity = 3001,

    // Parameter errors (4xxx)
    /// WEAR-4001: Parameter outside its valid domain
    InvalidParameter = 4001,
    /// WEAR-4002: Configuration file could not be read or parsed
    Config = 4002,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `WEAR-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMesh => "WEAR-1001",
            ErrorCode::InvalidVertexIndex => "WEAR-1002",
            ErrorCode::PreconditionViolation => "WEAR-2001",
            ErrorCode::NumericalSingularity => "WEAR-3001",
            ErrorCode::InvalidParameter => "WEAR-4001",
            ErrorCode::Config => "WEAR-4002",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur during wear analysis.
#[derive(Debug, Error, Diagnostic)]
pub enum WearError {
    /// Mesh data is malformed (bad buffer lengths, non-finite values) or empty.
    #[error("invalid mesh: {details}")]
    #[diagnostic(
        code(wear::mesh::invalid),
        help("Check that the scan was exported as a single triangulated surface with finite coordinates.")
    )]
    InvalidMesh { details: String },

    /// Face references a vertex index that is out of range.
    #[error(
        "invalid vertex index: face {face_index} references vertex {vertex_index}, but mesh only has {vertex_count} vertices"
    )]
    #[diagnostic(
        code(wear::mesh::vertex_index),
        help("The index buffer does not match the position buffer; re-export the mesh.")
    )]
    InvalidVertexIndex {
        face_index: usize,
        vertex_index: u32,
        vertex_count: usize,
    },

    /// A pipeline stage was invoked before the stage it depends on.
    #[error("cannot run {stage}: {requirement}")]
    #[diagnostic(
        code(wear::pipeline::precondition),
        help("Run the stages in order, or use run_full_analysis().")
    )]
    PreconditionViolation {
        stage: PipelineStage,
        requirement: &'static str,
    },

    /// A linear system could not be solved directly.
    ///
    /// Fitting code recovers from this locally; it is never returned from the
    /// public fitting functions.
    #[error("singular system during {operation}")]
    #[diagnostic(code(wear::numeric::singular))]
    NumericalSingularity { operation: &'static str },

    /// Parameter outside its valid domain.
    #[error("invalid parameter {name} = {value}: {reason}")]
    #[diagnostic(
        code(wear::params::invalid),
        help("See AnalysisParams for the documented ranges.")
    )]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {details}")]
    #[diagnostic(code(wear::params::config))]
    Config { details: String },

    /// A fatal error annotated with the pipeline stage it came from.
    #[error("{stage} failed: {source}")]
    #[diagnostic(code(wear::pipeline::stage))]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<WearError>,
    },
}

impl WearError {
    /// Returns the machine-readable error code.
    ///
    /// Stage wrappers report the code of the underlying error.
    pub fn code(&self) -> ErrorCode {
        match self {
            WearError::InvalidMesh { .. } => ErrorCode::InvalidMesh,
            WearError::InvalidVertexIndex { .. } => ErrorCode::InvalidVertexIndex,
            WearError::PreconditionViolation { .. } => ErrorCode::PreconditionViolation,
            WearError::NumericalSingularity { .. } => ErrorCode::NumericalSingularity,
            WearError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            WearError::Config { .. } => ErrorCode::Config,
            WearError::Stage { source, .. } => source.code(),
        }
    }

    /// The pipeline stage this error was raised in, if known.
    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            WearError::Stage { stage, .. } => Some(*stage),
            WearError::PreconditionViolation { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether the error aborts the operation that raised it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.code(), ErrorCode::NumericalSingularity)
    }

    /// Wrap this error with the stage that produced it.
    ///
    /// Errors that already carry a stage are returned unchanged.
    pub fn in_stage(self, stage: PipelineStage) -> Self {
        match self {
            WearError::Stage { .. } | WearError::PreconditionViolation { .. } => self,
            other => WearError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Create an InvalidMesh error.
    pub fn invalid_mesh(details: impl Into<String>) -> Self {
        WearError::InvalidMesh {
            details: details.into(),
        }
    }

    /// Create an InvalidVertexIndex error.
    pub fn invalid_vertex_index(face_index: usize, vertex_index: u32, vertex_count: usize) -> Self {
        WearError::InvalidVertexIndex {
            face_index,
            vertex_index,
            vertex_count,
        }
    }

    /// Create a PreconditionViolation error.
    pub fn precondition(stage: PipelineStage, requirement: &'static str) -> Self {
        WearError::PreconditionViolation { stage, requirement }
    }

    /// Create a NumericalSingularity error.
    pub fn singular(operation: &'static str) -> Self {
        WearError::NumericalSingularity { operation }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: &'static str, value: f64, reason: &'static str) -> Self {
        WearError::InvalidParameter {
            name,
            value,
            reason,
        }
    }

    /// Create a Config error.
    pub fn config(details: impl Into<String>) -> Self {
        WearError::Config {
            details: details.into(),
        }
    }
}
