//! Error types for the real-time core.
//!
//! Every error carries a small integer status code (see [`AuError::status`])
//! so the render cycle can hand it to a host verbatim. Codes follow the Audio
//! Unit `OSStatus` values where one exists.

use thiserror::Error;

use crate::types::{ParameterId, Scope};

/// Status codes returned by [`AuError::status`].
pub mod status {
    /// No error.
    pub const NO_ERR: i32 = 0;

    /// Unspecified failure (prepare request exceeds the reserved extent).
    pub const UNSPECIFIED: i32 = -1;

    /// Generic parameter error (e.g. too many buffers requested).
    pub const PARAM_ERR: i32 = -50;

    /// Memory could not be reserved.
    pub const MEM_FULL: i32 = -108;

    /// Invalid parameter.
    pub const INVALID_PARAMETER: i32 = -10878;

    /// Invalid element.
    pub const INVALID_ELEMENT: i32 = -10877;

    /// No input connection.
    pub const NO_CONNECTION: i32 = -10876;

    /// Too many frames to process.
    pub const TOO_MANY_FRAMES_TO_PROCESS: i32 = -10874;

    /// Format not supported.
    pub const FORMAT_NOT_SUPPORTED: i32 = -10868;

    /// Uninitialized.
    pub const UNINITIALIZED: i32 = -10867;

    /// Cannot do in current context.
    pub const CANNOT_DO_IN_CURRENT_CONTEXT: i32 = -10863;
}

/// Errors reported by the real-time core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuError {
    /// A render or prepare request asked for more frames than were reserved.
    #[error("too many frames to process: requested {requested}, maximum {maximum}")]
    TooManyFrames { requested: u32, maximum: u32 },

    /// More channel streams were requested than the buffer was allocated for.
    #[error("format not supported: {requested} channel streams, {allocated} allocated")]
    FormatNotSupported { requested: u32, allocated: u32 },

    /// A prepare request does not fit the reserved buffer capacity.
    #[error("insufficient buffer capacity: {requested} bytes requested, {capacity} available")]
    InsufficientCapacity { requested: u64, capacity: u64 },

    /// The buffer list would exceed the maximum header size.
    #[error("too many buffers: {requested} requested, at most {maximum} supported")]
    TooManyBuffers { requested: u32, maximum: u32 },

    /// Storage could not be reserved, or its size overflows a 32-bit byte count.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The parameter ID is not defined on the addressed element.
    #[error("invalid parameter ID {0}")]
    InvalidParameter(ParameterId),

    /// The addressed scope/element pair does not exist.
    #[error("invalid element {element} in {scope:?} scope")]
    InvalidElement { scope: Scope, element: u32 },

    /// A buffer view was read before preparation or after invalidation.
    #[error("buffer list is not prepared")]
    InvalidBufferState,

    /// An input bus was read with nothing connected to it.
    #[error("no input connected to bus {0}")]
    NoConnection(u32),

    /// Rendering was requested before initialization.
    #[error("render cycle is not initialized")]
    Uninitialized,

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot do in current context: {0}")]
    InvalidState(&'static str),

    /// A slice renderer reported a failure; the code is propagated verbatim.
    #[error("slice renderer failed with status {0}")]
    Render(i32),
}

impl AuError {
    /// Integer status code for this error.
    pub fn status(&self) -> i32 {
        match self {
            Self::TooManyFrames { .. } => status::TOO_MANY_FRAMES_TO_PROCESS,
            Self::FormatNotSupported { .. } => status::FORMAT_NOT_SUPPORTED,
            Self::InsufficientCapacity { .. } => status::UNSPECIFIED,
            Self::TooManyBuffers { .. } => status::PARAM_ERR,
            Self::OutOfMemory(_) => status::MEM_FULL,
            Self::InvalidParameter(_) => status::INVALID_PARAMETER,
            Self::InvalidElement { .. } => status::INVALID_ELEMENT,
            Self::InvalidBufferState | Self::InvalidState(_) => {
                status::CANNOT_DO_IN_CURRENT_CONTEXT
            }
            Self::NoConnection(_) => status::NO_CONNECTION,
            Self::Uninitialized => status::UNINITIALIZED,
            Self::Render(code) => *code,
        }
    }
}

/// Result type alias for core operations.
pub type AuResult<T> = Result<T, AuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct() {
        let errors = [
            AuError::TooManyFrames { requested: 2048, maximum: 1156 },
            AuError::OutOfMemory("overflow".into()),
            AuError::InvalidParameter(7),
            AuError::NoConnection(0),
            AuError::Render(-4),
        ];
        let codes: Vec<i32> = errors.iter().map(AuError::status).collect();
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b, "status codes must distinguish error kinds");
            }
        }
    }

    #[test]
    fn test_render_status_is_verbatim() {
        assert_eq!(AuError::Render(1234).status(), 1234);
        assert_eq!(AuError::Render(-10879).status(), -10879);
    }

    #[test]
    fn test_display() {
        let err = AuError::InvalidParameter(42);
        assert_eq!(err.to_string(), "invalid parameter ID 42");
    }
}
