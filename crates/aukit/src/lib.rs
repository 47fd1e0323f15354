//! # aukit
//!
//! Real-time execution core for Audio Unit style components.
//!
//! ## Architecture
//!
//! ```text
//! Your kernel (implements RenderKernel)
//!        ↓
//! RenderCycle<K> (render thread)
//!        ↑
//! ControlHandle (any thread)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use aukit::prelude::*;
//!
//! struct Silence;
//!
//! impl RenderKernel for Silence {
//!     fn render_slice(
//!         &mut self,
//!         context: &SliceContext<'_>,
//!         _parameters: &ParameterScopes,
//!         output: &mut BufferList,
//!     ) -> AuResult<()> {
//!         for channel in 0..output.len() {
//!             output.samples_mut::<f32>(channel)?[context.range()].fill(0.0);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut cycle = RenderCycle::new(RenderConfig::default(), ParameterScopes::new(), Silence);
//! cycle.initialize()?;
//! cycle.render(RenderActionFlags::empty(), 0.0, 0, 512)?;
//! # Ok::<(), AuError>(())
//! ```

// Re-export sub-crates
pub use aukit_core as core;

/// Prelude module for convenient imports.
///
/// ```rust
/// use aukit::prelude::*;
/// ```
pub mod prelude {
    pub use aukit_core::{
        // Errors
        AuError, AuResult,
        // Buffers
        BufferList, ExternalBuffer, PointerState, Sample,
        // Parameters and automation
        ParameterEvent, ParameterId, ParameterScopes, ParameterValue, Scope,
        // Rendering
        ControlHandle, Input, InputSource, ObserverHandle, RenderActionFlags, RenderConfig,
        RenderCycle,
        RenderKernel, RenderNotification, RenderObserver, SilentTimeout, SliceContext,
        // Formats
        StreamFormat,
    };
}
