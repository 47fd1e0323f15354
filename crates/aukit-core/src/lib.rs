//! # aukit-core
//!
//! Real-time execution core for Audio Unit style components.
//!
//! Control threads reconfigure a component (register render observers, set
//! parameter values, queue automation) while the render thread produces audio
//! without locks, allocation or blocking.
//!
//! ## Subsystems
//!
//! - [`DeferredRegistry`] - Lock-free observer list, changes applied once per render
//! - [`BufferList`] / [`AllocatedBuffer`] - Fixed-capacity buffer arena
//! - [`ParameterScopes`] / [`ParameterElement`] - Atomic parameter storage
//! - [`process_slices`] / [`AutomationScheduler`] - Sample-accurate automation slicing
//! - [`RenderCycle`] - Render-thread entry point wiring the above together
//!
//! ## Threads
//!
//! ```text
//! control threads                    render thread
//! ControlHandle ──(CAS stacks)──────► RenderCycle::render
//!               ──(atomic f32s)─────►   ├─ DeferredRegistry::apply
//!                                       ├─ InputSource::pull (per input bus)
//!                                       ├─ BufferList::prepare_buffer
//!                                       └─ process_slices → RenderKernel
//! ```

pub mod automation;
pub mod buffer;
pub mod error;
pub mod parameters;
pub mod registry;
pub mod render;
pub mod sample;
pub mod types;

// Re-exports for convenience
pub use automation::{
    process_slices, AutomationScheduler, EventKind, ParameterEvent, ParameterEventList,
    ScheduledEventTarget, DEFAULT_EVENT_CAPACITY,
};
pub use buffer::{
    AllocatedBuffer, BufferAllocator, BufferData, BufferList, ChannelBuffer, ExternalBuffer,
    HeapBufferAllocator, PointerState, MAX_BUFFERS,
};
pub use error::{status, AuError, AuResult};
pub use parameters::{AtomicF32, ParameterElement, ParameterScopes};
pub use registry::{DeferredRegistry, Registrar};
pub use render::{
    ControlHandle, Input, InputSource, ObserverHandle, RenderActionFlags, RenderConfig, RenderCycle, RenderKernel,
    RenderNotification, RenderObserver, SilentTimeout, SliceContext,
};
pub use sample::Sample;
pub use types::{
    ElementId, ParameterId, ParameterValue, Scope, StreamFormat, BUFFER_ALIGNMENT,
    DEFAULT_CHANNEL_COUNT, DEFAULT_MAX_FRAMES_PER_SLICE, DEFAULT_SAMPLE_RATE,
    MAX_BUFFER_LIST_SIZE,
};
