//! Render cycle: the render-thread entry point.
//!
//! [`RenderCycle`] ties the core together. Each [`render`](RenderCycle::render)
//! call:
//!
//! 1. checks the lifecycle state and the frame ceiling
//! 2. applies pending observer changes ([`DeferredRegistry::apply`])
//! 3. notifies observers with [`RenderActionFlags::PRE_RENDER`]
//! 4. pulls every connected input bus: null buffers for an
//!    [`Input::Connection`], arena buffers for an [`Input::Callback`]
//! 5. prepares the output [`BufferList`], copying input bus 0 into it when
//!    processing in place
//! 6. runs the [`RenderKernel`], sliced at automation boundaries when events
//!    are queued
//! 7. notifies observers with [`RenderActionFlags::POST_RENDER`] (plus
//!    [`POST_RENDER_ERROR`](RenderActionFlags::POST_RENDER_ERROR) on failure)
//! 8. invalidates the input buffers and clears the block's events
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --[initialize]--> Initialized --[render]*
//!       ^                               |
//!       +---------[uninitialize]--------+
//! ```
//!
//! Control threads never touch the cycle directly. They use a
//! [`ControlHandle`] for observers and parameter values.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::automation::{
    AutomationScheduler, ParameterEvent, ParameterEventList, DEFAULT_EVENT_CAPACITY,
};
use crate::buffer::BufferList;
use crate::error::{AuError, AuResult};
use crate::parameters::ParameterScopes;
use crate::registry::{DeferredRegistry, Registrar};
use crate::types::{
    ElementId, ParameterId, ParameterValue, Scope, StreamFormat, DEFAULT_MAX_FRAMES_PER_SLICE,
};

/// Minimum interval between repeated frame-ceiling error logs.
const CEILING_LOG_INTERVAL: Duration = Duration::from_secs(1);

bitflags::bitflags! {
    /// Render action flags, with Core Audio's bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderActionFlags: u32 {
        /// Observers are called before the kernel runs.
        const PRE_RENDER = 1 << 2;
        /// Observers are called after the kernel ran.
        const POST_RENDER = 1 << 3;
        /// The output buffers contain only silence.
        const OUTPUT_IS_SILENCE = 1 << 4;
        /// The caller vouches for the render arguments.
        const DO_NOT_CHECK_RENDER_ARGS = 1 << 7;
        /// Set with `POST_RENDER` when rendering failed.
        const POST_RENDER_ERROR = 1 << 8;
    }
}

// =============================================================================
// Observers
// =============================================================================

/// What observers see around each render call.
#[derive(Clone, Copy)]
pub struct RenderNotification<'a> {
    pub flags: RenderActionFlags,
    pub sample_time: f64,
    pub bus: u32,
    pub frames: u32,
    /// The output buffers. Unprepared (invalid) before the first render.
    pub buffers: &'a BufferList,
}

/// Callback invoked on the render thread before and after each render call.
///
/// Implementations must be real-time safe: no locks, no allocation.
pub trait RenderObserver: Send + Sync {
    fn notify(&self, notification: &RenderNotification<'_>);
}

/// Shared observer reference, compared by identity.
#[derive(Clone)]
pub struct ObserverHandle(Arc<dyn RenderObserver>);

impl ObserverHandle {
    pub fn new<O: RenderObserver + 'static>(observer: O) -> Self {
        Self(Arc::new(observer))
    }

    pub fn from_arc(observer: Arc<dyn RenderObserver>) -> Self {
        Self(observer)
    }

    #[inline]
    pub fn notify(&self, notification: &RenderNotification<'_>) {
        self.0.notify(notification);
    }
}

impl PartialEq for ObserverHandle {
    fn eq(&self, other: &Self) -> bool {
        // Data pointer only; vtable pointers may differ across codegen units
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl Eq for ObserverHandle {}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ObserverHandle")
            .field(&(Arc::as_ptr(&self.0) as *const ()))
            .finish()
    }
}

// =============================================================================
// Kernel
// =============================================================================

/// One slice of the current render call, with its inputs and automation.
#[derive(Debug, Clone, Copy)]
pub struct SliceContext<'a> {
    /// First frame of the slice within the output buffers.
    pub start: u32,
    /// Number of frames in the slice.
    pub frames: u32,
    /// Sample time of the slice's first frame.
    pub sample_time: f64,
    /// Flags of the render call.
    pub flags: RenderActionFlags,
    events: &'a ParameterEventList,
    inputs: &'a [InputBus],
}

impl<'a> SliceContext<'a> {
    /// Frame range of the slice, for indexing channel sample slices.
    #[inline]
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..(self.start + self.frames) as usize
    }

    /// Ramps still moving within this slice.
    ///
    /// The parameter store holds each ramp's value at the slice start. To
    /// follow a ramp sample by sample, evaluate
    /// [`value_at`](ParameterEvent::value_at) for each frame of [`range`](Self::range).
    pub fn ramps(&self) -> impl Iterator<Item = &'a ParameterEvent> + 'a {
        let (start, end) = (self.start, self.start + self.frames);
        self.events
            .iter()
            .filter(move |event| event.is_ramping_in(start, end))
    }

    /// Number of input buses.
    #[inline]
    pub fn input_count(&self) -> u32 {
        self.inputs.len() as u32
    }

    /// Buffers pulled from input bus `bus` for this render call.
    ///
    /// Covers the whole render call; index with [`range`](Self::range).
    pub fn input(&self, bus: u32) -> AuResult<&'a BufferList> {
        let input = self.inputs.get(bus as usize).ok_or(AuError::InvalidElement {
            scope: Scope::Input,
            element: bus,
        })?;
        if !input.is_connected() {
            return Err(AuError::NoConnection(bus));
        }
        Ok(&input.buffers)
    }
}

/// The signal processing run by a [`RenderCycle`].
pub trait RenderKernel: Send {
    /// Render frames `context.range()` of `output`.
    ///
    /// Parameter values are constant for the whole slice. Returning an error
    /// stops the render call; earlier slices stay rendered.
    fn render_slice(
        &mut self,
        context: &SliceContext<'_>,
        parameters: &ParameterScopes,
        output: &mut BufferList,
    ) -> AuResult<()>;

    /// Clear internal state (filters, tails). Called on initialize.
    fn reset(&mut self) {}

    /// Whether the last render call produced only silence.
    fn output_is_silence(&self) -> bool {
        false
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// Supplies audio to an input bus on every render call.
pub trait InputSource: Send {
    /// Provide `frames` frames for input bus `bus`.
    ///
    /// For an [`Input::Callback`] the buffers are already prepared in the
    /// bus's arena and only need writing. For an [`Input::Connection`] they
    /// are prepared with null data; the source installs its own memory with
    /// [`BufferList::set_buffer_list`] or [`BufferList::set_buffer`], and that
    /// memory must stay valid and untouched until the render call returns.
    fn pull(
        &mut self,
        flags: RenderActionFlags,
        sample_time: f64,
        bus: u32,
        frames: u32,
        buffers: &mut BufferList,
    ) -> AuResult<()>;
}

/// Where an input bus gets its audio.
pub enum Input {
    /// An upstream renderer that supplies its own buffers.
    Connection(Box<dyn InputSource>),
    /// A callback that renders into the bus's own buffers.
    Callback(Box<dyn InputSource>),
}

impl Input {
    pub fn connection<S: InputSource + 'static>(source: S) -> Self {
        Self::Connection(Box::new(source))
    }

    pub fn callback<S: InputSource + 'static>(source: S) -> Self {
        Self::Callback(Box::new(source))
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(_) => f.write_str("Input::Connection"),
            Self::Callback(_) => f.write_str("Input::Callback"),
        }
    }
}

struct InputBus {
    format: StreamFormat,
    buffers: BufferList,
    source: Option<Input>,
}

impl InputBus {
    fn new(format: StreamFormat) -> Self {
        Self {
            format,
            buffers: BufferList::new(),
            source: None,
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.source.is_some()
    }

    fn pull(&mut self, flags: RenderActionFlags, sample_time: f64, bus: u32, frames: u32) -> AuResult<()> {
        match self.source.as_mut() {
            None => {
                self.buffers.invalidate();
                Ok(())
            }
            Some(Input::Connection(source)) => {
                self.buffers.prepare_null_buffer(&self.format, frames)?;
                source.pull(flags, sample_time, bus, frames, &mut self.buffers)
            }
            Some(Input::Callback(source)) => {
                self.buffers.prepare_buffer(&self.format, frames)?;
                source.pull(flags, sample_time, bus, frames, &mut self.buffers)
            }
        }
    }
}

impl fmt::Debug for InputBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputBus")
            .field("format", &self.format)
            .field("state", &self.buffers.state())
            .field("source", &self.source)
            .finish()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Render cycle configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfig {
    /// Frame ceiling per render call.
    pub max_frames_per_slice: u32,
    /// Format of the output bus.
    pub output_format: StreamFormat,
    /// Number of input buses.
    pub input_buses: u32,
    /// Initial format of every input bus.
    pub input_format: StreamFormat,
    /// Copy input bus 0 into the output before the kernel runs, so the kernel
    /// processes the output in place.
    pub process_in_place: bool,
    /// Whether automation is sliced sample-accurately.
    pub can_schedule_parameters: bool,
    /// Observer records allocated up front.
    pub observer_reserve: usize,
    /// Parameter events accepted per render call.
    pub event_capacity: usize,
}

impl RenderConfig {
    pub const fn new(output_format: StreamFormat) -> Self {
        Self {
            max_frames_per_slice: DEFAULT_MAX_FRAMES_PER_SLICE,
            output_format,
            input_buses: 0,
            input_format: output_format,
            process_in_place: false,
            can_schedule_parameters: true,
            observer_reserve: 8,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub const fn with_max_frames_per_slice(mut self, frames: u32) -> Self {
        self.max_frames_per_slice = frames;
        self
    }

    pub const fn with_output_format(mut self, format: StreamFormat) -> Self {
        self.output_format = format;
        self
    }

    pub const fn with_inputs(mut self, buses: u32, format: StreamFormat) -> Self {
        self.input_buses = buses;
        self.input_format = format;
        self
    }

    pub const fn with_in_place_processing(mut self, enabled: bool) -> Self {
        self.process_in_place = enabled;
        self
    }

    pub const fn with_parameter_scheduling(mut self, enabled: bool) -> Self {
        self.can_schedule_parameters = enabled;
        self
    }

    pub const fn with_observer_reserve(mut self, count: usize) -> Self {
        self.observer_reserve = count;
        self
    }

    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::new(StreamFormat::default())
    }
}

// =============================================================================
// ControlHandle
// =============================================================================

/// Control-thread access to a [`RenderCycle`].
///
/// Clone freely and send to any thread. Observer changes take effect at the
/// start of the next render call.
#[derive(Clone)]
pub struct ControlHandle {
    observers: Registrar<ObserverHandle>,
    parameters: Arc<ParameterScopes>,
}

impl ControlHandle {
    pub fn add_render_notify(&self, observer: ObserverHandle) {
        self.observers.add(observer);
    }

    /// Remove an observer at the next render call.
    ///
    /// The registry keeps a reference to a removed observer on a recycled
    /// record; see [`release_removed_observers`](Self::release_removed_observers).
    pub fn remove_render_notify(&self, observer: &ObserverHandle) {
        self.observers.remove(observer.clone());
    }

    /// Drop the references the registry still holds to removed observers.
    ///
    /// Only covers removals a render call has already applied.
    pub fn release_removed_observers(&self) {
        self.observers.release_stale();
    }

    pub fn clear_render_notify(&self) {
        self.observers.clear();
    }

    /// Set an existing parameter.
    ///
    /// Handles cannot declare parameters: an unknown ID is an
    /// [`InvalidParameter`](AuError::InvalidParameter) error before
    /// initialization, and logged and ignored afterwards.
    pub fn set_parameter(
        &self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
        value: ParameterValue,
    ) -> AuResult<()> {
        self.parameters.set_shared(id, scope, element, value)
    }

    pub fn get_parameter(
        &self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
    ) -> AuResult<ParameterValue> {
        self.parameters.get(id, scope, element)
    }

    /// The shared parameter scopes.
    pub fn parameters(&self) -> &ParameterScopes {
        &self.parameters
    }
}

// =============================================================================
// RenderCycle
// =============================================================================

/// Render-thread owner of the kernel, output buffers, observers and automation.
pub struct RenderCycle<K: RenderKernel> {
    config: RenderConfig,
    kernel: K,
    parameters: Arc<ParameterScopes>,
    observers: DeferredRegistry<ObserverHandle>,
    scheduler: AutomationScheduler,
    inputs: Vec<InputBus>,
    output: BufferList,
    initialized: bool,
    last_ceiling_log: Option<Instant>,
}

impl<K: RenderKernel> RenderCycle<K> {
    pub fn new(config: RenderConfig, parameters: ParameterScopes, kernel: K) -> Self {
        Self {
            config,
            kernel,
            parameters: Arc::new(parameters),
            observers: DeferredRegistry::with_capacity(config.observer_reserve),
            scheduler: AutomationScheduler::with_capacity(config.event_capacity),
            inputs: (0..config.input_buses)
                .map(|_| InputBus::new(config.input_format))
                .collect(),
            output: BufferList::new(),
            initialized: false,
            last_ceiling_log: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    #[inline]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    #[inline]
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    #[inline]
    pub fn parameters(&self) -> &ParameterScopes {
        &self.parameters
    }

    /// Structural access to the parameters.
    ///
    /// Only available while uninitialized and before any [`ControlHandle`]
    /// exists.
    pub fn parameters_mut(&mut self) -> AuResult<&mut ParameterScopes> {
        if self.initialized {
            return Err(AuError::InvalidState("parameters are fixed while initialized"));
        }
        Arc::get_mut(&mut self.parameters)
            .ok_or(AuError::InvalidState("parameters are shared with control handles"))
    }

    /// Set a parameter from the configuring thread.
    ///
    /// While uninitialized and before any [`ControlHandle`] exists, unknown
    /// IDs are declared (see [`ParameterScopes::set`]). Otherwise this behaves
    /// like [`ControlHandle::set_parameter`].
    pub fn set_parameter(
        &mut self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
        value: ParameterValue,
    ) -> AuResult<()> {
        if !self.initialized {
            if let Some(parameters) = Arc::get_mut(&mut self.parameters) {
                return parameters.set(id, scope, element, value);
            }
        }
        self.parameters.set_shared(id, scope, element, value)
    }

    /// A handle for control threads.
    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            observers: self.observers.registrar(),
            parameters: Arc::clone(&self.parameters),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[inline]
    pub fn max_frames_per_slice(&self) -> u32 {
        self.config.max_frames_per_slice
    }

    /// Change the frame ceiling. Only while uninitialized.
    pub fn set_max_frames_per_slice(&mut self, frames: u32) -> AuResult<()> {
        if self.initialized {
            return Err(AuError::InvalidState(
                "max frames per slice cannot change while initialized",
            ));
        }
        self.config.max_frames_per_slice = frames;
        Ok(())
    }

    /// Change the output format. Only while uninitialized.
    pub fn set_output_format(&mut self, format: StreamFormat) -> AuResult<()> {
        if self.initialized {
            return Err(AuError::InvalidState("output format cannot change while initialized"));
        }
        self.config.output_format = format;
        Ok(())
    }

    /// Number of input buses.
    #[inline]
    pub fn input_count(&self) -> u32 {
        self.inputs.len() as u32
    }

    fn input_bus_mut(&mut self, bus: u32) -> AuResult<&mut InputBus> {
        self.inputs.get_mut(bus as usize).ok_or(AuError::InvalidElement {
            scope: Scope::Input,
            element: bus,
        })
    }

    /// Connect input bus `bus` to `input`, or disconnect it with `None`.
    ///
    /// Non-real-time. Takes effect at the next render call.
    pub fn set_input(&mut self, bus: u32, input: Option<Input>) -> AuResult<()> {
        self.input_bus_mut(bus)?.source = input;
        Ok(())
    }

    /// Change the format of input bus `bus`. Only while uninitialized.
    pub fn set_input_format(&mut self, bus: u32, format: StreamFormat) -> AuResult<()> {
        if self.initialized {
            return Err(AuError::InvalidState("input format cannot change while initialized"));
        }
        self.input_bus_mut(bus)?.format = format;
        Ok(())
    }

    /// Allocate render resources. Non-real-time.
    pub fn initialize(&mut self) -> AuResult<()> {
        if self.initialized {
            return Ok(());
        }

        let max_frames = self.config.max_frames_per_slice;
        self.output.allocate(&self.config.output_format, max_frames)?;
        for input in &mut self.inputs {
            input.buffers.allocate(&input.format, max_frames)?;
        }
        self.parameters.set_activated(true);
        self.kernel.reset();
        self.initialized = true;

        log::debug!(
            "Render cycle initialized: {} channels at {} Hz, max {} frames",
            self.config.output_format.channels_per_frame,
            self.config.output_format.sample_rate,
            self.config.max_frames_per_slice
        );
        Ok(())
    }

    /// Release render resources. Non-real-time.
    pub fn uninitialize(&mut self) {
        if !self.initialized {
            return;
        }
        self.output.deallocate();
        for input in &mut self.inputs {
            input.buffers.deallocate();
        }
        self.scheduler.clear();
        self.observers.registrar().release_stale();
        self.parameters.set_activated(false);
        self.initialized = false;
        log::debug!("Render cycle uninitialized");
    }

    /// Queue automation for the next render call.
    ///
    /// With scheduling disabled, immediate events are applied at once.
    pub fn schedule_parameters(&mut self, events: &[ParameterEvent]) -> AuResult<()> {
        self.scheduler.schedule(
            events,
            &*self.parameters,
            self.config.can_schedule_parameters,
        )
    }

    /// Render `frames` frames into the output buffers. Real-time safe.
    pub fn render(
        &mut self,
        flags: RenderActionFlags,
        sample_time: f64,
        bus: u32,
        frames: u32,
    ) -> AuResult<()> {
        if !self.initialized {
            self.scheduler.clear();
            return Err(AuError::Uninitialized);
        }
        if frames > self.config.max_frames_per_slice {
            self.log_ceiling(frames);
            self.scheduler.clear();
            return Err(AuError::TooManyFrames {
                requested: frames,
                maximum: self.config.max_frames_per_slice,
            });
        }

        self.observers.apply();
        let base = flags - RenderActionFlags::PRE_RENDER - RenderActionFlags::POST_RENDER;
        self.notify(base | RenderActionFlags::PRE_RENDER, sample_time, bus, frames);

        let result = self.render_block(base, sample_time, frames);

        let mut post = base | RenderActionFlags::POST_RENDER;
        match &result {
            Ok(()) if self.kernel.output_is_silence() => {
                post |= RenderActionFlags::OUTPUT_IS_SILENCE
            }
            Ok(()) => {}
            Err(_) => post |= RenderActionFlags::POST_RENDER_ERROR,
        }
        self.notify(post, sample_time, bus, frames);

        for input in &mut self.inputs {
            input.buffers.invalidate();
        }
        self.scheduler.clear();
        result
    }

    fn render_block(&mut self, flags: RenderActionFlags, sample_time: f64, frames: u32) -> AuResult<()> {
        for (bus, input) in self.inputs.iter_mut().enumerate() {
            input.pull(flags, sample_time, bus as u32, frames)?;
        }

        self.output.prepare_buffer(&self.config.output_format, frames)?;
        if self.config.process_in_place {
            let main = self
                .inputs
                .first()
                .filter(|input| input.is_connected())
                .ok_or(AuError::NoConnection(0))?;
            main.buffers.copy_contents_to(&mut self.output)?;
        }

        let parameters = &*self.parameters;
        let inputs = &self.inputs[..];
        let kernel = &mut self.kernel;
        let output = &mut self.output;
        let mut render_one_slice = |start: u32, count: u32, events: &ParameterEventList| {
            let context = SliceContext {
                start,
                frames: count,
                sample_time: sample_time + start as f64,
                flags,
                events,
                inputs,
            };
            kernel.render_slice(&context, parameters, output)
        };

        if self.scheduler.has_events() {
            self.scheduler.process(frames, parameters, render_one_slice)
        } else {
            render_one_slice(0, frames, self.scheduler.events())
        }
    }

    fn notify(&self, flags: RenderActionFlags, sample_time: f64, bus: u32, frames: u32) {
        if self.observers.is_empty() {
            return;
        }
        let notification = RenderNotification {
            flags,
            sample_time,
            bus,
            frames,
            buffers: &self.output,
        };
        for observer in self.observers.iter() {
            observer.notify(&notification);
        }
    }

    fn log_ceiling(&mut self, frames: u32) {
        let now = Instant::now();
        let due = self
            .last_ceiling_log
            .map_or(true, |last| now.duration_since(last) >= CEILING_LOG_INTERVAL);
        if due {
            self.last_ceiling_log = Some(now);
            log::error!(
                "Render request of {} frames exceeds max frames per slice ({})",
                frames,
                self.config.max_frames_per_slice
            );
        }
    }

    /// The output buffers of the last render call.
    #[inline]
    pub fn output(&self) -> &BufferList {
        &self.output
    }

    /// Number of observers active as of the last render call.
    #[inline]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

// =============================================================================
// SilentTimeout
// =============================================================================

/// Keeps a kernel's output "live" for a tail after its input goes silent.
///
/// When the input turns silent, a countdown of `timeout_frames` starts; the
/// output is reported silent only once it runs out. Any non-silent input
/// rearms the countdown.
#[derive(Debug, Clone, Copy)]
pub struct SilentTimeout {
    remaining: u32,
    rearm: bool,
}

impl Default for SilentTimeout {
    fn default() -> Self {
        Self::new()
    }
}

impl SilentTimeout {
    pub const fn new() -> Self {
        Self {
            remaining: 0,
            rearm: false,
        }
    }

    /// Advance by `frames`. Returns whether the output is silent.
    pub fn process(&mut self, frames: u32, timeout_frames: u32, input_silent: bool) -> bool {
        if !input_silent {
            self.rearm = true;
            return false;
        }
        if self.rearm {
            self.remaining = timeout_frames;
            self.rearm = false;
        }
        if self.remaining > 0 {
            self.remaining -= frames.min(self.remaining);
            return false;
        }
        true
    }

    /// Restart the countdown on the next silent block.
    pub fn reset(&mut self) {
        self.rearm = true;
    }
}
