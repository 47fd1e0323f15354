//! Per-element parameter storage shared by control and render threads.
//!
//! Each [`ParameterElement`] holds `(id, value)` pairs in one of two modes,
//! fixed for the element's lifetime once chosen:
//!
//! - **Sparse** (default): sorted by ID, found by binary search. Parameters are
//!   created on first [`set`](ParameterElement::set) before activation.
//! - **Dense**: IDs `0..n`, indexed directly. Selected with
//!   [`use_indexed_parameters`](ParameterElement::use_indexed_parameters).
//!
//! # Thread Safety
//!
//! Values are [`AtomicF32`] cells (acquire/release), so any thread can read or
//! write an existing parameter through `&self`. Creating parameters changes the
//! layout and therefore needs `&mut self`, which only the configuring thread
//! has before the element is shared.
//!
//! # Contract Violations
//!
//! | path | unknown ID |
//! |---|---|
//! | [`get`](ParameterElement::get) / [`try_set`](ParameterElement::try_set) | `Err(InvalidParameter)` |
//! | [`set`](ParameterElement::set) before activation | parameter is created |
//! | [`set`](ParameterElement::set) after activation | logged and ignored |
//! | [`get_rt`](ParameterElement::get_rt) / [`set_rt`](ParameterElement::set_rt) | panic |

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::automation::{EventKind, ParameterEvent, ScheduledEventTarget};
use crate::error::{AuError, AuResult};
use crate::types::{ElementId, ParameterId, ParameterValue, Scope};

// =============================================================================
// AtomicF32
// =============================================================================

/// `f32` cell with lock-free load/store, stored as bits in an `AtomicU32`.
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    /// Create a cell holding `value`.
    #[inline]
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    /// Load with acquire ordering.
    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Store with release ordering.
    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

impl Default for AtomicF32 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl fmt::Debug for AtomicF32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

// =============================================================================
// ParameterElement
// =============================================================================

#[derive(Debug)]
enum Storage {
    Sparse(Vec<(ParameterId, AtomicF32)>),
    Dense(Vec<AtomicF32>),
}

/// Parameter values for one scope/element pair.
#[derive(Debug)]
pub struct ParameterElement {
    storage: Storage,
    activated: AtomicBool,
}

impl Default for ParameterElement {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterElement {
    /// Create an empty element in sparse mode.
    pub fn new() -> Self {
        Self {
            storage: Storage::Sparse(Vec::new()),
            activated: AtomicBool::new(false),
        }
    }

    /// Switch to dense mode with parameters `0..count`, all zero.
    ///
    /// Call once, before any parameter is defined.
    pub fn use_indexed_parameters(&mut self, count: u32) {
        if let Storage::Sparse(entries) = &self.storage {
            if !entries.is_empty() {
                log::warn!(
                    "Switching to indexed parameters discards {} sparse parameters",
                    entries.len()
                );
            }
        }
        self.storage = Storage::Dense((0..count).map(|_| AtomicF32::default()).collect());
    }

    /// Whether the element uses dense storage.
    #[inline]
    pub fn is_indexed(&self) -> bool {
        matches!(self.storage, Storage::Dense(_))
    }

    /// Mark the element as activated (rendering may have started).
    ///
    /// After activation, control-path `set` no longer creates parameters.
    pub fn set_activated(&self, activated: bool) {
        self.activated.store(activated, Ordering::Release);
    }

    /// Whether the element is activated.
    #[inline]
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    #[inline]
    fn cell(&self, id: ParameterId) -> Option<&AtomicF32> {
        match &self.storage {
            Storage::Dense(values) => values.get(id as usize),
            Storage::Sparse(entries) => entries
                .binary_search_by_key(&id, |(key, _)| *key)
                .ok()
                .map(|index| &entries[index].1),
        }
    }

    /// Whether `id` is defined.
    pub fn has_parameter(&self, id: ParameterId) -> bool {
        self.cell(id).is_some()
    }

    /// Number of defined parameters.
    pub fn parameter_count(&self) -> usize {
        match &self.storage {
            Storage::Dense(values) => values.len(),
            Storage::Sparse(entries) => entries.len(),
        }
    }

    /// Defined parameter IDs in ascending order.
    pub fn parameter_ids(&self) -> impl Iterator<Item = ParameterId> + '_ {
        let (dense, sparse) = match &self.storage {
            Storage::Dense(values) => (0..values.len() as ParameterId, None),
            Storage::Sparse(entries) => (0..0, Some(entries.iter().map(|(id, _)| *id))),
        };
        dense.chain(sparse.into_iter().flatten())
    }

    /// Read a parameter (control path).
    pub fn get(&self, id: ParameterId) -> AuResult<ParameterValue> {
        self.cell(id)
            .map(AtomicF32::load)
            .ok_or(AuError::InvalidParameter(id))
    }

    /// Read a parameter on the render thread.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not defined. Render code must only read parameters
    /// it declared.
    #[inline]
    pub fn get_rt(&self, id: ParameterId) -> ParameterValue {
        match self.cell(id) {
            Some(cell) => cell.load(),
            None => panic!("render thread read undefined parameter {id}"),
        }
    }

    /// Write a parameter on the render thread.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not defined.
    #[inline]
    pub fn set_rt(&self, id: ParameterId, value: ParameterValue) {
        match self.cell(id) {
            Some(cell) => cell.store(value),
            None => panic!("render thread wrote undefined parameter {id}"),
        }
    }

    /// Write an existing parameter without changing the layout.
    pub fn try_set(&self, id: ParameterId, value: ParameterValue) -> AuResult<()> {
        let cell = self.cell(id).ok_or(AuError::InvalidParameter(id))?;
        cell.store(value);
        Ok(())
    }

    /// Write a parameter (control path).
    ///
    /// Unknown sparse IDs are created while the element is not activated.
    /// Any other unknown ID is logged and ignored.
    pub fn set(&mut self, id: ParameterId, value: ParameterValue) {
        let activated = self.is_activated();
        match &mut self.storage {
            Storage::Dense(values) => match values.get(id as usize) {
                Some(cell) => cell.store(value),
                None => log::warn!(
                    "Ignoring set of parameter {} outside indexed range 0..{}",
                    id,
                    values.len()
                ),
            },
            Storage::Sparse(entries) => {
                match entries.binary_search_by_key(&id, |(key, _)| *key) {
                    Ok(index) => entries[index].1.store(value),
                    Err(index) if !activated => entries.insert(index, (id, AtomicF32::new(value))),
                    Err(_) => log::warn!(
                        "Ignoring set of undefined parameter {} after activation",
                        id
                    ),
                }
            }
        }
    }

    /// Apply one scheduled event at the start of a slice.
    ///
    /// Immediate events store their value. Ramps store their value at
    /// `slice_start`, linearly interpolated and clamped to the ramp, so a
    /// slice at or past the ramp's end gets the end value. Finer
    /// interpolation inside the slice is left to the render kernel.
    pub fn set_scheduled_event(
        &self,
        event: &ParameterEvent,
        slice_start: u32,
        _slice_frames: u32,
    ) -> AuResult<()> {
        let value = match event.kind {
            EventKind::Immediate { value, .. } => value,
            EventKind::Ramp { .. } => event.value_at(slice_start),
        };
        self.try_set(event.parameter, value)
    }
}

// =============================================================================
// ParameterScopes
// =============================================================================

/// Parameter elements for the global, input and output scopes.
///
/// The global scope has exactly one element (0). Input and output scopes have
/// one element per bus.
#[derive(Debug, Default)]
pub struct ParameterScopes {
    global: ParameterElement,
    inputs: Vec<ParameterElement>,
    outputs: Vec<ParameterElement>,
}

impl ParameterScopes {
    /// Create scopes with only the global element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create scopes with the given bus counts.
    pub fn with_buses(inputs: u32, outputs: u32) -> Self {
        let mut scopes = Self::new();
        scopes.set_input_count(inputs);
        scopes.set_output_count(outputs);
        scopes
    }

    /// The global element.
    #[inline]
    pub fn global(&self) -> &ParameterElement {
        &self.global
    }

    /// The global element, for configuration.
    #[inline]
    pub fn global_mut(&mut self) -> &mut ParameterElement {
        &mut self.global
    }

    /// Resize the input scope. Non-real-time, before activation.
    pub fn set_input_count(&mut self, count: u32) {
        self.inputs.resize_with(count as usize, ParameterElement::new);
    }

    /// Resize the output scope. Non-real-time, before activation.
    pub fn set_output_count(&mut self, count: u32) {
        self.outputs.resize_with(count as usize, ParameterElement::new);
    }

    /// Number of elements in `scope`.
    pub fn element_count(&self, scope: Scope) -> u32 {
        match scope {
            Scope::Global => 1,
            Scope::Input => self.inputs.len() as u32,
            Scope::Output => self.outputs.len() as u32,
        }
    }

    /// Look up an element.
    pub fn element(&self, scope: Scope, element: ElementId) -> AuResult<&ParameterElement> {
        let found = match scope {
            Scope::Global if element == 0 => Some(&self.global),
            Scope::Global => None,
            Scope::Input => self.inputs.get(element as usize),
            Scope::Output => self.outputs.get(element as usize),
        };
        found.ok_or(AuError::InvalidElement { scope, element })
    }

    /// Look up an element for configuration.
    pub fn element_mut(
        &mut self,
        scope: Scope,
        element: ElementId,
    ) -> AuResult<&mut ParameterElement> {
        let found = match scope {
            Scope::Global if element == 0 => Some(&mut self.global),
            Scope::Global => None,
            Scope::Input => self.inputs.get_mut(element as usize),
            Scope::Output => self.outputs.get_mut(element as usize),
        };
        found.ok_or(AuError::InvalidElement { scope, element })
    }

    fn elements(&self) -> impl Iterator<Item = &ParameterElement> {
        std::iter::once(&self.global)
            .chain(self.inputs.iter())
            .chain(self.outputs.iter())
    }

    /// Mark every element activated or not.
    pub fn set_activated(&self, activated: bool) {
        for element in self.elements() {
            element.set_activated(activated);
        }
    }

    /// Read a parameter (control path).
    pub fn get(&self, id: ParameterId, scope: Scope, element: ElementId) -> AuResult<ParameterValue> {
        self.element(scope, element)?.get(id)
    }

    /// Write a parameter, creating it if allowed. See [`ParameterElement::set`].
    pub fn set(
        &mut self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
        value: ParameterValue,
    ) -> AuResult<()> {
        self.element_mut(scope, element)?.set(id, value);
        Ok(())
    }

    /// Write an existing parameter. See [`ParameterElement::try_set`].
    pub fn try_set(
        &self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
        value: ParameterValue,
    ) -> AuResult<()> {
        self.element(scope, element)?.try_set(id, value)
    }

    /// Write an existing parameter from a control thread once the scopes are
    /// shared with the render thread.
    ///
    /// Shared scopes cannot declare parameters. Before activation an unknown
    /// ID is reported as [`InvalidParameter`](AuError::InvalidParameter);
    /// after activation it is logged and ignored. An unknown element is always
    /// an error.
    pub fn set_shared(
        &self,
        id: ParameterId,
        scope: Scope,
        element: ElementId,
        value: ParameterValue,
    ) -> AuResult<()> {
        let target = self.element(scope, element)?;
        match target.try_set(id, value) {
            Err(err) if !target.is_activated() => Err(err),
            Err(_) => {
                log::warn!(
                    "Ignoring set of undefined parameter {} in {:?} element {} after activation",
                    id,
                    scope,
                    element
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

impl ScheduledEventTarget for ParameterScopes {
    fn check_event(&self, event: &ParameterEvent) -> AuResult<()> {
        if self.element(event.scope, event.element)?.has_parameter(event.parameter) {
            Ok(())
        } else {
            Err(AuError::InvalidParameter(event.parameter))
        }
    }

    fn set_scheduled_event(
        &self,
        event: &ParameterEvent,
        slice_start: u32,
        slice_frames: u32,
    ) -> AuResult<()> {
        self.element(event.scope, event.element)?
            .set_scheduled_event(event, slice_start, slice_frames)
    }
}
