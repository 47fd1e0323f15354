//! Sample-accurate parameter automation.
//!
//! A render block's parameter events are collected in a [`ParameterEventList`]
//! and replayed by [`process_slices`], which splits the block at every event
//! boundary so each slice renders with constant parameter values.
//!
//! ```text
//! events:   A=1.0 @100        A=2.0 @300
//! frames:   0 ─────── 100 ─────────── 300 ───── 400
//! slices:   [0,100)   [100,300)       [300,400)
//! A:        default   1.0             2.0
//! ```
//!
//! Ramps split the block at their start and end. A slice the ramp covers hands
//! the target the ramp's value at the slice start; later slices get the ramp's
//! end value. Smoothing inside a slice is up to the render kernel, which can
//! read the ramps active in the slice. After the last slice the target is left
//! with every event's value at the end of the block.
//!
//! Events are checked against the target when they are scheduled, so the
//! render thread only sees events it can apply.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AuResult;
use crate::types::{ElementId, ParameterId, ParameterValue, Scope};

/// Default capacity of a [`ParameterEventList`].
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

static OVERFLOW_WARNING_LOGGED: AtomicBool = AtomicBool::new(false);
static REJECTED_EVENT_WARNING_LOGGED: AtomicBool = AtomicBool::new(false);

// =============================================================================
// Events
// =============================================================================

/// What a parameter event does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    /// Jump to `value` at frame `offset`.
    Immediate { offset: u32, value: ParameterValue },
    /// Move linearly from `start_value` to `end_value` over `duration` frames.
    ///
    /// `start_offset` may be negative for a ramp that began in an earlier block.
    Ramp {
        start_offset: i32,
        duration: u32,
        start_value: ParameterValue,
        end_value: ParameterValue,
    },
}

/// A timestamped parameter change within one render block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterEvent {
    pub parameter: ParameterId,
    pub scope: Scope,
    pub element: ElementId,
    pub kind: EventKind,
}

impl ParameterEvent {
    /// Immediate change at `offset`.
    pub const fn immediate(
        parameter: ParameterId,
        scope: Scope,
        element: ElementId,
        offset: u32,
        value: ParameterValue,
    ) -> Self {
        Self {
            parameter,
            scope,
            element,
            kind: EventKind::Immediate { offset, value },
        }
    }

    /// Linear ramp starting at `start_offset`.
    pub const fn ramp(
        parameter: ParameterId,
        scope: Scope,
        element: ElementId,
        start_offset: i32,
        duration: u32,
        start_value: ParameterValue,
        end_value: ParameterValue,
    ) -> Self {
        Self {
            parameter,
            scope,
            element,
            kind: EventKind::Ramp {
                start_offset,
                duration,
                start_value,
                end_value,
            },
        }
    }

    /// Frame at which the event takes effect.
    #[inline]
    pub fn start_offset(&self) -> i64 {
        match self.kind {
            EventKind::Immediate { offset, .. } => offset as i64,
            EventKind::Ramp { start_offset, .. } => start_offset as i64,
        }
    }

    /// Frame at which a ramp ends, or `None` for immediate events.
    #[inline]
    pub fn end_offset(&self) -> Option<i64> {
        match self.kind {
            EventKind::Immediate { .. } => None,
            EventKind::Ramp {
                start_offset,
                duration,
                ..
            } => Some(start_offset as i64 + duration as i64),
        }
    }

    /// Whether the event affects the slice `[start, end)`.
    #[inline]
    pub fn applies_to(&self, start: u32, end: u32) -> bool {
        let begin = self.start_offset();
        match self.end_offset() {
            None => begin <= start as i64,
            Some(finish) => begin < end as i64 && finish > start as i64,
        }
    }

    /// Whether the event is a ramp still moving within `[start, end)`.
    #[inline]
    pub fn is_ramping_in(&self, start: u32, end: u32) -> bool {
        self.end_offset().is_some() && self.applies_to(start, end)
    }

    /// Whether the event is a ramp that reached its end value by `frame`.
    #[inline]
    pub fn has_finished_by(&self, frame: u32) -> bool {
        matches!(self.end_offset(), Some(finish) if finish <= frame as i64)
    }

    /// The event's value at `frame`.
    ///
    /// Ramps are clamped to their start and end values outside their range.
    pub fn value_at(&self, frame: u32) -> ParameterValue {
        match self.kind {
            EventKind::Immediate { value, .. } => value,
            EventKind::Ramp {
                start_offset,
                duration,
                start_value,
                end_value,
            } => {
                if duration == 0 {
                    return end_value;
                }
                let elapsed = frame as i64 - start_offset as i64;
                let t = (elapsed as f64 / duration as f64).clamp(0.0, 1.0) as f32;
                start_value + (end_value - start_value) * t
            }
        }
    }
}

/// Receiver of per-slice parameter updates.
pub trait ScheduledEventTarget {
    /// Check that `event` names something the target can apply.
    ///
    /// Called when the event is scheduled, off the slicing path.
    fn check_event(&self, _event: &ParameterEvent) -> AuResult<()> {
        Ok(())
    }

    /// Apply `event` for the slice starting at `slice_start`.
    fn set_scheduled_event(
        &self,
        event: &ParameterEvent,
        slice_start: u32,
        slice_frames: u32,
    ) -> AuResult<()>;
}

// =============================================================================
// ParameterEventList
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Queued {
    event: ParameterEvent,
    sequence: u32,
}

/// Pre-allocated event batch for one render block.
///
/// Pushing never allocates; events beyond the capacity are dropped with a
/// one-time warning.
#[derive(Debug)]
pub struct ParameterEventList {
    events: Vec<Queued>,
    next_sequence: u32,
}

impl Default for ParameterEventList {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterEventList {
    /// Create a list with [`DEFAULT_EVENT_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a list holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            next_sequence: 0,
        }
    }

    /// Queue an event. Returns `false` if the list is full.
    pub fn push(&mut self, event: ParameterEvent) -> bool {
        if self.events.len() == self.events.capacity() {
            if !OVERFLOW_WARNING_LOGGED.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "Parameter event list full ({} events), dropping events. \
                     This warning will only appear once per session.",
                    self.events.capacity()
                );
            }
            return false;
        }
        self.events.push(Queued {
            event,
            sequence: self.next_sequence,
        });
        self.next_sequence = self.next_sequence.wrapping_add(1);
        true
    }

    /// Discard all events. O(1), keeps the capacity.
    pub fn clear(&mut self) {
        self.events.clear();
        self.next_sequence = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Events in their current order.
    pub fn iter(&self) -> impl Iterator<Item = &ParameterEvent> {
        self.events.iter().map(|queued| &queued.event)
    }

    /// Sort by start offset, keeping submission order for equal offsets.
    ///
    /// Unstable sort on a unique key, so no allocation.
    pub fn sort(&mut self) {
        self.events
            .sort_unstable_by_key(|queued| (queued.event.start_offset(), queued.sequence));
    }
}

// =============================================================================
// Slicing
// =============================================================================

/// End of the slice starting at `current`: the nearest event start or ramp end
/// inside `(current, total_frames)`, else `total_frames`.
fn next_breakpoint(events: &ParameterEventList, current: u32, total_frames: u32) -> u32 {
    let mut breakpoint = total_frames as i64;
    for event in events.iter() {
        let start = event.start_offset();
        if start > current as i64 && start < breakpoint {
            breakpoint = start;
        }
        if let Some(end) = event.end_offset() {
            if end > current as i64 && end < breakpoint {
                breakpoint = end;
            }
        }
    }
    // current < breakpoint <= total_frames
    breakpoint as u32
}

/// Apply one event, skipping it if the target rejects it.
///
/// Runs on the render thread, so the rejection is logged once per session.
fn apply_event<T>(target: &T, event: &ParameterEvent, slice_start: u32, slice_frames: u32)
where
    T: ScheduledEventTarget + ?Sized,
{
    if let Err(err) = target.set_scheduled_event(event, slice_start, slice_frames) {
        if !REJECTED_EVENT_WARNING_LOGGED.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Skipping automation for parameter {}: {}. \
                 This warning will only appear once per session.",
                event.parameter,
                err
            );
        }
    }
}

/// Render `total_frames` frames in slices split at event boundaries.
///
/// For each slice, every applicable event and every finished ramp is handed to
/// `target` in sorted order (later events override earlier ones), then
/// `render_one_slice` is called with `(slice_start, slice_frames, events)`. A
/// rejected event is skipped. A render error stops the scan and is returned
/// as-is; slices already rendered stand.
///
/// Once every slice is rendered, the events are replayed at `total_frames` so
/// the target holds its end-of-block values (a finished ramp's end value).
///
/// Real-time safe: sorts in place and allocates nothing.
pub fn process_slices<T, F>(
    events: &mut ParameterEventList,
    total_frames: u32,
    target: &T,
    mut render_one_slice: F,
) -> AuResult<()>
where
    T: ScheduledEventTarget + ?Sized,
    F: FnMut(u32, u32, &ParameterEventList) -> AuResult<()>,
{
    events.sort();

    let mut current = 0;
    while current < total_frames {
        let breakpoint = next_breakpoint(events, current, total_frames);
        let frames = breakpoint - current;

        for event in events
            .iter()
            .filter(|e| e.applies_to(current, breakpoint) || e.has_finished_by(current))
        {
            apply_event(target, event, current, frames);
        }

        render_one_slice(current, frames, events)?;
        current = breakpoint;
    }

    let end = total_frames as i64;
    for event in events.iter().filter(|e| e.start_offset() < end) {
        apply_event(target, event, total_frames, 0);
    }
    Ok(())
}

// =============================================================================
// AutomationScheduler
// =============================================================================

/// Owns one block's events and drives [`process_slices`].
#[derive(Debug, Default)]
pub struct AutomationScheduler {
    events: ParameterEventList,
}

impl AutomationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler whose event list holds up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: ParameterEventList::with_capacity(capacity),
        }
    }

    /// Accept events for the next render block.
    ///
    /// With `can_schedule`, events are checked against `target` and queued for
    /// slicing. An event the target rejects is dropped; the others are still
    /// queued and the first rejection is returned. Without `can_schedule`
    /// there is no sub-block accuracy: immediate events are applied to
    /// `target` at once and ramps are ignored.
    pub fn schedule<T>(
        &mut self,
        events: &[ParameterEvent],
        target: &T,
        can_schedule: bool,
    ) -> AuResult<()>
    where
        T: ScheduledEventTarget + ?Sized,
    {
        if !can_schedule {
            for event in events {
                if let EventKind::Immediate { offset, .. } = event.kind {
                    target.set_scheduled_event(event, offset, 0)?;
                }
            }
            return Ok(());
        }

        let mut result = Ok(());
        for event in events {
            match target.check_event(event) {
                Ok(()) => {
                    self.events.push(*event);
                }
                Err(err) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        result
    }

    /// Whether any events are queued.
    #[inline]
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Queued events.
    #[inline]
    pub fn events(&self) -> &ParameterEventList {
        &self.events
    }

    /// Slice and render the block. See [`process_slices`].
    pub fn process<T, F>(&mut self, total_frames: u32, target: &T, render_one_slice: F) -> AuResult<()>
    where
        T: ScheduledEventTarget + ?Sized,
        F: FnMut(u32, u32, &ParameterEventList) -> AuResult<()>,
    {
        process_slices(&mut self.events, total_frames, target, render_one_slice)
    }

    /// Discard the block's events.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuError;
    use crate::parameters::ParameterScopes;

    const A: ParameterId = 0;

    fn scopes_with_a(default: f32) -> ParameterScopes {
        let mut scopes = ParameterScopes::new();
        scopes.set(A, Scope::Global, 0, default).unwrap();
        scopes.set_activated(true);
        scopes
    }

    /// Run the slicer and record (start, frames, value of A) per slice.
    fn run(events: &[ParameterEvent], total: u32, scopes: &ParameterScopes) -> Vec<(u32, u32, f32)> {
        let mut list = ParameterEventList::new();
        for event in events {
            list.push(*event);
        }
        let mut slices = Vec::new();
        process_slices(&mut list, total, scopes, |start, frames, _| {
            slices.push((start, frames, scopes.global().get_rt(A)));
            Ok(())
        })
        .unwrap();
        slices
    }

    #[test]
    fn test_immediate_slice_partition() {
        let scopes = scopes_with_a(0.5);
        let events = [
            ParameterEvent::immediate(A, Scope::Global, 0, 300, 2.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 100, 1.0),
        ];
        let slices = run(&events, 400, &scopes);
        assert_eq!(slices, vec![(0, 100, 0.5), (100, 200, 1.0), (300, 100, 2.0)]);
    }

    #[test]
    fn test_ramp_boundary() {
        let scopes = scopes_with_a(0.0);
        let ramp = ParameterEvent::ramp(A, Scope::Global, 0, 50, 100, 0.25, 1.0);
        let slices: Vec<(u32, u32)> = run(&[ramp], 200, &scopes)
            .into_iter()
            .map(|(start, frames, _)| (start, frames))
            .collect();
        assert_eq!(slices, vec![(0, 50), (50, 100), (150, 50)]);

        assert!(!ramp.applies_to(0, 50));
        assert!(ramp.applies_to(50, 150));
        assert!(!ramp.applies_to(150, 200));
        assert!(!ramp.has_finished_by(149));
        assert!(ramp.has_finished_by(150), "later slices get the end value");
    }

    #[test]
    fn test_finished_ramp_leaves_end_value() {
        let scopes = scopes_with_a(0.0);
        let ramp = ParameterEvent::ramp(A, Scope::Global, 0, 50, 100, 0.0, 1.0);
        let slices = run(&[ramp], 200, &scopes);
        assert_eq!(slices, vec![(0, 50, 0.0), (50, 100, 0.0), (150, 50, 1.0)]);
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(1.0));
    }

    #[test]
    fn test_block_long_ramp_settles_at_block_end() {
        let scopes = scopes_with_a(0.0);
        let ramp = ParameterEvent::ramp(A, Scope::Global, 0, 0, 64, -24.0, 0.0);
        assert_eq!(run(&[ramp], 64, &scopes), vec![(0, 64, -24.0)]);
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(0.0));

        // A ramp running past the block holds its value at the block end
        let long = ParameterEvent::ramp(A, Scope::Global, 0, 0, 128, 0.0, 1.0);
        run(&[long], 64, &scopes);
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(0.5));
    }

    #[test]
    fn test_later_immediate_overrides_finished_ramp() {
        let scopes = scopes_with_a(0.0);
        let events = [
            ParameterEvent::ramp(A, Scope::Global, 0, 0, 50, 0.0, 1.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 80, 0.25),
        ];
        let slices = run(&events, 100, &scopes);
        assert_eq!(slices, vec![(0, 50, 0.0), (50, 30, 1.0), (80, 20, 0.25)]);
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(0.25));
    }

    #[test]
    fn test_ramp_pushes_slice_start_value() {
        let scopes = scopes_with_a(0.0);
        let events = [
            ParameterEvent::ramp(A, Scope::Global, 0, 0, 100, 0.0, 1.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 50, 9.0),
        ];
        let slices = run(&events, 100, &scopes);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0], (0, 50, 0.0));
        // The immediate event sorts after the ramp and wins
        assert_eq!(slices[1], (50, 50, 9.0));
    }

    #[test]
    fn test_negative_ramp_start() {
        let scopes = scopes_with_a(0.0);
        let ramp = ParameterEvent::ramp(A, Scope::Global, 0, -100, 200, 0.0, 1.0);
        let slices = run(&[ramp], 256, &scopes);
        assert_eq!(slices.len(), 2);
        assert_eq!((slices[0].0, slices[0].1), (0, 100));
        assert!((slices[0].2 - 0.5).abs() < 1e-6, "ramp is halfway at frame 0");
        assert_eq!(slices[1], (100, 156, 1.0));
    }

    #[test]
    fn test_equal_offsets_keep_submission_order() {
        let scopes = scopes_with_a(0.0);
        let events = [
            ParameterEvent::immediate(A, Scope::Global, 0, 10, 1.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 10, 2.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 10, 3.0),
        ];
        let slices = run(&events, 20, &scopes);
        assert_eq!(slices, vec![(0, 10, 0.0), (10, 10, 3.0)], "last submitted wins");
    }

    #[test]
    fn test_no_events_single_slice() {
        let scopes = scopes_with_a(0.0);
        assert_eq!(run(&[], 64, &scopes), vec![(0, 64, 0.0)]);
    }

    #[test]
    fn test_zero_frames_renders_nothing() {
        let scopes = scopes_with_a(0.0);
        let events = [ParameterEvent::immediate(A, Scope::Global, 0, 0, 1.0)];
        assert!(run(&events, 0, &scopes).is_empty());
    }

    #[test]
    fn test_render_error_stops_slicing() {
        let scopes = scopes_with_a(0.0);
        let mut list = ParameterEventList::new();
        list.push(ParameterEvent::immediate(A, Scope::Global, 0, 100, 1.0));
        list.push(ParameterEvent::immediate(A, Scope::Global, 0, 200, 2.0));

        let mut calls = 0;
        let result = process_slices(&mut list, 300, &scopes, |start, _, _| {
            calls += 1;
            if start == 100 {
                Err(AuError::Render(-4))
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err(AuError::Render(-4)), "error is propagated verbatim");
        assert_eq!(calls, 2, "no slices after the failing one");
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(1.0), "no end-of-block replay");
    }

    #[test]
    fn test_unknown_parameter_is_skipped() {
        let scopes = scopes_with_a(0.0);
        let events = [
            ParameterEvent::immediate(42, Scope::Global, 0, 0, 1.0),
            ParameterEvent::immediate(A, Scope::Output, 3, 0, 1.0),
        ];
        assert_eq!(run(&events, 32, &scopes), vec![(0, 32, 0.0)]);
        assert!(REJECTED_EVENT_WARNING_LOGGED.load(Ordering::Relaxed));
    }

    #[test]
    fn test_schedule_drops_unknown_targets() {
        let scopes = scopes_with_a(0.0);
        let mut scheduler = AutomationScheduler::new();
        let events = [
            ParameterEvent::immediate(42, Scope::Global, 0, 0, 1.0),
            ParameterEvent::immediate(A, Scope::Global, 0, 8, 1.0),
            ParameterEvent::immediate(A, Scope::Output, 3, 0, 1.0),
        ];
        assert_eq!(
            scheduler.schedule(&events, &scopes, true),
            Err(AuError::InvalidParameter(42)),
            "first rejection is reported"
        );
        assert_eq!(scheduler.events().len(), 1, "valid events are still queued");
        assert_eq!(scheduler.events().iter().next().map(|e| e.parameter), Some(A));
    }

    #[test]
    fn test_list_capacity_is_fixed() {
        let mut list = ParameterEventList::with_capacity(2);
        let capacity = list.capacity();
        let event = ParameterEvent::immediate(A, Scope::Global, 0, 0, 1.0);
        for _ in 0..capacity {
            assert!(list.push(event));
        }
        assert!(!list.push(event), "full list drops events");
        assert_eq!(list.capacity(), capacity, "push never grows the list");

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.capacity(), capacity);
    }

    #[test]
    fn test_schedule_without_slicing_applies_immediately() {
        let scopes = scopes_with_a(0.0);
        let mut scheduler = AutomationScheduler::new();
        let events = [
            ParameterEvent::immediate(A, Scope::Global, 0, 64, 0.8),
            ParameterEvent::ramp(A, Scope::Global, 0, 0, 64, 0.0, 1.0),
        ];
        scheduler.schedule(&events, &scopes, false).unwrap();
        assert!(!scheduler.has_events());
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(0.8));

        let unknown = [ParameterEvent::immediate(7, Scope::Global, 0, 0, 1.0)];
        assert_eq!(
            scheduler.schedule(&unknown, &scopes, false),
            Err(AuError::InvalidParameter(7))
        );
    }

    #[test]
    fn test_scheduler_queues_and_clears() {
        let scopes = scopes_with_a(0.0);
        let mut scheduler = AutomationScheduler::new();
        let events = [ParameterEvent::immediate(A, Scope::Global, 0, 16, 1.0)];
        scheduler.schedule(&events, &scopes, true).unwrap();
        assert!(scheduler.has_events());
        assert_eq!(scopes.get(A, Scope::Global, 0), Ok(0.0), "queued, not applied yet");

        let mut starts = Vec::new();
        scheduler
            .process(32, &scopes, |start, _, _| {
                starts.push(start);
                Ok(())
            })
            .unwrap();
        assert_eq!(starts, vec![0, 16]);

        scheduler.clear();
        assert!(!scheduler.has_events());
    }
}
