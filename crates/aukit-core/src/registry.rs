//! Deferred-apply lock-free registry.
//!
//! This module provides [`DeferredRegistry`], an observer list that any thread
//! can change without locks and that one designated thread (the render thread)
//! reads without locks.
//!
//! # Pattern
//!
//! Records live on exactly one of three intrusive singly-linked stacks:
//!
//! 1. **pending**: add/remove/clear requests, pushed by any thread (CAS on head)
//! 2. **active**: the materialized list, touched only by the applying thread
//! 3. **free**: recycled records, pushed and popped by any thread
//!
//! [`Registrar::add`], [`Registrar::remove`] and [`Registrar::clear`] take a
//! record from the free stack and push a request onto the pending stack.
//! [`DeferredRegistry::apply`] pops the whole pending stack, reverses it back
//! into submission order and replays every request against the active list.
//!
//! # Ownership
//!
//! The single-applier rule is carried by the types: only the owner of the
//! (non-`Clone`) [`DeferredRegistry`] can call `apply` or iterate, while any
//! number of [`Registrar`] handles can be cloned and sent to control threads.
//!
//! ```text
//! control threads                      render thread
//! Registrar::add ──┐
//! Registrar::remove├─► pending ──apply()──► active ──iter()──► observers
//! Registrar::clear ┘                          │
//!                        free ◄───recycle─────┘
//! ```
//!
//! # Real-Time Safety
//!
//! - `apply()` never allocates: records are recycled into the free stack, not freed
//! - Recycled records keep their stale payload until a control thread reuses
//!   the record or calls [`Registrar::release_stale`], so payload destructors
//!   run off the render thread
//! - `add()`/`remove()`/`clear()` allocate only when the free stack is empty;
//!   [`Registrar::reserve`] pre-populates it during setup
//! - Records are only freed when the registry itself is dropped

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam::utils::{Backoff, CachePadded};

// =============================================================================
// Records
// =============================================================================

/// Request kind carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Remove,
    Clear,
}

/// One observer record. Owned by exactly one stack at a time.
struct Record<T> {
    next: *mut Record<T>,
    op: Op,
    /// `None` only for clear requests and never-used records.
    payload: Option<T>,
}

// =============================================================================
// AtomicStack
// =============================================================================

/// Lock-free LIFO of boxed records, linked through `Record::next`.
///
/// `pop_all` is a single atomic swap, so it is immune to ABA. `pop` is built
/// on top of it (take everything, push the remainder back) and is therefore
/// safe with multiple concurrent poppers.
struct AtomicStack<T> {
    head: CachePadded<AtomicPtr<Record<T>>>,
}

impl<T> AtomicStack<T> {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Push one record.
    ///
    /// # Safety
    ///
    /// `record` must be a valid pointer obtained from `Box::into_raw` that no
    /// other stack or thread currently references.
    unsafe fn push(&self, record: *mut Record<T>) {
        self.push_chain(record, record);
    }

    /// Push a linked chain `first ..= last` with a single CAS.
    ///
    /// # Safety
    ///
    /// `first` must reach `last` by following `next`, and the caller must own
    /// every record in the chain.
    unsafe fn push_chain(&self, first: *mut Record<T>, last: *mut Record<T>) {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            (*last).next = head;
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach the whole stack, most recently pushed record first.
    fn pop_all(&self) -> *mut Record<T> {
        self.head.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Detach the whole stack in push order (oldest first).
    fn pop_all_reversed(&self) -> *mut Record<T> {
        let mut reversed: *mut Record<T> = ptr::null_mut();
        let mut record = self.pop_all();
        while !record.is_null() {
            // SAFETY: pop_all transferred ownership of the chain to us.
            unsafe {
                let next = (*record).next;
                (*record).next = reversed;
                reversed = record;
                record = next;
            }
        }
        reversed
    }

    /// Pop one record, or null if the stack is empty.
    ///
    /// Inefficient for long stacks (the remainder is walked to find its
    /// tail), which is fine for a free list that is mostly short.
    fn pop(&self) -> *mut Record<T> {
        let first = self.pop_all();
        if first.is_null() {
            return first;
        }
        // SAFETY: pop_all transferred ownership of the chain to us.
        unsafe {
            let rest = (*first).next;
            (*first).next = ptr::null_mut();
            if !rest.is_null() {
                let mut last = rest;
                while !(*last).next.is_null() {
                    last = (*last).next;
                }
                self.push_chain(rest, last);
            }
        }
        first
    }

    /// Free every record still on the stack.
    ///
    /// Requires `&mut self`, so no other thread can be pushing or popping.
    fn free_all(&mut self) {
        let mut record = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !record.is_null() {
            // SAFETY: every record was created by Box::into_raw and is owned
            // by this stack alone.
            let boxed = unsafe { Box::from_raw(record) };
            record = boxed.next;
        }
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        let mut n = 0;
        let mut record = self.head.load(Ordering::Acquire);
        while !record.is_null() {
            n += 1;
            record = unsafe { (*record).next };
        }
        n
    }
}

// =============================================================================
// Shared state (pending + free stacks)
// =============================================================================

struct Shared<T> {
    pending: AtomicStack<T>,
    free: AtomicStack<T>,
    _owns: PhantomData<Box<Record<T>>>,
}

// SAFETY: all cross-thread access goes through the atomic stack heads; payloads
// move between threads with their records, which requires `T: Send`.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Take a record from the free stack, or allocate one.
    fn alloc(&self, op: Op, payload: Option<T>) -> *mut Record<T> {
        let record = self.free.pop();
        if record.is_null() {
            return Box::into_raw(Box::new(Record {
                next: ptr::null_mut(),
                op,
                payload,
            }));
        }
        // SAFETY: pop gave us exclusive ownership. Assigning the payload drops
        // the stale one here, on the requesting thread.
        unsafe {
            (*record).op = op;
            (*record).payload = payload;
        }
        record
    }

    fn request(&self, op: Op, payload: Option<T>) {
        let record = self.alloc(op, payload);
        // SAFETY: record is freshly allocated or popped and owned by us.
        unsafe { self.pending.push(record) };
    }

    /// Drop the payloads of every record on the free stack.
    fn release_stale(&self) {
        let first = self.free.pop_all();
        if first.is_null() {
            return;
        }
        // SAFETY: pop_all transferred ownership of the chain to us; it is
        // pushed back whole once the payloads are dropped.
        unsafe {
            let mut last = first;
            loop {
                (*last).payload = None;
                if (*last).next.is_null() {
                    break;
                }
                last = (*last).next;
            }
            self.free.push_chain(first, last);
        }
    }

    /// Return a record to the free stack without touching its payload.
    ///
    /// # Safety
    ///
    /// The caller must own `record` and have unlinked it from every list.
    unsafe fn recycle(&self, record: *mut Record<T>) {
        self.free.push(record);
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.pending.free_all();
        self.free.free_all();
    }
}

// =============================================================================
// Registrar
// =============================================================================

/// Handle for submitting registry changes from any thread.
///
/// Cheap to clone; every clone feeds the same [`DeferredRegistry`]. Requests
/// become visible to the registry's owner at its next
/// [`apply`](DeferredRegistry::apply).
pub struct Registrar<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Registrar<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Registrar<T> {
    /// Request that `item` be added. Duplicates are dropped at apply time.
    pub fn add(&self, item: T) {
        self.shared.request(Op::Add, Some(item));
    }

    /// Request that the entry equal to `item` be removed.
    ///
    /// Removing an absent item is not an error.
    pub fn remove(&self, item: T) {
        self.shared.request(Op::Remove, Some(item));
    }

    /// Request that every active entry be removed.
    pub fn clear(&self) {
        self.shared.request(Op::Clear, None);
    }

    /// Drop payloads left on recycled records.
    ///
    /// A removed entry stays alive on its recycled record until the record is
    /// reused. Call this after the removal has been applied to release it now.
    /// Payload destructors run on the calling thread, so keep it off the
    /// real-time path.
    pub fn release_stale(&self) {
        self.shared.release_stale();
    }

    /// Pre-allocate `count` records on the free stack.
    ///
    /// Call during setup so steady-state requests never allocate.
    pub fn reserve(&self, count: usize) {
        for _ in 0..count {
            let record = Box::into_raw(Box::new(Record {
                next: ptr::null_mut(),
                op: Op::Clear,
                payload: None,
            }));
            // SAFETY: freshly allocated and unshared.
            unsafe { self.shared.recycle(record) };
        }
    }
}

// =============================================================================
// DeferredRegistry
// =============================================================================

/// Lock-free observer registry with deferred application.
///
/// Owned by the applying (render) thread. Control threads talk to it through
/// [`Registrar`] handles obtained from [`registrar()`](Self::registrar).
///
/// # Ordering
///
/// Requests from one thread are applied in the order they were submitted.
/// Requests from different threads have no relative order beyond this: every
/// request present when `apply()` runs is applied before any request submitted
/// after `apply()` returns.
///
/// # Example
///
/// ```
/// use aukit_core::DeferredRegistry;
///
/// let mut registry = DeferredRegistry::new();
/// let registrar = registry.registrar();
///
/// registrar.add(7);
/// assert_eq!(registry.iter().count(), 0); // not applied yet
///
/// registry.apply();
/// assert_eq!(registry.iter().copied().collect::<Vec<_>>(), vec![7]);
/// ```
pub struct DeferredRegistry<T> {
    shared: Arc<Shared<T>>,
    /// Head of the active list. Only touched by the owner.
    active: *mut Record<T>,
    len: usize,
}

// SAFETY: the active list is owned exclusively by this value, and payloads
// only move with their records.
unsafe impl<T: Send> Send for DeferredRegistry<T> {}
// SAFETY: shared access only reads the active list (`iter`); mutation needs `&mut self`.
unsafe impl<T: Send + Sync> Sync for DeferredRegistry<T> {}

impl<T: PartialEq> DeferredRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: AtomicStack::new(),
                free: AtomicStack::new(),
                _owns: PhantomData,
            }),
            active: ptr::null_mut(),
            len: 0,
        }
    }

    /// Create an empty registry with `count` records pre-allocated.
    pub fn with_capacity(count: usize) -> Self {
        let registry = Self::new();
        registry.reserve(count);
        registry
    }

    /// Get a handle for submitting changes from other threads.
    pub fn registrar(&self) -> Registrar<T> {
        Registrar {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pre-allocate `count` records. See [`Registrar::reserve`].
    pub fn reserve(&self, count: usize) {
        self.registrar().reserve(count);
    }

    /// Request that `item` be added. See [`Registrar::add`].
    pub fn add(&self, item: T) {
        self.shared.request(Op::Add, Some(item));
    }

    /// Request that `item` be removed. See [`Registrar::remove`].
    pub fn remove(&self, item: T) {
        self.shared.request(Op::Remove, Some(item));
    }

    /// Request that the registry be cleared. See [`Registrar::clear`].
    pub fn clear(&self) {
        self.shared.request(Op::Clear, None);
    }

    /// Replay all pending requests against the active list.
    ///
    /// Real-time safe: no allocation, no locks, bounded by the number of
    /// pending requests times the active list length. Returns `true` if any
    /// request was processed.
    pub fn apply(&mut self) -> bool {
        let mut request = self.shared.pending.pop_all_reversed();
        if request.is_null() {
            return false;
        }

        while !request.is_null() {
            // SAFETY: pop_all_reversed handed us the chain; each request is
            // unlinked before it is placed on another list.
            unsafe {
                let next = (*request).next;
                (*request).next = ptr::null_mut();
                match (*request).op {
                    Op::Add => self.apply_add(request),
                    Op::Remove => self.apply_remove(request),
                    Op::Clear => self.apply_clear(request),
                }
                request = next;
            }
        }
        true
    }

    unsafe fn apply_add(&mut self, request: *mut Record<T>) {
        let mut tail: *mut Record<T> = ptr::null_mut();
        let mut node = self.active;
        while !node.is_null() {
            if (*node).payload == (*request).payload {
                self.shared.recycle(request);
                return;
            }
            tail = node;
            node = (*node).next;
        }

        if tail.is_null() {
            self.active = request;
        } else {
            (*tail).next = request;
        }
        self.len += 1;
    }

    unsafe fn apply_remove(&mut self, request: *mut Record<T>) {
        let mut previous: *mut Record<T> = ptr::null_mut();
        let mut node = self.active;
        while !node.is_null() {
            if (*node).payload == (*request).payload {
                let next = (*node).next;
                if previous.is_null() {
                    self.active = next;
                } else {
                    (*previous).next = next;
                }
                (*node).next = ptr::null_mut();
                self.shared.recycle(node);
                self.len -= 1;
                break;
            }
            previous = node;
            node = (*node).next;
        }
        self.shared.recycle(request);
    }

    unsafe fn apply_clear(&mut self, request: *mut Record<T>) {
        let mut node = std::mem::replace(&mut self.active, ptr::null_mut());
        while !node.is_null() {
            let next = (*node).next;
            (*node).next = ptr::null_mut();
            self.shared.recycle(node);
            node = next;
        }
        self.len = 0;
        self.shared.recycle(request);
    }
}

impl<T> DeferredRegistry<T> {
    /// Iterate over the active entries as of the last [`apply`](Self::apply).
    ///
    /// Entries appear in the order they were added.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            node: self.active,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.shared.free.count()
    }

    /// Number of active entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the active list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T: PartialEq> Default for DeferredRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DeferredRegistry<T> {
    fn drop(&mut self) {
        let mut node = std::mem::replace(&mut self.active, ptr::null_mut());
        while !node.is_null() {
            // SAFETY: the active list is owned by this registry alone.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

impl<'a, T> IntoIterator for &'a DeferredRegistry<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Forward iterator over a registry's active entries.
pub struct Iter<'a, T> {
    node: *const Record<T>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        // SAFETY: the active list cannot change while the registry is borrowed.
        while let Some(record) = unsafe { self.node.as_ref() } {
            self.node = record.next;
            if let Some(item) = record.payload.as_ref() {
                return Some(item);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(registry: &DeferredRegistry<u32>) -> Vec<u32> {
        registry.iter().copied().collect()
    }

    #[test]
    fn test_add_not_visible_before_apply() {
        let mut registry = DeferredRegistry::new();
        registry.add(1u32);
        assert!(registry.is_empty());
        assert_eq!(active(&registry), Vec::<u32>::new());

        assert!(registry.apply());
        assert_eq!(active(&registry), vec![1]);
    }

    #[test]
    fn test_apply_without_requests() {
        let mut registry: DeferredRegistry<u32> = DeferredRegistry::new();
        assert!(!registry.apply());
    }

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let mut registry = DeferredRegistry::new();
        registry.add(5u32);
        registry.add(5);
        registry.apply();
        registry.add(5);
        registry.apply();
        assert_eq!(active(&registry), vec![5]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_ignored() {
        let mut registry = DeferredRegistry::new();
        registry.add(1u32);
        registry.remove(2);
        registry.apply();
        assert_eq!(active(&registry), vec![1]);
    }

    #[test]
    fn test_submission_order_preserved() {
        let mut registry = DeferredRegistry::new();
        for i in 1..=3u32 {
            registry.add(i);
        }
        registry.apply();
        assert_eq!(active(&registry), vec![1, 2, 3]);

        registry.add(4);
        registry.remove(2);
        registry.add(2);
        registry.apply();
        assert_eq!(active(&registry), vec![1, 3, 4, 2]);
    }

    #[test]
    fn test_remove_then_add_same_batch() {
        let mut registry = DeferredRegistry::new();
        registry.add(9u32);
        registry.remove(9);
        registry.apply();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_then_add() {
        let mut registry = DeferredRegistry::new();
        registry.add(1u32);
        registry.add(2);
        registry.apply();

        registry.clear();
        registry.add(3);
        registry.apply();
        assert_eq!(active(&registry), vec![3]);
    }

    #[test]
    fn test_iteration_is_restartable() {
        let mut registry = DeferredRegistry::new();
        registry.add(1u32);
        registry.add(2);
        registry.apply();
        assert_eq!(active(&registry), active(&registry));
        let mut sum = 0;
        for item in &registry {
            sum += item;
        }
        assert_eq!(sum, 3);
    }

    #[test]
    fn test_matches_ordered_set_model() {
        // Deterministic pseudo-random sequence of operations (LCG)
        let mut seed: u32 = 0x1234_5678;
        let mut next = move || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            seed >> 16
        };

        let mut registry = DeferredRegistry::new();
        let mut model: Vec<u32> = Vec::new();

        for _ in 0..2000 {
            let value = next() % 16;
            match next() % 10 {
                0 => {
                    registry.clear();
                    model.clear();
                }
                1..=5 => {
                    registry.add(value);
                    if !model.contains(&value) {
                        model.push(value);
                    }
                }
                _ => {
                    registry.remove(value);
                    model.retain(|v| *v != value);
                }
            }
            if next() % 4 == 0 {
                registry.apply();
                assert_eq!(active(&registry), model);
            }
        }
        registry.apply();
        assert_eq!(active(&registry), model);
        assert_eq!(registry.len(), model.len());
    }

    #[test]
    fn test_records_are_recycled() {
        let mut registry = DeferredRegistry::with_capacity(4);
        assert_eq!(registry.shared.free.count(), 4);

        for round in 0..100u32 {
            registry.add(round);
            registry.remove(round);
            registry.apply();
        }
        // Steady state never grew the record pool
        assert_eq!(registry.shared.free.count(), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_stale_drops_removed_payloads() {
        let token = Arc::new(());
        let mut registry = DeferredRegistry::with_capacity(2);
        let registrar = registry.registrar();

        registrar.add(Arc::clone(&token));
        registry.apply();
        registrar.remove(Arc::clone(&token));
        registry.apply();
        assert!(registry.is_empty());
        assert_eq!(Arc::strong_count(&token), 3, "payloads linger on recycled records");

        registrar.release_stale();
        assert_eq!(Arc::strong_count(&token), 1);
        assert_eq!(registry.shared.free.count(), 2, "records stay pooled");
    }

    #[test]
    fn test_registrar_from_other_thread() {
        let mut registry = DeferredRegistry::new();
        let registrar = registry.registrar();
        std::thread::spawn(move || {
            registrar.add(11u32);
            registrar.add(12);
        })
        .join()
        .unwrap();
        registry.apply();
        assert_eq!(active(&registry), vec![11, 12]);
    }

    #[test]
    fn test_drop_releases_payloads() {
        let token = Arc::new(());
        {
            let mut registry = DeferredRegistry::new();
            registry.add(Arc::clone(&token));
            registry.apply();
            // Pending request that is never applied
            registry.remove(Arc::clone(&token));
            assert_eq!(Arc::strong_count(&token), 3);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_registrar_outlives_registry() {
        let token = Arc::new(());
        let registrar = {
            let registry: DeferredRegistry<Arc<()>> = DeferredRegistry::new();
            registry.registrar()
        };
        registrar.add(Arc::clone(&token));
        assert_eq!(Arc::strong_count(&token), 2);
        drop(registrar);
        assert_eq!(Arc::strong_count(&token), 1);
    }
}
