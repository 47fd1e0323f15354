//! Fixed-capacity buffer arena for real-time rendering.
//!
//! This module provides [`AllocatedBuffer`], a zero-filled slab carved into one
//! region per channel buffer, and [`BufferList`], which tracks whether its
//! channel buffers currently point into that slab, at caller-supplied memory,
//! or nowhere.
//!
//! # Pattern
//!
//! 1. Allocate once per format/capacity change (non-real-time)
//! 2. Prepare on every render call (narrows lengths, never allocates)
//! 3. Read or write the prepared channel data
//! 4. Invalidate when the render call is done with the buffers
//!
//! # Memory Layout
//!
//! Every region starts on a 16-byte boundary and the per-buffer capacity is
//! rounded up to a multiple of 16, so each region can be viewed as `f32` or
//! `f64` samples directly:
//!
//! ```text
//! storage: | buffer 0 (max bytes) | buffer 1 (max bytes) | ... |
//!          ^ offset 0             ^ offset max_bytes
//! ```
//!
//! # Real-Time Safety
//!
//! - `prepare()`/`prepare_null()` only write into pre-sized view slots
//! - Capacity violations are reported as errors, never grown
//! - All allocation happens in [`BufferAllocator::allocate`] (non-real-time)

use std::mem::size_of;
use std::ptr;
use std::slice;

use aukit_utils::{checked_mul_add_u32, round_up_to_power_of_two};

use crate::error::{AuError, AuResult};
use crate::sample::Sample;
use crate::types::{StreamFormat, BUFFER_ALIGNMENT, MAX_BUFFER_LIST_SIZE};

// =============================================================================
// Channel Buffers
// =============================================================================

/// Caller-owned channel buffer, in the layout of a Core Audio `AudioBuffer`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExternalBuffer {
    /// Number of interleaved channels in the buffer.
    pub number_channels: u32,
    /// Size of the buffer in bytes.
    pub data_byte_size: u32,
    /// Pointer to the audio data. May be null when `data_byte_size` is 0.
    pub data: *mut u8,
}

impl ExternalBuffer {
    /// Describe a sample slice owned by the caller.
    ///
    /// Fails when the slice is larger than a 32-bit byte size can describe.
    pub fn from_samples<S: Sample>(number_channels: u32, samples: &mut [S]) -> AuResult<Self> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(samples);
        Ok(Self {
            number_channels,
            data_byte_size: byte_size(bytes.len())?,
            data: bytes.as_mut_ptr(),
        })
    }
}

fn byte_size(len: usize) -> AuResult<u32> {
    u32::try_from(len).map_err(|_| AuError::InsufficientCapacity {
        requested: len as u64,
        capacity: u32::MAX as u64,
    })
}

/// Where a channel buffer's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferData {
    /// No data; the caller (or an upstream render) supplies it later.
    Null,
    /// Byte offset into the owning arena.
    Arena(usize),
    /// Memory owned by the caller.
    External(*mut u8),
}

/// One channel buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBuffer {
    /// Number of interleaved channels in the buffer.
    pub number_channels: u32,
    /// Prepared size in bytes.
    pub data_byte_size: u32,
    /// Location of the data.
    pub data: BufferData,
}

impl ChannelBuffer {
    const EMPTY: Self = Self {
        number_channels: 0,
        data_byte_size: 0,
        data: BufferData::Null,
    };

    /// Whether the buffer has a nonzero size but nowhere to put it.
    #[inline]
    fn is_dangling(&self) -> bool {
        self.data == BufferData::Null && self.data_byte_size != 0
    }
}

/// Maximum number of channel buffers one allocation can describe.
pub const MAX_BUFFERS: u32 = (MAX_BUFFER_LIST_SIZE / size_of::<ChannelBuffer>()) as u32;

// =============================================================================
// AllocatedBuffer
// =============================================================================

/// One 16-byte-aligned unit of arena storage.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Chunk([u8; 16]);

// SAFETY: a plain byte array with size == alignment, so no padding and every
// bit pattern is valid.
unsafe impl bytemuck::Zeroable for Chunk {}
unsafe impl bytemuck::Pod for Chunk {}

/// Fixed-capacity arena of channel buffers.
///
/// Created by a [`BufferAllocator`]. Capacity never changes after creation.
pub struct AllocatedBuffer {
    max_buffers: u32,
    max_bytes_per_buffer: u32,
    storage: Vec<Chunk>,
    /// View slots, `max(1, max_buffers)` long. Only the first `number_buffers`
    /// are meaningful.
    views: Vec<ChannelBuffer>,
    number_buffers: u32,
}

// SAFETY: external pointers are only dereferenced through `BufferList`, whose
// `set_buffer_list`/`set_buffer` contracts require them to stay valid on the
// thread that renders.
unsafe impl Send for AllocatedBuffer {}

impl AllocatedBuffer {
    /// Reserve zeroed storage for `number_buffers` buffers of up to
    /// `max_bytes_per_buffer` bytes each.
    ///
    /// # Errors
    ///
    /// - [`AuError::TooManyBuffers`] above [`MAX_BUFFERS`]
    /// - [`AuError::OutOfMemory`] if the total size overflows `u32` or the
    ///   storage cannot be reserved
    pub fn new(number_buffers: u32, max_bytes_per_buffer: u32) -> AuResult<Self> {
        if number_buffers > MAX_BUFFERS {
            return Err(AuError::TooManyBuffers {
                requested: number_buffers,
                maximum: MAX_BUFFERS,
            });
        }

        let rounded = round_up_to_power_of_two(max_bytes_per_buffer, BUFFER_ALIGNMENT)
            .ok_or_else(|| {
                AuError::OutOfMemory(format!(
                    "{max_bytes_per_buffer} bytes per buffer overflows when aligned"
                ))
            })?;
        let total = checked_mul_add_u32(number_buffers, rounded, 0).ok_or_else(|| {
            AuError::OutOfMemory(format!(
                "{number_buffers} buffers of {rounded} bytes overflow a 32-bit size"
            ))
        })?;

        let chunks = (total / BUFFER_ALIGNMENT) as usize;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(chunks)
            .map_err(|e| AuError::OutOfMemory(format!("{total} bytes: {e}")))?;
        storage.resize(chunks, bytemuck::Zeroable::zeroed());

        let mut views = Vec::new();
        let slots = number_buffers.max(1) as usize;
        views
            .try_reserve_exact(slots)
            .map_err(|e| AuError::OutOfMemory(format!("{slots} buffer views: {e}")))?;
        views.resize(slots, ChannelBuffer::EMPTY);

        log::debug!(
            "Allocated buffer arena: {} buffers x {} bytes ({} bytes total)",
            number_buffers,
            rounded,
            total
        );

        Ok(Self {
            max_buffers: number_buffers,
            max_bytes_per_buffer: rounded,
            storage,
            views,
            number_buffers: 0,
        })
    }

    /// Maximum number of channel buffers.
    #[inline]
    pub fn max_buffers(&self) -> u32 {
        self.max_buffers
    }

    /// Capacity of each channel buffer in bytes (rounded to 16).
    #[inline]
    pub fn max_bytes_per_buffer(&self) -> u32 {
        self.max_bytes_per_buffer
    }

    /// Total arena size in bytes.
    #[inline]
    pub fn storage_bytes(&self) -> usize {
        self.storage.len() * BUFFER_ALIGNMENT as usize
    }

    /// Prepared channel buffers.
    #[inline]
    pub fn buffers(&self) -> &[ChannelBuffer] {
        &self.views[..self.number_buffers as usize]
    }

    /// Point `number_buffers` views into the arena, each `bytes_per_buffer` long.
    ///
    /// Real-time safe. On error nothing is changed.
    pub fn prepare(
        &mut self,
        channels_per_buffer: u32,
        number_buffers: u32,
        bytes_per_buffer: u32,
    ) -> AuResult<()> {
        self.check_count(number_buffers)?;
        if bytes_per_buffer > self.max_bytes_per_buffer {
            return Err(AuError::InsufficientCapacity {
                requested: bytes_per_buffer as u64,
                capacity: self.max_bytes_per_buffer as u64,
            });
        }
        if number_buffers > 0 {
            // Extent of the last region
            let extent = checked_mul_add_u32(
                number_buffers - 1,
                self.max_bytes_per_buffer,
                bytes_per_buffer,
            )
            .ok_or(AuError::InsufficientCapacity {
                requested: u64::from(number_buffers) * u64::from(self.max_bytes_per_buffer),
                capacity: self.storage_bytes() as u64,
            })?;
            if extent as usize > self.storage_bytes() {
                return Err(AuError::InsufficientCapacity {
                    requested: extent as u64,
                    capacity: self.storage_bytes() as u64,
                });
            }
        }

        let stride = self.max_bytes_per_buffer as usize;
        for (i, view) in self.views[..number_buffers as usize].iter_mut().enumerate() {
            *view = ChannelBuffer {
                number_channels: channels_per_buffer,
                data_byte_size: bytes_per_buffer,
                data: BufferData::Arena(i * stride),
            };
        }
        self.number_buffers = number_buffers;
        Ok(())
    }

    /// Like [`prepare`](Self::prepare), but with null data pointers.
    ///
    /// Used when the caller will supply the memory. The byte size is
    /// recorded but not checked against the arena.
    pub fn prepare_null(
        &mut self,
        channels_per_buffer: u32,
        number_buffers: u32,
        bytes_per_buffer: u32,
    ) -> AuResult<()> {
        self.check_count(number_buffers)?;
        for view in &mut self.views[..number_buffers as usize] {
            *view = ChannelBuffer {
                number_channels: channels_per_buffer,
                data_byte_size: bytes_per_buffer,
                data: BufferData::Null,
            };
        }
        self.number_buffers = number_buffers;
        Ok(())
    }

    fn check_count(&self, number_buffers: u32) -> AuResult<()> {
        if number_buffers > self.max_buffers {
            return Err(AuError::FormatNotSupported {
                requested: number_buffers,
                allocated: self.max_buffers,
            });
        }
        Ok(())
    }

    fn set_views(&mut self, buffers: &[ExternalBuffer]) {
        for (view, external) in self.views.iter_mut().zip(buffers) {
            *view = ChannelBuffer {
                number_channels: external.number_channels,
                data_byte_size: external.data_byte_size,
                data: external_data(external.data),
            };
        }
        self.number_buffers = buffers.len() as u32;
    }

    /// Writable capacity of a view in bytes, or `None` if unknown.
    fn capacity_of(&self, view: &ChannelBuffer) -> Option<u32> {
        match view.data {
            BufferData::Arena(_) => Some(self.max_bytes_per_buffer),
            BufferData::External(_) => Some(view.data_byte_size),
            BufferData::Null => None,
        }
    }

    fn data_ptr(&self, view: &ChannelBuffer) -> *const u8 {
        match view.data {
            BufferData::Null => ptr::null(),
            BufferData::Arena(offset) => bytemuck::cast_slice::<Chunk, u8>(&self.storage)[offset..].as_ptr(),
            BufferData::External(data) => data,
        }
    }

    fn data_mut_ptr(&mut self, view: &ChannelBuffer) -> *mut u8 {
        match view.data {
            BufferData::Null => ptr::null_mut(),
            BufferData::Arena(offset) => {
                bytemuck::cast_slice_mut::<Chunk, u8>(&mut self.storage)[offset..].as_mut_ptr()
            }
            BufferData::External(data) => data,
        }
    }
}

fn external_data(data: *mut u8) -> BufferData {
    if data.is_null() {
        BufferData::Null
    } else {
        BufferData::External(data)
    }
}

// =============================================================================
// BufferAllocator
// =============================================================================

/// Source of buffer arenas.
///
/// Implement this to place arenas in custom memory or to track allocations.
/// Both methods are called from non-real-time code only.
pub trait BufferAllocator {
    /// Create an arena for `number_buffers` buffers of up to
    /// `max_bytes_per_buffer` bytes each.
    fn allocate(&mut self, number_buffers: u32, max_bytes_per_buffer: u32)
        -> AuResult<AllocatedBuffer>;

    /// Release an arena.
    fn deallocate(&mut self, buffer: AllocatedBuffer) {
        drop(buffer);
    }
}

/// Default allocator backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapBufferAllocator;

impl BufferAllocator for HeapBufferAllocator {
    fn allocate(
        &mut self,
        number_buffers: u32,
        max_bytes_per_buffer: u32,
    ) -> AuResult<AllocatedBuffer> {
        AllocatedBuffer::new(number_buffers, max_bytes_per_buffer)
    }
}

// =============================================================================
// BufferList
// =============================================================================

/// Where a [`BufferList`]'s views currently point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerState {
    /// Views must not be read.
    #[default]
    Invalid,
    /// Views point into the owned arena.
    ToMyMemory,
    /// Views point at caller memory (or are null).
    ToExternalMemory,
}

/// Channel buffers for one bus, backed by an arena or by caller memory.
pub struct BufferList<A: BufferAllocator = HeapBufferAllocator> {
    state: PointerState,
    allocated_frames: u32,
    arena: Option<AllocatedBuffer>,
    allocator: A,
}

impl BufferList<HeapBufferAllocator> {
    /// Create an unallocated list using the heap allocator.
    pub fn new() -> Self {
        Self::with_allocator(HeapBufferAllocator)
    }
}

impl Default for BufferList<HeapBufferAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: BufferAllocator> BufferList<A> {
    /// Create an unallocated list using a custom allocator.
    pub fn with_allocator(allocator: A) -> Self {
        Self {
            state: PointerState::Invalid,
            allocated_frames: 0,
            arena: None,
            allocator,
        }
    }

    /// Reserve storage for `frames` frames of `format`.
    ///
    /// Non-real-time. Any previous arena is released first; the list is left
    /// [`Invalid`](PointerState::Invalid) until the next prepare.
    pub fn allocate(&mut self, format: &StreamFormat, frames: u32) -> AuResult<()> {
        self.deallocate();

        let bytes = checked_mul_add_u32(frames, format.bytes_per_frame, 0).ok_or_else(|| {
            AuError::OutOfMemory(format!(
                "{frames} frames of {} bytes overflow a 32-bit size",
                format.bytes_per_frame
            ))
        })?;
        let arena = self.allocator.allocate(format.channel_streams(), bytes)?;
        self.arena = Some(arena);
        self.allocated_frames = frames;
        Ok(())
    }

    /// Release the arena. Non-real-time.
    pub fn deallocate(&mut self) {
        if let Some(arena) = self.arena.take() {
            self.allocator.deallocate(arena);
        }
        self.allocated_frames = 0;
        self.state = PointerState::Invalid;
    }

    /// Point the views into the arena for `frames` frames of `format`.
    ///
    /// Real-time safe.
    pub fn prepare_buffer(&mut self, format: &StreamFormat, frames: u32) -> AuResult<()> {
        if frames > self.allocated_frames {
            return Err(AuError::TooManyFrames {
                requested: frames,
                maximum: self.allocated_frames,
            });
        }
        let arena = self.arena_for(format)?;
        // frames <= allocated_frames, so this fits the checked allocation size
        let bytes = frames.saturating_mul(format.bytes_per_frame);
        arena.prepare(format.channels_per_stream(), format.channel_streams(), bytes)?;
        self.state = PointerState::ToMyMemory;
        Ok(())
    }

    /// Size the views for `frames` frames of `format`, with null data.
    ///
    /// Real-time safe. The caller supplies memory afterwards with
    /// [`set_buffer`](Self::set_buffer) or [`set_buffer_list`](Self::set_buffer_list).
    pub fn prepare_null_buffer(&mut self, format: &StreamFormat, frames: u32) -> AuResult<()> {
        let arena = self.arena_for(format)?;
        let bytes = frames.saturating_mul(format.bytes_per_frame);
        arena.prepare_null(format.channels_per_stream(), format.channel_streams(), bytes)?;
        self.state = PointerState::ToExternalMemory;
        Ok(())
    }

    fn arena_for(&mut self, format: &StreamFormat) -> AuResult<&mut AllocatedBuffer> {
        let allocated = self.allocated_streams();
        let requested = format.channel_streams();
        match self.arena.as_mut() {
            Some(arena) if requested <= allocated => Ok(arena),
            _ => Err(AuError::FormatNotSupported { requested, allocated }),
        }
    }

    /// Use caller-supplied buffers.
    ///
    /// # Safety
    ///
    /// Every non-null `data` pointer must be valid for reads and writes of
    /// `data_byte_size` bytes, must not be accessed elsewhere, and must stay
    /// valid until the list is invalidated, re-prepared or deallocated.
    pub unsafe fn set_buffer_list(&mut self, buffers: &[ExternalBuffer]) -> AuResult<()> {
        let allocated = self.allocated_streams();
        let requested = buffers.len() as u32;
        match self.arena.as_mut() {
            Some(arena) if requested <= allocated => arena.set_views(buffers),
            _ => return Err(AuError::FormatNotSupported { requested, allocated }),
        }
        self.state = PointerState::ToExternalMemory;
        Ok(())
    }

    /// Replace one prepared view with a caller-supplied buffer.
    ///
    /// # Safety
    ///
    /// Same contract as [`set_buffer_list`](Self::set_buffer_list).
    pub unsafe fn set_buffer(&mut self, index: u32, buffer: ExternalBuffer) -> AuResult<()> {
        if self.state == PointerState::Invalid {
            return Err(AuError::InvalidBufferState);
        }
        let arena = self.arena.as_mut().ok_or(AuError::InvalidBufferState)?;
        if index >= arena.number_buffers {
            return Err(AuError::FormatNotSupported {
                requested: index + 1,
                allocated: arena.number_buffers,
            });
        }
        arena.views[index as usize] = ChannelBuffer {
            number_channels: buffer.number_channels,
            data_byte_size: buffer.data_byte_size,
            data: external_data(buffer.data),
        };
        self.state = PointerState::ToExternalMemory;
        Ok(())
    }

    /// Mark the views unreadable.
    #[inline]
    pub fn invalidate(&mut self) {
        self.state = PointerState::Invalid;
    }

    /// Current pointer state.
    #[inline]
    pub fn state(&self) -> PointerState {
        self.state
    }

    /// Frame capacity of the arena.
    #[inline]
    pub fn allocated_frames(&self) -> u32 {
        self.allocated_frames
    }

    /// Number of channel buffers the arena can describe.
    #[inline]
    pub fn allocated_streams(&self) -> u32 {
        self.arena.as_ref().map_or(0, AllocatedBuffer::max_buffers)
    }

    /// The prepared views.
    pub fn buffers(&self) -> AuResult<&[ChannelBuffer]> {
        Ok(self.valid_arena()?.buffers())
    }

    /// Number of prepared channel buffers (0 when invalid).
    pub fn len(&self) -> usize {
        self.buffers().map_or(0, <[ChannelBuffer]>::len)
    }

    /// Whether there are no readable channel buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn valid_arena(&self) -> AuResult<&AllocatedBuffer> {
        if self.state == PointerState::Invalid {
            return Err(AuError::InvalidBufferState);
        }
        self.arena.as_ref().ok_or(AuError::InvalidBufferState)
    }

    fn view(&self, index: usize) -> AuResult<ChannelBuffer> {
        let view = *self
            .valid_arena()?
            .buffers()
            .get(index)
            .ok_or(AuError::InvalidState("channel buffer index out of range"))?;
        if view.is_dangling() {
            return Err(AuError::InvalidBufferState);
        }
        Ok(view)
    }

    /// Bytes of channel buffer `index`.
    pub fn channel(&self, index: usize) -> AuResult<&[u8]> {
        let view = self.view(index)?;
        if view.data_byte_size == 0 {
            return Ok(&[]);
        }
        let arena = self.valid_arena()?;
        let data = arena.data_ptr(&view);
        // SAFETY: arena regions lie inside the storage (checked by prepare);
        // external regions are covered by the set_buffer_list contract.
        Ok(unsafe { slice::from_raw_parts(data, view.data_byte_size as usize) })
    }

    /// Mutable bytes of channel buffer `index`.
    pub fn channel_mut(&mut self, index: usize) -> AuResult<&mut [u8]> {
        let view = self.view(index)?;
        if view.data_byte_size == 0 {
            return Ok(&mut []);
        }
        let arena = self.arena.as_mut().ok_or(AuError::InvalidBufferState)?;
        let data = arena.data_mut_ptr(&view);
        // SAFETY: as in `channel`, and `&mut self` makes the access exclusive.
        Ok(unsafe { slice::from_raw_parts_mut(data, view.data_byte_size as usize) })
    }

    /// Channel buffer `index` viewed as samples.
    pub fn samples<S: Sample>(&self, index: usize) -> AuResult<&[S]> {
        bytemuck::try_cast_slice(self.channel(index)?)
            .map_err(|_| AuError::InvalidState("buffer layout does not match the sample type"))
    }

    /// Channel buffer `index` viewed as mutable samples.
    pub fn samples_mut<S: Sample>(&mut self, index: usize) -> AuResult<&mut [S]> {
        bytemuck::try_cast_slice_mut(self.channel_mut(index)?)
            .map_err(|_| AuError::InvalidState("buffer layout does not match the sample type"))
    }

    /// Zero the prepared bytes of every channel buffer. Real-time safe.
    pub fn zero(&mut self) -> AuResult<()> {
        let count = self.valid_arena()?.number_buffers as usize;
        for index in 0..count {
            self.channel_mut(index)?.fill(0);
        }
        Ok(())
    }

    /// Copy every channel buffer into `dest`.
    ///
    /// When `dest` has more buffers than `self`, the last source buffer is
    /// duplicated into the extra ones. Each destination's size becomes its
    /// source's size. Real-time safe.
    pub fn copy_contents_to<B: BufferAllocator>(&self, dest: &mut BufferList<B>) -> AuResult<()> {
        let source = self.valid_arena()?;
        let source_views = source.buffers();
        if dest.state == PointerState::Invalid {
            return Err(AuError::InvalidBufferState);
        }
        let target = dest.arena.as_mut().ok_or(AuError::InvalidBufferState)?;
        let Some(last) = source_views.len().checked_sub(1) else {
            return Ok(());
        };

        for index in 0..target.number_buffers as usize {
            let from = source_views[index.min(last)];
            let to = target.views[index];
            if from.is_dangling() {
                return Err(AuError::InvalidBufferState);
            }
            let size = from.data_byte_size;
            if size > 0 {
                let capacity = target.capacity_of(&to).ok_or(AuError::InvalidBufferState)?;
                if size > capacity {
                    return Err(AuError::InsufficientCapacity {
                        requested: size as u64,
                        capacity: capacity as u64,
                    });
                }
                let src = source.data_ptr(&from);
                let dst = target.data_mut_ptr(&to);
                if !ptr::eq(src, dst) {
                    // SAFETY: both regions are valid for `size` bytes; copy
                    // handles overlapping external memory.
                    unsafe { ptr::copy(src, dst, size as usize) };
                }
            }
            target.views[index].data_byte_size = size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo() -> StreamFormat {
        StreamFormat::float32(48000.0, 2)
    }

    // =========================================================================
    // AllocatedBuffer
    // =========================================================================

    #[test]
    fn test_allocation_rounds_and_zeroes() {
        let arena = AllocatedBuffer::new(2, 10).unwrap();
        assert_eq!(arena.max_bytes_per_buffer(), 16, "capacity rounds up to 16");
        assert_eq!(arena.storage_bytes(), 32);
        assert!(arena.buffers().is_empty(), "nothing prepared yet");
    }

    #[test]
    fn test_too_many_buffers() {
        let err = AllocatedBuffer::new(MAX_BUFFERS + 1, 16).err();
        assert!(matches!(err, Some(AuError::TooManyBuffers { .. })));
    }

    #[test]
    fn test_allocation_overflow_is_reported() {
        let err = AllocatedBuffer::new(MAX_BUFFERS, u32::MAX - 64).err();
        assert!(
            matches!(err, Some(AuError::OutOfMemory(_))),
            "32-bit overflow must be reported, got {err:?}"
        );

        let err = AllocatedBuffer::new(1, u32::MAX).err();
        assert!(matches!(err, Some(AuError::OutOfMemory(_))), "rounding overflow");
    }

    #[test]
    fn test_prepare_within_capacity() {
        let mut arena = AllocatedBuffer::new(2, 64).unwrap();
        arena.prepare(1, 2, 48).unwrap();
        let views = arena.buffers();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].data, BufferData::Arena(0));
        assert_eq!(views[1].data, BufferData::Arena(64));
        assert_eq!(views[1].data_byte_size, 48);
    }

    #[test]
    fn test_prepare_rejects_excess_without_change() {
        let mut arena = AllocatedBuffer::new(2, 64).unwrap();
        arena.prepare(1, 1, 32).unwrap();

        let err = arena.prepare(1, 3, 32).err();
        assert!(matches!(err, Some(AuError::FormatNotSupported { requested: 3, allocated: 2 })));

        let err = arena.prepare(1, 2, 65).err();
        assert!(matches!(err, Some(AuError::InsufficientCapacity { .. })));

        assert_eq!(arena.buffers().len(), 1, "failed prepare must not change views");
        assert_eq!(arena.buffers()[0].data_byte_size, 32);
    }

    #[test]
    fn test_prepare_null_empty_allocation() {
        let mut arena = AllocatedBuffer::new(0, 0).unwrap();
        assert_eq!(arena.storage_bytes(), 0);
        arena.prepare_null(0, 0, 0).unwrap();
        assert!(arena.buffers().is_empty());
        assert!(arena.prepare(1, 1, 0).is_err(), "no buffer slots were reserved");
    }

    #[test]
    fn test_prepare_null_sets_null_data() {
        let mut arena = AllocatedBuffer::new(2, 16).unwrap();
        arena.prepare_null(1, 2, 4096).unwrap();
        assert!(arena.buffers().iter().all(|v| v.data == BufferData::Null));
    }

    // =========================================================================
    // BufferList
    // =========================================================================

    #[test]
    fn test_list_starts_invalid() {
        let list = BufferList::new();
        assert_eq!(list.state(), PointerState::Invalid);
        assert!(matches!(list.buffers(), Err(AuError::InvalidBufferState)));
        assert!(list.channel(0).is_err());
    }

    #[test]
    fn test_prepare_buffer_capacity_checks() {
        let mut list = BufferList::new();
        list.allocate(&stereo(), 512).unwrap();
        assert_eq!(list.allocated_frames(), 512);
        assert_eq!(list.allocated_streams(), 2);

        let err = list.prepare_buffer(&stereo(), 513).err();
        assert!(matches!(err, Some(AuError::TooManyFrames { requested: 513, maximum: 512 })));

        let surround = StreamFormat::float32(48000.0, 6);
        let err = list.prepare_buffer(&surround, 64).err();
        assert!(matches!(err, Some(AuError::FormatNotSupported { .. })));

        list.prepare_buffer(&stereo(), 256).unwrap();
        assert_eq!(list.state(), PointerState::ToMyMemory);
        assert_eq!(list.samples::<f32>(1).unwrap().len(), 256);
    }

    #[test]
    fn test_unallocated_prepare_fails() {
        let mut list = BufferList::new();
        assert!(list.prepare_buffer(&stereo(), 0).is_err());
        assert!(list.prepare_null_buffer(&stereo(), 0).is_err());
    }

    #[test]
    fn test_channels_are_disjoint_and_writable() {
        let mut list = BufferList::new();
        list.allocate(&stereo(), 8).unwrap();
        list.prepare_buffer(&stereo(), 8).unwrap();

        list.samples_mut::<f32>(0).unwrap().fill(1.0);
        list.samples_mut::<f32>(1).unwrap().fill(-1.0);

        assert!(list.samples::<f32>(0).unwrap().iter().all(|&s| s == 1.0));
        assert!(list.samples::<f32>(1).unwrap().iter().all(|&s| s == -1.0));

        list.zero().unwrap();
        assert!(list.channel(0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalidate_blocks_access() {
        let mut list = BufferList::new();
        list.allocate(&stereo(), 8).unwrap();
        list.prepare_buffer(&stereo(), 8).unwrap();
        list.invalidate();
        assert!(matches!(list.channel(0), Err(AuError::InvalidBufferState)));
        assert!(matches!(list.zero(), Err(AuError::InvalidBufferState)));
    }

    #[test]
    fn test_null_buffer_access() {
        let mut list = BufferList::new();
        list.allocate(&stereo(), 8).unwrap();

        list.prepare_null_buffer(&stereo(), 8).unwrap();
        assert_eq!(list.state(), PointerState::ToExternalMemory);
        assert!(
            matches!(list.channel(0), Err(AuError::InvalidBufferState)),
            "null data with nonzero size is unreadable"
        );

        list.prepare_null_buffer(&stereo(), 0).unwrap();
        assert!(list.channel(0).unwrap().is_empty(), "zero size reads as empty");
    }

    #[test]
    fn test_external_buffers() {
        let mut left = [0.5f32; 4];
        let mut right = [0.25f32; 4];
        let mut list = BufferList::new();
        list.allocate(&stereo(), 4).unwrap();

        let buffers = [
            ExternalBuffer::from_samples(1, &mut left).unwrap(),
            ExternalBuffer::from_samples(1, &mut right).unwrap(),
        ];
        unsafe { list.set_buffer_list(&buffers).unwrap() };
        assert_eq!(list.state(), PointerState::ToExternalMemory);
        assert_eq!(list.samples::<f32>(1).unwrap(), &[0.25; 4]);

        list.samples_mut::<f32>(0).unwrap()[0] = 2.0;
        assert_eq!(left[0], 2.0);
    }

    #[test]
    fn test_external_size_must_fit_32_bits() {
        assert_eq!(byte_size(16), Ok(16));
        assert_eq!(byte_size(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            byte_size(u32::MAX as usize + 1),
            Err(AuError::InsufficientCapacity { requested: 4_294_967_296, .. })
        ));
    }

    #[test]
    fn test_set_buffer_list_too_many() {
        let mut data = [0.0f32; 4];
        let mut list = BufferList::new();
        list.allocate(&StreamFormat::float32(48000.0, 1), 4).unwrap();
        let external = ExternalBuffer::from_samples(1, &mut data).unwrap();
        let err = unsafe { list.set_buffer_list(&[external, external]) }.err();
        assert!(matches!(err, Some(AuError::FormatNotSupported { requested: 2, allocated: 1 })));
    }

    #[test]
    fn test_set_buffer_checks() {
        let mut data = [0.0f32; 4];
        let mut list = BufferList::new();
        list.allocate(&stereo(), 4).unwrap();
        let external = ExternalBuffer::from_samples(1, &mut data).unwrap();

        let err = unsafe { list.set_buffer(0, external) }.err();
        assert!(matches!(err, Some(AuError::InvalidBufferState)), "invalid list");

        list.prepare_null_buffer(&stereo(), 4).unwrap();
        assert!(unsafe { list.set_buffer(2, external) }.is_err(), "index out of range");
        unsafe { list.set_buffer(1, external).unwrap() };
        assert_eq!(list.samples::<f32>(1).unwrap().len(), 4);
    }

    #[test]
    fn test_copy_duplicates_last_buffer() {
        let mono = StreamFormat::float32(48000.0, 1);
        let mut source = BufferList::new();
        source.allocate(&mono, 4).unwrap();
        source.prepare_buffer(&mono, 4).unwrap();
        source.samples_mut::<f32>(0).unwrap().fill(0.75);

        let quad = StreamFormat::float32(48000.0, 4);
        let mut dest = BufferList::new();
        dest.allocate(&quad, 4).unwrap();
        dest.prepare_buffer(&quad, 4).unwrap();

        source.copy_contents_to(&mut dest).unwrap();
        for channel in 0..4 {
            assert_eq!(
                dest.samples::<f32>(channel).unwrap(),
                &[0.75; 4],
                "channel {channel} should hold the last source buffer"
            );
        }
    }

    #[test]
    fn test_copy_rejects_invalid_and_dangling() {
        let mut source = BufferList::new();
        source.allocate(&stereo(), 4).unwrap();
        let mut dest = BufferList::new();
        dest.allocate(&stereo(), 4).unwrap();
        dest.prepare_buffer(&stereo(), 4).unwrap();

        assert!(matches!(
            source.copy_contents_to(&mut dest),
            Err(AuError::InvalidBufferState)
        ));

        source.prepare_null_buffer(&stereo(), 4).unwrap();
        assert!(matches!(
            source.copy_contents_to(&mut dest),
            Err(AuError::InvalidBufferState)
        ));
    }

    #[test]
    fn test_custom_allocator_is_used() {
        #[derive(Default)]
        struct Counting {
            allocations: u32,
            releases: u32,
        }

        impl BufferAllocator for Counting {
            fn allocate(&mut self, n: u32, bytes: u32) -> AuResult<AllocatedBuffer> {
                self.allocations += 1;
                AllocatedBuffer::new(n, bytes)
            }

            fn deallocate(&mut self, buffer: AllocatedBuffer) {
                self.releases += 1;
                drop(buffer);
            }
        }

        let mut list = BufferList::with_allocator(Counting::default());
        list.allocate(&stereo(), 64).unwrap();
        list.allocate(&stereo(), 128).unwrap();
        list.deallocate();
        assert_eq!(list.allocator.allocations, 2);
        assert_eq!(list.allocator.releases, 2);
        assert_eq!(list.state(), PointerState::Invalid);
    }
}
