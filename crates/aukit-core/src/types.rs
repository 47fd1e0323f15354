//! Common types used throughout the real-time core.

// =============================================================================
// Defaults and Limits
// =============================================================================
//
// The render ceiling and buffer limits bound all real-time work. A host that
// asks for more frames than `max_frames_per_slice` gets an error, never a
// reallocation.
// =============================================================================

/// Default maximum frames rendered per call.
///
/// Matches the classic Audio Unit default (1024 frames plus headroom for
/// varispeed rendering).
pub const DEFAULT_MAX_FRAMES_PER_SLICE: u32 = 1156;

/// Default sample rate for stream formats.
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// Default channel count for stream formats.
pub const DEFAULT_CHANNEL_COUNT: u32 = 2;

/// Alignment of every per-channel region in a buffer arena, in bytes.
pub const BUFFER_ALIGNMENT: u32 = 16;

/// Upper bound on the size of a buffer list header, in bytes.
///
/// Limits the number of channel buffers one allocation can describe.
pub const MAX_BUFFER_LIST_SIZE: usize = 65536;

/// Parameter identifier.
pub type ParameterId = u32;

/// Parameter value (plain units, as stored by the element).
pub type ParameterValue = f32;

/// Element index within a scope.
pub type ElementId = u32;

/// Parameter scope.
///
/// The global scope has a single element (0). Input and output scopes have
/// one element per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    #[default]
    Global,
    Input,
    Output,
}

// =============================================================================
// Stream Format
// =============================================================================

/// Linear PCM stream description.
///
/// Only the fields that size buffers are modelled. Format negotiation
/// happens elsewhere; this is the result handed to the core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    /// Frames per second.
    pub sample_rate: f64,
    /// Channels in one frame.
    pub channels_per_frame: u32,
    /// Bytes in one frame of one channel stream.
    ///
    /// For interleaved formats this covers all channels; for
    /// non-interleaved formats it covers a single channel.
    pub bytes_per_frame: u32,
    /// Whether all channels share one interleaved buffer.
    pub interleaved: bool,
}

impl StreamFormat {
    /// Non-interleaved 32-bit float format.
    pub const fn float32(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            channels_per_frame: channels,
            bytes_per_frame: std::mem::size_of::<f32>() as u32,
            interleaved: false,
        }
    }

    /// Interleaved 32-bit float format.
    pub const fn float32_interleaved(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            channels_per_frame: channels,
            bytes_per_frame: channels * std::mem::size_of::<f32>() as u32,
            interleaved: true,
        }
    }

    /// Number of separate channel buffers this format needs.
    #[inline]
    pub const fn channel_streams(&self) -> u32 {
        if self.interleaved {
            1
        } else {
            self.channels_per_frame
        }
    }

    /// Number of channels carried by each channel buffer.
    #[inline]
    pub const fn channels_per_stream(&self) -> u32 {
        if self.interleaved {
            self.channels_per_frame
        } else {
            1
        }
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::float32(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNEL_COUNT)
    }
}
