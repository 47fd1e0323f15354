//! Gain demo - a tone generator with automated gain on the aukit render cycle.
//!
//! This demo shows how to:
//! 1. Declare parameters before the render cycle is initialized
//! 2. Implement `RenderKernel` with a generic `Sample` DSP helper
//! 3. Watch renders from a lock-free `RenderObserver`
//! 4. Drive parameters from a control thread through a `ControlHandle`
//! 5. Schedule a sample-accurate ramp for one block
//! 6. Report a silent tail with `SilentTimeout`
//!
//! Run with `RUST_LOG=debug` to also see lifecycle and allocation logs.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aukit::core::AtomicF32;
use aukit::prelude::*;

// =============================================================================
// Configuration
// =============================================================================

/// Gain in dB (-60 dB and below is silence).
const GAIN: ParameterId = 0;
/// Mute switch (>= 0.5 is muted).
const MUTE: ParameterId = 1;

const SAMPLE_RATE: f64 = 48000.0;
const BLOCK: u32 = 512;
const BLOCKS: u32 = 64;
const TONE_HZ: f32 = 440.0;
/// Frames rendered after mute before the output is flagged silent.
const TAIL_FRAMES: u32 = 2048;

#[inline]
fn db_to_linear(db: f32) -> f32 {
    if db <= -60.0 {
        0.0
    } else {
        10f32.powf(db / 20.0)
    }
}

/// Write a sine into `samples`, returning the phase after the last sample.
///
/// `gain` maps a sample index within `samples` to a linear gain.
fn render_tone<S: Sample>(
    samples: &mut [S],
    mut phase: f32,
    increment: f32,
    gain: impl Fn(usize) -> f32,
) -> f32 {
    for (index, sample) in samples.iter_mut().enumerate() {
        *sample = S::from_f32(phase.sin() * gain(index));
        phase = (phase + increment) % TAU;
    }
    phase
}

// =============================================================================
// Kernel
// =============================================================================

struct ToneKernel {
    phase: f32,
    increment: f32,
    timeout: SilentTimeout,
    silent: bool,
}

impl ToneKernel {
    fn new(frequency: f32, sample_rate: f64) -> Self {
        Self {
            phase: 0.0,
            increment: TAU * frequency / sample_rate as f32,
            timeout: SilentTimeout::new(),
            silent: false,
        }
    }
}

impl RenderKernel for ToneKernel {
    fn render_slice(
        &mut self,
        context: &SliceContext<'_>,
        parameters: &ParameterScopes,
        output: &mut BufferList,
    ) -> AuResult<()> {
        let global = parameters.global();
        let muted = global.get_rt(MUTE) >= 0.5;
        let level = global.get_rt(GAIN);
        // Follow a moving gain ramp sample by sample
        let ramp = context
            .ramps()
            .find(|event| event.parameter == GAIN && event.scope == Scope::Global);
        let gain_at = |index: usize| {
            if muted {
                return 0.0;
            }
            let frame = context.start + index as u32;
            db_to_linear(ramp.map_or(level, |ramp| ramp.value_at(frame)))
        };

        let mut phase = self.phase;
        for channel in 0..output.len() {
            let samples = &mut output.samples_mut::<f32>(channel)?[context.range()];
            phase = render_tone(samples, self.phase, self.increment, gain_at);
        }
        self.phase = phase;
        let input_silent = muted || (ramp.is_none() && db_to_linear(level) == 0.0);
        self.silent = self.timeout.process(context.frames, TAIL_FRAMES, input_silent);
        Ok(())
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.timeout.reset();
        self.silent = false;
    }

    fn output_is_silence(&self) -> bool {
        self.silent
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Post-render peak meter. Only atomics, so safe on the render thread.
#[derive(Default)]
struct PeakMeter {
    peak: AtomicF32,
    renders: AtomicU32,
    silent_renders: AtomicU32,
}

impl RenderObserver for PeakMeter {
    fn notify(&self, notification: &RenderNotification<'_>) {
        if !notification.flags.contains(RenderActionFlags::POST_RENDER) {
            return;
        }
        self.renders.fetch_add(1, Ordering::Relaxed);
        if notification.flags.contains(RenderActionFlags::OUTPUT_IS_SILENCE) {
            self.silent_renders.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(samples) = notification.buffers.samples::<f32>(0) {
            let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
            self.peak.store(peak);
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> AuResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut parameters = ParameterScopes::new();
    parameters.global_mut().use_indexed_parameters(2);
    parameters.set(GAIN, Scope::Global, 0, 0.0)?;
    parameters.set(MUTE, Scope::Global, 0, 0.0)?;

    let config =
        RenderConfig::new(StreamFormat::float32(SAMPLE_RATE, 2)).with_max_frames_per_slice(BLOCK);
    let mut cycle = RenderCycle::new(config, parameters, ToneKernel::new(TONE_HZ, SAMPLE_RATE));
    cycle.initialize()?;

    let control = cycle.control();
    let meter = Arc::new(PeakMeter::default());
    control.add_render_notify(ObserverHandle::from_arc(meter.clone()));

    // Control thread: fade down in 3 dB steps, then mute
    let fader = {
        let control = control.clone();
        thread::spawn(move || -> AuResult<()> {
            for step in 0..=12 {
                control.set_parameter(GAIN, Scope::Global, 0, -3.0 * step as f32)?;
                thread::sleep(Duration::from_millis(2));
            }
            control.set_parameter(MUTE, Scope::Global, 0, 1.0)
        })
    };

    for block in 0..BLOCKS {
        if block == 4 {
            // Swell from -24 dB to 0 dB across this block
            cycle.schedule_parameters(&[ParameterEvent::ramp(
                GAIN,
                Scope::Global,
                0,
                0,
                BLOCK,
                -24.0,
                0.0,
            )])?;
        }

        cycle.render(
            RenderActionFlags::empty(),
            (block * BLOCK) as f64,
            0,
            BLOCK,
        )?;

        log::info!(
            "block {:2}: gain {:6.1} dB, peak {:.3}, silent renders {}",
            block,
            control.get_parameter(GAIN, Scope::Global, 0)?,
            meter.peak.load(),
            meter.silent_renders.load(Ordering::Relaxed)
        );

        // Roughly the pace of a real audio callback
        thread::sleep(Duration::from_millis(1));
    }

    match fader.join() {
        Ok(result) => result?,
        Err(_) => log::error!("Control thread panicked"),
    }

    // Too large for the configured ceiling: reported, not rendered
    if let Err(err) = cycle.render(RenderActionFlags::empty(), 0.0, 0, BLOCK * 2) {
        log::warn!("Oversized render rejected: {} (status {})", err, err.status());
    }

    control.clear_render_notify();
    cycle.render(RenderActionFlags::empty(), (BLOCKS * BLOCK) as f64, 0, BLOCK)?;
    log::info!(
        "Observed {} renders, {} flagged silent",
        meter.renders.load(Ordering::Relaxed),
        meter.silent_renders.load(Ordering::Relaxed)
    );

    cycle.uninitialize();
    Ok(())
}
