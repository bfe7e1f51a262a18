//! Gapless playback scheduling and the output thread that renders it.
//!
//! - `PlaybackScheduler`: `nextStartTime` + the set of scheduled buffers
//! - `PlaybackOutput`: `audio-play` thread, scheduler → device, advances the clock

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::VoiceError;

use super::codec::{DecodedBuffer, duration_to_frames, frames_to_duration};

/// Time source for the output timeline.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> Duration;

    /// Current position as a frame index at `sample_rate`.
    fn now_frames(&self, sample_rate: u32) -> u64 {
        duration_to_frames(self.now(), sample_rate)
    }
}

/// Output clock driven by the number of frames handed to the device.
#[derive(Debug)]
pub struct FrameClock {
    frames: AtomicU64,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate,
        }
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::SeqCst);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl OutputClock for FrameClock {
    fn now(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }

    fn now_frames(&self, sample_rate: u32) -> u64 {
        if sample_rate == self.sample_rate {
            self.frames()
        } else {
            duration_to_frames(self.now(), sample_rate)
        }
    }
}

/// A decoded buffer placed on the output timeline, `start` in frames.
#[derive(Debug, Clone)]
struct ScheduledBuffer {
    id: u64,
    start: u64,
    buffer: DecodedBuffer,
}

impl ScheduledBuffer {
    fn end(&self) -> u64 {
        self.start + self.buffer.frames() as u64
    }

    fn slot(&self, sample_rate: u32) -> ScheduledSlot {
        let frames = self.buffer.frames() as u64;
        ScheduledSlot {
            id: self.id,
            start_frame: self.start,
            frames,
            start: frames_to_duration(self.start, sample_rate),
            duration: frames_to_duration(frames, sample_rate),
        }
    }
}

/// Where and for how long a buffer was scheduled.
///
/// `start_frame` and `frames` are exact; `start` and `duration` are the same
/// values on the wall-clock scale, rounded down to the nanosecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub id: u64,
    pub start_frame: u64,
    pub frames: u64,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledSlot {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// Frame index where the next buffer starts.
    next_start: u64,
    next_id: u64,
    scheduled: Vec<ScheduledBuffer>,
}

/// Places buffers back to back on the output clock.
///
/// The timeline is kept in whole frames at the scheduler's rate, so adjacent
/// buffers share a boundary sample exactly whatever their length.
/// `schedule`, `interrupt` and `render` take the same lock, so a reset can
/// never interleave with a schedule that read the old `next_start`.
pub struct PlaybackScheduler {
    clock: Arc<dyn OutputClock>,
    sample_rate: u32,
    state: Mutex<SchedulerState>,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn OutputClock>, sample_rate: u32) -> Self {
        Self {
            clock,
            sample_rate,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        // A panic while holding the lock leaves plain data behind; keep playing.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule `buffer` to start when the previous one ends, or now if the
    /// timeline has already run past that point.
    pub fn schedule(&self, buffer: DecodedBuffer) -> ScheduledSlot {
        let mut state = self.lock();
        let now = self.clock.now_frames(self.sample_rate);
        let start = state.next_start.max(now);
        let id = state.next_id;
        state.next_id += 1;

        let scheduled = ScheduledBuffer { id, start, buffer };
        state.next_start = scheduled.end();
        let slot = scheduled.slot(self.sample_rate);
        state.scheduled.push(scheduled);

        log::debug!(
            "Scheduled buffer #{} at frame {} for {} frames (next start {})",
            slot.id,
            slot.start_frame,
            slot.frames,
            state.next_start
        );
        slot
    }

    /// Stop everything scheduled or playing and reset the timeline.
    /// Returns the number of buffers that were stopped.
    pub fn interrupt(&self) -> usize {
        let mut state = self.lock();
        let stopped = state.scheduled.len();
        state.scheduled.clear();
        state.next_start = 0;
        if stopped > 0 {
            log::info!("Playback interrupted, {} buffer(s) stopped", stopped);
        }
        stopped
    }

    pub fn next_start_time(&self) -> Duration {
        frames_to_duration(self.next_start_frame(), self.sample_rate)
    }

    pub fn next_start_frame(&self) -> u64 {
        self.lock().next_start
    }

    /// Buffers scheduled or playing that have not yet ended on the output clock.
    pub fn pending(&self) -> usize {
        let now = self.clock.now_frames(self.sample_rate);
        self.lock()
            .scheduled
            .iter()
            .filter(|b| b.end() > now)
            .count()
    }

    pub fn slots(&self) -> Vec<ScheduledSlot> {
        self.lock()
            .scheduled
            .iter()
            .map(|b| b.slot(self.sample_rate))
            .collect()
    }

    /// Mix every scheduled buffer overlapping frames `[window_start, window_start + out.len())`
    /// into `out` (mono, at the scheduler's rate) and release finished buffers.
    pub fn render(&self, window_start: u64, out: &mut [f32]) {
        out.fill(0.0);
        let w0 = window_start;
        let w1 = w0 + out.len() as u64;

        let mut state = self.lock();
        for scheduled in &state.scheduled {
            let b0 = scheduled.start;
            let b1 = scheduled.end();
            let from = b0.max(w0);
            let to = b1.min(w1);
            if from >= to {
                continue;
            }
            let buffer = &scheduled.buffer;
            let channels = buffer.channels.max(1) as usize;
            for frame in from..to {
                let src = (frame - b0) as usize * channels;
                let mixed: f32 = buffer.samples[src..src + channels].iter().sum::<f32>()
                    / channels as f32;
                out[(frame - w0) as usize] += mixed;
            }
        }

        state.scheduled.retain(|b| b.end() > w1);

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

/// Sink for mono f32 samples, e.g. an ALSA playback PCM.
pub trait PlaybackBackend: Send {
    /// Acquire the device. Fails with `DeviceUnavailable`.
    fn open(&mut self, sample_rate: u32) -> Result<(), VoiceError>;

    /// Write all of `samples`, blocking at the device's pace.
    fn write(&mut self, samples: &[f32]) -> Result<(), VoiceError>;

    /// Release the device. Must be safe to call more than once.
    fn close(&mut self);
}

/// Owns the `audio-play` thread.
pub struct PlaybackOutput {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackOutput {
    /// Open the device and start rendering `scheduler` into it.
    ///
    /// `clock` must be the clock the scheduler was built with; it is advanced
    /// by every period written.
    pub fn start<E>(
        mut backend: Box<dyn PlaybackBackend>,
        scheduler: Arc<PlaybackScheduler>,
        clock: Arc<FrameClock>,
        period_frames: usize,
        on_fault: E,
    ) -> Result<Self, VoiceError>
    where
        E: FnOnce(VoiceError) + Send + 'static,
    {
        if let Err(e) = backend.open(scheduler.sample_rate()) {
            backend.close();
            return Err(e);
        }

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let period_frames = period_frames.max(1);
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    play_thread(backend, scheduler, clock, period_frames, running, on_fault)
                })
                .map_err(|e| {
                    VoiceError::DeviceUnavailable(format!("failed to spawn playback thread: {}", e))
                })?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Tell the thread to stop and hand it over without waiting for it.
    ///
    /// The thread closes the device itself once its current write returns.
    pub fn request_stop(&mut self) -> Option<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        self.handle.take()
    }

    /// Stop the thread and release the device, blocking until it exits. Idempotent.
    pub fn stop(&mut self) {
        if let Some(h) = self.request_stop() {
            let _ = h.join();
        }
    }
}

impl Drop for PlaybackOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play_thread<E>(
    mut backend: Box<dyn PlaybackBackend>,
    scheduler: Arc<PlaybackScheduler>,
    clock: Arc<FrameClock>,
    period_frames: usize,
    running: Arc<AtomicBool>,
    on_fault: E,
) where
    E: FnOnce(VoiceError),
{
    let mut period = vec![0f32; period_frames];
    let mut fault = None;

    log::info!(
        "Playback started: rate={}, period={}",
        scheduler.sample_rate(),
        period_frames
    );

    while running.load(Ordering::Relaxed) {
        scheduler.render(clock.frames(), &mut period);
        if let Err(e) = backend.write(&period) {
            log::error!("Playback device error: {}", e);
            fault = Some(e);
            break;
        }
        clock.advance(period_frames as u64);
    }

    backend.close();
    log::info!("Playback stopped");
    if let Some(e) = fault {
        if running.load(Ordering::Relaxed) {
            on_fault(e);
        }
    }
}
