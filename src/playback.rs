//! Gapless playback scheduling and the output device sink.
//!
//! Model audio arrives as a stream of decoded chunks. The schedule
//! assigns each chunk a start time on a shared output clock so chunks
//! play back-to-back, and tracks the set of still-live units so an
//! interruption can cancel all of them at once. The sink thread owns
//! the PulseAudio playback stream and honors those start times.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::codec::OUTPUT_SAMPLE_RATE;

/// How long a queued unit may sit ahead of its start time before the
/// sink sleeps instead of writing through.
const GAP_SLACK_SECS: f64 = 0.05;
/// Cadence for interrupt checks while sleeping or writing.
const POLL: Duration = Duration::from_millis(20);
/// Device writes go out in slices of this many per second.
const SLICES_PER_SEC: usize = 50;

/// Monotonic playback time in seconds.
pub trait OutputClock {
    fn now(&self) -> f64;
}

/// Wall-clock implementation shared by the schedule and the sink.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// One scheduled chunk of mono model audio.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: u64,
    /// Cancellation generation this unit belongs to.
    pub epoch: u64,
    /// Start time on the output clock, seconds.
    pub start_at: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackUnit {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Assigns start times and tracks live units. Pure bookkeeping, no
/// device access, so interruption semantics are testable against a
/// manual clock.
#[derive(Debug, Default)]
pub struct PlaybackSchedule {
    next_start: f64,
    live: SmallVec<[u64; 4]>,
    epoch: u64,
    next_id: u64,
}

impl PlaybackSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a chunk: it starts when the previous one ends, or right
    /// now if the stream fell behind the clock.
    pub fn admit(
        &mut self,
        clock: &impl OutputClock,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> PlaybackUnit {
        let duration = samples.len() as f64 / sample_rate as f64;
        let start_at = self.next_start.max(clock.now());
        self.next_start = start_at + duration;
        let id = self.next_id;
        self.next_id += 1;
        self.live.push(id);
        PlaybackUnit {
            id,
            epoch: self.epoch,
            start_at,
            samples,
            sample_rate,
        }
    }

    /// A unit finished (or was cancelled and drained). Unknown ids are
    /// fine; interruption may have cleared them already.
    pub fn complete(&mut self, id: u64) {
        self.live.retain(|unit| *unit != id);
    }

    /// Barge-in: forget every live unit and pull the cursor back so the
    /// next chunk starts at the current clock time. Returns the new
    /// epoch; everything scheduled under an older one is void.
    pub fn interrupt(&mut self) -> u64 {
        self.live.clear();
        self.next_start = 0.0;
        self.epoch += 1;
        self.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }
}

/// Handle to the playback device thread.
///
/// Units are queued with [`PlaybackSink::play`]; completions come back
/// on the channel given at spawn. Raising the epoch makes the thread
/// abort whatever it is doing and flush the device buffer.
pub struct PlaybackSink {
    tx: Option<mpsc::Sender<PlaybackUnit>>,
    epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PlaybackSink {
    /// Spawn the device thread. The returned receiver resolves once the
    /// playback stream is open, or with the device error that prevented
    /// it.
    pub fn spawn(
        clock: SystemClock,
        done: tokio::sync::mpsc::UnboundedSender<u64>,
    ) -> (Self, tokio::sync::oneshot::Receiver<anyhow::Result<()>>) {
        let (tx, rx) = mpsc::channel::<PlaybackUnit>();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_epoch = Arc::clone(&epoch);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let spec = Spec {
                format: Format::F32le,
                channels: 1,
                rate: OUTPUT_SAMPLE_RATE,
            };
            let sim = Simple::new(
                None,
                "voxlive",
                Direction::Playback,
                None,
                "model audio",
                &spec,
                None,
                None,
            )
            .context("failed to open PulseAudio playback stream");
            let sim = match sim {
                Ok(sim) => {
                    let _ = ready_tx.send(Ok(()));
                    sim
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            run_sink(sim, clock, rx, done, thread_epoch, thread_shutdown);
            debug!("playback sink thread exiting");
        });
        (
            PlaybackSink {
                tx: Some(tx),
                epoch,
                shutdown,
                handle: Some(handle),
            },
            ready_rx,
        )
    }

    /// Queue a unit for the device. Loss here means the thread is gone;
    /// the closed completion channel reports that separately.
    pub fn play(&self, unit: PlaybackUnit) {
        if let Some(tx) = &self.tx {
            if tx.send(unit).is_err() {
                debug!("playback sink gone, dropping unit");
            }
        }
    }

    /// Void everything scheduled under an older epoch. The thread
    /// flushes the device buffer as soon as it notices.
    pub fn interrupt_to(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Stop the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.epoch.store(u64::MAX, Ordering::Release);
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("playback sink thread panicked");
            }
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sink(
    sim: Simple,
    clock: SystemClock,
    rx: mpsc::Receiver<PlaybackUnit>,
    done: tokio::sync::mpsc::UnboundedSender<u64>,
    epoch: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
) {
    let mut bytes = Vec::new();
    'units: loop {
        let unit = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(unit) => unit,
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if epoch.load(Ordering::Acquire) != unit.epoch {
            let _ = done.send(unit.id);
            continue;
        }
        // Sleep out a real gap in the inbound stream, staying
        // responsive to interrupts. Back-to-back chunks skip this:
        // blocking device writes already pace them.
        while unit.start_at - clock.now() > GAP_SLACK_SECS {
            thread::sleep(POLL);
            if shutdown.load(Ordering::Relaxed) {
                break 'units;
            }
            if epoch.load(Ordering::Acquire) != unit.epoch {
                let _ = done.send(unit.id);
                continue 'units;
            }
        }
        let slice_len = (unit.sample_rate as usize / SLICES_PER_SEC).max(1);
        let mut aborted = false;
        for slice in unit.samples.chunks(slice_len) {
            if shutdown.load(Ordering::Relaxed) || epoch.load(Ordering::Acquire) != unit.epoch {
                aborted = true;
                break;
            }
            bytes.clear();
            for &sample in slice {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            if let Err(e) = sim.write(&bytes) {
                warn!("playback write failed: {}", e);
                aborted = true;
                break;
            }
        }
        if aborted {
            // Cut the device buffer too; an interrupt means silence
            // now, not after the buffered tail plays out.
            if let Err(e) = sim.flush() {
                debug!("playback flush failed: {}", e);
            }
        }
        let _ = done.send(unit.id);
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ManualClock(Cell<f64>);

    impl ManualClock {
        fn at(t: f64) -> Self {
            ManualClock(Cell::new(t))
        }

        fn advance_to(&self, t: f64) {
            self.0.set(t);
        }
    }

    impl OutputClock for ManualClock {
        fn now(&self) -> f64 {
            self.0.get()
        }
    }

    fn samples(duration: f64, rate: u32) -> Vec<f32> {
        vec![0.0; (duration * rate as f64) as usize]
    }

    #[test]
    fn chunks_chain_back_to_back() {
        let clock = ManualClock::at(0.0);
        let mut schedule = PlaybackSchedule::new();
        let a = schedule.admit(&clock, samples(1.0, 100), 100);
        clock.advance_to(0.2);
        let b = schedule.admit(&clock, samples(0.5, 100), 100);
        clock.advance_to(0.9);
        let c = schedule.admit(&clock, samples(0.25, 100), 100);
        assert_eq!(a.start_at, 0.0);
        assert_eq!(b.start_at, a.start_at + a.duration_secs());
        assert_eq!(c.start_at, b.start_at + b.duration_secs());
        assert_eq!(schedule.live_len(), 3);
    }

    #[test]
    fn late_chunk_starts_immediately() {
        let clock = ManualClock::at(0.0);
        let mut schedule = PlaybackSchedule::new();
        let a = schedule.admit(&clock, samples(0.5, 100), 100);
        assert_eq!(a.start_at, 0.0);
        // Arrival well past the end of the previous chunk.
        clock.advance_to(2.0);
        let b = schedule.admit(&clock, samples(0.5, 100), 100);
        assert_eq!(b.start_at, 2.0);
    }

    #[test]
    fn interrupt_clears_live_set_and_cursor() {
        let clock = ManualClock::at(0.0);
        let mut schedule = PlaybackSchedule::new();
        let a = schedule.admit(&clock, samples(1.0, 100), 100);
        let _b = schedule.admit(&clock, samples(1.0, 100), 100);
        assert_eq!(schedule.live_len(), 2);
        let epoch = schedule.interrupt();
        assert!(schedule.is_idle());
        assert_eq!(epoch, schedule.epoch());
        // Next chunk starts at the clock, not at the stale cursor.
        clock.advance_to(3.0);
        let c = schedule.admit(&clock, samples(1.0, 100), 100);
        assert_eq!(c.start_at, 3.0);
        assert_eq!(c.epoch, epoch);
        assert!(a.epoch < c.epoch);
        assert_eq!(schedule.live_len(), 1);
    }

    #[test]
    fn complete_tolerates_cancelled_ids() {
        let clock = ManualClock::at(0.0);
        let mut schedule = PlaybackSchedule::new();
        let a = schedule.admit(&clock, samples(1.0, 100), 100);
        schedule.interrupt();
        // The sink reports the cancelled unit after the fact.
        schedule.complete(a.id);
        schedule.complete(999);
        assert!(schedule.is_idle());
    }

    #[test]
    fn unit_duration_follows_sample_rate() {
        let clock = ManualClock::at(0.0);
        let mut schedule = PlaybackSchedule::new();
        let unit = schedule.admit(&clock, vec![0.0; 24_000], OUTPUT_SAMPLE_RATE);
        assert_eq!(unit.duration_secs(), 1.0);
    }
}
