//! Microphone capture over PulseAudio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::codec::INPUT_SAMPLE_RATE;
use crate::event::CaptureEvent;

/// Samples per captured frame (~256 ms at 16 kHz).
pub const MIC_FRAME_SAMPLES: usize = 4096;

/// Handle to the microphone thread. Dropping it stops capture.
pub struct MicCapture {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MicCapture {
    /// Spawns the capture thread. The returned receiver resolves once the
    /// device is open, or with the error that prevented it.
    pub fn spawn(
        frames: mpsc::UnboundedSender<CaptureEvent>,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let spec = pulse::sample::Spec {
                format: pulse::sample::Format::F32le,
                channels: 1,
                rate: INPUT_SAMPLE_RATE,
            };
            let opened = psimple::Simple::new(
                None,
                "voxlive_mic",
                pulse::stream::Direction::Record,
                None,
                "microphone",
                &spec,
                None,
                None,
            )
            .context("failed to open PulseAudio microphone stream");
            let capture = match opened {
                Ok(capture) => {
                    let _ = ready_tx.send(Ok(()));
                    capture
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            info!(
                "microphone capture started at {} Hz, {} samples per frame",
                INPUT_SAMPLE_RATE, MIC_FRAME_SAMPLES
            );
            if let Err(e) = run_capture(&capture, &frames, &thread_shutdown) {
                error!("microphone capture stopped: {}", e);
            }
            debug!("microphone thread exiting");
        });
        (
            MicCapture {
                shutdown,
                handle: Some(handle),
            },
            ready_rx,
        )
    }

    /// Stops the thread and releases the device. Safe to call twice.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("microphone thread panicked");
            }
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    capture: &psimple::Simple,
    frames: &mpsc::UnboundedSender<CaptureEvent>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut bytes = vec![0u8; MIC_FRAME_SAMPLES * 4];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        capture
            .read(&mut bytes)
            .context("failed to read microphone audio")?;
        // A stop request may have landed while the read blocked; honor it
        // before handing out a frame.
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut samples = Vec::with_capacity(MIC_FRAME_SAMPLES);
        for chunk in bytes.chunks_exact(4) {
            samples.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        if frames.send(CaptureEvent::AudioFrame { samples }).is_err() {
            // Session loop is gone; nothing left to feed.
            return Ok(());
        }
    }
}
