//! Periodic screen capture for live vision.
//!
//! The recorder runs on its own thread; once per second the newest frame
//! is downscaled, JPEG-compressed, and handed to the session. Ticks with
//! no frame ready are skipped rather than stalled on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use xcap::{Frame, Monitor, VideoRecorder};

use crate::event::CaptureEvent;

/// One frame per second while vision is on.
const TICK: Duration = Duration::from_secs(1);
/// Shutdown poll granularity between ticks.
const POLL: Duration = Duration::from_millis(100);
const JPEG_QUALITY: u8 = 75;

/// Handle to the screen capture thread. Dropping it stops capture.
pub struct VisionCapture {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl VisionCapture {
    /// Spawns the capture thread. The returned receiver resolves once the
    /// recorder is running, or with the error that prevented it.
    pub fn spawn(
        frames: mpsc::UnboundedSender<CaptureEvent>,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            let (recorder, frame_rx) = match open_recorder() {
                Ok(pair) => {
                    let _ = ready_tx.send(Ok(()));
                    pair
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            run_capture(&frame_rx, &frames, &thread_shutdown);
            if let Err(e) = recorder.stop() {
                debug!("screen recorder stop failed: {}", e);
            }
            debug!("screen capture thread exiting");
        });
        (
            VisionCapture {
                shutdown,
                handle: Some(handle),
            },
            ready_rx,
        )
    }

    /// Stops the thread and the recorder. Safe to call twice.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("screen capture thread panicked");
            }
        }
    }
}

impl Drop for VisionCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_recorder() -> Result<(VideoRecorder, Receiver<Frame>)> {
    let monitors = Monitor::all().context("failed to enumerate monitors")?;
    let monitor = monitors
        .iter()
        .find(|m| m.is_primary().unwrap_or(false))
        .or_else(|| monitors.first())
        .ok_or_else(|| anyhow!("no monitors found"))?
        .clone();
    info!(
        "capturing monitor {} ({}x{})",
        monitor.name().unwrap_or_else(|_| "unknown".to_string()),
        monitor.width().unwrap_or(0),
        monitor.height().unwrap_or(0)
    );
    let (recorder, frame_rx) = monitor
        .video_recorder()
        .context("failed to open screen recorder")?;
    recorder.start().context("failed to start screen recorder")?;
    Ok((recorder, frame_rx))
}

fn run_capture(
    frame_rx: &Receiver<Frame>,
    frames: &mpsc::UnboundedSender<CaptureEvent>,
    shutdown: &AtomicBool,
) {
    let mut next_tick = Instant::now() + TICK;
    loop {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= next_tick {
                break;
            }
            thread::sleep((next_tick - now).min(POLL));
        }
        next_tick += TICK;
        // Latest frame wins; the recorder keeps producing between ticks.
        let frame = match latest_frame(frame_rx) {
            Some(frame) => frame,
            None => {
                debug!("no screen frame ready, skipping tick");
                continue;
            }
        };
        match encode_frame(frame.width, frame.height, frame.raw) {
            Ok(jpeg) => {
                if frames.send(CaptureEvent::VideoFrame { jpeg }).is_err() {
                    // Session loop is gone; nothing left to feed.
                    return;
                }
            }
            Err(e) => warn!("dropping screen frame: {}", e),
        }
    }
}

fn latest_frame(rx: &Receiver<Frame>) -> Option<Frame> {
    let mut latest = None;
    loop {
        match rx.try_recv() {
            Ok(frame) => latest = Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return latest,
        }
    }
}

/// Downscales the raw RGBA frame to half size and compresses it.
fn encode_frame(width: u32, height: u32, raw: Vec<u8>) -> Result<Vec<u8>> {
    let image =
        RgbaImage::from_raw(width, height, raw).ok_or_else(|| anyhow!("raw frame size mismatch"))?;
    let scaled = image::imageops::resize(
        &image,
        (width / 2).max(1),
        (height / 2).max(1),
        FilterType::Triangle,
    );
    let rgb = DynamicImage::ImageRgba8(scaled).to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("JPEG encoding failed")?;
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_come_out_as_jpeg() {
        let raw = vec![128u8; 8 * 6 * 4];
        let jpeg = encode_frame(8, 6, raw).unwrap();
        assert!(jpeg.starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn tiny_frames_survive_the_downscale() {
        let raw = vec![255u8; 1 * 1 * 4];
        assert!(encode_frame(1, 1, raw).is_ok());
    }

    #[test]
    fn bad_raw_length_is_an_error() {
        assert!(encode_frame(8, 6, vec![0u8; 10]).is_err());
    }
}
