//! Session media recorder - saves mic and model audio as WAV files.
//!
//! Recording failures disable the affected stream for the rest of the
//! session; they never touch the session itself.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::Local;
use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{error, info};

use crate::codec::{self, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};

type Writer = WavWriter<BufWriter<File>>;

pub struct SessionRecorder {
    mic: Option<Writer>,
    model: Option<Writer>,
}

impl SessionRecorder {
    /// A recorder that writes nothing.
    pub fn disabled() -> Self {
        SessionRecorder {
            mic: None,
            model: None,
        }
    }

    /// Opens `recordings/<timestamp>/{mic,model}.wav`. Any failure
    /// downgrades to a disabled recorder.
    pub fn start() -> Self {
        Self::start_at(Path::new("recordings"))
    }

    pub fn start_at(base: &Path) -> Self {
        let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dir = base.join(ts);
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("failed to create recordings directory: {}", e);
            return Self::disabled();
        }
        info!("recording session media to {:?}", dir);
        SessionRecorder {
            mic: open_writer(dir.join("mic.wav"), INPUT_SAMPLE_RATE),
            model: open_writer(dir.join("model.wav"), OUTPUT_SAMPLE_RATE),
        }
    }

    pub fn write_mic(&mut self, samples: &[f32]) {
        Self::write(&mut self.mic, samples, "mic");
    }

    pub fn write_model(&mut self, samples: &[f32]) {
        Self::write(&mut self.model, samples, "model");
    }

    fn write(slot: &mut Option<Writer>, samples: &[f32], label: &str) {
        let failed = match slot.as_mut() {
            Some(writer) => {
                let mut failed = false;
                for &sample in samples {
                    if let Err(e) = writer.write_sample(codec::quantize(sample)) {
                        error!("{} recording failed, disabling: {}", label, e);
                        failed = true;
                        break;
                    }
                }
                failed
            }
            None => false,
        };
        if failed {
            *slot = None;
        }
    }

    /// Flushes headers and closes both files. Safe to call without an
    /// active recording.
    pub fn finalize(&mut self) {
        for (writer, label) in [(self.mic.take(), "mic"), (self.model.take(), "model")] {
            if let Some(writer) = writer {
                if let Err(e) = writer.finalize() {
                    error!("failed to finalize {} recording: {}", label, e);
                }
            }
        }
    }
}

fn open_writer(path: PathBuf, sample_rate: u32) -> Option<Writer> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    match WavWriter::create(&path, spec) {
        Ok(writer) => Some(writer),
        Err(e) => {
            error!("failed to create {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_files_land_with_the_right_specs() {
        let base = std::env::temp_dir().join(format!("voxlive-rec-{}", std::process::id()));
        let _ = fs::remove_dir_all(&base);
        let mut recorder = SessionRecorder::start_at(&base);
        recorder.write_mic(&[0.0, 0.5, -0.5]);
        recorder.write_model(&[1.0; 10]);
        recorder.finalize();

        let session_dir = fs::read_dir(&base).unwrap().next().unwrap().unwrap().path();
        let mic = hound::WavReader::open(session_dir.join("mic.wav")).unwrap();
        assert_eq!(mic.spec().sample_rate, INPUT_SAMPLE_RATE);
        assert_eq!(mic.spec().channels, 1);
        assert_eq!(mic.len(), 3);
        let model = hound::WavReader::open(session_dir.join("model.wav")).unwrap();
        assert_eq!(model.spec().sample_rate, OUTPUT_SAMPLE_RATE);
        assert_eq!(model.len(), 10);
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn disabled_recorder_is_inert() {
        let mut recorder = SessionRecorder::disabled();
        recorder.write_mic(&[0.1; 4]);
        recorder.write_model(&[]);
        recorder.finalize();
    }

    #[test]
    fn double_finalize_is_a_no_op() {
        let base = std::env::temp_dir().join(format!("voxlive-rec2-{}", std::process::id()));
        let _ = fs::remove_dir_all(&base);
        let mut recorder = SessionRecorder::start_at(&base);
        recorder.write_mic(&[0.25; 8]);
        recorder.finalize();
        recorder.finalize();
        let _ = fs::remove_dir_all(&base);
    }
}
