//! Capture pipeline: blocking device loops on dedicated threads,
//! frames handed to the session over a channel.

pub mod audio;
pub mod video;

pub use audio::{MicCapture, MIC_FRAME_SAMPLES};
pub use video::VisionCapture;
