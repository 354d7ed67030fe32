//! mirror-hw: Hardware abstraction for the camera and the speaker.
//!
//! Provides V4L2 camera capture converted to RGB frames, JPEG encoding for
//! upload, MP3 playback on the default output device, and the FIFO playback
//! queue that streams TTS audio to it.

pub mod audio;
pub mod camera;
pub mod frame;
pub mod playback;

pub use audio::{AudioError, AudioOutput};
pub use camera::{Camera, CameraError, CaptureFormat, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
pub use playback::{AudioChunk, AudioSink, PlaybackQueue};
