//! facepass-capture: camera capture session for face enrollment and login.
//!
//! A [`CaptureSession`] owns one camera stream at a time, runs a live
//! face-presence loop while the preview is up, and hands out a single still
//! frame once the user confirms it. [`V4l2Camera`] is the Linux adapter.

pub mod camera;
mod detection;
pub mod session;
pub mod state;
pub mod v4l2;

pub use camera::{AcquireError, Camera, StreamConstraints, StreamError, VideoStream};
pub use session::{CaptureSession, SessionConfig, SessionError};
pub use state::{plan, CaptureState, Command, Plan, SessionSnapshot};
pub use v4l2::{DeviceInfo, V4l2Camera, V4l2Stream};
