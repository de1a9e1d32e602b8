//! Capture states, commands, and the transition table.

use crate::camera::AcquireError;
use facepass_core::{BoundingBox, DetectorStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureState {
    Idle,
    Acquiring,
    Live,
    Capturing,
    Captured,
    Error,
    /// Terminal.
    Stopped,
}

impl CaptureState {
    /// False while an acquisition or a frame grab is in flight.
    pub fn is_settled(self) -> bool {
        !matches!(self, CaptureState::Acquiring | CaptureState::Capturing)
    }
}

/// Commands a UI can issue to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Retry,
    Capture,
    Retake,
    Confirm,
    Stop,
}

/// What the session does in response to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Enter `Acquiring` and request a stream.
    Acquire,
    /// Nothing to do; report the current state.
    Keep,
    /// `Live → Capturing → Captured`.
    Grab,
    /// `Captured → Live` on the stream still held.
    ResumeLive,
    /// `Captured → Stopped`, handing the frame to the caller.
    Finish,
    /// Any state `→ Stopped`.
    Halt,
    Reject,
}

/// The single transition function of a capture session.
///
/// `stream_held` is only consulted for `Retake` from `Captured`.
pub fn plan(state: CaptureState, command: Command, stream_held: bool) -> Plan {
    use CaptureState::*;

    match (state, command) {
        (Stopped, Command::Stop) => Plan::Keep,
        (_, Command::Stop) => Plan::Halt,
        (Stopped, _) => Plan::Reject,

        (Idle, Command::Start) => Plan::Acquire,
        (_, Command::Start) => Plan::Keep,

        (Error, Command::Retry) => Plan::Acquire,
        (Acquiring | Live, Command::Retry) => Plan::Keep,
        (_, Command::Retry) => Plan::Reject,

        (Live, Command::Capture) => Plan::Grab,
        (_, Command::Capture) => Plan::Reject,

        (Captured, Command::Retake) if stream_held => Plan::ResumeLive,
        (Captured, Command::Retake) => Plan::Acquire,
        (_, Command::Retake) => Plan::Reject,

        (Captured, Command::Confirm) => Plan::Finish,
        (_, Command::Confirm) => Plan::Reject,
    }
}

/// Published view of a session, for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: CaptureState,
    pub last_error: Option<AcquireError>,
    pub face_detected: bool,
    /// Latest detector boxes, in preview coordinates.
    pub faces: Vec<BoundingBox>,
    pub has_frame: bool,
    pub detector: DetectorStatus,
    /// Incremented on every entry into `Live`.
    pub live_epoch: u64,
}

impl SessionSnapshot {
    pub(crate) fn initial(detector: DetectorStatus) -> Self {
        Self {
            state: CaptureState::Idle,
            last_error: None,
            face_detected: false,
            faces: Vec::new(),
            has_frame: false,
            detector,
            live_epoch: 0,
        }
    }
}
