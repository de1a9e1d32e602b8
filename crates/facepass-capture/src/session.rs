//! Capture session: an actor task that owns the camera stream and walks the
//! capture state machine, driven through a cloneable [`CaptureSession`] handle.

use crate::camera::{AcquireError, Camera, StreamConstraints, StreamError, VideoStream};
use crate::detection::DetectionLoop;
use crate::state::{plan, CaptureState, Command, Plan, SessionSnapshot};
use facepass_core::{BoundingBox, DetectorStatus, EmbeddingModel, ModelHandle, StillFrame};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub constraints: StreamConstraints,
    /// Period of the live face-presence loop.
    pub detection_interval: Duration,
    /// Upper bound for each of stream request and playback start.
    pub acquire_timeout: Duration,
    pub grab_timeout: Duration,
    /// Mirror captured stills the same way the preview is mirrored.
    pub mirror_preview: bool,
    /// Stop the stream as soon as a still is captured; retake reacquires.
    pub release_stream_on_capture: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            constraints: StreamConstraints::default(),
            detection_interval: Duration::from_millis(200),
            acquire_timeout: Duration::from_secs(10),
            grab_timeout: Duration::from_secs(5),
            mirror_preview: true,
            release_stream_on_capture: false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("capture is not possible in state {0:?}")]
    CaptureNotReady(CaptureState),
    #[error("no face in view")]
    NoFaceInView,
    #[error("{command:?} is not valid in state {state:?}")]
    InvalidTransition { state: CaptureState, command: Command },
    #[error("frame grab failed: {0}")]
    FrameGrab(#[from] StreamError),
    #[error("capture session closed")]
    Closed,
}

pub(crate) enum Reply {
    State(CaptureState),
    Frame(StillFrame),
}

pub(crate) struct Request {
    command: Command,
    reply: oneshot::Sender<Result<Reply, SessionError>>,
}

/// Messages from tasks the session spawned back to the actor.
pub(crate) enum Event<S> {
    StreamReady {
        attempt: u64,
        stream: S,
    },
    AcquireFailed {
        attempt: u64,
        error: AcquireError,
    },
    Faces {
        epoch: u64,
        faces: Vec<BoundingBox>,
    },
    StreamEnded {
        epoch: u64,
    },
    Grabbed {
        result: Result<StillFrame, StreamError>,
        reply: oneshot::Sender<Result<Reply, SessionError>>,
    },
    DetectorSettled,
}

enum Phase<S> {
    Idle,
    Acquiring { attempt: u64 },
    Live { stream: S, detection: DetectionLoop },
    Capturing { stream: S },
    Captured { stream: Option<S>, frame: StillFrame },
    Error,
    Stopped,
}

impl<S> Phase<S> {
    fn state(&self) -> CaptureState {
        match self {
            Phase::Idle => CaptureState::Idle,
            Phase::Acquiring { .. } => CaptureState::Acquiring,
            Phase::Live { .. } => CaptureState::Live,
            Phase::Capturing { .. } => CaptureState::Capturing,
            Phase::Captured { .. } => CaptureState::Captured,
            Phase::Error => CaptureState::Error,
            Phase::Stopped => CaptureState::Stopped,
        }
    }

    /// Consume the phase, aborting any live loop, and hand back what it held.
    fn into_stream(self) -> Option<S> {
        match self {
            Phase::Live { stream, detection } => {
                drop(detection);
                Some(stream)
            }
            Phase::Capturing { stream } => Some(stream),
            Phase::Captured { stream, .. } => stream,
            Phase::Idle | Phase::Acquiring { .. } | Phase::Error | Phase::Stopped => None,
        }
    }
}

/// Clone-safe handle to a capture session. The session stops, releasing its
/// stream, once every handle is dropped.
#[derive(Clone)]
pub struct CaptureSession {
    requests: mpsc::Sender<Request>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CaptureSession {
    /// Spawn the session actor on the current tokio runtime.
    ///
    /// The model's load step is kicked off immediately so the detector is
    /// usually ready by the time the camera is live.
    pub fn spawn<C, M>(camera: Arc<C>, model: Arc<ModelHandle<M>>, config: SessionConfig) -> Self
    where
        C: Camera,
        M: EmbeddingModel,
    {
        let (requests_tx, requests_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::initial(model.detector_status()));

        {
            let model = Arc::clone(&model);
            let events = events_tx.clone();
            tokio::spawn(async move {
                model.ensure_ready().await;
                let _ = events.send(Event::DetectorSettled);
            });
        }

        let actor = Actor {
            camera,
            model,
            config,
            phase: Phase::Idle,
            attempt: 0,
            live_epoch: 0,
            snapshot: snapshot_tx,
            events: events_tx,
        };
        tokio::spawn(actor.run(requests_rx, events_rx));

        Self {
            requests: requests_tx,
            snapshot: snapshot_rx,
        }
    }

    pub async fn start(&self) -> Result<CaptureState, SessionError> {
        self.request(Command::Start).await.map(Reply::into_state)
    }

    pub async fn retry(&self) -> Result<CaptureState, SessionError> {
        self.request(Command::Retry).await.map(Reply::into_state)
    }

    /// Grab the current frame. The session stays in `Captured` until the
    /// caller confirms or retakes.
    pub async fn capture(&self) -> Result<StillFrame, SessionError> {
        self.request(Command::Capture).await?.into_frame()
    }

    pub async fn retake(&self) -> Result<CaptureState, SessionError> {
        self.request(Command::Retake).await.map(Reply::into_state)
    }

    /// Accept the captured frame and end the session.
    pub async fn confirm(&self) -> Result<StillFrame, SessionError> {
        self.request(Command::Confirm).await?.into_frame()
    }

    /// Stop the session. Safe to call any number of times.
    pub async fn stop(&self) -> Result<CaptureState, SessionError> {
        match self.request(Command::Stop).await {
            Ok(reply) => Ok(reply.into_state()),
            Err(SessionError::Closed) => Ok(CaptureState::Stopped),
            Err(err) => Err(err),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CaptureState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until no acquisition or grab is in flight.
    pub async fn settled(&self) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.state.is_settled())
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok((*snapshot).clone())
    }

    async fn request(&self, command: Command) -> Result<Reply, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        reply_rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Reply {
    fn into_state(self) -> CaptureState {
        match self {
            Reply::State(state) => state,
            Reply::Frame(_) => CaptureState::Captured,
        }
    }

    fn into_frame(self) -> Result<StillFrame, SessionError> {
        match self {
            Reply::Frame(frame) => Ok(frame),
            Reply::State(state) => Err(SessionError::CaptureNotReady(state)),
        }
    }
}

struct Actor<C: Camera, M> {
    camera: Arc<C>,
    model: Arc<ModelHandle<M>>,
    config: SessionConfig,
    phase: Phase<C::Stream>,
    attempt: u64,
    live_epoch: u64,
    snapshot: watch::Sender<SessionSnapshot>,
    events: mpsc::UnboundedSender<Event<C::Stream>>,
}

impl<C, M> Actor<C, M>
where
    C: Camera,
    M: EmbeddingModel,
{
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event<C::Stream>>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event),
            }
        }

        // Streams already queued by an acquisition would otherwise be dropped
        // unreleased with the channel. Closing first makes later sends fail,
        // and the acquiring task stops those itself.
        events.close();
        while let Some(event) = events.recv().await {
            if let Event::StreamReady { attempt, stream } = event {
                tracing::debug!(attempt, "releasing stream delivered after shutdown");
                stream.stop();
            }
        }

        if self.phase.state() != CaptureState::Stopped {
            tracing::debug!("all session handles dropped; stopping");
            self.halt();
        }
    }

    fn handle(&mut self, request: Request) {
        let Request { command, reply } = request;
        let state = self.phase.state();
        let stream_held = matches!(self.phase, Phase::Captured { stream: Some(_), .. });

        let result = match plan(state, command, stream_held) {
            Plan::Keep => Ok(Reply::State(state)),
            Plan::Reject => Err(rejection(state, command)),
            Plan::Acquire => {
                if let Some(stream) = self.take().into_stream() {
                    stream.stop();
                }
                self.begin_acquire();
                Ok(Reply::State(CaptureState::Acquiring))
            }
            Plan::Grab => return self.begin_grab(reply),
            Plan::ResumeLive => match self.take() {
                Phase::Captured {
                    stream: Some(stream),
                    ..
                } => {
                    self.enter_live(stream);
                    Ok(Reply::State(CaptureState::Live))
                }
                other => {
                    self.phase = other;
                    Err(rejection(state, command))
                }
            },
            Plan::Finish => match self.take() {
                Phase::Captured { stream, frame } => {
                    if let Some(stream) = stream {
                        stream.stop();
                    }
                    self.enter(Phase::Stopped);
                    tracing::info!(sequence = frame.sequence, "capture confirmed");
                    Ok(Reply::Frame(frame))
                }
                other => {
                    self.phase = other;
                    Err(rejection(state, command))
                }
            },
            Plan::Halt => {
                self.halt();
                Ok(Reply::State(CaptureState::Stopped))
            }
        };
        let _ = reply.send(result);
    }

    fn on_event(&mut self, event: Event<C::Stream>) {
        match event {
            Event::StreamReady { attempt, stream } => match self.phase {
                Phase::Acquiring { attempt: current } if current == attempt => {
                    self.take();
                    self.enter_live(stream);
                }
                _ => {
                    tracing::debug!(attempt, "releasing stream from abandoned acquisition");
                    stream.stop();
                }
            },
            Event::AcquireFailed { attempt, error } => match self.phase {
                Phase::Acquiring { attempt: current } if current == attempt => {
                    self.take();
                    self.fail(error);
                }
                _ => tracing::debug!(attempt, error = %error, "ignoring failure of abandoned acquisition"),
            },
            Event::Faces { epoch, faces } => {
                if matches!(self.phase, Phase::Live { .. }) && epoch == self.live_epoch {
                    self.snapshot.send_modify(|s| {
                        s.face_detected = !faces.is_empty();
                        s.faces = faces;
                    });
                }
            }
            Event::StreamEnded { epoch } => {
                if matches!(self.phase, Phase::Live { .. }) && epoch == self.live_epoch {
                    if let Some(stream) = self.take().into_stream() {
                        stream.stop();
                    }
                    self.fail(AcquireError::PlaybackRejected("stream ended".into()));
                }
            }
            Event::Grabbed { result, reply } => self.finish_grab(result, reply),
            Event::DetectorSettled => {
                let detector = self.model.detector_status();
                self.snapshot.send_modify(|s| s.detector = detector);
            }
        }
    }

    fn begin_acquire(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        let camera = Arc::clone(&self.camera);
        let events = self.events.clone();
        let constraints = self.config.constraints;
        let deadline = self.config.acquire_timeout;

        tokio::spawn(async move {
            let event = match acquire(&*camera, constraints, deadline).await {
                Ok(stream) => Event::StreamReady { attempt, stream },
                Err(error) => Event::AcquireFailed { attempt, error },
            };
            // The actor is gone; nobody else will release this stream.
            if let Err(mpsc::error::SendError(Event::StreamReady { stream, .. })) = events.send(event) {
                stream.stop();
            }
        });

        self.enter_with(Phase::Acquiring { attempt }, |s| s.last_error = None);
    }

    fn begin_grab(&mut self, reply: oneshot::Sender<Result<Reply, SessionError>>) {
        let face_required = self.model.detector_status() == DetectorStatus::Ready;
        if face_required && !self.snapshot.borrow().face_detected {
            let _ = reply.send(Err(SessionError::NoFaceInView));
            return;
        }

        let stream = match self.take() {
            Phase::Live { stream, detection } => {
                drop(detection);
                stream
            }
            other => {
                let state = other.state();
                self.phase = other;
                let _ = reply.send(Err(SessionError::CaptureNotReady(state)));
                return;
            }
        };

        let events = self.events.clone();
        let deadline = self.config.grab_timeout;
        let grabbing = stream.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(deadline, grabbing.grab_frame()).await {
                Ok(result) => result,
                Err(_) => Err(StreamError::CaptureFailed(format!(
                    "no frame within {deadline:?}"
                ))),
            };
            let _ = events.send(Event::Grabbed { result, reply });
        });

        self.enter(Phase::Capturing { stream });
    }

    fn finish_grab(
        &mut self,
        result: Result<StillFrame, StreamError>,
        reply: oneshot::Sender<Result<Reply, SessionError>>,
    ) {
        let stream = match self.take() {
            Phase::Capturing { stream } => stream,
            other => {
                let state = other.state();
                self.phase = other;
                let _ = reply.send(Err(SessionError::CaptureNotReady(state)));
                return;
            }
        };

        let outcome = match result {
            Ok(frame) => {
                let frame = if self.config.mirror_preview {
                    frame.mirror()
                } else {
                    frame
                };
                let stream = if self.config.release_stream_on_capture {
                    stream.stop();
                    None
                } else {
                    Some(stream)
                };
                tracing::info!(
                    width = frame.width,
                    height = frame.height,
                    sequence = frame.sequence,
                    mirrored = frame.mirrored,
                    "still captured"
                );
                self.enter(Phase::Captured {
                    stream,
                    frame: frame.clone(),
                });
                Ok(Reply::Frame(frame))
            }
            Err(StreamError::Inactive) => {
                stream.stop();
                self.fail(AcquireError::PlaybackRejected("stream ended during capture".into()));
                Err(SessionError::FrameGrab(StreamError::Inactive))
            }
            Err(err) => {
                tracing::warn!(error = %err, "still capture failed; back to live");
                self.enter_live(stream);
                Err(SessionError::FrameGrab(err))
            }
        };
        let _ = reply.send(outcome);
    }

    fn halt(&mut self) {
        if let Some(stream) = self.take().into_stream() {
            stream.stop();
        }
        self.enter(Phase::Stopped);
        tracing::info!("capture session stopped");
    }

    fn fail(&mut self, error: AcquireError) {
        tracing::warn!(error = %error, "camera unavailable");
        self.enter_with(Phase::Error, |s| s.last_error = Some(error));
    }

    fn enter_live(&mut self, stream: C::Stream) {
        self.live_epoch += 1;
        let detection = DetectionLoop::spawn(
            stream.clone(),
            Arc::clone(&self.model),
            self.config.detection_interval,
            self.config.mirror_preview,
            self.live_epoch,
            self.events.clone(),
        );
        tracing::info!(epoch = self.live_epoch, "camera live");
        self.enter_with(Phase::Live { stream, detection }, |s| s.last_error = None);
    }

    /// Move the current phase out without publishing. Always followed by
    /// [`enter`](Self::enter) or a restore of `self.phase`.
    fn take(&mut self) -> Phase<C::Stream> {
        std::mem::replace(&mut self.phase, Phase::Idle)
    }

    fn enter(&mut self, next: Phase<C::Stream>) {
        self.enter_with(next, |_| {});
    }

    fn enter_with(&mut self, next: Phase<C::Stream>, update: impl FnOnce(&mut SessionSnapshot)) {
        self.phase = next;
        let to = self.phase.state();
        let has_frame = matches!(self.phase, Phase::Captured { .. });
        let live_epoch = self.live_epoch;
        let mut from = to;

        self.snapshot.send_modify(|s| {
            from = s.state;
            s.state = to;
            s.has_frame = has_frame;
            s.live_epoch = live_epoch;
            if to != CaptureState::Live {
                s.face_detected = false;
                s.faces.clear();
            }
            update(s);
        });

        if from != to {
            tracing::debug!(?from, ?to, "capture state changed");
        }
    }
}

/// Request a stream and confirm playback, each step bounded by `deadline`.
/// A stream that fails to play is released here.
async fn acquire<C: Camera>(
    camera: &C,
    constraints: StreamConstraints,
    deadline: Duration,
) -> Result<C::Stream, AcquireError> {
    let stream = tokio::time::timeout(deadline, camera.request_stream(constraints))
        .await
        .map_err(|_| AcquireError::TimedOut(deadline))??;

    match tokio::time::timeout(deadline, stream.play()).await {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(err)) => {
            stream.stop();
            Err(err)
        }
        Err(_) => {
            stream.stop();
            Err(AcquireError::TimedOut(deadline))
        }
    }
}

fn rejection(state: CaptureState, command: Command) -> SessionError {
    match command {
        Command::Capture => SessionError::CaptureNotReady(state),
        _ => SessionError::InvalidTransition { state, command },
    }
}
