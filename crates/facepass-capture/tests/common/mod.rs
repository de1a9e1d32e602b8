#![allow(dead_code)] // Each test crate uses a subset of the fakes.

use async_trait::async_trait;
use facepass_capture::{
    AcquireError, Camera, CaptureSession, SessionConfig, StreamConstraints, StreamError,
    VideoStream,
};
use facepass_core::{
    BoundingBox, Embedding, EmbeddingModel, ModelError, ModelHandle, ModelLoadError, PixelLayout,
    StillFrame,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted outcome of one `request_stream` call.
#[derive(Debug, Clone)]
pub enum Acquire {
    Succeeds,
    RequestFails(AcquireError),
    PlayFails(AcquireError),
}

#[derive(Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub released: AtomicUsize,
    pub grabs: AtomicUsize,
}

impl Counters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// In-memory camera that counts opens and releases.
#[derive(Default)]
pub struct FakeCamera {
    pub counters: Arc<Counters>,
    script: Mutex<VecDeque<Acquire>>,
    grab_failures: Arc<Mutex<VecDeque<StreamError>>>,
    streams: Mutex<Vec<FakeStream>>,
    /// When set, every request waits for a permit before opening.
    gate: Option<Arc<Notify>>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: impl IntoIterator<Item = Acquire>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_next_grab(&self, err: StreamError) {
        self.grab_failures.lock().unwrap().push_back(err);
    }

    /// Simulate the device disappearing under every open stream.
    pub fn end_all_streams(&self) {
        for stream in self.streams.lock().unwrap().iter() {
            stream.inner.active.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Camera for FakeCamera {
    type Stream = FakeStream;

    async fn request_stream(&self, _constraints: StreamConstraints) -> Result<FakeStream, AcquireError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Acquire::Succeeds);
        if let Acquire::RequestFails(err) = outcome {
            return Err(err);
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_live.fetch_max(live, Ordering::SeqCst);

        let stream = FakeStream {
            inner: Arc::new(StreamInner {
                active: AtomicBool::new(true),
                play_error: match outcome {
                    Acquire::PlayFails(err) => Some(err),
                    _ => None,
                },
                sequence: AtomicU32::new(0),
                counters: Arc::clone(&self.counters),
                grab_failures: Arc::clone(&self.grab_failures),
            }),
        };
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

struct StreamInner {
    active: AtomicBool,
    play_error: Option<AcquireError>,
    sequence: AtomicU32,
    counters: Arc<Counters>,
    grab_failures: Arc<Mutex<VecDeque<StreamError>>>,
}

#[derive(Clone)]
pub struct FakeStream {
    inner: Arc<StreamInner>,
}

#[async_trait]
impl VideoStream for FakeStream {
    async fn play(&self) -> Result<(), AcquireError> {
        match &self.inner.play_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn grab_frame(&self) -> Result<StillFrame, StreamError> {
        if !self.is_active() {
            return Err(StreamError::Inactive);
        }
        if let Some(err) = self.inner.grab_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.inner.counters.grabs.fetch_add(1, Ordering::SeqCst);
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let data = (0..16u8).collect();
        Ok(StillFrame::new(data, 4, 4, PixelLayout::Gray8)
            .unwrap()
            .with_sequence(sequence))
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            self.inner.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.inner.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Model whose detector reports whatever faces the test sets.
pub struct FakeModel {
    pub load: Result<(), ModelLoadError>,
    pub faces: Mutex<Vec<BoundingBox>>,
}

impl FakeModel {
    pub fn seeing(faces: Vec<BoundingBox>) -> Self {
        Self {
            load: Ok(()),
            faces: Mutex::new(faces),
        }
    }

    pub fn blind() -> Self {
        Self::seeing(Vec::new())
    }

    pub fn broken() -> Self {
        Self {
            load: Err(ModelLoadError::WeightsMissing("facenet.onnx".into())),
            faces: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EmbeddingModel for FakeModel {
    async fn ready(&self) -> Result<(), ModelLoadError> {
        self.load.clone()
    }

    async fn detect_faces(&self, _frame: &StillFrame) -> Result<Vec<BoundingBox>, ModelError> {
        Ok(self.faces.lock().unwrap().clone())
    }

    async fn extract_embedding(&self, _frame: &StillFrame) -> Result<Option<Embedding>, ModelError> {
        Ok(Some(Embedding::new(vec![0.1, 0.2, 0.3])))
    }

    fn dimension(&self) -> usize {
        3
    }
}

pub fn face() -> BoundingBox {
    BoundingBox {
        x: 1.0,
        y: 1.0,
        width: 2.0,
        height: 2.0,
        confidence: 0.98,
    }
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        detection_interval: Duration::from_millis(5),
        acquire_timeout: Duration::from_millis(500),
        grab_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

pub fn spawn_session(camera: &Arc<FakeCamera>, model: FakeModel, config: SessionConfig) -> CaptureSession {
    let model = Arc::new(ModelHandle::new(model, Duration::from_secs(1)));
    CaptureSession::spawn(Arc::clone(camera), model, config)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
