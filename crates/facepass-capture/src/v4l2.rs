//! V4L2 camera adapter via the `v4l` crate.

use crate::camera::{AcquireError, Camera, StreamConstraints, StreamError, VideoStream};
use async_trait::async_trait;
use facepass_core::{PixelLayout, StillFrame};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed, Y channel extracted.
    Yuyv,
    Grey,
    /// 16-bit little-endian grayscale, common on IR sensors.
    Y16,
}

/// A V4L2 capture device, opened fresh for every stream request.
#[derive(Debug, Clone)]
pub struct V4l2Camera {
    device_path: String,
}

impl V4l2Camera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Capture-capable `/dev/videoN` nodes, in device-number order. Nodes
    /// that cannot be opened or queried are skipped.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut nodes: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| video_node_index(&entry.file_name().to_string_lossy()))
            .collect();
        nodes.sort_unstable();

        nodes
            .into_iter()
            .filter_map(|index| {
                let path = format!("/dev/video{index}");
                let caps = Device::with_path(&path).and_then(|dev| dev.query_caps()).ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

#[async_trait]
impl Camera for V4l2Camera {
    type Stream = V4l2Stream;

    async fn request_stream(&self, constraints: StreamConstraints) -> Result<V4l2Stream, AcquireError> {
        let path = self.device_path.clone();
        let inner = tokio::task::spawn_blocking(move || open(&path, constraints))
            .await
            .map_err(|e| AcquireError::PlaybackRejected(format!("open task failed: {e}")))??;
        Ok(V4l2Stream {
            inner: Arc::new(inner),
        })
    }
}

fn open(device_path: &str, constraints: StreamConstraints) -> Result<StreamInner, AcquireError> {
    if !Path::new(device_path).exists() {
        return Err(AcquireError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| classify(device_path, e))?;

    let caps = device
        .query_caps()
        .map_err(|e| AcquireError::Unsupported(format!("failed to query capabilities: {e}")))?;
    tracing::info!(
        device = device_path,
        driver = %caps.driver,
        card = %caps.card,
        "camera opened"
    );

    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(AcquireError::Unsupported(format!(
            "{device_path} is not a video capture device"
        )));
    }

    let mut fmt = device
        .format()
        .map_err(|e| AcquireError::Unsupported(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = constraints.width;
    fmt.height = constraints.height;

    let negotiated = device.set_format(&fmt).map_err(|e| match e.raw_os_error() {
        Some(EBUSY) => AcquireError::DeviceBusy,
        _ => AcquireError::Unsupported(format!("failed to set format: {e}")),
    })?;

    let fourcc = negotiated.fourcc;
    let pixel_format = if fourcc == FourCC::new(b"GREY") {
        PixelFormat::Grey
    } else if fourcc == FourCC::new(b"YUYV") {
        PixelFormat::Yuyv
    } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
        PixelFormat::Y16
    } else {
        return Err(AcquireError::Unsupported(format!(
            "pixel format {fourcc:?} (need YUYV, GREY, or Y16)"
        )));
    };

    tracing::info!(
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?fourcc,
        "negotiated format"
    );

    Ok(StreamInner {
        device: Mutex::new(Some(device)),
        width: negotiated.width,
        height: negotiated.height,
        pixel_format,
        device_path: device_path.to_string(),
    })
}

fn classify(device_path: &str, err: io::Error) -> AcquireError {
    if err.raw_os_error() == Some(EBUSY) {
        return AcquireError::DeviceBusy;
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => AcquireError::PermissionDenied,
        io::ErrorKind::NotFound => AcquireError::DeviceNotFound(device_path.to_string()),
        _ => AcquireError::PlaybackRejected(format!("{device_path}: {err}")),
    }
}

/// Open V4L2 stream. Clones share the device; [`stop`](VideoStream::stop)
/// closes it for all of them.
#[derive(Clone)]
pub struct V4l2Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    device: Mutex<Option<Device>>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    device_path: String,
}

#[derive(Debug)]
enum ReadError {
    Stopped,
    Io(io::Error),
    Convert(String),
}

impl StreamInner {
    fn read_frame(&self) -> Result<StillFrame, ReadError> {
        let guard = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let device = guard.as_ref().ok_or(ReadError::Stopped)?;

        let mut stream =
            MmapStream::with_buffers(device, BufType::VideoCapture, 4).map_err(ReadError::Io)?;
        let (buf, meta) = stream.next().map_err(ReadError::Io)?;

        let gray = to_grayscale(buf, self.width, self.height, self.pixel_format)
            .map_err(ReadError::Convert)?;
        let frame = StillFrame::new(gray, self.width, self.height, PixelLayout::Gray8)
            .map_err(|e| ReadError::Convert(e.to_string()))?;
        Ok(frame.with_sequence(meta.sequence))
    }
}

impl V4l2Stream {
    async fn read_blocking(&self) -> Result<StillFrame, ReadError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read_frame())
            .await
            .map_err(|e| ReadError::Convert(format!("capture task failed: {e}")))?
    }
}

#[async_trait]
impl VideoStream for V4l2Stream {
    async fn play(&self) -> Result<(), AcquireError> {
        match self.read_blocking().await {
            Ok(frame) => {
                tracing::debug!(
                    device = %self.inner.device_path,
                    sequence = frame.sequence,
                    brightness = frame.avg_brightness(),
                    "first frame received"
                );
                Ok(())
            }
            Err(ReadError::Stopped) => Err(AcquireError::PlaybackRejected("stream stopped".into())),
            Err(ReadError::Io(e)) if e.raw_os_error() == Some(EBUSY) => Err(AcquireError::DeviceBusy),
            Err(ReadError::Io(e)) => Err(AcquireError::PlaybackRejected(e.to_string())),
            Err(ReadError::Convert(msg)) => Err(AcquireError::PlaybackRejected(msg)),
        }
    }

    async fn grab_frame(&self) -> Result<StillFrame, StreamError> {
        self.read_blocking().await.map_err(|e| match e {
            ReadError::Stopped => StreamError::Inactive,
            ReadError::Io(e) => StreamError::CaptureFailed(format!("failed to dequeue buffer: {e}")),
            ReadError::Convert(msg) => StreamError::CaptureFailed(msg),
        })
    }

    fn is_active(&self) -> bool {
        self.inner
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn stop(&self) {
        let released = self
            .inner
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            tracing::info!(device = %self.inner.device_path, "camera released");
        }
    }
}

fn to_grayscale(buf: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>, String> {
    let pixels = width as usize * height as usize;
    match format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(format!("GREY buffer too short: expected {pixels}, got {}", buf.len()));
            }
            Ok(buf[..pixels].to_vec())
        }
        // Keep the high byte of each 16-bit sample.
        PixelFormat::Y16 => {
            if buf.len() < pixels * 2 {
                return Err(format!(
                    "Y16 buffer too short: expected {}, got {}",
                    pixels * 2,
                    buf.len()
                ));
            }
            Ok(buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
        }
        // [Y0, U, Y1, V]: luma is every even byte.
        PixelFormat::Yuyv => {
            if buf.len() < pixels * 2 {
                return Err(format!(
                    "YUYV buffer too short: expected {}, got {}",
                    pixels * 2,
                    buf.len()
                ));
            }
            Ok(buf[..pixels * 2].iter().step_by(2).copied().collect())
        }
    }
}

/// `video3` -> `Some(3)`. Other `/dev` names, including `video-codec`-style
/// aliases, are not capture nodes.
fn video_node_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("video")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
