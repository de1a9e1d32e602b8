//! Live face-presence polling, scoped to the `Live` state.

use crate::camera::{StreamError, VideoStream};
use crate::session::Event;
use facepass_core::{BoundingBox, EmbeddingModel, ModelHandle, ModelStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to the polling task of one `Live` epoch. Dropping it aborts the
/// task, so the loop cannot outlive the state that owns it.
pub(crate) struct DetectionLoop {
    task: JoinHandle<()>,
}

impl DetectionLoop {
    pub(crate) fn spawn<S, M>(
        stream: S,
        model: Arc<ModelHandle<M>>,
        interval: Duration,
        mirror: bool,
        epoch: u64,
        events: mpsc::UnboundedSender<Event<S>>,
    ) -> Self
    where
        S: VideoStream,
        M: EmbeddingModel,
    {
        let task = tokio::spawn(run(stream, model, interval, mirror, epoch, events));
        Self { task }
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<S, M>(
    stream: S,
    model: Arc<ModelHandle<M>>,
    interval: Duration,
    mirror: bool,
    epoch: u64,
    events: mpsc::UnboundedSender<Event<S>>,
) where
    S: VideoStream,
    M: EmbeddingModel,
{
    let detecting = !matches!(model.ensure_ready().await, ModelStatus::Unavailable(_));
    if !detecting {
        tracing::debug!(epoch, "detector unavailable; watching stream only");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if !stream.is_active() {
            tracing::debug!(epoch, "stream inactive; live loop exiting");
            let _ = events.send(Event::StreamEnded { epoch });
            return;
        }
        if !detecting {
            continue;
        }

        let frame = match stream.grab_frame().await {
            Ok(frame) => frame,
            Err(StreamError::Inactive) => {
                tracing::debug!(epoch, "stream went inactive mid-tick; live loop exiting");
                let _ = events.send(Event::StreamEnded { epoch });
                return;
            }
            Err(err) => {
                tracing::debug!(epoch, error = %err, "live frame grab failed");
                continue;
            }
        };

        match model.model().detect_faces(&frame).await {
            Ok(mut faces) => {
                if mirror {
                    for face in &mut faces {
                        mirror_box(face, frame.width);
                    }
                }
                if events.send(Event::Faces { epoch, faces }).is_err() {
                    return;
                }
            }
            Err(err) => tracing::debug!(epoch, error = %err, "live detection tick failed"),
        }
    }
}

/// Flip a box horizontally within a frame of `width` pixels.
fn mirror_box(face: &mut BoundingBox, width: u32) {
    face.x = width as f32 - face.x - face.width;
}
