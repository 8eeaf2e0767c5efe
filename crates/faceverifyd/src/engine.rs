use crate::session::{Effect, Event, Session, StatusReport, Verdict};
use faceverify_core::MatchPolicy;
use faceverify_io::{CaptureError, CaptureSource, ReferenceStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, WeakSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine task exited")]
    ChannelClosed,
}

/// Matching parameters fixed for the lifetime of the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub threshold: f32,
    pub policy: MatchPolicy,
    pub poll_interval: Duration,
}

/// Messages handled by the engine task.
enum EngineRequest {
    Event(Event),
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
    Verdict {
        reply: oneshot::Sender<Verdict>,
    },
}

/// Clone-safe handle to the engine task.
///
/// The engine shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Submit a matric number: refetch its references and start capture.
    pub async fn submit(&self, matric_number: &str) -> Result<(), EngineError> {
        self.send(Event::Submitted(matric_number.to_string())).await
    }

    /// Update the matric number without requesting capture.
    pub async fn set_identifier(&self, matric_number: &str) -> Result<(), EngineError> {
        self.send(Event::IdentifierChanged(matric_number.to_string()))
            .await
    }

    /// Forget the current matric number and its references.
    pub async fn clear(&self) -> Result<(), EngineError> {
        self.send(Event::Cleared).await
    }

    pub async fn status(&self) -> Result<StatusReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn verdict(&self) -> Result<Verdict, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verdict { reply })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    async fn send(&self, event: Event) -> Result<(), EngineError> {
        self.tx
            .send(EngineRequest::Event(event))
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine task and the capture thread.
///
/// The capture thread loads the model right away but only starts polling
/// once the session reaches `CaptureActive`. Fetches run as tokio tasks and
/// report back tagged with the generation they were issued for.
pub fn spawn_engine(
    settings: EngineSettings,
    store: Arc<dyn ReferenceStore>,
    source: Box<dyn CaptureSource>,
) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);
    let (start_tx, start_rx) = std::sync::mpsc::channel::<()>();

    let capture_events = tx.downgrade();
    let poll_interval = settings.poll_interval;
    std::thread::Builder::new()
        .name("faceverify-capture".into())
        .spawn(move || run_capture(source, capture_events, start_rx, poll_interval))?;

    let session = Session::new(settings.threshold, settings.policy);
    tracing::info!(
        threshold = settings.threshold,
        policy = %settings.policy,
        poll_ms = poll_interval.as_millis() as u64,
        "engine started"
    );
    tokio::spawn(run_engine(session, rx, tx.downgrade(), store, start_tx));

    Ok(EngineHandle { tx })
}

async fn run_engine(
    mut session: Session,
    mut rx: mpsc::Receiver<EngineRequest>,
    events: WeakSender<EngineRequest>,
    store: Arc<dyn ReferenceStore>,
    start_capture: std::sync::mpsc::Sender<()>,
) {
    let mut in_flight: Option<JoinHandle<()>> = None;

    while let Some(req) = rx.recv().await {
        match req {
            EngineRequest::Event(event) => {
                for effect in session.apply(event) {
                    match effect {
                        Effect::StartFetch {
                            generation,
                            matric_number,
                        } => {
                            // The session already ignores its reply; stop spending on it.
                            if let Some(previous) = in_flight.take() {
                                previous.abort();
                            }
                            in_flight = Some(spawn_fetch(
                                store.clone(),
                                events.clone(),
                                generation,
                                matric_number,
                            ));
                        }
                        Effect::StartCapture => {
                            if start_capture.send(()).is_err() {
                                tracing::warn!("capture thread is gone; no detections will arrive");
                            }
                        }
                    }
                }
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(session.status());
            }
            EngineRequest::Verdict { reply } => {
                let _ = reply.send(session.verdict());
            }
        }
    }

    if let Some(previous) = in_flight {
        previous.abort();
    }
    tracing::info!("engine task exiting");
}

fn spawn_fetch(
    store: Arc<dyn ReferenceStore>,
    events: WeakSender<EngineRequest>,
    generation: u64,
    matric_number: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let result = store.fetch(&matric_number).await;
        tracing::debug!(
            %matric_number,
            generation,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reference fetch finished"
        );

        let Some(tx) = events.upgrade() else {
            return;
        };
        let _ = tx
            .send(EngineRequest::Event(Event::FetchCompleted {
                generation,
                matric_number,
                result,
            }))
            .await;
    })
}

/// Load the model, wait for the go signal, then poll at a fixed cadence.
///
/// Each detection set is sent with a blocking send, so ticks reach the
/// session one at a time and in order. Runs until the engine goes away or
/// the source is exhausted.
fn run_capture(
    mut source: Box<dyn CaptureSource>,
    events: WeakSender<EngineRequest>,
    start: std::sync::mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    tracing::info!("capture thread started; loading model");
    match source.load() {
        Ok(info) => {
            if !send_event(&events, Event::ModelLoaded(info)) {
                return;
            }
        }
        Err(err) => {
            send_event(&events, Event::ModelFailed(err.to_string()));
            return;
        }
    }

    if start.recv().is_err() {
        tracing::info!("engine exited before capture started");
        return;
    }

    loop {
        let tick_started = Instant::now();
        match source.detect() {
            Ok(detections) => {
                if !send_event(&events, Event::DetectionsCaptured(detections)) {
                    break;
                }
            }
            Err(CaptureError::Exhausted) => {
                tracing::info!("capture source exhausted");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "capture failed; retrying next tick");
            }
        }

        if let Some(rest) = poll_interval.checked_sub(tick_started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    tracing::info!("capture thread exiting");
}

fn send_event(events: &WeakSender<EngineRequest>, event: Event) -> bool {
    match events.upgrade() {
        Some(tx) => tx.blocking_send(EngineRequest::Event(event)).is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Readiness;
    use async_trait::async_trait;
    use chrono::Utc;
    use faceverify_core::{Descriptor, ReferenceRecord, ReferenceSet};
    use faceverify_io::{AcquisitionError, ReplaySource};
    use std::collections::HashMap;

    /// In-memory store: matric number → (delay, descriptors). Unknown ids fail with 404.
    struct FakeStore {
        entries: HashMap<String, (Duration, Vec<Vec<f32>>)>,
    }

    impl FakeStore {
        fn new(entries: &[(&str, u64, Vec<Vec<f32>>)]) -> Arc<Self> {
            Arc::new(Self {
                entries: entries
                    .iter()
                    .map(|(id, delay_ms, descs)| {
                        (id.to_string(), (Duration::from_millis(*delay_ms), descs.clone()))
                    })
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl ReferenceStore for FakeStore {
        async fn fetch(&self, matric_number: &str) -> Result<ReferenceSet, AcquisitionError> {
            let Some((delay, descriptors)) = self.entries.get(matric_number) else {
                return Err(AcquisitionError::Status { status: 404 });
            };
            tokio::time::sleep(*delay).await;
            let records = descriptors
                .iter()
                .map(|v| ReferenceRecord {
                    matric_number: matric_number.to_string(),
                    image_url: None,
                    descriptor: Some(Descriptor::new(v.clone()).unwrap()),
                })
                .collect();
            Ok(ReferenceSet::new(matric_number, records, Utc::now()))
        }
    }

    fn replay(lines: &str) -> Box<dyn CaptureSource> {
        Box::new(ReplaySource::from_reader(lines.as_bytes(), true).unwrap())
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            threshold: 0.6,
            policy: MatchPolicy::First,
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Poll status until `done` holds, or fail after two seconds.
    async fn wait_for(engine: &EngineHandle, done: impl Fn(&StatusReport) -> bool) -> StatusReport {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let status = engine.status().await.unwrap();
            if done(&status) {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out; last status: {status:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_then_match() {
        let store = FakeStore::new(&[("CSC/001", 0, vec![vec![0.1, 0.0]])]);
        let source = replay("[{\"descriptor\": [0.0, 0.0]}]\n");
        let engine = spawn_engine(settings(), store, source).unwrap();

        let status = wait_for(&engine, |s| s.readiness == Readiness::ModelReady).await;
        assert_eq!(status.ticks, 0);

        engine.submit("CSC/001").await.unwrap();
        let status = wait_for(&engine, |s| s.verdict == Verdict::Matched).await;
        assert_eq!(status.readiness, Readiness::CaptureActive);
        assert_eq!(status.references.unwrap().matric_number, "CSC/001");
        assert_eq!(engine.verdict().await.unwrap(), Verdict::Matched);
    }

    #[tokio::test]
    async fn test_unknown_student_is_unavailable() {
        let store = FakeStore::new(&[]);
        let source = replay("[{\"descriptor\": [0.0, 0.0]}]\n");
        let engine = spawn_engine(settings(), store, source).unwrap();

        engine.submit("NOBODY").await.unwrap();
        let status = wait_for(&engine, |s| s.verdict == Verdict::Unavailable).await;
        assert_eq!(
            status.last_error.as_deref(),
            Some("reference service returned HTTP 404")
        );
    }

    #[tokio::test]
    async fn test_late_reply_for_old_identifier_is_discarded() {
        let store = FakeStore::new(&[
            ("SLOW", 200, vec![vec![0.0, 0.0]]),
            ("FAST", 0, vec![vec![7.0, 7.0]]),
        ]);
        let source = replay("[{\"descriptor\": [0.0, 0.0]}]\n");
        let engine = spawn_engine(settings(), store, source).unwrap();

        engine.submit("SLOW").await.unwrap();
        engine.set_identifier("FAST").await.unwrap();
        wait_for(&engine, |s| s.verdict == Verdict::NotMatched).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = engine.status().await.unwrap();
        assert_eq!(status.references.unwrap().matric_number, "FAST");
        assert_eq!(status.verdict, Verdict::NotMatched);
    }

    #[tokio::test]
    async fn test_model_failure_surfaces_in_status() {
        let store = FakeStore::new(&[]);
        let source = Box::new(ReplaySource::from_reader("\n".as_bytes(), true).unwrap());
        let engine = spawn_engine(settings(), store, source).unwrap();

        let status = wait_for(&engine, |s| {
            matches!(s.readiness, Readiness::ModelFailed { .. })
        })
        .await;
        assert_eq!(
            status.readiness,
            Readiness::ModelFailed { reason: "replay contains no detection sets".into() }
        );
    }

    #[tokio::test]
    async fn test_clear_resets_verdict() {
        let store = FakeStore::new(&[("CSC/001", 0, vec![vec![0.0, 0.0]])]);
        let source = replay("[{\"descriptor\": [0.0, 0.0]}]\n");
        let engine = spawn_engine(settings(), store, source).unwrap();

        engine.submit("CSC/001").await.unwrap();
        wait_for(&engine, |s| s.verdict == Verdict::Matched).await;

        engine.clear().await.unwrap();
        let status = engine.status().await.unwrap();
        assert_eq!(status.verdict, Verdict::Pending);
        assert!(status.references.is_none());
        assert_eq!(status.identifier, "");
    }
}
