use bytes::Bytes;
use camera_upload_common::frame::{encode_jpeg, Frame, FrameError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::gate::RateGate;
use crate::storage::{BlobStore, StorageError, UploadRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Setup,
    Conversion,
    Encoding,
    Transmission,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Setup => "setup",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Transmission => "transmission",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("container setup failed: {0}")]
    Setup(#[source] StorageError),
    #[error("frame conversion failed: {0}")]
    Conversion(#[source] FrameError),
    #[error("jpeg encoding failed: {0}")]
    Encoding(#[source] FrameError),
    #[error("upload failed: {0}")]
    Transmission(#[source] StorageError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Setup(_) => ErrorKind::Setup,
            PipelineError::Conversion(_) => ErrorKind::Conversion,
            PipelineError::Encoding(_) => ErrorKind::Encoding,
            PipelineError::Transmission(_) => ErrorKind::Transmission,
        }
    }
}

/// `<prefix><uuid v4>.jpg`
pub fn object_name(prefix: &str) -> String {
    format!("{prefix}{}.jpg", Uuid::new_v4())
}

/// Encodes admitted frames and writes them to the store.
pub struct Uploader<S> {
    store: S,
    prefix: String,
    jpeg_quality: u8,
}

impl<S: BlobStore> Uploader<S> {
    pub fn new(store: S, prefix: impl Into<String>, jpeg_quality: u8) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            jpeg_quality,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn ensure_container(&self) -> Result<(), PipelineError> {
        self.store
            .ensure_container()
            .await
            .map_err(PipelineError::Setup)
    }

    /// Convert and encode `frame` into an upload record without sending it.
    pub fn prepare(&self, frame: &Frame) -> Result<UploadRecord, PipelineError> {
        let rgb = frame.to_rgb().map_err(PipelineError::Conversion)?;
        let jpeg = encode_jpeg(&rgb, self.jpeg_quality).map_err(PipelineError::Encoding)?;
        Ok(UploadRecord {
            name: object_name(&self.prefix),
            data: Bytes::from(jpeg),
            container: self.store.container().to_string(),
            captured_at: frame.stamp,
        })
    }

    pub async fn upload(&self, frame: &Frame) -> Result<UploadRecord, PipelineError> {
        let record = self.prepare(frame)?;
        self.store
            .put_blob(&record, true)
            .await
            .map_err(PipelineError::Transmission)?;
        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    RateLimited,
    Uploaded(String),
    Failed(ErrorKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub rate_limited: u64,
    pub uploaded: u64,
    pub failed: u64,
}

/// Per-frame entry point: rate gate, then upload. Every failure is logged
/// here and nowhere else.
pub struct CaptureNode<S> {
    gate: RateGate,
    uploader: Uploader<S>,
    received: AtomicU64,
    rate_limited: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
}

impl<S: BlobStore> CaptureNode<S> {
    pub fn new(gate: RateGate, uploader: Uploader<S>) -> Self {
        Self {
            gate,
            uploader,
            received: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn uploader(&self) -> &Uploader<S> {
        &self.uploader
    }

    /// Run the startup container check. Failure is logged and swallowed:
    /// the node keeps running and each upload reports its own error.
    pub async fn setup(&self) -> bool {
        match self.uploader.ensure_container().await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    kind = %e.kind(),
                    container = self.uploader.store().container(),
                    "container setup failed; uploads will fail until it exists"
                );
                false
            }
        }
    }

    pub async fn handle_frame(&self, frame: &Frame) -> FrameOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        // Admission is recorded before conversion; a frame that fails later
        // still starts a new cool-down.
        if !self.gate.try_admit(frame.received_at) {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::RateLimited;
        }

        match self.uploader.upload(frame).await {
            Ok(record) => {
                self.uploaded.fetch_add(1, Ordering::Relaxed);
                info!(
                    name = record.name,
                    bytes = record.data.len(),
                    container = record.container,
                    captured_at = record.captured_at.map(|ts| ts.to_rfc3339()),
                    "uploaded frame"
                );
                FrameOutcome::Uploaded(record.name)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    kind = %e.kind(),
                    width = frame.width,
                    height = frame.height,
                    encoding = frame.encoding,
                    "dropping frame"
                );
                debug!(?e, "frame failure detail");
                FrameOutcome::Failed(e.kind())
            }
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            received: self.received.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use camera_upload_common::frame::PixelEncoding;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn frame_at(at: Instant) -> Frame {
        Frame::packed(16, 8, PixelEncoding::Bgr8, vec![90; 16 * 8 * 3]).with_received_at(at)
    }

    fn malformed_at(at: Instant) -> Frame {
        Frame::packed(16, 8, PixelEncoding::Bgr8, vec![90; 20]).with_received_at(at)
    }

    fn node(store: MemoryStore, interval: f64, started_at: Instant) -> CaptureNode<MemoryStore> {
        CaptureNode::new(
            RateGate::new(Duration::from_secs_f64(interval), started_at),
            Uploader::new(store, "", 95),
        )
    }

    fn t(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn names_are_unique_jpg_objects() {
        let names: HashSet<String> = (0..10_000).map(|_| object_name("")).collect();
        assert_eq!(names.len(), 10_000);
        assert!(names.iter().all(|n| n.ends_with(".jpg") && n.len() == 40));
    }

    #[test]
    fn name_carries_prefix() {
        assert!(object_name("cam/").starts_with("cam/"));
    }

    #[test]
    fn prepare_yields_non_empty_jpeg() {
        let uploader = Uploader::new(MemoryStore::existing("robot-images"), "", 95);
        let stamp = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let record = uploader
            .prepare(&frame_at(Instant::now()).with_stamp(stamp))
            .unwrap();
        assert!(!record.data.is_empty());
        assert_eq!(record.container, "robot-images");
        assert_eq!(record.captured_at, Some(stamp));
    }

    #[test]
    fn prepare_reports_conversion_error() {
        let uploader = Uploader::new(MemoryStore::existing("robot-images"), "", 95);
        let err = uploader.prepare(&malformed_at(Instant::now())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    // interval 5s; frames at t=0,1,2,6 -> uploads at t=0 and t=6
    #[tokio::test]
    async fn uploads_respect_interval() {
        let start = Instant::now();
        // Node started an interval before the first frame.
        let base = t(start, 5);
        let node = node(MemoryStore::existing("robot-images"), 5.0, start);

        let mut outcomes = Vec::new();
        for secs in [0, 1, 2, 6] {
            outcomes.push(node.handle_frame(&frame_at(t(base, secs))).await);
        }

        assert!(matches!(outcomes[0], FrameOutcome::Uploaded(_)));
        assert_eq!(outcomes[1], FrameOutcome::RateLimited);
        assert_eq!(outcomes[2], FrameOutcome::RateLimited);
        assert!(matches!(outcomes[3], FrameOutcome::Uploaded(_)));
        assert_eq!(node.uploader().store().names().len(), 2);
        assert_eq!(
            node.stats(),
            Stats {
                received: 4,
                rate_limited: 2,
                uploaded: 2,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn zero_interval_uploads_every_frame() {
        let start = Instant::now();
        let node = node(MemoryStore::existing("robot-images"), 0.0, start);
        for _ in 0..5 {
            let outcome = node.handle_frame(&frame_at(start)).await;
            assert!(matches!(outcome, FrameOutcome::Uploaded(_)));
        }
        assert_eq!(node.uploader().store().names().len(), 5);
    }

    #[tokio::test]
    async fn existing_container_does_not_block_startup() {
        let start = Instant::now();
        let node = node(MemoryStore::existing("robot-images"), 5.0, start);
        assert!(node.setup().await);
        assert!(node.setup().await);
        // Each setup asks for the bucket and is told it already exists.
        assert_eq!(
            node.uploader().store().create_calls.load(Ordering::SeqCst),
            2
        );

        let outcome = node.handle_frame(&frame_at(t(start, 5))).await;
        assert!(matches!(outcome, FrameOutcome::Uploaded(_)));
    }

    #[tokio::test]
    async fn missing_container_is_created_then_reused() {
        let start = Instant::now();
        let node = node(MemoryStore::new("robot-images"), 0.0, start);
        assert!(node.setup().await);
        assert!(node.setup().await);
        assert_eq!(
            node.uploader().store().create_calls.load(Ordering::SeqCst),
            2
        );
        assert!(matches!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Uploaded(_)
        ));
    }

    #[tokio::test]
    async fn failed_setup_degrades_uploads_without_stopping() {
        let start = Instant::now();
        let store = MemoryStore::new("robot-images");
        store.fail_create.store(true, Ordering::SeqCst);
        let node = node(store, 0.0, start);

        assert!(!node.setup().await);
        assert_eq!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Failed(ErrorKind::Transmission)
        );
        assert_eq!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Failed(ErrorKind::Transmission)
        );
    }

    // conversion failure at t=10 with the gate open; t=15 still uploads
    #[tokio::test]
    async fn conversion_failure_drops_only_that_frame() {
        let start = Instant::now();
        let node = node(MemoryStore::existing("robot-images"), 5.0, start);

        let outcome = node.handle_frame(&malformed_at(t(start, 10))).await;
        assert_eq!(outcome, FrameOutcome::Failed(ErrorKind::Conversion));
        assert_eq!(
            node.uploader().store().put_calls.load(Ordering::SeqCst),
            0
        );

        assert_eq!(
            node.handle_frame(&frame_at(t(start, 12))).await,
            FrameOutcome::RateLimited
        );
        let outcome = node.handle_frame(&frame_at(t(start, 15))).await;
        assert!(matches!(outcome, FrameOutcome::Uploaded(_)));
        assert_eq!(node.stats().failed, 1);
    }

    // JPEG caps each side at 65535 pixels
    #[tokio::test]
    async fn encoding_failure_drops_only_that_frame() {
        let start = Instant::now();
        let node = node(MemoryStore::existing("robot-images"), 0.0, start);
        let wide = Frame::packed(70_000, 1, PixelEncoding::Rgb8, vec![0; 210_000])
            .with_received_at(start);

        assert_eq!(
            node.handle_frame(&wide).await,
            FrameOutcome::Failed(ErrorKind::Encoding)
        );
        assert_eq!(
            node.uploader().store().put_calls.load(Ordering::SeqCst),
            0
        );

        assert!(matches!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Uploaded(_)
        ));
        assert_eq!(node.stats().failed, 1);
        assert_eq!(node.stats().uploaded, 1);
    }

    #[tokio::test]
    async fn transmission_failure_is_not_retried() {
        let start = Instant::now();
        let store = MemoryStore::existing("robot-images");
        store.fail_puts.store(true, Ordering::SeqCst);
        let node = node(store, 0.0, start);

        assert_eq!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Failed(ErrorKind::Transmission)
        );
        assert_eq!(
            node.uploader().store().put_calls.load(Ordering::SeqCst),
            1
        );

        node.uploader()
            .store()
            .fail_puts
            .store(false, Ordering::SeqCst);
        assert!(matches!(
            node.handle_frame(&frame_at(start)).await,
            FrameOutcome::Uploaded(_)
        ));
    }

    #[tokio::test]
    async fn unsupported_encoding_is_a_conversion_failure() {
        let start = Instant::now();
        let node = node(MemoryStore::existing("robot-images"), 0.0, start);
        let mut frame = frame_at(start);
        frame.encoding = "nv21".into();
        assert_eq!(
            node.handle_frame(&frame).await,
            FrameOutcome::Failed(ErrorKind::Conversion)
        );
    }
}
