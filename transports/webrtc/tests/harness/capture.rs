//! Fake capture device

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proctor_link::media::LocalStream;
use proctor_link::{CaptureDevice, CaptureError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Camera that counts opens and closes and can be told to fail
#[derive(Default)]
pub struct FakeCapture {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_with: Mutex<Option<CaptureError>>,
    stream: Mutex<Option<LocalStream>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following start fail with `error`
    pub fn fail_with(&self, error: CaptureError) {
        *self.fail_with.lock() = Some(error);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether the device is currently open
    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn start(&self) -> Result<LocalStream, CaptureError> {
        if let Some(error) = self.fail_with.lock().clone() {
            return Err(error);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let stream = LocalStream::new("fake-camera", vec![]);
        *self.stream.lock() = Some(stream.clone());
        Ok(stream)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stream.lock().take();
    }

    fn current_stream(&self) -> Option<LocalStream> {
        self.stream.lock().clone()
    }

    async fn capture_frame(&self) -> Option<Bytes> {
        None
    }
}
