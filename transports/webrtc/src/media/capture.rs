//! Local capture device boundary and reference-counted ownership

use super::LocalStream;
use crate::config::VideoTrackSettings;
use crate::error::CaptureError;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A local capture device (camera), owned outside this crate.
///
/// Only the start/stop boundary is modelled here; frame storage and
/// detection analysis are the device owner's business.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the device and return its stream
    async fn start(&self) -> std::result::Result<LocalStream, CaptureError>;

    /// Close the device
    async fn stop(&self);

    /// Stream of the device while it is open
    fn current_stream(&self) -> Option<LocalStream>;

    /// Most recent frame, for frame analysis consumers
    async fn capture_frame(&self) -> Option<Bytes>;
}

#[derive(Default)]
struct CaptureState {
    usage: usize,
    stream: Option<LocalStream>,
}

/// Reference-counted owner of the capture device.
///
/// The device is started when the first consumer acquires it and stopped
/// when the last one releases it, so the publisher and other consumers
/// (frame analysis) never fight over device ownership.
pub struct CaptureManager {
    device: Arc<dyn CaptureDevice>,
    state: Mutex<CaptureState>,
}

impl CaptureManager {
    /// Wrap a capture device
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(CaptureState::default()),
        }
    }

    /// Increment usage, starting the device if this is the first consumer
    pub async fn acquire(&self) -> Result<LocalStream> {
        let mut state = self.state.lock().await;

        let stream = match &state.stream {
            Some(stream) => stream.clone(),
            None => {
                info!("Starting capture device");
                let stream = self.device.start().await.map_err(Error::Capture)?;
                state.stream = Some(stream.clone());
                stream
            }
        };

        state.usage += 1;
        debug!("Capture usage incremented to {}", state.usage);

        Ok(stream)
    }

    /// Decrement usage, stopping the device when nobody uses it anymore
    pub async fn release(&self) {
        let mut state = self.state.lock().await;

        if state.usage == 0 {
            return;
        }

        state.usage -= 1;
        debug!("Capture usage decremented to {}", state.usage);

        if state.usage == 0 && state.stream.take().is_some() {
            info!("Stopping capture device, last consumer released it");
            self.device.stop().await;
        }
    }

    /// Current number of consumers
    pub async fn usage(&self) -> usize {
        self.state.lock().await.usage
    }

    /// Stream of the device while in use
    pub async fn current_stream(&self) -> Option<LocalStream> {
        self.state.lock().await.stream.clone()
    }

    /// Most recent frame from the device
    pub async fn capture_frame(&self) -> Option<Bytes> {
        self.device.capture_frame().await
    }
}

/// Capture device backed by a `TrackLocalStaticSample` video track.
///
/// The embedding application feeds encoded frames with [`push_sample`];
/// every open transport the track is attached to receives them.
///
/// [`push_sample`]: SampleTrackDevice::push_sample
pub struct SampleTrackDevice {
    settings: VideoTrackSettings,
    stream: parking_lot::Mutex<Option<LocalStream>>,
    last_frame: parking_lot::Mutex<Option<Bytes>>,
}

impl SampleTrackDevice {
    /// Create a device producing one video track with the given settings
    pub fn new(settings: VideoTrackSettings) -> Self {
        Self {
            settings,
            stream: parking_lot::Mutex::new(None),
            last_frame: parking_lot::Mutex::new(None),
        }
    }

    /// Write one encoded frame to the open track
    pub async fn push_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        let stream = self
            .stream
            .lock()
            .clone()
            .ok_or(Error::Capture(CaptureError::Other("device not started".to_string())))?;

        *self.last_frame.lock() = Some(data.clone());

        for track in stream.tracks() {
            track
                .write_sample(&Sample {
                    data: data.clone(),
                    duration,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::WebRtcError(format!("Failed to write sample: {}", e)))?;
        }

        Ok(())
    }
}

#[async_trait]
impl CaptureDevice for SampleTrackDevice {
    async fn start(&self) -> std::result::Result<LocalStream, CaptureError> {
        let stream_id = format!("capture-{}", uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: self.settings.mime_type.clone(),
                clock_rate: self.settings.clock_rate,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_string(),
            stream_id.clone(),
        ));

        let stream = LocalStream::new(stream_id, vec![track]);
        *self.stream.lock() = Some(stream.clone());
        Ok(stream)
    }

    async fn stop(&self) {
        self.stream.lock().take();
        self.last_frame.lock().take();
    }

    fn current_stream(&self) -> Option<LocalStream> {
        self.stream.lock().clone()
    }

    async fn capture_frame(&self) -> Option<Bytes> {
        self.last_frame.lock().clone()
    }
}
