//! Media stream handles exchanged between capture, transports and the state store

pub mod capture;

use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub use capture::{CaptureDevice, CaptureManager, SampleTrackDevice};

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Description of one track inside a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrackInfo {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

impl MediaTrackInfo {
    /// Create a track description
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Inbound media stream surfaced to the rendering layer.
///
/// Only ever stored alongside a `live` stream state.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: String,
    tracks: Vec<MediaTrackInfo>,
    remote: Vec<Arc<TrackRemote>>,
}

impl StreamHandle {
    /// Create a handle from track descriptions only
    pub fn new(stream_id: impl Into<String>, tracks: Vec<MediaTrackInfo>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
            remote: Vec::new(),
        }
    }

    /// Create a handle backed by a remote WebRTC track
    pub fn from_remote(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            stream_id: track.stream_id(),
            tracks: vec![MediaTrackInfo::new(track.id(), kind)],
            remote: vec![track],
        }
    }

    /// Stream identifier
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Track descriptions
    pub fn tracks(&self) -> &[MediaTrackInfo] {
        &self.tracks
    }

    /// Underlying remote tracks, for consumers reading RTP
    pub fn remote_tracks(&self) -> &[Arc<TrackRemote>] {
        &self.remote
    }

    /// Whether the stream carries at least one track
    pub fn has_tracks(&self) -> bool {
        !self.tracks.is_empty()
    }

    /// Fold the tracks of another handle into this one
    pub fn merge(&mut self, other: StreamHandle) {
        for track in other.tracks {
            if !self.tracks.iter().any(|t| t.id == track.id) {
                self.tracks.push(track);
            }
        }
        self.remote.extend(other.remote);
    }
}

impl PartialEq for StreamHandle {
    fn eq(&self, other: &Self) -> bool {
        self.stream_id == other.stream_id && self.tracks == other.tracks
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

/// Local capture stream attached to publisher transports
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl LocalStream {
    /// Create a local stream from sample tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sample tracks the application writes media into
    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_handle_has_no_tracks() {
        let handle = StreamHandle::new("s1", vec![]);
        assert!(!handle.has_tracks());
    }

    #[test]
    fn test_merge_dedups_tracks() {
        let mut a = StreamHandle::new("s1", vec![MediaTrackInfo::new("v", TrackKind::Video)]);
        let b = StreamHandle::new(
            "s1",
            vec![
                MediaTrackInfo::new("v", TrackKind::Video),
                MediaTrackInfo::new("a", TrackKind::Audio),
            ],
        );
        a.merge(b);
        assert_eq!(a.tracks().len(), 2);
    }
}
