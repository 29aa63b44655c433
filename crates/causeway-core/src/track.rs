//! Track identity.

use causeway_proto as pb;

/// Localhost UDP port carrying one RTP flow. Port assignment is the
/// caller's responsibility; the engine only binds or connects to what it
/// is told.
pub type LocalhostPort = u16;

/// Value identity of a media track: `(track_id, stream_id, mime_type)`.
///
/// The mime type is lowercased on construction so that equality and
/// hashing ignore the case the wire happened to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedTrackKey {
    pub track_id: String,
    pub stream_id: String,
    pub mime_type: String,
}

impl NamedTrackKey {
    pub fn new(
        track_id: impl Into<String>,
        stream_id: impl Into<String>,
        mime_type: impl AsRef<str>,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            mime_type: mime_type.as_ref().to_ascii_lowercase(),
        }
    }

    pub fn from_proto(msg: &pb::NamedTrack) -> Self {
        Self::new(msg.track_id(), msg.stream_id(), msg.mime_type())
    }

    pub fn to_proto(&self) -> pb::NamedTrack {
        pb::NamedTrack {
            track_id: Some(self.track_id.clone()),
            stream_id: Some(self.stream_id.clone()),
            mime_type: Some(self.mime_type.clone()),
        }
    }
}
