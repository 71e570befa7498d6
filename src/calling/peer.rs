//! Peer connection seam: the media session object the negotiation state
//! machine drives. The state machine never touches the network; everything
//! it needs from the media layer goes through `PeerConnection`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::media::{MediaStream, MediaTrack};

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged in `offer`/`answer` signals
/// (`{"type": "offer", "sdp": "v=0..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// The session-level `a=ice-ufrag`, or the first media-level one.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.trim_end().strip_prefix("a=ice-ufrag:"))
    }
}

/// ICE candidate descriptor in its JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    /// `candidate:...` attribute value (no `a=` prefix).
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    /// ICE ufrag of the session that gathered the candidate.
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    pub fn with_ufrag(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// False only when both sides name a ufrag and they differ, i.e. the
    /// candidate was gathered for some other session.
    pub fn belongs_to(&self, remote_ufrag: Option<&str>) -> bool {
        match (self.username_fragment.as_deref(), remote_ufrag) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// Transport-level connectivity of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidateInit),
    ConnectionState(PeerConnectionState),
    /// The far end's media tracks are available.
    RemoteStream(MediaStream),
}

pub type PeerEventSink = mpsc::UnboundedSender<PeerEvent>;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no remote description has been applied")]
    NoRemoteDescription,
    #[error("no local description has been created")]
    NoLocalDescription,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("peer connection is closed")]
    Closed,
    #[error("peer connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single peer media session.
#[async_trait]
pub trait PeerConnection: Send {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), PeerError>;
    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&mut self, desc: SessionDescription)
        -> Result<(), PeerError>;
    /// Must only be called after a remote description is in place.
    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError>;
    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Creates peer connections that report their events to `events`.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_init_json_names() {
        let c = IceCandidateInit::new("candidate:1 1 UDP 1 10.0.0.1 1 typ host");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["sdpMid"], "0");
        assert_eq!(v["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_candidate_init_optional_fields() {
        let c: IceCandidateInit =
            serde_json::from_str(r#"{"candidate":"candidate:1 1 UDP 1 1.2.3.4 5 typ host"}"#)
                .unwrap();
        assert!(c.sdp_mid.is_none());
        assert!(c.sdp_m_line_index.is_none());
        assert!(c.username_fragment.is_none());
    }

    #[test]
    fn test_candidate_ufrag_matching() {
        let c = IceCandidateInit::new("candidate:1 1 udp 1 10.0.0.1 1 typ host").with_ufrag("ab12");
        assert_eq!(serde_json::to_value(&c).unwrap()["usernameFragment"], "ab12");
        assert!(c.belongs_to(Some("ab12")));
        assert!(!c.belongs_to(Some("cd34")));
        assert!(c.belongs_to(None));

        let untagged = IceCandidateInit::new("candidate:1 1 udp 1 10.0.0.1 1 typ host");
        assert!(serde_json::to_value(&untagged).unwrap().get("usernameFragment").is_none());
        assert!(untagged.belongs_to(Some("ab12")));
    }

    #[test]
    fn test_description_ufrag() {
        let desc = SessionDescription::offer("v=0\r\nm=audio 9 RTP/AVP 0\r\na=ice-ufrag:EsAw\r\n");
        assert_eq!(desc.ice_ufrag(), Some("EsAw"));
        assert_eq!(SessionDescription::answer("v=0\r\n").ice_ufrag(), None);
    }
}
