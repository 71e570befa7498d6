//! Call signaling: the addressed message format carried over a trip's
//! broadcast channel, plus the transports that move it.

pub mod hub;
pub mod relay;
pub mod transport;
pub mod websocket;

use serde::{Deserialize, Serialize};

use crate::calling::peer::{IceCandidateInit, SdpType, SessionDescription};

/// Prefix for the per-trip call channel. Both parties derive the same
/// channel from the trip id, so no separate rendezvous is needed.
pub const CHANNEL_PREFIX: &str = "webrtc-";

/// Channel scope key for a trip.
pub fn channel_name(trip_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, trip_id)
}

/// Errors decoding a signal from the wire.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("malformed signal JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} signal is missing its {field} payload")]
    MissingPayload {
        kind: SignalKind,
        field: &'static str,
    },
    #[error("{kind} signal carries a session description of type {found:?}")]
    DescriptionMismatch { kind: SignalKind, found: SdpType },
}

/// Signal type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    End,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::End => "end",
        })
    }
}

/// Typed signal payload. Each variant carries exactly what its kind needs,
/// so a decoded `Signal` can never pair an `offer` with a candidate body.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidateInit),
    End,
}

impl SignalBody {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalBody::Offer(_) => SignalKind::Offer,
            SignalBody::Answer(_) => SignalKind::Answer,
            SignalBody::Candidate(_) => SignalKind::Candidate,
            SignalBody::End => SignalKind::End,
        }
    }
}

/// An addressed signal. `to` is checked by the receiver; the channel itself
/// is shared by everyone attached to the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct Signal {
    pub from: String,
    pub to: String,
    /// Epoch milliseconds. Advisory only.
    pub timestamp: i64,
    pub body: SignalBody,
}

impl Signal {
    pub fn new(from: &str, to: &str, body: SignalBody) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.body.kind()
    }

    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        self.to == user_id
    }

    pub fn to_json(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// `data` object: `{ sdp }`, `{ candidate }` or `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidateInit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireSignal {
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    data: WireData,
    from: String,
    to: String,
    #[serde(default)]
    timestamp: i64,
}

impl TryFrom<WireSignal> for Signal {
    type Error = SignalError;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        let description = |expected: SdpType| match wire.data.sdp.clone() {
            Some(desc) if desc.kind == expected => Ok(desc),
            Some(desc) => Err(SignalError::DescriptionMismatch {
                kind,
                found: desc.kind,
            }),
            None => Err(SignalError::MissingPayload { kind, field: "sdp" }),
        };

        let body = match kind {
            SignalKind::Offer => SignalBody::Offer(description(SdpType::Offer)?),
            SignalKind::Answer => SignalBody::Answer(description(SdpType::Answer)?),
            SignalKind::Candidate => SignalBody::Candidate(
                wire.data
                    .candidate
                    .clone()
                    .ok_or(SignalError::MissingPayload {
                        kind,
                        field: "candidate",
                    })?,
            ),
            SignalKind::End => SignalBody::End,
        };

        Ok(Signal {
            from: wire.from,
            to: wire.to,
            timestamp: wire.timestamp,
            body,
        })
    }
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        let kind = signal.kind();
        let data = match signal.body {
            SignalBody::Offer(sdp) | SignalBody::Answer(sdp) => WireData {
                sdp: Some(sdp),
                candidate: None,
            },
            SignalBody::Candidate(candidate) => WireData {
                sdp: None,
                candidate: Some(candidate),
            },
            SignalBody::End => WireData::default(),
        };
        WireSignal {
            kind,
            data,
            from: signal.from,
            to: signal.to,
            timestamp: signal.timestamp,
        }
    }
}
