//! In-trip calls between rider and driver.
//!
//! `controller` is the entry point. `negotiation` is the offer/answer state
//! machine; it talks to media only through the `peer` seam, which `engine`
//! implements over UDP.

pub mod controller;
pub mod engine;
pub mod events;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod runner;
pub mod sdp;
pub mod stun;
#[cfg(test)]
pub mod testing;

use std::fmt;

use crate::signaling::transport::TransportError;
use crate::signaling::SignalKind;
use media::MediaAccessError;
use peer::PeerError;

/// Which side of the call this session is on. Fixed when the call starts,
/// not when listening starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Issuer,
    Receiver,
}

impl fmt::Display for CallRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallRole::Issuer => "issuer",
            CallRole::Receiver => "receiver",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Listening,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Ended,
}

impl NegotiationState {
    pub fn is_in_call(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent
                | NegotiationState::OfferReceived
                | NegotiationState::AnswerSent
                | NegotiationState::AnswerReceived
                | NegotiationState::Connected
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NegotiationState::Idle => "IDLE",
            NegotiationState::Listening => "LISTENING",
            NegotiationState::OfferSent => "OFFER_SENT",
            NegotiationState::OfferReceived => "OFFER_RECEIVED",
            NegotiationState::AnswerSent => "ANSWER_SENT",
            NegotiationState::AnswerReceived => "ANSWER_RECEIVED",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Ended => "ENDED",
        })
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    ConnectionFailed,
    /// We refused a ringing call.
    Declined,
    /// The caller gave up while we were ringing.
    Cancelled,
}

/// Errors surfaced to callers of the controller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error("call service unavailable, try again ({0})")]
    ChannelSetup(#[from] TransportError),
    #[error("call setup failed: {0}")]
    Negotiation(#[from] PeerError),
    #[error("there is no incoming call to answer")]
    NoIncomingCall,
    #[error("a call is already in progress ({0})")]
    CallInProgress(NegotiationState),
    #[error("trip has no counterpart to call yet")]
    NoCounterpart,
    #[error("call session has been destroyed")]
    Destroyed,
}

/// A signal that does not fit the current state or role. Logged and
/// dropped, never returned.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProtocolViolation {
    #[error("{kind} signal from {from} not valid for {role} role")]
    WrongRole {
        kind: SignalKind,
        from: String,
        role: CallRole,
    },
    #[error("{kind} signal from {from} unexpected in state {state}")]
    UnexpectedState {
        kind: SignalKind,
        from: String,
        state: NegotiationState,
    },
    #[error("duplicate offer from {from} while one is already pending")]
    DuplicateOffer { from: String },
    #[error("signal from {from}, expected counterpart {expected}")]
    UnknownSender { from: String, expected: String },
}
