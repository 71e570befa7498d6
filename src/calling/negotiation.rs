//! Offer/answer negotiation for one trip's call session.
//!
//! The negotiator owns the peer connection while a call is active and never
//! touches the network: everything it wants done outside (signals to send,
//! notifications for the UI) is queued as an `Effect` for the controller to
//! drain with `take_effects`.
//!
//! Candidates are never applied before the remote description. Until then
//! they wait in the ringing buffer (listening) or the per-call queue (issuer
//! waiting for an answer), and are applied in arrival order once it is set.

use std::mem;

use crate::signaling::{Signal, SignalBody, SignalKind};

use super::media::MediaStream;
use super::peer::{
    IceCandidateInit, PeerConnection, PeerConnectionState, PeerError, PeerEvent,
    SessionDescription,
};
use super::{CallError, CallRole, EndReason, NegotiationState, ProtocolViolation};

/// Work for the controller, in the order it was produced.
#[derive(Debug, Clone)]
pub enum Effect {
    Send(Signal),
    IncomingCall { from: String },
    RemoteStream(MediaStream),
    StateChanged(NegotiationState),
    Ended(EndReason),
}

/// An offer waiting for the user to pick up, with the candidates that came
/// along with it.
#[derive(Debug, Default)]
struct Ringing {
    offer: Option<SessionDescription>,
    candidates: Vec<IceCandidateInit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    OfferSent,
    AnswerSent,
    AnswerReceived,
    Connected,
}

impl Stage {
    fn state(self) -> NegotiationState {
        match self {
            Stage::OfferSent => NegotiationState::OfferSent,
            Stage::AnswerSent => NegotiationState::AnswerSent,
            Stage::AnswerReceived => NegotiationState::AnswerReceived,
            Stage::Connected => NegotiationState::Connected,
        }
    }
}

struct ActiveCall {
    role: CallRole,
    pc: Box<dyn PeerConnection>,
    stage: Stage,
    queued: Vec<IceCandidateInit>,
    /// Ufrag of the applied remote description.
    remote_ufrag: Option<String>,
}

impl ActiveCall {
    /// Only an issuer still waiting for the answer lacks one.
    fn has_remote_description(&self) -> bool {
        !(self.role == CallRole::Issuer && self.stage == Stage::OfferSent)
    }
}

enum Phase {
    Idle,
    Listening(Ringing),
    Active(ActiveCall),
    Ended,
}

pub struct Negotiator {
    local: String,
    remote: String,
    phase: Phase,
    role: Option<CallRole>,
    effects: Vec<Effect>,
}

impl Negotiator {
    pub fn new(local_user: impl Into<String>, remote_user: impl Into<String>) -> Self {
        Self {
            local: local_user.into(),
            remote: remote_user.into(),
            phase: Phase::Idle,
            role: None,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        match &self.phase {
            Phase::Idle => NegotiationState::Idle,
            Phase::Listening(_) => NegotiationState::Listening,
            Phase::Active(call) => call.stage.state(),
            Phase::Ended => NegotiationState::Ended,
        }
    }

    /// Role of the current or most recent call.
    #[cfg(test)]
    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn has_pending_offer(&self) -> bool {
        matches!(&self.phase, Phase::Listening(r) if r.offer.is_some())
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        mem::take(&mut self.effects)
    }

    /// Arm for incoming calls. No-op while already listening or in a call.
    pub fn listen(&mut self) {
        if matches!(self.phase, Phase::Idle | Phase::Ended) {
            self.set_phase(Phase::Listening(Ringing::default()));
        }
    }

    /// Start a call as issuer on `pc`, which already carries the local
    /// tracks. `pc` is closed on failure.
    pub async fn initiate(&mut self, mut pc: Box<dyn PeerConnection>) -> Result<(), CallError> {
        let current = self.state();
        if current.is_in_call() {
            pc.close().await;
            return Err(CallError::CallInProgress(current));
        }
        if self.has_pending_offer() {
            tracing::warn!(
                "Placing a call while {} is ringing us, dropping their offer",
                self.remote
            );
        }

        let offer = match create_offer(pc.as_mut()).await {
            Ok(offer) => offer,
            Err(e) => {
                pc.close().await;
                return Err(e.into());
            }
        };

        self.role = Some(CallRole::Issuer);
        self.send(SignalBody::Offer(offer));
        self.set_phase(Phase::Active(ActiveCall {
            role: CallRole::Issuer,
            pc,
            stage: Stage::OfferSent,
            queued: Vec::new(),
            remote_ufrag: None,
        }));
        tracing::info!("Offer sent to {}", self.remote);
        Ok(())
    }

    /// Answer the ringing call on `pc`. The buffered offer is applied first,
    /// then its candidates in arrival order, then the answer is sent.
    pub async fn answer(&mut self, mut pc: Box<dyn PeerConnection>) -> Result<(), CallError> {
        let current = self.state();
        if current.is_in_call() {
            pc.close().await;
            return Err(CallError::CallInProgress(current));
        }
        let ringing = match &mut self.phase {
            Phase::Listening(r) if r.offer.is_some() => mem::take(r),
            _ => Ringing::default(),
        };
        let Some(offer) = ringing.offer else {
            pc.close().await;
            return Err(CallError::NoIncomingCall);
        };

        self.role = Some(CallRole::Receiver);
        let remote_ufrag = offer.ice_ufrag().map(str::to_string);
        if let Err(e) = self.accept_offer(pc.as_mut(), offer, ringing.candidates).await {
            tracing::warn!("Answering {} failed: {}", self.remote, e);
            pc.close().await;
            // The offer is spent; tell the caller to stop ringing.
            self.send(SignalBody::End);
            self.effects.push(Effect::StateChanged(NegotiationState::Listening));
            return Err(e.into());
        }

        self.set_phase(Phase::Active(ActiveCall {
            role: CallRole::Receiver,
            pc,
            stage: Stage::AnswerSent,
            queued: Vec::new(),
            remote_ufrag,
        }));
        tracing::info!("Answer sent to {}", self.remote);
        Ok(())
    }

    async fn accept_offer(
        &mut self,
        pc: &mut dyn PeerConnection,
        offer: SessionDescription,
        candidates: Vec<IceCandidateInit>,
    ) -> Result<(), PeerError> {
        let candidates = for_session(candidates, offer.ice_ufrag());
        pc.set_remote_description(offer).await?;
        self.effects
            .push(Effect::StateChanged(NegotiationState::OfferReceived));

        if !candidates.is_empty() {
            tracing::debug!("Replaying {} buffered candidates", candidates.len());
        }
        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered candidate rejected: {}", e);
            }
        }

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        self.send(SignalBody::Answer(answer));
        Ok(())
    }

    /// Refuse the ringing call. Listening continues.
    pub fn decline(&mut self) -> Result<(), CallError> {
        if !self.has_pending_offer() {
            return Err(CallError::NoIncomingCall);
        }
        self.phase = Phase::Listening(Ringing::default());
        self.send(SignalBody::End);
        self.effects.push(Effect::Ended(EndReason::Declined));
        tracing::info!("Declined call from {}", self.remote);
        Ok(())
    }

    /// Local hang-up. Safe from any state; only the first call in a call
    /// has any effect.
    pub async fn hang_up(&mut self) {
        if self.has_pending_offer() {
            let _ = self.decline();
            return;
        }
        self.teardown(EndReason::LocalHangup, true).await;
    }

    /// Drop everything and return to `Idle`.
    pub async fn reset(&mut self) {
        if self.has_pending_offer() {
            self.send(SignalBody::End);
        }
        self.teardown(EndReason::LocalHangup, true).await;
        self.role = None;
        self.set_phase(Phase::Idle);
    }

    pub async fn handle_signal(&mut self, signal: Signal) {
        if !signal.is_addressed_to(&self.local) {
            tracing::debug!(
                "Ignoring {} signal addressed to {}",
                signal.kind(),
                signal.to
            );
            return;
        }
        if signal.from != self.remote {
            violation(ProtocolViolation::UnknownSender {
                from: signal.from,
                expected: self.remote.clone(),
            });
            return;
        }

        let kind = signal.kind();
        tracing::debug!("Signal in: {} from {} in {}", kind, signal.from, self.state());

        match signal.body {
            SignalBody::Offer(offer) => self.on_offer(offer, signal.from),
            SignalBody::Answer(answer) => self.on_answer(answer, signal.from).await,
            SignalBody::Candidate(candidate) => self.on_candidate(candidate).await,
            SignalBody::End => self.on_end().await,
        }
    }

    fn on_offer(&mut self, offer: SessionDescription, from: String) {
        let kind = SignalKind::Offer;
        let state = self.state();
        match &mut self.phase {
            Phase::Listening(ringing) if ringing.offer.is_some() => {
                violation(ProtocolViolation::DuplicateOffer { from });
            }
            Phase::Listening(ringing) => {
                ringing.offer = Some(offer);
                tracing::info!("Incoming call from {}", from);
                self.effects.push(Effect::IncomingCall { from });
            }
            Phase::Active(call) if call.role == CallRole::Issuer => {
                violation(ProtocolViolation::WrongRole {
                    kind,
                    from,
                    role: CallRole::Issuer,
                });
            }
            Phase::Active(_) => violation(ProtocolViolation::DuplicateOffer { from }),
            Phase::Idle | Phase::Ended => {
                violation(ProtocolViolation::UnexpectedState { kind, from, state });
            }
        }
    }

    async fn on_answer(&mut self, answer: SessionDescription, from: String) {
        let kind = SignalKind::Answer;
        let state = self.state();
        let call = match &mut self.phase {
            Phase::Active(call) if call.role == CallRole::Receiver => {
                violation(ProtocolViolation::WrongRole {
                    kind,
                    from,
                    role: CallRole::Receiver,
                });
                return;
            }
            Phase::Active(call) if call.stage == Stage::OfferSent => call,
            _ => {
                violation(ProtocolViolation::UnexpectedState { kind, from, state });
                return;
            }
        };

        let remote_ufrag = answer.ice_ufrag().map(str::to_string);
        if let Err(e) = call.pc.set_remote_description(answer).await {
            tracing::warn!("Answer from {} could not be applied: {}", from, e);
            self.teardown(EndReason::ConnectionFailed, true).await;
            return;
        }
        call.stage = Stage::AnswerReceived;
        call.remote_ufrag = remote_ufrag;
        self.effects
            .push(Effect::StateChanged(NegotiationState::AnswerReceived));

        let queued = for_session(mem::take(&mut call.queued), call.remote_ufrag.as_deref());
        if !queued.is_empty() {
            tracing::debug!("Flushing {} queued candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = call.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Queued candidate rejected: {}", e);
            }
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidateInit) {
        match &mut self.phase {
            Phase::Listening(ringing) => {
                tracing::debug!(
                    "Buffering candidate while ringing ({} so far)",
                    ringing.candidates.len() + 1
                );
                ringing.candidates.push(candidate);
            }
            Phase::Active(call) if !call.has_remote_description() => {
                call.queued.push(candidate);
                tracing::debug!("Queued candidate ({} waiting)", call.queued.len());
            }
            Phase::Active(call) if !candidate.belongs_to(call.remote_ufrag.as_deref()) => {
                tracing::debug!("Dropping candidate from an earlier session");
            }
            Phase::Active(call) => {
                if let Err(e) = call.pc.add_ice_candidate(candidate).await {
                    tracing::warn!("Remote candidate rejected: {}", e);
                }
            }
            Phase::Idle | Phase::Ended => {
                tracing::debug!("Dropping candidate outside a call");
            }
        }
    }

    async fn on_end(&mut self) {
        match &mut self.phase {
            Phase::Active(_) => {
                tracing::info!("{} hung up", self.remote);
                self.teardown(EndReason::RemoteHangup, false).await;
            }
            Phase::Listening(ringing) if ringing.offer.is_some() => {
                *ringing = Ringing::default();
                tracing::info!("{} cancelled the call before it was answered", self.remote);
                self.effects.push(Effect::Ended(EndReason::Cancelled));
            }
            Phase::Listening(ringing) => ringing.candidates.clear(),
            Phase::Idle | Phase::Ended => tracing::debug!("Ignoring end outside a call"),
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Phase::Active(call) = &mut self.phase else {
            tracing::debug!("Dropping peer event outside a call: {:?}", event);
            return;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => self.send(SignalBody::Candidate(candidate)),
            PeerEvent::RemoteStream(stream) => {
                tracing::info!("Remote stream with {} tracks", stream.tracks().len());
                self.effects.push(Effect::RemoteStream(stream));
            }
            PeerEvent::ConnectionState(PeerConnectionState::Connected) => {
                if call.stage != Stage::Connected {
                    call.stage = Stage::Connected;
                    tracing::info!("Call with {} connected", self.remote);
                    self.effects
                        .push(Effect::StateChanged(NegotiationState::Connected));
                }
            }
            PeerEvent::ConnectionState(PeerConnectionState::Disconnected) => {
                tracing::info!("Connection to {} interrupted, waiting for recovery", self.remote);
            }
            PeerEvent::ConnectionState(PeerConnectionState::Failed) => {
                tracing::warn!("Connection to {} failed, ending call", self.remote);
                self.teardown(EndReason::ConnectionFailed, true).await;
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Peer connection state {:?}", state);
            }
        }
    }

    async fn teardown(&mut self, reason: EndReason, notify_remote: bool) {
        let Phase::Active(mut call) = mem::replace(&mut self.phase, Phase::Ended) else {
            return;
        };
        if notify_remote {
            self.send(SignalBody::End);
        }
        call.pc.close().await;
        self.effects
            .push(Effect::StateChanged(NegotiationState::Ended));
        self.effects.push(Effect::Ended(reason));
        tracing::info!(
            "Call with {} ended ({:?}, local side was {:?})",
            self.remote,
            reason,
            self.role
        );
    }

    fn set_phase(&mut self, phase: Phase) {
        let before = self.state();
        self.phase = phase;
        let after = self.state();
        if before != after {
            self.effects.push(Effect::StateChanged(after));
        }
    }

    fn send(&mut self, body: SignalBody) {
        let signal = Signal::new(&self.local, &self.remote, body);
        self.effects.push(Effect::Send(signal));
    }
}

/// Candidates gathered for the session with `ufrag`, in arrival order.
/// Leftovers trickled by an earlier call are dropped.
fn for_session(candidates: Vec<IceCandidateInit>, ufrag: Option<&str>) -> Vec<IceCandidateInit> {
    let total = candidates.len();
    let kept: Vec<_> = candidates
        .into_iter()
        .filter(|c| c.belongs_to(ufrag))
        .collect();
    if kept.len() < total {
        tracing::debug!("Dropped {} candidates from an earlier session", total - kept.len());
    }
    kept
}

fn violation(violation: ProtocolViolation) {
    tracing::warn!("Dropping signal: {}", violation);
}

async fn create_offer(pc: &mut dyn PeerConnection) -> Result<SessionDescription, PeerError> {
    let offer = pc.create_offer().await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(offer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::peer::{PeerFactory, SdpType};
    use crate::calling::testing::{MockPeerFactory, MockPeerHandle, PeerOp};
    use tokio::sync::mpsc;

    const RIDER: &str = "rider-1";
    const DRIVER: &str = "driver-1";

    async fn mock_pc(
        factory: &MockPeerFactory,
    ) -> (
        Box<dyn PeerConnection>,
        MockPeerHandle,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = factory.create(tx).await.unwrap();
        (pc, factory.last(), rx)
    }

    fn from_driver(body: SignalBody) -> Signal {
        Signal::new(DRIVER, RIDER, body)
    }

    fn candidate(n: u8) -> IceCandidateInit {
        IceCandidateInit::new(format!("candidate:{} 1 udp 1 10.1.0.{} 4000 typ host", n, n))
    }

    fn sent(effects: &[Effect]) -> Vec<SignalKind> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(s) => Some(s.kind()),
                _ => None,
            })
            .collect()
    }

    fn ended(effects: &[Effect]) -> Vec<EndReason> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Ended(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    async fn issuer() -> (Negotiator, MockPeerHandle) {
        let factory = MockPeerFactory::manual();
        let (pc, handle, _rx) = mock_pc(&factory).await;
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.initiate(pc).await.unwrap();
        (n, handle)
    }

    #[tokio::test]
    async fn test_initiate_sends_offer() {
        let (mut n, handle) = issuer().await;
        assert_eq!(n.state(), NegotiationState::OfferSent);
        assert_eq!(n.role(), Some(CallRole::Issuer));
        assert_eq!(handle.ops(), vec![PeerOp::CreateOffer, PeerOp::SetLocal(SdpType::Offer)]);

        let effects = n.take_effects();
        assert_eq!(sent(&effects), vec![SignalKind::Offer]);
        match &effects[0] {
            Effect::Send(signal) => {
                assert_eq!(signal.from, RIDER);
                assert_eq!(signal.to, DRIVER);
            }
            other => panic!("unexpected effect {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_queued_then_flushed_in_order() {
        let (mut n, handle) = issuer().await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(1)))).await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(2)))).await;
        assert!(handle.applied_candidates().is_empty());

        n.handle_signal(from_driver(SignalBody::Answer(SessionDescription::answer("v=0"))))
            .await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(3)))).await;

        assert_eq!(n.state(), NegotiationState::AnswerReceived);
        assert_eq!(handle.early_candidates(), 0);
        let ops = handle.ops();
        let remote_at = ops
            .iter()
            .position(|op| *op == PeerOp::SetRemote(SdpType::Answer))
            .unwrap();
        assert_eq!(
            ops[remote_at + 1..].to_vec(),
            vec![
                PeerOp::AddCandidate(candidate(1).candidate),
                PeerOp::AddCandidate(candidate(2).candidate),
                PeerOp::AddCandidate(candidate(3).candidate),
            ]
        );
    }

    #[tokio::test]
    async fn test_ringing_offer_is_replayed_on_answer() {
        let factory = MockPeerFactory::manual();
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();

        n.handle_signal(from_driver(SignalBody::Candidate(candidate(7)))).await;
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(1)))).await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(2)))).await;

        assert_eq!(n.state(), NegotiationState::Listening);
        assert!(n.has_pending_offer());
        let ringing = n.take_effects();
        let incoming = ringing
            .iter()
            .filter(|e| matches!(e, Effect::IncomingCall { .. }))
            .count();
        assert_eq!(incoming, 1);
        assert!(sent(&ringing).is_empty());

        let (pc, handle, _rx) = mock_pc(&factory).await;
        n.answer(pc).await.unwrap();

        assert_eq!(n.state(), NegotiationState::AnswerSent);
        assert_eq!(n.role(), Some(CallRole::Receiver));
        assert!(!n.has_pending_offer());
        assert_eq!(
            handle.ops(),
            vec![
                PeerOp::SetRemote(SdpType::Offer),
                PeerOp::AddCandidate(candidate(7).candidate),
                PeerOp::AddCandidate(candidate(1).candidate),
                PeerOp::AddCandidate(candidate(2).candidate),
                PeerOp::CreateAnswer,
                PeerOp::SetLocal(SdpType::Answer),
            ]
        );
        assert_eq!(sent(&n.take_effects()), vec![SignalKind::Answer]);
    }

    fn tagged(n: u8, ufrag: &str) -> IceCandidateInit {
        candidate(n).with_ufrag(ufrag)
    }

    #[tokio::test]
    async fn test_leftover_candidates_from_previous_call_are_dropped() {
        let factory = MockPeerFactory::manual();
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer(
            "v=0\r\na=ice-ufrag:first\r\n",
        ))))
        .await;
        let (pc, _first, _rx) = mock_pc(&factory).await;
        n.answer(pc).await.unwrap();
        n.hang_up().await;
        n.listen();
        n.take_effects();

        // Still trickling for the call we just hung up.
        n.handle_signal(from_driver(SignalBody::Candidate(tagged(1, "first")))).await;
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer(
            "v=0\r\na=ice-ufrag:second\r\n",
        ))))
        .await;
        n.handle_signal(from_driver(SignalBody::Candidate(tagged(2, "second")))).await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(3)))).await;

        let (pc, handle, _rx) = mock_pc(&factory).await;
        n.answer(pc).await.unwrap();
        n.handle_signal(from_driver(SignalBody::Candidate(tagged(4, "first")))).await;
        n.handle_signal(from_driver(SignalBody::Candidate(tagged(5, "second")))).await;

        assert_eq!(
            handle.applied_candidates(),
            vec![
                tagged(2, "second").candidate,
                candidate(3).candidate,
                tagged(5, "second").candidate,
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_offer_rings_once() {
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        for _ in 0..3 {
            n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
                .await;
        }
        let incoming = n
            .take_effects()
            .iter()
            .filter(|e| matches!(e, Effect::IncomingCall { .. }))
            .count();
        assert_eq!(incoming, 1);
    }

    #[tokio::test]
    async fn test_answer_without_offer() {
        let factory = MockPeerFactory::manual();
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        let (pc, handle, _rx) = mock_pc(&factory).await;
        assert!(matches!(n.answer(pc).await, Err(CallError::NoIncomingCall)));
        assert!(handle.is_closed());
        assert_eq!(n.state(), NegotiationState::Listening);
    }

    #[tokio::test]
    async fn test_failed_answer_returns_to_listening() {
        let factory = MockPeerFactory::failing_answer();
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        n.take_effects();

        let (pc, handle, _rx) = mock_pc(&factory).await;
        assert!(matches!(n.answer(pc).await, Err(CallError::Negotiation(_))));
        assert!(handle.is_closed());
        assert_eq!(n.state(), NegotiationState::Listening);
        assert!(!n.has_pending_offer());
        assert_eq!(sent(&n.take_effects()), vec![SignalKind::End]);
    }

    #[tokio::test]
    async fn test_end_twice_tears_down_once() {
        let (mut n, handle) = issuer().await;
        n.take_effects();
        n.handle_signal(from_driver(SignalBody::End)).await;
        n.handle_signal(from_driver(SignalBody::End)).await;
        n.hang_up().await;

        assert_eq!(n.state(), NegotiationState::Ended);
        assert_eq!(handle.count(&PeerOp::Close), 1);
        let effects = n.take_effects();
        assert_eq!(ended(&effects), vec![EndReason::RemoteHangup]);
        assert!(sent(&effects).is_empty());
    }

    #[tokio::test]
    async fn test_local_hang_up_sends_end_once() {
        let (mut n, handle) = issuer().await;
        n.take_effects();
        n.hang_up().await;
        n.hang_up().await;

        assert_eq!(handle.count(&PeerOp::Close), 1);
        let effects = n.take_effects();
        assert_eq!(sent(&effects), vec![SignalKind::End]);
        assert_eq!(ended(&effects), vec![EndReason::LocalHangup]);
    }

    #[tokio::test]
    async fn test_issuer_drops_offers() {
        let (mut n, handle) = issuer().await;
        n.take_effects();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        assert_eq!(n.state(), NegotiationState::OfferSent);
        assert!(!handle.ops().contains(&PeerOp::SetRemote(SdpType::Offer)));
        assert!(n.take_effects().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_drops_answers_and_never_offers() {
        let factory = MockPeerFactory::manual();
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        let (pc, handle, _rx) = mock_pc(&factory).await;
        n.answer(pc).await.unwrap();
        n.take_effects();

        n.handle_signal(from_driver(SignalBody::Answer(SessionDescription::answer("v=0"))))
            .await;
        assert_eq!(n.state(), NegotiationState::AnswerSent);
        assert_eq!(handle.count(&PeerOp::SetRemote(SdpType::Answer)), 0);
        assert_eq!(handle.count(&PeerOp::CreateOffer), 0);
    }

    #[tokio::test]
    async fn test_foreign_signals_are_ignored() {
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        n.take_effects();

        // Addressed to someone else.
        n.handle_signal(Signal::new(
            DRIVER,
            "rider-2",
            SignalBody::Offer(SessionDescription::offer("v=0")),
        ))
        .await;
        // Right address, wrong sender.
        n.handle_signal(Signal::new(
            "stranger",
            RIDER,
            SignalBody::Offer(SessionDescription::offer("v=0")),
        ))
        .await;

        assert!(!n.has_pending_offer());
        assert!(n.take_effects().is_empty());
    }

    #[tokio::test]
    async fn test_caller_cancels_while_ringing() {
        let mut n = Negotiator::new(RIDER, DRIVER);
        n.listen();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        n.handle_signal(from_driver(SignalBody::Candidate(candidate(1)))).await;
        n.take_effects();

        n.handle_signal(from_driver(SignalBody::End)).await;
        assert_eq!(n.state(), NegotiationState::Listening);
        assert!(!n.has_pending_offer());
        assert_eq!(ended(&n.take_effects()), vec![EndReason::Cancelled]);
    }

    #[tokio::test]
    async fn test_decline_keeps_listening() {
        let mut n = Negotiator::new(RIDER, DRIVER);
        assert!(matches!(n.decline(), Err(CallError::NoIncomingCall)));

        n.listen();
        n.handle_signal(from_driver(SignalBody::Offer(SessionDescription::offer("v=0"))))
            .await;
        n.take_effects();

        n.decline().unwrap();
        assert_eq!(n.state(), NegotiationState::Listening);
        assert!(!n.has_pending_offer());
        let effects = n.take_effects();
        assert_eq!(sent(&effects), vec![SignalKind::End]);
        assert_eq!(ended(&effects), vec![EndReason::Declined]);
    }

    #[tokio::test]
    async fn test_peer_events_drive_connection_state() {
        let (mut n, handle) = issuer().await;
        n.handle_signal(from_driver(SignalBody::Answer(SessionDescription::answer("v=0"))))
            .await;
        n.take_effects();

        n.handle_peer_event(PeerEvent::LocalCandidate(candidate(9))).await;
        assert_eq!(sent(&n.take_effects()), vec![SignalKind::Candidate]);

        n.handle_peer_event(PeerEvent::ConnectionState(PeerConnectionState::Connected))
            .await;
        assert_eq!(n.state(), NegotiationState::Connected);

        n.handle_peer_event(PeerEvent::ConnectionState(PeerConnectionState::Disconnected))
            .await;
        assert_eq!(n.state(), NegotiationState::Connected);
        assert!(!handle.is_closed());

        n.take_effects();
        n.handle_peer_event(PeerEvent::ConnectionState(PeerConnectionState::Failed))
            .await;
        assert_eq!(n.state(), NegotiationState::Ended);
        assert!(handle.is_closed());
        let effects = n.take_effects();
        assert_eq!(sent(&effects), vec![SignalKind::End]);
        assert_eq!(ended(&effects), vec![EndReason::ConnectionFailed]);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let (mut n, handle) = issuer().await;
        n.reset().await;
        assert_eq!(n.state(), NegotiationState::Idle);
        assert_eq!(n.role(), None);
        assert!(handle.is_closed());

        // A fresh listen after reset starts with an empty buffer.
        n.listen();
        assert_eq!(n.state(), NegotiationState::Listening);
        assert!(!n.has_pending_offer());
    }

    #[tokio::test]
    async fn test_listen_rearms_after_end() {
        let (mut n, _handle) = issuer().await;
        n.handle_signal(from_driver(SignalBody::End)).await;
        assert_eq!(n.state(), NegotiationState::Ended);
        n.listen();
        assert_eq!(n.state(), NegotiationState::Listening);
    }
}
