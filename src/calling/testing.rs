//! Recording peer connections for negotiation and controller tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::media::{MediaStream, MediaTrack, TrackKind};
use super::peer::{
    IceCandidateInit, PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, SdpType, SessionDescription,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct PeerLog {
    ops: Vec<PeerOp>,
    has_local: bool,
    has_remote: bool,
    closed: bool,
    /// Candidates handed over before any remote description.
    early_candidates: usize,
}

/// Handle for inspecting (and poking) one mock connection from a test.
#[derive(Clone)]
pub struct MockPeerHandle {
    log: Arc<Mutex<PeerLog>>,
    events: PeerEventSink,
}

impl MockPeerHandle {
    pub fn ops(&self) -> Vec<PeerOp> {
        self.log.lock().ops.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.log
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &PeerOp) -> usize {
        self.log.lock().ops.iter().filter(|op| *op == wanted).count()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }

    pub fn early_candidates(&self) -> usize {
        self.log.lock().early_candidates
    }

    /// Inject a peer event as if the connection raised it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

struct MockPeer {
    id: usize,
    log: Arc<Mutex<PeerLog>>,
    events: PeerEventSink,
    auto_connect: bool,
    fail_answer: bool,
}

impl MockPeer {
    fn ufrag(&self) -> String {
        format!("mock{}", self.id)
    }

    fn record(&self, op: PeerOp) -> Result<(), PeerError> {
        let mut log = self.log.lock();
        if log.closed {
            return Err(PeerError::Closed);
        }
        log.ops.push(op);
        Ok(())
    }

    fn maybe_connect(&self) {
        let ready = {
            let log = self.log.lock();
            log.has_local && log.has_remote
        };
        if ready && self.auto_connect {
            let _ = self
                .events
                .send(PeerEvent::ConnectionState(PeerConnectionState::Connected));
            let remote = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "remote-audio")]);
            let _ = self.events.send(PeerEvent::RemoteStream(remote));
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), PeerError> {
        self.record(PeerOp::AddTrack(track.kind()))
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.record(PeerOp::CreateOffer)?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock-{} offer\r\na=ice-ufrag:{}\r\n",
            self.id,
            self.ufrag()
        )))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        self.record(PeerOp::CreateAnswer)?;
        if self.fail_answer {
            return Err(PeerError::InvalidDescription("mock refuses to answer".into()));
        }
        if !self.log.lock().has_remote {
            return Err(PeerError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock-{} answer\r\na=ice-ufrag:{}\r\n",
            self.id,
            self.ufrag()
        )))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerOp::SetLocal(desc.kind))?;
        self.log.lock().has_local = true;
        let candidate = format!(
            "candidate:{} 1 udp 2130706431 10.0.0.{} 5000 typ host",
            self.id,
            self.id + 1
        );
        let _ = self
            .events
            .send(PeerEvent::LocalCandidate(
                IceCandidateInit::new(candidate).with_ufrag(self.ufrag()),
            ));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.record(PeerOp::SetRemote(desc.kind))?;
        self.log.lock().has_remote = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.record(PeerOp::AddCandidate(candidate.candidate))?;
        let mut log = self.log.lock();
        if !log.has_remote {
            log.early_candidates += 1;
            return Err(PeerError::NoRemoteDescription);
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut log = self.log.lock();
        if !log.closed {
            log.ops.push(PeerOp::Close);
            log.closed = true;
        }
    }
}

/// Creates `MockPeer`s and keeps a handle to each.
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    peers: Arc<Mutex<Vec<MockPeerHandle>>>,
    created: Arc<AtomicUsize>,
    manual: bool,
    fail_answer: bool,
}

impl MockPeerFactory {
    /// Connections report `Connected` and a remote stream as soon as both
    /// descriptions are set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections never change state on their own.
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    /// `create_answer` always fails.
    pub fn failing_answer() -> Self {
        Self {
            fail_answer: true,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn peer(&self, index: usize) -> MockPeerHandle {
        self.peers.lock()[index].clone()
    }

    pub fn last(&self) -> MockPeerHandle {
        let peers = self.peers.lock();
        peers[peers.len() - 1].clone()
    }

    /// Connections created and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.peers.lock().iter().filter(|p| !p.is_closed()).count()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerConnection>, PeerError> {
        let id = self.created.fetch_add(1, Ordering::AcqRel);
        let log = Arc::new(Mutex::new(PeerLog::default()));
        self.peers.lock().push(MockPeerHandle {
            log: log.clone(),
            events: events.clone(),
        });
        Ok(Box::new(MockPeer {
            id,
            log,
            events,
            auto_connect: !self.manual,
            fail_answer: self.fail_answer,
        }))
    }
}
