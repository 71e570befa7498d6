//! UDP peer connection over a real socket, with trickle ICE and consent checks.
//!
//! Carries no media payload; the remote stream it reports stands for the
//! peer's offered tracks once connectivity is established.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::ice::{self, Checker, IceAgent, IceCandidate, IceCredentials, Protocol};
use super::media::{MediaStream, MediaTrack, TrackKind};
use super::peer::{
    IceCandidateInit, PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    PeerFactory, SdpType, SessionDescription,
};
use super::sdp::{self, ParsedSdp};

/// Consecutive failed consent checks before reporting `Disconnected`.
const CONSENT_MISSES: u32 = 3;

/// Time without a successful consent check before giving up (RFC 7675).
const CONSENT_EXPIRY: Duration = Duration::from_secs(30);

/// Pause between check rounds while no new candidate has arrived.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct UdpPeerFactory {
    pub bind_ip: IpAddr,
    pub check_timeout: Duration,
    pub consent_interval: Duration,
}

impl UdpPeerFactory {
    pub fn new(bind_ip: IpAddr, check_timeout: Duration, consent_interval: Duration) -> Self {
        Self {
            bind_ip,
            check_timeout,
            consent_interval,
        }
    }
}

#[async_trait]
impl PeerFactory for UdpPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Box<dyn PeerConnection>, PeerError> {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?);
        tracing::debug!("Peer connection bound to {}", socket.local_addr()?);
        Ok(Box::new(UdpPeerConnection::new(socket, events, self)))
    }
}

pub struct UdpPeerConnection {
    socket: Arc<UdpSocket>,
    agent: IceAgent,
    events: PeerEventSink,
    check_timeout: Duration,
    consent_interval: Duration,
    local_kinds: Vec<TrackKind>,
    local: Option<SessionDescription>,
    remote: Option<ParsedSdp>,
    remote_stream: Option<MediaStream>,
    targets: Arc<Mutex<Vec<SocketAddr>>>,
    new_target: Arc<Notify>,
    connectivity: Option<JoinHandle<()>>,
    candidates_sent: bool,
    closed: bool,
}

impl UdpPeerConnection {
    fn new(socket: Arc<UdpSocket>, events: PeerEventSink, factory: &UdpPeerFactory) -> Self {
        let agent = IceAgent::start(socket.clone(), IceCredentials::generate());
        Self {
            socket,
            agent,
            events,
            check_timeout: factory.check_timeout,
            consent_interval: factory.consent_interval,
            local_kinds: Vec::new(),
            local: None,
            remote: None,
            remote_stream: None,
            targets: Arc::default(),
            new_target: Arc::new(Notify::new()),
            connectivity: None,
            candidates_sent: false,
            closed: false,
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn add_target(&self, addr: SocketAddr) {
        let mut targets = self.targets.lock();
        if !targets.contains(&addr) {
            tracing::debug!("Remote candidate {}", addr);
            targets.push(addr);
            self.new_target.notify_one();
        }
    }

    fn trickle_host_candidates(&mut self) -> Result<(), PeerError> {
        if self.candidates_sent {
            return Ok(());
        }
        self.candidates_sent = true;
        let ufrag = self.agent.local_credentials().ufrag.clone();
        for candidate in ice::gather_host_candidates(self.socket.local_addr()?) {
            tracing::debug!("Local candidate {}", candidate);
            self.emit(PeerEvent::LocalCandidate(
                IceCandidateInit::new(candidate.to_string()).with_ufrag(ufrag.as_str()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for UdpPeerConnection {
    async fn add_track(&mut self, track: &MediaTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.local_kinds.contains(&track.kind()) {
            self.local_kinds.push(track.kind());
        }
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let sdp = sdp::build_offer(&self.local_kinds, self.agent.local_credentials());
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let remote = self.remote.as_ref().ok_or(PeerError::NoRemoteDescription)?;
        let sdp = sdp::build_answer(remote, &self.local_kinds, self.agent.local_credentials());
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if desc.kind == SdpType::Answer && self.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.local = Some(desc);
        self.trickle_host_candidates()
    }

    async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.remote.is_some() {
            return Err(PeerError::InvalidDescription(
                "remote description already applied".into(),
            ));
        }
        if desc.kind == SdpType::Answer && self.local.is_none() {
            return Err(PeerError::NoLocalDescription);
        }
        let parsed = sdp::parse(&desc.sdp).map_err(PeerError::InvalidDescription)?;

        // The offerer is the controlling agent.
        let controlling = desc.kind == SdpType::Answer;
        self.agent.set_remote(parsed.credentials.clone(), controlling);
        for candidate in parsed.candidates.iter().filter(|c| c.protocol == Protocol::Udp) {
            self.add_target(candidate.socket_addr());
        }

        let tracks: Vec<MediaTrack> = parsed
            .sections
            .iter()
            .filter(|s| s.direction.sends())
            .map(|s| MediaTrack::new(s.kind, format!("remote-{}-{}", s.kind, s.mid)))
            .collect();
        let remote_stream = MediaStream::new(tracks);
        self.remote_stream = Some(remote_stream.clone());
        self.remote = Some(parsed);

        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        self.connectivity = Some(tokio::spawn(run_connectivity(
            self.agent.checker(),
            self.targets.clone(),
            self.new_target.clone(),
            self.events.clone(),
            remote_stream,
            self.check_timeout,
            self.consent_interval,
        )));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        let parsed =
            IceCandidate::parse(&candidate.candidate).map_err(PeerError::InvalidCandidate)?;
        if parsed.protocol != Protocol::Udp {
            tracing::debug!("Ignoring non-UDP candidate {}", parsed);
            return Ok(());
        }
        self.add_target(parsed.socket_addr());
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.connectivity.take() {
            task.abort();
        }
        if let Some(stream) = self.remote_stream.take() {
            stream.stop();
        }
        self.emit(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        tracing::debug!("Peer connection closed");
    }
}

impl Drop for UdpPeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.connectivity.take() {
            task.abort();
        }
    }
}

async fn run_connectivity(
    checker: Checker,
    targets: Arc<Mutex<Vec<SocketAddr>>>,
    new_target: Arc<Notify>,
    events: PeerEventSink,
    remote_stream: MediaStream,
    check_timeout: Duration,
    consent_interval: Duration,
) {
    let emit = |state| {
        let _ = events.send(PeerEvent::ConnectionState(state));
    };

    let deadline = Instant::now() + check_timeout;
    let selected = 'search: loop {
        let round: Vec<SocketAddr> = targets.lock().clone();
        for target in round {
            if Instant::now() >= deadline {
                break 'search None;
            }
            match checker.check(target).await {
                Ok(mapped) => {
                    tracing::info!("ICE connected via {} (seen as {})", target, mapped);
                    break 'search Some(target);
                }
                Err(e) => tracing::debug!("ICE check failed: {}", e),
            }
        }
        tokio::select! {
            _ = new_target.notified() => {}
            _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
            _ = tokio::time::sleep_until(deadline) => break None,
        }
    };

    let Some(selected) = selected else {
        tracing::warn!("ICE failed: no candidate pair succeeded within {:?}", check_timeout);
        emit(PeerConnectionState::Failed);
        return;
    };

    emit(PeerConnectionState::Connected);
    if !remote_stream.is_empty() {
        let _ = events.send(PeerEvent::RemoteStream(remote_stream));
    }

    let mut ticker = tokio::time::interval(consent_interval);
    ticker.tick().await;
    let mut misses = 0u32;
    let mut last_ok = Instant::now();
    loop {
        ticker.tick().await;
        match checker.check(selected).await {
            Ok(_) => {
                if misses >= CONSENT_MISSES {
                    tracing::info!("Consent to {} recovered", selected);
                    emit(PeerConnectionState::Connected);
                }
                misses = 0;
                last_ok = Instant::now();
            }
            Err(e) => {
                misses += 1;
                tracing::debug!("Consent check {} to {} failed: {}", misses, selected, e);
                if last_ok.elapsed() >= CONSENT_EXPIRY {
                    tracing::warn!("Consent to {} expired", selected);
                    emit(PeerConnectionState::Failed);
                    return;
                }
                if misses == CONSENT_MISSES {
                    emit(PeerConnectionState::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn factory(check_timeout: Duration) -> UdpPeerFactory {
        UdpPeerFactory::new(
            IpAddr::from([127, 0, 0, 1]),
            check_timeout,
            Duration::from_secs(5),
        )
    }

    async fn next_matching<T>(
        rx: &mut mpsc::UnboundedReceiver<PeerEvent>,
        mut pick: impl FnMut(PeerEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for peer event")
    }

    async fn next_candidate(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> IceCandidateInit {
        next_matching(rx, |e| match e {
            PeerEvent::LocalCandidate(c) => Some(c),
            _ => None,
        })
        .await
    }

    async fn wait_state(rx: &mut mpsc::UnboundedReceiver<PeerEvent>, want: PeerConnectionState) {
        next_matching(rx, |e| match e {
            PeerEvent::ConnectionState(s) if s == want => Some(()),
            _ => None,
        })
        .await
    }

    #[tokio::test]
    async fn test_two_engines_connect() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut a = factory(Duration::from_secs(5)).create(a_tx).await.unwrap();
        let mut b = factory(Duration::from_secs(5)).create(b_tx).await.unwrap();

        a.add_track(&MediaTrack::new(TrackKind::Audio, "mic")).await.unwrap();
        a.add_track(&MediaTrack::new(TrackKind::Video, "cam")).await.unwrap();
        b.add_track(&MediaTrack::new(TrackKind::Audio, "mic")).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let offer_ufrag = offer.ice_ufrag().map(str::to_string);
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let a_cand = next_candidate(&mut a_rx).await;
        let b_cand = next_candidate(&mut b_rx).await;
        assert!(offer_ufrag.is_some());
        assert_eq!(a_cand.username_fragment, offer_ufrag);
        b.add_ice_candidate(a_cand).await.unwrap();
        a.add_ice_candidate(b_cand).await.unwrap();

        wait_state(&mut a_rx, PeerConnectionState::Connected).await;
        wait_state(&mut b_rx, PeerConnectionState::Connected).await;

        // b sees both of a's tracks; a sees only b's audio.
        let b_remote = next_matching(&mut b_rx, |e| match e {
            PeerEvent::RemoteStream(s) => Some(s),
            _ => None,
        })
        .await;
        assert_eq!(b_remote.tracks().len(), 2);
        let a_remote = next_matching(&mut a_rx, |e| match e {
            PeerEvent::RemoteStream(s) => Some(s),
            _ => None,
        })
        .await;
        assert!(a_remote.has_kind(TrackKind::Audio));
        assert!(!a_remote.has_kind(TrackKind::Video));

        a.close().await;
        wait_state(&mut a_rx, PeerConnectionState::Closed).await;
        assert!(!a_remote.is_live());
    }

    #[tokio::test]
    async fn test_candidate_needs_remote_description() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pc = factory(Duration::from_secs(1)).create(tx).await.unwrap();
        let err = pc
            .add_ice_candidate(IceCandidateInit::new(
                "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NoRemoteDescription));
    }

    #[tokio::test]
    async fn test_fails_without_reachable_candidate() {
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let mut a = factory(Duration::from_millis(300)).create(a_tx).await.unwrap();
        let mut b = factory(Duration::from_millis(300)).create(b_tx).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();

        wait_state(&mut b_rx, PeerConnectionState::Connecting).await;
        wait_state(&mut b_rx, PeerConnectionState::Failed).await;
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pc = factory(Duration::from_secs(1)).create(tx).await.unwrap();
        pc.close().await;
        pc.close().await;
        assert!(matches!(pc.create_offer().await, Err(PeerError::Closed)));
    }
}
