//! ICE for the UDP engine: candidate lines, credentials, host gathering and
//! connectivity checks over a single shared socket.
//!
//! One reader task owns the receive side of the socket: it answers the
//! peer's Binding requests and routes Binding responses to the check that is
//! waiting on that transaction id.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::stun::{self, MessageBuilder, StunMessage, TransactionId};

/// Per-attempt wait for a Binding response.
const CHECK_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts per connectivity check.
const CHECK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// An ICE candidate (`candidate:` attribute).
#[derive(Debug, Clone, PartialEq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub protocol: Protocol,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub kind: CandidateType,
    pub related: Option<SocketAddr>,
}

impl IceCandidate {
    pub fn host(addr: SocketAddr) -> Self {
        Self {
            foundation: "1".into(),
            component: 1,
            protocol: Protocol::Udp,
            priority: priority(CandidateType::Host, 65535, 1),
            address: addr.ip(),
            port: addr.port(),
            kind: CandidateType::Host,
            related: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parse `candidate:...` (an optional `a=` prefix is accepted).
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let body = line
            .strip_prefix("a=")
            .unwrap_or(line)
            .strip_prefix("candidate:")
            .ok_or_else(|| format!("not a candidate: {}", line))?;

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(format!("malformed candidate: {}", line));
        }

        let protocol = match parts[2].to_ascii_lowercase().as_str() {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            other => return Err(format!("unsupported transport {}", other)),
        };
        let kind = match parts[7] {
            "host" => CandidateType::Host,
            "srflx" | "prflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relay,
            other => return Err(format!("unknown candidate type {}", other)),
        };
        fn num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, String> {
            s.parse().map_err(|_| format!("bad {} {:?}", what, s))
        }

        let mut raddr = None;
        let mut rport = None;
        let mut rest = parts[8..].iter();
        while let Some(key) = rest.next() {
            match (*key, rest.next()) {
                ("raddr", Some(v)) => raddr = v.parse::<IpAddr>().ok(),
                ("rport", Some(v)) => rport = v.parse::<u16>().ok(),
                _ => {}
            }
        }

        Ok(Self {
            foundation: parts[0].to_string(),
            component: num(parts[1], "component")?,
            protocol,
            priority: num(parts[3], "priority")?,
            address: parts[4]
                .parse()
                .map_err(|_| format!("bad address {:?}", parts[4]))?,
            port: num(parts[5], "port")?,
            kind,
            related: raddr.zip(rport).map(|(ip, port)| SocketAddr::new(ip, port)),
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        };
        let kind = match self.kind {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
        };
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation, self.component, protocol, self.priority, self.address, self.port, kind
        )?;
        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }
        Ok(())
    }
}

/// Candidate priority per RFC 8445 §5.1.2.1.
pub fn priority(kind: CandidateType, local_preference: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Local ICE credentials (`a=ice-ufrag`, `a=ice-pwd`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// 8-char ufrag and 24-char password, hex only so no SDP parser chokes.
    pub fn generate() -> Self {
        Self {
            ufrag: random_hex::<4>(),
            pwd: random_hex::<12>(),
        }
    }
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    if getrandom::getrandom(&mut bytes).is_err() {
        let id = uuid::Uuid::new_v4();
        for (b, s) in bytes.iter_mut().zip(id.as_bytes().iter().cycle()) {
            *b = *s;
        }
    }
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Host candidates for a bound socket. A wildcard bind is resolved to the
/// default outbound interface address.
pub fn gather_host_candidates(bound: SocketAddr) -> Vec<IceCandidate> {
    if !bound.ip().is_unspecified() {
        return vec![IceCandidate::host(bound)];
    }
    // Connecting a throwaway UDP socket sends nothing; it only makes the OS
    // pick the outbound interface.
    let outbound = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|_| s))
        .and_then(|s| s.local_addr());
    match outbound {
        Ok(addr) => vec![IceCandidate::host(SocketAddr::new(addr.ip(), bound.port()))],
        Err(e) => {
            tracing::debug!("No default route for host candidate ({}), using loopback", e);
            vec![IceCandidate::host(SocketAddr::new(
                IpAddr::from([127, 0, 0, 1]),
                bound.port(),
            ))]
        }
    }
}

type Pending = Arc<Mutex<HashMap<TransactionId, oneshot::Sender<SocketAddr>>>>;

/// ICE agent for one socket and one credential pair.
pub struct IceAgent {
    socket: Arc<UdpSocket>,
    local: IceCredentials,
    remote: Arc<Mutex<Option<IceCredentials>>>,
    controlling: Arc<Mutex<bool>>,
    tie_breaker: u64,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl IceAgent {
    /// Start answering Binding requests on `socket` immediately.
    pub fn start(socket: Arc<UdpSocket>, local: IceCredentials) -> Self {
        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_loop(socket.clone(), local.clone(), pending.clone()));
        let tie_breaker = u64::from_be_bytes(
            uuid::Uuid::new_v4().as_bytes()[..8]
                .try_into()
                .unwrap_or([0; 8]),
        );
        Self {
            socket,
            local,
            remote: Arc::default(),
            controlling: Arc::default(),
            tie_breaker,
            pending,
            reader,
        }
    }

    pub fn local_credentials(&self) -> &IceCredentials {
        &self.local
    }

    pub fn set_remote(&self, remote: IceCredentials, controlling: bool) {
        *self.remote.lock() = Some(remote);
        *self.controlling.lock() = controlling;
    }

    /// Connectivity check against `target`. Resolves with our address as the
    /// peer sees it.
    pub fn checker(&self) -> Checker {
        Checker {
            socket: self.socket.clone(),
            local_ufrag: self.local.ufrag.clone(),
            remote: self.remote.clone(),
            controlling: self.controlling.clone(),
            tie_breaker: self.tie_breaker,
            pending: self.pending.clone(),
        }
    }
}

impl Drop for IceAgent {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Cloneable handle for running checks from spawned tasks.
#[derive(Clone)]
pub struct Checker {
    socket: Arc<UdpSocket>,
    local_ufrag: String,
    remote: Arc<Mutex<Option<IceCredentials>>>,
    controlling: Arc<Mutex<bool>>,
    tie_breaker: u64,
    pending: Pending,
}

impl Checker {
    pub async fn check(&self, target: SocketAddr) -> Result<SocketAddr, String> {
        let Some(remote) = self.remote.lock().clone() else {
            return Err("no remote ICE credentials".into());
        };
        let controlling = *self.controlling.lock();
        let username = format!("{}:{}", remote.ufrag, self.local_ufrag);

        for attempt in 1..=CHECK_ATTEMPTS {
            let txn = stun::new_transaction_id();
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(txn, tx);

            let request = MessageBuilder::new(stun::BINDING_REQUEST, txn)
                .username(&username)
                .priority(priority(CandidateType::ServerReflexive, 65535, 1))
                .ice_role(controlling, self.tie_breaker)
                .finish_with_integrity(remote.pwd.as_bytes());

            if let Err(e) = self.socket.send_to(&request, target).await {
                self.pending.lock().remove(&txn);
                return Err(format!("send to {} failed: {}", target, e));
            }
            tracing::debug!("ICE check #{} -> {}", attempt, target);

            match tokio::time::timeout(CHECK_TIMEOUT, rx).await {
                Ok(Ok(mapped)) => return Ok(mapped),
                _ => {
                    self.pending.lock().remove(&txn);
                }
            }
        }

        Err(format!(
            "no response from {} after {} attempts",
            target, CHECK_ATTEMPTS
        ))
    }
}

async fn read_loop(socket: Arc<UdpSocket>, local: IceCredentials, pending: Pending) {
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("ICE socket recv error: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(msg) = StunMessage::parse(&buf[..len]) else {
            // Media would be demultiplexed here.
            continue;
        };
        if !msg.fingerprint_ok() {
            tracing::debug!("Dropping STUN message from {} with bad fingerprint", from);
            continue;
        }

        if msg.is_binding_request() {
            let for_us = msg
                .username()
                .map(|u| u.split(':').next() == Some(local.ufrag.as_str()))
                .unwrap_or(false);
            if !for_us || !msg.verify_integrity(local.pwd.as_bytes()) {
                tracing::debug!("Ignoring unauthenticated Binding request from {}", from);
                continue;
            }
            if msg.has_attr(stun::ATTR_USE_CANDIDATE) {
                tracing::debug!("Peer nominated the pair via {}", from);
            }
            let response = MessageBuilder::new(stun::BINDING_SUCCESS, msg.transaction_id)
                .xor_mapped_address(from)
                .finish_with_integrity(local.pwd.as_bytes());
            if let Err(e) = socket.send_to(&response, from).await {
                tracing::debug!("Failed to answer Binding request from {}: {}", from, e);
            }
        } else if msg.is_binding_success() {
            let waiter = pending.lock().remove(&msg.transaction_id);
            match (waiter, msg.mapped_address()) {
                (Some(tx), Some(mapped)) => {
                    let _ = tx.send(mapped);
                }
                (None, _) => tracing::debug!("Late or unknown Binding response from {}", from),
                (Some(_), None) => tracing::debug!("Binding response from {} without address", from),
            }
        }
    }
}
