//! Minimal SDP for the UDP engine.
//!
//! One m-line per track kind, shared ICE credentials at media level, no
//! inline candidates (candidates are trickled as `candidate` signals).

use std::fmt::Write as _;

use super::ice::{IceCandidate, IceCredentials};
use super::media::TrackKind;

/// A media section (`m=` line and its attributes) we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: TrackKind,
    pub mid: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// Whether the side that wrote this direction sends media.
    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    /// The answer's direction for an offered one, given whether we send.
    fn answer_to(self, we_send: bool) -> Self {
        let they_send = self.sends();
        let we_recv = matches!(self, Direction::SendRecv | Direction::RecvOnly);
        match (we_send && we_recv, they_send) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }
}

/// What we extract from a remote description.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSdp {
    pub credentials: IceCredentials,
    pub sections: Vec<MediaSection>,
    /// Candidates embedded in the description (non-trickle peers).
    pub candidates: Vec<IceCandidate>,
}

fn payload_line(kind: TrackKind) -> (&'static str, &'static str) {
    match kind {
        TrackKind::Audio => ("111", "a=rtpmap:111 opus/48000/2"),
        TrackKind::Video => ("96", "a=rtpmap:96 VP8/90000"),
    }
}

fn session_header(out: &mut String, sections: &[MediaSection]) {
    let session_id = chrono::Utc::now().timestamp_micros().unsigned_abs();
    let _ = writeln!(out, "v=0\r");
    let _ = writeln!(out, "o=- {} 2 IN IP4 127.0.0.1\r", session_id);
    let _ = writeln!(out, "s=-\r");
    let _ = writeln!(out, "t=0 0\r");
    let mids: Vec<&str> = sections.iter().map(|s| s.mid.as_str()).collect();
    let _ = writeln!(out, "a=group:BUNDLE {}\r", mids.join(" "));
}

fn write_sections(out: &mut String, sections: &[MediaSection], creds: &IceCredentials) {
    for section in sections {
        let (pt, rtpmap) = payload_line(section.kind);
        let _ = writeln!(out, "m={} 9 RTP/AVP {}\r", section.kind, pt);
        let _ = writeln!(out, "c=IN IP4 0.0.0.0\r");
        let _ = writeln!(out, "a=ice-ufrag:{}\r", creds.ufrag);
        let _ = writeln!(out, "a=ice-pwd:{}\r", creds.pwd);
        let _ = writeln!(out, "a=ice-options:trickle\r");
        let _ = writeln!(out, "a=mid:{}\r", section.mid);
        let _ = writeln!(out, "a={}\r", section.direction.as_str());
        let _ = writeln!(out, "a=rtcp-mux\r");
        let _ = writeln!(out, "{}\r", rtpmap);
    }
}

/// Offer with one sendrecv section per local track kind. With no local
/// tracks, a recvonly audio section is offered so the peer has something to
/// answer.
pub fn build_offer(local_kinds: &[TrackKind], creds: &IceCredentials) -> String {
    let mut sections: Vec<MediaSection> = local_kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| MediaSection {
            kind: *kind,
            mid: i.to_string(),
            direction: Direction::SendRecv,
        })
        .collect();
    if sections.is_empty() {
        sections.push(MediaSection {
            kind: TrackKind::Audio,
            mid: "0".into(),
            direction: Direction::RecvOnly,
        });
    }

    let mut out = String::new();
    session_header(&mut out, &sections);
    write_sections(&mut out, &sections, creds);
    out
}

/// Answer mirroring the offered sections in order.
pub fn build_answer(
    offer: &ParsedSdp,
    local_kinds: &[TrackKind],
    creds: &IceCredentials,
) -> String {
    let sections: Vec<MediaSection> = offer
        .sections
        .iter()
        .map(|s| MediaSection {
            kind: s.kind,
            mid: s.mid.clone(),
            direction: s.direction.answer_to(local_kinds.contains(&s.kind)),
        })
        .collect();

    let mut out = String::new();
    session_header(&mut out, &sections);
    write_sections(&mut out, &sections, creds);
    out
}

/// Extract credentials, media sections and embedded candidates.
pub fn parse(sdp: &str) -> Result<ParsedSdp, String> {
    let mut ufrag = None;
    let mut pwd = None;
    let mut sections: Vec<MediaSection> = Vec::new();
    let mut candidates = Vec::new();
    // Attributes after an unsupported m-line belong to that section.
    let mut in_supported = false;

    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("m=") {
            let media = rest.split_whitespace().next().unwrap_or_default();
            in_supported = match TrackKind::from_media_type(media) {
                Some(kind) => {
                    sections.push(MediaSection {
                        kind,
                        mid: sections.len().to_string(),
                        direction: Direction::SendRecv,
                    });
                    true
                }
                None => {
                    tracing::debug!("Ignoring unsupported m-line: {}", line);
                    false
                }
            };
        } else if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
            ufrag.get_or_insert_with(|| v.to_string());
        } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
            pwd.get_or_insert_with(|| v.to_string());
        } else if let Some(v) = line.strip_prefix("a=mid:") {
            if let Some(section) = sections.last_mut().filter(|_| in_supported) {
                section.mid = v.to_string();
            }
        } else if line.starts_with("a=candidate:") {
            match IceCandidate::parse(line) {
                Ok(c) => candidates.push(c),
                Err(e) => tracing::debug!("Skipping embedded candidate: {}", e),
            }
        } else if let Some(dir) = line.strip_prefix("a=").and_then(Direction::parse) {
            if let Some(section) = sections.last_mut().filter(|_| in_supported) {
                section.direction = dir;
            }
        }
    }

    if !sdp.trim_start().starts_with("v=0") {
        return Err("description does not start with v=0".into());
    }
    let (Some(ufrag), Some(pwd)) = (ufrag, pwd) else {
        return Err("description has no ICE credentials".into());
    };
    if sections.is_empty() {
        return Err("description has no audio or video section".into());
    }

    Ok(ParsedSdp {
        credentials: IceCredentials { ufrag, pwd },
        sections,
        candidates,
    })
}
