//! STUN message codec (RFC 5389), limited to what ICE connectivity checks need:
//! Binding requests/responses with USERNAME, PRIORITY, ICE role attributes,
//! XOR-MAPPED-ADDRESS, MESSAGE-INTEGRITY and FINGERPRINT.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const MAGIC_COOKIE: u32 = 0x2112A442;

pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS: u16 = 0x0101;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_PRIORITY: u16 = 0x0024;
pub const ATTR_USE_CANDIDATE: u16 = 0x0025;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_ICE_CONTROLLED: u16 = 0x8029;
pub const ATTR_ICE_CONTROLLING: u16 = 0x802A;

const HEADER_LEN: usize = 20;
const INTEGRITY_ATTR_LEN: usize = 24;
const FINGERPRINT_ATTR_LEN: usize = 8;
const FINGERPRINT_XOR: u32 = 0x5354554e;

pub type TransactionId = [u8; 12];

/// Random transaction id from the OS CSPRNG.
pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    if getrandom::getrandom(&mut id).is_err() {
        // Uniqueness is all a transaction id needs.
        id.copy_from_slice(&uuid::Uuid::new_v4().as_bytes()[..12]);
    }
    id
}

// CRC-32 (IEEE, reflected) for FINGERPRINT.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB88320
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

fn crc32(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFFFFFFu32, |crc, &b| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ b as u32) & 0xFF) as usize]
    })
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    // HMAC accepts keys of any length.
    if let Ok(mut mac) = HmacSha1::new_from_slice(key) {
        mac.update(data);
        out.copy_from_slice(&mac.finalize().into_bytes()[..20]);
    }
    out
}

fn set_length(buf: &mut [u8], body_len: usize) {
    buf[2..4].copy_from_slice(&(body_len as u16).to_be_bytes());
}

/// Incrementally builds one STUN message.
pub struct MessageBuilder {
    buf: Vec<u8>,
    transaction_id: TransactionId,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, transaction_id: TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&transaction_id);
        Self {
            buf,
            transaction_id,
        }
    }

    pub fn attr(mut self, attr_type: u16, value: &[u8]) -> Self {
        self.buf.extend_from_slice(&attr_type.to_be_bytes());
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
        let padded = (value.len() + 3) & !3;
        self.buf.resize(self.buf.len() + padded - value.len(), 0);
        self
    }

    pub fn username(self, username: &str) -> Self {
        self.attr(ATTR_USERNAME, username.as_bytes())
    }

    pub fn priority(self, priority: u32) -> Self {
        self.attr(ATTR_PRIORITY, &priority.to_be_bytes())
    }

    /// ICE-CONTROLLING (plus USE-CANDIDATE, aggressive nomination) or
    /// ICE-CONTROLLED with the agent's tie-breaker.
    pub fn ice_role(self, controlling: bool, tie_breaker: u64) -> Self {
        if controlling {
            self.attr(ATTR_ICE_CONTROLLING, &tie_breaker.to_be_bytes())
                .attr(ATTR_USE_CANDIDATE, &[])
        } else {
            self.attr(ATTR_ICE_CONTROLLED, &tie_breaker.to_be_bytes())
        }
    }

    pub fn xor_mapped_address(self, addr: SocketAddr) -> Self {
        let value = encode_xor_address(addr, &self.transaction_id);
        self.attr(ATTR_XOR_MAPPED_ADDRESS, &value)
    }

    /// Finish with MESSAGE-INTEGRITY (keyed by `key`) and FINGERPRINT.
    pub fn finish_with_integrity(mut self, key: &[u8]) -> Vec<u8> {
        let body = self.buf.len() - HEADER_LEN;
        set_length(&mut self.buf, body + INTEGRITY_ATTR_LEN);
        let mac = hmac_sha1(key, &self.buf);
        self = self.attr(ATTR_MESSAGE_INTEGRITY, &mac);

        let body = self.buf.len() - HEADER_LEN;
        set_length(&mut self.buf, body + FINGERPRINT_ATTR_LEN);
        let fingerprint = crc32(&self.buf) ^ FINGERPRINT_XOR;
        self.attr(ATTR_FINGERPRINT, &fingerprint.to_be_bytes()).buf
    }

    #[cfg(test)]
    pub fn finish(mut self) -> Vec<u8> {
        let body = self.buf.len() - HEADER_LEN;
        set_length(&mut self.buf, body);
        self.buf
    }
}

/// A validated view over a received STUN message.
#[derive(Debug, Clone, Copy)]
pub struct StunMessage<'a> {
    pub msg_type: u16,
    pub transaction_id: TransactionId,
    data: &'a [u8],
}

impl<'a> StunMessage<'a> {
    /// Returns `None` for anything that is not a well-formed STUN message.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_LEN || data[0] & 0xC0 != 0 {
            return None;
        }
        let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if cookie != MAGIC_COOKIE {
            return None;
        }
        let body = u16::from_be_bytes([data[2], data[3]]) as usize;
        if HEADER_LEN + body > data.len() {
            return None;
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);
        Some(Self {
            msg_type: u16::from_be_bytes([data[0], data[1]]),
            transaction_id,
            data: &data[..HEADER_LEN + body],
        })
    }

    pub fn is_binding_request(&self) -> bool {
        self.msg_type == BINDING_REQUEST
    }

    pub fn is_binding_success(&self) -> bool {
        self.msg_type == BINDING_SUCCESS
    }

    /// Attributes as `(offset, type, value)`.
    fn attributes(&self) -> impl Iterator<Item = (usize, u16, &'a [u8])> + 'a {
        let data = self.data;
        let mut pos = HEADER_LEN;
        std::iter::from_fn(move || {
            if pos + 4 > data.len() {
                return None;
            }
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let start = pos + 4;
            if start + len > data.len() {
                return None;
            }
            let item = (pos, attr_type, &data[start..start + len]);
            pos = start + ((len + 3) & !3);
            Some(item)
        })
    }

    fn attr(&self, wanted: u16) -> Option<&'a [u8]> {
        self.attributes()
            .find(|(_, t, _)| *t == wanted)
            .map(|(_, _, v)| v)
    }

    pub fn username(&self) -> Option<&'a str> {
        self.attr(ATTR_USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn has_attr(&self, wanted: u16) -> bool {
        self.attr(wanted).is_some()
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        if let Some(v) = self.attr(ATTR_XOR_MAPPED_ADDRESS) {
            return decode_xor_address(v, &self.transaction_id);
        }
        self.attr(ATTR_MAPPED_ADDRESS).and_then(decode_plain_address)
    }

    /// Check MESSAGE-INTEGRITY against `key`. Messages without the
    /// attribute fail.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        let Some((offset, _, value)) = self
            .attributes()
            .find(|(_, t, _)| *t == ATTR_MESSAGE_INTEGRITY)
        else {
            return false;
        };
        if value.len() != 20 {
            return false;
        }
        let mut signed = self.data[..offset].to_vec();
        set_length(&mut signed, offset - HEADER_LEN + INTEGRITY_ATTR_LEN);
        hmac_sha1(key, &signed)[..] == value[..]
    }

    /// True when FINGERPRINT is absent or correct.
    pub fn fingerprint_ok(&self) -> bool {
        match self
            .attributes()
            .find(|(_, t, _)| *t == ATTR_FINGERPRINT)
        {
            Some((offset, _, value)) if value.len() == 4 => {
                let expected = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                crc32(&self.data[..offset]) ^ FINGERPRINT_XOR == expected
            }
            Some(_) => false,
            None => true,
        }
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);

    let (family, octets): (u8, Vec<u8>) = match addr.ip() {
        IpAddr::V4(ip) => (0x01, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02, ip.octets().to_vec()),
    };
    let mut value = vec![0, family];
    value.extend_from_slice(&xport.to_be_bytes());
    value.extend(octets.iter().zip(key.iter()).map(|(b, k)| b ^ k));
    value
}

fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);

    let ip = match value[1] {
        0x01 => {
            let o: Vec<u8> = value[4..8].iter().zip(key.iter()).map(|(b, k)| b ^ k).collect();
            IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
        }
        0x02 if value.len() >= 20 => {
            let mut o = [0u8; 16];
            for (i, byte) in o.iter_mut().enumerate() {
                *byte = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(o))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn decode_plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_values() {
        assert_eq!(crc32(b""), 0x00000000);
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_request_integrity_and_fingerprint() {
        let txn = new_transaction_id();
        let msg = MessageBuilder::new(BINDING_REQUEST, txn)
            .username("remote:local")
            .priority(2130706431)
            .ice_role(true, 42)
            .finish_with_integrity(b"remote-password");

        let parsed = StunMessage::parse(&msg).unwrap();
        assert!(parsed.is_binding_request());
        assert_eq!(parsed.transaction_id, txn);
        assert_eq!(parsed.username(), Some("remote:local"));
        assert!(parsed.has_attr(ATTR_USE_CANDIDATE));
        assert!(parsed.verify_integrity(b"remote-password"));
        assert!(!parsed.verify_integrity(b"wrong"));
        assert!(parsed.fingerprint_ok());
    }

    #[test]
    fn test_response_carries_mapped_address() {
        let txn = new_transaction_id();
        let addr: SocketAddr = "192.168.1.100:54321".parse().unwrap();
        let msg = MessageBuilder::new(BINDING_SUCCESS, txn)
            .xor_mapped_address(addr)
            .finish_with_integrity(b"pwd");

        let parsed = StunMessage::parse(&msg).unwrap();
        assert!(parsed.is_binding_success());
        assert_eq!(parsed.mapped_address(), Some(addr));
        assert!(parsed.verify_integrity(b"pwd"));
    }

    #[test]
    fn test_ipv6_mapped_address() {
        let txn = new_transaction_id();
        let addr: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let msg = MessageBuilder::new(BINDING_SUCCESS, txn)
            .xor_mapped_address(addr)
            .finish();
        assert_eq!(StunMessage::parse(&msg).unwrap().mapped_address(), Some(addr));
    }

    #[test]
    fn test_corrupted_fingerprint_detected() {
        let mut msg = MessageBuilder::new(BINDING_REQUEST, new_transaction_id())
            .username("a:b")
            .finish_with_integrity(b"k");
        let last = msg.len() - 1;
        msg[last] ^= 0xFF;
        assert!(!StunMessage::parse(&msg).unwrap().fingerprint_ok());
    }

    #[test]
    fn test_non_stun_rejected() {
        assert!(StunMessage::parse(&[0x80; 40]).is_none());
        assert!(StunMessage::parse(b"short").is_none());
        // Length field pointing past the datagram.
        let mut msg = MessageBuilder::new(BINDING_REQUEST, new_transaction_id()).finish();
        msg[3] = 40;
        assert!(StunMessage::parse(&msg).is_none());
    }
}
