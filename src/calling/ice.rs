//! ICE candidates and STUN binding. Just enough of RFC 5389 / RFC 8445 to
//! gather host and server-reflexive candidates for a UDP peer transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

/// STUN magic cookie (RFC 5389).
const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN header size (type + length + magic + transaction ID).
const STUN_HEADER_SIZE: usize = 20;

/// Default public STUN server for server-reflexive candidate gathering.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Per-attempt wait for a STUN binding response.
const STUN_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
        }
    }
}

/// One ICE candidate, as carried in an `a=candidate:` line. UDP only.
#[derive(Debug, Clone, PartialEq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// Base address for srflx/relay candidates.
    pub related: Option<(String, u16)>,
}

impl IceCandidate {
    fn new(foundation: &str, candidate_type: CandidateType, addr: SocketAddr) -> Self {
        Self {
            foundation: foundation.to_string(),
            component: 1,
            priority: compute_priority(candidate_type, 1, 1),
            address: addr.ip().to_string(),
            port: addr.port(),
            candidate_type,
            related: None,
        }
    }

    /// Format as an SDP attribute value (without the `a=` prefix).
    pub fn to_sdp_line(&self) -> String {
        let mut line = format!(
            "candidate:{} {} UDP {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address,
            self.port,
            self.candidate_type.as_str()
        );
        if let Some((ref addr, port)) = self.related {
            line.push_str(&format!(" raddr {} rport {}", addr, port));
        }
        line
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        format!("{}:{}", self.address, self.port).parse().ok()
    }
}

/// Parse a `candidate:` line, with or without the `a=` prefix.
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"))
        .with_context(|| format!("not a candidate line: {}", line))?;

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 {
        bail!("candidate line too short: {}", line);
    }
    if !parts[2].eq_ignore_ascii_case("udp") {
        bail!("unsupported transport: {}", parts[2]);
    }
    if parts[6] != "typ" {
        bail!("expected 'typ' keyword, got: {}", parts[6]);
    }
    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    let mut raddr = None;
    let mut rport = None;
    let mut rest = parts[8..].iter();
    while let Some(key) = rest.next() {
        match *key {
            "raddr" => raddr = rest.next().map(|s| s.to_string()),
            "rport" => {
                rport = match rest.next() {
                    Some(p) => Some(p.parse::<u16>().context("bad rport")?),
                    None => None,
                }
            }
            _ => {}
        }
    }

    Ok(IceCandidate {
        foundation: parts[0].to_string(),
        component: parts[1].parse().context("bad component")?,
        priority: parts[3].parse().context("bad priority")?,
        address: parts[4].to_string(),
        port: parts[5].parse().context("bad port")?,
        candidate_type,
        related: raddr.zip(rport),
    })
}

/// Compute candidate priority per RFC 8445 section 5.1.2.1.
fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    let type_preference: u32 = match ctype {
        CandidateType::Host => 126,
        CandidateType::ServerReflexive => 100,
        CandidateType::Relay => 0,
    };
    (type_preference << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Random 12-byte STUN transaction ID.
pub fn generate_transaction_id() -> [u8; 12] {
    let id = uuid::Uuid::new_v4();
    let mut txn = [0u8; 12];
    txn.copy_from_slice(&id.as_bytes()[..12]);
    txn
}

/// Minimal STUN Binding Request (header only, no attributes).
pub fn build_stun_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STUN_HEADER_SIZE);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(transaction_id);
    buf
}

/// Extract the mapped address from a Binding Success Response matching `txn`.
pub fn parse_binding_response(data: &[u8], txn: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < STUN_HEADER_SIZE {
        return None;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if msg_type != BINDING_RESPONSE || magic != MAGIC_COOKIE || &data[8..20] != txn {
        return None;
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let attrs_end = std::cmp::min(STUN_HEADER_SIZE + msg_len, data.len());
    let mut pos = STUN_HEADER_SIZE;
    while pos + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        let end = start + attr_len;
        if end > attrs_end {
            break;
        }
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return decode_address(&data[start..end], true),
            ATTR_MAPPED_ADDRESS => return decode_address(&data[start..end], false),
            _ => {}
        }
        // Attributes are padded to 4 bytes.
        pos = start + ((attr_len + 3) & !3);
    }
    None
}

/// IPv4 MAPPED-ADDRESS / XOR-MAPPED-ADDRESS value.
fn decode_address(value: &[u8], xor: bool) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mask = |i: usize| if xor { cookie[i] } else { 0 };
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let ip = Ipv4Addr::new(
        value[4] ^ mask(0),
        value[5] ^ mask(1),
        value[6] ^ mask(2),
        value[7] ^ mask(3),
    );
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Host candidate for a socket's bound address. When bound to the unspecified
/// address, the default outbound interface is used.
pub fn gather_host_candidates(local_addr: SocketAddr) -> Vec<IceCandidate> {
    let ip = if local_addr.ip().is_unspecified() {
        match default_outbound_ip() {
            Some(ip) => ip,
            None => return Vec::new(),
        }
    } else {
        local_addr.ip()
    };
    vec![IceCandidate::new(
        "1",
        CandidateType::Host,
        SocketAddr::new(ip, local_addr.port()),
    )]
}

/// "Connect" a throwaway UDP socket to find the default route's local address.
fn default_outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Best-effort local IP for SDP connection lines; falls back to loopback.
pub fn local_ip() -> IpAddr {
    default_outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Ask `stun_server` for our public mapping of `socket`. `None` when the
/// server cannot be resolved or does not answer.
pub async fn gather_srflx_candidate(socket: &UdpSocket, stun_server: &str) -> Option<IceCandidate> {
    let server_addr = match tokio::net::lookup_host(stun_server).await {
        Ok(mut addrs) => addrs.find(|a| a.is_ipv4())?,
        Err(e) => {
            tracing::debug!("Failed to resolve STUN server {}: {}", stun_server, e);
            return None;
        }
    };

    let txn = generate_transaction_id();
    let request = build_stun_binding_request(&txn);

    for attempt in 0..2 {
        if let Err(e) = socket.send_to(&request, server_addr).await {
            tracing::debug!("STUN send to {} failed: {}", server_addr, e);
            return None;
        }
        let mut buf = [0u8; 256];
        match tokio::time::timeout(STUN_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                if let Some(mapped) = parse_binding_response(&buf[..len], &txn) {
                    let base = socket.local_addr().ok()?;
                    let mut candidate =
                        IceCandidate::new("2", CandidateType::ServerReflexive, mapped);
                    candidate.related = Some((base.ip().to_string(), base.port()));
                    tracing::debug!("srflx candidate via {}: {}", stun_server, mapped);
                    return Some(candidate);
                }
            }
            Ok(Err(e)) => tracing::debug!("STUN recv error (attempt {}): {}", attempt, e),
            Err(_) => tracing::debug!("STUN timeout from {} (attempt {})", stun_server, attempt),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candidate_host() {
        let c = parse_candidate("a=candidate:1 1 UDP 2130706431 192.168.1.5 50000 typ host")
            .unwrap();
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert_eq!(c.port, 50000);
        assert_eq!(c.socket_addr(), Some("192.168.1.5:50000".parse().unwrap()));
    }

    #[test]
    fn test_parse_candidate_srflx_with_related() {
        let c = parse_candidate(
            "candidate:2 1 udp 1677721855 203.0.113.7 61000 typ srflx raddr 10.0.0.2 rport 50000",
        )
        .unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.related, Some(("10.0.0.2".to_string(), 50000)));
        assert_eq!(
            c.to_sdp_line(),
            "candidate:2 1 UDP 1677721855 203.0.113.7 61000 typ srflx raddr 10.0.0.2 rport 50000"
        );
    }

    #[test]
    fn test_parse_candidate_rejects_tcp() {
        assert!(parse_candidate("candidate:1 1 TCP-ACT 1 10.0.0.1 9 typ host").is_err());
        assert!(parse_candidate("a=ice-ufrag:abcd").is_err());
    }

    #[test]
    fn test_host_priority_beats_srflx() {
        assert!(
            compute_priority(CandidateType::Host, 1, 1)
                > compute_priority(CandidateType::ServerReflexive, 1, 1)
        );
    }

    #[test]
    fn test_binding_response_xor_mapped() {
        let txn = generate_transaction_id();
        let mapped: SocketAddr = "203.0.113.7:61000".parse().unwrap();
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        for (i, b) in [203u8, 0, 113, 7].iter().enumerate() {
            value.push(b ^ cookie[i]);
        }

        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&txn);
        msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
        msg.extend_from_slice(&value);

        assert_eq!(parse_binding_response(&msg, &txn), Some(mapped));
        let other = generate_transaction_id();
        assert_eq!(parse_binding_response(&msg, &other), None);
    }

    #[test]
    fn test_binding_request_layout() {
        let txn = [7u8; 12];
        let req = build_stun_binding_request(&txn);
        assert_eq!(req.len(), STUN_HEADER_SIZE);
        assert_eq!(&req[0..2], &BINDING_REQUEST.to_be_bytes());
        assert_eq!(&req[8..], &txn);
    }
}
