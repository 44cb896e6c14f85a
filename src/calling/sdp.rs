//! Session descriptions exchanged through the call store.
//!
//! One UDP transport carries both media sections, so every section shares
//! the same port, ICE credentials and candidates. Each section still gets its
//! own SRTP crypto line.

use std::fmt::Write as _;
use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use base64::Engine;

use super::ice::{self, IceCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Fixed format line for each kind: PCMU for audio, H.264 for video.
    fn formats(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            MediaKind::Audio => ("0", &["a=rtpmap:0 PCMU/8000", "a=ptime:20"]),
            MediaKind::Video => (
                "96",
                &[
                    "a=rtpmap:96 H264/90000",
                    "a=fmtp:96 packetization-mode=1",
                    "a=rtcp-fb:96 nack pli",
                ],
            ),
        }
    }
}

/// Direction attribute of a media section, from the describing side's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    fn from_flags(send: bool, recv: bool) -> Self {
        match (send, recv) {
            (true, true) => MediaDirection::SendRecv,
            (true, false) => MediaDirection::SendOnly,
            (false, true) => MediaDirection::RecvOnly,
            (false, false) => MediaDirection::Inactive,
        }
    }

    /// Direction for an offered section: always willing to receive.
    pub fn for_offer(local_sends: bool) -> Self {
        Self::from_flags(local_sends, true)
    }

    /// Direction for answering a remote section described as `remote`.
    pub fn for_answer(local_sends: bool, remote: MediaDirection) -> Self {
        Self::from_flags(local_sends && remote.receives(), remote.sends())
    }

    pub fn sends(&self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::SendOnly)
    }

    pub fn receives(&self) -> bool {
        matches!(self, MediaDirection::SendRecv | MediaDirection::RecvOnly)
    }

    fn as_attr(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub port: u16,
    pub direction: MediaDirection,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub crypto: Option<String>,
    pub candidates: Vec<IceCandidate>,
}

/// Parsed or generated session description.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub address: String,
    pub sections: Vec<MediaSection>,
}

impl SessionDescription {
    /// Parse an SDP blob. Rejects blobs without a version line, without any
    /// audio/video section, or with a section lacking ICE credentials.
    pub fn parse(blob: &str) -> Result<Self> {
        let mut lines = blob.lines().map(str::trim).filter(|l| !l.is_empty());
        match lines.next() {
            Some("v=0") => {}
            Some(other) => bail!("SDP must start with v=0, got: {}", other),
            None => bail!("empty SDP"),
        }

        let mut address = String::new();
        let mut session_ufrag = None;
        let mut session_pwd = None;
        let mut sections: Vec<MediaSection> = Vec::new();
        let mut in_media = false;
        // Inside an m= section of a kind we do not handle.
        let mut skipping = false;

        for line in lines {
            if let Some(m) = line.strip_prefix("m=") {
                in_media = true;
                let mut parts = m.split_whitespace();
                let kind = match parts.next() {
                    Some("audio") => Some(MediaKind::Audio),
                    Some("video") => Some(MediaKind::Video),
                    _ => None,
                };
                skipping = kind.is_none();
                if let Some(kind) = kind {
                    let port = parts
                        .next()
                        .context("m= line without port")?
                        .parse()
                        .context("bad m= port")?;
                    sections.push(MediaSection {
                        kind,
                        port,
                        direction: MediaDirection::SendRecv,
                        ice_ufrag: String::new(),
                        ice_pwd: String::new(),
                        crypto: None,
                        candidates: Vec::new(),
                    });
                }
                continue;
            }

            if let Some(c) = line.strip_prefix("c=IN IP4 ") {
                if address.is_empty() {
                    address = c.to_string();
                }
                continue;
            }

            if !in_media {
                if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
                    session_ufrag = Some(v.to_string());
                } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
                    session_pwd = Some(v.to_string());
                }
                continue;
            }
            match sections.last_mut() {
                Some(section) if !skipping => {
                    if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
                        section.ice_ufrag = v.to_string();
                    } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
                        section.ice_pwd = v.to_string();
                    } else if line.starts_with("a=crypto:") {
                        section.crypto.get_or_insert_with(|| line.to_string());
                    } else if line.starts_with("a=candidate:") {
                        match ice::parse_candidate(line) {
                            Ok(c) => section.candidates.push(c),
                            Err(e) => tracing::debug!("Skipping candidate: {}", e),
                        }
                    } else if let Some(dir) = parse_direction(line) {
                        section.direction = dir;
                    }
                }
                _ => {}
            }
        }

        if sections.is_empty() {
            bail!("SDP has no audio or video section");
        }
        for section in &mut sections {
            if section.ice_ufrag.is_empty() {
                section.ice_ufrag = session_ufrag.clone().unwrap_or_default();
            }
            if section.ice_pwd.is_empty() {
                section.ice_pwd = session_pwd.clone().unwrap_or_default();
            }
            if section.ice_ufrag.is_empty() || section.ice_pwd.is_empty() {
                bail!("{} section lacks ICE credentials", section.kind.as_str());
            }
        }

        Ok(Self { address, sections })
    }

    pub fn section(&self, kind: MediaKind) -> Option<&MediaSection> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Serialize with CRLF line endings.
    pub fn to_sdp(&self) -> String {
        let mut sdp = String::new();
        let _ = write!(sdp, "v=0\r\n");
        let _ = write!(sdp, "o=- 0 0 IN IP4 {}\r\n", self.address);
        let _ = write!(sdp, "s=pollcall\r\n");
        let _ = write!(sdp, "c=IN IP4 {}\r\n", self.address);
        let _ = write!(sdp, "t=0 0\r\n");
        for (mid, s) in self.sections.iter().enumerate() {
            let (pt, attrs) = s.kind.formats();
            let _ = write!(sdp, "m={} {} RTP/SAVP {}\r\n", s.kind.as_str(), s.port, pt);
            let _ = write!(sdp, "a=mid:{}\r\n", mid);
            for attr in attrs {
                let _ = write!(sdp, "{}\r\n", attr);
            }
            let _ = write!(sdp, "a={}\r\n", s.direction.as_attr());
            let _ = write!(sdp, "a=rtcp-mux\r\n");
            let _ = write!(sdp, "a=ice-ufrag:{}\r\n", s.ice_ufrag);
            let _ = write!(sdp, "a=ice-pwd:{}\r\n", s.ice_pwd);
            for c in &s.candidates {
                let _ = write!(sdp, "a={}\r\n", c.to_sdp_line());
            }
            if let Some(ref crypto) = s.crypto {
                let _ = write!(sdp, "{}\r\n", crypto);
            }
        }
        sdp
    }
}

fn parse_direction(line: &str) -> Option<MediaDirection> {
    match line {
        "a=sendrecv" => Some(MediaDirection::SendRecv),
        "a=sendonly" => Some(MediaDirection::SendOnly),
        "a=recvonly" => Some(MediaDirection::RecvOnly),
        "a=inactive" => Some(MediaDirection::Inactive),
        _ => None,
    }
}

/// ICE credentials for one transport.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Result<Self> {
        Ok(Self {
            ufrag: generate_ice_ufrag()?,
            pwd: generate_ice_pwd()?,
        })
    }
}

/// Build a local section. With no gathered candidates a host candidate for
/// `ip:port` is used so the description stays usable.
pub fn local_section(
    kind: MediaKind,
    direction: MediaDirection,
    ip: IpAddr,
    port: u16,
    credentials: &IceCredentials,
    candidates: &[IceCandidate],
) -> Result<MediaSection> {
    let candidates = if candidates.is_empty() {
        ice::gather_host_candidates(std::net::SocketAddr::new(ip, port))
    } else {
        candidates.to_vec()
    };
    Ok(MediaSection {
        kind,
        port,
        direction,
        ice_ufrag: credentials.ufrag.clone(),
        ice_pwd: credentials.pwd.clone(),
        crypto: Some(format!(
            "a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:{}|2^31",
            generate_srtp_key()?
        )),
        candidates,
    })
}

/// Random 4-character ICE ufrag.
pub fn generate_ice_ufrag() -> Result<String> {
    let bytes: [u8; 2] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Random 24-character ICE password. Hex keeps it free of characters some
/// SDP parsers reject.
pub fn generate_ice_pwd() -> Result<String> {
    let bytes: [u8; 12] = rand_bytes()?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Random 30-byte base64 SRTP master key and salt.
fn generate_srtp_key() -> Result<String> {
    let bytes: [u8; 30] = rand_bytes()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn rand_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("OS CSPRNG failed: {}", e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(direction_audio: MediaDirection, direction_video: MediaDirection) -> String {
        let creds = IceCredentials::generate().unwrap();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let candidate = ice::parse_candidate("candidate:1 1 UDP 2130706431 10.0.0.2 40000 typ host")
            .unwrap();
        SessionDescription {
            address: "10.0.0.2".into(),
            sections: vec![
                local_section(MediaKind::Audio, direction_audio, ip, 40000, &creds, &[candidate.clone()])
                    .unwrap(),
                local_section(MediaKind::Video, direction_video, ip, 40000, &creds, &[candidate])
                    .unwrap(),
            ],
        }
        .to_sdp()
    }

    #[test]
    fn test_generated_description_parses() {
        let sdp = sample(MediaDirection::SendRecv, MediaDirection::RecvOnly);
        assert!(sdp.starts_with("v=0\r\n"));
        let parsed = SessionDescription::parse(&sdp).unwrap();
        assert_eq!(parsed.address, "10.0.0.2");
        assert_eq!(parsed.sections.len(), 2);
        let audio = parsed.section(MediaKind::Audio).unwrap();
        assert_eq!(audio.direction, MediaDirection::SendRecv);
        assert_eq!(audio.candidates.len(), 1);
        assert!(audio.crypto.as_deref().unwrap().starts_with("a=crypto:1 AES_CM_128"));
        let video = parsed.section(MediaKind::Video).unwrap();
        assert_eq!(video.direction, MediaDirection::RecvOnly);
        assert_eq!(video.ice_ufrag, audio.ice_ufrag);
    }

    #[test]
    fn test_session_level_credentials_apply_to_sections() {
        let sdp = "v=0\r\nc=IN IP4 1.2.3.4\r\na=ice-ufrag:abcd\r\na=ice-pwd:0123456789abcdef012345\r\n\
                   m=audio 5000 RTP/SAVP 0\r\na=recvonly\r\n";
        let parsed = SessionDescription::parse(sdp).unwrap();
        assert_eq!(parsed.sections[0].ice_ufrag, "abcd");
        assert_eq!(parsed.sections[0].direction, MediaDirection::RecvOnly);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(SessionDescription::parse("").is_err());
        assert!(SessionDescription::parse("hello").is_err());
        assert!(SessionDescription::parse("v=0\r\ns=x\r\n").is_err());
        assert!(SessionDescription::parse("v=0\r\nm=audio 5000 RTP/SAVP 0\r\n").is_err());
    }

    #[test]
    fn test_answer_direction() {
        use MediaDirection::*;
        assert_eq!(MediaDirection::for_answer(true, SendRecv), SendRecv);
        assert_eq!(MediaDirection::for_answer(false, SendRecv), RecvOnly);
        assert_eq!(MediaDirection::for_answer(true, RecvOnly), SendOnly);
        assert_eq!(MediaDirection::for_answer(false, RecvOnly), Inactive);
        assert_eq!(MediaDirection::for_offer(false), RecvOnly);
    }

    #[test]
    fn test_ice_credentials_shape() {
        let creds = IceCredentials::generate().unwrap();
        assert_eq!(creds.ufrag.len(), 4);
        assert_eq!(creds.pwd.len(), 24);
        assert!(creds.pwd.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_material_differs_per_call() {
        let a: [u8; 16] = rand_bytes().unwrap();
        let b: [u8; 16] = rand_bytes().unwrap();
        assert_ne!(a, b);
        let key = generate_srtp_key().unwrap();
        assert_eq!(key.len(), 40);
    }

    #[test]
    fn test_empty_candidates_fall_back_to_host() {
        let creds = IceCredentials::generate().unwrap();
        let section = local_section(
            MediaKind::Audio,
            MediaDirection::SendRecv,
            "192.168.1.9".parse().unwrap(),
            41000,
            &creds,
            &[],
        )
        .unwrap();
        assert_eq!(section.candidates.len(), 1);
        assert_eq!(section.candidates[0].port, 41000);
    }
}
