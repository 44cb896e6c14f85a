//! UDP peer transport: one socket, ICE host/srflx gathering, SDP rendering.
//!
//! Media packet flow itself is outside the call engine; this transport owns
//! the socket whose addresses are advertised and records what the remote
//! description announces.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ice::{self, IceCandidate};
use super::media::{MediaTrack, TrackKind};
use super::negotiation::{
    GatherEvent, NegotiationError, PeerTransport, RemoteTrack, SdpType, TransportFactory,
};
use super::sdp::{self, IceCredentials, MediaDirection, MediaKind, SessionDescription};

pub struct UdpPeerTransport {
    socket: Arc<UdpSocket>,
    local_ip: IpAddr,
    credentials: IceCredentials,
    stun_servers: Vec<String>,
    sends_audio: bool,
    sends_video: bool,
    remote: Option<SessionDescription>,
    gather_task: Option<JoinHandle<()>>,
    closed: bool,
}

impl UdpPeerTransport {
    /// Bind an ephemeral UDP port on all interfaces.
    pub async fn bind(stun_servers: Vec<String>) -> Result<Self, NegotiationError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NegotiationError::Transport(format!("UDP bind failed: {}", e)))?;
        let credentials = IceCredentials::generate()
            .map_err(|e| NegotiationError::Transport(format!("{:#}", e)))?;
        let transport = Self {
            socket: Arc::new(socket),
            local_ip: ice::local_ip(),
            credentials,
            stun_servers,
            sends_audio: false,
            sends_video: false,
            remote: None,
            gather_task: None,
            closed: false,
        };
        tracing::debug!("UDP transport bound on {:?}", transport.local_addr());
        Ok(transport)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn sends(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.sends_audio,
            MediaKind::Video => self.sends_video,
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }
}

impl PeerTransport for UdpPeerTransport {
    fn add_track(&mut self, track: &MediaTrack) {
        match track.kind() {
            TrackKind::Audio => self.sends_audio = true,
            TrackKind::Video => self.sends_video = true,
        }
    }

    fn apply_remote(
        &mut self,
        sdp_type: SdpType,
        blob: &str,
    ) -> Result<Vec<RemoteTrack>, NegotiationError> {
        self.ensure_open()?;
        let description = SessionDescription::parse(blob)
            .map_err(|e| NegotiationError::InvalidDescription(format!("{:#}", e)))?;

        let tracks = description
            .sections
            .iter()
            .filter(|s| s.direction.sends())
            .map(|s| RemoteTrack {
                id: format!("{}-{}", s.kind.as_str(), s.ice_ufrag),
                kind: match s.kind {
                    MediaKind::Audio => TrackKind::Audio,
                    MediaKind::Video => TrackKind::Video,
                },
            })
            .collect();
        tracing::debug!(
            "Applied remote {:?} with {} sections",
            sdp_type,
            description.sections.len()
        );
        self.remote = Some(description);
        Ok(tracks)
    }

    fn start_gathering(&mut self) -> mpsc::UnboundedReceiver<GatherEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = match self.socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Cannot read local socket address: {}", e);
                let _ = tx.send(GatherEvent::Complete);
                return rx;
            }
        };
        for candidate in ice::gather_host_candidates(local) {
            let _ = tx.send(GatherEvent::Candidate(candidate));
        }

        let socket = self.socket.clone();
        let servers = self.stun_servers.clone();
        let task = tokio::spawn(async move {
            // Replies share the media socket, so servers are queried in turn.
            for server in &servers {
                if let Some(candidate) = ice::gather_srflx_candidate(&socket, server).await {
                    if tx.send(GatherEvent::Candidate(candidate)).is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(GatherEvent::Complete);
        });
        if let Some(previous) = self.gather_task.replace(task) {
            previous.abort();
        }
        rx
    }

    fn render_local(
        &mut self,
        sdp_type: SdpType,
        candidates: &[IceCandidate],
    ) -> Result<String, NegotiationError> {
        self.ensure_open()?;
        let port = self
            .socket
            .local_addr()
            .map_err(|e| NegotiationError::Transport(e.to_string()))?
            .port();

        let plan: Vec<(MediaKind, MediaDirection)> = match sdp_type {
            // Both kinds are always offered so the peer may send either.
            SdpType::Offer => [MediaKind::Audio, MediaKind::Video]
                .into_iter()
                .map(|k| (k, MediaDirection::for_offer(self.sends(k))))
                .collect(),
            SdpType::Answer => {
                let remote = self.remote.as_ref().ok_or(NegotiationError::InvalidState {
                    operation: "answer without a remote offer",
                    state: super::negotiation::NegotiationState::Stable,
                })?;
                remote
                    .sections
                    .iter()
                    .map(|s| (s.kind, MediaDirection::for_answer(self.sends(s.kind), s.direction)))
                    .collect()
            }
        };

        let sections = plan
            .into_iter()
            .map(|(kind, direction)| {
                sdp::local_section(kind, direction, self.local_ip, port, &self.credentials, candidates)
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| NegotiationError::Transport(format!("{:#}", e)))?;

        Ok(SessionDescription {
            address: self.local_ip.to_string(),
            sections,
        }
        .to_sdp())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.gather_task.take() {
            task.abort();
        }
        tracing::debug!("UDP transport closed");
    }
}

impl Drop for UdpPeerTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates a `UdpPeerTransport` per negotiation.
pub struct UdpTransportFactory {
    stun_servers: Vec<String>,
}

impl UdpTransportFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }
}

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn create(&self) -> Result<Box<dyn PeerTransport>, NegotiationError> {
        Ok(Box::new(UdpPeerTransport::bind(self.stun_servers.clone()).await?))
    }
}
