//! Peer discovery via UDP multicast
//!
//! Each participant joins a fixed multicast group and periodically sends a
//! HELLO datagram carrying a random per-process id and an optional display
//! name. The listener parses incoming datagrams, drops its own (the
//! broadcaster shares the process), and reports foreign peers through a
//! broadcast channel and the shared [`PeerDirectory`].

use crate::peer::{PeerDirectory, PeerInfo};
use crate::protocol::{
    encode_presence, parse_presence, DISCOVERY_PORT, MAX_PRESENCE_LEN, MULTICAST_GROUP,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, trace};
use uuid::Uuid;

/// Discovery-related errors
#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    /// The interface-selection collaborator found no usable adapter.
    #[error("no usable network interface for multicast discovery")]
    NoInterface,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket error: {0}")]
    Socket(String),
}

/// Events emitted by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A HELLO from another host was received. One event per datagram;
    /// dedup happens in the [`PeerDirectory`], not here.
    PeerSeen(PeerInfo),
}

/// Configuration for the discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group to join (default `224.0.0.1`).
    pub group: Ipv4Addr,

    /// UDP port to listen and announce on (default 8888).
    pub port: u16,

    /// Local address of the interface to join the group on, chosen by the
    /// caller (first non-loopback, multicast-capable, IPv4-bearing
    /// interface is the usual pick). `None` means no adapter qualified
    /// and makes [`DiscoveryService::start`] fail.
    pub interface: Option<Ipv4Addr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: MULTICAST_GROUP,
            port: DISCOVERY_PORT,
            interface: None,
        }
    }
}

/// Joins the multicast group, announces this host, and reports foreign
/// peers. Owns the per-process sender id and the peer directory.
pub struct DiscoveryService {
    sender_id: Uuid,
    config: DiscoveryConfig,
    local_name: Arc<RwLock<Option<String>>>,
    peers: Arc<PeerDirectory>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            sender_id: Uuid::new_v4(),
            config,
            local_name: Arc::new(RwLock::new(None)),
            peers: Arc::new(PeerDirectory::new()),
            event_tx,
            shutdown_tx: None,
        }
    }

    /// Random id identifying this process in HELLO datagrams.
    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    /// Subscribe to discovered-peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Shared handle to the directory of known peers.
    pub fn peers(&self) -> Arc<PeerDirectory> {
        self.peers.clone()
    }

    /// Set the display name announced in future HELLOs. Empty and
    /// whitespace-only clear it.
    pub fn set_local_name(&self, name: Option<&str>) {
        let normalized = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        *self.local_name.write().expect("local name lock poisoned") = normalized;
    }

    /// Start the listener loop. Returns the bound address; binding or
    /// joining the group failing is fatal, per-datagram errors are not.
    pub async fn start(&mut self) -> Result<SocketAddr, DiscoveryError> {
        let interface = self.config.interface.ok_or(DiscoveryError::NoInterface)?;

        let socket = bind_multicast(self.config.group, self.config.port, interface)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;

        info!(
            "discovery listening on {} (group {})",
            local_addr, self.config.group
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let my_id = self.sender_id.to_string();
        let peers = self.peers.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PRESENCE_LEN];

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("discovery listener shutting down");
                        break;
                    }

                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, from)) => {
                                handle_datagram(&buf[..len], from, &my_id, &peers, &event_tx);
                            }
                            Err(e) => {
                                error!("failed to receive presence datagram: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop the listener loop. The receive side is parked in `select!`,
    /// so this never hangs on a blocked read.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Send exactly one HELLO to the group. No internal scheduling;
    /// invoke this every [`crate::protocol::BROADCAST_INTERVAL`] for as
    /// long as the host wants to be discoverable.
    pub async fn broadcast_once(&self) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

        let name = self
            .local_name
            .read()
            .expect("local name lock poisoned")
            .clone();
        let payload = encode_presence(&self.sender_id, name.as_deref());

        socket
            .send_to(payload.as_bytes(), (self.config.group, self.config.port))
            .await?;
        trace!("announced presence ({} bytes)", payload.len());

        Ok(())
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create the group-joined UDP socket for the listener.
fn bind_multicast(
    group: Ipv4Addr,
    port: u16,
    interface: Ipv4Addr,
) -> Result<Socket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    // Allow several participants on one host.
    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .map_err(|e| DiscoveryError::Socket(format!("failed to bind port {}: {}", port, e)))?;

    socket
        .join_multicast_v4(&group, &interface)
        .map_err(|e| DiscoveryError::Socket(format!("failed to join {}: {}", group, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;

    Ok(socket)
}

/// Handle one received datagram. Malformed payloads and our own HELLOs
/// are dropped without an event.
fn handle_datagram(
    data: &[u8],
    from: SocketAddr,
    my_id: &str,
    peers: &PeerDirectory,
    event_tx: &broadcast::Sender<DiscoveryEvent>,
) {
    let Some(presence) = parse_presence(data) else {
        trace!("ignoring non-HELLO datagram from {}", from);
        return;
    };

    if presence.sender_id == my_id {
        trace!("ignoring our own presence datagram");
        return;
    }

    let peer = PeerInfo::new(from.ip(), presence.name.as_deref());
    let is_new = peers.upsert(peer.address, presence.name.as_deref());
    if is_new {
        info!("discovered peer {}", peer);
    } else {
        debug!("peer {} seen again", peer.address);
    }

    // Nobody listening is fine; the directory already recorded the peer.
    let _ = event_tx.send(DiscoveryEvent::PeerSeen(peer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            group: MULTICAST_GROUP,
            // Ephemeral port so parallel tests do not collide.
            port: 0,
            interface: Some(Ipv4Addr::UNSPECIFIED),
        }
    }

    async fn recv_event(
        rx: &mut broadcast::Receiver<DiscoveryEvent>,
    ) -> Option<DiscoveryEvent> {
        timeout(Duration::from_secs(2), rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn missing_interface_is_fatal_at_start() {
        let mut service = DiscoveryService::new(DiscoveryConfig::default());
        assert!(matches!(
            service.start().await,
            Err(DiscoveryError::NoInterface)
        ));
    }

    #[tokio::test]
    async fn listener_suppresses_self_and_tolerates_garbage() {
        let mut service = DiscoveryService::new(test_config());
        let my_id = service.sender_id();
        let mut events = service.subscribe();
        let bound = service.start().await.unwrap();

        let target = SocketAddr::from(([127, 0, 0, 1], bound.port()));
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();

        // Garbage, a tag-only HELLO, and our own id: none may surface.
        sender.send_to(b"unrelated traffic", target).await.unwrap();
        sender.send_to(b"HELLO", target).await.unwrap();
        sender
            .send_to(encode_presence(&my_id, Some("me")).as_bytes(), target)
            .await
            .unwrap();

        // A foreign HELLO must surface exactly once, name decoded.
        let foreign = Uuid::new_v4();
        sender
            .send_to(encode_presence(&foreign, Some("Föreign Päl")).as_bytes(), target)
            .await
            .unwrap();

        let event = recv_event(&mut events).await.expect("no event received");
        let DiscoveryEvent::PeerSeen(peer) = event;
        assert_eq!(peer.address, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(peer.name.as_deref(), Some("Föreign Päl"));

        // The loop must still be alive after the garbage; nothing else queued.
        assert_eq!(service.peers().len(), 1);
        service.stop();
    }

    #[tokio::test]
    async fn nameless_hello_keeps_known_name() {
        let mut service = DiscoveryService::new(test_config());
        let mut events = service.subscribe();
        let bound = service.start().await.unwrap();

        let target = SocketAddr::from(([127, 0, 0, 1], bound.port()));
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let foreign = Uuid::new_v4();

        sender
            .send_to(encode_presence(&foreign, Some("Named")).as_bytes(), target)
            .await
            .unwrap();
        recv_event(&mut events).await.expect("first event");

        sender
            .send_to(encode_presence(&foreign, None).as_bytes(), target)
            .await
            .unwrap();
        recv_event(&mut events).await.expect("second event");

        let peer = service.peers().get(IpAddr::from([127, 0, 0, 1])).unwrap();
        assert_eq!(peer.name.as_deref(), Some("Named"));
        service.stop();
    }

    #[tokio::test]
    async fn stop_does_not_hang() {
        let mut service = DiscoveryService::new(test_config());
        service.start().await.unwrap();
        timeout(Duration::from_secs(1), async {
            service.stop();
        })
        .await
        .unwrap();
    }
}
