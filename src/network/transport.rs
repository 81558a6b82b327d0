use log::{debug, warn};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{GossipPacket, InboundPacket, Outbound, PeerAddress, SharedPeers, MAX_PACKET_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: PeerAddress,
        source: std::io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// UDP socket shared by a receive task and a send task
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: PeerAddress,
}

pub struct TransportTasks {
    pub receiver: JoinHandle<()>,
    pub sender: JoinHandle<()>,
}

impl TransportTasks {
    pub fn abort(&self) {
        self.receiver.abort();
        self.sender.abort();
    }
}

impl UdpTransport {
    pub async fn bind(address: PeerAddress) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(address.socket_addr())
            .await
            .map_err(|source| TransportError::Bind { address, source })?;
        // port 0 resolves to whatever the OS picked
        let local = PeerAddress::from(socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local
    }

    /// Starts both directions. Inbound datagrams are decoded and queued on `inbound`;
    /// `outbound` requests are encoded and sent, broadcasts expanded over `peers`.
    pub fn spawn(
        self,
        peers: SharedPeers,
        inbound: mpsc::Sender<InboundPacket>,
        outbound: mpsc::Receiver<Outbound>,
    ) -> TransportTasks {
        let receiver = tokio::spawn(receive_loop(self.socket.clone(), self.local, inbound));
        let sender = tokio::spawn(send_loop(self.socket, self.local, peers, outbound));
        TransportTasks { receiver, sender }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    local: PeerAddress,
    inbound: mpsc::Sender<InboundPacket>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("{}: receive failed: {}", local, e);
                continue;
            }
        };
        let packet = match GossipPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{}: dropping packet from {}: {}", local, from, e);
                continue;
            }
        };
        let inbound_packet = InboundPacket {
            from: PeerAddress::from(from),
            packet,
        };
        if inbound.send(inbound_packet).await.is_err() {
            debug!("{}: inbound queue closed, receiver exiting", local);
            break;
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    local: PeerAddress,
    peers: SharedPeers,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(request) = outbound.recv().await {
        let (packet, targets) = match request {
            Outbound::Unicast { to, packet } => (packet, vec![to]),
            Outbound::Broadcast { packet, exclude } => {
                let targets: Vec<PeerAddress> = peers
                    .read()
                    .await
                    .iter()
                    .filter(|peer| Some(**peer) != exclude && **peer != local)
                    .copied()
                    .collect();
                (packet, targets)
            }
        };

        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}: cannot encode {} packet: {}", local, packet.kind(), e);
                continue;
            }
        };
        for target in targets {
            if let Err(e) = socket.send_to(&bytes, target.socket_addr()).await {
                debug!("{}: send to {} failed: {}", local, target, e);
            }
        }
    }
    debug!("{}: outbound queue closed, sender exiting", local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{PeerSet, RumorMessage};
    use std::time::Duration;

    fn loopback() -> PeerAddress {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_unicast_and_broadcast_between_sockets() {
        let a = UdpTransport::bind(loopback()).await.unwrap();
        let b = UdpTransport::bind(loopback()).await.unwrap();
        let a_addr = a.local_address();
        let b_addr = b.local_address();
        assert_ne!(a_addr.socket_addr().port(), 0);

        let (a_in_tx, _a_in_rx) = mpsc::channel(8);
        let (a_out_tx, a_out_rx) = mpsc::channel(8);
        let a_tasks = a.spawn(PeerSet::from_peers(vec![b_addr]).shared(), a_in_tx, a_out_rx);

        let (b_in_tx, mut b_in_rx) = mpsc::channel(8);
        let (_b_out_tx, b_out_rx) = mpsc::channel(8);
        let b_tasks = b.spawn(PeerSet::new().shared(), b_in_tx, b_out_rx);

        let rumor = GossipPacket::Rumor(RumorMessage::new("a", 1, "hello"));
        a_out_tx
            .send(Outbound::Unicast {
                to: b_addr,
                packet: rumor.clone(),
            })
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), b_in_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, a_addr);
        assert_eq!(got.packet, rumor);

        a_out_tx
            .send(Outbound::Broadcast {
                packet: rumor.clone(),
                exclude: None,
            })
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), b_in_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.packet, rumor);

        a_tasks.abort();
        b_tasks.abort();
    }

    #[tokio::test]
    async fn test_garbage_datagrams_are_dropped() {
        let b = UdpTransport::bind(loopback()).await.unwrap();
        let b_addr = b.local_address();
        let (b_in_tx, mut b_in_rx) = mpsc::channel(8);
        let (_b_out_tx, b_out_rx) = mpsc::channel(8);
        let tasks = b.spawn(PeerSet::new().shared(), b_in_tx, b_out_rx);

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"{}", b_addr.socket_addr()).await.unwrap();
        let valid = GossipPacket::Rumor(RumorMessage::new("x", 1, "ok"));
        raw.send_to(&valid.encode().unwrap(), b_addr.socket_addr())
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), b_in_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.packet, valid);
        tasks.abort();
    }
}
