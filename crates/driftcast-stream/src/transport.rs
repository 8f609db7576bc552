//! # Packet Transports
//!
//! Concrete [`PacketTransport`]s: a connected UDP socket for real links and
//! an in-process channel for loopback and tests.

use bytes::Bytes;
use crossbeam_channel::Sender;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::warn;

use crate::pool::PooledPacket;
use crate::sender::PacketTransport;
use crate::wire::QualityFeedback;

/// Sends packets on a UDP socket connected to the client.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    send_errors: u64,
}

impl UdpTransport {
    /// Bind `local` and connect to `peer`.
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        Ok(UdpTransport {
            socket,
            peer,
            send_errors: 0,
        })
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket) -> io::Result<Self> {
        let peer = socket.peer_addr()?;
        Ok(UdpTransport {
            socket,
            peer,
            send_errors: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A second handle on the socket for reading client feedback.
    pub fn feedback_listener(&self, poll: Duration) -> io::Result<FeedbackListener> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(poll))?;
        Ok(FeedbackListener { socket })
    }
}

impl PacketTransport for UdpTransport {
    fn send_packet(&mut self, packet: PooledPacket) -> io::Result<()> {
        match self.socket.send(&packet) {
            Ok(_) => Ok(()),
            // The client is not listening yet; keep streaming.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                self.send_errors += 1;
                if self.send_errors.is_power_of_two() {
                    warn!(peer = %self.peer, refused = self.send_errors, "peer refused packets");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Reads [`QualityFeedback`] messages arriving on a stream's socket.
pub struct FeedbackListener {
    socket: UdpSocket,
}

impl FeedbackListener {
    /// Wait up to the poll interval for one feedback message. Datagrams that
    /// are not feedback are ignored.
    pub fn poll(&self) -> io::Result<Option<QualityFeedback>> {
        let mut buf = [0u8; 64];
        match self.socket.recv(&mut buf) {
            Ok(n) => Ok(QualityFeedback::decode(&mut &buf[..n])),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Forwards packet bytes over a crossbeam channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: Sender<Bytes>,
}

impl ChannelTransport {
    pub fn new(tx: Sender<Bytes>) -> Self {
        ChannelTransport { tx }
    }
}

impl PacketTransport for ChannelTransport {
    fn send_packet(&mut self, packet: PooledPacket) -> io::Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(&packet))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketBufferPool;
    use bytes::BufMut;

    fn packet(pool: &PacketBufferPool, body: &[u8]) -> PooledPacket {
        let mut p = pool.acquire();
        p.put_slice(body);
        p
    }

    #[test]
    fn udp_loopback_delivers_packets() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut transport =
            UdpTransport::connect("127.0.0.1:0".parse().unwrap(), client.local_addr().unwrap())
                .unwrap();
        let pool = PacketBufferPool::new(1200, 4);
        transport.send_packet(packet(&pool, b"hello")).unwrap();

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        // Buffer went back to the pool.
        assert_eq!(pool.stats().cached, 1);
    }

    #[test]
    fn feedback_listener_decodes_messages() {
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let transport =
            UdpTransport::connect("127.0.0.1:0".parse().unwrap(), client.local_addr().unwrap())
                .unwrap();
        let listener = transport
            .feedback_listener(Duration::from_millis(500))
            .unwrap();
        client.connect(transport.local_addr().unwrap()).unwrap();

        let mut msg = Vec::new();
        QualityFeedback {
            dropped_frames: 3,
            buffer_health: 0.25,
        }
        .encode(&mut msg);
        client.send(&msg).unwrap();

        let fb = listener.poll().unwrap().unwrap();
        assert_eq!(fb.dropped_frames, 3);
        assert!(fb.indicates_loss());

        client.send(b"noise").unwrap();
        assert_eq!(listener.poll().unwrap(), None);
    }

    #[test]
    fn channel_transport_reports_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut transport = ChannelTransport::new(tx);
        let pool = PacketBufferPool::new(1200, 4);
        transport.send_packet(packet(&pool, b"abc")).unwrap();
        assert_eq!(rx.recv().unwrap(), Bytes::from_static(b"abc"));
        drop(rx);
        assert!(transport.send_packet(packet(&pool, b"x")).is_err());
    }
}
