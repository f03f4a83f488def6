use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::{DEFAULT_CHANNEL_CAPACITY, Transport, TransportEvent};
use crate::codec::MAX_DATAGRAM_SIZE;
use crate::error::{Error, Result};

/// UDP transport for RAS datagrams
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    shutdown: CancellationToken,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Creates a new UDP transport bound to the specified address
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| Error::BindFailed { addr, source })?;
        Self::from_socket(socket, channel_capacity)
    }

    /// Binds the gatekeeper discovery listener: the wildcard address on
    /// `port`, joined to `group` on `interface`.
    pub async fn bind_multicast(
        group: Ipv4Addr,
        port: u16,
        interface: Ipv4Addr,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let bind_err = |source| Error::BindFailed { addr, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.join_multicast_v4(&group, &interface).map_err(bind_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;
        info!("RAS discovery listener joined {} on port {}", group, port);
        Self::from_socket(socket, channel_capacity)
    }

    fn from_socket(
        socket: UdpSocket,
        channel_capacity: Option<usize>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let capacity = channel_capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);

        let local_addr = socket.local_addr()?;
        info!("RAS UDP transport bound to {}", local_addr);

        let transport = UdpTransport {
            inner: Arc::new(UdpTransportInner {
                socket: Arc::new(socket),
                local_addr,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events_tx,
            }),
        };

        transport.spawn_receive_loop();

        Ok((transport, events_rx))
    }

    // Spawns the task that reads datagrams from the socket
    fn spawn_receive_loop(&self) {
        let transport = self.clone();

        tokio::spawn(async move {
            let inner = &transport.inner;
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                let result = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    result = inner.socket.recv_from(&mut buf) => result,
                };

                match result {
                    Ok((len, source)) => {
                        trace!("Received {} byte datagram from {}", len, source);
                        let event = TransportEvent::DatagramReceived {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source,
                            destination: inner.local_addr,
                        };
                        if inner.events_tx.send(event).await.is_err() {
                            debug!("Event receiver dropped, stopping UDP receive loop");
                            break;
                        }
                    }
                    Err(e) => {
                        if inner.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        // ICMP port unreachable surfaces here on some platforms
                        error!("Error receiving UDP datagram: {}", e);
                        let _ = inner
                            .events_tx
                            .send(TransportEvent::Error {
                                error: format!("Error receiving datagram: {}", e),
                            })
                            .await;
                    }
                }
            }

            let _ = inner.events_tx.send(TransportEvent::Closed).await;
            info!("UDP receive loop on {} terminated", inner.local_addr);
        });
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        trace!("Sending {} byte datagram to {}", data.len(), destination);
        self.inner
            .socket
            .send_to(data, destination)
            .await
            .map_err(|e| Error::send_failed(destination, e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.shutdown.cancel();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local_addr)
    }
}
