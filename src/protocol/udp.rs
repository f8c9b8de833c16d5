//! UDP protocol adapter: unreliable, message-oriented, no multistreaming.
//!
//! Client connections keep their socket unconnected so a per-send remote
//! endpoint override can redirect individual datagrams. The listen path
//! shares one bound socket between the Listener and every accepted
//! Connection: a demultiplexing receive loop routes each datagram to the
//! Connection for its source address, creating the Connection (and firing
//! `connection_received`) on first contact.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, trace, warn};

use super::{
    client_bind_addr, Delivery, EstablishedTransport, ListenerTransport, ProtocolAdapter,
    ProtocolCapabilities, ProtocolSocket,
};
use crate::connection::Connection;
use crate::defaults;
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::{Result, TapsError};
use crate::listener::Listener;
use crate::message::MessageContext;
use crate::runtime;
use crate::security::SecurityParameters;
use crate::socket_manager::SocketManager;

static CAPABILITIES: ProtocolCapabilities = ProtocolCapabilities {
    name: "udp",
    reliability: false,
    preserve_order: false,
    preserve_msg_boundaries: true,
    multistreaming: false,
    congestion_control: false,
    message_oriented: true,
    supports_ipv4: true,
    supports_ipv6: true,
};

pub struct UdpAdapter;

#[async_trait(?Send)]
impl ProtocolAdapter for UdpAdapter {
    fn capabilities(&self) -> &'static ProtocolCapabilities {
        &CAPABILITIES
    }

    async fn connect(
        &self,
        remote: &RemoteEndpoint,
        local: Option<&LocalEndpoint>,
        _security: &SecurityParameters,
    ) -> Result<EstablishedTransport> {
        let remote_addr = remote
            .resolved_address()
            .ok_or(TapsError::InvalidArgument("remote endpoint is unresolved"))?;

        let socket = Rc::new(UdpSocket::bind(client_bind_addr(remote_addr, local)).await?);
        debug!(
            "UDP socket bound on {} towards {}",
            socket.local_addr()?,
            remote_addr
        );

        let manager = SocketManager::new("udp", Box::new(Rc::clone(&socket)));
        let io = Rc::new(UdpClientSocket {
            socket,
            remote: remote_addr,
        });
        Ok(EstablishedTransport {
            socket: io,
            manager,
        })
    }

    async fn listen(
        &self,
        local: &LocalEndpoint,
        listener: &Rc<Listener>,
    ) -> Result<ListenerTransport> {
        let bind_addr = local
            .resolved_address()
            .ok_or(TapsError::InvalidArgument("local endpoint is unresolved"))?;

        let socket = Rc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        debug!("UDP listener bound on {}", local_addr);

        let manager = SocketManager::new("udp", Box::new(Rc::clone(&socket)));
        let accept_task = runtime::spawn(demux_loop(
            socket,
            Rc::clone(&manager),
            Rc::downgrade(listener),
            local_addr,
        ));

        Ok(ListenerTransport {
            manager,
            local_addr,
            accept_task,
        })
    }
}

/// Route inbound datagrams to per-peer Connections, spawning a new
/// multiplexed Connection on first contact from an address.
async fn demux_loop(
    socket: Rc<UdpSocket>,
    manager: Rc<SocketManager>,
    listener: std::rc::Weak<Listener>,
    local_addr: SocketAddr,
) {
    let mut peers: HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; defaults::RECV_BUFFER_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("UDP listener receive failed: {}", e);
                break;
            }
        };
        let payload = buf[..len].to_vec();

        if let Some(inbound) = peers.get(&from) {
            if inbound.send(payload).is_ok() {
                continue;
            }
            // The connection for this peer is gone; forget it.
            trace!("dropping datagram from closed peer {}", from);
            peers.remove(&from);
            continue;
        }

        let Some(listener_rc) = listener.upgrade() else {
            break;
        };

        debug!("UDP listener accepted new peer {}", from);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let io = Rc::new(UdpPeerSocket {
            socket: Rc::clone(&socket),
            peer: from,
            inbound: Mutex::new(inbound_rx),
        });
        let conn = Connection::accept_multiplexed(
            &listener_rc,
            io,
            &manager,
            RemoteEndpoint::from_socket_addr(from),
            LocalEndpoint::from_socket_addr(local_addr),
        );
        listener_rc.deliver_connection(conn);

        // Deliver the datagram that created the connection.
        let _ = inbound_tx.send(payload);
        peers.insert(from, inbound_tx);
    }
}

/// Client-side UDP socket with a default remote, honoring per-send
/// endpoint overrides.
struct UdpClientSocket {
    socket: Rc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpClientSocket {
    fn target_for(&self, ctx: &MessageContext) -> SocketAddr {
        match &ctx.remote_endpoint {
            Some(endpoint) => match endpoint.resolved_address() {
                Some(addr) => addr,
                None => {
                    warn!("ignoring unresolved per-send remote endpoint override");
                    self.remote
                }
            },
            None => self.remote,
        }
    }
}

#[async_trait(?Send)]
impl ProtocolSocket for UdpClientSocket {
    async fn send(&self, payload: &[u8], ctx: &MessageContext) -> Result<()> {
        let target = self.target_for(ctx);
        let sent = self.socket.send_to(payload, target).await?;
        if sent != payload.len() {
            return Err(TapsError::SendFailed(format!(
                "datagram truncated: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        let mut buf = vec![0u8; defaults::RECV_BUFFER_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.remote {
                trace!("discarding datagram from unexpected peer {}", from);
                continue;
            }
            return Ok(Delivery::Message(buf[..len].to_vec()));
        }
    }

    async fn close(&self) -> Result<()> {
        // Datagram sockets have no shutdown handshake; the handle closes
        // with the socket manager.
        Ok(())
    }

    fn abort(&self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

/// Accept-side UDP socket: shares the listener's socket for sends, reads
/// from the demultiplexer's per-peer queue.
struct UdpPeerSocket {
    socket: Rc<UdpSocket>,
    peer: SocketAddr,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait(?Send)]
impl ProtocolSocket for UdpPeerSocket {
    async fn send(&self, payload: &[u8], ctx: &MessageContext) -> Result<()> {
        let target = match &ctx.remote_endpoint {
            Some(endpoint) => endpoint.resolved_address().unwrap_or(self.peer),
            None => self.peer,
        };
        self.socket.send_to(payload, target).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        match self.inbound.lock().await.recv().await {
            Some(payload) => Ok(Delivery::Message(payload)),
            // The demultiplexer is gone: the listener stopped.
            None => Ok(Delivery::Eof),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn abort(&self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
