//! TCP protocol adapter: reliable, ordered byte stream.
//!
//! Deliveries are boundary-less chunks; when the application requires
//! message boundaries the Connection layer adds length-prefixed framing on
//! top of this stream. Abort arms `SO_LINGER(0)` on a cloned handle so the
//! eventual close emits an RST instead of an orderly FIN.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{
    Delivery, EstablishedTransport, ListenerTransport, ProtocolAdapter, ProtocolCapabilities,
    ProtocolSocket,
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
    name: "tcp",
    reliability: true,
    preserve_order: true,
    preserve_msg_boundaries: false,
    multistreaming: false,
    congestion_control: true,
    message_oriented: false,
    supports_ipv4: true,
    supports_ipv6: true,
};

pub struct TcpAdapter;

#[async_trait(?Send)]
impl ProtocolAdapter for TcpAdapter {
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

        let socket = match remote_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(local_addr) = local.and_then(LocalEndpoint::resolved_address) {
            if local_addr.is_ipv4() == remote_addr.is_ipv4() {
                socket.bind(local_addr)?;
            }
        }

        let stream = socket.connect(remote_addr).await?;
        debug!("TCP connected to {}", remote_addr);

        let io = TcpStreamSocket::wrap(stream)?;
        let manager = SocketManager::new("tcp", Box::new(Rc::clone(&io)));
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

        let socket = Rc::new(TcpListener::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        debug!("TCP listener bound on {}", local_addr);

        let manager = SocketManager::new("tcp", Box::new(Rc::clone(&socket)));
        let accept_task = runtime::spawn(accept_loop(
            socket,
            Rc::clone(&manager),
            Rc::downgrade(listener),
        ));

        Ok(ListenerTransport {
            manager,
            local_addr,
            accept_task,
        })
    }
}

async fn accept_loop(
    socket: Rc<TcpListener>,
    manager: Rc<SocketManager>,
    listener: std::rc::Weak<Listener>,
) {
    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("TCP accept failed: {}", e);
                if let Some(listener_rc) = listener.upgrade() {
                    listener_rc.dispatch_establishment_error(&TapsError::Io(e));
                }
                break;
            }
        };
        let Some(listener_rc) = listener.upgrade() else {
            break;
        };
        debug!("TCP listener accepted connection from {}", peer);

        let local_addr = stream.local_addr().ok();
        let io = match TcpStreamSocket::wrap(stream) {
            Ok(io) => io,
            Err(e) => {
                error!("failed to set up accepted TCP stream: {}", e);
                continue;
            }
        };
        let conn = Connection::accept_multiplexed(
            &listener_rc,
            io,
            &manager,
            RemoteEndpoint::from_socket_addr(peer),
            local_addr.map(LocalEndpoint::from_socket_addr).unwrap_or_default(),
        );
        listener_rc.deliver_connection(conn);
    }
}

/// An established TCP stream split into concurrently-usable halves, plus a
/// cloned std handle used for socket options the split halves cannot reach.
struct TcpStreamSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    control: std::net::TcpStream,
}

impl TcpStreamSocket {
    fn wrap(stream: TcpStream) -> Result<Rc<Self>> {
        stream.set_nodelay(true)?;

        // Clone the std handle before splitting; it shares the fd and
        // stays available for abort-time linger configuration.
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;

        let (reader, writer) = stream.into_split();
        Ok(Rc::new(TcpStreamSocket {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control,
        }))
    }
}

#[async_trait(?Send)]
impl ProtocolSocket for TcpStreamSocket {
    async fn send(&self, payload: &[u8], _ctx: &MessageContext) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await.map_err(TapsError::from_io)?;
        writer.flush().await.map_err(TapsError::from_io)?;
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery> {
        let mut buf = vec![0u8; defaults::RECV_BUFFER_SIZE];
        let len = self
            .reader
            .lock()
            .await
            .read(&mut buf)
            .await
            .map_err(TapsError::from_io)?;
        if len == 0 {
            return Ok(Delivery::Eof);
        }
        buf.truncate(len);
        Ok(Delivery::Chunk(buf))
    }

    async fn close(&self) -> Result<()> {
        // Half-close: FIN after all written data.
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TapsError::from_io)?;
        Ok(())
    }

    fn abort(&self) {
        // Linger(0) turns the eventual handle close into an RST.
        let sock = socket2::SockRef::from(&self.control);
        if let Err(e) = sock.set_linger(Some(Duration::from_secs(0))) {
            debug!("failed to arm linger for abort: {}", e);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr().ok()
    }
}
