//! # Protocol Adapter Abstraction and Implementations
//!
//! This module provides the unified abstraction layer over concrete
//! transport protocols, enabling the candidate-racing engine and the
//! Connection state machine to work against one interface regardless of
//! which protocol wins establishment.
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │  Racing engine  │───▶│ ProtocolAdapter  │───▶│    Specific     │
//! │  / Connection   │    │ ProtocolSocket   │    │ implementation  │
//! │  state machine  │    │  (abstraction)   │    │ (UDP/TCP/QUIC)  │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! Two traits split the protocol surface:
//!
//! - [`ProtocolAdapter`]: a registered, stateless entry point per protocol.
//!   Its static [`ProtocolCapabilities`] descriptor feeds candidate
//!   filtering and ranking; `connect` drives client establishment and
//!   `listen` binds the accept path.
//! - [`ProtocolSocket`]: the per-connection I/O surface produced by
//!   establishment. Message-oriented transports deliver whole messages;
//!   byte-stream transports deliver arbitrarily-sized chunks which the
//!   Connection layer frames when message boundaries are required.
//!
//! Adapters are registered once at `initialize`, in the fixed order
//! UDP → TCP → QUIC that breaks ranking ties.

use std::net::SocketAddr;
use std::rc::Rc;

use async_trait::async_trait;

use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::Result;
use crate::listener::Listener;
use crate::message::MessageContext;
use crate::properties::SelectionProperty;
use crate::security::SecurityParameters;
use crate::socket_manager::SocketManager;

pub mod quic;
pub mod tcp;
pub mod udp;

/// Static description of what a protocol offers, evaluated against the
/// selection properties during candidate gathering.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolCapabilities {
    pub name: &'static str,
    pub reliability: bool,
    pub preserve_order: bool,
    pub preserve_msg_boundaries: bool,
    pub multistreaming: bool,
    pub congestion_control: bool,
    /// Whole-message delivery (datagrams) versus a byte stream.
    pub message_oriented: bool,
    pub supports_ipv4: bool,
    pub supports_ipv6: bool,
}

impl ProtocolCapabilities {
    /// Whether the protocol provides the named selection property.
    pub fn provides(&self, property: SelectionProperty) -> bool {
        match property {
            SelectionProperty::Reliability => self.reliability,
            SelectionProperty::PreserveOrder => self.preserve_order,
            SelectionProperty::PreserveMsgBoundaries => self.preserve_msg_boundaries,
            SelectionProperty::Multistreaming => self.multistreaming,
            SelectionProperty::CongestionControl => self.congestion_control,
        }
    }

    pub fn supports_address(&self, addr: &SocketAddr) -> bool {
        match addr {
            SocketAddr::V4(_) => self.supports_ipv4,
            SocketAddr::V6(_) => self.supports_ipv6,
        }
    }
}

/// One delivery observed on a protocol socket.
#[derive(Debug)]
pub enum Delivery {
    /// A complete message from a message-oriented transport.
    Message(Vec<u8>),
    /// A boundary-less chunk from a byte-stream transport.
    Chunk(Vec<u8>),
    /// Orderly end of the peer's data.
    Eof,
}

/// Per-connection I/O surface of an established protocol stack.
///
/// Peer resets surface as `Err(TapsError::ConnectionReset)` from
/// [`receive`](Self::receive); an orderly shutdown is [`Delivery::Eof`].
#[async_trait(?Send)]
pub trait ProtocolSocket {
    /// Write one payload. The payload is already framed if the connection
    /// requires explicit message boundaries.
    async fn send(&self, payload: &[u8], ctx: &MessageContext) -> Result<()>;

    /// Wait for the next delivery.
    async fn receive(&self) -> Result<Delivery>;

    /// Graceful close: flush protocol-level state, signal end of data.
    async fn close(&self) -> Result<()>;

    /// Immediate termination (TCP: RST on handle close; QUIC:
    /// CONNECTION_CLOSE with an application error).
    fn abort(&self);

    /// The locally-bound address, once known.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Result of a successful client establishment.
pub struct EstablishedTransport {
    pub socket: Rc<dyn ProtocolSocket>,
    pub manager: Rc<SocketManager>,
}

/// Result of binding a listener: the shared socket manager, the concrete
/// bound address, and the accept-loop task (aborted when the listener
/// stops).
pub struct ListenerTransport {
    pub manager: Rc<SocketManager>,
    pub local_addr: SocketAddr,
    pub accept_task: tokio::task::JoinHandle<()>,
}

/// A registered protocol implementation.
#[async_trait(?Send)]
pub trait ProtocolAdapter {
    fn capabilities(&self) -> &'static ProtocolCapabilities;

    /// Establish towards a resolved remote endpoint, optionally binding a
    /// resolved local endpoint first.
    async fn connect(
        &self,
        remote: &RemoteEndpoint,
        local: Option<&LocalEndpoint>,
        security: &SecurityParameters,
    ) -> Result<EstablishedTransport>;

    /// Bind the resolved local endpoint and start accepting. Every inbound
    /// peer (or stream, for stream-of-streams protocols) becomes a
    /// multiplexed Connection delivered through the listener's callbacks.
    async fn listen(
        &self,
        local: &LocalEndpoint,
        listener: &Rc<Listener>,
    ) -> Result<ListenerTransport>;
}

/// The built-in adapters in registration order. Registration order is the
/// ranking tie-breaker, so it is part of the selection contract.
pub(crate) fn builtin_adapters() -> Vec<&'static dyn ProtocolAdapter> {
    vec![
        &udp::UdpAdapter as &'static dyn ProtocolAdapter,
        &tcp::TcpAdapter,
        &quic::QuicAdapter,
    ]
}

/// Pick the concrete bind address for a client socket: the resolved local
/// endpoint when its family matches the remote, otherwise an ephemeral
/// wildcard in the remote's family.
pub(crate) fn client_bind_addr(remote: SocketAddr, local: Option<&LocalEndpoint>) -> SocketAddr {
    if let Some(addr) = local.and_then(LocalEndpoint::resolved_address) {
        if addr.is_ipv4() == remote.is_ipv4() {
            return addr;
        }
    }
    match remote {
        SocketAddr::V4(_) => SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_order_is_udp_tcp_quic() {
        let adapters = builtin_adapters();
        let names: Vec<&str> = adapters
            .iter()
            .map(|a| a.capabilities().name)
            .collect();
        assert_eq!(names, vec!["udp", "tcp", "quic"]);
    }

    #[test]
    fn capability_descriptors_match_the_selection_contract() {
        let adapters = builtin_adapters();
        let udp = adapters[0].capabilities();
        let tcp = adapters[1].capabilities();
        let quic = adapters[2].capabilities();

        assert!(!udp.provides(SelectionProperty::Reliability));
        assert!(udp.provides(SelectionProperty::PreserveMsgBoundaries));
        assert!(!udp.provides(SelectionProperty::Multistreaming));
        assert!(udp.message_oriented);

        assert!(tcp.provides(SelectionProperty::Reliability));
        assert!(tcp.provides(SelectionProperty::PreserveOrder));
        assert!(!tcp.provides(SelectionProperty::PreserveMsgBoundaries));
        assert!(!tcp.provides(SelectionProperty::Multistreaming));
        assert!(!tcp.message_oriented);

        assert!(quic.provides(SelectionProperty::Reliability));
        assert!(quic.provides(SelectionProperty::PreserveOrder));
        assert!(quic.provides(SelectionProperty::Multistreaming));
        assert!(!quic.message_oriented);
    }

    #[test]
    fn client_bind_addr_matches_remote_family() {
        let remote_v4: SocketAddr = "203.0.113.9:443".parse().unwrap();
        let remote_v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();

        assert_eq!(
            client_bind_addr(remote_v4, None),
            "0.0.0.0:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            client_bind_addr(remote_v6, None),
            "[::]:0".parse::<SocketAddr>().unwrap()
        );

        let local = LocalEndpoint::from_socket_addr("127.0.0.1:9999".parse().unwrap());
        assert_eq!(
            client_bind_addr(remote_v4, Some(&local)),
            "127.0.0.1:9999".parse::<SocketAddr>().unwrap()
        );
        // Family mismatch falls back to the wildcard.
        assert_eq!(
            client_bind_addr(remote_v6, Some(&local)),
            "[::]:0".parse::<SocketAddr>().unwrap()
        );
    }
}
