//! QUIC protocol adapter, built on `quinn` over `rustls`.
//!
//! QUIC is the stream-of-streams protocol: a client connection maps to one
//! bidirectional stream on a QUIC connection, and on the listen path every
//! accepted bidirectional stream becomes its own multiplexed Connection
//! sharing the listener's endpoint through the socket manager.
//!
//! TLS material comes from the global configuration set at `initialize`:
//! the listener requires the certificate and key files; the client uses the
//! certificate file as its trust anchor when present and otherwise accepts
//! the peer's certificate unverified (suitable for closed test networks
//! only). The ALPN list carried in the security parameters is applied on
//! both sides.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio::sync::Mutex;
use tracing::{debug, trace};

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
use crate::runtime::{self, GlobalConfig};
use crate::security::SecurityParameters;
use crate::socket_manager::SocketManager;

static CAPABILITIES: ProtocolCapabilities = ProtocolCapabilities {
    name: "quic",
    reliability: true,
    preserve_order: true,
    preserve_msg_boundaries: true,
    multistreaming: true,
    congestion_control: true,
    message_oriented: false,
    supports_ipv4: true,
    supports_ipv6: true,
};

pub struct QuicAdapter;

#[async_trait(?Send)]
impl ProtocolAdapter for QuicAdapter {
    fn capabilities(&self) -> &'static ProtocolCapabilities {
        &CAPABILITIES
    }

    async fn connect(
        &self,
        remote: &RemoteEndpoint,
        local: Option<&LocalEndpoint>,
        security: &SecurityParameters,
    ) -> Result<EstablishedTransport> {
        let remote_addr = remote
            .resolved_address()
            .ok_or(TapsError::InvalidArgument("remote endpoint is unresolved"))?;
        let config = runtime::config()?;

        let endpoint = quinn::Endpoint::client(client_bind_addr(remote_addr, local))?;
        let local_addr = endpoint.local_addr().ok();

        // Certificate verification is bound to the name we dial: the
        // original hostname when one was supplied, the literal IP otherwise.
        let server_name = remote
            .hostname()
            .map(str::to_owned)
            .unwrap_or_else(|| remote_addr.ip().to_string());

        let connection = endpoint
            .connect_with(client_config(security, &config)?, remote_addr, &server_name)
            .map_err(|e| TapsError::Establishment(e.to_string()))?
            .await
            .map_err(|e| TapsError::Establishment(e.to_string()))?;
        debug!("QUIC connected to {} ({})", remote_addr, server_name);

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TapsError::Establishment(e.to_string()))?;

        let manager = SocketManager::new("quic", Box::new(endpoint.clone()));
        let io = Rc::new(QuicStreamSocket {
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            local_addr,
            endpoint: Some(endpoint),
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
        let config = runtime::config()?;

        let (certs, key) = load_identity(&config)?;
        let mut crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TapsError::Tls(e.to_string()))?;
        crypto.alpn_protocols = alpn_bytes(listener.security_parameters());

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(crypto).map_err(|e| TapsError::Tls(e.to_string()))?,
        ));
        let endpoint = quinn::Endpoint::server(server_config, bind_addr)?;
        let local_addr = endpoint.local_addr()?;
        debug!("QUIC listener bound on {}", local_addr);

        let manager = SocketManager::new("quic", Box::new(endpoint.clone()));
        let accept_task = runtime::spawn(accept_loop(
            endpoint,
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

/// Accept QUIC connections, then turn every accepted bidirectional stream
/// into its own multiplexed Connection.
async fn accept_loop(
    endpoint: quinn::Endpoint,
    manager: Rc<SocketManager>,
    listener: std::rc::Weak<Listener>,
    local_addr: SocketAddr,
) {
    while let Some(incoming) = endpoint.accept().await {
        if listener.strong_count() == 0 {
            break;
        }
        let manager = Rc::clone(&manager);
        let listener = listener.clone();
        runtime::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(e) => {
                    debug!("QUIC handshake failed: {}", e);
                    if let Some(listener_rc) = listener.upgrade() {
                        listener_rc.dispatch_establishment_error(&TapsError::Establishment(
                            e.to_string(),
                        ));
                    }
                    return;
                }
            };
            let peer = connection.remote_address();
            debug!("QUIC listener accepted association from {}", peer);

            loop {
                let (send, recv) = match connection.accept_bi().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        trace!("QUIC association from {} ended: {}", peer, e);
                        break;
                    }
                };
                let Some(listener_rc) = listener.upgrade() else {
                    break;
                };

                let io = Rc::new(QuicStreamSocket {
                    connection: connection.clone(),
                    send: Mutex::new(send),
                    recv: Mutex::new(recv),
                    local_addr: Some(local_addr),
                    endpoint: None,
                });
                let conn = Connection::accept_multiplexed(
                    &listener_rc,
                    io,
                    &manager,
                    RemoteEndpoint::from_socket_addr(peer),
                    LocalEndpoint::from_socket_addr(local_addr),
                );
                listener_rc.deliver_connection(conn);
            }
        });
    }
}

/// One bidirectional QUIC stream presented as a connection's I/O surface.
struct QuicStreamSocket {
    connection: quinn::Connection,
    send: Mutex<quinn::SendStream>,
    recv: Mutex<quinn::RecvStream>,
    local_addr: Option<SocketAddr>,
    /// Present on the client path only, where this stream is the
    /// association's sole stream and the endpoint lives and dies with it.
    /// Accept-path streams share their association with siblings.
    endpoint: Option<quinn::Endpoint>,
}

#[async_trait(?Send)]
impl ProtocolSocket for QuicStreamSocket {
    async fn send(&self, payload: &[u8], _ctx: &MessageContext) -> Result<()> {
        self.send
            .lock()
            .await
            .write_all(payload)
            .await
            .map_err(|e| TapsError::SendFailed(e.to_string()))
    }

    async fn receive(&self) -> Result<Delivery> {
        let mut buf = vec![0u8; defaults::RECV_BUFFER_SIZE];
        let mut recv = self.recv.lock().await;
        match recv.read(&mut buf).await {
            Ok(Some(len)) => {
                buf.truncate(len);
                Ok(Delivery::Chunk(buf))
            }
            Ok(None) => Ok(Delivery::Eof),
            Err(quinn::ReadError::Reset(_)) => Err(TapsError::ConnectionReset),
            Err(quinn::ReadError::ConnectionLost(e)) => match e {
                quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::LocallyClosed => Ok(Delivery::Eof),
                quinn::ConnectionError::Reset => Err(TapsError::ConnectionReset),
                other => Err(TapsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    other.to_string(),
                ))),
            },
            Err(e) => Err(TapsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        let _ = self.send.lock().await.finish();
        if let Some(endpoint) = &self.endpoint {
            // Sole stream of the association: close the connection and
            // wait until the close (and any in-flight stream data) has
            // actually been delivered before the endpoint is released.
            self.connection
                .close(defaults::QUIC_CLOSE_OK.into(), b"closed");
            endpoint.wait_idle().await;
        }
        // Accept-path streams only FIN themselves; sibling streams on the
        // shared association stay up.
        Ok(())
    }

    fn abort(&self) {
        match &self.endpoint {
            Some(_) => {
                self.connection
                    .close(defaults::QUIC_CLOSE_ABORT.into(), b"aborted");
            }
            None => {
                // Best effort: reset our stream without touching siblings.
                if let Ok(mut send) = self.send.try_lock() {
                    let _ = send.reset(defaults::QUIC_CLOSE_ABORT.into());
                }
                if let Ok(mut recv) = self.recv.try_lock() {
                    let _ = recv.stop(defaults::QUIC_CLOSE_ABORT.into());
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

fn alpn_bytes(security: &SecurityParameters) -> Vec<Vec<u8>> {
    security
        .alpn()
        .map(|protocols| protocols.iter().map(|p| p.as_bytes().to_vec()).collect())
        .unwrap_or_default()
}

fn client_config(
    security: &SecurityParameters,
    config: &GlobalConfig,
) -> Result<quinn::ClientConfig> {
    let mut crypto = match &config.cert_file {
        Some(cert_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in read_certs(cert_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TapsError::Tls(e.to_string()))?;
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        // No trust anchor configured: accept the peer certificate. Only
        // acceptable on closed networks; a production deployment supplies
        // a certificate file at initialize.
        None => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth(),
    };
    crypto.alpn_protocols = alpn_bytes(security);

    Ok(quinn::ClientConfig::new(Arc::new(
        QuicClientConfig::try_from(crypto).map_err(|e| TapsError::Tls(e.to_string()))?,
    )))
}

fn read_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| TapsError::Tls(format!("{}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TapsError::Tls(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TapsError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_identity(
    config: &GlobalConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_path = config
        .cert_file
        .as_ref()
        .ok_or_else(|| TapsError::Tls("listener requires a certificate file".to_owned()))?;
    let key_path = config
        .key_file
        .as_ref()
        .ok_or_else(|| TapsError::Tls("listener requires a key file".to_owned()))?;

    let certs = read_certs(cert_path)?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| TapsError::Tls(format!("{}: {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| TapsError::Tls(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| TapsError::Tls(format!("{}: no private key found", key_path.display())))?;
    Ok((certs, key))
}

/// Accepts any server certificate. Installed only when no trust anchor was
/// configured at initialize.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
