//! Local and remote endpoint model and resolution.
//!
//! Endpoints start out as user-supplied pieces (hostname or literal address,
//! numeric port or service name, optionally an interface name for local
//! endpoints) and are resolved into one or more concrete socket addresses by
//! [`RemoteEndpoint::resolve`] / [`LocalEndpoint::resolve`]. The original
//! user-supplied strings are retained on every resolved entry, and endpoints
//! are cloned at each ownership boundary so callers may drop their inputs
//! immediately.
//!
//! Port precedence: numeric port, then service-name lookup against the
//! host's service database, then failure. Hostname lookup is asynchronous
//! and may yield addresses across both families.

use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::defaults;
use crate::error::{Result, TapsError};

/// A remote host: either a literal address or a name to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Address(IpAddr),
    Name(String),
}

/// Remote endpoint of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEndpoint {
    host: Option<Host>,
    port: Option<u16>,
    service: Option<String>,
    resolved: Option<SocketAddr>,
}

impl RemoteEndpoint {
    pub fn build() -> Self {
        RemoteEndpoint::default()
    }

    /// Set the host from a string. A parseable IP literal becomes a literal
    /// address; anything else is kept as a hostname for DNS resolution.
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.host = match hostname.parse::<IpAddr>() {
            Ok(addr) => Some(Host::Address(addr)),
            Err(_) => Some(Host::Name(hostname.to_owned())),
        };
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.host = Some(Host::Address(address));
        self
    }

    pub fn with_ipv4(self, address: Ipv4Addr) -> Self {
        self.with_address(IpAddr::V4(address))
    }

    pub fn with_ipv6(self, address: Ipv6Addr) -> Self {
        self.with_address(IpAddr::V6(address))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set a service name to be translated into a port when no numeric
    /// port was given.
    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_owned());
        self
    }

    /// Build an already-resolved endpoint from a concrete socket address
    /// (used for accepted peers).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        RemoteEndpoint {
            host: Some(Host::Address(addr.ip())),
            port: Some(addr.port()),
            service: None,
            resolved: Some(addr),
        }
    }

    /// The user-supplied hostname, when the host was not a literal.
    pub fn hostname(&self) -> Option<&str> {
        match &self.host {
            Some(Host::Name(name)) => Some(name),
            _ => None,
        }
    }

    pub fn host(&self) -> Option<&Host> {
        self.host.as_ref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// The concrete address, present only after resolution.
    pub fn resolved_address(&self) -> Option<SocketAddr> {
        self.resolved
    }

    fn resolve_port(&self) -> Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        if let Some(service) = &self.service {
            return service_to_port(service);
        }
        Err(TapsError::NoPort("(no port or service set)".to_owned()))
    }

    /// Resolve into one endpoint per concrete address.
    ///
    /// A literal address yields exactly one entry; a hostname yields one
    /// entry per DNS answer across both address families. Every entry keeps
    /// the original hostname/service strings.
    pub async fn resolve(&self) -> Result<Vec<RemoteEndpoint>> {
        let port = self.resolve_port()?;
        match &self.host {
            Some(Host::Address(address)) => {
                let mut entry = self.clone();
                entry.port = Some(port);
                entry.resolved = Some(SocketAddr::new(*address, port));
                Ok(vec![entry])
            }
            Some(Host::Name(name)) => {
                let answers = lookup_host((name.as_str(), port))
                    .await
                    .map_err(|e| TapsError::Dns(format!("{name}: {e}")))?;

                let mut entries: Vec<RemoteEndpoint> = Vec::new();
                for addr in answers {
                    if entries.iter().any(|e| e.resolved == Some(addr)) {
                        continue;
                    }
                    let mut entry = self.clone();
                    entry.port = Some(port);
                    entry.resolved = Some(addr);
                    entries.push(entry);
                }
                if entries.is_empty() {
                    return Err(TapsError::Dns(format!("{name}: no addresses returned")));
                }
                debug!("resolved {} to {} address(es)", name, entries.len());
                Ok(entries)
            }
            None => Err(TapsError::InvalidArgument(
                "remote endpoint has neither a hostname nor an address",
            )),
        }
    }
}

impl std::fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(addr) = self.resolved {
            return write!(f, "{addr}");
        }
        match &self.host {
            Some(Host::Address(addr)) => write!(f, "{addr}")?,
            Some(Host::Name(name)) => write!(f, "{name}")?,
            None => write!(f, "<unset>")?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        } else if let Some(service) = &self.service {
            write!(f, ":{service}")?;
        }
        Ok(())
    }
}

/// Local endpoint of a connection or listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalEndpoint {
    interface: Option<String>,
    address: Option<IpAddr>,
    port: Option<u16>,
    service: Option<String>,
    resolved: Option<SocketAddr>,
}

impl LocalEndpoint {
    pub fn build() -> Self {
        LocalEndpoint::default()
    }

    /// Name a network interface; resolution expands it to every address
    /// bound to that interface.
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_owned());
        self
    }

    /// Build an already-resolved endpoint from a bound socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        LocalEndpoint {
            interface: None,
            address: Some(addr.ip()),
            port: Some(addr.port()),
            service: None,
            resolved: Some(addr),
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The concrete bind address, present only after resolution.
    pub fn resolved_address(&self) -> Option<SocketAddr> {
        self.resolved
    }

    fn resolve_port(&self) -> Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        if let Some(service) = &self.service {
            return service_to_port(service);
        }
        // An unset local port means an ephemeral bind.
        Ok(0)
    }

    /// Resolve into one endpoint per concrete bind address.
    ///
    /// An interface name expands to every address on that interface (capped
    /// at [`defaults::MAX_INTERFACE_ADDRS`]); an unresolvable or absent
    /// interface falls back to the wildcard addresses.
    pub async fn resolve(&self) -> Result<Vec<LocalEndpoint>> {
        let port = self.resolve_port()?;

        if let Some(name) = &self.interface {
            let addresses = interface_addresses(name)?;
            if addresses.is_empty() {
                warn!("interface {:?} has no addresses, binding to wildcard", name);
            } else {
                return Ok(addresses
                    .into_iter()
                    .map(|address| {
                        let mut entry = self.clone();
                        entry.address = Some(address);
                        entry.port = Some(port);
                        entry.resolved = Some(SocketAddr::new(address, port));
                        entry
                    })
                    .collect());
            }
        }

        if let Some(address) = self.address {
            let mut entry = self.clone();
            entry.port = Some(port);
            entry.resolved = Some(SocketAddr::new(address, port));
            return Ok(vec![entry]);
        }

        // No interface and no address: wildcard bind, IPv4 first.
        Ok([
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        ]
        .into_iter()
        .map(|address| {
            let mut entry = self.clone();
            entry.address = Some(address);
            entry.port = Some(port);
            entry.resolved = Some(SocketAddr::new(address, port));
            entry
        })
        .collect())
    }
}

impl std::fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(addr) = self.resolved {
            return write!(f, "{addr}");
        }
        match (&self.interface, &self.address) {
            (Some(interface), _) => write!(f, "{interface}")?,
            (None, Some(address)) => write!(f, "{address}")?,
            (None, None) => write!(f, "*")?,
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Translate a service name into a port via the host's service database,
/// the way `getaddrinfo(NULL, service, ...)` does. Service ports are not
/// family-specific in the database, so one lookup serves both families.
pub(crate) fn service_to_port(service: &str) -> Result<u16> {
    let c_service = CString::new(service)
        .map_err(|_| TapsError::InvalidArgument("service name contains an interior NUL"))?;
    let entry = unsafe { libc::getservbyname(c_service.as_ptr(), std::ptr::null()) };
    if entry.is_null() {
        return Err(TapsError::NoPort(service.to_owned()));
    }
    let raw_port = unsafe { (*entry).s_port };
    Ok(u16::from_be(raw_port as u16))
}

/// All addresses bound to the named interface, capped at
/// [`defaults::MAX_INTERFACE_ADDRS`]. An empty result means the name did
/// not match any interface.
fn interface_addresses(name: &str) -> Result<Vec<IpAddr>> {
    let ifaddrs =
        nix::ifaddrs::getifaddrs().map_err(|_| TapsError::NoInterface(name.to_owned()))?;

    let mut addresses = Vec::new();
    for ifaddr in ifaddrs {
        if ifaddr.interface_name != name {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addresses.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addresses.push(IpAddr::V6(sin6.ip()));
        }
        if addresses.len() >= defaults::MAX_INTERFACE_ADDRS {
            break;
        }
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_literal_is_parsed_as_address() {
        let endpoint = RemoteEndpoint::build().with_hostname("127.0.0.1");
        assert_eq!(
            endpoint.host(),
            Some(&Host::Address(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        );
        assert_eq!(endpoint.hostname(), None);

        let endpoint = RemoteEndpoint::build().with_hostname("example.com");
        assert_eq!(endpoint.hostname(), Some("example.com"));
    }

    #[tokio::test]
    async fn literal_address_resolves_to_single_entry() {
        let endpoint = RemoteEndpoint::build()
            .with_ipv4(Ipv4Addr::LOCALHOST)
            .with_port(5005);

        let resolved = endpoint.resolve().await.unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved[0].resolved_address(),
            Some("127.0.0.1:5005".parse().unwrap())
        );
        // Originals are retained on the resolved entry.
        assert_eq!(resolved[0].port(), Some(5005));
    }

    #[tokio::test]
    async fn missing_port_and_service_fails() {
        let endpoint = RemoteEndpoint::build().with_ipv4(Ipv4Addr::LOCALHOST);
        let err = endpoint.resolve().await.unwrap_err();
        assert!(matches!(err, TapsError::NoPort(_)));
    }

    #[tokio::test]
    async fn hostname_resolution_uses_the_resolver() {
        // localhost is resolvable from the hosts file without network access.
        let endpoint = RemoteEndpoint::build()
            .with_hostname("localhost")
            .with_port(443);

        let resolved = endpoint.resolve().await.unwrap();

        assert!(!resolved.is_empty());
        for entry in &resolved {
            let addr = entry.resolved_address().unwrap();
            assert_eq!(addr.port(), 443);
            assert!(addr.ip().is_loopback());
            assert_eq!(entry.hostname(), Some("localhost"));
        }
    }

    /// Resolution of a public name with a service port, across families.
    /// Requires network access and a populated service database.
    #[tokio::test]
    #[ignore]
    async fn public_hostname_with_service_resolves_both_families() {
        let endpoint = RemoteEndpoint::build()
            .with_hostname("example.com")
            .with_service("https");

        let resolved = endpoint.resolve().await.unwrap();

        assert!(resolved.iter().any(|e| e.resolved_address().unwrap().is_ipv4()));
        assert!(resolved.iter().any(|e| e.resolved_address().unwrap().is_ipv6()));
        for entry in &resolved {
            assert_eq!(entry.resolved_address().unwrap().port(), 443);
        }
    }

    #[test]
    fn service_lookup_resolves_well_known_ports() {
        if !std::path::Path::new("/etc/services").exists() {
            // No service database on this host; nothing to look up against.
            return;
        }
        assert_eq!(service_to_port("https").unwrap(), 443);
        assert_eq!(service_to_port("http").unwrap(), 80);
    }

    #[test]
    fn unknown_service_yields_no_port() {
        let err = service_to_port("no-such-service-taps").unwrap_err();
        assert!(matches!(err, TapsError::NoPort(_)));
    }

    #[tokio::test]
    async fn unset_local_endpoint_resolves_to_wildcards() {
        let resolved = LocalEndpoint::build().resolve().await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[0].resolved_address(),
            Some("0.0.0.0:0".parse().unwrap())
        );
        assert_eq!(resolved[1].resolved_address(), Some("[::]:0".parse().unwrap()));
    }

    #[tokio::test]
    async fn loopback_interface_expands_to_its_addresses() {
        let endpoint = LocalEndpoint::build().with_interface("lo").with_port(1239);
        let resolved = match endpoint.resolve().await {
            Ok(resolved) => resolved,
            // Hosts without a "lo" interface fall back to wildcard.
            Err(_) => return,
        };

        assert!(!resolved.is_empty());
        for entry in &resolved {
            let addr = entry.resolved_address().unwrap();
            assert_eq!(addr.port(), 1239);
            assert_eq!(entry.interface(), Some("lo"));
        }
    }

    #[tokio::test]
    async fn unknown_interface_falls_back_to_wildcard() {
        let endpoint = LocalEndpoint::build()
            .with_interface("no-such-if0")
            .with_port(7);

        let resolved = endpoint.resolve().await.unwrap();

        assert!(resolved
            .iter()
            .all(|e| e.resolved_address().unwrap().ip().is_unspecified()));
    }
}
