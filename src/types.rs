use std::cmp::Ordering;
use std::path::PathBuf;

/// Address every unroutable request is pointed at.
pub const FALLBACK_ADDRESS: &str = "127.0.0.1";

/// A routing rule (one ingress object) that passed the ingress class filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingRule {
    pub namespace: String,
    pub name: String,
    pub hosts: Vec<HostRule>,
    pub tls: Vec<TlsEntry>,
}

/// All paths routed for one host. An empty `host` matches any host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRule {
    pub host: String,
    pub paths: Vec<PathRule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathRule {
    pub path: String,
    /// `None` when the path does not point at a service with a usable port.
    pub backend: Option<ServiceRef>,
}

/// A service referenced by name from the routing rule's namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,
    pub port: ServicePort,
}

/// The port an ingress path declares for its backend service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServicePort {
    Number(u16),
    Name(String),
}

/// A TLS entry of a routing rule: the hosts it covers and the secret holding
/// the key material, looked up in the rule's namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsEntry {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

/// A backend service as seen by the builder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendService {
    pub namespace: String,
    pub name: String,
    /// `None` for headless services.
    pub cluster_ip: Option<String>,
    pub ports: Vec<NamedPort>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: Option<String>,
    pub port: u16,
}

impl BackendService {
    /// Resolves the port an ingress path declares against this service.
    pub fn resolve_port(&self, port: &ServicePort) -> Option<u16> {
        match port {
            ServicePort::Number(number) => Some(*number),
            ServicePort::Name(name) => self
                .ports
                .iter()
                .find(|named| named.name.as_deref() == Some(name.as_str()))
                .map(|named| named.port),
        }
    }
}

/// A secret of TLS type carrying both a certificate and a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSecret {
    pub namespace: String,
    pub name: String,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

/// One routable unit of the proxy configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub address: String,
    pub port: u16,
    pub hostname: String,
    pub path: String,
}

impl Route {
    /// Route used when the backend of a path cannot be resolved.
    pub fn fallback(hostname: &str, port: u16) -> Self {
        Route {
            address: FALLBACK_ADDRESS.to_string(),
            port,
            hostname: hostname.to_string(),
            path: "/".to_string(),
        }
    }

    fn canonical_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Orders by `address:port`, then hostname, then path.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.canonical_key()
            .cmp(&other.canonical_key())
            .then_with(|| self.hostname.cmp(&other.hostname))
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// Certificate and key files materialized for a set of hosts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsBinding {
    /// Sorted.
    pub hosts: Vec<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsBinding {
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.hosts
            .cmp(&other.hosts)
            .then_with(|| self.cert_path.cmp(&other.cert_path))
    }
}

/// Listening ports of the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ports {
    pub no_tls: u16,
    pub tls: u16,
    pub fallback: u16,
}

/// The complete desired state of the proxy, compared by value between passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub backends: Vec<Route>,
    pub tls_bindings: Vec<TlsBinding>,
    pub ports: Ports,
}

impl ProxyConfig {
    /// Builds a configuration in canonical order.
    pub fn new(mut backends: Vec<Route>, mut tls_bindings: Vec<TlsBinding>, ports: Ports) -> Self {
        backends.sort_by(Route::canonical_cmp);
        tls_bindings.sort_by(TlsBinding::canonical_cmp);
        tls_bindings.dedup();
        ProxyConfig {
            backends,
            tls_bindings,
            ports,
        }
    }

    pub fn empty(ports: Ports) -> Self {
        ProxyConfig::new(Vec::new(), Vec::new(), ports)
    }
}
