use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::types::Ports;

const DEFAULT_NGHTTPX_PATHS: [&str; 2] = ["/usr/bin/nghttpx", "/usr/local/bin/nghttpx"];
const DEFAULT_CERTIFICATE_KEY: &str = "/etc/ssl/private/ssl-cert-snakeoil.key";
const DEFAULT_CERTIFICATE: &str = "/etc/ssl/certs/ssl-cert-snakeoil.pem";

/// Ingress controller driving an nghttpx reverse proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "controller", version)]
pub struct Options {
    /// Path to a kubeconfig file; in-cluster or default configuration is
    /// inferred when omitted.
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// The sync interval.
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub resync_period: Duration,

    /// Plaintext frontend port.
    #[arg(long, default_value_t = 30080)]
    pub port: u16,

    /// TLS frontend port.
    #[arg(long, default_value_t = 30443)]
    pub tls_port: u16,

    /// Port of the /healthz endpoint, also the proxy's fallback backend.
    #[arg(long, default_value_t = 10254)]
    pub healthz_port: u16,

    /// Serve an HTTP to HTTPS redirector on this port.
    #[arg(long)]
    pub redirect_port: Option<u16>,

    /// Ingress class handled by this controller.
    #[arg(long, default_value = "nghttpx")]
    pub ingress_class: String,

    /// Local port rules with unresolvable services are sent to.
    #[arg(long, default_value_t = 8080)]
    pub default_backend_port: u16,

    /// Where the rendered proxy configuration is written.
    #[arg(long, default_value = "/tmp/nghttpx.conf")]
    pub config_file: PathBuf,

    /// Directory for materialized certificates and keys.
    #[arg(long, default_value = "/tmp")]
    pub tls_dir: PathBuf,

    /// Candidate nghttpx executables, tried in order.
    #[arg(long = "nghttpx", value_name = "PATH")]
    pub nghttpx_paths: Vec<PathBuf>,
}

/// Settings of the reconciliation loop.
#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    pub ports: Ports,
    pub resync_period: Duration,
    pub default_backend_port: u16,
}

/// Settings of the proxy process.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
    pub executable_candidates: Vec<PathBuf>,
    pub config_file: PathBuf,
    /// Key and certificate handed to nghttpx as its default certificate, used
    /// only when both files exist.
    pub default_certificate: (PathBuf, PathBuf),
}

/// Settings of the auxiliary HTTP listeners.
#[derive(Clone, Copy, Debug)]
pub struct HttpOptions {
    pub ports: Ports,
    pub redirect_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub kubeconfig: Option<PathBuf>,
    pub ingress_class: String,
    pub tls_dir: PathBuf,
    pub reconcile: ReconcileOptions,
    pub proxy: ProxyOptions,
    pub http: HttpOptions,
}

impl Options {
    pub fn into_config(self) -> Config {
        let ports = Ports {
            no_tls: self.port,
            tls: self.tls_port,
            fallback: self.healthz_port,
        };
        let executable_candidates = if self.nghttpx_paths.is_empty() {
            DEFAULT_NGHTTPX_PATHS.iter().map(PathBuf::from).collect()
        } else {
            self.nghttpx_paths
        };

        Config {
            kubeconfig: self.kubeconfig,
            ingress_class: self.ingress_class,
            tls_dir: self.tls_dir,
            reconcile: ReconcileOptions {
                ports,
                resync_period: self.resync_period,
                default_backend_port: self.default_backend_port,
            },
            proxy: ProxyOptions {
                executable_candidates,
                config_file: self.config_file,
                default_certificate: (
                    PathBuf::from(DEFAULT_CERTIFICATE_KEY),
                    PathBuf::from(DEFAULT_CERTIFICATE),
                ),
            },
            http: HttpOptions {
                ports,
                redirect_port: self.redirect_port,
            },
        }
    }
}
