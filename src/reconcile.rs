use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::builder;
use crate::mirror::ResourceMirror;
use crate::options::ReconcileOptions;
use crate::render::render;
use crate::tls::MaterialCache;
use crate::types::{BackendService, ProxyConfig, RoutingRule, TlsSecret};

/// Everything a reconciliation pass reads.
pub struct Data {
    pub ingresses: Arc<dyn ResourceMirror<RoutingRule>>,
    pub services: Arc<dyn ResourceMirror<BackendService>>,
    pub secrets: Arc<dyn ResourceMirror<TlsSecret>>,
    pub cache: MaterialCache,
    pub options: ReconcileOptions,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to render configuration: {0}")]
    RenderFailed(#[source] fmt::Error),
    #[error("Configuration channel closed")]
    ChannelClosed,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// At least one mirror has not finished its initial listing.
    NotSynced,
    Unchanged,
    Applied,
}

/// Periodically rebuilds the desired proxy configuration and sends it to the
/// supervisor whenever it differs from the last one sent.
pub struct Reconciler {
    data: Data,
    configs: mpsc::Sender<String>,
    last_applied: Option<ProxyConfig>,
}

impl Reconciler {
    pub fn new(data: Data, configs: mpsc::Sender<String>) -> Self {
        Reconciler {
            data,
            configs,
            last_applied: None,
        }
    }

    /// Sends the empty configuration once, then checks for changes every
    /// resync period until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            resync_period = ?self.data.options.resync_period,
            "starting reconciler"
        );

        let initial = ProxyConfig::empty(self.data.options.ports);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            res = self.apply(initial) => if let Err(error) = res {
                error_policy(&error);
            },
        }

        let mut ticker = tokio::time::interval(self.data.options.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let res = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.reconcile() => res,
            };
            match res {
                Ok(pass) => tracing::trace!(?pass, "reconciled"),
                Err(Error::ChannelClosed) => {
                    tracing::warn!("supervisor is gone, stopping reconciler");
                    break;
                }
                Err(error) => error_policy(&error),
            }
        }

        tracing::info!("reconciler terminated");
    }

    /// Runs one pass: sync check, rebuild, compare, render and send.
    pub async fn reconcile(&mut self) -> Result<Pass, Error> {
        if !self.mirrors_synced() {
            tracing::warn!("mirrors not synced yet, delaying configuration check");
            return Ok(Pass::NotSynced);
        }

        let desired = self.desired(&self.data.ingresses.list());
        if self.last_applied.as_ref() == Some(&desired) {
            return Ok(Pass::Unchanged);
        }

        self.apply(desired).await?;
        Ok(Pass::Applied)
    }

    fn mirrors_synced(&self) -> bool {
        self.data.ingresses.has_synced()
            && self.data.services.has_synced()
            && self.data.secrets.has_synced()
    }

    /// The configuration `rules` translate to, in canonical order.
    pub fn desired(&self, rules: &[RoutingRule]) -> ProxyConfig {
        let built = builder::build(
            rules,
            self.data.services.as_ref(),
            self.data.secrets.as_ref(),
            &self.data.cache,
            self.data.options.default_backend_port,
        );
        ProxyConfig::new(built.routes, built.tls_bindings, self.data.options.ports)
    }

    /// Adopts `config` as the last applied configuration only once the
    /// supervisor has received it.
    async fn apply(&mut self, config: ProxyConfig) -> Result<(), Error> {
        let doc = render(&config).map_err(Error::RenderFailed)?;
        tracing::info!(
            backends = config.backends.len(),
            certificates = config.tls_bindings.len(),
            "configuration changed"
        );
        self.configs
            .send(doc)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        self.last_applied = Some(config);
        Ok(())
    }
}

pub fn error_policy(error: &Error) {
    tracing::error!(%error, "reconciliation failed, retrying on next tick");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::mirror::memory::StaticMirror;
    use crate::types::{HostRule, PathRule, Ports, ServicePort, ServiceRef, TlsEntry};

    struct Fixture {
        ingresses: Arc<StaticMirror<RoutingRule>>,
        services: Arc<StaticMirror<BackendService>>,
        secrets: Arc<StaticMirror<TlsSecret>>,
        dir: tempfile::TempDir,
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions {
            ports: Ports {
                no_tls: 30080,
                tls: 30443,
                fallback: 10254,
            },
            resync_period: Duration::from_secs(1),
            default_backend_port: 8080,
        }
    }

    fn rule(name: &str, host: &str, service: &str) -> RoutingRule {
        RoutingRule {
            namespace: "default".to_string(),
            name: name.to_string(),
            hosts: vec![HostRule {
                host: host.to_string(),
                paths: vec![PathRule {
                    path: "/".to_string(),
                    backend: Some(ServiceRef {
                        name: service.to_string(),
                        port: ServicePort::Number(80),
                    }),
                }],
            }],
            tls: Vec::new(),
        }
    }

    fn service(name: &str, cluster_ip: &str) -> BackendService {
        BackendService {
            namespace: "default".to_string(),
            name: name.to_string(),
            cluster_ip: Some(cluster_ip.to_string()),
            ports: Vec::new(),
        }
    }

    fn fixture(rules: Vec<RoutingRule>, services: Vec<BackendService>) -> Fixture {
        Fixture {
            ingresses: Arc::new(StaticMirror::new(rules)),
            services: Arc::new(StaticMirror::new(services)),
            secrets: Arc::new(StaticMirror::new(Vec::new())),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn reconciler(fixture: &Fixture, capacity: usize) -> (Reconciler, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let data = Data {
            ingresses: fixture.ingresses.clone(),
            services: fixture.services.clone(),
            secrets: fixture.secrets.clone(),
            cache: MaterialCache::new(fixture.dir.path()),
            options: options(),
        };
        (Reconciler::new(data, tx), rx)
    }

    #[tokio::test]
    async fn renders_example_scenario() {
        let fixture = fixture(
            vec![rule("web", "foo.example.com", "svc-a")],
            vec![service("svc-a", "10.0.0.5")],
        );
        let (mut reconciler, mut rx) = reconciler(&fixture, 1);

        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::Applied);
        assert_eq!(
            rx.try_recv().unwrap(),
            "frontend=*,30080;no-tls\n\
             frontend=*,30443;tls\n\
             backend=10.0.0.5,80;foo.example.com/;proto=h2;\n\
             backend=127.0.0.1,10254;;\n"
        );
    }

    #[tokio::test]
    async fn unchanged_configuration_is_not_resent() {
        let fixture = fixture(
            vec![rule("web", "foo.example.com", "svc-a")],
            vec![service("svc-a", "10.0.0.5")],
        );
        let (mut reconciler, mut rx) = reconciler(&fixture, 1);

        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::Applied);
        rx.try_recv().unwrap();
        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::Unchanged);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        fixture.services.insert(service("svc-a", "10.0.0.9"));
        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::Applied);
        assert!(rx
            .try_recv()
            .unwrap()
            .contains("backend=10.0.0.9,80;foo.example.com/;proto=h2;"));
    }

    #[tokio::test]
    async fn unsynced_mirror_blocks_the_pass() {
        let fixture = fixture(
            vec![rule("web", "foo.example.com", "svc-a")],
            vec![service("svc-a", "10.0.0.5")],
        );
        fixture.secrets.set_synced(false);
        let (mut reconciler, mut rx) = reconciler(&fixture, 1);

        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::NotSynced);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        fixture.secrets.set_synced(true);
        assert_eq!(reconciler.reconcile().await.unwrap(), Pass::Applied);
    }

    #[tokio::test]
    async fn failed_send_keeps_previous_baseline() {
        let fixture = fixture(
            vec![rule("web", "foo.example.com", "svc-a")],
            vec![service("svc-a", "10.0.0.5")],
        );
        let (mut reconciler, rx) = reconciler(&fixture, 1);
        drop(rx);

        assert!(matches!(
            reconciler.reconcile().await,
            Err(Error::ChannelClosed)
        ));
        assert_eq!(reconciler.last_applied, None);
    }

    #[test]
    fn output_does_not_depend_on_input_order() {
        let fixture = fixture(
            Vec::new(),
            vec![service("svc-a", "10.0.0.5"), service("svc-b", "10.0.0.6")],
        );
        fixture.secrets.insert(TlsSecret {
            namespace: "default".to_string(),
            name: "shared-tls".to_string(),
            certificate: b"cert".to_vec(),
            key: b"key".to_vec(),
        });
        let (reconciler, _rx) = reconciler(&fixture, 1);

        let mut first = rule("a", "a.example.com", "svc-a");
        first.tls = vec![TlsEntry {
            hosts: vec!["a.example.com".to_string(), "b.example.com".to_string()],
            secret_name: "shared-tls".to_string(),
        }];
        let mut second = rule("b", "b.example.com", "svc-b");
        second.hosts[0].paths.push(PathRule {
            path: "/missing".to_string(),
            backend: Some(ServiceRef {
                name: "missing".to_string(),
                port: ServicePort::Number(80),
            }),
        });
        let mut first_permuted = first.clone();
        first_permuted.tls[0].hosts.reverse();

        let forward = reconciler.desired(&[first, second.clone()]);
        let backward = reconciler.desired(&[second, first_permuted]);

        assert_eq!(forward, backward);
        assert_eq!(render(&forward).unwrap(), render(&backward).unwrap());
        assert_eq!(forward.tls_bindings.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_sends_initial_configuration_then_changes() {
        let fixture = fixture(Vec::new(), vec![service("svc-a", "10.0.0.5")]);
        let (reconciler, mut rx) = reconciler(&fixture, 1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reconciler.run(shutdown.clone()));

        let initial = rx.recv().await.unwrap();
        assert!(!initial.contains("proto=h2"));

        fixture.ingresses.insert(rule("web", "foo.example.com", "svc-a"));
        let changed = rx.recv().await.unwrap();
        assert!(changed.contains("backend=10.0.0.5,80;foo.example.com/;proto=h2;"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
