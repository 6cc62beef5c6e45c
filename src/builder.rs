use crate::mirror::{object_key, ResourceMirror};
use crate::tls::MaterialCache;
use crate::types::{BackendService, PathRule, Route, RoutingRule, TlsBinding, TlsSecret};

/// Routes and TLS bindings derived from the watched objects, in no particular
/// order.
#[derive(Debug, Default)]
pub struct Built {
    pub routes: Vec<Route>,
    pub tls_bindings: Vec<TlsBinding>,
}

/// Derives routes and TLS bindings from routing rules.
///
/// A path whose service cannot be resolved is routed to
/// `127.0.0.1:<default_backend_port>` with path `/`. A TLS entry whose secret
/// cannot be resolved or materialized is left out.
pub fn build(
    rules: &[RoutingRule],
    services: &dyn ResourceMirror<BackendService>,
    secrets: &dyn ResourceMirror<TlsSecret>,
    cache: &MaterialCache,
    default_backend_port: u16,
) -> Built {
    let mut built = Built::default();

    for rule in rules {
        for host in &rule.hosts {
            for path in &host.paths {
                let route = resolve_route(rule, &host.host, path, services)
                    .unwrap_or_else(|| Route::fallback(&host.host, default_backend_port));
                built.routes.push(route);
            }
        }

        for tls in &rule.tls {
            let key = object_key(&rule.namespace, &tls.secret_name);
            let secret = match secrets.get_by_key(&key) {
                Some(secret) => secret,
                None => {
                    tracing::debug!(secret = %key, "TLS secret not found, skipping");
                    continue;
                }
            };
            match cache.materialize(&tls.hosts, &secret.certificate, &secret.key) {
                Ok(binding) => built.tls_bindings.push(binding),
                Err(error) => {
                    tracing::error!(%error, secret = %key, "unable to materialize TLS secret")
                }
            }
        }
    }

    built
}

fn resolve_route(
    rule: &RoutingRule,
    hostname: &str,
    path: &PathRule,
    services: &dyn ResourceMirror<BackendService>,
) -> Option<Route> {
    let backend = path.backend.as_ref()?;
    let key = object_key(&rule.namespace, &backend.name);
    let service = match services.get_by_key(&key) {
        Some(service) => service,
        None => {
            tracing::debug!(service = %key, "service not found, using fallback backend");
            return None;
        }
    };
    let address = service.cluster_ip.clone()?;
    let port = service.resolve_port(&backend.port)?;

    Some(Route {
        address,
        port,
        hostname: hostname.to_string(),
        path: path.path.clone(),
    })
}
