use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};
use kube::api::{Api, ListParams};
use kube::runtime::reflector::{reflector, store::Writer, ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{
    BackendService, HostRule, NamedPort, PathRule, RoutingRule, ServicePort, ServiceRef,
    TlsEntry, TlsSecret,
};

pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Read-only view of one kind of watched cluster object.
pub trait ResourceMirror<T>: Send + Sync {
    fn list(&self) -> Vec<T>;

    /// Looks an object up by its `namespace/name` key.
    fn get_by_key(&self, key: &str) -> Option<T>;

    /// Whether the initial listing has been applied.
    fn has_synced(&self) -> bool;
}

/// What the watch boundary filters on.
#[derive(Clone, Debug)]
pub struct Selector {
    pub ingress_class: String,
}

/// Conversion from a watched cluster object into a domain struct.
/// `None` filters the object out of the mirror.
pub trait FromResource<K>: Sized {
    fn from_resource(object: &K, selector: &Selector) -> Option<Self>;
}

pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl FromResource<Ingress> for RoutingRule {
    fn from_resource(ingress: &Ingress, selector: &Selector) -> Option<Self> {
        let spec = ingress.spec.clone().unwrap_or_default();
        let class = ingress
            .annotations()
            .get(INGRESS_CLASS_ANNOTATION)
            .or_else(|| spec.ingress_class_name.as_ref());
        if class.map(String::as_str) != Some(selector.ingress_class.as_str()) {
            return None;
        }

        let hosts = spec
            .rules
            .unwrap_or_default()
            .into_iter()
            .map(|rule| HostRule {
                host: rule.host.unwrap_or_default(),
                paths: rule
                    .http
                    .map(|http| http.paths.iter().map(path_rule).collect())
                    .unwrap_or_default(),
            })
            .collect();

        let tls = spec
            .tls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tls| {
                Some(TlsEntry {
                    hosts: tls.hosts.unwrap_or_default(),
                    secret_name: tls.secret_name?,
                })
            })
            .collect();

        Some(RoutingRule {
            namespace: ingress.namespace().unwrap_or_default(),
            name: ingress.name(),
            hosts,
            tls,
        })
    }
}

fn path_rule(path: &HTTPIngressPath) -> PathRule {
    let backend = path.backend.service.as_ref().and_then(|service| {
        let port = service.port.as_ref()?;
        let port = match (port.number, port.name.as_ref()) {
            (Some(number), _) => ServicePort::Number(u16::try_from(number).ok()?),
            (None, Some(name)) => ServicePort::Name(name.clone()),
            (None, None) => return None,
        };
        Some(ServiceRef {
            name: service.name.clone(),
            port,
        })
    });

    PathRule {
        path: path.path.clone().unwrap_or_default(),
        backend,
    }
}

impl FromResource<Service> for BackendService {
    fn from_resource(service: &Service, _selector: &Selector) -> Option<Self> {
        let spec = service.spec.clone().unwrap_or_default();
        let cluster_ip = spec
            .cluster_ip
            .filter(|ip| !ip.is_empty() && ip.as_str() != "None");
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|port| {
                Some(NamedPort {
                    name: port.name,
                    port: u16::try_from(port.port).ok()?,
                })
            })
            .collect();

        Some(BackendService {
            namespace: service.namespace().unwrap_or_default(),
            name: service.name(),
            cluster_ip,
            ports,
        })
    }
}

impl FromResource<Secret> for TlsSecret {
    fn from_resource(secret: &Secret, _selector: &Selector) -> Option<Self> {
        if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
            return None;
        }
        let data = secret.data.as_ref()?;
        let certificate = data.get("tls.crt")?.0.clone();
        let key = data.get("tls.key")?.0.clone();

        Some(TlsSecret {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name(),
            certificate,
            key,
        })
    }
}

/// Mirror backed by a kube reflector store.
pub struct KubeMirror<K, T>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
    selector: Selector,
    _domain: PhantomData<fn() -> T>,
}

impl<K, T> KubeMirror<K, T>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    T: FromResource<K>,
{
    /// Starts watching every object of kind `K` in the cluster. The returned
    /// task runs until `shutdown` is cancelled.
    pub fn spawn(
        api: Api<K>,
        selector: Selector,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let writer = Writer::<K>::default();
        let store = writer.as_reader();
        let synced = Arc::new(AtomicBool::new(false));

        let events = reflector(writer, watcher(api, ListParams::default()));
        let task = tokio::spawn(drive::<K, _>(events, synced.clone(), shutdown));

        let mirror = KubeMirror {
            store,
            synced,
            selector,
            _domain: PhantomData,
        };
        (mirror, task)
    }
}

async fn drive<K, S>(events: S, synced: Arc<AtomicBool>, shutdown: CancellationToken)
where
    K: Resource<DynamicType = ()>,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let kind = K::kind(&()).to_string();
    futures_util::pin_mut!(events);

    tracing::info!(%kind, "watching");
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Restarted(objects))) => {
                if !synced.swap(true, Ordering::SeqCst) {
                    tracing::info!(%kind, objects = objects.len(), "initial sync complete");
                }
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                tracing::warn!(%error, %kind, "watch failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                }
            }
            None => break,
        }
    }
    tracing::info!(%kind, "watch terminated");
}

impl<K, T> ResourceMirror<T> for KubeMirror<K, T>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    T: FromResource<K>,
{
    fn list(&self) -> Vec<T> {
        self.store
            .state()
            .iter()
            .filter_map(|object| T::from_resource(object, &self.selector))
            .collect()
    }

    fn get_by_key(&self, key: &str) -> Option<T> {
        let reference = match key.split_once('/') {
            Some((namespace, name)) => ObjectRef::<K>::new(name).within(namespace),
            None => ObjectRef::<K>::new(key),
        };
        self.store
            .get(&reference)
            .and_then(|object| T::from_resource(&object, &self.selector))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
