mod builder;
mod files;
mod health;
mod mirror;
mod options;
mod reconcile;
mod render;
mod supervisor;
mod tls;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::mirror::{KubeMirror, Selector};
use crate::options::Options;
use crate::reconcile::Reconciler;
use crate::supervisor::{NghttpxLauncher, Supervisor};
use crate::tls::MaterialCache;
use crate::types::{BackendService, RoutingRule, TlsSecret};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Options::parse().into_config();

    let program = supervisor::locate_executable(&config.proxy.executable_candidates)?;
    tracing::info!(program = %program.display(), "found nghttpx");

    let client = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let client_config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Client::try_from(client_config)?
        }
        None => Client::try_default().await?,
    };

    let shutdown = CancellationToken::new();
    let selector = Selector {
        ingress_class: config.ingress_class.clone(),
    };

    let (ingresses, ingress_watch) = KubeMirror::<Ingress, RoutingRule>::spawn(
        Api::all(client.clone()),
        selector.clone(),
        shutdown.clone(),
    );
    let (services, service_watch) = KubeMirror::<Service, BackendService>::spawn(
        Api::all(client.clone()),
        selector.clone(),
        shutdown.clone(),
    );
    let (secrets, secret_watch) =
        KubeMirror::<Secret, TlsSecret>::spawn(Api::all(client), selector, shutdown.clone());

    let (configs_tx, configs_rx) = mpsc::channel(1);
    let reconciler = Reconciler::new(
        reconcile::Data {
            ingresses: Arc::new(ingresses),
            services: Arc::new(services),
            secrets: Arc::new(secrets),
            cache: MaterialCache::new(config.tls_dir),
            options: config.reconcile,
        },
        configs_tx,
    );
    let supervisor = Supervisor::new(NghttpxLauncher, config.proxy);

    let tasks = vec![
        ingress_watch,
        service_watch,
        secret_watch,
        tokio::spawn(health::serve(config.http, shutdown.clone())),
        tokio::spawn(supervisor.run(configs_rx, shutdown.clone())),
        tokio::spawn(reconciler.run(shutdown.clone())),
    ];

    shutdown_signal().await?;
    tracing::info!("shutting down");
    shutdown.cancel();
    for task in tasks {
        task.await?;
    }

    tracing::info!("controller terminated");

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}
