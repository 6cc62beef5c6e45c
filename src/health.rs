//! Health endpoint and plaintext-to-TLS redirector.
//!
//! The health listener also serves as the proxy's fallback backend, so
//! unmatched requests end up with a plain 404 from here.

use std::io;
use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::options::HttpOptions;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serve {addr}: {source}")]
    ServeFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub fn health_router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(not_found)
}

pub fn redirect_router(options: HttpOptions) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .fallback(redirect_to_https)
        .with_state(options)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "404 Not Found")
}

async fn redirect_to_https(State(options): State<HttpOptions>, request: Request) -> Response {
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or_default();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or("/");

    Redirect::permanent(&https_location(host, path_and_query, &options)).into_response()
}

/// Where a plaintext request for `host` + `path_and_query` is sent.
pub fn https_location(host: &str, path_and_query: &str, options: &HttpOptions) -> String {
    let host = match host.rsplit_once(':') {
        Some((name, port))
            if options.ports.no_tls != 80 && port == options.ports.no_tls.to_string() =>
        {
            format!("{}:{}", name, options.ports.tls)
        }
        _ => host.to_string(),
    };
    format!("https://{}{}", host, path_and_query)
}

/// Serves the health listener and, when configured, the redirector until
/// `shutdown` is cancelled. A listener that fails leaves the other running.
pub async fn serve(options: HttpOptions, shutdown: CancellationToken) {
    let health = listen_logged(
        SocketAddr::from(([0, 0, 0, 0], options.ports.fallback)),
        health_router(),
        shutdown.clone(),
    );

    match options.redirect_port {
        Some(port) => {
            let redirect = listen_logged(
                SocketAddr::from(([0, 0, 0, 0], port)),
                redirect_router(options),
                shutdown,
            );
            tokio::join!(health, redirect);
        }
        None => health.await,
    }
}

async fn listen_logged(addr: SocketAddr, app: Router, shutdown: CancellationToken) {
    if let Err(error) = listen(addr, app, shutdown).await {
        tracing::error!(%error, "HTTP listener failed");
    }
}

async fn listen(addr: SocketAddr, app: Router, shutdown: CancellationToken) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::BindFailed { addr, source })?;
    tracing::info!(%addr, "serving HTTP");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|source| Error::ServeFailed { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ports;

    fn options(no_tls: u16) -> HttpOptions {
        HttpOptions {
            ports: Ports {
                no_tls,
                tls: 30443,
                fallback: 10254,
            },
            redirect_port: Some(8081),
        }
    }

    #[test]
    fn plaintext_port_is_swapped_for_tls_port() {
        assert_eq!(
            https_location("foo.example.com:30080", "/a?b=c", &options(30080)),
            "https://foo.example.com:30443/a?b=c"
        );
    }

    #[test]
    fn default_port_keeps_host() {
        assert_eq!(
            https_location("foo.example.com", "/", &options(80)),
            "https://foo.example.com/"
        );
    }

    #[test]
    fn only_the_port_suffix_is_swapped() {
        assert_eq!(
            https_location("app30080.example.com:30080", "/", &options(30080)),
            "https://app30080.example.com:30443/"
        );
        assert_eq!(
            https_location("app30080.example.com", "/", &options(30080)),
            "https://app30080.example.com/"
        );
    }

    #[tokio::test]
    async fn health_listener_survives_redirect_bind_failure() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let redirect_port = taken.local_addr().unwrap().port();
        let fallback = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let http = HttpOptions {
            ports: Ports {
                no_tls: 30080,
                tls: 30443,
                fallback,
            },
            redirect_port: Some(redirect_port),
        };
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(http, shutdown.clone()));

        let addr = SocketAddr::from(([127, 0, 0, 1], fallback));
        let mut healthz = None;
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                healthz = Some(raw_get(addr, "/healthz").await);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let healthz = healthz.expect("health listener never came up");
        assert!(healthz.starts_with("HTTP/1.1 200"));

        shutdown.cancel();
        server.await.unwrap();
        drop(taken);
    }

    #[tokio::test]
    async fn health_listener_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, health_router())
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        let healthz = raw_get(addr, "/healthz").await;
        assert!(healthz.starts_with("HTTP/1.1 200"));
        assert!(healthz.ends_with("ok"));

        let other = raw_get(addr, "/elsewhere").await;
        assert!(other.starts_with("HTTP/1.1 404"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    async fn raw_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
