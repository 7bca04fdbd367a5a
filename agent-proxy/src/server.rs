//! Direct HTTPS ingress.
//!
//! Accepts TLS connections and serves each one with the shared [`Proxy`].
//! Connections are torn down gracefully: when the drain signal fires the
//! accept loop stops and every live connection gets a shutdown notice, and
//! the drain completes only once in-flight responses have been written.

use std::{
    convert::Infallible,
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    pin::pin,
    sync::Arc,
    task::{self, Poll},
    time::Duration,
};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use hyper::{body::Incoming, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::proxy::{incoming_body, Body, ClientAddr, Proxy};

/// Slow-loris guard on request heads. Response write time is unbounded since
/// watch requests stream indefinitely.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Loads the listener's certificate chain and private key from PEM files.
pub fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .with_context(|| format!("failed to parse certificates in {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open {}", key_path.display()))?,
    ))
    .with_context(|| format!("failed to parse {}", key_path.display()))?
    .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Runs the accept loop until drained.
#[instrument(level = "info", skip_all, fields(port = %listener.local_addr().map(|a| a.port()).unwrap_or_default()))]
pub async fn serve(listener: TcpListener, tls: TlsAcceptor, proxy: Proxy, drain: drain::Watch) {
    info!("serving HTTPS");
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (sock, client_addr) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(serve_conn(
                    sock,
                    client_addr,
                    tls.clone(),
                    proxy.clone(),
                    drain.clone(),
                ));
            }
            _ = drain.clone().signaled() => {
                debug!("drained, no longer accepting connections");
                return;
            }
        }
    }
}

/// Per-connection service: tags each request with the peer address, then
/// routes it through the shared proxy.
#[derive(Clone)]
struct IngressService {
    proxy: Proxy,
    client_addr: SocketAddr,
}

impl tower::Service<Request<Incoming>> for IngressService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Incoming>) -> Self::Future {
        req.extensions_mut().insert(ClientAddr(self.client_addr));
        let proxy = self.proxy.clone();
        let req = req.map(incoming_body);
        Box::pin(async move { Ok(proxy.handle(req).await) })
    }
}

async fn serve_conn(
    sock: tokio::net::TcpStream,
    client_addr: SocketAddr,
    tls: TlsAcceptor,
    proxy: Proxy,
    drain: drain::Watch,
) {
    let stream = match tls.accept(sock).await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(client.addr = %client_addr, %error, "TLS handshake failed");
            return;
        }
    };

    let svc = TowerToHyperService::new(IngressService { proxy, client_addr });

    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    let mut conn = pin!(builder.serve_connection_with_upgrades(TokioIo::new(stream), svc));
    tokio::select! {
        res = conn.as_mut() => {
            if let Err(error) = res {
                debug!(client.addr = %client_addr, %error, "connection closed");
            }
        }
        handle = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = handle.release_after(conn).await {
                debug!(client.addr = %client_addr, %error, "connection closed during drain");
            }
        }
    }
}
