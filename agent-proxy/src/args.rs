use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use clap::Parser;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{BusClientConfig, Config};
use crate::proxy::Proxy;
use crate::upbound::Client as _;
use crate::{bus, kubernetes, proxy, server, upbound};

/// Subject prefix identifying a control-plane token.
const CONTROL_PLANE_SUB_PREFIX: &str = "controlPlane|";

/// How long to wait for tunneled requests accepted before shutdown began.
const BUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(20);
const BUS_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for in-flight HTTPS responses; exceeding it fails the process.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Parser)]
#[command(name = "upbound-agent", version)]
pub struct Args {
    /// Enables debug-level logging.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Name of the pod running this agent, used in the bus connection name.
    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    /// Address the HTTPS listener binds.
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:6443")]
    server_addr: SocketAddr,

    /// PEM certificate chain presented by the HTTPS listener.
    #[arg(long, env = "TLS_CRT_FILE")]
    tls_cert_file: PathBuf,

    /// PEM private key for the HTTPS listener.
    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key_file: PathBuf,

    /// PEM bundle trusted for the GraphQL service; the platform trust store
    /// is used when unset.
    #[arg(long, env = "GRAPHQL_CACERT_FILE")]
    graphql_cabundle_file: Option<PathBuf>,

    /// Relay endpoint to dial.
    #[arg(long, env = "NATS_ENDPOINT")]
    nats_endpoint: String,

    /// Control API endpoint issuing agent credentials.
    #[arg(long, env = "UPBOUND_API_ENDPOINT")]
    upbound_api_endpoint: String,

    /// Long-lived token identifying this control plane.
    #[arg(long, env = "CONTROL_PLANE_TOKEN", hide_env_values = true)]
    control_plane_token: String,

    /// Disables TLS verification on control API calls. Local testing only.
    #[arg(long)]
    insecure: bool,
}

// === impl Args ===

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if self.debug { "debug" } else { "info" })
        });
        tracing_subscriber::fmt().with_env_filter(filter).init();

        rustls::crypto::ring::default_provider()
            .install_default()
            .map_err(|_| anyhow!("failed to install TLS cryptography provider"))?;

        let control_plane_id = control_plane_id_from_token(&self.control_plane_token)?;
        info!(%control_plane_id, pod = %self.pod_name, "starting agent");

        let api = upbound::ApiClient::new(&self.upbound_api_endpoint, self.insecure)
            .context("failed to build control API client")?;
        let certs = api
            .get_agent_certs(&self.control_plane_token)
            .await
            .context("failed to fetch agent public certs")?;

        let jwt_pem = BASE64
            .decode(certs.jwt_public_key.trim())
            .context("failed to decode token verification key")?;
        let token_public_key = DecodingKey::from_rsa_pem(&jwt_pem)
            .context("failed to parse token verification key")?;

        let graphql_roots = match &self.graphql_cabundle_file {
            Some(path) => {
                let pem = fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Some(kubernetes::root_store_from_pem(&pem)?)
            }
            None => None,
        };

        let config = Config {
            debug: self.debug,
            control_plane_id: control_plane_id.clone(),
            token_public_key,
            graphql_roots,
            bus: BusClientConfig {
                name: format!("{control_plane_id}-{}", self.pod_name),
                endpoint: self.nats_endpoint,
                control_plane_token: self.control_plane_token,
                ca_bundle: certs.nats_ca,
            },
        };

        let kube = kubernetes::RestTarget::from_cluster_env()
            .context("failed to resolve the in-cluster API server")?;
        let kube_http = proxy::http_client(Some(kubernetes::root_store_from_pem(
            &kube.root_ca_pem,
        )?))?;
        let cluster_id = kubernetes::fetch_cluster_id(&kube, &kube_http).await?;
        debug!(%cluster_id, "identified cluster");

        let credentials = Arc::new(bus::CredentialManager::new(
            api,
            config.bus.control_plane_token.clone(),
            cluster_id,
            &config.bus.ca_bundle,
        )?);
        let nats = bus::connect(credentials, &config.bus).await?;

        let ready = Arc::new(AtomicBool::new(false));
        let proxy = Proxy::new(&config, &kube, Arc::new(nats.clone()), ready.clone())?;

        let listener = bus::Listener::spawn(
            nats,
            bus::subject_for_agent(&config.control_plane_id),
            proxy.clone(),
        )
        .await?;

        let tls = server::tls_acceptor(&self.tls_cert_file, &self.tls_key_file)?;
        let tcp = TcpListener::bind(self.server_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.server_addr))?;

        let (drain_tx, drain_rx) = drain::channel();
        tokio::spawn(server::serve(tcp, tls, proxy, drain_rx));
        ready.store(true, Ordering::SeqCst);
        info!("agent is ready");

        wait_for_shutdown_signal().await?;
        info!("shutdown signal received");

        // Readiness drops first so load balancers stop routing to this pod
        // while in-flight work completes.
        ready.store(false, Ordering::SeqCst);

        if let Err(error) = listener.drain().await {
            warn!(%error, "failed to drain bus listener");
        }
        let deadline = time::Instant::now() + BUS_DRAIN_TIMEOUT;
        while listener.is_draining() {
            if time::Instant::now() >= deadline {
                warn!("proxy shutdown: bus drain timed out");
                break;
            }
            debug!("still draining tunneled requests");
            time::sleep(BUS_DRAIN_POLL_INTERVAL).await;
        }

        if time::timeout(SERVER_SHUTDOWN_TIMEOUT, drain_tx.drain())
            .await
            .is_err()
        {
            bail!("proxy shutdown: server drain deadline exceeded");
        }

        info!("shutdown complete");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to wait for SIGINT"),
        _ = sigterm.recv() => Ok(()),
    }
}

/// Reads the control-plane ID from the long-lived token's subject, which is
/// prefixed with `controlPlane|`. The signature is not checked here; the
/// control API authenticates the token on every call that carries it.
fn control_plane_id_from_token(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow!("malformed control plane token"))?;
    let bytes = BASE64_URL
        .decode(payload)
        .context("malformed control plane token payload")?;

    #[derive(Deserialize)]
    struct SubjectClaim {
        #[serde(default)]
        sub: String,
    }
    let sub = serde_json::from_slice::<SubjectClaim>(&bytes)
        .context("malformed control plane token claims")?
        .sub;

    match sub.strip_prefix(CONTROL_PLANE_SUB_PREFIX) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(anyhow!("unexpected subject in control plane token: {sub}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_sub(sub: &str) -> String {
        let payload = BASE64_URL.encode(serde_json::json!({ "sub": sub }).to_string());
        format!("{}.{payload}.{}", BASE64_URL.encode("{}"), BASE64_URL.encode("sig"))
    }

    #[test]
    fn extracts_the_control_plane_id() {
        let token = token_with_sub("controlPlane|cp-1");
        assert_eq!(control_plane_id_from_token(&token).expect("id"), "cp-1");
    }

    #[test]
    fn rejects_subjects_without_the_prefix() {
        let token = token_with_sub("user|42");
        let err = control_plane_id_from_token(&token).unwrap_err();
        assert!(err.to_string().contains("unexpected subject"));
    }

    #[test]
    fn rejects_an_empty_id() {
        let token = token_with_sub("controlPlane|");
        assert!(control_plane_id_from_token(&token).is_err());
    }

    #[test]
    fn rejects_tokens_without_a_payload_segment() {
        let err = control_plane_id_from_token("not-a-jwt").unwrap_err();
        assert_eq!(err.to_string(), "malformed control plane token");
    }

    #[test]
    fn rejects_undecodable_payloads() {
        assert!(control_plane_id_from_token("a.%%%.c").is_err());
    }
}
