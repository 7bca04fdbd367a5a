//! Resolution of the in-cluster Kubernetes API server target.
//!
//! The agent reaches the API server the way any in-cluster workload does:
//! the well-known service environment variables plus the mounted
//! service-account credentials. No typed Kubernetes client is needed since
//! every request is relayed verbatim on behalf of an impersonated identity.

use std::{env, fs, path::Path};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::Uri;
use http_body_util::BodyExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const SERVICEACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum Error {
    #[error("not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),

    #[error("failed to read service account credential {path}: {source}")]
    Credential {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse API server URL: {0}")]
    Url(#[from] http::uri::InvalidUri),
}

/// Connection parameters for the in-cluster API server.
#[derive(Clone, Debug)]
pub struct RestTarget {
    pub host: Uri,
    pub bearer_token: String,
    /// PEM bundle trusted for the API server's certificate.
    pub root_ca_pem: Vec<u8>,
}

impl RestTarget {
    pub fn new(host: Uri, bearer_token: String, root_ca_pem: Vec<u8>) -> Self {
        Self {
            host,
            bearer_token,
            root_ca_pem,
        }
    }

    /// Resolves the API server from the pod environment and the mounted
    /// service-account credentials.
    pub fn from_cluster_env() -> Result<Self, Error> {
        let host = env::var(SERVICE_HOST_ENV).map_err(|_| Error::NotInCluster(SERVICE_HOST_ENV))?;
        let port = env::var(SERVICE_PORT_ENV).map_err(|_| Error::NotInCluster(SERVICE_PORT_ENV))?;
        let host = format!("https://{host}:{port}").parse::<Uri>()?;

        let dir = Path::new(SERVICEACCOUNT_DIR);
        let bearer_token = read_credential(&dir.join("token"))
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())?;
        let root_ca_pem = read_credential(&dir.join("ca.crt"))?;

        debug!(%host, "resolved in-cluster API server");
        Ok(Self {
            host,
            bearer_token,
            root_ca_pem,
        })
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, Error> {
    fs::read(path).map_err(|source| Error::Credential {
        path: path.display().to_string(),
        source,
    })
}

#[derive(Deserialize)]
struct NamespaceObject {
    #[serde(default)]
    metadata: NamespaceMetadata,
}

#[derive(Default, Deserialize)]
struct NamespaceMetadata {
    #[serde(default)]
    uid: String,
}

/// Fetches the cluster identifier: the UID of the kube-system namespace.
///
/// The credential-issuance endpoint keys bus credentials on this value, so a
/// missing or empty UID is a startup error.
pub async fn fetch_cluster_id(
    target: &RestTarget,
    client: &crate::proxy::HttpClient,
) -> Result<String> {
    let uri = crate::proxy::backend_uri(&target.host, "/api/v1/namespaces/kube-system", None)?;
    let req = http::Request::builder()
        .uri(uri)
        .header(
            http::header::AUTHORIZATION,
            format!("Bearer {}", target.bearer_token),
        )
        .header(http::header::ACCEPT, "application/json")
        .body(crate::proxy::empty_body())
        .context("failed to build kube-system request")?;

    let rsp = client
        .request(req)
        .await
        .context("failed to get kube-system namespace")?;
    if rsp.status() != http::StatusCode::OK {
        bail!(
            "failed to get kube-system namespace: unexpected status {}",
            rsp.status()
        );
    }

    let bytes: Bytes = rsp
        .into_body()
        .collect()
        .await
        .map_err(|e| anyhow::anyhow!("failed to read kube-system response: {e}"))?
        .to_bytes();
    let ns: NamespaceObject =
        serde_json::from_slice(&bytes).context("failed to decode kube-system namespace")?;
    if ns.metadata.uid.is_empty() {
        bail!("metadata.uid of kube-system namespace is empty");
    }
    Ok(ns.metadata.uid)
}

/// Parses a PEM bundle into a rustls root store.
pub fn root_store_from_pem(pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    let mut reader = std::io::BufReader::new(pem);
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.context("failed to parse ca certificate")?;
        roots.add(cert).context("failed to trust ca certificate")?;
    }
    if roots.is_empty() {
        bail!("no certificates found in ca bundle");
    }
    Ok(roots)
}
