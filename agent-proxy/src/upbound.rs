//! Client for the control API ("Upbound API").
//!
//! The agent uses exactly two operations: fetching the public material needed
//! to verify tokens and trust the relay, and exchanging the long-lived
//! control-plane token for a short-lived bus credential. Both are modeled on
//! a narrow trait so the credential manager can be tested with in-memory
//! fakes.

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const AGENT_CERTS_PATH: &str = "/v1/gw/certs";
const BUS_TOKEN_PATH: &str = "/v1/nats/token";

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{context} request failed with {status}: {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("empty {0} received")]
    EmptyField(&'static str),
}

/// Public material served by the control API: the key verifying inbound
/// bearer tokens and the CA bundle trusted for the relay's TLS certificate.
/// Both fields are base64-encoded PEM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PublicCerts {
    pub jwt_public_key: String,
    pub nats_ca: String,
}

#[derive(Serialize)]
struct BusTokenRequest<'a> {
    #[serde(rename = "clusterID")]
    cluster_id: &'a str,
    #[serde(rename = "clientPubKey")]
    client_pub_key: &'a str,
}

#[derive(Deserialize)]
struct BusTokenResponse {
    #[serde(default)]
    token: String,
}

/// Narrow surface of the control API consumed by the agent.
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Fetches the token-verification public key and the relay CA bundle.
    ///
    /// Called once at startup; any failure is fatal to the process.
    async fn get_agent_certs(&self, cp_token: &str) -> Result<PublicCerts, Error>;

    /// Exchanges the control-plane token for a fresh bus credential issued to
    /// `client_pub_key`.
    async fn fetch_new_jwt_token(
        &self,
        cp_token: &str,
        cluster_id: &str,
        client_pub_key: &str,
    ) -> Result<String, Error>;
}

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// Builds a client for the control API at `base`. `insecure` disables
    /// certificate verification for local testing only.
    pub fn new(base: &str, insecure: bool) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Client for ApiClient {
    async fn get_agent_certs(&self, cp_token: &str) -> Result<PublicCerts, Error> {
        let rsp = self
            .http
            .get(format!("{}{AGENT_CERTS_PATH}", self.base))
            .bearer_auth(cp_token)
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await?;

        if rsp.status() != StatusCode::OK {
            return Err(Error::Status {
                context: "agent certs",
                status: rsp.status(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }

        let certs = rsp.json::<PublicCerts>().await?;
        if certs.jwt_public_key.is_empty() {
            return Err(Error::EmptyField("jwt public key"));
        }
        if certs.nats_ca.is_empty() {
            return Err(Error::EmptyField("relay ca bundle"));
        }
        Ok(certs)
    }

    async fn fetch_new_jwt_token(
        &self,
        cp_token: &str,
        cluster_id: &str,
        client_pub_key: &str,
    ) -> Result<String, Error> {
        let rsp = self
            .http
            .post(format!("{}{BUS_TOKEN_PATH}", self.base))
            .bearer_auth(cp_token)
            .json(&BusTokenRequest {
                cluster_id,
                client_pub_key,
            })
            .send()
            .await?;

        if rsp.status() != StatusCode::OK {
            return Err(Error::Status {
                context: "bus token",
                status: rsp.status(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }

        let body = rsp.json::<BusTokenResponse>().await?;
        if body.token.is_empty() {
            return Err(Error::EmptyField("token"));
        }
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Response};
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Captured {
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Bytes,
    }

    /// Serves a canned response on an ephemeral port, recording every request
    /// it sees so the test body can assert on them.
    async fn spawn_server(
        status: StatusCode,
        body: &'static str,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: http::Request<hyper::body::Incoming>| {
                        let tx = tx.clone();
                        async move {
                            let (parts, req_body) = req.into_parts();
                            let bytes = req_body.collect().await.expect("request body").to_bytes();
                            let _ = tx.send(Captured {
                                method: parts.method,
                                path: parts.uri.path().to_string(),
                                headers: parts.headers,
                                body: bytes,
                            });
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header(http::header::CONTENT_TYPE, "application/json")
                                    .body(Full::new(Bytes::from_static(body.as_bytes())))
                                    .expect("response builds"),
                            )
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(sock), svc)
                        .await;
                });
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn get_agent_certs_parses_both_fields() {
        let (addr, mut rx) =
            spawn_server(StatusCode::OK, r#"{"jwt_public_key":"cGVt","nats_ca":"Y2E="}"#).await;

        let client = ApiClient::new(&format!("http://{addr}"), false).expect("client builds");
        let certs = client.get_agent_certs("cp-token").await.expect("certs");
        assert_eq!(certs.jwt_public_key, "cGVt");
        assert_eq!(certs.nats_ca, "Y2E=");

        let seen = rx.recv().await.expect("request recorded");
        assert_eq!(seen.method, Method::GET);
        assert_eq!(seen.path, "/v1/gw/certs");
        assert_eq!(seen.headers[http::header::AUTHORIZATION], "Bearer cp-token");
    }

    #[tokio::test]
    async fn get_agent_certs_rejects_non_200() {
        let (addr, _rx) = spawn_server(StatusCode::UNAUTHORIZED, r#"{"error":"nope"}"#).await;
        let client = ApiClient::new(&format!("http://{addr}"), false).expect("client builds");
        let err = client.get_agent_certs("cp-token").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Status {
                status: StatusCode::UNAUTHORIZED,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn get_agent_certs_rejects_empty_fields() {
        let (addr, _rx) =
            spawn_server(StatusCode::OK, r#"{"jwt_public_key":"","nats_ca":"Y2E="}"#).await;
        let client = ApiClient::new(&format!("http://{addr}"), false).expect("client builds");
        let err = client.get_agent_certs("cp-token").await.unwrap_err();
        assert!(matches!(err, Error::EmptyField("jwt public key")));
    }

    #[tokio::test]
    async fn fetch_new_jwt_token_posts_cluster_identity() {
        let (addr, mut rx) = spawn_server(StatusCode::OK, r#"{"token":"jwt-1"}"#).await;

        let client = ApiClient::new(&format!("http://{addr}"), false).expect("client builds");
        let token = client
            .fetch_new_jwt_token("cp-token", "cluster-1", "UABC")
            .await
            .expect("token");
        assert_eq!(token, "jwt-1");

        let seen = rx.recv().await.expect("request recorded");
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.path, "/v1/nats/token");
        assert_eq!(seen.headers[http::header::AUTHORIZATION], "Bearer cp-token");
        let v: serde_json::Value = serde_json::from_slice(&seen.body).expect("json body");
        assert_eq!(v["clusterID"], "cluster-1");
        assert_eq!(v["clientPubKey"], "UABC");
    }

    #[tokio::test]
    async fn fetch_new_jwt_token_rejects_empty_token() {
        let (addr, _rx) = spawn_server(StatusCode::OK, r#"{"token":""}"#).await;
        let client = ApiClient::new(&format!("http://{addr}"), false).expect("client builds");
        let err = client
            .fetch_new_jwt_token("cp-token", "cluster-1", "UABC")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyField("token")));
    }
}
