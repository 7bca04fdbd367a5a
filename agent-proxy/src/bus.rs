//! Outbound message-bus session.
//!
//! The agent holds one long-lived connection to the relay. Authentication is
//! callback-driven: on every (re)connect the relay sends a nonce, the agent
//! presents a short-lived user JWT obtained from the control API and signs
//! the nonce with a process-local nkey. Requests tunneled over the bus are
//! JSON envelopes that round-trip through the same [`Proxy`] as direct
//! ingress.

use std::{
    fmt,
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use http::{Method, Request, Response};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::BusClientConfig;
use crate::proxy::{full_body, Body, Proxy};
use crate::upbound;

/// Subject this agent serves requests on.
pub fn subject_for_agent(control_plane_id: &str) -> String {
    format!("platforms.{control_plane_id}.gateway")
}

/// Coarse connection state reported by liveness probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Connected,
    Pending,
    Disconnected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => "connected".fmt(f),
            Self::Pending => "pending".fmt(f),
            Self::Disconnected => "disconnected".fmt(f),
        }
    }
}

impl From<async_nats::connection::State> for Status {
    fn from(state: async_nats::connection::State) -> Self {
        match state {
            async_nats::connection::State::Connected => Self::Connected,
            async_nats::connection::State::Pending => Self::Pending,
            async_nats::connection::State::Disconnected => Self::Disconnected,
        }
    }
}

/// Narrow view of the bus connection consumed by the router's probes.
pub trait Session: Send + Sync + 'static {
    fn status(&self) -> Status;
}

impl Session for async_nats::Client {
    fn status(&self) -> Status {
        self.connection_state().into()
    }
}

// === impl CredentialManager ===

/// Manages the short-lived bus credential and the process-local nkey.
///
/// The signing keypair never leaves memory; only its public half is sent to
/// the credential-issuance endpoint. The cached user JWT is refreshed lazily,
/// when a connect attempt finds it expired or undecodable.
pub struct CredentialManager<C> {
    api: C,
    control_plane_token: String,
    cluster_id: String,
    keypair: nkeys::KeyPair,
    public_key: String,
    cached_jwt: Mutex<Option<String>>,
    // Holds the decoded relay CA bundle; removed on drop.
    ca_file: tempfile::NamedTempFile,
}

impl<C: upbound::Client> CredentialManager<C> {
    pub fn new(
        api: C,
        control_plane_token: String,
        cluster_id: String,
        ca_bundle_b64: &str,
    ) -> Result<Self> {
        let keypair = nkeys::KeyPair::new_user();
        let public_key = keypair.public_key();

        let pem = BASE64
            .decode(ca_bundle_b64.trim())
            .context("failed to decode relay ca bundle")?;
        let mut ca_file =
            tempfile::NamedTempFile::new().context("failed to create relay ca file")?;
        ca_file
            .write_all(&pem)
            .and_then(|()| ca_file.flush())
            .context("failed to write relay ca file")?;

        Ok(Self {
            api,
            control_plane_token,
            cluster_id,
            keypair,
            public_key,
            cached_jwt: Mutex::new(None),
            ca_file,
        })
    }

    /// Trust-anchor file for the relay's TLS certificate.
    pub fn ca_path(&self) -> &Path {
        self.ca_file.path()
    }

    /// Returns the cached user JWT, refreshing it first if it is absent,
    /// expired, or not decodable as user claims. A refresh failure leaves the
    /// cache untouched so the next attempt starts from the same state.
    pub async fn user_jwt(&self) -> Result<String, upbound::Error> {
        let mut cached = self.cached_jwt.lock().await;
        if let Some(jwt) = cached.as_ref() {
            if credential_is_valid(jwt) {
                return Ok(jwt.clone());
            }
            debug!("cached bus credential is no longer valid, refreshing");
        }

        let jwt = self
            .api
            .fetch_new_jwt_token(&self.control_plane_token, &self.cluster_id, &self.public_key)
            .await?;
        *cached = Some(jwt.clone());
        info!("fetched new bus credential");
        Ok(jwt)
    }

    pub fn sign_nonce(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        self.keypair
            .sign(nonce)
            .map_err(|e| anyhow::anyhow!("failed to sign connection nonce: {e}"))
    }
}

/// A credential is reusable while it parses as a three-segment JWT whose
/// payload carries an unexpired `exp`. Anything else triggers a refresh
/// rather than an error: the issuer is the authority on validity.
fn credential_is_valid(jwt: &str) -> bool {
    let mut segments = jwt.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) if segments.next().is_none() => payload,
        _ => return false,
    };
    let Ok(bytes) = BASE64_URL.decode(payload) else {
        return false;
    };

    #[derive(Deserialize)]
    struct ExpClaim {
        exp: i64,
    }
    let Ok(claims) = serde_json::from_slice::<ExpClaim>(&bytes) else {
        return false;
    };
    claims.exp > now_unix()
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Produces the auth material for one connect handshake: the (possibly
/// refreshed) user JWT plus the nonce signed with the process-local nkey.
async fn auth_for_nonce<C: upbound::Client>(
    manager: &CredentialManager<C>,
    nonce: &[u8],
) -> Result<async_nats::Auth, async_nats::AuthError> {
    let jwt = manager
        .user_jwt()
        .await
        .map_err(|e| async_nats::AuthError::new(e.to_string()))?;
    let signature = manager
        .sign_nonce(nonce)
        .map_err(|e| async_nats::AuthError::new(e.to_string()))?;

    let mut auth = async_nats::Auth::new();
    auth.jwt = Some(jwt);
    auth.signature = Some(signature);
    Ok(auth)
}

/// Dials the relay. The auth callback runs on every reconnect, so credential
/// refresh keeps working across relay restarts without any push channel.
pub async fn connect<C: upbound::Client>(
    manager: Arc<CredentialManager<C>>,
    config: &BusClientConfig,
) -> Result<async_nats::Client> {
    let auth_manager = manager.clone();
    let client = async_nats::ConnectOptions::with_auth_callback(move |nonce| {
        // The refresh awaits a boxed future, which is not Sync; running it on
        // its own task keeps the callback future Sync as the client requires.
        let manager = auth_manager.clone();
        let refresh = tokio::spawn(async move { auth_for_nonce(manager.as_ref(), &nonce).await });
        async move {
            refresh
                .await
                .map_err(|e| async_nats::AuthError::new(e.to_string()))?
        }
    })
    .name(&config.name)
    .require_tls(true)
    .add_root_certificates(manager.ca_path().to_path_buf())
    .max_reconnects(None)
    .event_callback(|event| async move {
        info!(%event, "bus connection event");
    })
    .connect(&config.endpoint)
    .await
    .with_context(|| format!("failed to connect to relay at {}", config.endpoint))?;

    info!(endpoint = %config.endpoint, name = %config.name, "connected to relay");
    Ok(client)
}

/// HTTP request tunneled over the bus. Bodies are base64 since the envelope
/// is JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

impl RequestEnvelope {
    pub fn into_request(self) -> Result<Request<Body>> {
        let method =
            Method::from_bytes(self.method.as_bytes()).context("invalid envelope method")?;
        let mut builder = Request::builder().method(method).uri(self.uri);
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        let body = BASE64
            .decode(&self.body)
            .context("invalid envelope body encoding")?;
        builder
            .body(full_body(body))
            .context("failed to build tunneled request")
    }
}

impl ResponseEnvelope {
    /// Buffers the response into an envelope. Tunneled requests are unary;
    /// watch streams are only served on the direct listener.
    pub async fn from_response(rsp: Response<Body>) -> Result<Self> {
        let (parts, body) = rsp.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let bytes: Bytes = body
            .collect()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read tunneled response body: {e}"))?
            .to_bytes();
        Ok(Self {
            status: parts.status.as_u16(),
            headers,
            body: BASE64.encode(&bytes),
        })
    }
}

// === impl Listener ===

/// Serves tunneled requests from the agent's subject until drained.
pub struct Listener {
    stop: watch::Sender<bool>,
    draining: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    client: async_nats::Client,
}

impl Listener {
    pub async fn spawn(client: async_nats::Client, subject: String, proxy: Proxy) -> Result<Self> {
        let mut subscriber = client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        info!(%subject, "serving tunneled requests");

        let (stop, mut stop_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let task_client = client.clone();
        let task_in_flight = in_flight.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        task_in_flight.fetch_add(1, Ordering::SeqCst);
                        let proxy = proxy.clone();
                        let client = task_client.clone();
                        let in_flight = task_in_flight.clone();
                        tokio::spawn(async move {
                            serve_message(proxy, client, msg).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                }
            }
            debug!("stopped consuming tunneled requests");
        });

        Ok(Self {
            stop,
            draining: Arc::new(AtomicBool::new(false)),
            in_flight,
            client,
        })
    }

    /// Stops consuming new requests; already-accepted ones keep running and
    /// are tracked by [`Listener::is_draining`].
    pub async fn drain(&self) -> Result<()> {
        self.draining.store(true, Ordering::SeqCst);
        let _ = self.stop.send(true);
        self.client
            .flush()
            .await
            .context("failed to flush bus connection")
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst) && self.in_flight.load(Ordering::SeqCst) > 0
    }
}

async fn serve_message(proxy: Proxy, client: async_nats::Client, msg: async_nats::Message) {
    let Some(reply) = msg.reply.clone() else {
        warn!(subject = %msg.subject, "dropping tunneled request without reply subject");
        return;
    };

    let rsp = match serde_json::from_slice::<RequestEnvelope>(&msg.payload) {
        Ok(envelope) => match envelope.into_request() {
            Ok(req) => proxy.handle(req).await,
            Err(error) => {
                warn!(%error, "rejecting malformed tunneled request");
                bad_envelope()
            }
        },
        Err(error) => {
            warn!(%error, "rejecting undecodable tunneled request");
            bad_envelope()
        }
    };

    let envelope = match ResponseEnvelope::from_response(rsp).await {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(%error, "failed to encode tunneled response");
            ResponseEnvelope {
                status: http::StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                headers: Vec::new(),
                body: String::new(),
            }
        }
    };

    match serde_json::to_vec(&envelope) {
        Ok(bytes) => {
            if let Err(error) = client.publish(reply, bytes.into()).await {
                warn!(%error, "failed to publish tunneled response");
            }
        }
        Err(error) => warn!(%error, "failed to serialize tunneled response"),
    }
}

fn bad_envelope() -> Response<Body> {
    let mut rsp = Response::new(crate::proxy::empty_body());
    *rsp.status_mut() = http::StatusCode::BAD_REQUEST;
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn fake_jwt(exp: i64) -> String {
        let payload = BASE64_URL.encode(serde_json::json!({ "exp": exp }).to_string());
        format!("{}.{payload}.{}", BASE64_URL.encode("{}"), BASE64_URL.encode("sig"))
    }

    #[test]
    fn unexpired_credential_is_valid() {
        assert!(credential_is_valid(&fake_jwt(now_unix() + 600)));
    }

    #[test]
    fn expired_credential_is_invalid() {
        assert!(!credential_is_valid(&fake_jwt(now_unix() - 600)));
    }

    #[test]
    fn malformed_credentials_are_invalid() {
        assert!(!credential_is_valid(""));
        assert!(!credential_is_valid("only-one-segment"));
        assert!(!credential_is_valid("a.b"));
        assert!(!credential_is_valid("a.b.c.d"));
        let garbage_payload = format!("h.{}.s", BASE64_URL.encode("not json"));
        assert!(!credential_is_valid(&garbage_payload));
    }

    struct CountingApi {
        fetches: AtomicUsize,
        exp_offset: i64,
    }

    impl CountingApi {
        fn new(exp_offset: i64) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                exp_offset,
            }
        }
    }

    #[async_trait]
    impl upbound::Client for CountingApi {
        async fn get_agent_certs(&self, _: &str) -> Result<upbound::PublicCerts, upbound::Error> {
            unimplemented!("not used by the credential manager")
        }

        async fn fetch_new_jwt_token(
            &self,
            cp_token: &str,
            cluster_id: &str,
            client_pub_key: &str,
        ) -> Result<String, upbound::Error> {
            assert_eq!(cp_token, "cp-token");
            assert_eq!(cluster_id, "cluster-1");
            assert!(client_pub_key.starts_with('U'), "user nkeys start with U");
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{n}", fake_jwt(now_unix() + self.exp_offset)))
        }
    }

    fn manager(exp_offset: i64) -> CredentialManager<CountingApi> {
        let ca_b64 = BASE64.encode("-----BEGIN CERTIFICATE-----\n...\n-----END CERTIFICATE-----\n");
        CredentialManager::new(
            CountingApi::new(exp_offset),
            "cp-token".to_string(),
            "cluster-1".to_string(),
            &ca_b64,
        )
        .expect("manager builds")
    }

    #[tokio::test]
    async fn valid_cached_credential_is_not_refetched() {
        let manager = manager(3600);
        let first = manager.user_jwt().await.expect("first fetch");
        let second = manager.user_jwt().await.expect("cache hit");
        assert_eq!(first, second);
        assert_eq!(manager.api.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cached_credential_triggers_refresh() {
        let manager = manager(-60);
        let first = manager.user_jwt().await.expect("first fetch");
        let second = manager.user_jwt().await.expect("refresh");
        assert_ne!(first, second);
        assert_eq!(manager.api.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ca_bundle_is_written_to_disk() {
        let manager = manager(3600);
        let written = std::fs::read_to_string(manager.ca_path()).expect("ca file exists");
        assert!(written.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn auth_material_carries_the_jwt_and_raw_signature_bytes() {
        let manager = manager(3600);
        let auth = auth_for_nonce(&manager, b"nonce-1").await.expect("auth");

        let jwt = auth.jwt.expect("jwt is set");
        assert_eq!(jwt, manager.user_jwt().await.expect("cached jwt"));

        // The signature is handed over as raw bytes; the client does its own
        // wire encoding.
        let signature = auth.signature.expect("signature is set");
        let public = nkeys::KeyPair::from_public_key(&manager.public_key).expect("public key");
        public.verify(b"nonce-1", &signature).expect("verifies");
    }

    #[test]
    fn nonce_signatures_verify_with_the_advertised_key() {
        let manager = manager(3600);
        let signature = manager.sign_nonce(b"nonce-1").expect("signs");
        let public = nkeys::KeyPair::from_public_key(&manager.public_key).expect("public key");
        public.verify(b"nonce-1", &signature).expect("verifies");
    }

    #[test]
    fn subject_embeds_the_control_plane_id() {
        assert_eq!(subject_for_agent("cp-1"), "platforms.cp-1.gateway");
    }

    #[tokio::test]
    async fn envelopes_round_trip_a_request_and_response() {
        let envelope = RequestEnvelope {
            method: "POST".to_string(),
            uri: "/k8s/api/v1/pods?watch=false".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: BASE64.encode(r#"{"kind":"Pod"}"#),
        };
        let req = envelope.into_request().expect("request builds");
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().path(), "/k8s/api/v1/pods");
        assert_eq!(req.uri().query(), Some("watch=false"));
        assert_eq!(req.headers()[http::header::CONTENT_TYPE], "application/json");
        let bytes = req.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(bytes, r#"{"kind":"Pod"}"#);

        let rsp = Response::builder()
            .status(http::StatusCode::CREATED)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(full_body("{}"))
            .expect("response builds");
        let envelope = ResponseEnvelope::from_response(rsp).await.expect("encodes");
        assert_eq!(envelope.status, 201);
        assert!(envelope
            .headers
            .contains(&("content-type".to_string(), "application/json".to_string())));
        assert_eq!(envelope.body, BASE64.encode("{}"));
    }

    #[tokio::test]
    async fn malformed_envelope_method_is_rejected() {
        let envelope = RequestEnvelope {
            method: "NOT A METHOD".to_string(),
            uri: "/readyz".to_string(),
            headers: Vec::new(),
            body: String::new(),
        };
        assert!(envelope.into_request().is_err());
    }
}
