//! Request router and reverse proxy.
//!
//! Every request, whether it arrived on the direct HTTPS listener or over the
//! bus tunnel, flows through [`Proxy::handle`]. Probe paths are answered
//! locally; everything else is authenticated, mapped to an impersonation
//! identity, and relayed to the Kubernetes API server or the in-cluster
//! GraphQL service.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use bytes::Bytes;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Request, Response, StatusCode, Uri,
};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioExecutor;
use jsonwebtoken::DecodingKey;
use serde_json::json;
use tracing::{debug, warn};

use crate::bus::{Session, Status};
use crate::config::Config;
use crate::core::{impersonation_config_for_user, review_token, ImpersonationConfig};
use crate::kubernetes::{self, RestTarget};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the proxy. Backend responses are relayed
/// without buffering so watch streams flow through untouched.
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Body,
>;

/// Remote address of the ingress connection, attached by the listener so
/// proxy failures can be attributed to a peer.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

const KUBE_PREFIX: &str = "/k8s";
const GRAPHQL_HOST: &str = "https://xgql";

/// Request headers relayed to the backend. Everything else, notably the
/// caller's Authorization header and any cookies, is dropped.
const ALLOWED_HEADERS: [HeaderName; 6] = [
    header::CONTENT_TYPE,
    HeaderName::from_static("x-forwarded-for"),
    HeaderName::from_static("x-forwarded-host"),
    header::ACCEPT_ENCODING,
    header::ACCEPT,
    header::USER_AGENT,
];

const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");
const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(Into::into).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(bytes.into())
        .map_err(Into::into)
        .boxed()
}

/// Boxes a hyper body with a monomorphic error conversion. Spawned futures
/// cannot carry the generic `Into` obligation this replaces.
pub fn incoming_body(body: Incoming) -> Body {
    body.map_err(|error| Box::new(error) as BoxError).boxed()
}

/// Builds the request URI for a backend from its base host plus the rewritten
/// path and the caller's query string.
pub fn backend_uri(host: &Uri, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };
    let mut uri = Uri::builder();
    if let Some(scheme) = host.scheme() {
        uri = uri.scheme(scheme.clone());
    }
    if let Some(authority) = host.authority() {
        uri = uri.authority(authority.clone());
    }
    uri.path_and_query(path_and_query).build()
}

/// Builds an HTTPS-capable client trusting `roots`, or the platform trust
/// store when no explicit roots are configured.
pub fn http_client(roots: Option<rustls::RootCertStore>) -> Result<HttpClient> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = match roots {
        Some(roots) => {
            let tls = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            builder.with_tls_config(tls)
        }
        None => builder.with_native_roots()?,
    };
    let connector = builder.https_or_http().enable_http1().build();
    Ok(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector))
}

/// One upstream the proxy relays to.
#[derive(Clone)]
pub struct Backend {
    host: Uri,
    authorization: HeaderValue,
    host_header: HeaderValue,
    client: HttpClient,
}

impl Backend {
    pub fn new(host: Uri, bearer_token: &str, client: HttpClient) -> Result<Self> {
        let authority = host
            .authority()
            .ok_or_else(|| anyhow::anyhow!("backend URL {host} has no authority"))?;
        let host_header = HeaderValue::from_str(authority.as_str())?;
        let mut authorization = HeaderValue::from_str(&format!("Bearer {bearer_token}"))?;
        authorization.set_sensitive(true);
        Ok(Self {
            host,
            authorization,
            host_header,
            client,
        })
    }
}

#[derive(Clone)]
pub struct Proxy(Arc<Inner>);

struct Inner {
    control_plane_id: String,
    token_key: DecodingKey,
    kube: Backend,
    graphql: Backend,
    bus: Arc<dyn Session>,
    ready: Arc<AtomicBool>,
}

// === impl Proxy ===

impl Proxy {
    /// Builds the production proxy: the Kubernetes backend from the
    /// in-cluster target and the GraphQL backend from the fixed service name,
    /// both authenticated with the pod's service-account token.
    pub fn new(
        config: &Config,
        kube: &RestTarget,
        bus: Arc<dyn Session>,
        ready: Arc<AtomicBool>,
    ) -> Result<Self> {
        let kube_roots = kubernetes::root_store_from_pem(&kube.root_ca_pem)?;
        let kube_backend = Backend::new(
            kube.host.clone(),
            &kube.bearer_token,
            http_client(Some(kube_roots))?,
        )?;

        let graphql_backend = Backend::new(
            Uri::from_static(GRAPHQL_HOST),
            &kube.bearer_token,
            http_client(config.graphql_roots.clone())?,
        )?;

        Ok(Self::from_parts(
            config.control_plane_id.clone(),
            config.token_public_key.clone(),
            kube_backend,
            graphql_backend,
            bus,
            ready,
        ))
    }

    pub fn from_parts(
        control_plane_id: String,
        token_key: DecodingKey,
        kube: Backend,
        graphql: Backend,
        bus: Arc<dyn Session>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self(Arc::new(Inner {
            control_plane_id,
            token_key,
            kube,
            graphql,
            bus,
            ready,
        }))
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_string();
        debug!(method = %req.method(), %path, "routing request");
        match path.as_str() {
            "/livez" => self.livez(),
            "/readyz" => self.readyz(),
            "/query" | "/graphql" => self.relay(req, &self.0.graphql, &path).await,
            p if p == KUBE_PREFIX || p.starts_with("/k8s/") => {
                let stripped = match p.strip_prefix(KUBE_PREFIX) {
                    Some("") | None => "/".to_string(),
                    Some(rest) => rest.to_string(),
                };
                self.relay(req, &self.0.kube, &stripped).await
            }
            _ => {
                let mut rsp = Response::new(empty_body());
                *rsp.status_mut() = StatusCode::NOT_FOUND;
                rsp
            }
        }
    }

    /// Alive iff the bus session is connected; the body names the session
    /// state either way.
    fn livez(&self) -> Response<Body> {
        let bus_status = self.0.bus.status();
        let code = if bus_status == Status::Connected {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json_response(
            code,
            json!({ "status": code.as_u16(), "nats-status": bus_status.to_string() }),
        )
    }

    fn readyz(&self) -> Response<Body> {
        let code = if self.0.ready.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json_response(code, json!({ "status": code.as_u16() }))
    }

    /// Reviews the caller's bearer token and derives the identity to
    /// impersonate. Every failure maps to a 400 with a message naming the
    /// stage that rejected the request.
    fn authorize(&self, headers: &HeaderMap) -> Result<ImpersonationConfig, Response<Body>> {
        let claims = review_token(headers, &self.0.token_key)
            .map_err(|e| bad_request(&format!("unable to validate token: {e}")))?;

        if claims.aud != self.0.control_plane_id {
            return Err(bad_request(&format!(
                "invalid environment id: {}, expecting: {}",
                claims.aud, self.0.control_plane_id
            )));
        }

        impersonation_config_for_user(&claims.payload)
            .map_err(|e| bad_request(&format!("failed to get impersonation config: {e}")))
    }

    async fn relay(&self, req: Request<Body>, backend: &Backend, path: &str) -> Response<Body> {
        let client_addr = req.extensions().get::<ClientAddr>().copied();

        let identity = match self.authorize(req.headers()) {
            Ok(identity) => identity,
            Err(rsp) => return rsp,
        };

        let (parts, body) = req.into_parts();
        let uri = match backend_uri(&backend.host, path, parts.uri.query()) {
            Ok(uri) => uri,
            Err(error) => {
                log_proxy_failure(client_addr, &error.into());
                return server_error();
            }
        };

        let mut out = Request::new(body);
        *out.method_mut() = parts.method;
        *out.uri_mut() = uri;

        let headers = out.headers_mut();
        for name in &ALLOWED_HEADERS {
            for value in parts.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(header::HOST, backend.host_header.clone());
        headers.insert(header::AUTHORIZATION, backend.authorization.clone());
        apply_impersonation(headers, &identity);

        match backend.client.request(out).await {
            Ok(rsp) => rsp.map(incoming_body),
            Err(error) => {
                log_proxy_failure(client_addr, &error.into());
                server_error()
            }
        }
    }
}

fn apply_impersonation(headers: &mut HeaderMap, identity: &ImpersonationConfig) {
    if let Ok(user) = HeaderValue::from_str(&identity.username) {
        headers.insert(IMPERSONATE_USER, user);
    }
    for group in &identity.groups {
        if let Ok(group) = HeaderValue::from_str(group) {
            headers.append(IMPERSONATE_GROUP.clone(), group);
        }
    }
    for (key, values) in &identity.extra {
        let Ok(name) = HeaderName::try_from(format!("{IMPERSONATE_EXTRA_PREFIX}{key}")) else {
            warn!(%key, "skipping impersonation extra with invalid header name");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}

fn log_proxy_failure(client_addr: Option<ClientAddr>, error: &BoxError) {
    match client_addr {
        Some(ClientAddr(addr)) => warn!(client.addr = %addr, %error, "failed to proxy request"),
        None => warn!(%error, "failed to proxy request"),
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut rsp = Response::new(full_body(body.to_string()));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    rsp
}

/// Auth and identity failures carry the reason to the caller. The caller
/// already holds a token, so naming the rejected stage leaks nothing.
fn bad_request(message: &str) -> Response<Body> {
    json_response(StatusCode::BAD_REQUEST, json!({ "message": message }))
}

/// Backend failures stay opaque to the caller; detail goes to the log.
fn server_error() -> Response<Body> {
    let mut rsp = Response::new(empty_body());
    *rsp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    rsp
}
