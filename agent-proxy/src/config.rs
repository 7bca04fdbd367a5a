use jsonwebtoken::DecodingKey;
use rustls::RootCertStore;

/// Immutable process configuration, built once at startup and handed to each
/// component's constructor.
pub struct Config {
    /// Enables debug-level logging.
    pub debug: bool,

    /// Identifier of the control plane this agent serves, read from the
    /// subject of the long-lived control-plane token.
    pub control_plane_id: String,

    /// RSA public key verifying inbound bearer tokens.
    pub token_public_key: DecodingKey,

    /// Roots trusted when proxying to the in-cluster GraphQL service. When
    /// absent, the platform's native trust store is used.
    pub graphql_roots: Option<RootCertStore>,

    pub bus: BusClientConfig,
}

/// Configuration of the outbound bus session.
#[derive(Clone, Debug)]
pub struct BusClientConfig {
    /// Connection name, visible to the relay operator. Conventionally
    /// `<control-plane-id>-<pod-name>`.
    pub name: String,

    /// Relay endpoint to dial.
    pub endpoint: String,

    /// Long-lived token authenticating credential-issuance calls.
    pub control_plane_token: String,

    /// Base64-encoded PEM bundle trusted for the relay's TLS certificate.
    pub ca_bundle: String,
}
