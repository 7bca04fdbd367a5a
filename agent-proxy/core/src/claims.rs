use serde::{Deserialize, Serialize};

/// Accessor information carried in the custom claims of an inbound bearer
/// token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossplaneAccessor {
    /// Groups the agent should impersonate for this access.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Opaque Upbound identifier of the caller, recorded as impersonation
    /// extra metadata.
    #[serde(rename = "upboundID", default)]
    pub upbound_id: String,
}

/// Decoded claims of an inbound bearer token.
///
/// A token authorizes a request only if its signature verifies under the
/// configured RSA public key with the RS256 algorithm and its audience equals
/// the agent's control-plane identifier. The audience comparison is performed
/// by the router so it can report both the offending and the expected value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub payload: CrossplaneAccessor,

    /// Control plane the token was minted for.
    #[serde(default)]
    pub aud: String,

    #[serde(default)]
    pub sub: String,

    /// Expiry as seconds since the Unix epoch.
    pub exp: i64,
}
