use std::collections::HashMap;

use tracing::debug;

use crate::{AuthError, CrossplaneAccessor};

/// Synthetic username the agent impersonates on behalf of every caller.
pub const IMPERSONATOR_USER: &str = "upbound-cloud-impersonator";

/// Marker group appended to every derived identity.
pub const GROUP_SYSTEM_AUTHENTICATED: &str = "system:authenticated";

/// Impersonation extra key carrying the caller's opaque identifier.
pub const EXTRA_KEY_UPBOUND_ID: &str = "upbound-id";

/// Identity applied to the outbound transport on behalf of the caller.
///
/// Derived per request and never cached.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImpersonationConfig {
    pub username: String,
    pub groups: Vec<String>,
    pub extra: HashMap<String, Vec<String>>,
}

/// Maps validated accessor claims to a Kubernetes impersonation identity.
///
/// Caller-supplied groups keep their order; the authenticated marker is
/// appended last. RBAC rules on the cluster side may bind to either.
pub fn impersonation_config_for_user(
    accessor: &CrossplaneAccessor,
) -> Result<ImpersonationConfig, AuthError> {
    debug!(upbound_id = %accessor.upbound_id, groups = ?accessor.groups, "impersonating user");

    if accessor.upbound_id.is_empty() {
        return Err(AuthError::UpboundIdMissing);
    }

    let mut groups = accessor.groups.clone();
    groups.push(GROUP_SYSTEM_AUTHENTICATED.to_string());

    Ok(ImpersonationConfig {
        username: IMPERSONATOR_USER.to_string(),
        groups,
        extra: HashMap::from([(
            EXTRA_KEY_UPBOUND_ID.to_string(),
            vec![accessor.upbound_id.clone()],
        )]),
    })
}
