//! Bearer-token review and Kubernetes impersonation identity mapping for the
//! agent proxy.
//!
//! This crate is deliberately free of I/O: it takes request headers and a
//! verification key and produces either validated claims or a typed error.
//! Translating errors into HTTP responses is the router's job.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod claims;
mod impersonate;
mod review;

pub use self::claims::{CrossplaneAccessor, TokenClaims};
pub use self::impersonate::{
    impersonation_config_for_user, ImpersonationConfig, EXTRA_KEY_UPBOUND_ID,
    GROUP_SYSTEM_AUTHENTICATED, IMPERSONATOR_USER,
};
pub use self::review::{review_token, AuthError};
