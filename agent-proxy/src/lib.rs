//! Cluster-resident agent proxy.
//!
//! The agent dials out to a message-bus relay, authenticates the outbound
//! session with a short-lived credential obtained from the control API, and
//! serves HTTP requests arriving both on a direct HTTPS listener and over the
//! bus tunnel. Each proxied request carries a bearer token that is reviewed
//! and mapped to a Kubernetes impersonation identity before being forwarded.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use upbound_agent_core as core;

mod args;
pub mod bus;
pub mod config;
pub mod kubernetes;
pub mod proxy;
pub mod server;
pub mod upbound;

pub use self::args::Args;
