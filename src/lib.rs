//! LFX v2 authentication service
//!
//! A request/reply facade between client applications and pluggable
//! identity providers, addressed over NATS subjects.
//!
//! # Architecture
//!
//! - **Dispatcher**: queue-group subscriptions, one reply per request
//! - **Orchestrator**: payload decoding, sanitization, adapter dispatch
//! - **Providers**: hosted (management API + JWKS + passwordless OTP),
//!   local (KV bucket projected into the IdP's users file), and an
//!   in-memory mock
//! - **Token pipeline**: bearer parsing, RS256 verification, claim policy
//!
//! The service is a facade: it never becomes a system of record for
//! credentials.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod http;
pub mod password;
pub mod providers;
pub mod redact;
pub mod service;
pub mod sidecar;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Handle for changing the log filter at runtime (debug sidecar route).
pub type LogLevelHandle =
    tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Setup tracing/logging. Returns the reload handle for the filter.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<LogLevelHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = tracing_subscriber::reload::Layer::new(filter);

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(handle)
}
