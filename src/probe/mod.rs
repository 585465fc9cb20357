//! Probe module for resolving connection attempts.
//!
//! Protocol logins are out of scope; the built-in probe checks reachability
//! through the configured route and records any service greeting.

mod tcp;

pub use tcp::*;

use crate::db::{ConnectionAttempt, Status};
use crate::dialer::DialContext;
use crate::manager::{ConnectionManager, ManagerError, Outcome};

use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// Network failures are not errors here: they are recorded on the attempt
/// as a `failed` outcome. Only problems that prevent trying at all surface.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("attempt not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Overall budget for opening the connection, proxy handshake included.
    pub dial_timeout: Duration,
    /// How long to wait for the service to send a greeting.
    pub banner_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(15),
            banner_timeout: Duration::from_secs(2),
        }
    }
}

/// Dial the attempt `id`, record success or failure, and return the stored result.
pub async fn run_probe(
    manager: &ConnectionManager,
    id: &str,
    config: &ProbeConfig,
) -> Result<ConnectionAttempt, ProbeError> {
    let attempt = manager
        .get(id)?
        .ok_or_else(|| ProbeError::NotFound(id.to_string()))?;

    // Proxy misconfiguration is the caller's problem, not the target's.
    let dialer = manager.dialer()?;
    let route = dialer.route();
    let mut logs = attempt.logs.clone();
    logs.push(format!("dialing {}:{} via {}", attempt.host, attempt.port, route));

    let ctx = DialContext::background().with_timeout(config.dial_timeout);
    let outcome = match manager.dial_with(&dialer, &attempt, ctx).await {
        Ok(mut stream) => {
            logs.push("connected".to_string());
            let report = probe_stream(&mut stream, config.banner_timeout).await;
            logs.extend(report.logs);
            Outcome {
                status: Status::Success,
                message: format!("reachable via {}", route),
                result: report.banner.unwrap_or_default(),
                logs,
            }
        }
        Err(ManagerError::Dial(e)) if !e.is_config_error() => {
            tracing::debug!("Probe {} failed: {}", id, e);
            logs.push(format!("dial failed: {}", e));
            Outcome {
                status: Status::Failed,
                message: e.to_string(),
                result: String::new(),
                logs,
            }
        }
        Err(e) => return Err(e.into()),
    };

    manager
        .resolve(id, outcome)?
        .ok_or_else(|| ProbeError::NotFound(id.to_string()))
}
