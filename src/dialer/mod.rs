//! Dialer resolution for outbound connection attempts.
//!
//! A [`Dialer`] is chosen from the live [`RuntimeConfig`]: a direct TCP dial
//! when the proxy is disabled, or a SOCKS5 tunnel when it is enabled. Both
//! variants are driven by async futures, so every dial honors the deadline
//! and cancellation signal carried by a [`DialContext`]. No retries happen
//! here; the first failure is returned with the target and route attached.

mod socks5;

pub use socks5::*;

use crate::config::RuntimeConfig;

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Connect timeout for direct dials (and for reaching the proxy itself).
pub const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The only proxy kind accepted by [`Dialer::from_config`].
pub const PROXY_TYPE_SOCKS5: &str = "socks5";

/// Dial error types.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("unsupported proxy type: {0:?}")]
    UnsupportedProxy(String),
    #[error("invalid proxy address: {0}")]
    InvalidProxy(String),
    #[error("invalid target port: {0:?}")]
    InvalidPort(String),
    #[error("{route} dial to {target} timed out after {timeout:?}")]
    Timeout {
        target: String,
        route: Route,
        timeout: Duration,
    },
    #[error("{route} dial to {target} failed: {source}")]
    Io {
        target: String,
        route: Route,
        #[source]
        source: io::Error,
    },
    #[error("{route} dial to {target} rejected: {reason}")]
    Proxy {
        target: String,
        route: Route,
        reason: String,
    },
    #[error("{route} dial to {target} cancelled")]
    Cancelled { target: String, route: Route },
}

impl DialError {
    /// True for errors caused by the proxy settings rather than the network.
    pub fn is_config_error(&self) -> bool {
        matches!(self, DialError::UnsupportedProxy(_) | DialError::InvalidProxy(_))
    }
}

/// How a dial reaches its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Socks5 { proxy: String },
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Direct => f.write_str("direct"),
            Route::Socks5 { proxy } => write!(f, "socks5 proxy {}", proxy),
        }
    }
}

/// A resolved `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        }
    }

    /// Build a target from stored strings. The port may be a number or a
    /// well-known service name.
    pub fn parse(host: &str, port: &str) -> Result<Self, DialError> {
        let port = resolve_port(port).ok_or_else(|| DialError::InvalidPort(port.to_string()))?;
        Ok(Self::new(host.trim(), port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Numeric port, or the port of a well-known TCP service.
pub fn resolve_port(port: &str) -> Option<u16> {
    let port = port.trim();
    if let Ok(n) = port.parse::<u16>() {
        return Some(n);
    }
    let n = match port.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "smtp" => 25,
        "http" => 80,
        "pop3" => 110,
        "imap" => 143,
        "https" => 443,
        "smb" | "microsoft-ds" => 445,
        "mssql" | "ms-sql-s" => 1433,
        "mysql" => 3306,
        "rdp" | "ms-wbt-server" => 3389,
        "postgres" | "postgresql" => 5432,
        "vnc" => 5900,
        "redis" => 6379,
        _ => return None,
    };
    Some(n)
}

/// Deadline and cancellation for a single dial.
///
/// The cancel channel fires on the first message, and also when every
/// sender has been dropped.
#[derive(Debug, Default)]
pub struct DialContext {
    deadline: Option<Instant>,
    cancel: Option<broadcast::Receiver<()>>,
}

impl DialContext {
    /// No deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    pub fn with_cancel(mut self, cancel: broadcast::Receiver<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Direct TCP dialer with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    timeout: Duration,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self {
            timeout: DIRECT_CONNECT_TIMEOUT,
        }
    }
}

impl DirectDialer {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn connect(&self, target: &Target) -> Result<TcpStream, DialError> {
        match tokio::time::timeout(self.timeout, TcpStream::connect((target.host.as_str(), target.port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(DialError::Io {
                target: target.to_string(),
                route: Route::Direct,
                source,
            }),
            Err(_) => Err(DialError::Timeout {
                target: target.to_string(),
                route: Route::Direct,
                timeout: self.timeout,
            }),
        }
    }
}

/// A dialer resolved from the current configuration.
#[derive(Debug, Clone)]
pub enum Dialer {
    Direct(DirectDialer),
    Socks5(Socks5Dialer),
}

impl Dialer {
    /// Pick the dialer described by `cfg`.
    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self, DialError> {
        let proxy = &cfg.proxy;
        if !proxy.enabled {
            return Ok(Dialer::Direct(DirectDialer::default()));
        }

        if proxy.proxy_type != PROXY_TYPE_SOCKS5 {
            return Err(DialError::UnsupportedProxy(proxy.proxy_type.clone()));
        }

        let auth = if proxy.user.is_empty() {
            None
        } else {
            Some(Socks5Auth {
                user: proxy.user.clone(),
                pass: proxy.pass.clone(),
            })
        };

        Ok(Dialer::Socks5(Socks5Dialer::new(&proxy.host, &proxy.port, auth)?))
    }

    pub fn route(&self) -> Route {
        match self {
            Dialer::Direct(_) => Route::Direct,
            Dialer::Socks5(d) => d.route(),
        }
    }

    /// Dial with no deadline beyond the dialer's own timeouts.
    pub async fn dial(&self, target: &Target) -> Result<TcpStream, DialError> {
        self.dial_context(target, DialContext::background()).await
    }

    /// Dial, giving up at the context deadline or when it is cancelled.
    pub async fn dial_context(&self, target: &Target, ctx: DialContext) -> Result<TcpStream, DialError> {
        let DialContext { deadline, cancel } = ctx;
        let route = self.route();
        tracing::debug!("Dialing {} ({})", target, route);

        let connect = async {
            match self {
                Dialer::Direct(d) => d.connect(target).await,
                Dialer::Socks5(d) => d.connect(target).await,
            }
        };

        let bounded = async {
            match deadline {
                Some(deadline) => {
                    let budget = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout_at(deadline, connect).await {
                        Ok(result) => result,
                        Err(_) => Err(DialError::Timeout {
                            target: target.to_string(),
                            route: self.route(),
                            timeout: budget,
                        }),
                    }
                }
                None => connect.await,
            }
        };

        match cancel {
            Some(mut cancel) => {
                tokio::select! {
                    result = bounded => result,
                    _ = cancel.recv() => Err(DialError::Cancelled {
                        target: target.to_string(),
                        route,
                    }),
                }
            }
            None => bounded.await,
        }
    }
}
