//! SOCKS5 client (RFC 1928) with optional username/password auth (RFC 1929).

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{DialError, Route, Target, DIRECT_CONNECT_TIMEOUT};

/// Upper bound on the greeting/auth/connect exchange once the proxy accepted the TCP connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Username/password credentials for the proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for Socks5Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Auth")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// Dials targets through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: Target,
    auth: Option<Socks5Auth>,
}

impl Socks5Dialer {
    pub fn new(host: &str, port: &str, auth: Option<Socks5Auth>) -> Result<Self, DialError> {
        if host.trim().is_empty() {
            return Err(DialError::InvalidProxy(format!("{}:{}", host, port)));
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| DialError::InvalidProxy(format!("{}:{}", host, port)))?;

        Ok(Self {
            proxy: Target::new(host, port),
            auth,
        })
    }

    pub fn proxy(&self) -> &Target {
        &self.proxy
    }

    pub fn auth(&self) -> Option<&Socks5Auth> {
        self.auth.as_ref()
    }

    pub(super) fn route(&self) -> Route {
        Route::Socks5 {
            proxy: self.proxy.to_string(),
        }
    }

    /// Open a tunnel to `target` through the proxy.
    pub async fn connect(&self, target: &Target) -> Result<TcpStream, DialError> {
        let route = self.route();

        let mut stream = match tokio::time::timeout(
            DIRECT_CONNECT_TIMEOUT,
            TcpStream::connect((self.proxy.host.as_str(), self.proxy.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DialError::Io {
                    target: target.to_string(),
                    route,
                    source,
                })
            }
            Err(_) => {
                return Err(DialError::Timeout {
                    target: target.to_string(),
                    route,
                    timeout: DIRECT_CONNECT_TIMEOUT,
                })
            }
        };

        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut stream, target, self.auth.as_ref()),
        )
        .await
        {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(HandshakeError::Io(source))) => Err(DialError::Io {
                target: target.to_string(),
                route,
                source,
            }),
            Ok(Err(HandshakeError::Rejected(reason))) => Err(DialError::Proxy {
                target: target.to_string(),
                route,
                reason,
            }),
            Err(_) => Err(DialError::Timeout {
                target: target.to_string(),
                route,
                timeout: HANDSHAKE_TIMEOUT,
            }),
        }
    }
}

#[derive(Debug)]
pub(super) enum HandshakeError {
    Io(std::io::Error),
    Rejected(String),
}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

fn rejected(reason: impl Into<String>) -> HandshakeError {
    HandshakeError::Rejected(reason.into())
}

/// Negotiate auth and issue CONNECT for `target` over an open proxy stream.
pub(super) async fn handshake<S>(
    stream: &mut S,
    target: &Target,
    auth: Option<&Socks5Auth>,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = match auth {
        Some(_) => &[VERSION, 2, METHOD_NONE, METHOD_USER_PASS],
        None => &[VERSION, 1, METHOD_NONE],
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(rejected(format!("unexpected protocol version {:#04x}", choice[0])));
    }

    match (choice[1], auth) {
        (METHOD_NONE, _) => {}
        (METHOD_USER_PASS, Some(auth)) => authenticate(stream, auth).await?,
        (METHOD_USER_PASS, None) => return Err(rejected("proxy requires authentication")),
        (METHOD_UNACCEPTABLE, _) => return Err(rejected("no acceptable authentication method")),
        (other, _) => {
            return Err(rejected(format!("unsupported authentication method {:#04x}", other)))
        }
    }

    let request = connect_request(target)?;
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(rejected(format!("unexpected protocol version {:#04x}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(rejected(format!("{} ({:#04x})", reply_message(head[1]), head[1])));
    }

    // Bound address is read and discarded.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(rejected(format!("unknown address type {:#04x}", other))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn authenticate<S>(stream: &mut S, auth: &Socks5Auth) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.user.as_bytes();
    let pass = auth.pass.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(rejected("proxy credentials longer than 255 bytes"));
    }

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(AUTH_VERSION);
    msg.push(user.len() as u8);
    msg.extend_from_slice(user);
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass);
    stream.write_all(&msg).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(rejected("proxy authentication failed"));
    }
    Ok(())
}

fn connect_request(target: &Target) -> Result<Vec<u8>, HandshakeError> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];

    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = target.host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(rejected(format!("invalid target host {:?}", target.host)));
            }
            req.push(ATYP_DOMAIN);
            req.push(name.len() as u8);
            req.extend_from_slice(name);
        }
    }

    req.extend_from_slice(&target.port.to_be_bytes());
    Ok(req)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
