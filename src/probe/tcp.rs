//! TCP reachability probe: the connection is the success criterion, and
//! whatever greeting the service sends first is captured as the result.

use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest greeting kept as an attempt's result.
pub const MAX_BANNER_BYTES: usize = 256;

/// What was observed on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub banner: Option<String>,
    pub logs: Vec<String>,
}

/// Wait up to `timeout` for the peer to speak first.
pub async fn probe_stream<S>(stream: &mut S, timeout: Duration) -> StreamReport
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_BANNER_BYTES];
    let start = Instant::now();

    match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
        Ok(Ok(0)) => StreamReport {
            banner: None,
            logs: vec!["peer closed the connection without a greeting".to_string()],
        },
        Ok(Ok(n)) => {
            let banner = clean_banner(&buf[..n]);
            StreamReport {
                logs: vec![format!(
                    "received {} byte greeting after {}ms",
                    n,
                    start.elapsed().as_millis()
                )],
                banner: Some(banner),
            }
        }
        Ok(Err(e)) => StreamReport {
            banner: None,
            logs: vec![format!("read failed: {}", e)],
        },
        Err(_) => StreamReport {
            banner: None,
            logs: vec![format!("no greeting within {}ms", timeout.as_millis())],
        },
    }
}

/// Lossy UTF-8 with control characters other than tab removed.
fn clean_banner(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .filter(|c| !c.is_control() || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}
