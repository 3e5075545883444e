//! Active HTTP probing.
//!
//! One background task per checker issues a minimal HTTP/1.1 GET to
//! every registered target on a timer and feeds the classified result
//! back into the checker's state machine. The task holds only a weak
//! reference so a dropped checker stops probing on the next tick.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::config::ActiveCheck;

use super::checker::{HealthChecker, ProbeResult, TargetKey};

/// Lower bound for intervals and timeouts so a zero in the
/// configuration cannot produce a busy loop.
const MIN_SECONDS: f64 = 0.01;

/// Spawns the probe loop for a checker.
///
/// Returns None when the checker has no active config or no async
/// runtime is running (passive accounting still works in that case).
pub(crate) fn spawn(checker: &Arc<HealthChecker>) -> Option<JoinHandle<()>> {
    let active = checker.active()?.clone();

    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(
            checker = %checker.name(),
            "no async runtime, active probes disabled"
        );
        return None;
    };

    let weak: Weak<HealthChecker> = Arc::downgrade(checker);
    Some(handle.spawn(probe_loop(weak, active)))
}

async fn probe_loop(weak: Weak<HealthChecker>, active: ActiveCheck) {
    let interval = Duration::from_secs_f64(active.interval.max(MIN_SECONDS));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(checker) = weak.upgrade() else {
            break;
        };
        for key in checker.target_keys() {
            let result = probe_once(&active, &key).await;
            checker.apply_probe(&key, result);
        }
    }
}

async fn probe_once(active: &ActiveCheck, key: &TargetKey) -> ProbeResult {
    let port = active.port.unwrap_or(key.port);
    let deadline = Duration::from_secs_f64(active.timeout.max(MIN_SECONDS));

    match tokio::time::timeout(deadline, exchange(active, &key.host, port, key)).await {
        Err(_) => ProbeResult::TimedOut,
        Ok(Err(_)) => ProbeResult::ConnectFailed,
        Ok(Ok(status)) => ProbeResult::Status(status),
    }
}

/// One GET over a fresh connection; returns the response status code.
async fn exchange(
    active: &ActiveCheck,
    host: &str,
    port: u16,
    key: &TargetKey,
) -> io::Result<u16> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let host_header = key.hostname.as_deref().unwrap_or(host);
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        active.http_path, host_header
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    // Status code from "HTTP/1.1 200 OK".
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed status line"))
}
