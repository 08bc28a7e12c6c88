use std::future::pending;

use log::{debug, warn};
use tokio::time::{sleep, timeout};

use super::connection::{Command, Shared};
use crate::adapter::TreeRef;
use crate::queue::ReplyReceiver;
use crate::request::{Request, RequestConfig};
use crate::types::{ErrorKind, NodeList, RedisError, RedisResult, fail};

/// Submits the `HELLO 3` handshake for a fresh socket, before the
/// multiplexer loop runs its first queue poll.  `hello_with_priority`
/// places it ahead of any request waiting for retransmission.
pub(crate) fn start_handshake(shared: &Shared) -> Option<ReplyReceiver> {
    if !shared.config.hello_on_connect {
        return None;
    }
    let config = RequestConfig {
        cancel_if_unresponded: true,
        ..RequestConfig::default()
    };
    let mut req = Request::with_config(config);
    match (&shared.config.username, &shared.config.password) {
        (Some(user), Some(pass)) => {
            req.push("HELLO", (3, "AUTH", user.as_str(), pass.as_str()));
        }
        _ => req.push("HELLO", 3),
    }
    let (_, rx) = shared.submit(req);
    Some(rx)
}

/// The per-session supervisor: confirms the handshake, then probes
/// liveness with tagged PINGs.  Failures are signalled to the multiplexer
/// through the command channel so the teardown path stays in one place;
/// this future itself never resolves.
pub(crate) async fn supervise(shared: &Shared, handshake: Option<ReplyReceiver>) -> RedisError {
    if let Some(rx) = handshake {
        match timeout(shared.config.resp3_handshake_timeout, rx).await {
            Err(_) => {
                shared.send(Command::Fail(RedisError::from((
                    ErrorKind::HandshakeFailed,
                    "Handshake timed out",
                ))));
                return pending().await;
            }
            // The session failed the handshake entry on its own; its error
            // wins.
            Ok(Err(_)) | Ok(Ok(Err(_))) => return pending().await,
            Ok(Ok(Ok(trees))) => {
                if let Err(err) = check_handshake_reply(&trees) {
                    warn!("handshake rejected: {err}");
                    shared.send(Command::Fail(err));
                    return pending().await;
                }
                debug!("RESP3 handshake completed");
            }
        }
    }

    let interval = shared.config.health_check_interval;
    if interval.is_zero() {
        return pending().await;
    }
    let mut misses = 0u32;
    loop {
        sleep(interval).await;
        let healthy = matches!(timeout(interval, ping(shared)).await, Ok(Ok(())));
        if healthy {
            misses = 0;
            continue;
        }
        misses += 1;
        warn!("health check went unanswered ({misses}/2)");
        if misses >= 2 {
            shared.send(Command::Fail(RedisError::from((
                ErrorKind::PongTimeout,
                "Server stopped answering health checks",
            ))));
            return pending().await;
        }
    }
}

fn check_handshake_reply(trees: &[NodeList]) -> RedisResult<()> {
    let Some(root) = trees.first().map(|tree| TreeRef::new(tree).root().ok()).flatten() else {
        fail!((ErrorKind::HandshakeFailed, "Empty handshake reply"));
    };
    if root.kind.is_error() {
        let message =
            String::from_utf8_lossy(root.value.as_blob().unwrap_or_default()).into_owned();
        fail!((
            ErrorKind::HandshakeFailed,
            "Server rejected the handshake",
            message
        ));
    }
    Ok(())
}

async fn ping(shared: &Shared) -> RedisResult<()> {
    let config = RequestConfig {
        cancel_if_unresponded: true,
        ..RequestConfig::default()
    };
    let mut req = Request::with_config(config);
    let tag = format!("{:08x}", rand::random::<u32>());
    req.push("PING", tag.as_str());
    let trees = shared.submit_and_wait(req).await?;
    let answered = trees
        .first()
        .and_then(|tree| TreeRef::new(tree).root().ok())
        .is_some_and(|root| !root.kind.is_error());
    if answered {
        Ok(())
    } else {
        fail!((ErrorKind::PongTimeout, "Unexpected health check reply"))
    }
}
