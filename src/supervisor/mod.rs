//! Connection supervisor
//!
//! Wraps connection establishment in a bounded, fixed-delay retry policy.
//! Only connection-class failures are retried; anything else is returned
//! as-is on the first occurrence. Running out of attempts is fatal for the
//! owning process and is reported as `RelayError::FatalConnection`.
//!
//! A cancelled token interrupts the wait between attempts. Cancellation is
//! not an error: the supervisor returns `Ok(None)`.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::utils::{RelayError, RelayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Retries `connect` under `policy`, sleeping with `tokio::time::sleep`.
pub async fn with_retry<C, F, Fut>(
    connect: F,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> RelayResult<Option<C>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RelayResult<C>>,
{
    with_retry_using(connect, policy, tokio::time::sleep, cancel).await
}

/// Same as [`with_retry`] with an injectable delay function.
pub async fn with_retry_using<C, F, Fut, D, DFut>(
    mut connect: F,
    policy: RetryPolicy,
    mut delay: D,
    cancel: &CancellationToken,
) -> RelayResult<Option<C>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RelayResult<C>>,
    D: FnMut(Duration) -> DFut,
    DFut: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts;
    if max_attempts == 0 {
        error!("Connection attempts disabled (max_attempts = 0)");
        return Err(RelayError::FatalConnection {
            attempts: 0,
            last_error: "no connection attempts allowed".to_string(),
        });
    }
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            info!("Connection attempts cancelled");
            return Ok(None);
        }
        attempt += 1;

        let err = match connect().await {
            Ok(connection) => {
                if attempt > 1 {
                    info!(attempt, "Connected after retry");
                }
                return Ok(Some(connection));
            }
            Err(e) if e.is_connection() => e,
            Err(e) => return Err(e),
        };

        if attempt >= max_attempts {
            error!(attempt, error = %err, "Connection attempts exhausted");
            return Err(RelayError::FatalConnection {
                attempts: attempt,
                last_error: err.to_string(),
            });
        }

        warn!(
            attempt,
            max_attempts,
            delay_secs = policy.delay.as_secs_f64(),
            error = %err,
            "Connection attempt failed, will retry"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Shutdown requested while waiting to reconnect");
                return Ok(None);
            }
            _ = delay(policy.delay) => {}
        }
    }
}
