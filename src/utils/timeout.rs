//! # Timeouts
//!
//! Default durations for the transport and async timeout wrappers that map
//! elapsed deadlines onto [`ProtocolError`] variants.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for authentication and protocol negotiation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for binding a listener or connecting to an endpoint.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound for stopping a transport.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between client reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Default time a client request waits for its response.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default quiet time before a client sends a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default lifespan and idle limit of a connection: one day.
pub const MAX_CONNECTION_LIFESPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// Run `future`, failing with [`ProtocolError::Timeout`] after `duration`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(future, duration, || ProtocolError::Timeout).await
}

/// Run `future`, failing with the error built by `on_elapsed` after `duration`.
pub async fn with_timeout<F, T, E>(future: F, duration: Duration, on_elapsed: E) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce() -> ProtocolError,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(on_elapsed()),
    }
}
