//! Patient connection establishment to the receiver.
//!
//! The receiver is usually started by a person after the sender, so the
//! connector retries at a fixed, short interval with no backoff growth and
//! no attempt limit. From the caller's side `connect` only returns once a
//! link is up; the single exit besides success is session cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::MirrorError;
use crate::network::{Dialer, Endpoint};

/// Delay between failed connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Blocking-retry connector shared by the video and control links.
pub struct TransportConnector<D> {
    dialer: Arc<D>,
    retry_delay: Duration,
    attempts: AtomicU64,
}

impl<D: Dialer> TransportConnector<D> {
    pub fn new(dialer: D) -> Self {
        Self::with_retry_delay(dialer, DEFAULT_RETRY_DELAY)
    }

    pub fn with_retry_delay(dialer: D, retry_delay: Duration) -> Self {
        Self {
            dialer: Arc::new(dialer),
            retry_delay,
            attempts: AtomicU64::new(0),
        }
    }

    /// Connect to `endpoint`, retrying until it succeeds.
    ///
    /// Returns [`MirrorError::Cancelled`] only when `cancel` fires; that is
    /// how a stop request interrupts a receiver that never comes up.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<D::Stream, MirrorError> {
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let result = tokio::select! {
                r = self.dialer.dial(endpoint) => r,
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            };

            match result {
                Ok(stream) => {
                    info!(%endpoint, attempt, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%endpoint, attempt, "connect failed: {e}; retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = cancel.cancelled() => return Err(MirrorError::Cancelled),
            }
        }
    }

    /// Total dial attempts made through this connector.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TcpDialer;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Fails the first `failures` dials, then hands out duplex streams.
    struct FlakyDialer {
        failures: Mutex<u32>,
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        type Stream = DuplexStream;

        async fn dial(&self, _endpoint: &Endpoint) -> std::io::Result<DuplexStream> {
            let mut left = self.failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(std::io::ErrorKind::ConnectionRefused.into());
            }
            Ok(tokio::io::duplex(64).0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let connector = TransportConnector::new(FlakyDialer {
            failures: Mutex::new(3),
        });
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        connector
            .connect(&Endpoint::loopback(1), &cancel)
            .await
            .unwrap();

        assert_eq!(connector.attempts(), 4);
        assert_eq!(started.elapsed(), DEFAULT_RETRY_DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry() {
        let connector = TransportConnector::new(FlakyDialer {
            failures: Mutex::new(u32::MAX),
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = connector
            .connect(&Endpoint::loopback(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled));
        assert!(connector.attempts() >= 4);
    }

    #[tokio::test]
    async fn waits_for_late_listener() {
        // Reserve a port, release it, and only start listening after a few retries.
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let connector =
            TransportConnector::with_retry_delay(TcpDialer, Duration::from_millis(20));
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            listener.accept().await.unwrap();
        });

        let stream = tokio::time::timeout(
            Duration::from_secs(5),
            connector.connect(&Endpoint::loopback(port), &cancel),
        )
        .await
        .expect("timeout")
        .unwrap();
        assert!(connector.attempts() > 1);
        drop(stream);
        server.await.unwrap();
    }
}
