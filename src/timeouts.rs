use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};

/// Four durations configuring one multiplex session.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub idle_timeout: Duration,
    pub linger_delay: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            linger_delay: Duration::from_millis(200),
        }
    }
}

/// Vends scoped cancellation handles linked to a root token, itself linked
/// to a caller-provided parent.
///
/// `cancel()` trips the root permanently, failing every current and future
/// handle; releasing an individual handle (dropping its guard) never
/// affects the root.
#[derive(Debug, Clone)]
pub struct Timeouts {
    root: CancellationToken,
    config: TimeoutConfig,
}

impl Timeouts {
    pub fn new(parent: &CancellationToken, config: TimeoutConfig) -> Self {
        Self {
            root: parent.child_token(),
            config,
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Trips the root cancellation, permanently failing every outstanding
    /// and future handle vended by this Timeouts.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Runs `fut` under a scoped deadline of `duration`, linked to the root
    /// and (transitively) to the session's parent cancellation. On timeout
    /// or cancellation the root is *not* tripped by this call alone — only
    /// explicit `cancel()` does that.
    pub async fn bounded<F, T>(&self, duration: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        self.bounded_linked(duration, None, fut).await
    }

    /// Like `bounded`, but additionally fails fast if `external` fires —
    /// used to honor a caller-supplied cancellation token on the
    /// auto-connect path.
    pub async fn bounded_linked<F, T>(
        &self,
        duration: Duration,
        external: Option<&CancellationToken>,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        let token = self.root.child_token();
        let external_cancelled = async {
            match external {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = token.cancelled() => Err(SessionError::Cancelled),
            _ = external_cancelled => Err(SessionError::Cancelled),
            result = tokio::time::timeout(duration, fut) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(SessionError::Io(err)),
                Err(_elapsed) => Err(SessionError::Cancelled),
            },
        }
    }

    pub async fn connect<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        self.connect_linked(None, fut).await
    }

    pub async fn connect_linked<F, T>(
        &self,
        external: Option<&CancellationToken>,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        match self
            .bounded_linked(self.config.connect_timeout, external, fut)
            .await
        {
            Err(SessionError::Cancelled) => Err(SessionError::ConnectFailed(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            )),
            other => other,
        }
    }

    pub async fn send<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        match self.bounded(self.config.send_timeout, fut).await {
            Err(SessionError::Cancelled) => Err(SessionError::SendTimeout),
            other => other,
        }
    }

    pub async fn receive<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, std::io::Error>>,
    {
        match self.bounded(self.config.idle_timeout, fut).await {
            Err(SessionError::Cancelled) => Err(SessionError::ReceiveTimeout),
            other => other,
        }
    }

    /// Sleeps `linger_delay` or returns early if the root is cancelled.
    pub async fn linger(&self) {
        tokio::select! {
            _ = self.root.cancelled() => {}
            _ = tokio::time::sleep(self.config.linger_delay) => {}
        }
    }

    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }
}
