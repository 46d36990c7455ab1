use std::time::Duration;

use {async_trait::async_trait, secrecy::Secret, tokenward_config::RetrySettings, tracing::warn};

use crate::{error::ProviderError, types::TokenGrant};

/// Talks to a provider's token endpoint.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    /// Exchange a refresh token for a new grant.
    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant, ProviderError>;

    /// Revoke a token upstream. Best-effort from the manager's point of view.
    async fn revoke(&self, token: &Secret<String>) -> Result<(), ProviderError>;
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    ///
    /// A server hint longer than `max_delay` gives up immediately so the
    /// caller can surface it as a cooldown instead of sleeping on it.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match hint {
            Some(hint) if hint > self.max_delay => None,
            Some(hint) => Some(hint),
            None => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
            },
        }
    }
}

/// Retries transient failures of the wrapped client. Permanent ones pass through.
#[derive(Debug, Clone)]
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: RefreshClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match call().await {
                Ok(v) => return Ok(v),
                Err(e @ ProviderError::Permanent { .. }) => return Err(e),
                Err(e) => e,
            };
            let hint = match &err {
                ProviderError::Transient { retry_after, .. } => *retry_after,
                ProviderError::Permanent { .. } => None,
            };
            let Some(delay) = self.policy.delay_for(attempt, hint) else {
                return Err(err);
            };
            warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient provider failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<C: RefreshClient> RefreshClient for RetryingClient<C> {
    async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenGrant, ProviderError> {
        self.with_retry("refresh", move || self.inner.refresh(refresh_token))
            .await
    }

    async fn revoke(&self, token: &Secret<String>) -> Result<(), ProviderError> {
        self.with_retry("revoke", move || self.inner.revoke(token)).await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        secrecy::ExposeSecret,
        std::{
            collections::VecDeque,
            sync::{
                Mutex,
                atomic::{AtomicUsize, Ordering},
            },
        },
    };

    struct Scripted {
        responses: Mutex<VecDeque<Result<TokenGrant, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(responses: Vec<Result<TokenGrant, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RefreshClient for Scripted {
        async fn refresh(&self, _: &Secret<String>) -> Result<TokenGrant, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::transient("script exhausted")))
        }

        async fn revoke(&self, _: &Secret<String>) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    fn token() -> Secret<String> {
        Secret::new("rt".into())
    }

    #[rstest]
    #[case(1, None, Some(100))]
    #[case(2, None, Some(200))]
    #[case(3, None, Some(400))]
    #[case(5, None, None)]
    #[case(1, Some(700), Some(700))]
    #[case(1, Some(5_000), None)]
    fn backoff_schedule(#[case] attempt: u32, #[case] hint_ms: Option<u64>, #[case] expected_ms: Option<u64>) {
        let delay = policy(5).delay_for(attempt, hint_ms.map(Duration::from_millis));
        assert_eq!(delay, expected_ms.map(Duration::from_millis));
    }

    #[test]
    fn backoff_is_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };
        assert_eq!(p.delay_for(6, None), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let client = RetryingClient::new(
            Scripted::new(vec![
                Err(ProviderError::transient("503")),
                Err(ProviderError::transient("503")),
                Ok(TokenGrant::new("fresh")),
            ]),
            policy(3),
        );
        let grant = client.refresh(&token()).await.unwrap();
        assert_eq!(grant.access_token.expose_secret(), "fresh");
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_is_not_retried() {
        let client = RetryingClient::new(
            Scripted::new(vec![Err(ProviderError::permanent("invalid_grant"))]),
            policy(3),
        );
        let err = client.refresh(&token()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { .. }));
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let client = RetryingClient::new(Scripted::new(vec![]), policy(2));
        let err = client.refresh(&token()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_is_surfaced_not_slept() {
        let client = RetryingClient::new(
            Scripted::new(vec![Err(ProviderError::Transient {
                reason: "429".into(),
                retry_after: Some(Duration::from_secs(60)),
            })]),
            policy(3),
        );
        let err = client.refresh(&token()).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Transient { retry_after: Some(d), .. } if d == Duration::from_secs(60)
        ));
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 1);
    }
}
