use std::time::Duration;

use crate::types::{CredentialKey, Identity, ProviderId};

/// Credential store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store data: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by a token endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying later: network trouble, throttling, 5xx.
    #[error("transient provider failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The grant is dead: `invalid_grant`, revoked, misconfigured client.
    #[error("permanent provider failure: {reason}")]
    Permanent { reason: String },
}

impl ProviderError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Invalid provider endpoint configuration.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid {field} for provider {provider}: {source}")]
    InvalidUrl {
        provider: ProviderId,
        field: &'static str,
        source: url::ParseError,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors surfaced by the token lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no credential stored for {0}")]
    NoCredential(Identity),
    #[error("token refresh failed: {0}")]
    RefreshFailed(ProviderError),
    #[error("timed out after {waited:?} waiting for refresh of {key}")]
    CoordinatorTimeout { key: CredentialKey, waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no refresh client configured for provider {0}")]
    UnknownProvider(ProviderId),
    #[error("token is not a valid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

impl TokenError {
    /// Whether the same call may succeed later without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RefreshFailed(e) => e.is_transient(),
            Self::CoordinatorTimeout { .. } | Self::Store(_) => true,
            Self::NoCredential(_) | Self::UnknownProvider(_) | Self::InvalidHeader(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TokenError::RefreshFailed(ProviderError::transient("503")).is_retryable());
        assert!(!TokenError::RefreshFailed(ProviderError::permanent("invalid_grant")).is_retryable());
        assert!(!TokenError::NoCredential(Identity::new("u")).is_retryable());
        assert!(TokenError::Store(StoreError::Unavailable("down".into())).is_retryable());
    }

    #[test]
    fn messages_name_the_key() {
        let err = TokenError::CoordinatorTimeout {
            key: CredentialKey::new(Identity::new("u1"), ProviderId::new("google")),
            waited: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "timed out after 2s waiting for refresh of u1/google");
    }
}
