use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Opaque identity handed over by the session subsystem. Never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// OAuth issuer name, e.g. `google`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Leadership, lock and store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub identity: Identity,
    pub provider: ProviderId,
}

impl CredentialKey {
    pub fn new(identity: Identity, provider: ProviderId) -> Self {
        Self { identity, provider }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.provider)
    }
}

/// The persisted credential for one `(identity, provider)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub provider: ProviderId,
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub refresh_token: Option<Secret<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub id_token: Option<Secret<String>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix seconds. `None` never expires.
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub updated_at: u64,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl StoredCredential {
    /// A bearer credential with no refresh token, revision 0.
    pub fn new(provider: ProviderId, access_token: impl Into<String>) -> Self {
        Self {
            provider,
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            id_token: None,
            token_type: default_token_type(),
            expires_at: None,
            revision: 0,
            updated_at: now_secs(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(token.into()));
        self
    }

    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(Secret::new(token.into()));
        self
    }

    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Usable without refreshing: `now < expires_at - skew`.
    pub fn is_fresh(&self, now: u64, skew: Duration) -> bool {
        self.expires_at
            .is_none_or(|exp| now.saturating_add(skew.as_secs()) < exp)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// The credential that replaces `self` after a successful refresh.
    ///
    /// Providers that don't rotate refresh tokens omit them from the grant,
    /// so the previous refresh and id tokens carry over.
    pub fn superseded_by(&self, grant: TokenGrant, now: u64) -> Self {
        Self {
            provider: self.provider.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| self.refresh_token.clone()),
            id_token: grant.id_token.or_else(|| self.id_token.clone()),
            token_type: grant
                .token_type
                .unwrap_or_else(|| self.token_type.clone()),
            expires_at: grant.expires_in.map(|secs| now.saturating_add(secs)),
            revision: self.revision + 1,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            provider: self.provider.clone(),
            expires_at: self.expires_at,
            revision: self.revision,
            updated_at: self.updated_at,
            has_refresh_token: self.refresh_token.is_some(),
        }
    }
}

/// Secret-free projection of a [`StoredCredential`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub provider: ProviderId,
    pub expires_at: Option<u64>,
    pub revision: u64,
    pub updated_at: u64,
    pub has_refresh_token: bool,
}

/// What a token endpoint hands back for a refresh grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub id_token: Option<Secret<String>>,
    pub token_type: Option<String>,
    /// Lifetime in seconds from now.
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            id_token: None,
            token_type: None,
            expires_in: None,
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(token.into()));
        self
    }

    pub fn with_expires_in(mut self, secs: u64) -> Self {
        self.expires_in = Some(secs);
        self
    }
}

/// Result of one refresh epoch, shared with every waiter.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Success(StoredCredential),
    PermanentFailure {
        reason: String,
    },
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// The credential was invalidated while the epoch was in flight.
    Invalidated,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::PermanentFailure { .. } => "permanent_failure",
            Self::TransientFailure { .. } => "transient_failure",
            Self::Invalidated => "invalidated",
        }
    }
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn serialize_secret<S: Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

pub fn serialize_option_secret<S: Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google() -> ProviderId {
        ProviderId::new("google")
    }

    #[test]
    fn freshness_respects_skew() {
        let skew = Duration::from_secs(30);
        let cred = StoredCredential::new(google(), "a").with_expires_at(1_000);
        assert!(cred.is_fresh(900, skew));
        assert!(!cred.is_fresh(970, skew));
        assert!(!cred.is_expired(970));
        assert!(cred.is_expired(1_000));

        let forever = StoredCredential::new(google(), "a");
        assert!(forever.is_fresh(u64::MAX, skew));
        assert!(!forever.is_expired(u64::MAX));
    }

    #[test]
    fn superseded_keeps_unrotated_tokens() {
        let mut old = StoredCredential::new(google(), "old")
            .with_refresh_token("rt")
            .with_id_token("idt")
            .with_expires_at(10);
        old.revision = 4;

        let next = old.superseded_by(TokenGrant::new("new").with_expires_in(3600), 100);
        assert_eq!(next.access_token.expose_secret(), "new");
        assert_eq!(next.refresh_token.as_ref().unwrap().expose_secret(), "rt");
        assert_eq!(next.id_token.as_ref().unwrap().expose_secret(), "idt");
        assert_eq!(next.expires_at, Some(3700));
        assert_eq!(next.revision, 5);
        assert_eq!(next.updated_at, 100);

        let rotated = old.superseded_by(TokenGrant::new("new").with_refresh_token("rt2"), 100);
        assert_eq!(rotated.refresh_token.unwrap().expose_secret(), "rt2");
        assert_eq!(rotated.expires_at, None);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cred = StoredCredential::new(google(), "super-secret-access").with_refresh_token("rt-xyz");
        let debug = format!("{cred:?}");
        assert!(!debug.contains("super-secret-access"));
        assert!(!debug.contains("rt-xyz"));
    }

    #[test]
    fn serde_round_trip_exposes_tokens_only_in_json() {
        let cred = StoredCredential::new(google(), "at").with_refresh_token("rt");
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["access_token"], "at");
        assert_eq!(json["refresh_token"], "rt");
        assert!(json.get("id_token").is_none());

        let back: StoredCredential = serde_json::from_value(json).unwrap();
        assert_eq!(back.access_token.expose_secret(), "at");
        assert_eq!(back.token_type, "Bearer");
    }

    #[test]
    fn summary_has_no_secrets() {
        let cred = StoredCredential::new(google(), "at").with_refresh_token("rt");
        let summary = cred.summary();
        assert!(summary.has_refresh_token);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("\"at\""));
    }

    #[test]
    fn key_display() {
        let key = CredentialKey::new(Identity::new("user-1"), google());
        assert_eq!(key.to_string(), "user-1/google");
    }
}
