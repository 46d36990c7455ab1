//! OAuth token lifecycle: cached credentials, single-flight refresh,
//! invalidation with upstream revocation, and the pass-through policy for
//! data connections.

pub mod coordinator;
pub mod defaults;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod memory;
pub mod passthrough;
pub mod provider;
pub mod storage;
pub mod types;

pub use {
    coordinator::{RefreshCoordinator, Ticket},
    defaults::{resolve_all, resolve_endpoint},
    endpoint::{HttpRefreshClient, ProviderEndpoint},
    error::{EndpointError, ProviderError, StoreError, TokenError},
    manager::{ManagerConfig, TokenManager},
    memory::MemoryCredentialStore,
    passthrough::{pass_through_allowed, pass_through_allowed_for},
    provider::{RefreshClient, RetryPolicy, RetryingClient},
    storage::{CredentialStore, FileCredentialStore},
    types::{
        CredentialKey, CredentialSummary, Identity, ProviderId, RefreshOutcome, StoredCredential,
        TokenGrant, now_secs, serialize_option_secret, serialize_secret,
    },
};
