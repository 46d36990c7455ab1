//! Token lifecycle manager: cached lookups, single-flight refresh,
//! invalidation and the pass-through header decision.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    dashmap::DashMap,
    reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue},
    secrecy::{ExposeSecret, Secret},
    tokenward_config::{ConnectionConfig, ManagerSettings},
    tokio::{task::JoinSet, time::Instant},
    tracing::{debug, error, info, warn},
};

use crate::{
    coordinator::{KeyGuard, LeaderTicket, RefreshCoordinator, Ticket},
    error::{ProviderError, StoreError, TokenError},
    passthrough,
    provider::RefreshClient,
    storage::CredentialStore,
    types::{CredentialKey, CredentialSummary, Identity, ProviderId, RefreshOutcome, StoredCredential, now_secs},
};

const ID_TOKEN_HEADER: &str = "x-id-token";

/// How long an invalidated identity's tombstone outlives the store delete.
/// Only lookups that read the store before the delete need it.
const TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Construction-time tuning for [`TokenManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Tokens this close to expiry are refreshed before use.
    pub expiry_skew: Duration,
    /// Bound on one provider round trip, retries included.
    pub refresh_timeout: Duration,
    /// How long a caller waits for a refresh epoch to publish.
    pub wait_bound: Duration,
    pub save_attempts: u32,
    pub save_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ManagerSettings::default())
    }
}

impl From<&ManagerSettings> for ManagerConfig {
    fn from(s: &ManagerSettings) -> Self {
        Self {
            expiry_skew: Duration::from_secs(s.expiry_skew_secs),
            refresh_timeout: Duration::from_secs(s.refresh_timeout_secs),
            wait_bound: Duration::from_secs(s.follower_wait_secs()),
            save_attempts: s.save_attempts.max(1),
            save_retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
enum CacheSlot {
    Live(StoredCredential),
    /// Invalidated. Blocks store reads from resurrecting the credential.
    Tombstoned { since: Instant },
}

impl CacheSlot {
    fn tombstone() -> Self {
        Self::Tombstoned {
            since: Instant::now(),
        }
    }

    fn live(&self) -> Option<&StoredCredential> {
        match self {
            Self::Live(c) => Some(c),
            Self::Tombstoned { .. } => None,
        }
    }
}

struct Inner {
    store: Arc<dyn CredentialStore>,
    clients: HashMap<ProviderId, Arc<dyn RefreshClient>>,
    coordinator: RefreshCoordinator,
    cache: DashMap<Identity, CacheSlot>,
    cooldowns: DashMap<CredentialKey, Instant>,
    config: ManagerConfig,
    revocations: Mutex<JoinSet<()>>,
}

/// Process-wide token service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clients: HashMap<ProviderId, Arc<dyn RefreshClient>>,
        config: ManagerConfig,
    ) -> Self {
        // The watchdog only catches leaders that stall past their own timeout.
        let watchdog = config
            .refresh_timeout
            .saturating_mul(2)
            .saturating_add(config.save_retry_delay.saturating_mul(config.save_attempts));
        Self {
            inner: Arc::new(Inner {
                store,
                clients,
                coordinator: RefreshCoordinator::new(watchdog, config.wait_bound),
                cache: DashMap::new(),
                cooldowns: DashMap::new(),
                config,
                revocations: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.inner.clients.keys()
    }

    /// Hand-off from the identity subsystem: persist and cache a credential.
    ///
    /// Clears any tombstone on the identity and bumps the revision past the
    /// one it replaces.
    pub async fn store_credential(
        &self,
        identity: &Identity,
        mut credential: StoredCredential,
    ) -> Result<StoredCredential, TokenError> {
        let key = CredentialKey::new(identity.clone(), credential.provider.clone());
        let _guard = self.inner.coordinator.lock(&key).await;

        let cached = self
            .inner
            .cache
            .get(identity)
            .and_then(|slot| slot.live().filter(|c| c.provider == key.provider).map(|c| c.revision));
        let stored = self
            .inner
            .store
            .load(identity, &key.provider)
            .await?
            .map(|c| c.revision);
        if let Some(previous) = cached.max(stored) {
            credential.revision = credential.revision.max(previous + 1);
        }
        credential.updated_at = now_secs();

        self.inner.store.save(identity, &credential).await?;
        self.inner
            .cache
            .insert(identity.clone(), CacheSlot::Live(credential.clone()));
        self.inner.cooldowns.remove(&key);
        info!(%identity, provider = %key.provider, revision = credential.revision, "credential stored");
        Ok(credential)
    }

    /// The identity's current credential, refreshing it first if it is
    /// expired or about to expire.
    pub async fn current_token(&self, identity: &Identity) -> Result<StoredCredential, TokenError> {
        let Some(credential) = self.lookup(identity).await? else {
            return Err(TokenError::NoCredential(identity.clone()));
        };

        let now = now_secs();
        if credential.is_fresh(now, self.inner.config.expiry_skew) {
            return Ok(credential);
        }

        if credential.refresh_token.is_none() {
            if !credential.is_expired(now) {
                return Ok(credential);
            }
            let key = CredentialKey::new(identity.clone(), credential.provider.clone());
            warn!(%key, "credential expired and cannot be refreshed");
            let mut guard = self.inner.coordinator.lock(&key).await;
            self.retire_locked(&key, &mut guard, true).await?;
            return Err(TokenError::RefreshFailed(ProviderError::permanent(
                "credential expired and has no refresh token",
            )));
        }

        self.refresh(identity, credential, false).await
    }

    /// Read-only view of the identity's credential. Never refreshes.
    pub async fn has_stored_credential(
        &self,
        identity: &Identity,
    ) -> Result<Option<CredentialSummary>, TokenError> {
        Ok(self.lookup(identity).await?.map(|c| c.summary()))
    }

    /// Refresh regardless of expiry, through the same single-flight path.
    pub async fn force_refresh(&self, identity: &Identity) -> Result<StoredCredential, TokenError> {
        let Some(credential) = self.lookup(identity).await? else {
            return Err(TokenError::NoCredential(identity.clone()));
        };
        if credential.refresh_token.is_none() {
            return Err(TokenError::RefreshFailed(ProviderError::permanent(
                "credential has no refresh token",
            )));
        }
        self.refresh(identity, credential, true).await
    }

    /// Drop every credential of `identity` and revoke them upstream in the
    /// background. Idempotent.
    pub async fn invalidate(&self, identity: &Identity) -> Result<(), TokenError> {
        self.sweep();
        let cached = self
            .inner
            .cache
            .get(identity)
            .and_then(|slot| slot.live().map(|c| c.provider.clone()));
        let mut providers = self.inner.store.providers(identity).await?;
        providers.extend(cached);
        providers.sort();
        providers.dedup();

        // Each key is tombstoned under its own lock, the one epochs publish under.
        let mut victims: BTreeMap<ProviderId, StoredCredential> = BTreeMap::new();
        for provider in providers {
            let key = CredentialKey::new(identity.clone(), provider);
            let mut guard = self.inner.coordinator.lock(&key).await;
            if let Some(c) = self.retire_locked(&key, &mut guard, false).await? {
                keep_newest(&mut victims, c);
            }
            drop(guard);
            self.inner.cooldowns.remove(&key);
        }

        info!(%identity, credentials = victims.len(), "identity invalidated");
        #[cfg(feature = "metrics")]
        metrics::counter!("tokenward_oauth_invalidations_total").increment(1);

        for credential in victims.into_values() {
            self.spawn_revocation(identity, credential);
        }
        Ok(())
    }

    /// Drop and revoke one provider's credential, leaving the identity's
    /// others in place.
    pub async fn invalidate_provider(
        &self,
        identity: &Identity,
        provider: &ProviderId,
    ) -> Result<(), TokenError> {
        self.sweep();
        let key = CredentialKey::new(identity.clone(), provider.clone());
        let mut guard = self.inner.coordinator.lock(&key).await;
        let displaced = self.retire_locked(&key, &mut guard, true).await?;
        drop(guard);
        self.inner.cooldowns.remove(&key);

        info!(%key, "credential invalidated");
        #[cfg(feature = "metrics")]
        metrics::counter!("tokenward_oauth_invalidations_total").increment(1);

        if let Some(credential) = displaced {
            self.spawn_revocation(identity, credential);
        }
        Ok(())
    }

    /// Whether the connection opted in to forwarding user tokens.
    pub fn pass_through_allowed(&self, connection: &ConnectionConfig) -> bool {
        passthrough::pass_through_allowed(connection)
    }

    /// Headers to forward to `connection` on behalf of `identity`, if any.
    ///
    /// Connections without pass-through never touch the cache or store.
    pub async fn pass_through_headers(
        &self,
        identity: &Identity,
        connection: &ConnectionConfig,
    ) -> Result<Option<HeaderMap>, TokenError> {
        if !passthrough::pass_through_allowed(connection) {
            return Ok(None);
        }
        let Some(current) = self.lookup(identity).await? else {
            return Err(TokenError::NoCredential(identity.clone()));
        };
        if !passthrough::pass_through_allowed_for(connection, &current.provider) {
            debug!(%identity, provider = %current.provider, connection = %connection.uid, "provider not allowed for pass-through");
            return Ok(None);
        }

        let credential = self.current_token(identity).await?;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!(
            "{} {}",
            credential.token_type,
            credential.access_token.expose_secret()
        ))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        if let Some(id_token) = &credential.id_token {
            let mut value = HeaderValue::from_str(id_token.expose_secret())?;
            value.set_sensitive(true);
            headers.insert(HeaderName::from_static(ID_TOKEN_HEADER), value);
        }
        Ok(Some(headers))
    }

    /// Wait for background revocations to finish.
    pub async fn flush_revocations(&self) {
        let mut pending = std::mem::take(&mut *self.revocations());
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "revocation task failed");
            }
        }
    }

    fn revocations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .revocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached credential, falling back to the store on a miss.
    async fn lookup(&self, identity: &Identity) -> Result<Option<StoredCredential>, TokenError> {
        if let Some(slot) = self.inner.cache.get(identity) {
            return Ok(slot.live().cloned());
        }
        let Some(loaded) = self.inner.store.latest(identity).await? else {
            return Ok(None);
        };
        // An invalidation that raced this read wins: only fill a vacant slot.
        let slot = self
            .inner
            .cache
            .entry(identity.clone())
            .or_insert(CacheSlot::Live(loaded));
        Ok(slot.live().cloned())
    }

    /// Tombstone and delete one key. Caller holds the key lock.
    ///
    /// With `fall_back`, the identity's cache slot moves on to its next most
    /// recent credential instead of staying tombstoned. Returns the newest
    /// copy of the removed credential, for revocation.
    async fn retire_locked(
        &self,
        key: &CredentialKey,
        guard: &mut KeyGuard,
        fall_back: bool,
    ) -> Result<Option<StoredCredential>, StoreError> {
        guard.bump();
        let displaced = self.tombstone_slot(key);
        let stored = self.inner.store.load(&key.identity, &key.provider).await?;
        self.inner.store.delete(&key.identity, &key.provider).await?;

        if fall_back
            && let Some(next) = self.inner.store.latest(&key.identity).await?
        {
            self.inner.cache.alter(&key.identity, |_, slot| match slot {
                CacheSlot::Tombstoned { .. } => CacheSlot::Live(next.clone()),
                live => live,
            });
        }

        Ok(match (displaced, stored) {
            (Some(a), Some(b)) => Some(if b.revision > a.revision { b } else { a }),
            (a, b) => a.or(b),
        })
    }

    /// Tombstone the identity's slot if it holds this key's credential.
    fn tombstone_slot(&self, key: &CredentialKey) -> Option<StoredCredential> {
        let mut slot = self
            .inner
            .cache
            .entry(key.identity.clone())
            .or_insert_with(CacheSlot::tombstone);
        if slot
            .live()
            .is_some_and(|c| c.provider != key.provider)
        {
            return None;
        }
        match std::mem::replace(&mut *slot, CacheSlot::tombstone()) {
            CacheSlot::Live(c) => Some(c),
            CacheSlot::Tombstoned { .. } => None,
        }
    }

    /// Whether the key's credential was removed while the caller wasn't
    /// holding its lock. Caller holds the key lock.
    async fn retired(&self, key: &CredentialKey) -> bool {
        let cached = self.inner.cache.get(&key.identity).map(|slot| slot.value().clone());
        match cached {
            Some(CacheSlot::Tombstoned { .. }) => return true,
            Some(CacheSlot::Live(c)) if c.provider == key.provider => return false,
            _ => {},
        }
        match self.inner.store.load(&key.identity, &key.provider).await {
            Ok(found) => found.is_none(),
            Err(e) => {
                warn!(%key, error = %e, "cannot confirm credential still exists, discarding refresh");
                true
            },
        }
    }

    /// Drop tombstones past their TTL and cooldowns that have run out.
    fn sweep(&self) {
        let now = Instant::now();
        self.inner.cache.retain(|_, slot| match slot {
            CacheSlot::Tombstoned { since } => now.duration_since(*since) < TOMBSTONE_TTL,
            CacheSlot::Live(_) => true,
        });
        self.inner.cooldowns.retain(|_, until| *until > now);
    }

    fn cooldown_remaining(&self, key: &CredentialKey) -> Option<Duration> {
        let until = *self.inner.cooldowns.get(key)?;
        let now = Instant::now();
        if now >= until {
            self.inner.cooldowns.remove_if(key, |_, u| *u <= now);
            return None;
        }
        Some(until - now)
    }

    async fn refresh(
        &self,
        identity: &Identity,
        prior: StoredCredential,
        force: bool,
    ) -> Result<StoredCredential, TokenError> {
        let key = CredentialKey::new(identity.clone(), prior.provider.clone());
        let Some(client) = self.inner.clients.get(&key.provider).cloned() else {
            return Err(TokenError::UnknownProvider(key.provider));
        };

        if let Some(remaining) = self.cooldown_remaining(&key) {
            debug!(%key, ?remaining, "provider cooling down, not refreshing");
            return self.resolve(identity, &prior, !force, RefreshOutcome::TransientFailure {
                reason: "provider asked to back off".into(),
                retry_after: Some(remaining),
            });
        }

        let ticket = match self.inner.coordinator.acquire(&key) {
            Ticket::Leader(leader) => {
                let follower = leader.subscribe();
                let generation = self.inner.coordinator.lock(&key).await.generation();
                // Detached so an abandoned caller doesn't cancel everyone's refresh.
                let manager = self.clone();
                let start = prior.clone();
                tokio::spawn(async move {
                    manager.run_epoch(leader, client, start, generation, force).await;
                });
                follower
            },
            Ticket::Follower(follower) => {
                #[cfg(feature = "metrics")]
                metrics::counter!("tokenward_oauth_refresh_coalesced_total").increment(1);
                follower
            },
        };

        let outcome = self.inner.coordinator.wait(ticket).await?;
        self.resolve(identity, &prior, !force, outcome)
    }

    /// Turn an epoch outcome into this caller's answer.
    fn resolve(
        &self,
        identity: &Identity,
        prior: &StoredCredential,
        allow_prior: bool,
        outcome: RefreshOutcome,
    ) -> Result<StoredCredential, TokenError> {
        match outcome {
            RefreshOutcome::Success(credential) => Ok(credential),
            RefreshOutcome::PermanentFailure { reason } => {
                Err(TokenError::RefreshFailed(ProviderError::Permanent { reason }))
            },
            RefreshOutcome::TransientFailure {
                reason,
                retry_after,
            } => {
                if allow_prior && prior.is_fresh(now_secs(), self.inner.config.expiry_skew) {
                    warn!(%identity, provider = %prior.provider, %reason, "refresh failed, serving current token");
                    return Ok(prior.clone());
                }
                Err(TokenError::RefreshFailed(ProviderError::Transient {
                    reason,
                    retry_after,
                }))
            },
            RefreshOutcome::Invalidated => Err(TokenError::NoCredential(identity.clone())),
        }
    }

    /// One refresh epoch, run by the leader in its own task.
    ///
    /// `generation` is the key's generation when the epoch was acquired; a
    /// result published under any other generation, or after the credential
    /// was removed, is discarded.
    async fn run_epoch(
        self,
        leader: LeaderTicket,
        client: Arc<dyn RefreshClient>,
        prior: StoredCredential,
        generation: u64,
        force: bool,
    ) {
        let key = leader.key().clone();
        let epoch = leader.epoch();
        let base = self.newest_known(&key, prior).await;

        if !force && base.is_fresh(now_secs(), self.inner.config.expiry_skew) {
            debug!(%key, epoch, revision = base.revision, "credential already refreshed elsewhere");
            let guard = self.inner.coordinator.lock(&key).await;
            let outcome = if guard.generation() == generation && !self.retired(&key).await {
                self.inner
                    .cache
                    .insert(key.identity.clone(), CacheSlot::Live(base.clone()));
                RefreshOutcome::Success(base)
            } else {
                RefreshOutcome::Invalidated
            };
            self.finish(leader, outcome);
            return;
        }

        let result = match &base.refresh_token {
            Some(token) => {
                match tokio::time::timeout(self.inner.config.refresh_timeout, client.refresh(token)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::transient(format!(
                        "token endpoint did not answer within {:?}",
                        self.inner.config.refresh_timeout
                    ))),
                }
            },
            None => Err(ProviderError::permanent("credential has no refresh token")),
        };

        let mut guard = self.inner.coordinator.lock(&key).await;
        let outcome = if guard.generation() != generation || self.retired(&key).await {
            info!(%key, epoch, "credential invalidated during refresh, discarding result");
            if let Ok(grant) = result {
                let orphan = grant.refresh_token.unwrap_or(grant.access_token);
                self.spawn_token_revocation(&key, client, orphan);
            }
            RefreshOutcome::Invalidated
        } else {
            match result {
                Ok(grant) => self.commit(&key, &base, base.superseded_by(grant, now_secs())).await,
                Err(ProviderError::Permanent { reason }) => {
                    warn!(%key, epoch, %reason, "refresh rejected, dropping credential");
                    if let Err(e) = self.retire_locked(&key, &mut guard, true).await {
                        error!(%key, error = %e, "failed to delete rejected credential");
                    }
                    RefreshOutcome::PermanentFailure { reason }
                },
                Err(ProviderError::Transient {
                    reason,
                    retry_after,
                }) => {
                    warn!(%key, epoch, %reason, "refresh failed");
                    if let Some(delay) = retry_after {
                        self.inner.cooldowns.insert(key.clone(), Instant::now() + delay);
                    }
                    RefreshOutcome::TransientFailure {
                        reason,
                        retry_after,
                    }
                },
            }
        };
        self.finish(leader, outcome);
        drop(guard);
    }

    fn finish(&self, leader: LeaderTicket, outcome: RefreshOutcome) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tokenward_oauth_refresh_total", "outcome" => outcome.label()).increment(1);
        self.inner.coordinator.publish(leader, outcome);
    }

    /// The highest-revision copy of this key among the epoch's starting
    /// credential, the cache and the store.
    async fn newest_known(&self, key: &CredentialKey, prior: StoredCredential) -> StoredCredential {
        let mut newest = prior;
        let cached = self
            .inner
            .cache
            .get(&key.identity)
            .and_then(|slot| slot.live().filter(|c| c.provider == key.provider).cloned());
        if let Some(c) = cached
            && c.revision > newest.revision
        {
            newest = c;
        }
        match self.inner.store.load(&key.identity, &key.provider).await {
            Ok(Some(c)) if c.revision > newest.revision => newest = c,
            Ok(_) => {},
            Err(e) => warn!(%key, error = %e, "store read before refresh failed"),
        }
        newest
    }

    /// Persist a refreshed credential and make it current. Caller holds the key lock.
    async fn commit(
        &self,
        key: &CredentialKey,
        base: &StoredCredential,
        refreshed: StoredCredential,
    ) -> RefreshOutcome {
        // A hand-off that landed mid-epoch is newer than what we fetched.
        let current = self
            .inner
            .cache
            .get(&key.identity)
            .and_then(|slot| slot.live().filter(|c| c.provider == key.provider).cloned());
        if let Some(current) = current
            && current.revision > base.revision
        {
            debug!(%key, revision = current.revision, "credential replaced during refresh, keeping replacement");
            return RefreshOutcome::Success(current);
        }

        let attempts = self.inner.config.save_attempts.max(1);
        let mut persisted = false;
        for attempt in 1..=attempts {
            match self.inner.store.save(&key.identity, &refreshed).await {
                Ok(()) => {
                    persisted = true;
                    break;
                },
                Err(e) => {
                    warn!(%key, attempt, error = %e, "failed to persist refreshed credential");
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.save_retry_delay).await;
                    }
                },
            }
        }
        if !persisted {
            error!(%key, revision = refreshed.revision, "refreshed credential is held in memory only");
        }

        self.inner
            .cache
            .insert(key.identity.clone(), CacheSlot::Live(refreshed.clone()));
        self.inner.cooldowns.remove(key);
        info!(%key, revision = refreshed.revision, expires_at = ?refreshed.expires_at, "credential refreshed");
        RefreshOutcome::Success(refreshed)
    }

    fn spawn_revocation(&self, identity: &Identity, credential: StoredCredential) {
        let key = CredentialKey::new(identity.clone(), credential.provider.clone());
        let Some(client) = self.inner.clients.get(&key.provider).cloned() else {
            debug!(%key, "no client for provider, skipping revocation");
            return;
        };
        let token = credential.refresh_token.unwrap_or(credential.access_token);
        self.spawn_token_revocation(&key, client, token);
    }

    fn spawn_token_revocation(&self, key: &CredentialKey, client: Arc<dyn RefreshClient>, token: Secret<String>) {
        let key = key.clone();
        let mut pending = self.revocations();
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            match client.revoke(&token).await {
                Ok(()) => debug!(%key, "credential revoked upstream"),
                Err(e) => warn!(%key, error = %e, "upstream revocation failed"),
            }
        });
    }
}

fn keep_newest(victims: &mut BTreeMap<ProviderId, StoredCredential>, credential: StoredCredential) {
    match victims.get(&credential.provider) {
        Some(existing) if existing.revision >= credential.revision => {},
        _ => {
            victims.insert(credential.provider.clone(), credential);
        },
    }
}
