use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    tokio::sync::Mutex,
    tokenward_config::{TokenwardConfig, credential_store_path},
    tracing::debug,
};

use crate::{
    error::StoreError,
    types::{Identity, ProviderId, StoredCredential},
};

/// Persistence for one credential per `(identity, provider)`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(
        &self,
        identity: &Identity,
        provider: &ProviderId,
    ) -> Result<Option<StoredCredential>, StoreError>;

    /// Replace the credential for `(identity, credential.provider)` atomically.
    async fn save(&self, identity: &Identity, credential: &StoredCredential)
    -> Result<(), StoreError>;

    /// Returns whether something was removed.
    async fn delete(&self, identity: &Identity, provider: &ProviderId)
    -> Result<bool, StoreError>;

    async fn providers(&self, identity: &Identity) -> Result<Vec<ProviderId>, StoreError>;

    /// The most recently updated credential of `identity`, across providers.
    async fn latest(&self, identity: &Identity) -> Result<Option<StoredCredential>, StoreError> {
        let mut best: Option<StoredCredential> = None;
        for provider in self.providers(identity).await? {
            let Some(candidate) = self.load(identity, &provider).await? else {
                continue;
            };
            if best
                .as_ref()
                .is_none_or(|b| (candidate.updated_at, candidate.revision) > (b.updated_at, b.revision))
            {
                best = Some(candidate);
            }
        }
        Ok(best)
    }
}

type CredentialMap = BTreeMap<Identity, BTreeMap<ProviderId, StoredCredential>>;

/// JSON file store, by default at `~/.tokenward/oauth_credentials.json`.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new() -> Self {
        Self::from_config(&TokenwardConfig::default())
    }

    pub fn from_config(config: &TokenwardConfig) -> Self {
        Self::with_path(credential_store_path(config))
    }

    /// Create a store at a specific path (useful for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<CredentialMap, StoreError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CredentialMap::new()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(CredentialMap::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_map(&self, map: &CredentialMap) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;

        // Set file permissions to 0600 on Unix before it becomes visible
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl Default for FileCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(
        &self,
        identity: &Identity,
        provider: &ProviderId,
    ) -> Result<Option<StoredCredential>, StoreError> {
        let mut map = self.read_map().await?;
        Ok(map
            .get_mut(identity)
            .and_then(|providers| providers.remove(provider)))
    }

    async fn save(
        &self,
        identity: &Identity,
        credential: &StoredCredential,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.entry(identity.clone())
            .or_default()
            .insert(credential.provider.clone(), credential.clone());
        self.write_map(&map).await?;
        debug!(%identity, provider = %credential.provider, revision = credential.revision, "saved credential");
        Ok(())
    }

    async fn delete(&self, identity: &Identity, provider: &ProviderId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        let Some(providers) = map.get_mut(identity) else {
            return Ok(false);
        };
        let removed = providers.remove(provider).is_some();
        if providers.is_empty() {
            map.remove(identity);
        }
        if removed {
            self.write_map(&map).await?;
            debug!(%identity, %provider, "deleted credential");
        }
        Ok(removed)
    }

    async fn providers(&self, identity: &Identity) -> Result<Vec<ProviderId>, StoreError> {
        let map = self.read_map().await?;
        Ok(map
            .get(identity)
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default())
    }
}
