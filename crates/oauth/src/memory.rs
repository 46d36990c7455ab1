use std::collections::BTreeMap;

use {async_trait::async_trait, dashmap::DashMap};

use crate::{
    error::StoreError,
    storage::CredentialStore,
    types::{Identity, ProviderId, StoredCredential},
};

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: DashMap<Identity, BTreeMap<ProviderId, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(
        &self,
        identity: &Identity,
        provider: &ProviderId,
    ) -> Result<Option<StoredCredential>, StoreError> {
        Ok(self
            .credentials
            .get(identity)
            .and_then(|providers| providers.get(provider).cloned()))
    }

    async fn save(
        &self,
        identity: &Identity,
        credential: &StoredCredential,
    ) -> Result<(), StoreError> {
        self.credentials
            .entry(identity.clone())
            .or_default()
            .insert(credential.provider.clone(), credential.clone());
        Ok(())
    }

    async fn delete(&self, identity: &Identity, provider: &ProviderId) -> Result<bool, StoreError> {
        let removed = self
            .credentials
            .get_mut(identity)
            .is_some_and(|mut providers| providers.remove(provider).is_some());
        self.credentials
            .remove_if(identity, |_, providers| providers.is_empty());
        Ok(removed)
    }

    async fn providers(&self, identity: &Identity) -> Result<Vec<ProviderId>, StoreError> {
        Ok(self
            .credentials
            .get(identity)
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default())
    }
}
