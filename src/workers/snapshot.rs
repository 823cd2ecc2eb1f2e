use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::reconcile::{FetchError, PermsFetcher};

/// A connector export: for each code host, who can read which repository.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub providers: Vec<ProviderSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSnapshot {
    pub provider_id: String,
    pub provider_type: String,
    pub service_type: String,
    pub service_id: String,
    /// Repository name -> account ids with read access.
    #[serde(default)]
    pub repos: BTreeMap<String, Vec<String>>,
    /// Account id -> repository names it can read.
    #[serde(default)]
    pub accounts: BTreeMap<String, Vec<String>>,
    /// When set, every fetch from this provider fails with this message.
    #[serde(default)]
    pub error: Option<String>,
}

impl Snapshot {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open snapshot {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse snapshot {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse snapshot")
    }

    pub fn into_fetchers(self) -> Vec<SnapshotFetcher> {
        self.providers
            .into_iter()
            .map(|provider| SnapshotFetcher { provider })
            .collect()
    }
}

/// Serves one provider of a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    provider: ProviderSnapshot,
}

impl SnapshotFetcher {
    fn check_available(&self) -> Result<(), FetchError> {
        match &self.provider.error {
            Some(message) => Err(FetchError::new(&self.provider.provider_id, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PermsFetcher for SnapshotFetcher {
    fn provider_id(&self) -> &str {
        &self.provider.provider_id
    }

    fn provider_type(&self) -> &str {
        &self.provider.provider_type
    }

    fn service_type(&self) -> &str {
        &self.provider.service_type
    }

    fn service_id(&self) -> &str {
        &self.provider.service_id
    }

    async fn fetch_repo_perms(&self, repo_name: &str) -> Result<Option<Vec<String>>, FetchError> {
        self.check_available()?;
        Ok(self.provider.repos.get(repo_name).cloned())
    }

    async fn fetch_user_perms(&self, account_id: &str) -> Result<Vec<String>, FetchError> {
        self.check_available()?;
        Ok(self
            .provider
            .accounts
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }
}
