//! # Secret Store
//!
//! Client for the versioned secret store queried during secret rewriting.
//! The store speaks the KV-v2 wire shape: secrets are grouped by project,
//! addressed by path, and versioned; a versionless read resolves the latest
//! version.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::config::SecretStoreConfig;

/// Versioned secret lookup, keyed by (project, path, version).
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch all keys of one secret. `version = None` resolves the latest.
    async fn get_secret_with_version(
        &self,
        project: &str,
        path: &str,
        version: Option<u64>,
    ) -> Result<HashMap<String, Zeroizing<String>>>;
}

/// HTTP client for the secret store.
#[derive(Debug, Clone)]
pub struct VaultClient {
    address: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: HashMap<String, String>,
}

impl VaultClient {
    pub fn new(config: &SecretStoreConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(if config.timeout.is_zero() {
                Duration::from_secs(5)
            } else {
                config.timeout
            })
            .build()
            .context("Failed to create secret store HTTP client")?;
        Ok(Self {
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            http,
        })
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn get_secret_with_version(
        &self,
        project: &str,
        path: &str,
        version: Option<u64>,
    ) -> Result<HashMap<String, Zeroizing<String>>> {
        let mut url = format!("{}/v1/{}/data/{}", self.address, project, path);
        if let Some(v) = version {
            url.push_str(&format!("?version={v}"));
        }

        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .context(format!("Failed to query secret store for {}/{}", project, path))?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!(
                "Secret store returned {} for {}/{} (version: {})",
                status,
                project,
                path,
                version.map_or_else(|| "latest".to_string(), |v| v.to_string())
            );
        }

        let body: KvReadResponse = response
            .json()
            .await
            .context(format!("Malformed secret store response for {}/{}", project, path))?;

        Ok(body
            .data
            .data
            .into_iter()
            .map(|(k, v)| (k, Zeroizing::new(v)))
            .collect())
    }
}
