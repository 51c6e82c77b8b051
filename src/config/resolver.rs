//! Config Resolvers
//!
//! Look a storage class and its credential secret up and turn them into a
//! [`ProvisioningConfig`]. The Kubernetes resolver reads real StorageClass and
//! Secret objects; the file resolver reads the same data from a YAML document
//! for standalone runs.

use super::provisioning::{ProvisioningConfig, SecretRef};
use crate::domain::ports::ConfigResolver;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

// =============================================================================
// Kubernetes Resolver
// =============================================================================

/// Resolves configuration from cluster StorageClass and Secret objects
pub struct KubeConfigResolver {
    client: Client,
}

impl KubeConfigResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn secret_data(&self, secret_ref: &SecretRef) -> Result<BTreeMap<String, String>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = api.get(&secret_ref.name).await?;
        Ok(secret_to_map(&secret))
    }
}

#[async_trait]
impl ConfigResolver for KubeConfigResolver {
    async fn resolve(&self, storage_class: &str) -> Result<ProvisioningConfig> {
        debug!("Resolving storage class {}", storage_class);

        let api: Api<StorageClass> = Api::all(self.client.clone());
        let class = api.get(storage_class).await?;
        let parameters = class.parameters.unwrap_or_default();

        let secret_ref = SecretRef::from_parameters(&parameters);
        let secret = self.secret_data(&secret_ref).await?;

        ProvisioningConfig::from_parameters(&parameters, &secret)
    }
}

/// Flatten secret data into strings; `stringData` wins over `data`
fn secret_to_map(secret: &Secret) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        map.extend(string_data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    map
}

// =============================================================================
// File Resolver
// =============================================================================

/// Storage class entry of a config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassEntry {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// YAML document read by [`FileConfigResolver`]
///
/// ```yaml
/// storageClasses:
///   freenas-iscsi:
///     parameters:
///       datasetParentName: tank/k8s
/// secrets:
///   kube-system/freenas-iscsi:
///     host: nas.local
///     password: secret
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub storage_classes: BTreeMap<String, StorageClassEntry>,
    /// Secrets keyed by `namespace/name`
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

/// Resolves configuration from a YAML file loaded at startup
#[derive(Debug)]
pub struct FileConfigResolver {
    file: ConfigFile,
}

impl FileConfigResolver {
    pub fn new(file: ConfigFile) -> Self {
        Self { file }
    }

    /// Load a config file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let resolver = Self::from_yaml(&contents)?;
        info!(
            "Loaded {} storage classes from {}",
            resolver.file.storage_classes.len(),
            path.display()
        );
        Ok(resolver)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(Self::new(serde_yaml::from_str(contents)?))
    }
}

#[async_trait]
impl ConfigResolver for FileConfigResolver {
    async fn resolve(&self, storage_class: &str) -> Result<ProvisioningConfig> {
        let class = self.file.storage_classes.get(storage_class).ok_or_else(|| {
            Error::Configuration(format!("unknown storage class: {}", storage_class))
        })?;

        let secret_ref = SecretRef::from_parameters(&class.parameters);
        let secret = self
            .file
            .secrets
            .get(&secret_ref.to_string())
            .ok_or_else(|| Error::Configuration(format!("secret {} not found", secret_ref)))?;

        ProvisioningConfig::from_parameters(&class.parameters, secret)
    }
}
