//! Naming & Identity Derivation
//!
//! Every name a provisioned volume carries on the appliance is a pure function
//! of the request and its storage class, computed and validated here before
//! any remote call is made.

use crate::config::ProvisioningConfig;
use crate::domain::volume::ProvisioningRequest;
use crate::error::{Error, Result};

/// Hard ceiling on `zvol/<pool>/<volume>` device paths
pub const MAX_DEVICE_PATH_LEN: usize = 63;

/// Longest comment the appliance keeps on a volume
pub const VOLUME_COMMENT_LIMIT: usize = 1024;

/// Longest comment the appliance keeps on an extent
pub const EXTENT_COMMENT_LIMIT: usize = 120;

const GIB: f64 = (1u64 << 30) as f64;

/// Names derived for one provisioning request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeNames {
    /// First component of the parent dataset
    pub pool: String,
    /// Claim name or controller-generated name, depending on the storage class
    pub base_name: String,
    /// Per-namespace child dataset, when namespace isolation is on
    pub namespace_dataset: Option<String>,
    /// Volume name relative to the pool
    pub volume_name: String,
    pub iscsi_name: String,
    /// `zvol/<pool>/<volume_name>`
    pub device_path: String,
    /// `<namespace>/<claim>`, untruncated
    pub comment: String,
}

impl VolumeNames {
    /// Derive and validate every name for `request` under `config`
    pub fn derive(request: &ProvisioningRequest, config: &ProvisioningConfig) -> Result<Self> {
        let namespace = request.namespace.trim();
        let claim = request.claim_name.trim();
        if (config.enable_namespaces || config.deterministic_names) && namespace.is_empty() {
            return Err(Error::Configuration(
                "namespace cannot be empty with namespace isolation or deterministic names".into(),
            ));
        }

        // Claim names are only unique within a namespace; without a namespace
        // dataset the namespace has to be part of the name itself
        let base_name = match (config.deterministic_names, config.enable_namespaces) {
            (true, true) => claim.to_string(),
            (true, false) if claim.is_empty() => String::new(),
            (true, false) => format!("{}-{}", namespace, claim),
            (false, _) => request.name.trim().to_string(),
        };
        if base_name.is_empty() {
            return Err(Error::Configuration("volume name cannot be empty".into()));
        }

        let parent = config.dataset_parent.trim_matches('/');
        let (pool, relative) = match parent.split_once('/') {
            Some((pool, rest)) => (pool, rest),
            None => (parent, ""),
        };
        if pool.is_empty() {
            return Err(Error::Configuration(
                "dataset parent must start with a pool".into(),
            ));
        }

        let mut components: Vec<&str> = Vec::with_capacity(3);
        if !relative.is_empty() {
            components.push(relative);
        }
        if config.enable_namespaces {
            components.push(namespace);
        }
        components.push(&base_name);
        let volume_name = components.join("/");

        let iscsi_name = if config.enable_namespaces {
            format!(
                "{}{}-{}{}",
                config.iscsi_name_prefix, namespace, base_name, config.iscsi_name_suffix
            )
        } else {
            format!(
                "{}{}{}",
                config.iscsi_name_prefix, base_name, config.iscsi_name_suffix
            )
        };

        let device_path = format!("zvol/{}/{}", pool, volume_name);
        if device_path.len() > MAX_DEVICE_PATH_LEN {
            return Err(Error::Configuration(format!(
                "device path {} is {} characters, limit is {}",
                device_path,
                device_path.len(),
                MAX_DEVICE_PATH_LEN
            )));
        }

        Ok(Self {
            pool: pool.to_string(),
            base_name,
            namespace_dataset: config
                .enable_namespaces
                .then(|| format!("{}/{}", parent, namespace)),
            volume_name,
            iscsi_name,
            device_path,
            comment: format!("{}/{}", request.namespace, request.claim_name),
        })
    }
}

/// Render a byte count as the appliance's size string, e.g. `5 GiB`
pub fn format_volsize(bytes: u64) -> String {
    format!("{} GiB", bytes as f64 / GIB)
}

/// Keep at most `max` characters of `s`
pub fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
