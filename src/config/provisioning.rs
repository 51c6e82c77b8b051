//! Provisioning configuration
//!
//! Storage-class parameters plus the appliance credential secret resolve into
//! one immutable [`ProvisioningConfig`] per call. Defaults live here and only
//! here.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_ISCSI_INTERFACE: &str = "default";
pub const DEFAULT_DATASET_PARENT: &str = "tank";
pub const DEFAULT_AUTH_TYPE: &str = "None";
pub const DEFAULT_SECRET_NAMESPACE: &str = "kube-system";
pub const DEFAULT_SECRET_NAME: &str = "freenas-iscsi";
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

// =============================================================================
// Sub-Configurations
// =============================================================================

/// Where the appliance credential secret lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    /// Read the secret reference out of storage-class parameters
    pub fn from_parameters(parameters: &BTreeMap<String, String>) -> Self {
        Self {
            namespace: parameters
                .get("serverSecretNamespace")
                .cloned()
                .unwrap_or_else(|| DEFAULT_SECRET_NAMESPACE.to_string()),
            name: parameters
                .get("serverSecretName")
                .cloned()
                .unwrap_or_else(|| DEFAULT_SECRET_NAME.to_string()),
        }
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Connection parameters of the appliance management API
#[derive(Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Accept invalid TLS certificates
    pub allow_insecure: bool,
}

impl ServerConfig {
    /// Base URL of the management API
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 80,
            username: "root".to_string(),
            password: String::new(),
            allow_insecure: false,
        }
    }
}

// Keeps the password out of logs
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("allow_insecure", &self.allow_insecure)
            .finish()
    }
}

/// Target group parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetGroupParams {
    pub auth_group: Option<u32>,
    pub auth_type: String,
    pub initiator_group: Option<u32>,
    pub portal_group: Option<u32>,
}

impl Default for TargetGroupParams {
    fn default() -> Self {
        Self {
            auth_group: None,
            auth_type: DEFAULT_AUTH_TYPE.to_string(),
            initiator_group: None,
            portal_group: None,
        }
    }
}

/// Backing volume (zvol) parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    /// `None` inherits from the parent dataset
    pub compression: Option<String>,
    pub dedup: Option<String>,
    pub sparse: bool,
    pub force: bool,
    pub blocksize: Option<String>,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            compression: None,
            dedup: None,
            sparse: true,
            force: false,
            blocksize: None,
        }
    }
}

/// Extent parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentParams {
    pub blocksize: Option<u32>,
    pub disable_physical_blocksize: bool,
    pub avail_threshold: Option<u32>,
    pub insecure_tpc: bool,
    pub xen: bool,
    pub rpm: Option<String>,
    pub read_only: bool,
}

impl Default for ExtentParams {
    fn default() -> Self {
        Self {
            blocksize: None,
            disable_physical_blocksize: true,
            avail_threshold: None,
            insecure_tpc: true,
            xen: false,
            rpm: None,
            read_only: false,
        }
    }
}

// =============================================================================
// Provisioning Configuration
// =============================================================================

/// Everything one provisioning call needs to know about its storage class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    pub fs_type: String,
    pub target_portal: String,
    pub portals: Vec<String>,
    pub iscsi_interface: String,
    pub iscsi_name_prefix: String,
    pub iscsi_name_suffix: String,
    /// Name volumes after the claim instead of the controller-generated name
    pub deterministic_names: bool,
    /// Parent dataset path, pool first, e.g. `tank/k8s`
    pub dataset_parent: String,
    /// Place each namespace's volumes in its own child dataset
    pub enable_namespaces: bool,
    pub target_group: TargetGroupParams,
    pub volume: VolumeParams,
    pub extent: ExtentParams,
    pub server: ServerConfig,
    pub secret: SecretRef,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            fs_type: DEFAULT_FS_TYPE.to_string(),
            target_portal: format!("{}:{}", server.host, DEFAULT_ISCSI_PORT),
            portals: Vec::new(),
            iscsi_interface: DEFAULT_ISCSI_INTERFACE.to_string(),
            iscsi_name_prefix: String::new(),
            iscsi_name_suffix: String::new(),
            deterministic_names: false,
            dataset_parent: DEFAULT_DATASET_PARENT.to_string(),
            enable_namespaces: false,
            target_group: TargetGroupParams::default(),
            volume: VolumeParams::default(),
            extent: ExtentParams::default(),
            server,
            secret: SecretRef {
                namespace: DEFAULT_SECRET_NAMESPACE.to_string(),
                name: DEFAULT_SECRET_NAME.to_string(),
            },
        }
    }
}

impl ProvisioningConfig {
    /// Build a configuration from storage-class parameters and secret data
    pub fn from_parameters(
        parameters: &BTreeMap<String, String>,
        secret: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut config = Self {
            secret: SecretRef::from_parameters(parameters),
            ..Self::default()
        };
        let mut target_portal = None;

        for (key, value) in parameters {
            match key.as_str() {
                "fsType" => config.fs_type = value.clone(),

                // Provisioner options
                "provisionerTargetPortal" => target_portal = non_empty(value),
                "provisionerPortals" => config.portals = parse_list(value),
                "provisionerEnableDeterministicNames" => {
                    config.deterministic_names = parse_bool(key, value)?
                }
                "provisionerISCSINamePrefix" => config.iscsi_name_prefix = value.clone(),
                "provisionerISCSINameSuffix" => config.iscsi_name_suffix = value.clone(),
                "provisionerISCSIInterface" => config.iscsi_interface = value.clone(),

                // Dataset options
                "datasetParentName" => {
                    config.dataset_parent = value.trim().trim_matches('/').to_string()
                }
                "datasetEnableNamespaces" => config.enable_namespaces = parse_bool(key, value)?,

                // TargetGroup options
                "targetGroupAuthgroup" => config.target_group.auth_group = parse_id(key, value)?,
                "targetGroupAuthtype" => config.target_group.auth_type = value.clone(),
                "targetGroupInitiatorgroup" => {
                    config.target_group.initiator_group = parse_id(key, value)?
                }
                "targetGroupPortalgroup" => {
                    config.target_group.portal_group = parse_id(key, value)?
                }

                // Zvol options
                "zvolCompression" => config.volume.compression = non_empty(value),
                "zvolDedup" => config.volume.dedup = non_empty(value),
                "zvolSparse" => config.volume.sparse = parse_bool(key, value)?,
                "zvolForce" => config.volume.force = parse_bool(key, value)?,
                "zvolBlocksize" => config.volume.blocksize = non_empty(value),

                // Extent options
                "extentBlocksize" => config.extent.blocksize = parse_id(key, value)?,
                "extentDisablePhysicalBlocksize" => {
                    config.extent.disable_physical_blocksize = parse_bool(key, value)?
                }
                "extentAvailThreshold" => config.extent.avail_threshold = parse_id(key, value)?,
                "extentInsecureTpc" => config.extent.insecure_tpc = parse_bool(key, value)?,
                "extentXen" => config.extent.xen = parse_bool(key, value)?,
                "extentRpm" => config.extent.rpm = non_empty(value),
                "extentReadOnly" => config.extent.read_only = parse_bool(key, value)?,

                // Consumed by SecretRef
                "serverSecretNamespace" | "serverSecretName" => {}

                _ => debug!("Ignoring unknown storage class parameter: {}", key),
            }
        }

        for (key, value) in secret {
            match key.as_str() {
                "protocol" => config.server.protocol = value.trim().to_string(),
                "host" => config.server.host = value.trim().to_string(),
                "port" => {
                    config.server.port = value.trim().parse().map_err(|_| {
                        Error::Configuration(format!("invalid secret value for port: {}", value))
                    })?
                }
                "username" => config.server.username = value.clone(),
                "password" => config.server.password = value.clone(),
                "allowInsecure" => config.server.allow_insecure = parse_bool(key, value)?,
                _ => debug!("Ignoring unknown secret key: {}", key),
            }
        }

        config.target_portal = target_portal
            .unwrap_or_else(|| format!("{}:{}", config.server.host, DEFAULT_ISCSI_PORT));

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that do not need the appliance
    pub fn validate(&self) -> Result<()> {
        if self.dataset_parent.is_empty() {
            return Err(Error::Configuration(
                "datasetParentName cannot be empty".into(),
            ));
        }
        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "unsupported server protocol: {}",
                self.server.protocol
            )));
        }
        if self.server.host.is_empty() {
            return Err(Error::Configuration("server host cannot be empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Parsing Helpers
// =============================================================================

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(Error::Configuration(format!(
            "invalid boolean for {}: {}",
            key, value
        ))),
    }
}

/// Parse a numeric appliance reference; 0 and empty mean "not set"
fn parse_id(key: &str, value: &str) -> Result<Option<u32>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let n: u32 = value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid number for {}: {}", key, value)))?;
    Ok(if n == 0 { None } else { Some(n) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ProvisioningConfig::from_parameters(&BTreeMap::new(), &BTreeMap::new()).unwrap();
        assert_eq!(config.fs_type, "ext4");
        assert_eq!(config.dataset_parent, "tank");
        assert_eq!(config.iscsi_interface, "default");
        assert_eq!(config.target_group.auth_type, "None");
        assert!(config.volume.sparse);
        assert!(!config.volume.force);
        assert!(config.extent.disable_physical_blocksize);
        assert!(config.extent.insecure_tpc);
        assert!(!config.extent.read_only);
        assert_eq!(config.server.base_url(), "http://localhost:80");
        assert_eq!(config.target_portal, "localhost:3260");
        assert_eq!(config.secret.to_string(), "kube-system/freenas-iscsi");
        assert!(!config.enable_namespaces);
        assert!(!config.deterministic_names);
    }

    #[test]
    fn test_parameters_and_secret() {
        let parameters = params(&[
            ("fsType", "xfs"),
            ("provisionerPortals", "10.0.0.1:3260, 10.0.0.2:3260"),
            ("provisionerEnableDeterministicNames", "true"),
            ("provisionerISCSINamePrefix", "k8s-"),
            ("datasetParentName", "tank/k8s/"),
            ("datasetEnableNamespaces", "1"),
            ("targetGroupPortalgroup", "1"),
            ("targetGroupInitiatorgroup", "0"),
            ("zvolCompression", "lz4"),
            ("extentBlocksize", "4096"),
            ("extentReadOnly", "True"),
            ("serverSecretName", "nas-creds"),
        ]);
        let secret = params(&[
            ("protocol", "https"),
            ("host", "nas.local"),
            ("port", "443"),
            ("password", "hunter2"),
            ("allowInsecure", "true"),
        ]);

        let config = ProvisioningConfig::from_parameters(&parameters, &secret).unwrap();
        assert_eq!(config.fs_type, "xfs");
        assert_eq!(config.portals, vec!["10.0.0.1:3260", "10.0.0.2:3260"]);
        assert!(config.deterministic_names);
        assert_eq!(config.iscsi_name_prefix, "k8s-");
        assert_eq!(config.dataset_parent, "tank/k8s");
        assert!(config.enable_namespaces);
        assert_eq!(config.target_group.portal_group, Some(1));
        assert_eq!(config.target_group.initiator_group, None);
        assert_eq!(config.volume.compression.as_deref(), Some("lz4"));
        assert_eq!(config.extent.blocksize, Some(4096));
        assert!(config.extent.read_only);
        assert_eq!(config.secret.name, "nas-creds");
        assert_eq!(config.server.base_url(), "https://nas.local:443");
        assert!(config.server.allow_insecure);
        // Portal defaults to the appliance host
        assert_eq!(config.target_portal, "nas.local:3260");
    }

    #[test]
    fn test_explicit_target_portal() {
        let parameters = params(&[("provisionerTargetPortal", "192.168.1.10:3260")]);
        let config = ProvisioningConfig::from_parameters(&parameters, &BTreeMap::new()).unwrap();
        assert_eq!(config.target_portal, "192.168.1.10:3260");
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let parameters = params(&[("zvolSparse", "maybe")]);
        assert_matches!(
            ProvisioningConfig::from_parameters(&parameters, &BTreeMap::new()),
            Err(Error::Configuration(msg)) if msg.contains("zvolSparse")
        );

        let parameters = params(&[("extentBlocksize", "big")]);
        assert_matches!(
            ProvisioningConfig::from_parameters(&parameters, &BTreeMap::new()),
            Err(Error::Configuration(_))
        );

        let secret = params(&[("port", "eighty")]);
        assert_matches!(
            ProvisioningConfig::from_parameters(&BTreeMap::new(), &secret),
            Err(Error::Configuration(_))
        );

        let secret = params(&[("protocol", "ftp")]);
        assert_matches!(
            ProvisioningConfig::from_parameters(&BTreeMap::new(), &secret),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_server_debug_redacts_password() {
        let server = ServerConfig {
            password: "hunter2".into(),
            ..ServerConfig::default()
        };
        let rendered = format!("{:?}", server);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
