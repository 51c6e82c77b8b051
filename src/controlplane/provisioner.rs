//! Provisioner
//!
//! Entry point for the invoking surface: resolves the storage class, connects
//! to the appliance it names, and runs the saga or the deprovision sequence.
//! Holds no per-volume state, so calls for different volumes can run
//! concurrently.

use super::deprovision::{DeprovisionOrchestrator, DeprovisionPolicy};
use super::descriptor::build_descriptor;
use super::metrics::ProvisionerMetrics;
use super::retry::RetryPolicy;
use super::saga::SagaOrchestrator;
use crate::domain::ports::{ClientFactoryRef, ConfigResolverRef};
use crate::domain::volume::{IdentityMap, ProvisioningRequest, VolumeDescriptor};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default identity stamped on provisioned volumes
pub const DEFAULT_IDENTIFIER: &str = "freenas-iscsi-provisioner";

// =============================================================================
// Provisioner Configuration
// =============================================================================

/// Process-wide provisioner settings
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Identity written into every identity map; deprovision refuses others
    pub identifier: String,
    /// Bound on extent creation while the volume materializes
    pub extent_retry: RetryPolicy,
    pub deprovision_policy: DeprovisionPolicy,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_IDENTIFIER.to_string(),
            extent_retry: RetryPolicy::default(),
            deprovision_policy: DeprovisionPolicy::default(),
        }
    }
}

// =============================================================================
// Provisioner
// =============================================================================

pub struct Provisioner {
    config: ProvisionerConfig,
    resolver: ConfigResolverRef,
    clients: ClientFactoryRef,
    metrics: Arc<ProvisionerMetrics>,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        resolver: ConfigResolverRef,
        clients: ClientFactoryRef,
        metrics: Arc<ProvisionerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            clients,
            metrics,
        })
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ProvisionerMetrics> {
        &self.metrics
    }

    /// Provision a volume under `storage_class`
    pub async fn provision(
        &self,
        storage_class: &str,
        request: &ProvisioningRequest,
    ) -> Result<VolumeDescriptor> {
        let result = self.provision_inner(storage_class, request).await;
        self.metrics.record_provision(result.is_ok());
        if let Err(e) = &result {
            error!("Provision of {} failed: {}", request.name, e);
        }
        result
    }

    async fn provision_inner(
        &self,
        storage_class: &str,
        request: &ProvisioningRequest,
    ) -> Result<VolumeDescriptor> {
        let config = self.resolver.resolve(storage_class).await?;
        debug!("Resolved {} to {:?}", storage_class, config.server);

        let client = self.clients.connect(&config.server)?;
        let volume = SagaOrchestrator::new(client, self.config.extent_retry)
            .with_metrics(self.metrics.clone())
            .provision(request, &config)
            .await?;

        Ok(build_descriptor(
            &self.config.identifier,
            request,
            &config,
            &volume,
        ))
    }

    /// Deprovision the volume described by persisted `annotations`
    pub async fn deprovision(
        &self,
        storage_class: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let identities = IdentityMap::from_annotations(annotations)?;
        if !identities.identity.is_empty() && identities.identity != self.config.identifier {
            return Err(Error::Configuration(format!(
                "volume {} belongs to provisioner {}, not {}",
                identities.volume_name, identities.identity, self.config.identifier
            )));
        }

        let config = self.resolver.resolve(storage_class).await?;
        let client = self.clients.connect(&config.server)?;

        let result = DeprovisionOrchestrator::new(client, self.config.deprovision_policy)
            .with_metrics(self.metrics.clone())
            .deprovision(&identities)
            .await;
        match &result {
            Ok(()) => info!("Volume {} deprovisioned", identities.volume_name),
            Err(e) => error!("Deprovision of {} failed: {}", identities.volume_name, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::{InMemoryAppliance, InMemoryClientFactory};
    use crate::config::FileConfigResolver;
    use crate::controlplane::metrics::{RESULT_FAILURE, RESULT_SUCCESS};
    use crate::domain::resources::ResourceKind;
    use crate::domain::volume::AccessMode;
    use assert_matches::assert_matches;

    const CONFIG: &str = r#"
storageClasses:
  freenas-iscsi:
    parameters:
      datasetParentName: tank
      datasetEnableNamespaces: "true"
      provisionerTargetPortal: 10.0.0.1:3260
secrets:
  kube-system/freenas-iscsi:
    host: nas.local
"#;

    fn provisioner(appliance: &Arc<InMemoryAppliance>) -> Arc<Provisioner> {
        Provisioner::new(
            ProvisionerConfig {
                extent_retry: RetryPolicy::immediate(3),
                ..ProvisionerConfig::default()
            },
            Arc::new(FileConfigResolver::from_yaml(CONFIG).unwrap()),
            Arc::new(InMemoryClientFactory::new(appliance.clone())),
            Arc::new(ProvisionerMetrics::new().unwrap()),
        )
    }

    fn request() -> ProvisioningRequest {
        ProvisioningRequest {
            name: "pvc-123".into(),
            namespace: "default".into(),
            claim_name: "data".into(),
            capacity_bytes: 5 << 30,
            access_modes: vec![AccessMode::ReadWriteOnce],
        }
    }

    #[tokio::test]
    async fn test_provision_and_deprovision() {
        let appliance = Arc::new(InMemoryAppliance::default().with_dataset("tank"));
        let provisioner = provisioner(&appliance);

        let descriptor = provisioner
            .provision("freenas-iscsi", &request())
            .await
            .unwrap();
        assert_eq!(descriptor.target_portal, "10.0.0.1:3260");
        assert_eq!(descriptor.iqn, "iqn.2005-10.org.freenas.ctl:default-pvc-123");
        assert_eq!(descriptor.lun, 0);
        assert_eq!(descriptor.identities.identity, DEFAULT_IDENTIFIER);

        let annotations = descriptor.identities.to_annotations();
        provisioner
            .deprovision("freenas-iscsi", &annotations)
            .await
            .unwrap();
        assert_eq!(appliance.count(ResourceKind::Volume), 0);
        assert_eq!(appliance.count(ResourceKind::Target), 0);

        assert_eq!(provisioner.metrics().provisions(RESULT_SUCCESS), 1);
        assert_eq!(provisioner.metrics().deprovisions(RESULT_SUCCESS), 1);
    }

    #[tokio::test]
    async fn test_unknown_storage_class() {
        let appliance = Arc::new(InMemoryAppliance::default().with_dataset("tank"));
        let provisioner = provisioner(&appliance);

        assert_matches!(
            provisioner.provision("missing", &request()).await,
            Err(Error::Configuration(_))
        );
        assert_eq!(provisioner.metrics().provisions(RESULT_FAILURE), 1);
        assert_eq!(appliance.remote_calls(), 0);
    }

    #[tokio::test]
    async fn test_deprovision_refuses_foreign_volumes() {
        let appliance = Arc::new(InMemoryAppliance::default().with_dataset("tank"));
        let provisioner = provisioner(&appliance);

        let descriptor = provisioner
            .provision("freenas-iscsi", &request())
            .await
            .unwrap();
        let mut annotations = descriptor.identities.to_annotations();
        annotations.insert(
            crate::domain::volume::ANNOTATION_IDENTITY.into(),
            "someone-else".into(),
        );

        assert_matches!(
            provisioner.deprovision("freenas-iscsi", &annotations).await,
            Err(Error::Configuration(msg)) if msg.contains("someone-else")
        );
        assert_eq!(appliance.count(ResourceKind::Volume), 1);
    }

    #[tokio::test]
    async fn test_deprovision_requires_identities() {
        let appliance = Arc::new(InMemoryAppliance::default());
        let provisioner = provisioner(&appliance);

        assert_matches!(
            provisioner
                .deprovision("freenas-iscsi", &BTreeMap::new())
                .await,
            Err(Error::Configuration(_))
        );
        assert_eq!(appliance.remote_calls(), 0);
    }
}
