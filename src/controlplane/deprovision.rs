//! Deprovision Orchestrator
//!
//! Tears a volume down from its persisted identity map alone: target first
//! (the appliance takes its groups and LUN mappings with it), then the
//! extent, then the volume. Anything already gone counts as deleted, so the
//! whole sequence can be repeated safely.

use super::metrics::ProvisionerMetrics;
use crate::domain::ports::ResourceClientRef;
use crate::domain::resources::{DeleteOutcome, ResourceId};
use crate::domain::volume::IdentityMap;
use crate::error::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do when one deletion step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeprovisionPolicy {
    /// Attempt every step and return the first failure
    #[default]
    BestEffort,
    /// Stop at the first failure
    FailFast,
}

impl FromStr for DeprovisionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "best-effort" | "besteffort" => Ok(DeprovisionPolicy::BestEffort),
            "fail-fast" | "failfast" => Ok(DeprovisionPolicy::FailFast),
            other => Err(Error::Configuration(format!(
                "unknown deprovision policy: {} (expected best-effort or fail-fast)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DeprovisionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeprovisionPolicy::BestEffort => write!(f, "best-effort"),
            DeprovisionPolicy::FailFast => write!(f, "fail-fast"),
        }
    }
}

/// Deletes the appliance objects behind one volume
pub struct DeprovisionOrchestrator {
    client: ResourceClientRef,
    policy: DeprovisionPolicy,
    metrics: Option<Arc<ProvisionerMetrics>>,
}

impl DeprovisionOrchestrator {
    pub fn new(client: ResourceClientRef, policy: DeprovisionPolicy) -> Self {
        Self {
            client,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProvisionerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delete target, extent and volume
    pub async fn deprovision(&self, identities: &IdentityMap) -> Result<()> {
        info!(
            "Deprovisioning {}/{} (target {}, extent {})",
            identities.pool, identities.volume_name, identities.target_id, identities.extent_id
        );

        let steps = [
            (
                "target",
                ResourceId::Target {
                    id: identities.target_id,
                },
            ),
            (
                "extent",
                ResourceId::Extent {
                    id: identities.extent_id,
                },
            ),
            (
                "volume",
                ResourceId::Volume {
                    pool: identities.pool.clone(),
                    name: identities.volume_name.clone(),
                },
            ),
        ];

        let mut first_error = None;
        for (step, id) in steps {
            if let Err(e) = self.delete_step(step, &id).await {
                match self.policy {
                    DeprovisionPolicy::FailFast => {
                        self.record(false);
                        return Err(e);
                    }
                    DeprovisionPolicy::BestEffort => {
                        warn!("Deprovision step {} failed, continuing: {}", step, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => {
                self.record(false);
                Err(e)
            }
            None => {
                info!("Deprovisioned {}/{}", identities.pool, identities.volume_name);
                self.record(true);
                Ok(())
            }
        }
    }

    async fn delete_step(&self, step: &str, id: &ResourceId) -> Result<()> {
        match self.client.delete(id).await {
            Ok(DeleteOutcome::Deleted) => {
                debug!("Deleted {}", id);
                Ok(())
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!("{} already gone", id);
                Ok(())
            }
            Err(e) if e.is_missing_dataset() => {
                debug!("{} already gone: {}", id, e);
                Ok(())
            }
            Err(e) => Err(e.in_step(step)),
        }
    }

    fn record(&self, ok: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_deprovision(ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::{DeleteFault, InMemoryAppliance};
    use crate::config::ProvisioningConfig;
    use crate::controlplane::metrics::{RESULT_FAILURE, RESULT_SUCCESS};
    use crate::controlplane::retry::RetryPolicy;
    use crate::controlplane::saga::SagaOrchestrator;
    use crate::domain::resources::ResourceKind;
    use crate::domain::volume::{AccessMode, ProvisioningRequest};
    use assert_matches::assert_matches;

    async fn provisioned(appliance: &Arc<InMemoryAppliance>) -> IdentityMap {
        let request = ProvisioningRequest {
            name: "pvc-123".into(),
            namespace: "default".into(),
            claim_name: "data".into(),
            capacity_bytes: 1 << 30,
            access_modes: vec![AccessMode::ReadWriteOnce],
        };
        let config = ProvisioningConfig {
            dataset_parent: "tank".into(),
            enable_namespaces: true,
            ..ProvisioningConfig::default()
        };
        let volume = SagaOrchestrator::new(appliance.clone(), RetryPolicy::immediate(1))
            .provision(&request, &config)
            .await
            .unwrap();

        IdentityMap {
            identity: "test".into(),
            dataset_parent: "tank".into(),
            pool: volume.names.pool,
            volume_name: volume.names.volume_name,
            iscsi_name: volume.names.iscsi_name,
            target_id: volume.target_id,
            target_group_id: volume.target_group_id,
            extent_id: volume.extent_id,
            lun_mapping_id: volume.lun_mapping_id,
        }
    }

    fn appliance() -> Arc<InMemoryAppliance> {
        Arc::new(InMemoryAppliance::default().with_dataset("tank"))
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "best-effort".parse::<DeprovisionPolicy>().unwrap(),
            DeprovisionPolicy::BestEffort
        );
        assert_eq!(
            "FailFast".parse::<DeprovisionPolicy>().unwrap(),
            DeprovisionPolicy::FailFast
        );
        assert_matches!(
            "sometimes".parse::<DeprovisionPolicy>(),
            Err(Error::Configuration(_))
        );
        assert_eq!(DeprovisionPolicy::default().to_string(), "best-effort");
    }

    #[tokio::test]
    async fn test_deprovision_removes_everything() {
        let appliance = appliance();
        let identities = provisioned(&appliance).await;

        DeprovisionOrchestrator::new(appliance.clone(), DeprovisionPolicy::default())
            .deprovision(&identities)
            .await
            .unwrap();

        for kind in [
            ResourceKind::Volume,
            ResourceKind::Target,
            ResourceKind::TargetGroup,
            ResourceKind::Extent,
            ResourceKind::LunMapping,
        ] {
            assert_eq!(appliance.count(kind), 0, "{}", kind);
        }
        let order: Vec<_> = appliance.delete_calls().iter().map(|id| id.kind()).collect();
        assert_eq!(
            order,
            vec![ResourceKind::Target, ResourceKind::Extent, ResourceKind::Volume]
        );
    }

    #[tokio::test]
    async fn test_deprovision_twice() {
        let appliance = appliance();
        let identities = provisioned(&appliance).await;
        let metrics = Arc::new(ProvisionerMetrics::new().unwrap());
        let orchestrator =
            DeprovisionOrchestrator::new(appliance.clone(), DeprovisionPolicy::FailFast)
                .with_metrics(metrics.clone());

        orchestrator.deprovision(&identities).await.unwrap();
        // Second pass: not-found on target and extent, "dataset does not exist" on the volume
        orchestrator.deprovision(&identities).await.unwrap();

        assert_eq!(metrics.deprovisions(RESULT_SUCCESS), 2);
        assert_eq!(appliance.delete_calls().len(), 6);
    }

    #[tokio::test]
    async fn test_best_effort_attempts_every_step() {
        let appliance = appliance();
        let identities = provisioned(&appliance).await;
        appliance.fail_next_delete(ResourceKind::Target, DeleteFault::Unreachable);

        let result = DeprovisionOrchestrator::new(appliance.clone(), DeprovisionPolicy::BestEffort)
            .deprovision(&identities)
            .await;

        assert_matches!(
            result,
            Err(Error::Connectivity { kind: ResourceKind::Target, ref operation, .. })
                if operation == "delete (target)"
        );
        assert_eq!(appliance.count(ResourceKind::Extent), 0);
        assert_eq!(appliance.count(ResourceKind::Volume), 0);
        assert_eq!(appliance.count(ResourceKind::Target), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_stops() {
        let appliance = appliance();
        let identities = provisioned(&appliance).await;
        let metrics = Arc::new(ProvisionerMetrics::new().unwrap());
        appliance.fail_next_delete(ResourceKind::Extent, DeleteFault::Reject("busy".into()));

        let result = DeprovisionOrchestrator::new(appliance.clone(), DeprovisionPolicy::FailFast)
            .with_metrics(metrics.clone())
            .deprovision(&identities)
            .await;

        assert_matches!(result, Err(Error::Resource { kind: ResourceKind::Extent, .. }));
        assert_eq!(appliance.count(ResourceKind::Target), 0);
        assert_eq!(appliance.count(ResourceKind::Volume), 1);
        assert_eq!(metrics.deprovisions(RESULT_FAILURE), 1);
    }

    #[tokio::test]
    async fn test_not_found_everywhere_is_success() {
        let appliance = appliance();
        let identities = provisioned(&appliance).await;
        for kind in [ResourceKind::Target, ResourceKind::Extent, ResourceKind::Volume] {
            appliance.fail_next_delete(kind, DeleteFault::NotFound);
        }

        DeprovisionOrchestrator::new(appliance.clone(), DeprovisionPolicy::FailFast)
            .deprovision(&identities)
            .await
            .unwrap();
        // Scripted answers; nothing was actually removed
        assert_eq!(appliance.count(ResourceKind::Volume), 1);
    }
}
