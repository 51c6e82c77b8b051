//! Saga Orchestrator
//!
//! Provisions one volume as an ordered chain of appliance objects:
//!
//! ```text
//! global config -> [namespace dataset] -> volume -> target -> target group
//!               -> extent -> LUN mapping
//! ```
//!
//! Each confirmed object is pushed onto a [`ProvisioningState`]. When a step
//! fails for good, everything this call created is deleted again, newest
//! first, and the step's error is returned. Creates that collide with an
//! existing object adopt it instead of failing, which makes re-running a
//! partially completed provision converge.

use super::metrics::ProvisionerMetrics;
use super::naming::{
    format_volsize, truncate, VolumeNames, EXTENT_COMMENT_LIMIT, VOLUME_COMMENT_LIMIT,
};
use super::retry::{Attempt, RetryPolicy};
use crate::config::ProvisioningConfig;
use crate::domain::ports::ResourceClientRef;
use crate::domain::resources::{
    CreateOutcome, Dataset, DeleteOutcome, Extent, LunMapping, Resource, ResourceId, ResourceKey,
    ResourceKind, Target, TargetGroup, Volume,
};
use crate::domain::volume::{ProvisioningRequest, ProvisioningState};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TARGET_MODE: &str = "iscsi";
pub const INITIAL_DIGEST: &str = "Auto";
pub const EXTENT_TYPE: &str = "Disk";
pub const DEFAULT_LUN: u32 = 0;

// =============================================================================
// Saga Output
// =============================================================================

/// Everything a successful provision confirmed on the appliance
#[derive(Debug, Clone)]
pub struct ProvisionedVolume {
    pub names: VolumeNames,
    /// Appliance IQN base name
    pub basename: String,
    pub target_id: u64,
    pub target_group_id: u64,
    pub extent_id: u64,
    pub lun_mapping_id: u64,
    pub lun: u32,
    pub read_only: bool,
    /// Confirmed resources in creation order
    pub state: ProvisioningState,
}

/// Result of a single create attempt after conflict adoption
enum StepOutcome {
    Confirmed { resource: Resource, created: bool },
    NotFound,
}

// =============================================================================
// Saga Orchestrator
// =============================================================================

/// Runs the provisioning saga against one appliance
pub struct SagaOrchestrator {
    client: ResourceClientRef,
    extent_retry: RetryPolicy,
    metrics: Option<Arc<ProvisionerMetrics>>,
}

impl SagaOrchestrator {
    pub fn new(client: ResourceClientRef, extent_retry: RetryPolicy) -> Self {
        Self {
            client,
            extent_retry,
            metrics: None,
        }
    }

    /// Count rollback deletions in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<ProvisionerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Provision the volume described by `request`.
    ///
    /// Capacity, names and access modes are validated before the first
    /// remote call.
    pub async fn provision(
        &self,
        request: &ProvisioningRequest,
        config: &ProvisioningConfig,
    ) -> Result<ProvisionedVolume> {
        request.validate()?;
        let names = VolumeNames::derive(request, config)?;

        info!(
            "Provisioning {} as {} ({} bytes)",
            request.name, names.device_path, request.capacity_bytes
        );

        let global = self
            .client
            .global_config()
            .await
            .map_err(|e| e.in_step("global config"))?;

        let mut state = ProvisioningState::new();
        match self
            .run_steps(request, config, &names, &global.basename, &mut state)
            .await
        {
            Ok(volume) => {
                info!(
                    "Provisioned {} as {}:{}",
                    request.name, volume.basename, volume.names.iscsi_name
                );
                Ok(volume)
            }
            Err(e) => {
                warn!("Provisioning {} failed: {}", request.name, e);
                self.rollback(&state).await;
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        request: &ProvisioningRequest,
        config: &ProvisioningConfig,
        names: &VolumeNames,
        basename: &str,
        state: &mut ProvisioningState,
    ) -> Result<ProvisionedVolume> {
        self.ensure_datasets(config, names, state).await?;

        // Volume
        let volume = Resource::Volume(Volume {
            pool: names.pool.clone(),
            name: names.volume_name.clone(),
            volsize: format_volsize(request.capacity_bytes),
            comments: truncate(&names.comment, VOLUME_COMMENT_LIMIT),
            compression: config.volume.compression.clone(),
            dedup: config.volume.dedup.clone(),
            sparse: config.volume.sparse,
            force: config.volume.force,
            blocksize: config.volume.blocksize.clone(),
        });
        self.create_step("volume", volume, state).await?;

        // Target
        let target = Resource::Target(Target {
            id: None,
            name: names.iscsi_name.clone(),
            alias: None,
            mode: TARGET_MODE.to_string(),
        });
        let target_id = numeric_id(&self.create_step("target", target, state).await?)?;

        // Target group
        let group = Resource::TargetGroup(TargetGroup {
            id: None,
            target: target_id,
            auth_group: config.target_group.auth_group,
            auth_type: config.target_group.auth_type.clone(),
            initial_digest: INITIAL_DIGEST.to_string(),
            initiator_group: config.target_group.initiator_group,
            portal_group: config.target_group.portal_group,
        });
        let target_group_id = numeric_id(&self.create_target_group(group, state).await?)?;

        // Extent
        let extent = Resource::Extent(Extent {
            id: None,
            name: names.iscsi_name.clone(),
            extent_type: EXTENT_TYPE.to_string(),
            disk: names.device_path.clone(),
            blocksize: config.extent.blocksize,
            disable_physical_blocksize: config.extent.disable_physical_blocksize,
            avail_threshold: config.extent.avail_threshold,
            comment: truncate(&names.comment, EXTENT_COMMENT_LIMIT),
            insecure_tpc: config.extent.insecure_tpc,
            xen: config.extent.xen,
            rpm: config.extent.rpm.clone(),
            read_only: config.extent.read_only,
        });
        let extent = self.create_extent(extent, state).await?;
        let extent_id = numeric_id(&extent)?;
        let read_only = match &extent {
            Resource::Extent(e) => e.read_only,
            _ => config.extent.read_only,
        };

        // LUN mapping
        let mapping = Resource::LunMapping(LunMapping {
            id: None,
            target: target_id,
            extent: extent_id,
            lun: DEFAULT_LUN,
        });
        let mapping = self.create_step("lun mapping", mapping, state).await?;
        let lun_mapping_id = numeric_id(&mapping)?;
        let lun = match &mapping {
            Resource::LunMapping(m) => m.lun,
            _ => DEFAULT_LUN,
        };

        Ok(ProvisionedVolume {
            names: names.clone(),
            basename: basename.to_string(),
            target_id,
            target_group_id,
            extent_id,
            lun_mapping_id,
            lun,
            read_only,
            state: state.clone(),
        })
    }

    /// Check the parent dataset and ensure the namespace dataset.
    ///
    /// The namespace dataset is shared by every volume of the namespace, so
    /// it is recorded as not created and survives rollback.
    async fn ensure_datasets(
        &self,
        config: &ProvisioningConfig,
        names: &VolumeNames,
        state: &mut ProvisioningState,
    ) -> Result<()> {
        let parent = ResourceKey::Id(ResourceId::Dataset {
            path: config.dataset_parent.clone(),
        });
        let found = self
            .client
            .get(&parent)
            .await
            .map_err(|e| e.in_step("parent dataset"))?;
        if found.is_none() {
            return Err(Error::resource(
                ResourceKind::Dataset,
                "get (parent dataset)",
                format!("parent dataset {} not found", config.dataset_parent),
            ));
        }

        if let Some(path) = &names.namespace_dataset {
            let dataset = Resource::Dataset(Dataset {
                path: path.clone(),
                pool: names.pool.clone(),
                comments: None,
            });
            match self.attempt_create("namespace dataset", &dataset).await? {
                StepOutcome::Confirmed { resource, created } => {
                    if created {
                        info!("Created namespace dataset {}", path);
                    }
                    record(state, &resource, false)?;
                }
                StepOutcome::NotFound => {
                    return Err(missing_dependency("namespace dataset", &dataset))
                }
            }
        }

        Ok(())
    }

    /// Create `resource`, adopting an existing one on conflict
    async fn create_step(
        &self,
        step: &str,
        resource: Resource,
        state: &mut ProvisioningState,
    ) -> Result<Resource> {
        match self.attempt_create(step, &resource).await? {
            StepOutcome::Confirmed { resource, created } => {
                record(state, &resource, created)?;
                Ok(resource)
            }
            StepOutcome::NotFound => Err(missing_dependency(step, &resource)),
        }
    }

    /// The appliance can answer a target group create with "not found" after
    /// it has in fact created the group; look it up before giving up.
    async fn create_target_group(
        &self,
        group: Resource,
        state: &mut ProvisioningState,
    ) -> Result<Resource> {
        const STEP: &str = "target group";

        match self.attempt_create(STEP, &group).await? {
            StepOutcome::Confirmed { resource, created } => {
                record(state, &resource, created)?;
                Ok(resource)
            }
            StepOutcome::NotFound => {
                debug!("Target group create reported not found, looking it up");
                match self.lookup(STEP, &group).await? {
                    Some(resource) => {
                        record(state, &resource, true)?;
                        Ok(resource)
                    }
                    None => Err(missing_dependency(STEP, &group)),
                }
            }
        }
    }

    /// The volume may not be visible yet when the extent references it; keep
    /// trying within the retry bound.
    async fn create_extent(
        &self,
        extent: Resource,
        state: &mut ProvisioningState,
    ) -> Result<Resource> {
        const STEP: &str = "extent";

        let confirmed = self
            .extent_retry
            .run(STEP, |attempt| {
                let extent = &extent;
                async move {
                    match self.attempt_create(STEP, extent).await? {
                        StepOutcome::Confirmed { resource, created } => {
                            Ok::<_, Error>(Attempt::Done((resource, created)))
                        }
                        StepOutcome::NotFound => {
                            debug!("Volume not visible to extent yet (attempt {})", attempt);
                            Ok(Attempt::Retry)
                        }
                    }
                }
            })
            .await?;

        match confirmed {
            Some((resource, created)) => {
                record(state, &resource, created)?;
                Ok(resource)
            }
            None => Err(Error::resource(
                ResourceKind::Extent,
                "create (extent)",
                format!(
                    "volume device {} not available after {} attempts",
                    extent_disk(&extent),
                    self.extent_retry.max_attempts
                ),
            )),
        }
    }

    /// One create call, with "already exists" resolved by a natural-key lookup
    async fn attempt_create(&self, step: &str, resource: &Resource) -> Result<StepOutcome> {
        let outcome = self
            .client
            .create(resource)
            .await
            .map_err(|e| e.in_step(step))?;

        match outcome {
            CreateOutcome::Created(created) => {
                debug!("Created {}: {:?}", step, created.id());
                Ok(StepOutcome::Confirmed {
                    resource: created,
                    created: true,
                })
            }
            CreateOutcome::Accepted(accepted) => {
                debug!("Create of {} accepted: {:?}", step, accepted.id());
                Ok(StepOutcome::Confirmed {
                    resource: accepted,
                    created: true,
                })
            }
            CreateOutcome::AlreadyExists => match self.lookup(step, resource).await? {
                Some(existing) => {
                    info!("Adopting existing {} {}", step, resource.natural_key());
                    Ok(StepOutcome::Confirmed {
                        resource: existing,
                        created: false,
                    })
                }
                None => Err(Error::resource(
                    resource.kind(),
                    format!("get ({})", step),
                    format!("{} reported as existing but not found", resource.natural_key()),
                )),
            },
            CreateOutcome::NotFound => Ok(StepOutcome::NotFound),
        }
    }

    async fn lookup(&self, step: &str, resource: &Resource) -> Result<Option<Resource>> {
        self.client
            .get(&resource.natural_key())
            .await
            .map_err(|e| e.in_step(step))
    }

    /// Delete everything this call created, newest first.
    ///
    /// One pass; failures are logged and never replace the original error.
    async fn rollback(&self, state: &ProvisioningState) {
        for entry in state.rollback_plan() {
            let result = self.client.delete(&entry.id).await;
            let ok = match result {
                Ok(DeleteOutcome::Deleted) => {
                    info!("Rolled back {}", entry.id);
                    true
                }
                Ok(DeleteOutcome::NotFound) => {
                    debug!("Rollback of {} found nothing to delete", entry.id);
                    true
                }
                Err(e) if e.is_missing_dataset() => {
                    debug!("Rollback of {} found nothing to delete", entry.id);
                    true
                }
                Err(e) => {
                    warn!("Failed to roll back {}: {}", entry.id, e);
                    false
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_rollback_deletion(ok);
            }
        }
    }
}

fn record(state: &mut ProvisioningState, resource: &Resource, created: bool) -> Result<()> {
    let id = resource.id().ok_or_else(|| {
        Error::resource(
            resource.kind(),
            "create",
            "appliance returned no identity",
        )
    })?;
    state.record(id, created);
    Ok(())
}

fn numeric_id(resource: &Resource) -> Result<u64> {
    resource
        .id()
        .and_then(|id| id.numeric())
        .ok_or_else(|| Error::Internal(format!("{} has no numeric identity", resource.kind())))
}

fn missing_dependency(step: &str, resource: &Resource) -> Error {
    Error::resource(
        resource.kind(),
        format!("create ({})", step),
        format!("a resource {} depends on was not found", resource.natural_key()),
    )
}

fn extent_disk(resource: &Resource) -> &str {
    match resource {
        Resource::Extent(e) => &e.disk,
        _ => "",
    }
}
