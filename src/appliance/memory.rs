//! In-Memory Appliance
//!
//! A [`ResourceClient`] that keeps every object in process memory and behaves
//! like the real appliance where the saga cares: natural keys are unique,
//! volumes materialize asynchronously, deleting a target cascades to its
//! groups and LUN mappings, and deleting a missing volume answers with the
//! "dataset does not exist" message instead of a not-found.
//!
//! Faults can be scripted per kind, which is what the saga tests use. The
//! binary uses it for `--standalone` runs.

use crate::domain::ports::ResourceClient;
use crate::domain::resources::{
    CreateOutcome, Dataset, DeleteOutcome, Extent, IscsiGlobalConfig, LunMapping, Resource,
    ResourceId, ResourceKey, ResourceKind, Target, TargetGroup, Volume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// Base name reported by a fresh in-memory appliance
pub const DEFAULT_BASENAME: &str = "iqn.2005-10.org.freenas.ctl";

// =============================================================================
// Fault Scripts
// =============================================================================

/// Scripted answer to the next create of a kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateFault {
    AlreadyExists,
    NotFound,
    /// Create the object but answer "not found"
    NotFoundAfterCreate,
    Reject(String),
    Unreachable,
}

/// Scripted answer to the next delete of a kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteFault {
    NotFound,
    Reject(String),
    Unreachable,
}

// =============================================================================
// Appliance State
// =============================================================================

#[derive(Debug, Default)]
struct ApplianceState {
    next_id: u64,
    datasets: BTreeMap<String, Dataset>,
    /// Keyed by (pool, name); value carries the remaining not-yet-visible polls
    volumes: BTreeMap<(String, String), (Volume, u32)>,
    targets: BTreeMap<u64, Target>,
    target_groups: BTreeMap<u64, TargetGroup>,
    extents: BTreeMap<u64, Extent>,
    lun_mappings: BTreeMap<u64, LunMapping>,

    create_faults: HashMap<ResourceKind, VecDeque<CreateFault>>,
    delete_faults: HashMap<ResourceKind, VecDeque<DeleteFault>>,
    materialization_polls: u32,
    unreachable: bool,

    create_calls: Vec<ResourceKind>,
    delete_calls: Vec<ResourceId>,
    remote_calls: usize,
}

impl ApplianceState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn all(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = Vec::new();
        out.extend(self.datasets.values().cloned().map(Resource::Dataset));
        out.extend(self.volumes.values().map(|(v, _)| Resource::Volume(v.clone())));
        out.extend(self.targets.values().cloned().map(Resource::Target));
        out.extend(self.target_groups.values().cloned().map(Resource::TargetGroup));
        out.extend(self.extents.values().cloned().map(Resource::Extent));
        out.extend(self.lun_mappings.values().cloned().map(Resource::LunMapping));
        out
    }

    fn find(&self, key: &ResourceKey) -> Option<Resource> {
        self.all().into_iter().find(|r| r.matches(key))
    }

    fn volume_for_disk(&mut self, disk: &str) -> Option<&mut (Volume, u32)> {
        let path = disk.strip_prefix("zvol/")?;
        let (pool, name) = path.split_once('/')?;
        self.volumes.get_mut(&(pool.to_string(), name.to_string()))
    }

    fn create_inner(&mut self, resource: &Resource) -> CreateOutcome {
        if self.find(&resource.natural_key()).is_some() {
            return CreateOutcome::AlreadyExists;
        }

        match resource {
            Resource::Dataset(d) => {
                let parent = match d.path.rsplit_once('/') {
                    Some((parent, _)) => parent,
                    None => return CreateOutcome::NotFound,
                };
                if !self.datasets.contains_key(parent) {
                    return CreateOutcome::NotFound;
                }
                self.datasets.insert(d.path.clone(), d.clone());
                CreateOutcome::Created(resource.clone())
            }
            Resource::Volume(v) => {
                let parent = match v.name.rsplit_once('/') {
                    Some((dir, _)) => format!("{}/{}", v.pool, dir),
                    None => v.pool.clone(),
                };
                if !self.datasets.contains_key(&parent) {
                    return CreateOutcome::NotFound;
                }
                let polls = self.materialization_polls;
                self.volumes
                    .insert((v.pool.clone(), v.name.clone()), (v.clone(), polls));
                CreateOutcome::Accepted(resource.clone())
            }
            Resource::Target(t) => {
                let id = self.allocate_id();
                let target = Target {
                    id: Some(id),
                    ..t.clone()
                };
                self.targets.insert(id, target.clone());
                CreateOutcome::Created(Resource::Target(target))
            }
            Resource::TargetGroup(g) => {
                if !self.targets.contains_key(&g.target) {
                    return CreateOutcome::NotFound;
                }
                let id = self.allocate_id();
                let group = TargetGroup {
                    id: Some(id),
                    ..g.clone()
                };
                self.target_groups.insert(id, group.clone());
                CreateOutcome::Created(Resource::TargetGroup(group))
            }
            Resource::Extent(e) => {
                match self.volume_for_disk(&e.disk) {
                    None => return CreateOutcome::NotFound,
                    Some((_, polls)) if *polls > 0 => {
                        *polls -= 1;
                        return CreateOutcome::NotFound;
                    }
                    Some(_) => {}
                }
                let id = self.allocate_id();
                let extent = Extent {
                    id: Some(id),
                    ..e.clone()
                };
                self.extents.insert(id, extent.clone());
                CreateOutcome::Created(Resource::Extent(extent))
            }
            Resource::LunMapping(m) => {
                if !self.targets.contains_key(&m.target) || !self.extents.contains_key(&m.extent) {
                    return CreateOutcome::NotFound;
                }
                let taken = self.lun_mappings.values().any(|existing| {
                    existing.target == m.target
                        && (existing.lun == m.lun || existing.extent == m.extent)
                });
                if taken {
                    return CreateOutcome::AlreadyExists;
                }
                let id = self.allocate_id();
                let mapping = LunMapping {
                    id: Some(id),
                    ..m.clone()
                };
                self.lun_mappings.insert(id, mapping.clone());
                CreateOutcome::Created(Resource::LunMapping(mapping))
            }
        }
    }

    fn delete_inner(&mut self, id: &ResourceId) -> Result<DeleteOutcome> {
        let removed = match id {
            ResourceId::Dataset { path } => self.datasets.remove(path).is_some(),
            ResourceId::Volume { pool, name } => {
                if self.volumes.remove(&(pool.clone(), name.clone())).is_none() {
                    return Err(Error::resource(
                        ResourceKind::Volume,
                        "delete",
                        format!("status 400: dataset does not exist: {}/{}", pool, name),
                    ));
                }
                true
            }
            ResourceId::Target { id } => {
                let removed = self.targets.remove(id).is_some();
                if removed {
                    self.target_groups.retain(|_, g| g.target != *id);
                    self.lun_mappings.retain(|_, m| m.target != *id);
                }
                removed
            }
            ResourceId::TargetGroup { id } => self.target_groups.remove(id).is_some(),
            ResourceId::Extent { id } => {
                let removed = self.extents.remove(id).is_some();
                if removed {
                    self.lun_mappings.retain(|_, m| m.extent != *id);
                }
                removed
            }
            ResourceId::LunMapping { id } => self.lun_mappings.remove(id).is_some(),
        };

        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }
}

// =============================================================================
// In-Memory Appliance
// =============================================================================

/// Appliance simulated in process memory
pub struct InMemoryAppliance {
    basename: String,
    state: Mutex<ApplianceState>,
}

impl Default for InMemoryAppliance {
    fn default() -> Self {
        Self::new(DEFAULT_BASENAME)
    }
}

impl InMemoryAppliance {
    /// Create an empty appliance reporting `basename`
    pub fn new(basename: impl Into<String>) -> Self {
        Self {
            basename: basename.into(),
            state: Mutex::new(ApplianceState::default()),
        }
    }

    /// Add an existing dataset (e.g. the pool root)
    pub fn with_dataset(self, path: &str) -> Self {
        let pool = path.split('/').next().unwrap_or(path).to_string();
        self.state.lock().datasets.insert(
            path.to_string(),
            Dataset {
                path: path.to_string(),
                pool,
                comments: None,
            },
        );
        self
    }

    /// Newly created volumes stay invisible to extents for `polls` attempts
    pub fn set_materialization_polls(&self, polls: u32) {
        self.state.lock().materialization_polls = polls;
    }

    /// Make every call fail as if the appliance were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Queue a fault for the next create of `kind`
    pub fn fail_next_create(&self, kind: ResourceKind, fault: CreateFault) {
        self.state
            .lock()
            .create_faults
            .entry(kind)
            .or_default()
            .push_back(fault);
    }

    /// Queue a fault for the next delete of `kind`
    pub fn fail_next_delete(&self, kind: ResourceKind, fault: DeleteFault) {
        self.state
            .lock()
            .delete_faults
            .entry(kind)
            .or_default()
            .push_back(fault);
    }

    /// Number of live objects of `kind`
    pub fn count(&self, kind: ResourceKind) -> usize {
        let state = self.state.lock();
        match kind {
            ResourceKind::IscsiGlobalConfig => 1,
            ResourceKind::Dataset => state.datasets.len(),
            ResourceKind::Volume => state.volumes.len(),
            ResourceKind::Target => state.targets.len(),
            ResourceKind::TargetGroup => state.target_groups.len(),
            ResourceKind::Extent => state.extents.len(),
            ResourceKind::LunMapping => state.lun_mappings.len(),
        }
    }

    /// Snapshot of every live object
    pub fn resources(&self) -> Vec<Resource> {
        self.state.lock().all()
    }

    /// Kinds of every create call received, in order
    pub fn create_calls(&self) -> Vec<ResourceKind> {
        self.state.lock().create_calls.clone()
    }

    /// Identities of every delete call received, in order
    pub fn delete_calls(&self) -> Vec<ResourceId> {
        self.state.lock().delete_calls.clone()
    }

    /// Total calls of any kind received
    pub fn remote_calls(&self) -> usize {
        self.state.lock().remote_calls
    }

    fn unreachable_error(kind: ResourceKind, operation: &str) -> Error {
        Error::connectivity(kind, operation, "connection refused")
    }
}

#[async_trait]
impl ResourceClient for InMemoryAppliance {
    async fn global_config(&self) -> Result<IscsiGlobalConfig> {
        let mut state = self.state.lock();
        state.remote_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable_error(ResourceKind::IscsiGlobalConfig, "get"));
        }
        Ok(IscsiGlobalConfig {
            basename: self.basename.clone(),
            isns_servers: None,
            pool_avail_threshold: None,
        })
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let mut state = self.state.lock();
        state.remote_calls += 1;
        if state.unreachable {
            return Err(Self::unreachable_error(key.kind(), "get"));
        }
        Ok(state.find(key))
    }

    async fn create(&self, resource: &Resource) -> Result<CreateOutcome> {
        let kind = resource.kind();
        let mut state = self.state.lock();
        state.remote_calls += 1;
        state.create_calls.push(kind);
        if state.unreachable {
            return Err(Self::unreachable_error(kind, "create"));
        }

        if let Some(fault) = state.create_faults.get_mut(&kind).and_then(VecDeque::pop_front) {
            debug!("Injecting create fault for {}: {:?}", kind, fault);
            return match fault {
                CreateFault::AlreadyExists => Ok(CreateOutcome::AlreadyExists),
                CreateFault::NotFound => Ok(CreateOutcome::NotFound),
                CreateFault::NotFoundAfterCreate => {
                    state.create_inner(resource);
                    Ok(CreateOutcome::NotFound)
                }
                CreateFault::Reject(reason) => Err(Error::resource(kind, "create", reason)),
                CreateFault::Unreachable => Err(Self::unreachable_error(kind, "create")),
            };
        }

        Ok(state.create_inner(resource))
    }

    async fn delete(&self, id: &ResourceId) -> Result<DeleteOutcome> {
        let kind = id.kind();
        let mut state = self.state.lock();
        state.remote_calls += 1;
        state.delete_calls.push(id.clone());
        if state.unreachable {
            return Err(Self::unreachable_error(kind, "delete"));
        }

        if let Some(fault) = state.delete_faults.get_mut(&kind).and_then(VecDeque::pop_front) {
            debug!("Injecting delete fault for {}: {:?}", kind, fault);
            return match fault {
                DeleteFault::NotFound => Ok(DeleteOutcome::NotFound),
                DeleteFault::Reject(reason) => Err(Error::resource(kind, "delete", reason)),
                DeleteFault::Unreachable => Err(Self::unreachable_error(kind, "delete")),
            };
        }

        state.delete_inner(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn target(name: &str) -> Resource {
        Resource::Target(Target {
            id: None,
            name: name.into(),
            alias: None,
            mode: "iscsi".into(),
        })
    }

    #[tokio::test]
    async fn test_target_names_are_unique() {
        let appliance = InMemoryAppliance::default();

        let created = appliance.create(&target("a")).await.unwrap();
        assert_matches!(created, CreateOutcome::Created(Resource::Target(Target { id: Some(_), .. })));

        assert_eq!(
            appliance.create(&target("a")).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(appliance.count(ResourceKind::Target), 1);

        let found = appliance
            .get(&ResourceKey::TargetName("a".into()))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_target_delete_cascades() {
        let appliance = InMemoryAppliance::default();
        let id = match appliance.create(&target("a")).await.unwrap() {
            CreateOutcome::Created(r) => r.id().unwrap().numeric().unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        };
        let group = Resource::TargetGroup(TargetGroup {
            id: None,
            target: id,
            auth_group: None,
            auth_type: "None".into(),
            initial_digest: "Auto".into(),
            initiator_group: None,
            portal_group: Some(1),
        });
        appliance.create(&group).await.unwrap();
        assert_eq!(appliance.count(ResourceKind::TargetGroup), 1);

        let outcome = appliance.delete(&ResourceId::Target { id }).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(appliance.count(ResourceKind::TargetGroup), 0);

        let outcome = appliance.delete(&ResourceId::Target { id }).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_missing_volume_delete_reports_dataset_message() {
        let appliance = InMemoryAppliance::default().with_dataset("tank");
        let err = appliance
            .delete(&ResourceId::Volume {
                pool: "tank".into(),
                name: "gone".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_missing_dataset());
    }

    #[tokio::test]
    async fn test_scripted_faults_are_consumed_in_order() {
        let appliance = InMemoryAppliance::default();
        appliance.fail_next_create(ResourceKind::Target, CreateFault::NotFound);
        appliance.fail_next_create(
            ResourceKind::Target,
            CreateFault::Reject("status 500".into()),
        );

        assert_eq!(
            appliance.create(&target("a")).await.unwrap(),
            CreateOutcome::NotFound
        );
        assert_matches!(
            appliance.create(&target("a")).await,
            Err(Error::Resource { .. })
        );
        assert_matches!(
            appliance.create(&target("a")).await,
            Ok(CreateOutcome::Created(_))
        );
        assert_eq!(appliance.create_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let appliance = InMemoryAppliance::default();
        appliance.set_unreachable(true);
        assert_matches!(
            appliance.global_config().await,
            Err(Error::Connectivity { .. })
        );
    }
}
