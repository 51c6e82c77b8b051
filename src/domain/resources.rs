//! Remote Resources - the closed set of appliance objects behind one volume
//!
//! A provisioned volume is a chain of dependent appliance objects. Each kind is
//! a variant of [`Resource`]; identities are always assigned by the appliance
//! and are represented by [`ResourceId`]. Lookups that happen before an
//! identity is known go through the natural keys in [`ResourceKey`].

use serde::{Deserialize, Serialize};

// =============================================================================
// Resource Kinds
// =============================================================================

/// Kind of appliance object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// Global iSCSI service settings (read-only, never created or deleted)
    IscsiGlobalConfig,
    Dataset,
    Volume,
    Target,
    TargetGroup,
    Extent,
    LunMapping,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::IscsiGlobalConfig => write!(f, "iscsi-global-config"),
            ResourceKind::Dataset => write!(f, "dataset"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Target => write!(f, "target"),
            ResourceKind::TargetGroup => write!(f, "target-group"),
            ResourceKind::Extent => write!(f, "extent"),
            ResourceKind::LunMapping => write!(f, "lun-mapping"),
        }
    }
}

// =============================================================================
// Identities and Keys
// =============================================================================

/// Appliance-assigned identity of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResourceId {
    /// Full dataset path, e.g. `tank/default`
    Dataset { path: String },
    /// Volume name relative to its pool
    Volume { pool: String, name: String },
    Target { id: u64 },
    TargetGroup { id: u64 },
    Extent { id: u64 },
    LunMapping { id: u64 },
}

impl ResourceId {
    /// Kind of the identified resource
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::Dataset { .. } => ResourceKind::Dataset,
            ResourceId::Volume { .. } => ResourceKind::Volume,
            ResourceId::Target { .. } => ResourceKind::Target,
            ResourceId::TargetGroup { .. } => ResourceKind::TargetGroup,
            ResourceId::Extent { .. } => ResourceKind::Extent,
            ResourceId::LunMapping { .. } => ResourceKind::LunMapping,
        }
    }

    /// Numeric id for the iSCSI object kinds
    pub fn numeric(&self) -> Option<u64> {
        match self {
            ResourceId::Target { id }
            | ResourceId::TargetGroup { id }
            | ResourceId::Extent { id }
            | ResourceId::LunMapping { id } => Some(*id),
            ResourceId::Dataset { .. } | ResourceId::Volume { .. } => None,
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Dataset { path } => write!(f, "dataset/{}", path),
            ResourceId::Volume { pool, name } => write!(f, "volume/{}/{}", pool, name),
            ResourceId::Target { id } => write!(f, "target/{}", id),
            ResourceId::TargetGroup { id } => write!(f, "target-group/{}", id),
            ResourceId::Extent { id } => write!(f, "extent/{}", id),
            ResourceId::LunMapping { id } => write!(f, "lun-mapping/{}", id),
        }
    }
}

/// How to look a resource up
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    /// By appliance identity
    Id(ResourceId),
    /// Target by its iSCSI name
    TargetName(String),
    /// Target group by the target it binds and its portal group
    TargetGroupOf {
        target: u64,
        portal_group: Option<u32>,
    },
    /// Extent by name
    ExtentName(String),
    /// LUN mapping by its (target, extent, lun) composite
    LunMappingOf { target: u64, extent: u64, lun: u32 },
}

impl ResourceKey {
    /// Kind of resource this key addresses
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceKey::Id(id) => id.kind(),
            ResourceKey::TargetName(_) => ResourceKind::Target,
            ResourceKey::TargetGroupOf { .. } => ResourceKind::TargetGroup,
            ResourceKey::ExtentName(_) => ResourceKind::Extent,
            ResourceKey::LunMappingOf { .. } => ResourceKind::LunMapping,
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Id(id) => write!(f, "{}", id),
            ResourceKey::TargetName(name) => write!(f, "target name={}", name),
            ResourceKey::TargetGroupOf {
                target,
                portal_group,
            } => write!(f, "target-group target={} portal-group={:?}", target, portal_group),
            ResourceKey::ExtentName(name) => write!(f, "extent name={}", name),
            ResourceKey::LunMappingOf {
                target,
                extent,
                lun,
            } => write!(f, "lun-mapping target={} extent={} lun={}", target, extent, lun),
        }
    }
}

// =============================================================================
// Resource Attributes
// =============================================================================

/// Global iSCSI configuration of the appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiGlobalConfig {
    /// Base name prepended to every target IQN
    pub basename: String,
    pub isns_servers: Option<String>,
    pub pool_avail_threshold: Option<u32>,
}

/// ZFS dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Full path including the pool, e.g. `tank/k8s`
    pub path: String,
    /// Pool the dataset lives in
    pub pool: String,
    pub comments: Option<String>,
}

/// Block volume (zvol) carved from a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub pool: String,
    /// Name relative to the pool, e.g. `k8s/default/pvc-123`
    pub name: String,
    /// Appliance-native size string, e.g. `5 GiB`
    pub volsize: String,
    pub comments: String,
    pub compression: Option<String>,
    pub dedup: Option<String>,
    pub sparse: bool,
    pub force: bool,
    pub blocksize: Option<String>,
}

/// iSCSI target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: Option<u64>,
    pub name: String,
    pub alias: Option<String>,
    pub mode: String,
}

/// Binding of a target to portal, initiator and auth groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub id: Option<u64>,
    pub target: u64,
    pub auth_group: Option<u32>,
    pub auth_type: String,
    pub initial_digest: String,
    pub initiator_group: Option<u32>,
    pub portal_group: Option<u32>,
}

/// Extent exposing a volume's device path as block storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub id: Option<u64>,
    pub name: String,
    pub extent_type: String,
    /// Device path, e.g. `zvol/tank/default/pvc-123`
    pub disk: String,
    pub blocksize: Option<u32>,
    pub disable_physical_blocksize: bool,
    pub avail_threshold: Option<u32>,
    pub comment: String,
    pub insecure_tpc: bool,
    pub xen: bool,
    pub rpm: Option<String>,
    pub read_only: bool,
}

/// Target + extent binding at a LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunMapping {
    pub id: Option<u64>,
    pub target: u64,
    pub extent: u64,
    pub lun: u32,
}

// =============================================================================
// Resource
// =============================================================================

/// One appliance object of any kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resource {
    Dataset(Dataset),
    Volume(Volume),
    Target(Target),
    TargetGroup(TargetGroup),
    Extent(Extent),
    LunMapping(LunMapping),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Dataset(_) => ResourceKind::Dataset,
            Resource::Volume(_) => ResourceKind::Volume,
            Resource::Target(_) => ResourceKind::Target,
            Resource::TargetGroup(_) => ResourceKind::TargetGroup,
            Resource::Extent(_) => ResourceKind::Extent,
            Resource::LunMapping(_) => ResourceKind::LunMapping,
        }
    }

    /// Identity, if the appliance has assigned one.
    ///
    /// Datasets and volumes are addressed by path, so they always have one.
    pub fn id(&self) -> Option<ResourceId> {
        match self {
            Resource::Dataset(d) => Some(ResourceId::Dataset {
                path: d.path.clone(),
            }),
            Resource::Volume(v) => Some(ResourceId::Volume {
                pool: v.pool.clone(),
                name: v.name.clone(),
            }),
            Resource::Target(t) => t.id.map(|id| ResourceId::Target { id }),
            Resource::TargetGroup(t) => t.id.map(|id| ResourceId::TargetGroup { id }),
            Resource::Extent(e) => e.id.map(|id| ResourceId::Extent { id }),
            Resource::LunMapping(m) => m.id.map(|id| ResourceId::LunMapping { id }),
        }
    }

    /// Key that finds this resource without knowing its identity
    pub fn natural_key(&self) -> ResourceKey {
        match self {
            Resource::Dataset(d) => ResourceKey::Id(ResourceId::Dataset {
                path: d.path.clone(),
            }),
            Resource::Volume(v) => ResourceKey::Id(ResourceId::Volume {
                pool: v.pool.clone(),
                name: v.name.clone(),
            }),
            Resource::Target(t) => ResourceKey::TargetName(t.name.clone()),
            Resource::TargetGroup(t) => ResourceKey::TargetGroupOf {
                target: t.target,
                portal_group: t.portal_group,
            },
            Resource::Extent(e) => ResourceKey::ExtentName(e.name.clone()),
            Resource::LunMapping(m) => ResourceKey::LunMappingOf {
                target: m.target,
                extent: m.extent,
                lun: m.lun,
            },
        }
    }

    /// Whether this resource is the one `key` addresses
    pub fn matches(&self, key: &ResourceKey) -> bool {
        match key {
            ResourceKey::Id(id) => self.id().as_ref() == Some(id),
            other => &self.natural_key() == other,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Classified result of a create call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Created and returned with its identity
    Created(Resource),
    /// Acknowledged but possibly not yet materialized
    Accepted(Resource),
    /// A resource with the same natural key already exists
    AlreadyExists,
    /// A resource this one depends on is not visible (yet)
    NotFound,
}

/// Classified result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: Option<u64>) -> Resource {
        Resource::Target(Target {
            id,
            name: "default-pvc-123".into(),
            alias: None,
            mode: "iscsi".into(),
        })
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(format!("{}", ResourceKind::Volume), "volume");
        assert_eq!(format!("{}", ResourceKind::TargetGroup), "target-group");
        assert_eq!(format!("{}", ResourceKind::LunMapping), "lun-mapping");
    }

    #[test]
    fn test_identity_only_after_assignment() {
        assert_eq!(target(None).id(), None);
        assert_eq!(target(Some(7)).id(), Some(ResourceId::Target { id: 7 }));
    }

    #[test]
    fn test_matches_by_id_and_natural_key() {
        let t = target(Some(7));
        assert!(t.matches(&ResourceKey::Id(ResourceId::Target { id: 7 })));
        assert!(t.matches(&ResourceKey::TargetName("default-pvc-123".into())));
        assert!(!t.matches(&ResourceKey::Id(ResourceId::Target { id: 8 })));
        assert!(!t.matches(&ResourceKey::ExtentName("default-pvc-123".into())));
    }

    #[test]
    fn test_volume_identity_is_path() {
        let v = Resource::Volume(Volume {
            pool: "tank".into(),
            name: "default/pvc-123".into(),
            volsize: "5 GiB".into(),
            comments: String::new(),
            compression: None,
            dedup: None,
            sparse: true,
            force: false,
            blocksize: None,
        });
        let id = v.id().unwrap();
        assert_eq!(id.kind(), ResourceKind::Volume);
        assert_eq!(id.numeric(), None);
        assert_eq!(id.to_string(), "volume/tank/default/pvc-123");
    }
}
