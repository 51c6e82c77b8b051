//! Volume-level domain types
//!
//! Inputs and outputs of a provisioning call, the rollback stack the saga
//! builds while it runs, and the identity map that outlives the call.

use super::resources::{ResourceId, ResourceKind};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Access Modes
// =============================================================================

/// Requested access mode of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl AccessMode {
    /// Modes an iSCSI block device can honour
    pub const SUPPORTED: [AccessMode; 2] = [AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
        }
    }
}

// =============================================================================
// Provisioning Request
// =============================================================================

/// Request to provision one volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    /// Controller-generated volume name, e.g. `pvc-<uid>`
    pub name: String,
    /// Namespace of the claim
    pub namespace: String,
    /// Name of the claim within its namespace
    pub claim_name: String,
    /// Requested capacity in bytes
    pub capacity_bytes: u64,
    /// Requested access modes
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
}

impl ProvisioningRequest {
    /// Checks that need neither the storage class nor the appliance
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(Error::Configuration(format!(
                "requested capacity of {} must be greater than zero",
                self.name
            )));
        }
        self.validate_access_modes()
    }

    /// Reject access modes the volume cannot serve
    pub fn validate_access_modes(&self) -> Result<()> {
        if let Some(mode) = self.access_modes.iter().find(|m| !m.is_supported()) {
            return Err(Error::Configuration(format!(
                "invalid access mode {}: only ReadWriteOnce and ReadOnlyMany are supported",
                mode
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Provisioning State (rollback stack)
// =============================================================================

/// One confirmed resource in the saga's rollback stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub kind: ResourceKind,
    pub id: ResourceId,
    /// Whether this saga created it (adopted resources are never rolled back)
    pub created: bool,
}

/// Resources confirmed so far during one provisioning call, in creation order
#[derive(Debug, Clone, Default)]
pub struct ProvisioningState {
    entries: Vec<StateEntry>,
}

impl ProvisioningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed resource
    pub fn record(&mut self, id: ResourceId, created: bool) {
        self.entries.push(StateEntry {
            kind: id.kind(),
            id,
            created,
        });
    }

    pub fn entries(&self) -> &[StateEntry] {
        &self.entries
    }

    /// Entries to delete on rollback, most recent first
    pub fn rollback_plan(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.iter().rev().filter(|e| e.created)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Identity Map
// =============================================================================

pub const ANNOTATION_IDENTITY: &str = "freenasISCSIProvisionerIdentity";
pub const ANNOTATION_DATASET_PARENT: &str = "datasetParent";
pub const ANNOTATION_POOL: &str = "pool";
pub const ANNOTATION_VOLUME: &str = "zvol";
pub const ANNOTATION_ISCSI_NAME: &str = "iscsiName";
pub const ANNOTATION_TARGET_ID: &str = "targetId";
pub const ANNOTATION_TARGET_GROUP_ID: &str = "targetGroupId";
pub const ANNOTATION_EXTENT_ID: &str = "extentId";
pub const ANNOTATION_LUN_MAPPING_ID: &str = "targetToExtentId";

/// Identities of everything a provisioned volume owns on the appliance.
///
/// Persisted by the caller as opaque annotations; the only input to
/// deprovisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMap {
    /// Identifier of the provisioner instance that created the volume
    pub identity: String,
    pub dataset_parent: String,
    pub pool: String,
    /// Volume name relative to the pool
    pub volume_name: String,
    pub iscsi_name: String,
    pub target_id: u64,
    pub target_group_id: u64,
    pub extent_id: u64,
    pub lun_mapping_id: u64,
}

impl IdentityMap {
    /// Render as string annotations
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_IDENTITY.to_string(), self.identity.clone());
        annotations.insert(
            ANNOTATION_DATASET_PARENT.to_string(),
            self.dataset_parent.clone(),
        );
        annotations.insert(ANNOTATION_POOL.to_string(), self.pool.clone());
        annotations.insert(ANNOTATION_VOLUME.to_string(), self.volume_name.clone());
        annotations.insert(ANNOTATION_ISCSI_NAME.to_string(), self.iscsi_name.clone());
        annotations.insert(ANNOTATION_TARGET_ID.to_string(), self.target_id.to_string());
        annotations.insert(
            ANNOTATION_TARGET_GROUP_ID.to_string(),
            self.target_group_id.to_string(),
        );
        annotations.insert(ANNOTATION_EXTENT_ID.to_string(), self.extent_id.to_string());
        annotations.insert(
            ANNOTATION_LUN_MAPPING_ID.to_string(),
            self.lun_mapping_id.to_string(),
        );
        annotations
    }

    /// Parse persisted annotations.
    ///
    /// Deprovisioning needs the target, extent and volume coordinates; the
    /// target group and LUN mapping ids are informational (they go away with
    /// the target) and default to 0 when absent.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            identity: annotations
                .get(ANNOTATION_IDENTITY)
                .cloned()
                .unwrap_or_default(),
            dataset_parent: required(annotations, ANNOTATION_DATASET_PARENT)?.to_string(),
            pool: required(annotations, ANNOTATION_POOL)?.to_string(),
            volume_name: required(annotations, ANNOTATION_VOLUME)?.to_string(),
            iscsi_name: annotations
                .get(ANNOTATION_ISCSI_NAME)
                .cloned()
                .unwrap_or_default(),
            target_id: parse_id(required(annotations, ANNOTATION_TARGET_ID)?, ANNOTATION_TARGET_ID)?,
            target_group_id: optional_id(annotations, ANNOTATION_TARGET_GROUP_ID)?,
            extent_id: parse_id(required(annotations, ANNOTATION_EXTENT_ID)?, ANNOTATION_EXTENT_ID)?,
            lun_mapping_id: optional_id(annotations, ANNOTATION_LUN_MAPPING_ID)?,
        })
    }
}

fn required<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    match annotations.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Configuration(format!("{} cannot be empty", key))),
    }
}

fn parse_id(value: &str, key: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("{} is not a valid id: {}", key, value)))
}

fn optional_id(annotations: &BTreeMap<String, String>, key: &str) -> Result<u64> {
    match annotations.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => parse_id(v, key),
        _ => Ok(0),
    }
}

// =============================================================================
// Volume Descriptor
// =============================================================================

/// Connection descriptor handed back to the caller after provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDescriptor {
    pub target_portal: String,
    pub portals: Vec<String>,
    /// `<appliance-basename>:<iscsiName>`
    pub iqn: String,
    pub iscsi_interface: String,
    pub lun: u32,
    pub read_only: bool,
    pub fs_type: String,
    pub capacity_bytes: u64,
    pub access_modes: Vec<AccessMode>,
    pub identities: IdentityMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn identities() -> IdentityMap {
        IdentityMap {
            identity: "freenas-iscsi-provisioner".into(),
            dataset_parent: "tank".into(),
            pool: "tank".into(),
            volume_name: "default/pvc-123".into(),
            iscsi_name: "default-pvc-123".into(),
            target_id: 3,
            target_group_id: 4,
            extent_id: 5,
            lun_mapping_id: 6,
        }
    }

    #[test]
    fn test_access_mode_validation() {
        let mut request = ProvisioningRequest {
            name: "pvc-123".into(),
            namespace: "default".into(),
            claim_name: "data".into(),
            capacity_bytes: 1024,
            access_modes: vec![AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany],
        };
        assert!(request.validate_access_modes().is_ok());

        request.access_modes.push(AccessMode::ReadWriteMany);
        assert_matches!(request.validate_access_modes(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let request = ProvisioningRequest {
            name: "pvc-123".into(),
            namespace: "default".into(),
            claim_name: "data".into(),
            capacity_bytes: 0,
            access_modes: vec![AccessMode::ReadWriteOnce],
        };
        assert_matches!(
            request.validate(),
            Err(Error::Configuration(msg)) if msg.contains("greater than zero")
        );
        assert!(ProvisioningRequest {
            capacity_bytes: 1,
            ..request
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_rollback_plan_skips_adopted_and_reverses() {
        let mut state = ProvisioningState::new();
        state.record(
            ResourceId::Dataset {
                path: "tank/default".into(),
            },
            false,
        );
        state.record(
            ResourceId::Volume {
                pool: "tank".into(),
                name: "default/pvc-123".into(),
            },
            true,
        );
        state.record(ResourceId::Target { id: 3 }, false);
        state.record(ResourceId::TargetGroup { id: 4 }, true);

        let plan: Vec<_> = state.rollback_plan().map(|e| e.kind).collect();
        assert_eq!(plan, vec![ResourceKind::TargetGroup, ResourceKind::Volume]);
        assert_eq!(state.entries().len(), 4);
    }

    #[test]
    fn test_identity_annotations_roundtrip() {
        let map = identities();
        let annotations = map.to_annotations();
        assert_eq!(annotations.get("zvol").unwrap(), "default/pvc-123");
        assert_eq!(annotations.get("targetToExtentId").unwrap(), "6");
        assert_eq!(IdentityMap::from_annotations(&annotations).unwrap(), map);
    }

    #[test]
    fn test_identity_annotations_required_keys() {
        let mut annotations = identities().to_annotations();
        annotations.remove(ANNOTATION_TARGET_ID);
        assert_matches!(
            IdentityMap::from_annotations(&annotations),
            Err(Error::Configuration(msg)) if msg.contains("targetId")
        );

        let mut annotations = identities().to_annotations();
        annotations.insert(ANNOTATION_EXTENT_ID.into(), "abc".into());
        assert_matches!(
            IdentityMap::from_annotations(&annotations),
            Err(Error::Configuration(_))
        );

        let mut annotations = identities().to_annotations();
        annotations.remove(ANNOTATION_LUN_MAPPING_ID);
        annotations.remove(ANNOTATION_TARGET_GROUP_ID);
        let parsed = IdentityMap::from_annotations(&annotations).unwrap();
        assert_eq!(parsed.lun_mapping_id, 0);
        assert_eq!(parsed.target_group_id, 0);
    }
}
