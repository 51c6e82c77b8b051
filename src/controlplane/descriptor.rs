//! Descriptor Builder
//!
//! Turns a finished saga into the connection descriptor handed back to the
//! caller, including the identity map it must persist for deprovisioning.

use super::saga::ProvisionedVolume;
use crate::config::ProvisioningConfig;
use crate::domain::volume::{IdentityMap, ProvisioningRequest, VolumeDescriptor};

/// Build the descriptor for a provisioned volume
pub fn build_descriptor(
    identifier: &str,
    request: &ProvisioningRequest,
    config: &ProvisioningConfig,
    volume: &ProvisionedVolume,
) -> VolumeDescriptor {
    VolumeDescriptor {
        target_portal: config.target_portal.clone(),
        portals: config.portals.clone(),
        iqn: format!("{}:{}", volume.basename, volume.names.iscsi_name),
        iscsi_interface: config.iscsi_interface.clone(),
        lun: volume.lun,
        read_only: volume.read_only,
        fs_type: config.fs_type.clone(),
        capacity_bytes: request.capacity_bytes,
        access_modes: request.access_modes.clone(),
        identities: IdentityMap {
            identity: identifier.to_string(),
            dataset_parent: config.dataset_parent.clone(),
            pool: volume.names.pool.clone(),
            volume_name: volume.names.volume_name.clone(),
            iscsi_name: volume.names.iscsi_name.clone(),
            target_id: volume.target_id,
            target_group_id: volume.target_group_id,
            extent_id: volume.extent_id,
            lun_mapping_id: volume.lun_mapping_id,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::naming::VolumeNames;
    use crate::domain::volume::{AccessMode, ProvisioningState};

    #[test]
    fn test_build_descriptor() {
        let request = ProvisioningRequest {
            name: "pvc-123".into(),
            namespace: "default".into(),
            claim_name: "data".into(),
            capacity_bytes: 5 << 30,
            access_modes: vec![AccessMode::ReadOnlyMany],
        };
        let config = ProvisioningConfig {
            dataset_parent: "tank".into(),
            enable_namespaces: true,
            portals: vec!["10.0.0.2:3260".into()],
            fs_type: "xfs".into(),
            ..ProvisioningConfig::default()
        };
        let volume = ProvisionedVolume {
            names: VolumeNames::derive(&request, &config).unwrap(),
            basename: "iqn.2005-10.org.freenas.ctl".into(),
            target_id: 3,
            target_group_id: 4,
            extent_id: 5,
            lun_mapping_id: 6,
            lun: 0,
            read_only: true,
            state: ProvisioningState::new(),
        };

        let descriptor = build_descriptor("freenas-iscsi-provisioner", &request, &config, &volume);
        assert_eq!(descriptor.iqn, "iqn.2005-10.org.freenas.ctl:default-pvc-123");
        assert_eq!(descriptor.target_portal, "localhost:3260");
        assert_eq!(descriptor.portals, vec!["10.0.0.2:3260".to_string()]);
        assert_eq!(descriptor.iscsi_interface, "default");
        assert_eq!(descriptor.fs_type, "xfs");
        assert!(descriptor.read_only);
        assert_eq!(descriptor.access_modes, vec![AccessMode::ReadOnlyMany]);

        let annotations = descriptor.identities.to_annotations();
        assert_eq!(annotations.get("zvol").unwrap(), "default/pvc-123");
        assert_eq!(annotations.get("targetId").unwrap(), "3");
        assert_eq!(
            annotations.get("freenasISCSIProvisionerIdentity").unwrap(),
            "freenas-iscsi-provisioner"
        );
    }
}
