//! Protocol-specific provisioning: the share/subsystem/target half of
//! CreateVolume/DeleteVolume (spec.md §4.2, §4.3.1 step 5, §4.3.2).

use std::collections::HashMap;

use tracing::instrument;

use crate::appliance::Client;
use crate::error::EngineError;
use crate::taxonomy::Protocol;

use super::params::VolumeClassParams;
use super::with_retry;

/// Mountpoint convention for FILESYSTEM datasets, matching the appliance's
/// own pool-mount layout (`/mnt/<pool>/<path>`).
pub fn mountpoint_for(dataset: &str) -> String {
    format!("/mnt/{dataset}")
}

pub fn generate_nqn(base_nqn: &str, volume_name: &str) -> String {
    format!("{base_nqn}:{}", volume_name.replace('/', "-"))
}

/// Appliance's iSCSI base IQN, matching how most ZFS-based appliances
/// (FreeNAS/TrueNAS-style) mint target IQNs from a target name.
pub fn generate_iqn(target_name: &str) -> String {
    format!("iqn.2005-10.org.appliance.ctl:{target_name}")
}

#[instrument(skip(client))]
pub async fn provision(
    client: &Client,
    dataset: &str,
    class: &VolumeClassParams,
) -> Result<HashMap<String, String>, EngineError> {
    let mut context = HashMap::new();
    if let Some(server) = &class.server {
        context.insert("server".to_string(), server.clone());
    }
    context.insert("protocol".to_string(), class.protocol.to_string());
    context.insert("datasetName".to_string(), dataset.to_string());

    match class.protocol {
        Protocol::Nfs => {
            let path = mountpoint_for(dataset);
            if with_retry("nfs_share_query_by_path", || client.nfs_share_query_by_path(&path)).await?.is_empty() {
                with_retry("nfs_share_create", || client.nfs_share_create(&path)).await?;
            }
        }
        Protocol::Nvmeof => {
            let nqn = class
                .subsystem_nqn
                .clone()
                .unwrap_or_else(|| generate_nqn("nqn.2011-06.appliance.csi", dataset));
            let subsystem = match with_retry("nvmeof_subsystem_query_by_nqn", || client.nvmeof_subsystem_query_by_nqn(&nqn)).await? {
                Some(existing) => existing,
                None => with_retry("nvmeof_subsystem_create", || client.nvmeof_subsystem_create(&nqn)).await?,
            };
            let device_path = format!("/dev/zvol/{dataset}");
            with_retry("nvmeof_namespace_create", || client.nvmeof_namespace_create(subsystem.id, &device_path)).await?;
            for port in with_retry("nvmeof_port_query", || client.nvmeof_port_query()).await? {
                with_retry("nvmeof_add_subsystem_to_port", || client.nvmeof_add_subsystem_to_port(port.id, subsystem.id)).await?;
            }
            context.insert("nqn".to_string(), nqn);
            context.insert("transport".to_string(), "tcp".to_string());
            context.insert("port".to_string(), "4420".to_string());
            context.insert("nrIOQueues".to_string(), class.nvme_nr_io_queues.unwrap_or(4).to_string());
            if let Some(qs) = class.nvme_queue_size {
                context.insert("queueSize".to_string(), qs.to_string());
            }
        }
        Protocol::Iscsi => {
            let name = dataset.replace('/', ":");
            let target = with_retry("iscsi_target_create", || client.iscsi_target_create(&name)).await?;
            let device_path = format!("/dev/zvol/{dataset}");
            let extent = with_retry("iscsi_extent_create", || client.iscsi_extent_create(&name, &device_path)).await?;
            with_retry("iscsi_targetextent_create", || client.iscsi_targetextent_create(target.id, extent.id)).await?;
            with_retry("iscsi_service_reload", || client.iscsi_service_reload()).await?;
            context.insert("iqn".to_string(), generate_iqn(&target.name));
        }
    }

    Ok(context)
}

/// Tears down the share/subsystem/target for `dataset`, tolerating
/// NotFound at every step (spec.md §4.3.2 step 4). Run before deleting the
/// dataset itself, per the fixed ordering in spec.md §5.
#[instrument(skip(client))]
pub async fn deprovision(client: &Client, dataset: &str, protocol: Protocol, nqn: Option<&str>) -> Result<(), EngineError> {
    match protocol {
        Protocol::Nfs => {
            let path = mountpoint_for(dataset);
            for share in with_retry("nfs_share_query_by_path", || client.nfs_share_query_by_path(&path)).await? {
                with_retry("nfs_share_delete", || client.nfs_share_delete(share.id)).await?;
            }
        }
        Protocol::Nvmeof => {
            if let Some(nqn) = nqn {
                if let Some(subsystem) = with_retry("nvmeof_subsystem_query_by_nqn", || client.nvmeof_subsystem_query_by_nqn(nqn)).await? {
                    for port in with_retry("nvmeof_port_query", || client.nvmeof_port_query()).await? {
                        with_retry("nvmeof_remove_subsystem_from_port", || client.nvmeof_remove_subsystem_from_port(port.id, subsystem.id)).await?;
                    }
                    with_retry("nvmeof_subsystem_delete", || client.nvmeof_subsystem_delete(subsystem.id)).await?;
                }
            }
        }
        Protocol::Iscsi => {
            let name = dataset.replace('/', ":");
            for target in with_retry("iscsi_target_query_by_name", || client.iscsi_target_query_by_name(&name)).await? {
                for mapping in with_retry("iscsi_targetextent_query_by_target", || client.iscsi_targetextent_query_by_target(target.id)).await? {
                    with_retry("iscsi_targetextent_delete", || client.iscsi_targetextent_delete(mapping.id)).await?;
                }
                with_retry("iscsi_target_delete", || client.iscsi_target_delete(target.id)).await?;
            }
            for extent in with_retry("iscsi_extent_query_by_name", || client.iscsi_extent_query_by_name(&name)).await? {
                with_retry("iscsi_extent_delete", || client.iscsi_extent_delete(extent.id)).await?;
            }
            with_retry("iscsi_service_reload", || client.iscsi_service_reload()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountpoint_follows_pool_mount_convention() {
        assert_eq!(mountpoint_for("tank/k8s/pvc-abc"), "/mnt/tank/k8s/pvc-abc");
    }

    #[test]
    fn generated_nqn_replaces_slashes() {
        assert_eq!(generate_nqn("nqn.test", "tank/k8s/vol1"), "nqn.test:tank-k8s-vol1");
    }
}
