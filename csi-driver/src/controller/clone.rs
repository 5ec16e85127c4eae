//! Clone mode selection (component C, spec.md §4.3.3).

use tracing::instrument;

use crate::appliance::{Client, TransportMode};
use crate::error::EngineError;
use crate::taxonomy::CloneMode;

use super::params::VolumeClassParams;
use super::with_retry;

/// Picks COW / Promoted / Detached per spec.md §4.3.3's table, and
/// executes it. `source_dataset` is the full ZFS path of the dataset the
/// snapshot lives on (or, for a volume content source, the temporary
/// snapshot's dataset).
#[instrument(skip(client))]
pub async fn clone_from_snapshot(
    client: &Client,
    source_dataset: &str,
    snapshot_name: &str,
    target_dataset: &str,
    class: &VolumeClassParams,
) -> Result<CloneMode, EngineError> {
    let snapshot_full_name = format!("{source_dataset}@{snapshot_name}");

    if class.detached_from_snapshots || class.detached_from_volumes {
        with_retry("replication_run_onetime_and_wait", || {
            client.replication_run_onetime_and_wait(source_dataset, target_dataset, snapshot_name, TransportMode::Local)
        })
        .await?;
        with_retry("dataset_promote", || client.dataset_promote(target_dataset)).await?;
        with_retry("snapshot_delete", || client.snapshot_delete(&format!("{target_dataset}@{snapshot_name}"))).await?;
        return Ok(CloneMode::Detached);
    }

    with_retry("snapshot_clone", || client.snapshot_clone(&snapshot_full_name, target_dataset)).await?;

    if class.promoted_from_snapshots || class.promoted_from_volumes {
        with_retry("dataset_promote", || client.dataset_promote(target_dataset)).await?;
        return Ok(CloneMode::Promoted);
    }

    Ok(CloneMode::Cow)
}

/// Restoring from a detached snapshot never promotes: promotion would
/// reverse the dependency and block later deletion of the detached
/// snapshot dataset (spec.md §4.3.3, §9). The temp snapshot on the
/// detached-snapshot dataset is intentionally retained.
#[instrument(skip(client))]
pub async fn clone_from_detached_snapshot(
    client: &Client,
    detached_snapshot_dataset: &str,
    target_dataset: &str,
) -> Result<CloneMode, EngineError> {
    let temp_name = format!("csi-restore-for-{}", leaf(target_dataset));
    with_retry("snapshot_create", || client.snapshot_create(detached_snapshot_dataset, &temp_name)).await?;
    let temp_full_name = format!("{detached_snapshot_dataset}@{temp_name}");
    with_retry("snapshot_clone", || client.snapshot_clone(&temp_full_name, target_dataset)).await?;
    Ok(CloneMode::Cow)
}

/// Clones a whole volume (not a named snapshot) by creating a temporary
/// snapshot first. spec.md §4.3.1 step 4.
#[instrument(skip(client))]
pub async fn clone_from_volume(client: &Client, source_dataset: &str, target_dataset: &str, class: &VolumeClassParams) -> Result<CloneMode, EngineError> {
    let temp_name = format!("volume-source-for-volume-{}", leaf(target_dataset));
    with_retry("snapshot_create", || client.snapshot_create(source_dataset, &temp_name)).await?;
    let mode = clone_from_snapshot(client, source_dataset, &temp_name, target_dataset, class).await?;
    if !matches!(mode, CloneMode::Detached) {
        // The temp snapshot backs the COW/promoted clone's dependency; it
        // is deliberately left in place. Detached clones already deleted
        // their replicated temp copy above.
    } else {
        with_retry("snapshot_delete", || client.snapshot_delete(&format!("{source_dataset}@{temp_name}"))).await?;
    }
    Ok(mode)
}

fn leaf(dataset_path: &str) -> &str {
    dataset_path.rsplit('/').next().unwrap_or(dataset_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_extracts_final_path_component() {
        assert_eq!(leaf("tank/k8s/pvc-abc"), "pvc-abc");
        assert_eq!(leaf("tank"), "tank");
    }
}
