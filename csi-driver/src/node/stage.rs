//! Staging mechanics shared by every protocol once a device (or, for NFS,
//! a share) is reachable: raw-block bind mounts and filesystem mount/
//! format, spec.md §4.4.1 step 7.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::platform::linux;

const DEVICE_SIZE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEVICE_SIZE_POLL_ATTEMPTS: u32 = 45;
const DEVICE_SIZE_POLL_CAP: Duration = Duration::from_secs(60);
const METADATA_SETTLE: Duration = Duration::from_secs(2);
const CLONE_STABILISE: Duration = Duration::from_secs(5);
const FORMAT_PROBE_RETRIES: u32 = 3;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_TOLERANCE_BYTES: u64 = 100 * 1024 * 1024;

async fn run(program: &str, args: &[&str], budget: Duration) -> Result<std::process::Output, EngineError> {
    let fut = Command::new(program).args(args).output();
    match timeout(budget, fut).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(EngineError::Internal(format!("failed to execute {program}: {e}"))),
        Err(_) => Err(EngineError::DeadlineExceeded(format!("{program} {args:?} timed out after {budget:?}"))),
    }
}

async fn device_size(device: &str) -> Result<u64, EngineError> {
    let output = run("blockdev", &["--getsize64", device], Duration::from_secs(3)).await?;
    if !output.status.success() {
        return Ok(0);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().parse().unwrap_or(0))
}

/// Raw-block mode: stage path is a plain file, bind-mounted onto the
/// device. spec.md §4.4.1 step 7.
#[instrument]
pub async fn stage_raw_block(device: &str, staging_path: &str) -> Result<(), EngineError> {
    if let Some(parent) = std::path::Path::new(staging_path).parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| EngineError::Internal(format!("failed to create staging directory: {e}")))?;
    }
    if !tokio::fs::try_exists(staging_path).await.unwrap_or(false) {
        tokio::fs::File::create(staging_path).await.map_err(|e| EngineError::Internal(format!("failed to create staging file: {e}")))?;
    }

    let device = device.to_string();
    let staging_path = staging_path.to_string();
    tokio::task::spawn_blocking(move || linux::bind_mount(&device, &staging_path))
        .await
        .map_err(|e| EngineError::Internal(format!("bind mount task panicked: {e}")))?
        .map_err(|status| EngineError::Internal(status.message().to_string()))
}

/// Merges user-supplied mount flags (from the `VolumeCapability`'s
/// `MountVolume.mount_flags` plus class parameters) with the driver
/// default `noatime`, letting the user's flags win on conflict. spec.md
/// §4.4.1 step 7.
pub fn merge_mount_options(user_flags: &[String]) -> Vec<String> {
    let mut options: Vec<String> = user_flags.to_vec();
    let user_keys: std::collections::HashSet<&str> = options.iter().map(|f| f.split('=').next().unwrap_or(f.as_str())).collect();
    if !user_keys.contains("atime") && !user_keys.contains("noatime") {
        options.push("noatime".to_string());
    }
    options
}

/// Filesystem mode: wait for the device to report a stable size, format
/// it if necessary, and mount with merged options. spec.md §4.4.1 step 7.
#[instrument(skip(mount_options))]
pub async fn stage_filesystem(
    device: &str,
    staging_path: &str,
    fs_type: &str,
    mount_options: &[String],
    expected_capacity: Option<u64>,
    cloned_from_snapshot: bool,
) -> Result<(), EngineError> {
    wait_for_device_size(device).await?;

    let _ = run("sync", &[], Duration::from_secs(10)).await;
    let _ = run("blockdev", &["--flushbufs", device], CONTROL_TIMEOUT).await;
    let _ = run("udevadm", &["trigger", "--action=change"], CONTROL_TIMEOUT).await;
    let _ = run("udevadm", &["settle"], CONTROL_TIMEOUT).await;
    tokio::time::sleep(METADATA_SETTLE).await;
    if cloned_from_snapshot {
        tokio::time::sleep(CLONE_STABILISE).await;
    }

    if let Some(expected) = expected_capacity {
        verify_size(device, expected).await?;
    }

    if needs_formatting_with_retry(device).await? {
        format(device, fs_type).await?;
    }

    let device = device.to_string();
    let staging_path = staging_path.to_string();
    let fs_type = fs_type.to_string();
    let options = merge_mount_options(mount_options);
    tokio::task::spawn_blocking(move || linux::mount_device_with_options(&device, &staging_path, &fs_type, &options))
        .await
        .map_err(|e| EngineError::Internal(format!("mount task panicked: {e}")))?
        .map_err(|status| EngineError::Internal(status.message().to_string()))
}

async fn wait_for_device_size(device: &str) -> Result<(), EngineError> {
    let deadline = tokio::time::Instant::now() + DEVICE_SIZE_POLL_CAP;
    for _ in 0..DEVICE_SIZE_POLL_ATTEMPTS {
        if device_size(device).await? > 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(DEVICE_SIZE_POLL_INTERVAL).await;
    }
    Err(EngineError::FailedPrecondition(format!("device '{device}' never reported a non-zero size")))
}

async fn verify_size(device: &str, expected: u64) -> Result<(), EngineError> {
    let actual = device_size(device).await?;
    let tolerance = (expected / 10).max(MIN_TOLERANCE_BYTES);
    if actual + tolerance < expected {
        return Err(EngineError::FailedPrecondition(format!(
            "device '{device}' reports {actual} bytes, short of expected {expected} bytes by more than the {tolerance}-byte tolerance"
        )));
    }
    Ok(())
}

/// blkid-based format-needed probe, retrying to distinguish "device busy"
/// from a clean "no filesystem" read. spec.md §4.4.1 step 7.
async fn needs_formatting_with_retry(device: &str) -> Result<bool, EngineError> {
    let mut last_busy = None;
    for attempt in 0..FORMAT_PROBE_RETRIES {
        let output = run("blkid", &["-p", device], Duration::from_secs(5)).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Device or resource busy") {
            last_busy = Some(stderr.to_string());
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if !output.status.success() {
            return Ok(true);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Ok(!stdout.contains("TYPE="));
    }
    warn!(device, attempts = FORMAT_PROBE_RETRIES, "blkid kept reporting device busy");
    Err(EngineError::FailedPrecondition(format!(
        "device '{device}' stayed busy across {FORMAT_PROBE_RETRIES} blkid probes: {}",
        last_busy.unwrap_or_default()
    )))
}

async fn format(device: &str, fs_type: &str) -> Result<(), EngineError> {
    info!(device, fs_type, "formatting unformatted device");
    let device = device.to_string();
    let fs_type = fs_type.to_string();
    tokio::task::spawn_blocking(move || linux::format_device(&device, &fs_type))
        .await
        .map_err(|e| EngineError::Internal(format!("format task panicked: {e}")))?
        .map_err(|status| EngineError::Internal(status.message().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_mount_options_adds_noatime_default() {
        let merged = merge_mount_options(&[]);
        assert_eq!(merged, vec!["noatime".to_string()]);
    }

    #[test]
    fn merge_mount_options_lets_user_atime_win() {
        let merged = merge_mount_options(&["atime".to_string()]);
        assert_eq!(merged, vec!["atime".to_string()]);
    }

    #[test]
    fn merge_mount_options_preserves_explicit_noatime_without_duplicating() {
        let merged = merge_mount_options(&["noatime".to_string(), "rw".to_string()]);
        assert_eq!(merged, vec!["noatime".to_string(), "rw".to_string()]);
    }
}
