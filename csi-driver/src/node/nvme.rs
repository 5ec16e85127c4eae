//! NVMe-oF attach/detach state machine (component D, spec.md §4.4).
//!
//! Grounded on `platform::linux::connect_nvmeof`/`find_nvmeof_device`'s use
//! of `nvme list -o json` + sysfs fallback, generalised into the exact
//! outer/inner retry loops and timeouts spec.md §4.4.4/§5 call for. Shells
//! out via `tokio::process::Command` rather than `std::process::Command`
//! so every step gets an independent timeout instead of blocking a worker
//! thread indefinitely.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::EngineError;
use crate::retry::{is_transient_nvme_error, retry, RetryPolicy};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UDEV_TIMEOUT: Duration = Duration::from_secs(10);
const SIZE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const OUTER_ATTEMPTS: u32 = 10;
const OUTER_BACKOFF: Duration = Duration::from_secs(2);
const SUBSYSTEM_LIVE_TIMEOUT: Duration = Duration::from_secs(60);
const DEVICE_APPEAR_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const DIAGNOSTIC_EVERY: u32 = 10;

const CONNECT_RETRY: RetryPolicy = RetryPolicy::new(6, Duration::from_secs(2), 1.5, Duration::from_secs(10));

/// Connection parameters parsed out of `volume_context` (spec.md §4.4.1
/// step 1). `nqn` and `server` are mandatory; everything else defaults.
#[derive(Debug, Clone)]
pub struct NvmeParams {
    pub nqn: String,
    pub server: String,
    pub transport: String,
    pub port: u16,
    pub nr_io_queues: u32,
    pub queue_size: Option<u32>,
}

impl NvmeParams {
    pub fn parse(context: &HashMap<String, String>) -> Result<Self, EngineError> {
        let nqn = context.get("nqn").cloned().ok_or_else(|| EngineError::InvalidArgument("volume_context missing 'nqn'".into()))?;
        let server = context.get("server").cloned().ok_or_else(|| EngineError::InvalidArgument("volume_context missing 'server'".into()))?;
        let transport = context.get("transport").cloned().unwrap_or_else(|| "tcp".to_string());
        let port = context
            .get("port")
            .map(|p| p.parse::<u16>())
            .transpose()
            .map_err(|_| EngineError::InvalidArgument("volume_context 'port' is not a valid port number".into()))?
            .unwrap_or(4420);
        let nr_io_queues = context
            .get("nrIOQueues")
            .map(|n| n.parse::<u32>())
            .transpose()
            .map_err(|_| EngineError::InvalidArgument("volume_context 'nrIOQueues' is not a number".into()))?
            .unwrap_or(4);
        let queue_size = context
            .get("queueSize")
            .map(|n| n.parse::<u32>())
            .transpose()
            .map_err(|_| EngineError::InvalidArgument("volume_context 'queueSize' is not a number".into()))?;

        Ok(Self {
            nqn,
            server,
            transport,
            port,
            nr_io_queues,
            queue_size,
        })
    }
}

async fn run(program: &str, args: &[&str], budget: Duration) -> Result<std::process::Output, EngineError> {
    let fut = Command::new(program).args(args).output();
    match timeout(budget, fut).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(EngineError::Internal(format!("failed to execute {program}: {e}"))),
        Err(_) => Err(EngineError::DeadlineExceeded(format!("{program} {args:?} timed out after {budget:?}"))),
    }
}

/// `nvme` CLI presence check, spec.md §4.4.1 step 3.
pub async fn cli_available() -> bool {
    run("nvme", &["version"], Duration::from_secs(5)).await.map(|o| o.status.success()).unwrap_or(false)
}

/// `/dev/nvmeXn1` -> `/dev/nvmeX`, splitting on the last `n<digit>` in the
/// basename. spec.md §4.4.3.
pub fn controller_device(namespace_device: &str) -> String {
    let (dir, name) = namespace_device.rsplit_once('/').map(|(d, n)| (format!("{d}/"), n)).unwrap_or_default();
    let bytes = name.as_bytes();
    for i in (0..bytes.len()).rev() {
        if bytes[i] == b'n' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            return format!("{dir}{}", &name[..i]);
        }
    }
    format!("{dir}{name}")
}

async fn blockdev_size(device: &str) -> Result<u64, EngineError> {
    let output = run("blockdev", &["--getsize64", device], SIZE_PROBE_TIMEOUT).await?;
    if !output.status.success() {
        return Ok(0);
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().or(Ok(0))
}

/// Quick health check, spec.md §4.4.3.
async fn is_healthy(device: &str) -> bool {
    blockdev_size(device).await.unwrap_or(0) > 0
}

async fn list_subsys() -> Result<Value, EngineError> {
    let output = run("nvme", &["list-subsys", "-o", "json"], Duration::from_secs(10)).await?;
    serde_json::from_slice(&output.stdout).map_err(|e| EngineError::Internal(format!("failed to parse nvme list-subsys output: {e}")))
}

fn is_namespace_device(name: &str) -> bool {
    let name = name.rsplit('/').next().unwrap_or(name);
    if !name.starts_with("nvme") {
        return false;
    }
    let rest = &name[4..];
    match rest.find('n') {
        Some(idx) if idx > 0 => rest[..idx].bytes().all(|b| b.is_ascii_digit()) && rest[idx + 1..].bytes().all(|b| b.is_ascii_digit()) && !rest[idx + 1..].is_empty(),
        _ => false,
    }
}

/// Subsystem liveness + device path for `nqn`, from `nvme list-subsys`'s
/// JSON (spec.md §4.4.1 step 2, 5d/5e). Falls back to a sysfs scan when
/// the CLI's JSON doesn't carry what we need.
async fn find_subsystem(nqn: &str) -> (bool, Option<String>) {
    if let Ok(root) = list_subsys().await {
        let hosts = root.get("Subsystems").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        for subsys in &hosts {
            let subsys_nqn = subsys.get("NQN").or_else(|| subsys.get("SubsystemNQN")).and_then(|v| v.as_str()).unwrap_or("");
            if subsys_nqn != nqn {
                continue;
            }
            let live = subsys
                .get("Paths")
                .and_then(|p| p.as_array())
                .map(|paths| paths.iter().any(|p| p.get("State").and_then(|s| s.as_str()) == Some("live")))
                .unwrap_or(false);
            let device = subsys
                .get("Namespaces")
                .or_else(|| subsys.get("Paths"))
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.iter().find_map(|e| e.get("NSDev").or_else(|| e.get("Name")).and_then(|v| v.as_str())))
                .map(|dev| if dev.starts_with('/') { dev.to_string() } else { format!("/dev/{dev}") });
            return (live, device);
        }
    }

    sysfs_find_subsystem(nqn).await
}

async fn sysfs_find_subsystem(nqn: &str) -> (bool, Option<String>) {
    let nqn = nqn.to_string();
    tokio::task::spawn_blocking(move || {
        let root = std::path::Path::new("/sys/class/nvme-subsystem");
        let Ok(entries) = std::fs::read_dir(root) else {
            return (false, None);
        };
        for entry in entries.flatten() {
            let Ok(found) = std::fs::read_to_string(entry.path().join("subsysnqn")) else { continue };
            if found.trim() != nqn {
                continue;
            }
            let mut device = None;
            if let Ok(ns_entries) = std::fs::read_dir(entry.path()) {
                for ns in ns_entries.flatten() {
                    let name = ns.file_name().to_string_lossy().to_string();
                    if is_namespace_device(&name) {
                        device = Some(format!("/dev/{name}"));
                        break;
                    }
                }
            }
            let live = device.is_some();
            return (live, device);
        }
        (false, None)
    })
    .await
    .unwrap_or((false, None))
}

async fn disconnect(nqn: &str) -> Result<(), EngineError> {
    let output = run("nvme", &["disconnect", "-n", nqn], DISCONNECT_TIMEOUT).await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No subsystems") || stderr.contains("not found") {
        return Ok(());
    }
    Err(EngineError::Internal(format!("nvme disconnect failed: {stderr}")))
}

async fn discover(params: &NvmeParams) {
    let port = params.port.to_string();
    let args = ["discover", "-t", &params.transport, "-a", &params.server, "-s", &port];
    if let Err(e) = run("nvme", &args, DISCOVER_TIMEOUT).await {
        debug!(error = %e, "nvme discover failed, continuing without it");
    }
}

async fn connect_once(params: &NvmeParams) -> Result<(), String> {
    let port = params.port.to_string();
    let nr_io_queues = params.nr_io_queues.to_string();
    let mut args = vec![
        "connect".to_string(),
        "--nqn".to_string(),
        params.nqn.clone(),
        "--transport".to_string(),
        params.transport.clone(),
        "--traddr".to_string(),
        params.server.clone(),
        "--trsvcid".to_string(),
        port,
        "--ctrl-loss-tmo=60".to_string(),
        "--keep-alive-tmo=5".to_string(),
        "--reconnect-delay=2".to_string(),
        format!("--nr-io-queues={nr_io_queues}"),
    ];
    if let Some(qs) = params.queue_size {
        args.push(format!("--queue-size={qs}"));
    }
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = run("nvme", &arg_refs, CONNECT_TIMEOUT).await.map_err(|e| e.to_string())?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if stderr.contains("already connected") {
        return Ok(());
    }
    Err(stderr)
}

async fn connect_with_retry(params: &NvmeParams) -> Result<(), EngineError> {
    retry("nvme connect", CONNECT_RETRY, |e: &String| is_transient_nvme_error(e), || connect_once(params))
        .await
        .map_err(|e| EngineError::FailedPrecondition(format!("nvme connect to '{}' failed: {e}", params.nqn)))
}

async fn udev_settle() {
    for subsystem in ["nvme", "block"] {
        let _ = run("udevadm", &["trigger", "--subsystem-match", subsystem], UDEV_TIMEOUT).await;
    }
    let _ = run("udevadm", &["settle"], UDEV_TIMEOUT).await;
}

async fn wait_subsystem_live(nqn: &str) -> Result<(), EngineError> {
    let deadline = tokio::time::Instant::now() + SUBSYSTEM_LIVE_TIMEOUT;
    loop {
        let (live, _) = find_subsystem(nqn).await;
        if live {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::DeadlineExceeded(format!("subsystem for '{nqn}' did not go live within {SUBSYSTEM_LIVE_TIMEOUT:?}")));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn dump_diagnostics(nqn: &str) {
    if let Ok(json) = list_subsys().await {
        warn!(nqn, subsystems = %json, "nvme attach diagnostics");
    }
}

/// Controller device (e.g. `/dev/nvme0`) backing `nqn`'s live path, read
/// fresh from `nvme list-subsys` each time it's needed: no namespace device
/// is known yet while `wait_device` is still waiting for one to appear.
/// spec.md §4.4.1 step 5e.
async fn find_controller(nqn: &str) -> Option<String> {
    let root = list_subsys().await.ok()?;
    let hosts = root.get("Subsystems").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    for subsys in &hosts {
        let subsys_nqn = subsys.get("NQN").or_else(|| subsys.get("SubsystemNQN")).and_then(|v| v.as_str()).unwrap_or("");
        if subsys_nqn != nqn {
            continue;
        }
        let name = subsys
            .get("Paths")
            .and_then(|p| p.as_array())
            .and_then(|paths| paths.iter().find_map(|p| p.get("Name").and_then(|v| v.as_str())))?;
        return Some(if name.starts_with('/') { name.to_string() } else { format!("/dev/{name}") });
    }
    None
}

async fn wait_device(nqn: &str) -> Result<String, EngineError> {
    let deadline = tokio::time::Instant::now() + DEVICE_APPEAR_TIMEOUT;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let (_, device) = find_subsystem(nqn).await;
        if let Some(device) = &device
            && is_healthy(device).await
        {
            return Ok(device.clone());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::DeadlineExceeded(format!("device for '{nqn}' did not appear within {DEVICE_APPEAR_TIMEOUT:?}")));
        }

        if attempt % DIAGNOSTIC_EVERY == 0 {
            if let Some(controller) = find_controller(nqn).await {
                let _ = run("nvme", &["ns-rescan", &controller], Duration::from_secs(10)).await;
            }
            udev_settle().await;
            dump_diagnostics(nqn).await;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// spec.md §4.4.1 step 2: reuse an already-attached, healthy device
/// without going through the attach loop at all.
#[instrument(skip(params))]
pub async fn try_reuse(params: &NvmeParams) -> Result<Option<String>, EngineError> {
    let (live, device) = find_subsystem(&params.nqn).await;
    let Some(device) = device else {
        return Ok(None);
    };
    if !live || !is_healthy(&device).await {
        warn!(nqn = %params.nqn, device = %device, "existing NVMe-oF device is unhealthy, disconnecting before reattach");
        disconnect(&params.nqn).await?;
        return Ok(None);
    }
    let controller = controller_device(&device);
    let _ = run("nvme", &["ns-rescan", &controller], Duration::from_secs(10)).await;
    Ok(Some(device))
}

/// Full attach: try-reuse, then the outer attach loop (spec.md §4.4.1
/// steps 2-5, §4.4.4). Returns the namespace device path.
#[instrument(skip(params, semaphore))]
pub async fn attach(params: &NvmeParams, semaphore: &Semaphore) -> Result<String, EngineError> {
    if let Some(device) = try_reuse(params).await? {
        return Ok(device);
    }

    if !cli_available().await {
        return Err(EngineError::FailedPrecondition("nvme CLI not available on this node".into()));
    }

    let _permit = semaphore
        .acquire()
        .await
        .map_err(|_| EngineError::Internal("attach semaphore closed".into()))?;

    let mut last_err = EngineError::Internal("attach loop never ran".into());
    for outer_attempt in 1..=OUTER_ATTEMPTS {
        discover(params).await;

        if let Err(e) = connect_with_retry(params).await {
            last_err = e;
            tokio::time::sleep(OUTER_BACKOFF).await;
            continue;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        udev_settle().await;

        if let Err(e) = wait_subsystem_live(&params.nqn).await {
            last_err = e;
            disconnect(&params.nqn).await?;
            tokio::time::sleep(OUTER_BACKOFF).await;
            continue;
        }

        match wait_device(&params.nqn).await {
            Ok(device) => return Ok(device),
            Err(e) => {
                last_err = e;
                disconnect(&params.nqn).await?;
                tokio::time::sleep(OUTER_BACKOFF).await;
                continue;
            }
        }
    }

    warn!(nqn = %params.nqn, attempts = OUTER_ATTEMPTS, error = %last_err, "nvme-of attach loop exhausted");
    Err(EngineError::Internal(format!(
        "failed to attach NVMe-oF volume '{}' after {OUTER_ATTEMPTS} attempts: {last_err}",
        params.nqn
    )))
}

/// spec.md §4.4.2: disconnect, tolerating "already gone".
pub async fn detach(nqn: &str) -> Result<(), EngineError> {
    disconnect(nqn).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Derives the NQN for an already-staged volume whose `volume_context`
/// no longer carries one, by reading the controller's sysfs attribute.
/// spec.md §4.4.2.
pub async fn nqn_from_device(namespace_device: &str) -> Result<String, EngineError> {
    let controller = controller_device(namespace_device);
    let name = controller.rsplit('/').next().unwrap_or(&controller).to_string();
    let path = format!("/sys/class/nvme/{name}/subsysnqn");
    tokio::fs::read_to_string(&path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| EngineError::NotFound(format!("could not read {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_device_splits_on_last_n_digit() {
        assert_eq!(controller_device("/dev/nvme0n1"), "/dev/nvme0");
        assert_eq!(controller_device("/dev/nvme12n3"), "/dev/nvme12");
    }

    #[test]
    fn namespace_device_pattern_excludes_bare_controller() {
        assert!(is_namespace_device("nvme0n1"));
        assert!(is_namespace_device("nvme12n3"));
        assert!(!is_namespace_device("nvme0"));
        assert!(!is_namespace_device("sda"));
    }

    #[test]
    fn parses_context_with_defaults() {
        let mut ctx = HashMap::new();
        ctx.insert("nqn".to_string(), "nqn.test:vol".to_string());
        ctx.insert("server".to_string(), "10.0.0.5".to_string());
        let params = NvmeParams::parse(&ctx).unwrap();
        assert_eq!(params.transport, "tcp");
        assert_eq!(params.port, 4420);
        assert_eq!(params.nr_io_queues, 4);
        assert!(params.queue_size.is_none());
    }

    #[test]
    fn parse_rejects_missing_mandatory_fields() {
        let ctx = HashMap::new();
        assert!(NvmeParams::parse(&ctx).is_err());
    }
}
