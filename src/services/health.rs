use crate::report::CheckResult;
use crate::services::system::SystemProbe;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SHARE_PROBE_FILE: &str = ".pvr-transfer.probe";

/// Equal to the threshold counts as enough
pub fn has_free_space(available: u64, threshold: u64) -> bool {
    available >= threshold
}

pub fn check_free_space(probe: &dyn SystemProbe, path: &Path, threshold: u64) -> CheckResult {
    match probe.available_space(path) {
        Some(available) if has_free_space(available, threshold) => CheckResult::pass(
            "free space",
            format!("{} available at {:?}", format_bytes(available), path),
        ),
        Some(available) => CheckResult::fail(
            "free space",
            format!(
                "only {} available at {:?} (threshold {})",
                format_bytes(available),
                path,
                format_bytes(threshold)
            ),
        ),
        None => CheckResult::fail(
            "free space",
            format!("unable to determine free space at {:?}", path),
        ),
    }
}

pub fn check_service_running(probe: &dyn SystemProbe, process_name: &str) -> CheckResult {
    if probe.process_running(process_name) {
        CheckResult::pass("service", format!("{} is running", process_name))
    } else {
        CheckResult::fail("service", format!("{} is not running", process_name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareStatus {
    pub mounted: bool,
    pub writable: bool,
}

/// Probe the share on a detached thread so a stale NFS mount can only cost `timeout`
pub async fn probe_share(
    path: &Path,
    require_mount: bool,
    timeout: Duration,
) -> Result<ShareStatus, String> {
    let path = path.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        let _ = tx.send(probe_share_blocking(&path, require_mount));
    });

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(status)) => status,
        Ok(Err(_)) => Err("share probe thread exited unexpectedly".to_string()),
        Err(_) => Err(format!("timed out after {}s (stale mount?)", timeout.as_secs())),
    }
}

fn probe_share_blocking(path: &Path, require_mount: bool) -> Result<ShareStatus, String> {
    if !path.is_dir() {
        return Err(format!("{:?} is not a directory", path));
    }

    let mounted = is_mount_point(path).map_err(|e| format!("cannot stat {:?}: {}", path, e))?;
    if require_mount && !mounted {
        return Ok(ShareStatus {
            mounted,
            writable: false,
        });
    }

    let probe: PathBuf = path.join(SHARE_PROBE_FILE);
    let writable = match std::fs::write(&probe, b"pvr-transfer") {
        Ok(()) => {
            if let Err(e) = std::fs::remove_file(&probe) {
                tracing::warn!("Failed to remove share probe {:?}: {}", probe, e);
            }
            true
        }
        Err(e) => {
            tracing::warn!("Unable to write to share {:?}: {}", path, e);
            false
        }
    };

    Ok(ShareStatus { mounted, writable })
}

pub async fn check_share_accessible(
    path: &Path,
    require_mount: bool,
    timeout: Duration,
) -> CheckResult {
    match probe_share(path, require_mount, timeout).await {
        Ok(status) => {
            let detail = format!(
                "{:?} mounted = {}, writable = {}",
                path, status.mounted, status.writable
            );
            tracing::info!("Share {}", detail);
            if status.writable && (status.mounted || !require_mount) {
                CheckResult::pass("share", detail)
            } else {
                CheckResult::fail("share", detail)
            }
        }
        Err(reason) => CheckResult::fail("share", format!("{:?}: {}", path, reason)),
    }
}

#[cfg(unix)]
fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let path = path.canonicalize()?;
    let meta = std::fs::metadata(&path)?;
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(true),
    };
    let parent_meta = std::fs::metadata(parent)?;

    Ok(meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino())
}

#[cfg(not(unix))]
fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    std::fs::metadata(path).map(|_| true)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
