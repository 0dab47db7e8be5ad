use crate::error::TransferError;
use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// 2048 SHA-256 blocks (128 KiB) per read
const READ_BLOCK: usize = 2048 * 64;

/// `<64 hex chars> *<file name>`, as written by `sha256sum -b`
static SIDECAR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{64}) \*(.+)$").expect("valid sidecar regex"));

/// Hex SHA-256 of a file, streamed in fixed blocks
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BLOCK];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {:?}", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Async wrapper so hashing multi-gigabyte recordings stays off the runtime threads
pub async fn digest(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || file_digest(&path))
        .await
        .context("Checksum task panicked")?
}

/// Hash both files and compare; returns the shared digest
pub async fn verify(source: &Path, dest: &Path) -> Result<String> {
    let expected = digest(source).await?;
    let actual = digest(dest).await?;

    if expected != actual {
        return Err(TransferError::ChecksumMismatch {
            dest: dest.to_path_buf(),
            expected,
            actual,
        }
        .into());
    }

    tracing::debug!("Checksum verified for {:?}: {}", dest, actual);
    Ok(actual)
}

/// Path of the `.sha2` file that accompanies a recording
pub fn sidecar_path(recording: &Path) -> PathBuf {
    recording.with_extension("sha2")
}

/// Read the digest recorded in a sidecar file, if it is present and well formed
pub fn read_sidecar(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let line = contents.lines().next()?;
    SIDECAR_LINE
        .captures(line.trim_end())
        .map(|caps| caps[1].to_string())
}

/// Record `digest` (already computed from `recording`) in its sidecar file.
///
/// A sidecar holding the same digest is left untouched; a missing, malformed
/// or stale one is rewritten.
pub async fn write_sidecar(recording: &Path, digest: &str) -> Result<PathBuf> {
    let sidecar = sidecar_path(recording);

    match read_sidecar(&sidecar) {
        Some(existing) if existing == digest => {
            tracing::debug!("Checksum file {:?} is current", sidecar);
            return Ok(sidecar);
        }
        Some(existing) => tracing::warn!(
            "Checksum file {:?} is stale ({}), replacing it with {}",
            sidecar,
            existing,
            digest
        ),
        None => {}
    }

    let name = recording
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    tokio::fs::write(&sidecar, format!("{} *{}\n", digest, name))
        .await
        .with_context(|| format!("Failed to write checksum file {:?}", sidecar))?;

    tracing::info!("Generated SHA256 checksum for {}: {}", name, digest);
    Ok(sidecar)
}
