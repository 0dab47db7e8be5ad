use crate::error::TransferError;
use crate::services::checksum;
use crate::services::system::SystemProbe;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub destination: PathBuf,
    pub bytes: u64,
    /// Destination already held an identical copy
    pub skipped: bool,
    /// Digest of both files, known only when they were compared before copying
    pub checksum: Option<String>,
}

/// Moves the recording's bytes into the temporary file on the share
pub type CopyFn = fn(&mut File, &mut File) -> std::io::Result<u64>;

pub fn plain_copy(input: &mut File, output: &mut File) -> std::io::Result<u64> {
    std::io::copy(input, output)
}

/// Copies finished recordings onto the share.
///
/// Data lands in a temporary file inside the destination directory and is
/// renamed into place only once fully written and synced, so a file with the
/// final name is always complete. An existing destination with the same size
/// and digest is left alone; anything else is overwritten.
pub struct TransferWorker<'a> {
    probe: &'a dyn SystemProbe,
    copy: CopyFn,
}

impl<'a> TransferWorker<'a> {
    pub fn new(probe: &'a dyn SystemProbe) -> Self {
        Self {
            probe,
            copy: plain_copy,
        }
    }

    pub fn with_copy(mut self, copy: CopyFn) -> Self {
        self.copy = copy;
        self
    }

    pub async fn transfer(
        &self,
        source: &Path,
        dest_root: &Path,
        subfolder: Option<&str>,
    ) -> Result<TransferOutcome, TransferError> {
        let size = match tokio::fs::metadata(source).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(TransferError::SourceMissing(source.to_path_buf())),
        };
        let file_name = source
            .file_name()
            .ok_or_else(|| TransferError::SourceMissing(source.to_path_buf()))?;

        if !dest_root.is_dir() {
            return Err(TransferError::ShareUnavailable {
                path: dest_root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let dest_dir = destination_dir(dest_root, subfolder)?;
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| TransferError::ShareUnavailable {
                path: dest_dir.clone(),
                reason: e.to_string(),
            })?;
        let destination = dest_dir.join(file_name);

        if let Some(digest) = already_transferred(source, &destination, size).await {
            tracing::info!("{:?} already present on share, skipping copy", destination);
            return Ok(TransferOutcome {
                destination,
                bytes: size,
                skipped: true,
                checksum: Some(digest),
            });
        }

        match self.probe.available_space(&dest_dir) {
            Some(available) if available < size => {
                return Err(TransferError::InsufficientSpace {
                    path: dest_dir,
                    available,
                    required: size,
                });
            }
            Some(_) => {}
            None => tracing::warn!("Could not determine free space at {:?}", dest_dir),
        }

        tracing::info!("Copying {:?} -> {:?} ({} bytes)", source, destination, size);
        let bytes = copy_atomically(source, &dest_dir, &destination, self.copy).await?;
        if bytes != size {
            return Err(TransferError::CopyError {
                source_path: source.to_path_buf(),
                error: std::io::Error::other(format!("copied {} of {} bytes", bytes, size)),
            });
        }

        Ok(TransferOutcome {
            destination,
            bytes,
            skipped: false,
            checksum: None,
        })
    }
}

/// The shared digest when `destination` already holds the same bytes as `source`.
/// Both files are hashed; nothing recorded earlier is trusted.
async fn already_transferred(source: &Path, destination: &Path, size: u64) -> Option<String> {
    match tokio::fs::metadata(destination).await {
        Ok(meta) if meta.is_file() && meta.len() == size => {}
        _ => return None,
    }

    let source_digest = checksum::digest(source).await.ok()?;
    let existing = checksum::digest(destination).await.ok()?;
    (existing == source_digest).then_some(source_digest)
}

/// `dest_root[/subfolder]`; the subfolder must stay inside the root
pub fn destination_dir(dest_root: &Path, subfolder: Option<&str>) -> Result<PathBuf, TransferError> {
    let Some(subfolder) = subfolder.filter(|s| !s.trim().is_empty()) else {
        return Ok(dest_root.to_path_buf());
    };

    let relative = Path::new(subfolder);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(TransferError::ConfigError(format!(
            "subfolder {:?} must be a relative path inside the share",
            subfolder
        )));
    }

    Ok(dest_root.join(relative))
}

async fn copy_atomically(
    source: &Path,
    dest_dir: &Path,
    destination: &Path,
    copy: CopyFn,
) -> Result<u64, TransferError> {
    let source = source.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    let destination = destination.to_path_buf();
    let source_path = source.clone();

    let copied = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
        let mut input = File::open(&source)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".pvr-transfer-")
            .suffix(".part")
            .tempfile_in(&dest_dir)?;

        let bytes = copy(&mut input, temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(&destination).map_err(|e| e.error)?;
        Ok(bytes)
    })
    .await
    .map_err(|e| TransferError::CopyError {
        source_path: source_path.clone(),
        error: std::io::Error::other(e.to_string()),
    })?;

    copied.map_err(|error| TransferError::CopyError { source_path, error })
}
