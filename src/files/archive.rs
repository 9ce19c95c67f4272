//! ZIP screening and bounded extraction
//!
//! Both passes run on the blocking pool. Screening only reads the central
//! directory; extraction streams entry data in fixed-size chunks and polls a
//! cancellation token that an independent timer trips when the time budget
//! runs out.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::config::{ArchiveLimits, UploadLimits};
use crate::error::{Result, SandboxError};

use super::paths;

/// Read size between cancellation checks
const CHUNK_SIZE: usize = 8192;

/// Limits applied to one archive
#[derive(Debug, Clone)]
pub struct ExtractionPolicy {
    pub max_entries: usize,
    /// Per-entry ceiling, the same as the per-file upload limit
    pub max_entry_size: u64,
    pub max_extracted_size: u64,
    pub max_compression_ratio: f64,
    pub timeout: Duration,
    pub max_nested_archives: usize,
}

impl ExtractionPolicy {
    pub fn new(archives: &ArchiveLimits, uploads: &UploadLimits) -> Self {
        Self {
            max_entries: archives.max_entries,
            max_entry_size: uploads.max_file_size,
            max_extracted_size: archives.max_extracted_size,
            max_compression_ratio: archives.max_compression_ratio,
            timeout: archives.extraction_timeout(),
            max_nested_archives: archives.max_nested_archives,
        }
    }
}

/// Declared totals of an archive that passed screening
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveScreen {
    pub entries: usize,
    pub declared_size: u64,
    pub compressed_size: u64,
}

/// A file written out of an archive
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFile {
    /// Path inside the archive, and under the workspace files directory
    pub relative_path: PathBuf,
    pub staged_path: PathBuf,
    pub size: u64,
    pub archive: String,
}

fn invalid(err: ZipError) -> SandboxError {
    match err {
        ZipError::Io(e) => SandboxError::InvalidArchive(e.to_string()),
        other => SandboxError::InvalidArchive(other.to_string()),
    }
}

/// Reject bombs and unsafe paths from the central directory alone
pub async fn screen(archive: PathBuf, policy: ExtractionPolicy) -> Result<ArchiveScreen> {
    tokio::task::spawn_blocking(move || screen_blocking(&archive, &policy))
        .await
        .map_err(|e| SandboxError::InvalidArchive(format!("screening task failed: {}", e)))?
}

fn screen_blocking(archive: &Path, policy: &ExtractionPolicy) -> Result<ArchiveScreen> {
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(invalid)?;

    if zip.len() > policy.max_entries {
        return Err(SandboxError::ZipBombDetected(format!(
            "{} entries exceed the limit of {}",
            zip.len(),
            policy.max_entries
        )));
    }

    let mut declared_size = 0u64;
    let mut compressed_size = 0u64;
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index).map_err(invalid)?;
        if entry.size() > policy.max_entry_size {
            return Err(SandboxError::ZipBombDetected(format!(
                "entry {} declares {} bytes, over the per-file limit of {}",
                entry.name(),
                entry.size(),
                policy.max_entry_size
            )));
        }
        paths::validate_entry_path(entry.name())?;

        declared_size = declared_size.saturating_add(entry.size());
        compressed_size = compressed_size.saturating_add(entry.compressed_size());
    }

    if declared_size > policy.max_extracted_size {
        return Err(SandboxError::ZipBombDetected(format!(
            "declared size {} exceeds the extraction limit of {}",
            declared_size, policy.max_extracted_size
        )));
    }

    if compressed_size > 0 {
        let ratio = declared_size as f64 / compressed_size as f64;
        if ratio > policy.max_compression_ratio {
            return Err(SandboxError::ZipBombDetected(format!(
                "compression ratio {:.1} exceeds {}",
                ratio, policy.max_compression_ratio
            )));
        }
    }

    Ok(ArchiveScreen {
        entries: zip.len(),
        declared_size,
        compressed_size,
    })
}

/// Extract `archive` into `dest` within the policy's time budget
pub async fn extract(
    archive: PathBuf,
    dest: PathBuf,
    source: String,
    policy: ExtractionPolicy,
) -> Result<Vec<ExtractedFile>> {
    let cancel = CancellationToken::new();
    let timer = tokio::spawn({
        let cancel = cancel.clone();
        let budget = policy.timeout;
        async move {
            tokio::time::sleep(budget).await;
            cancel.cancel();
        }
    });

    let result = tokio::task::spawn_blocking(move || {
        extract_blocking(&archive, &dest, &source, &policy, &cancel)
    })
    .await;
    timer.abort();

    result.map_err(|e| SandboxError::InvalidArchive(format!("extraction task failed: {}", e)))?
}

fn extract_blocking(
    archive: &Path,
    dest: &Path,
    source: &str,
    policy: &ExtractionPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<ExtractedFile>> {
    std::fs::create_dir_all(dest)?;
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(invalid)?;

    let mut files = Vec::new();
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    for index in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(SandboxError::ZipExtractionTimeout(policy.timeout));
        }

        let mut entry = zip.by_index(index).map_err(invalid)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let relative = paths::validate_entry_path(&name)?;
        let target = paths::resolve_within(dest, &relative)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let declared = entry.size();
        let mut out = File::create(&target)?;
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(SandboxError::ZipExtractionTimeout(policy.timeout));
            }

            let n = entry
                .read(&mut buf)
                .map_err(|e| SandboxError::InvalidArchive(format!("{}: {}", name, e)))?;
            if n == 0 {
                break;
            }

            written += n as u64;
            total += n as u64;
            if written > declared || written > policy.max_entry_size {
                return Err(SandboxError::ZipBombDetected(format!(
                    "entry {} expands past its declared size",
                    name
                )));
            }
            if total > policy.max_extracted_size {
                return Err(SandboxError::ZipBombDetected(format!(
                    "extracted data exceeds the limit of {}",
                    policy.max_extracted_size
                )));
            }

            out.write_all(&buf[..n])?;
        }

        debug!(entry = %name, size = written, "Extracted archive entry");
        files.push(ExtractedFile {
            relative_path: relative,
            staged_path: target,
            size: written,
            archive: source.to_string(),
        });
    }

    Ok(files)
}

/// Apply the extension allow-list and the nested-archive budget.
///
/// A file with a disallowed extension is deleted and fails the archive.
pub async fn validate_extracted(
    files: &[ExtractedFile],
    allowed: &[String],
    max_nested: usize,
) -> Result<()> {
    let mut nested = 0;
    for file in files {
        let name = file.relative_path.to_string_lossy();

        if !paths::has_allowed_extension(&name, allowed) {
            warn!(entry = %name, archive = %file.archive, "Extracted file has disallowed extension");
            if let Err(e) = tokio::fs::remove_file(&file.staged_path).await {
                warn!(path = %file.staged_path.display(), error = %e, "Failed to remove rejected file");
            }
            return Err(SandboxError::FileRejected {
                name: name.into_owned(),
                reason: format!("extension not allowed inside archive {}", file.archive),
            });
        }

        if paths::is_archive_name(&name) {
            nested += 1;
            if nested > max_nested {
                return Err(SandboxError::NestedArchiveLimitExceeded {
                    count: nested,
                    limit: max_nested,
                });
            }
        }
    }
    Ok(())
}
