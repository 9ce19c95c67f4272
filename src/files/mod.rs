//! File session management
//!
//! A file session stages user uploads on the host before an execution:
//! - Regular files are sanitised, checked against the allow-list and written flat
//! - ZIP archives are screened, extracted under a time budget and validated
//! - The staged tree is copied into a container workspace on demand
//!
//! Sessions live under one root directory and are removed explicitly or by
//! the age-based sweeper.

pub mod archive;
pub mod paths;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ArchiveLimits, UploadLimits};
use crate::error::{Result, SandboxError};
use crate::metrics;
use crate::models::{FileEntryInfo, FileEntryKind, SessionInfo};

use archive::{ExtractedFile, ExtractionPolicy};

/// Subdirectory of a container workspace that receives staged files
pub const WORKSPACE_FILES_DIR: &str = "files";

/// One staged upload
#[derive(Debug, Clone)]
enum FileEntry {
    Regular {
        original_name: String,
        path: PathBuf,
        size: u64,
    },
    ZipArchive {
        original_name: String,
        files: Vec<ExtractedFile>,
        size: u64,
    },
}

impl FileEntry {
    fn info(&self, name: &str) -> FileEntryInfo {
        match self {
            FileEntry::Regular {
                original_name,
                size,
                ..
            } => FileEntryInfo {
                name: name.to_string(),
                original_name: original_name.clone(),
                kind: FileEntryKind::Regular,
                size_bytes: *size,
                extracted_files: vec![],
            },
            FileEntry::ZipArchive {
                original_name,
                files,
                size,
            } => FileEntryInfo {
                name: name.to_string(),
                original_name: original_name.clone(),
                kind: FileEntryKind::ZipArchive,
                size_bytes: *size,
                extracted_files: files
                    .iter()
                    .map(|f| f.relative_path.to_string_lossy().into_owned())
                    .collect(),
            },
        }
    }
}

struct FileSession {
    dir: PathBuf,
    created_at: DateTime<Utc>,
    created: Instant,
    entries: BTreeMap<String, FileEntry>,
    /// Paths under the workspace files directory already taken by an entry
    claimed: HashSet<PathBuf>,
    total_size: u64,
}

impl FileSession {
    fn info(&self, id: Uuid) -> SessionInfo {
        SessionInfo {
            session_id: id,
            created_at: self.created_at,
            total_size_bytes: self.total_size,
            entries: self
                .entries
                .iter()
                .map(|(name, entry)| entry.info(name))
                .collect(),
        }
    }

    fn ensure_unused(&self, name: &str) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(SandboxError::FileRejected {
                name: name.to_string(),
                reason: "a file with this name is already staged".to_string(),
            });
        }
        Ok(())
    }

    /// Fail if `path` would land on, inside, or above a claimed path
    fn ensure_unclaimed(&self, path: &Path, source: &str) -> Result<()> {
        let taken = path.ancestors().any(|p| self.claimed.contains(p))
            || self.claimed.iter().any(|c| c.starts_with(path));
        if taken {
            return Err(SandboxError::FileRejected {
                name: source.to_string(),
                reason: format!("{} collides with an already staged file", path.display()),
            });
        }
        Ok(())
    }
}

async fn discard_extraction(dest: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dest).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dest.display(), error = %e, "Failed to remove extracted files");
        }
    }
}

/// Stages uploaded files per session
pub struct FileSessionManager {
    sessions_dir: PathBuf,
    uploads: UploadLimits,
    archives: ArchiveLimits,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<FileSession>>>>,
}

impl FileSessionManager {
    /// Create the manager, creating the sessions root if needed
    pub fn new(config: &AppConfig) -> Result<Self> {
        let sessions_dir = config.sessions_dir();
        std::fs::create_dir_all(&sessions_dir)?;

        info!(sessions_dir = %sessions_dir.display(), archives = config.archives.enabled, "File session manager ready");

        Ok(Self {
            sessions_dir,
            uploads: config.uploads.clone(),
            archives: config.archives.clone(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Allocate a new session with its own directory
    pub async fn create_session(&self) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let dir = self.sessions_dir.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let session = FileSession {
            dir,
            created_at: Utc::now(),
            created: Instant::now(),
            entries: BTreeMap::new(),
            claimed: HashSet::new(),
            total_size: 0,
        };
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));

        debug!(session_id = %id, "Created file session");
        Ok(id)
    }

    async fn session(&self, id: Uuid) -> Result<Arc<Mutex<FileSession>>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SandboxError::SessionNotFound(id))
    }

    /// Stage one upload in a session.
    ///
    /// `.zip` names take the archive path when archives are enabled; every
    /// other name must carry an allowed extension. Any rejection leaves the
    /// session as it was.
    pub async fn add_file(&self, id: Uuid, name: &str, content: &[u8]) -> Result<()> {
        let result = self.stage(id, name, content).await;
        match &result {
            Ok(()) => debug!(session_id = %id, file = %name, size = content.len(), "Staged file"),
            Err(SandboxError::SessionNotFound(_)) => {}
            Err(e) => {
                warn!(session_id = %id, file = %name, error = %e, "Rejected upload");
                metrics::record_upload_rejected(e.kind());
            }
        }
        result
    }

    async fn stage(&self, id: Uuid, name: &str, content: &[u8]) -> Result<()> {
        let session = self.session(id).await?;
        let mut session = session.lock().await;

        let size = content.len() as u64;
        if size > self.uploads.max_file_size {
            return Err(SandboxError::FileTooLarge {
                name: name.to_string(),
                size,
                limit: self.uploads.max_file_size,
            });
        }
        let total = session.total_size + size;
        if total > self.uploads.max_total_size {
            return Err(SandboxError::TotalSizeExceeded {
                name: name.to_string(),
                total,
                limit: self.uploads.max_total_size,
            });
        }

        if self.archives.enabled && name.to_ascii_lowercase().ends_with(".zip") {
            return self.stage_archive(&mut session, name, content).await;
        }

        if !paths::has_allowed_extension(name, &self.uploads.allowed_extensions) {
            return Err(SandboxError::FileRejected {
                name: name.to_string(),
                reason: "file extension is not allowed".to_string(),
            });
        }
        let safe = paths::secure_filename(name);
        if safe.is_empty() {
            return Err(SandboxError::FileRejected {
                name: name.to_string(),
                reason: "filename is empty after sanitisation".to_string(),
            });
        }
        session.ensure_unused(&safe)?;
        session.ensure_unclaimed(Path::new(&safe), name)?;

        let path = session.dir.join(&safe);
        tokio::fs::write(&path, content).await?;

        session.total_size += size;
        session.claimed.insert(PathBuf::from(&safe));
        session.entries.insert(
            safe,
            FileEntry::Regular {
                original_name: name.to_string(),
                path,
                size,
            },
        );
        Ok(())
    }

    async fn stage_archive(&self, session: &mut FileSession, name: &str, content: &[u8]) -> Result<()> {
        let key = format!("{}_extracted", name);
        session.ensure_unused(&key)?;

        let token = Uuid::new_v4();
        let scratch = session.dir.join(format!("upload_{}.zip", token));
        let dest = session.dir.join("extracted").join(token.to_string());
        tokio::fs::write(&scratch, content).await?;

        let outcome = self.unpack(&scratch, &dest, name).await;

        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            warn!(path = %scratch.display(), error = %e, "Failed to remove scratch archive");
        }

        let files = match outcome.and_then(|files| self.admit(session, name, files)) {
            Ok(files) => files,
            Err(e) => {
                discard_extraction(&dest).await;
                return Err(e);
            }
        };

        let extracted: u64 = files.iter().map(|f| f.size).sum();
        info!(archive = %name, files = files.len(), bytes = extracted, "Extracted archive");
        session.total_size += extracted;
        session
            .claimed
            .extend(files.iter().map(|f| f.relative_path.clone()));
        session.entries.insert(
            key,
            FileEntry::ZipArchive {
                original_name: name.to_string(),
                files,
                size: extracted,
            },
        );
        Ok(())
    }

    /// Check extracted files against the session total and against paths
    /// already claimed by other entries or by the same archive
    fn admit(
        &self,
        session: &FileSession,
        name: &str,
        files: Vec<ExtractedFile>,
    ) -> Result<Vec<ExtractedFile>> {
        let extracted: u64 = files.iter().map(|f| f.size).sum();
        let total = session.total_size + extracted;
        if total > self.uploads.max_total_size {
            return Err(SandboxError::TotalSizeExceeded {
                name: name.to_string(),
                total,
                limit: self.uploads.max_total_size,
            });
        }

        let mut seen = HashSet::new();
        for file in &files {
            session.ensure_unclaimed(&file.relative_path, name)?;
            if !seen.insert(file.relative_path.as_path()) {
                return Err(SandboxError::FileRejected {
                    name: name.to_string(),
                    reason: format!("{} appears more than once", file.relative_path.display()),
                });
            }
        }
        Ok(files)
    }

    async fn unpack(&self, scratch: &Path, dest: &Path, name: &str) -> Result<Vec<ExtractedFile>> {
        let policy = ExtractionPolicy::new(&self.archives, &self.uploads);

        let screen = archive::screen(scratch.to_path_buf(), policy.clone()).await?;
        debug!(
            archive = %name,
            entries = screen.entries,
            declared = screen.declared_size,
            compressed = screen.compressed_size,
            "Archive passed screening"
        );

        let files = archive::extract(
            scratch.to_path_buf(),
            dest.to_path_buf(),
            name.to_string(),
            policy.clone(),
        )
        .await?;
        archive::validate_extracted(&files, &self.uploads.allowed_extensions, policy.max_nested_archives)
            .await?;
        Ok(files)
    }

    /// Summary of a session, or `None` if it does not exist
    pub async fn get_session_info(&self, id: Uuid) -> Option<SessionInfo> {
        let session = self.session(id).await.ok()?;
        let session = session.lock().await;
        Some(session.info(id))
    }

    /// Copy every staged file into `<workspace>/files`, keeping archive
    /// layouts. Returns the number of files copied.
    pub async fn copy_to_workspace(&self, id: Uuid, workspace: &Path) -> Result<usize> {
        let session = self.session(id).await?;
        let session = session.lock().await;

        let target = workspace.join(WORKSPACE_FILES_DIR);
        tokio::fs::create_dir_all(&target).await?;

        let mut copied = 0;
        for (name, entry) in &session.entries {
            match entry {
                FileEntry::Regular { path, .. } => {
                    tokio::fs::copy(path, target.join(name)).await?;
                    copied += 1;
                }
                FileEntry::ZipArchive { files, .. } => {
                    for file in files {
                        let destination = target.join(&file.relative_path);
                        if let Some(parent) = destination.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        tokio::fs::copy(&file.staged_path, destination).await?;
                        copied += 1;
                    }
                }
            }
        }

        debug!(session_id = %id, files = copied, workspace = %workspace.display(), "Copied session files");
        Ok(copied)
    }

    /// Remove a session and its directory. Unknown ids are ignored.
    pub async fn cleanup_session(&self, id: Uuid) {
        let Some(session) = self.sessions.write().await.remove(&id) else {
            return;
        };
        let session = session.lock().await;

        match tokio::fs::remove_dir_all(&session.dir).await {
            Ok(()) => debug!(session_id = %id, "Cleaned up file session"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id = %id, error = %e, "Failed to remove session directory"),
        }
    }

    /// Remove every session at least `max_age` old. Returns how many were removed.
    pub async fn cleanup_old_sessions(&self, max_age: Duration) -> usize {
        let expired: Vec<Uuid> = {
            let sessions = self.sessions.read().await;
            let mut expired = Vec::new();
            for (id, session) in sessions.iter() {
                // A session busy with an upload is not idle
                if let Ok(session) = session.try_lock() {
                    if session.created.elapsed() >= max_age {
                        expired.push(*id);
                    }
                }
            }
            expired
        };

        for id in &expired {
            self.cleanup_session(*id).await;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired file sessions");
        }
        expired.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
