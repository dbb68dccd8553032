//! Per-request session directories and the report artifacts stored in them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::domain::types::{ArtifactKind, ExpiryPolicy};
use crate::domain::PipelineError;

const UPLOADS_DIR: &str = "uploads";

/// SHA-256 of the bearer token. Raw tokens are never kept.
pub(crate) fn owner_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredArtifact {
    path: PathBuf,
    size: u64,
    sha256: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ArtifactDownload {
    pub(crate) bytes: Vec<u8>,
    pub(crate) sha256: String,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) session_id: String,
    pub(crate) workspace_path: PathBuf,
    pub(crate) created_at: OffsetDateTime,
    pub(crate) expiry_policy: ExpiryPolicy,
    owner: Option<String>,
    expires_at: Instant,
    artifacts: HashMap<ArtifactKind, StoredArtifact>,
    downloaded: HashSet<ArtifactKind>,
    dir: TempDir,
}

impl Session {
    fn visible_to(&self, owner: Option<&str>) -> bool {
        match self.owner.as_deref() {
            None => true,
            Some(expected) => owner == Some(expected),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub(crate) struct WorkspaceManager {
    root: PathBuf,
    retention: Duration,
    expiry_policy: ExpiryPolicy,
    sessions: Mutex<HashMap<String, Session>>,
}

impl WorkspaceManager {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let workspace = settings.workspace();
        Self::new(workspace.root.clone(), workspace.retention(), workspace.expiry_policy)
    }

    /// Creates the root and purges anything left behind by a previous process.
    pub(crate) fn new(root: PathBuf, retention: Duration, expiry_policy: ExpiryPolicy) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        let purged = purge_orphans(&root)?;
        if purged > 0 {
            tracing::warn!(root = %root.display(), purged, "Purged orphaned session directories");
        }

        Ok(Self { root, retention, expiry_policy, sessions: Mutex::new(HashMap::new()) })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn is_writable(&self) -> bool {
        tempfile::tempfile_in(&self.root).is_ok()
    }

    /// Allocates a session directory. Dropping the guard without committing removes it.
    pub(crate) fn open_session(&self, owner: Option<String>) -> Result<SessionGuard<'_>, PipelineError> {
        let session_id = Uuid::new_v4().simple().to_string();
        let dir = tempfile::Builder::new()
            .prefix(&session_id)
            .rand_bytes(0)
            .tempdir_in(&self.root)
            .with_context(|| format!("Failed to create session directory for {session_id}"))
            .map_err(PipelineError::Workspace)?;

        tracing::debug!(session_id = %session_id, path = %dir.path().display(), "Session opened");

        Ok(SessionGuard {
            manager: self,
            pending: Some(PendingSession {
                session_id,
                created_at: OffsetDateTime::now_utc(),
                owner,
                artifacts: HashMap::new(),
                dir,
            }),
        })
    }

    pub(crate) async fn read_artifact(
        &self,
        session_id: &str,
        owner: Option<&str>,
        kind: ArtifactKind,
    ) -> Result<ArtifactDownload, PipelineError> {
        let artifact = {
            let mut sessions = self.lock();
            let now = Instant::now();
            if sessions.get(session_id).is_some_and(|session| session.is_expired(now)) {
                let expired = sessions.remove(session_id);
                drop(sessions);
                if let Some(expired) = expired {
                    self.finish(expired, "expired");
                }
                return Err(PipelineError::SessionNotFound);
            }

            let session = sessions
                .get(session_id)
                .filter(|session| session.visible_to(owner))
                .ok_or(PipelineError::SessionNotFound)?;
            session
                .artifacts
                .get(&kind)
                .cloned()
                .ok_or_else(|| PipelineError::artifact_not_ready(kind))?
        };

        // A concurrent release can remove the directory between the lookup and the read.
        let bytes = match tokio::fs::read(&artifact.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(session_id = %session_id, kind = kind.as_str(), "Artifact vanished before it was read");
                return Err(PipelineError::SessionNotFound);
            }
            Err(err) => {
                return Err(PipelineError::Workspace(
                    anyhow::Error::new(err).context(format!("Failed to read {}", artifact.path.display())),
                ));
            }
        };
        tracing::debug!(session_id = %session_id, kind = kind.as_str(), size = artifact.size, "Artifact read");

        if self.expiry_policy == ExpiryPolicy::AfterDownload {
            self.mark_downloaded(session_id, kind);
        }

        Ok(ArtifactDownload { bytes, sha256: artifact.sha256 })
    }

    pub(crate) fn release(&self, session_id: &str, owner: Option<&str>) -> Result<(), PipelineError> {
        let session = {
            let mut sessions = self.lock();
            let visible = sessions.get(session_id).is_some_and(|session| session.visible_to(owner));
            if !visible {
                return Err(PipelineError::SessionNotFound);
            }
            sessions.remove(session_id).ok_or(PipelineError::SessionNotFound)?
        };

        self.finish(session, "explicit");
        Ok(())
    }

    /// Releases every session whose retention window has elapsed.
    pub(crate) fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Session> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.is_expired(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let count = expired.len();
        for session in expired {
            self.finish(session, "expired");
        }
        count
    }

    pub(crate) fn release_all(&self) -> usize {
        let drained: Vec<Session> = self.lock().drain().map(|(_, session)| session).collect();
        let count = drained.len();
        for session in drained {
            self.finish(session, "shutdown");
        }
        count
    }

    pub(crate) fn active_sessions(&self) -> usize {
        self.lock().len()
    }

    fn mark_downloaded(&self, session_id: &str, kind: ArtifactKind) {
        let completed = {
            let mut sessions = self.lock();
            let all_downloaded = match sessions.get_mut(session_id) {
                Some(session) => {
                    session.downloaded.insert(kind);
                    ArtifactKind::ALL.iter().all(|kind| session.downloaded.contains(kind))
                }
                None => false,
            };
            if all_downloaded {
                sessions.remove(session_id)
            } else {
                None
            }
        };

        if let Some(session) = completed {
            self.finish(session, "downloaded");
        }
    }

    fn commit(&self, pending: PendingSession) -> Session {
        let session = Session {
            session_id: pending.session_id.clone(),
            workspace_path: pending.dir.path().to_path_buf(),
            created_at: pending.created_at,
            expiry_policy: self.expiry_policy,
            owner: pending.owner,
            expires_at: Instant::now() + self.retention,
            artifacts: pending.artifacts,
            downloaded: HashSet::new(),
            dir: pending.dir,
        };
        tracing::info!(
            session_id = %session.session_id,
            artifacts = session.artifacts.len(),
            bytes = session.artifacts.values().map(|artifact| artifact.size).sum::<u64>(),
            retention_seconds = self.retention.as_secs(),
            "Session committed"
        );
        session
    }

    fn finish(&self, session: Session, reason: &'static str) {
        let Session { session_id, workspace_path, created_at, expiry_policy, dir, .. } = session;
        if let Err(err) = dir.close() {
            tracing::warn!(
                session_id = %session_id,
                path = %workspace_path.display(),
                error = %err,
                "Failed to remove session directory"
            );
        }
        metrics::counter!("grading_sessions_released_total", "reason" => reason).increment(1);
        tracing::info!(
            session_id = %session_id,
            reason,
            policy = ?expiry_policy,
            age_seconds = (OffsetDateTime::now_utc() - created_at).whole_seconds(),
            "Session released"
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingSession {
    session_id: String,
    created_at: OffsetDateTime,
    owner: Option<String>,
    artifacts: HashMap<ArtifactKind, StoredArtifact>,
    dir: TempDir,
}

/// A session being filled by one request.
pub(crate) struct SessionGuard<'a> {
    manager: &'a WorkspaceManager,
    pending: Option<PendingSession>,
}

impl SessionGuard<'_> {
    pub(crate) fn session_id(&self) -> &str {
        self.pending.as_ref().map(|pending| pending.session_id.as_str()).unwrap_or_default()
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.pending.as_ref().map(|pending| pending.dir.path())
    }

    pub(crate) async fn write_upload(&mut self, filename: &str, bytes: &[u8]) -> Result<PathBuf, PipelineError> {
        let dir = self.require_path()?.join(UPLOADS_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create uploads directory")
            .map_err(PipelineError::Workspace)?;

        let path = dir.join(sanitized_filename(filename));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to store upload {}", path.display()))
            .map_err(PipelineError::Workspace)?;
        Ok(path)
    }

    pub(crate) async fn discard_uploads(&mut self) -> Result<(), PipelineError> {
        let dir = self.require_path()?.join(UPLOADS_DIR);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PipelineError::Workspace(
                anyhow::Error::new(err).context("Failed to discard uploads"),
            )),
        }
    }

    pub(crate) async fn write_artifact(
        &mut self,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<(), PipelineError> {
        let path = self.require_path()?.join(kind.file_name());
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
            .map_err(PipelineError::Workspace)?;

        let artifact =
            StoredArtifact { path, size: bytes.len() as u64, sha256: hex::encode(Sha256::digest(bytes)) };
        if let Some(pending) = self.pending.as_mut() {
            pending.artifacts.insert(kind, artifact);
        }
        Ok(())
    }

    /// Hands the session to the manager; it now lives until expiry or release.
    pub(crate) fn commit(mut self) -> String {
        let Some(pending) = self.pending.take() else {
            return String::new();
        };
        let session = self.manager.commit(pending);
        let session_id = session.session_id.clone();
        self.manager.lock().insert(session_id.clone(), session);
        session_id
    }

    fn require_path(&self) -> Result<PathBuf, PipelineError> {
        self.path()
            .map(Path::to_path_buf)
            .ok_or_else(|| PipelineError::Workspace(anyhow::anyhow!("session already committed")))
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            let session_id = pending.session_id.clone();
            if let Err(err) = pending.dir.close() {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to remove aborted session");
            }
            metrics::counter!("grading_sessions_released_total", "reason" => "aborted").increment(1);
            tracing::info!(session_id = %session_id, "Uncommitted session released");
        }
    }
}

/// Removes session directories left by a previous process. Anything not named like a
/// session is left alone.
fn purge_orphans(root: &Path) -> Result<usize> {
    let mut purged = 0;
    for entry in std::fs::read_dir(root).with_context(|| format!("Failed to list {}", root.display()))? {
        let entry = entry?;
        let path = entry.path();
        let is_session_dir = entry.file_type()?.is_dir()
            && entry.file_name().to_str().is_some_and(is_session_id);
        if !is_session_dir {
            tracing::debug!(path = %path.display(), "Leaving non-session entry in workspace root");
            continue;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => purged += 1,
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "Failed to purge orphan"),
        }
    }
    Ok(purged)
}

/// Session ids are simple UUIDs: 32 lowercase hex digits.
pub(crate) fn is_session_id(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
}

pub(crate) fn sanitized_filename(filename: &str) -> String {
    let sanitized: String = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|ch| ch == '.') {
        "upload".to_string()
    } else {
        sanitized
    }
}
