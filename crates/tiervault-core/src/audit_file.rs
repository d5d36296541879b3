//! File-based audit backend.
//!
//! Appends one JSON object per line, one line per [`AccessAuditEntry`]. The
//! file is opened append-only and is never rewritten.
//!
//! Writes are serialized through a `tokio::sync::Mutex` around the handle.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::{AccessAuditEntry, AuditBackend};
use crate::error::AuditError;

const BACKEND_NAME: &str = "file";

/// Audit backend that writes JSON lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    writer: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditBackend {
    /// The file is created (or opened for append) lazily on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn writer(&self) -> Result<MutexGuard<'_, Option<tokio::fs::File>>, AuditError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| failure(format!(
                    "failed to open audit file '{}': {e}",
                    self.path.display()
                )))?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

fn failure(reason: String) -> AuditError {
    AuditError::BackendFailure {
        name: BACKEND_NAME.to_owned(),
        reason,
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn log(&self, entry: &AccessAuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer().await?;
        let file = guard
            .as_mut()
            .ok_or_else(|| failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| failure(format!("flush failed: {e}")))?;

        Ok(())
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::audit::AuditOperation;
    use crate::policy::AccessContext;

    fn entry(secret: &str, granted: bool) -> AccessAuditEntry {
        let ctx = AccessContext::new(
            "bob",
            "192.168.0.10",
            DateTime::parse_from_rfc3339("2026-03-04T12:00:00+00:00").unwrap(),
        );
        AccessAuditEntry::new(secret, AuditOperation::Read, &ctx, granted, "reason")
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let backend = FileAuditBackend::new(&path);

        backend.log(&entry("a", true)).await.unwrap();
        backend.log(&entry("b", false)).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AccessAuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.secret_id, "b");
        assert!(!second.granted);
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        FileAuditBackend::new(&path).log(&entry("a", true)).await.unwrap();
        FileAuditBackend::new(&path).log(&entry("b", true)).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn unwritable_path_is_backend_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("audit.log");
        let backend = FileAuditBackend::new(path);
        let result = backend.log(&entry("a", true)).await;
        assert!(matches!(result, Err(AuditError::BackendFailure { .. })));
    }
}
