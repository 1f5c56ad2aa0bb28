//! 目录型记录存储：每条记录一个目录，提交时先写临时文件再 rename
//!
//! 布局：
//! - `{root}/{id}/record.json`：已提交的清单（含所属集合）
//! - `{root}/{id}/files/{name}`：已提交的文件
//! - `{root}/{id}/.staging/`：staging 版本（record.json + files/），提交后删除

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::RelayError;
use crate::session::artifact::{not_found, not_staged, ArtifactStore, ArtifactSummary, Manifest};

const RECORD_FILE: &str = "record.json";
const FILES_DIR: &str = "files";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    parent: String,
    manifest: Manifest,
}

pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, id: &str) -> Result<PathBuf, RelayError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(RelayError::Store(format!("invalid record id '{id}'")));
        }
        Ok(self.root.join(id))
    }
}

fn check_file_name(name: &str) -> Result<(), RelayError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(RelayError::Store(format!("invalid file name '{name}'")));
    }
    Ok(())
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), RelayError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_record(path: &Path) -> Result<Option<RecordFile>, RelayError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_record(path: &Path, record: &RecordFile) -> Result<(), RelayError> {
    write_atomic(path, &serde_json::to_vec_pretty(record)?).await
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn create(&self, parent: &str, manifest: Manifest) -> Result<String, RelayError> {
        let id = uuid::Uuid::new_v4().to_string();
        let staging = self.record_dir(&id)?.join(STAGING_DIR);
        fs::create_dir_all(staging.join(FILES_DIR)).await?;
        let record = RecordFile {
            parent: parent.to_string(),
            manifest,
        };
        write_record(&staging.join(RECORD_FILE), &record).await?;
        tracing::debug!(id = %id, parent = %parent, "record created");
        Ok(id)
    }

    async fn edit(&self, id: &str, manifest: Manifest, stage: bool) -> Result<(), RelayError> {
        let dir = self.record_dir(id)?;
        let staging = dir.join(STAGING_DIR);
        let staged = read_record(&staging.join(RECORD_FILE)).await?;
        let committed = read_record(&dir.join(RECORD_FILE)).await?;
        let parent = staged
            .or(committed)
            .map(|r| r.parent)
            .ok_or_else(|| not_found(id))?;
        let record = RecordFile { parent, manifest };
        if stage {
            fs::create_dir_all(staging.join(FILES_DIR)).await?;
            write_record(&staging.join(RECORD_FILE), &record).await
        } else {
            write_record(&dir.join(RECORD_FILE), &record).await
        }
    }

    async fn put(&self, id: &str, name: &str, data: Vec<u8>) -> Result<(), RelayError> {
        check_file_name(name)?;
        let files = self.record_dir(id)?.join(STAGING_DIR).join(FILES_DIR);
        if fs::metadata(&files).await.is_err() {
            return Err(not_staged(id));
        }
        write_atomic(&files.join(name), &data).await
    }

    async fn commit(&self, id: &str) -> Result<(), RelayError> {
        let dir = self.record_dir(id)?;
        let staging = dir.join(STAGING_DIR);
        let Some(record) = read_record(&staging.join(RECORD_FILE)).await? else {
            return Err(not_staged(id));
        };
        let committed_files = dir.join(FILES_DIR);
        fs::create_dir_all(&committed_files).await?;
        let mut entries = fs::read_dir(staging.join(FILES_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            fs::rename(entry.path(), committed_files.join(entry.file_name())).await?;
        }
        write_record(&dir.join(RECORD_FILE), &record).await?;
        fs::remove_dir_all(&staging).await?;
        tracing::debug!(id = %id, "record committed");
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Manifest, RelayError> {
        let dir = self.record_dir(id)?;
        read_record(&dir.join(RECORD_FILE))
            .await?
            .map(|r| r.manifest)
            .ok_or_else(|| not_found(id))
    }

    async fn read_file(&self, id: &str, name: &str) -> Result<Vec<u8>, RelayError> {
        check_file_name(name)?;
        let path = self.record_dir(id)?.join(FILES_DIR).join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RelayError::Store(format!(
                "file {name} not found in record {id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, parent: &str) -> Result<Vec<ArtifactSummary>, RelayError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().to_string();
            match read_record(&entry.path().join(RECORD_FILE)).await {
                Ok(Some(record)) if record.parent == parent => out.push(ArtifactSummary {
                    id,
                    manifest: record.manifest,
                }),
                Ok(_) => {}
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn manifest(title: &str) -> Manifest {
        Manifest {
            title: Some(title.to_string()),
            agent_id: "agent".to_string(),
            owner: "alice".to_string(),
            message_count: 0,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_staged_write_is_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());

        let id = store.create("chats", manifest("first")).await.unwrap();
        assert!(store.read(&id).await.is_err());
        store.put(&id, "messages.json", b"[]".to_vec()).await.unwrap();
        store.commit(&id).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap().title.as_deref(), Some("first"));

        store.edit(&id, manifest("second"), true).await.unwrap();
        store.put(&id, "messages.json", b"[1]".to_vec()).await.unwrap();
        assert_eq!(store.read_file(&id, "messages.json").await.unwrap(), b"[]");
        store.commit(&id).await.unwrap();
        assert_eq!(store.read_file(&id, "messages.json").await.unwrap(), b"[1]");
        assert_eq!(store.read(&id).await.unwrap().title.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_commit_without_staging_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let id = store.create("chats", manifest("t")).await.unwrap();
        store.commit(&id).await.unwrap();
        assert!(matches!(
            store.commit(&id).await,
            Err(RelayError::PersistenceConflict(_))
        ));
        assert!(matches!(
            store.put(&id, "messages.json", vec![]).await,
            Err(RelayError::PersistenceConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_parent_and_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let a = store.create("chats", manifest("a")).await.unwrap();
        store.commit(&a).await.unwrap();
        let b = store.create("other", manifest("b")).await.unwrap();
        store.commit(&b).await.unwrap();

        let listed = store.list("chats").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a);
        assert!(store.put(&a, "../escape", vec![]).await.is_err());
        assert!(store.read("../etc").await.is_err());
    }
}
