//! 内存记录存储（测试与临时会话）

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::RelayError;
use crate::session::artifact::{
    not_found, not_staged, ArtifactStore, ArtifactSummary, Manifest, Version,
};

#[derive(Debug, Default)]
struct Record {
    parent: String,
    committed: Option<Version>,
    staged: Option<Version>,
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    records: RwLock<HashMap<String, Record>>,
    /// 注入的提交冲突次数（模拟并发写者抢先提交）
    conflicts: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后的 n 次 commit 都会发现记录已离开 staging 状态
    pub fn inject_commit_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// 成功提交次数
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn create(&self, parent: &str, manifest: Manifest) -> Result<String, RelayError> {
        let id = uuid::Uuid::new_v4().to_string();
        let record = Record {
            parent: parent.to_string(),
            committed: None,
            staged: Some(Version {
                manifest: Some(manifest),
                files: Default::default(),
            }),
        };
        self.records.write().await.insert(id.clone(), record);
        Ok(id)
    }

    async fn edit(&self, id: &str, manifest: Manifest, stage: bool) -> Result<(), RelayError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        if stage {
            let base = record
                .staged
                .take()
                .or_else(|| record.committed.clone())
                .unwrap_or_default();
            record.staged = Some(Version {
                manifest: Some(manifest),
                ..base
            });
        } else {
            let committed = record.committed.get_or_insert_with(Version::default);
            committed.manifest = Some(manifest);
        }
        Ok(())
    }

    async fn put(&self, id: &str, name: &str, data: Vec<u8>) -> Result<(), RelayError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let staged = record.staged.as_mut().ok_or_else(|| not_staged(id))?;
        staged.files.insert(name.to_string(), data);
        Ok(())
    }

    async fn commit(&self, id: &str) -> Result<(), RelayError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(id).ok_or_else(|| not_found(id))?;
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            record.staged = None;
        }
        let staged = record.staged.take().ok_or_else(|| not_staged(id))?;
        record.committed = Some(staged);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Manifest, RelayError> {
        let records = self.records.read().await;
        records
            .get(id)
            .and_then(|r| r.committed.as_ref())
            .and_then(|v| v.manifest.clone())
            .ok_or_else(|| not_found(id))
    }

    async fn read_file(&self, id: &str, name: &str) -> Result<Vec<u8>, RelayError> {
        let records = self.records.read().await;
        records
            .get(id)
            .and_then(|r| r.committed.as_ref())
            .and_then(|v| v.files.get(name).cloned())
            .ok_or_else(|| RelayError::Store(format!("file {name} not found in record {id}")))
    }

    async fn list(&self, parent: &str) -> Result<Vec<ArtifactSummary>, RelayError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|(_, r)| r.parent == parent)
            .filter_map(|(id, r)| {
                let manifest = r.committed.as_ref()?.manifest.clone()?;
                Some(ArtifactSummary {
                    id: id.clone(),
                    manifest,
                })
            })
            .collect())
    }
}
