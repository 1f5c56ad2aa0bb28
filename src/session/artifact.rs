//! 版本化记录存储抽象
//!
//! 写入协议：edit(stage=true) 进入 staging → put 上传文件 → commit 发布。
//! read / list 只看已提交的版本；记录离开 staging 状态后的 commit 返回 PersistenceConflict。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::RelayError;

/// 会话记录的元数据
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub title: Option<String>,
    pub agent_id: String,
    pub owner: String,
    #[serde(default)]
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// 一个版本：清单 + 文件
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub files: BTreeMap<String, Vec<u8>>,
}

/// 已提交记录的概要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: String,
    pub manifest: Manifest,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// 在 parent 集合下新建记录，新记录处于 staging 状态
    async fn create(&self, parent: &str, manifest: Manifest) -> Result<String, RelayError>;

    /// 修改清单；stage 为 true 时以当前已提交版本为底进入 staging
    async fn edit(&self, id: &str, manifest: Manifest, stage: bool) -> Result<(), RelayError>;

    /// 向 staging 版本写入文件
    async fn put(&self, id: &str, name: &str, data: Vec<u8>) -> Result<(), RelayError>;

    /// 发布 staging 版本
    async fn commit(&self, id: &str) -> Result<(), RelayError>;

    /// 读取已提交版本的清单
    async fn read(&self, id: &str) -> Result<Manifest, RelayError>;

    /// 读取已提交版本中的文件
    async fn read_file(&self, id: &str, name: &str) -> Result<Vec<u8>, RelayError>;

    async fn list(&self, parent: &str) -> Result<Vec<ArtifactSummary>, RelayError>;
}

pub(crate) fn not_found(id: &str) -> RelayError {
    RelayError::Store(format!("record {id} not found"))
}

pub(crate) fn not_staged(id: &str) -> RelayError {
    RelayError::PersistenceConflict(format!("record {id} is not in staging state"))
}
