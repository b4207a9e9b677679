//! 在源租户中按名称定位唯一的文件夹

use super::retry::{CallError, RetryExecutor};
use crate::storage::{FolderCandidate, SourceDirectory};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// 解析出的源文件夹，仅在处理单条记录期间存在
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFolder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub modified_time: i64,
}

impl From<FolderCandidate> for ResolvedFolder {
    fn from(c: FolderCandidate) -> Self {
        Self {
            id: c.id,
            name: c.name,
            parent_id: c.parent_id,
            modified_time: c.modified_time,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("未找到名为 '{name}' 的文件夹")]
    NotFound { name: String },

    #[error("名为 '{name}' 的文件夹无法唯一确定: {candidates:?}")]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    /// 搜索调用本身失败（已经过重试）
    #[error(transparent)]
    Call(#[from] CallError),
}

impl ResolutionError {
    /// NotFound 与 Ambiguous 跳过记录，调用失败按记录级错误处理
    pub fn is_skip(&self) -> bool {
        !matches!(self, ResolutionError::Call(_))
    }
}

pub struct DirectoryResolver {
    source: Arc<dyn SourceDirectory>,
    executor: Arc<RetryExecutor>,
}

impl DirectoryResolver {
    pub fn new(source: Arc<dyn SourceDirectory>, executor: Arc<RetryExecutor>) -> Self {
        Self { source, executor }
    }

    pub async fn resolve(
        &self,
        scope_root_id: &str,
        name: &str,
        preferred_parent: Option<&str>,
    ) -> Result<ResolvedFolder, ResolutionError> {
        let source = self.source.as_ref();
        let candidates = self
            .executor
            .execute("search_folder", || async move {
                source.search_folder(scope_root_id, name).await
            })
            .await?;
        debug!("搜索 '{}' 得到 {} 个候选", name, candidates.len());

        select(candidates, name, preferred_parent)
    }
}

/// 从搜索结果中选出唯一匹配
///
/// 1. 名称忽略大小写精确匹配
/// 2. 有父目录提示且提示下存在匹配时，只在其中选择
/// 3. 取最后修改时间最大者，最大值并列则无法确定
pub fn select(
    candidates: Vec<FolderCandidate>,
    name: &str,
    preferred_parent: Option<&str>,
) -> Result<ResolvedFolder, ResolutionError> {
    let wanted = name.to_lowercase();
    let mut matches: Vec<FolderCandidate> = candidates
        .into_iter()
        .filter(|c| c.name.to_lowercase() == wanted)
        .collect();

    if matches.is_empty() {
        return Err(ResolutionError::NotFound {
            name: name.to_string(),
        });
    }

    if let Some(parent) = preferred_parent {
        if matches.iter().any(|c| c.parent_id.as_deref() == Some(parent)) {
            matches.retain(|c| c.parent_id.as_deref() == Some(parent));
        }
    }

    let newest = matches
        .iter()
        .map(|c| c.modified_time)
        .max()
        .unwrap_or_default();
    let mut top: Vec<FolderCandidate> = matches
        .into_iter()
        .filter(|c| c.modified_time == newest)
        .collect();

    if top.len() > 1 {
        let mut candidates: Vec<String> = top.into_iter().map(|c| c.id).collect();
        candidates.sort();
        return Err(ResolutionError::Ambiguous {
            name: name.to_string(),
            candidates,
        });
    }

    match top.pop() {
        Some(chosen) => Ok(chosen.into()),
        None => Err(ResolutionError::NotFound {
            name: name.to_string(),
        }),
    }
}
