//! 目标文件夹内的重名处理

use super::clock::Clock;
use super::retry::{CallError, RetryExecutor};
use crate::error::ErrorKind;
use crate::storage::DestinationDirectory;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum NamingError {
    #[error("重命名后仍然重名: {name}")]
    Collision { name: String },

    #[error(transparent)]
    Listing(#[from] CallError),
}

impl NamingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NamingError::Collision { .. } => ErrorKind::NameCollision,
            NamingError::Listing(e) => e.kind(),
        }
    }
}

/// 单个目标文件夹的名称表
#[derive(Default)]
struct FolderNames {
    /// 服务端已有名称，每个文件夹只拉取一次
    server: OnceCell<HashSet<String>>,
    /// 本次运行写入的名称
    written: Mutex<HashSet<String>>,
}

/// 决定文件在目标文件夹中的最终名称
///
/// 已占用名称 = 服务端列表 ∪ 本次运行已写入的名称，区分大小写。
pub struct NamingPolicy {
    destination: Arc<dyn DestinationDirectory>,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    folders: Mutex<HashMap<String, Arc<FolderNames>>>,
}

impl NamingPolicy {
    pub fn new(
        destination: Arc<dyn DestinationDirectory>,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            destination,
            executor,
            clock,
            folders: Mutex::new(HashMap::new()),
        }
    }

    fn folder(&self, key: &str) -> Arc<FolderNames> {
        let mut folders = self.folders.lock().unwrap_or_else(|e| e.into_inner());
        folders.entry(key.to_string()).or_default().clone()
    }

    /// 为 candidate 选定名称并占用
    ///
    /// `folder_key` 标识目标文件夹；`folder_id` 为 None 表示文件夹尚未创建，
    /// 此时服务端视为空。
    pub async fn resolve_name(
        &self,
        folder_key: &str,
        folder_id: Option<&str>,
        candidate: &str,
    ) -> Result<String, NamingError> {
        let names = self.folder(folder_key);
        let candidate = self.destination.normalize_name(candidate);
        let candidate = candidate.as_str();

        let destination = self.destination.as_ref();
        let server = names
            .server
            .get_or_try_init(|| async move {
                match folder_id {
                    Some(id) => {
                        self.executor
                            .execute("list_names", || async move {
                                destination.list_names(id).await
                            })
                            .await
                    }
                    None => Ok(HashSet::new()),
                }
            })
            .await?;

        let mut written = names.written.lock().unwrap_or_else(|e| e.into_inner());

        if !server.contains(candidate) && !written.contains(candidate) {
            written.insert(candidate.to_string());
            return Ok(candidate.to_string());
        }

        let renamed = collision_name(candidate, self.clock.now());
        if server.contains(&renamed) || written.contains(&renamed) {
            return Err(NamingError::Collision { name: renamed });
        }
        debug!("目标已存在 '{}'，改名为 '{}'", candidate, renamed);
        written.insert(renamed.clone());
        Ok(renamed)
    }
}

/// 生成重名文件名：`{stem}_{YYYYMMDD_HHMMSS}{.ext}`
///
/// 开头的点不视为扩展名分隔符（如 `.env`）。
pub fn collision_name(name: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let (stem, ext) = name.split_at(pos);
            format!("{}_{}{}", stem, stamp, ext)
        }
        _ => format!("{}_{}", name, stamp),
    }
}
