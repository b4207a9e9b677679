//! 目录树镜像
//!
//! 用显式工作栈做深度优先遍历，子节点按页惰性读取。文件交给有界并发池传输，
//! 结果按遍历顺序返回。目标文件夹在第一个文件需要落地时才创建，
//! 每个目标路径只创建一次。

use super::clock::Clock;
use super::naming::{NamingError, NamingPolicy};
use super::resolver::ResolvedFolder;
use super::retry::{CallError, RetryExecutor};
use crate::error::ErrorKind;
use crate::storage::{DestinationDirectory, DirectoryNode, SourceDirectory};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 尝试对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptTarget {
    File,
    /// 列表失败导致整棵子树放弃，记为一次失败
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

/// 单个文件（或放弃的子树）的传输结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAttempt {
    pub target: AttemptTarget,
    pub source_id: String,
    pub source_name: String,
    /// 目标文件夹路径（相对目标根目录）
    pub destination_path: String,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// 处理重名后的最终文件名
    pub final_name: Option<String>,
    pub size: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl TransferAttempt {
    fn file(node: &DirectoryNode, destination_path: &str, at: DateTime<Utc>) -> Self {
        Self {
            target: AttemptTarget::File,
            source_id: node.id.clone(),
            source_name: node.name.clone(),
            destination_path: destination_path.to_string(),
            outcome: AttemptOutcome::Success,
            error_kind: None,
            error: None,
            final_name: None,
            size: node.size,
            timestamp: at,
        }
    }

    fn succeeded(mut self, final_name: String) -> Self {
        self.final_name = Some(final_name);
        self
    }

    fn failed(mut self, kind: ErrorKind, error: impl ToString) -> Self {
        self.outcome = AttemptOutcome::Failed;
        self.error_kind = Some(kind);
        self.error = Some(error.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// 单个文件的传输失败，不影响其他文件
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("创建目标文件夹失败: {0}")]
    Folder(CallError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("复制失败: {0}")]
    Copy(CallError),

    #[error("传输任务异常退出: {0}")]
    Task(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Folder(e) | TransferError::Copy(e) => e.kind(),
            TransferError::Naming(e) => e.kind(),
            TransferError::Task(_) => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
enum DestState {
    Ready(String),
    /// 演练模式下不会创建的文件夹
    Planned,
}

/// 目标文件夹节点，每个目标路径一个
#[derive(Debug)]
struct DestFolder {
    path: String,
    name: String,
    parent: Option<Arc<DestFolder>>,
    state: OnceCell<DestState>,
}

impl DestFolder {
    fn root(id: &str) -> Arc<Self> {
        Arc::new(Self {
            path: String::new(),
            name: String::new(),
            parent: None,
            state: OnceCell::from(DestState::Ready(id.to_string())),
        })
    }

    fn child(self: &Arc<Self>, name: &str) -> Arc<Self> {
        Arc::new(Self {
            path: format!("{}/{}", self.path, name),
            name: name.to_string(),
            parent: Some(self.clone()),
            state: OnceCell::new(),
        })
    }

    fn display_path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }
}

struct WorkItem {
    source_id: String,
    source_name: String,
    dest: Arc<DestFolder>,
}

/// 按遍历顺序保存的结果位
enum Slot {
    Spawned {
        node: DirectoryNode,
        path: String,
        handle: JoinHandle<TransferAttempt>,
    },
    Done(TransferAttempt),
}

/// 目录树镜像器
#[derive(Clone)]
pub struct TreeMirror {
    source: Arc<dyn SourceDirectory>,
    destination: Arc<dyn DestinationDirectory>,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    dry_run: bool,
}

impl TreeMirror {
    pub fn new(
        source: Arc<dyn SourceDirectory>,
        destination: Arc<dyn DestinationDirectory>,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            source,
            destination,
            executor,
            clock,
            max_concurrent: max_concurrent.max(1),
            dry_run,
        }
    }

    /// 把 folder 的内容镜像到 dest_root_id 下，nest 为 true 时放在同名子文件夹中
    pub async fn mirror(
        &self,
        record_id: &str,
        folder: &ResolvedFolder,
        dest_root_id: &str,
        nest: bool,
    ) -> Vec<TransferAttempt> {
        let naming = Arc::new(NamingPolicy::new(
            self.destination.clone(),
            self.executor.clone(),
            self.clock.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        let root = DestFolder::root(dest_root_id);
        let top = if nest { root.child(&folder.name) } else { root };

        let mut work = vec![WorkItem {
            source_id: folder.id.clone(),
            source_name: folder.name.clone(),
            dest: top,
        }];
        let mut slots = Vec::new();

        while let Some(item) = work.pop() {
            debug!(record_id, folder = %item.source_name, "遍历文件夹");
            let mut subfolders = Vec::new();

            let listing = self.children(&item.source_id);
            futures::pin_mut!(listing);

            while let Some(next) = listing.next().await {
                match next {
                    Ok(node) if node.is_folder() => {
                        let dest = item.dest.child(&node.name);
                        subfolders.push(WorkItem {
                            source_id: node.id,
                            source_name: node.name,
                            dest,
                        });
                    }
                    Ok(node) => {
                        let slot = self
                            .dispatch(record_id, node, item.dest.clone(), naming.clone(), &semaphore)
                            .await;
                        slots.push(slot);
                    }
                    Err(e) => {
                        warn!(
                            record_id,
                            folder = %item.source_name,
                            folder_id = %item.source_id,
                            kind = %e.kind(),
                            "列表失败，放弃该子树: {}", e
                        );
                        slots.push(Slot::Done(TransferAttempt {
                            target: AttemptTarget::Subtree,
                            source_id: item.source_id.clone(),
                            source_name: item.source_name.clone(),
                            destination_path: item.dest.display_path().to_string(),
                            outcome: AttemptOutcome::Failed,
                            error_kind: Some(e.kind()),
                            error: Some(e.to_string()),
                            final_name: None,
                            size: None,
                            timestamp: self.clock.now(),
                        }));
                        subfolders.clear();
                        break;
                    }
                }
            }

            // 倒序入栈，保证按列表顺序深度优先
            work.extend(subfolders.into_iter().rev());
        }

        let mut attempts = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Done(attempt) => attempts.push(attempt),
                Slot::Spawned { node, path, handle } => match handle.await {
                    Ok(attempt) => attempts.push(attempt),
                    Err(e) => {
                        let err = TransferError::Task(e.to_string());
                        warn!(record_id, file = %node.name, "{}", err);
                        attempts.push(
                            TransferAttempt::file(&node, &path, self.clock.now())
                                .failed(err.kind(), err),
                        );
                    }
                },
            }
        }
        attempts
    }

    /// 惰性分页读取子节点
    fn children<'a>(
        &'a self,
        folder_id: &'a str,
    ) -> impl Stream<Item = Result<DirectoryNode, CallError>> + 'a {
        let source = self.source.as_ref();
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(cursor) = cursor else {
                return Ok(None);
            };
            let cursor = cursor.as_deref();
            let page = self
                .executor
                .execute("list_children", || async move {
                    source.list_children(folder_id, cursor).await
                })
                .await?;

            let next = page.next.map(Some);
            let items = stream::iter(page.items.into_iter().map(Ok::<_, CallError>));
            Ok::<_, CallError>(Some((items, next)))
        })
        .try_flatten()
    }

    async fn dispatch(
        &self,
        record_id: &str,
        node: DirectoryNode,
        dest: Arc<DestFolder>,
        naming: Arc<NamingPolicy>,
        semaphore: &Arc<Semaphore>,
    ) -> Slot {
        let path = dest.display_path().to_string();
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = TransferError::Task(e.to_string());
                return Slot::Done(
                    TransferAttempt::file(&node, &path, self.clock.now()).failed(err.kind(), err),
                );
            }
        };

        let mirror = self.clone();
        let record_id = record_id.to_string();
        let task_node = node.clone();
        let handle = tokio::spawn(async move {
            let attempt = mirror
                .copy_file(&record_id, &task_node, &dest, &naming)
                .await;
            drop(permit);
            attempt
        });

        Slot::Spawned { node, path, handle }
    }

    async fn copy_file(
        &self,
        record_id: &str,
        node: &DirectoryNode,
        dest: &DestFolder,
        naming: &NamingPolicy,
    ) -> TransferAttempt {
        let path = dest.display_path();
        let attempt = TransferAttempt::file(node, path, self.clock.now());

        match self.try_copy(node, dest, naming).await {
            Ok(final_name) => {
                if self.dry_run {
                    info!(record_id, file = %node.name, folder = %path, "[演练] 将传输为 '{}'", final_name);
                } else {
                    info!(record_id, file = %node.name, folder = %path, "已传输为 '{}'", final_name);
                }
                attempt.succeeded(final_name)
            }
            Err(e) => {
                warn!(record_id, file = %node.name, folder = %path, kind = %e.kind(), "文件传输失败: {}", e);
                attempt.failed(e.kind(), e)
            }
        }
    }

    async fn try_copy(
        &self,
        node: &DirectoryNode,
        dest: &DestFolder,
        naming: &NamingPolicy,
    ) -> Result<String, TransferError> {
        let folder_id = self.ensure(dest).await.map_err(TransferError::Folder)?;
        let key = match &folder_id {
            Some(id) => id.clone(),
            None => format!("planned:{}", dest.path),
        };
        let final_name = naming
            .resolve_name(&key, folder_id.as_deref(), &node.name)
            .await?;

        let folder_id = match folder_id {
            Some(id) if !self.dry_run => id,
            _ => return Ok(final_name),
        };

        let source = self.source.as_ref();
        let destination = self.destination.as_ref();
        let (file_id, target, name, size) = (
            node.id.as_str(),
            folder_id.as_str(),
            final_name.as_str(),
            node.size,
        );
        let uploaded = self
            .executor
            .execute("transfer_file", || async move {
                let body = source.open_download(file_id).await?;
                destination.upload(target, name, body, size).await
            })
            .await
            .map_err(TransferError::Copy)?;

        Ok(uploaded.name)
    }

    /// 确保目标文件夹存在，返回其 ID；演练模式下未创建的文件夹返回 None
    async fn ensure(&self, dest: &DestFolder) -> Result<Option<String>, CallError> {
        let mut chain = Vec::new();
        let mut current = Some(dest);
        while let Some(folder) = current {
            chain.push(folder);
            current = folder.parent.as_deref();
        }

        let destination = self.destination.as_ref();
        let mut parent_id: Option<String> = None;
        for folder in chain.into_iter().rev() {
            let parent = parent_id.take();
            let state = folder
                .state
                .get_or_try_init(|| async move {
                    let parent = match parent {
                        Some(parent) if !self.dry_run => parent,
                        _ => return Ok(DestState::Planned),
                    };
                    let name = folder.name.as_str();
                    let parent = parent.as_str();
                    let id = self
                        .executor
                        .execute("ensure_folder", || async move {
                            destination.ensure_folder(parent, name).await
                        })
                        .await?;
                    debug!("目标文件夹就绪: {} ({})", folder.display_path(), id);
                    Ok::<_, CallError>(DestState::Ready(id))
                })
                .await?;

            parent_id = match state {
                DestState::Ready(id) => Some(id.clone()),
                DestState::Planned => None,
            };
        }
        Ok(parent_id)
    }
}
