//! 内存目录，仅用于测试：记录调用、按需注入故障

use super::{
    ByteStream, ChildPage, DestinationDirectory, DirectoryNode, FolderCandidate, NodeKind,
    SourceDirectory, UploadedFile,
};
use crate::auth::Tenant;
use crate::error::ApiError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// 可注入故障的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Search,
    List,
    Download,
    Ensure,
    ListNames,
    Upload,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Op,
    /// 匹配节点 ID 或名称
    target: String,
    status: u16,
    /// None 表示一直失败
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct MemNode {
    name: String,
    kind: NodeKind,
    parent: Option<String>,
    content: Bytes,
    modified_time: i64,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, MemNode>,
    children: HashMap<String, Vec<String>>,
    next_id: usize,
    calls: Vec<String>,
    faults: Vec<Fault>,
}

pub struct MemoryDirectory {
    tenant: Tenant,
    page_size: usize,
    state: Mutex<State>,
}

pub const ROOT: &str = "root";

impl MemoryDirectory {
    pub fn new(tenant: Tenant) -> Self {
        let mut state = State::default();
        state.nodes.insert(
            ROOT.to_string(),
            MemNode {
                name: String::new(),
                kind: NodeKind::Folder,
                parent: None,
                content: Bytes::new(),
                modified_time: 0,
            },
        );
        Self {
            tenant,
            page_size: 100,
            state: Mutex::new(state),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn insert(&self, parent: &str, name: &str, kind: NodeKind, content: Bytes, modified: i64) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("n{}", state.next_id);
        state.nodes.insert(
            id.clone(),
            MemNode {
                name: name.to_string(),
                kind,
                parent: Some(parent.to_string()),
                content,
                modified_time: modified,
            },
        );
        state
            .children
            .entry(parent.to_string())
            .or_default()
            .push(id.clone());
        id
    }

    pub fn add_folder(&self, parent: &str, name: &str) -> String {
        self.insert(parent, name, NodeKind::Folder, Bytes::new(), 0)
    }

    pub fn add_folder_at(&self, parent: &str, name: &str, modified_time: i64) -> String {
        self.insert(parent, name, NodeKind::Folder, Bytes::new(), modified_time)
    }

    pub fn add_file(&self, parent: &str, name: &str, content: &[u8]) -> String {
        self.insert(
            parent,
            name,
            NodeKind::File,
            Bytes::copy_from_slice(content),
            0,
        )
    }

    /// 让 op 在 target 上返回 status，times 为 None 时一直失败
    pub fn fail(&self, op: Op, target: &str, status: u16, times: Option<usize>) {
        self.state.lock().unwrap().faults.push(Fault {
            op,
            target: target.to_string(),
            status,
            remaining: times,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// 统计以 prefix 开头的调用次数，如 "upload"
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn child(&self, parent: &str, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .children
            .get(parent)?
            .iter()
            .find(|id| state.nodes[*id].name == name)
            .cloned()
    }

    /// 按 "a/b/c" 路径查找节点
    pub fn lookup(&self, path: &str) -> Option<String> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(ROOT.to_string(), |parent, name| self.child(&parent, name))
    }

    /// 文件夹下的文件（名称、内容），按写入顺序
    pub fn files(&self, folder: &str) -> Vec<(String, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        state
            .children
            .get(folder)
            .map(|ids| {
                ids.iter()
                    .map(|id| &state.nodes[id])
                    .filter(|n| n.kind == NodeKind::File)
                    .map(|n| (n.name.clone(), n.content.to_vec()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn folder_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::Folder)
            .count()
            - 1
    }

    /// 记录调用并检查故障
    fn enter(&self, op: Op, call: String, keys: &[&str]) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);

        let hit = state.faults.iter_mut().find(|f| {
            f.op == op
                && keys.iter().any(|k| *k == f.target)
                && f.remaining.map_or(true, |n| n > 0)
        });
        match hit {
            Some(fault) => {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                Err(ApiError::status(self.tenant, fault.status, "injected"))
            }
            None => Ok(()),
        }
    }

    fn node_name(&self, id: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(id)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    fn is_descendant(state: &State, id: &str, ancestor: &str) -> bool {
        let mut current = state.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = state.nodes.get(&parent).and_then(|n| n.parent.clone());
        }
        false
    }

    fn missing(&self, id: &str) -> ApiError {
        ApiError::status(self.tenant, 404, format!("{} not found", id))
    }
}

#[async_trait]
impl SourceDirectory for MemoryDirectory {
    async fn search_folder(
        &self,
        scope_root_id: &str,
        name: &str,
    ) -> Result<Vec<FolderCandidate>, ApiError> {
        self.enter(Op::Search, format!("search:{}", name), &[name])?;
        let needle = name.to_lowercase();
        let state = self.state.lock().unwrap();
        let mut found: Vec<FolderCandidate> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::Folder)
            .filter(|(_, n)| n.name.to_lowercase().contains(&needle))
            .filter(|(id, _)| Self::is_descendant(&state, id, scope_root_id))
            .map(|(id, n)| FolderCandidate {
                id: id.clone(),
                name: n.name.clone(),
                parent_id: n.parent.clone(),
                modified_time: n.modified_time,
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn list_children(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildPage, ApiError> {
        let name = self.node_name(folder_id);
        self.enter(
            Op::List,
            format!("list:{}@{}", folder_id, cursor.unwrap_or("0")),
            &[folder_id, &name],
        )?;

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let state = self.state.lock().unwrap();
        if !state.nodes.contains_key(folder_id) {
            return Err(self.missing(folder_id));
        }
        let ids = state.children.get(folder_id).cloned().unwrap_or_default();
        let items: Vec<DirectoryNode> = ids
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|id| {
                let n = &state.nodes[id];
                DirectoryNode {
                    id: id.clone(),
                    name: n.name.clone(),
                    kind: n.kind,
                    size: (n.kind == NodeKind::File).then(|| n.content.len() as u64),
                }
            })
            .collect();
        let end = offset + items.len();
        Ok(ChildPage {
            items,
            next: (end < ids.len()).then(|| end.to_string()),
        })
    }

    async fn open_download(&self, file_id: &str) -> Result<ByteStream, ApiError> {
        let name = self.node_name(file_id);
        self.enter(Op::Download, format!("download:{}", name), &[file_id, &name])?;
        let content = self
            .state
            .lock()
            .unwrap()
            .nodes
            .get(file_id)
            .map(|n| n.content.clone())
            .ok_or_else(|| self.missing(file_id))?;

        // 拆成两块，确保上传端按流消费
        let mid = content.len() / 2;
        let chunks = vec![Ok(content.slice(..mid)), Ok(content.slice(mid..))];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        Ok(self.state.lock().unwrap().nodes.contains_key(folder_id))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl DestinationDirectory for MemoryDirectory {
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, ApiError> {
        self.enter(Op::Ensure, format!("ensure:{}/{}", parent_id, name), &[name])?;
        let existing = {
            let state = self.state.lock().unwrap();
            state.children.get(parent_id).and_then(|ids| {
                ids.iter()
                    .find(|id| {
                        let n = &state.nodes[*id];
                        n.kind == NodeKind::Folder && n.name.eq_ignore_ascii_case(name)
                    })
                    .cloned()
            })
        };
        Ok(match existing {
            Some(id) => id,
            None => self.add_folder(parent_id, name),
        })
    }

    async fn list_names(&self, folder_id: &str) -> Result<HashSet<String>, ApiError> {
        let name = self.node_name(folder_id);
        self.enter(Op::ListNames, format!("names:{}", folder_id), &[folder_id, &name])?;
        Ok(self.files(folder_id).into_iter().map(|(n, _)| n).collect())
    }

    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        body: ByteStream,
        _size: Option<u64>,
    ) -> Result<UploadedFile, ApiError> {
        self.enter(Op::Upload, format!("upload:{}/{}", folder_id, name), &[name])?;
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let content = chunks.concat();
        let size = content.len() as u64;
        let id = self.add_file(folder_id, name, &content);
        Ok(UploadedFile {
            id,
            name: name.to_string(),
            size: Some(size),
        })
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        Ok(self.state.lock().unwrap().nodes.contains_key(folder_id))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
