use super::{
    ByteStream, ChildPage, DestinationDirectory, DirectoryNode, FolderCandidate, NodeKind,
    SourceDirectory, UploadedFile,
};
use crate::error::ApiError;
use async_trait::async_trait;
use futures::TryStreamExt;
use regex::Regex;
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio_util::io::{ReaderStream, StreamReader};
use walkdir::WalkDir;

/// 本地文件系统目录，节点 ID 为相对根目录的路径（根目录为空字符串）
pub struct LocalDirectory {
    base_path: PathBuf,
    page_size: usize,
    name: String,
}

impl LocalDirectory {
    pub fn new(path: impl AsRef<Path>, page_size: usize) -> anyhow::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            page_size: page_size.max(1),
            name,
        })
    }

    /// 把节点 ID 解析为绝对路径，拒绝越出根目录的 ID
    fn resolve_path(&self, id: &str) -> Result<PathBuf, ApiError> {
        let id = id.trim_start_matches('/').trim_start_matches('\\');
        if id.is_empty() {
            return Ok(self.base_path.clone());
        }
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ApiError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("非法节点 ID: {}", id),
            )));
        }
        Ok(self.base_path.join(relative))
    }

    /// 相对路径转节点 ID（统一使用 /）
    fn to_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        Some(relative.to_str()?.replace('\\', "/"))
    }

    fn join_id(parent_id: &str, name: &str) -> String {
        let parent_id = parent_id.trim_matches('/');
        if parent_id.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_id, name)
        }
    }

    fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
        metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as i64)
    }

    /// 按名称排序读取目录，保证列表顺序稳定
    async fn read_sorted(&self, folder_id: &str) -> Result<Vec<DirectoryNode>, ApiError> {
        let dir = self.resolve_path(folder_id)?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut nodes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // 上传中的临时文件
            if name.starts_with('.') && name.ends_with(".part") {
                continue;
            }
            let kind = if metadata.is_dir() {
                NodeKind::Folder
            } else {
                NodeKind::File
            };
            nodes.push(DirectoryNode {
                id: Self::join_id(folder_id, &name),
                name,
                kind,
                size: (kind == NodeKind::File).then(|| metadata.len()),
            });
        }

        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}

/// 替换常见文件系统不允许的字符
pub fn sanitize_component(name: &str) -> String {
    static ILLEGAL: OnceLock<Regex> = OnceLock::new();
    let re = ILLEGAL.get_or_init(|| Regex::new(r#"[\\/:*?"<>|]"#).expect("valid regex"));
    let cleaned = re.replace_all(name.trim(), "_").to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl SourceDirectory for LocalDirectory {
    async fn search_folder(
        &self,
        scope_root_id: &str,
        name: &str,
    ) -> Result<Vec<FolderCandidate>, ApiError> {
        let scope = self.resolve_path(scope_root_id)?;
        if !scope.is_dir() {
            return Err(ApiError::NotFound(format!("范围根目录不存在: {}", scope_root_id)));
        }

        let needle = name.to_lowercase();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let found: Vec<(PathBuf, String, i64)> = tokio::task::spawn_blocking(move || {
            WalkDir::new(&scope)
                .min_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
                .filter_map(|entry| {
                    let file_name = entry.file_name().to_str()?.to_string();
                    if !file_name.to_lowercase().contains(&needle) {
                        return None;
                    }
                    let modified = entry
                        .metadata()
                        .ok()
                        .map(|m| LocalDirectory::modified_millis(&m))
                        .unwrap_or(0);
                    Some((entry.path().to_path_buf(), file_name, modified))
                })
                .collect()
        })
        .await
        .map_err(|e| ApiError::Io(io::Error::other(e)))?;

        Ok(found
            .into_iter()
            .filter_map(|(path, name, modified_time)| {
                let id = self.to_id(&path)?;
                let parent_id = path.parent().and_then(|p| self.to_id(p));
                Some(FolderCandidate {
                    id,
                    name,
                    parent_id,
                    modified_time,
                })
            })
            .collect())
    }

    async fn list_children(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChildPage, ApiError> {
        let offset: usize = cursor
            .map(|c| c.parse())
            .transpose()
            .map_err(|_| ApiError::Decode(format!("无效的分页游标: {:?}", cursor)))?
            .unwrap_or(0);

        let nodes = self.read_sorted(folder_id).await?;
        let end = (offset + self.page_size).min(nodes.len());
        let items = nodes.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < nodes.len()).then(|| end.to_string());

        Ok(ChildPage { items, next })
    }

    async fn open_download(&self, file_id: &str) -> Result<ByteStream, ApiError> {
        let file = fs::File::open(self.resolve_path(file_id)?).await?;
        Ok(Box::pin(ReaderStream::new(file).map_err(ApiError::Io)))
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        Ok(self.resolve_path(folder_id)?.is_dir())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl DestinationDirectory for LocalDirectory {
    fn normalize_name(&self, name: &str) -> String {
        sanitize_component(name)
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, ApiError> {
        let id = Self::join_id(parent_id, &sanitize_component(name));
        fs::create_dir_all(self.resolve_path(&id)?).await?;
        Ok(id)
    }

    async fn list_names(&self, folder_id: &str) -> Result<HashSet<String>, ApiError> {
        Ok(self
            .read_sorted(folder_id)
            .await?
            .into_iter()
            .filter(|n| !n.is_folder())
            .map(|n| n.name)
            .collect())
    }

    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        body: ByteStream,
        _size: Option<u64>,
    ) -> Result<UploadedFile, ApiError> {
        let name = sanitize_component(name);
        let id = Self::join_id(folder_id, &name);
        let full_path = self.resolve_path(&id)?;

        // 先写临时文件，完成后原子重命名；并发上传同名文件时临时文件互不覆盖
        let temp_path =
            full_path.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path).await?;
        let mut reader = StreamReader::new(body.map_err(io::Error::other));

        let written = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&temp_path).await;
                return Err(ApiError::Io(e));
            }
        };
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);
        // 不覆盖已有文件
        if fs::try_exists(&full_path).await? {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ApiError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("目标文件已存在: {}", id),
            )));
        }
        fs::rename(&temp_path, &full_path).await?;

        Ok(UploadedFile {
            id,
            name,
            size: Some(written),
        })
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        Ok(self.resolve_path(folder_id)?.is_dir())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
