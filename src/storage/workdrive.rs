use super::{
    ByteStream, ChildPage, DestinationDirectory, DirectoryNode, FolderCandidate, NodeKind,
    SourceDirectory, UploadedFile, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::auth::{CredentialProvider, Tenant};
use crate::error::ApiError;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// WorkDrive 文件 API 客户端，每个实例绑定一个租户
pub struct WorkDriveClient {
    http: reqwest::Client,
    base: String,
    tenant: Tenant,
    credentials: Arc<dyn CredentialProvider>,
    page_size: usize,
    name: String,
}

/// 接口返回的文件/文件夹资源
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Resource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    typ: Option<String>,
    #[serde(default)]
    is_folder: Option<bool>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified_time: Option<i64>,
    #[serde(default)]
    parent_id: Option<String>,
}

impl Resource {
    fn is_folder(&self) -> bool {
        self.is_folder.unwrap_or(false) || self.typ.as_deref() == Some("folder")
    }

    fn into_node(self) -> DirectoryNode {
        let kind = if self.is_folder() {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        DirectoryNode {
            id: self.id,
            name: self.name,
            kind,
            size: if kind == NodeKind::File { self.size } else { None },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn first(self) -> Option<T> {
        match self {
            OneOrMany::One(v) => Some(v),
            OneOrMany::Many(v) => v.into_iter().next(),
        }
    }
}

impl WorkDriveClient {
    pub fn new(
        http: reqwest::Client,
        api_base_url: &str,
        tenant: Tenant,
        credentials: Arc<dyn CredentialProvider>,
        page_size: usize,
    ) -> Self {
        let base = format!("{}/workdrive/api/v1", api_base_url.trim_end_matches('/'));
        let name = format!("workdrive[{}]", tenant);
        Self {
            http,
            base,
            tenant,
            credentials,
            page_size: page_size.max(1),
            name,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    fn folder_url(&self, folder_id: &str, tail: &str) -> String {
        let id = urlencoding::encode(folder_id);
        if tail.is_empty() {
            self.url(&format!("folders/{}", id))
        } else {
            self.url(&format!("folders/{}/{}", id, tail))
        }
    }

    /// 附加鉴权头并发送，非 2xx 转为 ApiError::Status
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let token = self.credentials.get_token(self.tenant).await?;
        let response = builder
            .header("Authorization", format!("Zoho-oauthtoken {}", token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(ApiError::status(self.tenant, status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.send(builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// 读取一页子节点，type_filter 为 "file" / "folder" 时只返回对应类型
    async fn page(
        &self,
        folder_id: &str,
        offset: usize,
        type_filter: Option<&str>,
    ) -> Result<Vec<Resource>, ApiError> {
        let mut query = vec![
            ("page[limit]".to_string(), self.page_size.to_string()),
            ("page[offset]".to_string(), offset.to_string()),
        ];
        if let Some(typ) = type_filter {
            query.push(("type".to_string(), typ.to_string()));
        }

        let builder = self
            .http
            .get(self.folder_url(folder_id, "files"))
            .query(&query)
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS));

        let envelope: Envelope<Vec<Resource>> = self.json(builder).await?;
        Ok(envelope.data)
    }

    /// 逐页读取全部子节点（仅用于目标端查重和建目录时的查找）
    async fn all(&self, folder_id: &str, type_filter: &str) -> Result<Vec<Resource>, ApiError> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.page(folder_id, offset, Some(type_filter)).await?;
            let count = page.len();
            all.extend(page);
            if count < self.page_size {
                break;
            }
            offset += count;
        }
        Ok(all)
    }

    async fn exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        let builder = self
            .http
            .get(self.folder_url(folder_id, ""))
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS));

        match self.send(builder).await {
            Ok(_) => Ok(true),
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SourceDirectory for WorkDriveClient {
    async fn search_folder(
        &self,
        scope_root_id: &str,
        name: &str,
    ) -> Result<Vec<FolderCandidate>, ApiError> {
        let builder = self
            .http
            .get(self.url("folders"))
            .query(&[
                ("teamfolderid", scope_root_id),
                ("search", name),
                ("type", "folder"),
            ])
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS));

        let envelope: Envelope<Vec<Resource>> = self.json(builder).await?;
        debug!("搜索 '{}' 返回 {} 个结果", name, envelope.data.len());

        Ok(envelope
            .data
            .into_iter()
            .map(|r| FolderCandidate {
                id: r.id,
                name: r.name,
                parent_id: r.parent_id,
                modified_time: r.modified_time.unwrap_or(0),
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

        let resources = self.page(folder_id, offset, None).await?;
        let count = resources.len();
        let next = (count >= self.page_size).then(|| (offset + count).to_string());

        Ok(ChildPage {
            items: resources.into_iter().map(Resource::into_node).collect(),
            next,
        })
    }

    async fn open_download(&self, file_id: &str) -> Result<ByteStream, ApiError> {
        let builder = self
            .http
            .get(self.url(&format!("files/{}/download", urlencoding::encode(file_id))))
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS));

        let response = self.send(builder).await?;
        Ok(Box::pin(response.bytes_stream().map_err(ApiError::Transport)))
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        self.exists(folder_id).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl DestinationDirectory for WorkDriveClient {
    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, ApiError> {
        let wanted = name.to_lowercase();
        if let Some(existing) = self
            .all(parent_id, "folder")
            .await?
            .into_iter()
            .find(|r| r.name.to_lowercase() == wanted)
        {
            debug!("目标文件夹已存在: {} ({})", name, existing.id);
            return Ok(existing.id);
        }

        let builder = self
            .http
            .post(self.url("folders"))
            .json(&serde_json::json!({ "name": name, "parentId": parent_id }))
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS));

        let envelope: Envelope<OneOrMany<Resource>> = self.json(builder).await?;
        let created = envelope
            .data
            .first()
            .ok_or_else(|| ApiError::Decode("创建文件夹响应为空".to_string()))?;
        debug!("已创建目标文件夹: {} ({})", name, created.id);
        Ok(created.id)
    }

    async fn list_names(&self, folder_id: &str) -> Result<HashSet<String>, ApiError> {
        Ok(self
            .all(folder_id, "file")
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        body: ByteStream,
        size: Option<u64>,
    ) -> Result<UploadedFile, ApiError> {
        let body = reqwest::Body::wrap_stream(body);
        let part = match size {
            Some(len) => Part::stream_with_length(body, len),
            None => Part::stream(body),
        }
        .file_name(name.to_string())
        .mime_str("application/octet-stream")?;

        let form = Form::new()
            .text("parentId", folder_id.to_string())
            .part("file", part);

        let builder = self
            .http
            .post(self.url("files/upload"))
            .multipart(form)
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS));

        let envelope: Envelope<OneOrMany<Resource>> = self.json(builder).await?;
        let uploaded = envelope
            .data
            .first()
            .ok_or_else(|| ApiError::Decode("上传响应为空".to_string()))?;

        Ok(UploadedFile {
            id: uploaded.id,
            name: if uploaded.name.is_empty() {
                name.to_string()
            } else {
                uploaded.name
            },
            size: uploaded.size.or(size),
        })
    }

    async fn folder_exists(&self, folder_id: &str) -> Result<bool, ApiError> {
        self.exists(folder_id).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
