//! 记录库：提供待处理记录并接收完成标记

pub mod crm;
pub mod file;
#[cfg(test)]
pub mod memory;

use crate::auth::{CredentialProvider, Tenant};
use crate::config::{AppConfig, BackendConfig};
use crate::error::ApiError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use crm::CrmRegistry;
pub use file::FileRegistry;

/// 待处理记录（完成标记为 false 的记录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub id: String,
    /// 源文件夹名称
    pub folder_name: String,
    /// 指定的目标文件夹，覆盖默认目标根目录
    pub dest_override_id: Option<String>,
    /// 搜索结果中优先选择此父目录下的匹配
    pub preferred_parent_id: Option<String>,
    /// 其他引用字段，仅用于日志和审计
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

/// 记录字段名映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFields {
    pub flag: String,
    pub folder_name: String,
    pub dest_override: Option<String>,
    pub preferred_parent: Option<String>,
    pub references: Vec<String>,
}

impl RecordFields {
    /// 本次请求需要的字段列表
    pub fn requested(&self) -> Vec<&str> {
        let mut fields = vec!["id", self.flag.as_str(), self.folder_name.as_str()];
        fields.extend(self.dest_override.as_deref());
        fields.extend(self.preferred_parent.as_deref());
        fields.extend(self.references.iter().map(String::as_str));
        fields
    }

    /// 从原始 JSON 记录解析，缺少 id 时返回 None
    pub fn parse(&self, raw: &Value) -> Option<PendingRecord> {
        let id = field_string(raw, "id")?;
        let references = self
            .references
            .iter()
            .filter_map(|f| field_string(raw, f).map(|v| (f.clone(), v)))
            .collect();

        Some(PendingRecord {
            id,
            folder_name: field_string(raw, &self.folder_name)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            dest_override_id: self
                .dest_override
                .as_deref()
                .and_then(|f| lookup_id(raw, f)),
            preferred_parent_id: self
                .preferred_parent
                .as_deref()
                .and_then(|f| lookup_id(raw, f)),
            references,
        })
    }

    /// 记录的完成标记是否已为 true
    pub fn is_flagged(&self, raw: &Value) -> bool {
        match raw.get(&self.flag) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// 字符串、数字统一转为字符串，空值视为缺失
fn field_string(raw: &Value, field: &str) -> Option<String> {
    match raw.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// 查找类字段可能是 {"id": ..., "name": ...} 形式
fn lookup_id(raw: &Value, field: &str) -> Option<String> {
    match raw.get(field)? {
        Value::Object(obj) => obj.get("id").and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        _ => field_string(raw, field),
    }
}

/// 记录库
#[async_trait]
pub trait Registry: Send + Sync {
    /// 获取完成标记为 false 的记录
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<PendingRecord>, ApiError>;

    /// 按 ID 获取单条记录，不存在时返回 None
    async fn fetch_one(&self, id: &str) -> Result<Option<PendingRecord>, ApiError>;

    /// 写回完成标记
    async fn set_completion_flag(&self, id: &str, value: bool) -> Result<(), ApiError>;

    /// 获取记录库名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建记录库实例（记录库位于目标租户）
pub fn create_registry(
    config: &AppConfig,
    http: &reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Arc<dyn Registry>> {
    let fields = config.registry.fields.clone();
    match &config.backend {
        BackendConfig::WorkDrive(wd) => {
            tracing::info!("初始化 CRM 记录库: 模块 {}", config.registry.module);
            Ok(Arc::new(CrmRegistry::new(
                http.clone(),
                &wd.api_base_url,
                &config.registry.module,
                fields,
                Tenant::Destination,
                credentials,
            )))
        }
        BackendConfig::Local(local) => {
            tracing::info!("初始化文件记录库: {:?}", local.registry_file);
            Ok(Arc::new(FileRegistry::open(&local.registry_file, fields)?))
        }
    }
}
