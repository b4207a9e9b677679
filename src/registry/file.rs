use super::{PendingRecord, RecordFields, Registry};
use crate::error::ApiError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// JSON 文件记录库，文件内容为记录对象数组
pub struct FileRegistry {
    path: PathBuf,
    fields: RecordFields,
    records: Mutex<Vec<Value>>,
    name: String,
}

impl FileRegistry {
    pub fn open(path: impl AsRef<Path>, fields: RecordFields) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("读取记录文件 {:?} 失败: {}", path, e))?;
        let records: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("记录文件 {:?} 格式错误: {}", path, e))?;
        let name = format!("file:{}", path.display());

        Ok(Self {
            path,
            fields,
            records: Mutex::new(records),
            name,
        })
    }

    /// 先写临时文件再重命名，避免中断时留下半个文件
    async fn persist(&self, records: &[Value]) -> Result<(), ApiError> {
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<PendingRecord>, ApiError> {
        let records = self.records.lock().await;
        let pending = records
            .iter()
            .filter(|raw| !self.fields.is_flagged(raw))
            .filter_map(|raw| self.fields.parse(raw))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(pending)
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<PendingRecord>, ApiError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter_map(|raw| self.fields.parse(raw))
            .find(|r| r.id == id))
    }

    async fn set_completion_flag(&self, id: &str, value: bool) -> Result<(), ApiError> {
        let mut records = self.records.lock().await;

        // 写盘成功后才替换内存中的记录
        let mut updated = records.clone();
        let entry = updated
            .iter_mut()
            .find(|raw| self.fields.parse(raw).is_some_and(|r| r.id == id))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ApiError::NotFound(format!("记录 {}", id)))?;
        entry.insert(self.fields.flag.clone(), Value::Bool(value));

        self.persist(&updated).await?;
        *records = updated;
        debug!("记录 {} 完成标记已写入: {}", id, value);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fields() -> RecordFields {
        RecordFields {
            flag: "done".to_string(),
            folder_name: "folder".to_string(),
            dest_override: Some("dest".to_string()),
            preferred_parent: None,
            references: vec![],
        }
    }

    fn write_records(dir: &TempDir, records: Value) -> PathBuf {
        let path = dir.path().join("records.json");
        std::fs::write(&path, records.to_string()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_pending_excludes_flagged_records() {
        let dir = TempDir::new().unwrap();
        let path = write_records(
            &dir,
            json!([
                {"id": "1", "folder": "A", "done": false},
                {"id": "2", "folder": "B", "done": true},
                {"id": "3", "folder": "C", "dest": "d-3"}
            ]),
        );

        let registry = FileRegistry::open(&path, fields()).unwrap();
        let pending = registry.fetch_pending(None).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(pending[1].dest_override_id.as_deref(), Some("d-3"));

        assert_eq!(registry.fetch_pending(Some(1)).await.unwrap().len(), 1);
        assert!(registry.fetch_one("2").await.unwrap().is_some());
        assert!(registry.fetch_one("9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flag_write_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = write_records(&dir, json!([{"id": "1", "folder": "A", "done": false}]));

        let registry = FileRegistry::open(&path, fields()).unwrap();
        registry.set_completion_flag("1", true).await.unwrap();
        assert!(registry.fetch_pending(None).await.unwrap().is_empty());

        let reopened = FileRegistry::open(&path, fields()).unwrap();
        assert!(reopened.fetch_pending(None).await.unwrap().is_empty());
        assert!(!dir.path().join("records.json.tmp").exists());

        let err = registry.set_completion_flag("missing", true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_open_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileRegistry::open(&path, fields()).is_err());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_record_pending() {
        let dir = TempDir::new().unwrap();
        let path = write_records(&dir, json!([{"id": "1", "folder": "A", "done": false}]));
        let registry = FileRegistry::open(&path, fields()).unwrap();

        // 临时文件路径被目录占用，写盘失败
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        assert!(registry.set_completion_flag("1", true).await.is_err());

        assert_eq!(registry.fetch_pending(None).await.unwrap().len(), 1);
        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk[0]["done"], false);
    }
}
