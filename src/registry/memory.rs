//! 内存记录库，仅用于测试

use super::{PendingRecord, Registry};
use crate::auth::Tenant;
use crate::error::ApiError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryRegistry {
    records: Mutex<Vec<PendingRecord>>,
    writes: Mutex<Vec<(String, bool)>>,
    failing_writes: Mutex<HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new(records: Vec<PendingRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Default::default()
        }
    }

    pub fn record(id: &str, folder_name: &str) -> PendingRecord {
        PendingRecord {
            id: id.to_string(),
            folder_name: folder_name.to_string(),
            dest_override_id: None,
            preferred_parent_id: None,
            references: Default::default(),
        }
    }

    /// 写回该记录时返回 400
    pub fn fail_write(&self, id: &str) {
        self.failing_writes.lock().unwrap().insert(id.to_string());
    }

    pub fn writes(&self) -> Vec<(String, bool)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn fetch_pending(&self, limit: Option<usize>) -> Result<Vec<PendingRecord>, ApiError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<PendingRecord>, ApiError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn set_completion_flag(&self, id: &str, value: bool) -> Result<(), ApiError> {
        if self.failing_writes.lock().unwrap().contains(id) {
            return Err(ApiError::status(Tenant::Destination, 400, "rejected"));
        }
        self.writes.lock().unwrap().push((id.to_string(), value));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
