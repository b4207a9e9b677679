//! 记录级结果汇总

use super::mirror::{AttemptOutcome, TransferAttempt};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 记录处理状态
///
/// `Pending → Resolving → (Skipped | Transferring) → (Completed | PartiallyFailed)`，
/// 任何未结束的状态遇到记录级错误时进入 `Errored`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Resolving,
    Skipped,
    Transferring,
    Completed,
    PartiallyFailed,
    Errored,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordStatus::Skipped
                | RecordStatus::Completed
                | RecordStatus::PartiallyFailed
                | RecordStatus::Errored
        )
    }

    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        match (self, next) {
            (Pending, Resolving) => true,
            (Pending, Skipped) => true,
            (Resolving, Skipped | Transferring) => true,
            (Transferring, Completed | PartiallyFailed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Resolving => "resolving",
            RecordStatus::Skipped => "skipped",
            RecordStatus::Transferring => "transferring",
            RecordStatus::Completed => "completed",
            RecordStatus::PartiallyFailed => "partially_failed",
            RecordStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条记录的状态跟踪
#[derive(Debug, Clone)]
pub struct RecordProgress {
    pub record_id: String,
    status: RecordStatus,
}

impl RecordProgress {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            status: RecordStatus::Pending,
        }
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// 非法转换只记录警告，状态保持不变
    pub fn advance(&mut self, next: RecordStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            warn!(
                record_id = %self.record_id,
                "忽略非法状态转换: {} -> {}", self.status, next
            );
            false
        }
    }
}

/// 单条记录的传输结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub record_id: String,
    pub attempted: usize,
    pub succeeded: usize,
    /// 写回的完成标记
    pub checkbox: bool,
    pub status: RecordStatus,
    #[serde(skip)]
    pub attempts: Vec<TransferAttempt>,
}

impl RecordResult {
    pub fn failed(&self) -> usize {
        self.attempted - self.succeeded
    }
}

/// 汇总文件尝试结果
pub struct OutcomeAggregator;

impl OutcomeAggregator {
    /// | 条件 | 完成标记 | 状态 |
    /// |---|---|---|
    /// | 至少一个成功 | true | 全部成功为 Completed，否则 PartiallyFailed |
    /// | 没有发现任何文件 | false | Completed |
    /// | 有尝试且全部失败 | false | PartiallyFailed |
    pub fn aggregate(record_id: &str, attempts: Vec<TransferAttempt>) -> RecordResult {
        let attempted = attempts.len();
        let succeeded = attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Success)
            .count();

        let status = if succeeded == attempted {
            RecordStatus::Completed
        } else {
            RecordStatus::PartiallyFailed
        };

        RecordResult {
            record_id: record_id.to_string(),
            attempted,
            succeeded,
            checkbox: succeeded > 0,
            status,
            attempts,
        }
    }
}
