use crate::core::audit::{AuditEntry, AuditLog};
use crate::core::clock::Clock;
use crate::core::mirror::TreeMirror;
use crate::core::outcome::{OutcomeAggregator, RecordProgress, RecordStatus};
use crate::core::resolver::{DirectoryResolver, ResolvedFolder};
use crate::core::retry::RetryExecutor;
use crate::registry::{PendingRecord, Registry};
use crate::storage::Directories;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 编排配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 源租户中的搜索范围根目录
    pub scope_root_id: String,
    /// 默认目标根目录
    pub dest_root_id: String,
    /// 每条记录内的最大并发传输数
    pub max_concurrent_transfers: usize,
    /// 是否放在以源文件夹命名的子文件夹中
    pub nest_under_folder_name: bool,
    pub dry_run: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scope_root_id: String::new(),
            dest_root_id: String::new(),
            max_concurrent_transfers: 4, // 默认并行数为4
            nest_under_folder_name: false,
            dry_run: false,
        }
    }
}

/// 本次运行处理哪些记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSelection {
    Pending { limit: Option<usize> },
    Single(String),
}

/// 单条记录的处理报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReport {
    pub record_id: String,
    pub folder_name: String,
    pub status: RecordStatus,
    pub folder: Option<ResolvedFolder>,
    pub files_discovered: usize,
    pub files_transferred: usize,
    /// 实际写回的完成标记
    pub checkbox: Option<bool>,
    pub reason: Option<String>,
    /// 因源文件夹未找到或无法唯一确定而跳过
    pub unresolved: bool,
}

impl RecordReport {
    fn new(record: &PendingRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            folder_name: record.folder_name.clone(),
            status: RecordStatus::Pending,
            folder: None,
            files_discovered: 0,
            files_transferred: 0,
            checkbox: None,
            reason: None,
            unresolved: false,
        }
    }

    pub fn failures(&self) -> usize {
        self.files_discovered - self.files_transferred
    }
}

/// 运行报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub dry_run: bool,
    pub records: Vec<RecordReport>,
    /// 导致运行中止的错误
    pub fatal: Option<String>,
}

/// 运行汇总计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub partially_failed: usize,
    pub skipped: usize,
    /// skipped 中未能解析源文件夹的记录数
    pub unresolved: usize,
    pub errored: usize,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            processed: self.records.len(),
            ..Default::default()
        };
        for record in &self.records {
            match record.status {
                RecordStatus::Completed => summary.completed += 1,
                RecordStatus::PartiallyFailed => summary.partially_failed += 1,
                RecordStatus::Skipped => {
                    summary.skipped += 1;
                    if record.unresolved {
                        summary.unresolved += 1;
                    }
                }
                RecordStatus::Errored => summary.errored += 1,
                _ => {}
            }
        }
        summary
    }

    /// 出现致命错误、PartiallyFailed、Errored 或未解析的跳过时返回 1
    ///
    /// `allow_unresolved` 为 true 时未解析的跳过不影响退出码；
    /// 文件夹名称为空的跳过始终不影响。
    pub fn exit_code(&self, allow_unresolved: bool) -> i32 {
        if self.fatal.is_some() {
            return 1;
        }
        let summary = self.summary();
        if summary.partially_failed > 0 || summary.errored > 0 {
            return 1;
        }
        if !allow_unresolved && summary.unresolved > 0 {
            return 1;
        }
        0
    }
}

/// 传输编排器：逐条处理待处理记录
pub struct TransferOrchestrator {
    registry: Arc<dyn Registry>,
    resolver: DirectoryResolver,
    mirror: TreeMirror,
    executor: Arc<RetryExecutor>,
    clock: Arc<dyn Clock>,
    audit: Option<AuditLog>,
    config: OrchestratorConfig,
}

impl TransferOrchestrator {
    pub fn new(
        registry: Arc<dyn Registry>,
        directories: &Directories,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let resolver = DirectoryResolver::new(directories.source.clone(), executor.clone());
        let mirror = TreeMirror::new(
            directories.source.clone(),
            directories.destination.clone(),
            executor.clone(),
            clock.clone(),
            config.max_concurrent_transfers,
            config.dry_run,
        );
        Self {
            registry,
            resolver,
            mirror,
            executor,
            clock,
            audit: None,
            config,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// 运行一次：获取记录并逐条处理
    pub async fn run(&self, selection: RecordSelection) -> RunReport {
        let start_time = self.clock.now();
        let mut report = RunReport {
            start_time,
            end_time: start_time,
            dry_run: self.config.dry_run,
            records: Vec::new(),
            fatal: None,
        };

        if self.config.dry_run {
            info!("演练模式：不会创建文件夹、上传文件或写回完成标记");
        }

        let records = match self.fetch(&selection).await {
            Ok(records) => records,
            Err(e) => {
                error!("获取待处理记录失败: {}", e);
                report.fatal = Some(e);
                report.end_time = self.clock.now();
                return report;
            }
        };
        info!("从 {} 获取到 {} 条待处理记录", self.registry.name(), records.len());

        for record in &records {
            let record_report = self.process(record).await;
            report.records.push(record_report);
        }

        report.end_time = self.clock.now();
        Self::log_summary(&report);
        report
    }

    async fn fetch(&self, selection: &RecordSelection) -> Result<Vec<PendingRecord>, String> {
        let registry = self.registry.as_ref();
        match selection {
            RecordSelection::Pending { limit } => {
                let limit = *limit;
                self.executor
                    .execute("fetch_pending", || async move {
                        registry.fetch_pending(limit).await
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
            RecordSelection::Single(id) => {
                let id = id.as_str();
                let record = self
                    .executor
                    .execute("fetch_one", || async move { registry.fetch_one(id).await })
                    .await
                    .map_err(|e| e.to_string())?;
                record
                    .map(|r| vec![r])
                    .ok_or_else(|| format!("记录不存在: {}", id))
            }
        }
    }

    /// 处理单条记录，所有错误在此收敛
    async fn process(&self, record: &PendingRecord) -> RecordReport {
        let mut progress = RecordProgress::new(&record.id);
        let mut report = RecordReport::new(record);
        let record_id = record.id.as_str();

        if record.folder_name.is_empty() {
            warn!(record_id, "文件夹名称为空，跳过");
            progress.advance(RecordStatus::Skipped);
            report.reason = Some("文件夹名称为空".to_string());
            return self.finish(progress, report);
        }

        progress.advance(RecordStatus::Resolving);
        let folder = match self
            .resolver
            .resolve(
                &self.config.scope_root_id,
                &record.folder_name,
                record.preferred_parent_id.as_deref(),
            )
            .await
        {
            Ok(folder) => folder,
            Err(e) if e.is_skip() => {
                warn!(record_id, folder = %record.folder_name, "跳过记录: {}", e);
                progress.advance(RecordStatus::Skipped);
                report.reason = Some(e.to_string());
                report.unresolved = true;
                return self.finish(progress, report);
            }
            Err(e) => {
                error!(record_id, folder = %record.folder_name, "解析文件夹失败: {}", e);
                progress.advance(RecordStatus::Errored);
                report.reason = Some(e.to_string());
                return self.finish(progress, report);
            }
        };

        info!(
            record_id,
            folder = %folder.name,
            folder_id = %folder.id,
            "已匹配源文件夹"
        );
        report.folder = Some(folder.clone());
        progress.advance(RecordStatus::Transferring);

        let dest_root = record
            .dest_override_id
            .as_deref()
            .unwrap_or(&self.config.dest_root_id);
        let attempts = self
            .mirror
            .mirror(
                record_id,
                &folder,
                dest_root,
                self.config.nest_under_folder_name,
            )
            .await;

        for attempt in &attempts {
            self.audit(&AuditEntry::attempt(record_id, attempt, self.config.dry_run));
        }

        let result = OutcomeAggregator::aggregate(record_id, attempts);
        report.files_discovered = result.attempted;
        report.files_transferred = result.succeeded;

        if self.config.dry_run {
            info!(
                record_id,
                "[演练] 将写回完成标记 {} ({}/{} 个文件)",
                result.checkbox,
                result.succeeded,
                result.attempted
            );
            progress.advance(result.status);
            return self.finish(progress, report);
        }

        let registry = self.registry.as_ref();
        let checkbox = result.checkbox;
        match self
            .executor
            .execute("set_completion_flag", || async move {
                registry.set_completion_flag(record_id, checkbox).await
            })
            .await
        {
            Ok(()) => {
                report.checkbox = Some(checkbox);
                progress.advance(result.status);
            }
            Err(e) => {
                error!(record_id, kind = %e.kind(), "写回完成标记失败: {}", e);
                report.reason = Some(e.to_string());
                progress.advance(RecordStatus::Errored);
            }
        }

        self.finish(progress, report)
    }

    fn finish(&self, progress: RecordProgress, mut report: RecordReport) -> RecordReport {
        report.status = progress.status();
        info!(
            record_id = %report.record_id,
            status = %report.status,
            "记录处理结束: {}/{} 个文件成功",
            report.files_transferred,
            report.files_discovered
        );

        self.audit(&AuditEntry::RecordSummary {
            timestamp: self.clock.now(),
            record_id: report.record_id.clone(),
            folder_id: report.folder.as_ref().map(|f| f.id.clone()),
            folder_name: report.folder.as_ref().map(|f| f.name.clone()),
            files_discovered: report.files_discovered,
            files_transferred: report.files_transferred,
            failures: report.failures(),
            status: report.status,
            checkbox: report.checkbox,
            reason: report.reason.clone(),
            dry_run: self.config.dry_run,
        });
        report
    }

    fn audit(&self, entry: &AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(entry) {
                warn!("写入审计日志失败: {}", e);
            }
        }
    }

    fn log_summary(report: &RunReport) {
        let summary = report.summary();
        let duration = (report.end_time - report.start_time).num_seconds();
        info!("========== 运行汇总 ==========");
        info!("处理记录: {}", summary.processed);
        info!("完成: {}", summary.completed);
        info!("部分失败: {}", summary.partially_failed);
        info!("跳过: {} (未找到或不唯一: {})", summary.skipped, summary.unresolved);
        info!("出错: {}", summary.errored);
        info!("耗时: {}s", duration);
    }
}
