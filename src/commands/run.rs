use super::verify_credentials;
use crate::core::RecordSelection;
use crate::AppContext;
use anyhow::Result;
use tracing::{error, info};

/// 处理待处理记录，返回退出码
pub async fn run(ctx: &AppContext) -> Result<i32> {
    let config = &ctx.config;
    info!(
        "开始运行: 源={}, 目标={}, 记录库={}",
        ctx.directories.source.name(),
        ctx.directories.destination.name(),
        ctx.registry.name()
    );
    if config.dry_run {
        info!("演练模式：不会创建文件夹、上传文件或写回记录");
    }

    // 凭据不可用时不处理任何记录
    if let Err(e) = verify_credentials(ctx).await {
        error!("启动凭据检查失败: {}", e);
        return Ok(1);
    }

    let selection = match &config.record_id {
        Some(id) => RecordSelection::Single(id.clone()),
        None => RecordSelection::Pending {
            limit: config.limit,
        },
    };

    let report = ctx.orchestrator()?.run(selection).await;
    Ok(report.exit_code(config.allow_unresolved))
}
