use crate::registry::PendingRecord;
use crate::AppContext;
use anyhow::{Context, Result};
use tracing::info;

/// 获取待处理记录（指定了记录 ID 时只取该记录）
pub async fn fetch(ctx: &AppContext) -> Result<Vec<PendingRecord>> {
    let registry = ctx.registry.as_ref();
    let records: Vec<PendingRecord> = match ctx.config.record_id.as_deref() {
        Some(id) => ctx
            .executor
            .execute("fetch_one", || async move { registry.fetch_one(id).await })
            .await?
            .into_iter()
            .collect(),
        None => {
            let limit = ctx.config.limit;
            ctx.executor
                .execute("fetch_pending", || async move {
                    registry.fetch_pending(limit).await
                })
                .await?
        }
    };
    Ok(records)
}

/// 单行输出：ID、文件夹名称、覆盖项和引用字段
pub fn format_record(record: &PendingRecord) -> String {
    let mut line = format!("{}\t{}", record.id, record.folder_name);
    if let Some(dest) = &record.dest_override_id {
        line.push_str(&format!("\tdest={}", dest));
    }
    if let Some(parent) = &record.preferred_parent_id {
        line.push_str(&format!("\tparent={}", parent));
    }
    for (field, value) in &record.references {
        line.push_str(&format!("\t{}={}", field, value));
    }
    line
}

pub async fn list_pending(ctx: &AppContext) -> Result<i32> {
    let records = fetch(ctx)
        .await
        .with_context(|| format!("读取记录库 {} 失败", ctx.registry.name()))?;

    if records.is_empty() {
        println!("没有待处理记录");
    }
    for record in &records {
        println!("{}", format_record(record));
    }
    info!("待处理记录: {} 条", records.len());
    Ok(0)
}
