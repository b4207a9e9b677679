use crate::auth::Tenant;
use crate::AppContext;
use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct ConnectionCheck {
    pub name: String,
    pub success: bool,
    pub message: String,
    pub details: Option<String>,
}

impl ConnectionCheck {
    fn ok(name: &str, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            message: "连接成功".to_string(),
            details,
        }
    }

    fn failed(name: &str, message: &str, details: String) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            message: message.to_string(),
            details: Some(details),
        }
    }
}

async fn check_token(ctx: &AppContext, tenant: Tenant) -> ConnectionCheck {
    let name = format!("{} 凭据", tenant);
    match ctx.credentials.get_token(tenant).await {
        Ok(_) => ConnectionCheck::ok(&name, None),
        Err(e) => ConnectionCheck::failed(&name, "获取 token 失败", e.message),
    }
}

fn folder_check(name: &str, id: &str, result: Result<bool, crate::core::CallError>) -> ConnectionCheck {
    match result {
        Ok(true) => ConnectionCheck::ok(name, Some(format!("文件夹 '{}' 存在", id))),
        Ok(false) => ConnectionCheck::failed(name, "文件夹不存在", format!("'{}' 不存在", id)),
        Err(e) => ConnectionCheck::failed(name, "无法访问文件夹", e.to_string()),
    }
}

/// 依次检查两个租户的凭据、搜索范围根目录、目标根目录和记录库
pub async fn run_checks(ctx: &AppContext) -> Vec<ConnectionCheck> {
    let mut checks = vec![
        check_token(ctx, Tenant::Source).await,
        check_token(ctx, Tenant::Destination).await,
    ];

    let source = ctx.directories.source.as_ref();
    let scope = ctx.config.scope_root_id.as_str();
    let result = ctx
        .executor
        .execute("folder_exists", || async move { source.folder_exists(scope).await })
        .await;
    checks.push(folder_check("搜索范围根目录", scope, result));

    let destination = ctx.directories.destination.as_ref();
    let dest_root = ctx.config.dest_root_id.as_str();
    let result = ctx
        .executor
        .execute("folder_exists", || async move {
            destination.folder_exists(dest_root).await
        })
        .await;
    checks.push(folder_check("目标根目录", dest_root, result));

    let registry = ctx.registry.as_ref();
    let result = ctx
        .executor
        .execute("fetch_pending", || async move {
            registry.fetch_pending(Some(1)).await
        })
        .await;
    checks.push(match result {
        Ok(_) => ConnectionCheck::ok("记录库", Some(registry.name().to_string())),
        Err(e) => ConnectionCheck::failed("记录库", "查询失败", e.to_string()),
    });

    checks
}

pub async fn check_connection(ctx: &AppContext) -> Result<i32> {
    let checks = run_checks(ctx).await;
    for check in &checks {
        let mark = if check.success { "OK" } else { "FAIL" };
        match &check.details {
            Some(details) => println!("[{}] {}: {} ({})", mark, check.name, check.message, details),
            None => println!("[{}] {}: {}", mark, check.name, check.message),
        }
    }

    if checks.iter().all(|c| c.success) {
        info!("连接检查通过");
        Ok(0)
    } else {
        warn!("连接检查失败");
        Ok(1)
    }
}
