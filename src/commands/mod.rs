//! 命令入口
//!
//! 每个命令返回进程退出码，运行级错误以 `anyhow::Error` 向上传递。

pub mod check;
pub mod pending;
pub mod run;

use crate::auth::Tenant;
use crate::config::Command;
use crate::error::CredentialError;
use crate::AppContext;
use anyhow::Result;
use tracing::debug;

/// 按配置选择命令执行
pub async fn execute(ctx: &AppContext) -> Result<i32> {
    match ctx.config.command {
        Command::Run => run::run(ctx).await,
        Command::CheckConnection => check::check_connection(ctx).await,
        Command::ListPending => pending::list_pending(ctx).await,
    }
}

/// 为两个租户各获取一次 token
pub async fn verify_credentials(ctx: &AppContext) -> Result<(), CredentialError> {
    for tenant in [Tenant::Source, Tenant::Destination] {
        ctx.credentials.get_token(tenant).await?;
        debug!("{} 凭据可用", tenant);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::{
        AppConfig, BackendConfig, Command, LocalConfig, RegistryConfig, TransferConfig,
    };
    use crate::registry::RecordFields;
    use serde_json::json;
    use std::fs;
    use std::path::Path;

    /// 本地后端的完整运行环境：
    /// source/Clients/Acme/{report.pdf, sub/notes.txt}，记录 1 指向 Acme，记录 2 指向不存在的文件夹
    pub fn local_config(root: &Path) -> AppConfig {
        let source = root.join("source");
        let dest = root.join("dest");
        fs::create_dir_all(source.join("Clients/Acme/sub")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(source.join("Clients/Acme/report.pdf"), b"pdf bytes").unwrap();
        fs::write(source.join("Clients/Acme/sub/notes.txt"), b"notes").unwrap();

        let registry_file = root.join("records.json");
        fs::write(
            &registry_file,
            serde_json::to_string_pretty(&json!([
                {"id": "1", "folder_name": "Acme", "transferred": false},
                {"id": "2", "folder_name": "Missing", "transferred": false},
                {"id": "3", "folder_name": "Done", "transferred": true}
            ]))
            .unwrap(),
        )
        .unwrap();

        AppConfig {
            command: Command::Run,
            backend: BackendConfig::Local(LocalConfig {
                source_root: source,
                dest_root: dest,
                registry_file,
            }),
            registry: RegistryConfig {
                module: "records".to_string(),
                fields: RecordFields {
                    flag: "transferred".to_string(),
                    folder_name: "folder_name".to_string(),
                    dest_override: None,
                    preferred_parent: None,
                    references: Vec::new(),
                },
            },
            transfer: TransferConfig {
                retry_base_delay_ms: 1,
                ..Default::default()
            },
            scope_root_id: String::new(),
            dest_root_id: String::new(),
            data_dir: root.join("data"),
            dry_run: false,
            allow_unresolved: false,
            record_id: None,
            limit: None,
        }
    }
}
