use clap::Parser;
use drivemirror_lib::logging::init_for_data_dir;
use drivemirror_lib::{commands, AppContext, Cli};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // guard 持有到进程结束
    let guard = init_for_data_dir(&cli.resolve_data_dir());

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("运行失败: {:#}", e);
            1
        }
    };

    drop(guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.into_config()?;
    let ctx = AppContext::new(config)?;
    commands::execute(&ctx).await
}
