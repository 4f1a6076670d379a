//! Hive - 多智能体编排核心
//!
//! 入口：加载配置、初始化日志、按配置打开台账并启动 MCP，Ctrl+C 后优雅关闭。
//! Agent 由嵌入方注册；单独运行时只有编排器自身（任务消费者与训练循环）。

use std::path::PathBuf;

use anyhow::Context;
use hive::{config::load_config, observability, McpBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    observability::init(&config.logging);

    let mcp = McpBuilder::from_app_config(&config)
        .context("Failed to assemble MCP")?
        .build()
        .await;
    mcp.start().await.context("Failed to start MCP")?;

    let status = mcp
        .system_status()
        .await
        .context("Failed to read system status")?;
    tracing::info!(
        app = config.app.name.as_deref().unwrap_or("hive"),
        ledger = ?config.ledger.backend,
        %status,
        "Hive ready, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown requested");
    mcp.shutdown().await;
    Ok(())
}
