//! 术前准备系统服务器主程序

use anyhow::Context;
use clap::Parser;
use oculus_admin::{audit_channel, init_logging, AppConfig, Metrics, StorageBackend, StorageConfig};
use oculus_database::{DatabasePool, DatabaseQueries, Store};
use oculus_integration::{telegram_notifier, RegistryHub, TelegramBot, TelegramClient};
use oculus_storage::StorageManager;
use oculus_web::{AppState, AuthService, WebServer};
use oculus_workflow::{Sweeper, WorkflowEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "oculus-server")]
#[command(about = "眼科手术术前准备流程管理服务器")]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<String>,

    /// 覆盖配置中的监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 只校验配置后退出
    #[arg(long)]
    check_config: bool,
}

fn build_storage(config: &StorageConfig) -> anyhow::Result<StorageManager> {
    let storage = match config.backend {
        StorageBackend::Local => StorageManager::local(&config.local_path)?,
        StorageBackend::S3 => StorageManager::s3(&config.s3)?,
        StorageBackend::Memory => StorageManager::in_memory(),
    };
    info!("Media storage backend: {}", storage.backend());
    Ok(storage)
}

async fn shutdown_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("配置校验失败")?;
    if args.check_config {
        println!("configuration ok");
        return Ok(());
    }
    init_logging(&config.logging)?;
    info!("Starting oculus server");

    let pool = DatabasePool::connect(
        &config.database.connection_url(),
        config.database.max_connections,
        config.database.acquire_timeout(),
    )
    .await
    .context("无法连接数据库")?;
    let queries = DatabaseQueries::new(pool.clone());
    queries.create_tables().await.context("无法初始化数据库表")?;
    let store: Arc<dyn Store> = Arc::new(queries);

    let storage = build_storage(&config.storage)?;
    let metrics = Metrics::new()?;
    let mut engine = WorkflowEngine::new(store.clone(), storage, metrics.clone());

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let telegram = match (config.telegram.enabled, config.telegram.bot_token.as_deref()) {
        (true, Some(token)) => Some(Arc::new(TelegramClient::new(
            &config.telegram.api_base,
            token,
            config.telegram.poll_timeout_secs,
        )?)),
        (true, None) => {
            warn!("Telegram is enabled but no bot token is configured");
            None
        }
        _ => None,
    };
    if let Some(client) = &telegram {
        let (notifier, sender) = telegram_notifier(
            client.clone(),
            store.clone(),
            Duration::from_millis(config.telegram.min_send_interval_ms),
            config.telegram.send_queue_capacity,
        );
        engine = engine.with_notifier(Arc::new(notifier));
        tasks.push(tokio::spawn(sender.run(cancel.clone())));
        let bot = TelegramBot::new(
            client.as_ref().clone(),
            engine.clone(),
            config.telegram.poll_timeout_secs,
        );
        tasks.push(tokio::spawn(bot.run(cancel.clone())));
    }

    let sweeper = Sweeper::new(engine.clone(), &config.sweeper)?;
    tasks.push(tokio::spawn(sweeper.run(cancel.clone())));

    let (audit, persister) = audit_channel(config.audit.channel_capacity, store.clone(), metrics);
    let persister = tokio::spawn(persister.run());

    let auth = AuthService::new(&config.auth, store.clone());
    auth.bootstrap_admin(&config.auth).await?;

    let state = AppState {
        engine,
        auth: Arc::new(auth),
        audit,
        registries: Arc::new(RegistryHub::from_config(&config.registries)?),
        max_body_bytes: config.server.max_upload_bytes,
    };
    let server = WebServer::new(state, &config.server);

    tokio::spawn(shutdown_signal(cancel.clone()));
    let result = server.run(cancel.clone()).await;
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    // 所有审计发送端随服务器释放后，持久化任务清空缓冲再退出
    if let Err(e) = persister.await {
        warn!("Audit persister ended abnormally: {}", e);
    }
    pool.close().await;
    info!("Oculus server stopped");
    result
}
