// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod constants;
pub mod downloader;
pub mod error;
pub mod models;
pub mod retry;
pub mod storage;
pub mod symbols;
pub mod sync;
pub mod ui;
pub mod utils;

use crate::{
    cli::Cli,
    client::RobustClient,
    config::{AppConfig, store::JsonFileStore},
    downloader::DownloadOrchestrator,
    error::AppResult,
    storage::StorageCache,
    sync::{AlwaysOnline, NetworkMonitor, PlaylistSyncController, SyncContext, TcpProbe},
};
use colored::*;
use indicatif::HumanBytes;
use log::{debug, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 库的公共入口点，由 `main.rs` 调用
pub async fn run_from_cli(args: Arc<Cli>, cancellation_token: CancellationToken) -> AppResult<()> {
    debug!("CLI 参数: {:?}", args);
    let config = Arc::new(AppConfig::new(&args)?);
    debug!("加载的应用配置: {:?}", config);

    let cache = Arc::new(StorageCache::new(&config.cache_dir, config.cache_limits.clone())?);
    if args.clear_cache {
        let deleted = cache.clear_all();
        println!(
            "{} 已清空缓存目录 {}，删除 {} 个文件。",
            *symbols::OK,
            cache.dir().display(),
            deleted
        );
        return Ok(());
    }

    let store = Arc::new(JsonFileStore::open(config::file::settings_path()?)?);
    let context = SyncContext::new(store);
    if args.reset {
        context.forget()?;
        info!("用户要求重置，已清除配对状态");
        println!("{} 已清除配对状态和已应用的播放列表。", *symbols::INFO);
    }

    let client = Arc::new(RobustClient::new(&config)?);
    let orchestrator =
        DownloadOrchestrator::new(config.clone(), cache.clone(), client.download.clone());
    let network: Arc<dyn NetworkMonitor> =
        match TcpProbe::for_url(&config.server_url, config.connect_timeout) {
            Some(probe) => Arc::new(probe),
            None => Arc::new(AlwaysOnline),
        };
    let controller = PlaylistSyncController::new(
        config.clone(),
        context.clone(),
        client,
        orchestrator.clone(),
        Arc::new(ui::ConsolePlayback::new()),
        network,
    );

    let stats = cache.stats();
    ui::print_header(&format!("{} v{}", clap::crate_name!(), clap::crate_version!()));
    println!("  服务器:   {}", config.server_url.as_str().cyan());
    println!("  设备标识: {}", context.device_id()?);
    println!(
        "  缓存:     {} ({} 个文件, {} / {}, {:.1}%)",
        stats.cache_dir.display(),
        stats.file_count,
        HumanBytes(stats.total_bytes),
        HumanBytes(stats.max_bytes),
        stats.usage_percentage()
    );

    if args.once {
        let decision = controller.poll_once().await?;
        info!("单次同步结果: {:?}", decision);
        println!("{} 同步结果: {:?}", *symbols::INFO, decision);
        controller.wait_for_cycle().await;
        orchestrator.print_report();
    } else {
        println!("\n{} 开始轮询，按 {} 退出。", *symbols::INFO, *symbols::CTRL_C);
        controller.run(cancellation_token).await;
    }

    orchestrator.shutdown();
    Ok(())
}
