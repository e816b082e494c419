// src/cli.rs

use clap::{Parser, ValueEnum, command, crate_version};
use std::path::PathBuf;

/// 定义日志输出级别
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

// command 属性
#[derive(Parser, Debug, Clone)]
#[command(
    version = crate_version!(),
    about,
    long_about = None,
    disable_help_flag = true,
    disable_version_flag = true,
)]
pub struct Cli {
    // --- 运行模式 (Mode) ---
    /// 只同步一次：完成一轮轮询以及由此触发的下载后退出
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub once: bool,
    /// 清空本地媒体缓存后退出
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode", conflicts_with = "once")]
    pub clear_cache: bool,
    /// 启动前清除配对状态和已应用的播放列表
    #[arg(long, action = clap::ArgAction::SetTrue, help_heading = "Mode")]
    pub reset: bool,

    // --- 同步选项 (Options) ---
    /// 同步服务器地址，覆盖配置文件中的设置
    #[arg(short, long, value_name = "URL", help_heading = "Options")]
    pub server: Option<String>,
    /// 设置媒体缓存目录
    #[arg(short, long, value_name = "DIR", help_heading = "Options")]
    pub cache_dir: Option<PathBuf>,
    /// 设置最大并发下载数
    #[arg(short, long, value_parser = clap::value_parser!(usize), help_heading = "Options")]
    pub workers: Option<usize>,
    /// 设置轮询间隔（秒）
    #[arg(short, long, value_name = "SECS", help_heading = "Options")]
    pub interval: Option<u64>,

    // --- 通用选项 (General) ---
    /// 显示此帮助信息并退出
    #[arg(short = 'h', long, action = clap::ArgAction::Help, global = true, help_heading = "General")]
    _help: Option<bool>,
    /// 显示版本信息并退出
    #[arg(short = 'V', long, action = clap::ArgAction::Version, global = true, help_heading = "General")]
    _version: Option<bool>,
    /// 设置日志文件的输出级别
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true, help_heading = "General")]
    pub log_level: LogLevel,
}
