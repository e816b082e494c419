// src/config.rs

pub mod file;
pub mod store;

use self::file::load_or_create_external_config;
use crate::{
    cli::Cli,
    constants,
    error::{AppError, AppResult},
    retry::RetryPolicy,
    storage::CacheLimits,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub url: Option<String>,
    pub sync_path: Option<String>,
    /// 播放列表中相对地址的基准，缺省时使用服务器地址
    pub media_base_url: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    pub dir: Option<PathBuf>,
    pub max_size_mb: Option<u64>,
    pub min_free_mb: Option<u64>,
    pub max_age_days: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DownloadConfig {
    pub max_concurrent: Option<usize>,
    pub max_attempts: Option<u32>,
    pub max_redirects: Option<usize>,
    pub retry_step_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExternalConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

const MB: u64 = 1024 * 1024;

impl ExternalConfig {
    pub(crate) fn default_app_config() -> Self {
        Self {
            server: ServerConfig {
                url: Some(constants::DEFAULT_SERVER_URL.into()),
                sync_path: Some(constants::DEFAULT_SYNC_PATH.into()),
                media_base_url: None,
                poll_interval_secs: Some(constants::sync::POLL_INTERVAL.as_secs()),
            },
            network: NetworkConfig {
                connect_timeout_secs: Some(constants::download::CONNECT_TIMEOUT.as_secs()),
                read_timeout_secs: Some(constants::download::READ_TIMEOUT.as_secs()),
                timeout_secs: Some(60),
                max_retries: Some(3),
            },
            cache: CacheConfig {
                dir: None,
                max_size_mb: Some(constants::cache::MAX_CACHE_BYTES / MB),
                min_free_mb: Some(constants::cache::MIN_FREE_BYTES / MB),
                max_age_days: Some(constants::cache::MAX_AGE.as_secs() / 86_400),
            },
            download: DownloadConfig {
                max_concurrent: Some(constants::download::MAX_CONCURRENT),
                max_attempts: Some(constants::download::MAX_ATTEMPTS),
                max_redirects: Some(constants::download::MAX_REDIRECTS),
                retry_step_ms: Some(constants::download::RETRY_STEP.as_millis() as u64),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_url: Url,
    pub sync_path: String,
    pub media_base_url: Url,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub cache_dir: PathBuf,
    pub cache_limits: CacheLimits,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub max_redirects: usize,
    pub retry_step: Duration,
    pub drain_interval: Duration,
    pub default_expected_size: u64,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl AppConfig {
    pub fn new(args: &Cli) -> AppResult<Self> {
        let external_config = load_or_create_external_config()?;
        Self::from_sources(external_config, args)
    }

    /// 合并三层配置：内置默认值 < 配置文件 < 命令行参数。
    pub fn from_sources(external: ExternalConfig, args: &Cli) -> AppResult<Self> {
        let server = args
            .server
            .clone()
            .or(external.server.url)
            .unwrap_or_else(|| constants::DEFAULT_SERVER_URL.to_string());
        let server_url = parse_base_url(&server)?;
        let media_base_url = match external.server.media_base_url {
            Some(base) => parse_base_url(&base)?,
            None => server_url.clone(),
        };

        let max_concurrent = args
            .workers
            .or(external.download.max_concurrent)
            .unwrap_or(constants::download::MAX_CONCURRENT);
        if max_concurrent == 0 {
            return Err(AppError::Config("并发下载数必须大于 0".into()));
        }

        let defaults = CacheLimits::default();
        let cache_limits = CacheLimits {
            max_cache_bytes: external
                .cache
                .max_size_mb
                .map_or(defaults.max_cache_bytes, |mb| mb.saturating_mul(MB)),
            min_free_bytes: external
                .cache
                .min_free_mb
                .map_or(defaults.min_free_bytes, |mb| mb.saturating_mul(MB)),
            max_age: external
                .cache
                .max_age_days
                .map_or(defaults.max_age, |days| {
                    Duration::from_secs(days.saturating_mul(86_400))
                }),
        };

        Ok(Self {
            server_url,
            sync_path: external
                .server
                .sync_path
                .unwrap_or_else(|| constants::DEFAULT_SYNC_PATH.to_string()),
            media_base_url,
            poll_interval: Duration::from_secs(
                args.interval
                    .or(external.server.poll_interval_secs)
                    .unwrap_or(constants::sync::POLL_INTERVAL.as_secs())
                    .max(1),
            ),
            settle_delay: constants::sync::SETTLE_DELAY,
            cache_dir: args
                .cache_dir
                .clone()
                .or(external.cache.dir)
                .unwrap_or_else(default_cache_dir),
            cache_limits,
            max_concurrent,
            max_attempts: external
                .download
                .max_attempts
                .unwrap_or(constants::download::MAX_ATTEMPTS)
                .max(1),
            max_redirects: external
                .download
                .max_redirects
                .unwrap_or(constants::download::MAX_REDIRECTS),
            retry_step: external
                .download
                .retry_step_ms
                .map_or(constants::download::RETRY_STEP, Duration::from_millis),
            drain_interval: constants::download::DRAIN_INTERVAL,
            default_expected_size: constants::download::DEFAULT_EXPECTED_SIZE,
            user_agent: constants::USER_AGENT.into(),
            connect_timeout: Duration::from_secs(
                external
                    .network
                    .connect_timeout_secs
                    .unwrap_or(constants::download::CONNECT_TIMEOUT.as_secs()),
            ),
            read_timeout: Duration::from_secs(
                external
                    .network
                    .read_timeout_secs
                    .unwrap_or(constants::download::READ_TIMEOUT.as_secs()),
            ),
            timeout: Duration::from_secs(external.network.timeout_secs.unwrap_or(60)),
            max_retries: external.network.max_retries.unwrap_or(3),
        })
    }

    pub fn sync_url(&self) -> AppResult<Url> {
        Ok(self.server_url.join(self.sync_path.trim_start_matches('/'))?)
    }

    /// 单个下载请求的重试：线性退避。
    pub fn download_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.retry_step, self.max_attempts)
    }

    /// 轮询失败后的退避：指数增长并封顶，不限次数。
    pub fn sync_backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            constants::sync::FAILURE_BACKOFF_BASE,
            constants::sync::FAILURE_BACKOFF_CAP,
            u32::MAX,
        )
    }
}

/// 作为基准地址使用时必须以 `/` 结尾，否则 `join` 会替换掉最后一段路径。
fn parse_base_url(raw: &str) -> AppResult<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Config(format!(
            "服务器地址必须是 http 或 https: {}",
            raw
        )));
    }
    Ok(url)
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(constants::CACHE_DIR_NAME)
}

#[cfg(any(test, feature = "testing"))]
impl Default for AppConfig {
    fn default() -> Self {
        let server_url = Url::parse("http://127.0.0.1:8080/").expect("static url");
        Self {
            media_base_url: server_url.clone(),
            server_url,
            sync_path: constants::DEFAULT_SYNC_PATH.to_string(),
            poll_interval: Duration::from_millis(200),
            settle_delay: Duration::from_millis(20),
            cache_dir: std::env::temp_dir().join(constants::CACHE_DIR_NAME),
            cache_limits: CacheLimits::default(),
            max_concurrent: constants::download::MAX_CONCURRENT,
            max_attempts: constants::download::MAX_ATTEMPTS,
            max_redirects: constants::download::MAX_REDIRECTS,
            retry_step: Duration::from_millis(50),
            drain_interval: Duration::from_millis(100),
            default_expected_size: 1024 * 1024,
            user_agent: "test-agent/1.0".to_string(),
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(15),
            max_retries: 3,
        }
    }
}
