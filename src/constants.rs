// src/constants.rs

use std::time::Duration;

pub const UI_WIDTH: usize = 72;
pub const MAX_FILENAME_BYTES: usize = 120;
pub const CONFIG_DIR_NAME: &str = concat!(".", clap::crate_name!());
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const LOG_FILE_NAME: &str = concat!(clap::crate_name!(), ".log");
pub const LOG_FALLBACK_FILE_NAME: &str = "fallback.log";
pub const CACHE_DIR_NAME: &str = clap::crate_name!();
pub const USER_AGENT: &str = concat!(clap::crate_name!(), "/", clap::crate_version!());

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
pub const DEFAULT_SYNC_PATH: &str = "api/device/sync";

pub mod sync {
    use super::Duration;

    pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
    /// 下载全部结束后，等待文件系统写入落盘的时间
    pub const SETTLE_DELAY: Duration = Duration::from_millis(350);
    pub const FAILURE_BACKOFF_BASE: Duration = Duration::from_secs(2);
    pub const FAILURE_BACKOFF_CAP: Duration = Duration::from_secs(300);
    pub const PAIRING_CODE_LENGTH: usize = 6;
    /// 去掉了容易混淆的 0/O、1/I
    pub const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    pub const DEFAULT_ITEM_DURATION_SECS: u32 = 10;
}

pub mod download {
    use super::Duration;

    pub const MAX_CONCURRENT: usize = 3;
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const MAX_REDIRECTS: usize = 5;
    pub const RETRY_STEP: Duration = Duration::from_millis(1000);
    pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_EXPECTED_SIZE: u64 = 10 * 1024 * 1024;
    pub const CHUNK_SIZE: usize = 64 * 1024;
    pub const ERROR_BODY_MAX_CHARS: usize = 200;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
}

pub mod cache {
    use super::Duration;

    pub const MAX_CACHE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
    pub const MIN_FREE_BYTES: u64 = 200 * 1024 * 1024;
    pub const MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
    pub const CLEANUP_TRIGGER_RATIO: f64 = 0.85;
    pub const CLEANUP_TARGET_RATIO: f64 = 0.70;
    /// 下载中的临时文件后缀，校验通过后改名为正式缓存文件
    pub const PART_SUFFIX: &str = ".part";
}

pub mod settings_keys {
    pub const PAIRED: &str = "paired";
    pub const PAIRING_CODE: &str = "pairing_code";
    pub const APPLIED_PLAYLIST: &str = "applied_playlist";
    pub const DEVICE_ID: &str = "device_id";
}
