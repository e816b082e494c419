// src/models/mod.rs

pub mod api;

use crate::{constants, storage::naming};
use log::warn;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::PathBuf};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Contain,
    Cover,
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

fn default_duration() -> u32 {
    constants::sync::DEFAULT_ITEM_DURATION_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    #[serde(rename = "type")]
    pub media_type: MediaType,
    pub url: String,
    /// 单位：秒
    #[serde(default = "default_duration")]
    pub duration: u32,
    #[serde(default)]
    pub display_mode: DisplayMode,
}

impl PlaylistItem {
    /// 用于比较的身份：远程路径的文件名部分。
    ///
    /// 本地 `file://` 地址的文件名形如 `{hash}_{name}`，这里会去掉哈希前缀，
    /// 因此改写成本地路径后的条目与其远程来源仍然相等。
    pub fn identity_tail(&self) -> String {
        if self.is_local() {
            let path_part = self.url.split(['?', '#']).next().unwrap_or_default();
            let tail = path_part.rsplit(['/', '\\']).next().unwrap_or_default();
            let tail = percent_decode_str(tail).decode_utf8_lossy();
            if let Some((_, name)) = tail.split_once('_') {
                return name.to_string();
            }
        }
        naming::readable_name(&self.url)
    }

    pub fn is_local(&self) -> bool {
        self.url.starts_with("file:")
    }

    pub fn content_eq(&self, other: &PlaylistItem) -> bool {
        self.duration == other.duration
            && self.display_mode == other.display_mode
            && self.identity_tail() == other.identity_tail()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub rotation_degrees: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_type: Option<String>,
}

impl Playlist {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 方向相同，且逐项的文件名、时长、显示模式都相同。协议和主机的差异被忽略。
    pub fn content_eq(&self, other: &Playlist) -> bool {
        self.orientation == other.orientation
            && self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.content_eq(b))
    }

    /// 把相对地址解析为绝对地址，并修正非法时长。无法解析的条目会被丢弃。
    pub fn resolved(&self, base: &Url) -> Playlist {
        let items = self
            .items
            .iter()
            .filter_map(|item| {
                let url = item.url.trim();
                if url.is_empty() {
                    warn!("播放列表中存在空地址的条目，已忽略");
                    return None;
                }
                let absolute = match Url::parse(url) {
                    Ok(u) => u,
                    Err(url::ParseError::RelativeUrlWithoutBase) => match base.join(url) {
                        Ok(u) => u,
                        Err(e) => {
                            warn!("无法解析相对地址 '{}': {}", url, e);
                            return None;
                        }
                    },
                    Err(e) => {
                        warn!("无法解析地址 '{}': {}", url, e);
                        return None;
                    }
                };
                Some(PlaylistItem {
                    url: absolute.to_string(),
                    duration: if item.duration == 0 { default_duration() } else { item.duration },
                    ..item.clone()
                })
            })
            .collect();
        Playlist {
            items,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub priority: Priority,
    pub expected_size: Option<u64>,
    /// MD5 十六进制摘要
    pub expected_hash: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            priority: Priority::default(),
            expected_size: None,
            expected_hash: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadProgress {
    Queued,
    InProgress { percent: u8, status: String },
    Completed { local_path: PathBuf },
    Failed { reason: String },
    Cancelled,
}

impl DownloadProgress {
    /// 终态：除非发起新的请求，否则不会再变化。
    pub fn is_terminal(&self) -> bool {
        match self {
            DownloadProgress::Completed { .. }
            | DownloadProgress::Failed { .. }
            | DownloadProgress::Cancelled => true,
            DownloadProgress::Queued | DownloadProgress::InProgress { .. } => false,
        }
    }

    /// 同一生命周期内只允许向前推进。
    pub fn can_transition_to(&self, next: &DownloadProgress) -> bool {
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (DownloadProgress::InProgress { .. }, DownloadProgress::Queued) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadStats {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Unpaired,
    PairedWaiting,
    Downloading,
    Playing,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Unpaired => "未配对",
            SyncState::PairedWaiting => "已配对，等待内容",
            SyncState::Downloading => "下载中",
            SyncState::Playing => "播放中",
        };
        f.write_str(name)
    }
}
