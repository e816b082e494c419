// src/sync/ports.rs

use crate::models::{Orientation, Playlist};
use async_trait::async_trait;
use log::trace;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

/// 一个同步周期的下载进度，`total` 只计算需要下载的文件。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CycleProgress {
    pub fn settled(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_settled(&self) -> bool {
        self.settled() >= self.total
    }
}

/// 实际负责显示的一方。同步控制器只通过这些回调驱动屏幕。
pub trait PlaybackSink: Send + Sync {
    fn show_pairing_code(&self, code: &str);
    fn show_waiting(&self);
    fn show_downloading(&self, progress: &CycleProgress);
    fn apply_orientation(&self, orientation: Orientation, rotation_degrees: i32);
    /// 交付一个全部指向本地文件的播放列表。
    fn play(&self, playlist: &Playlist);
    fn stop(&self);
}

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// 总是认为网络可用，让每次轮询自己去失败。
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl NetworkMonitor for AlwaysOnline {
    async fn is_connected(&self) -> bool {
        true
    }
}

/// 通过与服务器建立 TCP 连接来判断网络是否可用。
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn for_url(url: &Url, timeout: Duration) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self {
            addr: format!("{}:{}", host, port),
            timeout,
        })
    }
}

#[async_trait]
impl NetworkMonitor for TcpProbe {
    async fn is_connected(&self) -> bool {
        let connected = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        );
        trace!("网络探测 {}: {}", self.addr, connected);
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reports_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let probe = TcpProbe::for_url(&url, Duration::from_secs(1)).unwrap();
        assert!(probe.is_connected().await);

        drop(listener);
        assert!(!probe.is_connected().await);
    }

    #[test]
    fn test_cycle_progress_settlement() {
        let mut p = CycleProgress {
            total: 3,
            ..Default::default()
        };
        assert!(!p.is_settled());
        p.completed = 2;
        p.failed = 1;
        assert!(p.is_settled());
    }
}
