// src/sync/cycle.rs

use super::{PlaylistSyncController, ports::CycleProgress};
use crate::{
    constants,
    models::{DownloadProgress, DownloadRequest, Playlist, PlaylistItem, Priority, SyncState},
};
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::HashMap;
use url::Url;

impl PlaylistSyncController {
    /// 一个完整的下载周期：下载缺失文件，等待全部结束，然后交付本地播放列表。
    pub(super) async fn run_cycle(&self, playlist: Playlist, epoch: u64) {
        let targets: Vec<String> = playlist
            .items
            .iter()
            .map(|item| item.url.clone())
            .unique()
            .collect();
        // 下载缺失文件腾空间时，不能删掉本播放列表已有的文件
        self.cache().protect(&targets);
        let missing: Vec<String> = targets
            .iter()
            .filter(|url| !self.cache().is_cached(url))
            .cloned()
            .collect();

        if missing.is_empty() {
            info!("播放列表中的 {} 个文件均已缓存", targets.len());
            self.finish_cycle(&playlist, &targets, epoch);
            return;
        }

        info!("需要下载 {}/{} 个文件", missing.len(), targets.len());
        self.set_state(SyncState::Downloading);
        self.inner.playback.show_downloading(&CycleProgress {
            total: missing.len(),
            ..Default::default()
        });

        for url in &missing {
            let request = DownloadRequest::new(url.clone())
                .with_priority(Priority::High)
                .with_metadata("cycle_epoch", epoch.to_string());
            if !self.inner.orchestrator.queue(request).await {
                warn!("文件 '{}' 未能加入下载队列", url);
            }
        }

        if !self.await_settlement(&missing, epoch).await {
            return;
        }
        tokio::time::sleep(self.inner.config.settle_delay).await;
        self.finish_cycle(&playlist, &targets, epoch);
    }

    /// 等待所有跟踪的 URL 进入终态。周期失效时返回 `false`。
    async fn await_settlement(&self, urls: &[String], epoch: u64) -> bool {
        let mut rx = self.inner.orchestrator.subscribe();
        let mut last = CycleProgress::default();
        loop {
            if self.epoch() != epoch {
                info!("同步周期已被重置，停止等待下载");
                return false;
            }
            let progress = {
                let snapshot = rx.borrow_and_update();
                self.count_settled(&snapshot, urls)
            };
            if progress != last {
                debug!(
                    "周期进度: 完成 {}, 失败 {}, 共 {}",
                    progress.completed, progress.failed, progress.total
                );
                self.inner.playback.show_downloading(&progress);
                last = progress;
            }
            if progress.is_settled() {
                info!(
                    "下载全部结束: 成功 {}, 失败 {}",
                    progress.completed, progress.failed
                );
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        warn!("下载进度通道已关闭");
                        return true;
                    }
                }
                _ = tokio::time::sleep(constants::download::DRAIN_INTERVAL) => {}
            }
        }
    }

    fn count_settled(
        &self,
        snapshot: &HashMap<String, DownloadProgress>,
        urls: &[String],
    ) -> CycleProgress {
        let mut progress = CycleProgress {
            total: urls.len(),
            ..Default::default()
        };
        for url in urls {
            match snapshot.get(url) {
                Some(DownloadProgress::Completed { .. }) => progress.completed += 1,
                Some(DownloadProgress::Failed { .. } | DownloadProgress::Cancelled) => {
                    progress.failed += 1
                }
                Some(DownloadProgress::Queued | DownloadProgress::InProgress { .. }) => {}
                // 进度表里没有记录：以磁盘上的文件为准
                None if self.cache().is_cached(url) => progress.completed += 1,
                None => progress.failed += 1,
            }
        }
        progress
    }

    fn finish_cycle(&self, playlist: &Playlist, targets: &[String], epoch: u64) {
        if self.epoch() != epoch {
            info!("同步周期在执行期间被重置，放弃本次结果");
            return;
        }
        let local = self.build_local_playlist(playlist);
        if local.is_empty() {
            warn!("没有任何文件可用，回到等待状态");
            self.stop_playback();
            self.set_state(SyncState::PairedWaiting);
            self.inner.playback.show_waiting();
            return;
        }
        let skipped = playlist.items.len() - local.items.len();
        if skipped > 0 {
            warn!("{} 个条目没有可用的本地文件，将被跳过", skipped);
        }

        let report = self.cache().retain_only(targets);
        if report.deleted_count > 0 {
            debug!("清理了 {} 个不再需要的缓存文件", report.deleted_count);
        }
        if let Err(e) = self.inner.context.save_applied_playlist(playlist) {
            warn!("保存已应用的播放列表失败: {}", e);
        }
        self.hand_off(local);
    }

    /// 只保留本地文件有效的条目，并把地址改写为 `file://` 缓存路径。
    pub(super) fn build_local_playlist(&self, playlist: &Playlist) -> Playlist {
        let items = playlist
            .items
            .iter()
            .filter_map(|item| {
                let path = self.cache().cache_file_for(&item.url);
                if !self.cache().is_valid(&path) {
                    debug!("条目 '{}' 没有有效的本地文件", item.url);
                    return None;
                }
                self.cache().touch(&path);
                match Url::from_file_path(&path) {
                    Ok(url) => Some(PlaylistItem {
                        url: url.to_string(),
                        ..item.clone()
                    }),
                    Err(()) => {
                        warn!("无法把 '{}' 转换为 file:// 地址", path.display());
                        None
                    }
                }
            })
            .collect();
        Playlist {
            items,
            ..playlist.clone()
        }
    }
}
