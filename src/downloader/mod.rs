// src/downloader/mod.rs

mod progress;
mod task_processor;
mod task_runner;

pub use progress::{ProgressSnapshot, ProgressTable};

use crate::{
    config::AppConfig,
    error::AppError,
    models::{DownloadProgress, DownloadRequest, DownloadStats},
    storage::StorageCache,
    symbols, ui,
};
use colored::*;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    Cancelled,
    Done,
}

#[derive(Debug)]
pub(crate) struct ActiveTask {
    pub(crate) id: u64,
    pub(crate) state: TaskState,
    pub(crate) token: CancellationToken,
}

pub(crate) struct Inner {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) cache: Arc<StorageCache>,
    pub(crate) client: reqwest::Client,
    pub(crate) progress: ProgressTable,
    pub(crate) queue: Mutex<VecDeque<DownloadRequest>>,
    pub(crate) tasks: DashMap<String, ActiveTask>,
    pub(crate) next_task_id: AtomicU64,
    pub(crate) wakeup: Notify,
    pub(crate) shutdown: CancellationToken,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, VecDeque<DownloadRequest>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Active)
            .count()
    }
}

/// 下载调度器：优先级队列、有限并发、逐跳重定向、重试、取消与进度广播。
///
/// 克隆得到的是同一个调度器的句柄。
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
}

impl DownloadOrchestrator {
    /// `client` 必须关闭自动重定向，重定向由调度器自己计数和跟随。
    pub fn new(config: Arc<AppConfig>, cache: Arc<StorageCache>, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                client,
                progress: ProgressTable::new(),
                queue: Mutex::new(VecDeque::new()),
                tasks: DashMap::new(),
                next_task_id: AtomicU64::new(1),
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
                drainer: Mutex::new(None),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<StorageCache> {
        &self.inner.cache
    }

    /// 接受一个下载请求。
    ///
    /// 已缓存的文件立即标记为完成且不发起任何网络请求。磁盘空间不足时标记为失败并返回 `false`。
    /// 同一 URL 已在队列中或正在下载时不会重复排队。
    pub async fn queue(&self, request: DownloadRequest) -> bool {
        let url = request.url.clone();
        let target = self.inner.cache.cache_file_for(&url);
        if self.inner.cache.is_valid(&target) {
            debug!("命中缓存，跳过下载: {}", url);
            self.inner.cache.touch(&target);
            self.inner
                .progress
                .begin(&url, DownloadProgress::Completed { local_path: target });
            return true;
        }
        if self.is_pending(&url) {
            debug!("'{}' 已在队列或下载中", url);
            return true;
        }

        let expected_size = match request.expected_size {
            Some(size) => size,
            None => task_processor::probe_content_length(
                &self.inner.client,
                &url,
                self.inner.config.max_redirects,
            )
            .await
            .unwrap_or(self.inner.config.default_expected_size),
        };
        if !self.inner.cache.ensure_space(expected_size) {
            warn!("磁盘空间不足，无法下载 '{}' (需要 {} 字节)", url, expected_size);
            self.inner.progress.begin(
                &url,
                DownloadProgress::Failed {
                    reason: AppError::InsufficientStorage.to_string(),
                },
            );
            return false;
        }

        self.inner.progress.begin(&url, DownloadProgress::Queued);
        {
            let mut queue = self.inner.lock_queue();
            // 同优先级先到先得
            let pos = queue
                .iter()
                .position(|r| r.priority < request.priority)
                .unwrap_or(queue.len());
            debug!("'{}' 加入队列 (优先级 {:?}, 位置 {})", url, request.priority, pos);
            queue.insert(pos, request);
        }
        self.ensure_drainer();
        self.inner.wakeup.notify_one();
        true
    }

    /// 取消一个等待中或进行中的请求。找不到时返回 `false`。
    pub fn cancel(&self, url: &str) -> bool {
        let mut found = false;
        {
            let mut queue = self.inner.lock_queue();
            if let Some(pos) = queue.iter().position(|r| r.url == url) {
                queue.remove(pos);
                found = true;
            }
        }
        if let Some(mut task) = self.inner.tasks.get_mut(url)
            && task.state == TaskState::Active
        {
            task.state = TaskState::Cancelled;
            task.token.cancel();
            found = true;
        }
        if found {
            info!("取消下载: {}", url);
            self.inner.progress.update(url, DownloadProgress::Cancelled);
        }
        found
    }

    pub fn cancel_all(&self) {
        let pending: Vec<String> = self
            .inner
            .lock_queue()
            .drain(..)
            .map(|r| r.url)
            .collect();
        let mut cancelled = pending.len();
        for url in &pending {
            self.inner.progress.update(url, DownloadProgress::Cancelled);
        }
        for mut task in self.inner.tasks.iter_mut() {
            if task.state == TaskState::Active {
                task.state = TaskState::Cancelled;
                task.token.cancel();
                self.inner
                    .progress
                    .update(task.key(), DownloadProgress::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("已取消全部 {} 个下载请求", cancelled);
        }
    }

    /// 取消所有请求并停止调度循环。之后调度器不再接受新的工作。
    pub fn shutdown(&self) {
        self.cancel_all();
        self.inner.shutdown.cancel();
        debug!("下载调度器已关闭");
    }

    pub fn stats(&self) -> DownloadStats {
        let snapshot = self.inner.progress.snapshot();
        let mut stats = DownloadStats {
            queued: self.inner.lock_queue().len(),
            active: self.inner.active_count(),
            ..Default::default()
        };
        for progress in snapshot.values() {
            match progress {
                DownloadProgress::Completed { .. } => stats.completed += 1,
                DownloadProgress::Failed { .. } => stats.failed += 1,
                DownloadProgress::InProgress { .. } => stats.in_progress += 1,
                DownloadProgress::Queued | DownloadProgress::Cancelled => {}
            }
        }
        stats
    }

    pub fn progress(&self, url: &str) -> Option<DownloadProgress> {
        self.inner.progress.get(url)
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.inner.progress.subscribe()
    }

    pub fn print_report(&self) {
        let stats = self.stats();
        info!(
            "下载报告: Completed={}, Failed={}, Queued={}, Active={}",
            stats.completed, stats.failed, stats.queued, stats.active
        );
        ui::print_sub_header("下载报告");
        println!(
            "{} | {} | 等待中: {}",
            format!("完成: {}", stats.completed).green(),
            format!("失败: {}", stats.failed).red(),
            stats.queued
        );
        let snapshot = self.inner.progress.snapshot();
        let mut failures: Vec<_> = snapshot
            .iter()
            .filter_map(|(url, p)| match p {
                DownloadProgress::Failed { reason } => Some((url, reason)),
                _ => None,
            })
            .collect();
        failures.sort();
        for (url, reason) in failures {
            println!(
                "  {} {}\n      {}",
                *symbols::ERROR,
                crate::utils::truncate_text(url, 60),
                reason.dimmed()
            );
        }
    }

    fn is_pending(&self, url: &str) -> bool {
        self.inner.lock_queue().iter().any(|r| r.url == url)
            || self
                .inner
                .tasks
                .get(url)
                .is_some_and(|t| t.state == TaskState::Active)
    }

    fn ensure_drainer(&self) {
        if self.inner.shutdown.is_cancelled() {
            warn!("下载调度器已关闭，新请求不会被执行");
            return;
        }
        let mut drainer = self.inner.drainer.lock().unwrap_or_else(|e| e.into_inner());
        if drainer.as_ref().is_none_or(|h| h.is_finished()) {
            *drainer = Some(tokio::spawn(task_runner::drain(self.inner.clone())));
        }
    }
}
