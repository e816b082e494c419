// src/sync/mod.rs

pub mod context;
mod cycle;
pub mod ports;

pub use context::SyncContext;
pub use ports::{AlwaysOnline, CycleProgress, NetworkMonitor, PlaybackSink, TcpProbe};

use crate::{
    client::RobustClient,
    config::AppConfig,
    downloader::DownloadOrchestrator,
    error::{AppError, AppResult},
    models::{
        Orientation, Playlist, SyncState,
        api::{DeviceInfo, RemoteStatus, SyncRequest, SyncResponse},
    },
    storage::StorageCache,
};
use log::{debug, error, info, warn};
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// 一次同步响应所引起的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    ShowPairing,
    Waiting,
    /// 内容与已应用的相同，播放不受影响
    Unchanged,
    /// 内容相同但当前没有在播放（例如刚重启），直接交付本地缓存
    Resumed,
    CycleStarted { forced: bool },
    UpdateInProgress,
    Reset,
}

struct ControllerInner {
    config: Arc<AppConfig>,
    context: SyncContext,
    client: Arc<RobustClient>,
    orchestrator: DownloadOrchestrator,
    playback: Arc<dyn PlaybackSink>,
    network: Arc<dyn NetworkMonitor>,
    device_info: DeviceInfo,
    state: watch::Sender<SyncState>,
    update_running: AtomicBool,
    epoch: AtomicU64,
    current: Mutex<Option<Playlist>>,
    orientation: Mutex<Option<(Orientation, i32)>>,
    cycle: Mutex<Option<JoinHandle<()>>>,
}

/// 在进入作用域时占用“更新进行中”标记，离开作用域（包括 panic）时释放。
struct UpdateGuard {
    inner: Arc<ControllerInner>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        self.inner.update_running.store(false, Ordering::Release);
    }
}

/// 播放列表同步状态机：轮询服务器、决定何时下载、何时把本地播放列表交给播放端。
#[derive(Clone)]
pub struct PlaylistSyncController {
    inner: Arc<ControllerInner>,
}

impl PlaylistSyncController {
    pub fn new(
        config: Arc<AppConfig>,
        context: SyncContext,
        client: Arc<RobustClient>,
        orchestrator: DownloadOrchestrator,
        playback: Arc<dyn PlaybackSink>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        let initial = if context.is_paired() {
            SyncState::PairedWaiting
        } else {
            SyncState::Unpaired
        };
        let (state, _rx) = watch::channel(initial);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                context,
                client,
                orchestrator,
                playback,
                network,
                device_info: DeviceInfo::current(),
                state,
                update_running: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                current: Mutex::new(None),
                orientation: Mutex::new(None),
                cycle: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn is_update_running(&self) -> bool {
        self.inner.update_running.load(Ordering::Acquire)
    }

    /// 当前交给播放端的本地播放列表。
    pub fn current_playlist(&self) -> Option<Playlist> {
        self.lock_current().clone()
    }

    /// 轮询循环，直到 `cancel` 被触发。已经开始的下载周期不会因此中止。
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.inner.config.poll_interval;
        let backoff = self.inner.config.sync_backoff_policy();
        let mut failures: u32 = 0;
        let mut reannounce = false;
        info!("同步循环启动，轮询间隔 {:?}", interval);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let wait = if !self.inner.network.is_connected().await {
                info!("网络不可用，{:?} 后重试", interval);
                interval
            } else {
                match self.poll_once().await {
                    // 重置后立即用新配对码重新报到一次
                    Ok(SyncDecision::Reset) if !reannounce => {
                        failures = 0;
                        reannounce = true;
                        continue;
                    }
                    Ok(decision) => {
                        debug!("本轮同步结果: {:?}", decision);
                        failures = 0;
                        reannounce = false;
                        interval
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        reannounce = false;
                        let delay = backoff.delay_for(failures).max(interval);
                        warn!("同步请求失败 (连续 {} 次): {}，{:?} 后重试", failures, e, delay);
                        delay
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("同步循环已停止");
    }

    /// 向服务器报到一次并处理响应。
    pub async fn poll_once(&self) -> AppResult<SyncDecision> {
        let request = self.build_request()?;
        let url = self.inner.config.sync_url()?;
        match self.fetch(url, &request).await {
            Ok(response) => {
                debug!("服务器状态: {:?}", response.status);
                self.handle_response(response)
            }
            Err(AppError::DeviceNotRecognized(status)) => {
                warn!("服务器返回 {}，设备已不被识别，执行整机重置", status);
                self.reset_device()?;
                Ok(SyncDecision::Reset)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch(&self, url: url::Url, request: &SyncRequest) -> AppResult<SyncResponse> {
        match self.inner.client.post_json(url, request).await {
            Err(AppError::HttpStatus { status, .. }) if status == 404 || status == 410 => {
                Err(AppError::DeviceNotRecognized(status))
            }
            other => other,
        }
    }

    fn build_request(&self) -> AppResult<SyncRequest> {
        let pairing_code = if self.inner.context.is_paired() {
            None
        } else {
            Some(self.inner.context.ensure_pairing_code()?)
        };
        Ok(SyncRequest {
            device_id: self.inner.context.device_id()?,
            pairing_code,
            device_info: self.inner.device_info.clone(),
        })
    }

    /// 根据一次同步响应推进状态机。
    pub fn handle_response(&self, response: SyncResponse) -> AppResult<SyncDecision> {
        match response.status {
            RemoteStatus::Unpaired => self.on_unpaired(),
            RemoteStatus::PairedWaiting => self.on_paired_waiting(),
            RemoteStatus::Playing => match response.playlist {
                Some(mut playlist) => {
                    if let Some(rotation) = response.rotation {
                        playlist.rotation_degrees = rotation;
                    }
                    self.on_playing(playlist)
                }
                None => {
                    info!("服务器状态为 playing，但没有下发播放列表");
                    self.on_paired_waiting()
                }
            },
        }
    }

    fn on_unpaired(&self) -> AppResult<SyncDecision> {
        if self.inner.context.is_paired() {
            warn!("本地记录为已配对，但服务器报告未配对");
            self.reset_device()?;
            return Ok(SyncDecision::Reset);
        }
        let code = self.inner.context.ensure_pairing_code()?;
        self.stop_playback();
        self.set_state(SyncState::Unpaired);
        self.inner.playback.show_pairing_code(&code);
        Ok(SyncDecision::ShowPairing)
    }

    fn on_paired_waiting(&self) -> AppResult<SyncDecision> {
        self.mark_paired()?;
        self.invalidate_cycle();
        self.stop_playback();
        self.inner.context.clear_applied_playlist()?;
        self.inner.orchestrator.cache().clear_all();
        if self.state() != SyncState::PairedWaiting {
            info!("设备已配对，等待分配播放列表");
            self.set_state(SyncState::PairedWaiting);
            self.inner.playback.show_waiting();
        }
        Ok(SyncDecision::Waiting)
    }

    fn on_playing(&self, playlist: Playlist) -> AppResult<SyncDecision> {
        self.mark_paired()?;
        self.apply_orientation(&playlist);

        let playlist = playlist.resolved(&self.inner.config.media_base_url);
        if playlist.is_empty() {
            info!("下发的播放列表为空");
            return self.on_paired_waiting();
        }
        if self.is_update_running() {
            debug!("已有同步周期在进行，忽略本次响应");
            return Ok(SyncDecision::UpdateInProgress);
        }

        let unchanged = self
            .inner
            .context
            .applied_playlist()
            .is_some_and(|applied| applied.content_eq(&playlist));
        if unchanged {
            let local = self.build_local_playlist(&playlist);
            if local.is_empty() {
                warn!("播放列表未变化，但本地没有可用文件，强制重新下载");
                return Ok(self.start_cycle(playlist, true));
            }
            if self.lock_current().is_none() {
                info!("播放列表未变化，从本地缓存恢复播放");
                self.hand_off(local);
                return Ok(SyncDecision::Resumed);
            }
            return Ok(SyncDecision::Unchanged);
        }

        info!("播放列表已变化 ({} 个条目)，开始同步", playlist.items.len());
        Ok(self.start_cycle(playlist, false))
    }

    /// 整机重置：取消下载、清空缓存、忘记已应用的播放列表并生成新的配对码。
    pub fn reset_device(&self) -> AppResult<()> {
        warn!("执行整机重置");
        self.invalidate_cycle();
        self.stop_playback();
        self.inner.orchestrator.cache().clear_all();
        self.inner.context.clear_applied_playlist()?;
        self.inner.context.set_paired(false)?;
        let code = self.inner.context.regenerate_pairing_code()?;
        *self.lock_orientation() = None;
        self.set_state(SyncState::Unpaired);
        self.inner.playback.show_pairing_code(&code);
        Ok(())
    }

    /// 等待当前的同步周期（如果有）结束。
    pub async fn wait_for_cycle(&self) {
        let handle = self
            .inner
            .cycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!("同步周期任务异常结束: {}", e);
        }
    }

    fn start_cycle(&self, playlist: Playlist, forced: bool) -> SyncDecision {
        if self
            .inner
            .update_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SyncDecision::UpdateInProgress;
        }
        let guard = UpdateGuard {
            inner: self.inner.clone(),
        };
        let epoch = self.epoch();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_cycle(playlist, epoch).await;
        });
        *self.inner.cycle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        SyncDecision::CycleStarted { forced }
    }

    fn mark_paired(&self) -> AppResult<()> {
        self.inner.context.set_paired(true)?;
        if self.inner.context.pairing_code().is_some() {
            self.inner.context.clear_pairing_code()?;
        }
        Ok(())
    }

    /// 让正在进行的周期失效：它的结果会被丢弃，它的下载会被取消。
    fn invalidate_cycle(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.is_update_running() {
            info!("正在进行的同步周期已失效 (纪元 {})", epoch);
        }
        self.inner.orchestrator.cancel_all();
    }

    fn apply_orientation(&self, playlist: &Playlist) {
        let wanted = (playlist.orientation, playlist.rotation_degrees);
        let mut current = self.lock_orientation();
        if *current != Some(wanted) {
            info!("屏幕方向变更: {:?}, 旋转 {}°", wanted.0, wanted.1);
            self.inner.playback.apply_orientation(wanted.0, wanted.1);
            *current = Some(wanted);
        }
    }

    fn stop_playback(&self) {
        if self.lock_current().take().is_some() {
            info!("停止播放");
            self.inner.playback.stop();
        }
    }

    fn hand_off(&self, local: Playlist) {
        info!("交付播放列表: {} 个条目", local.items.len());
        self.inner.playback.play(&local);
        *self.lock_current() = Some(local);
        self.set_state(SyncState::Playing);
    }

    fn set_state(&self, state: SyncState) {
        self.inner.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("同步状态: {} -> {}", current, state);
            *current = state;
            true
        });
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    fn cache(&self) -> &Arc<StorageCache> {
        self.inner.orchestrator.cache()
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Playlist>> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_orientation(&self) -> MutexGuard<'_, Option<(Orientation, i32)>> {
        self.inner
            .orientation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
