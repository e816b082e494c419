// src/downloader/progress.rs

use crate::models::DownloadProgress;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

pub type ProgressSnapshot = Arc<HashMap<String, DownloadProgress>>;

/// URL -> 下载状态的可观察表。
///
/// 每次变化都会向订阅者广播一份完整快照。同一个请求的生命周期内，状态只能向前推进；
/// 进入终态后只有 [`ProgressTable::begin`]（也就是一个新的请求）才能把它重置。
#[derive(Clone)]
pub struct ProgressTable {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
}

impl Default for ProgressTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTable {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(HashMap::new()));
        Self { tx: Arc::new(tx) }
    }

    /// 开始一个新的请求生命周期，无条件覆盖该 URL 之前的状态。
    pub fn begin(&self, url: &str, state: DownloadProgress) {
        self.tx.send_modify(|snapshot| {
            Arc::make_mut(snapshot).insert(url.to_string(), state);
        });
    }

    /// 推进当前生命周期的状态。违反单调性的更新会被忽略并返回 `false`。
    pub fn update(&self, url: &str, next: DownloadProgress) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|snapshot| {
            if snapshot
                .get(url)
                .is_some_and(|current| !current.can_transition_to(&next))
            {
                return false;
            }
            Arc::make_mut(snapshot).insert(url.to_string(), next);
            applied = true;
            true
        });
        applied
    }

    pub fn get(&self, url: &str) -> Option<DownloadProgress> {
        self.tx.borrow().get(url).cloned()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }
}
