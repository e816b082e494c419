// src/downloader/task_runner.rs

use super::{ActiveTask, Inner, TaskState, task_processor::TaskProcessor};
use log::{debug, trace};
use std::sync::{Arc, atomic::Ordering};

/// 队列调度循环：有新请求、有任务结束或定时器到期时，按优先级启动等待中的请求，
/// 同时保持活跃任务数不超过上限。直到关闭信号到来才退出。
pub(super) async fn drain(inner: Arc<Inner>) {
    debug!("下载调度循环启动，最大并发 {}", inner.config.max_concurrent);
    loop {
        start_ready_tasks(&inner);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wakeup.notified() => {}
            _ = tokio::time::sleep(inner.config.drain_interval) => {}
        }
    }
    debug!("下载调度循环退出");
}

fn start_ready_tasks(inner: &Arc<Inner>) {
    loop {
        let running = inner.active_count();
        if running >= inner.config.max_concurrent {
            trace!("活跃任务已满 ({})，等待空位", running);
            return;
        }
        let Some(request) = inner.lock_queue().pop_front() else {
            return;
        };

        let id = inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let token = inner.shutdown.child_token();
        inner.tasks.insert(
            request.url.clone(),
            ActiveTask {
                id,
                state: TaskState::Active,
                token: token.clone(),
            },
        );
        debug!("启动下载任务 #{}: {}", id, request.url);

        let inner = inner.clone();
        tokio::spawn(async move {
            let url = request.url.clone();
            TaskProcessor::new(inner.clone(), id, token).process(request).await;
            // 同一 URL 可能已被取消后重新排队，只更新属于自己的记录
            if let Some(mut task) = inner.tasks.get_mut(&url)
                && task.id == id
            {
                task.state = TaskState::Done;
            }
            inner.wakeup.notify_one();
        });
    }
}
