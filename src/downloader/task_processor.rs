// src/downloader/task_processor.rs

use super::{Inner, TaskState};
use crate::{constants, error::*, models::*, utils};
use futures::StreamExt;
use indicatif::HumanBytes;
use log::{debug, error, info, warn};
use reqwest::{Method, Response, header};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use url::Url;

/// `TaskProcessor` 封装了处理单个下载请求的所有逻辑：逐跳重定向、流式写盘、校验和重试。
pub(super) struct TaskProcessor {
    inner: Arc<Inner>,
    id: u64,
    token: CancellationToken,
}

impl TaskProcessor {
    pub(super) fn new(inner: Arc<Inner>, id: u64, token: CancellationToken) -> Self {
        Self { inner, id, token }
    }

    /// 执行请求直到成功、重试次数用尽或被取消，并把最终状态写入进度表。
    pub(super) async fn process(&self, request: DownloadRequest) {
        let url = request.url.clone();
        let target = self.inner.cache.cache_file_for(&url);
        let part = part_file_for(&target, self.id);
        let policy = self.inner.config.download_retry_policy();
        self.publish(
            &url,
            DownloadProgress::InProgress {
                percent: 0,
                status: "开始下载".into(),
            },
        );

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = tokio::select! {
                r = self.attempt(&request, &part, &target) => r,
                _ = self.token.cancelled() => Err(AppError::Cancelled),
            };
            match result {
                Ok(()) => break Ok(()),
                Err(AppError::Cancelled) => break Err(AppError::Cancelled),
                Err(e) => {
                    warn!(
                        "下载 '{}' 第 {}/{} 次尝试失败: {}",
                        url, attempt, policy.max_attempts, e
                    );
                    if !policy.should_retry(attempt, &e) {
                        break Err(e);
                    }
                    let delay = policy.delay_for(attempt);
                    self.publish(
                        &url,
                        DownloadProgress::InProgress {
                            percent: 0,
                            status: format!("{:?} 后进行第 {} 次重试", delay, attempt + 1),
                        },
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.token.cancelled() => break Err(AppError::Cancelled),
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!("下载完成: {} -> {}", url, target.display());
                self.publish(&url, DownloadProgress::Completed { local_path: target });
            }
            Err(AppError::Cancelled) => {
                // 被取消的 attempt 没有机会清理自己的临时文件
                self.inner.cache.remove(&part);
                info!("下载已取消: {}", url);
                self.publish(&url, DownloadProgress::Cancelled);
            }
            Err(e) => {
                error!("下载 '{}' 最终失败: {}", url, e);
                self.publish(
                    &url,
                    DownloadProgress::Failed {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    /// 先写入本任务专属的临时文件，校验通过后再改名为缓存文件。
    async fn attempt(
        &self,
        request: &DownloadRequest,
        part: &Path,
        target: &Path,
    ) -> AppResult<()> {
        let response = fetch_following_redirects(
            &self.inner.client,
            Method::GET,
            &request.url,
            self.inner.config.max_redirects,
        )
        .await?;

        let result: AppResult<()> = async {
            self.stream_to_file(response, &request.url, part).await?;
            self.verify(request, part)?;
            tokio::fs::rename(part, target).await?;
            Ok(())
        }
        .await;
        if result.is_err() {
            self.inner.cache.remove(part);
        }
        result
    }

    async fn stream_to_file(&self, response: Response, url: &str, path: &Path) -> AppResult<()> {
        let total = response.content_length().filter(|len| *len > 0);
        let file = tokio::fs::File::create(path).await?;
        let mut writer = BufWriter::with_capacity(constants::download::CHUNK_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        let mut last_published: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if self.token.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            received += chunk.len() as u64;

            if received - last_published >= constants::download::CHUNK_SIZE as u64 {
                last_published = received;
                self.publish(url, progress_for(received, total));
            }
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        self.publish(url, progress_for(received, total));
        debug!("'{}' 写入 {}", url, HumanBytes(received));
        Ok(())
    }

    fn verify(&self, request: &DownloadRequest, path: &Path) -> AppResult<()> {
        if !self.inner.cache.is_valid(path) {
            return Err(AppError::Validation(
                "文件头不是可识别的媒体格式 (unrecognized media header)".into(),
            ));
        }
        if let Some(expected) = &request.expected_hash {
            let actual = utils::calculate_file_md5(path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(AppError::Validation(format!(
                    "MD5不匹配 (预期: {}, 实际: {})",
                    expected, actual
                )));
            }
        }
        Ok(())
    }

    /// 只有当进度表里的这个 URL 仍属于本任务且未被取消时才写入。
    ///
    /// 取消时 `cancel` 已经写入了 `Cancelled`，同一 URL 随后可能重新排队并属于另一个任务。
    /// 写入期间持有任务表的读锁，与 `cancel` 互斥。
    fn publish(&self, url: &str, progress: DownloadProgress) {
        match self.inner.tasks.get(url) {
            Some(task) if task.id == self.id && task.state == TaskState::Active => {
                self.inner.progress.update(url, progress);
            }
            _ => debug!("任务 #{} 已不再负责 '{}'，丢弃状态 {:?}", self.id, url, progress),
        }
    }
}

fn part_file_for(target: &Path, id: u64) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}{}", id, constants::cache::PART_SUFFIX));
    target.with_file_name(name)
}

fn progress_for(received: u64, total: Option<u64>) -> DownloadProgress {
    match total {
        Some(total) => DownloadProgress::InProgress {
            percent: (received.saturating_mul(100) / total).min(100) as u8,
            status: format!("{} / {}", HumanBytes(received), HumanBytes(total)),
        },
        None => DownloadProgress::InProgress {
            percent: 0,
            status: format!("已下载 {}", HumanBytes(received)),
        },
    }
}

/// 手动跟随重定向。最多允许 `max_redirects` 次跳转，再遇到 3xx 即失败。
pub(super) async fn fetch_following_redirects(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    max_redirects: usize,
) -> AppResult<Response> {
    let mut current = Url::parse(url.trim())?;
    for hop in 0..=max_redirects {
        let response = client.request(method.clone(), current.clone()).send().await?;
        let status = response.status();

        if status.is_redirection() {
            if hop == max_redirects {
                return Err(AppError::TooManyRedirects(max_redirects));
            }
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(AppError::MissingLocation)?;
            let next = current.join(location)?;
            debug!("重定向 ({}/{}): {} -> {}", hop + 1, max_redirects, current, next);
            current = next;
            continue;
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: utils::truncate_text(&body, constants::download::ERROR_BODY_MAX_CHARS),
            });
        }
        return Ok(response);
    }
    Err(AppError::TooManyRedirects(max_redirects))
}

/// 用 HEAD 请求探测文件大小。失败时返回 `None`，由调用方使用默认估计值。
pub(super) async fn probe_content_length(
    client: &reqwest::Client,
    url: &str,
    max_redirects: usize,
) -> Option<u64> {
    match fetch_following_redirects(client, Method::HEAD, url, max_redirects).await {
        Ok(response) => response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|len| *len > 0),
        Err(e) => {
            debug!("HEAD 探测 '{}' 失败: {}", url, e);
            None
        }
    }
}
