// src/client.rs

use crate::{config::AppConfig, constants, error::*, utils};
use log::debug;
use reqwest::{IntoUrl, Response, redirect};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Serialize, de::DeserializeOwned};

/// 两个 HTTP 客户端：
/// - `client` 用于同步接口，带瞬时错误重试；
/// - `download` 用于媒体下载，不自动跟随重定向，由下载器自行逐跳处理并计数。
#[derive(Clone)]
pub struct RobustClient {
    pub client: ClientWithMiddleware,
    pub download: reqwest::Client,
}

impl RobustClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .user_agent(config.user_agent.clone())
                .connect_timeout(config.connect_timeout)
                .timeout(config.timeout)
                .build()?,
        )
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();

        let download = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(redirect::Policy::none())
            .pool_max_idle_per_host(config.max_concurrent * 2)
            .build()?;

        Ok(Self { client, download })
    }

    pub async fn get<T: IntoUrl>(&self, url: T) -> AppResult<Response> {
        let res = self.client.get(url).send().await?;
        check_status(res).await
    }

    /// POST 一个 JSON 请求体并把响应解析为 `T`。非 2xx 状态返回 `HttpStatus`。
    pub async fn post_json<B, T>(&self, url: url::Url, body: &B) -> AppResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!("POST {}", url);
        let res = self.client.post(url.clone()).json(body).send().await?;
        let text = check_status(res).await?.text().await?;
        serde_json::from_str(&text).map_err(|source| AppError::ApiParseFailed {
            url: url.to_string(),
            source,
        })
    }
}

async fn check_status(res: Response) -> AppResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(AppError::HttpStatus {
        status: status.as_u16(),
        body: utils::truncate_text(&body, constants::download::ERROR_BODY_MAX_CHARS),
    })
}
