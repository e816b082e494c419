// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("网络中间件错误: {0}")]
    NetworkMiddleware(#[from] reqwest_middleware::Error),
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("无法解析来自 '{url}' 的API响应: {source}")]
    ApiParseFailed {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("URL 解析错误: {0}")]
    Url(#[from] url::ParseError),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("Too many redirects (超过 {0} 次重定向)")]
    TooManyRedirects(usize),
    #[error("重定向响应缺少 Location 头 (redirect without Location header)")]
    MissingLocation,
    #[error("文件校验失败 (failed validation): {0}")]
    Validation(String),
    #[error("Insufficient storage space")]
    InsufficientStorage,
    #[error("服务器不再识别此设备 (HTTP {0})")]
    DeviceNotRecognized(u16),
    #[error("任务已取消")]
    Cancelled,
    #[error("配置错误: {0}")]
    Config(String),
    #[error("未知错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 错误分类，决定一个错误是否值得重试以及由哪一层处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 超时、连接重置、域名无法解析
    NetworkTransient,
    /// 非 2xx 状态、重定向过多、缺少 Location、响应无法解析
    Protocol,
    /// 下载内容未通过校验
    Integrity,
    /// 本地存储不足或读写失败
    Resource,
    /// 服务器不再识别设备，需要整机重置
    ProtocolState,
    Cancelled,
    Fatal,
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Network(_) | AppError::NetworkMiddleware(_) => ErrorClass::NetworkTransient,
            AppError::HttpStatus { .. }
            | AppError::TooManyRedirects(_)
            | AppError::MissingLocation
            | AppError::ApiParseFailed { .. }
            | AppError::Json(_) => ErrorClass::Protocol,
            AppError::Validation(_) => ErrorClass::Integrity,
            AppError::InsufficientStorage | AppError::Io(_) => ErrorClass::Resource,
            AppError::DeviceNotRecognized(_) => ErrorClass::ProtocolState,
            AppError::Cancelled => ErrorClass::Cancelled,
            AppError::Url(_) | AppError::Config(_) | AppError::Other(_) => ErrorClass::Fatal,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
