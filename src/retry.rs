// src/retry.rs

use crate::error::{AppError, ErrorClass};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 第 n 次失败后等待 `step * n`
    Linear { step: Duration },
    /// 第 n 次失败后等待 `base * 2^(n-1)`，不超过 `cap`
    Exponential { base: Duration, cap: Duration },
}

/// 重试策略：只负责计算等待时间和判断是否继续，不执行任何 I/O。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(step: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step },
        }
    }

    pub fn exponential(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
        }
    }

    /// `attempt` 从 1 开始计数，表示刚刚失败的是第几次尝试。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }

    /// 第 `attempt` 次尝试以 `error` 失败后，是否还应再试一次。
    pub fn should_retry(&self, attempt: u32, error: &AppError) -> bool {
        attempt < self.max_attempts && is_retryable(error)
    }
}

pub fn is_retryable(error: &AppError) -> bool {
    matches!(
        error.class(),
        ErrorClass::NetworkTransient | ErrorClass::Protocol | ErrorClass::Integrity
    )
}
