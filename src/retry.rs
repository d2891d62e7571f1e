//! 重试策略执行器
//!
//! 纯计算：根据策略算出下一次投递前的等待时间。
//! 尝试次数从 1 开始计数，传入的是刚刚失败的那一次。
//!
//! - `none`：首次失败即终止
//! - `linear`：delay = initial * attempt
//! - `exponential`：delay = initial * 2^(attempt - 1)，不超过 `max_delay`

use std::time::Duration;

use crate::event_type::{BackoffKind, RetryPolicy};

/// 一次失败尝试之后的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 `delay` 后执行第 `next_attempt` 次尝试
    RetryAfter { delay: Duration, next_attempt: u32 },
    /// 次数已用尽
    Exhausted { attempts: u32 },
}

impl RetryDecision {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryDecision::Exhausted { .. })
    }
}

/// 第 `attempt` 次尝试失败后，按 `policy` 决定下一步
///
/// 没有策略时等同于只尝试一次。
pub fn next_attempt(attempt: u32, policy: Option<&RetryPolicy>) -> RetryDecision {
    let attempt = attempt.max(1);
    let policy = match policy {
        Some(p) => p,
        None => return RetryDecision::Exhausted { attempts: attempt },
    };

    if policy.backoff == BackoffKind::None || attempt >= policy.attempts.max(1) {
        return RetryDecision::Exhausted { attempts: attempt };
    }

    RetryDecision::RetryAfter {
        delay: backoff_delay(attempt, policy),
        next_attempt: attempt + 1,
    }
}

/// 第 `attempt` 次失败后的等待时间
pub fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let attempt = attempt.max(1);
    let initial = policy.initial_delay();

    let delay = match policy.backoff {
        BackoffKind::None => Duration::ZERO,
        BackoffKind::Linear => initial.saturating_mul(attempt),
        BackoffKind::Exponential => {
            let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
            initial.saturating_mul(factor)
        }
    };

    match policy.max_delay() {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}
