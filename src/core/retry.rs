//! 重试执行器：指数退避 + 抖动 + 取消
//!
//! 每次尝试前检查取消令牌；失败后若次数未用尽且错误可重试，则按
//! `min(initial * factor^attempt, max)` 计算等待时间，等待本身与取消令牌竞速。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::core::LlmError;

/// 重试判定函数：返回 true 表示该错误可以重试
pub type RetryPredicate = Arc<dyn Fn(&LlmError) -> bool + Send + Sync>;

/// 重试回调：每次决定重试、开始等待之前调用
pub type RetryObserver = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// 一次重试的描述（传给 on_retry 回调）
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 刚失败的是第几次调用（从 1 开始）
    pub attempt: u32,
    pub delay: Duration,
    pub error: LlmError,
}

/// 单次调用的重试参数，调用期间不可变
#[derive(Clone)]
pub struct RetryOptions {
    /// 首次调用之外的最大重试次数（总调用次数 = max_retries + 1）
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub should_retry: Option<RetryPredicate>,
    pub on_retry: Option<RetryObserver>,
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter: true,
            should_retry: None,
            on_retry: None,
            cancel: None,
        }
    }
}

impl RetryOptions {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.should_retry = Some(predicate);
        self
    }

    pub fn with_on_retry(mut self, observer: RetryObserver) -> Self {
        self.on_retry = Some(observer);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_retryable(&self, err: &LlmError) -> bool {
        if err.is_cancelled() {
            return false;
        }
        match &self.should_retry {
            Some(pred) => pred(err),
            None => err.is_retryable(),
        }
    }

    /// attempt 从 0 开始：第 attempt 次失败后的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64).max(0.0);
        let millis = if self.jitter {
            // ±25% 抖动，仍不超过 max_delay
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            (capped * factor).min(self.max_delay.as_millis() as f64)
        } else {
            capped
        };
        Duration::from_millis(millis.round() as u64)
    }
}

/// 执行 operation，按 RetryOptions 重试；取消一旦触发，后续尝试与等待都立即以 Cancelled 失败
pub async fn retry_with_backoff<T, F, Fut>(
    options: &RetryOptions,
    mut operation: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= options.max_retries || !options.is_retryable(&err) {
            return Err(err);
        }

        let mut delay = options.delay_for(attempt);
        if let LlmError::RateLimited {
            retry_after_ms: Some(ms),
            ..
        } = &err
        {
            delay = delay.max(Duration::from_millis(*ms)).min(options.max_delay);
        }

        attempt += 1;
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
        if let Some(observer) = &options.on_retry {
            observer(&RetryAttempt {
                attempt,
                delay,
                error: err.clone(),
            });
        }

        match &options.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions::new(max_retries)
            .with_delays(Duration::from_millis(10), Duration::from_millis(50))
            .with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let retries_cb = retries.clone();
        let options = fast_options(2).with_on_retry(Arc::new(move |_| {
            retries_cb.fetch_add(1, Ordering::SeqCst);
        }));

        let calls_op = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&options, || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Network("down".into()))
            }
        })
        .await;

        assert_eq!(result, Err(LlmError::Network("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let result = retry_with_backoff(&fast_options(3), || {
            let calls = calls_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LlmError::Timeout("slow".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast_options(5), || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::InvalidRequest("bad key".into()))
            }
        })
        .await;
        assert!(matches!(result, Err(LlmError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_rejects() {
        let options = fast_options(5).with_predicate(Arc::new(|_| false));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();
        let _: Result<(), _> = retry_with_backoff(&options, || {
            let calls = calls_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Network("down".into()))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let options = fast_options(3).with_cancel(token);
        let result: Result<&str, _> = retry_with_backoff(&options, || async { Ok("never") }).await;
        assert_eq!(result, Err(LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_during_sleep() {
        let token = CancellationToken::new();
        let options = RetryOptions::new(3)
            .with_delays(Duration::from_secs(60), Duration::from_secs(60))
            .with_jitter(false)
            .with_cancel(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result: Result<(), _> =
            retry_with_backoff(&options, || async { Err(LlmError::Network("down".into())) }).await;
        canceller.await.unwrap();
        assert_eq!(result, Err(LlmError::Cancelled));
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let options = RetryOptions::new(10)
            .with_delays(Duration::from_millis(100), Duration::from_millis(1000))
            .with_backoff_factor(2.0)
            .with_jitter(false);
        assert_eq!(options.delay_for(0), Duration::from_millis(100));
        assert_eq!(options.delay_for(1), Duration::from_millis(200));
        assert_eq!(options.delay_for(3), Duration::from_millis(800));
        assert_eq!(options.delay_for(4), Duration::from_millis(1000));
        assert_eq!(options.delay_for(9), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let options = RetryOptions::new(10)
            .with_delays(Duration::from_millis(400), Duration::from_millis(450))
            .with_jitter(true);
        for _ in 0..50 {
            let d = options.delay_for(0);
            assert!(d >= Duration::from_millis(300));
            assert!(d <= Duration::from_millis(450));
        }
    }
}
