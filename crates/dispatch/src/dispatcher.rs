//! Ladder walk: reserve a key, call upstream, back off, repeat

use std::sync::Arc;
use std::time::Duration;

use common::ApiKey;
use completion::{Completion, CompletionError, CompletionRequest};
use key_pool::{KeyPool, Tier};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::ladder::RetryLadder;

/// Timing knobs for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Pause after a failed attempt, skipped after the last one.
    pub retry_backoff: Duration,
    /// Timeout handed to every upstream call.
    pub call_timeout: Duration,
    /// Bound on each key acquisition. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(1),
            call_timeout: Duration::from_secs(600),
            acquire_timeout: None,
        }
    }
}

/// Turns a prompt into text by walking the retry ladder.
pub struct Dispatcher {
    pool: Arc<KeyPool>,
    backend: Arc<dyn Completion>,
    ladder: RetryLadder,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<KeyPool>,
        backend: Arc<dyn Completion>,
        ladder: RetryLadder,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            pool,
            backend,
            ladder,
            settings,
        }
    }

    /// Maximum number of upstream calls per prompt.
    pub fn max_attempts(&self) -> usize {
        self.ladder.len()
    }

    /// Generate a response for `prompt`.
    ///
    /// Attempts run strictly in ladder order; the first success wins. Each
    /// attempt consumes a reservation on the key it was given even if the
    /// upstream call fails.
    pub async fn respond(&self, prompt: &str) -> Result<String, DispatchError> {
        let attempts = self.ladder.len();
        let mut last_failure: Option<CompletionError> = None;

        for (i, rung) in self.ladder.iter().enumerate() {
            let attempt = i + 1;
            let key = self.acquire(rung.tier).await?;

            info!(
                attempt,
                max_attempts = attempts,
                key = %key,
                tier = %rung.tier,
                model = %rung.model,
                temperature = rung.temperature,
                "calling {}",
                self.backend.id()
            );

            let request = CompletionRequest {
                model: &rung.model,
                api_key: &key,
                prompt,
                temperature: rung.temperature,
                timeout: self.settings.call_timeout,
            };

            match self.backend.complete(request).await {
                Ok(text) => {
                    metrics::counter!(
                        "dispatch_attempts_total",
                        "tier" => rung.tier.as_str(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    info!(attempt, model = %rung.model, "completion succeeded");
                    return Ok(text);
                }
                Err(e) => {
                    metrics::counter!(
                        "dispatch_attempts_total",
                        "tier" => rung.tier.as_str(),
                        "outcome" => "failure"
                    )
                    .increment(1);
                    warn!(attempt, key = %key, model = %rung.model, error = %e, "completion attempt failed");
                    last_failure = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }

        let detail = last_failure.map(|e| e.to_string()).unwrap_or_default();
        error!(attempts, detail = %detail, "all completion attempts failed");
        Err(DispatchError::AttemptsExhausted { attempts, detail })
    }

    async fn acquire(&self, tier: Tier) -> Result<ApiKey, DispatchError> {
        match self.settings.acquire_timeout {
            None => Ok(self.pool.acquire(tier).await),
            Some(limit) => Ok(self.pool.acquire_before(tier, Instant::now() + limit).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_pool::{PoolSettings, QuotaLimits, TierLimits, TierUsage};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Call {
        model: String,
        key: String,
        temperature: f32,
        timeout: Duration,
    }

    /// Backend that replays a fixed script of outcomes and records calls.
    struct ScriptedBackend {
        script: Mutex<VecDeque<completion::Result<String>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<completion::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Completion for ScriptedBackend {
        fn id(&self) -> &str {
            "scripted"
        }

        fn complete<'a>(
            &'a self,
            request: CompletionRequest<'a>,
        ) -> Pin<Box<dyn Future<Output = completion::Result<String>> + Send + 'a>> {
            self.calls.lock().unwrap().push(Call {
                model: request.model.to_string(),
                key: request.api_key.expose().to_string(),
                temperature: request.temperature,
                timeout: request.timeout,
            });
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".into())));
            Box::pin(async move { outcome })
        }
    }

    fn rate_limited() -> completion::Result<String> {
        Err(CompletionError::Upstream {
            status: 429,
            message: "Resource has been exhausted".into(),
        })
    }

    fn pool_with(ids: &[&str], settings: PoolSettings) -> Arc<KeyPool> {
        let keys = ids.iter().map(|id| ApiKey::new(*id)).collect();
        Arc::new(KeyPool::new(keys, settings).unwrap())
    }

    fn dispatcher(pool: Arc<KeyPool>, backend: Arc<ScriptedBackend>, settings: DispatchSettings) -> Dispatcher {
        Dispatcher::new(pool, backend, RetryLadder::default(), settings)
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_second_attempt_stops_the_ladder() {
        let backend = ScriptedBackend::new(vec![rate_limited(), Ok("hello".into()), Ok("unused".into())]);
        let pool = pool_with(&["key-a", "key-b"], PoolSettings::default());
        let d = dispatcher(pool, backend.clone(), DispatchSettings::default());

        let text = d.respond("Say hello").await.unwrap();
        assert_eq!(text, "hello");

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model, "gemini-1.5-pro-latest");
        assert_eq!(calls[0].temperature, 1.0);
        assert_eq!(calls[1].model, "gemini-1.5-pro-latest");
        assert_eq!(calls[1].temperature, 0.5);
        assert_eq!(calls[0].key, "key-a");
        assert_eq!(calls[1].key, "key-b");
        assert!(calls.iter().all(|c| c.timeout == Duration::from_secs(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count_and_last_failure() {
        let backend = ScriptedBackend::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            Err(CompletionError::Blocked("SAFETY".into())),
        ]);
        let pool = pool_with(&["key-a"], PoolSettings::default());
        let d = dispatcher(pool, backend.clone(), DispatchSettings::default());

        let start = Instant::now();
        let err = d.respond("Say hello").await.unwrap_err();
        assert_eq!(err.to_string(), "Error after 4 attempts: response blocked: SAFETY");
        assert!(matches!(err, DispatchError::AttemptsExhausted { attempts: 4, .. }));

        // Backoff between attempts only, never after the last one.
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        let models: Vec<_> = backend.calls().into_iter().map(|c| c.model).collect();
        assert_eq!(
            models,
            vec![
                "gemini-1.5-pro-latest",
                "gemini-1.5-pro-latest",
                "gemini-1.5-flash",
                "gemini-1.5-flash"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_still_consume_reservations() {
        let backend = ScriptedBackend::new(vec![]);
        let pool = pool_with(&["key-a"], PoolSettings::default());
        let d = dispatcher(pool.clone(), backend, DispatchSettings::default());

        d.respond("Say hello").await.unwrap_err();

        let report = pool.usage_report().await;
        assert_eq!(report[0].pro, TierUsage { short: 2, daily: 2 });
        assert_eq!(report[0].flash, TierUsage { short: 2, daily: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pro_tier_waits_for_window_reset() {
        let backend = ScriptedBackend::new(vec![Ok("late".into())]);
        let pool = pool_with(&["key-a"], PoolSettings::default());
        pool.acquire(Tier::Pro).await;
        pool.acquire(Tier::Pro).await;

        let d = dispatcher(pool, backend.clone(), DispatchSettings::default());
        let start = Instant::now();
        let text = d.respond("Say hello").await.unwrap();

        assert_eq!(text, "late");
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_deadline_surfaces_as_timeout() {
        let settings = PoolSettings {
            limits: QuotaLimits {
                pro: TierLimits { short: 2, daily: 1 },
                ..QuotaLimits::default()
            },
            ..PoolSettings::default()
        };
        let pool = pool_with(&["key-a"], settings);
        pool.acquire(Tier::Pro).await;

        let backend = ScriptedBackend::new(vec![Ok("unused".into())]);
        let d = dispatcher(
            pool,
            backend.clone(),
            DispatchSettings {
                acquire_timeout: Some(Duration::from_secs(5)),
                ..DispatchSettings::default()
            },
        );

        let err = d.respond("Say hello").await.unwrap_err();
        assert!(matches!(err, DispatchError::AcquireTimeout { tier: Tier::Pro, .. }), "got: {err}");
        assert!(err.to_string().starts_with("no pro key became available"), "got: {err}");
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_ladder_drives_tier_model_and_temperature() {
        let ladder = RetryLadder::split([("gemini-2.0-flash", 0.2)], 0).unwrap();
        let backend = ScriptedBackend::new(vec![Ok("ok".into())]);
        let pool = pool_with(&["key-a"], PoolSettings::default());
        let d = Dispatcher::new(
            pool.clone(),
            backend.clone(),
            ladder,
            DispatchSettings {
                call_timeout: Duration::from_secs(30),
                ..DispatchSettings::default()
            },
        );
        assert_eq!(d.max_attempts(), 1);

        d.respond("Say hello").await.unwrap();

        let calls = backend.calls();
        assert_eq!(calls[0].model, "gemini-2.0-flash");
        assert_eq!(calls[0].temperature, 0.2);
        assert_eq!(calls[0].timeout, Duration::from_secs(30));
        let report = pool.usage_report().await;
        assert_eq!(report[0].flash.daily, 1);
        assert_eq!(report[0].pro.daily, 0);
    }
}
