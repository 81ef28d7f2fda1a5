//! Inference request orchestrator.
//!
//! Produces one validated [`AiResponse`] from one screenshot plus task text,
//! hiding provider and key flakiness behind pool rotation, bounded retries,
//! and escalating backoff when every credential is failing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pool::{ModelPool, PoolError};
use super::transport::{CompletionTransport, MessageBuilder, TransportError};
use crate::actions::{recover_response, AiResponse, RecoverError, DEFAULT_COORDINATE_SCALE};
use crate::config::get_system_prompt;

/// Default number of trailing history entries included in the prompt.
pub const DEFAULT_HISTORY_CONTEXT_LEN: usize = 8;

/// Delay before retrying after a malformed-JSON response.
const MALFORMED_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Delay before retrying after an action-format violation.
const FORMAT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Backoff waits after rounds 1 and 2 of whole-pool key/quota failure.
const ROUND_BACKOFFS: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];

/// Whole-pool failure rounds tolerated before giving up.
const MAX_FAILURE_ROUNDS: u32 = 3;

/// Inference errors surfaced to the control loop.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Cooperative cancellation; not a failure.
    #[error("Inference request aborted")]
    Aborted,
    /// Terminal: every pool entry failed on keys or quota, repeatedly.
    #[error("All model pool entries exhausted: {0}")]
    PoolExhausted(String),
    #[error("Malformed JSON in model response: {0}")]
    MalformedJson(String),
    #[error("Invalid action format: {0}")]
    ActionFormat(String),
    #[error("No pool entries match target '{0}'")]
    EmptyPool(String),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<PoolError> for InferenceError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::EmptyTarget(target) => InferenceError::EmptyPool(target),
        }
    }
}

/// Inputs for one logical "analyze this screenshot" request.
#[derive(Debug, Clone)]
pub struct InferenceContext {
    /// Base64-encoded PNG of the current screen.
    pub image_base64: String,
    /// Task plus any feedback blocks assembled by the control loop.
    pub prompt: String,
    /// Trailing action history lines, oldest first.
    pub history: Vec<String>,
}

/// Dispatches logical inference requests across the pool.
///
/// One request is in flight at a time; attempts are strictly sequential.
/// Cursors are per-target, so sequential callers sharing one orchestrator get
/// fair rotation, but concurrent runs sharing one instance are not supported.
pub struct Orchestrator {
    pool: ModelPool,
    transport: Arc<dyn CompletionTransport>,
    history_context_len: usize,
    coordinate_scale: u32,
}

impl Orchestrator {
    pub fn new(pool: ModelPool, transport: Arc<dyn CompletionTransport>) -> Self {
        Self {
            pool,
            transport,
            history_context_len: DEFAULT_HISTORY_CONTEXT_LEN,
            coordinate_scale: DEFAULT_COORDINATE_SCALE,
        }
    }

    /// Set how many trailing history entries are sent with each request.
    /// Zero disables history.
    pub fn with_history_context_len(mut self, len: usize) -> Self {
        self.history_context_len = len;
        self
    }

    /// Set the normalized coordinate scale announced in the system prompt.
    pub fn with_coordinate_scale(mut self, scale: u32) -> Self {
        self.coordinate_scale = scale;
        self
    }

    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    /// Dispatch one logical request against a target pool.
    ///
    /// # Arguments
    /// * `ctx` - Screenshot, prompt text, and trailing history.
    /// * `target` - `"all"` or a `providerId::modelId` sub-pool selector.
    /// * `cancel` - Cooperative cancellation token, honored at every
    ///   suspension point.
    pub async fn request(
        &mut self,
        ctx: &InferenceContext,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<AiResponse, InferenceError> {
        let sub_pool_len = self.pool.sub_pool_len(target);
        if sub_pool_len == 0 {
            return Err(InferenceError::EmptyPool(target.to_string()));
        }

        let max_attempts = sub_pool_len.saturating_mul(3).max(6);
        let mut failed_entries: HashSet<Uuid> = HashSet::new();
        let mut failure_rounds: u32 = 0;
        let mut correction_notice: Option<String> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(InferenceError::Aborted);
            }

            let entry = self.pool.next_entry(target)?;
            let messages = self.build_messages(ctx, correction_notice.as_deref());

            let completion = match self.transport.complete(&entry, &messages, cancel).await {
                Ok(text) => text,
                Err(TransportError::Aborted) => return Err(InferenceError::Aborted),
                Err(err) if is_key_or_quota_failure(&err) => {
                    tracing::warn!(
                        entry = %entry.label(),
                        attempt,
                        error = %err,
                        "key/quota failure, rotating pool entry"
                    );
                    failed_entries.insert(entry.entry_id);
                    if failed_entries.len() >= sub_pool_len {
                        failure_rounds += 1;
                        if failure_rounds >= MAX_FAILURE_ROUNDS {
                            return Err(InferenceError::PoolExhausted(format!(
                                "every configured API key or quota failed {} times in a row; \
                                 check your provider credentials, billing status, and rate \
                                 limits (last error: {})",
                                MAX_FAILURE_ROUNDS, err
                            )));
                        }
                        let backoff = ROUND_BACKOFFS[(failure_rounds - 1) as usize];
                        tracing::warn!(
                            round = failure_rounds,
                            backoff_secs = backoff.as_secs(),
                            "whole pool failed this round, backing off"
                        );
                        sleep_cancellable(backoff, cancel).await?;
                        failed_entries.clear();
                    }
                    continue;
                }
                // Not retried: propagates verbatim as a typed failure.
                Err(err) => return Err(InferenceError::Transport(err)),
            };

            match recover_response(&completion) {
                Ok(response) => return Ok(response),
                Err(RecoverError::MalformedJson(msg)) => {
                    tracing::warn!(entry = %entry.label(), attempt, "malformed response: {}", msg);
                    if attempt == max_attempts {
                        return Err(InferenceError::MalformedJson(msg));
                    }
                    sleep_cancellable(MALFORMED_RETRY_DELAY, cancel).await?;
                }
                Err(RecoverError::ActionFormat(err)) => {
                    tracing::warn!(entry = %entry.label(), attempt, "action format error: {}", err);
                    if attempt == max_attempts {
                        return Err(InferenceError::ActionFormat(err.to_string()));
                    }
                    correction_notice = Some(format!(
                        "Your previous answer was invalid: {}. Reply again with a single \
                         valid JSON object in the required format.",
                        err
                    ));
                    sleep_cancellable(FORMAT_RETRY_DELAY, cancel).await?;
                }
            }
        }

        Err(InferenceError::MalformedJson(format!(
            "no usable response after {} attempts",
            max_attempts
        )))
    }

    /// Assemble the message array for one attempt.
    fn build_messages(&self, ctx: &InferenceContext, correction: Option<&str>) -> Vec<Value> {
        let mut text = ctx.prompt.clone();

        if self.history_context_len > 0 && !ctx.history.is_empty() {
            let start = ctx.history.len().saturating_sub(self.history_context_len);
            let recent = &ctx.history[start..];
            text.push_str("\n\nRecent actions:\n");
            text.push_str(&recent.join("\n"));
        }

        if let Some(notice) = correction {
            text.push_str("\n\n");
            text.push_str(notice);
        }

        vec![
            MessageBuilder::system(&get_system_prompt(self.coordinate_scale)),
            MessageBuilder::user(&text, Some(&ctx.image_base64)),
        ]
    }
}

/// Classify a transport failure as a key/quota problem worth rotating past.
///
/// HTTP status carries the signal when available; the string patterns are the
/// fallback for errors originating outside this crate's control.
fn is_key_or_quota_failure(error: &TransportError) -> bool {
    if let TransportError::Api { status, .. } = error {
        if matches!(status, 401 | 402 | 403 | 429) {
            return true;
        }
    }
    let description = error.to_string().to_lowercase();
    const PATTERNS: &[&str] = &[
        "unauthorized",
        "api key",
        "invalid key",
        "authentication",
        "quota",
        "billing",
        "insufficient",
        "rate limit",
        "too many requests",
        "credit",
        "401",
        "403",
        "429",
    ];
    PATTERNS.iter().any(|p| description.contains(p))
}

async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), InferenceError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(InferenceError::Aborted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::config::{ProviderConfig, ProviderModel};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn pool_with_keys(keys: &[&str]) -> ModelPool {
        let provider = ProviderConfig {
            id: "p".to_string(),
            name: "p".to_string(),
            base_url: "https://p.example/v1".to_string(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            models: vec![ProviderModel {
                id: "m".to_string(),
                enabled: true,
            }],
        };
        ModelPool::from_providers(&[provider], None)
    }

    fn ctx() -> InferenceContext {
        InferenceContext {
            image_base64: "aGVsbG8=".to_string(),
            prompt: "open the settings app".to_string(),
            history: Vec::new(),
        }
    }

    /// Transport that replays a fixed script of results and records the text
    /// content of each user message it is asked to send.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<String, TransportError>>>,
        prompts: Mutex<Vec<String>>,
        attempts: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                prompts: Mutex::new(Vec::new()),
                attempts: Mutex::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }

        fn auth_error() -> TransportError {
            TransportError::Api {
                status: 401,
                body: "Incorrect API key provided".to_string(),
            }
        }
    }

    #[async_trait]
    impl CompletionTransport for ScriptedTransport {
        async fn complete(
            &self,
            _entry: &ModelPoolEntry,
            messages: &[Value],
            _cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            *self.attempts.lock().unwrap() += 1;
            if let Some(text) = messages
                .iter()
                .find(|m| m["role"] == "user")
                .and_then(|m| m["content"].as_array())
                .and_then(|parts| parts.iter().find(|p| p["type"] == "text"))
                .and_then(|p| p["text"].as_str())
            {
                self.prompts.lock().unwrap().push(text.to_string());
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Err(Self::auth_error())
            } else {
                script.remove(0)
            }
        }
    }

    use crate::model::ModelPoolEntry;

    const GOOD: &str = r#"{"thought":"t","action":{"action":"click","x":1,"y":2}}"#;

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let transport = ScriptedTransport::new(vec![Ok(GOOD.to_string())]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport.clone());
        let resp = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.action, Action::Click { x: 1.0, y: 2.0 });
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_past_failing_key() {
        let transport = ScriptedTransport::new(vec![
            Err(ScriptedTransport::auth_error()),
            Ok(GOOD.to_string()),
        ]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1", "k2"]), transport.clone());
        let resp = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.action.kind(), "click");
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_exhaustion_after_three_rounds() {
        // Every attempt fails with a 401; two entries means six attempts
        // across three failure rounds.
        let transport = ScriptedTransport::new(Vec::new());
        let mut orch = Orchestrator::new(pool_with_keys(&["k1", "k2"]), transport.clone());
        let err = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            InferenceError::PoolExhausted(msg) => {
                assert!(msg.contains("key") || msg.contains("quota"), "msg: {}", msg);
            }
            other => panic!("expected PoolExhausted, got {:?}", other),
        }
        assert_eq!(transport.attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_retries_then_surfaces() {
        let transport = ScriptedTransport::new(vec![
            Ok("no json here at all".to_string()),
            Ok(GOOD.to_string()),
        ]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport.clone());
        let resp = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.action.kind(), "click");
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_format_error_appends_correction_notice() {
        let transport = ScriptedTransport::new(vec![
            Ok(r#"{"action":{"action":"click","x":5}}"#.to_string()),
            Ok(GOOD.to_string()),
        ]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport.clone());
        orch.request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap();

        let prompts = transport.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("previous answer was invalid"));
        assert!(prompts[1].contains("previous answer was invalid"));
        assert!(prompts[1].contains("'y'"), "notice should name the field: {}", prompts[1]);
    }

    #[tokio::test]
    async fn test_empty_sub_pool_is_hard_error() {
        let transport = ScriptedTransport::new(Vec::new());
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport);
        let err = orch
            .request(&ctx(), "p::missing-model", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::EmptyPool(_)));
    }

    #[tokio::test]
    async fn test_abort_bypasses_retries() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Aborted)]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1", "k2"]), transport.clone());
        let err = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Aborted));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_unclassified_error_propagates_immediately() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Api {
            status: 500,
            body: "internal server error".to_string(),
        })]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1", "k2"]), transport.clone());
        let err = orch
            .request(&ctx(), "all", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Transport(_)));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_history_trimmed_to_context_len() {
        let transport = ScriptedTransport::new(vec![Ok(GOOD.to_string())]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport.clone())
            .with_history_context_len(2);
        let mut context = ctx();
        context.history = vec![
            "1. click:1,1 -> ok".to_string(),
            "2. click:2,2 -> ok".to_string(),
            "3. click:3,3 -> ok".to_string(),
        ];
        orch.request(&context, "all", &CancellationToken::new())
            .await
            .unwrap();

        let prompts = transport.prompts.lock().unwrap();
        assert!(!prompts[0].contains("click:1,1"));
        assert!(prompts[0].contains("click:2,2"));
        assert!(prompts[0].contains("click:3,3"));
    }

    #[tokio::test]
    async fn test_history_disabled_when_zero() {
        let transport = ScriptedTransport::new(vec![Ok(GOOD.to_string())]);
        let mut orch = Orchestrator::new(pool_with_keys(&["k1"]), transport.clone())
            .with_history_context_len(0);
        let mut context = ctx();
        context.history = vec!["1. click:1,1 -> ok".to_string()];
        orch.request(&context, "all", &CancellationToken::new())
            .await
            .unwrap();

        let prompts = transport.prompts.lock().unwrap();
        assert!(!prompts[0].contains("Recent actions"));
    }
}
