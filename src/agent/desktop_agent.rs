//! Desktop agent control loop.
//!
//! One run per task: capture, infer, validate, execute, wait, repeated until
//! the model declares completion or a bound is hit. The loop also owns
//! repeated-action detection, shell feedback, and session working-directory
//! tracking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::loop_detect::LoopDetector;
use super::traits::{
    ActionDriver, CaptureService, CoordinateMapper, LinearMapper, PhysicalAction, ScreenSize,
};
use crate::actions::{Action, DEFAULT_COORDINATE_SCALE};
use crate::model::{InferenceContext, InferenceError, Orchestrator};
use crate::shell::{normalize_path, CommandGate, ShellRequest, ShellResult};

/// Delay before the next iteration after a non-terminal inference error.
const INFERENCE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Terminal outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Stopped,
    MaxIterations,
    Error,
}

/// Report returned by [`DesktopAgent::run`]. Partial progress is always
/// reported alongside failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: u32,
}

impl RunReport {
    fn new(status: RunStatus, iterations: u32) -> Self {
        Self {
            status,
            error: None,
            iterations,
        }
    }

    fn error(message: impl Into<String>, iterations: u32) -> Self {
        Self {
            status: RunStatus::Error,
            error: Some(message.into()),
            iterations,
        }
    }
}

/// Callback type invoked around screenshot acquisition.
pub type CaptureHook = Box<dyn Fn() + Send + Sync>;

/// Optional hooks fired on every iteration.
#[derive(Default)]
pub struct RunHooks {
    pub before_capture: Option<CaptureHook>,
    pub after_capture: Option<CaptureHook>,
}

/// Agent behavior knobs.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Maximum iterations before the run ends as `MaxIterations`.
    pub max_iterations: u32,
    /// Fixed pacing delay after every iteration, in milliseconds.
    pub iteration_delay_ms: u64,
    /// Pool target: `"all"` or `providerId::modelId`.
    pub target: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            iteration_delay_ms: 1500,
            target: crate::model::TARGET_ALL.to_string(),
        }
    }
}

impl AgentOptions {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_iteration_delay_ms(mut self, delay_ms: u64) -> Self {
        self.iteration_delay_ms = delay_ms;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

/// Handle for requesting a stop from outside the run. Cloneable and
/// idempotent; cancels the current run's token and aborts any in-flight
/// completion request.
#[derive(Clone)]
pub struct StopHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.current
            .lock()
            .expect("cancellation slot lock poisoned")
            .cancel();
    }
}

/// AI-powered agent driving a desktop from screenshots.
///
/// At most one run is active per instance; the loop is strictly sequential
/// and re-checks cancellation at every suspension point, so a cancelled run
/// never executes an action the model already returned.
pub struct DesktopAgent {
    orchestrator: Orchestrator,
    capture: Arc<dyn CaptureService>,
    driver: Arc<dyn ActionDriver>,
    mapper: Box<dyn CoordinateMapper>,
    gate: CommandGate,
    options: AgentOptions,
    cancel_slot: Arc<Mutex<CancellationToken>>,
    history: Vec<String>,
    detector: LoopDetector,
    last_shell_result: Option<ShellResult>,
    session_work_dir: Option<PathBuf>,
}

impl DesktopAgent {
    pub fn new(
        orchestrator: Orchestrator,
        capture: Arc<dyn CaptureService>,
        driver: Arc<dyn ActionDriver>,
    ) -> Self {
        Self {
            orchestrator,
            capture,
            driver,
            mapper: Box::new(LinearMapper {
                scale: DEFAULT_COORDINATE_SCALE,
            }),
            gate: CommandGate::new(),
            options: AgentOptions::default(),
            cancel_slot: Arc::new(Mutex::new(CancellationToken::new())),
            history: Vec::new(),
            detector: LoopDetector::new(),
            last_shell_result: None,
            session_work_dir: None,
        }
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_mapper(mut self, mapper: Box<dyn CoordinateMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_gate(mut self, gate: CommandGate) -> Self {
        self.gate = gate;
        self
    }

    /// Handle for stopping the current (or next) run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            current: self.cancel_slot.clone(),
        }
    }

    /// Tracked session working directory for shell actions, if one is known.
    pub fn session_work_dir(&self) -> Option<&Path> {
        self.session_work_dir.as_deref()
    }

    /// Run the agent until the task completes or a bound is hit.
    ///
    /// # Arguments
    /// * `task` - Natural language description of the task.
    /// * `hooks` - Optional callbacks fired around screenshot capture.
    pub async fn run(&mut self, task: &str, hooks: RunHooks) -> RunReport {
        // Per-run reset.
        self.history.clear();
        self.detector.reset();
        self.last_shell_result = None;
        self.session_work_dir = None;
        let cancel = CancellationToken::new();
        *self
            .cancel_slot
            .lock()
            .expect("cancellation slot lock poisoned") = cancel.clone();

        let size = match self.capture.size().await {
            Ok(size) => size,
            Err(e) => return RunReport::error(format!("failed to query screen size: {}", e), 0),
        };

        let mut iterations = 0u32;
        let mut pending_warning: Option<String> = None;

        while iterations < self.options.max_iterations {
            if cancel.is_cancelled() {
                return RunReport::new(RunStatus::Stopped, iterations);
            }
            iterations += 1;

            if let Some(hook) = &hooks.before_capture {
                hook();
            }
            let image = match self.capture.capture().await {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(iteration = iterations, error = %e, "screenshot capture failed");
                    if sleep_cancellable(INFERENCE_RETRY_DELAY, &cancel).await.is_err() {
                        return RunReport::new(RunStatus::Stopped, iterations);
                    }
                    continue;
                }
            };
            if let Some(hook) = &hooks.after_capture {
                hook();
            }
            if cancel.is_cancelled() {
                return RunReport::new(RunStatus::Stopped, iterations);
            }

            let ctx = InferenceContext {
                image_base64: BASE64.encode(&image),
                prompt: self.build_prompt(task, pending_warning.as_deref()),
                history: self.history.clone(),
            };

            let response = match self
                .orchestrator
                .request(&ctx, &self.options.target.clone(), &cancel)
                .await
            {
                Ok(response) => response,
                Err(InferenceError::Aborted) => {
                    return RunReport::new(RunStatus::Stopped, iterations)
                }
                Err(err @ InferenceError::PoolExhausted(_)) => {
                    tracing::error!(error = %err, "inference pool exhausted");
                    return RunReport::error(err.to_string(), iterations);
                }
                Err(err @ InferenceError::EmptyPool(_)) => {
                    return RunReport::error(err.to_string(), iterations);
                }
                Err(err) => {
                    tracing::warn!(iteration = iterations, error = %err, "inference failed");
                    if sleep_cancellable(INFERENCE_RETRY_DELAY, &cancel).await.is_err() {
                        return RunReport::new(RunStatus::Stopped, iterations);
                    }
                    continue;
                }
            };

            tracing::info!(
                iteration = iterations,
                action = %response.action.signature(),
                thought = %response.thought,
                "model decision"
            );

            // A stop that raced the completion call must win: never execute a
            // stale action.
            if cancel.is_cancelled() {
                return RunReport::new(RunStatus::Stopped, iterations);
            }

            if matches!(response.action, Action::TaskComplete) {
                return RunReport::new(RunStatus::Completed, iterations);
            }

            let signature = response.action.signature();
            pending_warning = self.detector.observe(&signature);
            if pending_warning.is_some() {
                tracing::warn!(
                    signature = %signature,
                    count = self.detector.consecutive(),
                    "repeated action detected"
                );
            }

            let outcome = match &response.action {
                Action::Shell {
                    command,
                    shell,
                    timeout,
                    work_dir,
                    capture_output,
                } => {
                    self.execute_shell(
                        command,
                        shell.as_deref(),
                        *timeout,
                        work_dir.as_deref(),
                        *capture_output,
                    )
                    .await
                }
                Action::Wait { duration } => {
                    let wait = Duration::from_millis(duration.max(0.0) as u64);
                    if sleep_cancellable(wait, &cancel).await.is_err() {
                        return RunReport::new(RunStatus::Stopped, iterations);
                    }
                    "ok".to_string()
                }
                action => {
                    let physical = self.to_physical(action, size);
                    match self.driver.execute(&physical).await {
                        Ok(()) => "ok".to_string(),
                        Err(e) => {
                            tracing::warn!(action = %signature, error = %e, "driver execution failed");
                            format!("failed: {}", e)
                        }
                    }
                }
            };

            self.history
                .push(format!("{}. {} -> {}", iterations, signature, outcome));

            if sleep_cancellable(
                Duration::from_millis(self.options.iteration_delay_ms),
                &cancel,
            )
            .await
            .is_err()
            {
                return RunReport::new(RunStatus::Stopped, iterations);
            }
        }

        RunReport::new(RunStatus::MaxIterations, iterations)
    }

    /// Assemble the prompt: task, previous shell feedback, repeat warning.
    fn build_prompt(&self, task: &str, warning: Option<&str>) -> String {
        let mut prompt = format!("Task: {}", task);
        if let Some(result) = &self.last_shell_result {
            prompt.push_str("\n\n");
            prompt.push_str(&result.format_feedback());
        }
        if let Some(warning) = warning {
            prompt.push_str("\n\n");
            prompt.push_str(warning);
        }
        prompt
    }

    /// Run one shell action through the gate and track the session directory.
    async fn execute_shell(
        &mut self,
        command: &str,
        shell: Option<&str>,
        timeout: Option<f64>,
        work_dir: Option<&str>,
        capture_output: bool,
    ) -> String {
        // Auto-fill the tracked session directory when the model gave none.
        let work_dir = work_dir
            .map(str::to_string)
            .or_else(|| self.session_work_dir.as_ref().map(|p| p.display().to_string()));

        let request = ShellRequest {
            command: command.to_string(),
            shell: shell.map(str::to_string),
            timeout,
            work_dir: work_dir.clone(),
            capture_output,
        };

        match self.gate.execute(&request).await {
            Ok(result) => {
                let outcome = format!("exit {}", result.exit_code);
                if result.exit_code == 0 {
                    self.track_directory_change(command, work_dir.as_deref());
                }
                self.last_shell_result = Some(result);
                outcome
            }
            Err(err) => {
                tracing::warn!(command = %command, error = %err, "shell action not executed");
                self.last_shell_result = None;
                format!("rejected: {}", err)
            }
        }
    }

    /// Inspect the original command text for a leading `cd`/`chdir` and move
    /// the tracked session directory accordingly.
    fn track_directory_change(&mut self, command: &str, executed_in: Option<&str>) {
        let Some(target) = cd_target(command) else {
            return;
        };
        let base = executed_in
            .map(PathBuf::from)
            .or_else(|| self.session_work_dir.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));

        let target_path = Path::new(target);
        let new_dir = if target_path.is_absolute() {
            normalize_path(target_path)
        } else {
            normalize_path(&base.join(target_path))
        };
        tracing::debug!(dir = %new_dir.display(), "tracked session directory updated");
        self.session_work_dir = Some(new_dir);
    }

    /// Map an action's normalized coordinates to physical pixels.
    fn to_physical(&self, action: &Action, size: ScreenSize) -> PhysicalAction {
        let point = match action {
            Action::Click { x, y }
            | Action::DoubleClick { x, y }
            | Action::RightClick { x, y }
            | Action::LongPress { x, y, .. }
            | Action::Move { x, y }
            | Action::Drag { x, y, .. } => Some(self.mapper.map(*x, *y, size)),
            Action::Scroll {
                x: Some(x),
                y: Some(y),
                ..
            } => Some(self.mapper.map(*x, *y, size)),
            _ => None,
        };
        let end_point = match action {
            Action::Drag { end_x, end_y, .. } => Some(self.mapper.map(*end_x, *end_y, size)),
            _ => None,
        };
        PhysicalAction {
            action: action.clone(),
            point,
            end_point,
        }
    }
}

/// Extract the target of a leading `cd`/`chdir`, including when it heads a
/// `&&` or `;` chain.
fn cd_target(command: &str) -> Option<&str> {
    let first = command.split("&&").next()?.split(';').next()?.trim();
    let rest = first
        .strip_prefix("cd ")
        .or_else(|| first.strip_prefix("chdir "))?;
    let target = rest.trim().trim_matches('"').trim_matches('\'');
    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}

async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, ProviderModel};
    use crate::model::{CompletionTransport, ModelPool, ModelPoolEntry, TransportError};
    use async_trait::async_trait;
    use serde_json::Value;

    const CLICK: &str = r#"{"thought":"t","action":{"action":"click","x":500,"y":300}}"#;
    const COMPLETE: &str = r#"{"thought":"done","action":{"action":"task_complete"}}"#;

    #[derive(Clone)]
    enum Step {
        Reply(String),
        Auth,
        Server,
        Pending,
    }

    struct MockTransport {
        script: Mutex<Vec<Step>>,
        fallback: Step,
        prompts: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                fallback,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionTransport for MockTransport {
        async fn complete(
            &self,
            _entry: &ModelPoolEntry,
            messages: &[Value],
            cancel: &CancellationToken,
        ) -> Result<String, TransportError> {
            let step = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    self.fallback.clone()
                } else {
                    script.remove(0)
                }
            };
            if let Some(text) = messages
                .iter()
                .find(|m| m["role"] == "user")
                .and_then(|m| m["content"].as_array())
                .and_then(|parts| parts.iter().find(|p| p["type"] == "text"))
                .and_then(|p| p["text"].as_str())
            {
                self.prompts.lock().unwrap().push(text.to_string());
            }
            match step {
                Step::Reply(text) => Ok(text),
                Step::Auth => Err(TransportError::Api {
                    status: 401,
                    body: "Incorrect API key provided".to_string(),
                }),
                Step::Server => Err(TransportError::Api {
                    status: 500,
                    body: "internal server error".to_string(),
                }),
                Step::Pending => {
                    cancel.cancelled().await;
                    Err(TransportError::Aborted)
                }
            }
        }
    }

    struct StaticCapture;

    #[async_trait]
    impl CaptureService for StaticCapture {
        async fn size(&self) -> anyhow::Result<ScreenSize> {
            Ok(ScreenSize {
                width: 1920,
                height: 1080,
            })
        }

        async fn capture(&self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; 16])
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        executed: Mutex<Vec<String>>,
    }

    impl RecordingDriver {
        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionDriver for RecordingDriver {
        async fn execute(&self, action: &PhysicalAction) -> anyhow::Result<()> {
            self.executed
                .lock()
                .unwrap()
                .push(action.action.kind().to_string());
            Ok(())
        }
    }

    fn test_pool(keys: usize) -> ModelPool {
        let provider = ProviderConfig {
            id: "p".to_string(),
            name: "p".to_string(),
            base_url: "https://p.example/v1".to_string(),
            api_keys: (0..keys).map(|i| format!("k{}", i)).collect(),
            models: vec![ProviderModel {
                id: "m".to_string(),
                enabled: true,
            }],
        };
        ModelPool::from_providers(&[provider], None)
    }

    fn agent_with(
        transport: Arc<MockTransport>,
        options: AgentOptions,
    ) -> (DesktopAgent, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        let orchestrator = Orchestrator::new(test_pool(2), transport);
        let agent = DesktopAgent::new(orchestrator, Arc::new(StaticCapture), driver.clone())
            .with_options(options);
        (agent, driver)
    }

    #[tokio::test]
    async fn test_task_complete_without_driver() {
        let transport = MockTransport::new(
            vec![Step::Reply(COMPLETE.to_string())],
            Step::Reply(COMPLETE.to_string()),
        );
        let (mut agent, driver) = agent_with(transport, AgentOptions::default());
        let report = agent.run("do nothing", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 1);
        assert!(driver.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_then_complete() {
        let transport = MockTransport::new(
            vec![
                Step::Reply(CLICK.to_string()),
                Step::Reply(COMPLETE.to_string()),
            ],
            Step::Reply(COMPLETE.to_string()),
        );
        let (mut agent, driver) = agent_with(transport, AgentOptions::default());
        let report = agent.run("click the button", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 2);
        assert_eq!(driver.executed(), vec!["click".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_exhaustion_ends_run_as_error() {
        let transport = MockTransport::new(Vec::new(), Step::Auth);
        let (mut agent, driver) = agent_with(transport, AgentOptions::default());
        let report = agent.run("anything", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Error);
        let message = report.error.unwrap();
        assert!(
            message.contains("key") || message.contains("quota"),
            "message: {}",
            message
        );
        assert_eq!(report.iterations, 1);
        assert!(driver.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_action_warning_injected() {
        let transport = MockTransport::new(
            vec![
                Step::Reply(CLICK.to_string()),
                Step::Reply(CLICK.to_string()),
                Step::Reply(CLICK.to_string()),
            ],
            Step::Reply(COMPLETE.to_string()),
        );
        let (mut agent, _) = agent_with(transport.clone(), AgentOptions::default());
        let report = agent.run("click it", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Completed);

        let prompts = transport.prompts();
        assert_eq!(prompts.len(), 4);
        for prompt in &prompts[..3] {
            assert!(!prompt.contains("repeated the same action"), "{}", prompt);
        }
        assert!(prompts[3].contains("repeated the same action"));
        assert!(prompts[3].contains("click:500,300"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_cleared_by_differing_action() {
        let type_action =
            r#"{"thought":"t","action":{"action":"type","text":"hello"}}"#.to_string();
        let transport = MockTransport::new(
            vec![
                Step::Reply(CLICK.to_string()),
                Step::Reply(CLICK.to_string()),
                Step::Reply(CLICK.to_string()),
                Step::Reply(type_action),
                Step::Reply(CLICK.to_string()),
            ],
            Step::Reply(COMPLETE.to_string()),
        );
        let (mut agent, _) = agent_with(transport.clone(), AgentOptions::default());
        agent.run("click it", RunHooks::default()).await;

        let prompts = transport.prompts();
        // Warning fires on the 4th prompt, is cleared by the differing type
        // action, and stays clear afterwards.
        assert!(prompts[3].contains("repeated the same action"));
        assert!(!prompts[4].contains("repeated the same action"));
        assert!(!prompts[5].contains("repeated the same action"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_inference_executes_nothing() {
        let transport = MockTransport::new(Vec::new(), Step::Pending);
        let (mut agent, driver) = agent_with(transport, AgentOptions::default());
        let handle = agent.stop_handle();

        let (report, _) = tokio::join!(agent.run("task", RunHooks::default()), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.stop();
        });

        assert_eq!(report.status, RunStatus::Stopped);
        assert!(driver.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let transport = MockTransport::new(Vec::new(), Step::Pending);
        let (mut agent, _) = agent_with(transport, AgentOptions::default());
        let handle = agent.stop_handle();

        let (report, _) = tokio::join!(agent.run("task", RunHooks::default()), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.stop();
            handle.stop();
        });
        assert_eq!(report.status, RunStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_iterations_bound() {
        let transport = MockTransport::new(Vec::new(), Step::Reply(CLICK.to_string()));
        let options = AgentOptions::default().with_max_iterations(2);
        let (mut agent, driver) = agent_with(transport, options);
        let report = agent.run("click forever", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::MaxIterations);
        assert_eq!(report.iterations, 2);
        assert_eq!(driver.executed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_inference_error_continues() {
        let transport = MockTransport::new(
            vec![Step::Server, Step::Reply(CLICK.to_string())],
            Step::Reply(COMPLETE.to_string()),
        );
        let (mut agent, driver) = agent_with(transport, AgentOptions::default());
        let report = agent.run("keep going", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 3);
        assert_eq!(driver.executed(), vec!["click".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_hooks_fire() {
        let transport = MockTransport::new(Vec::new(), Step::Reply(COMPLETE.to_string()));
        let (mut agent, _) = agent_with(transport, AgentOptions::default());
        let before = Arc::new(Mutex::new(0u32));
        let after = Arc::new(Mutex::new(0u32));
        let before_clone = before.clone();
        let after_clone = after.clone();
        let hooks = RunHooks {
            before_capture: Some(Box::new(move || *before_clone.lock().unwrap() += 1)),
            after_capture: Some(Box::new(move || *after_clone.lock().unwrap() += 1)),
        };
        agent.run("task", hooks).await;
        assert_eq!(*before.lock().unwrap(), 1);
        assert_eq!(*after.lock().unwrap(), 1);
    }

    // Real processes run here, so the clock stays real and pacing is zeroed.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_directory_tracking() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        let project = root.path().join("project");
        std::fs::create_dir(&app).unwrap();
        std::fs::create_dir(&project).unwrap();

        let first = format!(
            r#"{{"thought":"t","action":{{"action":"shell","command":"cd ../project && true","work_dir":"{}"}}}}"#,
            app.display()
        );
        let second =
            r#"{"thought":"t","action":{"action":"shell","command":"pwd"}}"#.to_string();
        let transport = MockTransport::new(
            vec![Step::Reply(first), Step::Reply(second)],
            Step::Reply(COMPLETE.to_string()),
        );
        let options = AgentOptions::default().with_iteration_delay_ms(0);
        let (mut agent, driver) = agent_with(transport.clone(), options);
        let report = agent.run("build the project", RunHooks::default()).await;
        assert_eq!(report.status, RunStatus::Completed);
        // Shell actions never reach the driver.
        assert!(driver.executed().is_empty());

        assert_eq!(
            agent.session_work_dir().unwrap(),
            normalize_path(&project)
        );

        // The second command ran without work_dir, in the tracked directory;
        // its pwd output lands in the third prompt's feedback block.
        let prompts = transport.prompts();
        assert!(prompts[2].contains("project"), "{}", prompts[2]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_blocked_shell_action_continues_run() {
        let reboot = r#"{"thought":"t","action":{"action":"shell","command":"reboot"}}"#;
        let transport = MockTransport::new(
            vec![Step::Reply(reboot.to_string())],
            Step::Reply(COMPLETE.to_string()),
        );
        let options = AgentOptions::default().with_iteration_delay_ms(0);
        let (mut agent, _) = agent_with(transport, options);
        let report = agent.run("restart", RunHooks::default()).await;
        // The rejection is logged and fed back; the run itself continues.
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn test_cd_target_parsing() {
        assert_eq!(cd_target("cd ../project && npm test"), Some("../project"));
        assert_eq!(cd_target("cd /tmp; ls"), Some("/tmp"));
        assert_eq!(cd_target("chdir build"), Some("build"));
        assert_eq!(cd_target("cd \"my dir\" && ls"), Some("my dir"));
        assert_eq!(cd_target("ls && cd /tmp"), None);
        assert_eq!(cd_target("cd"), None);
        assert_eq!(cd_target("echo cd /tmp"), None);
    }

    #[test]
    fn test_agent_options_builder() {
        let options = AgentOptions::default()
            .with_max_iterations(10)
            .with_iteration_delay_ms(250)
            .with_target("p::m");
        assert_eq!(options.max_iterations, 10);
        assert_eq!(options.iteration_delay_ms, 250);
        assert_eq!(options.target, "p::m");
    }
}
