//! # Desk Agent
//!
//! AI-powered agent for automating desktop interactions.
//!
//! The agent captures screenshots, asks a vision-language model what to do
//! next, and executes the returned action. Model output is recovered
//! tolerantly, requests rotate across a pool of provider/model/key
//! combinations, and shell actions pass through a safety gate before they
//! touch the host.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use desk_agent::{
//!     CaptureService, ActionDriver, DesktopAgent, HttpTransport, ModelPool,
//!     Orchestrator, ProviderConfig, ProviderModel, RunHooks,
//! };
//!
//! # async fn run(capture: Arc<dyn CaptureService>, driver: Arc<dyn ActionDriver>) -> anyhow::Result<()> {
//! let provider = ProviderConfig {
//!     id: "openai".to_string(),
//!     name: "OpenAI".to_string(),
//!     base_url: "https://api.openai.com/v1".to_string(),
//!     api_keys: vec!["sk-...".to_string()],
//!     models: vec![ProviderModel { id: "gpt-4o".to_string(), enabled: true }],
//! };
//! let pool = ModelPool::from_providers(&[provider], None);
//! let orchestrator = Orchestrator::new(pool, Arc::new(HttpTransport::with_defaults()));
//!
//! let mut agent = DesktopAgent::new(orchestrator, capture, driver);
//! let report = agent.run("open the settings app", RunHooks::default()).await;
//! println!("run ended: {:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod agent;
pub mod config;
pub mod model;
pub mod shell;

pub use actions::{
    recover_response, Action, ActionError, AiResponse, RecoverError, DEFAULT_COORDINATE_SCALE,
};
pub use agent::{
    ActionDriver, AgentOptions, CaptureService, CoordinateMapper, DesktopAgent, LinearMapper,
    LoopDetector, PhysicalAction, RunHooks, RunReport, RunStatus, ScreenSize, StopHandle,
};
pub use config::{
    get_system_prompt, LegacyProvider, ProviderConfig, ProviderModel, SYSTEM_PROMPT,
};
pub use model::{
    CompletionTransport, HttpTransport, InferenceContext, InferenceError, ModelPool,
    ModelPoolEntry, Orchestrator, RequestParams, TransportError, TARGET_ALL,
};
pub use shell::{CommandGate, GateError, ShellRequest, ShellResult};

/// Install the default tracing subscriber, honoring `RUST_LOG` and falling
/// back to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
