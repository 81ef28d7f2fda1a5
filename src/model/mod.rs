//! Inference layer: request pool, transport, and the retrying orchestrator.

mod orchestrator;
mod pool;
mod transport;

pub use orchestrator::{
    InferenceContext, InferenceError, Orchestrator, DEFAULT_HISTORY_CONTEXT_LEN,
};
pub use pool::{ModelPool, ModelPoolEntry, PoolError, TARGET_ALL};
pub use transport::{
    CompletionTransport, HttpTransport, MessageBuilder, RequestParams, TransportError,
};
