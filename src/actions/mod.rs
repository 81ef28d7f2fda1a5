//! Action model and tolerant response recovery.

mod recover;
mod types;

pub use recover::{recover_response, RecoverError};
pub use types::{Action, ActionError, AiResponse, DEFAULT_COORDINATE_SCALE};
