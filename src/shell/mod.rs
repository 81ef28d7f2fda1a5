//! Shell command safety gate and execution results.

mod gate;

pub(crate) use gate::normalize_path;
pub use gate::{
    CommandGate, GateError, ShellRequest, ShellResult, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_MAX_OUTPUT_LEN,
};
