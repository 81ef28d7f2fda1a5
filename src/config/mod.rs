//! Configuration module for the desktop agent.

mod prompts;
mod providers;

pub use prompts::{get_system_prompt, SYSTEM_PROMPT};
pub use providers::{LegacyProvider, ProviderConfig, ProviderModel};
