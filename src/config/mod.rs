//! Process configuration loaded from `FC_*` environment variables.

mod error;
mod settings;

pub use error::ConfigError;
pub use settings::{Backend, Settings};
