pub mod config;
pub mod coordinator;
pub mod error;
pub mod interpreter;
pub mod runtime;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{ConfigError, CoordinatorError, Result};
pub use types::{ClientId, LogLine, RunId, RunState, StreamKind};
