// Public modules
pub mod config;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod join;
pub mod logs;
pub mod node;
pub mod packages;
pub mod pipeline;
pub mod run;
pub mod script;
pub mod ssh;

// Filesystem layout
pub mod paths;

// Re-export common types for convenience
pub use engine::{DeployReport, DeployRequest, Engine, JoinCommandReport, VerifyReport};
pub use error::{Error, ErrorCode, Result};
pub use node::{Node, Role};
pub use run::{CancelSignal, LogCallback};
