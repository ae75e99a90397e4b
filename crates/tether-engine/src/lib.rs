//! # tether-engine
//!
//! Launches assistant CLIs as child processes, correlates each launch with the
//! tool's own session id, and records that mapping race-free in the execution
//! store.
//!
//! ```no_run
//! # async fn run() -> Result<(), tether_engine::EngineError> {
//! use tether_core::{CliTool, ConversationId};
//! use tether_engine::{EngineConfig, ExecuteRequest, Executor};
//! use tether_store::{Database, ExecutionRepo};
//!
//! let repo = ExecutionRepo::new(Database::open(".tether/executions.db".as_ref())?);
//! let executor = Executor::new(repo, EngineConfig::default());
//! let conv = ConversationId::from_raw("support-42");
//! let first = executor
//!     .execute(ExecuteRequest::new(CliTool::Gemini, conv.clone(), "summarize src/", "."))
//!     .await?;
//! let next = executor
//!     .resume(ExecuteRequest::new(CliTool::Gemini, conv, "now the tests", "."))
//!     .await?;
//! assert_eq!(next.resumed_from, first.native_session_id);
//! # Ok(())
//! # }
//! ```

pub mod composer;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod resolver;

pub use composer::{compose, ComposeInput, ComposedCommand, PromptDelivery, ToolProfile};
pub use correlator::{MarkerCorrelator, SessionCorrelator, DEFAULT_SESSION_WINDOW};
pub use error::{ComposeError, EngineError, LaunchError};
pub use executor::{EngineConfig, ExecuteRequest, ExecutionResult, Executor, MappingOutcome};
pub use launcher::{LaunchOutcome, OutputChunk, OutputStream, ProcessLauncher, Supervision, Termination};
pub use resolver::ResumeResolver;
