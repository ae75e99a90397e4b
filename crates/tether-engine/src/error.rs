use std::path::PathBuf;

use tether_core::{CliTool, ExecutionId, TransactionId};
use tether_store::StoreError;

/// Problems building a command line. Nothing has been launched or recorded.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("working directory does not exist or is not a directory: {0}")]
    InvalidWorkingDirectory(PathBuf),

    #[error("invalid prompt: {0}")]
    InvalidPrompt(&'static str),

    #[error("{tool} profile has no program")]
    EmptyProgram { tool: CliTool },
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("child {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("wait failed: {0}")]
    Wait(#[source] std::io::Error),
}

/// Failures surfaced to callers of the executor.
///
/// Timeouts, correlation misses and mapping conflicts are not errors; they
/// are reported through [`crate::ExecutionResult`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{tool} is not installed (looked for `{program}`)")]
    ToolNotFound { tool: CliTool, program: String },

    #[error("failed to start {tool} for {execution_id}: {source}")]
    SpawnFailure {
        tool: CliTool,
        execution_id: ExecutionId,
        #[source]
        source: LaunchError,
    },

    #[error("transaction id {0} already exists")]
    GeneratorCollision(TransactionId),

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification for logs and exit handling.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::GeneratorCollision(_) => "generator_collision",
            Self::Compose(_) => "invalid_request",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }
}
