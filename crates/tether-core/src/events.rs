use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, ExecutionId, NativeSessionId, TransactionId};
use crate::status::ExecutionStatus;
use crate::tools::CliTool;

/// Change notifications emitted whenever an execution record changes, so
/// list views can refresh without polling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "created")]
    Created {
        execution_id: ExecutionId,
        conversation_id: ConversationId,
        transaction_id: TransactionId,
        tool: CliTool,
    },

    #[serde(rename = "native_session_attached")]
    NativeSessionAttached {
        execution_id: ExecutionId,
        conversation_id: ConversationId,
        native_session_id: NativeSessionId,
    },

    /// Another record already owns the native session this launch reported.
    #[serde(rename = "mapping_conflict")]
    MappingConflict {
        execution_id: ExecutionId,
        conversation_id: ConversationId,
        native_session_id: NativeSessionId,
        holder: Option<ExecutionId>,
    },

    #[serde(rename = "finalized")]
    Finalized {
        execution_id: ExecutionId,
        conversation_id: ConversationId,
        status: ExecutionStatus,
        exit_code: Option<i32>,
    },

    #[serde(rename = "deleted")]
    Deleted {
        scope: DeleteScope,
        removed: usize,
    },
}

/// What a delete request targeted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeleteScope {
    One(ExecutionId),
    Tool(CliTool),
    All,
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::Created { execution_id, .. }
            | Self::NativeSessionAttached { execution_id, .. }
            | Self::MappingConflict { execution_id, .. }
            | Self::Finalized { execution_id, .. } => Some(execution_id),
            Self::Deleted { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::NativeSessionAttached { .. } => "native_session_attached",
            Self::MappingConflict { .. } => "mapping_conflict",
            Self::Finalized { .. } => "finalized",
            Self::Deleted { .. } => "deleted",
        }
    }
}
