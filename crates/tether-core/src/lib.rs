pub mod events;
pub mod ids;
pub mod status;
pub mod token;
pub mod tools;

pub use events::{DeleteScope, ExecutionEvent};
pub use ids::{ConversationId, ExecutionId, NativeSessionId, TransactionId};
pub use status::ExecutionStatus;
pub use tools::{CliTool, UnknownTool};
