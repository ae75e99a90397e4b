pub mod database;
pub mod error;
pub mod executions;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use executions::{
    AttachOutcome, ExecutionRecord, ExecutionRepo, FinalizeOutcome, HistoryFilter, NativeMapping,
    NewExecution,
};
