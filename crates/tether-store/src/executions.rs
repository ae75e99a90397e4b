//! Execution records and the native-session mapping.
//!
//! Every mutation is a single conditional statement inside an IMMEDIATE
//! transaction. Ownership of a native session id is decided by the
//! `idx_executions_native_live` unique index, never by a prior read.

use chrono::{SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use tether_core::{
    CliTool, ConversationId, ExecutionId, ExecutionStatus, NativeSessionId, TransactionId,
};

use crate::database::Database;
use crate::error::{is_unique_violation, StoreError};
use crate::row_helpers;

const COLUMNS: &str = "id, conversation_id, tool, transaction_id, native_session_id, resumed_from,
     status, working_directory, exit_code, started_at, finished_at";

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub conversation_id: ConversationId,
    pub tool: CliTool,
    pub transaction_id: TransactionId,
    pub native_session_id: Option<NativeSessionId>,
    /// Native session this launch was asked to continue, if any.
    pub resumed_from: Option<NativeSessionId>,
    pub status: ExecutionStatus,
    pub working_directory: String,
    pub exit_code: Option<i32>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Input for [`ExecutionRepo::create_pending`].
#[derive(Clone, Debug)]
pub struct NewExecution<'a> {
    pub conversation_id: &'a ConversationId,
    pub tool: CliTool,
    pub transaction_id: &'a TransactionId,
    pub working_directory: &'a str,
    pub resumed_from: Option<&'a NativeSessionId>,
}

/// A native session id attached to some record of a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeMapping {
    pub execution_id: ExecutionId,
    pub tool: CliTool,
    pub native_session_id: NativeSessionId,
    pub status: ExecutionStatus,
    pub started_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AttachOutcome {
    Attached,
    /// Another live record already owns the id. `holder` is looked up after
    /// the constraint fired and is informational only.
    Conflict { holder: Option<ExecutionId> },
    /// The record is no longer pending, or already carries a different id.
    Ineligible {
        status: ExecutionStatus,
        existing: Option<NativeSessionId>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyTerminal(ExecutionStatus),
}

/// Filter for [`ExecutionRepo::query_history`]. All set fields must match.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub tool: Option<CliTool>,
    pub conversation_id: Option<ConversationId>,
    pub status: Option<ExecutionStatus>,
    /// RFC 3339 lower bound on `started_at`.
    pub since: Option<String>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Clone)]
pub struct ExecutionRepo {
    db: Database,
}

impl ExecutionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new `pending` record.
    ///
    /// With `resumed_from` set, the insert only succeeds while no other
    /// pending record holds or continues that native session; otherwise it
    /// fails with [`StoreError::ResumeClaimed`].
    #[instrument(skip(self, new), fields(conversation_id = %new.conversation_id, tool = %new.tool, transaction_id = %new.transaction_id))]
    pub fn create_pending(&self, new: &NewExecution<'_>) -> Result<ExecutionRecord, StoreError> {
        let id = ExecutionId::new();
        let now = timestamp();

        self.db.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO executions (id, conversation_id, tool, transaction_id, resumed_from,
                                         status, working_directory, started_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7
                 WHERE ?5 IS NULL OR NOT EXISTS (
                     SELECT 1 FROM executions
                     WHERE status = 'pending'
                       AND (native_session_id = ?5 OR resumed_from = ?5))",
                rusqlite::params![
                    id.as_str(),
                    new.conversation_id.as_str(),
                    new.tool.as_str(),
                    new.transaction_id.as_str(),
                    new.resumed_from.map(NativeSessionId::as_str),
                    new.working_directory,
                    now,
                ],
            );
            match (inserted, new.resumed_from) {
                (Ok(1), _) => Ok(()),
                (Ok(_), Some(session)) => Err(resume_claimed(tx, session)?),
                (Err(e), Some(session))
                    if is_unique_violation(&e) && e.to_string().contains("resumed_from") =>
                {
                    Err(resume_claimed(tx, session)?)
                }
                (Err(e), _) if is_unique_violation(&e) => {
                    Err(StoreError::DuplicateTransaction(new.transaction_id.clone()))
                }
                (Err(e), _) => Err(e.into()),
                (Ok(n), None) => Err(StoreError::Database(format!("insert affected {n} rows"))),
            }
        })?;

        Ok(ExecutionRecord {
            id,
            conversation_id: new.conversation_id.clone(),
            tool: new.tool,
            transaction_id: new.transaction_id.clone(),
            native_session_id: None,
            resumed_from: new.resumed_from.cloned(),
            status: ExecutionStatus::Pending,
            working_directory: new.working_directory.to_string(),
            exit_code: None,
            started_at: now,
            finished_at: None,
        })
    }

    /// Claim `native` for record `id`.
    ///
    /// Re-attaching the id a pending record already holds is `Attached`.
    #[instrument(skip(self), fields(execution_id = %id, native_session_id = %native))]
    pub fn attach_native_session(
        &self,
        id: &ExecutionId,
        native: &NativeSessionId,
    ) -> Result<AttachOutcome, StoreError> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE executions SET native_session_id = ?1
                 WHERE id = ?2 AND status = 'pending' AND native_session_id IS NULL",
                rusqlite::params![native.as_str(), id.as_str()],
            );

            match updated {
                Ok(1) => Ok(AttachOutcome::Attached),
                Ok(_) => {
                    let current: Option<(String, Option<String>)> = tx
                        .query_row(
                            "SELECT status, native_session_id FROM executions WHERE id = ?1",
                            [id.as_str()],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?;
                    let Some((status, existing)) = current else {
                        return Err(StoreError::NotFound(format!("execution {id}")));
                    };
                    let status: ExecutionStatus =
                        row_helpers::parse_enum(&status, "executions", "status")?;
                    let existing = existing.map(NativeSessionId::from_raw);
                    if status == ExecutionStatus::Pending && existing.as_ref() == Some(native) {
                        return Ok(AttachOutcome::Attached);
                    }
                    debug!(%status, "record not eligible for attach");
                    Ok(AttachOutcome::Ineligible { status, existing })
                }
                Err(e) if is_unique_violation(&e) => {
                    let holder: Option<String> = tx
                        .query_row(
                            "SELECT id FROM executions
                             WHERE native_session_id = ?1 AND id != ?2
                               AND status IN ('pending', 'completed')
                             LIMIT 1",
                            [native.as_str(), id.as_str()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    warn!(holder = ?holder, "native session already claimed");
                    Ok(AttachOutcome::Conflict {
                        holder: holder.map(ExecutionId::from_raw),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Move a pending record to a terminal status. A record that is already
    /// terminal is left untouched, including its `finished_at`.
    #[instrument(skip(self), fields(execution_id = %id, status = %status))]
    pub fn finalize(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        exit_code: Option<i32>,
    ) -> Result<FinalizeOutcome, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "cannot finalize {id} as {status}"
            )));
        }

        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE executions SET status = ?1, exit_code = ?2, finished_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![status.as_str(), exit_code, timestamp(), id.as_str()],
            )?;
            if updated == 1 {
                return Ok(FinalizeOutcome::Finalized);
            }

            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                Some(raw) => Ok(FinalizeOutcome::AlreadyTerminal(row_helpers::parse_enum(
                    &raw,
                    "executions",
                    "status",
                )?)),
                None => Err(StoreError::NotFound(format!("execution {id}"))),
            }
        })
    }

    /// Most recent record of the conversation that carries a native session id,
    /// whatever its status.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn lookup_native_session(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<NativeMapping>, StoreError> {
        Ok(self.native_mappings(conversation_id, 1)?.into_iter().next())
    }

    /// Attached mappings of a conversation, newest first.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn native_mappings(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<NativeMapping>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, native_session_id, status, started_at, tool FROM executions
                 WHERE conversation_id = ?1 AND native_session_id IS NOT NULL
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.as_str(), limit])?;
            let mut mappings = Vec::new();
            while let Some(row) = rows.next()? {
                let status: String = row_helpers::get(row, 2, "executions", "status")?;
                let tool: String = row_helpers::get(row, 4, "executions", "tool")?;
                mappings.push(NativeMapping {
                    execution_id: ExecutionId::from_raw(row_helpers::get::<String>(
                        row,
                        0,
                        "executions",
                        "id",
                    )?),
                    tool: row_helpers::parse_enum(&tool, "executions", "tool")?,
                    native_session_id: NativeSessionId::from_raw(row_helpers::get::<String>(
                        row,
                        1,
                        "executions",
                        "native_session_id",
                    )?),
                    status: row_helpers::parse_enum(&status, "executions", "status")?,
                    started_at: row_helpers::get(row, 3, "executions", "started_at")?,
                });
            }
            Ok(mappings)
        })
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    pub fn get(&self, id: &ExecutionId) -> Result<ExecutionRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM executions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_record(row),
                None => Err(StoreError::NotFound(format!("execution {id}"))),
            }
        })
    }

    /// List records matching `filter`, newest first.
    #[instrument(skip(self, filter))]
    pub fn query_history(&self, filter: &HistoryFilter) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = format!("SELECT {COLUMNS} FROM executions WHERE 1=1");
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(tool) = &filter.tool {
                sql.push_str(&format!(" AND tool = ?{}", params.len() + 1));
                params.push(Box::new(tool.as_str()));
            }
            if let Some(conversation_id) = &filter.conversation_id {
                sql.push_str(&format!(" AND conversation_id = ?{}", params.len() + 1));
                params.push(Box::new(conversation_id.as_str().to_string()));
            }
            if let Some(status) = &filter.status {
                sql.push_str(&format!(" AND status = ?{}", params.len() + 1));
                params.push(Box::new(status.as_str()));
            }
            if let Some(since) = &filter.since {
                sql.push_str(&format!(" AND started_at >= ?{}", params.len() + 1));
                params.push(Box::new(since.clone()));
            }

            sql.push_str(" ORDER BY started_at DESC, rowid DESC");
            let limit = filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
            sql.push_str(&format!(" LIMIT {limit} OFFSET {}", filter.offset));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// Delete one record. Returns false when it did not exist.
    #[instrument(skip(self), fields(execution_id = %id))]
    pub fn delete_one(&self, id: &ExecutionId) -> Result<bool, StoreError> {
        self.db.with_tx(|tx| {
            let n = tx.execute("DELETE FROM executions WHERE id = ?1", [id.as_str()])?;
            Ok(n == 1)
        })
    }

    #[instrument(skip(self), fields(tool = %tool))]
    pub fn delete_by_tool(&self, tool: CliTool) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let n = tx.execute("DELETE FROM executions WHERE tool = ?1", [tool.as_str()])?;
            Ok(n)
        })
    }

    #[instrument(skip(self))]
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| Ok(tx.execute("DELETE FROM executions", [])?))
    }
}

fn resume_claimed(
    tx: &rusqlite::Transaction<'_>,
    session: &NativeSessionId,
) -> Result<StoreError, StoreError> {
    let holder: Option<String> = tx
        .query_row(
            "SELECT id FROM executions
             WHERE status = 'pending'
               AND (native_session_id = ?1 OR resumed_from = ?1)
             ORDER BY started_at LIMIT 1",
            [session.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    warn!(native_session_id = %session, holder = ?holder, "native session busy, resume refused");
    Ok(StoreError::ResumeClaimed {
        session: session.clone(),
        holder: holder.map(ExecutionId::from_raw),
    })
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<ExecutionRecord, StoreError> {
    let tool: String = row_helpers::get(row, 2, "executions", "tool")?;
    let status: String = row_helpers::get(row, 6, "executions", "status")?;

    Ok(ExecutionRecord {
        id: ExecutionId::from_raw(row_helpers::get::<String>(row, 0, "executions", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "executions",
            "conversation_id",
        )?),
        tool: row_helpers::parse_enum(&tool, "executions", "tool")?,
        transaction_id: TransactionId::from_raw(row_helpers::get::<String>(
            row,
            3,
            "executions",
            "transaction_id",
        )?),
        native_session_id: row_helpers::get_opt::<String>(row, 4, "executions", "native_session_id")?
            .map(NativeSessionId::from_raw),
        resumed_from: row_helpers::get_opt::<String>(row, 5, "executions", "resumed_from")?
            .map(NativeSessionId::from_raw),
        status: row_helpers::parse_enum(&status, "executions", "status")?,
        working_directory: row_helpers::get(row, 7, "executions", "working_directory")?,
        exit_code: row_helpers::get_opt(row, 8, "executions", "exit_code")?,
        started_at: row_helpers::get(row, 9, "executions", "started_at")?,
        finished_at: row_helpers::get_opt(row, 10, "executions", "finished_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tether_core::token;

    fn repo() -> ExecutionRepo {
        ExecutionRepo::new(Database::in_memory().unwrap())
    }

    fn pending(repo: &ExecutionRepo, conv: &str, tool: CliTool) -> ExecutionRecord {
        let conversation_id = ConversationId::from_raw(conv);
        let transaction_id = token::generate(&conversation_id);
        repo.create_pending(&NewExecution {
            conversation_id: &conversation_id,
            tool,
            transaction_id: &transaction_id,
            working_directory: "/tmp",
            resumed_from: None,
        })
        .unwrap()
    }

    fn native(s: &str) -> NativeSessionId {
        NativeSessionId::from_raw(s)
    }

    #[test]
    fn create_pending_record() {
        let repo = repo();
        let rec = pending(&repo, "conv-a", CliTool::Gemini);
        assert!(rec.id.as_str().starts_with("exec_"));
        assert_eq!(rec.status, ExecutionStatus::Pending);
        assert!(rec.native_session_id.is_none());
        assert!(rec.finished_at.is_none());

        let fetched = repo.get(&rec.id).unwrap();
        assert_eq!(fetched, rec);
    }

    #[test]
    fn duplicate_transaction_is_surfaced() {
        let repo = repo();
        let conversation_id = ConversationId::from_raw("conv-a");
        let transaction_id = TransactionId::from_raw("txn_fixed");
        let new = NewExecution {
            conversation_id: &conversation_id,
            tool: CliTool::Claude,
            transaction_id: &transaction_id,
            working_directory: "/tmp",
            resumed_from: None,
        };
        repo.create_pending(&new).unwrap();
        let err = repo.create_pending(&new).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTransaction(t) if t == transaction_id));
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn attach_then_conflict() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Gemini);
        let b = pending(&repo, "conv-b", CliTool::Gemini);

        assert_eq!(
            repo.attach_native_session(&a.id, &native("s-1")).unwrap(),
            AttachOutcome::Attached
        );
        assert_eq!(
            repo.attach_native_session(&b.id, &native("s-1")).unwrap(),
            AttachOutcome::Conflict {
                holder: Some(a.id.clone())
            }
        );

        // Loser keeps no id, winner keeps its id.
        assert!(repo.get(&b.id).unwrap().native_session_id.is_none());
        assert_eq!(repo.get(&a.id).unwrap().native_session_id, Some(native("s-1")));
    }

    #[test]
    fn reattaching_same_id_is_attached() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Codex);
        repo.attach_native_session(&a.id, &native("s-1")).unwrap();
        assert_eq!(
            repo.attach_native_session(&a.id, &native("s-1")).unwrap(),
            AttachOutcome::Attached
        );
    }

    #[test]
    fn attaching_a_different_id_is_ineligible() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Codex);
        repo.attach_native_session(&a.id, &native("s-1")).unwrap();
        assert_eq!(
            repo.attach_native_session(&a.id, &native("s-2")).unwrap(),
            AttachOutcome::Ineligible {
                status: ExecutionStatus::Pending,
                existing: Some(native("s-1")),
            }
        );
    }

    #[test]
    fn no_attach_after_killed() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Gemini);
        repo.finalize(&a.id, ExecutionStatus::Killed, None).unwrap();
        assert_eq!(
            repo.attach_native_session(&a.id, &native("s-1")).unwrap(),
            AttachOutcome::Ineligible {
                status: ExecutionStatus::Killed,
                existing: None,
            }
        );
    }

    #[test]
    fn attach_unknown_record_is_not_found() {
        let repo = repo();
        let err = repo
            .attach_native_session(&ExecutionId::new(), &native("s-1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn completed_holder_still_blocks() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&a.id, &native("s-1")).unwrap();
        repo.finalize(&a.id, ExecutionStatus::Completed, Some(0)).unwrap();

        let b = pending(&repo, "conv-b", CliTool::Gemini);
        assert!(matches!(
            repo.attach_native_session(&b.id, &native("s-1")).unwrap(),
            AttachOutcome::Conflict { .. }
        ));
    }

    #[test]
    fn failed_holder_releases_the_id() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&a.id, &native("s-1")).unwrap();
        repo.finalize(&a.id, ExecutionStatus::Failed, Some(2)).unwrap();

        let b = pending(&repo, "conv-b", CliTool::Gemini);
        assert_eq!(
            repo.attach_native_session(&b.id, &native("s-1")).unwrap(),
            AttachOutcome::Attached
        );
    }

    #[test]
    fn finalize_is_idempotent() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Claude);

        assert_eq!(
            repo.finalize(&a.id, ExecutionStatus::Completed, Some(0)).unwrap(),
            FinalizeOutcome::Finalized
        );
        let first = repo.get(&a.id).unwrap();
        assert!(first.finished_at.is_some());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(
            repo.finalize(&a.id, ExecutionStatus::Completed, Some(0)).unwrap(),
            FinalizeOutcome::AlreadyTerminal(ExecutionStatus::Completed)
        );
        let second = repo.get(&a.id).unwrap();
        assert_eq!(second.finished_at, first.finished_at);
        assert_eq!(second.exit_code, Some(0));
    }

    #[test]
    fn finalize_never_overwrites_terminal_status() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Claude);
        repo.finalize(&a.id, ExecutionStatus::Killed, None).unwrap();
        assert_eq!(
            repo.finalize(&a.id, ExecutionStatus::Completed, Some(0)).unwrap(),
            FinalizeOutcome::AlreadyTerminal(ExecutionStatus::Killed)
        );
        assert_eq!(repo.get(&a.id).unwrap().status, ExecutionStatus::Killed);
    }

    #[test]
    fn finalize_to_pending_is_rejected() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Claude);
        let err = repo.finalize(&a.id, ExecutionStatus::Pending, None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[test]
    fn finalize_unknown_is_not_found() {
        let repo = repo();
        let err = repo
            .finalize(&ExecutionId::new(), ExecutionStatus::Failed, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn lookup_returns_most_recent_mapping() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-a");
        assert!(repo.lookup_native_session(&conv).unwrap().is_none());

        let first = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&first.id, &native("s-old")).unwrap();
        repo.finalize(&first.id, ExecutionStatus::Completed, Some(0)).unwrap();

        // A record without a mapping does not shadow older mappings.
        let unmapped = pending(&repo, "conv-a", CliTool::Gemini);
        repo.finalize(&unmapped.id, ExecutionStatus::Completed, Some(0)).unwrap();
        assert_eq!(
            repo.lookup_native_session(&conv).unwrap().unwrap().native_session_id,
            native("s-old")
        );

        let second = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&second.id, &native("s-new")).unwrap();

        let mapping = repo.lookup_native_session(&conv).unwrap().unwrap();
        assert_eq!(mapping.native_session_id, native("s-new"));
        assert_eq!(mapping.execution_id, second.id);
        assert_eq!(mapping.status, ExecutionStatus::Pending);

        let all = repo.native_mappings(&conv, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].native_session_id, native("s-old"));
    }

    #[test]
    fn history_filters() {
        let repo = repo();
        let g = pending(&repo, "conv-a", CliTool::Gemini);
        pending(&repo, "conv-a", CliTool::Claude);
        pending(&repo, "conv-b", CliTool::Gemini);
        repo.finalize(&g.id, ExecutionStatus::Completed, Some(0)).unwrap();

        let all = repo.query_history(&HistoryFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let gemini = repo
            .query_history(&HistoryFilter {
                tool: Some(CliTool::Gemini),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(gemini.len(), 2);

        let conv_a = repo
            .query_history(&HistoryFilter {
                conversation_id: Some(ConversationId::from_raw("conv-a")),
                status: Some(ExecutionStatus::Pending),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(conv_a.len(), 1);
        assert_eq!(conv_a[0].tool, CliTool::Claude);

        let future = repo
            .query_history(&HistoryFilter {
                since: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn history_is_newest_first_and_paginated() {
        let repo = repo();
        let ids: Vec<ExecutionId> = (0..5)
            .map(|i| pending(&repo, &format!("conv-{i}"), CliTool::Qwen).id)
            .collect();

        let page1 = repo
            .query_history(&HistoryFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].id, ids[4]);

        let page3 = repo
            .query_history(&HistoryFilter {
                limit: Some(2),
                offset: 4,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].id, ids[0]);
    }

    #[test]
    fn deletes() {
        let repo = repo();
        let a = pending(&repo, "conv-a", CliTool::Gemini);
        pending(&repo, "conv-b", CliTool::Gemini);
        pending(&repo, "conv-c", CliTool::Codex);
        pending(&repo, "conv-d", CliTool::Claude);

        assert!(repo.delete_one(&a.id).unwrap());
        assert!(!repo.delete_one(&a.id).unwrap());
        assert_eq!(repo.delete_by_tool(CliTool::Gemini).unwrap(), 1);
        assert_eq!(repo.count().unwrap(), 2);
        assert_eq!(repo.delete_all().unwrap(), 2);
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn corrupt_status_is_reported() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "PRAGMA ignore_check_constraints = ON;
                 INSERT INTO executions (id, conversation_id, tool, transaction_id, status,
                                         working_directory, started_at)
                 VALUES ('exec_bad', 'c', 'gemini', 't', 'RUNNING', '/tmp', '2026-01-01T00:00:00Z');",
            )?;
            Ok(())
        })
        .unwrap();

        let repo = ExecutionRepo::new(db);
        let err = repo.get(&ExecutionId::from_raw("exec_bad")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { column: "status", .. }));
    }

    #[test]
    fn concurrent_attach_has_single_winner() {
        let repo = repo();
        let records: Vec<ExecutionRecord> = (0..10)
            .map(|i| pending(&repo, &format!("conv-{i}"), CliTool::Gemini))
            .collect();
        let barrier = Arc::new(Barrier::new(records.len()));

        let handles: Vec<_> = records
            .into_iter()
            .map(|rec| {
                let repo = repo.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    repo.attach_native_session(&rec.id, &native("shared")).unwrap()
                })
            })
            .collect();

        let outcomes: Vec<AttachOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = outcomes
            .iter()
            .filter(|o| **o == AttachOutcome::Attached)
            .count();
        let conflicts = outcomes
            .iter()
            .filter(|o| matches!(o, AttachOutcome::Conflict { .. }))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 9);
    }

    #[test]
    fn separate_connections_race_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.db");
        let setup = ExecutionRepo::new(Database::open(&path).unwrap());
        let records: Vec<ExecutionRecord> = (0..6)
            .map(|i| pending(&setup, &format!("conv-{i}"), CliTool::Claude))
            .collect();
        let barrier = Arc::new(Barrier::new(records.len()));

        let handles: Vec<_> = records
            .into_iter()
            .map(|rec| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    // Each thread gets its own connection, like another process would.
                    let repo = ExecutionRepo::new(Database::open(&path).unwrap());
                    barrier.wait();
                    repo.attach_native_session(&rec.id, &native("shared-file"))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == AttachOutcome::Attached)
            .count();
        assert_eq!(winners, 1);
    }

    fn resuming(
        repo: &ExecutionRepo,
        conv: &str,
        session: &NativeSessionId,
    ) -> Result<ExecutionRecord, StoreError> {
        let conversation_id = ConversationId::from_raw(conv);
        let transaction_id = token::generate(&conversation_id);
        repo.create_pending(&NewExecution {
            conversation_id: &conversation_id,
            tool: CliTool::Gemini,
            transaction_id: &transaction_id,
            working_directory: "/tmp",
            resumed_from: Some(session),
        })
    }

    #[test]
    fn second_live_resume_of_a_session_is_refused() {
        let repo = repo();
        let origin = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&origin.id, &native("s-1")).unwrap();
        repo.finalize(&origin.id, ExecutionStatus::Completed, Some(0)).unwrap();

        let first = resuming(&repo, "conv-a", &native("s-1")).unwrap();
        let err = resuming(&repo, "conv-a", &native("s-1")).unwrap_err();
        match err {
            StoreError::ResumeClaimed { session, holder } => {
                assert_eq!(session, native("s-1"));
                assert_eq!(holder, Some(first.id.clone()));
            }
            other => panic!("expected ResumeClaimed, got {other}"),
        }
        assert_eq!(repo.count().unwrap(), 2);

        // Once the running resume ends, the session is free again.
        repo.finalize(&first.id, ExecutionStatus::Completed, Some(0)).unwrap();
        assert!(resuming(&repo, "conv-a", &native("s-1")).is_ok());
    }

    #[test]
    fn resume_of_a_session_still_running_fresh_is_refused() {
        let repo = repo();
        let origin = pending(&repo, "conv-a", CliTool::Gemini);
        repo.attach_native_session(&origin.id, &native("s-live")).unwrap();

        let err = resuming(&repo, "conv-a", &native("s-live")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::ResumeClaimed { holder: Some(h), .. } if h == origin.id
        ));
    }

    #[test]
    fn resumes_of_different_sessions_coexist() {
        let repo = repo();
        assert!(resuming(&repo, "conv-a", &native("s-a")).is_ok());
        assert!(resuming(&repo, "conv-b", &native("s-b")).is_ok());
    }

    #[test]
    fn concurrent_resumes_of_one_session_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.db");
        drop(Database::open(&path).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let repo = ExecutionRepo::new(Database::open(&path).unwrap());
                    barrier.wait();
                    resuming(&repo, "conv-a", &native("s-shared"))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::ResumeClaimed { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(refused, 7);
    }
}
