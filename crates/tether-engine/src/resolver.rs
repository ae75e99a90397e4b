use tether_core::{CliTool, ConversationId};
use tether_store::{ExecutionRepo, NativeMapping, StoreError};
use tracing::debug;

/// How many attached mappings of a conversation are considered.
const DEFAULT_SCAN_LIMIT: u32 = 20;

/// Picks the native session a new launch should continue.
///
/// Mappings whose record ended `failed` or `killed` are stale: the tool may
/// have abandoned that session, so the resolver moves on to the next newest
/// mapping and, failing that, returns `None` so the launch starts fresh.
#[derive(Clone)]
pub struct ResumeResolver {
    repo: ExecutionRepo,
    scan_limit: u32,
}

impl ResumeResolver {
    pub fn new(repo: ExecutionRepo) -> Self {
        Self {
            repo,
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    pub fn with_scan_limit(mut self, limit: u32) -> Self {
        self.scan_limit = limit.max(1);
        self
    }

    /// Newest resumable mapping of `conversation_id`, any tool.
    pub fn resolve(&self, conversation_id: &ConversationId) -> Result<Option<NativeMapping>, StoreError> {
        self.resolve_matching(conversation_id, |_| true)
    }

    /// Newest resumable mapping of `conversation_id` created by `tool`.
    /// Native ids are meaningless to any other tool.
    pub fn resolve_for(
        &self,
        conversation_id: &ConversationId,
        tool: CliTool,
    ) -> Result<Option<NativeMapping>, StoreError> {
        self.resolve_matching(conversation_id, |m| m.tool == tool)
    }

    fn resolve_matching<F>(
        &self,
        conversation_id: &ConversationId,
        keep: F,
    ) -> Result<Option<NativeMapping>, StoreError>
    where
        F: Fn(&NativeMapping) -> bool,
    {
        let mappings = self.repo.native_mappings(conversation_id, self.scan_limit)?;
        let mut candidates = mappings.into_iter().filter(|m| keep(m));
        let picked = candidates.find(|m| {
            let usable = m.status.is_resumable();
            if !usable {
                debug!(
                    execution_id = %m.execution_id,
                    native_session_id = %m.native_session_id,
                    status = %m.status,
                    "skipping stale mapping"
                );
            }
            usable
        });
        Ok(picked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{token, ExecutionStatus, NativeSessionId};
    use tether_store::{AttachOutcome, Database, NewExecution};

    fn repo() -> ExecutionRepo {
        ExecutionRepo::new(Database::in_memory().unwrap())
    }

    fn launch(
        repo: &ExecutionRepo,
        conv: &ConversationId,
        tool: CliTool,
        native: &str,
        end: ExecutionStatus,
    ) {
        let txn = token::generate(conv);
        let rec = repo
            .create_pending(&NewExecution {
                conversation_id: conv,
                tool,
                transaction_id: &txn,
                working_directory: "/tmp",
                resumed_from: None,
            })
            .unwrap();
        let outcome = repo
            .attach_native_session(&rec.id, &NativeSessionId::from_raw(native))
            .unwrap();
        assert_eq!(outcome, AttachOutcome::Attached);
        let _ = repo.finalize(&rec.id, end, None).unwrap();
    }

    #[test]
    fn no_mapping_resolves_to_none() {
        let resolver = ResumeResolver::new(repo());
        let conv = ConversationId::from_raw("conv-empty");
        assert!(resolver.resolve(&conv).unwrap().is_none());
    }

    #[test]
    fn completed_mapping_is_resumable() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-ok");
        launch(&repo, &conv, CliTool::Gemini, "S-1", ExecutionStatus::Completed);
        let m = ResumeResolver::new(repo).resolve(&conv).unwrap().unwrap();
        assert_eq!(m.native_session_id.as_str(), "S-1");
    }

    #[test]
    fn only_killed_mapping_resolves_to_none() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-killed");
        launch(&repo, &conv, CliTool::Gemini, "S-dead", ExecutionStatus::Killed);
        assert!(ResumeResolver::new(repo).resolve(&conv).unwrap().is_none());
    }

    #[test]
    fn only_failed_mapping_resolves_to_none() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-failed");
        launch(&repo, &conv, CliTool::Claude, "S-bad", ExecutionStatus::Failed);
        assert!(ResumeResolver::new(repo).resolve(&conv).unwrap().is_none());
    }

    #[test]
    fn stale_newest_falls_back_to_older_resumable() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-mixed");
        launch(&repo, &conv, CliTool::Gemini, "S-old", ExecutionStatus::Completed);
        launch(&repo, &conv, CliTool::Gemini, "S-new", ExecutionStatus::Killed);
        let m = ResumeResolver::new(repo).resolve(&conv).unwrap().unwrap();
        assert_eq!(m.native_session_id.as_str(), "S-old");
    }

    #[test]
    fn resolve_for_filters_by_tool() {
        let repo = repo();
        let conv = ConversationId::from_raw("conv-tools");
        launch(&repo, &conv, CliTool::Gemini, "G-1", ExecutionStatus::Completed);
        launch(&repo, &conv, CliTool::Codex, "X-1", ExecutionStatus::Completed);
        let resolver = ResumeResolver::new(repo);
        assert_eq!(
            resolver
                .resolve_for(&conv, CliTool::Gemini)
                .unwrap()
                .unwrap()
                .native_session_id
                .as_str(),
            "G-1"
        );
        assert_eq!(
            resolver.resolve(&conv).unwrap().unwrap().native_session_id.as_str(),
            "X-1"
        );
        assert!(resolver.resolve_for(&conv, CliTool::Qwen).unwrap().is_none());
    }
}
