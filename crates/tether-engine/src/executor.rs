//! The execution façade: compose, record, launch, correlate, finalize.
//!
//! Each call owns its child process end to end. Launches share nothing but
//! the store, whose constraints arbitrate native-session ownership.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_core::{
    token, CliTool, ConversationId, DeleteScope, ExecutionEvent, ExecutionId, ExecutionStatus,
    NativeSessionId, TransactionId,
};
use tether_settings::TetherSettings;
use tether_store::{
    AttachOutcome, ExecutionRecord, ExecutionRepo, FinalizeOutcome, HistoryFilter, NewExecution,
    StoreError,
};
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::composer::{compose, ComposeInput, ComposedCommand, ToolProfile};
use crate::correlator::{MarkerCorrelator, SessionCorrelator};
use crate::error::{EngineError, LaunchError};
use crate::launcher::{LaunchOutcome, OutputChunk, ProcessLauncher, Supervision};
use crate::resolver::ResumeResolver;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine policy, normally derived from [`TetherSettings`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    pub grace_period: Duration,
    pub max_output_bytes: usize,
    pub marker_prefix: String,
    pub wrap_with_marker: bool,
    pub profiles: HashMap<CliTool, ToolProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&TetherSettings::default())
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let exec = &settings.execution;
        let profiles = CliTool::ALL
            .into_iter()
            .map(|tool| {
                let profile = ToolProfile::builtin(tool).with_override(settings.tools.get(tool));
                (tool, profile)
            })
            .collect();
        Self {
            default_timeout: Duration::from_millis(exec.default_timeout_ms),
            grace_period: Duration::from_millis(exec.grace_period_ms),
            max_output_bytes: exec.max_output_bytes,
            marker_prefix: exec.marker_prefix.clone(),
            wrap_with_marker: exec.wrap_with_marker,
            profiles,
        }
    }

    /// Replace the profile for `profile.tool`.
    pub fn with_profile(mut self, profile: ToolProfile) -> Self {
        let _ = self.profiles.insert(profile.tool, profile);
        self
    }

    fn profile(&self, tool: CliTool) -> ToolProfile {
        self.profiles
            .get(&tool)
            .cloned()
            .unwrap_or_else(|| ToolProfile::builtin(tool))
    }
}

/// One launch request.
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    pub tool: CliTool,
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Falls back to [`EngineConfig::default_timeout`].
    pub timeout: Option<Duration>,
    pub observer: Option<UnboundedSender<OutputChunk>>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteRequest {
    pub fn new(
        tool: CliTool,
        conversation_id: ConversationId,
        prompt: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool,
            conversation_id,
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            timeout: None,
            observer: None,
            cancel: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn observer(mut self, tx: UnboundedSender<OutputChunk>) -> Self {
        self.observer = Some(tx);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// What happened to the native session id of a launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOutcome {
    /// This launch now owns the reported native session.
    Attached,
    /// The launch resumed a session and the tool reported that same session;
    /// ownership stays with the record that first claimed it.
    Continued,
    /// Another live record already owns the reported session.
    Conflict,
    /// No marker or no session id in the output.
    Miss,
    /// Correlation was not attempted (killed, or the record was no longer
    /// eligible).
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub conversation_id: ConversationId,
    pub transaction_id: TransactionId,
    pub tool: CliTool,
    /// Session the conversation can be resumed with after this launch.
    pub native_session_id: Option<NativeSessionId>,
    pub resumed_from: Option<NativeSessionId>,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub mapping: MappingOutcome,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

#[derive(Clone)]
pub struct Executor {
    repo: ExecutionRepo,
    resolver: ResumeResolver,
    launcher: ProcessLauncher,
    config: Arc<EngineConfig>,
    correlators: Arc<HashMap<CliTool, Arc<dyn SessionCorrelator>>>,
    events: broadcast::Sender<ExecutionEvent>,
    mint: fn(&ConversationId) -> TransactionId,
}

/// A pending record, plus the session it could not continue when another
/// live launch already holds it.
struct PendingLaunch {
    record: ExecutionRecord,
    resumed_from: Option<NativeSessionId>,
    busy: Option<(NativeSessionId, Option<ExecutionId>)>,
}

impl Executor {
    pub fn new(repo: ExecutionRepo, config: EngineConfig) -> Self {
        let correlators = CliTool::ALL
            .into_iter()
            .map(|tool| {
                let profile = config.profile(tool);
                let correlator: Arc<dyn SessionCorrelator> = Arc::new(
                    MarkerCorrelator::new(config.marker_prefix.clone(), profile.session_pattern)
                        .with_window(profile.session_window),
                );
                (tool, correlator)
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            resolver: ResumeResolver::new(repo.clone()),
            launcher: ProcessLauncher::new(
                config.grace_period,
                config.max_output_bytes,
                config.wrap_with_marker,
            ),
            repo,
            config: Arc::new(config),
            correlators: Arc::new(correlators),
            events,
            mint: token::generate,
        }
    }

    /// Replace the transaction token generator.
    pub fn with_token_generator(mut self, mint: fn(&ConversationId) -> TransactionId) -> Self {
        self.mint = mint;
        self
    }

    /// Swap the correlation strategy for one tool.
    pub fn with_correlator(mut self, tool: CliTool, correlator: Arc<dyn SessionCorrelator>) -> Self {
        let mut map = (*self.correlators).clone();
        let _ = map.insert(tool, correlator);
        self.correlators = Arc::new(map);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn repo(&self) -> &ExecutionRepo {
        &self.repo
    }

    /// Launch a fresh session.
    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecutionResult, EngineError> {
        self.launch(req, None).await
    }

    /// Continue the conversation's last resumable session, or start fresh
    /// when there is none.
    pub async fn resume(&self, req: ExecuteRequest) -> Result<ExecutionResult, EngineError> {
        let target = self
            .resolve_resume_target(&req.conversation_id, Some(req.tool))
            .await?;
        if target.is_none() {
            info!(
                conversation_id = %req.conversation_id,
                tool = %req.tool,
                "no resumable session, starting fresh"
            );
        }
        self.launch(req, target).await
    }

    /// Native session a resume of `conversation_id` would continue.
    pub async fn resolve_resume_target(
        &self,
        conversation_id: &ConversationId,
        tool: Option<CliTool>,
    ) -> Result<Option<NativeSessionId>, EngineError> {
        let resolver = self.resolver.clone();
        let conv = conversation_id.clone();
        let mapping = blocking(move || match tool {
            Some(tool) => resolver.resolve_for(&conv, tool),
            None => resolver.resolve(&conv),
        })
        .await?;
        Ok(mapping.map(|m| m.native_session_id))
    }

    pub async fn list_history(&self, filter: HistoryFilter) -> Result<Vec<ExecutionRecord>, EngineError> {
        let repo = self.repo.clone();
        blocking(move || repo.query_history(&filter)).await
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<ExecutionRecord, EngineError> {
        let repo = self.repo.clone();
        let id = id.clone();
        blocking(move || repo.get(&id)).await
    }

    /// Returns whether a record was removed.
    pub async fn delete_execution(&self, id: &ExecutionId) -> Result<bool, EngineError> {
        let repo = self.repo.clone();
        let target = id.clone();
        let removed = blocking(move || repo.delete_one(&target)).await?;
        self.emit(ExecutionEvent::Deleted {
            scope: DeleteScope::One(id.clone()),
            removed: usize::from(removed),
        });
        Ok(removed)
    }

    pub async fn delete_by_tool(&self, tool: CliTool) -> Result<usize, EngineError> {
        let repo = self.repo.clone();
        let removed = blocking(move || repo.delete_by_tool(tool)).await?;
        self.emit(ExecutionEvent::Deleted {
            scope: DeleteScope::Tool(tool),
            removed,
        });
        Ok(removed)
    }

    pub async fn delete_all(&self) -> Result<usize, EngineError> {
        let repo = self.repo.clone();
        let removed = blocking(move || repo.delete_all()).await?;
        self.emit(ExecutionEvent::Deleted {
            scope: DeleteScope::All,
            removed,
        });
        Ok(removed)
    }

    async fn launch(
        &self,
        req: ExecuteRequest,
        resume: Option<NativeSessionId>,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();
        let profile = self.config.profile(req.tool);
        let transaction_id = (self.mint)(&req.conversation_id);

        let cmd = self.compose(&profile, &req, &transaction_id, resume.as_ref())?;

        let program = match self.launcher.locate(&cmd.program, &cmd.working_dir) {
            Ok(path) => path,
            Err(_) => {
                return Err(EngineError::ToolNotFound {
                    tool: req.tool,
                    program: cmd.program,
                })
            }
        };

        let PendingLaunch {
            record,
            resumed_from: resume,
            busy,
        } = self.create_pending(&req, &transaction_id, resume).await?;
        let execution_id = record.id;
        let cmd = if busy.is_some() {
            self.compose(&profile, &req, &transaction_id, None)?
        } else {
            cmd
        };

        let span = info_span!(
            "launch",
            execution_id = %execution_id,
            conversation_id = %req.conversation_id,
            tool = %req.tool,
        );

        async move {
            info!(%transaction_id, resumed_from = ?resume, "launch recorded");
            self.emit(ExecutionEvent::Created {
                execution_id: execution_id.clone(),
                conversation_id: req.conversation_id.clone(),
                transaction_id: transaction_id.clone(),
                tool: req.tool,
            });
            if let Some((session, holder)) = &busy {
                self.emit(ExecutionEvent::MappingConflict {
                    execution_id: execution_id.clone(),
                    conversation_id: req.conversation_id.clone(),
                    native_session_id: session.clone(),
                    holder: holder.clone(),
                });
            }

            let child = match self.launcher.spawn(&cmd, &program) {
                Ok(child) => child,
                Err(source) => {
                    return Err(self.spawn_failed(&req, &execution_id, source).await);
                }
            };

            let supervision = Supervision {
                execution_id: execution_id.clone(),
                timeout: req.timeout.unwrap_or(self.config.default_timeout),
                cancel: req.cancel.clone(),
                observer: req.observer.clone(),
            };
            let outcome = match self.launcher.supervise(child, cmd.stdin, supervision).await {
                Ok(outcome) => outcome,
                Err(source) => {
                    return Err(self.spawn_failed(&req, &execution_id, source).await);
                }
            };

            let (mapping, native_session_id) = if outcome.killed() {
                // Anything the tool printed is discarded; a killed launch
                // never claims a session.
                (MappingOutcome::Skipped, None)
            } else if busy.is_some() {
                // Ran fresh because its session was busy; the conversation
                // stays on the session it asked for.
                (MappingOutcome::Conflict, None)
            } else {
                match self
                    .correlate_and_attach(&req, &execution_id, &transaction_id, &outcome, resume.as_ref())
                    .await
                {
                    Ok(found) => found,
                    Err(e) => {
                        error!(error = %e, "could not record native session, finishing without it");
                        (MappingOutcome::Skipped, None)
                    }
                }
            };

            let status = if outcome.killed() {
                ExecutionStatus::Killed
            } else if outcome.exit_code == Some(0) {
                ExecutionStatus::Completed
            } else {
                ExecutionStatus::Failed
            };
            let status = self
                .finalize(&req.conversation_id, &execution_id, status, outcome.exit_code)
                .await?;

            info!(
                %status,
                exit_code = ?outcome.exit_code,
                ?mapping,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                truncated = outcome.truncated,
                "launch finished"
            );

            Ok(ExecutionResult {
                execution_id,
                conversation_id: req.conversation_id,
                transaction_id,
                tool: req.tool,
                native_session_id,
                resumed_from: resume,
                status,
                exit_code: outcome.exit_code,
                mapping,
                output: outcome.output,
                truncated: outcome.truncated,
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        .instrument(span)
        .await
    }

    fn compose(
        &self,
        profile: &ToolProfile,
        req: &ExecuteRequest,
        transaction_id: &TransactionId,
        resume: Option<&NativeSessionId>,
    ) -> Result<ComposedCommand, EngineError> {
        Ok(compose(
            profile,
            &ComposeInput {
                prompt: &req.prompt,
                working_dir: &req.working_dir,
                resume,
                token: transaction_id,
                conversation_id: &req.conversation_id,
                marker_prefix: &self.config.marker_prefix,
            },
        )?)
    }

    /// Record the launch. A resume whose session is busy in another live
    /// launch is recorded as a fresh launch instead.
    async fn create_pending(
        &self,
        req: &ExecuteRequest,
        transaction_id: &TransactionId,
        resume: Option<NativeSessionId>,
    ) -> Result<PendingLaunch, EngineError> {
        match self.insert_pending(req, transaction_id, resume.clone()).await {
            Ok(record) => Ok(PendingLaunch {
                record,
                resumed_from: resume,
                busy: None,
            }),
            Err(EngineError::Store(StoreError::ResumeClaimed { session, holder })) => {
                warn!(
                    native_session_id = %session,
                    holder = ?holder,
                    conversation_id = %req.conversation_id,
                    "session busy in another launch, starting fresh"
                );
                let record = self.insert_pending(req, transaction_id, None).await?;
                Ok(PendingLaunch {
                    record,
                    resumed_from: None,
                    busy: Some((session, holder)),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_pending(
        &self,
        req: &ExecuteRequest,
        transaction_id: &TransactionId,
        resumed_from: Option<NativeSessionId>,
    ) -> Result<ExecutionRecord, EngineError> {
        let repo = self.repo.clone();
        let conv = req.conversation_id.clone();
        let tool = req.tool;
        let txn = transaction_id.clone();
        let working_directory = req.working_dir.display().to_string();

        let created = blocking(move || {
            repo.create_pending(&NewExecution {
                conversation_id: &conv,
                tool,
                transaction_id: &txn,
                working_directory: &working_directory,
                resumed_from: resumed_from.as_ref(),
            })
        })
        .await;

        match created {
            Err(EngineError::Store(StoreError::DuplicateTransaction(txn))) => {
                error!(
                    transaction_id = %txn,
                    conversation_id = %req.conversation_id,
                    "transaction id generator produced a duplicate"
                );
                Err(EngineError::GeneratorCollision(txn))
            }
            other => other,
        }
    }

    async fn correlate_and_attach(
        &self,
        req: &ExecuteRequest,
        execution_id: &ExecutionId,
        transaction_id: &TransactionId,
        outcome: &LaunchOutcome,
        resume: Option<&NativeSessionId>,
    ) -> Result<(MappingOutcome, Option<NativeSessionId>), EngineError> {
        let Some(correlator) = self.correlators.get(&req.tool) else {
            return Ok((MappingOutcome::Skipped, None));
        };
        let Some(native) = correlator.correlate(&outcome.output, transaction_id) else {
            debug!("no native session in output");
            return Ok((MappingOutcome::Miss, None));
        };

        if resume == Some(&native) {
            debug!(native_session_id = %native, "tool continued the resumed session");
            return Ok((MappingOutcome::Continued, Some(native)));
        }

        let repo = self.repo.clone();
        let id = execution_id.clone();
        let claim = native.clone();
        let attached = blocking(move || repo.attach_native_session(&id, &claim)).await?;

        match attached {
            AttachOutcome::Attached => {
                info!(native_session_id = %native, "native session attached");
                self.emit(ExecutionEvent::NativeSessionAttached {
                    execution_id: execution_id.clone(),
                    conversation_id: req.conversation_id.clone(),
                    native_session_id: native.clone(),
                });
                Ok((MappingOutcome::Attached, Some(native)))
            }
            AttachOutcome::Conflict { holder } => {
                warn!(
                    native_session_id = %native,
                    holder = ?holder,
                    "native session claimed by another launch, continuing without it"
                );
                self.emit(ExecutionEvent::MappingConflict {
                    execution_id: execution_id.clone(),
                    conversation_id: req.conversation_id.clone(),
                    native_session_id: native,
                    holder,
                });
                Ok((MappingOutcome::Conflict, None))
            }
            AttachOutcome::Ineligible { status, existing } => {
                warn!(%status, existing = ?existing, "record no longer accepts a native session");
                Ok((MappingOutcome::Skipped, None))
            }
        }
    }

    /// Returns the status the record actually ended with.
    async fn finalize(
        &self,
        conversation_id: &ConversationId,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        exit_code: Option<i32>,
    ) -> Result<ExecutionStatus, EngineError> {
        let repo = self.repo.clone();
        let id = execution_id.clone();
        match blocking(move || repo.finalize(&id, status, exit_code)).await? {
            FinalizeOutcome::Finalized => {
                self.emit(ExecutionEvent::Finalized {
                    execution_id: execution_id.clone(),
                    conversation_id: conversation_id.clone(),
                    status,
                    exit_code,
                });
                Ok(status)
            }
            FinalizeOutcome::AlreadyTerminal(existing) => {
                debug!(%existing, requested = %status, "record already terminal");
                Ok(existing)
            }
        }
    }

    async fn spawn_failed(
        &self,
        req: &ExecuteRequest,
        execution_id: &ExecutionId,
        source: LaunchError,
    ) -> EngineError {
        error!(error = %source, "launch failed");
        if let Err(e) = self
            .finalize(&req.conversation_id, execution_id, ExecutionStatus::Failed, None)
            .await
        {
            error!(error = %e, "could not finalize failed launch");
        }
        EngineError::SpawnFailure {
            tool: req.tool,
            execution_id: execution_id.clone(),
            source,
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Run a store call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(format!("store task failed: {e}")))?
        .map_err(EngineError::from)
}
