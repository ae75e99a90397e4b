//! Tool profiles and command composition.
//!
//! A [`ToolProfile`] describes how one assistant CLI takes a prompt, how it is
//! told to continue a prior session, and how it prints its session id.
//! [`compose`] turns a profile plus a request into the exact argv, env and
//! stdin payload for one launch. Composition has no side effects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tether_core::{CliTool, ConversationId, NativeSessionId, TransactionId};
use tether_settings::ToolOverride;

use crate::correlator::DEFAULT_SESSION_WINDOW;
use crate::error::ComposeError;

/// Placeholder replaced by the native session id in resume arguments.
pub const SESSION_PLACEHOLDER: &str = "{session}";

pub const ENV_TRANSACTION_ID: &str = "TETHER_TRANSACTION_ID";
pub const ENV_CONVERSATION_ID: &str = "TETHER_CONVERSATION_ID";
pub const ENV_MARKER_PREFIX: &str = "TETHER_MARKER_PREFIX";

static GEMINI_SESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Session ID:\s*([A-Za-z0-9][A-Za-z0-9._:-]*)").unwrap());
static CLAUDE_SESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""session_id"\s*:\s*"([^"\s]+)""#).unwrap());
static CODEX_SESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)session id:\s*([A-Za-z0-9][A-Za-z0-9._:-]*)").unwrap());

/// How the prompt reaches the tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptDelivery {
    /// `<flag> <prompt>`.
    Flag(String),
    /// Prompt as the final argument.
    Positional,
    /// Prompt written to stdin, which is then closed. `marker`, when set, is
    /// appended as the last argument (e.g. `-`).
    Stdin { marker: Option<String> },
}

#[derive(Clone, Debug)]
pub struct ToolProfile {
    pub tool: CliTool,
    pub program: String,
    pub base_args: Vec<String>,
    /// Inserted after `base_args` when resuming; `{session}` is substituted.
    pub resume_args: Vec<String>,
    pub prompt: PromptDelivery,
    /// One capture group holding the native session id.
    pub session_pattern: Option<Regex>,
    /// Lines after the marker searched for the session id.
    pub session_window: usize,
    pub env: BTreeMap<String, String>,
}

impl ToolProfile {
    /// Built-in invocation conventions of each supported CLI.
    pub fn builtin(tool: CliTool) -> Self {
        let base = Self::new(tool, tool.as_str());
        match tool {
            CliTool::Gemini | CliTool::Qwen => base
                .resume_args(["--resume", SESSION_PLACEHOLDER])
                .prompt(PromptDelivery::Flag("--prompt".into()))
                .session_pattern(GEMINI_SESSION.clone()),
            CliTool::Claude => base
                .base_args(["--output-format", "stream-json", "--verbose"])
                .resume_args(["--resume", SESSION_PLACEHOLDER])
                .prompt(PromptDelivery::Flag("-p".into()))
                .session_pattern(CLAUDE_SESSION.clone()),
            CliTool::Codex => base
                .base_args(["exec"])
                .resume_args(["resume", SESSION_PLACEHOLDER])
                .prompt(PromptDelivery::Stdin {
                    marker: Some("-".into()),
                })
                .session_pattern(CODEX_SESSION.clone()),
        }
    }

    /// Bare profile: positional prompt, no resume support, no session pattern.
    pub fn new(tool: CliTool, program: impl Into<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            base_args: Vec::new(),
            resume_args: Vec::new(),
            prompt: PromptDelivery::Positional,
            session_pattern: None,
            session_window: DEFAULT_SESSION_WINDOW,
            env: BTreeMap::new(),
        }
    }

    pub fn base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn resume_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resume_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn prompt(mut self, delivery: PromptDelivery) -> Self {
        self.prompt = delivery;
        self
    }

    pub fn session_pattern(mut self, pattern: Regex) -> Self {
        self.session_pattern = Some(pattern);
        self
    }

    pub fn session_window(mut self, lines: usize) -> Self {
        self.session_window = lines;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.env.insert(key.into(), value.into());
        self
    }

    /// Layer a settings override: replace the program, append args, add env.
    pub fn with_override(mut self, over: &ToolOverride) -> Self {
        if let Some(binary) = over.binary.as_ref().filter(|b| !b.trim().is_empty()) {
            self.program.clone_from(binary);
        }
        self.base_args.extend(over.extra_args.iter().cloned());
        self.env
            .extend(over.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn supports_resume(&self) -> bool {
        !self.resume_args.is_empty()
    }
}

/// Inputs of one launch.
#[derive(Clone, Debug)]
pub struct ComposeInput<'a> {
    pub prompt: &'a str,
    pub working_dir: &'a Path,
    pub resume: Option<&'a NativeSessionId>,
    pub token: &'a TransactionId,
    pub conversation_id: &'a ConversationId,
    pub marker_prefix: &'a str,
}

/// Fully resolved invocation, ready for the launcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposedCommand {
    pub tool: CliTool,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub working_dir: PathBuf,
}

pub fn compose(profile: &ToolProfile, input: &ComposeInput<'_>) -> Result<ComposedCommand, ComposeError> {
    if profile.program.trim().is_empty() {
        return Err(ComposeError::EmptyProgram { tool: profile.tool });
    }
    if input.prompt.trim().is_empty() {
        return Err(ComposeError::InvalidPrompt("prompt is empty"));
    }
    if input.prompt.contains('\0') {
        return Err(ComposeError::InvalidPrompt("prompt contains a NUL byte"));
    }
    if !input.working_dir.is_dir() {
        return Err(ComposeError::InvalidWorkingDirectory(
            input.working_dir.to_path_buf(),
        ));
    }

    let mut args = profile.base_args.clone();

    // A profile without resume arguments cannot continue a session; the
    // launch starts fresh.
    if let Some(session) = input.resume {
        args.extend(
            profile
                .resume_args
                .iter()
                .map(|a| a.replace(SESSION_PLACEHOLDER, session.as_str())),
        );
    }

    let stdin = match &profile.prompt {
        PromptDelivery::Flag(flag) => {
            args.push(flag.clone());
            args.push(input.prompt.to_string());
            None
        }
        PromptDelivery::Positional => {
            args.push(input.prompt.to_string());
            None
        }
        PromptDelivery::Stdin { marker } => {
            args.extend(marker.iter().cloned());
            Some(input.prompt.to_string())
        }
    };

    let mut env: Vec<(String, String)> = profile
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push((ENV_TRANSACTION_ID.into(), input.token.to_string()));
    env.push((ENV_CONVERSATION_ID.into(), input.conversation_id.to_string()));
    env.push((ENV_MARKER_PREFIX.into(), input.marker_prefix.to_string()));

    Ok(ComposedCommand {
        tool: profile.tool,
        program: profile.program.clone(),
        args,
        env,
        stdin,
        working_dir: input.working_dir.to_path_buf(),
    })
}
