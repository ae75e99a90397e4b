//! Per-tool overrides layered over the engine's built-in tool profiles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tether_core::CliTool;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolOverride {
    /// Replacement program (name on `PATH` or absolute path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Arguments appended after the built-in base arguments.
    pub extra_args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub gemini: ToolOverride,
    pub claude: ToolOverride,
    pub codex: ToolOverride,
    pub qwen: ToolOverride,
}

impl ToolSettings {
    pub fn get(&self, tool: CliTool) -> &ToolOverride {
        match tool {
            CliTool::Gemini => &self.gemini,
            CliTool::Claude => &self.claude,
            CliTool::Codex => &self.codex,
            CliTool::Qwen => &self.qwen,
        }
    }

    pub fn get_mut(&mut self, tool: CliTool) -> &mut ToolOverride {
        match tool {
            CliTool::Gemini => &mut self.gemini,
            CliTool::Claude => &mut self.claude,
            CliTool::Codex => &mut self.codex,
            CliTool::Qwen => &mut self.qwen,
        }
    }
}
