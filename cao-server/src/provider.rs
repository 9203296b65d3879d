//! Provider table: the backend CLIs an agent terminal can run.
//!
//! Completion detection by output scraping is inherently provider-specific,
//! so the ready-prompt regex, launch command, and exit command are kept here
//! as data. Nothing else in the server branches on the provider.

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    QCli,
    KiroCli,
    ClaudeCode,
    CodexCli,
    GeminiCli,
}

// A bare `>` prompt at the end of the pane. Most agent TUIs settle on this.
static ANGLE_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*>\s*$").unwrap());
// Claude Code draws its input box with a `│ >` gutter or a `❯` chevron.
static CLAUDE_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:│\s*)?[>❯]\s*$").unwrap());
// Gemini CLI renders the input row as `> │` with a trailing cursor cell.
static GEMINI_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*>\s*(?:│\s*)?$").unwrap());

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::QCli,
        ProviderKind::KiroCli,
        ProviderKind::ClaudeCode,
        ProviderKind::CodexCli,
        ProviderKind::GeminiCli,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::QCli => "q_cli",
            ProviderKind::KiroCli => "kiro_cli",
            ProviderKind::ClaudeCode => "claude_code",
            ProviderKind::CodexCli => "codex_cli",
            ProviderKind::GeminiCli => "gemini_cli",
        }
    }

    /// The command launched inside the new terminal. Providers that support
    /// named agent configurations get the profile on the command line; the
    /// rest pick profiles up from their own config files.
    pub fn launch_command(self, agent_profile: &str) -> String {
        match self {
            ProviderKind::QCli => format!("q chat --agent {agent_profile}"),
            ProviderKind::KiroCli => format!("kiro chat --agent {agent_profile}"),
            ProviderKind::ClaudeCode => "claude".to_string(),
            ProviderKind::CodexCli => "codex".to_string(),
            ProviderKind::GeminiCli => "gemini".to_string(),
        }
    }

    /// Regex matching the provider's idle prompt on an ANSI-stripped pane.
    pub fn ready_pattern(self) -> &'static Regex {
        match self {
            ProviderKind::QCli | ProviderKind::KiroCli | ProviderKind::CodexCli => &ANGLE_PROMPT,
            ProviderKind::ClaudeCode => &CLAUDE_PROMPT,
            ProviderKind::GeminiCli => &GEMINI_PROMPT,
        }
    }

    /// Slash command that terminates the provider's interactive session.
    pub fn exit_command(self) -> &'static str {
        match self {
            ProviderKind::QCli | ProviderKind::KiroCli => "/quit",
            ProviderKind::ClaudeCode | ProviderKind::CodexCli => "/exit",
            ProviderKind::GeminiCli => "/quit",
        }
    }
}

impl Default for ProviderKind {
    fn default() -> Self {
        ProviderKind::QCli
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "q_cli" => Ok(ProviderKind::QCli),
            "kiro_cli" => Ok(ProviderKind::KiroCli),
            "claude_code" => Ok(ProviderKind::ClaudeCode),
            "codex_cli" => Ok(ProviderKind::CodexCli),
            "gemini_cli" => Ok(ProviderKind::GeminiCli),
            other => Err(format!(
                "unknown provider '{other}' (expected one of: q_cli, kiro_cli, claude_code, codex_cli, gemini_cli)"
            )),
        }
    }
}
