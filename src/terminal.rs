use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::util::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalState {
    pub session_id: String,
    #[serde(default)]
    pub flags: String,
    pub terminal_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct TerminalRegistry {
    dir: PathBuf,
    terminal_id: String,
}

impl TerminalRegistry {
    /// Registry bound to the calling process's terminal.
    pub fn for_current_terminal(dir: impl Into<PathBuf>) -> Self {
        Self::with_terminal_id(dir, terminal_id())
    }

    pub fn with_terminal_id(dir: impl Into<PathBuf>, terminal_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            terminal_id: terminal_id.into(),
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.terminal_id))
    }

    /// Overwrites this terminal's record.
    pub fn save(&self, session_id: &str, flags: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create terminal registry {}", self.dir.display())
        })?;
        let state = TerminalState {
            session_id: session_id.to_string(),
            flags: flags.to_string(),
            terminal_id: self.terminal_id.clone(),
            timestamp: now_millis(),
        };
        let path = self.record_path();
        let payload = serde_json::to_string_pretty(&state)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to stage {}", path.display()))?;
        tmp.write_all(payload.as_bytes())?;
        tmp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::debug!(terminal = %self.terminal_id, session = session_id, "saved terminal state");
        Ok(())
    }

    pub fn load(&self) -> Option<TerminalState> {
        let raw = fs::read_to_string(self.record_path()).ok()?;
        serde_json::from_str::<TerminalState>(&raw)
            .ok()
            .filter(|state| !state.session_id.trim().is_empty())
    }

    pub fn last_session(&self) -> Option<String> {
        self.load().map(|state| state.session_id)
    }
}

/// Stable identifier for the controlling terminal, e.g. `pts-3`, or
/// `pid-<shell pid>` when stdin is not a terminal.
pub fn terminal_id() -> String {
    terminal_id_from(controlling_tty().as_deref(), parent_pid())
}

pub fn terminal_id_from(device: Option<&Path>, fallback_pid: u32) -> String {
    let Some(device) = device else {
        return format!("pid-{fallback_pid}");
    };
    let text = device.to_string_lossy();
    let relative = text.strip_prefix("/dev/").unwrap_or(&text);
    let sanitized: String = relative
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches('-');
    if sanitized.is_empty() {
        format!("pid-{fallback_pid}")
    } else {
        sanitized.to_string()
    }
}

fn controlling_tty() -> Option<PathBuf> {
    if !io::stdin().is_terminal() {
        return None;
    }

    #[cfg(target_os = "linux")]
    if let Ok(target) = fs::read_link("/proc/self/fd/0")
        && target.starts_with("/dev/")
    {
        return Some(target);
    }

    let output = Command::new("tty")
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let device = String::from_utf8_lossy(&output.stdout).trim().to_string();
    device.starts_with('/').then(|| PathBuf::from(device))
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    std::process::id()
}
