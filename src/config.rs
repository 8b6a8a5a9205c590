use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const SETTINGS_SCHEMA_VERSION: u32 = 3;
const DEFAULT_REFRESH_THRESHOLD_MINUTES: u64 = 120;
const DEFAULT_PICKER_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RECENT_SESSIONS: usize = 10;
const DEFAULT_INSTALL_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_LOCK_WAIT_SECONDS: u64 = 20;
pub const DEFAULT_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub const ENV_PERSIST_ROOT: &str = "AGENT_PERSIST_ROOT";
pub const ENV_CLAUDE_HOME: &str = "CLAUDE_CONFIG_DIR";
pub const ENV_CODEX_HOME: &str = "CODEX_HOME";
pub const ENV_CREDENTIALS: &str = "AGENT_PERSIST_CREDENTIALS";

/// Persistent roots probed for existing data, in priority order.
pub const ROOT_CANDIDATES: [&str; 2] = ["/workspace/.agent-persist", "/persist/.agent-persist"];

/// Filesystem locations, resolved once at startup.
///
/// Precedence for every entry: explicit environment override, then an existing
/// location discovered on disk, then the built-in default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub home: PathBuf,
    pub persist_root: PathBuf,
    pub claude_home: PathBuf,
    pub codex_home: PathBuf,
    pub credentials: PathBuf,
}

impl Paths {
    pub fn resolve() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::resolve_with(&home, |name| env::var(name).ok(), &ROOT_CANDIDATES)
    }

    pub fn resolve_with<F>(home: &Path, lookup: F, root_candidates: &[&str]) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let override_path = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };

        let persist_root = override_path(ENV_PERSIST_ROOT)
            .unwrap_or_else(|| discover_persist_root(home, root_candidates));
        let claude_home = override_path(ENV_CLAUDE_HOME).unwrap_or_else(|| home.join(".claude"));
        let codex_home = override_path(ENV_CODEX_HOME).unwrap_or_else(|| home.join(".codex"));
        let credentials = override_path(ENV_CREDENTIALS)
            .unwrap_or_else(|| claude_home.join(".credentials.json"));

        Self {
            home: home.to_path_buf(),
            persist_root,
            claude_home,
            codex_home,
            credentials,
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.persist_root.join("settings.json")
    }

    pub fn terminals_dir(&self) -> PathBuf {
        self.persist_root.join("terminals")
    }

    pub fn npm_prefix(&self) -> PathBuf {
        self.persist_root.join("npm-global")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.npm_prefix().join("bin")
    }

    pub fn persisted_claude_dir(&self) -> PathBuf {
        self.persist_root.join("claude")
    }

    pub fn persisted_claude_json(&self) -> PathBuf {
        self.persist_root.join("claude.json")
    }

    pub fn persisted_codex_dir(&self) -> PathBuf {
        self.persist_root.join("codex")
    }

    pub fn prompt_log(&self) -> PathBuf {
        self.claude_home.join("history.jsonl")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.claude_home.join("projects")
    }

    pub fn credentials_lock(&self) -> PathBuf {
        sibling_with_suffix(&self.credentials, ".lock")
    }

    pub fn credentials_backup(&self) -> PathBuf {
        sibling_with_suffix(&self.credentials, ".bak")
    }

    pub fn shell_rc(&self) -> PathBuf {
        self.home.join(".bashrc")
    }
}

fn discover_persist_root(home: &Path, candidates: &[&str]) -> PathBuf {
    let candidates: Vec<PathBuf> = candidates.iter().map(PathBuf::from).collect();
    if let Some(existing) = candidates.iter().find(|path| path.is_dir()) {
        return existing.clone();
    }
    if let Some(mountable) = candidates
        .iter()
        .find(|path| path.parent().is_some_and(Path::is_dir))
    {
        return mountable.clone();
    }
    home.join(".agent-persist")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistSettings {
    pub schema_version: u32,
    pub oauth: OAuthSettings,
    pub refresh_threshold_minutes: u64,
    pub picker_timeout_seconds: u64,
    pub recent_sessions: usize,
    pub install_timeout_seconds: u64,
    pub claude_command: String,
    pub resume_flag: String,
    pub tools: Vec<ToolInstall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OAuthSettings {
    pub token_url: String,
    pub client_id: String,
    pub http_timeout_seconds: u64,
}

/// An external CLI that the installer makes sure is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolInstall {
    pub command: String,
    pub package: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub refresh_threshold: Duration,
    pub picker_timeout: Duration,
    pub install_timeout: Duration,
    pub http_timeout: Duration,
    pub lock_wait: Duration,
    pub recent_sessions: usize,
}

impl Default for PersistSettings {
    fn default() -> Self {
        Self {
            schema_version: SETTINGS_SCHEMA_VERSION,
            oauth: OAuthSettings::default(),
            refresh_threshold_minutes: DEFAULT_REFRESH_THRESHOLD_MINUTES,
            picker_timeout_seconds: DEFAULT_PICKER_TIMEOUT_SECONDS,
            recent_sessions: DEFAULT_RECENT_SESSIONS,
            install_timeout_seconds: DEFAULT_INSTALL_TIMEOUT_SECONDS,
            claude_command: "claude".to_string(),
            resume_flag: "--resume".to_string(),
            tools: default_tools(),
        }
    }
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: DEFAULT_OAUTH_CLIENT_ID.to_string(),
            http_timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECONDS,
        }
    }
}

fn default_tools() -> Vec<ToolInstall> {
    vec![
        ToolInstall {
            command: "claude".to_string(),
            package: "@anthropic-ai/claude-code".to_string(),
        },
        ToolInstall {
            command: "codex".to_string(),
            package: "@openai/codex".to_string(),
        },
    ]
}

impl PersistSettings {
    /// Reads `settings.json`, writing defaults on first run and persisting any
    /// normalization applied to an older file.
    pub fn load_or_init(paths: &Paths) -> Result<Self> {
        let path = paths.settings_path();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: PersistSettings = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save(paths)?;
            }
            Ok(parsed)
        } else {
            let settings = PersistSettings::default();
            settings.save(paths)?;
            Ok(settings)
        }
    }

    /// Like [`load_or_init`](Self::load_or_init) but never fails; shell hooks
    /// must keep working on a read-only or unmounted persistent root.
    pub fn load_or_default(paths: &Paths) -> Self {
        match Self::load_or_init(paths) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!(error = %err, "using default settings");
                let mut settings = PersistSettings::default();
                settings.normalize_and_migrate();
                settings
            }
        }
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        let path = paths.settings_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create settings directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn runtime(&self) -> RuntimeSettings {
        RuntimeSettings {
            refresh_threshold: Duration::from_secs(
                self.refresh_threshold_minutes.saturating_mul(60),
            ),
            picker_timeout: Duration::from_secs(self.picker_timeout_seconds),
            install_timeout: Duration::from_secs(self.install_timeout_seconds),
            http_timeout: Duration::from_secs(self.oauth.http_timeout_seconds),
            lock_wait: Duration::from_secs(DEFAULT_LOCK_WAIT_SECONDS),
            recent_sessions: self.recent_sessions,
        }
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < SETTINGS_SCHEMA_VERSION {
            self.schema_version = SETTINGS_SCHEMA_VERSION;
            changed = true;
        }

        let defaults = OAuthSettings::default();
        if normalize_required_string(&mut self.oauth.token_url, &defaults.token_url) {
            changed = true;
        }
        if normalize_required_string(&mut self.oauth.client_id, &defaults.client_id) {
            changed = true;
        }
        if normalize_required_string(&mut self.claude_command, "claude") {
            changed = true;
        }
        if normalize_required_string(&mut self.resume_flag, "--resume") {
            changed = true;
        }

        for (value, default) in [
            (
                &mut self.refresh_threshold_minutes,
                DEFAULT_REFRESH_THRESHOLD_MINUTES,
            ),
            (
                &mut self.picker_timeout_seconds,
                DEFAULT_PICKER_TIMEOUT_SECONDS,
            ),
            (
                &mut self.install_timeout_seconds,
                DEFAULT_INSTALL_TIMEOUT_SECONDS,
            ),
            (
                &mut self.oauth.http_timeout_seconds,
                DEFAULT_HTTP_TIMEOUT_SECONDS,
            ),
        ] {
            if *value == 0 {
                *value = default;
                changed = true;
            }
        }
        if self.recent_sessions == 0 {
            self.recent_sessions = DEFAULT_RECENT_SESSIONS;
            changed = true;
        }

        let before = self.tools.len();
        self.tools.retain(|tool| {
            !tool.command.trim().is_empty() && !tool.package.trim().is_empty()
        });
        if self.tools.len() != before {
            changed = true;
        }

        changed
    }
}

fn normalize_required_string(value: &mut String, default: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        *value = default.to_string();
        return true;
    }
    if trimmed != value {
        *value = trimmed.to_string();
        return true;
    }
    false
}
