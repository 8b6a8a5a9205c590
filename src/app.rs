use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{Paths, PersistSettings};
use crate::install::{self, ToolOutcome};
use crate::picker::{CliLauncher, Picker, TerminalInput, count_running_instances, write_rows};
use crate::session::SessionRegistry;
use crate::terminal::TerminalRegistry;
use crate::token::{
    AutoRefreshOutcome, RefreshError, TokenEndpoint, TokenRefresher, TokenStatus,
};
use crate::util::{format_local_millis, now_local, now_millis};

const LOGIN_HINT: &str = "Run `claude /login` to sign in again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMode {
    Auto,
    Status,
    Force,
}

pub fn run_token(paths: &Paths, settings: &PersistSettings, mode: TokenMode) -> Result<u8> {
    let runtime = settings.runtime();
    let refresher = TokenRefresher::from_settings(paths, &settings.oauth, &runtime);
    token_command(&refresher, mode, &mut io::stdout(), &mut io::stderr())
}

/// Exit code per mode: only a failed forced refresh is non-zero.
pub fn token_command<E: TokenEndpoint>(
    refresher: &TokenRefresher<E>,
    mode: TokenMode,
    out: &mut dyn Write,
    err_out: &mut dyn Write,
) -> Result<u8> {
    match mode {
        TokenMode::Status => {
            let now = now_millis();
            let status = refresher.status_at(now);
            match (&status, refresher.remaining_text(now)) {
                (TokenStatus::ValidWithHours(_), Some(remaining)) => {
                    writeln!(out, "{status} ({remaining} left)")?
                }
                _ => writeln!(out, "{status}")?,
            }
            Ok(0)
        }
        TokenMode::Force => match refresher.refresh() {
            Ok(expires_at) => {
                writeln!(
                    out,
                    "Claude token refreshed; valid until {}",
                    format_local_millis(expires_at)
                )?;
                Ok(0)
            }
            Err(err) => {
                report_refresh_error(err_out, &err)?;
                Ok(1)
            }
        },
        TokenMode::Auto => {
            match refresher.auto_refresh_if_needed() {
                Ok(AutoRefreshOutcome::Refreshed { expires_at }) => writeln!(
                    err_out,
                    "Claude token refreshed; valid until {}",
                    format_local_millis(expires_at)
                )?,
                Ok(AutoRefreshOutcome::NotNeeded(status)) => {
                    debug!(%status, "token refresh not needed");
                }
                Ok(AutoRefreshOutcome::RefreshedElsewhere(status)) => {
                    debug!(%status, "token refreshed by another terminal");
                }
                Err(err) => report_refresh_error(err_out, &err)?,
            }
            Ok(0)
        }
    }
}

fn report_refresh_error(err_out: &mut dyn Write, err: &RefreshError) -> io::Result<()> {
    writeln!(err_out, "agent-persist: token refresh failed: {err}")?;
    if err.needs_login() {
        writeln!(err_out, "{LOGIN_HINT}")?;
    }
    Ok(())
}

pub fn run_menu(paths: &Paths, settings: &PersistSettings, flags: Vec<String>) -> Result<u8> {
    if !io::stdin().is_terminal() || !io::stdout().is_terminal() {
        debug!("not attached to a terminal; skipping menu");
        return Ok(0);
    }

    let runtime = settings.runtime();
    let registry = SessionRegistry::new(paths.prompt_log(), paths.transcripts_dir());
    let terminals = TerminalRegistry::for_current_terminal(paths.terminals_dir());
    let picker = Picker {
        registry: &registry,
        terminals: &terminals,
        recent_limit: runtime.recent_sessions,
        timeout: runtime.picker_timeout,
        flags,
        other_instances: count_running_instances(&settings.claude_command),
    };
    let mut launcher = CliLauncher::new(&settings.claude_command, &settings.resume_flag);
    let mut stdout = io::stdout();

    match picker.run(&mut TerminalInput, &mut launcher, &mut stdout) {
        Ok(outcome) => debug!(?outcome, "menu finished"),
        Err(err) => eprintln!("agent-persist: menu failed: {err:#}"),
    }
    Ok(0)
}

pub fn print_sessions(
    paths: &Paths,
    settings: &PersistSettings,
    limit: Option<usize>,
) -> Result<u8> {
    let registry = SessionRegistry::new(paths.prompt_log(), paths.transcripts_dir());
    let limit = limit.unwrap_or(settings.recent_sessions);
    let rows = registry
        .recent_rows(limit, now_millis())
        .with_context(|| format!("failed to read {}", registry.prompt_log().display()))?;

    if rows.is_empty() {
        println!(
            "No sessions recorded in {}",
            registry.prompt_log().display()
        );
        return Ok(0);
    }
    let mut stdout = io::stdout().lock();
    write_rows(&mut stdout, &rows)?;
    stdout.flush()?;
    Ok(0)
}

pub fn run_install(paths: &Paths, settings: &PersistSettings, skip_binaries: bool) -> Result<u8> {
    let exe = env::current_exe().context("failed to locate the agent-persist binary")?;
    let runtime = settings.runtime();
    let report = install::run(
        paths,
        &settings.tools,
        &exe,
        runtime.install_timeout,
        skip_binaries,
    );

    println!("agent-persist install");
    println!("persist_root: {}", paths.persist_root.display());
    if report.layout.applied.is_empty() && report.layout.failures.is_empty() {
        println!("[OK] Layout already in place.");
    }
    for step in &report.layout.applied {
        println!("[OK] {step}");
    }
    for (command, outcome) in &report.tools {
        match outcome {
            ToolOutcome::AlreadyPresent => println!("[OK] {command} already installed."),
            ToolOutcome::Installed => println!("[OK] {command} installed."),
            ToolOutcome::Failed(_) | ToolOutcome::TimedOut => {}
        }
    }
    if report.hook_updated {
        println!("[OK] Shell hook written to {}.", paths.shell_rc().display());
    }
    for warning in &report.warnings {
        println!("[WARN] {warning}");
    }
    Ok(0)
}

pub fn print_shell_init(paths: &Paths) -> Result<u8> {
    let exe = env::current_exe().unwrap_or_else(|err| {
        debug!(error = %err, "current executable unknown; relying on PATH");
        PathBuf::from("agent-persist")
    });
    print!("{}", install::shell_init_script(&exe, paths));
    Ok(0)
}

pub fn print_status(paths: &Paths, settings: &PersistSettings) -> Result<()> {
    let runtime = settings.runtime();
    let refresher = TokenRefresher::from_settings(paths, &settings.oauth, &runtime);
    let terminals = TerminalRegistry::for_current_terminal(paths.terminals_dir());
    let now = now_millis();

    println!("agent-persist status ({})", now_local());
    println!("persist_root: {}", paths.persist_root.display());
    print_home("claude_home", &paths.claude_home);
    print_home("codex_home", &paths.codex_home);
    println!("credentials: {}", paths.credentials.display());
    println!("token: {}", refresher.status_at(now));
    if let Some(remaining) = refresher.remaining_text(now) {
        println!("token_remaining: {remaining}");
    }
    println!("terminal: {}", terminals.terminal_id());
    match terminals.load() {
        Some(state) => println!(
            "last_session: {} ({})",
            state.session_id,
            format_local_millis(state.timestamp)
        ),
        None => println!("last_session: none"),
    }
    Ok(())
}

fn print_home(label: &str, path: &Path) {
    match fs::read_link(path) {
        Ok(target) => println!("{label}: {} -> {}", path.display(), target.display()),
        Err(_) => println!("{label}: {}", path.display()),
    }
}

pub fn doctor(paths: &Paths, settings: &PersistSettings) -> Result<u8> {
    let mut issues = 0usize;

    println!("agent-persist doctor");
    println!("persist_root: {}", paths.persist_root.display());

    if root_writable(&paths.persist_root) {
        println!("[OK] Persistent root is writable.");
    } else {
        issues += 1;
        println!("[WARN] Persistent root is missing or not writable.");
    }

    let pending = install::plan(&install::desired_layout(paths));
    if pending.is_empty() {
        println!("[OK] Layout matches the persistent root.");
    } else {
        issues += 1;
        println!(
            "[WARN] Layout has {} pending step(s); run `agent-persist install`.",
            pending.len()
        );
        for action in &pending {
            println!("       {}", action.describe());
        }
    }

    let runtime = settings.runtime();
    let status = TokenRefresher::from_settings(paths, &settings.oauth, &runtime).status();
    match status {
        TokenStatus::ValidWithHours(_) | TokenStatus::ApiKey => println!("[OK] {status}."),
        TokenStatus::NoCredentialFile => {
            issues += 1;
            println!("[WARN] {status}. {LOGIN_HINT}");
        }
        TokenStatus::Expired => {
            issues += 1;
            println!("[WARN] {status}; run `agent-persist token --force`.");
        }
        TokenStatus::EmptyFile
        | TokenStatus::Unreadable
        | TokenStatus::Malformed
        | TokenStatus::NoExpiryField => {
            issues += 1;
            println!("[WARN] {status}. {LOGIN_HINT}");
        }
    }

    for tool in &settings.tools {
        if paths.bin_dir().join(&tool.command).exists() || install::command_available(&tool.command)
        {
            println!("[OK] {} command available.", tool.command);
        } else {
            issues += 1;
            println!("[WARN] {} command not found.", tool.command);
        }
    }

    if install::shell_hook_installed(&paths.shell_rc()) {
        println!("[OK] Shell hook present in {}.", paths.shell_rc().display());
    } else {
        issues += 1;
        println!("[WARN] Shell hook missing from {}.", paths.shell_rc().display());
    }

    let registry = SessionRegistry::new(paths.prompt_log(), paths.transcripts_dir());
    match registry.recent_sessions(usize::MAX) {
        Ok(sessions) => println!("[INFO] {} session(s) in the prompt log.", sessions.len()),
        Err(err) => println!("[INFO] Prompt log unreadable: {err}"),
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn root_writable(root: &Path) -> bool {
    root.is_dir() && NamedTempFile::new_in(root).is_ok()
}
