use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Local;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Paths, ToolInstall};
use crate::util::shell_escape_single;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const HOOK_BEGIN: &str = "# >>> agent-persist >>>";
const HOOK_END: &str = "# <<< agent-persist <<<";
pub const MENU_GUARD_ENV: &str = "AGENT_PERSIST_MENU_SHOWN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desired {
    Directory,
    Symlink { target: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub path: PathBuf,
    pub desired: Desired,
}

impl LayoutEntry {
    fn dir(path: PathBuf) -> Self {
        Self {
            path,
            desired: Desired::Directory,
        }
    }

    fn link(path: PathBuf, target: PathBuf) -> Self {
        Self {
            path,
            desired: Desired::Symlink { target },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutAction {
    CreateDir(PathBuf),
    Link { path: PathBuf, target: PathBuf },
    Relink { path: PathBuf, target: PathBuf },
    /// Move existing local data into the empty persistent target, then link.
    Adopt { path: PathBuf, target: PathBuf },
    /// Persistent target already has data; keep it and set local data aside.
    BackupAndLink { path: PathBuf, target: PathBuf },
}

impl LayoutAction {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateDir(path) => format!("create {}", path.display()),
            Self::Link { path, target } => {
                format!("link {} -> {}", path.display(), target.display())
            }
            Self::Relink { path, target } => {
                format!("relink {} -> {}", path.display(), target.display())
            }
            Self::Adopt { path, target } => {
                format!("move {} into {} and link", path.display(), target.display())
            }
            Self::BackupAndLink { path, target } => format!(
                "back up {} and link to existing {}",
                path.display(),
                target.display()
            ),
        }
    }
}

pub fn desired_layout(paths: &Paths) -> Vec<LayoutEntry> {
    let mut entries = vec![
        LayoutEntry::dir(paths.persist_root.clone()),
        LayoutEntry::dir(paths.persisted_claude_dir()),
        LayoutEntry::dir(paths.persisted_codex_dir()),
        LayoutEntry::dir(paths.terminals_dir()),
        LayoutEntry::dir(paths.npm_prefix()),
    ];

    let links = [
        (paths.claude_home.clone(), paths.persisted_claude_dir()),
        (paths.home.join(".claude.json"), paths.persisted_claude_json()),
        (paths.codex_home.clone(), paths.persisted_codex_dir()),
    ];
    for (path, target) in links {
        // An override that already points into the persistent root needs no link.
        if path.starts_with(&paths.persist_root) {
            continue;
        }
        entries.push(LayoutEntry::link(path, target));
    }
    entries
}

pub fn plan(entries: &[LayoutEntry]) -> Vec<LayoutAction> {
    entries.iter().filter_map(plan_entry).collect()
}

fn plan_entry(entry: &LayoutEntry) -> Option<LayoutAction> {
    let path = entry.path.clone();
    match &entry.desired {
        Desired::Directory => (!path.is_dir()).then_some(LayoutAction::CreateDir(path)),
        Desired::Symlink { target } => {
            let target = target.clone();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                return Some(LayoutAction::Link { path, target });
            };
            if meta.file_type().is_symlink() {
                let current = fs::read_link(&path).ok();
                return (current.as_deref() != Some(target.as_path()))
                    .then_some(LayoutAction::Relink { path, target });
            }
            if has_data(&target) {
                Some(LayoutAction::BackupAndLink { path, target })
            } else {
                Some(LayoutAction::Adopt { path, target })
            }
        }
    }
}

fn has_data(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        Ok(_) => true,
        Err(_) => false,
    }
}

#[derive(Debug, Default)]
pub struct LayoutReport {
    pub applied: Vec<String>,
    pub failures: Vec<String>,
}

/// Applies every action, collecting failures instead of stopping at the first.
pub fn apply(actions: &[LayoutAction]) -> LayoutReport {
    let mut report = LayoutReport::default();
    for action in actions {
        match apply_action(action) {
            Ok(()) => {
                info!(action = %action.describe(), "layout updated");
                report.applied.push(action.describe());
            }
            Err(err) => {
                let message = format!("{}: {err:#}", action.describe());
                warn!(%message, "layout step failed");
                report.failures.push(message);
            }
        }
    }
    report
}

fn apply_action(action: &LayoutAction) -> Result<()> {
    match action {
        LayoutAction::CreateDir(path) => fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display())),
        LayoutAction::Link { path, target } => link(path, target),
        LayoutAction::Relink { path, target } => {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale link {}", path.display()))?;
            link(path, target)
        }
        LayoutAction::Adopt { path, target } => {
            if target.is_dir() {
                // Empty placeholder created by an earlier step.
                fs::remove_dir(target)
                    .with_context(|| format!("failed to clear {}", target.display()))?;
            }
            move_path(path, target)?;
            link(path, target)
        }
        LayoutAction::BackupAndLink { path, target } => {
            let backup = backup_path(path);
            fs::rename(path, &backup).with_context(|| {
                format!("failed to move {} to {}", path.display(), backup.display())
            })?;
            link(path, target)
        }
    }
}

fn link(path: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    symlink(target, path)
        .with_context(|| format!("failed to link {} -> {}", path.display(), target.display()))
}

#[cfg(unix)]
fn symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinked layout requires a unix filesystem",
    ))
}

/// Rename, falling back to copy + delete across filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    debug!(from = %from.display(), to = %to.display(), "rename failed; copying");
    if from.is_dir() {
        copy_tree(from, to)?;
        fs::remove_dir_all(from)
            .with_context(|| format!("failed to remove {}", from.display()))?;
    } else {
        fs::copy(from, to)
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        fs::remove_file(from).with_context(|| format!("failed to remove {}", from.display()))?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.with_context(|| format!("failed to walk {}", from.display()))?;
        let relative = entry.path().strip_prefix(from)?;
        let dest = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            symlink(&link_target, &dest)?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
        }
    }
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".bak-{stamp}"));
    path.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Runs `command` to completion or kills it once `timeout` elapses.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<StepOutcome> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn install step")?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to query install step")? {
            return Ok(if status.success() {
                StepOutcome::Succeeded
            } else {
                StepOutcome::Failed(format!("exited with {status}"))
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(StepOutcome::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    AlreadyPresent,
    Installed,
    Failed(String),
    TimedOut,
}

pub fn ensure_tool(tool: &ToolInstall, paths: &Paths, timeout: Duration) -> ToolOutcome {
    if paths.bin_dir().join(&tool.command).exists() || command_available(&tool.command) {
        return ToolOutcome::AlreadyPresent;
    }
    if !command_available("npm") {
        return ToolOutcome::Failed("npm not found in PATH".to_string());
    }

    info!(package = %tool.package, "installing");
    let mut command = Command::new("npm");
    command
        .args(["install", "-g", &tool.package])
        .env("NPM_CONFIG_PREFIX", paths.npm_prefix());
    match run_with_timeout(&mut command, timeout) {
        Ok(StepOutcome::Succeeded) => ToolOutcome::Installed,
        Ok(StepOutcome::Failed(reason)) => ToolOutcome::Failed(reason),
        Ok(StepOutcome::TimedOut) => ToolOutcome::TimedOut,
        Err(err) => ToolOutcome::Failed(format!("{err:#}")),
    }
}

pub fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Shell code evaluated from the rc file on every shell start.
pub fn shell_init_script(exe: &Path, paths: &Paths) -> String {
    let exe = shell_escape_single(&exe.display().to_string());
    let bin = paths.bin_dir().display().to_string();
    let bin_quoted = shell_escape_single(&bin);
    format!(
        r#"case ":$PATH:" in
  *:{bin_quoted}:*) ;;
  *) export PATH={bin_quoted}:"$PATH" ;;
esac
{exe} token || true
if [ -t 0 ] && [ -t 1 ] && [ -z "${{{MENU_GUARD_ENV}:-}}" ]; then
  case $- in
    *i*) export {MENU_GUARD_ENV}=1; {exe} menu || true ;;
  esac
fi
"#
    )
}

pub fn shell_hook_installed(rc: &Path) -> bool {
    fs::read_to_string(rc)
        .map(|text| text.contains(HOOK_BEGIN) && text.contains(HOOK_END))
        .unwrap_or(false)
}

/// Adds or refreshes the hook block in `rc`. Returns whether the file changed.
pub fn ensure_shell_hook(rc: &Path, exe: &Path) -> Result<bool> {
    let existing = match fs::read_to_string(rc) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", rc.display()));
        }
    };
    let block = format!(
        "{HOOK_BEGIN}\neval \"$({} shell-init)\"\n{HOOK_END}\n",
        shell_escape_single(&exe.display().to_string())
    );

    let updated = match (existing.find(HOOK_BEGIN), existing.find(HOOK_END)) {
        (Some(start), Some(end)) if end > start => {
            let mut end = end + HOOK_END.len();
            if existing[end..].starts_with('\n') {
                end += 1;
            }
            format!("{}{}{}", &existing[..start], block, &existing[end..])
        }
        (Some(_), _) | (None, Some(_)) => {
            bail!("{} has an unbalanced agent-persist hook block", rc.display())
        }
        (None, None) => {
            let separator = if existing.is_empty() || existing.ends_with('\n') {
                ""
            } else {
                "\n"
            };
            format!("{existing}{separator}{block}")
        }
    };

    if updated == existing {
        return Ok(false);
    }
    fs::write(rc, updated).with_context(|| format!("failed to write {}", rc.display()))?;
    Ok(true)
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub layout: LayoutReport,
    pub tools: Vec<(String, ToolOutcome)>,
    pub hook_updated: bool,
    pub warnings: Vec<String>,
}

/// Full provisioning pass. Every failure is downgraded to a warning.
pub fn run(
    paths: &Paths,
    tools: &[ToolInstall],
    exe: &Path,
    timeout: Duration,
    skip_binaries: bool,
) -> InstallReport {
    let mut report = InstallReport {
        layout: apply(&plan(&desired_layout(paths))),
        ..InstallReport::default()
    };
    report.warnings.extend(report.layout.failures.iter().cloned());

    if !skip_binaries {
        for tool in tools {
            let outcome = ensure_tool(tool, paths, timeout);
            match &outcome {
                ToolOutcome::Failed(reason) => report
                    .warnings
                    .push(format!("{} install failed: {reason}", tool.command)),
                ToolOutcome::TimedOut => report.warnings.push(format!(
                    "{} install abandoned after {}s",
                    tool.command,
                    timeout.as_secs()
                )),
                ToolOutcome::AlreadyPresent | ToolOutcome::Installed => {}
            }
            report.tools.push((tool.command.clone(), outcome));
        }
    }

    match ensure_shell_hook(&paths.shell_rc(), exe) {
        Ok(changed) => report.hook_updated = changed,
        Err(err) => report.warnings.push(format!("{err:#}")),
    }
    report
}
