use std::io::{self, BufRead, Write};
use std::process::{Command, Stdio};
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal;
use tracing::{debug, warn};

use crate::session::{SessionRegistry, SessionRow, latest_session_id};
use crate::terminal::TerminalRegistry;
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    Char(char),
    Enter,
    Timeout,
    Interrupt,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Choice {
    ContinueLast,
    ResumeList,
    NewSession,
    Skip,
    Unknown(String),
}

impl Choice {
    pub fn from_key(key: KeyPress) -> Self {
        match key {
            KeyPress::Timeout | KeyPress::Enter => Self::ContinueLast,
            KeyPress::Interrupt => Self::Skip,
            KeyPress::Char(ch) => match ch.to_ascii_lowercase() {
                'c' => Self::ContinueLast,
                'r' => Self::ResumeList,
                'n' => Self::NewSession,
                's' => Self::Skip,
                other => Self::Unknown(other.to_string()),
            },
            KeyPress::Other => Self::Unknown(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSelection {
    Index(usize),
    Cancel,
    Invalid(String),
}

/// Parses a 1-based index into a list of `count` entries.
pub fn parse_resume_selection(input: &str, count: usize) -> ResumeSelection {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("q") || trimmed.eq_ignore_ascii_case("c")
    {
        return ResumeSelection::Cancel;
    }
    match trimmed.parse::<usize>() {
        Ok(index) if (1..=count).contains(&index) => ResumeSelection::Index(index - 1),
        _ => ResumeSelection::Invalid(trimmed.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickerOutcome {
    Launched { session_id: Option<String> },
    Cancelled,
    Skipped,
    Unknown,
}

pub trait MenuInput {
    fn read_key(&mut self, timeout: Duration) -> Result<KeyPress>;
    /// `None` on end of input.
    fn read_line(&mut self) -> Result<Option<String>>;
}

pub trait Launcher {
    fn launch(&mut self, resume: Option<&str>, flags: &[String]) -> Result<()>;
}

/// Reads from the attached terminal via crossterm raw mode.
pub struct TerminalInput;

impl MenuInput for TerminalInput {
    fn read_key(&mut self, timeout: Duration) -> Result<KeyPress> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        let result = read_key_raw(timeout);
        let _ = terminal::disable_raw_mode();
        result
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes = io::stdin().lock().read_line(&mut line)?;
        Ok((bytes > 0).then_some(line))
    }
}

fn read_key_raw(timeout: Duration) -> Result<KeyPress> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || !event::poll(remaining)? {
            return Ok(KeyPress::Timeout);
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        return Ok(match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                KeyPress::Interrupt
            }
            KeyCode::Char(ch) => KeyPress::Char(ch),
            KeyCode::Enter => KeyPress::Enter,
            KeyCode::Esc => KeyPress::Interrupt,
            _ => KeyPress::Other,
        });
    }
}

/// Runs the external CLI in the foreground and waits for it.
pub struct CliLauncher {
    command: String,
    resume_flag: String,
}

impl CliLauncher {
    pub fn new(command: impl Into<String>, resume_flag: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            resume_flag: resume_flag.into(),
        }
    }
}

impl Launcher for CliLauncher {
    fn launch(&mut self, resume: Option<&str>, flags: &[String]) -> Result<()> {
        ignore_interrupts_while_child_runs();
        let mut command = Command::new(&self.command);
        if let Some(session_id) = resume {
            command.arg(&self.resume_flag).arg(session_id);
        }
        command
            .args(flags)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let status = command
            .status()
            .with_context(|| format!("failed to run `{}`", self.command))?;
        debug!(%status, command = %self.command, "cli exited");
        Ok(())
    }
}

/// Ctrl-C reaches the whole foreground process group; the child handles it and
/// this process must survive to record the session.
fn ignore_interrupts_while_child_runs() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| {}) {
            debug!(error = %err, "could not install interrupt handler");
        }
    });
}

pub struct Picker<'a> {
    pub registry: &'a SessionRegistry,
    pub terminals: &'a TerminalRegistry,
    pub recent_limit: usize,
    pub timeout: Duration,
    /// Extra CLI flags given on the command line.
    pub flags: Vec<String>,
    pub other_instances: usize,
}

impl Picker<'_> {
    pub fn run(
        &self,
        input: &mut dyn MenuInput,
        launcher: &mut dyn Launcher,
        out: &mut dyn Write,
    ) -> Result<PickerOutcome> {
        let last = self.terminals.load();
        self.render_prompt(out, last.as_ref().map(|state| state.session_id.as_str()))?;

        let key = input.read_key(self.timeout)?;
        writeln!(out)?;
        let choice = Choice::from_key(key);
        debug!(?key, ?choice, terminal = self.terminals.terminal_id(), "menu choice");

        match choice {
            Choice::ContinueLast => match last {
                Some(state) => {
                    let flags = if self.flags.is_empty() {
                        saved_flags(&state.flags)
                    } else {
                        self.flags.clone()
                    };
                    writeln!(out, "Continuing {}", state.session_id.as_str().bold())?;
                    self.launch(launcher, Some(&state.session_id), flags)
                }
                None => {
                    writeln!(out, "No previous session on this terminal; starting a new one.")?;
                    self.launch(launcher, None, self.flags.clone())
                }
            },
            Choice::ResumeList => self.resume_from_list(input, launcher, out),
            Choice::NewSession => self.launch(launcher, None, self.flags.clone()),
            Choice::Skip => Ok(PickerOutcome::Skipped),
            Choice::Unknown(key) => {
                writeln!(
                    out,
                    "Unknown option '{key}'. Use c, r, n or s (run `agent-persist menu` to reopen)."
                )?;
                Ok(PickerOutcome::Unknown)
            }
        }
    }

    fn render_prompt(&self, out: &mut dyn Write, last: Option<&str>) -> io::Result<()> {
        writeln!(out, "{}", "Claude session menu".bold())?;
        if self.other_instances > 0 {
            writeln!(
                out,
                "  {} other claude instance(s) running",
                self.other_instances
            )?;
        }
        match last {
            Some(session_id) => writeln!(out, "  Last session here: {}", session_id.cyan())?,
            None => writeln!(out, "  {}", "No session recorded for this terminal".dark_grey())?,
        }
        writeln!(
            out,
            "  [c] continue last  [r] resume from list  [n] new session  [s] skip"
        )?;
        write!(
            out,
            "Choice (continues in {}s): ",
            self.timeout.as_secs()
        )?;
        out.flush()
    }

    fn resume_from_list(
        &self,
        input: &mut dyn MenuInput,
        launcher: &mut dyn Launcher,
        out: &mut dyn Write,
    ) -> Result<PickerOutcome> {
        let rows = match self.registry.recent_rows(self.recent_limit, now_millis()) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "failed to read prompt log");
                Vec::new()
            }
        };
        if rows.is_empty() {
            writeln!(out, "No sessions recorded yet.")?;
            return Ok(PickerOutcome::Cancelled);
        }

        write_rows(out, &rows)?;
        write!(out, "Select session [1-{}] (q to cancel): ", rows.len())?;
        out.flush()?;

        let line = input.read_line()?.unwrap_or_default();
        match parse_resume_selection(&line, rows.len()) {
            ResumeSelection::Index(index) => {
                let session_id = rows[index].session_id.clone();
                self.launch(launcher, Some(&session_id), self.flags.clone())
            }
            ResumeSelection::Cancel => Ok(PickerOutcome::Cancelled),
            ResumeSelection::Invalid(text) => {
                writeln!(out, "'{text}' is not a listed session.")?;
                Ok(PickerOutcome::Cancelled)
            }
        }
    }

    fn launch(
        &self,
        launcher: &mut dyn Launcher,
        resume: Option<&str>,
        flags: Vec<String>,
    ) -> Result<PickerOutcome> {
        let started = now_millis();
        launcher.launch(resume, &flags)?;

        let session_id = latest_session_id(self.registry.prompt_log(), Some(started))
            .or_else(|| resume.map(str::to_string));
        if let Some(session_id) = session_id.as_deref()
            && let Err(err) = self.terminals.save(session_id, &shell_words::join(&flags))
        {
            warn!(error = %err, "failed to record terminal session");
        }
        Ok(PickerOutcome::Launched { session_id })
    }
}

/// Flags are stored shell-quoted so arguments containing spaces survive.
fn saved_flags(raw: &str) -> Vec<String> {
    match shell_words::split(raw) {
        Ok(flags) => flags,
        Err(err) => {
            warn!(error = %err, flags = raw, "ignoring unparseable saved flags");
            Vec::new()
        }
    }
}

pub fn write_rows(out: &mut dyn Write, rows: &[SessionRow]) -> io::Result<()> {
    for row in rows {
        writeln!(
            out,
            "{:>2}. {}  {} msgs  {}  {}  started {}",
            row.rank,
            row.session_id.as_str().bold(),
            row.messages,
            row.size,
            row.recency,
            row.started
        )?;
        if let Some(project) = &row.project {
            writeln!(out, "    project: {}", project.as_str().dark_grey())?;
        }
        writeln!(out, "    first: {}", row.first_prompt)?;
        if row.last_prompt != row.first_prompt {
            writeln!(out, "    last:  {}", row.last_prompt)?;
        }
    }
    Ok(())
}

/// Other running processes whose command name is `program`.
pub fn count_running_instances(program: &str) -> usize {
    let output = Command::new("ps")
        .args(["-eo", "pid=,comm="])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    let Ok(output) = output else {
        return 0;
    };
    if !output.status.success() {
        return 0;
    }
    count_instances(
        &String::from_utf8_lossy(&output.stdout),
        program,
        std::process::id(),
    )
}

fn count_instances(ps_output: &str, program: &str, own_pid: u32) -> usize {
    ps_output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse::<u32>().ok()?;
            let comm = parts.next()?;
            Some((pid, comm))
        })
        .filter(|(pid, comm)| *pid != own_pid && *comm == program)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs::{self, OpenOptions};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct ScriptedInput {
        key: KeyPress,
        lines: VecDeque<String>,
    }

    impl ScriptedInput {
        fn key(key: KeyPress) -> Self {
            Self {
                key,
                lines: VecDeque::new(),
            }
        }

        fn with_line(mut self, line: &str) -> Self {
            self.lines.push_back(line.to_string());
            self
        }
    }

    impl MenuInput for ScriptedInput {
        fn read_key(&mut self, _timeout: Duration) -> Result<KeyPress> {
            Ok(self.key)
        }

        fn read_line(&mut self) -> Result<Option<String>> {
            Ok(self.lines.pop_front())
        }
    }

    /// Records launches and appends a prompt-log line the way the CLI would.
    struct RecordingLauncher {
        log: PathBuf,
        writes_session: Option<String>,
        calls: Vec<(Option<String>, Vec<String>)>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&mut self, resume: Option<&str>, flags: &[String]) -> Result<()> {
            self.calls.push((resume.map(str::to_string), flags.to_vec()));
            if let Some(session) = &self.writes_session {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log)
                    .expect("open log");
                writeln!(
                    file,
                    r#"{{"display":"hi","timestamp":{},"sessionId":"{session}"}}"#,
                    now_millis()
                )
                .expect("append");
            }
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        registry: SessionRegistry,
        terminals: TerminalRegistry,
        log: PathBuf,
    }

    fn fixture(log_lines: &[&str]) -> Fixture {
        let tmp = TempDir::new().expect("temp dir");
        let log = tmp.path().join("history.jsonl");
        fs::write(&log, log_lines.join("\n")).expect("write log");
        let registry = SessionRegistry::new(&log, tmp.path().join("projects"));
        let terminals = TerminalRegistry::with_terminal_id(tmp.path().join("terminals"), "pts-1");
        Fixture {
            _tmp: tmp,
            registry,
            terminals,
            log,
        }
    }

    fn picker<'a>(fx: &'a Fixture, flags: &[&str]) -> Picker<'a> {
        Picker {
            registry: &fx.registry,
            terminals: &fx.terminals,
            recent_limit: 10,
            timeout: Duration::from_secs(30),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            other_instances: 2,
        }
    }

    fn launcher(fx: &Fixture, writes_session: Option<&str>) -> RecordingLauncher {
        RecordingLauncher {
            log: fx.log.clone(),
            writes_session: writes_session.map(str::to_string),
            calls: Vec::new(),
        }
    }

    #[test]
    fn key_mapping_follows_menu_letters() {
        assert_eq!(Choice::from_key(KeyPress::Char('C')), Choice::ContinueLast);
        assert_eq!(Choice::from_key(KeyPress::Timeout), Choice::ContinueLast);
        assert_eq!(Choice::from_key(KeyPress::Enter), Choice::ContinueLast);
        assert_eq!(Choice::from_key(KeyPress::Char('R')), Choice::ResumeList);
        assert_eq!(Choice::from_key(KeyPress::Char('n')), Choice::NewSession);
        assert_eq!(Choice::from_key(KeyPress::Char('S')), Choice::Skip);
        assert_eq!(Choice::from_key(KeyPress::Interrupt), Choice::Skip);
        assert_eq!(
            Choice::from_key(KeyPress::Char('x')),
            Choice::Unknown("x".to_string())
        );
    }

    #[test]
    fn resume_selection_parsing() {
        assert_eq!(parse_resume_selection(" 2\n", 3), ResumeSelection::Index(1));
        assert_eq!(parse_resume_selection("q", 3), ResumeSelection::Cancel);
        assert_eq!(parse_resume_selection("", 3), ResumeSelection::Cancel);
        assert_eq!(
            parse_resume_selection("0", 3),
            ResumeSelection::Invalid("0".to_string())
        );
        assert_eq!(
            parse_resume_selection("4", 3),
            ResumeSelection::Invalid("4".to_string())
        );
    }

    #[test]
    fn timeout_continues_last_session_with_saved_flags() {
        let fx = fixture(&[]);
        fx.terminals.save("prev", "--model opus").expect("save");
        let mut launcher = launcher(&fx, Some("prev-continued"));
        let mut out = Vec::new();

        let outcome = picker(&fx, &[])
            .run(&mut ScriptedInput::key(KeyPress::Timeout), &mut launcher, &mut out)
            .expect("run");

        assert_eq!(
            launcher.calls,
            vec![(
                Some("prev".to_string()),
                vec!["--model".to_string(), "opus".to_string()]
            )]
        );
        assert_eq!(
            outcome,
            PickerOutcome::Launched {
                session_id: Some("prev-continued".to_string())
            }
        );
        let saved = fx.terminals.load().expect("state");
        assert_eq!(saved.session_id, "prev-continued");
        assert_eq!(saved.flags, "--model opus");

        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("2 other claude instance(s) running"));
        assert!(text.contains("prev"));
    }

    #[test]
    fn continue_replays_saved_flags_containing_spaces() {
        let fx = fixture(&[]);
        let mut first = launcher(&fx, Some("quoted"));
        picker(&fx, &["--append-system-prompt", "be terse", "--model", "it's"])
            .run(&mut ScriptedInput::key(KeyPress::Char('n')), &mut first, &mut Vec::<u8>::new())
            .expect("first run");

        let mut second = launcher(&fx, None);
        picker(&fx, &[])
            .run(&mut ScriptedInput::key(KeyPress::Char('c')), &mut second, &mut Vec::<u8>::new())
            .expect("second run");

        let expected: Vec<String> = ["--append-system-prompt", "be terse", "--model", "it's"]
            .iter()
            .map(|flag| flag.to_string())
            .collect();
        assert_eq!(second.calls, vec![(Some("quoted".to_string()), expected)]);
    }

    #[test]
    fn unparseable_saved_flags_are_dropped() {
        assert_eq!(saved_flags("--model 'opus"), Vec::<String>::new());
        assert_eq!(saved_flags(""), Vec::<String>::new());
    }

    #[test]
    fn continue_without_history_starts_new_session() {
        let fx = fixture(&[]);
        let mut launcher = launcher(&fx, Some("fresh"));
        let mut out = Vec::new();

        picker(&fx, &["--verbose"])
            .run(&mut ScriptedInput::key(KeyPress::Char('c')), &mut launcher, &mut out)
            .expect("run");

        assert_eq!(launcher.calls, vec![(None, vec!["--verbose".to_string()])]);
        assert_eq!(fx.terminals.last_session().as_deref(), Some("fresh"));
    }

    #[test]
    fn resume_list_launches_selected_session() {
        let fx = fixture(&[
            r#"{"display":"old","timestamp":100,"sessionId":"older"}"#,
            r#"{"display":"new","timestamp":200,"sessionId":"newer"}"#,
        ]);
        let mut launcher = launcher(&fx, None);
        let mut out = Vec::new();

        let outcome = picker(&fx, &[])
            .run(
                &mut ScriptedInput::key(KeyPress::Char('r')).with_line("2\n"),
                &mut launcher,
                &mut out,
            )
            .expect("run");

        assert_eq!(launcher.calls, vec![(Some("older".to_string()), Vec::new())]);
        assert_eq!(
            outcome,
            PickerOutcome::Launched {
                session_id: Some("older".to_string())
            }
        );
        assert_eq!(fx.terminals.last_session().as_deref(), Some("older"));
    }

    #[test]
    fn resume_list_cancel_and_invalid_do_not_launch() {
        let fx = fixture(&[r#"{"display":"x","timestamp":100,"sessionId":"only"}"#]);
        for line in ["q\n", "7\n", "abc\n"] {
            let mut launcher = launcher(&fx, None);
            let mut out = Vec::new();
            let outcome = picker(&fx, &[])
                .run(
                    &mut ScriptedInput::key(KeyPress::Char('r')).with_line(line),
                    &mut launcher,
                    &mut out,
                )
                .expect("run");
            assert_eq!(outcome, PickerOutcome::Cancelled);
            assert!(launcher.calls.is_empty());
        }
        assert_eq!(fx.terminals.last_session(), None);
    }

    #[test]
    fn new_session_without_log_entry_leaves_state_unchanged() {
        let fx = fixture(&[]);
        fx.terminals.save("kept", "").expect("save");
        let mut launcher = launcher(&fx, None);
        let mut out = Vec::new();

        let outcome = picker(&fx, &[])
            .run(&mut ScriptedInput::key(KeyPress::Char('N')), &mut launcher, &mut out)
            .expect("run");

        assert_eq!(outcome, PickerOutcome::Launched { session_id: None });
        assert_eq!(launcher.calls, vec![(None, Vec::new())]);
        assert_eq!(fx.terminals.last_session().as_deref(), Some("kept"));
    }

    #[test]
    fn skip_and_unknown_do_not_launch() {
        let fx = fixture(&[]);
        for (key, expected) in [
            (KeyPress::Char('s'), PickerOutcome::Skipped),
            (KeyPress::Char('z'), PickerOutcome::Unknown),
        ] {
            let mut launcher = launcher(&fx, Some("never"));
            let mut out = Vec::new();
            let outcome = picker(&fx, &[])
                .run(&mut ScriptedInput::key(key), &mut launcher, &mut out)
                .expect("run");
            assert_eq!(outcome, expected);
            assert!(launcher.calls.is_empty());
        }
    }

    #[test]
    fn instance_counting_excludes_own_pid_and_other_programs() {
        let ps = "  10 bash\n  11 claude\n  12 claude\n  13 node\n garbage\n  14 claude\n";
        assert_eq!(count_instances(ps, "claude", 12), 2);
        assert_eq!(count_instances("", "claude", 1), 0);
    }
}
