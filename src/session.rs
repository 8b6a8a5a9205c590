use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use walkdir::WalkDir;

use crate::util::{format_local_millis, format_size, prompt_preview, relative_time};

const PROMPT_PREVIEW_CHARS: usize = 80;
const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// One line of the prompt log (`history.jsonl`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptEvent {
    session_id: Option<String>,
    timestamp: i64,
    #[serde(default)]
    display: String,
    #[serde(default)]
    project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub first_prompt: String,
    pub last_prompt: String,
    pub project: Option<String>,
    pub transcript: Option<TranscriptStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptStats {
    pub message_count: usize,
    pub bytes: u64,
}

impl SessionSummary {
    fn from_event(session_id: String, event: PromptEvent) -> Self {
        Self {
            session_id,
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            first_prompt: event.display.clone(),
            last_prompt: event.display,
            project: event.project,
            transcript: None,
        }
    }

    fn absorb(&mut self, event: PromptEvent) {
        if event.timestamp > self.last_seen {
            self.last_seen = event.timestamp;
            self.last_prompt = event.display.clone();
            if event.project.is_some() {
                self.project = event.project.clone();
            }
        }
        if event.timestamp < self.first_seen {
            self.first_seen = event.timestamp;
            self.first_prompt = event.display;
        }
    }
}

/// Display-ready form of a [`SessionSummary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub rank: usize,
    pub session_id: String,
    pub messages: String,
    pub size: String,
    pub recency: String,
    pub started: String,
    pub project: Option<String>,
    pub first_prompt: String,
    pub last_prompt: String,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    prompt_log: PathBuf,
    transcripts_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(prompt_log: impl Into<PathBuf>, transcripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt_log: prompt_log.into(),
            transcripts_dir: transcripts_dir.into(),
        }
    }

    pub fn prompt_log(&self) -> &Path {
        &self.prompt_log
    }

    /// Most recent sessions first, at most `limit` of them.
    pub fn recent_sessions(&self, limit: usize) -> io::Result<Vec<SessionSummary>> {
        let mut sessions = self.scan_prompt_log()?;
        sessions.sort_by_key(|session| Reverse(session.last_seen));
        sessions.truncate(limit);

        if !sessions.is_empty() {
            let transcripts = index_transcripts(&self.transcripts_dir);
            for session in &mut sessions {
                session.transcript = transcripts
                    .get(&session.session_id)
                    .and_then(|path| transcript_stats(path).ok());
            }
        }
        Ok(sessions)
    }

    pub fn recent_rows(&self, limit: usize, now_ms: i64) -> io::Result<Vec<SessionRow>> {
        Ok(self
            .recent_sessions(limit)?
            .iter()
            .enumerate()
            .map(|(index, session)| session_row(index + 1, session, now_ms))
            .collect())
    }

    /// Sessions in first-appearance order. A missing log yields no sessions.
    fn scan_prompt_log(&self) -> io::Result<Vec<SessionSummary>> {
        let file = match File::open(&self.prompt_log) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut order: Vec<SessionSummary> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for_each_event(BufReader::new(file), |session_id, event| {
            match index.get(&session_id) {
                Some(&slot) => order[slot].absorb(event),
                None => {
                    index.insert(session_id.clone(), order.len());
                    order.push(SessionSummary::from_event(session_id, event));
                }
            }
        })?;
        Ok(order)
    }
}

/// Session id on the newest well-formed line of the prompt log. With `since`,
/// the line must be stamped at or after it.
pub fn latest_session_id(prompt_log: &Path, since: Option<i64>) -> Option<String> {
    let file = File::open(prompt_log).ok()?;
    let mut latest: Option<String> = None;
    for_each_event(BufReader::new(file), |session_id, event| {
        if since.is_none_or(|cutoff| event.timestamp >= cutoff) {
            latest = Some(session_id);
        }
    })
    .ok()?;
    latest
}

fn for_each_event<R, F>(mut reader: R, mut apply: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(String, PromptEvent),
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = match reader.read_line(&mut line) {
            Ok(bytes) => bytes,
            // A line with invalid UTF-8 is as malformed as broken JSON.
            Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
            Err(err) => return Err(err),
        };
        if bytes == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut event = match serde_json::from_str::<PromptEvent>(trimmed) {
            Ok(event) => event,
            Err(_) => continue,
        };
        let Some(session_id) = event
            .session_id
            .take()
            .filter(|id| !id.trim().is_empty())
        else {
            continue;
        };
        apply(session_id, event);
    }
    Ok(())
}

fn index_transcripts(root: &Path) -> HashMap<String, PathBuf> {
    let mut found = HashMap::new();
    if !root.exists() {
        return found;
    }
    for entry in WalkDir::new(root)
        .max_depth(2)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        found
            .entry(stem.to_string())
            .or_insert_with(|| path.to_path_buf());
    }
    found
}

fn transcript_stats(path: &Path) -> io::Result<TranscriptStats> {
    let bytes = path.metadata()?.len();
    let mut reader = BufReader::new(File::open(path)?);
    let mut message_count = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.iter().any(|byte| !byte.is_ascii_whitespace()) {
            message_count += 1;
        }
    }
    Ok(TranscriptStats {
        message_count,
        bytes,
    })
}

pub fn session_row(rank: usize, session: &SessionSummary, now_ms: i64) -> SessionRow {
    let (messages, size) = match session.transcript {
        Some(stats) => (stats.message_count.to_string(), format_size(stats.bytes)),
        None => ("?".to_string(), "-".to_string()),
    };
    SessionRow {
        rank,
        session_id: session.session_id.clone(),
        messages,
        size,
        recency: relative_time(session.last_seen, now_ms),
        started: format_local_millis(session.first_seen),
        project: session.project.clone(),
        first_prompt: prompt_preview(&session.first_prompt, PROMPT_PREVIEW_CHARS),
        last_prompt: prompt_preview(&session.last_prompt, PROMPT_PREVIEW_CHARS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn event(session: &str, timestamp: i64, display: &str) -> String {
        format!(
            r#"{{"display":"{display}","pastedContents":{{}},"timestamp":{timestamp},"project":"/workspace/app","sessionId":"{session}"}}"#
        )
    }

    fn registry_with_log(tmp: &TempDir, lines: &[String]) -> SessionRegistry {
        let log = tmp.path().join("history.jsonl");
        fs::write(&log, lines.join("\n")).expect("write log");
        SessionRegistry::new(log, tmp.path().join("projects"))
    }

    fn ids(sessions: &[SessionSummary]) -> Vec<&str> {
        sessions.iter().map(|s| s.session_id.as_str()).collect()
    }

    #[test]
    fn missing_or_empty_log_yields_no_sessions() {
        let tmp = TempDir::new().expect("temp dir");
        let registry = SessionRegistry::new(tmp.path().join("absent.jsonl"), tmp.path());
        assert!(registry.recent_sessions(10).expect("scan").is_empty());

        let registry = registry_with_log(&tmp, &[]);
        assert!(registry.recent_sessions(10).expect("scan").is_empty());
    }

    #[test]
    fn ranks_by_newest_activity() {
        let tmp = TempDir::new().expect("temp dir");
        let registry = registry_with_log(
            &tmp,
            &[event("A", 100, "a1"), event("B", 200, "b1"), event("A", 300, "a2")],
        );

        let sessions = registry.recent_sessions(10).expect("scan");
        assert_eq!(ids(&sessions), vec!["A", "B"]);
        assert_eq!(sessions[0].first_seen, 100);
        assert_eq!(sessions[0].last_seen, 300);
        assert_eq!(sessions[0].last_prompt, "a2");
    }

    #[test]
    fn out_of_order_events_update_first_seen() {
        let tmp = TempDir::new().expect("temp dir");
        let registry = registry_with_log(&tmp, &[event("S", 500, "late"), event("S", 100, "early")]);

        let sessions = registry.recent_sessions(10).expect("scan");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].first_seen, 100);
        assert_eq!(sessions[0].last_seen, 500);
        assert_eq!(sessions[0].first_prompt, "early");
        assert_eq!(sessions[0].last_prompt, "late");
    }

    #[test]
    fn malformed_lines_do_not_change_results() {
        let tmp = TempDir::new().expect("temp dir");
        let clean = vec![event("A", 100, "a"), event("B", 200, "b")];
        let expected = registry_with_log(&tmp, &clean).recent_sessions(10).expect("clean");

        let noisy = vec![
            r#"{"display":"trunc","timestamp":15"#.to_string(),
            event("A", 100, "a"),
            "not json at all".to_string(),
            String::new(),
            r#"{"display":"no session","timestamp":999}"#.to_string(),
            event("B", 200, "b"),
            r#"{"sessionId":"C","timestamp":"#.to_string(),
        ];
        let tmp2 = TempDir::new().expect("temp dir");
        let actual = registry_with_log(&tmp2, &noisy).recent_sessions(10).expect("noisy");

        assert_eq!(actual, expected);
    }

    #[test]
    fn keeps_ten_most_recent_and_breaks_ties_by_first_appearance() {
        let tmp = TempDir::new().expect("temp dir");
        let mut lines: Vec<String> = (0..12)
            .map(|i| event(&format!("s{i:02}"), 1_000 + i, "p"))
            .collect();
        lines.push(event("tie-a", 5_000, "p"));
        lines.push(event("tie-b", 5_000, "p"));
        let registry = registry_with_log(&tmp, &lines);

        let sessions = registry.recent_sessions(10).expect("scan");
        assert_eq!(sessions.len(), 10);
        assert_eq!(sessions[0].session_id, "tie-a");
        assert_eq!(sessions[1].session_id, "tie-b");
        assert_eq!(sessions[2].session_id, "s11");
        assert_eq!(sessions[9].session_id, "s04");
    }

    #[test]
    fn transcript_stats_are_attached_when_present() {
        let tmp = TempDir::new().expect("temp dir");
        let project_dir = tmp.path().join("projects").join("-workspace-app");
        fs::create_dir_all(&project_dir).expect("mkdir");
        let transcript = "{\"type\":\"user\"}\n\n{\"type\":\"assistant\"}\n   \n{\"type\":\"user\"}\n";
        fs::write(project_dir.join("A.jsonl"), transcript).expect("write transcript");
        let registry = registry_with_log(&tmp, &[event("A", 100, "a"), event("B", 200, "b")]);

        let sessions = registry.recent_sessions(10).expect("scan");
        let b = &sessions[0];
        let a = &sessions[1];
        assert_eq!(b.transcript, None);
        assert_eq!(
            a.transcript,
            Some(TranscriptStats {
                message_count: 3,
                bytes: transcript.len() as u64,
            })
        );
    }

    #[test]
    fn rows_format_unknown_counts_and_previews() {
        let session = SessionSummary {
            session_id: "abc".to_string(),
            first_seen: 0,
            last_seen: 3_600_000,
            first_prompt: "line one\nline two".to_string(),
            last_prompt: "y".repeat(120),
            project: None,
            transcript: None,
        };

        let row = session_row(1, &session, 3_600_000 + 5 * 60_000);
        assert_eq!(row.rank, 1);
        assert_eq!(row.messages, "?");
        assert_eq!(row.recency, "5m ago");
        assert_eq!(row.first_prompt, "line one line two");
        assert_eq!(row.last_prompt.chars().count(), 80);

        let with_stats = SessionSummary {
            transcript: Some(TranscriptStats {
                message_count: 12,
                bytes: 2048,
            }),
            ..session
        };
        let row = session_row(2, &with_stats, 3_600_000);
        assert_eq!(row.messages, "12");
        assert_eq!(row.size, "2.0 KB");
    }

    #[test]
    fn latest_session_id_reads_newest_line() {
        let tmp = TempDir::new().expect("temp dir");
        let log = tmp.path().join("history.jsonl");
        fs::write(
            &log,
            [event("old", 100, "x"), event("new", 200, "y"), "{broken".to_string()].join("\n"),
        )
        .expect("write");

        assert_eq!(latest_session_id(&log, None).as_deref(), Some("new"));
        assert_eq!(latest_session_id(&log, Some(150)).as_deref(), Some("new"));
        assert_eq!(latest_session_id(&log, Some(300)), None);
        assert_eq!(latest_session_id(&tmp.path().join("missing"), None), None);
    }
}
