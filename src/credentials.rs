use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

/// Unknown fields ride along in `extra` so a rewrite keeps them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_ai_oauth: Option<OAuthTokens>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    OAuth,
    ApiKey,
    Unconfigured,
}

impl CredentialFile {
    /// OAuth takes precedence when both forms are present.
    pub fn auth_kind(&self) -> AuthKind {
        if self.claude_ai_oauth.is_some() {
            AuthKind::OAuth
        } else if self
            .primary_api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
        {
            AuthKind::ApiKey
        } else {
            AuthKind::Unconfigured
        }
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.claude_ai_oauth.as_ref()?.expires_at
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.claude_ai_oauth
            .as_ref()?
            .refresh_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialLoad {
    Missing,
    Empty,
    Malformed(String),
    Loaded(CredentialFile),
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    staging_dir: Option<PathBuf>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staging_dir: None,
        }
    }

    /// Temp files for [`write`](Self::write) go here instead of next to the
    /// file. Must be on the same filesystem for the rename to succeed.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> io::Result<CredentialLoad> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(CredentialLoad::Missing);
            }
            Err(err) => return Err(err),
        };
        if raw.trim().is_empty() {
            return Ok(CredentialLoad::Empty);
        }
        Ok(match serde_json::from_str::<CredentialFile>(&raw) {
            Ok(parsed) => CredentialLoad::Loaded(parsed),
            Err(err) => CredentialLoad::Malformed(err.to_string()),
        })
    }

    /// Replaces the file through a sibling temp file and rename. The temp file
    /// is created `0600`, which the rename carries over.
    pub fn write(&self, credentials: &CredentialFile) -> io::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let payload = serde_json::to_vec_pretty(credentials).map_err(io::Error::other)?;
        let mut tmp = NamedTempFile::new_in(self.staging_dir.as_deref().unwrap_or(parent))?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    pub fn backup_to(&self, backup: &Path) -> io::Result<()> {
        fs::copy(&self.path, backup).map(|_| ())
    }

    pub fn restore_from(&self, backup: &Path) -> io::Result<()> {
        fs::copy(backup, &self.path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_oauth_record_and_preserves_unknown_fields() {
        let raw = r#"{
            "claudeAiOauth": {
                "accessToken": "sk-ant-oat01-a",
                "refreshToken": "sk-ant-ort01-r",
                "expiresAt": 1760000000000,
                "scopes": ["user:inference"],
                "subscriptionType": "max"
            },
            "mcpOAuth": {"server": "x"}
        }"#;
        let parsed: CredentialFile = serde_json::from_str(raw).expect("parse");

        assert_eq!(parsed.auth_kind(), AuthKind::OAuth);
        assert_eq!(parsed.expires_at(), Some(1_760_000_000_000));
        assert_eq!(parsed.refresh_token(), Some("sk-ant-ort01-r"));
        assert!(parsed.extra.contains_key("mcpOAuth"));

        let oauth = parsed.claude_ai_oauth.as_ref().expect("oauth");
        assert_eq!(oauth.extra.get("subscriptionType"), Some(&Value::from("max")));

        let rewritten = serde_json::to_value(&parsed).expect("serialize");
        assert_eq!(rewritten["claudeAiOauth"]["scopes"][0], "user:inference");
        assert_eq!(rewritten["mcpOAuth"]["server"], "x");
    }

    #[test]
    fn api_key_only_record() {
        let parsed: CredentialFile =
            serde_json::from_str(r#"{"primaryApiKey":"sk-ant-api03-x"}"#).expect("parse");
        assert_eq!(parsed.auth_kind(), AuthKind::ApiKey);
        assert_eq!(parsed.expires_at(), None);
        assert_eq!(parsed.refresh_token(), None);
    }

    #[test]
    fn load_distinguishes_missing_empty_and_malformed() {
        let tmp = TempDir::new().expect("temp dir");
        let store = CredentialStore::new(tmp.path().join(".credentials.json"));
        assert_eq!(store.load().expect("load"), CredentialLoad::Missing);

        fs::write(store.path(), "  \n").expect("write");
        assert_eq!(store.load().expect("load"), CredentialLoad::Empty);

        fs::write(store.path(), "{\"claudeAiOauth\":").expect("write");
        assert!(matches!(
            store.load().expect("load"),
            CredentialLoad::Malformed(_)
        ));
    }

    #[test]
    fn write_then_load_returns_same_record() {
        let tmp = TempDir::new().expect("temp dir");
        let store = CredentialStore::new(tmp.path().join("nested").join(".credentials.json"));
        let record = CredentialFile {
            claude_ai_oauth: Some(OAuthTokens {
                access_token: Some("a".to_string()),
                refresh_token: Some("r".to_string()),
                expires_at: Some(42),
                extra: Map::new(),
            }),
            ..CredentialFile::default()
        };

        store.write(&record).expect("write");
        assert_eq!(
            store.load().expect("load"),
            CredentialLoad::Loaded(record)
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.path()).expect("meta").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
