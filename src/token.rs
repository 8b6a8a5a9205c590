use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{OAuthSettings, Paths, RuntimeSettings};
use crate::credentials::{AuthKind, CredentialLoad, CredentialStore};
use crate::lock;
use crate::util::{human_duration, now_millis};

const MILLIS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    NoCredentialFile,
    EmptyFile,
    /// Present but could not be read (permissions, not a regular file).
    Unreadable,
    Malformed,
    /// Permanent API key; nothing to refresh.
    ApiKey,
    NoExpiryField,
    Expired,
    ValidWithHours(i64),
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCredentialFile => write!(f, "no credential file"),
            Self::EmptyFile => write!(f, "credential file is empty"),
            Self::Unreadable => write!(f, "credential file could not be read"),
            Self::Malformed => write!(f, "credential file is not valid JSON"),
            Self::ApiKey => write!(f, "API key (no expiry)"),
            Self::NoExpiryField => write!(f, "no OAuth expiry recorded"),
            Self::Expired => write!(f, "OAuth token expired"),
            Self::ValidWithHours(hours) => write!(f, "OAuth token valid for {hours}h"),
        }
    }
}

/// Tokens returned by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no credential file at {0}")]
    NoCredentialFile(PathBuf),
    #[error("credential file is empty or not valid JSON")]
    Unreadable,
    #[error("credential file has no OAuth refresh token")]
    NoRefreshToken,
    #[error("token endpoint unreachable: {0}")]
    Transport(String),
    #[error("token endpoint rejected the refresh (HTTP {status}): {error}")]
    Rejected { status: u16, error: String },
    #[error("token endpoint returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("another refresh holds the credential lock")]
    LockTimeout,
    #[error("failed to update credential file (restored from backup): {0}")]
    Write(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RefreshError {
    /// Whether the only way forward is an interactive login.
    pub fn needs_login(&self) -> bool {
        matches!(
            self,
            Self::NoCredentialFile(_)
                | Self::Unreadable
                | Self::NoRefreshToken
                | Self::Rejected { .. }
                | Self::InvalidResponse(_)
        )
    }
}

/// Exchanges a refresh token for new tokens. One call, no retries.
pub trait TokenEndpoint {
    fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError>;
}

pub struct HttpTokenEndpoint {
    url: String,
    client_id: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

impl HttpTokenEndpoint {
    pub fn new(settings: &OAuthSettings, timeout: Duration) -> Self {
        Self {
            url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            timeout,
        }
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        let body = serde_json::to_string(&TokenRequest {
            grant_type: "refresh_token",
            refresh_token,
            client_id: &self.client_id,
        })
        .map_err(anyhow::Error::from)?;
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let response = agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body);

        match response {
            Ok(response) => {
                let body = response
                    .into_string()
                    .map_err(|err| RefreshError::Transport(err.to_string()))?;
                parse_token_response(&body)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(RefreshError::Rejected {
                    status,
                    error: describe_error_body(&body),
                })
            }
            Err(err) => Err(RefreshError::Transport(err.to_string())),
        }
    }
}

fn parse_token_response(body: &str) -> Result<TokenGrant, RefreshError> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|err| RefreshError::InvalidResponse(err.to_string()))?;
    let access_token = parsed
        .access_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| RefreshError::InvalidResponse(describe_error_body(body)))?;
    let expires_in = parsed
        .expires_in
        .filter(|secs| *secs > 0)
        .ok_or_else(|| RefreshError::InvalidResponse("missing expires_in".to_string()))?;
    Ok(TokenGrant {
        access_token,
        refresh_token: parsed.refresh_token.filter(|token| !token.trim().is_empty()),
        expires_in,
    })
}

fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(TokenErrorResponse {
            error: Some(error),
            error_description,
        }) => match error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        },
        _ => "missing access_token".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoRefreshOutcome {
    NotNeeded(TokenStatus),
    /// Another process refreshed while this one waited for the lock.
    RefreshedElsewhere(TokenStatus),
    Refreshed { expires_at: i64 },
}

pub struct TokenRefresher<E> {
    store: CredentialStore,
    backup_path: PathBuf,
    lock_path: PathBuf,
    threshold: Duration,
    lock_wait: Duration,
    endpoint: E,
}

impl TokenRefresher<HttpTokenEndpoint> {
    pub fn from_settings(paths: &Paths, oauth: &OAuthSettings, runtime: &RuntimeSettings) -> Self {
        Self::new(
            paths,
            runtime,
            HttpTokenEndpoint::new(oauth, runtime.http_timeout),
        )
    }
}

impl<E: TokenEndpoint> TokenRefresher<E> {
    pub fn new(paths: &Paths, runtime: &RuntimeSettings, endpoint: E) -> Self {
        Self {
            store: CredentialStore::new(paths.credentials.clone()),
            backup_path: paths.credentials_backup(),
            lock_path: paths.credentials_lock(),
            threshold: runtime.refresh_threshold,
            lock_wait: runtime.lock_wait,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn status(&self) -> TokenStatus {
        self.status_at(now_millis())
    }

    pub fn status_at(&self, now_ms: i64) -> TokenStatus {
        let loaded = match self.store.load() {
            Ok(loaded) => loaded,
            Err(err) => {
                debug!(error = %err, path = %self.store.path().display(), "credential file unreadable");
                return TokenStatus::Unreadable;
            }
        };
        let credentials = match loaded {
            CredentialLoad::Missing => return TokenStatus::NoCredentialFile,
            CredentialLoad::Empty => return TokenStatus::EmptyFile,
            CredentialLoad::Malformed(_) => return TokenStatus::Malformed,
            CredentialLoad::Loaded(credentials) => credentials,
        };
        match credentials.auth_kind() {
            AuthKind::ApiKey => return TokenStatus::ApiKey,
            AuthKind::OAuth | AuthKind::Unconfigured => {}
        }
        match credentials.expires_at() {
            None => TokenStatus::NoExpiryField,
            Some(expires_at) if expires_at <= now_ms => TokenStatus::Expired,
            Some(expires_at) => TokenStatus::ValidWithHours((expires_at - now_ms) / MILLIS_PER_HOUR),
        }
    }

    /// Remaining validity as text, for status displays.
    pub fn remaining_text(&self, now_ms: i64) -> Option<String> {
        let CredentialLoad::Loaded(credentials) = self.store.load().ok()? else {
            return None;
        };
        let remaining = credentials.expires_at()? - now_ms;
        (remaining > 0).then(|| human_duration(Duration::from_millis(remaining as u64)))
    }

    /// One unconditional refresh attempt, serialized against other terminals.
    pub fn refresh(&self) -> Result<i64, RefreshError> {
        let _guard = lock::acquire_with_timeout(&self.lock_path, self.lock_wait)?
            .ok_or(RefreshError::LockTimeout)?;
        self.refresh_locked(now_millis())
    }

    /// Refreshes only when the token is expired or inside the threshold
    /// window. Produces no side effects otherwise.
    pub fn auto_refresh_if_needed(&self) -> Result<AutoRefreshOutcome, RefreshError> {
        let now = now_millis();
        let status = self.status_at(now);
        if !self.needs_refresh(now) {
            return Ok(AutoRefreshOutcome::NotNeeded(status));
        }

        let _guard = lock::acquire_with_timeout(&self.lock_path, self.lock_wait)?
            .ok_or(RefreshError::LockTimeout)?;
        let now = now_millis();
        if !self.needs_refresh(now) {
            return Ok(AutoRefreshOutcome::RefreshedElsewhere(self.status_at(now)));
        }
        info!(%status, "refreshing OAuth token");
        let expires_at = self.refresh_locked(now)?;
        Ok(AutoRefreshOutcome::Refreshed { expires_at })
    }

    fn needs_refresh(&self, now_ms: i64) -> bool {
        let threshold_ms = i64::try_from(self.threshold.as_millis()).unwrap_or(i64::MAX);
        match self.status_at(now_ms) {
            TokenStatus::Expired => true,
            TokenStatus::ValidWithHours(_) => self
                .current_expiry()
                .is_some_and(|expires_at| expires_at - now_ms < threshold_ms),
            _ => false,
        }
    }

    fn current_expiry(&self) -> Option<i64> {
        match self.store.load().ok()? {
            CredentialLoad::Loaded(credentials) => credentials.expires_at(),
            _ => None,
        }
    }

    fn refresh_locked(&self, now_ms: i64) -> Result<i64, RefreshError> {
        let mut credentials = match self.store.load()? {
            CredentialLoad::Missing => {
                return Err(RefreshError::NoCredentialFile(self.store.path().to_path_buf()));
            }
            CredentialLoad::Empty | CredentialLoad::Malformed(_) => {
                return Err(RefreshError::Unreadable);
            }
            CredentialLoad::Loaded(credentials) => credentials,
        };
        let refresh_token = credentials
            .refresh_token()
            .ok_or(RefreshError::NoRefreshToken)?
            .to_string();

        let grant = self.endpoint.exchange(&refresh_token)?;
        let expires_at = now_ms.saturating_add(grant.expires_in.saturating_mul(1000));

        let oauth = credentials.claude_ai_oauth.get_or_insert_with(Default::default);
        oauth.access_token = Some(grant.access_token);
        oauth.refresh_token = Some(grant.refresh_token.unwrap_or(refresh_token));
        oauth.expires_at = Some(expires_at);

        self.store.backup_to(&self.backup_path)?;
        if let Err(err) = self.store.write(&credentials) {
            warn!(error = %err, "credential write failed; restoring backup");
            if let Err(restore_err) = self.store.restore_from(&self.backup_path) {
                warn!(
                    error = %restore_err,
                    backup = %self.backup_path.display(),
                    "credential restore failed; backup left in place"
                );
                return Err(RefreshError::Write(err));
            }
            let _ = std::fs::remove_file(&self.backup_path);
            return Err(RefreshError::Write(err));
        }
        let _ = std::fs::remove_file(&self.backup_path);
        Ok(expires_at)
    }
}
